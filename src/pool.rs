// MIT License
//
// Copyright (c) 2019-2021 Tobias Pfeiffer
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in all
// copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
// SOFTWARE.

//! see https://github.com/mongodb/specifications/blob/master/source/connection-monitoring-and-pooling/connection-monitoring-and-pooling.rst

use {
	crate::{
		*,
		apm::{Event, EventHandler, ConnectionClosedReason, ConnectionCheckOutFailedReason},
		conn::{Connection, ConnectionEstablisher}
	},
	std::{
		collections::{HashSet, VecDeque},
		ops::{Deref, DerefMut},
		sync::{Arc, Condvar, Mutex, Weak},
		time::Instant
	},
	tracing::{debug, info}
};

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum PoolStatus {
	Ready,
	Paused,
	Closed
}

#[derive(Debug)]
struct PoolState {
	generation:         u64,
	status:             PoolStatus,
	/// Idle connections, least recently used at the front.
	available:          VecDeque<Connection>,
	checked_out:        HashSet<usize>,
	/// Connections being established.
	pending:            usize,
	/// Tickets of the waiting check outs; only the front one may take a connection.
	wait_queue:         VecDeque<u64>,
	next_ticket:        u64,
	next_connection_id: usize
}

impl PoolState {
	fn total(&self) -> usize {
		self.available.len() + self.checked_out.len() + self.pending
	}

	fn has_capacity(&self, max_pool_size: usize) -> bool {
		max_pool_size == 0 || self.total() < max_pool_size
	}

	fn leave_queue(&mut self, ticket: u64) {
		self.wait_queue.retain(|t| *t != ticket);
	}

	/// Reserves a slot for a new connection, returning its id and generation.
	fn reserve(&mut self) -> (usize, u64) {
		let id = self.next_connection_id;
		self.next_connection_id += 1;
		self.pending += 1;
		(id, self.generation)
	}
}

#[derive(Debug)]
struct PoolInner {
	address:     ServerAddress,
	options:     ConnectionPoolOptions,
	establisher: ConnectionEstablisher,
	events:      Arc<EventHandler>,
	state:       Mutex<PoolState>,
	condvar:     Condvar
}

/// The connection pool of one server.
#[derive(Debug)]
pub struct ConnectionPool {
	inner: Arc<PoolInner>
}

impl ConnectionPool {
	/// Creates a ready pool and starts its maintenance thread.
	pub fn new(
		address:     ServerAddress,
		options:     ConnectionPoolOptions,
		establisher: ConnectionEstablisher,
		events:      Arc<EventHandler>
	) -> Result<Self> {
		let inner = Arc::new(PoolInner {
			address,
			options,
			establisher,
			events,
			state: Mutex::new(PoolState {
				generation:         0,
				status:             PoolStatus::Ready,
				available:          VecDeque::new(),
				checked_out:        HashSet::new(),
				pending:            0,
				wait_queue:         VecDeque::new(),
				next_ticket:        0,
				next_connection_id: 1
			}),
			condvar: Condvar::new()
		});

		inner.events.emit(Event::PoolCreated { address: &inner.address, options: &inner.options });
		inner.events.emit(Event::PoolReady { address: &inner.address });

		let weak = Arc::downgrade(&inner);
		std::thread::Builder::new()
			.name(format!("pool-maintenance-{}", inner.address))
			.spawn(move || maintain(weak))?;

		Ok(Self { inner })
	}

	pub fn address(&self) -> &ServerAddress {
		&self.inner.address
	}

	pub fn generation(&self) -> Result<u64> {
		Ok(self.inner.state.lock()?.generation)
	}

	/// Hands out an idle connection or establishes a new one, waiting in line while the pool is full.
	pub fn check_out(&self, deadline: &Deadline) -> Result<PooledConnection> {
		let inner = &self.inner;
		inner.events.emit(Event::ConnectionCheckOutStarted { address: &inner.address });

		match inner.check_out(deadline) {
			Ok(conn) => {
				inner.events.emit(Event::ConnectionCheckedOut { address: &inner.address, connection_id: conn.id });
				Ok(PooledConnection { conn: Some(conn), pool: inner.clone() })
			}
			Err(e) => {
				inner.events.emit(Event::ConnectionCheckOutFailed {
					address: &inner.address,
					reason:  match e {
						Error::PoolClosed(_) => ConnectionCheckOutFailedReason::PoolClosed,
						Error::WaitQueueTimeout(_) | Error::Cancelled => ConnectionCheckOutFailedReason::Timeout,
						_ => ConnectionCheckOutFailedReason::ConnectionError
					}
				});
				Err(e)
			}
		}
	}

	/// Returns a connection; one that was not checked out from this pool is ignored.
	pub fn check_in(&self, conn: Connection) {
		self.inner.check_in(conn)
	}

	/// Invalidates every connection of the current generation and pauses the pool, `cause` is
	/// reported with the [`Event::PoolCleared`] event.
	///
	/// A paused or closed pool is left alone.
	pub fn clear(&self, cause: &Error) -> Result<()> {
		let inner = &self.inner;
		let mut state = inner.state.lock()?;
		if state.status != PoolStatus::Ready {
			return Ok(());
		}

		state.generation += 1;
		state.status = PoolStatus::Paused;
		let generation = state.generation;
		let idle = state.available.drain(..).collect::<Vec<_>>();
		inner.condvar.notify_all();
		drop(state);

		info!(address = %inner.address, generation, %cause, "connection pool cleared");
		inner.events.emit(Event::PoolCleared { address: &inner.address, generation, cause });
		inner.close_connections(idle, ConnectionClosedReason::Stale);
		Ok(())
	}

	/// Resumes a paused pool.
	pub fn mark_ready(&self) -> Result<()> {
		let inner = &self.inner;
		let mut state = inner.state.lock()?;
		if state.status != PoolStatus::Paused {
			return Ok(());
		}

		state.status = PoolStatus::Ready;
		inner.condvar.notify_all();
		drop(state);
		inner.events.emit(Event::PoolReady { address: &inner.address });
		Ok(())
	}

	pub fn is_paused(&self) -> bool {
		self.inner.state.lock().map_or(false, |state| state.status == PoolStatus::Paused)
	}

	/// Closes idle connections, fails waiters and stops maintenance; idempotent.
	pub fn close(&self) {
		let inner = &self.inner;
		let idle = match inner.state.lock() {
			Ok(mut state) if state.status != PoolStatus::Closed => {
				state.status = PoolStatus::Closed;
				inner.condvar.notify_all();
				state.available.drain(..).collect::<Vec<_>>()
			}
			_ => return
		};

		inner.close_connections(idle, ConnectionClosedReason::PoolClosed);
		inner.events.emit(Event::PoolClosed { address: &inner.address });
	}
}

impl Drop for ConnectionPool {
	fn drop(&mut self) {
		self.close();
	}
}

impl PoolInner {
	fn check_out(&self, deadline: &Deadline) -> Result<Connection> {
		let until = deadline.min(self.options.wait_queue_timeout.map(|t| Instant::now() + t));
		let mut state = self.state.lock()?;
		let ticket = state.next_ticket;
		state.next_ticket += 1;
		state.wait_queue.push_back(ticket);

		loop {
			let failure = match state.status {
				PoolStatus::Closed => Some(Error::PoolClosed(self.address.clone())),
				PoolStatus::Paused => Some(Error::PoolCleared(self.address.clone())),
				PoolStatus::Ready  => match deadline.check() {
					Err(Error::DeadlineExceeded) => Some(Error::WaitQueueTimeout(self.address.clone())),
					Err(e) => Some(e),
					Ok(()) => None
				}
			};

			if let Some(e) = failure {
				state.leave_queue(ticket);
				self.condvar.notify_all();
				return Err(e);
			}

			if state.wait_queue.front() == Some(&ticket) {
				let mut perished = Vec::new();
				while let Some(conn) = state.available.pop_back() {
					if let Some(reason) = self.perished(&conn, state.generation) {
						perished.push((conn, reason));
						continue;
					}

					state.wait_queue.pop_front();
					state.checked_out.insert(conn.id);
					self.condvar.notify_all();
					drop(state);
					self.close_perished(perished);
					return Ok(conn);
				}

				if state.has_capacity(self.options.max_pool_size) {
					state.wait_queue.pop_front();
					let (id, generation) = state.reserve();
					self.condvar.notify_all();
					drop(state);
					self.close_perished(perished);

					match self.establish(id, generation, deadline) {
						Ok(Some(conn)) => return Ok(conn),
						// the pool was cleared while dialing, take another turn at the front
						Ok(None) => {
							state = self.state.lock()?;
							state.wait_queue.push_front(ticket);
							continue;
						}
						Err(e) => return Err(e)
					}
				}

				if !perished.is_empty() {
					drop(state);
					self.close_perished(perished);
					state = self.state.lock()?;
					continue;
				}
			}

			let (guard, timed_out) = deadline.wait(&self.condvar, state, until)?;
			state = guard;
			if timed_out {
				state.leave_queue(ticket);
				self.condvar.notify_all();
				return Err(Error::WaitQueueTimeout(self.address.clone()));
			}
		}
	}

	/// Dials a connection for a reserved slot and checks it out, `None` if it went stale meanwhile.
	fn establish(&self, id: usize, generation: u64, deadline: &Deadline) -> Result<Option<Connection>> {
		self.events.emit(Event::ConnectionCreated { address: &self.address, connection_id: id });
		let start = Instant::now();
		let result = self.establisher.establish(&self.address, id, generation, deadline);

		let mut state = self.state.lock()?;
		state.pending -= 1;
		self.condvar.notify_all();

		match result {
			Ok((conn, _)) if conn.generation == state.generation && state.status == PoolStatus::Ready => {
				state.checked_out.insert(conn.id);
				drop(state);
				self.events.emit(Event::ConnectionReady {
					address:       &self.address,
					connection_id: id,
					duration:      start.elapsed()
				});
				Ok(Some(conn))
			}
			Ok((conn, _)) => {
				drop(state);
				self.close_connections(vec![conn], ConnectionClosedReason::Stale);
				Ok(None)
			}
			Err(e) => {
				drop(state);
				debug!(address = %self.address, connection_id = id, error = %e, "failed to establish connection");
				self.events.emit(Event::ConnectionClosed {
					address:       &self.address,
					connection_id: id,
					reason:        ConnectionClosedReason::Error
				});
				Err(e)
			}
		}
	}

	fn perished(&self, conn: &Connection, generation: u64) -> Option<ConnectionClosedReason> {
		if conn.generation != generation {
			Some(ConnectionClosedReason::Stale)
		} else if conn.has_error {
			Some(ConnectionClosedReason::Error)
		} else if self.options.max_idle_time.map_or(false, |max| conn.idle_for() >= max) {
			Some(ConnectionClosedReason::Idle)
		} else {
			None
		}
	}

	fn check_in(&self, mut conn: Connection) {
		let mut state = match self.state.lock() {
			Ok(state) => state,
			Err(_) => return
		};

		// ids are only unique within one pool
		if conn.address != self.address || !state.checked_out.remove(&conn.id) {
			return;
		}

		conn.last_used = Instant::now();
		let id = conn.id;
		let mut closed = Vec::new();

		if state.status == PoolStatus::Closed {
			closed.push((conn, ConnectionClosedReason::PoolClosed));
		} else if let Some(reason) = self.perished(&conn, state.generation) {
			closed.push((conn, reason));
		} else {
			state.available.push_back(conn);
			if let Some(max_idle) = self.options.max_idle_connections {
				while state.available.len() > max_idle {
					if let Some(oldest) = state.available.pop_front() {
						closed.push((oldest, ConnectionClosedReason::Idle));
					}
				}
			}
		}

		self.condvar.notify_all();
		drop(state);
		self.events.emit(Event::ConnectionCheckedIn { address: &self.address, connection_id: id });
		self.close_perished(closed);
	}

	fn close_connections(&self, connections: Vec<Connection>, reason: ConnectionClosedReason) {
		for conn in connections {
			self.events.emit(Event::ConnectionClosed { address: &self.address, connection_id: conn.id, reason });
		}
	}

	fn close_perished(&self, connections: Vec<(Connection, ConnectionClosedReason)>) {
		for (conn, reason) in connections {
			self.events.emit(Event::ConnectionClosed { address: &self.address, connection_id: conn.id, reason });
		}
	}

	/// Prunes perished idle connections and tops the pool up to its minimum size.
	fn maintain(&self) -> Result<()> {
		let mut state = self.state.lock()?;
		let generation = state.generation;
		let mut perished = Vec::new();
		for conn in std::mem::take(&mut state.available) {
			match self.perished(&conn, generation) {
				Some(reason) => perished.push((conn, reason)),
				None => state.available.push_back(conn)
			}
		}
		drop(state);
		self.close_perished(perished);

		loop {
			let mut state = self.state.lock()?;
			if state.status != PoolStatus::Ready
				|| state.total() >= self.options.min_pool_size
				|| !state.has_capacity(self.options.max_pool_size) {
				return Ok(());
			}

			let (id, generation) = state.reserve();
			drop(state);

			self.events.emit(Event::ConnectionCreated { address: &self.address, connection_id: id });
			let start = Instant::now();
			let result = self.establisher.establish(
				&self.address, id, generation, &Deadline::after(self.establisher.connect_timeout()));

			let mut state = self.state.lock()?;
			state.pending -= 1;
			match result {
				Ok((conn, _)) if conn.generation == state.generation && state.status == PoolStatus::Ready => {
					state.available.push_back(conn);
					self.condvar.notify_all();
					drop(state);
					self.events.emit(Event::ConnectionReady {
						address:       &self.address,
						connection_id: id,
						duration:      start.elapsed()
					});
				}
				Ok((conn, _)) => {
					self.condvar.notify_all();
					drop(state);
					self.close_connections(vec![conn], ConnectionClosedReason::Stale);
					return Ok(());
				}
				Err(e) => {
					self.condvar.notify_all();
					drop(state);
					debug!(address = %self.address, error = %e, "failed to populate connection pool");
					self.events.emit(Event::ConnectionClosed {
						address:       &self.address,
						connection_id: id,
						reason:        ConnectionClosedReason::Error
					});
					return Ok(());
				}
			}
		}
	}
}

/// Runs maintenance every `maintenance_interval` until the pool is closed or dropped.
fn maintain(pool: Weak<PoolInner>) {
	let mut last_run = Instant::now();
	loop {
		let inner = match pool.upgrade() {
			Some(inner) => inner,
			None => return
		};

		let interval = inner.options.maintenance_interval;
		let due = match inner.state.lock() {
			Ok(state) if state.status == PoolStatus::Closed => return,
			Ok(state) => match interval.checked_sub(last_run.elapsed()) {
				Some(remaining) if remaining.as_nanos() > 0 => match inner.condvar.wait_timeout(state, remaining) {
					Ok((state, _)) if state.status == PoolStatus::Closed => return,
					Ok(_) => last_run.elapsed() >= interval,
					Err(_) => return
				},
				_ => true
			},
			Err(_) => return
		};

		if due {
			if let Err(e) = inner.maintain() {
				debug!(address = %inner.address, error = %e, "connection pool maintenance failed");
			}
			last_run = Instant::now();
		}
	}
}

/// A checked out connection, returned to its pool when dropped.
#[derive(Debug)]
pub struct PooledConnection {
	conn: Option<Connection>,
	pool: Arc<PoolInner>
}

impl Deref for PooledConnection {
	type Target = Connection;

	fn deref(&self) -> &Self::Target {
		match &self.conn {
			Some(conn) => conn,
			None => unreachable!("connection used after check in")
		}
	}
}

impl DerefMut for PooledConnection {
	fn deref_mut(&mut self) -> &mut Self::Target {
		match &mut self.conn {
			Some(conn) => conn,
			None => unreachable!("connection used after check in")
		}
	}
}

impl Drop for PooledConnection {
	fn drop(&mut self) {
		if let Some(conn) = self.conn.take() {
			self.pool.check_in(conn);
		}
	}
}
