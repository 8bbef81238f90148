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

//! Runs one logical operation: selection, checkout, round trip and at most one retry.
//!
//! see https://github.com/mongodb/specifications/blob/master/source/retryable-reads/retryable-reads.rst,
//! https://github.com/mongodb/specifications/blob/master/source/retryable-writes/retryable-writes.rst

use {
	crate::{
		*,
		apm::{Event, EventHandler},
		selection::SelectionCriteria,
		server::{Server, ServerType},
		topology::Topology,
		wire::{self, ClusterTime, Codec, CommandStatus}
	},
	std::{sync::{Arc, atomic::{AtomicUsize, Ordering}}, time::Instant},
	tracing::debug
};

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Retryability {
	None,
	Read,
	Write
}

/// An encoded command and how it may be retried.
#[derive(Debug, Copy, Clone)]
pub struct Command<'a> {
	pub name:         &'a str,
	pub payload:      &'a [u8],
	pub retryability: Retryability
}

impl<'a> Command<'a> {
	pub fn new(name: &'a str, payload: &'a [u8], retryability: Retryability) -> Self {
		Self { name, payload, retryability }
	}
}

/// The causally consistent state of a session, required to retry writes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionToken {
	pub cluster_time: Option<ClusterTime>
}

impl SessionToken {
	pub fn advance(&mut self, cluster_time: ClusterTime) {
		if self.cluster_time.map_or(true, |current| cluster_time > current) {
			self.cluster_time = Some(cluster_time);
		}
	}
}

#[derive(Debug, Clone)]
pub struct OperationContext {
	pub deadline: Deadline,
	/// Whether the operation may be attempted a second time.
	pub retry:    bool,
	pub criteria: SelectionCriteria,
	pub session:  Option<SessionToken>
}

impl OperationContext {
	pub fn new(criteria: SelectionCriteria) -> Self {
		Self { deadline: Deadline::none(), retry: true, criteria, session: None }
	}

	pub fn with_deadline(self, deadline: Deadline) -> Self {
		Self { deadline, ..self }
	}

	pub fn with_session(self, session: SessionToken) -> Self {
		Self { session: Some(session), ..self }
	}
}

#[derive(Debug, Clone)]
pub struct CommandReply {
	/// The reply document, for the codec of the caller.
	pub bytes:   Vec<u8>,
	pub status:  CommandStatus,
	pub address: ServerAddress
}

enum Attempt {
	First,
	Retry { first_error: Error }
}

/// A failed attempt with what SDAM and the retry decision need to know about it.
struct Failure {
	error:            Error,
	generation:       Option<u64>,
	max_wire_version: i32,
	supports_retryable_writes: bool
}

#[derive(Debug)]
pub struct Executor {
	topology:     Topology,
	codec:        Arc<dyn Codec>,
	events:       Arc<EventHandler>,
	retry_reads:  bool,
	retry_writes: bool,
	operation_id: AtomicUsize
}

impl Executor {
	pub fn new(topology: Topology, codec: Arc<dyn Codec>, events: Arc<EventHandler>, options: &ClientOptions) -> Self {
		Self {
			topology,
			codec,
			events,
			retry_reads:  options.retry_reads,
			retry_writes: options.retry_writes,
			operation_id: AtomicUsize::new(1)
		}
	}

	pub fn topology(&self) -> &Topology {
		&self.topology
	}

	pub fn execute(&self, command: &Command, ctx: &mut OperationContext) -> Result<CommandReply> {
		let operation_id = self.operation_id.fetch_add(1, Ordering::SeqCst);
		let mut attempt = Attempt::First;

		loop {
			let number = match attempt {
				Attempt::First       => 1,
				Attempt::Retry { .. } => 2
			};

			let server = match self.topology.select_server(&ctx.criteria, &ctx.deadline) {
				Ok(server) => server,
				Err(e) => return Err(match attempt {
					Attempt::Retry { first_error } if matches!(e, Error::ServerSelectionTimeout(_)) => first_error,
					_ => e
				})
			};

			let failure = match self.attempt(&server, command, ctx, operation_id, number) {
				Ok(reply) => return Ok(reply),
				Err(failure) => failure
			};

			self.topology.handle_application_error(
				&server.address,
				&failure.error,
				failure.generation,
				failure.max_wire_version
			)?;

			match attempt {
				Attempt::First if self.may_retry(command, ctx, &failure) => {
					debug!(
						operation_id,
						command = command.name,
						address = %server.address,
						error = %failure.error,
						"retrying operation"
					);
					attempt = Attempt::Retry { first_error: failure.error };
				}
				_ => return Err(failure.error)
			}
		}
	}

	fn may_retry(&self, command: &Command, ctx: &OperationContext, failure: &Failure) -> bool {
		if !ctx.retry {
			return false;
		}

		match command.retryability {
			Retryability::None  => false,
			Retryability::Read  => self.retry_reads && failure.error.is_retryable_read(),
			Retryability::Write => self.retry_writes
				&& ctx.session.is_some()
				&& failure.supports_retryable_writes
				&& failure.error.is_retryable_write(failure.max_wire_version)
		}
	}

	fn attempt(
		&self,
		server:       &Server,
		command:      &Command,
		ctx:          &mut OperationContext,
		operation_id: usize,
		number:       usize
	) -> std::result::Result<CommandReply, Failure> {
		let known = self.topology.description().ok()
			.and_then(|d| d.servers.get(&server.address).cloned());
		let supports_retryable_writes = |r#type: ServerType, sessions: bool| r#type != ServerType::Standalone && sessions;
		let generation = server.pool.generation().ok();

		let mut conn = match server.pool.check_out(&ctx.deadline) {
			Ok(conn) => conn,
			Err(error) => return Err(Failure {
				error,
				generation,
				max_wire_version:          known.as_ref().map_or(0, |s| s.max_wire_version),
				supports_retryable_writes: known.as_ref().map_or(false, |s| supports_retryable_writes(
					s.r#type, s.logical_session_timeout.is_some()))
			})
		};

		let (max_wire_version, retryable_writes, compressor) = match conn.stream_description() {
			Some(d) => (d.max_wire_version, supports_retryable_writes(d.server_type, d.logical_session_timeout.is_some()), d.compressor),
			None    => (conn.max_wire_version(), false, None)
		};
		let fail = |error: Error, generation: u64| Failure {
			error,
			generation:                Some(generation),
			max_wire_version,
			supports_retryable_writes: retryable_writes
		};

		let request_id = wire::next_request_id();
		self.events.emit(Event::CommandStarted {
			address:       &server.address,
			command_name:  command.name,
			request_id,
			operation_id,
			connection_id: conn.id,
			attempt:       number
		});

		let start = Instant::now();
		let result = conn.send_recv_with(request_id, compressor, command.payload, &ctx.deadline)
			.and_then(|bytes| {
				let status = self.codec.decode_status(&bytes)?;
				if let Some(cluster_time) = status.cluster_time {
					self.topology.advance_cluster_time(cluster_time)?;
					if let Some(session) = &mut ctx.session {
						session.advance(cluster_time);
					}
				}

				match status.error() {
					Some(e) => Err(Error::Command(e)),
					None    => Ok(CommandReply { bytes, status, address: server.address.clone() })
				}
			});
		let duration = start.elapsed();

		match result {
			Ok(reply) => {
				self.events.emit(Event::CommandSucceeded {
					address:       &server.address,
					duration,
					command_name:  command.name,
					request_id,
					operation_id,
					connection_id: conn.id
				});
				Ok(reply)
			}
			Err(error) => {
				self.events.emit(Event::CommandFailed {
					address:       &server.address,
					duration,
					failure:       &error,
					command_name:  command.name,
					request_id,
					operation_id,
					connection_id: conn.id
				});
				Err(fail(error, conn.generation))
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use {
		super::*,
		crate::{conn::ConnectionEstablisher, test_util::*, topology::{TopologyDescription, TopologyType}},
		std::{sync::Mutex, thread, time::Duration}
	};

	fn executor(options: &ClientOptions) -> (Executor, Arc<EventHandler>) {
		let codec = Arc::new(JsonCodec);
		let events = Arc::new(EventHandler::default());
		let establisher = ConnectionEstablisher::new(options, codec.clone()).unwrap();
		let topology = Topology::new(options, establisher, events.clone()).unwrap();
		(Executor::new(topology, codec, events.clone(), options), events)
	}

	/// Blocks until `cond` holds for the current topology description.
	fn await_topology(executor: &Executor, cond: impl Fn(&TopologyDescription) -> bool) {
		let start = Instant::now();
		while !cond(&executor.topology().description().unwrap()) {
			assert!(start.elapsed() < Duration::from_secs(10), "topology never reached the expected state");
			thread::sleep(Duration::from_millis(5));
		}
	}

	fn mongos_pair() -> (Arc<MockCluster>, ClientOptions) {
		let cluster = MockCluster::new();
		cluster.set_hello(&addr("a:1"), Some(mongos()));
		cluster.set_hello(&addr("b:1"), Some(mongos()));
		let options = cluster.options(ClientOptions::with_hosts(vec![addr("a:1"), addr("b:1")]));
		(cluster, options)
	}

	fn status(code: i32, labels: &[&str]) -> MockFailure {
		MockFailure::Status(CommandStatus {
			ok:           0f64,
			code:         Some(code),
			errmsg:       Some("injected".to_string()),
			error_labels: labels.iter().map(|l| l.to_string()).collect(),
			..CommandStatus::default()
		})
	}

	const INSERT: Command = Command { name: "insert", payload: b"{\"insert\":\"c\"}", retryability: Retryability::Write };
	const FIND: Command = Command { name: "find", payload: b"{\"find\":\"c\"}", retryability: Retryability::Read };

	#[test]
	fn commands_run_on_the_selected_server() {
		let cluster = MockCluster::new();
		cluster.set_hello(&addr("a:1"), Some(standalone()));
		let (executor, events) = executor(&cluster.options(ClientOptions::with_hosts(vec![addr("a:1")])));

		let seen = Arc::new(Mutex::new(Vec::new()));
		let seen_ = seen.clone();
		events.add_listener(move |event| match event {
			Event::CommandStarted { command_name, attempt, .. } => seen_.lock().unwrap().push(format!("started {} #{}", command_name, attempt)),
			Event::CommandSucceeded { command_name, .. } => seen_.lock().unwrap().push(format!("succeeded {}", command_name)),
			_ => ()
		}).unwrap();

		let reply = executor.execute(&FIND, &mut OperationContext::new(SelectionCriteria::default())).unwrap();
		assert_eq!(reply.address, addr("a:1"));
		assert_eq!(reply.status.ok, 1f64);
		assert_eq!(cluster.commands(&addr("a:1")), 1);
		assert_eq!(*seen.lock().unwrap(), vec!["started find #1", "succeeded find"]);
		executor.topology().close().unwrap();
	}

	#[test]
	fn failed_write_is_retried_on_another_server() {
		let (cluster, options) = mongos_pair();
		let (executor, _) = executor(&options);
		await_topology(&executor, |d| d.r#type == TopologyType::Sharded
			&& d.servers.values().all(|s| s.r#type == ServerType::Mongos));

		// whichever server is picked first resets, the retry must go to the other one and fail too
		cluster.push_failure(&addr("a:1"), MockFailure::Reset);
		cluster.push_failure(&addr("b:1"), MockFailure::Reset);

		let mut ctx = OperationContext::new(SelectionCriteria::Writable).with_session(SessionToken::default());
		let err = executor.execute(&INSERT, &mut ctx).unwrap_err();
		assert!(err.is_network_error());
		assert_eq!(cluster.commands(&addr("a:1")), 1);
		assert_eq!(cluster.commands(&addr("b:1")), 1);

		for address in &[addr("a:1"), addr("b:1")] {
			let server = executor.topology().server(address).unwrap().unwrap();
			assert_eq!(server.pool.generation().unwrap(), 1);
		}
		executor.topology().close().unwrap();
	}

	#[test]
	fn failed_write_succeeds_on_the_other_server() {
		let (cluster, mut options) = mongos_pair();
		// the failed server must stay unknown for the rest of the test
		options.server_selection_config.heartbeat_frequency = Duration::from_secs(60);
		options.server_selection_config.min_heartbeat_frequency = Duration::from_secs(60);
		let (executor, events) = executor(&options);
		await_topology(&executor, |d| d.r#type == TopologyType::Sharded
			&& d.servers.values().all(|s| s.r#type == ServerType::Mongos));

		// both servers are primed to reset, the retry target is healed as the retry starts
		cluster.push_failure(&addr("a:1"), MockFailure::Reset);
		cluster.push_failure(&addr("b:1"), MockFailure::Reset);
		let attempts = Arc::new(Mutex::new(Vec::new()));
		let (attempts_, cluster_) = (attempts.clone(), cluster.clone());
		events.add_listener(move |event| if let Event::CommandStarted { address, attempt, .. } = event {
			if *attempt == 2 {
				cluster_.clear_failures(address);
			}
			attempts_.lock().unwrap().push((*address).clone());
		}).unwrap();

		let mut ctx = OperationContext::new(SelectionCriteria::Writable).with_session(SessionToken::default());
		let reply = executor.execute(&INSERT, &mut ctx).unwrap();

		let attempts = attempts.lock().unwrap().clone();
		assert_eq!(attempts.len(), 2);
		let (failed, retried) = (&attempts[0], &attempts[1]);
		assert_ne!(failed, retried);
		assert_eq!(&reply.address, retried);

		let description = executor.topology().description().unwrap();
		assert_eq!(description.servers[failed].r#type, ServerType::Unknown);
		assert_eq!(description.servers[retried].r#type, ServerType::Mongos);

		let topology = executor.topology();
		assert_eq!(topology.server(failed).unwrap().unwrap().pool.generation().unwrap(), 1);
		assert_eq!(topology.server(retried).unwrap().unwrap().pool.generation().unwrap(), 0);
		topology.close().unwrap();
	}

	#[test]
	fn reads_fail_over_to_a_secondary() {
		let cluster = MockCluster::new();
		let hosts = &["a:1", "b:1"];
		cluster.set_hello(&addr("a:1"), Some(primary("rs", hosts, "a:1")));
		cluster.set_hello(&addr("b:1"), Some(secondary("rs", hosts, "b:1")));
		let mut options = cluster.options(ClientOptions::with_hosts(vec![addr("a:1"), addr("b:1")]));
		options.server_selection_config.heartbeat_frequency = Duration::from_secs(60);
		options.server_selection_config.min_heartbeat_frequency = Duration::from_secs(60);
		let (executor, _) = executor(&options);
		await_topology(&executor, |d| d.r#type == TopologyType::ReplicaSetWithPrimary
			&& d.servers.values().all(|s| s.is_available()));
		cluster.push_failure(&addr("a:1"), MockFailure::Reset);

		let criteria = SelectionCriteria::ReadPreference(ReadPreference::new(ReadPreferenceMode::PrimaryPreferred));
		let reply = executor.execute(&FIND, &mut OperationContext::new(criteria)).unwrap();
		assert_eq!(reply.address, addr("b:1"));
		assert_eq!(cluster.commands(&addr("a:1")), 1);

		let description = executor.topology().description().unwrap();
		assert_eq!(description.r#type, TopologyType::ReplicaSetNoPrimary);
		assert_eq!(executor.topology().server(&addr("a:1")).unwrap().unwrap().pool.generation().unwrap(), 1);
		executor.topology().close().unwrap();
	}

	#[test]
	fn writes_without_a_session_are_not_retried() {
		let (cluster, options) = mongos_pair();
		let (executor, _) = executor(&options);
		await_topology(&executor, |d| d.r#type == TopologyType::Sharded);
		cluster.push_failure(&addr("a:1"), MockFailure::Reset);
		cluster.push_failure(&addr("b:1"), MockFailure::Reset);

		let err = executor.execute(&INSERT, &mut OperationContext::new(SelectionCriteria::Writable)).unwrap_err();
		assert!(err.is_network_error());
		assert_eq!(cluster.commands(&addr("a:1")) + cluster.commands(&addr("b:1")), 1);
		executor.topology().close().unwrap();
	}

	#[test]
	fn writes_to_standalones_are_not_retried() {
		let cluster = MockCluster::new();
		cluster.set_hello(&addr("a:1"), Some(standalone()));
		let (executor, _) = executor(&cluster.options(ClientOptions::with_hosts(vec![addr("a:1")])));
		cluster.push_failure(&addr("a:1"), status(262, &[RETRYABLE_WRITE_ERROR]));

		let mut ctx = OperationContext::new(SelectionCriteria::Writable).with_session(SessionToken::default());
		assert!(matches!(executor.execute(&INSERT, &mut ctx), Err(Error::Command(_))));
		assert_eq!(cluster.commands(&addr("a:1")), 1);
		executor.topology().close().unwrap();
	}

	#[test]
	fn labelled_write_errors_are_retried() {
		let cluster = MockCluster::new();
		cluster.set_hello(&addr("a:1"), Some(mongos()));
		let (executor, _) = executor(&cluster.options(ClientOptions::with_hosts(vec![addr("a:1")])));
		cluster.push_failure(&addr("a:1"), status(262, &[RETRYABLE_WRITE_ERROR]));

		let mut ctx = OperationContext::new(SelectionCriteria::Writable).with_session(SessionToken::default());
		executor.execute(&INSERT, &mut ctx).unwrap();
		assert_eq!(cluster.commands(&addr("a:1")), 2);
		executor.topology().close().unwrap();
	}

	#[test]
	fn non_retryable_errors_surface_immediately() {
		let cluster = MockCluster::new();
		cluster.set_hello(&addr("a:1"), Some(mongos()));
		let (executor, _) = executor(&cluster.options(ClientOptions::with_hosts(vec![addr("a:1")])));
		cluster.push_failure(&addr("a:1"), status(11000, &[]));

		let mut ctx = OperationContext::new(SelectionCriteria::Writable).with_session(SessionToken::default());
		let err = executor.execute(&INSERT, &mut ctx).unwrap_err();
		assert_eq!(err.code(), Some(MongoError::DuplicateKey));
		assert_eq!(cluster.commands(&addr("a:1")), 1);
		executor.topology().close().unwrap();
	}

	#[test]
	fn reads_are_retried_after_rediscovery() {
		let cluster = MockCluster::new();
		cluster.set_hello(&addr("a:1"), Some(standalone()));
		let (executor, _) = executor(&cluster.options(ClientOptions::with_hosts(vec![addr("a:1")])));
		cluster.push_failure(&addr("a:1"), MockFailure::Reset);

		let reply = executor.execute(&FIND, &mut OperationContext::new(SelectionCriteria::default())).unwrap();
		assert_eq!(reply.address, addr("a:1"));
		assert_eq!(cluster.commands(&addr("a:1")), 2);
		executor.topology().close().unwrap();
	}

	#[test]
	fn retry_selection_timeout_surfaces_the_first_error() {
		let cluster = MockCluster::new();
		cluster.set_hello(&addr("a:1"), Some(standalone()));
		let mut options = cluster.options(ClientOptions::with_hosts(vec![addr("a:1")]));
		options.server_selection_config.server_selection_timeout = Duration::from_millis(300);
		let (executor, _) = executor(&options);
		await_topology(&executor, |d| d.r#type == TopologyType::Single && d.servers.values().all(|s| s.is_available()));

		// the server goes away, so the first attempt cannot connect and no retry target appears
		cluster.set_hello(&addr("a:1"), None);
		let err = executor.execute(&FIND, &mut OperationContext::new(SelectionCriteria::default())).unwrap_err();
		assert!(matches!(err, Error::ConnectionEstablishment { .. }));
		executor.topology().close().unwrap();
	}

	#[test]
	fn cancelled_operations_do_not_run() {
		let cluster = MockCluster::new();
		cluster.set_hello(&addr("a:1"), Some(standalone()));
		let (executor, _) = executor(&cluster.options(ClientOptions::with_hosts(vec![addr("a:1")])));

		let token = CancellationToken::new();
		token.cancel();
		let mut ctx = OperationContext::new(SelectionCriteria::default())
			.with_deadline(Deadline::none().with_cancellation(token));
		assert!(matches!(executor.execute(&FIND, &mut ctx), Err(Error::Cancelled)));
		assert_eq!(cluster.commands(&addr("a:1")), 0);
		executor.topology().close().unwrap();
	}

	#[test]
	fn cluster_time_is_gossiped_to_the_session() {
		let cluster = MockCluster::new();
		cluster.set_hello(&addr("a:1"), Some(mongos()));
		let (executor, _) = executor(&cluster.options(ClientOptions::with_hosts(vec![addr("a:1")])));
		let cluster_time = ClusterTime::default();
		cluster.push_failure(&addr("a:1"), MockFailure::Status(CommandStatus {
			ok:           1f64,
			cluster_time: Some(cluster_time),
			..CommandStatus::default()
		}));

		let mut ctx = OperationContext::new(SelectionCriteria::Writable).with_session(SessionToken::default());
		executor.execute(&INSERT, &mut ctx).unwrap();
		assert_eq!(ctx.session.unwrap().cluster_time, Some(cluster_time));
		assert_eq!(executor.topology().description().unwrap().cluster_time, Some(cluster_time));
		executor.topology().close().unwrap();
	}
}
