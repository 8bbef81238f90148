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

//! Server monitoring, one thread per known server.
//!
//! see https://github.com/mongodb/specifications/blob/master/source/server-discovery-and-monitoring/server-monitoring.rst

use {
	crate::{
		*,
		apm::Event,
		conn::Connection,
		server::{ServerContext, ServerDescription},
		topology::{Topology, TopologyInner},
		wire::HelloReply
	},
	std::{sync::{Arc, Condvar, Mutex, Weak}, time::{Duration, Instant}},
	tracing::{debug, trace}
};

#[derive(Debug, Default)]
struct SignalState {
	check_requested: bool,
	stopped:         bool
}

#[derive(Debug, Default)]
struct MonitorSignal {
	state:   Mutex<SignalState>,
	condvar: Condvar
}

impl MonitorSignal {
	fn is_stopped(&self) -> bool {
		self.state.lock().map_or(true, |state| state.stopped)
	}

	/// Sleeps until the next check is due, `false` once stopped.
	///
	/// A requested check runs as soon as `min_interval` has passed since the last one.
	fn wait(&self, interval: Duration, min_interval: Duration, last_check: Instant) -> bool {
		let mut state = match self.state.lock() {
			Ok(state) => state,
			Err(_) => return false
		};

		loop {
			if state.stopped {
				return false;
			}

			let elapsed = last_check.elapsed();
			let next = if state.check_requested { min_interval } else { interval };
			if elapsed >= next {
				state.check_requested = false;
				return true;
			}

			state = match self.condvar.wait_timeout(state, next - elapsed) {
				Ok((state, _)) => state,
				Err(_) => return false
			};
		}
	}
}

/// Controls a running monitor thread.
#[derive(Debug)]
pub struct MonitorHandle {
	signal: Arc<MonitorSignal>
}

impl MonitorHandle {
	pub fn request_check(&self) {
		if let Ok(mut state) = self.signal.state.lock() {
			state.check_requested = true;
			self.signal.condvar.notify_all();
		}
	}

	/// Signals the thread to exit; it does not wait for it, the thread may be the caller.
	pub fn stop(&self) {
		if let Ok(mut state) = self.signal.state.lock() {
			state.stopped = true;
			self.signal.condvar.notify_all();
		}
	}
}

impl Drop for MonitorHandle {
	fn drop(&mut self) {
		self.stop();
	}
}

struct Monitor {
	address:    ServerAddress,
	context:    Arc<ServerContext>,
	topology:   Weak<TopologyInner>,
	signal:     Arc<MonitorSignal>,
	connection: Option<Connection>,
	avg_rtt:    Option<Duration>
}

pub(crate) fn spawn(
	address:  ServerAddress,
	context:  Arc<ServerContext>,
	topology: Weak<TopologyInner>
) -> Result<MonitorHandle> {
	let signal = Arc::new(MonitorSignal::default());
	let monitor = Monitor {
		address: address.clone(),
		context,
		topology,
		signal: signal.clone(),
		connection: None,
		avg_rtt: None
	};

	std::thread::Builder::new()
		.name(format!("server-monitor-{}", address))
		.spawn(move || monitor.run())?;

	Ok(MonitorHandle { signal })
}

impl Monitor {
	fn run(mut self) {
		debug!(address = %self.address, "server monitor started");

		loop {
			if self.signal.is_stopped() {
				break;
			}

			let checked = self.check();
			let last_check = Instant::now();

			// a monitor of a removed server must not report anymore
			if self.signal.is_stopped() {
				break;
			}

			let applied = match (self.topology.upgrade().map(Topology), checked) {
				(None, _) => break,
				(Some(topology), Ok(description)) => topology.update(description),
				(Some(topology), Err(e)) => topology.mark_server_unknown(&self.address, &e, true)
			};
			if let Err(e) = applied {
				debug!(address = %self.address, error = %e, "failed to apply server description");
			}

			if !self.signal.wait(
				self.context.heartbeat_frequency,
				self.context.min_heartbeat_frequency,
				last_check
			) {
				break;
			}
		}

		debug!(address = %self.address, "server monitor stopped");
	}

	/// Runs one heartbeat; a failure drops the monitoring connection and the average round trip time.
	fn check(&mut self) -> Result<ServerDescription> {
		let events = self.context.events.clone();
		events.emit(Event::ServerHeartbeatStarted { address: &self.address });

		let start = Instant::now();
		let result = self.hello();
		let duration = start.elapsed();

		match result {
			Ok(reply) => {
				let avg_rtt = average_rtt(self.avg_rtt, duration);
				self.avg_rtt = Some(avg_rtt);
				trace!(address = %self.address, ?duration, ?avg_rtt, "heartbeat succeeded");
				events.emit(Event::ServerHeartbeatSucceeded { address: &self.address, duration, reply: &reply });
				Ok(ServerDescription::from_hello(self.address.clone(), &reply, duration, avg_rtt))
			}
			Err(e) => {
				self.connection = None;
				self.avg_rtt = None;
				debug!(address = %self.address, error = %e, "heartbeat failed");
				events.emit(Event::ServerHeartbeatFailed { address: &self.address, duration, failure: &e });
				Err(e)
			}
		}
	}

	fn hello(&mut self) -> Result<HelloReply> {
		let establisher = &self.context.establisher;
		let deadline = Deadline::after(establisher.connect_timeout());

		match &mut self.connection {
			Some(conn) => establisher.hello(conn, false, &deadline),
			None => {
				let (conn, reply) = establisher.establish_monitoring(&self.address, &deadline)?;
				self.connection = Some(conn);
				Ok(reply)
			}
		}
	}
}

/// Exponentially weighted moving average of round trip times, the newest sample weighing 0.2.
fn average_rtt(previous: Option<Duration>, sample: Duration) -> Duration {
	match previous {
		Some(avg) => avg.mul_f64(0.8) + sample.mul_f64(0.2),
		None      => sample
	}
}
