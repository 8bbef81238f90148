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

//! Monitoring events for SDAM, the connection pools and command execution.
//!
//! see https://github.com/mongodb/specifications/blob/master/source/server-discovery-and-monitoring/server-discovery-and-monitoring-monitoring.rst,
//! https://github.com/mongodb/specifications/blob/master/source/connection-monitoring-and-pooling/connection-monitoring-and-pooling.rst

use {
	crate::{
		Error, Result, ServerAddress, ConnectionPoolOptions,
		server::ServerDescription,
		topology::TopologyDescription,
		wire::HelloReply
	},
	std::{sync::{RwLock, atomic::{AtomicBool, Ordering}}, time::Duration},
	tracing::trace
};

pub type EventListener = Box<dyn Fn(&Event) + Send + Sync>;

#[derive(Debug)]
pub enum Event<'a> {
	TopologyOpening,
	TopologyClosed,
	TopologyDescriptionChanged {
		previous: &'a TopologyDescription,
		new:      &'a TopologyDescription
	},
	ServerOpening {
		address: &'a ServerAddress
	},
	ServerClosed {
		address: &'a ServerAddress
	},
	ServerDescriptionChanged {
		address:  &'a ServerAddress,
		previous: &'a ServerDescription,
		new:      &'a ServerDescription
	},
	ServerHeartbeatStarted {
		address: &'a ServerAddress
	},
	ServerHeartbeatSucceeded {
		address:  &'a ServerAddress,
		duration: Duration,
		reply:    &'a HelloReply
	},
	ServerHeartbeatFailed {
		address:  &'a ServerAddress,
		duration: Duration,
		failure:  &'a Error
	},
	PoolCreated {
		address: &'a ServerAddress,
		options: &'a ConnectionPoolOptions
	},
	PoolReady {
		address: &'a ServerAddress
	},
	PoolCleared {
		address:    &'a ServerAddress,
		generation: u64,
		/// The error that invalidated the pool's connections.
		cause:      &'a Error
	},
	PoolClosed {
		address: &'a ServerAddress
	},
	ConnectionCreated {
		address:       &'a ServerAddress,
		connection_id: usize
	},
	ConnectionReady {
		address:       &'a ServerAddress,
		connection_id: usize,
		duration:      Duration
	},
	ConnectionClosed {
		address:       &'a ServerAddress,
		connection_id: usize,
		reason:        ConnectionClosedReason
	},
	ConnectionCheckOutStarted {
		address: &'a ServerAddress
	},
	ConnectionCheckOutFailed {
		address: &'a ServerAddress,
		reason:  ConnectionCheckOutFailedReason
	},
	ConnectionCheckedOut {
		address:       &'a ServerAddress,
		connection_id: usize
	},
	ConnectionCheckedIn {
		address:       &'a ServerAddress,
		connection_id: usize
	},
	CommandStarted {
		address:       &'a ServerAddress,
		command_name:  &'a str,
		request_id:    i32,
		operation_id:  usize,
		connection_id: usize,
		attempt:       usize
	},
	CommandSucceeded {
		address:       &'a ServerAddress,
		duration:      Duration,
		command_name:  &'a str,
		request_id:    i32,
		operation_id:  usize,
		connection_id: usize
	},
	CommandFailed {
		address:       &'a ServerAddress,
		duration:      Duration,
		failure:       &'a Error,
		command_name:  &'a str,
		request_id:    i32,
		operation_id:  usize,
		connection_id: usize
	}
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ConnectionCheckOutFailedReason {
	PoolClosed,
	Timeout,
	ConnectionError
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ConnectionClosedReason {
	Stale,
	Idle,
	Error,
	PoolClosed
}

/// Fans events out to the registered listeners.
#[derive(Default)]
pub struct EventHandler {
	listeners_set: AtomicBool,
	listeners:     RwLock<Vec<EventListener>>
}

impl std::fmt::Debug for EventHandler {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		f.debug_struct("EventHandler")
			.field("listeners_set", &self.listeners_set)
			.finish()
	}
}

impl EventHandler {
	pub fn add_listener(&self, listener: impl Fn(&Event) + Send + Sync + 'static) -> Result<()> {
		self.listeners.write()?.push(Box::new(listener));
		self.listeners_set.store(true, Ordering::SeqCst);
		Ok(())
	}

	/// Listeners run on the emitting thread and must not block.
	pub fn emit(&self, event: Event) {
		trace!(?event, "apm event");
		if !self.listeners_set.load(Ordering::SeqCst) { return; }
		if let Ok(listeners) = self.listeners.read() {
			for listener in listeners.iter() {
				listener(&event)
			}
		}
	}
}
