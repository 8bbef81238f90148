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

#![warn(clippy::all)]
#![forbid(unsafe_code)]

//! The runtime core of a MongoDB driver: topology discovery and monitoring, connection pooling,
//! server selection and retrying operation execution.
//!
//! Documents are opaque to this crate; a [`wire::Codec`] encodes the commands the core issues
//! itself and decodes the reply fields it inspects.

use {
	self::{
		apm::{Event, EventHandler},
		conn::ConnectionEstablisher,
		executor::{Command, CommandReply, Executor, OperationContext, Retryability},
		selection::SelectionCriteria,
		topology::{Topology, TopologyDescription},
		wire::Codec
	},
	std::sync::Arc,
	tracing::debug
};

pub use self::{common::*, utils::*};

pub mod apm;
pub mod common;
pub mod conn;
pub mod executor;
pub mod monitor;
pub mod pool;
pub mod selection;
pub mod server;
pub mod topology;
pub mod utils;
pub mod wire;
#[cfg(test)]
mod test_util;

pub static DRIVER_NAME: &str = "mongo-rust-driver";

#[derive(Debug, Clone)]
pub struct Client(Arc<ClientInner>);

#[derive(Debug)]
pub struct ClientInner {
	pub options: ClientOptions,
	events:      Arc<EventHandler>,
	executor:    Executor
}

impl std::ops::Deref for Client {
	type Target = ClientInner;

	fn deref(&self) -> &Self::Target {
		&self.0
	}
}

impl Client {
	/// Validates `options` and starts monitoring the seed list.
	pub fn new(options: ClientOptions, codec: Arc<dyn Codec>) -> Result<Self> {
		Self::with_event_listener(options, codec, |_| ())
	}

	/// Like [`Self::new`], with a listener that also observes the events of the startup.
	pub fn with_event_listener(
		options:  ClientOptions,
		codec:    Arc<dyn Codec>,
		listener: impl Fn(&Event) + Send + Sync + 'static
	) -> Result<Self> {
		options.validate()?;
		let events = Arc::new(EventHandler::default());
		events.add_listener(listener)?;

		let establisher = ConnectionEstablisher::new(&options, codec.clone())?;
		let topology = Topology::new(&options, establisher, events.clone())?;
		let executor = Executor::new(topology, codec, events.clone(), &options);
		debug!(hosts = ?options.hosts, "client created");

		Ok(Self(Arc::new(ClientInner { options, events, executor })))
	}

	pub fn execute(&self, command: &Command, ctx: &mut OperationContext) -> Result<CommandReply> {
		self.executor.execute(command, ctx)
	}

	/// Runs a command with the client's defaults: reads honor the configured read preference,
	/// everything else goes to a writable server.
	pub fn run_command(&self, name: &str, payload: &[u8], retryability: Retryability) -> Result<CommandReply> {
		let criteria = match retryability {
			Retryability::Read => SelectionCriteria::ReadPreference(self.options.read_preference.clone()),
			_                  => SelectionCriteria::Writable
		};
		self.execute(&Command::new(name, payload, retryability), &mut OperationContext::new(criteria))
	}

	pub fn add_event_listener(&self, listener: impl Fn(&Event) + Send + Sync + 'static) -> Result<()> {
		self.events.add_listener(listener)
	}

	pub fn topology_description(&self) -> Result<Arc<TopologyDescription>> {
		self.executor.topology().description()
	}

	/// Whether the deployment supports sessions, as far as it has been discovered.
	pub fn supports_sessions(&self) -> Result<bool> {
		Ok(self.topology_description()?.supports_sessions())
	}

	/// Stops monitoring and closes all pools; later operations fail with [`Error::Shutdown`].
	pub fn close(&self) -> Result<()> {
		self.executor.topology().close()
	}
}

impl Drop for ClientInner {
	fn drop(&mut self) {
		if let Err(e) = self.executor.topology().close() {
			debug!(error = %e, "failed to close topology");
		}
	}
}
