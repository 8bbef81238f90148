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

//! An in-memory deployment for tests: servers answer `hello` with a configured reply and every
//! other command with `{ ok: 1 }` unless a failure has been queued.

use {
	crate::{
		*,
		conn::{Connector, Transport},
		wire::{self, Codec, CommandStatus, ElectionId, HelloCommand, HelloReply}
	},
	std::{
		collections::{HashMap, VecDeque},
		io::{self, Read, Write},
		sync::{Arc, Mutex}
	}
};

#[derive(Debug, Clone, Copy)]
pub struct JsonCodec;

impl Codec for JsonCodec {
	fn encode_hello(&self, command: &HelloCommand) -> Result<Vec<u8>> {
		serde_json::to_vec(command).map_err(Error::codec)
	}

	fn decode_hello(&self, reply: &[u8]) -> Result<HelloReply> {
		serde_json::from_slice(reply).map_err(Error::codec)
	}

	fn decode_status(&self, reply: &[u8]) -> Result<CommandStatus> {
		serde_json::from_slice(reply).map_err(Error::codec)
	}
}

#[derive(Debug, Clone)]
pub enum MockFailure {
	/// The server drops the connection instead of replying.
	Reset,
	/// The server replies with this status.
	Status(CommandStatus)
}

#[derive(Debug, Default)]
struct MockServer {
	hello:    Option<HelloReply>,
	failures: VecDeque<MockFailure>,
	commands: usize,
	dials:    usize
}

#[derive(Debug, Default)]
pub struct MockCluster {
	servers: Mutex<HashMap<ServerAddress, MockServer>>
}

fn reset() -> io::Error {
	io::Error::new(io::ErrorKind::ConnectionReset, "connection reset by mock server")
}

impl MockCluster {
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	/// Sets the reply to `hello`, `None` takes the server down.
	pub fn set_hello(&self, address: &ServerAddress, hello: Option<HelloReply>) {
		self.servers.lock().unwrap().entry(address.clone()).or_default().hello = hello;
	}

	/// Queues a failure for the next command other than `hello`.
	pub fn push_failure(&self, address: &ServerAddress, failure: MockFailure) {
		self.servers.lock().unwrap().entry(address.clone()).or_default().failures.push_back(failure);
	}

	/// Drops the failures still queued for the server.
	pub fn clear_failures(&self, address: &ServerAddress) {
		if let Some(server) = self.servers.lock().unwrap().get_mut(address) {
			server.failures.clear();
		}
	}

	/// Commands other than `hello` the server received.
	pub fn commands(&self, address: &ServerAddress) -> usize {
		self.servers.lock().unwrap().get(address).map_or(0, |s| s.commands)
	}

	/// Connections opened to the server, monitoring connections included.
	pub fn dials(&self, address: &ServerAddress) -> usize {
		self.servers.lock().unwrap().get(address).map_or(0, |s| s.dials)
	}

	/// Routes all connections of `options` to this cluster.
	pub fn options(self: &Arc<Self>, options: ClientOptions) -> ClientOptions {
		ClientOptions { connector: Some(Arc::new(MockConnector(self.clone()))), ..options }
	}

	fn reply(&self, address: &ServerAddress, command: &serde_json::Value) -> io::Result<Vec<u8>> {
		let mut servers = self.servers.lock().unwrap();
		let server = servers.entry(address.clone()).or_default();

		if command.get("hello").is_some() {
			return match &server.hello {
				Some(hello) => Ok(serde_json::to_vec(hello)?),
				None => Err(reset())
			};
		}

		server.commands += 1;
		match server.failures.pop_front() {
			Some(MockFailure::Reset) => Err(reset()),
			Some(MockFailure::Status(status)) => Ok(serde_json::to_vec(&status)?),
			None => Ok(serde_json::to_vec(&CommandStatus { ok: 1f64, ..CommandStatus::default() })?)
		}
	}
}

#[derive(Debug)]
struct MockConnector(Arc<MockCluster>);

impl Connector for MockConnector {
	fn connect(&self, address: &ServerAddress, _timeout: std::time::Duration) -> Result<Box<dyn Transport>> {
		let mut servers = self.0.servers.lock().unwrap();
		let server = servers.entry(address.clone()).or_default();
		server.dials += 1;
		if server.hello.is_none() {
			return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "mock server is down").into());
		}

		Ok(Box::new(MockStream {
			cluster: self.0.clone(),
			address: address.clone(),
			inbox:   Vec::new(),
			outbox:  io::Cursor::new(Vec::new()),
			broken:  false
		}))
	}
}

#[derive(Debug)]
struct MockStream {
	cluster: Arc<MockCluster>,
	address: ServerAddress,
	inbox:   Vec<u8>,
	outbox:  io::Cursor<Vec<u8>>,
	broken:  bool
}

impl MockStream {
	fn respond(&mut self) -> io::Result<()> {
		let invalid = |e: Error| io::Error::new(io::ErrorKind::InvalidData, e.to_string());
		let mut cursor = io::Cursor::new(&self.inbox[..]);
		let (header, body) = wire::read_message(&mut cursor).map_err(invalid)?;
		let consumed = cursor.position() as usize;
		self.inbox.drain(..consumed);

		let command: serde_json::Value = serde_json::from_slice(&body[5..])?;
		let reply = match self.cluster.reply(&self.address, &command) {
			Ok(reply) => reply,
			Err(e) => {
				self.broken = true;
				return Err(e);
			}
		};

		let message = wire::encode_message(wire::next_request_id(), header.request_id, None, &reply).map_err(invalid)?;
		self.outbox = io::Cursor::new(message);
		Ok(())
	}
}

impl Read for MockStream {
	fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
		if self.broken {
			return Err(reset());
		}

		if self.outbox.position() as usize >= self.outbox.get_ref().len() {
			self.respond()?;
		}

		self.outbox.read(buf)
	}
}

impl Write for MockStream {
	fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
		if self.broken {
			return Err(reset());
		}

		self.inbox.extend_from_slice(buf);
		Ok(buf.len())
	}

	fn flush(&mut self) -> io::Result<()> {
		Ok(())
	}
}

impl Transport for MockStream {}

pub fn addr(address: &str) -> ServerAddress {
	address.parse().unwrap()
}

fn addresses(hosts: &[&str]) -> Vec<String> {
	hosts.iter().map(|h| h.to_string()).collect()
}

pub fn standalone() -> HelloReply {
	HelloReply {
		ok:                              1f64,
		is_writable_primary:             true,
		min_wire_version:                0,
		max_wire_version:                17,
		logical_session_timeout_minutes: Some(30),
		..HelloReply::default()
	}
}

pub fn mongos() -> HelloReply {
	HelloReply { msg: Some("isdbgrid".to_string()), ..standalone() }
}

pub fn primary(set: &str, hosts: &[&str], me: &str) -> HelloReply {
	primary_of_term(set, hosts, me, 1, 1)
}

pub fn primary_of_term(set: &str, hosts: &[&str], me: &str, term: u64, set_version: i32) -> HelloReply {
	HelloReply {
		set_name:    Some(set.to_string()),
		set_version: Some(set_version),
		election_id: Some(ElectionId::from_term(term)),
		hosts:       addresses(hosts),
		me:          Some(me.to_string()),
		..standalone()
	}
}

pub fn secondary(set: &str, hosts: &[&str], me: &str) -> HelloReply {
	HelloReply {
		is_writable_primary: false,
		secondary:           true,
		set_name:            Some(set.to_string()),
		hosts:               addresses(hosts),
		me:                  Some(me.to_string()),
		..standalone()
	}
}
