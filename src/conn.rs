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

//! Transports and the connection handshake.

use {
	crate::{*, server::ServerType, wire::{self, Codec, Compressor, HelloCommand, HelloReply, ClientMetadata, Wire}},
	std::{
		fmt,
		io::{self, Read, Write},
		net::{TcpStream, ToSocketAddrs},
		sync::Arc,
		time::{Duration, Instant}
	},
	tracing::debug
};

/// A byte stream to one server.
pub trait Transport: Read + Write + Send + fmt::Debug {
	/// Bounds subsequent reads and writes, `None` blocks indefinitely.
	fn set_timeout(&mut self, _timeout: Option<Duration>) -> io::Result<()> {
		Ok(())
	}
}

/// Opens transports, replaceable through [`ClientOptions::connector`].
pub trait Connector: Send + Sync + fmt::Debug {
	fn connect(&self, address: &ServerAddress, timeout: Duration) -> Result<Box<dyn Transport>>;
}

/// Runs after the handshake of every new connection and fails its establishment on error.
pub trait Authenticator: Send + Sync + fmt::Debug {
	fn authenticate(&self, connection: &mut Connection, credential: &Credential, hello: &HelloReply) -> Result<()>;
}

#[allow(clippy::large_enum_variant)]
pub enum Stream {
	Tcp(TcpStream),
	#[cfg(feature = "tls")]
	Tls(Box<rustls::StreamOwned<rustls::ClientSession, TcpStream>>)
}

impl fmt::Debug for Stream {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		f.write_str(match self {
			Self::Tcp(..) => "Stream::Tcp(...)",
			#[cfg(feature = "tls")]
			Self::Tls(..) => "Stream::Tls(...)"
		})
	}
}

impl Read for Stream {
	fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
		match self {
			Self::Tcp(stream) => stream.read(buf),
			#[cfg(feature = "tls")]
			Self::Tls(stream) => stream.read(buf)
		}
	}
}

impl Write for Stream {
	fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
		match self {
			Self::Tcp(stream) => stream.write(buf),
			#[cfg(feature = "tls")]
			Self::Tls(stream) => stream.write(buf)
		}
	}

	fn flush(&mut self) -> io::Result<()> {
		match self {
			Self::Tcp(stream) => stream.flush(),
			#[cfg(feature = "tls")]
			Self::Tls(stream) => stream.flush()
		}
	}
}

impl Transport for Stream {
	fn set_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
		// a zero timeout is rejected by the OS
		let timeout = timeout.map(|t| t.max(Duration::from_millis(1)));
		let socket = match self {
			Self::Tcp(stream) => &*stream,
			#[cfg(feature = "tls")]
			Self::Tls(stream) => &stream.sock
		};
		socket.set_read_timeout(timeout)?;
		socket.set_write_timeout(timeout)
	}
}

/// Dials plain TCP, wrapped in TLS if the options ask for it.
#[derive(Default)]
pub struct TcpConnector {
	#[cfg(feature = "tls")]
	tls_config: Option<Arc<rustls::ClientConfig>>
}

impl fmt::Debug for TcpConnector {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		#[cfg(feature = "tls")]
		return f.debug_struct("TcpConnector").field("tls", &self.tls_config.is_some()).finish();
		#[cfg(not(feature = "tls"))]
		f.debug_struct("TcpConnector").finish()
	}
}

impl TcpConnector {
	pub fn new(options: &ClientOptions) -> Result<Self> {
		#[cfg(not(feature = "tls"))]
		return match options.tls_options {
			Some(_) => Err(Error::InvalidArgument("TLS requested but the `tls` feature is disabled".to_string())),
			None    => Ok(Self {})
		};

		#[cfg(feature = "tls")]
		Ok(Self { tls_config: options.tls_options.as_ref().map(tls_config).transpose()?.map(Arc::new) })
	}
}

#[cfg(feature = "tls")]
fn tls_config(options: &TlsOptions) -> Result<rustls::ClientConfig> {
	use std::{fs::File, io::BufReader};

	let mut config = rustls::ClientConfig::new();

	if let Some(ca_file) = &options.ca_file {
		config.root_store.add_pem_file(&mut BufReader::new(File::open(ca_file)?))
			.map_err(|_| Error::InvalidArgument(format!("invalid CA file `{}`", ca_file)))?;
	}

	if let Some(key_file) = &options.certificate_key_file {
		let invalid = || Error::InvalidArgument(format!("invalid certificate key file `{}`", key_file));
		let certs = rustls::internal::pemfile::certs(&mut BufReader::new(File::open(key_file)?))
			.map_err(|_| invalid())?;
		let key = rustls::internal::pemfile::pkcs8_private_keys(&mut BufReader::new(File::open(key_file)?))
			.map_err(|_| invalid())?
			.into_iter()
			.next()
			.ok_or_else(invalid)?;
		config.set_single_client_cert(certs, key);
	}

	Ok(config)
}

impl Connector for TcpConnector {
	fn connect(&self, address: &ServerAddress, timeout: Duration) -> Result<Box<dyn Transport>> {
		let timeout = timeout.max(Duration::from_millis(1));
		let mut last_error = None;
		let mut socket = None;

		for addr in (address.host.as_str(), address.port).to_socket_addrs()? {
			match TcpStream::connect_timeout(&addr, timeout) {
				Ok(s) => {
					socket = Some(s);
					break;
				}
				Err(e) => last_error = Some(e)
			}
		}

		let socket = socket.ok_or_else(|| last_error.unwrap_or_else(|| io::Error::new(
			io::ErrorKind::AddrNotAvailable, format!("{} did not resolve to any address", address))))?;
		socket.set_nodelay(true)?;

		#[cfg(feature = "tls")]
		{
			if let Some(config) = &self.tls_config {
				let session = rustls::ClientSession::new(config, webpki::DNSNameRef::try_from_ascii_str(&address.host)?);
				return Ok(Box::new(Stream::Tls(Box::new(rustls::StreamOwned::new(session, socket)))));
			}
		}

		Ok(Box::new(Stream::Tcp(socket)))
	}
}

/// What the handshake revealed about the server behind a connection.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamDescription {
	pub server_type:             ServerType,
	pub max_wire_version:        i32,
	pub logical_session_timeout: Option<Duration>,
	pub compressor:              Option<Compressor>
}

impl StreamDescription {
	fn new(hello: &HelloReply, compressor: Option<Compressor>) -> Self {
		Self {
			server_type:             ServerType::from_hello(hello),
			max_wire_version:        hello.max_wire_version,
			logical_session_timeout: hello.logical_session_timeout_minutes
				.map(|m| Duration::from_secs(m.max(0) as u64 * 60)),
			compressor
		}
	}
}

pub struct Connection {
	pub id:                 usize,
	pub address:            ServerAddress,
	pub generation:         u64,
	pub created:            Instant,
	pub(crate) last_used:   Instant,
	pub(crate) has_error:   bool,
	stream_description:     Option<StreamDescription>,
	socket_timeout:         Option<Duration>,
	transport:              Box<dyn Transport>
}

impl fmt::Debug for Connection {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		f.debug_struct("Connection")
			.field("id", &self.id)
			.field("address", &self.address)
			.field("generation", &self.generation)
			.field("has_error", &self.has_error)
			.finish()
	}
}

impl Connection {
	pub fn new(
		id:             usize,
		address:        ServerAddress,
		generation:     u64,
		transport:      Box<dyn Transport>,
		socket_timeout: Option<Duration>
	) -> Self {
		let now = Instant::now();
		Self {
			id,
			address,
			generation,
			created:            now,
			last_used:          now,
			has_error:          false,
			stream_description: None,
			socket_timeout,
			transport
		}
	}

	pub fn stream_description(&self) -> Option<&StreamDescription> {
		self.stream_description.as_ref()
	}

	pub fn max_wire_version(&self) -> i32 {
		self.stream_description.as_ref().map_or(0, |d| d.max_wire_version)
	}

	pub fn has_error(&self) -> bool {
		self.has_error
	}

	pub fn idle_for(&self) -> Duration {
		self.last_used.elapsed()
	}

	/// Sends `payload` and waits for the reply, compressed if a compressor was negotiated.
	pub fn send_recv(&mut self, payload: &[u8], deadline: &Deadline) -> Result<Vec<u8>> {
		let compressor = self.stream_description.as_ref().and_then(|d| d.compressor);
		self.send_recv_with(wire::next_request_id(), compressor, payload, deadline)
	}

	/// Like [`Self::send_recv`] with an explicit request id and compressor.
	///
	/// Any failure after the first byte was written leaves the stream in an unknown state and
	/// marks the connection as errored.
	pub fn send_recv_with(
		&mut self,
		request_id: i32,
		compressor: Option<Compressor>,
		payload:    &[u8],
		deadline:   &Deadline
	) -> Result<Vec<u8>> {
		deadline.check()?;
		let timeout = match (deadline.remaining(), self.socket_timeout) {
			(Some(a), Some(b)) => Some(a.min(b)),
			(a, b)             => a.or(b)
		};

		// with a token attached the socket wakes up regularly to look at it
		let slice = match deadline.is_cancellable() {
			true  => Some(timeout.map_or(CANCELLATION_CHECK_INTERVAL, |t| t.min(CANCELLATION_CHECK_INTERVAL))),
			false => timeout
		};

		let result = match self.transport.set_timeout(slice) {
			Ok(()) => {
				let mut stream = Interruptible {
					transport: &mut *self.transport,
					deadline,
					until:     timeout.map(|t| Instant::now() + t)
				};
				stream.send(request_id, compressor, payload).and_then(|_| stream.recv(request_id))
			}
			Err(e) => Err(e.into())
		};

		self.last_used = Instant::now();
		match result {
			Ok(reply) => Ok(reply),
			Err(e) => {
				self.has_error = true;
				Err(if deadline.is_cancelled() { Error::Cancelled } else { e })
			}
		}
	}
}

/// Retries reads and writes that timed out on a sliced socket timeout until the operation is
/// cancelled or its full timeout has passed.
///
/// A timed out call transferred no bytes, so a framing read resumes where it stopped.
struct Interruptible<'a> {
	transport: &'a mut dyn Transport,
	deadline:  &'a Deadline,
	until:     Option<Instant>
}

impl Interruptible<'_> {
	fn resume(&self, e: &io::Error) -> bool {
		matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
			&& self.deadline.is_cancellable()
			&& !self.deadline.is_cancelled()
			&& self.until.map_or(true, |until| Instant::now() < until)
	}
}

impl Read for Interruptible<'_> {
	fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
		loop {
			match self.transport.read(buf) {
				Err(e) if self.resume(&e) => continue,
				result => return result
			}
		}
	}
}

impl Write for Interruptible<'_> {
	fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
		loop {
			match self.transport.write(buf) {
				Err(e) if self.resume(&e) => continue,
				result => return result
			}
		}
	}

	fn flush(&mut self) -> io::Result<()> {
		loop {
			match self.transport.flush() {
				Err(e) if self.resume(&e) => continue,
				result => return result
			}
		}
	}
}

/// Dials and handshakes new connections for pools and monitors.
#[derive(Debug, Clone)]
pub struct ConnectionEstablisher {
	connector:       Arc<dyn Connector>,
	codec:           Arc<dyn Codec>,
	authenticator:   Option<Arc<dyn Authenticator>>,
	credential:      Credential,
	appname:         Option<String>,
	compressors:     Option<Vec<Compressor>>,
	connect_timeout: Duration,
	socket_timeout:  Option<Duration>
}

impl ConnectionEstablisher {
	pub fn new(options: &ClientOptions, codec: Arc<dyn Codec>) -> Result<Self> {
		let connector = match &options.connector {
			Some(connector) => connector.clone(),
			None            => Arc::new(TcpConnector::new(options)?) as Arc<dyn Connector>
		};

		Ok(Self {
			connector,
			codec,
			authenticator:   options.authenticator.clone(),
			credential:      options.credential.clone(),
			appname:         options.appname.clone(),
			compressors:     options.compressors.clone(),
			connect_timeout: options.connect_timeout,
			socket_timeout:  options.socket_timeout
		})
	}

	pub fn connect_timeout(&self) -> Duration {
		self.connect_timeout
	}

	/// Opens, handshakes and authenticates a connection.
	pub fn establish(
		&self,
		address:    &ServerAddress,
		id:         usize,
		generation: u64,
		deadline:   &Deadline
	) -> Result<(Connection, HelloReply)> {
		self.establish_inner(address, id, generation, true, deadline)
			.map_err(|source| Error::ConnectionEstablishment { address: address.clone(), source: Box::new(source) })
	}

	/// Opens and handshakes a monitoring connection, which is never authenticated.
	pub fn establish_monitoring(&self, address: &ServerAddress, deadline: &Deadline) -> Result<(Connection, HelloReply)> {
		self.establish_inner(address, 0, 0, false, deadline)
			.map_err(|source| Error::ConnectionEstablishment { address: address.clone(), source: Box::new(source) })
	}

	fn establish_inner(
		&self,
		address:      &ServerAddress,
		id:           usize,
		generation:   u64,
		authenticate: bool,
		deadline:     &Deadline
	) -> Result<(Connection, HelloReply)> {
		let deadline = deadline.bounded(self.connect_timeout);
		deadline.check()?;

		let transport = self.connector.connect(address, deadline.remaining().unwrap_or(self.connect_timeout))?;
		let mut conn = Connection::new(id, address.clone(), generation, transport, self.socket_timeout);
		let hello = self.hello(&mut conn, true, &deadline)?;

		let compressor = self.compressors.iter()
			.flatten()
			.find(|c| hello.compression.contains(*c))
			.copied();
		debug!(%address, connection_id = id, ?compressor, "connection handshake complete");
		conn.stream_description = Some(StreamDescription::new(&hello, compressor));

		if let Some(authenticator) = self.authenticator.as_ref().filter(|_| authenticate) {
			if self.credential.username.is_some() || self.credential.mechanism.is_some() {
				authenticator.authenticate(&mut conn, &self.credential, &hello).map_err(|e| match e {
					e @ Error::Auth(_) => e,
					e if e.is_network_error() => e,
					e => Error::Auth(e.to_string())
				})?;
			}
		}

		Ok((conn, hello))
	}

	/// Sends a hello; the handshake variant carries client metadata and compressor offers.
	///
	/// Hellos are never compressed.
	pub fn hello(&self, conn: &mut Connection, handshake: bool, deadline: &Deadline) -> Result<HelloReply> {
		let command = match handshake {
			true  => HelloCommand::new(Some(ClientMetadata::new(self.appname.as_deref())), self.compressors.as_deref()),
			false => HelloCommand::new(None, None)
		};

		let request = self.codec.encode_hello(&command)?;
		let reply = conn.send_recv_with(wire::next_request_id(), None, &request, deadline)?;
		let hello = self.codec.decode_hello(&reply)?;
		match hello.error() {
			Some(e) => Err(e.into()),
			None    => Ok(hello)
		}
	}
}

#[cfg(test)]
mod tests {
	use {super::*, crate::test_util::*, std::{collections::VecDeque, thread}};

	fn establisher(cluster: &Arc<MockCluster>, options: ClientOptions) -> ConnectionEstablisher {
		ConnectionEstablisher::new(&cluster.options(options), Arc::new(JsonCodec)).unwrap()
	}

	#[derive(Debug)]
	struct RejectAll;

	impl Authenticator for RejectAll {
		fn authenticate(&self, _: &mut Connection, credential: &Credential, _: &HelloReply) -> Result<()> {
			Err(Error::Auth(format!("bad password for {:?}", credential.username)))
		}
	}

	#[test]
	fn handshake_records_stream_description() {
		let cluster = MockCluster::new();
		let a = addr("a:27017");
		cluster.set_hello(&a, Some(HelloReply { compression: vec![Compressor::Zstd], ..standalone() }));

		let mut options = ClientOptions::default();
		options.compressors = Some(vec![Compressor::Zstd]);
		let (conn, hello) = establisher(&cluster, options).establish(&a, 1, 0, &Deadline::none()).unwrap();

		assert_eq!(hello.max_wire_version, standalone().max_wire_version);
		let description = conn.stream_description().unwrap();
		assert_eq!(description.server_type, ServerType::Standalone);
		assert_eq!(description.compressor, Some(Compressor::Zstd));
		assert_eq!(description.logical_session_timeout, Some(Duration::from_secs(30 * 60)));
	}

	#[test]
	fn unreachable_servers_fail_with_network_errors() {
		let cluster = MockCluster::new();
		let a = addr("a:27017");
		let err = establisher(&cluster, ClientOptions::default())
			.establish(&a, 1, 0, &Deadline::none())
			.unwrap_err();
		assert!(matches!(err, Error::ConnectionEstablishment { .. }));
		assert!(err.is_network_error());
	}

	#[test]
	fn authentication_failures_are_not_network_errors() {
		let cluster = MockCluster::new();
		let a = addr("a:27017");
		cluster.set_hello(&a, Some(standalone()));

		let mut options = ClientOptions::default();
		options.credential.username = Some("user".to_string());
		options.authenticator = Some(Arc::new(RejectAll));

		let err = establisher(&cluster, options).establish(&a, 1, 0, &Deadline::none()).unwrap_err();
		match err {
			Error::ConnectionEstablishment { source, .. } => assert!(matches!(*source, Error::Auth(_))),
			e => panic!("unexpected error: {}", e)
		}
	}

	#[test]
	fn io_failures_mark_the_connection() {
		let cluster = MockCluster::new();
		let a = addr("a:27017");
		cluster.set_hello(&a, Some(standalone()));
		cluster.push_failure(&a, MockFailure::Reset);

		let (mut conn, _) = establisher(&cluster, ClientOptions::default())
			.establish(&a, 1, 0, &Deadline::none())
			.unwrap();
		assert!(!conn.has_error());
		assert!(conn.send_recv(b"{\"ping\":1}", &Deadline::none()).unwrap_err().is_network_error());
		assert!(conn.has_error());
	}

	/// Delivers a reply in chunks, each becoming readable at its instant; reads before that block
	/// for the socket timeout and time out like a socket would.
	#[derive(Debug)]
	struct SlowTransport {
		chunks:  VecDeque<(Instant, io::Cursor<Vec<u8>>)>,
		timeout: Option<Duration>
	}

	impl SlowTransport {
		fn new(reply: Vec<u8>, delays: &[Duration]) -> Self {
			let start = Instant::now();
			let size = reply.len() / delays.len() + 1;
			let chunks = reply.chunks(size)
				.zip(delays)
				.map(|(chunk, delay)| (start + *delay, io::Cursor::new(chunk.to_vec())))
				.collect();
			Self { chunks, timeout: None }
		}
	}

	impl Read for SlowTransport {
		fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
			let (ready_at, chunk) = match self.chunks.front_mut() {
				Some(front) => front,
				None => return Ok(0)
			};

			let now = Instant::now();
			if now < *ready_at {
				let wait = *ready_at - now;
				thread::sleep(self.timeout.map_or(wait, |t| t.min(wait)));
				if Instant::now() < *ready_at {
					return Err(io::ErrorKind::TimedOut.into());
				}
			}

			let n = chunk.read(buf)?;
			if chunk.position() as usize == chunk.get_ref().len() {
				self.chunks.pop_front();
			}
			Ok(n)
		}
	}

	impl Write for SlowTransport {
		fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
			Ok(buf.len())
		}

		fn flush(&mut self) -> io::Result<()> {
			Ok(())
		}
	}

	impl Transport for SlowTransport {
		fn set_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
			self.timeout = timeout;
			Ok(())
		}
	}

	fn slow_connection(delays: &[Duration]) -> Connection {
		let reply = wire::encode_message(1, 7, None, b"{\"ok\":1}").unwrap();
		Connection::new(1, addr("a:27017"), 0, Box::new(SlowTransport::new(reply, delays)), None)
	}

	#[test]
	fn cancellation_interrupts_a_pending_reply() {
		let mut conn = slow_connection(&[Duration::from_secs(3)]);
		let token = CancellationToken::new();
		let deadline = Deadline::after(Duration::from_secs(30)).with_cancellation(token.clone());
		let canceller = thread::spawn(move || {
			thread::sleep(Duration::from_millis(50));
			token.cancel();
		});

		let start = Instant::now();
		let err = conn.send_recv_with(7, None, b"{\"ping\":1}", &deadline).unwrap_err();
		assert!(matches!(err, Error::Cancelled));
		assert!(start.elapsed() < Duration::from_secs(1));
		assert!(conn.has_error());
		canceller.join().unwrap();
	}

	#[test]
	fn sliced_reads_resume_partial_replies() {
		let mut conn = slow_connection(&[Duration::from_millis(60), Duration::from_millis(120)]);
		let deadline = Deadline::after(Duration::from_secs(30)).with_cancellation(CancellationToken::new());

		let reply = conn.send_recv_with(7, None, b"{\"ping\":1}", &deadline).unwrap();
		assert_eq!(reply, b"{\"ok\":1}".to_vec());
		assert!(!conn.has_error());
	}

	#[test]
	fn socket_timeouts_still_apply_to_cancellable_operations() {
		let mut conn = slow_connection(&[Duration::from_secs(3)]);
		let deadline = Deadline::after(Duration::from_millis(100)).with_cancellation(CancellationToken::new());

		let start = Instant::now();
		let err = conn.send_recv_with(7, None, b"{\"ping\":1}", &deadline).unwrap_err();
		assert!(err.is_network_error());
		assert!(start.elapsed() < Duration::from_secs(1));
		assert!(conn.has_error());
	}

	#[test]
	fn expired_deadlines_fail_before_sending() {
		let cluster = MockCluster::new();
		let a = addr("a:27017");
		cluster.set_hello(&a, Some(standalone()));

		let (mut conn, _) = establisher(&cluster, ClientOptions::default())
			.establish(&a, 1, 0, &Deadline::none())
			.unwrap();
		let err = conn.send_recv(b"{\"ping\":1}", &Deadline::after(Duration::from_millis(0))).unwrap_err();
		assert!(matches!(err, Error::DeadlineExceeded));
		assert!(!conn.has_error());
		assert_eq!(cluster.commands(&a), 0);
	}
}
