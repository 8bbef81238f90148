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

use {
	crate::{
		conn::{Authenticator, Connector},
		topology::TopologyType,
		wire::{Compressor, InvalidReplyError, SUPPORTED_COMPRESSORS},
	},
	std::{collections::HashMap, fmt, str::FromStr, sync::Arc, time::Duration},
	tracing::warn
};

pub const DEFAULT_MONGO_PORT:               u16      = 27017;
pub const DEFAULT_CONNECT_TIMEOUT:          Duration = Duration::from_secs(10);
pub const DEFAULT_MIN_POOL_SIZE:            usize    = 0;
pub const DEFAULT_MAX_POOL_SIZE:            usize    = 100;
pub const DEFAULT_LOCAL_THRESHOLD:          Duration = Duration::from_millis(15);
pub const DEFAULT_SERVER_SELECTION_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_HEARTBEAT_FREQUENCY:      Duration = Duration::from_secs(10);
pub const MIN_HEARTBEAT_FREQUENCY:          Duration = Duration::from_millis(500);
pub const DEFAULT_MAINTENANCE_INTERVAL:     Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_HOSTS:                usize    = 100;
/// Lower bound for `maxStalenessSeconds` regardless of the heartbeat frequency.
pub const SMALLEST_MAX_STALENESS:           Duration = Duration::from_secs(90);
pub const IDLE_WRITE_PERIOD:                Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ServerAddress {
	pub host: String,
	pub port: u16
}

impl ServerAddress {
	pub fn new(host: &str, port: u16) -> Self {
		Self { host: host.to_ascii_lowercase(), port }
	}
}

impl FromStr for ServerAddress {
	type Err = ClientOptionsParseError;

	fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
		let (host, port) = match s.rfind(':') {
			// bracketed ipv6 literals carry colons of their own
			Some(i) if !s[i..].contains(']') => (&s[..i], s[i + 1..].parse::<u16>()
				.map_err(|_| ClientOptionsParseError::InvalidHost(s.to_string()))?),
			_ => (s, DEFAULT_MONGO_PORT)
		};

		if host.is_empty() || port == 0 {
			return Err(ClientOptionsParseError::InvalidHost(s.to_string()));
		}

		Ok(Self::new(host, port))
	}
}

impl fmt::Display for ServerAddress {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "{}:{}", self.host, self.port)
	}
}

/// see https://github.com/mongodb/specifications/blob/master/source/connection-string/connection-string-spec.rst,
/// https://github.com/mongodb/specifications/blob/master/source/uri-options/uri-options.rst
#[derive(Debug, Clone)]
pub struct ClientOptions {
	pub hosts:                   Vec<ServerAddress>,
	pub appname:                 Option<String>,
	pub compressors:             Option<Vec<Compressor>>,
	pub connect_timeout:         Duration,
	pub socket_timeout:          Option<Duration>,
	pub direct_connection:       Option<bool>,
	pub replica_set:             Option<String>,
	pub retry_reads:             bool,
	pub retry_writes:            bool,
	pub credential:              Credential,
	pub server_selection_config: ServerSelectionConfig,
	pub pool_options:            ConnectionPoolOptions,
	pub read_preference:         ReadPreference,
	pub tls_options:             Option<TlsOptions>,
	pub max_hosts:               usize,
	/// Replaces the default TCP/TLS dialer.
	pub connector:               Option<Arc<dyn Connector>>,
	pub authenticator:           Option<Arc<dyn Authenticator>>
}

#[derive(Debug, thiserror::Error)]
pub enum ClientOptionsParseError {
	#[error("connection string must start with `mongodb://`")]
	InvalidScheme,
	#[error("invalid host `{0}`")]
	InvalidHost(String),
	#[error("no hosts specified")]
	NoHosts,
	#[error("invalid value for `{key}`: `{val}`")]
	InvalidValue { key: &'static str, val: String },
	#[error("invalid options: {0}")]
	Conflict(&'static str)
}

impl<T: fmt::Display> From<(&'static str, T)> for ClientOptionsParseError {
	fn from((key, val): (&'static str, T)) -> Self {
		Self::InvalidValue { key, val: val.to_string() }
	}
}

impl ClientOptions {
	/// Options for the given seed list with every other setting at its default.
	pub fn with_hosts(hosts: Vec<ServerAddress>) -> Self {
		Self { hosts, ..Self::default() }
	}

	/// Checks the combinations a connection string cannot express safely.
	pub fn validate(&self) -> std::result::Result<(), ClientOptionsParseError> {
		if self.hosts.is_empty() {
			return Err(ClientOptionsParseError::NoHosts);
		}

		if self.direct_connection == Some(true) && self.hosts.len() > 1 {
			return Err(ClientOptionsParseError::Conflict("directConnection=true with multiple hosts"));
		}

		if self.pool_options.max_pool_size != 0
			&& self.pool_options.min_pool_size > self.pool_options.max_pool_size {
			return Err(ClientOptionsParseError::Conflict("minPoolSize is greater than maxPoolSize"));
		}

		if let Some(max_staleness) = self.read_preference.max_staleness {
			if self.read_preference.mode == ReadPreferenceMode::Primary {
				return Err(ClientOptionsParseError::Conflict("maxStalenessSeconds with read preference `primary`"));
			}

			if max_staleness < min_max_staleness(self.server_selection_config.heartbeat_frequency) {
				return Err(ClientOptionsParseError::from(("maxStalenessSeconds", max_staleness.as_secs())));
			}
		}

		Ok(())
	}

	/// The topology type the client starts out with.
	pub fn initial_topology_type(&self) -> TopologyType {
		match (self.direct_connection, &self.replica_set) {
			(Some(true), _)    => TopologyType::Single,
			(_, Some(_))       => TopologyType::ReplicaSetNoPrimary,
			_                  => TopologyType::Unknown
		}
	}
}

/// The smallest `maxStalenessSeconds` the driver accepts for a heartbeat frequency.
pub fn min_max_staleness(heartbeat_frequency: Duration) -> Duration {
	SMALLEST_MAX_STALENESS.max(heartbeat_frequency + IDLE_WRITE_PERIOD)
}

impl Default for ClientOptions {
	fn default() -> Self {
		Self {
			hosts:                   Vec::new(),
			appname:                 None,
			compressors:             None,
			connect_timeout:         DEFAULT_CONNECT_TIMEOUT,
			socket_timeout:          None,
			direct_connection:       None,
			replica_set:             None,
			retry_reads:             true,
			retry_writes:            true,
			credential:              Credential::default(),
			server_selection_config: ServerSelectionConfig::default(),
			pool_options:            ConnectionPoolOptions::default(),
			read_preference:         ReadPreference::default(),
			tls_options:             None,
			max_hosts:               DEFAULT_MAX_HOSTS,
			connector:               None,
			authenticator:           None
		}
	}
}

fn parse_millis(key: &'static str, value: &str) -> std::result::Result<Duration, ClientOptionsParseError> {
	value.parse().map(Duration::from_millis).map_err(|_| ClientOptionsParseError::from((key, value)))
}

fn parse_bool(key: &'static str, value: &str) -> std::result::Result<bool, ClientOptionsParseError> {
	match value {
		"true"  => Ok(true),
		"false" => Ok(false),
		_       => Err(ClientOptionsParseError::from((key, value)))
	}
}

impl FromStr for ClientOptions {
	type Err = Error;

	fn from_str(mut s: &str) -> std::result::Result<Self, Self::Err> {
		let mut self_ = Self::default();

		if !s.starts_with("mongodb://") {
			return Err(Error::InvalidClientOptions(ClientOptionsParseError::InvalidScheme));
		}

		s = s.trim_start_matches("mongodb://");

		if let Some(i) = s.rfind('@') {
			let mut split = s[..i].splitn(2, ':');
			self_.credential.username = split.next().map(str::to_string);
			self_.credential.password = split.next().map(str::to_string);
			s = &s[i + 1..];
		}

		let i = s.find('/').or_else(|| s.find('?')).unwrap_or_else(|| s.len());
		self_.hosts = s[..i].split(',')
			.filter(|host| !host.is_empty())
			.map(str::parse)
			.collect::<std::result::Result<_, _>>()?;

		if i < s.len() {
			s = s[i..].trim_start_matches('/');
			let i = s.find('?').unwrap_or_else(|| s.len());
			if i > 0 {
				self_.credential.source = Some(s[..i].to_string());
			}
			s = if i < s.len() { &s[i + 1..] } else { "" };
		} else {
			s = "";
		}

		// options

		s.split('&').filter(|s| !s.is_empty()).map(|s| {
			let i = s.find('=').unwrap_or_else(|| s.len());
			(&s[..i], if i < s.len() { &s[i + 1..] } else { "" })
		}).try_for_each(|(key, value)| Ok::<_, ClientOptionsParseError>(match key {
			"appname"                  => self_.appname = Some(value.to_string()),
			"authMechanism"            => self_.credential.mechanism = Some(value.to_string()),
			"authMechanismProperties"  => self_.credential.mechanism_properties = Some(value.to_string()),
			"authSource"               => self_.credential.source = Some(value.to_string()),
			"compressors"              => self_.compressors = Some(value.split(',')
				.filter_map(|s| match s.parse::<Compressor>() {
					Ok(c) if SUPPORTED_COMPRESSORS.contains(&c) => Some(c),
					_ => {
						warn!("ignoring unsupported compressor `{}`", s);
						None
					}
				})
				.collect()),
			"connectTimeoutMS"         => self_.connect_timeout = parse_millis("connectTimeoutMS", value)?,
			"directConnection"         => self_.direct_connection = Some(parse_bool("directConnection", value)?),
			"heartbeatFrequencyMS"     => {
				let frequency = parse_millis("heartbeatFrequencyMS", value)?;
				if frequency < MIN_HEARTBEAT_FREQUENCY {
					return Err(ClientOptionsParseError::from(("heartbeatFrequencyMS", value)));
				}
				self_.server_selection_config.heartbeat_frequency = frequency;
			}
			"localThresholdMS"         => self_.server_selection_config.local_threshold = parse_millis("localThresholdMS", value)?,
			"maxIdleTimeMS"            => self_.pool_options.max_idle_time = Some(parse_millis("maxIdleTimeMS", value)?)
				.filter(|d| *d != Duration::from_millis(0)),
			"maxPoolSize"              => self_.pool_options.max_pool_size = value.parse()
				.map_err(|_| ClientOptionsParseError::from(("maxPoolSize", value)))?,
			"minPoolSize"              => self_.pool_options.min_pool_size = value.parse()
				.map_err(|_| ClientOptionsParseError::from(("minPoolSize", value)))?,
			"maxStalenessSeconds"      => self_.read_preference.max_staleness = match value.parse::<i64>() {
				Ok(-1)              => None,
				Ok(v) if v > 0      => Some(Duration::from_secs(v as u64)),
				_                   => return Err(ClientOptionsParseError::from(("maxStalenessSeconds", value)))
			},
			"readPreference"           => self_.read_preference.mode = value.parse()
				.map_err(|_| ClientOptionsParseError::from(("readPreference", value)))?,
			"readPreferenceTags"       => self_.read_preference.tag_sets.push(value.split(',')
				.filter(|s| !s.is_empty())
				.map(|s| {
					let i = s.find(':').unwrap_or_else(|| s.len());
					(s[..i].to_string(), if i < s.len() { s[i + 1..].to_string() } else { String::new() })
				})
				.collect()),
			"replicaSet"               => self_.replica_set = Some(value.to_string()),
			"retryReads"               => self_.retry_reads = parse_bool("retryReads", value)?,
			"retryWrites"              => self_.retry_writes = parse_bool("retryWrites", value)?,
			"serverSelectionTimeoutMS" => self_.server_selection_config.server_selection_timeout = parse_millis("serverSelectionTimeoutMS", value)?,
			"socketTimeoutMS"          => self_.socket_timeout = Some(parse_millis("socketTimeoutMS", value)?)
				.filter(|d| *d != Duration::from_millis(0)),
			"waitQueueTimeoutMS"       => self_.pool_options.wait_queue_timeout = Some(parse_millis("waitQueueTimeoutMS", value)?),
			"tls" | "ssl"              => if parse_bool("tls", value)? {
				self_.tls_options.get_or_insert_with(TlsOptions::default);
			} else {
				self_.tls_options = None;
			},
			"tlsCAFile"                => self_.tls_options
				.get_or_insert_with(TlsOptions::default).ca_file = Some(value.to_string()),
			"tlsCertificateKeyFile"    => self_.tls_options
				.get_or_insert_with(TlsOptions::default).certificate_key_file = Some(value.to_string()),
			key => warn!("ignoring unknown connection string option `{}`", key)
		}))?;

		self_.validate()?;
		Ok(self_)
	}
}

#[derive(Default, Clone, Eq, PartialEq)]
pub struct Credential {
	pub username:             Option<String>,
	pub password:             Option<String>,
	pub source:               Option<String>,
	pub mechanism:            Option<String>,
	pub mechanism_properties: Option<String>,
}

impl fmt::Debug for Credential {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		f.debug_struct("Credential")
			.field("username", &self.username)
			.field("password", &self.password.as_ref().map(|_| "<redacted>"))
			.field("source", &self.source)
			.field("mechanism", &self.mechanism)
			.finish()
	}
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ConnectionPoolOptions {
	/// `0` means unbounded.
	pub max_pool_size:        usize,
	pub min_pool_size:        usize,
	pub max_idle_time:        Option<Duration>,
	/// Idle connections above this count are closed on check in, oldest first.
	pub max_idle_connections: Option<usize>,
	pub wait_queue_timeout:   Option<Duration>,
	pub maintenance_interval: Duration
}

impl Default for ConnectionPoolOptions {
	fn default() -> Self {
		Self {
			max_pool_size:        DEFAULT_MAX_POOL_SIZE,
			min_pool_size:        DEFAULT_MIN_POOL_SIZE,
			max_idle_time:        None,
			max_idle_connections: None,
			wait_queue_timeout:   None,
			maintenance_interval: DEFAULT_MAINTENANCE_INTERVAL
		}
	}
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ServerSelectionConfig {
	pub local_threshold:          Duration,
	pub server_selection_timeout: Duration,
	pub heartbeat_frequency:      Duration,
	pub min_heartbeat_frequency:  Duration
}

impl Default for ServerSelectionConfig {
	fn default() -> Self {
		Self {
			local_threshold:          DEFAULT_LOCAL_THRESHOLD,
			server_selection_timeout: DEFAULT_SERVER_SELECTION_TIMEOUT,
			heartbeat_frequency:      DEFAULT_HEARTBEAT_FREQUENCY,
			min_heartbeat_frequency:  MIN_HEARTBEAT_FREQUENCY
		}
	}
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ReadPreference {
	pub mode:          ReadPreferenceMode,
	pub max_staleness: Option<Duration>,
	pub tag_sets:      Vec<HashMap<String, String>>,
}

impl ReadPreference {
	pub fn new(mode: ReadPreferenceMode) -> Self {
		Self { mode, ..Self::default() }
	}
}

impl Default for ReadPreference {
	fn default() -> Self {
		Self {
			mode:          ReadPreferenceMode::Primary,
			max_staleness: None,
			tag_sets:      vec![]
		}
	}
}

#[derive(Debug, Copy, Clone, Ord, PartialOrd, Eq, PartialEq)]
pub enum ReadPreferenceMode {
	Primary,
	PrimaryPreferred,
	Secondary,
	SecondaryPreferred,
	Nearest
}

impl FromStr for ReadPreferenceMode {
	type Err = ();

	fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
		Ok(match s {
			"primary"            => Self::Primary,
			"primaryPreferred"   => Self::PrimaryPreferred,
			"secondary"          => Self::Secondary,
			"secondaryPreferred" => Self::SecondaryPreferred,
			"nearest"            => Self::Nearest,
			_ => return Err(())
		})
	}
}

#[derive(Debug, Default, Clone, Eq, PartialEq)]
pub struct TlsOptions {
	pub ca_file:              Option<String>,
	/// PEM file holding the client certificate chain and its PKCS#8 key.
	pub certificate_key_file: Option<String>
}

pub type MDBResult<T> = std::result::Result<T, Error>;
pub type Result<T> = MDBResult<T>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error("invalid client options: {0}")]
	InvalidClientOptions(#[from] ClientOptionsParseError),
	#[error("invalid argument: {0}")]
	InvalidArgument(String),
	#[error("a lock was poisoned")]
	Sync,
	#[error("I/O error: {0}")]
	Io(#[from] std::io::Error),
	#[error("failed to establish a connection to {address}: {source}")]
	ConnectionEstablishment { address: ServerAddress, source: Box<Error> },
	#[cfg(feature = "tls")]
	#[error("TLS error: {0:?}")]
	Tls(rustls::TLSError),
	#[cfg(feature = "tls")]
	#[error("invalid DNS name: {0:?}")]
	Dns(webpki::InvalidDNSNameError),
	#[error("invalid reply: {0}")]
	InvalidReply(#[from] InvalidReplyError),
	#[error("codec error: {0}")]
	Codec(String),
	#[error("{0}")]
	Command(CommandError),
	#[error("authentication failed: {0}")]
	Auth(String),
	#[error("server selection timed out: {0}")]
	ServerSelectionTimeout(String),
	#[error("{0}")]
	Incompatible(CompatibilityError),
	#[error("timed out waiting for a connection to {0}")]
	WaitQueueTimeout(ServerAddress),
	#[error("connection pool for {0} was cleared")]
	PoolCleared(ServerAddress),
	#[error("connection pool for {0} is closed")]
	PoolClosed(ServerAddress),
	#[error("operation was cancelled")]
	Cancelled,
	#[error("operation exceeded its deadline")]
	DeadlineExceeded,
	#[error("client has been shut down")]
	Shutdown
}

impl<T> From<std::sync::PoisonError<T>> for Error {
	fn from(_: std::sync::PoisonError<T>) -> Self {
		Self::Sync
	}
}

#[cfg(feature = "tls")]
impl From<rustls::TLSError> for Error {
	fn from(e: rustls::TLSError) -> Self {
		Self::Tls(e)
	}
}

#[cfg(feature = "tls")]
impl From<webpki::InvalidDNSNameError> for Error {
	fn from(e: webpki::InvalidDNSNameError) -> Self {
		Self::Dns(e)
	}
}

impl From<CommandError> for Error {
	fn from(e: CommandError) -> Self {
		Self::Command(e)
	}
}

pub const RETRYABLE_WRITE_ERROR: &str = "RetryableWriteError";

impl Error {
	pub fn codec(e: impl fmt::Display) -> Self {
		Self::Codec(e.to_string())
	}

	pub fn is_network_error(&self) -> bool {
		match self {
			Self::Io(_) | Self::PoolCleared(_)           => true,
			Self::ConnectionEstablishment { source, .. } => source.is_network_error(),
			_                                            => false
		}
	}

	pub fn code(&self) -> Option<MongoError> {
		match self {
			Self::Command(e) => Some(e.code),
			_                => None
		}
	}

	pub fn labels(&self) -> &[String] {
		match self {
			Self::Command(e) => &e.labels,
			_                => &[]
		}
	}

	/// "not writable primary" and "node is recovering" errors.
	pub fn is_state_change(&self) -> bool {
		self.code().map_or(false, |code| code.is_not_writable_primary() || code.is_recovering())
	}

	pub fn is_shutdown(&self) -> bool {
		matches!(self.code(), Some(MongoError::InterruptedAtShutdown) | Some(MongoError::ShutdownInProgress))
	}

	pub fn is_retryable_read(&self) -> bool {
		self.is_network_error()
			|| self.labels().iter().any(|l| l == RETRYABLE_WRITE_ERROR)
			|| self.code().map_or(false, MongoError::is_retryable)
	}

	/// Servers from wire version 9 on attach the label themselves, older ones are judged by code.
	pub fn is_retryable_write(&self, max_wire_version: i32) -> bool {
		self.is_network_error()
			|| self.labels().iter().any(|l| l == RETRYABLE_WRITE_ERROR)
			|| (max_wire_version < 9 && self.code().map_or(false, MongoError::is_retryable))
	}
}

/// An error reported by the server in a command reply.
#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
#[error("command failed with {code:?} ({}): {message}", .code.code())]
pub struct CommandError {
	pub code:      MongoError,
	pub code_name: Option<String>,
	pub message:   String,
	pub labels:    Vec<String>
}

#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
pub enum CompatibilityError {
	#[error("server at {address} requires wire version {min_wire_version}, but this driver only supports up to {driver_max}")]
	ServerTooNew { address: ServerAddress, min_wire_version: i32, driver_max: i32 },
	#[error("server at {address} reports wire version {max_wire_version}, but this driver requires at least {driver_min}")]
	ServerTooOld { address: ServerAddress, max_wire_version: i32, driver_min: i32 },
	#[error("servers {a} and {b} report disjoint wire version ranges")]
	Disjoint { a: ServerAddress, b: ServerAddress }
}

/// Server error codes the core needs to tell apart.
#[derive(Debug, Eq, PartialEq, Copy, Clone, Hash)]
pub enum MongoError {
	HostUnreachable,
	HostNotFound,
	Unauthorized,
	AuthenticationFailed,
	CursorNotFound,
	MaxTimeMSExpired,
	WriteConcernFailed,
	NetworkTimeout,
	ShutdownInProgress,
	ReadConcernMajorityNotAvailableYet,
	PrimarySteppedDown,
	ExceededTimeLimit,
	SocketException,
	LegacyNotPrimary,
	NotWritablePrimary,
	DuplicateKey,
	InterruptedAtShutdown,
	InterruptedDueToReplStateChange,
	NotPrimaryNoSecondaryOk,
	NotPrimaryOrSecondary,
	Other(i32)
}

impl MongoError {
	pub fn code(self) -> i32 {
		match self {
			Self::HostUnreachable                    => 6,
			Self::HostNotFound                       => 7,
			Self::Unauthorized                       => 13,
			Self::AuthenticationFailed               => 18,
			Self::CursorNotFound                     => 43,
			Self::MaxTimeMSExpired                   => 50,
			Self::WriteConcernFailed                 => 64,
			Self::NetworkTimeout                     => 89,
			Self::ShutdownInProgress                 => 91,
			Self::ReadConcernMajorityNotAvailableYet => 134,
			Self::PrimarySteppedDown                 => 189,
			Self::ExceededTimeLimit                  => 262,
			Self::SocketException                    => 9001,
			Self::LegacyNotPrimary                   => 10058,
			Self::NotWritablePrimary                 => 10107,
			Self::DuplicateKey                       => 11000,
			Self::InterruptedAtShutdown              => 11600,
			Self::InterruptedDueToReplStateChange    => 11602,
			Self::NotPrimaryNoSecondaryOk            => 13435,
			Self::NotPrimaryOrSecondary              => 13436,
			Self::Other(code)                        => code
		}
	}

	pub fn is_not_writable_primary(self) -> bool {
		matches!(self, Self::NotWritablePrimary | Self::NotPrimaryNoSecondaryOk | Self::LegacyNotPrimary)
	}

	pub fn is_recovering(self) -> bool {
		matches!(self, Self::InterruptedAtShutdown | Self::InterruptedDueToReplStateChange
			| Self::NotPrimaryOrSecondary | Self::PrimarySteppedDown | Self::ShutdownInProgress)
	}

	pub fn is_retryable(self) -> bool {
		matches!(self, Self::HostUnreachable | Self::HostNotFound | Self::NetworkTimeout
			| Self::ShutdownInProgress | Self::PrimarySteppedDown | Self::ExceededTimeLimit
			| Self::SocketException | Self::NotWritablePrimary | Self::InterruptedAtShutdown
			| Self::InterruptedDueToReplStateChange | Self::NotPrimaryNoSecondaryOk
			| Self::NotPrimaryOrSecondary)
	}
}

impl From<i32> for MongoError {
	fn from(v: i32) -> Self {
		match v {
			6     => Self::HostUnreachable,
			7     => Self::HostNotFound,
			13    => Self::Unauthorized,
			18    => Self::AuthenticationFailed,
			43    => Self::CursorNotFound,
			50    => Self::MaxTimeMSExpired,
			64    => Self::WriteConcernFailed,
			89    => Self::NetworkTimeout,
			91    => Self::ShutdownInProgress,
			134   => Self::ReadConcernMajorityNotAvailableYet,
			189   => Self::PrimarySteppedDown,
			262   => Self::ExceededTimeLimit,
			9001  => Self::SocketException,
			10058 => Self::LegacyNotPrimary,
			10107 => Self::NotWritablePrimary,
			11000 => Self::DuplicateKey,
			11600 => Self::InterruptedAtShutdown,
			11602 => Self::InterruptedDueToReplStateChange,
			13435 => Self::NotPrimaryNoSecondaryOk,
			13436 => Self::NotPrimaryOrSecondary,
			code  => Self::Other(code)
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parse_connection_string() {
		let options: ClientOptions = "mongodb://user:pw@a.example.com:27018,B.example.com/admin?replicaSet=rs0\
			&maxPoolSize=5&minPoolSize=1&heartbeatFrequencyMS=1000&serverSelectionTimeoutMS=500\
			&readPreference=secondaryPreferred&readPreferenceTags=dc:ny,rack:1&readPreferenceTags=\
			&maxStalenessSeconds=120&retryWrites=false&compressors=zstd,snappy"
			.parse().unwrap();

		assert_eq!(options.hosts, vec![
			ServerAddress::new("a.example.com", 27018),
			ServerAddress::new("b.example.com", DEFAULT_MONGO_PORT)
		]);
		assert_eq!(options.credential.username.as_deref(), Some("user"));
		assert_eq!(options.credential.password.as_deref(), Some("pw"));
		assert_eq!(options.credential.source.as_deref(), Some("admin"));
		assert_eq!(options.replica_set.as_deref(), Some("rs0"));
		assert_eq!(options.pool_options.max_pool_size, 5);
		assert_eq!(options.pool_options.min_pool_size, 1);
		assert_eq!(options.server_selection_config.heartbeat_frequency, Duration::from_secs(1));
		assert_eq!(options.server_selection_config.server_selection_timeout, Duration::from_millis(500));
		assert_eq!(options.read_preference.mode, ReadPreferenceMode::SecondaryPreferred);
		assert_eq!(options.read_preference.tag_sets.len(), 2);
		assert_eq!(options.read_preference.tag_sets[0].get("dc").map(String::as_str), Some("ny"));
		assert!(options.read_preference.tag_sets[1].is_empty());
		assert_eq!(options.read_preference.max_staleness, Some(Duration::from_secs(120)));
		assert!(!options.retry_writes);
		assert_eq!(options.initial_topology_type(), TopologyType::ReplicaSetNoPrimary);
		#[cfg(feature = "compress")]
		assert_eq!(options.compressors, Some(vec![Compressor::Zstd]));
	}

	#[test]
	fn parse_without_path_or_options() {
		let options: ClientOptions = "mongodb://localhost".parse().unwrap();
		assert_eq!(options.hosts, vec![ServerAddress::new("localhost", DEFAULT_MONGO_PORT)]);
		assert_eq!(options.initial_topology_type(), TopologyType::Unknown);

		let options: ClientOptions = "mongodb://localhost:27017/?directConnection=true".parse().unwrap();
		assert_eq!(options.initial_topology_type(), TopologyType::Single);
	}

	#[test]
	fn unknown_options_are_ignored() {
		let options: ClientOptions = "mongodb://localhost/?fancyOption=1&appname=app".parse().unwrap();
		assert_eq!(options.appname.as_deref(), Some("app"));
	}

	#[test]
	fn malformed_seed_lists_are_rejected() {
		for uri in &[
			"localhost:27017",
			"mongodb://",
			"mongodb://host:notaport",
			"mongodb://host:0",
			"mongodb://a,b/?directConnection=true",
			"mongodb://a/?minPoolSize=10&maxPoolSize=5",
			"mongodb://a/?maxStalenessSeconds=10&readPreference=secondary",
			"mongodb://a/?maxStalenessSeconds=120",
			"mongodb://a/?heartbeatFrequencyMS=10",
			"mongodb://a/?retryReads=maybe",
		] {
			assert!(uri.parse::<ClientOptions>().is_err(), "{} should be rejected", uri);
		}
	}

	#[test]
	fn error_classification() {
		let io = Error::Io(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset"));
		assert!(io.is_network_error());
		assert!(io.is_retryable_read());
		assert!(io.is_retryable_write(17));

		let stepped_down = Error::Command(CommandError {
			code:      MongoError::from(189),
			code_name: Some("PrimarySteppedDown".to_string()),
			message:   "stepped down".to_string(),
			labels:    vec![]
		});
		assert!(stepped_down.is_state_change());
		assert!(!stepped_down.is_shutdown());
		assert!(stepped_down.is_retryable_read());
		assert!(stepped_down.is_retryable_write(8));
		assert!(!stepped_down.is_retryable_write(9));

		let labeled = Error::Command(CommandError {
			code:      MongoError::Other(1),
			code_name: None,
			message:   "labeled".to_string(),
			labels:    vec![RETRYABLE_WRITE_ERROR.to_string()]
		});
		assert!(labeled.is_retryable_write(17));
		assert!(!labeled.is_state_change());

		let duplicate = Error::Command(CommandError {
			code:      MongoError::DuplicateKey,
			code_name: None,
			message:   "dup".to_string(),
			labels:    vec![]
		});
		assert!(!duplicate.is_retryable_read());
		assert!(!duplicate.is_retryable_write(6));

		let auth = Error::ConnectionEstablishment {
			address: ServerAddress::new("a", 1),
			source:  Box::new(Error::Auth("bad password".to_string()))
		};
		assert!(!auth.is_network_error());
		assert!(!Error::WaitQueueTimeout(ServerAddress::new("a", 1)).is_retryable_read());
	}

	#[test]
	fn error_codes_round_trip() {
		for code in &[6, 7, 91, 189, 10107, 11600, 13436, 42] {
			assert_eq!(MongoError::from(*code).code(), *code);
		}
	}
}
