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
		*,
		apm::EventHandler,
		conn::ConnectionEstablisher,
		monitor::{self, MonitorHandle},
		pool::ConnectionPool,
		topology::TopologyInner,
		wire::{ClusterTime, ElectionId, HelloReply}
	},
	std::{collections::HashMap, sync::{Arc, Weak}, time::{Duration, SystemTime}},
	tracing::warn
};

/// see https://github.com/mongodb/specifications/blob/master/source/server-discovery-and-monitoring/server-discovery-and-monitoring.rst#servertype
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum ServerType {
	Standalone,
	Mongos,
	RSPrimary,
	RSSecondary,
	RSArbiter,
	RSOther,
	RSGhost,
	Unknown
}

impl Default for ServerType {
	fn default() -> Self {
		Self::Unknown
	}
}

impl ServerType {
	pub fn from_hello(reply: &HelloReply) -> Self {
		match reply {
			reply if !reply.is_ok()                                           => Self::Unknown,
			HelloReply { msg: Some(msg), .. } if msg == "isdbgrid"            => Self::Mongos,
			HelloReply { set_name: Some(_), is_writable_primary: true, .. }   => Self::RSPrimary,
			HelloReply { set_name: Some(_), secondary: true, .. }             => Self::RSSecondary,
			HelloReply { set_name: Some(_), arbiter_only: true, .. }          => Self::RSArbiter,
			HelloReply { set_name: Some(_), .. }                              => Self::RSOther,
			HelloReply { is_replica_set: true, .. }                           => Self::RSGhost,
			_                                                                 => Self::Standalone
		}
	}

	pub fn is_data_bearing(self) -> bool {
		matches!(self, Self::Standalone | Self::Mongos | Self::RSPrimary | Self::RSSecondary)
	}
}

/// see https://github.com/mongodb/specifications/blob/master/source/server-discovery-and-monitoring/server-discovery-and-monitoring.rst#serverdescription
#[derive(Debug, Clone, PartialEq)]
pub struct ServerDescription {
	pub address:                 ServerAddress,
	pub r#type:                  ServerType,
	pub last_rtt:                Option<Duration>,
	pub avg_rtt:                 Option<Duration>,
	pub last_update_time:        SystemTime,
	pub last_write_date:         Option<SystemTime>,
	pub min_wire_version:        i32,
	pub max_wire_version:        i32,
	pub me:                      Option<ServerAddress>,
	pub hosts:                   Vec<ServerAddress>,
	pub passives:                Vec<ServerAddress>,
	pub arbiters:                Vec<ServerAddress>,
	pub tags:                    HashMap<String, String>,
	pub set_name:                Option<String>,
	pub set_version:             Option<i32>,
	pub election_id:             Option<ElectionId>,
	pub primary:                 Option<ServerAddress>,
	pub logical_session_timeout: Option<Duration>,
	pub cluster_time:            Option<ClusterTime>,
	pub error:                   Option<String>
}

fn parse_addresses(hosts: &[String]) -> Vec<ServerAddress> {
	hosts.iter().filter_map(|host| match host.parse() {
		Ok(address) => Some(address),
		Err(e) => {
			warn!("ignoring invalid member address `{}`: {}", host, e);
			None
		}
	}).collect()
}

impl ServerDescription {
	/// The description of a server that has not been checked yet.
	pub fn unknown(address: ServerAddress) -> Self {
		Self {
			address,
			r#type:                  ServerType::Unknown,
			last_rtt:                None,
			avg_rtt:                 None,
			last_update_time:        SystemTime::now(),
			last_write_date:         None,
			min_wire_version:        0,
			max_wire_version:        0,
			me:                      None,
			hosts:                   Vec::new(),
			passives:                Vec::new(),
			arbiters:                Vec::new(),
			tags:                    HashMap::new(),
			set_name:                None,
			set_version:             None,
			election_id:             None,
			primary:                 None,
			logical_session_timeout: None,
			cluster_time:            None,
			error:                   None
		}
	}

	/// The description of a server whose check failed.
	pub fn failed(address: ServerAddress, error: &Error) -> Self {
		Self { error: Some(error.to_string()), ..Self::unknown(address) }
	}

	pub fn from_hello(address: ServerAddress, reply: &HelloReply, last_rtt: Duration, avg_rtt: Duration) -> Self {
		if let Some(error) = reply.error() {
			return Self::failed(address, &Error::Command(error));
		}

		Self {
			r#type:                  ServerType::from_hello(reply),
			last_rtt:                Some(last_rtt),
			avg_rtt:                 Some(avg_rtt),
			last_write_date:         reply.last_write.as_ref().map(|w| w.date()),
			min_wire_version:        reply.min_wire_version,
			max_wire_version:        reply.max_wire_version,
			me:                      reply.me.as_ref().and_then(|me| me.parse().ok()),
			hosts:                   parse_addresses(&reply.hosts),
			passives:                parse_addresses(&reply.passives),
			arbiters:                parse_addresses(&reply.arbiters),
			tags:                    reply.tags.clone(),
			set_name:                reply.set_name.clone(),
			set_version:             reply.set_version,
			election_id:             reply.election_id.clone(),
			primary:                 reply.primary.as_ref().and_then(|p| p.parse().ok()),
			logical_session_timeout: reply.logical_session_timeout_minutes
				.map(|m| Duration::from_secs(m.max(0) as u64 * 60)),
			cluster_time:            reply.cluster_time,
			..Self::unknown(address)
		}
	}

	pub fn is_available(&self) -> bool {
		self.r#type != ServerType::Unknown
	}

	pub fn is_data_bearing(&self) -> bool {
		self.r#type.is_data_bearing()
	}

	/// Every member this server reports, in hosts, passives, arbiters order.
	pub fn members(&self) -> impl Iterator<Item = &ServerAddress> {
		self.hosts.iter().chain(&self.passives).chain(&self.arbiters)
	}

	/// Equality ignoring the round trip times and timestamps, used to suppress change events.
	pub fn same_as(&self, other: &Self) -> bool {
		self.address == other.address
			&& self.r#type == other.r#type
			&& self.min_wire_version == other.min_wire_version
			&& self.max_wire_version == other.max_wire_version
			&& self.me == other.me
			&& self.hosts == other.hosts
			&& self.passives == other.passives
			&& self.arbiters == other.arbiters
			&& self.tags == other.tags
			&& self.set_name == other.set_name
			&& self.set_version == other.set_version
			&& self.election_id == other.election_id
			&& self.primary == other.primary
			&& self.logical_session_timeout == other.logical_session_timeout
			&& self.error == other.error
	}
}

/// Shared by every server of one topology.
#[derive(Debug)]
pub struct ServerContext {
	pub establisher:             ConnectionEstablisher,
	pub events:                  Arc<EventHandler>,
	pub pool_options:            ConnectionPoolOptions,
	pub heartbeat_frequency:     Duration,
	pub min_heartbeat_frequency: Duration
}

/// A known server with its connection pool and monitor.
#[derive(Debug)]
pub struct Server {
	pub address: ServerAddress,
	pub pool:    ConnectionPool,
	monitor:     MonitorHandle
}

impl Server {
	pub(crate) fn start(
		address:  ServerAddress,
		context:  &Arc<ServerContext>,
		topology: Weak<TopologyInner>
	) -> Result<Self> {
		let pool = ConnectionPool::new(
			address.clone(),
			context.pool_options,
			context.establisher.clone(),
			context.events.clone()
		)?;
		let monitor = monitor::spawn(address.clone(), context.clone(), topology)?;
		Ok(Self { address, pool, monitor })
	}

	/// Wakes the monitor for a check ahead of schedule.
	pub fn request_check(&self) {
		self.monitor.request_check();
	}

	pub fn close(&self) {
		self.monitor.stop();
		self.pool.close();
	}
}

#[cfg(test)]
mod tests {
	use {super::*, crate::test_util::*, rstest::rstest};

	#[rstest]
	#[case::mongos(HelloReply { msg: Some("isdbgrid".to_string()), ..standalone() }, ServerType::Mongos)]
	#[case::primary(primary("rs", &["a:1"], "a:1"), ServerType::RSPrimary)]
	#[case::secondary(secondary("rs", &["a:1"], "a:1"), ServerType::RSSecondary)]
	#[case::arbiter(HelloReply { secondary: false, arbiter_only: true, ..secondary("rs", &["a:1"], "a:1") }, ServerType::RSArbiter)]
	#[case::other(HelloReply { secondary: false, hidden: true, ..secondary("rs", &["a:1"], "a:1") }, ServerType::RSOther)]
	#[case::ghost(HelloReply { is_writable_primary: false, is_replica_set: true, ..standalone() }, ServerType::RSGhost)]
	#[case::standalone(standalone(), ServerType::Standalone)]
	#[case::failed(HelloReply { ok: 0f64, ..standalone() }, ServerType::Unknown)]
	fn server_type_derivation(#[case] reply: HelloReply, #[case] expected: ServerType) {
		assert_eq!(ServerType::from_hello(&reply), expected);
	}

	#[test]
	fn descriptions_from_replies() {
		let reply = HelloReply {
			hosts: vec!["A:1".to_string(), "b:2".to_string(), "bad:port".to_string()],
			..primary("rs", &[], "a:1")
		};
		let description = ServerDescription::from_hello(addr("a:1"), &reply, Duration::from_millis(3), Duration::from_millis(5));

		assert_eq!(description.r#type, ServerType::RSPrimary);
		assert_eq!(description.hosts, vec![addr("a:1"), addr("b:2")]);
		assert_eq!(description.me, Some(addr("a:1")));
		assert_eq!(description.avg_rtt, Some(Duration::from_millis(5)));
		assert_eq!(description.logical_session_timeout, Some(Duration::from_secs(30 * 60)));
		assert!(description.error.is_none());

		let failed = ServerDescription::from_hello(addr("a:1"), &HelloReply { ok: 0f64, ..reply }, Duration::from_millis(3), Duration::from_millis(5));
		assert_eq!(failed.r#type, ServerType::Unknown);
		assert!(failed.error.is_some());
	}

	#[test]
	fn equality_ignores_timing() {
		let reply = secondary("rs", &["a:1", "b:1"], "a:1");
		let a = ServerDescription::from_hello(addr("a:1"), &reply, Duration::from_millis(1), Duration::from_millis(1));
		let b = ServerDescription::from_hello(addr("a:1"), &reply, Duration::from_millis(9), Duration::from_millis(4));
		assert!(a.same_as(&b));
		assert_ne!(a, b);

		let c = ServerDescription { tags: vec![("dc".to_string(), "ny".to_string())].into_iter().collect(), ..b };
		assert!(!a.same_as(&c));
	}
}
