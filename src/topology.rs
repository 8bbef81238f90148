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
		apm::{Event, EventHandler},
		conn::ConnectionEstablisher,
		selection::{self, SelectionCriteria},
		server::{Server, ServerContext, ServerDescription, ServerType},
		wire::{self, ClusterTime, ElectionId}
	},
	std::{
		collections::{BTreeMap, BTreeSet},
		ops::Deref,
		sync::{Arc, Condvar, Mutex, RwLock, atomic::{AtomicBool, Ordering}},
		time::{Duration, Instant}
	},
	tracing::{debug, info}
};

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TopologyType {
	Single,
	ReplicaSetNoPrimary,
	ReplicaSetWithPrimary,
	Sharded,
	Unknown
}

impl Default for TopologyType {
	fn default() -> Self {
		Self::Unknown
	}
}

/// see https://github.com/mongodb/specifications/blob/master/source/server-discovery-and-monitoring/server-discovery-and-monitoring.rst#topologydescription
#[derive(Debug, Clone, PartialEq)]
pub struct TopologyDescription {
	pub r#type:                  TopologyType,
	pub servers:                 BTreeMap<ServerAddress, ServerDescription>,
	pub set_name:                Option<String>,
	pub max_set_version:         Option<i32>,
	pub max_election_id:         Option<ElectionId>,
	pub cluster_time:            Option<ClusterTime>,
	pub compatibility_error:     Option<CompatibilityError>,
	/// The smallest timeout of the data bearing servers, `None` if any of them lacks one.
	pub logical_session_timeout: Option<Duration>,
	pub heartbeat_frequency:     Duration,
	pub local_threshold:         Duration,
	pub max_hosts:               usize
}

impl TopologyDescription {
	/// The initial description, holding an unknown description per seed.
	pub fn new(options: &ClientOptions) -> Self {
		Self {
			r#type:                  options.initial_topology_type(),
			servers:                 options.hosts.iter()
				.map(|address| (address.clone(), ServerDescription::unknown(address.clone())))
				.collect(),
			set_name:                options.replica_set.clone(),
			max_set_version:         None,
			max_election_id:         None,
			cluster_time:            None,
			compatibility_error:     None,
			logical_session_timeout: None,
			heartbeat_frequency:     options.server_selection_config.heartbeat_frequency,
			local_threshold:         options.server_selection_config.local_threshold,
			max_hosts:               options.max_hosts
		}
	}

	pub fn primary(&self) -> Option<&ServerDescription> {
		self.servers.values().find(|s| s.r#type == ServerType::RSPrimary)
	}

	/// Whether the servers support sessions, judged by the logical session timeout.
	pub fn supports_sessions(&self) -> bool {
		self.logical_session_timeout.is_some()
	}

	/// Equality ignoring round trip times and timestamps.
	pub fn same_as(&self, other: &Self) -> bool {
		self.r#type == other.r#type
			&& self.set_name == other.set_name
			&& self.compatibility_error == other.compatibility_error
			&& self.servers.len() == other.servers.len()
			&& self.servers.iter().zip(&other.servers).all(|((a, x), (b, y))| a == b && x.same_as(y))
	}

	/// The description after observing `description`.
	///
	/// Descriptions of servers that are no longer part of the topology are ignored.
	pub fn apply(&self, description: ServerDescription) -> Self {
		let mut next = self.clone();
		next.update(description);
		next
	}

	pub fn advance_cluster_time(&mut self, cluster_time: ClusterTime) {
		if self.cluster_time.map_or(true, |current| cluster_time > current) {
			self.cluster_time = Some(cluster_time);
		}
	}

	/// Updates this topology according to
	/// https://github.com/mongodb/specifications/blob/master/source/server-discovery-and-monitoring/server-discovery-and-monitoring.rst
	fn update(&mut self, description: ServerDescription) {
		if !self.servers.contains_key(&description.address) {
			return;
		}

		if let Some(cluster_time) = description.cluster_time {
			self.advance_cluster_time(cluster_time);
		}

		let address = description.address.clone();
		let server_type = description.r#type;
		self.servers.insert(address.clone(), description.clone());

		match (self.r#type, server_type) {
			// a direct connection never changes shape, it only guards against the wrong set
			(TopologyType::Single, _) => if self.set_name.is_some()
				&& server_type != ServerType::Unknown
				&& description.set_name != self.set_name {
				self.servers.insert(address.clone(), ServerDescription {
					error: Some(format!("expected replica set `{}`", self.set_name.as_deref().unwrap_or_default())),
					..ServerDescription::unknown(address)
				});
			},
			// no-op
			(TopologyType::Unknown, ServerType::Unknown)
			| (TopologyType::Unknown, ServerType::RSGhost)
			| (TopologyType::Sharded, ServerType::Unknown)
			| (TopologyType::Sharded, ServerType::Mongos)
			| (TopologyType::ReplicaSetNoPrimary, ServerType::Unknown)
			| (TopologyType::ReplicaSetNoPrimary, ServerType::RSGhost) => (),
			// remove
			(TopologyType::Sharded, _)
			| (TopologyType::ReplicaSetNoPrimary, ServerType::Standalone)
			| (TopologyType::ReplicaSetNoPrimary, ServerType::Mongos) => {
				self.servers.remove(&address);
			}
			(TopologyType::ReplicaSetWithPrimary, ServerType::Standalone)
			| (TopologyType::ReplicaSetWithPrimary, ServerType::Mongos) => {
				self.servers.remove(&address);
				self.check_if_has_primary();
			}
			// update topology type
			(TopologyType::Unknown, ServerType::Standalone) => self.update_unknown_with_standalone(&address),
			(TopologyType::Unknown, ServerType::Mongos)     => self.r#type = TopologyType::Sharded,
			// updateRSFromPrimary
			(TopologyType::Unknown, ServerType::RSPrimary)
			| (TopologyType::ReplicaSetNoPrimary, ServerType::RSPrimary)
			| (TopologyType::ReplicaSetWithPrimary, ServerType::RSPrimary) => self.update_rs_from_primary(&description),
			// updateRSWithoutPrimary
			(TopologyType::Unknown, ServerType::RSSecondary)
			| (TopologyType::Unknown, ServerType::RSArbiter)
			| (TopologyType::Unknown, ServerType::RSOther)
			| (TopologyType::ReplicaSetNoPrimary, ServerType::RSSecondary)
			| (TopologyType::ReplicaSetNoPrimary, ServerType::RSArbiter)
			| (TopologyType::ReplicaSetNoPrimary, ServerType::RSOther) => {
				self.r#type = TopologyType::ReplicaSetNoPrimary;
				self.update_rs_without_primary(&description);
			}
			// updateRSWithPrimaryFromMember
			(TopologyType::ReplicaSetWithPrimary, ServerType::RSSecondary)
			| (TopologyType::ReplicaSetWithPrimary, ServerType::RSArbiter)
			| (TopologyType::ReplicaSetWithPrimary, ServerType::RSOther) => self.update_rs_with_primary_from_member(&description),
			(TopologyType::ReplicaSetWithPrimary, ServerType::Unknown)
			| (TopologyType::ReplicaSetWithPrimary, ServerType::RSGhost) => self.check_if_has_primary()
		}

		self.update_compatibility();
		self.update_logical_session_timeout();
	}

	fn update_unknown_with_standalone(&mut self, address: &ServerAddress) {
		if self.servers.len() == 1 {
			self.r#type = TopologyType::Single;
		} else {
			self.servers.remove(address);
		}
	}

	fn update_rs_from_primary(&mut self, description: &ServerDescription) {
		// update set name

		if self.set_name.is_none() {
			self.set_name = description.set_name.clone();
		} else if self.set_name != description.set_name {
			self.servers.remove(&description.address);
			self.check_if_has_primary();
			return;
		}

		// update setVersion and electionId, missing ids compare lowest

		if description.election_id.is_some() || description.set_version.is_some() {
			let incoming = (description.election_id.clone(), description.set_version);
			let max = (self.max_election_id.clone(), self.max_set_version);

			if incoming < max {
				self.servers.insert(description.address.clone(), ServerDescription {
					error: Some("primary marked stale due to an older election".to_string()),
					..ServerDescription::unknown(description.address.clone())
				});
				self.check_if_has_primary();
				return;
			}

			self.max_election_id = incoming.0;
			self.max_set_version = incoming.1;
		}

		// invalidate old primaries

		let stale = self.servers.values()
			.filter(|s| s.r#type == ServerType::RSPrimary && s.address != description.address)
			.map(|s| s.address.clone())
			.collect::<Vec<_>>();
		for address in stale {
			self.servers.insert(address.clone(), ServerDescription::unknown(address));
		}

		// the primary's view of the membership is authoritative

		let members = description.members().cloned().collect::<BTreeSet<_>>();
		self.servers.retain(|address, _| members.contains(address));
		self.add_members(description);
		self.check_if_has_primary();
	}

	fn update_rs_without_primary(&mut self, description: &ServerDescription) {
		if self.set_name.is_none() {
			self.set_name = description.set_name.clone();
		} else if self.set_name != description.set_name {
			self.servers.remove(&description.address);
			return;
		}

		self.add_members(description);

		if description.me.as_ref().map_or(false, |me| me != &description.address) {
			self.servers.remove(&description.address);
		}
	}

	fn update_rs_with_primary_from_member(&mut self, description: &ServerDescription) {
		if self.set_name != description.set_name
			|| description.me.as_ref().map_or(false, |me| me != &description.address) {
			self.servers.remove(&description.address);
		}

		self.check_if_has_primary();
	}

	/// Adds the members a description reports, up to `max_hosts` servers.
	fn add_members(&mut self, description: &ServerDescription) {
		for address in description.members() {
			if self.servers.len() >= self.max_hosts {
				debug!(%address, max_hosts = self.max_hosts, "not adding member, topology is full");
				break;
			}

			if !self.servers.contains_key(address) {
				self.servers.insert(address.clone(), ServerDescription::unknown(address.clone()));
			}
		}
	}

	/// Checks if this topology has a primary, setting the type to `no primary` if none has been found.
	fn check_if_has_primary(&mut self) {
		self.r#type = match self.primary() {
			Some(_) => TopologyType::ReplicaSetWithPrimary,
			None    => TopologyType::ReplicaSetNoPrimary
		};
	}

	fn update_compatibility(&mut self) {
		self.compatibility_error = None;
		let mut lower: Option<&ServerDescription> = None;
		let mut upper: Option<&ServerDescription> = None;

		for server in self.servers.values().filter(|s| s.is_available()) {
			if server.min_wire_version > wire::MAX_WIRE_VERSION {
				self.compatibility_error = Some(CompatibilityError::ServerTooNew {
					address:          server.address.clone(),
					min_wire_version: server.min_wire_version,
					driver_max:       wire::MAX_WIRE_VERSION
				});
				return;
			}

			if server.max_wire_version < wire::MIN_WIRE_VERSION {
				self.compatibility_error = Some(CompatibilityError::ServerTooOld {
					address:          server.address.clone(),
					max_wire_version: server.max_wire_version,
					driver_min:       wire::MIN_WIRE_VERSION
				});
				return;
			}

			if lower.map_or(true, |l| server.min_wire_version > l.min_wire_version) {
				lower = Some(server);
			}

			if upper.map_or(true, |u| server.max_wire_version < u.max_wire_version) {
				upper = Some(server);
			}
		}

		if let (Some(lower), Some(upper)) = (lower, upper) {
			if lower.min_wire_version > upper.max_wire_version {
				self.compatibility_error = Some(CompatibilityError::Disjoint {
					a: lower.address.clone(),
					b: upper.address.clone()
				});
			}
		}
	}

	fn update_logical_session_timeout(&mut self) {
		let mut data_bearing = self.servers.values().filter(|s| s.is_data_bearing()).peekable();
		self.logical_session_timeout = match data_bearing.peek() {
			None    => None,
			Some(_) => data_bearing
				.map(|s| s.logical_session_timeout)
				.fold(Some(Duration::from_secs(u64::MAX)), |acc, t| match (acc, t) {
					(Some(acc), Some(t)) => Some(acc.min(t)),
					_                    => None
				})
		};
	}
}

#[derive(Debug)]
struct TopologyState {
	description: Arc<TopologyDescription>,
	servers:     BTreeMap<ServerAddress, Arc<Server>>
}

#[derive(Debug)]
pub struct TopologyInner {
	context:                  Arc<ServerContext>,
	events:                   Arc<EventHandler>,
	server_selection_timeout: Duration,
	state:                    RwLock<TopologyState>,
	/// Bumped after every description change, waited on by server selection.
	revision:                 Mutex<u64>,
	condvar:                  Condvar,
	closed:                   AtomicBool
}

/// The live view of a deployment: the current description and a [`Server`] per known member.
#[derive(Debug, Clone)]
pub struct Topology(pub(crate) Arc<TopologyInner>);

impl Deref for Topology {
	type Target = TopologyInner;

	fn deref(&self) -> &Self::Target {
		&self.0
	}
}

impl Topology {
	/// Builds the seed topology and starts monitoring every seed.
	pub fn new(options: &ClientOptions, establisher: ConnectionEstablisher, events: Arc<EventHandler>) -> Result<Self> {
		let description = TopologyDescription::new(options);
		let context = Arc::new(ServerContext {
			establisher,
			events:                  events.clone(),
			pool_options:            options.pool_options,
			heartbeat_frequency:     options.server_selection_config.heartbeat_frequency,
			min_heartbeat_frequency: options.server_selection_config.min_heartbeat_frequency
		});

		let self_ = Self(Arc::new(TopologyInner {
			context,
			events,
			server_selection_timeout: options.server_selection_config.server_selection_timeout,
			state:                    RwLock::new(TopologyState {
				description: Arc::new(description.clone()),
				servers:     BTreeMap::new()
			}),
			revision:                 Mutex::new(0),
			condvar:                  Condvar::new(),
			closed:                   AtomicBool::new(false)
		}));

		self_.events.emit(Event::TopologyOpening);
		{
			let mut state = self_.state.write()?;
			for address in description.servers.keys() {
				self_.events.emit(Event::ServerOpening { address });
				let server = Server::start(address.clone(), &self_.context, Arc::downgrade(&self_.0))?;
				state.servers.insert(address.clone(), Arc::new(server));
			}
		}

		Ok(self_)
	}

	pub fn description(&self) -> Result<Arc<TopologyDescription>> {
		Ok(self.state.read()?.description.clone())
	}

	pub fn server(&self, address: &ServerAddress) -> Result<Option<Arc<Server>>> {
		Ok(self.state.read()?.servers.get(address).cloned())
	}

	/// Applies a server description produced by a successful check, readying the server's pool.
	pub fn update(&self, description: ServerDescription) -> Result<()> {
		self.apply(description, None)
	}

	/// Marks a server unknown after `error`, clearing its pool with `error` as the cause if asked to.
	pub fn mark_server_unknown(&self, address: &ServerAddress, error: &Error, clear_pool: bool) -> Result<()> {
		self.apply(ServerDescription::failed(address.clone(), error), if clear_pool { Some(error) } else { None })
	}

	fn apply(&self, description: ServerDescription, clear_pool: Option<&Error>) -> Result<()> {
		if self.closed.load(Ordering::SeqCst) {
			return Ok(());
		}

		let address = description.address.clone();

		// a pool must accept checkouts before selection can see its server
		if description.is_available() {
			if let Some(server) = self.server(&address)? {
				server.pool.mark_ready()?;
			}
		}

		let mut state = self.state.write()?;
		let previous = state.description.clone();
		if !previous.servers.contains_key(&address) {
			return Ok(());
		}

		let next = Arc::new(previous.apply(description));

		let removed = state.servers.keys()
			.filter(|address| !next.servers.contains_key(*address))
			.cloned()
			.collect::<Vec<_>>();
		let removed = removed.into_iter()
			.filter_map(|address| state.servers.remove(&address))
			.collect::<Vec<_>>();

		let added = next.servers.keys()
			.filter(|address| !state.servers.contains_key(*address))
			.cloned()
			.collect::<Vec<_>>();
		for address in &added {
			let server = Server::start(address.clone(), &self.context, Arc::downgrade(&self.0))?;
			state.servers.insert(address.clone(), Arc::new(server));
		}

		state.description = next.clone();
		let server = state.servers.get(&address).cloned();
		drop(state);

		for server in &removed {
			debug!(address = %server.address, "server removed from topology");
			server.close();
		}

		if let (Some(server), Some(cause)) = (&server, clear_pool) {
			server.pool.clear(cause)?;
		}

		self.bump_revision()?;

		// events

		for server in &removed {
			self.events.emit(Event::ServerClosed { address: &server.address });
		}

		for address in &added {
			debug!(%address, "server added to topology");
			self.events.emit(Event::ServerOpening { address });
		}

		if let (Some(old), Some(new)) = (previous.servers.get(&address), next.servers.get(&address)) {
			if !old.same_as(new) {
				self.events.emit(Event::ServerDescriptionChanged { address: &address, previous: old, new });
			}
		}

		if previous.r#type != next.r#type {
			info!(from = ?previous.r#type, to = ?next.r#type, "topology type changed");
		}

		if !previous.same_as(&next) {
			self.events.emit(Event::TopologyDescriptionChanged { previous: &previous, new: &next });
		}

		Ok(())
	}

	fn bump_revision(&self) -> Result<()> {
		*self.revision.lock()? += 1;
		self.condvar.notify_all();
		Ok(())
	}

	/// Updates the SDAM state after an operation failed on `address`.
	///
	/// `generation` is the pool generation of the connection the error came from; errors of
	/// connections that predate the last clear are ignored.
	pub fn handle_application_error(
		&self,
		address:          &ServerAddress,
		error:            &Error,
		generation:       Option<u64>,
		max_wire_version: i32
	) -> Result<()> {
		let server = match self.server(address)? {
			Some(server) => server,
			None => return Ok(())
		};

		if generation.map_or(false, |g| g < server.pool.generation().unwrap_or(0)) {
			debug!(%address, %error, "ignoring error from a stale connection");
			return Ok(());
		}

		match error {
			// the pool has already been cleared
			Error::PoolCleared(_) => Ok(()),
			e if e.is_network_error() => {
				self.mark_server_unknown(address, e, true)?;
				server.request_check();
				Ok(())
			}
			e if e.is_state_change() => {
				self.mark_server_unknown(address, e, e.is_shutdown() || max_wire_version < 8)?;
				server.request_check();
				Ok(())
			}
			_ => Ok(())
		}
	}

	pub fn request_immediate_check(&self) -> Result<()> {
		for server in self.state.read()?.servers.values() {
			server.request_check();
		}
		Ok(())
	}

	pub fn advance_cluster_time(&self, cluster_time: ClusterTime) -> Result<()> {
		let mut state = self.state.write()?;
		if state.description.cluster_time.map_or(true, |current| cluster_time > current) {
			let mut description = (*state.description).clone();
			description.advance_cluster_time(cluster_time);
			state.description = Arc::new(description);
		}
		Ok(())
	}

	/// Selects a server matching `criteria`, waiting for topology changes until one appears, the
	/// server selection timeout passes or the deadline expires.
	pub fn select_server(&self, criteria: &SelectionCriteria, deadline: &Deadline) -> Result<Arc<Server>> {
		let until = deadline.min(Some(Instant::now() + self.server_selection_timeout));
		let mut checked = false;

		loop {
			if self.closed.load(Ordering::SeqCst) {
				return Err(Error::Shutdown);
			}

			let revision = *self.revision.lock()?;
			let description = {
				let state = self.state.read()?;
				criteria.validate(state.description.heartbeat_frequency)?;
				if let Some(e) = &state.description.compatibility_error {
					return Err(Error::Incompatible(e.clone()));
				}

				let candidates = selection::select(&state.description, criteria);
				if let Some(server) = selection::choose(&candidates).and_then(|s| state.servers.get(&s.address)) {
					return Ok(server.clone());
				}
				state.description.clone()
			};

			if !checked {
				self.request_immediate_check()?;
				checked = true;
			}

			let mut current = self.revision.lock()?;
			while *current == revision {
				if let Err(Error::Cancelled) = deadline.check() {
					return Err(Error::Cancelled);
				}

				let (guard, timed_out) = deadline.wait(&self.condvar, current, until)?;
				current = guard;
				if timed_out && *current == revision {
					return Err(Error::ServerSelectionTimeout(format!(
						"no server matches {:?}, topology is {:?} with servers {:?}",
						criteria,
						description.r#type,
						description.servers.values().map(|s| (&s.address, s.r#type)).collect::<Vec<_>>()
					)));
				}
			}
		}
	}

	/// Stops every monitor and closes every pool.
	pub fn close(&self) -> Result<()> {
		if self.closed.swap(true, Ordering::SeqCst) {
			return Ok(());
		}

		let servers = std::mem::take(&mut self.state.write()?.servers);
		for server in servers.values() {
			server.close();
			self.events.emit(Event::ServerClosed { address: &server.address });
		}

		self.bump_revision()?;
		self.events.emit(Event::TopologyClosed);
		Ok(())
	}
}
