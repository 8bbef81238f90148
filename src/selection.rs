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

//! Server selection over a topology snapshot.
//!
//! see https://github.com/mongodb/specifications/blob/master/source/server-selection/server-selection.rst

use {
	crate::{
		*,
		server::{ServerDescription, ServerType},
		topology::{TopologyDescription, TopologyType}
	},
	std::{collections::HashMap, time::{Duration, SystemTime, UNIX_EPOCH}},
	rand::Rng
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectionCriteria {
	/// A server that accepts writes.
	Writable,
	ReadPreference(ReadPreference)
}

impl Default for SelectionCriteria {
	fn default() -> Self {
		Self::Writable
	}
}

impl From<ReadPreference> for SelectionCriteria {
	fn from(read_preference: ReadPreference) -> Self {
		Self::ReadPreference(read_preference)
	}
}

impl SelectionCriteria {
	/// Rejects read preferences no topology can ever satisfy.
	pub fn validate(&self, heartbeat_frequency: Duration) -> Result<()> {
		let read_preference = match self {
			Self::ReadPreference(read_preference) => read_preference,
			Self::Writable => return Ok(())
		};

		if read_preference.mode == ReadPreferenceMode::Primary
			&& (read_preference.max_staleness.is_some() || !read_preference.tag_sets.is_empty()) {
			return Err(Error::InvalidArgument("read preference `primary` cannot have tag sets or a max staleness".to_string()));
		}

		match read_preference.max_staleness {
			Some(max) if max < min_max_staleness(heartbeat_frequency) => Err(Error::InvalidArgument(format!(
				"max staleness of {}s is below the minimum of {}s",
				max.as_secs(), min_max_staleness(heartbeat_frequency).as_secs()))),
			_ => Ok(())
		}
	}
}

/// Servers matching the criteria, before the latency window is applied.
pub fn suitable_servers<'a>(topology: &'a TopologyDescription, criteria: &SelectionCriteria) -> Vec<&'a ServerDescription> {
	let of_type = |r#type: ServerType| topology.servers.values()
		.filter(move |server| server.r#type == r#type)
		.collect::<Vec<_>>();

	match topology.r#type {
		TopologyType::Unknown => Vec::new(),
		TopologyType::Single  => topology.servers.values().filter(|s| s.is_available()).collect(),
		TopologyType::Sharded => of_type(ServerType::Mongos),
		TopologyType::ReplicaSetWithPrimary | TopologyType::ReplicaSetNoPrimary => {
			let read_preference = match criteria {
				SelectionCriteria::Writable => return of_type(ServerType::RSPrimary),
				SelectionCriteria::ReadPreference(read_preference) => read_preference
			};

			let primaries = of_type(ServerType::RSPrimary);
			let eligible = |candidates: Vec<&'a ServerDescription>| filter_by_tags(
				filter_by_staleness(topology, candidates, read_preference.max_staleness),
				&read_preference.tag_sets
			);

			match read_preference.mode {
				ReadPreferenceMode::Primary            => primaries,
				ReadPreferenceMode::PrimaryPreferred   => if primaries.is_empty() {
					eligible(of_type(ServerType::RSSecondary))
				} else {
					primaries
				},
				ReadPreferenceMode::Secondary          => eligible(of_type(ServerType::RSSecondary)),
				ReadPreferenceMode::SecondaryPreferred => {
					let secondaries = eligible(of_type(ServerType::RSSecondary));
					if secondaries.is_empty() { primaries } else { secondaries }
				}
				ReadPreferenceMode::Nearest            => eligible(topology.servers.values()
					.filter(|s| matches!(s.r#type, ServerType::RSPrimary | ServerType::RSSecondary))
					.collect())
			}
		}
	}
}

/// Suitable servers within `local_threshold` of the fastest one.
pub fn select<'a>(topology: &'a TopologyDescription, criteria: &SelectionCriteria) -> Vec<&'a ServerDescription> {
	let mut candidates = suitable_servers(topology, criteria);
	let fastest = match candidates.iter().map(|s| s.avg_rtt.unwrap_or_default()).min() {
		Some(fastest) => fastest,
		None => return candidates
	};

	candidates.retain(|s| s.avg_rtt.unwrap_or_default() <= fastest + topology.local_threshold);
	candidates
}

/// Picks one candidate uniformly at random.
pub fn choose<'a>(candidates: &[&'a ServerDescription]) -> Option<&'a ServerDescription> {
	match candidates.len() {
		0 => None,
		1 => Some(candidates[0]),
		n => Some(candidates[rand::thread_rng().gen_range(0, n)])
	}
}

fn millis(time: SystemTime) -> i128 {
	match time.duration_since(UNIX_EPOCH) {
		Ok(d)  => d.as_millis() as i128,
		Err(e) => -(e.duration().as_millis() as i128)
	}
}

/// The estimated staleness of a secondary in milliseconds.
fn staleness(topology: &TopologyDescription, server: &ServerDescription) -> i128 {
	let heartbeat = topology.heartbeat_frequency.as_millis() as i128;
	let last_write = server.last_write_date.map_or(0, millis);

	match topology.primary() {
		Some(primary) => {
			let primary_write = primary.last_write_date.map_or(0, millis);
			(millis(server.last_update_time) - last_write)
				- (millis(primary.last_update_time) - primary_write)
				+ heartbeat
		}
		None => {
			let max_write = topology.servers.values()
				.filter(|s| s.r#type == ServerType::RSSecondary)
				.filter_map(|s| s.last_write_date)
				.map(millis)
				.max()
				.unwrap_or(last_write);
			max_write - last_write + heartbeat
		}
	}
}

fn filter_by_staleness<'a>(
	topology:      &TopologyDescription,
	mut servers:   Vec<&'a ServerDescription>,
	max_staleness: Option<Duration>
) -> Vec<&'a ServerDescription> {
	if let Some(max) = max_staleness {
		let max = max.as_millis() as i128;
		servers.retain(|s| s.r#type != ServerType::RSSecondary || staleness(topology, s) <= max);
	}
	servers
}

/// Keeps the servers matching the first tag set that matches any of them.
fn filter_by_tags<'a>(servers: Vec<&'a ServerDescription>, tag_sets: &[HashMap<String, String>]) -> Vec<&'a ServerDescription> {
	if tag_sets.is_empty() {
		return servers;
	}

	let matches = |server: &ServerDescription, tags: &HashMap<String, String>| tags.iter()
		.all(|(k, v)| server.tags.get(k) == Some(v));

	tag_sets.iter()
		.find(|tags| servers.iter().any(|s| matches(s, tags)))
		.map(|tags| servers.iter().copied().filter(|s| matches(s, tags)).collect())
		.unwrap_or_default()
}
