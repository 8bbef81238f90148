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
	crate::{Error, Result},
	std::{
		sync::{Arc, Condvar, MutexGuard, atomic::{AtomicBool, Ordering}},
		time::{Duration, Instant}
	}
};

/// How often a blocked wait looks at its cancellation token.
pub const CANCELLATION_CHECK_INTERVAL: Duration = Duration::from_millis(25);

/// A cheaply cloneable flag an application flips to abandon an operation.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn cancel(&self) {
		self.0.store(true, Ordering::Release);
	}

	pub fn is_cancelled(&self) -> bool {
		self.0.load(Ordering::Acquire)
	}
}

/// The end-to-end time budget of one operation, shared by every stage it passes through.
#[derive(Debug, Clone, Default)]
pub struct Deadline {
	at:    Option<Instant>,
	token: Option<CancellationToken>
}

impl Deadline {
	pub fn none() -> Self {
		Self::default()
	}

	pub fn after(timeout: Duration) -> Self {
		Self { at: Some(Instant::now() + timeout), token: None }
	}

	pub fn at(at: Instant) -> Self {
		Self { at: Some(at), token: None }
	}

	pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
		self.token = Some(token);
		self
	}

	/// The earlier of this deadline and `bound`.
	pub fn min(&self, bound: Option<Instant>) -> Option<Instant> {
		match (self.at, bound) {
			(Some(a), Some(b)) => Some(a.min(b)),
			(a, b)             => a.or(b)
		}
	}

	/// This deadline, tightened to expire at most `timeout` from now.
	pub fn bounded(&self, timeout: Duration) -> Self {
		Self { at: self.min(Some(Instant::now() + timeout)), token: self.token.clone() }
	}

	/// Time left, `None` if unbounded.
	pub fn remaining(&self) -> Option<Duration> {
		self.at.map(|at| at.saturating_duration_since(Instant::now()))
	}

	pub fn is_cancelled(&self) -> bool {
		self.token.as_ref().map_or(false, CancellationToken::is_cancelled)
	}

	/// Whether a cancellation token is attached.
	pub fn is_cancellable(&self) -> bool {
		self.token.is_some()
	}

	/// Fails if the operation was cancelled or ran out of time.
	pub fn check(&self) -> Result<()> {
		if self.is_cancelled() {
			Err(Error::Cancelled)
		} else if self.at.map_or(false, |at| Instant::now() >= at) {
			Err(Error::DeadlineExceeded)
		} else {
			Ok(())
		}
	}

	/// Blocks on `condvar` until notified, `until` passes or the token fires.
	///
	/// Returns the guard and whether `until` has passed. Waits are sliced while a token is
	/// attached so cancellation is observed without a notification.
	pub fn wait<'a, T>(
		&self,
		condvar: &Condvar,
		guard:   MutexGuard<'a, T>,
		until:   Option<Instant>
	) -> Result<(MutexGuard<'a, T>, bool)> {
		let now = Instant::now();
		let mut timeout = match until {
			Some(until) if until <= now => return Ok((guard, true)),
			Some(until)                 => Some(until - now),
			None                        => None
		};

		if self.is_cancellable() {
			timeout = Some(timeout.map_or(CANCELLATION_CHECK_INTERVAL, |t| t.min(CANCELLATION_CHECK_INTERVAL)));
		}

		let guard = match timeout {
			Some(timeout) => condvar.wait_timeout(guard, timeout)?.0,
			None          => condvar.wait(guard)?
		};
		Ok((guard, until.map_or(false, |until| Instant::now() >= until)))
	}
}
