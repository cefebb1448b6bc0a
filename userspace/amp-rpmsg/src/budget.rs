// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0
//
//! CONTEXT: Budgeted polling for transmit buffers.
//!
//! A send that finds no free buffer polls in fixed intervals until one shows up or
//! the wait budget is spent. When the clock cannot tell time, each poll is charged
//! one interval instead.
//!
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Internal (crate public, but intended for in-tree use)
//! TEST_COVERAGE: Unit tests (host)

use core::time::Duration;

use crate::{Error, Result, Wait};

/// Clock source used for budgeted loops.
pub trait Clock: Send + Sync {
    /// Returns the current time in nanoseconds, or `None` if not available.
    fn now_ns(&self) -> Option<u64>;
    /// Sleeps for roughly `d`.
    fn sleep(&self, d: Duration);
    /// Cooperative yield to allow other work to make progress.
    fn yield_now(&self);
}

/// Host clock backed by `std::time::Instant`.
pub struct HostClock {
    start: std::time::Instant,
}

impl HostClock {
    /// Creates a new host clock.
    pub fn new() -> Self {
        Self { start: std::time::Instant::now() }
    }
}

impl Default for HostClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for HostClock {
    fn now_ns(&self) -> Option<u64> {
        Some(duration_to_ns(self.start.elapsed()))
    }

    fn sleep(&self, d: Duration) {
        std::thread::sleep(d);
    }

    fn yield_now(&self) {
        std::thread::yield_now();
    }
}

fn duration_to_ns(d: Duration) -> u64 {
    d.as_secs().saturating_mul(1_000_000_000).saturating_add(d.subsec_nanos() as u64)
}

/// Runs `attempt` until it yields a value or the budget of `wait` is spent.
///
/// Between attempts `idle` gets the first chance to wait for the peer; when it
/// returns false the loop sleeps one `interval`.
pub(crate) fn poll_budgeted<T>(
    clock: &dyn Clock,
    wait: Wait,
    interval: Duration,
    mut attempt: impl FnMut() -> Option<T>,
    mut idle: impl FnMut() -> bool,
) -> Result<T> {
    if let Some(v) = attempt() {
        return Ok(v);
    }
    let budget = wait.budget();
    if budget.is_zero() {
        return Err(Error::NoBuffer);
    }
    let deadline = clock.now_ns().map(|now| now.saturating_add(duration_to_ns(budget)));
    let mut charged = Duration::ZERO;
    loop {
        if !idle() {
            clock.sleep(interval);
        }
        charged = charged.saturating_add(interval);
        if let Some(v) = attempt() {
            return Ok(v);
        }
        let expired = match (deadline, clock.now_ns()) {
            (Some(deadline), Some(now)) => now >= deadline,
            _ => charged >= budget,
        };
        if expired {
            return Err(Error::NoBuffer);
        }
    }
}
