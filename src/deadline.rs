//! Call deadlines and the guard that enforces them around a handler.

use crate::Error;
use chrono::{DateTime, Utc};
use std::fmt;
use std::future::Future;
use std::time::Duration;

/// Deadline used when the platform sends none.
pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(30);

/// Absolute point in time after which the platform considers a call failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Deadline(DateTime<Utc>);

impl Deadline {
    /// Parse an ISO-8601 (RFC 3339) timestamp such as
    /// `2024-04-01T12:00:30.123456+00:00`.
    pub fn parse(s: &str) -> Result<Self, Error> {
        DateTime::parse_from_rfc3339(s.trim())
            .map(|d| Deadline(d.with_timezone(&Utc)))
            .map_err(|e| Error::Deadline(format!("{:?}: {}", s, e)))
    }

    /// The default deadline for a call accepted at `accepted_at`.
    pub fn default_from(accepted_at: DateTime<Utc>) -> Self {
        Deadline(accepted_at + chrono::Duration::seconds(DEFAULT_DEADLINE.as_secs() as i64))
    }

    pub fn at(&self) -> DateTime<Utc> {
        self.0
    }

    /// Execution window left from now.
    pub fn window(&self) -> Duration {
        self.window_at(Utc::now())
    }

    /// Execution window left at `now`, in whole seconds rounded down.
    ///
    /// A deadline in the past gives a zero window, never a negative one.
    pub fn window_at(&self, now: DateTime<Utc>) -> Duration {
        let delta = self.0.signed_duration_since(now);
        Duration::from_secs(delta.num_seconds().max(0) as u64)
    }
}

impl fmt::Display for Deadline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}

/// Runs one handler invocation at a time inside its deadline.
///
/// `run` borrows the guard mutably, so an execution context owning a guard
/// can have at most one armed timer. The timer is disarmed on every exit
/// path, including when the `run` future itself is dropped.
#[derive(Debug, Default)]
pub struct DeadlineGuard {
    armed: bool,
}

impl DeadlineGuard {
    pub fn new() -> Self {
        DeadlineGuard::default()
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    /// Drive `call` to completion, or abandon it once `deadline` passes.
    ///
    /// Expiry yields `Error::Timeout`. Abandoning drops the call future; side
    /// effects it already had are not undone.
    pub async fn run<F>(&mut self, deadline: &Deadline, call: F) -> Result<F::Output, Error>
    where
        F: Future,
    {
        let window = deadline.window();

        let armed = Armed::arm(&mut self.armed, window);

        let ret = async_std::future::timeout(window, call).await;

        drop(armed);

        ret.map_err(|_| {
            debug!("Deadline {} expired", deadline);
            Error::Timeout(window)
        })
    }
}

struct Armed<'a>(&'a mut bool);

impl<'a> Armed<'a> {
    fn arm(flag: &'a mut bool, window: Duration) -> Self {
        // run() takes &mut self, so this only trips on a leaked Armed.
        debug_assert!(!*flag, "Deadline guard armed twice");
        trace!("Arm deadline guard: {}s", window.as_secs());
        *flag = true;
        Armed(flag)
    }
}

impl Drop for Armed<'_> {
    fn drop(&mut self) {
        trace!("Disarm deadline guard");
        *self.0 = false;
    }
}
