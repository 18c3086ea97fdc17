//! Egress path selection.
//!
//! A crawl session starts on the direct path. When a request that is already
//! at its retry limit on the direct path gets rate limited, the router moves
//! the whole session to the anonymized exit, provided that exit exists and
//! its reachability probe passed. The switch is sticky: the session never
//! goes back to the direct path, since a source that has flagged our direct
//! address keeps it flagged. A request that exhausts its budget on the
//! anonymized exit fails on its own without moving the session.
//!
//! The router is plain state owned by one fetch scheduler. It performs no
//! I/O; the scheduler runs the probe and reports the result with
//! [`EgressRouter::record_probe`].

use serde::Serialize;
use std::fmt;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EgressPath {
    Direct,
    Anonymized,
}

impl fmt::Display for EgressPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EgressPath::Direct => f.write_str("direct"),
            EgressPath::Anonymized => f.write_str("anonymized"),
        }
    }
}

/// What happened to one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    RateLimited,
    OtherError,
}

/// The attempt being reported: which path it used and how many retries it
/// had already spent on that path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attempt {
    pub path: EgressPath,
    pub retry_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExitHealth {
    Unavailable,
    Unprobed,
    Healthy,
    Unhealthy,
}

#[derive(Debug, Clone)]
pub struct EgressRouter {
    path: EgressPath,
    /// A response has succeeded through the anonymized exit.
    confirmed: bool,
    exit: ExitHealth,
    retry_limit: u32,
}

impl EgressRouter {
    /// `anonymized_exit` says whether an anonymized exit is configured at
    /// all; it is still probed before first use.
    pub fn new(anonymized_exit: bool, retry_limit: u32) -> Self {
        Self {
            path: EgressPath::Direct,
            confirmed: false,
            exit: if anonymized_exit {
                ExitHealth::Unprobed
            } else {
                ExitHealth::Unavailable
            },
            retry_limit,
        }
    }

    pub fn current_path(&self) -> EgressPath {
        self.path
    }

    pub fn is_confirmed(&self) -> bool {
        self.confirmed
    }

    /// True when reporting `attempt` as rate limited would try to switch to
    /// an exit that has not been probed yet.
    pub fn needs_probe(&self, attempt: &Attempt) -> bool {
        self.exit == ExitHealth::Unprobed && self.would_switch(attempt)
    }

    pub fn record_probe(&mut self, healthy: bool) {
        if self.exit != ExitHealth::Unprobed {
            return;
        }
        self.exit = if healthy {
            info!("Anonymized exit passed reachability probe");
            ExitHealth::Healthy
        } else {
            warn!("Anonymized exit failed reachability probe; staying on direct path");
            ExitHealth::Unhealthy
        };
    }

    /// Feed back the outcome of an attempt. Returns the new path when the
    /// report moved the session onto a different path that the reporting
    /// request should retry on; `None` otherwise.
    pub fn report_outcome(&mut self, attempt: &Attempt, outcome: Outcome) -> Option<EgressPath> {
        match outcome {
            Outcome::Success => {
                if attempt.path == EgressPath::Anonymized && !self.confirmed {
                    info!("First response succeeded through anonymized exit");
                    self.confirmed = true;
                }
                None
            }
            Outcome::OtherError => None,
            Outcome::RateLimited => {
                if self.would_switch(attempt) && self.exit == ExitHealth::Healthy {
                    warn!(
                        retry_count = attempt.retry_count,
                        "Direct path rate limited at retry limit; switching to anonymized exit"
                    );
                    self.path = EgressPath::Anonymized;
                    return Some(EgressPath::Anonymized);
                }
                if attempt.path == EgressPath::Direct
                    && attempt.retry_count >= self.retry_limit
                    && self.path == EgressPath::Anonymized
                {
                    // The session already moved; this request follows it.
                    return Some(EgressPath::Anonymized);
                }
                None
            }
        }
    }

    fn would_switch(&self, attempt: &Attempt) -> bool {
        attempt.path == EgressPath::Direct
            && self.path == EgressPath::Direct
            && attempt.retry_count >= self.retry_limit
    }
}
