//! Data models for extracted statistics and per-URL ingestion records.
//!
//! This module defines the core data structures passed between the stages:
//! - [`PlayerStatistics`]: what the extraction engine produces for one page
//! - [`PlayerProfile`]: the name, position and role part of a page
//! - [`StatLine`] / [`SeasonLine`]: one row of the statistics table
//! - [`RoleMetrics`]: the role-specific pair of metrics (tagged by role)
//! - [`IngestRecord`]: the outbound record written for every processed URL
//!
//! Everything here is plain data; serialization uses `serde` so the records
//! can be written to the JSON sink as-is.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::IngestError;

/// Playing role, resolved once per page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Outfield,
    Goalkeeper,
}

impl Role {
    /// Zero-valued metrics for this role.
    pub fn empty_metrics(self) -> RoleMetrics {
        match self {
            Role::Outfield => RoleMetrics::Outfield {
                goals: 0,
                assists: 0,
            },
            Role::Goalkeeper => RoleMetrics::Goalkeeper {
                goals_conceded: 0,
                clean_sheets: 0,
            },
        }
    }
}

/// Metrics whose meaning depends on the player's role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum RoleMetrics {
    Outfield { goals: u32, assists: u32 },
    Goalkeeper { goals_conceded: u32, clean_sheets: u32 },
}

impl RoleMetrics {
    /// The pair stored in the `metric_a` / `metric_b` columns.
    pub fn as_pair(&self) -> (u32, u32) {
        match *self {
            RoleMetrics::Outfield { goals, assists } => (goals, assists),
            RoleMetrics::Goalkeeper {
                goals_conceded,
                clean_sheets,
            } => (goals_conceded, clean_sheets),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cards {
    pub yellow: u32,
    pub second_yellow: u32,
    pub red: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Substitutions {
    pub on: u32,
    pub off: u32,
}

/// One row of counters, used for both season rows and the totals footer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatLine {
    pub matches: u32,
    pub minutes: u32,
    pub cards: Cards,
    pub substitutions: Substitutions,
    pub own_goals: u32,
    pub metrics: RoleMetrics,
}

impl StatLine {
    pub fn empty(role: Role) -> Self {
        Self {
            matches: 0,
            minutes: 0,
            cards: Cards::default(),
            substitutions: Substitutions::default(),
            own_goals: 0,
            metrics: role.empty_metrics(),
        }
    }
}

/// A statistics row for a single tournament.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeasonLine {
    pub tournament: String,
    #[serde(flatten)]
    pub line: StatLine,
}

/// Everything extracted from one player-statistics page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerStatistics {
    /// Display name from the page headline; empty when the page has none.
    pub name: String,
    /// Position as printed on the page; empty when the page has none.
    pub position: String,
    pub role: Role,
    pub totals: StatLine,
    pub seasons: Vec<SeasonLine>,
}

impl PlayerStatistics {
    /// The "no stats yet" value persisted when a page's statistics table
    /// cannot be read but its profile can.
    pub fn without_rows(profile: PlayerProfile) -> Self {
        Self {
            name: profile.name,
            position: profile.position,
            role: profile.role,
            totals: StatLine::empty(profile.role),
            seasons: Vec::new(),
        }
    }

    #[cfg(test)]
    pub fn empty(role: Role) -> Self {
        Self::without_rows(PlayerProfile {
            name: String::new(),
            position: String::new(),
            role,
        })
    }
}

/// Name, position and role of a player page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerProfile {
    pub name: String,
    pub position: String,
    pub role: Role,
}

/// A raw page as returned by the fetch scheduler.
#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub url: String,
    pub status: u16,
    pub body: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Success,
    Failed,
}

/// Failure details carried by a failed [`IngestRecord`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub kind: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
}

impl From<&IngestError> for ErrorDetail {
    fn from(err: &IngestError) -> Self {
        Self {
            kind: err.kind().to_string(),
            message: err.to_string(),
            status_code: err.status_code(),
        }
    }
}

/// Outbound record, one per processed URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestRecord {
    pub url: String,
    pub status: RecordStatus,
    /// Player id, when the player row exists.
    pub entity_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub statistics: Option<PlayerStatistics>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,
    pub processed_at: DateTime<Utc>,
}

impl IngestRecord {
    pub fn success(url: &str, entity_id: i64, statistics: PlayerStatistics) -> Self {
        Self {
            url: url.to_string(),
            status: RecordStatus::Success,
            entity_id: Some(entity_id),
            statistics: Some(statistics),
            error: None,
            processed_at: Utc::now(),
        }
    }

    pub fn failed(url: &str, entity_id: Option<i64>, err: &IngestError) -> Self {
        Self {
            url: url.to_string(),
            status: RecordStatus::Failed,
            entity_id,
            statistics: None,
            error: Some(ErrorDetail::from(err)),
            processed_at: Utc::now(),
        }
    }

    /// Attach the statistics that were persisted despite the failure.
    pub fn with_statistics(mut self, statistics: PlayerStatistics) -> Self {
        self.statistics = Some(statistics);
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == RecordStatus::Success
    }
}
