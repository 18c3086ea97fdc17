//! SQLite persistence gateway for teams, players, tournaments and stats.
//!
//! Tables:
//! - teams: one row per team page, keyed by `source_url`
//! - players: one row per player page, keyed by `source_url`
//! - tournaments: unique per `(name, season)`
//! - player_tournament_stats: one row per `(player_id, tournament_id)`,
//!   replaced wholesale on every ingestion of the player
//!
//! Every write runs in its own transaction. Nothing here is held across a
//! network await; the session calls in between fetches.

use rusqlite::{Connection, OptionalExtension, Transaction, params};
use std::path::Path;
use tracing::{debug, info, instrument};

use crate::error::StoreError;
use crate::models::SeasonLine;
use crate::utils::fallback_display_name;

const UNKNOWN_POSITION: &str = "unknown";
const UNKNOWN_NAME: &str = "Unknown";

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS teams (
    team_id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    source_url TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS players (
    player_id INTEGER PRIMARY KEY AUTOINCREMENT,
    team_id INTEGER NOT NULL REFERENCES teams(team_id),
    source_url TEXT NOT NULL UNIQUE,
    full_name TEXT NOT NULL,
    position TEXT NOT NULL DEFAULT 'unknown'
);

CREATE TABLE IF NOT EXISTS tournaments (
    tournament_id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    season TEXT NOT NULL,
    UNIQUE(name, season)
);

CREATE TABLE IF NOT EXISTS player_tournament_stats (
    player_id INTEGER NOT NULL REFERENCES players(player_id),
    tournament_id INTEGER NOT NULL REFERENCES tournaments(tournament_id),
    matches INTEGER NOT NULL DEFAULT 0,
    minutes INTEGER NOT NULL DEFAULT 0,
    metric_a INTEGER NOT NULL DEFAULT 0,
    metric_b INTEGER NOT NULL DEFAULT 0,
    yellow_cards INTEGER NOT NULL DEFAULT 0,
    red_cards INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (player_id, tournament_id)
);

CREATE INDEX IF NOT EXISTS idx_players_team ON players(team_id);
"#;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeamRow {
    pub team_id: i64,
    pub name: String,
    pub source_url: String,
}

#[cfg(test)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerRow {
    pub player_id: i64,
    pub team_id: i64,
    pub source_url: String,
    pub full_name: String,
    pub position: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TournamentRow {
    pub tournament_id: i64,
    pub name: String,
    pub season: String,
}

/// A stored stat row joined with its tournament name.
#[cfg(test)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatRow {
    pub tournament: String,
    pub season: String,
    pub matches: u32,
    pub minutes: u32,
    pub metric_a: u32,
    pub metric_b: u32,
    pub yellow_cards: u32,
    pub red_cards: u32,
}

/// Summed columns for one tournament, ready to insert.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct StatInsert {
    tournament: String,
    matches: u32,
    minutes: u32,
    metric_a: u32,
    metric_b: u32,
    yellow_cards: u32,
    red_cards: u32,
}

impl StatInsert {
    fn add(&mut self, row: &SeasonLine) {
        let (a, b) = row.line.metrics.as_pair();
        self.matches = self.matches.saturating_add(row.line.matches);
        self.minutes = self.minutes.saturating_add(row.line.minutes);
        self.metric_a = self.metric_a.saturating_add(a);
        self.metric_b = self.metric_b.saturating_add(b);
        self.yellow_cards = self.yellow_cards.saturating_add(row.line.cards.yellow);
        self.red_cards = self.red_cards.saturating_add(row.line.cards.red);
    }
}

/// Collapse rows naming the same tournament into one, keeping first-seen order.
fn merge_by_tournament(rows: &[SeasonLine]) -> Vec<StatInsert> {
    let mut merged: Vec<StatInsert> = Vec::new();
    for row in rows {
        let tournament = row.tournament.trim();
        if tournament.is_empty() {
            continue;
        }
        match merged.iter_mut().find(|m| m.tournament == tournament) {
            Some(existing) => existing.add(row),
            None => {
                let mut fresh = StatInsert {
                    tournament: tournament.to_string(),
                    ..StatInsert::default()
                };
                fresh.add(row);
                merged.push(fresh);
            }
        }
    }
    merged
}

pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open (or create) the database file and make sure the schema exists.
    #[instrument(level = "info", skip_all, fields(path = %path.display()))]
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Validation(format!(
                    "cannot create database directory {}: {e}",
                    parent.display()
                ))
            })?;
        }
        let store = Self::init(Connection::open(path)?)?;
        info!("Opened statistics database");
        Ok(store)
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    fn transaction(&self) -> rusqlite::Result<Transaction<'_>> {
        self.conn.unchecked_transaction()
    }

    /// Insert the team, or update its name in place when the same
    /// `source_url` comes back with a different non-empty name.
    #[instrument(level = "info", skip(self))]
    pub fn upsert_team(&self, name: &str, source_url: &str) -> Result<i64, StoreError> {
        let source_url = source_url.trim();
        if source_url.is_empty() {
            return Err(StoreError::Validation("team source_url is empty".to_string()));
        }
        let name = name.trim();

        let tx = self.transaction()?;
        let existing: Option<(i64, String)> = tx
            .query_row(
                "SELECT team_id, name FROM teams WHERE source_url = ?1",
                params![source_url],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let team_id = match existing {
            Some((team_id, stored)) => {
                if !name.is_empty() && stored != name {
                    tx.execute(
                        "UPDATE teams SET name = ?1 WHERE team_id = ?2",
                        params![name, team_id],
                    )?;
                    info!(team_id, old = %stored, new = %name, "Updated team name");
                }
                team_id
            }
            None => {
                tx.execute(
                    "INSERT INTO teams (name, source_url) VALUES (?1, ?2)",
                    params![name, source_url],
                )?;
                let team_id = tx.last_insert_rowid();
                info!(team_id, "Inserted team");
                team_id
            }
        };
        tx.commit()?;
        Ok(team_id)
    }

    /// Insert the player with a display name derived from the URL, or move
    /// the existing row to `team_id`. Returns `true` when a row was inserted.
    #[instrument(level = "debug", skip(self))]
    pub fn upsert_player(&self, team_id: Option<i64>, source_url: &str) -> Result<bool, StoreError> {
        let team_id = team_id
            .ok_or_else(|| StoreError::Validation("player has no team id".to_string()))?;
        let source_url = source_url.trim();
        if source_url.is_empty() {
            return Err(StoreError::Validation("player source_url is empty".to_string()));
        }

        let tx = self.transaction()?;
        let existing: Option<i64> = tx
            .query_row(
                "SELECT player_id FROM players WHERE source_url = ?1",
                params![source_url],
                |row| row.get(0),
            )
            .optional()?;

        let inserted = match existing {
            Some(player_id) => {
                tx.execute(
                    "UPDATE players SET team_id = ?1 WHERE player_id = ?2",
                    params![team_id, player_id],
                )?;
                false
            }
            None => {
                let full_name =
                    fallback_display_name(source_url).unwrap_or_else(|| UNKNOWN_NAME.to_string());
                tx.execute(
                    "INSERT INTO players (team_id, source_url, full_name, position)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![team_id, source_url, full_name, UNKNOWN_POSITION],
                )?;
                debug!(%full_name, "Inserted player");
                true
            }
        };
        tx.commit()?;
        Ok(inserted)
    }

    /// Overwrite name and position with the values read from the page.
    /// Empty values leave the stored column alone.
    pub fn update_player_profile(
        &self,
        player_id: i64,
        full_name: &str,
        position: &str,
    ) -> Result<(), StoreError> {
        let full_name = full_name.trim();
        let position = position.trim();
        if full_name.is_empty() && position.is_empty() {
            return Ok(());
        }
        let tx = self.transaction()?;
        if !full_name.is_empty() {
            tx.execute(
                "UPDATE players SET full_name = ?1 WHERE player_id = ?2",
                params![full_name, player_id],
            )?;
        }
        if !position.is_empty() {
            tx.execute(
                "UPDATE players SET position = ?1 WHERE player_id = ?2",
                params![position, player_id],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Replace every stat row of the player with `rows`, all or nothing.
    /// Returns the number of rows written.
    #[instrument(level = "info", skip(self, rows), fields(rows = rows.len()))]
    pub fn replace_player_stats(
        &self,
        player_id: i64,
        rows: &[SeasonLine],
        season: &str,
    ) -> Result<usize, StoreError> {
        let merged = merge_by_tournament(rows);

        // Dropping the transaction without commit rolls everything back.
        let tx = self.transaction()?;
        tx.execute(
            "DELETE FROM player_tournament_stats WHERE player_id = ?1",
            params![player_id],
        )?;
        for stat in &merged {
            let tournament_id = self.get_or_create_tournament(&stat.tournament, season)?;
            tx.execute(
                "INSERT INTO player_tournament_stats
                 (player_id, tournament_id, matches, minutes, metric_a, metric_b,
                  yellow_cards, red_cards)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    player_id,
                    tournament_id,
                    stat.matches,
                    stat.minutes,
                    stat.metric_a,
                    stat.metric_b,
                    stat.yellow_cards,
                    stat.red_cards,
                ],
            )?;
        }
        tx.commit()?;
        info!(player_id, written = merged.len(), "Replaced player stats");
        Ok(merged.len())
    }

    /// Id of the `(name, season)` tournament, inserting it if needed. Runs
    /// inside the caller's open transaction when there is one.
    pub fn get_or_create_tournament(&self, name: &str, season: &str) -> Result<i64, StoreError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(StoreError::Validation("tournament name is empty".to_string()));
        }
        self.conn.execute(
            "INSERT OR IGNORE INTO tournaments (name, season) VALUES (?1, ?2)",
            params![name, season],
        )?;
        Ok(self.conn.query_row(
            "SELECT tournament_id FROM tournaments WHERE name = ?1 AND season = ?2",
            params![name, season],
            |row| row.get(0),
        )?)
    }

    pub fn player_id(&self, source_url: &str) -> Result<Option<i64>, StoreError> {
        Ok(self
            .conn
            .query_row(
                "SELECT player_id FROM players WHERE source_url = ?1",
                params![source_url.trim()],
                |row| row.get(0),
            )
            .optional()?)
    }

    pub fn team(&self, source_url: &str) -> Result<Option<TeamRow>, StoreError> {
        Ok(self
            .conn
            .query_row(
                "SELECT team_id, name, source_url FROM teams WHERE source_url = ?1",
                params![source_url.trim()],
                |row| {
                    Ok(TeamRow {
                        team_id: row.get(0)?,
                        name: row.get(1)?,
                        source_url: row.get(2)?,
                    })
                },
            )
            .optional()?)
    }

    #[cfg(test)]
    pub fn player(&self, source_url: &str) -> Result<Option<PlayerRow>, StoreError> {
        Ok(self
            .conn
            .query_row(
                "SELECT player_id, team_id, source_url, full_name, position
                 FROM players WHERE source_url = ?1",
                params![source_url.trim()],
                |row| {
                    Ok(PlayerRow {
                        player_id: row.get(0)?,
                        team_id: row.get(1)?,
                        source_url: row.get(2)?,
                        full_name: row.get(3)?,
                        position: row.get(4)?,
                    })
                },
            )
            .optional()?)
    }

    /// Player page URLs stored for a team, in insertion order.
    pub fn players_by_team(&self, team_id: i64) -> Result<Vec<String>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT source_url FROM players WHERE team_id = ?1 ORDER BY player_id")?;
        let urls = stmt
            .query_map(params![team_id], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(urls)
    }

    #[cfg(test)]
    pub fn player_stats(&self, player_id: i64) -> Result<Vec<StatRow>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT t.name, t.season, s.matches, s.minutes, s.metric_a, s.metric_b,
                    s.yellow_cards, s.red_cards
             FROM player_tournament_stats s
             JOIN tournaments t ON t.tournament_id = s.tournament_id
             WHERE s.player_id = ?1
             ORDER BY t.tournament_id",
        )?;
        let rows = stmt
            .query_map(params![player_id], |row| {
                Ok(StatRow {
                    tournament: row.get(0)?,
                    season: row.get(1)?,
                    matches: row.get(2)?,
                    minutes: row.get(3)?,
                    metric_a: row.get(4)?,
                    metric_b: row.get(5)?,
                    yellow_cards: row.get(6)?,
                    red_cards: row.get(7)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn tournaments(&self, season: &str) -> Result<Vec<TournamentRow>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT tournament_id, name, season FROM tournaments
             WHERE season = ?1 ORDER BY tournament_id",
        )?;
        let rows = stmt
            .query_map(params![season], |row| {
                Ok(TournamentRow {
                    tournament_id: row.get(0)?,
                    name: row.get(1)?,
                    season: row.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    #[cfg(test)]
    pub(crate) fn count(&self, table: &str) -> i64 {
        self.conn
            .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
            .unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Cards, Role, RoleMetrics, StatLine};

    const SEASON: &str = "2023/2024";
    const TEAM_URL: &str = "https://example.com/manchester-city/startseite/verein/281";
    const PLAYER_URL: &str = "https://example.com/players/kevin-de-bruyne/stats/88755";

    fn season_line(tournament: &str, matches: u32, goals: u32) -> SeasonLine {
        SeasonLine {
            tournament: tournament.to_string(),
            line: StatLine {
                matches,
                minutes: matches * 80,
                cards: Cards {
                    yellow: 1,
                    second_yellow: 0,
                    red: 0,
                },
                metrics: RoleMetrics::Outfield { goals, assists: 2 },
                ..StatLine::empty(Role::Outfield)
            },
        }
    }

    fn seeded() -> (Store, i64, i64) {
        let store = Store::open_in_memory().unwrap();
        let team_id = store.upsert_team("Manchester City", TEAM_URL).unwrap();
        store.upsert_player(Some(team_id), PLAYER_URL).unwrap();
        let player_id = store.player_id(PLAYER_URL).unwrap().unwrap();
        (store, team_id, player_id)
    }

    #[test]
    fn test_upsert_team_updates_name_keeps_id() {
        let store = Store::open_in_memory().unwrap();
        let first = store.upsert_team("Man City", TEAM_URL).unwrap();
        let second = store.upsert_team("Manchester City", TEAM_URL).unwrap();
        assert_eq!(first, second);
        assert_eq!(store.count("teams"), 1);
        assert_eq!(store.team(TEAM_URL).unwrap().unwrap().name, "Manchester City");

        // An empty name never blanks the stored one.
        store.upsert_team("", TEAM_URL).unwrap();
        assert_eq!(store.team(TEAM_URL).unwrap().unwrap().name, "Manchester City");
    }

    #[test]
    fn test_upsert_player_is_idempotent() {
        let (store, team_id, player_id) = seeded();
        assert!(!store.upsert_player(Some(team_id), PLAYER_URL).unwrap());
        assert_eq!(store.count("players"), 1);
        assert_eq!(store.player_id(PLAYER_URL).unwrap(), Some(player_id));

        let player = store.player(PLAYER_URL).unwrap().unwrap();
        assert_eq!(player.full_name, "Kevin De Bruyne");
        assert_eq!(player.position, "unknown");
    }

    #[test]
    fn test_upsert_player_moves_team() {
        let (store, _, _) = seeded();
        let other = store
            .upsert_team("Wolfsburg", "https://example.com/wolfsburg/startseite/verein/82")
            .unwrap();
        store.upsert_player(Some(other), PLAYER_URL).unwrap();
        assert_eq!(store.player(PLAYER_URL).unwrap().unwrap().team_id, other);
        assert_eq!(store.players_by_team(other).unwrap(), vec![PLAYER_URL.to_string()]);
    }

    #[test]
    fn test_upsert_player_without_team_writes_nothing() {
        let store = Store::open_in_memory().unwrap();
        let err = store.upsert_player(None, PLAYER_URL).unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)));
        assert_eq!(store.count("players"), 0);
    }

    #[test]
    fn test_replace_twice_keeps_only_second_set() {
        let (store, _, player_id) = seeded();
        store
            .replace_player_stats(
                player_id,
                &[season_line("Premier League", 18, 4), season_line("FA Cup", 3, 1)],
                SEASON,
            )
            .unwrap();
        store
            .replace_player_stats(player_id, &[season_line("Champions League", 4, 0)], SEASON)
            .unwrap();

        let stats = store.player_stats(player_id).unwrap();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].tournament, "Champions League");
        assert_eq!(stats[0].matches, 4);
        assert_eq!(stats[0].season, SEASON);
    }

    #[test]
    fn test_reingestion_is_idempotent() {
        let (store, _, player_id) = seeded();
        let rows = [season_line("Premier League", 18, 4), season_line("FA Cup", 3, 1)];
        store.replace_player_stats(player_id, &rows, SEASON).unwrap();
        let first = store.player_stats(player_id).unwrap();
        store.replace_player_stats(player_id, &rows, SEASON).unwrap();

        assert_eq!(store.player_stats(player_id).unwrap(), first);
        assert_eq!(store.tournaments(SEASON).unwrap().len(), 2);
    }

    #[test]
    fn test_duplicate_tournaments_are_summed() {
        let (store, _, player_id) = seeded();
        let written = store
            .replace_player_stats(
                player_id,
                &[season_line("Premier League", 10, 2), season_line("Premier League", 8, 2)],
                SEASON,
            )
            .unwrap();
        assert_eq!(written, 1);
        let stats = store.player_stats(player_id).unwrap();
        assert_eq!(stats[0].matches, 18);
        assert_eq!(stats[0].metric_a, 4);
        assert_eq!(stats[0].metric_b, 4);
        assert_eq!(stats[0].yellow_cards, 2);
    }

    #[test]
    fn test_failed_replace_rolls_back() {
        let (store, _, player_id) = seeded();
        store
            .replace_player_stats(player_id, &[season_line("Premier League", 18, 4)], SEASON)
            .unwrap();
        store
            .conn
            .execute_batch(
                "CREATE TRIGGER reject_999 BEFORE INSERT ON player_tournament_stats
                 WHEN NEW.matches = 999
                 BEGIN SELECT RAISE(ABORT, 'rejected'); END;",
            )
            .unwrap();

        let err = store
            .replace_player_stats(
                player_id,
                &[season_line("FA Cup", 2, 0), season_line("League Cup", 999, 0)],
                SEASON,
            )
            .unwrap_err();
        assert!(matches!(err, StoreError::Persistence(_)));
        assert!(!err.is_backend_lost());

        let stats = store.player_stats(player_id).unwrap();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].tournament, "Premier League");
        assert!(store.tournaments(SEASON).unwrap().iter().all(|t| t.name != "FA Cup"));
    }

    #[test]
    fn test_tournaments_are_scoped_by_season() {
        let store = Store::open_in_memory().unwrap();
        let a = store.get_or_create_tournament("Premier League", "2023/2024").unwrap();
        let b = store.get_or_create_tournament("Premier League", "2023/2024").unwrap();
        let c = store.get_or_create_tournament("Premier League", "2024/2025").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(store.get_or_create_tournament("  ", SEASON).is_err());
    }

    #[test]
    fn test_update_player_profile_skips_empty_values() {
        let (store, _, player_id) = seeded();
        store
            .update_player_profile(player_id, "Kevin De Bruyne", "Attacking Midfield")
            .unwrap();
        store.update_player_profile(player_id, "", "").unwrap();
        store.update_player_profile(player_id, "K. De Bruyne", "").unwrap();

        let player = store.player(PLAYER_URL).unwrap().unwrap();
        assert_eq!(player.full_name, "K. De Bruyne");
        assert_eq!(player.position, "Attacking Midfield");
    }

    #[test]
    fn test_stats_require_existing_player() {
        let store = Store::open_in_memory().unwrap();
        let err = store
            .replace_player_stats(42, &[season_line("Premier League", 1, 0)], SEASON)
            .unwrap_err();
        assert!(matches!(err, StoreError::Persistence(_)));
        assert_eq!(store.count("player_tournament_stats"), 0);
    }

    #[test]
    fn test_open_creates_file_and_reopens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db").join("stats.sqlite");
        {
            let store = Store::open(&path).unwrap();
            store.upsert_team("Manchester City", TEAM_URL).unwrap();
        }
        let store = Store::open(&path).unwrap();
        assert!(store.team(TEAM_URL).unwrap().is_some());
    }
}
