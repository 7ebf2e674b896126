//! Durable, append-only table of episode outcomes keyed by task and arm.
//!
//! Records are inserted once and never updated in place. Besides plain
//! filters, the store computes per-arm aggregates and warm-start seeds so
//! a fresh bandit does not restart from a uniform prior.

use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum OutcomeError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeRecord {
    pub ts: i64,
    pub task_id: String,
    pub arm_id: String,
    pub decision_status: String,
    pub tests_passed: bool,
    pub wall_ms: u64,
    pub reward: f64,
    #[serde(default)]
    pub meta: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ArmAggregate {
    pub arm_id: String,
    pub pulls: u64,
    pub mean_reward: f64,
    pub win_rate: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WindowSummary {
    pub window: u64,
    pub mean_reward: f64,
    pub win_rate: f64,
}

pub struct OutcomeStore {
    conn: Connection,
}

impl OutcomeStore {
    pub fn open(path: &Path) -> Result<Self, OutcomeError> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, OutcomeError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, OutcomeError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS outcomes (
                id INTEGER PRIMARY KEY,
                ts INTEGER NOT NULL,
                task_id TEXT NOT NULL,
                arm_id TEXT NOT NULL,
                decision_status TEXT NOT NULL,
                tests_passed INTEGER NOT NULL,
                wall_ms INTEGER NOT NULL,
                reward REAL NOT NULL,
                meta_json TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_outcomes_task ON outcomes(task_id);
            CREATE INDEX IF NOT EXISTS idx_outcomes_arm ON outcomes(arm_id);",
        )?;
        Ok(Self { conn })
    }

    /// Append one record; rows are never updated afterwards.
    pub fn insert(&self, record: &OutcomeRecord) -> Result<i64, OutcomeError> {
        let meta_json = serde_json::to_string(&record.meta)?;
        self.conn.execute(
            "INSERT INTO outcomes
                (ts, task_id, arm_id, decision_status, tests_passed, wall_ms, reward, meta_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                record.ts,
                record.task_id,
                record.arm_id,
                record.decision_status,
                record.tests_passed as i64,
                record.wall_ms as i64,
                record.reward,
                meta_json,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn by_arm(&self, arm_id: &str) -> Result<Vec<OutcomeRecord>, OutcomeError> {
        self.query_records(
            "SELECT ts, task_id, arm_id, decision_status, tests_passed, wall_ms, reward, meta_json
             FROM outcomes WHERE arm_id = ?1 ORDER BY id",
            params![arm_id],
        )
    }

    pub fn by_task(&self, task_id: &str) -> Result<Vec<OutcomeRecord>, OutcomeError> {
        self.query_records(
            "SELECT ts, task_id, arm_id, decision_status, tests_passed, wall_ms, reward, meta_json
             FROM outcomes WHERE task_id = ?1 ORDER BY id",
            params![task_id],
        )
    }

    fn query_records(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<OutcomeRecord>, OutcomeError> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map(params, |row| {
            let meta_json: String = row.get(7)?;
            Ok((
                OutcomeRecord {
                    ts: row.get(0)?,
                    task_id: row.get(1)?,
                    arm_id: row.get(2)?,
                    decision_status: row.get(3)?,
                    tests_passed: row.get::<_, i64>(4)? != 0,
                    wall_ms: row.get::<_, i64>(5)? as u64,
                    reward: row.get(6)?,
                    meta: BTreeMap::new(),
                },
                meta_json,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (mut record, meta_json) = row?;
            record.meta = serde_json::from_str(&meta_json)?;
            out.push(record);
        }
        Ok(out)
    }

    /// Per-arm pull count, mean reward, and win rate (tests passed).
    pub fn arm_stats(&self) -> Result<Vec<ArmAggregate>, OutcomeError> {
        let mut stmt = self.conn.prepare(
            "SELECT arm_id, COUNT(*), AVG(reward), AVG(tests_passed)
             FROM outcomes GROUP BY arm_id ORDER BY arm_id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(ArmAggregate {
                arm_id: row.get(0)?,
                pulls: row.get::<_, i64>(1)? as u64,
                mean_reward: row.get::<_, Option<f64>>(2)?.unwrap_or(0.0),
                win_rate: row.get::<_, Option<f64>>(3)?.unwrap_or(0.0),
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Rolling summary over the `n` most recent records.
    pub fn recent_window(&self, n: u64) -> Result<WindowSummary, OutcomeError> {
        let mut stmt = self.conn.prepare(
            "SELECT COUNT(*), AVG(reward), AVG(tests_passed) FROM (
                SELECT reward, tests_passed FROM outcomes ORDER BY id DESC LIMIT ?1
             )",
        )?;
        let summary = stmt.query_row(params![n as i64], |row| {
            Ok(WindowSummary {
                window: row.get::<_, i64>(0)? as u64,
                mean_reward: row.get::<_, Option<f64>>(1)?.unwrap_or(0.0),
                win_rate: row.get::<_, Option<f64>>(2)?.unwrap_or(0.0),
            })
        })?;
        Ok(summary)
    }

    /// Beta parameters per arm derived from history: `alpha = 1 + total
    /// reward`, `beta = 1 + pulls - total reward`. Seeding a fresh sampler
    /// with these resumes learning where the last process left off.
    pub fn warm_start_arms(&self) -> Result<BTreeMap<String, (f64, f64)>, OutcomeError> {
        let mut stmt = self
            .conn
            .prepare("SELECT arm_id, COUNT(*), SUM(reward) FROM outcomes GROUP BY arm_id")?;
        let rows = stmt.query_map([], |row| {
            let arm_id: String = row.get(0)?;
            let pulls: i64 = row.get(1)?;
            let total: Option<f64> = row.get(2)?;
            Ok((arm_id, pulls as f64, total.unwrap_or(0.0)))
        })?;
        let mut out = BTreeMap::new();
        for row in rows {
            let (arm_id, pulls, total) = row?;
            out.insert(arm_id, (1.0 + total, 1.0 + pulls - total));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(task: &str, arm: &str, reward: f64, passed: bool) -> OutcomeRecord {
        OutcomeRecord {
            ts: 1_700_000_000,
            task_id: task.to_string(),
            arm_id: arm.to_string(),
            decision_status: "allow".to_string(),
            tests_passed: passed,
            wall_ms: 1200,
            reward,
            meta: BTreeMap::new(),
        }
    }

    #[test]
    fn insert_and_filter() {
        let store = OutcomeStore::open_in_memory().unwrap();
        store.insert(&record("t1", "probe-first", 1.0, true)).unwrap();
        store.insert(&record("t1", "patch-direct", 0.0, false)).unwrap();
        store.insert(&record("t2", "probe-first", 0.5, false)).unwrap();

        assert_eq!(store.by_arm("probe-first").unwrap().len(), 2);
        assert_eq!(store.by_task("t1").unwrap().len(), 2);
        let rec = &store.by_task("t2").unwrap()[0];
        assert_eq!(rec.arm_id, "probe-first");
        assert!(!rec.tests_passed);
    }

    #[test]
    fn aggregates_and_window() {
        let store = OutcomeStore::open_in_memory().unwrap();
        for _ in 0..3 {
            store.insert(&record("t", "a", 1.0, true)).unwrap();
        }
        store.insert(&record("t", "b", 0.0, false)).unwrap();

        let stats = store.arm_stats().unwrap();
        assert_eq!(stats.len(), 2);
        let a = stats.iter().find(|s| s.arm_id == "a").unwrap();
        assert_eq!(a.pulls, 3);
        assert!((a.mean_reward - 1.0).abs() < 1e-9);
        assert!((a.win_rate - 1.0).abs() < 1e-9);

        let window = store.recent_window(2).unwrap();
        assert_eq!(window.window, 2);
        assert!((window.mean_reward - 0.5).abs() < 1e-9);
    }

    #[test]
    fn warm_start_reflects_history() {
        let store = OutcomeStore::open_in_memory().unwrap();
        for _ in 0..4 {
            store.insert(&record("t", "good", 1.0, true)).unwrap();
        }
        store.insert(&record("t", "bad", 0.0, false)).unwrap();

        let seeds = store.warm_start_arms().unwrap();
        let (alpha, beta) = seeds["good"];
        assert!((alpha - 5.0).abs() < 1e-9);
        assert!((beta - 1.0).abs() < 1e-9);
        let (alpha, beta) = seeds["bad"];
        assert!((alpha - 1.0).abs() < 1e-9);
        assert!((beta - 2.0).abs() < 1e-9);
    }
}
