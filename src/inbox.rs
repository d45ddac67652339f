//! # Inbox — Out-of-band Test Metrics Buffer
//!
//! Running jobs push test counters (tests, errors, failures, skip) for their
//! task while the build is still in progress. The reconciliation engine
//! drains them when it observes the build's terminal result.
//!
//! Keys are `result:{project}:{task}` where `task` is the task nickname. In
//! Redis each key is a list of JSON-encoded [`TestCounts`] reports; a drain
//! reads and deletes the list in one `MULTI`/`EXEC` so all four counters are
//! consumed together and never applied twice.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::Result;
use redis::AsyncCommands;

use crate::lock_or_recover;
use crate::model::TestCounts;

pub fn inbox_key(project: &str, task: &str) -> String {
    format!("result:{}:{}", project, task)
}

#[async_trait]
pub trait MetricsInbox: Send + Sync {
    /// Append one report for `(project, task)`.
    async fn push(&self, project: &str, task: &str, counts: TestCounts) -> Result<()>;

    /// Atomically consume every report for the key. Returns the summed counters,
    /// or `None` if nothing was reported.
    async fn drain(&self, project: &str, task: &str) -> Result<Option<TestCounts>>;

    /// Put counters back after a drain whose result could not be committed.
    async fn restore(&self, project: &str, task: &str, counts: TestCounts) -> Result<()>;
}

fn sum_reports<'a>(reports: impl IntoIterator<Item = &'a TestCounts>) -> Option<TestCounts> {
    let mut total: Option<TestCounts> = None;
    for r in reports {
        total.get_or_insert_with(TestCounts::default).merge(r);
    }
    total
}

// ── Redis ───────────────────────────────────────────────────────

#[derive(Clone)]
pub struct RedisInbox {
    conn: redis::aio::ConnectionManager,
}

impl RedisInbox {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = client.get_connection_manager().await?;
        Ok(RedisInbox { conn })
    }
}

#[async_trait]
impl MetricsInbox for RedisInbox {
    async fn push(&self, project: &str, task: &str, counts: TestCounts) -> Result<()> {
        let mut conn = self.conn.clone();
        let entry = serde_json::to_string(&counts)?;
        let _: i64 = conn.rpush(inbox_key(project, task), entry).await?;
        Ok(())
    }

    async fn drain(&self, project: &str, task: &str) -> Result<Option<TestCounts>> {
        let mut conn = self.conn.clone();
        let key = inbox_key(project, task);
        let (entries, _deleted): (Vec<String>, i64) = redis::pipe()
            .atomic()
            .lrange(&key, 0, -1)
            .del(&key)
            .query_async(&mut conn)
            .await?;

        let mut reports = Vec::with_capacity(entries.len());
        for entry in &entries {
            match serde_json::from_str::<TestCounts>(entry) {
                Ok(c) => reports.push(c),
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "dropping malformed metrics report")
                }
            }
        }
        Ok(sum_reports(&reports))
    }

    async fn restore(&self, project: &str, task: &str, counts: TestCounts) -> Result<()> {
        let mut conn = self.conn.clone();
        let entry = serde_json::to_string(&counts)?;
        let _: i64 = conn.lpush(inbox_key(project, task), entry).await?;
        Ok(())
    }
}

// ── In-process ──────────────────────────────────────────────────

/// Map-backed inbox used by tests and single-process deployments without Redis.
#[derive(Default)]
pub struct MemoryInbox {
    entries: Mutex<HashMap<String, Vec<TestCounts>>>,
}

impl MemoryInbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of pending reports for a key.
    pub fn pending(&self, project: &str, task: &str) -> usize {
        lock_or_recover(&self.entries)
            .get(&inbox_key(project, task))
            .map_or(0, Vec::len)
    }
}

#[async_trait]
impl MetricsInbox for MemoryInbox {
    async fn push(&self, project: &str, task: &str, counts: TestCounts) -> Result<()> {
        lock_or_recover(&self.entries)
            .entry(inbox_key(project, task))
            .or_default()
            .push(counts);
        Ok(())
    }

    async fn drain(&self, project: &str, task: &str) -> Result<Option<TestCounts>> {
        let reports = lock_or_recover(&self.entries).remove(&inbox_key(project, task));
        Ok(reports.and_then(|r| sum_reports(&r)))
    }

    async fn restore(&self, project: &str, task: &str, counts: TestCounts) -> Result<()> {
        lock_or_recover(&self.entries)
            .entry(inbox_key(project, task))
            .or_default()
            .insert(0, counts);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_layout() {
        assert_eq!(inbox_key("web", "smoke"), "result:web:smoke");
    }

    #[tokio::test]
    async fn drain_sums_and_empties() {
        let inbox = MemoryInbox::new();
        inbox.push("web", "smoke", TestCounts::new(6, 1, 0, 0)).await.unwrap();
        inbox.push("web", "smoke", TestCounts::new(4, 0, 2, 0)).await.unwrap();
        inbox.push("web", "other", TestCounts::new(1, 0, 0, 0)).await.unwrap();

        let drained = inbox.drain("web", "smoke").await.unwrap();
        assert_eq!(drained, Some(TestCounts::new(10, 1, 2, 0)));
        assert_eq!(inbox.pending("web", "smoke"), 0);
        assert_eq!(inbox.pending("web", "other"), 1);
        assert_eq!(inbox.drain("web", "smoke").await.unwrap(), None);
    }

    #[tokio::test]
    async fn restore_makes_counts_drainable_again() {
        let inbox = MemoryInbox::new();
        inbox.push("web", "smoke", TestCounts::new(1, 0, 0, 0)).await.unwrap();
        let drained = inbox.drain("web", "smoke").await.unwrap().unwrap();
        inbox.restore("web", "smoke", drained).await.unwrap();
        assert_eq!(
            inbox.drain("web", "smoke").await.unwrap(),
            Some(TestCounts::new(1, 0, 0, 0))
        );
    }

    #[test]
    fn reports_are_json_counter_quadruples() {
        let json = serde_json::to_string(&TestCounts::new(10, 1, 2, 0)).unwrap();
        assert_eq!(json, r#"{"tests":10,"errors":1,"failures":2,"skip":0}"#);
    }
}
