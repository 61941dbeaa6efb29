use std::{
    collections::{HashMap, VecDeque},
    fmt::Debug,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use redis::{ErrorKind, RedisError, RedisResult};
use tokio::time::{sleep, Instant};

use crate::redis::BusConnection;

const BLPOP_POLL_WAIT: Duration = Duration::from_millis(10);

#[derive(Debug, Default)]
struct BusState {
    lists: HashMap<String, VecDeque<String>>,
    hashes: HashMap<String, HashMap<String, String>>,
    strings: HashMap<String, String>,
    // Sorted set members with their scores, kept in insertion order
    // and sorted on read.
    sorted_sets: HashMap<String, Vec<(String, u64)>>,
    inject_failures: u32,
}

/// A process-local implementation of [`BusConnection`] over plain
/// collections.
///
/// Used by the test suites across the workspace and as a stand-in data plane
/// for local development. Clones share the same underlying state so a clone
/// handed to a worker observes pushes made through any other clone.
///
/// `fail_next` queues injected failures to exercise the retry-forever
/// behaviour workers must have around transient Redis errors.
#[derive(Clone, Debug, Default)]
pub struct InMemoryBus {
    state: Arc<Mutex<BusState>>,
}

impl InMemoryBus {
    pub fn new() -> Self {
        InMemoryBus {
            state: Arc::new(Mutex::new(BusState::default())),
        }
    }

    /// Makes the next `count` operations fail with a simulated
    /// connection error.
    pub fn fail_next(&self, count: u32) {
        self.state.lock().unwrap().inject_failures = count;
    }

    /// Returns a snapshot of the given list.
    pub fn list(&self, key: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .lists
            .get(key)
            .map(|entries| entries.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Returns a snapshot of the given sorted set ordered by score.
    pub fn sorted_set(&self, key: &str) -> Vec<(String, u64)> {
        let mut entries = self
            .state
            .lock()
            .unwrap()
            .sorted_sets
            .get(key)
            .cloned()
            .unwrap_or_default();
        entries.sort_by_key(|(_, score)| *score);
        entries
    }

    /// Returns a snapshot of the given hash.
    pub fn hash(&self, key: &str) -> HashMap<String, String> {
        self.state
            .lock()
            .unwrap()
            .hashes
            .get(key)
            .cloned()
            .unwrap_or_default()
    }

    fn check_injected_failure(&self) -> RedisResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.inject_failures > 0 {
            state.inject_failures -= 1;
            return Err(RedisError::from((
                ErrorKind::IoError,
                "simulated connection failure",
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl BusConnection for InMemoryBus {
    async fn ping(&mut self) -> RedisResult<()> {
        self.check_injected_failure()
    }

    async fn blpop(&mut self, key: &str, timeout_ms: u64) -> RedisResult<Option<String>> {
        self.check_injected_failure()?;
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        loop {
            {
                let mut state = self.state.lock().unwrap();
                if let Some(entries) = state.lists.get_mut(key) {
                    if let Some(value) = entries.pop_front() {
                        return Ok(Some(value));
                    }
                }
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            sleep(BLPOP_POLL_WAIT).await;
        }
    }

    async fn rpush(&mut self, key: &str, value: &str) -> RedisResult<()> {
        self.check_injected_failure()?;
        self.state
            .lock()
            .unwrap()
            .lists
            .entry(key.to_string())
            .or_default()
            .push_back(value.to_string());
        Ok(())
    }

    async fn zadd(&mut self, key: &str, member: &str, score: u64) -> RedisResult<()> {
        self.check_injected_failure()?;
        let mut state = self.state.lock().unwrap();
        let entries = state.sorted_sets.entry(key.to_string()).or_default();
        // An existing member has its score replaced, matching ZADD.
        if let Some(entry) = entries.iter_mut().find(|(m, _)| m == member) {
            entry.1 = score;
        } else {
            entries.push((member.to_string(), score));
        }
        Ok(())
    }

    async fn zrangebyscore(
        &mut self,
        key: &str,
        max_score: u64,
        count: usize,
    ) -> RedisResult<Vec<String>> {
        self.check_injected_failure()?;
        let state = self.state.lock().unwrap();
        let mut due = state
            .sorted_sets
            .get(key)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|(_, score)| *score <= max_score)
                    .cloned()
                    .collect::<Vec<(String, u64)>>()
            })
            .unwrap_or_default();
        due.sort_by_key(|(_, score)| *score);
        Ok(due
            .into_iter()
            .take(count)
            .map(|(member, _)| member)
            .collect())
    }

    async fn zrem(&mut self, key: &str, member: &str) -> RedisResult<usize> {
        self.check_injected_failure()?;
        let mut state = self.state.lock().unwrap();
        if let Some(entries) = state.sorted_sets.get_mut(key) {
            let before = entries.len();
            entries.retain(|(m, _)| m != member);
            return Ok(before - entries.len());
        }
        Ok(0)
    }

    async fn hget(&mut self, key: &str, field: &str) -> RedisResult<Option<String>> {
        self.check_injected_failure()?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .hashes
            .get(key)
            .and_then(|fields| fields.get(field).cloned()))
    }

    async fn hset(&mut self, key: &str, field: &str, value: &str) -> RedisResult<()> {
        self.check_injected_failure()?;
        self.state
            .lock()
            .unwrap()
            .hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hdel(&mut self, key: &str, field: &str) -> RedisResult<()> {
        self.check_injected_failure()?;
        if let Some(fields) = self.state.lock().unwrap().hashes.get_mut(key) {
            fields.remove(field);
        }
        Ok(())
    }

    async fn hkeys(&mut self, key: &str) -> RedisResult<Vec<String>> {
        self.check_injected_failure()?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .hashes
            .get(key)
            .map(|fields| fields.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn hexists(&mut self, key: &str, field: &str) -> RedisResult<bool> {
        self.check_injected_failure()?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .hashes
            .get(key)
            .map(|fields| fields.contains_key(field))
            .unwrap_or(false))
    }

    async fn hincrby(&mut self, key: &str, field: &str, delta: i64) -> RedisResult<i64> {
        self.check_injected_failure()?;
        let mut state = self.state.lock().unwrap();
        let fields = state.hashes.entry(key.to_string()).or_default();
        let current = fields
            .get(field)
            .and_then(|value| value.parse::<i64>().ok())
            .unwrap_or(0);
        let updated = current + delta;
        fields.insert(field.to_string(), updated.to_string());
        Ok(updated)
    }

    async fn get(&mut self, key: &str) -> RedisResult<Option<String>> {
        self.check_injected_failure()?;
        Ok(self.state.lock().unwrap().strings.get(key).cloned())
    }

    async fn set(&mut self, key: &str, value: &str) -> RedisResult<()> {
        self.check_injected_failure()?;
        self.state
            .lock()
            .unwrap()
            .strings
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn clone_connection(&self) -> Box<dyn BusConnection> {
        Box::new(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test_log::test(tokio::test)]
    async fn test_list_push_and_blocking_pop() {
        let mut bus = InMemoryBus::new();
        bus.rpush("queue", "first").await.unwrap();
        bus.rpush("queue", "second").await.unwrap();

        assert_eq!(
            bus.blpop("queue", 50).await.unwrap(),
            Some("first".to_string())
        );
        assert_eq!(
            bus.blpop("queue", 50).await.unwrap(),
            Some("second".to_string())
        );
        assert_eq!(bus.blpop("queue", 50).await.unwrap(), None);
    }

    #[test_log::test(tokio::test)]
    async fn test_blocking_pop_observes_push_from_clone() {
        let bus = InMemoryBus::new();
        let mut reader = bus.clone();
        let mut writer = bus.clone();

        let pop = tokio::spawn(async move { reader.blpop("queue", 1000).await });
        tokio::time::sleep(Duration::from_millis(30)).await;
        writer.rpush("queue", "value").await.unwrap();

        assert_eq!(pop.await.unwrap().unwrap(), Some("value".to_string()));
    }

    #[test_log::test(tokio::test)]
    async fn test_sorted_set_range_and_ownership_removal() {
        let mut bus = InMemoryBus::new();
        bus.zadd("retries", "job-a", 100).await.unwrap();
        bus.zadd("retries", "job-b", 50).await.unwrap();
        bus.zadd("retries", "job-c", 200).await.unwrap();

        let due = bus.zrangebyscore("retries", 150, 10).await.unwrap();
        assert_eq!(due, vec!["job-b".to_string(), "job-a".to_string()]);

        assert_eq!(bus.zrem("retries", "job-b").await.unwrap(), 1);
        // A second removal reports no deletions, signalling lost ownership.
        assert_eq!(bus.zrem("retries", "job-b").await.unwrap(), 0);
    }

    #[test_log::test(tokio::test)]
    async fn test_hash_increment_defaults_to_zero() {
        let mut bus = InMemoryBus::new();
        assert_eq!(bus.hincrby("counts", "uid_key", 3).await.unwrap(), 3);
        assert_eq!(bus.hincrby("counts", "uid_key", -1).await.unwrap(), 2);
        assert_eq!(
            bus.hget("counts", "uid_key").await.unwrap(),
            Some("2".to_string())
        );
    }

    #[test_log::test(tokio::test)]
    async fn test_injected_failures_are_consumed_in_order() {
        let mut bus = InMemoryBus::new();
        bus.fail_next(2);
        assert!(bus.rpush("queue", "value").await.is_err());
        assert!(bus.ping().await.is_err());
        assert!(bus.rpush("queue", "value").await.is_ok());
    }
}
