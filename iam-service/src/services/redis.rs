use async_trait::async_trait;
use redis::{aio::ConnectionManager, Client, RedisResult, Script};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use super::error::ServiceError;

/// Key layout of the shared store.
pub mod keys {
    use uuid::Uuid;

    pub fn refresh_token(subject: &str) -> String {
        format!("refresh_token:{}", subject)
    }

    pub fn revoked_token(token: &str) -> String {
        format!("revoked_token:{}", token)
    }

    pub fn rules(app_id: Uuid) -> String {
        format!("rules:{}", app_id)
    }

    /// Bumped on every rule mutation of the tenant.
    pub fn rules_version(app_id: Uuid) -> String {
        format!("rules_version:{}", app_id)
    }

    pub fn pending_registration(session_id: Uuid) -> String {
        format!("pending_registration:{}", session_id)
    }
}

/// Key-value store shared by every service instance.
///
/// Holds refresh-token custody, the revocation set, the rule cache and pending
/// registrations. Every call either completes within the configured deadline
/// or fails with `StoreTimeout`.
#[async_trait]
pub trait SharedStore: Send + Sync {
    async fn set_ex(&self, key: &str, value: &str, ttl_seconds: u64) -> Result<(), ServiceError>;
    async fn get(&self, key: &str) -> Result<Option<String>, ServiceError>;
    /// Returns whether a key was removed.
    async fn delete(&self, key: &str) -> Result<bool, ServiceError>;
    async fn exists(&self, key: &str) -> Result<bool, ServiceError>;
    /// Replace `key` with `new` only if it currently holds `expected`.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: &str,
        new: &str,
        ttl_seconds: u64,
    ) -> Result<bool, ServiceError>;
    /// Increment a counter without expiry, returning the new value.
    async fn incr(&self, key: &str) -> Result<i64, ServiceError>;
    /// Set `key` only while `guard` still reads `guard_value`. A missing
    /// guard reads as "0".
    async fn set_ex_if_guard(
        &self,
        key: &str,
        value: &str,
        ttl_seconds: u64,
        guard: &str,
        guard_value: &str,
    ) -> Result<bool, ServiceError>;
    async fn health_check(&self) -> Result<(), ServiceError>;
}

const COMPARE_AND_SWAP: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  redis.call('SET', KEYS[1], ARGV[2], 'EX', ARGV[3])
  return 1
end
return 0
"#;

const SET_IF_GUARD: &str = r#"
if (redis.call('GET', KEYS[2]) or '0') == ARGV[2] then
  redis.call('SET', KEYS[1], ARGV[1], 'EX', ARGV[3])
  return 1
end
return 0
"#;

#[derive(Clone)]
pub struct RedisService {
    _client: Client,
    manager: ConnectionManager,
    op_timeout: Duration,
    cas_script: Script,
    guarded_set_script: Script,
}

impl RedisService {
    pub async fn new(config: &crate::config::RedisConfig) -> Result<Self, anyhow::Error> {
        tracing::info!("Connecting to Redis");
        let client = Client::open(config.url.clone())?;

        // ConnectionManager reconnects on its own
        let manager = client.get_connection_manager().await.map_err(|e| {
            tracing::error!("Failed to get Redis connection manager: {}", e);
            anyhow::anyhow!("Failed to connect to Redis: {}", e)
        })?;

        tracing::info!("Successfully connected to Redis");

        Ok(Self {
            _client: client,
            manager,
            op_timeout: Duration::from_millis(config.operation_timeout_ms),
            cas_script: Script::new(COMPARE_AND_SWAP),
            guarded_set_script: Script::new(SET_IF_GUARD),
        })
    }

    async fn run<T, F>(&self, op: &'static str, fut: F) -> Result<T, ServiceError>
    where
        F: Future<Output = RedisResult<T>>,
    {
        match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(result) => result.map_err(ServiceError::from),
            Err(_) => {
                tracing::warn!(operation = op, timeout_ms = self.op_timeout.as_millis() as u64, "Redis operation timed out");
                Err(ServiceError::StoreTimeout(op.to_string()))
            }
        }
    }
}

#[async_trait]
impl SharedStore for RedisService {
    async fn set_ex(&self, key: &str, value: &str, ttl_seconds: u64) -> Result<(), ServiceError> {
        let mut conn = self.manager.clone();
        self.run(
            "SET",
            redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("EX")
                .arg(ttl_seconds.max(1))
                .query_async::<_, ()>(&mut conn),
        )
        .await
    }

    async fn get(&self, key: &str) -> Result<Option<String>, ServiceError> {
        let mut conn = self.manager.clone();
        self.run("GET", redis::cmd("GET").arg(key).query_async(&mut conn))
            .await
    }

    async fn delete(&self, key: &str) -> Result<bool, ServiceError> {
        let mut conn = self.manager.clone();
        let removed: i64 = self
            .run("DEL", redis::cmd("DEL").arg(key).query_async(&mut conn))
            .await?;
        Ok(removed > 0)
    }

    async fn exists(&self, key: &str) -> Result<bool, ServiceError> {
        let mut conn = self.manager.clone();
        self.run("EXISTS", redis::cmd("EXISTS").arg(key).query_async(&mut conn))
            .await
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: &str,
        new: &str,
        ttl_seconds: u64,
    ) -> Result<bool, ServiceError> {
        let mut conn = self.manager.clone();
        let mut invocation = self.cas_script.key(key);
        invocation.arg(expected).arg(new).arg(ttl_seconds.max(1));
        let swapped: i64 = self
            .run("EVALSHA", invocation.invoke_async(&mut conn))
            .await?;
        Ok(swapped == 1)
    }

    async fn incr(&self, key: &str) -> Result<i64, ServiceError> {
        let mut conn = self.manager.clone();
        self.run("INCR", redis::cmd("INCR").arg(key).query_async(&mut conn))
            .await
    }

    async fn set_ex_if_guard(
        &self,
        key: &str,
        value: &str,
        ttl_seconds: u64,
        guard: &str,
        guard_value: &str,
    ) -> Result<bool, ServiceError> {
        let mut conn = self.manager.clone();
        let mut invocation = self.guarded_set_script.key(key);
        invocation
            .key(guard)
            .arg(value)
            .arg(guard_value)
            .arg(ttl_seconds.max(1));
        let written: i64 = self
            .run("EVALSHA", invocation.invoke_async(&mut conn))
            .await?;
        Ok(written == 1)
    }

    async fn health_check(&self) -> Result<(), ServiceError> {
        let mut conn = self.manager.clone();
        self.run("PING", redis::cmd("PING").query_async::<_, String>(&mut conn))
            .await
            .map(|_| ())
    }
}

/// Lifetime given to mock keys written without expiry.
const MOCK_NO_EXPIRY: Duration = Duration::from_secs(10 * 365 * 24 * 60 * 60);

/// In-memory store honouring TTLs, for tests.
pub struct MockStore {
    entries: Mutex<HashMap<String, (String, Instant)>>,
    offline: AtomicBool,
}

impl Default for MockStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MockStore {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            offline: AtomicBool::new(false),
        }
    }

    /// Make every subsequent call fail as if the store stopped answering.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Remaining lifetime of a live key.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let entries = self.entries.lock().ok()?;
        entries
            .get(key)
            .and_then(|(_, deadline)| deadline.checked_duration_since(Instant::now()))
    }

    fn entries(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<String, (String, Instant)>>, ServiceError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(ServiceError::StoreTimeout("mock".to_string()));
        }
        let mut entries = self
            .entries
            .lock()
            .map_err(|e| anyhow::anyhow!("Mock store mutex poisoned: {}", e))?;
        let now = Instant::now();
        entries.retain(|_, (_, deadline)| *deadline > now);
        Ok(entries)
    }
}

#[async_trait]
impl SharedStore for MockStore {
    async fn set_ex(&self, key: &str, value: &str, ttl_seconds: u64) -> Result<(), ServiceError> {
        let deadline = Instant::now() + Duration::from_secs(ttl_seconds.max(1));
        self.entries()?
            .insert(key.to_string(), (value.to_string(), deadline));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, ServiceError> {
        Ok(self.entries()?.get(key).map(|(v, _)| v.clone()))
    }

    async fn delete(&self, key: &str) -> Result<bool, ServiceError> {
        Ok(self.entries()?.remove(key).is_some())
    }

    async fn exists(&self, key: &str) -> Result<bool, ServiceError> {
        Ok(self.entries()?.contains_key(key))
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: &str,
        new: &str,
        ttl_seconds: u64,
    ) -> Result<bool, ServiceError> {
        let mut entries = self.entries()?;
        match entries.get(key) {
            Some((current, _)) if current == expected => {
                let deadline = Instant::now() + Duration::from_secs(ttl_seconds.max(1));
                entries.insert(key.to_string(), (new.to_string(), deadline));
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn incr(&self, key: &str) -> Result<i64, ServiceError> {
        let mut entries = self.entries()?;
        let current = match entries.get(key) {
            Some((value, _)) => value
                .parse::<i64>()
                .map_err(|e| anyhow::anyhow!("Value at {} is not an integer: {}", key, e))?,
            None => 0,
        };
        let next = current + 1;
        entries.insert(key.to_string(), (next.to_string(), Instant::now() + MOCK_NO_EXPIRY));
        Ok(next)
    }

    async fn set_ex_if_guard(
        &self,
        key: &str,
        value: &str,
        ttl_seconds: u64,
        guard: &str,
        guard_value: &str,
    ) -> Result<bool, ServiceError> {
        let mut entries = self.entries()?;
        let current = entries.get(guard).map_or("0", |(v, _)| v.as_str());
        if current != guard_value {
            return Ok(false);
        }
        let deadline = Instant::now() + Duration::from_secs(ttl_seconds.max(1));
        entries.insert(key.to_string(), (value.to_string(), deadline));
        Ok(true)
    }

    async fn health_check(&self) -> Result<(), ServiceError> {
        self.entries().map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn compare_and_swap_only_replaces_expected_value() {
        let store = MockStore::new();
        store.set_ex("k", "old", 60).await.unwrap();

        assert!(!store.compare_and_swap("k", "other", "new", 60).await.unwrap());
        assert!(store.compare_and_swap("k", "old", "new", 60).await.unwrap());
        assert!(!store.compare_and_swap("k", "old", "newer", 60).await.unwrap());
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("new"));
    }

    #[tokio::test]
    async fn missing_key_never_swaps() {
        let store = MockStore::new();
        assert!(!store.compare_and_swap("absent", "", "x", 60).await.unwrap());
        assert!(!store.exists("absent").await.unwrap());
    }

    #[tokio::test]
    async fn guarded_set_needs_an_unchanged_guard() {
        let store = MockStore::new();
        assert!(store.set_ex_if_guard("k", "a", 60, "v", "0").await.unwrap());

        assert_eq!(store.incr("v").await.unwrap(), 1);
        assert!(!store.set_ex_if_guard("k", "b", 60, "v", "0").await.unwrap());
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("a"));

        assert!(store.set_ex_if_guard("k", "c", 60, "v", "1").await.unwrap());
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("c"));
    }

    #[tokio::test]
    async fn offline_store_reports_timeout() {
        let store = MockStore::new();
        store.set_offline(true);
        assert!(matches!(
            store.get("k").await,
            Err(ServiceError::StoreTimeout(_))
        ));
    }

    #[tokio::test]
    async fn ttl_is_tracked() {
        let store = MockStore::new();
        store.set_ex("k", "v", 120).await.unwrap();
        let ttl = store.ttl("k").unwrap();
        assert!(ttl > Duration::from_secs(110) && ttl <= Duration::from_secs(120));
        assert!(store.delete("k").await.unwrap());
        assert!(store.ttl("k").is_none());
    }

    #[test]
    fn key_layout() {
        let id = uuid::Uuid::nil();
        assert_eq!(keys::refresh_token("u1"), "refresh_token:u1");
        assert_eq!(keys::revoked_token("t"), "revoked_token:t");
        assert_eq!(keys::rules(id), format!("rules:{}", id));
        assert_eq!(keys::rules_version(id), format!("rules_version:{}", id));
        assert_eq!(
            keys::pending_registration(id),
            format!("pending_registration:{}", id)
        );
    }
}
