//! Fixed-window rate limiting for unlicensed bot traffic.
//!
//! Counters live in a [`CounterStore`]. The production store is Redis, so that
//! every gateway instance shares one budget per key and the gateway process
//! itself holds no mutable counters. An in-memory store with identical
//! semantics exists for single-instance development and tests.
//!
//! Algorithm, per request:
//! 1. atomically increment the counter for the key
//! 2. if the counter has no expiry yet, set it to the window length
//! 3. allow iff the new value is at most the threshold
//!
//! Steps 1 and 2 run as a single server-side script in Redis, so a dropped
//! connection can never leave a counter without a TTL.
//!
//! Bursts straddling a window boundary can admit up to twice the threshold.
//! That is acceptable here because the limiter only gates the path that ends
//! in a redirect to the authorization endpoint.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use redis::aio::ConnectionManager;
use redis::Script;
use sha2::{Digest, Sha256};
use tokio::sync::OnceCell;

use crate::metrics::RATE_LIMIT_DECISIONS;

/// Hex characters of the User-Agent digest kept in the key.
const UA_HASH_LEN: usize = 16;

/// INCR plus PEXPIRE in one atomic step. The expiry is also re-applied to a
/// counter found without one.
const INCREMENT_SCRIPT: &str = r#"
local count = redis.call('INCR', KEYS[1])
if count == 1 or redis.call('PTTL', KEYS[1]) < 0 then
    redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
return count
"#;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("counter store timed out after {0:?}")]
    Timeout(Duration),
    #[error("counter store unavailable: {0}")]
    Unavailable(String),
}

/// Client IP plus a truncated digest of the normalized User-Agent.
///
/// Near-identical clients (same IP, same agent string modulo case and
/// surrounding whitespace) share a budget without the full User-Agent being
/// stored.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateLimitKey {
    client_ip: String,
    ua_hash: String,
}

impl RateLimitKey {
    pub fn new(client_ip: &str, user_agent: &str) -> Self {
        let normalized = user_agent.trim().to_ascii_lowercase();
        let digest = format!("{:x}", Sha256::digest(normalized.as_bytes()));
        Self {
            client_ip: client_ip.to_string(),
            ua_hash: digest[..UA_HASH_LEN].to_string(),
        }
    }

    pub fn as_store_key(&self) -> String {
        format!("{}:{}", self.client_ip, self.ua_hash)
    }
}

/// Keyed atomic increment-with-expiry.
pub trait CounterStore: Send + Sync {
    /// Increment the counter for `key` and return the post-increment value.
    /// The expiry is set to `window` only when the value goes from 0 to 1.
    fn increment(
        &self,
        key: &str,
        window: Duration,
    ) -> impl Future<Output = Result<u64, StoreError>> + Send;
}

/// Redis-backed store shared across gateway instances.
///
/// The connection is established lazily and retried on the next call after a
/// failure, so an unreachable Redis at boot does not keep the gateway down.
pub struct RedisCounterStore {
    client: redis::Client,
    connection: OnceCell<ConnectionManager>,
    increment_script: Script,
    key_prefix: String,
}

impl std::fmt::Debug for RedisCounterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCounterStore")
            .field("key_prefix", &self.key_prefix)
            .field("connected", &self.connection.initialized())
            .finish_non_exhaustive()
    }
}

impl RedisCounterStore {
    /// Parse the URL without connecting.
    pub fn open(url: &str, key_prefix: impl Into<String>) -> Result<Self, StoreError> {
        Ok(Self {
            client: redis::Client::open(url)?,
            connection: OnceCell::new(),
            increment_script: Script::new(INCREMENT_SCRIPT),
            key_prefix: key_prefix.into(),
        })
    }

    async fn connection(&self) -> Result<ConnectionManager, StoreError> {
        let conn = self
            .connection
            .get_or_try_init(|| async {
                let conn = ConnectionManager::new(self.client.clone()).await?;
                tracing::info!(prefix = %self.key_prefix, "connected to redis counter store");
                Ok::<_, StoreError>(conn)
            })
            .await?;
        Ok(conn.clone())
    }
}

impl CounterStore for RedisCounterStore {
    async fn increment(&self, key: &str, window: Duration) -> Result<u64, StoreError> {
        let key = format!("{}{}", self.key_prefix, key);
        let window_ms = u64::try_from(window.as_millis()).unwrap_or(u64::MAX).max(1);
        let mut conn = self.connection().await?;

        let count: u64 = self
            .increment_script
            .key(&key)
            .arg(window_ms)
            .invoke_async(&mut conn)
            .await?;
        Ok(count)
    }
}

/// Process-local store. Counters are not shared between instances.
///
/// Expired counters are swept inline, at most once per window, so the map only
/// holds keys seen recently.
#[derive(Debug)]
pub struct MemoryCounterStore {
    counters: Mutex<MemoryCounters>,
}

#[derive(Debug)]
struct MemoryCounters {
    entries: HashMap<String, (u64, Instant)>,
    next_sweep: Instant,
}

impl MemoryCounters {
    fn sweep(&mut self, now: Instant, window: Duration) {
        if now < self.next_sweep {
            return;
        }
        let before = self.entries.len();
        self.entries.retain(|_, (_, expires_at)| *expires_at > now);
        let evicted = before - self.entries.len();
        if evicted > 0 {
            tracing::debug!(evicted, remaining = self.entries.len(), "swept expired counters");
        }
        self.next_sweep = now + window;
    }
}

impl Default for MemoryCounterStore {
    fn default() -> Self {
        Self {
            counters: Mutex::new(MemoryCounters {
                entries: HashMap::new(),
                next_sweep: Instant::now(),
            }),
        }
    }
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CounterStore for MemoryCounterStore {
    async fn increment(&self, key: &str, window: Duration) -> Result<u64, StoreError> {
        let now = Instant::now();
        let mut counters = self
            .counters
            .lock()
            .map_err(|_| StoreError::Unavailable("counter map poisoned".to_string()))?;
        counters.sweep(now, window);

        let entry = counters.entries.entry(key.to_string()).or_insert((0, now));
        if entry.0 > 0 && entry.1 <= now {
            *entry = (0, now);
        }

        entry.0 += 1;
        if entry.0 == 1 {
            entry.1 = now + window;
        }
        Ok(entry.0)
    }
}

/// The store selected at startup.
#[derive(Debug)]
pub enum CounterBackend {
    Redis(RedisCounterStore),
    Memory(MemoryCounterStore),
}

impl CounterBackend {
    pub fn name(&self) -> &'static str {
        match self {
            CounterBackend::Redis(_) => "redis",
            CounterBackend::Memory(_) => "memory",
        }
    }
}

impl CounterStore for CounterBackend {
    async fn increment(&self, key: &str, window: Duration) -> Result<u64, StoreError> {
        match self {
            CounterBackend::Redis(store) => store.increment(key, window).await,
            CounterBackend::Memory(store) => store.increment(key, window).await,
        }
    }
}

/// What the limiter answers when the counter store cannot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Allow the request. Availability over strict enforcement.
    Open,
    /// Reject the request.
    Closed,
}

impl FailurePolicy {
    fn allows(self) -> bool {
        matches!(self, FailurePolicy::Open)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RateLimitSettings {
    pub window: Duration,
    pub max_requests: u64,
    pub failure_policy: FailurePolicy,
    pub store_timeout: Duration,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            max_requests: 10,
            failure_policy: FailurePolicy::Open,
            store_timeout: Duration::from_secs(1),
        }
    }
}

#[derive(Debug)]
pub struct RateLimiter<S> {
    store: S,
    settings: RateLimitSettings,
}

impl<S: CounterStore> RateLimiter<S> {
    pub fn new(store: S, settings: RateLimitSettings) -> Self {
        Self { store, settings }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Returns true when `key` is within budget for the current window.
    pub async fn allow(&self, key: &RateLimitKey) -> bool {
        let store_key = key.as_store_key();
        let result = tokio::time::timeout(
            self.settings.store_timeout,
            self.store.increment(&store_key, self.settings.window),
        )
        .await
        .unwrap_or(Err(StoreError::Timeout(self.settings.store_timeout)));

        match result {
            Ok(count) if count <= self.settings.max_requests => {
                RATE_LIMIT_DECISIONS.with_label_values(&["allowed"]).inc();
                tracing::debug!(key = %store_key, count, "rate limit check passed");
                true
            }
            Ok(count) => {
                RATE_LIMIT_DECISIONS.with_label_values(&["limited"]).inc();
                tracing::info!(
                    key = %store_key,
                    count,
                    max = self.settings.max_requests,
                    "rate limit exceeded"
                );
                false
            }
            Err(e) => {
                RATE_LIMIT_DECISIONS.with_label_values(&["store_error"]).inc();
                let allowed = self.settings.failure_policy.allows();
                tracing::warn!(
                    key = %store_key,
                    error = %e,
                    allowed,
                    "counter store failed, applying failure policy"
                );
                allowed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    /// A store that is never reachable.
    struct UnreachableStore;

    impl CounterStore for UnreachableStore {
        async fn increment(&self, _key: &str, _window: Duration) -> Result<u64, StoreError> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }
    }

    /// A store that never answers.
    struct HangingStore;

    impl CounterStore for HangingStore {
        async fn increment(&self, _key: &str, _window: Duration) -> Result<u64, StoreError> {
            std::future::pending().await
        }
    }

    fn settings(window: Duration, max_requests: u64) -> RateLimitSettings {
        RateLimitSettings {
            window,
            max_requests,
            ..RateLimitSettings::default()
        }
    }

    #[test]
    fn test_key_groups_near_identical_agents() {
        let a = RateLimitKey::new("203.0.113.9", "ClaudeBot/1.0");
        let b = RateLimitKey::new("203.0.113.9", "  claudebot/1.0 ");
        let c = RateLimitKey::new("203.0.113.10", "ClaudeBot/1.0");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.as_store_key().len(), "203.0.113.9:".len() + UA_HASH_LEN);
        assert!(a.as_store_key().starts_with("203.0.113.9:"));
        assert!(!a.as_store_key().contains("ClaudeBot"));
    }

    #[tokio::test]
    async fn test_first_n_allowed_then_limited() {
        let limiter = RateLimiter::new(
            MemoryCounterStore::new(),
            settings(Duration::from_secs(60), 10),
        );
        let key = RateLimitKey::new("198.51.100.1", "ClaudeBot");

        for i in 1..=10 {
            assert!(limiter.allow(&key).await, "request {i} should pass");
        }
        assert!(!limiter.allow(&key).await);
        assert!(!limiter.allow(&key).await);
    }

    #[tokio::test]
    async fn test_keys_have_independent_budgets() {
        let limiter = RateLimiter::new(
            MemoryCounterStore::new(),
            settings(Duration::from_secs(60), 1),
        );
        let gpt = RateLimitKey::new("198.51.100.1", "GPTBot");
        let claude = RateLimitKey::new("198.51.100.1", "ClaudeBot");

        assert!(limiter.allow(&gpt).await);
        assert!(!limiter.allow(&gpt).await);
        assert!(limiter.allow(&claude).await);
    }

    #[tokio::test]
    async fn test_counter_resets_after_window() {
        let limiter = RateLimiter::new(
            MemoryCounterStore::new(),
            settings(Duration::from_millis(50), 2),
        );
        let key = RateLimitKey::new("198.51.100.2", "CCBot");

        assert!(limiter.allow(&key).await);
        assert!(limiter.allow(&key).await);
        assert!(!limiter.allow(&key).await);

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(limiter.allow(&key).await);
    }

    #[tokio::test]
    async fn test_expiry_is_set_once_per_window() {
        let store = MemoryCounterStore::new();
        let window = Duration::from_millis(100);

        assert_eq!(store.increment("k", window).await.unwrap(), 1);
        tokio::time::sleep(Duration::from_millis(30)).await;
        // A later hit must not push the expiry out
        assert_eq!(store.increment("k", window).await.unwrap(), 2);
        tokio::time::sleep(Duration::from_millis(90)).await;
        assert_eq!(store.increment("k", window).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_expired_counters_are_evicted() {
        let store = MemoryCounterStore::new();
        let window = Duration::from_millis(1);
        for i in 0..10_000 {
            store.increment(&format!("198.51.100.9:{i}"), window).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        store.increment("fresh", window).await.unwrap();
        let counters = store.counters.lock().unwrap();
        assert_eq!(counters.entries.len(), 1);
        assert!(counters.entries.contains_key("fresh"));
    }

    #[tokio::test]
    async fn test_sweep_keeps_live_counters() {
        let store = MemoryCounterStore::new();
        store.increment("short", Duration::from_millis(10)).await.unwrap();
        store.increment("long", Duration::from_secs(60)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(store.increment("long", Duration::from_millis(10)).await.unwrap(), 2);
        let counters = store.counters.lock().unwrap();
        assert!(!counters.entries.contains_key("short"));
        assert!(counters.entries.contains_key("long"));
    }

    #[tokio::test]
    async fn test_unreachable_store_fails_open() {
        let limiter = RateLimiter::new(UnreachableStore, settings(Duration::from_secs(60), 1));
        let key = RateLimitKey::new("198.51.100.3", "GPTBot");
        for _ in 0..20 {
            assert!(limiter.allow(&key).await);
        }
    }

    #[tokio::test]
    async fn test_unreachable_store_fails_closed_when_configured() {
        let limiter = RateLimiter::new(
            UnreachableStore,
            RateLimitSettings {
                failure_policy: FailurePolicy::Closed,
                ..RateLimitSettings::default()
            },
        );
        let key = RateLimitKey::new("198.51.100.3", "GPTBot");
        assert!(!limiter.allow(&key).await);
    }

    #[tokio::test]
    async fn test_slow_store_times_out_and_fails_open() {
        let limiter = RateLimiter::new(
            HangingStore,
            RateLimitSettings {
                store_timeout: Duration::from_millis(20),
                ..RateLimitSettings::default()
            },
        );
        let key = RateLimitKey::new("198.51.100.4", "Bytespider");
        assert!(limiter.allow(&key).await);
    }

    #[tokio::test]
    async fn test_redis_unreachable_fails_open() {
        // Nothing listens on port 1
        let store = RedisCounterStore::open("redis://127.0.0.1:1/", "test:").unwrap();
        let limiter = RateLimiter::new(
            CounterBackend::Redis(store),
            RateLimitSettings {
                max_requests: 0,
                store_timeout: Duration::from_millis(500),
                ..RateLimitSettings::default()
            },
        );
        let key = RateLimitKey::new("198.51.100.5", "GPTBot");
        assert!(limiter.allow(&key).await);
    }

    /// Redis stand-in speaking just enough RESP to serve the counter script.
    struct FakeRedis {
        url: String,
        commands: Arc<Mutex<Vec<Vec<String>>>>,
    }

    impl FakeRedis {
        /// Commands other than connection setup.
        fn counter_commands(&self) -> Vec<Vec<String>> {
            self.commands
                .lock()
                .unwrap()
                .iter()
                .filter(|cmd| !cmd[0].eq_ignore_ascii_case("CLIENT"))
                .cloned()
                .collect()
        }
    }

    async fn read_command<R>(reader: &mut R) -> Option<Vec<String>>
    where
        R: tokio::io::AsyncBufRead + Unpin,
    {
        use tokio::io::{AsyncBufReadExt, AsyncReadExt};

        let mut line = String::new();
        if reader.read_line(&mut line).await.ok()? == 0 {
            return None;
        }
        let argc: usize = line.trim_end().strip_prefix('*')?.parse().ok()?;
        let mut args = Vec::with_capacity(argc);
        for _ in 0..argc {
            line.clear();
            reader.read_line(&mut line).await.ok()?;
            let len: usize = line.trim_end().strip_prefix('$')?.parse().ok()?;
            let mut buf = vec![0u8; len + 2];
            reader.read_exact(&mut buf).await.ok()?;
            buf.truncate(len);
            args.push(String::from_utf8_lossy(&buf).into_owned());
        }
        Some(args)
    }

    /// With `drop_first_update`, the connection is closed instead of answering
    /// the first counter update.
    async fn fake_redis(drop_first_update: bool) -> FakeRedis {
        use tokio::io::{AsyncWriteExt, BufReader};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("redis://{}/", listener.local_addr().unwrap());
        let commands = Arc::new(Mutex::new(Vec::new()));
        let counts = Arc::new(Mutex::new(HashMap::<String, u64>::new()));
        let dropped = Arc::new(AtomicBool::new(!drop_first_update));

        let log = commands.clone();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let (log, counts, dropped) = (log.clone(), counts.clone(), dropped.clone());
                tokio::spawn(async move {
                    let (read, mut write) = socket.into_split();
                    let mut reader = BufReader::new(read);
                    while let Some(cmd) = read_command(&mut reader).await {
                        log.lock().unwrap().push(cmd.clone());
                        let reply = match cmd[0].to_ascii_uppercase().as_str() {
                            "EVALSHA" | "EVAL" => {
                                if !dropped.swap(true, Ordering::SeqCst) {
                                    return;
                                }
                                let mut counts = counts.lock().unwrap();
                                let count = counts.entry(cmd[3].clone()).or_insert(0);
                                *count += 1;
                                format!(":{count}\r\n")
                            }
                            _ => "+OK\r\n".to_string(),
                        };
                        if write.write_all(reply.as_bytes()).await.is_err() {
                            return;
                        }
                    }
                });
            }
        });

        FakeRedis { url, commands }
    }

    #[tokio::test]
    async fn test_redis_update_is_a_single_script_call() {
        let redis = fake_redis(false).await;
        let store = RedisCounterStore::open(&redis.url, "rl:").unwrap();

        for expected in 1..=3 {
            let count = store.increment("k", Duration::from_secs(60)).await.unwrap();
            assert_eq!(count, expected);
        }

        let updates = redis.counter_commands();
        assert_eq!(updates.len(), 3);
        for cmd in &updates {
            assert_eq!(cmd[0], "EVALSHA");
            assert_eq!(&cmd[2..], ["1", "rl:k", "60000"]);
        }
    }

    #[tokio::test]
    async fn test_redis_expiry_survives_dropped_connection() {
        let redis = fake_redis(true).await;
        let store = RedisCounterStore::open(&redis.url, "rl:").unwrap();
        let window = Duration::from_secs(60);

        let first = tokio::time::timeout(Duration::from_secs(2), store.increment("k", window)).await;
        assert!(!matches!(first, Ok(Ok(_))));

        let mut counts = Vec::new();
        for _ in 0..50 {
            if let Ok(count) = store.increment("k", window).await {
                counts.push(count);
            }
            if counts.len() == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(counts, [1, 2, 3]);

        // Every update, including the ones after reconnecting, carries the window
        let updates = redis.counter_commands();
        assert!(updates.len() >= 4);
        for cmd in &updates {
            assert_eq!(cmd[0], "EVALSHA");
            assert_eq!(cmd.last().map(String::as_str), Some("60000"));
        }
    }

    #[test]
    fn test_redis_open_rejects_bad_url() {
        assert!(RedisCounterStore::open("not a url", "x:").is_err());
    }
}
