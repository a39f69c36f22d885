// Shared TTL key/value cache.
//
// The cache is advisory: when the backing store cannot be reached at construction
// the store runs degraded, where every write/delete reports `false` and every read
// is a miss. Nothing here ever returns an error to callers.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::CacheConfig;
use crate::error::CacheError;

pub const METRO_LINES_KEY: &str = "metro_lines";
pub const STATIONS_KEY: &str = "stations";
pub const TRAIN_POSITIONS_KEY: &str = "train_positions";
pub const MAP_TOKEN_KEY: &str = "mapbox_token";

// ============================================================================
// Backends
// ============================================================================

/// Raw string storage with optional relative expiry.
pub trait CacheBackend: Send + Sync {
    fn ping(&self) -> Result<(), CacheError>;
    fn get_raw(&self, key: &str) -> Result<Option<String>, CacheError>;
    fn set_raw(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CacheError>;
    /// Returns whether a key was removed.
    fn delete_raw(&self, key: &str) -> Result<bool, CacheError>;
    fn describe(&self) -> String;
}

/// Redis-backed store, visible to every process sharing the server.
pub struct RedisBackend {
    client: redis::Client,
    timeout: Duration,
}

impl RedisBackend {
    pub fn open(url: &str, timeout: Duration) -> Result<Self, CacheError> {
        let client = redis::Client::open(url)?;
        Ok(RedisBackend { client, timeout })
    }

    /// A connection whose reads and writes fail after `timeout` instead of blocking.
    fn connection(&self) -> Result<redis::Connection, CacheError> {
        let conn = self.client.get_connection_with_timeout(self.timeout)?;
        conn.set_read_timeout(Some(self.timeout))?;
        conn.set_write_timeout(Some(self.timeout))?;
        Ok(conn)
    }
}

impl CacheBackend for RedisBackend {
    fn ping(&self) -> Result<(), CacheError> {
        let mut conn = self.connection()?;
        redis::cmd("PING").query::<String>(&mut conn)?;
        Ok(())
    }

    fn get_raw(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.connection()?;
        let value = redis::cmd("GET").arg(key).query::<Option<String>>(&mut conn)?;
        Ok(value)
    }

    fn set_raw(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CacheError> {
        let mut conn = self.connection()?;
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            // PX keeps sub-second TTLs; zero would be rejected by the server.
            let millis = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
            cmd.arg("PX").arg(millis);
        }
        cmd.query::<()>(&mut conn)?;
        Ok(())
    }

    fn delete_raw(&self, key: &str) -> Result<bool, CacheError> {
        let mut conn = self.connection()?;
        let removed = redis::cmd("DEL").arg(key).query::<i64>(&mut conn)?;
        Ok(removed > 0)
    }

    fn describe(&self) -> String {
        let info = self.client.get_connection_info();
        format!("redis at {}", info.addr)
    }
}

/// Process-local store. Expired entries are dropped when next read.
#[derive(Default)]
pub struct MemoryBackend {
    entries: Mutex<HashMap<String, (String, Option<Instant>)>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CacheBackend for MemoryBackend {
    fn ping(&self) -> Result<(), CacheError> {
        Ok(())
    }

    fn get_raw(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let expired = match entries.get(key) {
            None => return Ok(None),
            Some((_, Some(expires_at))) => Instant::now() >= *expires_at,
            Some((_, None)) => false,
        };
        if expired {
            entries.remove(key);
            return Ok(None);
        }
        Ok(entries.get(key).map(|(value, _)| value.clone()))
    }

    fn set_raw(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CacheError> {
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), (value.to_string(), expires_at));
        Ok(())
    }

    fn delete_raw(&self, key: &str) -> Result<bool, CacheError> {
        let removed = self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        Ok(matches!(removed, Some((_, expiry)) if expiry.is_none_or(|at| Instant::now() < at)))
    }

    fn describe(&self) -> String {
        "in-process memory".to_string()
    }
}

// ============================================================================
// Cache Store
// ============================================================================

pub struct CacheStore {
    backend: Option<Box<dyn CacheBackend>>,
}

impl CacheStore {
    /// Wraps a backend, degrading if it does not answer a ping.
    pub fn new(backend: Box<dyn CacheBackend>) -> Self {
        match backend.ping() {
            Ok(()) => {
                info!(backend = %backend.describe(), "cache connected");
                CacheStore {
                    backend: Some(backend),
                }
            }
            Err(e) => {
                warn!(
                    backend = %backend.describe(),
                    error = %e,
                    "cache unreachable, running without cache"
                );
                CacheStore { backend: None }
            }
        }
    }

    /// Picks the backend from the configured URL.
    pub fn connect(config: &CacheConfig) -> Self {
        if config.url.starts_with("memory://") {
            return Self::new(Box::new(MemoryBackend::new()));
        }
        match RedisBackend::open(&config.url, config.timeout) {
            Ok(backend) => Self::new(Box::new(backend)),
            Err(e) => {
                warn!(url = %config.url, error = %e, "invalid cache URL, running without cache");
                CacheStore { backend: None }
            }
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.backend.is_none()
    }

    /// Stores `value` as JSON. With `ttl`, the key is absent once it has elapsed.
    pub fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T, ttl: Option<Duration>) -> bool {
        let Some(backend) = &self.backend else {
            return false;
        };
        let result = serde_json::to_string(value)
            .map_err(CacheError::from)
            .and_then(|payload| backend.set_raw(key, &payload, ttl));
        match result {
            Ok(()) => {
                debug!(key, ttl_secs = ttl.map(|t| t.as_secs_f64()), "cache set");
                true
            }
            Err(e) => {
                warn!(key, error = %e, "cache write failed");
                false
            }
        }
    }

    /// Reads and decodes a key. Undecodable payloads count as a miss.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let backend = self.backend.as_ref()?;
        let payload = match backend.get_raw(key) {
            Ok(Some(payload)) => payload,
            Ok(None) => {
                debug!(key, "cache miss");
                return None;
            }
            Err(e) => {
                warn!(key, error = %e, "cache read failed");
                return None;
            }
        };
        match serde_json::from_str(&payload) {
            Ok(value) => {
                debug!(key, "cache hit");
                Some(value)
            }
            Err(e) => {
                warn!(key, error = %e, "cached payload does not decode, ignoring");
                None
            }
        }
    }

    pub fn delete(&self, key: &str) -> bool {
        let Some(backend) = &self.backend else {
            return false;
        };
        match backend.delete_raw(key) {
            Ok(removed) => removed,
            Err(e) => {
                warn!(key, error = %e, "cache delete failed");
                false
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread;

    /// A backend whose server is never there.
    pub(crate) struct UnreachableBackend;

    impl CacheBackend for UnreachableBackend {
        fn ping(&self) -> Result<(), CacheError> {
            Err(CacheError::Unavailable("connection refused".to_string()))
        }
        fn get_raw(&self, _key: &str) -> Result<Option<String>, CacheError> {
            panic!("degraded store must not touch the backend");
        }
        fn set_raw(
            &self,
            _key: &str,
            _value: &str,
            _ttl: Option<Duration>,
        ) -> Result<(), CacheError> {
            panic!("degraded store must not touch the backend");
        }
        fn delete_raw(&self, _key: &str) -> Result<bool, CacheError> {
            panic!("degraded store must not touch the backend");
        }
        fn describe(&self) -> String {
            "unreachable".to_string()
        }
    }

    pub(crate) fn memory_store() -> CacheStore {
        CacheStore::new(Box::new(MemoryBackend::new()))
    }

    pub(crate) fn degraded_store() -> CacheStore {
        CacheStore::new(Box::new(UnreachableBackend))
    }

    #[test]
    fn set_then_get_round_trips() {
        let store = memory_store();
        let payload = json!({"lines": ["50", "51"], "count": 2, "nested": {"ok": true}});
        assert!(store.set("k", &payload, Some(Duration::from_secs(60))));
        assert_eq!(store.get::<serde_json::Value>("k"), Some(payload));
    }

    #[test]
    fn entry_is_absent_after_ttl() {
        let store = memory_store();
        assert!(store.set("short", &vec![1, 2, 3], Some(Duration::from_millis(300))));
        assert_eq!(store.get::<Vec<i32>>("short"), Some(vec![1, 2, 3]));
        thread::sleep(Duration::from_millis(450));
        assert_eq!(store.get::<Vec<i32>>("short"), None);
    }

    #[test]
    fn no_ttl_means_no_expiry() {
        let store = memory_store();
        assert!(store.set("forever", "value", None));
        thread::sleep(Duration::from_millis(50));
        assert_eq!(store.get::<String>("forever").as_deref(), Some("value"));
    }

    #[test]
    fn delete_reports_removal() {
        let store = memory_store();
        store.set("gone", &1, None);
        assert!(store.delete("gone"));
        assert!(!store.delete("gone"));
        assert_eq!(store.get::<i32>("gone"), None);
    }

    #[test]
    fn wrong_shape_is_a_miss() {
        let store = memory_store();
        store.set("k", "not a list", None);
        assert_eq!(store.get::<Vec<String>>("k"), None);
    }

    #[test]
    fn unreachable_backend_degrades_without_raising() {
        let store = degraded_store();
        assert!(store.is_degraded());
        assert!(!store.set("k", &json!([1]), Some(Duration::from_secs(5))));
        assert!(!store.delete("k"));
        assert_eq!(store.get::<serde_json::Value>("k"), None);
    }

    #[test]
    fn memory_url_selects_memory_backend() {
        let config = CacheConfig {
            url: "memory://".to_string(),
            network_ttl: Duration::from_secs(60),
            timeout: Duration::from_millis(100),
        };
        let store = CacheStore::connect(&config);
        assert!(!store.is_degraded());
    }

    #[test]
    fn bad_redis_url_degrades() {
        let config = CacheConfig {
            url: "not a url".to_string(),
            network_ttl: Duration::from_secs(60),
            timeout: Duration::from_millis(100),
        };
        assert!(CacheStore::connect(&config).is_degraded());
    }

    /// A server that completes the client handshake, then never answers a command.
    fn stalled_redis() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            let Ok((mut socket, _)) = listener.accept() else {
                return;
            };
            let mut buf = [0u8; 4096];
            while let Ok(n) = socket.read(&mut buf) {
                if n == 0 {
                    break;
                }
                let request = String::from_utf8_lossy(&buf[..n]);
                if !request.contains("CLIENT") {
                    continue;
                }
                let commands = request.lines().filter(|l| l.starts_with('*')).count();
                if socket.write_all("+OK\r\n".repeat(commands).as_bytes()).is_err() {
                    break;
                }
            }
        });
        format!("redis://{}", addr)
    }

    #[test]
    fn stalled_server_times_out_instead_of_blocking() {
        let backend = RedisBackend::open(&stalled_redis(), Duration::from_millis(200)).unwrap();
        let started = Instant::now();
        assert!(backend.get_raw("metro_lines").is_err());
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
