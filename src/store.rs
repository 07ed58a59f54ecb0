//! The contract the rest of the crate needs from a Redis-like key/list store, plus two
//! implementations: a real one backed by `deadpool-redis`, and an in-process fake used by the
//! unit tests in `queue.rs` and `worker.rs` so they don't require a live Redis.

use async_trait::async_trait;
use redis::AsyncCommands;
use std::time::Duration;

use crate::error::Error;

#[async_trait]
pub trait Store: Send + Sync {
    async fn rpush(&self, key: &str, value: Vec<u8>) -> Result<(), Error>;
    async fn lpush(&self, key: &str, value: Vec<u8>) -> Result<(), Error>;

    /// Blocking left-pop with a bounded wait. Returns `None` if the timeout elapses with no
    /// element available.
    async fn blpop(&self, key: &str, timeout: Duration) -> Result<Option<Vec<u8>>, Error>;

    async fn lrange(&self, key: &str) -> Result<Vec<Vec<u8>>, Error>;

    /// Remove every occurrence of `value` from the list at `key`. Returns the count removed.
    async fn lrem(&self, key: &str, value: &[u8]) -> Result<usize, Error>;

    async fn llen(&self, key: &str) -> Result<usize, Error>;

    async fn get(&self, key: &str) -> Result<Option<String>, Error>;

    /// Set a string key, optionally with an expiration in seconds.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), Error>;

    async fn delete(&self, key: &str) -> Result<(), Error>;

    async fn ping(&self) -> Result<(), Error>;
}

pub struct RedisStore {
    pool: deadpool_redis::Pool,
}

impl RedisStore {
    pub fn new(pool: deadpool_redis::Pool) -> RedisStore {
        RedisStore { pool }
    }

    pub fn from_url(url: &str) -> Result<RedisStore, Error> {
        let pool = deadpool_redis::Config {
            url: Some(url.to_string()),
            connection: None,
            pool: None,
        }
        .create_pool()?;
        Ok(RedisStore::new(pool))
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn rpush(&self, key: &str, value: Vec<u8>) -> Result<(), Error> {
        let mut conn = self.pool.get().await?;
        conn.rpush(key, value).await?;
        Ok(())
    }

    async fn lpush(&self, key: &str, value: Vec<u8>) -> Result<(), Error> {
        let mut conn = self.pool.get().await?;
        conn.lpush(key, value).await?;
        Ok(())
    }

    async fn blpop(&self, key: &str, timeout: Duration) -> Result<Option<Vec<u8>>, Error> {
        let mut conn = self.pool.get().await?;
        let result: Option<(String, Vec<u8>)> =
            conn.blpop(key, timeout.as_secs_f64().ceil() as usize).await?;
        Ok(result.map(|(_, value)| value))
    }

    async fn lrange(&self, key: &str) -> Result<Vec<Vec<u8>>, Error> {
        let mut conn = self.pool.get().await?;
        Ok(conn.lrange(key, 0, -1).await?)
    }

    async fn lrem(&self, key: &str, value: &[u8]) -> Result<usize, Error> {
        let mut conn = self.pool.get().await?;
        Ok(conn.lrem(key, 0, value).await?)
    }

    async fn llen(&self, key: &str) -> Result<usize, Error> {
        let mut conn = self.pool.get().await?;
        Ok(conn.llen(key).await?)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, Error> {
        let mut conn = self.pool.get().await?;
        Ok(conn.get(key).await?)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), Error> {
        let mut conn = self.pool.get().await?;
        match ttl {
            Some(ttl) => conn.set_ex(key, value, ttl.as_secs() as usize).await?,
            None => conn.set(key, value).await?,
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), Error> {
        let mut conn = self.pool.get().await?;
        conn.del(key).await?;
        Ok(())
    }

    async fn ping(&self) -> Result<(), Error> {
        let mut conn = self.pool.get().await?;
        redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

/// Exercises [`RedisStore`] against a live instance. Gated behind `test-redis` (bundled into
/// `test-all`) since it requires `REDIS_URL` to point at a real server; the rest of the suite
/// runs against [`MemoryStore`] and needs nothing external.
#[cfg(feature = "test-redis")]
mod redis_integration {
    use super::*;
    use futures::FutureExt;

    async fn with_redis_store<T, Fut>(test: T)
    where
        T: FnOnce(RedisStore, String) -> Fut,
        Fut: std::future::Future<Output = Result<(), Error>>,
    {
        dotenv::dotenv().ok();
        let url = std::env::var("REDIS_URL").expect("REDIS_URL must be set for test-redis");
        let store = RedisStore::from_url(&url).expect("building redis pool");
        let key = format!("taskbroker-test:{}", uuid::Uuid::new_v4());

        let result = std::panic::AssertUnwindSafe(test(RedisStore::new(store.pool.clone()), key.clone()))
            .catch_unwind()
            .await;

        store.delete(&key).await.ok();
        store.delete(&format!("{}:processing", key)).await.ok();

        result.expect("panicked").expect("store error");
    }

    #[tokio::test]
    async fn rpush_then_blpop_round_trips() {
        with_redis_store(|store, key| async move {
            store.ping().await?;
            store.rpush(&key, b"hello".to_vec()).await?;
            let popped = store.blpop(&key, Duration::from_secs(1)).await?;
            assert_eq!(popped, Some(b"hello".to_vec()));
            Ok(())
        })
        .await;
    }

    #[tokio::test]
    async fn lrem_removes_exact_value_only() {
        with_redis_store(|store, key| async move {
            store.rpush(&key, b"a".to_vec()).await?;
            store.rpush(&key, b"b".to_vec()).await?;
            store.rpush(&key, b"a".to_vec()).await?;
            let removed = store.lrem(&key, b"a").await?;
            assert_eq!(removed, 2);
            assert_eq!(store.llen(&key).await?, 1);
            Ok(())
        })
        .await;
    }

    #[tokio::test]
    async fn set_with_ttl_expires() {
        with_redis_store(|store, key| async move {
            store
                .set(&key, "paused", Some(Duration::from_secs(1)))
                .await?;
            assert_eq!(store.get(&key).await?, Some("paused".to_string()));
            tokio::time::sleep(Duration::from_millis(1200)).await;
            assert_eq!(store.get(&key).await?, None);
            Ok(())
        })
        .await;
    }
}

pub use memory::MemoryStore;

mod memory {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tokio::time::Instant;

    #[derive(Default)]
    struct Inner {
        lists: HashMap<String, Vec<Vec<u8>>>,
        strings: HashMap<String, (String, Option<Instant>)>,
    }

    /// A single-process fake of [`Store`] good enough to drive the queue protocol and worker
    /// pool tests deterministically. Blocking pop never actually blocks: it polls the list
    /// immediately and, if empty, waits out the full timeout once before giving up, since tests
    /// push work from a concurrent task rather than relying on real blocking semantics.
    #[derive(Default)]
    pub struct MemoryStore {
        inner: Mutex<Inner>,
    }

    impl MemoryStore {
        pub fn new() -> MemoryStore {
            MemoryStore::default()
        }
    }

    #[async_trait]
    impl Store for MemoryStore {
        async fn rpush(&self, key: &str, value: Vec<u8>) -> Result<(), Error> {
            self.inner
                .lock()
                .unwrap()
                .lists
                .entry(key.to_string())
                .or_default()
                .push(value);
            Ok(())
        }

        async fn lpush(&self, key: &str, value: Vec<u8>) -> Result<(), Error> {
            self.inner
                .lock()
                .unwrap()
                .lists
                .entry(key.to_string())
                .or_default()
                .insert(0, value);
            Ok(())
        }

        async fn blpop(&self, key: &str, timeout: Duration) -> Result<Option<Vec<u8>>, Error> {
            let deadline = Instant::now() + timeout;
            loop {
                {
                    let mut inner = self.inner.lock().unwrap();
                    if let Some(list) = inner.lists.get_mut(key) {
                        if !list.is_empty() {
                            return Ok(Some(list.remove(0)));
                        }
                    }
                }
                if Instant::now() >= deadline {
                    return Ok(None);
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }

        async fn lrange(&self, key: &str) -> Result<Vec<Vec<u8>>, Error> {
            Ok(self
                .inner
                .lock()
                .unwrap()
                .lists
                .get(key)
                .cloned()
                .unwrap_or_default())
        }

        async fn lrem(&self, key: &str, value: &[u8]) -> Result<usize, Error> {
            let mut inner = self.inner.lock().unwrap();
            match inner.lists.get_mut(key) {
                Some(list) => {
                    let before = list.len();
                    list.retain(|v| v.as_slice() != value);
                    Ok(before - list.len())
                }
                None => Ok(0),
            }
        }

        async fn llen(&self, key: &str) -> Result<usize, Error> {
            Ok(self
                .inner
                .lock()
                .unwrap()
                .lists
                .get(key)
                .map(Vec::len)
                .unwrap_or(0))
        }

        async fn get(&self, key: &str) -> Result<Option<String>, Error> {
            let mut inner = self.inner.lock().unwrap();
            match inner.strings.get(key) {
                Some((_, Some(expires))) if Instant::now() >= *expires => {
                    inner.strings.remove(key);
                    Ok(None)
                }
                Some((value, _)) => Ok(Some(value.clone())),
                None => Ok(None),
            }
        }

        async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), Error> {
            let expires = ttl.map(|ttl| Instant::now() + ttl);
            self.inner
                .lock()
                .unwrap()
                .strings
                .insert(key.to_string(), (value.to_string(), expires));
            Ok(())
        }

        async fn delete(&self, key: &str) -> Result<(), Error> {
            let mut inner = self.inner.lock().unwrap();
            inner.lists.remove(key);
            inner.strings.remove(key);
            Ok(())
        }

        async fn ping(&self) -> Result<(), Error> {
            Ok(())
        }
    }
}
