/*!
In-memory, ttl-bounded session store.

The store is owned by the tide state and handed to every handler
explicitly. Keys are HMAC signatures of the cookie-held session id, see
`crypto::hmac_sign`. Concurrent requests from the same browser session
race on read-modify-write; the last `put` wins, which is the documented
behavior for two tabs racing a refresh.
*/
use async_mutex::Mutex;
use cached::stores::TimedCache;
use cached::Cached;
use std::sync::Arc;

use crate::models::Session;

#[derive(Clone)]
pub struct SessionStore {
    inner: Arc<Mutex<TimedCache<String, Session>>>,
}

impl SessionStore {
    pub fn new(lifespan_seconds: u64) -> Self {
        SessionStore {
            inner: Arc::new(Mutex::new(TimedCache::with_lifespan(lifespan_seconds))),
        }
    }

    pub async fn get(&self, key: &str) -> Option<Session> {
        let mut lock = self.inner.lock().await;
        lock.cache_get(&key.to_string()).cloned()
    }

    pub async fn put(&self, key: String, session: Session) {
        let mut lock = self.inner.lock().await;
        lock.cache_set(key, session);
    }
}
