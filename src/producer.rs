//! Producer traits describing value sources.
//!
//! A producer recomputes the authoritative value for a key. The registry
//! routes keys to producers by longest matching prefix, so one engine can
//! serve several key families.

use std::collections::HashSet;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

use crate::error::ProduceError;
use crate::lock::recover;

const SOURCE: &str = "producer";

/// Output of a producer call: the fresh value plus optional overrides for
/// the entry's tags and freshness windows.
#[derive(Debug, Clone)]
pub struct Produced {
    pub value: Bytes,
    pub tags: HashSet<String>,
    pub stale_in: Option<Duration>,
    pub expire_in: Option<Duration>,
}

impl Produced {
    pub fn new(value: impl Into<Bytes>) -> Self {
        Self {
            value: value.into(),
            tags: HashSet::new(),
            stale_in: None,
            expire_in: None,
        }
    }

    pub fn with_tags<I, T>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_freshness(mut self, stale_in: Duration, expire_in: Duration) -> Self {
        self.stale_in = Some(stale_in);
        self.expire_in = Some(expire_in);
        self
    }
}

/// Recomputes the value for a cache key from its source of truth.
#[async_trait]
pub trait Producer: Send + Sync {
    async fn produce(&self, key: &str) -> Result<Produced, ProduceError>;
}

struct Route {
    prefix: String,
    producer: Arc<dyn Producer>,
}

/// Routes keys to producers by longest matching prefix. An empty prefix
/// acts as a catch-all.
#[derive(Default)]
pub struct ProducerRegistry {
    routes: RwLock<Vec<Route>>,
}

impl ProducerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a producer for a key prefix, replacing any producer
    /// previously registered for the same prefix.
    pub fn register(&self, prefix: impl Into<String>, producer: Arc<dyn Producer>) {
        let prefix = prefix.into();
        let mut routes = recover(self.routes.write(), SOURCE, "register");
        routes.retain(|route| route.prefix != prefix);
        debug!(prefix = %prefix, "Producer registered");
        routes.push(Route { prefix, producer });
        // Longest prefix first so resolve can take the first match.
        routes.sort_by(|a, b| {
            b.prefix
                .len()
                .cmp(&a.prefix.len())
                .then_with(|| a.prefix.cmp(&b.prefix))
        });
    }

    pub fn unregister(&self, prefix: &str) -> bool {
        let mut routes = recover(self.routes.write(), SOURCE, "unregister");
        let before = routes.len();
        routes.retain(|route| route.prefix != prefix);
        routes.len() != before
    }

    /// The most specific producer for this key, if any is registered.
    pub fn resolve(&self, key: &str) -> Option<Arc<dyn Producer>> {
        recover(self.routes.read(), SOURCE, "resolve")
            .iter()
            .find(|route| key.starts_with(&route.prefix))
            .map(|route| Arc::clone(&route.producer))
    }

    pub fn len(&self) -> usize {
        recover(self.routes.read(), SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
