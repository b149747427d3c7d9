use std::collections::HashMap;
use std::future::Future;
use std::sync::{Mutex, MutexGuard};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};

use crate::domain::ItemId;
use crate::query::Resolution;

/// How concurrent lookups of the same uncached id behave.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InflightPolicy {
    /// Every caller that misses runs its own resolver; the last write wins.
    Independent,
    /// Callers that miss while a resolution is running await that one.
    Collapse,
}

enum Slot {
    Ready(Resolution),
    Pending(Shared<BoxFuture<'static, Resolution>>),
}

/// Session-lifetime memo of dish resolutions. Entries are never evicted,
/// and "no data" outcomes are cached like any other.
pub struct DishCache {
    policy: InflightPolicy,
    slots: Mutex<HashMap<ItemId, Slot>>,
}

impl DishCache {
    pub fn new(policy: InflightPolicy) -> Self {
        Self {
            policy,
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get_or_fetch<F, Fut>(&self, item_id: ItemId, resolver: F) -> Resolution
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Resolution> + Send + 'static,
    {
        match self.policy {
            InflightPolicy::Independent => self.fetch_independent(item_id, resolver).await,
            InflightPolicy::Collapse => self.fetch_collapsed(item_id, resolver).await,
        }
    }

    /// The settled value for `item_id`, if any.
    pub fn peek(&self, item_id: ItemId) -> Option<Resolution> {
        match self.lock().get(&item_id) {
            Some(Slot::Ready(resolution)) => Some(resolution.clone()),
            _ => None,
        }
    }

    /// Settled entries only.
    pub fn len(&self) -> usize {
        self.lock()
            .values()
            .filter(|slot| matches!(slot, Slot::Ready(_)))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    async fn fetch_independent<F, Fut>(&self, item_id: ItemId, resolver: F) -> Resolution
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Resolution> + Send + 'static,
    {
        if let Some(cached) = self.peek(item_id) {
            tracing::debug!(%item_id, "using cached dish");
            return cached;
        }
        let resolution = resolver().await;
        self.lock().insert(item_id, Slot::Ready(resolution.clone()));
        resolution
    }

    async fn fetch_collapsed<F, Fut>(&self, item_id: ItemId, resolver: F) -> Resolution
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Resolution> + Send + 'static,
    {
        let pending = {
            let mut slots = self.lock();
            match slots.get(&item_id) {
                Some(Slot::Ready(resolution)) => {
                    tracing::debug!(%item_id, "using cached dish");
                    return resolution.clone();
                }
                Some(Slot::Pending(shared)) => {
                    tracing::debug!(%item_id, "joining in-flight dish query");
                    shared.clone()
                }
                None => {
                    let shared = resolver().boxed().shared();
                    slots.insert(item_id, Slot::Pending(shared.clone()));
                    shared
                }
            }
        };
        let resolution = pending.await;
        self.lock().insert(item_id, Slot::Ready(resolution.clone()));
        resolution
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ItemId, Slot>> {
        self.slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
