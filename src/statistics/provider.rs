//! Interchangeable statistics read paths

use crate::config::ProviderKind;
use crate::error::Result;
use crate::kv::SharedKv;
use crate::model::{ExportKey, FileKey, ObjectKey, ReceiverKey, SliceKey, StatsByType};
use crate::shutdown::ShutdownGroup;
use crate::statistics::{L1Cache, L2Cache, RealtimeProvider};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

pub type StatsFuture<'a> = Pin<Box<dyn Future<Output = Result<StatsByType>> + Send + 'a>>;

/// Statistics of any object, the variant is a latency/freshness choice only.
pub enum Provider {
    Realtime(RealtimeProvider),
    L1(L1Cache),
    L2(L2Cache),
}

impl Provider {
    pub fn kind(&self) -> ProviderKind {
        match self {
            Provider::Realtime(_) => ProviderKind::Realtime,
            Provider::L1(_) => ProviderKind::L1,
            Provider::L2(_) => ProviderKind::L2,
        }
    }

    pub fn object_stats<'a>(&'a self, key: &'a ObjectKey) -> StatsFuture<'a> {
        match self {
            Provider::Realtime(p) => Box::pin(p.object_stats(key)),
            Provider::L1(p) => Box::pin(std::future::ready(Ok(p.object_stats(key)))),
            Provider::L2(p) => Box::pin(p.object_stats(key)),
        }
    }

    pub async fn receiver_stats(&self, key: &ReceiverKey) -> Result<StatsByType> {
        self.object_stats(&ObjectKey::Receiver(key.clone())).await
    }

    pub async fn export_stats(&self, key: &ExportKey) -> Result<StatsByType> {
        self.object_stats(&ObjectKey::Export(key.clone())).await
    }

    pub async fn file_stats(&self, key: &FileKey) -> Result<StatsByType> {
        self.object_stats(&ObjectKey::File(key.clone())).await
    }

    pub async fn slice_stats(&self, key: &SliceKey) -> Result<StatsByType> {
        self.object_stats(&ObjectKey::Slice(key.clone())).await
    }
}

/// All three providers of a node; L2 wraps L1.
pub struct Providers {
    realtime: Arc<Provider>,
    l1: Arc<Provider>,
    l2: Arc<Provider>,
    l1_cache: L1Cache,
    l2_cache: L2Cache,
}

impl Providers {
    /// Start the caches, fails if the L1 mirror cannot be loaded.
    pub async fn start(kv: SharedKv, cache_ttl: Duration, shutdown: &ShutdownGroup) -> Result<Self> {
        let l1_cache = L1Cache::start(kv.clone(), shutdown).await?;
        let l1 = Arc::new(Provider::L1(l1_cache.clone()));
        let l2_cache = L2Cache::start(l1.clone(), cache_ttl, shutdown);
        Ok(Providers {
            realtime: Arc::new(Provider::Realtime(RealtimeProvider::new(kv))),
            l1,
            l2: Arc::new(Provider::L2(l2_cache.clone())),
            l1_cache,
            l2_cache,
        })
    }

    pub fn get(&self, kind: ProviderKind) -> Arc<Provider> {
        match kind {
            ProviderKind::Realtime => self.realtime.clone(),
            ProviderKind::L1 => self.l1.clone(),
            ProviderKind::L2 => self.l2.clone(),
        }
    }

    pub fn l1_cache(&self) -> &L1Cache {
        &self.l1_cache
    }

    pub fn l2_cache(&self) -> &L2Cache {
        &self.l2_cache
    }
}
