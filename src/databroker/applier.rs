//! Idempotent publication of `IngressConfig` snapshots into the store.
//!
//! One record per managed Ingress under `ingress/<namespace>/<name>`. The
//! record body is the canonical serialization, so a byte compare against the
//! stored value decides whether a write is needed at all.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use super::{PutCondition, StoreClient};
use crate::model::{IngressConfig, ObjectKey};
use crate::Result;

pub const INGRESS_KEY_PREFIX: &str = "ingress/";

pub fn ingress_key(key: &ObjectKey) -> String {
    format!("{INGRESS_KEY_PREFIX}{key}")
}

/// The operations the reconciler drives. Mocked in tests.
#[async_trait]
pub trait ConfigReconciler: Send + Sync + 'static {
    /// Publish one config. Returns whether the store changed.
    async fn upsert(&self, config: &IngressConfig) -> Result<bool>;

    /// Remove one Ingress' record, if present.
    async fn delete(&self, key: &ObjectKey) -> Result<()>;

    /// Bulk-replace the whole `ingress/` prefix: records without a matching
    /// config are deleted. Used once after the initial sync.
    async fn set(&self, configs: Vec<IngressConfig>) -> Result<bool>;
}

pub struct DatabrokerApplier<C> {
    store: Arc<C>,
}

impl<C: StoreClient> DatabrokerApplier<C> {
    pub fn new(store: Arc<C>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl<C: StoreClient> ConfigReconciler for DatabrokerApplier<C> {
    async fn upsert(&self, config: &IngressConfig) -> Result<bool> {
        let key = ingress_key(&config.key());
        let data = config.canonical_bytes()?;

        if let Some(existing) = self.store.get(&key).await? {
            if existing.data == data {
                debug!(%key, "config unchanged");
                return Ok(false);
            }
        }

        self.store.put(&key, data, PutCondition::Any).await?;
        info!(%key, fingerprint = %config.fingerprint()?, "config updated");
        Ok(true)
    }

    async fn delete(&self, key: &ObjectKey) -> Result<()> {
        self.store.delete(&ingress_key(key)).await?;
        Ok(())
    }

    async fn set(&self, configs: Vec<IngressConfig>) -> Result<bool> {
        let keep: BTreeSet<String> = configs.iter().map(|c| ingress_key(&c.key())).collect();

        let mut changed = false;
        for (key, _) in self.store.list(INGRESS_KEY_PREFIX).await? {
            if !keep.contains(&key) {
                info!(%key, "removing stale config");
                self.store.delete(&key).await?;
                changed = true;
            }
        }
        for config in &configs {
            changed |= self.upsert(config).await?;
        }
        Ok(changed)
    }
}
