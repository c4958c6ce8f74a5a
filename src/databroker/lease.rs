//! Single-writer election over the store.
//!
//! One record under `lease/ingress-controller` names the active instance.
//! Acquisition and renewal are conditional writes against the record version,
//! so two replicas can never both believe they hold the lease. While held,
//! the supplied handler (the whole reconciliation pipeline) runs under a
//! cancellation token; losing the lease cancels it and the loop goes back to
//! acquisition. The loop only exits on process shutdown.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{PutCondition, StoreClient, StoreError};
use crate::Result;

pub const LEASE_KEY: &str = "lease/ingress-controller";
pub const LEASE_TTL: Duration = Duration::from_secs(30);

/// How long the pipeline gets to wind down after cancellation.
const TEARDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LeaseRecord {
    pub holder: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// What runs while the lease is held.
#[async_trait]
pub trait LeaseHandler: Send + Sync + 'static {
    async fn run_leased(&self, cancel: CancellationToken) -> Result<()>;
}

enum HoldOutcome {
    /// Another holder was observed, or renewal could not be sustained.
    Lost,
    /// Local cancellation or process shutdown.
    Stopped,
    /// The handler returned on its own.
    HandlerDone,
}

pub struct Leaser<C> {
    store: Arc<C>,
    identity: String,
    ttl: Duration,
}

impl<C: StoreClient> Leaser<C> {
    pub fn new(store: Arc<C>, identity: String) -> Self {
        Self::with_ttl(store, identity, LEASE_TTL)
    }

    pub fn with_ttl(store: Arc<C>, identity: String, ttl: Duration) -> Self {
        Self {
            store,
            identity,
            ttl,
        }
    }

    /// Run the election loop until `shutdown` is cancelled.
    pub async fn run(
        &self,
        handler: Arc<dyn LeaseHandler>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        loop {
            if shutdown.is_cancelled() {
                return Ok(());
            }
            match self.try_acquire().await {
                Ok(Some(version)) => {
                    info!(identity = %self.identity, "databroker lease acquired");
                    let outcome = self.hold(version, handler.clone(), &shutdown).await;
                    match outcome {
                        HoldOutcome::Lost => {
                            warn!("databroker lease lost");
                        }
                        HoldOutcome::Stopped => {
                            self.release().await;
                        }
                        HoldOutcome::HandlerDone => {
                            self.release().await;
                            // a pipeline that fails right away must not spin
                            self.idle_wait(&shutdown).await;
                        }
                    }
                }
                Ok(None) => {
                    debug!("databroker lease held elsewhere");
                    self.idle_wait(&shutdown).await;
                }
                Err(e) => {
                    warn!(error = %e, "databroker lease acquisition failed");
                    self.idle_wait(&shutdown).await;
                }
            }
        }
    }

    /// Bounded, jittered wait between acquisition attempts.
    async fn idle_wait(&self, shutdown: &CancellationToken) {
        let min = self.ttl.as_millis() as u64 / 6;
        let max = self.ttl.as_millis() as u64 / 3;
        let wait = Duration::from_millis(rand::thread_rng().gen_range(min..=max.max(min + 1)));
        tokio::select! {
            _ = shutdown.cancelled() => {}
            _ = tokio::time::sleep(wait) => {}
        }
    }

    /// Try to take the lease. Returns the record version when acquired, or
    /// `None` while a live holder exists.
    async fn try_acquire(&self) -> std::result::Result<Option<u64>, StoreError> {
        let now = Utc::now();
        let record = LeaseRecord {
            holder: self.identity.clone(),
            acquired_at: now,
            expires_at: now + TimeDelta::from_std(self.ttl).unwrap_or(TimeDelta::seconds(30)),
        };
        let data = serde_json::to_vec(&record)
            .map_err(|e| StoreError::InvalidArgument(e.to_string()))?;

        let condition = match self.store.get(LEASE_KEY).await? {
            Some(existing) => {
                let current: LeaseRecord = match serde_json::from_slice(&existing.data) {
                    Ok(current) => current,
                    // a corrupt record is overwritten
                    Err(_) => return self.put_lease(data, PutCondition::Version(existing.version)).await,
                };
                if current.expires_at > now && current.holder != self.identity {
                    return Ok(None);
                }
                PutCondition::Version(existing.version)
            }
            None => PutCondition::Absent,
        };
        self.put_lease(data, condition).await
    }

    async fn put_lease(
        &self,
        data: Vec<u8>,
        condition: PutCondition,
    ) -> std::result::Result<Option<u64>, StoreError> {
        match self.store.put(LEASE_KEY, data, condition).await {
            Ok(version) => Ok(Some(version)),
            // lost the race to another instance
            Err(StoreError::VersionConflict) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Renew the lease in place. `Ok(true)` when still held.
    async fn renew(&self, version: &mut u64) -> std::result::Result<bool, StoreError> {
        let Some(existing) = self.store.get(LEASE_KEY).await? else {
            return Ok(false);
        };
        if let Ok(current) = serde_json::from_slice::<LeaseRecord>(&existing.data) {
            if current.holder != self.identity {
                return Ok(false);
            }
        }
        let now = Utc::now();
        let record = LeaseRecord {
            holder: self.identity.clone(),
            acquired_at: now,
            expires_at: now + TimeDelta::from_std(self.ttl).unwrap_or(TimeDelta::seconds(30)),
        };
        let data = serde_json::to_vec(&record)
            .map_err(|e| StoreError::InvalidArgument(e.to_string()))?;
        match self
            .store
            .put(LEASE_KEY, data, PutCondition::Version(existing.version))
            .await
        {
            Ok(new_version) => {
                *version = new_version;
                Ok(true)
            }
            Err(StoreError::VersionConflict) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Run the handler while renewing the lease at TTL/3. Returns once the
    /// lease is lost, shutdown is requested, or the handler finishes.
    async fn hold(
        &self,
        mut version: u64,
        handler: Arc<dyn LeaseHandler>,
        shutdown: &CancellationToken,
    ) -> HoldOutcome {
        let cancel = shutdown.child_token();
        let mut task: JoinHandle<Result<()>> = tokio::spawn({
            let cancel = cancel.clone();
            async move { handler.run_leased(cancel).await }
        });

        let renew_every = self.ttl / 3;
        let retry_every = self.ttl / 6;
        let give_up_after = self.ttl / 2;
        let mut last_renewed = Instant::now();
        let mut next_renewal = Instant::now() + renew_every;

        let outcome = loop {
            tokio::select! {
                _ = shutdown.cancelled() => break HoldOutcome::Stopped,
                result = &mut task => {
                    match result {
                        Ok(Ok(())) => info!("pipeline finished"),
                        Ok(Err(e)) => error!(error = %e, "pipeline failed"),
                        Err(e) => error!(error = %e, "pipeline panicked"),
                    }
                    cancel.cancel();
                    return HoldOutcome::HandlerDone;
                }
                _ = tokio::time::sleep_until(next_renewal) => {
                    match self.renew(&mut version).await {
                        Ok(true) => {
                            last_renewed = Instant::now();
                            next_renewal = Instant::now() + renew_every;
                        }
                        Ok(false) => break HoldOutcome::Lost,
                        Err(e) if e.is_transient() => {
                            if last_renewed.elapsed() >= give_up_after {
                                warn!(error = %e, "lease renewal window exhausted");
                                break HoldOutcome::Lost;
                            }
                            debug!(error = %e, "lease renewal failed, retrying");
                            next_renewal = Instant::now() + retry_every;
                        }
                        Err(e) => {
                            warn!(error = %e, "lease renewal failed");
                            break HoldOutcome::Lost;
                        }
                    }
                }
            }
        };

        // bounded teardown of the pipeline
        cancel.cancel();
        if tokio::time::timeout(TEARDOWN_GRACE, &mut task).await.is_err() {
            warn!("pipeline did not stop in time, aborting");
            task.abort();
        }
        outcome
    }

    /// Drop the lease if this instance still holds it.
    async fn release(&self) {
        match self.store.get(LEASE_KEY).await {
            Ok(Some(existing)) => {
                let ours = serde_json::from_slice::<LeaseRecord>(&existing.data)
                    .map(|r| r.holder == self.identity)
                    .unwrap_or(false);
                if ours {
                    if let Err(e) = self.store.delete(LEASE_KEY).await {
                        warn!(error = %e, "lease release failed");
                    } else {
                        info!("databroker lease released");
                    }
                }
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "lease release failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::databroker::memory::MemoryStore;

    const TEST_TTL: Duration = Duration::from_millis(300);

    /// Counts concurrently-active holders and the peak ever observed.
    struct CountingHandler {
        active: AtomicUsize,
        peak: AtomicUsize,
    }

    impl CountingHandler {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                active: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl LeaseHandler for CountingHandler {
        async fn run_leased(&self, cancel: CancellationToken) -> Result<()> {
            let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now_active, Ordering::SeqCst);
            cancel.cancelled().await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    }

    async fn read_lease(store: &MemoryStore) -> Option<LeaseRecord> {
        store
            .get(LEASE_KEY)
            .await
            .unwrap()
            .map(|r| serde_json::from_slice(&r.data).unwrap())
    }

    #[tokio::test]
    async fn acquires_runs_and_releases() {
        let store = Arc::new(MemoryStore::new());
        let leaser = Leaser::with_ttl(store.clone(), "a".into(), TEST_TTL);
        let handler = CountingHandler::new();
        let shutdown = CancellationToken::new();

        let run = tokio::spawn({
            let handler = handler.clone();
            let shutdown = shutdown.clone();
            async move { leaser.run(handler, shutdown).await }
        });

        tokio::time::sleep(TEST_TTL / 3).await;
        assert_eq!(handler.active.load(Ordering::SeqCst), 1);
        assert_eq!(read_lease(&store).await.unwrap().holder, "a");

        shutdown.cancel();
        run.await.unwrap().unwrap();
        assert_eq!(handler.active.load(Ordering::SeqCst), 0);
        assert!(read_lease(&store).await.is_none(), "lease must be released");
    }

    #[tokio::test]
    async fn at_most_one_holder() {
        let store = Arc::new(MemoryStore::new());
        let handler = CountingHandler::new();
        let shutdown = CancellationToken::new();

        let mut runs = Vec::new();
        for identity in ["a", "b", "c"] {
            let leaser = Leaser::with_ttl(store.clone(), identity.into(), TEST_TTL);
            let handler = handler.clone();
            let shutdown = shutdown.clone();
            runs.push(tokio::spawn(async move {
                leaser.run(handler, shutdown).await
            }));
        }

        tokio::time::sleep(TEST_TTL * 4).await;
        assert_eq!(handler.peak.load(Ordering::SeqCst), 1);
        assert_eq!(handler.active.load(Ordering::SeqCst), 1);

        shutdown.cancel();
        for run in runs {
            run.await.unwrap().unwrap();
        }
    }

    #[tokio::test]
    async fn takes_over_an_expired_lease() {
        let store = Arc::new(MemoryStore::new());
        let stale = LeaseRecord {
            holder: "departed".into(),
            acquired_at: Utc::now() - TimeDelta::seconds(60),
            expires_at: Utc::now() - TimeDelta::seconds(30),
        };
        store
            .put(
                LEASE_KEY,
                serde_json::to_vec(&stale).unwrap(),
                PutCondition::Any,
            )
            .await
            .unwrap();

        let leaser = Leaser::with_ttl(store.clone(), "a".into(), TEST_TTL);
        let version = leaser.try_acquire().await.unwrap();
        assert!(version.is_some());
        assert_eq!(read_lease(&store).await.unwrap().holder, "a");
    }

    #[tokio::test]
    async fn respects_a_live_holder() {
        let store = Arc::new(MemoryStore::new());
        let live = LeaseRecord {
            holder: "other".into(),
            acquired_at: Utc::now(),
            expires_at: Utc::now() + TimeDelta::seconds(30),
        };
        store
            .put(
                LEASE_KEY,
                serde_json::to_vec(&live).unwrap(),
                PutCondition::Any,
            )
            .await
            .unwrap();

        let leaser = Leaser::with_ttl(store.clone(), "a".into(), TEST_TTL);
        assert!(leaser.try_acquire().await.unwrap().is_none());
        assert_eq!(read_lease(&store).await.unwrap().holder, "other");
    }

    #[tokio::test]
    async fn losing_the_lease_cancels_the_pipeline() {
        let store = Arc::new(MemoryStore::new());
        let leaser = Leaser::with_ttl(store.clone(), "a".into(), TEST_TTL);
        let handler = CountingHandler::new();
        let shutdown = CancellationToken::new();

        let run = tokio::spawn({
            let handler = handler.clone();
            let shutdown = shutdown.clone();
            async move { leaser.run(handler, shutdown).await }
        });

        tokio::time::sleep(TEST_TTL / 3).await;
        assert_eq!(handler.active.load(Ordering::SeqCst), 1);

        // another instance takes the record over
        let usurper = LeaseRecord {
            holder: "b".into(),
            acquired_at: Utc::now(),
            expires_at: Utc::now() + TimeDelta::seconds(60),
        };
        store
            .put(
                LEASE_KEY,
                serde_json::to_vec(&usurper).unwrap(),
                PutCondition::Any,
            )
            .await
            .unwrap();

        // the next renewal notices and the pipeline stops
        tokio::time::sleep(TEST_TTL).await;
        assert_eq!(handler.active.load(Ordering::SeqCst), 0);
        // the usurper's record is left alone
        assert_eq!(read_lease(&store).await.unwrap().holder, "b");

        shutdown.cancel();
        run.await.unwrap().unwrap();
    }
}
