//! The reconciliation pipeline and its wiring: watches feed a shared index
//! and work queue, the reconciler drains the queue into the config applier,
//! and the status updater mirrors the proxy address back onto Ingresses.
//! The whole pipeline runs only while the databroker lease is held.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kube::runtime::events::Recorder;
use kube::Client;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::databroker::applier::ConfigReconciler;
use crate::databroker::lease::LeaseHandler;
use crate::index::SharedIndex;
use crate::metrics::Metrics;
use crate::model::ObjectKey;
use crate::Result;

pub mod assembler;
pub mod ownership;
pub mod reconciler;
pub mod status;
pub mod watch;

use reconciler::{KubeEventSink, Reconciler, WorkQueue};
use status::StatusUpdater;

/// Matched against `IngressClass.spec.controller`.
pub const DEFAULT_CLASS_CONTROLLER_NAME: &str = "pomerium.io/ingress-controller";
/// Prefix of this controller's Ingress and IngressClass annotations.
pub const DEFAULT_ANNOTATION_PREFIX: &str = "ingress.pomerium.io";

const RESYNC_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// Runtime options assembled from the CLI.
#[derive(Clone, Debug)]
pub struct Settings {
    pub controller_name: String,
    pub annotation_prefix: String,
    /// Namespace allow-list; empty means all namespaces.
    pub namespaces: Vec<String>,
    pub disable_cert_check: bool,
    /// Proxy Service whose load-balancer status is mirrored onto Ingresses.
    pub update_status_from_service: Option<ObjectKey>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            controller_name: DEFAULT_CLASS_CONTROLLER_NAME.into(),
            annotation_prefix: DEFAULT_ANNOTATION_PREFIX.into(),
            namespaces: Vec::new(),
            disable_cert_check: false,
            update_status_from_service: None,
        }
    }
}

/// Diagnostics to be exposed by the web server
#[derive(Clone, Serialize)]
pub struct Diagnostics {
    pub last_event: DateTime<Utc>,
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self {
            last_event: Utc::now(),
        }
    }
}

/// State shared between the pipeline and the web server.
pub struct State {
    /// True while the lease is held and the initial sync has completed.
    running: AtomicBool,
    /// Metrics registry
    pub registry: prometheus::Registry,
    /// Diagnostics populated by the reconciler
    pub diagnostics: Arc<tokio::sync::RwLock<Diagnostics>>,
}

impl Default for State {
    fn default() -> Self {
        Self {
            running: AtomicBool::new(false),
            registry: prometheus::Registry::default(),
            diagnostics: Arc::default(),
        }
    }
}

impl State {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Metrics getter
    pub fn metrics(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    /// State getter
    pub async fn diagnostics(&self) -> Diagnostics {
        self.diagnostics.read().await.clone()
    }
}

/// Clears the readiness flag however the pipeline exits.
struct RunningGuard(Arc<State>);

impl RunningGuard {
    fn arm(state: Arc<State>) -> Self {
        state.set_running(true);
        Self(state)
    }
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.set_running(false);
    }
}

/// The full watch-reconcile-apply pipeline, constructed fresh every time the
/// lease is acquired and torn down when it is lost.
pub struct Pipeline {
    pub settings: Settings,
    pub applier: Arc<dyn ConfigReconciler>,
    pub state: Arc<State>,
    pub metrics: Metrics,
}

#[async_trait]
impl LeaseHandler for Pipeline {
    async fn run_leased(&self, cancel: CancellationToken) -> Result<()> {
        let client = Client::try_default().await?;

        let index = Arc::new(RwLock::new(SharedIndex::default()));
        let queue = Arc::new(WorkQueue::new());
        let (lb_tx, lb_rx) = tokio::sync::watch::channel(None);
        let watchers = watch::spawn(
            client.clone(),
            &self.settings,
            index.clone(),
            queue.clone(),
            lb_tx,
            &cancel,
        );

        // wait until every watcher has delivered its initial list
        for synced in watchers.synced {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                result = synced => {
                    if result.is_err() {
                        return Ok(());
                    }
                }
            }
        }

        let recorder = Recorder::new(client.clone(), "pomerium-ingress-controller".into());
        let reconciler = Reconciler::new(
            index.clone(),
            queue.clone(),
            self.applier.clone(),
            Arc::new(KubeEventSink::new(recorder)),
            self.settings.clone(),
            self.metrics.clone(),
            self.state.diagnostics.clone(),
        );

        // bulk-replace the store from the initial lists, then run every key
        // through the regular path so invalid ingresses get their events
        let configs = reconciler.assemble_all();
        let keys = index.read().unwrap().registry.ingress_keys();
        self.applier.set(configs).await?;
        queue.enqueue_all(keys);

        let _running = RunningGuard::arm(self.state.clone());

        if self.settings.update_status_from_service.is_some() {
            let updater = StatusUpdater::new(client, index.clone(), self.settings.clone());
            let cancel = cancel.child_token();
            tokio::spawn(async move { updater.run(lb_rx, cancel).await });
        }

        // periodic resync heals missed events
        {
            let queue = queue.clone();
            let index = index.clone();
            let cancel = cancel.child_token();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(RESYNC_INTERVAL);
                interval.tick().await;
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = interval.tick() => {
                            let keys = index.read().unwrap().registry.ingress_keys();
                            queue.enqueue_all(keys);
                        }
                    }
                }
            });
        }

        info!("pipeline running");
        reconciler.run(cancel).await;
        Ok(())
    }
}
