//! The single-threaded reconcile loop.
//!
//! A dedup work queue holds Ingress keys; watch handlers enqueue, this loop
//! dequeues one key at a time, re-evaluates ownership, assembles the config,
//! and drives the applier. Transient store failures re-enqueue the key with
//! full-jitter exponential backoff.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::networking::v1::Ingress;
use kube::runtime::events::{Event, EventType, Recorder};
use kube::Resource;
use rand::Rng;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::controllers::{assembler, ownership, Diagnostics, Settings};
use crate::databroker::applier::ConfigReconciler;
use crate::index::SharedIndex;
use crate::metrics::Metrics;
use crate::model::{IngressConfig, ObjectKey, UnemittableError};
use crate::Error;

const BACKOFF_INITIAL: Duration = Duration::from_millis(500);
const BACKOFF_CAP: Duration = Duration::from_secs(30);

/// FIFO queue of Ingress keys with at most one pending entry per key.
#[derive(Default)]
pub struct WorkQueue {
    inner: Mutex<WorkQueueInner>,
    notify: Notify,
}

#[derive(Default)]
struct WorkQueueInner {
    queue: VecDeque<ObjectKey>,
    pending: HashSet<ObjectKey>,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&self, key: ObjectKey) {
        let mut inner = self.inner.lock().unwrap();
        if inner.pending.insert(key.clone()) {
            inner.queue.push_back(key);
            drop(inner);
            self.notify.notify_one();
        }
    }

    pub fn enqueue_all(&self, keys: impl IntoIterator<Item = ObjectKey>) {
        for key in keys {
            self.enqueue(key);
        }
    }

    /// Wait for the next key.
    pub async fn next(&self) -> ObjectKey {
        loop {
            {
                let mut inner = self.inner.lock().unwrap();
                if let Some(key) = inner.queue.pop_front() {
                    inner.pending.remove(&key);
                    return key;
                }
            }
            self.notify.notified().await;
        }
    }
}

/// Where reconcile outcomes are reported as Kubernetes Events. Mocked in
/// tests; backed by a [`Recorder`] in the running controller.
#[async_trait]
pub trait EventSink: Send + Sync + 'static {
    async fn publish(&self, ingress: &Ingress, type_: EventType, reason: &str, note: String);
}

pub struct KubeEventSink {
    recorder: Recorder,
}

impl KubeEventSink {
    pub fn new(recorder: Recorder) -> Self {
        Self { recorder }
    }
}

#[async_trait]
impl EventSink for KubeEventSink {
    async fn publish(&self, ingress: &Ingress, type_: EventType, reason: &str, note: String) {
        let event = Event {
            type_,
            reason: reason.into(),
            note: Some(note),
            action: "Reconcile".into(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, &ingress.object_ref(&())).await {
            warn!(error = %e, ingress = %ObjectKey::of(ingress), "publishing event failed");
        }
    }
}

/// Full-jitter exponential backoff delay for the n-th consecutive failure.
pub fn backoff_delay(attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    let max = BACKOFF_CAP.min(BACKOFF_INITIAL.saturating_mul(1u32 << exp));
    Duration::from_millis(rand::thread_rng().gen_range(0..=max.as_millis() as u64))
}

enum Evaluation {
    /// Unowned or gone: its record must not exist in the store.
    Remove,
    /// Structurally valid, ready to publish.
    Apply(Box<IngressConfig>),
    /// Owned but not emittable in its current state.
    Invalid(Arc<Ingress>, UnemittableError),
}

pub struct Reconciler {
    index: Arc<RwLock<SharedIndex>>,
    queue: Arc<WorkQueue>,
    applier: Arc<dyn ConfigReconciler>,
    events: Arc<dyn EventSink>,
    settings: Settings,
    metrics: Metrics,
    diagnostics: Arc<tokio::sync::RwLock<Diagnostics>>,
    attempts: Mutex<HashMap<ObjectKey, u32>>,
}

impl Reconciler {
    pub fn new(
        index: Arc<RwLock<SharedIndex>>,
        queue: Arc<WorkQueue>,
        applier: Arc<dyn ConfigReconciler>,
        events: Arc<dyn EventSink>,
        settings: Settings,
        metrics: Metrics,
        diagnostics: Arc<tokio::sync::RwLock<Diagnostics>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            index,
            queue,
            applier,
            events,
            settings,
            metrics,
            diagnostics,
            attempts: Mutex::new(HashMap::new()),
        })
    }

    /// Process keys until cancelled. One key at a time: applier calls for the
    /// same key are naturally serialized.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            let key = tokio::select! {
                _ = cancel.cancelled() => return,
                key = self.queue.next() => key,
            };
            self.process(key).await;
        }
    }

    /// Assemble configs for every Ingress currently in the registry, updating
    /// dependency edges as a side effect. Used for the startup bulk `set`.
    pub fn assemble_all(&self) -> Vec<IngressConfig> {
        let mut index = self.index.write().unwrap();
        let index = &mut *index;
        let mut configs = Vec::new();
        for key in index.registry.ingress_keys() {
            let Some(ingress) = index.registry.ingress(&key) else {
                continue;
            };
            let classes = index.registry.ingress_classes();
            let Some(owned) =
                ownership::evaluate(&ingress, &classes, &self.settings.controller_name)
            else {
                index.deps.remove_ingress(&key);
                continue;
            };
            let (deps, result) =
                assembler::assemble(&ingress, &owned, &index.registry, &self.settings);
            index.deps.set_deps(&key, deps);
            if let Ok(config) = result {
                configs.push(config);
            }
        }
        configs
    }

    /// Re-evaluate one Ingress under the index lock. Sync: the lock is never
    /// held across an await point.
    fn evaluate(&self, key: &ObjectKey) -> Evaluation {
        let mut index = self.index.write().unwrap();
        let index = &mut *index;

        let Some(ingress) = index.registry.ingress(key) else {
            index.deps.remove_ingress(key);
            return Evaluation::Remove;
        };
        let classes = index.registry.ingress_classes();
        let Some(owned) = ownership::evaluate(&ingress, &classes, &self.settings.controller_name)
        else {
            index.deps.remove_ingress(key);
            return Evaluation::Remove;
        };

        let (deps, result) = assembler::assemble(&ingress, &owned, &index.registry, &self.settings);
        index.deps.set_deps(key, deps);
        match result {
            Ok(config) => Evaluation::Apply(Box::new(config)),
            Err(reason) => Evaluation::Invalid(ingress, reason),
        }
    }

    #[instrument(skip(self, key), fields(ingress = %key, trace_id))]
    async fn process(&self, key: ObjectKey) {
        #[cfg(feature = "telemetry")]
        if let Some(trace_id) = crate::telemetry::get_trace_id() {
            tracing::Span::current().record("trace_id", tracing::field::display(&trace_id));
        }
        let _timer = self.metrics.count_and_measure();
        self.diagnostics.write().await.last_event = chrono::Utc::now();
        let outcome = match self.evaluate(&key) {
            Evaluation::Remove => {
                debug!(ingress = %key, "not ours, removing config");
                self.applier.delete(&key).await
            }
            Evaluation::Invalid(ingress, reason) => {
                info!(ingress = %key, %reason, "ingress is not emittable");
                self.events
                    .publish(&ingress, EventType::Warning, "Invalid", reason.to_string())
                    .await;
                self.applier.delete(&key).await
            }
            Evaluation::Apply(config) => match self.applier.upsert(&config).await {
                Ok(true) => {
                    let ingress = config.ingress.clone();
                    self.events
                        .publish(
                            &ingress,
                            EventType::Normal,
                            "Updated",
                            "configuration updated".into(),
                        )
                        .await;
                    Ok(())
                }
                Ok(false) => Ok(()),
                Err(e) => Err(e),
            },
        };

        match outcome {
            Ok(()) => {
                self.attempts.lock().unwrap().remove(&key);
            }
            Err(e) => {
                self.metrics.reconcile_failure(&key, &e);
                if is_transient(&e) {
                    self.requeue_after_backoff(key, &e);
                } else {
                    warn!(ingress = %key, error = %e, "dropping key until its next event");
                    self.attempts.lock().unwrap().remove(&key);
                }
            }
        }
    }

    fn requeue_after_backoff(&self, key: ObjectKey, error: &Error) {
        let attempt = {
            let mut attempts = self.attempts.lock().unwrap();
            let entry = attempts.entry(key.clone()).or_insert(0);
            *entry += 1;
            *entry
        };
        let delay = backoff_delay(attempt);
        warn!(ingress = %key, error = %error, attempt, delay_ms = delay.as_millis() as u64,
            "transient failure, requeueing");
        let queue = self.queue.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.enqueue(key);
        });
    }
}

fn is_transient(error: &Error) -> bool {
    match error {
        Error::Store(e) => e.is_transient(),
        Error::KubeError(_) => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::databroker::applier::DatabrokerApplier;
    use crate::databroker::memory::MemoryStore;
    use crate::databroker::StoreClient;
    use k8s_openapi::api::core::v1::{Endpoints, Secret, Service};
    use k8s_openapi::api::networking::v1::IngressClass;
    use serde_json::json;

    fn from_json<K: serde::de::DeserializeOwned>(value: serde_json::Value) -> K {
        serde_json::from_value(value).unwrap()
    }

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<(ObjectKey, EventType, String)>>,
    }

    impl RecordingSink {
        fn reasons(&self) -> Vec<String> {
            self.events
                .lock()
                .unwrap()
                .iter()
                .map(|(_, _, reason)| reason.clone())
                .collect()
        }
    }

    #[async_trait]
    impl EventSink for RecordingSink {
        async fn publish(&self, ingress: &Ingress, type_: EventType, reason: &str, _note: String) {
            self.events
                .lock()
                .unwrap()
                .push((ObjectKey::of(ingress), type_, reason.to_string()));
        }
    }

    struct Fixture {
        reconciler: Arc<Reconciler>,
        index: Arc<RwLock<SharedIndex>>,
        store: Arc<MemoryStore>,
        sink: Arc<RecordingSink>,
    }

    fn fixture() -> Fixture {
        let index = Arc::new(RwLock::new(SharedIndex::default()));
        let store = Arc::new(MemoryStore::new());
        let sink = Arc::new(RecordingSink::default());
        let reconciler = Reconciler::new(
            index.clone(),
            Arc::new(WorkQueue::new()),
            Arc::new(DatabrokerApplier::new(store.clone())),
            sink.clone(),
            Settings::default(),
            Metrics::default(),
            Arc::default(),
        );
        Fixture {
            reconciler,
            index,
            store,
            sink,
        }
    }

    fn ingress_with_class(class: Option<&str>) -> Ingress {
        from_json(json!({
            "metadata": {"name": "ingress", "namespace": "default"},
            "spec": {
                "ingressClassName": class,
                "tls": [{"hosts": ["service.localhost.pomerium.io"], "secretName": "secret"}],
                "rules": [{
                    "host": "service.localhost.pomerium.io",
                    "http": {"paths": [{
                        "path": "/",
                        "pathType": "Prefix",
                        "backend": {"service": {"name": "service", "port": {"name": "http"}}}
                    }]}
                }]
            }
        }))
    }

    fn pomerium_class(default: bool) -> IngressClass {
        let mut annotations = serde_json::Map::new();
        if default {
            annotations.insert(
                "ingressclass.kubernetes.io/is-default-class".into(),
                json!("true"),
            );
        }
        from_json(json!({
            "metadata": {"name": "pomerium", "annotations": annotations},
            "spec": {"controller": "pomerium.io/ingress-controller"}
        }))
    }

    fn seed_backends(index: &Arc<RwLock<SharedIndex>>) {
        let mut index = index.write().unwrap();
        index.registry.upsert_service(from_json::<Service>(json!({
            "metadata": {"name": "service", "namespace": "default"},
            "spec": {"ports": [{"name": "http", "port": 80}]}
        })));
        index.registry.upsert_endpoints(from_json::<Endpoints>(json!({
            "metadata": {"name": "service", "namespace": "default"},
            "subsets": [{"addresses": [{"ip": "1.2.3.4"}]}]
        })));
        index.registry.upsert_secret(from_json::<Secret>(json!({
            "metadata": {"name": "secret", "namespace": "default"},
            "type": "kubernetes.io/tls",
            "data": {"tls.crt": "QQ==", "tls.key": "QQ=="}
        })));
    }

    fn key() -> ObjectKey {
        ObjectKey::new("default", "ingress")
    }

    #[tokio::test]
    async fn ownership_follows_the_ingress_class() {
        let f = fixture();
        seed_backends(&f.index);
        f.index
            .write()
            .unwrap()
            .registry
            .upsert_ingress(ingress_with_class(Some("pomerium")));

        // no IngressClass record yet: nothing may be written
        f.reconciler.process(key()).await;
        assert!(f.store.keys().is_empty());

        // the class appears and the config follows
        f.index
            .write()
            .unwrap()
            .registry
            .upsert_ingress_class(pomerium_class(false));
        f.reconciler.process(key()).await;
        assert_eq!(f.store.keys(), vec!["ingress/default/ingress".to_string()]);

        // the ingress moves to a class that is not ours
        f.index
            .write()
            .unwrap()
            .registry
            .upsert_ingress(ingress_with_class(Some("other")));
        f.reconciler.process(key()).await;
        assert!(f.store.keys().is_empty(), "flipping away must delete");
    }

    #[tokio::test]
    async fn default_class_promotion() {
        let f = fixture();
        seed_backends(&f.index);
        f.index
            .write()
            .unwrap()
            .registry
            .upsert_ingress(ingress_with_class(None));
        f.index
            .write()
            .unwrap()
            .registry
            .upsert_ingress_class(pomerium_class(false));

        f.reconciler.process(key()).await;
        assert!(f.store.keys().is_empty());

        // marking the class as cluster default grants ownership
        f.index
            .write()
            .unwrap()
            .registry
            .upsert_ingress_class(pomerium_class(true));
        f.reconciler.process(key()).await;
        assert_eq!(f.store.keys(), vec!["ingress/default/ingress".to_string()]);
    }

    #[tokio::test]
    async fn missing_tls_secret_records_an_invalid_event() {
        let f = fixture();
        seed_backends(&f.index);
        f.index
            .write()
            .unwrap()
            .registry
            .delete_secret(&ObjectKey::new("default", "secret"));
        f.index
            .write()
            .unwrap()
            .registry
            .upsert_ingress(ingress_with_class(Some("pomerium")));
        f.index
            .write()
            .unwrap()
            .registry
            .upsert_ingress_class(pomerium_class(false));

        f.reconciler.process(key()).await;
        assert!(f.store.keys().is_empty());
        assert_eq!(f.sink.reasons(), vec!["Invalid".to_string()]);

        // the secret shows up, the dependents lookup finds the ingress, and
        // the next reconcile emits it
        let dependents = {
            let mut index = f.index.write().unwrap();
            index.registry.upsert_secret(from_json::<Secret>(json!({
                "metadata": {"name": "secret", "namespace": "default"},
                "type": "kubernetes.io/tls",
                "data": {"tls.crt": "QQ==", "tls.key": "QQ=="}
            })));
            index
                .deps
                .dependents(crate::model::Kind::Secret, &ObjectKey::new("default", "secret"))
        };
        assert_eq!(dependents, vec![key()]);

        f.reconciler.process(key()).await;
        assert_eq!(f.store.keys(), vec!["ingress/default/ingress".to_string()]);
        assert_eq!(
            f.sink.reasons(),
            vec!["Invalid".to_string(), "Updated".to_string()]
        );
    }

    #[tokio::test]
    async fn repeat_reconciles_are_silent() {
        let f = fixture();
        seed_backends(&f.index);
        f.index
            .write()
            .unwrap()
            .registry
            .upsert_ingress(ingress_with_class(Some("pomerium")));
        f.index
            .write()
            .unwrap()
            .registry
            .upsert_ingress_class(pomerium_class(false));

        f.reconciler.process(key()).await;
        f.reconciler.process(key()).await;
        f.reconciler.process(key()).await;

        // one write, one event; later reconciles found nothing to change
        assert_eq!(f.sink.reasons(), vec!["Updated".to_string()]);
    }

    #[tokio::test]
    async fn assemble_all_feeds_the_startup_set() {
        let f = fixture();
        seed_backends(&f.index);
        f.index
            .write()
            .unwrap()
            .registry
            .upsert_ingress(ingress_with_class(Some("pomerium")));
        f.index
            .write()
            .unwrap()
            .registry
            .upsert_ingress_class(pomerium_class(false));

        // a leftover record from a previous run, no longer backed by an ingress
        f.store
            .put(
                "ingress/default/departed",
                b"{}".to_vec(),
                crate::databroker::PutCondition::Any,
            )
            .await
            .unwrap();

        let configs = f.reconciler.assemble_all();
        assert_eq!(configs.len(), 1);
        f.reconciler.applier.set(configs).await.unwrap();

        assert_eq!(f.store.keys(), vec!["ingress/default/ingress".to_string()]);
    }

    #[tokio::test]
    async fn transient_store_failures_requeue_with_backoff() {
        let f = fixture();
        seed_backends(&f.index);
        f.index
            .write()
            .unwrap()
            .registry
            .upsert_ingress(ingress_with_class(Some("pomerium")));
        f.index
            .write()
            .unwrap()
            .registry
            .upsert_ingress_class(pomerium_class(false));

        f.store.set_offline(true);
        f.reconciler.process(key()).await;
        assert!(f.reconciler.attempts.lock().unwrap().contains_key(&key()));

        // the key comes back through the queue once the backoff elapses
        f.store.set_offline(false);
        let requeued = tokio::time::timeout(
            std::time::Duration::from_secs(2),
            f.reconciler.queue.next(),
        )
        .await
        .expect("requeue never arrived");
        assert_eq!(requeued, key());

        f.reconciler.process(requeued).await;
        assert_eq!(f.store.keys(), vec!["ingress/default/ingress".to_string()]);
        assert!(f.reconciler.attempts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn queue_deduplicates_pending_keys() {
        let queue = WorkQueue::new();
        queue.enqueue(key());
        queue.enqueue(key());
        queue.enqueue(ObjectKey::new("default", "other"));

        assert_eq!(queue.next().await, key());
        assert_eq!(queue.next().await, ObjectKey::new("default", "other"));

        // after being dequeued the key may be enqueued again
        queue.enqueue(key());
        assert_eq!(queue.next().await, key());
    }

    #[test]
    fn backoff_delay_is_bounded() {
        for attempt in 1..=20 {
            let delay = backoff_delay(attempt);
            assert!(delay <= BACKOFF_CAP, "attempt {attempt}: {delay:?}");
        }
        // the first retry stays within the initial window
        assert!(backoff_delay(1) <= BACKOFF_INITIAL);
    }
}
