//! Watch plumbing: one `kube::runtime::watcher` stream per resource kind,
//! applying objects to the shared index and fanning changes out to the work
//! queue. A separate single-object watch mirrors the proxy Service's
//! load-balancer status into the status updater.

use std::collections::HashSet;
use std::fmt::Debug;
use std::sync::{Arc, RwLock};

use futures::StreamExt;
use k8s_openapi::api::core::v1::{Endpoints, Secret, Service};
use k8s_openapi::api::networking::v1::{Ingress, IngressClass, IngressLoadBalancerIngress};
use kube::api::Api;
use kube::runtime::watcher::{Config as WatcherConfig, Event as WatchEvent};
use kube::runtime::{watcher, WatchStreamExt};
use kube::Client;
use serde::de::DeserializeOwned;
use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::controllers::ownership::requested_class_name;
use crate::controllers::reconciler::WorkQueue;
use crate::controllers::status::to_ingress_load_balancer;
use crate::controllers::Settings;
use crate::index::SharedIndex;
use crate::model::{Kind, ObjectKey};

/// Index mutation on object arrival; returns the Ingress keys to reconcile.
type ApplyFn<K> = fn(&mut SharedIndex, K) -> Vec<ObjectKey>;
/// Index mutation on object removal; returns the Ingress keys to reconcile.
type RemoveFn = fn(&mut SharedIndex, &ObjectKey) -> Vec<ObjectKey>;

/// Everything needed to watch the cluster; `synced` receivers resolve once
/// each underlying watcher has delivered its initial list.
pub struct Watchers {
    pub synced: Vec<oneshot::Receiver<()>>,
}

/// Spawn all watch tasks. They stop when `cancel` fires.
pub fn spawn(
    client: Client,
    settings: &Settings,
    index: Arc<RwLock<SharedIndex>>,
    queue: Arc<WorkQueue>,
    lb_tx: watch::Sender<Option<Vec<IngressLoadBalancerIngress>>>,
    cancel: &CancellationToken,
) -> Watchers {
    let mut synced = Vec::new();

    // cluster-scoped
    {
        let (tx, rx) = oneshot::channel();
        synced.push(rx);
        debug!(kind = %Kind::IngressClass, "watcher started");
        tokio::spawn(run_watch(
            Kind::IngressClass,
            Api::<IngressClass>::all(client.clone()),
            WatcherConfig::default(),
            index.clone(),
            queue.clone(),
            cancel.child_token(),
            tx,
            apply_ingress_class,
            remove_ingress_class,
        ));
    }

    // namespaced kinds, one watcher per allowed namespace (or cluster-wide)
    let namespaces = watch_namespaces(settings);
    for namespace in &namespaces {
        macro_rules! watch_kind {
            ($kind:expr, $ty:ty, $apply:expr, $remove:expr) => {{
                let api: Api<$ty> = match namespace {
                    Some(ns) => Api::namespaced(client.clone(), ns),
                    None => Api::all(client.clone()),
                };
                let (tx, rx) = oneshot::channel();
                synced.push(rx);
                debug!(kind = %$kind, namespace = namespace.as_deref().unwrap_or("*"), "watcher started");
                tokio::spawn(run_watch(
                    $kind,
                    api,
                    WatcherConfig::default(),
                    index.clone(),
                    queue.clone(),
                    cancel.child_token(),
                    tx,
                    $apply,
                    $remove,
                ));
            }};
        }
        watch_kind!(Kind::Ingress, Ingress, apply_ingress, remove_ingress);
        watch_kind!(Kind::Service, Service, apply_service, remove_service);
        watch_kind!(Kind::Endpoints, Endpoints, apply_endpoints, remove_endpoints);
        watch_kind!(Kind::Secret, Secret, apply_secret, remove_secret);
    }

    // the proxy service may live outside the namespace allow-list, so it gets
    // a dedicated single-object watch feeding the status updater
    if let Some(proxy) = &settings.update_status_from_service {
        tokio::spawn(run_proxy_watch(
            Api::<Service>::namespaced(client, &proxy.namespace),
            proxy.name.clone(),
            lb_tx,
            cancel.child_token(),
        ));
    }

    Watchers { synced }
}

/// The watcher scopes implied by the namespace allow-list: one entry per
/// allowed namespace, or a single cluster-wide watcher when the list is
/// empty. Objects outside these scopes never reach the registry.
fn watch_namespaces(settings: &Settings) -> Vec<Option<String>> {
    if settings.namespaces.is_empty() {
        vec![None]
    } else {
        settings.namespaces.iter().cloned().map(Some).collect()
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_watch<K>(
    kind: Kind,
    api: Api<K>,
    config: WatcherConfig,
    index: Arc<RwLock<SharedIndex>>,
    queue: Arc<WorkQueue>,
    cancel: CancellationToken,
    synced: oneshot::Sender<()>,
    apply: ApplyFn<K>,
    remove: RemoveFn,
) where
    K: kube::Resource + Clone + DeserializeOwned + Debug + Send + 'static,
{
    let mut synced = Some(synced);
    let mut seen: HashSet<ObjectKey> = HashSet::new();
    let mut stream = watcher(api, config).default_backoff().boxed();

    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => return,
            event = stream.next() => event,
        };
        let Some(event) = event else {
            return;
        };
        match event {
            Ok(event) => {
                let mut keys = Vec::new();
                {
                    let mut index = index.write().unwrap();
                    match event {
                        WatchEvent::Init => seen.clear(),
                        WatchEvent::InitApply(obj) => {
                            seen.insert(ObjectKey::of(&obj));
                            keys.extend(apply(&mut index, obj));
                        }
                        WatchEvent::InitDone => {
                            // objects that vanished while we were re-listing
                            let stale: Vec<ObjectKey> = index
                                .registry
                                .keys(kind)
                                .into_iter()
                                .filter(|key| !seen.contains(key))
                                .collect();
                            for key in &stale {
                                keys.extend(remove(&mut index, key));
                            }
                            if let Some(tx) = synced.take() {
                                let _ = tx.send(());
                            }
                        }
                        WatchEvent::Apply(obj) => keys.extend(apply(&mut index, obj)),
                        WatchEvent::Delete(obj) => {
                            keys.extend(remove(&mut index, &ObjectKey::of(&obj)));
                        }
                    }
                }
                queue.enqueue_all(keys);
            }
            Err(e) => warn!(%kind, error = %e, "watch error"),
        }
    }
}

/// Mirrors the designated proxy Service's load-balancer status into `lb_tx`.
async fn run_proxy_watch(
    api: Api<Service>,
    name: String,
    lb_tx: watch::Sender<Option<Vec<IngressLoadBalancerIngress>>>,
    cancel: CancellationToken,
) {
    let config = WatcherConfig::default().fields(&format!("metadata.name={name}"));
    let mut stream = watcher(api, config).default_backoff().boxed();

    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => return,
            event = stream.next() => event,
        };
        let Some(event) = event else {
            return;
        };
        match event {
            Ok(WatchEvent::Apply(service)) | Ok(WatchEvent::InitApply(service)) => {
                let lb = service
                    .status
                    .as_ref()
                    .and_then(|s| s.load_balancer.as_ref())
                    .and_then(|lb| lb.ingress.as_deref())
                    .map(to_ingress_load_balancer)
                    .unwrap_or_default();
                lb_tx.send_if_modified(|current| {
                    if current.as_deref() != Some(lb.as_slice()) {
                        *current = Some(lb.clone());
                        true
                    } else {
                        false
                    }
                });
            }
            Ok(WatchEvent::Delete(_)) => {
                let lb: Vec<IngressLoadBalancerIngress> = Vec::new();
                lb_tx.send_if_modified(|current| {
                    if current.as_deref() != Some(lb.as_slice()) {
                        *current = Some(lb.clone());
                        true
                    } else {
                        false
                    }
                });
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "proxy service watch error"),
        }
    }
}

fn apply_ingress(index: &mut SharedIndex, obj: Ingress) -> Vec<ObjectKey> {
    vec![index.registry.upsert_ingress(obj)]
}

fn remove_ingress(index: &mut SharedIndex, key: &ObjectKey) -> Vec<ObjectKey> {
    index.registry.delete_ingress(key);
    vec![key.clone()]
}

/// A class change may flip ownership for every Ingress that names it, and,
/// when the default-class marker moves, for every unclassed Ingress.
fn affected_by_class(index: &SharedIndex, class_name: &str) -> Vec<ObjectKey> {
    index
        .registry
        .ingresses()
        .filter(|(_, ingress)| match requested_class_name(ingress) {
            Some(requested) => requested == class_name,
            None => true,
        })
        .map(|(key, _)| key.clone())
        .collect()
}

fn apply_ingress_class(index: &mut SharedIndex, obj: IngressClass) -> Vec<ObjectKey> {
    let key = index.registry.upsert_ingress_class(obj);
    affected_by_class(index, &key.name)
}

fn remove_ingress_class(index: &mut SharedIndex, key: &ObjectKey) -> Vec<ObjectKey> {
    index.registry.delete_ingress_class(key);
    affected_by_class(index, &key.name)
}

fn apply_service(index: &mut SharedIndex, obj: Service) -> Vec<ObjectKey> {
    let key = index.registry.upsert_service(obj);
    index.deps.dependents(Kind::Service, &key)
}

fn remove_service(index: &mut SharedIndex, key: &ObjectKey) -> Vec<ObjectKey> {
    index.registry.delete_service(key);
    index.deps.dependents(Kind::Service, key)
}

fn apply_endpoints(index: &mut SharedIndex, obj: Endpoints) -> Vec<ObjectKey> {
    let key = index.registry.upsert_endpoints(obj);
    index.deps.dependents(Kind::Endpoints, &key)
}

fn remove_endpoints(index: &mut SharedIndex, key: &ObjectKey) -> Vec<ObjectKey> {
    index.registry.delete_endpoints(key);
    index.deps.dependents(Kind::Endpoints, key)
}

fn apply_secret(index: &mut SharedIndex, obj: Secret) -> Vec<ObjectKey> {
    let key = index.registry.upsert_secret(obj);
    index.deps.dependents(Kind::Secret, &key)
}

fn remove_secret(index: &mut SharedIndex, key: &ObjectKey) -> Vec<ObjectKey> {
    index.registry.delete_secret(key);
    index.deps.dependents(Kind::Secret, key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn from_json<K: serde::de::DeserializeOwned>(value: serde_json::Value) -> K {
        serde_json::from_value(value).unwrap()
    }

    fn ingress(name: &str, class: Option<&str>) -> Ingress {
        from_json(json!({
            "metadata": {"name": name, "namespace": "default"},
            "spec": {"ingressClassName": class}
        }))
    }

    #[test]
    fn namespace_allow_list_controls_watcher_scope() {
        let filtered = Settings {
            namespaces: vec!["a".into(), "c".into()],
            ..Settings::default()
        };
        let scopes = watch_namespaces(&filtered);
        assert_eq!(scopes, vec![Some("a".to_string()), Some("c".to_string())]);
        // namespaces b and d are never watched, so identical objects created
        // there can never enter the registry or produce a store write
        assert!(!scopes.contains(&Some("b".to_string())));
        assert!(!scopes.contains(&Some("d".to_string())));
        assert!(!scopes.contains(&None));

        // an empty allow-list means one cluster-wide watcher per kind
        assert_eq!(watch_namespaces(&Settings::default()), vec![None]);
    }

    #[test]
    fn class_changes_fan_out_to_candidate_ingresses() {
        let mut index = SharedIndex::default();
        index.registry.upsert_ingress(ingress("classed", Some("pomerium")));
        index.registry.upsert_ingress(ingress("unclassed", None));
        index.registry.upsert_ingress(ingress("foreign", Some("other")));

        let class: IngressClass = from_json(json!({
            "metadata": {"name": "pomerium"},
            "spec": {"controller": "pomerium.io/ingress-controller"}
        }));

        let mut affected = apply_ingress_class(&mut index, class);
        affected.sort();
        // the matching and the unclassed ingress, but not the foreign one
        assert_eq!(
            affected,
            vec![
                ObjectKey::new("default", "classed"),
                ObjectKey::new("default", "unclassed"),
            ]
        );
    }

    #[test]
    fn dependency_changes_fan_out_via_the_graph() {
        use crate::model::Dep;
        use std::collections::BTreeSet;

        let mut index = SharedIndex::default();
        let ingress_key = ObjectKey::new("default", "ingress");
        index.deps.set_deps(
            &ingress_key,
            BTreeSet::from([Dep::new(Kind::Secret, ObjectKey::new("default", "secret"))]),
        );

        let secret: Secret = from_json(json!({
            "metadata": {"name": "secret", "namespace": "default"},
            "type": "kubernetes.io/tls",
            "data": {"tls.crt": "QQ==", "tls.key": "QQ=="}
        }));
        assert_eq!(apply_secret(&mut index, secret), vec![ingress_key.clone()]);

        // unrelated secrets touch nothing
        let other: Secret = from_json(json!({
            "metadata": {"name": "other", "namespace": "default"}
        }));
        assert!(apply_secret(&mut index, other).is_empty());

        // deletion reaches the same dependents
        assert_eq!(
            remove_secret(&mut index, &ObjectKey::new("default", "secret")),
            vec![ingress_key]
        );
    }
}
