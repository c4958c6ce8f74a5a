//! Mirrors the proxy Service's load-balancer address onto the status of
//! every owned Ingress, so `kubectl get ingress` shows where traffic enters.

use std::sync::{Arc, RwLock};

use k8s_openapi::api::core::v1::LoadBalancerIngress;
use k8s_openapi::api::networking::v1::{
    Ingress, IngressClass, IngressLoadBalancerIngress, IngressPortStatus,
};
use kube::api::{Api, Patch, PatchParams};
use kube::Client;
use serde_json::json;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::controllers::{ownership, Settings};
use crate::index::SharedIndex;
use crate::model::ObjectKey;

/// Service and Ingress statuses use distinct load-balancer types with the
/// same shape.
pub fn to_ingress_load_balancer(lb: &[LoadBalancerIngress]) -> Vec<IngressLoadBalancerIngress> {
    lb.iter()
        .map(|entry| IngressLoadBalancerIngress {
            hostname: entry.hostname.clone(),
            ip: entry.ip.clone(),
            ports: entry.ports.as_ref().map(|ports| {
                ports
                    .iter()
                    .map(|p| IngressPortStatus {
                        port: p.port,
                        protocol: p.protocol.clone(),
                        error: p.error.clone(),
                    })
                    .collect()
            }),
        })
        .collect()
}

pub struct StatusUpdater {
    client: Client,
    index: Arc<RwLock<SharedIndex>>,
    settings: Settings,
}

impl StatusUpdater {
    pub fn new(client: Client, index: Arc<RwLock<SharedIndex>>, settings: Settings) -> Self {
        Self {
            client,
            index,
            settings,
        }
    }

    /// Apply every change arriving on `rx` until cancelled.
    pub async fn run(
        &self,
        mut rx: watch::Receiver<Option<Vec<IngressLoadBalancerIngress>>>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                changed = rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
            let Some(lb) = rx.borrow_and_update().clone() else {
                continue;
            };
            self.propagate(&lb).await;
        }
    }

    /// Patch `lb` onto the status of every owned Ingress whose recorded
    /// status differs.
    async fn propagate(&self, lb: &[IngressLoadBalancerIngress]) {
        let patches = {
            let index = self.index.read().unwrap();
            let classes = index.registry.ingress_classes();
            let ingresses: Vec<Arc<Ingress>> = index
                .registry
                .ingresses()
                .map(|(_, ingress)| ingress.clone())
                .collect();
            targets_needing_patch(lb, &ingresses, &classes, &self.settings.controller_name)
        };

        for (key, patch) in patches {
            let api: Api<Ingress> = Api::namespaced(self.client.clone(), &key.namespace);
            match api
                .patch_status(&key.name, &PatchParams::default(), &Patch::Merge(&patch))
                .await
            {
                Ok(_) => debug!(ingress = %key, "load balancer status updated"),
                Err(e) => {
                    warn!(ingress = %key, error = %e, "updating ingress status failed");
                }
            }
        }
    }
}

/// The merge patches that converge every owned Ingress onto `lb`. Unowned
/// Ingresses are never touched; an Ingress already carrying `lb` produces no
/// write.
fn targets_needing_patch(
    lb: &[IngressLoadBalancerIngress],
    ingresses: &[Arc<Ingress>],
    classes: &[Arc<IngressClass>],
    controller_name: &str,
) -> Vec<(ObjectKey, serde_json::Value)> {
    ingresses
        .iter()
        .filter(|ingress| ownership::evaluate(ingress, classes, controller_name).is_some())
        .filter(|ingress| {
            let current = ingress
                .status
                .as_ref()
                .and_then(|s| s.load_balancer.as_ref())
                .and_then(|l| l.ingress.as_deref())
                .unwrap_or_default();
            current != lb
        })
        .map(|ingress| {
            (
                ObjectKey::of(ingress.as_ref()),
                json!({"status": {"loadBalancer": {"ingress": lb}}}),
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::PortStatus;

    fn from_json<K: serde::de::DeserializeOwned>(value: serde_json::Value) -> K {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn converts_service_load_balancer_entries() {
        let lb = vec![LoadBalancerIngress {
            ip: Some("10.10.10.10".into()),
            hostname: None,
            ports: Some(vec![PortStatus {
                port: 443,
                protocol: "TCP".into(),
                error: None,
            }]),
            ..Default::default()
        }];
        let converted = to_ingress_load_balancer(&lb);
        assert_eq!(converted.len(), 1);
        assert_eq!(converted[0].ip.as_deref(), Some("10.10.10.10"));
        assert_eq!(converted[0].ports.as_ref().unwrap()[0].port, 443);
    }

    #[test]
    fn patches_only_owned_ingresses_with_stale_status() {
        let classes = vec![Arc::new(from_json::<IngressClass>(json!({
            "metadata": {"name": "pomerium"},
            "spec": {"controller": "pomerium.io/ingress-controller"}
        })))];
        let lb = vec![IngressLoadBalancerIngress {
            ip: Some("10.10.10.10".into()),
            ..Default::default()
        }];

        let stale: Ingress = from_json(json!({
            "metadata": {"name": "ingress", "namespace": "default"},
            "spec": {"ingressClassName": "pomerium"}
        }));
        let converged: Ingress = from_json(json!({
            "metadata": {"name": "converged", "namespace": "default"},
            "spec": {"ingressClassName": "pomerium"},
            "status": {"loadBalancer": {"ingress": [{"ip": "10.10.10.10"}]}}
        }));
        let foreign: Ingress = from_json(json!({
            "metadata": {"name": "foreign", "namespace": "default"},
            "spec": {"ingressClassName": "other"}
        }));
        let ingresses = vec![Arc::new(stale), Arc::new(converged), Arc::new(foreign)];

        let patches = targets_needing_patch(
            &lb,
            &ingresses,
            &classes,
            "pomerium.io/ingress-controller",
        );

        // only the owned ingress whose status lags gets a write
        assert_eq!(patches.len(), 1);
        let (key, patch) = &patches[0];
        assert_eq!(*key, ObjectKey::new("default", "ingress"));
        assert_eq!(patch["status"]["loadBalancer"]["ingress"][0]["ip"], "10.10.10.10");

        // once everything carries the address, nothing is written at all
        let converged_only = vec![ingresses[1].clone()];
        assert!(targets_needing_patch(
            &lb,
            &converged_only,
            &classes,
            "pomerium.io/ingress-controller"
        )
        .is_empty());
    }
}
