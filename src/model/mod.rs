//! Shared data model: object identities, annotation keys, and the
//! `IngressConfig` snapshot emitted for every managed Ingress.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use k8s_openapi::api::core::v1::{Endpoints, Secret, Service};
use k8s_openapi::api::networking::v1::{Ingress, IngressBackend, ServiceBackendPort};
use kube::ResourceExt;
use serde::ser::{Serialize, Serializer};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Ingress annotation naming a secret with a custom certificate authority
/// bundle for the upstream connection. Relative to the configured prefix.
pub const TLS_CUSTOM_CA_SECRET: &str = "tls_custom_ca_secret";
/// Ingress annotation naming a TLS secret presented as a client certificate
/// to the upstream.
pub const TLS_CLIENT_SECRET: &str = "tls_client_secret";
/// Ingress annotation naming a CA bundle used to verify downstream clients.
pub const TLS_DOWNSTREAM_CLIENT_CA_SECRET: &str = "tls_downstream_client_ca_secret";

/// IngressClass annotation (relative to the configured prefix) naming a
/// `namespace/name` secret used when an Ingress TLS entry has no secret name.
pub const DEFAULT_CERT_SECRET_KEY: &str = "default-cert-secret";

/// Standard annotation marking an IngressClass as the cluster default.
pub const INGRESS_CLASS_DEFAULT_ANNOTATION: &str = "ingressclass.kubernetes.io/is-default-class";
/// Deprecated ingress class annotation, still honored for compatibility.
pub const LEGACY_INGRESS_CLASS_ANNOTATION: &str = "kubernetes.io/ingress.class";
/// cert-manager marks its ACME challenge Ingresses with this label. They must
/// be exposed even while their TLS material does not exist yet.
pub const HTTP01_SOLVER_LABEL: &str = "acme.cert-manager.io/http01-solver";

const TLS_SECRET_TYPE: &str = "kubernetes.io/tls";
const TLS_CERT_KEY: &str = "tls.crt";
const TLS_PRIVATE_KEY_KEY: &str = "tls.key";

/// The kinds of objects tracked by the controller.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Kind {
    Ingress,
    IngressClass,
    Service,
    Endpoints,
    Secret,
}

impl Kind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Kind::Ingress => "Ingress",
            Kind::IngressClass => "IngressClass",
            Kind::Service => "Service",
            Kind::Endpoints => "Endpoints",
            Kind::Secret => "Secret",
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A namespaced object identity. Cluster-scoped objects (IngressClass) leave
/// the namespace empty.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Identity of a namespaced Kubernetes object.
    pub fn of<K>(obj: &K) -> Self
    where
        K: kube::Resource,
    {
        Self {
            namespace: obj.meta().namespace.clone().unwrap_or_default(),
            name: obj.meta().name.clone().unwrap_or_default(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            f.write_str(&self.name)
        } else {
            write!(f, "{}/{}", self.namespace, self.name)
        }
    }
}

impl FromStr for ObjectKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((namespace, name)) if !namespace.is_empty() && !name.is_empty() => {
                Ok(Self::new(namespace, name))
            }
            None if !s.is_empty() => Ok(Self::new("", s)),
            _ => Err(format!("expected namespace/name, got {s:?}")),
        }
    }
}

// Serialized as "namespace/name" so it can key canonical JSON maps.
impl Serialize for ObjectKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// A dependency edge target: one object another object relies on.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Dep {
    pub kind: Kind,
    pub key: ObjectKey,
}

impl Dep {
    pub fn new(kind: Kind, key: ObjectKey) -> Self {
        Self { kind, key }
    }
}

impl fmt::Display for Dep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.key)
    }
}

/// An Ingress that was evaluated but cannot be published to the store in its
/// current state. Not a process error: the reason lands on the Ingress' event
/// stream and the key is removed from the store until the state changes.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct UnemittableError(pub String);

impl UnemittableError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

/// Self-contained snapshot of one Ingress and every object it references.
///
/// Maps are `BTreeMap` so the JSON serialization is canonical: two equal
/// configs always produce byte-equal output.
#[derive(Clone, Debug, serde::Serialize)]
pub struct IngressConfig {
    pub ingress: Ingress,
    pub services: BTreeMap<ObjectKey, Service>,
    pub endpoints: BTreeMap<ObjectKey, Endpoints>,
    pub secrets: BTreeMap<ObjectKey, Secret>,
    /// Secret inherited from the IngressClass when a TLS entry names none.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_cert_secret: Option<ObjectKey>,
}

impl IngressConfig {
    pub fn new(ingress: Ingress) -> Self {
        Self {
            ingress,
            services: BTreeMap::new(),
            endpoints: BTreeMap::new(),
            secrets: BTreeMap::new(),
            default_cert_secret: None,
        }
    }

    /// The store key identity of this config.
    pub fn key(&self) -> ObjectKey {
        ObjectKey::of(&self.ingress)
    }

    /// Canonical serialization. Equal configs are byte-equal.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// SHA-256 hex digest of the canonical serialization.
    pub fn fingerprint(&self) -> Result<String, serde_json::Error> {
        let bytes = self.canonical_bytes()?;
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        Ok(format!("{:x}", hasher.finalize()))
    }
}

/// Does the Ingress carry the cert-manager HTTP-01 solver label?
pub fn is_http01_solver(ingress: &Ingress) -> bool {
    ingress
        .labels()
        .get(HTTP01_SOLVER_LABEL)
        .is_some_and(|v| v == "true")
}

/// Every `(service name, port)` pair referenced by the Ingress' rules and its
/// default backend, in rule order.
pub fn backend_refs(ingress: &Ingress) -> Vec<(String, Option<ServiceBackendPort>)> {
    let mut refs = Vec::new();
    let Some(spec) = &ingress.spec else {
        return refs;
    };
    let mut push = |backend: &IngressBackend| {
        if let Some(svc) = &backend.service {
            refs.push((svc.name.clone(), svc.port.clone()));
        }
    };
    if let Some(default_backend) = &spec.default_backend {
        push(default_backend);
    }
    for rule in spec.rules.iter().flatten() {
        for path in rule.http.iter().flat_map(|h| &h.paths) {
            push(&path.backend);
        }
    }
    refs
}

/// Whether the Service exposes the requested port, matched by name or number.
/// A backend with no port requirement matches any Service.
pub fn service_has_port(service: &Service, port: Option<&ServiceBackendPort>) -> bool {
    let Some(port) = port else {
        return true;
    };
    let ports = service
        .spec
        .as_ref()
        .and_then(|s| s.ports.as_ref())
        .map(Vec::as_slice)
        .unwrap_or_default();
    ports.iter().any(|p| {
        if let Some(name) = &port.name {
            p.name.as_ref() == Some(name)
        } else if let Some(number) = port.number {
            p.port == number
        } else {
            false
        }
    })
}

fn secret_data_key_nonempty(secret: &Secret, key: &str) -> bool {
    let in_data = secret
        .data
        .as_ref()
        .and_then(|d| d.get(key))
        .is_some_and(|v| !v.0.is_empty());
    let in_string_data = secret
        .string_data
        .as_ref()
        .and_then(|d| d.get(key))
        .is_some_and(|v| !v.is_empty());
    in_data || in_string_data
}

/// A TLS secret must be of TLS type and carry non-empty certificate and key.
pub fn validate_tls_secret(key: &ObjectKey, secret: &Secret) -> Result<(), UnemittableError> {
    if secret.type_.as_deref() != Some(TLS_SECRET_TYPE) {
        return Err(UnemittableError::new(format!(
            "secret {key} must be of type {TLS_SECRET_TYPE}"
        )));
    }
    for data_key in [TLS_CERT_KEY, TLS_PRIVATE_KEY_KEY] {
        if !secret_data_key_nonempty(secret, data_key) {
            return Err(UnemittableError::new(format!(
                "secret {key} is missing {data_key}"
            )));
        }
    }
    Ok(())
}

/// A CA bundle secret only needs a non-empty certificate; its type is free.
pub fn validate_ca_secret(key: &ObjectKey, secret: &Secret) -> Result<(), UnemittableError> {
    if !secret_data_key_nonempty(secret, TLS_CERT_KEY) {
        return Err(UnemittableError::new(format!(
            "secret {key} is missing {TLS_CERT_KEY}"
        )));
    }
    Ok(())
}
