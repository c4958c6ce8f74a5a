//! Builds the self-contained `IngressConfig` snapshot for one owned Ingress
//! from the registry: backend Services with their Endpoints, TLS secrets,
//! annotation-referenced secrets, and the IngressClass default certificate.
//!
//! The dependency set is derived from *references*, so it is complete even
//! when resolution fails; a later create of a missing object then re-triggers
//! this Ingress.

use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::api::networking::v1::{Ingress, ServiceBackendPort};
use kube::ResourceExt;

use crate::controllers::ownership::Owned;
use crate::controllers::Settings;
use crate::index::Registry;
use crate::model::{
    backend_refs, service_has_port, validate_ca_secret, validate_tls_secret, Dep, IngressConfig,
    Kind, ObjectKey, UnemittableError, DEFAULT_CERT_SECRET_KEY, TLS_CLIENT_SECRET,
    TLS_CUSTOM_CA_SECRET, TLS_DOWNSTREAM_CLIENT_CA_SECRET,
};

/// How a referenced secret is used, which decides its shape check.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum SecretRole {
    ServerTls,
    DefaultCert,
    ClientCert,
    CaBundle,
}

struct Refs {
    class: Option<ObjectKey>,
    services: BTreeMap<ObjectKey, Vec<Option<ServiceBackendPort>>>,
    secrets: BTreeMap<ObjectKey, SecretRole>,
    default_cert: Option<ObjectKey>,
}

/// Assemble a config for `ingress`. The dependency set is returned in every
/// case; the config only when all structural invariants hold.
pub fn assemble(
    ingress: &Ingress,
    owned: &Owned,
    registry: &Registry,
    settings: &Settings,
) -> (BTreeSet<Dep>, Result<IngressConfig, UnemittableError>) {
    let refs = match collect_refs(ingress, owned, settings) {
        Ok(refs) => refs,
        Err(e) => {
            // references we could still determine keep their edges
            let refs = Refs {
                class: owned.class.as_deref().map(ObjectKey::of),
                services: backend_refs(ingress)
                    .into_iter()
                    .map(|(name, port)| {
                        (
                            ObjectKey::new(ingress.namespace().unwrap_or_default(), name),
                            vec![port],
                        )
                    })
                    .fold(BTreeMap::new(), |mut acc, (key, ports)| {
                        acc.entry(key).or_default().extend(ports);
                        acc
                    }),
                secrets: BTreeMap::new(),
                default_cert: None,
            };
            return (deps_of(&refs), Err(e));
        }
    };

    let deps = deps_of(&refs);
    let result = resolve(ingress, &refs, registry, settings, owned.http01_solver);
    (deps, result)
}

fn collect_refs(
    ingress: &Ingress,
    owned: &Owned,
    settings: &Settings,
) -> Result<Refs, UnemittableError> {
    let namespace = ingress.namespace().unwrap_or_default();
    let mut refs = Refs {
        class: owned.class.as_deref().map(ObjectKey::of),
        services: BTreeMap::new(),
        secrets: BTreeMap::new(),
        default_cert: None,
    };

    for (name, port) in backend_refs(ingress) {
        refs.services
            .entry(ObjectKey::new(namespace.clone(), name))
            .or_default()
            .push(port);
    }

    let default_cert = default_cert_secret(owned, settings)?;
    let tls_entries = ingress
        .spec
        .as_ref()
        .and_then(|s| s.tls.as_ref())
        .map(Vec::as_slice)
        .unwrap_or_default();
    for tls in tls_entries {
        match tls.secret_name.as_deref().filter(|n| !n.is_empty()) {
            Some(name) => {
                refs.secrets
                    .insert(ObjectKey::new(namespace.clone(), name), SecretRole::ServerTls);
            }
            None => match &default_cert {
                Some(key) => {
                    refs.secrets.insert(key.clone(), SecretRole::DefaultCert);
                    refs.default_cert = Some(key.clone());
                }
                None if settings.disable_cert_check || owned.http01_solver => {}
                None => {
                    return Err(UnemittableError::new(
                        "TLS entry has no secret name and the ingress class configures no default certificate",
                    ));
                }
            },
        }
    }

    for (annotation, role) in [
        (TLS_CUSTOM_CA_SECRET, SecretRole::CaBundle),
        (TLS_CLIENT_SECRET, SecretRole::ClientCert),
        (TLS_DOWNSTREAM_CLIENT_CA_SECRET, SecretRole::CaBundle),
    ] {
        let key = format!("{}/{}", settings.annotation_prefix, annotation);
        if let Some(name) = ingress.annotations().get(&key) {
            refs.secrets
                .insert(ObjectKey::new(namespace.clone(), name), role);
        }
    }

    Ok(refs)
}

/// The `namespace/name` default certificate configured on the governing
/// IngressClass, if any.
fn default_cert_secret(
    owned: &Owned,
    settings: &Settings,
) -> Result<Option<ObjectKey>, UnemittableError> {
    let annotation = format!("{}/{}", settings.annotation_prefix, DEFAULT_CERT_SECRET_KEY);
    let Some(value) = owned
        .class
        .as_ref()
        .and_then(|c| c.annotations().get(&annotation).cloned())
    else {
        return Ok(None);
    };
    match value.split_once('/') {
        Some((namespace, name)) if !namespace.is_empty() && !name.is_empty() => {
            Ok(Some(ObjectKey::new(namespace, name)))
        }
        _ => Err(UnemittableError::new(format!(
            "default certificate secret {value:?} must be in namespace/name form",
        ))),
    }
}

fn deps_of(refs: &Refs) -> BTreeSet<Dep> {
    let mut deps = BTreeSet::new();
    if let Some(class) = &refs.class {
        deps.insert(Dep::new(Kind::IngressClass, class.clone()));
    }
    for key in refs.services.keys() {
        deps.insert(Dep::new(Kind::Service, key.clone()));
        deps.insert(Dep::new(Kind::Endpoints, key.clone()));
    }
    for key in refs.secrets.keys() {
        deps.insert(Dep::new(Kind::Secret, key.clone()));
    }
    deps
}

fn resolve(
    ingress: &Ingress,
    refs: &Refs,
    registry: &Registry,
    settings: &Settings,
    http01_solver: bool,
) -> Result<IngressConfig, UnemittableError> {
    let mut config = IngressConfig::new(ingress.clone());
    config.default_cert_secret = refs.default_cert.clone();

    for (key, ports) in &refs.services {
        let Some(service) = registry.service(key) else {
            return Err(UnemittableError::new(format!("service {key} not found")));
        };
        for port in ports {
            if !service_has_port(&service, port.as_ref()) {
                let want = port
                    .as_ref()
                    .map(|p| {
                        p.name
                            .clone()
                            .or_else(|| p.number.map(|n| n.to_string()))
                            .unwrap_or_default()
                    })
                    .unwrap_or_default();
                return Err(UnemittableError::new(format!(
                    "service {key} has no port {want}"
                )));
            }
        }
        config.services.insert(key.clone(), (*service).clone());

        // a service without ready pods simply has no endpoints yet
        if let Some(endpoints) = registry.endpoints(key) {
            config.endpoints.insert(key.clone(), (*endpoints).clone());
        }
    }

    let skip_cert_checks = settings.disable_cert_check || http01_solver;
    for (key, role) in &refs.secrets {
        let Some(secret) = registry.secret(key) else {
            if skip_cert_checks && matches!(role, SecretRole::ServerTls | SecretRole::DefaultCert) {
                continue;
            }
            return Err(UnemittableError::new(format!("secret {key} not found")));
        };
        if !skip_cert_checks {
            match role {
                SecretRole::ServerTls | SecretRole::DefaultCert | SecretRole::ClientCert => {
                    validate_tls_secret(key, &secret)?
                }
                SecretRole::CaBundle => validate_ca_secret(key, &secret)?,
            }
        }
        config.secrets.insert(key.clone(), (*secret).clone());
    }

    Ok(config)
}
