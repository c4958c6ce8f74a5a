//! In-memory view of the watched cluster: the last-seen version of every
//! relevant object, plus a reverse index from dependencies to the Ingresses
//! that reference them.
//!
//! Both structures live behind a single `RwLock`. Watch handlers write,
//! the reconciler reads; neither side ever awaits while holding the lock.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use k8s_openapi::api::core::v1::{Endpoints, Secret, Service};
use k8s_openapi::api::networking::v1::{Ingress, IngressClass};

use crate::model::{Dep, Kind, ObjectKey};

/// Last-seen snapshots of all watched objects, keyed by identity.
#[derive(Default)]
pub struct Registry {
    ingresses: BTreeMap<ObjectKey, Arc<Ingress>>,
    ingress_classes: BTreeMap<ObjectKey, Arc<IngressClass>>,
    services: BTreeMap<ObjectKey, Arc<Service>>,
    endpoints: BTreeMap<ObjectKey, Arc<Endpoints>>,
    secrets: BTreeMap<ObjectKey, Arc<Secret>>,
}

macro_rules! registry_accessors {
    ($upsert:ident, $delete:ident, $get:ident, $field:ident, $ty:ty) => {
        pub fn $upsert(&mut self, obj: $ty) -> ObjectKey {
            let key = ObjectKey::of(&obj);
            self.$field.insert(key.clone(), Arc::new(obj));
            key
        }

        pub fn $delete(&mut self, key: &ObjectKey) {
            self.$field.remove(key);
        }

        pub fn $get(&self, key: &ObjectKey) -> Option<Arc<$ty>> {
            self.$field.get(key).cloned()
        }
    };
}

impl Registry {
    registry_accessors!(upsert_ingress, delete_ingress, ingress, ingresses, Ingress);
    registry_accessors!(
        upsert_ingress_class,
        delete_ingress_class,
        ingress_class,
        ingress_classes,
        IngressClass
    );
    registry_accessors!(upsert_service, delete_service, service, services, Service);
    registry_accessors!(
        upsert_endpoints,
        delete_endpoints,
        endpoints,
        endpoints,
        Endpoints
    );
    registry_accessors!(upsert_secret, delete_secret, secret, secrets, Secret);

    pub fn ingresses(&self) -> impl Iterator<Item = (&ObjectKey, &Arc<Ingress>)> {
        self.ingresses.iter()
    }

    pub fn ingress_keys(&self) -> Vec<ObjectKey> {
        self.ingresses.keys().cloned().collect()
    }

    pub fn ingress_classes(&self) -> Vec<Arc<IngressClass>> {
        self.ingress_classes.values().cloned().collect()
    }

    /// All keys currently stored for one kind. Used by the watch layer to
    /// find objects that vanished while a watcher was re-listing.
    pub fn keys(&self, kind: Kind) -> Vec<ObjectKey> {
        match kind {
            Kind::Ingress => self.ingresses.keys().cloned().collect(),
            Kind::IngressClass => self.ingress_classes.keys().cloned().collect(),
            Kind::Service => self.services.keys().cloned().collect(),
            Kind::Endpoints => self.endpoints.keys().cloned().collect(),
            Kind::Secret => self.secrets.keys().cloned().collect(),
        }
    }
}

/// Reverse dependency index: `dep -> set of Ingress keys that reference it`.
#[derive(Default)]
pub struct DepGraph {
    dependents: HashMap<Dep, HashSet<ObjectKey>>,
    deps_by_ingress: HashMap<ObjectKey, BTreeSet<Dep>>,
}

impl DepGraph {
    /// Atomically replace the dependency set of one Ingress, removing its
    /// edges from dependencies no longer referenced.
    pub fn set_deps(&mut self, ingress: &ObjectKey, deps: BTreeSet<Dep>) {
        if let Some(old) = self.deps_by_ingress.get(ingress) {
            for dep in old.difference(&deps) {
                if let Some(set) = self.dependents.get_mut(dep) {
                    set.remove(ingress);
                    if set.is_empty() {
                        self.dependents.remove(dep);
                    }
                }
            }
        }
        for dep in &deps {
            self.dependents
                .entry(dep.clone())
                .or_default()
                .insert(ingress.clone());
        }
        self.deps_by_ingress.insert(ingress.clone(), deps);
    }

    pub fn dependents(&self, kind: Kind, key: &ObjectKey) -> Vec<ObjectKey> {
        self.dependents
            .get(&Dep::new(kind, key.clone()))
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Drop all edges pointing at this Ingress.
    pub fn remove_ingress(&mut self, ingress: &ObjectKey) {
        if let Some(deps) = self.deps_by_ingress.remove(ingress) {
            for dep in deps {
                if let Some(set) = self.dependents.get_mut(&dep) {
                    set.remove(ingress);
                    if set.is_empty() {
                        self.dependents.remove(&dep);
                    }
                }
            }
        }
    }
}

/// Registry and dependency graph guarded together, as the reconciler reads
/// them as one consistent snapshot.
#[derive(Default)]
pub struct SharedIndex {
    pub registry: Registry,
    pub deps: DepGraph,
}
