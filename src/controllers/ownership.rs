//! Decides whether an Ingress belongs to this controller.
//!
//! An Ingress is ours when its class (named by `spec.ingressClassName` or the
//! deprecated `kubernetes.io/ingress.class` annotation, which wins when both
//! are present) resolves to an IngressClass whose `spec.controller` matches
//! the configured controller name; or, when it names no class at all, when an
//! IngressClass of ours is annotated as the cluster default. cert-manager
//! HTTP-01 solver Ingresses are always ours.

use std::sync::Arc;

use k8s_openapi::api::networking::v1::{Ingress, IngressClass};
use kube::ResourceExt;

use crate::model::{
    is_http01_solver, INGRESS_CLASS_DEFAULT_ANNOTATION, LEGACY_INGRESS_CLASS_ANNOTATION,
};

/// A positive ownership verdict.
pub struct Owned {
    /// The governing IngressClass, when one resolves. HTTP-01 solver
    /// Ingresses may be owned without one.
    pub class: Option<Arc<IngressClass>>,
    /// TLS structural validation is skipped for solver Ingresses.
    pub http01_solver: bool,
}

fn controller_matches(class: &IngressClass, controller_name: &str) -> bool {
    class
        .spec
        .as_ref()
        .and_then(|s| s.controller.as_deref())
        .is_some_and(|c| c == controller_name)
}

fn is_default_class(class: &IngressClass) -> bool {
    class
        .annotations()
        .get(INGRESS_CLASS_DEFAULT_ANNOTATION)
        .is_some_and(|v| v == "true")
}

fn class_by_name<'a>(
    classes: &'a [Arc<IngressClass>],
    name: &str,
) -> Option<&'a Arc<IngressClass>> {
    classes.iter().find(|c| c.name_any() == name)
}

/// The class name an Ingress asks for, if any. The legacy annotation takes
/// precedence over `spec.ingressClassName`.
pub fn requested_class_name(ingress: &Ingress) -> Option<&str> {
    ingress
        .annotations()
        .get(LEGACY_INGRESS_CLASS_ANNOTATION)
        .map(String::as_str)
        .or_else(|| {
            ingress
                .spec
                .as_ref()
                .and_then(|s| s.ingress_class_name.as_deref())
        })
}

/// Evaluate ownership of `ingress` against the current set of IngressClasses.
pub fn evaluate(
    ingress: &Ingress,
    classes: &[Arc<IngressClass>],
    controller_name: &str,
) -> Option<Owned> {
    let requested = requested_class_name(ingress);
    let resolved = requested.and_then(|name| class_by_name(classes, name));

    if is_http01_solver(ingress) {
        // solver ingresses are exposed regardless of class resolution
        return Some(Owned {
            class: resolved.cloned(),
            http01_solver: true,
        });
    }

    match resolved {
        Some(class) if controller_matches(class, controller_name) => Some(Owned {
            class: Some(class.clone()),
            http01_solver: false,
        }),
        Some(_) => None,
        None if requested.is_some() => None,
        None => classes
            .iter()
            .find(|c| controller_matches(c, controller_name) && is_default_class(c))
            .map(|class| Owned {
                class: Some(class.clone()),
                http01_solver: false,
            }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::networking::v1::{IngressClassSpec, IngressSpec};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;

    const CONTROLLER: &str = "pomerium.io/ingress-controller";

    fn class(name: &str, controller: &str, default: bool) -> Arc<IngressClass> {
        let annotations = default.then(|| {
            BTreeMap::from([(INGRESS_CLASS_DEFAULT_ANNOTATION.to_string(), "true".to_string())])
        });
        Arc::new(IngressClass {
            metadata: ObjectMeta {
                name: Some(name.into()),
                annotations,
                ..Default::default()
            },
            spec: Some(IngressClassSpec {
                controller: Some(controller.into()),
                ..Default::default()
            }),
        })
    }

    fn ingress(class_name: Option<&str>) -> Ingress {
        Ingress {
            metadata: ObjectMeta {
                name: Some("ingress".into()),
                namespace: Some("default".into()),
                ..Default::default()
            },
            spec: Some(IngressSpec {
                ingress_class_name: class_name.map(Into::into),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn owned_by_matching_class_name() {
        let classes = vec![class("pomerium", CONTROLLER, false)];

        // no class record at all
        assert!(evaluate(&ingress(Some("pomerium")), &[], CONTROLLER).is_none());

        let owned = evaluate(&ingress(Some("pomerium")), &classes, CONTROLLER).unwrap();
        assert_eq!(owned.class.unwrap().name_any(), "pomerium");

        // another controller's class
        let other = vec![class("other", "example.com/ingress-controller", false)];
        assert!(evaluate(&ingress(Some("other")), &other, CONTROLLER).is_none());
    }

    #[test]
    fn unclassed_requires_a_default_class() {
        let not_default = vec![class("pomerium", CONTROLLER, false)];
        assert!(evaluate(&ingress(None), &not_default, CONTROLLER).is_none());

        let default = vec![class("pomerium", CONTROLLER, true)];
        let owned = evaluate(&ingress(None), &default, CONTROLLER).unwrap();
        assert_eq!(owned.class.unwrap().name_any(), "pomerium");

        // a default class belonging to someone else does not grant ownership
        let foreign_default = vec![class("other", "example.com/ingress-controller", true)];
        assert!(evaluate(&ingress(None), &foreign_default, CONTROLLER).is_none());
    }

    #[test]
    fn legacy_annotation_wins_over_spec() {
        let classes = vec![
            class("pomerium", CONTROLLER, false),
            class("other", "example.com/ingress-controller", false),
        ];
        let mut ing = ingress(Some("other"));
        ing.metadata.annotations = Some(BTreeMap::from([(
            LEGACY_INGRESS_CLASS_ANNOTATION.to_string(),
            "pomerium".to_string(),
        )]));
        assert!(evaluate(&ing, &classes, CONTROLLER).is_some());

        // and the reverse: annotation points away from us
        let mut ing = ingress(Some("pomerium"));
        ing.metadata.annotations = Some(BTreeMap::from([(
            LEGACY_INGRESS_CLASS_ANNOTATION.to_string(),
            "other".to_string(),
        )]));
        assert!(evaluate(&ing, &classes, CONTROLLER).is_none());
    }

    #[test]
    fn http01_solver_is_always_owned() {
        let mut ing = ingress(None);
        ing.metadata.labels = Some(BTreeMap::from([(
            "acme.cert-manager.io/http01-solver".to_string(),
            "true".to_string(),
        )]));
        let owned = evaluate(&ing, &[], CONTROLLER).unwrap();
        assert!(owned.http01_solver);
        assert!(owned.class.is_none());
    }
}
