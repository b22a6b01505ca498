//! Translates certificate sources (objects that imply domains needing certificates) into
//! managed [`Certificate`](crate::crd::Certificate)s

use std::collections::BTreeMap;

use async_trait::async_trait;
use const_format::concatcp;
use stackable_operator::{
    k8s_openapi::apimachinery::pkg::apis::meta::v1::Time,
    kube::{self, runtime::events::EventType},
};

use crate::{
    crd::{Certificate, CertificateSpec, CertificateState, ANNOTATION_CLASS},
    status::Status,
    OPERATOR_NAME,
};

pub mod access;
pub mod controller;
pub mod reconciler;
pub mod registry;
pub mod service;

pub use reconciler::{Error, ReconcilerOptions, SourceReconciler};
pub use registry::{CertificateRegistry, Owner, OwnerKey};

/// Held by sources as long as they own [`Certificate`]s.
pub const FINALIZER: &str = concatcp!(OPERATOR_NAME, "/certificates");

/// Class used by sources that don't specify one.
pub const DEFAULT_CLASS: &str = "certs";

/// A certificate that a source wants to exist.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CertInfo {
    pub secret_name: String,
    /// The first domain becomes the common name, the rest are subject alternative names.
    pub domains: Vec<String>,
    pub issuer_name: Option<String>,
    pub follow_cname: bool,
}

/// The certificates desired by a source, keyed by secret name.
#[derive(Default)]
pub struct CertsInfo {
    pub certs: BTreeMap<String, CertInfo>,
    pub feedback: Option<Box<dyn CertFeedback>>,
    /// Problems that didn't prevent the source from being evaluated.
    pub warnings: Vec<String>,
}

impl CertsInfo {
    pub fn with_feedback(feedback: impl CertFeedback + 'static) -> Self {
        Self {
            feedback: Some(Box::new(feedback)),
            ..Self::default()
        }
    }

    pub fn insert(&mut self, cert: CertInfo) {
        self.certs.insert(cert.secret_name.clone(), cert);
    }
}

/// Snapshot of an existing [`Certificate`].
#[derive(Clone, Debug, PartialEq)]
pub struct CertState {
    pub spec: CertificateSpec,
    pub state: Option<CertificateState>,
    pub message: Option<String>,
    pub creation_timestamp: Option<Time>,
}

impl From<&Certificate> for CertState {
    fn from(cert: &Certificate) -> Self {
        Self {
            spec: cert.spec.clone(),
            state: cert.state(),
            message: cert.message().map(str::to_string),
            creation_timestamp: cert.metadata.creation_timestamp.clone(),
        }
    }
}

/// The [`Certificate`]s currently owned by a source, keyed by secret name.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CertCurrentState {
    pub cert_states: BTreeMap<String, CertState>,
}

impl CertCurrentState {
    pub fn contains_secret_name(&self, secret_name: &str) -> bool {
        self.cert_states.contains_key(secret_name)
    }

    pub fn get(&self, secret_name: &str) -> Option<&CertState> {
        self.cert_states.get(secret_name)
    }
}

/// Receives the state of a source's certificates, to be reported on the source.
///
/// `info` is [`None`] for reports that concern the source as a whole.
#[async_trait]
pub trait CertFeedback: Send + Sync {
    async fn pending(&self, info: Option<&CertInfo>, message: &str);
    async fn ready(&self, info: Option<&CertInfo>, message: &str);
    async fn failed(&self, info: Option<&CertInfo>, error: &str);
    /// Called once per pass, after all certificates have been reported.
    async fn succeeded(&self);
}

/// Extracts the desired certificates from one kind of source object.
#[async_trait]
pub trait CertSource<K: Sync>: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    fn setup(&self) {}

    fn start(&self) {}

    /// Returns [`None`] if the source has nothing to say about the object at all.
    async fn get_certs_info(
        &self,
        source: &K,
        current: &CertCurrentState,
    ) -> Result<Option<CertsInfo>, Self::Error>;

    /// The source object is gone, without having been cleaned up.
    async fn deleted(&self, _key: &OwnerKey) {}

    /// The source object is being deleted.
    async fn delete(&self, _source: &K) -> Result<(), Self::Error> {
        Ok(())
    }
}

/// Operations on the source objects themselves.
#[async_trait]
pub trait SourceAccess<K: Sync>: Send + Sync {
    /// Adds [`FINALIZER`], doing nothing if it is already present.
    async fn set_finalizer(&self, source: &K) -> Result<(), kube::Error>;

    /// Removes [`FINALIZER`], doing nothing if it is not present.
    async fn remove_finalizer(&self, source: &K) -> Result<(), kube::Error>;

    async fn publish_event(&self, source: &K, event_type: EventType, reason: &str, note: &str);
}

/// A reconciliation stage that runs after the certificates of a source have been taken care of.
#[async_trait]
pub trait NestedReconciler<K: Sync>: Send + Sync {
    fn setup(&self) {}

    fn start(&self) {}

    async fn reconcile(&self, _source: &K) -> Status<Error> {
        Status::Succeeded
    }

    async fn delete(&self, _source: &K) -> Status<Error> {
        Status::Succeeded
    }

    async fn deleted(&self, _key: &OwnerKey) -> Status<Error> {
        Status::Succeeded
    }
}

pub struct NoNested;
impl<K: Sync> NestedReconciler<K> for NoNested {}

/// Decides which source objects an operator instance is responsible for.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Classes {
    main: String,
}

impl Classes {
    pub fn new(main: impl Into<String>) -> Self {
        let main = main.into();
        Self {
            main: if main.is_empty() {
                DEFAULT_CLASS.to_string()
            } else {
                main
            },
        }
    }

    pub fn main(&self) -> &str {
        &self.main
    }

    /// Objects without a class belong to the default class.
    pub fn is_responsible_for(&self, annotations: &BTreeMap<String, String>) -> bool {
        match annotations.get(ANNOTATION_CLASS) {
            Some(class) => *class == self.main,
            None => self.main == DEFAULT_CLASS,
        }
    }

    /// The class to put on created [`Certificate`]s.
    pub fn target_class(&self, explicit: Option<String>) -> Option<String> {
        explicit
            .filter(|class| !class.is_empty())
            .or_else(|| (self.main != DEFAULT_CLASS).then(|| self.main.clone()))
    }
}
