//! Lookup and persistence of the [`Certificate`]s owned by certificate sources

use std::{collections::BTreeMap, fmt::Display, str::FromStr};

use async_trait::async_trait;
use snafu::Snafu;
use stackable_operator::{
    k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference,
    kube::{
        self,
        api::{DeleteParams, ListParams, PostParams},
        runtime::reflector::ObjectRef,
        Api, Resource, ResourceExt,
    },
};

use crate::crd::{Certificate, ANNOTATION_OWNER, LABEL_OWNER_KIND};

/// Identifies a source object across kinds, rendered as `Kind/namespace/name`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OwnerKey {
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
}

impl OwnerKey {
    pub fn from_obj<K: Resource<DynamicType = ()>>(obj: &K) -> Self {
        Self {
            kind: K::kind(&()).into_owned(),
            namespace: obj.meta().namespace.clone(),
            name: obj.meta().name.clone().unwrap_or_default(),
        }
    }

    /// Returns [`None`] if the key refers to a different kind than `K`.
    pub fn object_ref<K: Resource<DynamicType = ()>>(&self) -> Option<ObjectRef<K>> {
        if self.kind != K::kind(&()) {
            return None;
        }
        let obj_ref = ObjectRef::new(&self.name);
        Some(match &self.namespace {
            Some(namespace) => obj_ref.within(namespace),
            None => obj_ref,
        })
    }

    fn kind_label(&self) -> String {
        self.kind.to_lowercase()
    }
}

impl Display for OwnerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.namespace {
            Some(namespace) => write!(f, "{}/{}/{}", self.kind, namespace, self.name),
            None => write!(f, "{}/{}", self.kind, self.name),
        }
    }
}

#[derive(Debug, Snafu)]
#[snafu(display("invalid owner key {key:?}, expected Kind/namespace/name"))]
pub struct ParseOwnerKeyError {
    key: String,
}

impl FromStr for OwnerKey {
    type Err = ParseOwnerKeyError;

    fn from_str(key: &str) -> Result<Self, Self::Err> {
        let parts = key.split('/').collect::<Vec<_>>();
        let (kind, namespace, name) = match parts.as_slice() {
            [kind, name] => (kind, None, name),
            [kind, namespace, name] => (kind, Some(namespace.to_string()), name),
            _ => return ParseOwnerKeySnafu { key }.fail(),
        };
        if kind.is_empty() || name.is_empty() {
            return ParseOwnerKeySnafu { key }.fail();
        }
        Ok(Self {
            kind: kind.to_string(),
            namespace,
            name: name.to_string(),
        })
    }
}

/// The source object that a [`Certificate`] is created for.
#[derive(Clone, Debug)]
pub struct Owner {
    pub key: OwnerKey,
    /// Only applied if the [`Certificate`] lives in the owner's namespace.
    pub reference: Option<OwnerReference>,
}

impl Owner {
    pub fn from_obj<K: Resource<DynamicType = ()>>(obj: &K) -> Self {
        Self {
            key: OwnerKey::from_obj(obj),
            reference: obj.controller_owner_ref(&()).map(|reference| OwnerReference {
                controller: None,
                ..reference
            }),
        }
    }
}

/// Finds and modifies the [`Certificate`]s owned by source objects.
#[async_trait]
pub trait CertificateRegistry: Send + Sync {
    async fn lookup_by_owner(&self, owner: &OwnerKey) -> Result<Vec<Certificate>, kube::Error>;

    /// Stamps `certificate` as being owned by `owner` before creating it.
    async fn create_for_owner(
        &self,
        owner: &Owner,
        certificate: Certificate,
    ) -> Result<Certificate, kube::Error>;

    async fn update(&self, certificate: &Certificate) -> Result<Certificate, kube::Error>;

    async fn delete(&self, certificate: &Certificate) -> Result<(), kube::Error>;
}

/// Marks `certificate` as owned by `owner`.
pub fn stamp_owner(owner: &Owner, certificate: &mut Certificate) {
    let meta = &mut certificate.metadata;
    meta.annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(ANNOTATION_OWNER.to_string(), owner.key.to_string());
    meta.labels
        .get_or_insert_with(BTreeMap::new)
        .insert(LABEL_OWNER_KIND.to_string(), owner.key.kind_label());
    if meta.namespace == owner.key.namespace {
        meta.owner_references = owner.reference.clone().map(|reference| vec![reference]);
    }
}

pub fn is_owned_by(certificate: &Certificate, owner: &OwnerKey) -> bool {
    certificate
        .annotations()
        .get(ANNOTATION_OWNER)
        .is_some_and(|key| *key == owner.to_string())
}

pub struct KubeRegistry {
    client: kube::Client,
    target_namespace: Option<String>,
}

impl KubeRegistry {
    pub fn new(client: kube::Client, target_namespace: Option<String>) -> Self {
        Self {
            client,
            target_namespace,
        }
    }

    fn api_for_owner(&self, owner: &OwnerKey) -> Api<Certificate> {
        match self.target_namespace.as_ref().or(owner.namespace.as_ref()) {
            Some(namespace) => Api::namespaced(self.client.clone(), namespace),
            None => Api::all(self.client.clone()),
        }
    }

    fn api_for(&self, certificate: &Certificate) -> Api<Certificate> {
        Api::namespaced(
            self.client.clone(),
            &certificate.namespace().unwrap_or_default(),
        )
    }
}

#[async_trait]
impl CertificateRegistry for KubeRegistry {
    async fn lookup_by_owner(&self, owner: &OwnerKey) -> Result<Vec<Certificate>, kube::Error> {
        let certificates = self
            .api_for_owner(owner)
            .list(&ListParams::default().labels(&format!(
                "{LABEL_OWNER_KIND}={}",
                owner.kind_label()
            )))
            .await?;
        Ok(certificates
            .into_iter()
            .filter(|certificate| is_owned_by(certificate, owner))
            .collect())
    }

    async fn create_for_owner(
        &self,
        owner: &Owner,
        mut certificate: Certificate,
    ) -> Result<Certificate, kube::Error> {
        stamp_owner(owner, &mut certificate);
        self.api_for(&certificate)
            .create(&PostParams::default(), &certificate)
            .await
    }

    async fn update(&self, certificate: &Certificate) -> Result<Certificate, kube::Error> {
        self.api_for(certificate)
            .replace(&certificate.name_any(), &PostParams::default(), certificate)
            .await
    }

    async fn delete(&self, certificate: &Certificate) -> Result<(), kube::Error> {
        self.api_for(certificate)
            .delete(&certificate.name_any(), &DeleteParams::default())
            .await?;
        Ok(())
    }
}
