use async_trait::async_trait;
use stackable_operator::{
    k8s_openapi::api::core::v1::Secret,
    kube::{
        self,
        api::{Patch, PatchParams, PostParams},
        runtime::reflector::ObjectRef,
        Api, ResourceExt,
    },
};

use crate::crd::{Issuer, IssuerStatus};

/// The Kubernetes operations needed to manage [`Issuer`]s.
#[async_trait]
pub trait IssuerClient: Send + Sync {
    async fn get_secret(&self, secret: &ObjectRef<Secret>) -> Result<Secret, kube::Error>;

    async fn create_secret(&self, secret: &Secret) -> Result<Secret, kube::Error>;

    async fn replace_issuer(&self, issuer: &Issuer) -> Result<Issuer, kube::Error>;

    /// Overwrites every status field, including the ones that are [`None`] in `status`.
    async fn patch_issuer_status(&self, issuer: &Issuer, status: &IssuerStatus) -> Result<(), kube::Error>;
}

pub struct KubeIssuerClient {
    client: kube::Client,
}

impl KubeIssuerClient {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }

    fn issuers(&self, issuer: &Issuer) -> Api<Issuer> {
        Api::namespaced(self.client.clone(), &issuer.namespace().unwrap_or_default())
    }
}

#[async_trait]
impl IssuerClient for KubeIssuerClient {
    async fn get_secret(&self, secret: &ObjectRef<Secret>) -> Result<Secret, kube::Error> {
        Api::<Secret>::namespaced(
            self.client.clone(),
            secret.namespace.as_deref().unwrap_or_default(),
        )
        .get(&secret.name)
        .await
    }

    async fn create_secret(&self, secret: &Secret) -> Result<Secret, kube::Error> {
        Api::<Secret>::namespaced(self.client.clone(), &secret.namespace().unwrap_or_default())
            .create(&PostParams::default(), secret)
            .await
    }

    async fn replace_issuer(&self, issuer: &Issuer) -> Result<Issuer, kube::Error> {
        self.issuers(issuer)
            .replace(&issuer.name_any(), &PostParams::default(), issuer)
            .await
    }

    async fn patch_issuer_status(&self, issuer: &Issuer, status: &IssuerStatus) -> Result<(), kube::Error> {
        // Spelled out, since a merge patch would keep fields that are skipped when serializing
        let patch = serde_json::json!({
            "status": {
                "observedGeneration": status.observed_generation,
                "state": status.state,
                "message": status.message,
                "type": status.type_,
                "acme": status.acme,
            }
        });
        self.issuers(issuer)
            .patch_status(&issuer.name_any(), &PatchParams::default(), &Patch::Merge(patch))
            .await?;
        Ok(())
    }
}
