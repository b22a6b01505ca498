use std::{fmt::Debug, marker::PhantomData};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use stackable_operator::kube::{
    self,
    api::{Patch, PatchParams},
    core::NamespaceResourceScope,
    runtime::events::{Event, EventType, Recorder},
    Api, Resource, ResourceExt,
};

use super::{SourceAccess, FINALIZER};

/// Accesses source objects through the Kubernetes API.
pub struct KubeSourceAccess<K> {
    client: kube::Client,
    recorder: Recorder,
    _kind: PhantomData<fn() -> K>,
}

impl<K> KubeSourceAccess<K>
where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + DeserializeOwned
        + Debug
        + Send
        + Sync,
{
    pub fn new(client: kube::Client, recorder: Recorder) -> Self {
        Self {
            client,
            recorder,
            _kind: PhantomData,
        }
    }

    fn api(&self, source: &K) -> Api<K> {
        Api::namespaced(self.client.clone(), &source.namespace().unwrap_or_default())
    }

    /// Guarded by the resource version, so that finalizers added concurrently are never dropped.
    async fn patch_finalizers(&self, source: &K, finalizers: Vec<String>) -> Result<(), kube::Error> {
        let patch = serde_json::json!({
            "metadata": {
                "finalizers": finalizers,
                "resourceVersion": source.resource_version(),
            }
        });
        self.api(source)
            .patch(&source.name_any(), &PatchParams::default(), &Patch::Merge(patch))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl<K> SourceAccess<K> for KubeSourceAccess<K>
where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + DeserializeOwned
        + Debug
        + Send
        + Sync,
{
    async fn set_finalizer(&self, source: &K) -> Result<(), kube::Error> {
        if source.finalizers().iter().any(|finalizer| finalizer == FINALIZER) {
            return Ok(());
        }
        let mut finalizers = source.finalizers().to_vec();
        finalizers.push(FINALIZER.to_string());
        self.patch_finalizers(source, finalizers).await
    }

    async fn remove_finalizer(&self, source: &K) -> Result<(), kube::Error> {
        if !source.finalizers().iter().any(|finalizer| finalizer == FINALIZER) {
            return Ok(());
        }
        let finalizers = source
            .finalizers()
            .iter()
            .filter(|finalizer| *finalizer != FINALIZER)
            .cloned()
            .collect();
        self.patch_finalizers(source, finalizers).await
    }

    async fn publish_event(&self, source: &K, event_type: EventType, reason: &str, note: &str) {
        let event = Event {
            type_: event_type,
            reason: reason.to_string(),
            note: Some(note.to_string()),
            action: "Reconcile".to_string(),
            secondary: None,
        };
        if let Err(err) = self
            .recorder
            .publish(&event, &source.object_ref(&()))
            .await
        {
            tracing::warn!(
                source.name = %source.name_any(),
                error = &err as &dyn std::error::Error,
                "failed to publish event"
            );
        }
    }
}
