//! CRD types that are shared between cert-operator components, but aren't clearly owned by one of them.

use std::fmt::Display;

use serde::{Deserialize, Serialize};
use stackable_operator::{
    k8s_openapi::api::core::v1::Secret,
    kube::{
        api::{DynamicObject, ObjectMeta, PartialObjectMeta},
        runtime::reflector::ObjectRef,
    },
    schemars::{self, JsonSchema},
};

// Redefine SecretReference instead of reusing k8s-openapi's, in order to make name mandatory.
// The namespace may be omitted, in which case it resolves to the namespace of the referring object.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecretReference {
    /// Name of the Secret being referred to.
    pub name: String,
    /// Namespace of the Secret being referred to, defaults to the namespace of the referring object.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl SecretReference {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: Some(namespace.into()),
        }
    }

    /// The namespace of the Secret, falling back to `default_namespace` if none was specified.
    pub fn namespace_or<'a>(&'a self, default_namespace: &'a str) -> &'a str {
        self.namespace.as_deref().unwrap_or(default_namespace)
    }

    /// Returns a reference with the namespace filled in.
    pub fn resolve(&self, default_namespace: &str) -> Self {
        Self::new(&self.name, self.namespace_or(default_namespace))
    }

    pub fn object_ref(&self, default_namespace: &str) -> ObjectRef<Secret> {
        ObjectRef::<Secret>::new(&self.name).within(self.namespace_or(default_namespace))
    }

    pub fn refers_to(&self, secret_meta: &ObjectMeta, default_namespace: &str) -> bool {
        secret_meta.name.as_deref() == Some(&self.name)
            && secret_meta.namespace.as_deref() == Some(self.namespace_or(default_namespace))
    }

    pub fn refers_to_secret(&self, secret: &PartialObjectMeta<Secret>, default_namespace: &str) -> bool {
        self.refers_to(&secret.metadata, default_namespace)
    }
}

// Use ObjectRef-like formatting for logging/errors
impl Display for SecretReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.namespace {
            Some(namespace) => ObjectRef::<Secret>::new(&self.name)
                .within(namespace)
                .fmt(f),
            None => ObjectRef::<Secret>::new(&self.name).fmt(f),
        }
    }
}
impl From<&SecretReference> for ObjectRef<DynamicObject> {
    fn from(val: &SecretReference) -> Self {
        let obj_ref = ObjectRef::<Secret>::new(&val.name);
        match &val.namespace {
            Some(namespace) => obj_ref.within(namespace).erase(),
            None => obj_ref.erase(),
        }
    }
}
