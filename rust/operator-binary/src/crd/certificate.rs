use const_format::concatcp;
use serde::{Deserialize, Serialize};
use stackable_cert_operator_crd_utils::SecretReference;
use stackable_operator::{
    kube::CustomResource,
    schemars::{self, JsonSchema},
};

use crate::OPERATOR_NAME;

/// Class of the controller instance responsible for an object.
pub const ANNOTATION_CLASS: &str = concatcp!(OPERATOR_NAME, "/class");
/// Asks the issuing controller to forward the owner references to the generated Secret.
pub const ANNOTATION_FORWARD_OWNER_REFS: &str = concatcp!(OPERATOR_NAME, "/forward-owner-refs");
/// Full key (`Kind/namespace/name`) of the source object owning a [`Certificate`].
pub const ANNOTATION_OWNER: &str = concatcp!(OPERATOR_NAME, "/owner");
/// Lowercase kind of the source object owning a [`Certificate`], used to narrow down list queries.
pub const LABEL_OWNER_KIND: &str = concatcp!(OPERATOR_NAME, "/owner-kind");

/// A request for a TLS certificate, stored in the Secret named by `secretRef` or `secretName`.
///
/// Certificates are created and maintained for certificate sources (such as annotated Services),
/// and are picked up by an issuing controller that reports progress back through the status.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    group = "certs.stackable.tech",
    version = "v1alpha1",
    kind = "Certificate",
    namespaced,
    status = "CertificateStatus",
    shortname = "cert",
    crates(
        kube_core = "stackable_operator::kube::core",
        k8s_openapi = "stackable_operator::k8s_openapi",
        schemars = "stackable_operator::schemars"
    )
)]
#[serde(rename_all = "camelCase")]
pub struct CertificateSpec {
    /// Common name of the certificate, the first domain of the request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub common_name: Option<String>,
    /// Additional domains, used as subject alternative names.
    #[serde(default)]
    pub dns_names: Vec<String>,
    /// Name of the Secret (in the Certificate's namespace) to store the certificate in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_name: Option<String>,
    /// Secret to store the certificate in, takes precedence over `secretName`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<SecretReference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issuer_ref: Option<IssuerRef>,
    /// Whether DNS challenges should follow CNAME records of the domains.
    #[serde(
        rename = "followCNAME",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub follow_cname: Option<bool>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct IssuerRef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl IssuerRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: None,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CertificateStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<CertificateState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema, strum::Display)]
pub enum CertificateState {
    Pending,
    Ready,
    Error,
    #[serde(other)]
    Unknown,
}

impl Certificate {
    /// The name of the Secret that this Certificate is issued into.
    ///
    /// This is the join key between desired and existing certificates of a source.
    pub fn secret_name(&self) -> Option<&str> {
        self.spec
            .secret_ref
            .as_ref()
            .map(|secret_ref| secret_ref.name.as_str())
            .or(self.spec.secret_name.as_deref())
    }

    pub fn state(&self) -> Option<CertificateState> {
        self.status.as_ref().and_then(|status| status.state)
    }

    pub fn message(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|status| status.message.as_deref())
    }

    /// Common name for logging, falling back to the first DNS name.
    pub fn safe_common_name(&self) -> &str {
        self.spec
            .common_name
            .as_deref()
            .or(self.spec.dns_names.first().map(String::as_str))
            .unwrap_or_default()
    }
}
