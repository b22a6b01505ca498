use serde::{Deserialize, Serialize};
use stackable_cert_operator_crd_utils::SecretReference;
use stackable_operator::{
    kube::CustomResource,
    schemars::{self, gen::SchemaGenerator, schema::Schema, JsonSchema},
};

/// A certificate authority account that [`Certificate`](super::Certificate)s can be issued from.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    group = "certs.stackable.tech",
    version = "v1alpha1",
    kind = "Issuer",
    namespaced,
    status = "IssuerStatus",
    crates(
        kube_core = "stackable_operator::kube::core",
        k8s_openapi = "stackable_operator::k8s_openapi",
        schemars = "stackable_operator::schemars"
    )
)]
#[serde(rename_all = "camelCase")]
pub struct IssuerSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acme: Option<AcmeSpec>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AcmeSpec {
    /// ACME directory URL of the certificate authority.
    #[serde(default)]
    pub server: String,
    /// Email address that the account is registered for.
    #[serde(default)]
    pub email: String,
    /// Whether a new account should be registered if no account Secret is available.
    #[serde(default)]
    pub auto_registration: bool,
    /// Secret holding the account key material.
    ///
    /// Filled in by the operator when a new account is registered automatically.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key_secret_ref: Option<SecretReference>,
    /// Required by certificate authorities that only accept pre-approved accounts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_account_binding: Option<ExternalAccountBinding>,
    /// Restricts the domains that certificates may be requested for.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domains: Option<DomainSelection>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExternalAccountBinding {
    /// Key identifier assigned by the certificate authority.
    #[serde(rename = "keyID")]
    pub key_id: String,
    /// Secret holding the base64url encoded HMAC key in `hmacKey`.
    pub key_secret_ref: SecretReference,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DomainSelection {
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct IssuerStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<IssuerState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// The kind of issuer that handled the Issuer (such as `acme`).
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub type_: Option<String>,
    /// The registered ACME account, together with the hash of the Secret it was registered from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "IssuerStatus::raw_object_schema")]
    pub acme: Option<serde_json::Value>,
}

impl IssuerStatus {
    pub fn raw_object_schema(_: &mut SchemaGenerator) -> Schema {
        serde_json::from_value(serde_json::json!({
            "type": "object",
            "nullable": true,
            "x-kubernetes-preserve-unknown-fields": true,
        }))
        .expect("Failed to parse JSON of raw object schema")
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema, strum::Display)]
pub enum IssuerState {
    Ready,
    Error,
}

#[cfg(test)]
mod test {
    use stackable_cert_operator_crd_utils::SecretReference;
    use stackable_operator::kube::CustomResourceExt;

    use super::{AcmeSpec, DomainSelection, ExternalAccountBinding, Issuer};

    #[test]
    fn test_deserialization() {
        let input: &str = r#"
        apiVersion: certs.stackable.tech/v1alpha1
        kind: Issuer
        metadata:
          name: letsencrypt
          namespace: issuers
        spec:
          acme:
            server: https://acme-v02.api.letsencrypt.org/directory
            email: admin@example.com
            autoRegistration: true
        "#;
        let issuer: Issuer = serde_yaml::from_str(input).unwrap();
        assert_eq!(
            issuer.spec.acme,
            Some(AcmeSpec {
                server: "https://acme-v02.api.letsencrypt.org/directory".to_string(),
                email: "admin@example.com".to_string(),
                auto_registration: true,
                private_key_secret_ref: None,
                external_account_binding: None,
                domains: None,
            })
        );

        let input: &str = r#"
        apiVersion: certs.stackable.tech/v1alpha1
        kind: Issuer
        metadata:
          name: zerossl
          namespace: issuers
        spec:
          acme:
            server: https://acme.zerossl.com/v2/DV90
            email: admin@example.com
            privateKeySecretRef:
              name: zerossl-account
            externalAccountBinding:
              keyID: kid-1
              keySecretRef:
                name: zerossl-eab
                namespace: shared
            domains:
              include:
                - example.com
        "#;
        let issuer: Issuer = serde_yaml::from_str(input).unwrap();
        assert_eq!(
            issuer.spec.acme,
            Some(AcmeSpec {
                server: "https://acme.zerossl.com/v2/DV90".to_string(),
                email: "admin@example.com".to_string(),
                auto_registration: false,
                private_key_secret_ref: Some(SecretReference {
                    name: "zerossl-account".to_string(),
                    namespace: None,
                }),
                external_account_binding: Some(ExternalAccountBinding {
                    key_id: "kid-1".to_string(),
                    key_secret_ref: SecretReference::new("zerossl-eab", "shared"),
                }),
                domains: Some(DomainSelection {
                    include: vec!["example.com".to_string()],
                    exclude: vec![],
                }),
            })
        );
    }

    #[test]
    fn missing_fields_deserialize_empty() {
        let input: &str = r#"
        apiVersion: certs.stackable.tech/v1alpha1
        kind: Issuer
        metadata:
          name: broken
        spec:
          acme: {}
        "#;
        let issuer: Issuer = serde_yaml::from_str(input).unwrap();
        let acme = issuer.spec.acme.unwrap();
        assert!(acme.email.is_empty());
        assert!(acme.server.is_empty());
        assert!(issuer.status.is_none());
    }

    #[test]
    fn registration_status_keeps_unknown_fields() {
        let crd = serde_json::to_value(Issuer::crd()).unwrap();
        let acme = crd
            .pointer("/spec/versions/0/schema/openAPIV3Schema/properties/status/properties/acme")
            .unwrap();
        assert_eq!(acme["type"], "object");
        assert_eq!(acme["x-kubernetes-preserve-unknown-fields"], true);
    }
}
