//! Shared state and Kubernetes plumbing for issuer handlers

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use openssl::sha::Sha256;
use snafu::{OptionExt, ResultExt, Snafu};
use stackable_cert_operator_crd_utils::SecretReference;
use stackable_operator::{
    k8s_openapi::api::core::v1::Secret,
    kube::{
        self,
        api::{DynamicObject, ObjectMeta},
        runtime::reflector::ObjectRef,
        Resource, ResourceExt,
    },
};
use tokio::sync::mpsc;
use tracing::{info, warn};

use super::{
    client::IssuerClient,
    registration::{EabCredential, RegistrationUser},
};
use crate::{
    crd::{AcmeSpec, DomainSelection, Issuer, IssuerState, IssuerStatus},
    status::Status,
    utils::{error_full_message, FmtByteSlice, Unloggable},
};

/// Secret key holding the EAB HMAC key.
pub const SECRET_KEY_EAB_HMAC_KEY: &str = "hmacKey";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to read {secret}"))]
    ReadSecret {
        source: kube::Error,
        secret: ObjectRef<Secret>,
    },

    #[snafu(display("{secret} has no {key:?} entry"))]
    MissingSecretKey {
        secret: ObjectRef<Secret>,
        key: &'static str,
    },

    #[snafu(display("failed to write account secret for {issuer}"))]
    WriteSecret {
        source: kube::Error,
        issuer: ObjectRef<Issuer>,
    },
}

impl Error {
    pub fn secondary_object(&self) -> Option<ObjectRef<DynamicObject>> {
        match self {
            Error::ReadSecret { secret, .. } => Some(secret.clone().erase()),
            Error::MissingSecretKey { secret, .. } => Some(secret.clone().erase()),
            Error::WriteSecret { .. } => None,
        }
    }
}

/// Asks for all certificate sources to be reconciled, since their issuers may have changed.
pub trait CertificateTrigger: Send + Sync {
    fn trigger(&self, issuer: &ObjectRef<Issuer>);
}

impl CertificateTrigger for mpsc::UnboundedSender<()> {
    fn trigger(&self, issuer: &ObjectRef<Issuer>) {
        if self.send(()).is_err() {
            warn!(issuer = %issuer, "certificate sources are no longer reconciled, ignoring trigger");
        }
    }
}

/// The account Secret last seen for an [`Issuer`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IssuerSecret {
    pub secret_ref: Option<SecretReference>,
    /// Empty if the Secret has not been read yet.
    pub hash: String,
}

/// An account Secret that other issuers registered for the same email may share.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AltIssuerSecret {
    pub issuer: ObjectRef<Issuer>,
    pub secret_ref: SecretReference,
    pub hash: String,
}

#[derive(Default)]
struct State {
    domains: HashMap<ObjectRef<Issuer>, DomainSelection>,
    secrets: HashMap<ObjectRef<Issuer>, IssuerSecret>,
    alt_secrets: HashMap<String, AltIssuerSecret>,
}

pub struct Support {
    client: Arc<dyn IssuerClient>,
    trigger: Arc<dyn CertificateTrigger>,
    state: Mutex<State>,
}

fn default_namespace(issuer: &ObjectRef<Issuer>) -> &str {
    issuer.namespace.as_deref().unwrap_or_default()
}

impl Support {
    pub fn new(client: Arc<dyn IssuerClient>, trigger: Arc<dyn CertificateTrigger>) -> Self {
        Self {
            client,
            trigger,
            state: Mutex::default(),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_issuer_domains(&self, issuer: &ObjectRef<Issuer>, domains: Option<&DomainSelection>) {
        let mut state = self.state();
        match domains {
            Some(domains) => {
                state.domains.insert(issuer.clone(), domains.clone());
            }
            None => {
                state.domains.remove(issuer);
            }
        }
    }

    #[cfg(test)]
    pub fn issuer_domains(&self, issuer: &ObjectRef<Issuer>) -> Option<DomainSelection> {
        self.state().domains.get(issuer).cloned()
    }

    pub fn remember_issuer_secret(
        &self,
        issuer: &ObjectRef<Issuer>,
        secret_ref: Option<&SecretReference>,
        hash: &str,
    ) {
        let secret = IssuerSecret {
            secret_ref: secret_ref.map(|secret_ref| secret_ref.resolve(default_namespace(issuer))),
            hash: hash.to_string(),
        };
        self.state().secrets.insert(issuer.clone(), secret);
    }

    #[cfg(test)]
    pub fn issuer_secret(&self, issuer: &ObjectRef<Issuer>) -> Option<IssuerSecret> {
        self.state().secrets.get(issuer).cloned()
    }

    pub fn remember_alt_issuer_secret(
        &self,
        issuer: &ObjectRef<Issuer>,
        secret_ref: &SecretReference,
        secret: &Secret,
        email: &str,
    ) {
        let alt_secret = AltIssuerSecret {
            issuer: issuer.clone(),
            secret_ref: secret_ref.resolve(default_namespace(issuer)),
            hash: Self::calc_secret_hash(Some(secret)),
        };
        self.state().alt_secrets.insert(email.to_string(), alt_secret);
    }

    #[cfg(test)]
    pub fn find_alt_issuer_secret(&self, email: &str) -> Option<AltIssuerSecret> {
        self.state().alt_secrets.get(email).cloned()
    }

    /// Hex encoded SHA-256 over the sorted Secret entries, empty if there is no Secret.
    pub fn calc_secret_hash(secret: Option<&Secret>) -> String {
        let Some(secret) = secret else {
            return String::new();
        };
        let mut hasher = Sha256::new();
        for (key, value) in secret.data.iter().flatten() {
            hasher.update(key.as_bytes());
            hasher.update(&[0]);
            hasher.update(&value.0);
            hasher.update(&[0]);
        }
        format!("{:x}", FmtByteSlice(&hasher.finish()))
    }

    pub async fn read_issuer_secret(
        &self,
        issuer: &ObjectRef<Issuer>,
        secret_ref: &SecretReference,
    ) -> Result<Secret, Error> {
        let secret = secret_ref.object_ref(default_namespace(issuer));
        self.client
            .get_secret(&secret)
            .await
            .context(ReadSecretSnafu {
                secret: secret.clone(),
            })
    }

    /// Returns [`None`] if the issuer is not configured for external account binding.
    pub async fn load_eab_hmac_key(
        &self,
        issuer: &ObjectRef<Issuer>,
        acme: &AcmeSpec,
    ) -> Result<Option<EabCredential>, Error> {
        let Some(eab) = acme
            .external_account_binding
            .as_ref()
            .filter(|eab| !eab.key_id.is_empty())
        else {
            return Ok(None);
        };
        let secret = eab.key_secret_ref.object_ref(default_namespace(issuer));
        let data = self
            .client
            .get_secret(&secret)
            .await
            .context(ReadSecretSnafu {
                secret: secret.clone(),
            })?
            .data
            .unwrap_or_default();
        let hmac_key = data
            .get(SECRET_KEY_EAB_HMAC_KEY)
            .context(MissingSecretKeySnafu {
                secret,
                key: SECRET_KEY_EAB_HMAC_KEY,
            })?;
        Ok(Some(EabCredential {
            key_id: eab.key_id.clone(),
            hmac_key: Unloggable(hmac_key.0.clone()),
        }))
    }

    /// Persists a newly registered account, in the Secret named by `secret_ref` if given.
    pub async fn write_issuer_secret_from_registration_user(
        &self,
        issuer: &Issuer,
        user: &RegistrationUser,
        secret_ref: Option<&SecretReference>,
    ) -> Result<(SecretReference, Secret), Error> {
        let issuer_namespace = issuer.namespace().unwrap_or_default();
        let mut metadata = match secret_ref {
            Some(secret_ref) => ObjectMeta {
                name: Some(secret_ref.name.clone()),
                namespace: Some(secret_ref.namespace_or(&issuer_namespace).to_string()),
                ..ObjectMeta::default()
            },
            None => ObjectMeta {
                generate_name: Some(format!("{}-", issuer.name_any())),
                namespace: Some(issuer_namespace.clone()),
                ..ObjectMeta::default()
            },
        };
        if metadata.namespace.as_deref() == Some(issuer_namespace.as_str()) {
            metadata.owner_references = issuer.controller_owner_ref(&()).map(|owner| vec![owner]);
        }
        let secret = Secret {
            metadata,
            data: Some(user.to_secret_data()),
            type_: Some("Opaque".to_string()),
            ..Secret::default()
        };
        let created = self
            .client
            .create_secret(&secret)
            .await
            .context(WriteSecretSnafu {
                issuer: ObjectRef::from_obj(issuer),
            })?;
        info!(
            issuer = %ObjectRef::from_obj(issuer),
            secret = %ObjectRef::from_obj(&created),
            "stored new ACME account"
        );
        let written_ref = SecretReference::new(
            created.name_any(),
            created.namespace().unwrap_or(issuer_namespace),
        );
        Ok((written_ref, created))
    }

    pub async fn update_issuer(&self, issuer: &Issuer) -> Result<Issuer, kube::Error> {
        self.client.replace_issuer(issuer).await
    }

    /// Marks the issuer as ready, and makes every certificate source pick up the change.
    pub async fn succeeded_and_trigger_certificates(
        &self,
        issuer: &Issuer,
        issuer_type: &str,
        registration: serde_json::Value,
    ) -> Status<super::Error> {
        let issuer_ref = ObjectRef::from_obj(issuer);
        let status = IssuerStatus {
            observed_generation: issuer.metadata.generation,
            state: Some(IssuerState::Ready),
            message: None,
            type_: Some(issuer_type.to_string()),
            acme: Some(registration),
        };
        if issuer.status.as_ref() != Some(&status) {
            if let Err(source) = self.client.patch_issuer_status(issuer, &status).await {
                return Status::delay(super::Error::UpdateStatus {
                    source,
                    issuer: issuer_ref,
                });
            }
            info!(issuer = %issuer_ref, "issuer is ready");
        }
        self.trigger.trigger(&issuer_ref);
        Status::Succeeded
    }

    /// Records `err` in the issuer status, keeping any previous registration.
    pub async fn failed(
        &self,
        issuer: &Issuer,
        issuer_type: &str,
        state: IssuerState,
        err: super::Error,
        retry: bool,
    ) -> Status<super::Error> {
        let issuer_ref = ObjectRef::from_obj(issuer);
        let message = error_full_message(&err);
        warn!(issuer = %issuer_ref, retry, "{message}");
        let status = IssuerStatus {
            observed_generation: issuer.metadata.generation,
            state: Some(state),
            message: Some(message),
            type_: Some(issuer_type.to_string()),
            acme: issuer.status.as_ref().and_then(|status| status.acme.clone()),
        };
        if issuer.status.as_ref() != Some(&status) {
            if let Err(err) = self.client.patch_issuer_status(issuer, &status).await {
                warn!(
                    issuer = %issuer_ref,
                    error = &err as &dyn std::error::Error,
                    "failed to update issuer status"
                );
            }
        }
        if retry {
            Status::delay(err)
        } else {
            Status::Failed(err)
        }
    }
}
