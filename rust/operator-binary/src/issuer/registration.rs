//! ACME account registrations and the Secret layout that they are persisted in

use std::collections::BTreeMap;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};
use snafu::{OptionExt, ResultExt, Snafu};
use stackable_operator::k8s_openapi::ByteString;

use crate::utils::Unloggable;

/// Secret key holding the email address that the account was registered for.
pub const SECRET_KEY_EMAIL: &str = "email";
/// Secret key holding the account key material.
pub const SECRET_KEY_PRIVATE_KEY: &str = "privateKey";

/// An account as registered at the ACME server.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Registration {
    pub uri: String,
    #[serde(default)]
    pub contact: Vec<String>,
}

/// External account binding credentials, required by some certificate authorities.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EabCredential {
    pub key_id: String,
    /// Base64url encoded, as handed out by the certificate authority.
    pub hmac_key: Unloggable<Vec<u8>>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegistrationRequest {
    pub email: String,
    pub server: String,
    /// Key material of an existing account, a new account is created if [`None`].
    pub key: Option<Unloggable<Vec<u8>>>,
    pub eab: Option<EabCredential>,
}

/// A registered account, together with the key material needed to act as it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegistrationUser {
    email: String,
    registration: Registration,
    key: Unloggable<Vec<u8>>,
}

#[derive(Debug, Snafu)]
pub enum FromSecretDataError {
    #[snafu(display("failed to parse registration"))]
    ParseRegistration { source: serde_json::Error },

    #[snafu(display("secret has no {key:?} entry"))]
    MissingPrivateKey { key: &'static str },

    #[snafu(display("secret entry {key:?} is not valid UTF-8"))]
    InvalidEmail {
        source: std::string::FromUtf8Error,
        key: &'static str,
    },
}

impl RegistrationUser {
    pub fn new(email: impl Into<String>, registration: Registration, key: Vec<u8>) -> Self {
        Self {
            email: email.into(),
            registration,
            key: Unloggable(key),
        }
    }

    pub fn email(&self) -> &str {
        &self.email
    }

    pub fn registration(&self) -> &Registration {
        &self.registration
    }

    pub fn raw_registration(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&self.registration)
    }

    /// The account key stored in an account Secret.
    pub fn account_key(secret_data: &BTreeMap<String, ByteString>) -> Result<Vec<u8>, FromSecretDataError> {
        secret_data
            .get(SECRET_KEY_PRIVATE_KEY)
            .map(|key| key.0.clone())
            .context(MissingPrivateKeySnafu {
                key: SECRET_KEY_PRIVATE_KEY,
            })
    }

    /// Restores an account from its raw registration and the Secret holding its key.
    ///
    /// An email address stored in the Secret takes precedence over `email`.
    pub fn from_secret_data(
        email: &str,
        raw_registration: &[u8],
        secret_data: &BTreeMap<String, ByteString>,
    ) -> Result<Self, FromSecretDataError> {
        let registration =
            serde_json::from_slice(raw_registration).context(ParseRegistrationSnafu)?;
        let key = Self::account_key(secret_data)?;
        let email = match secret_data.get(SECRET_KEY_EMAIL) {
            Some(stored) => String::from_utf8(stored.0.clone()).context(InvalidEmailSnafu {
                key: SECRET_KEY_EMAIL,
            })?,
            None => email.to_string(),
        };
        Ok(Self {
            email,
            registration,
            key: Unloggable(key),
        })
    }

    pub fn to_secret_data(&self) -> BTreeMap<String, ByteString> {
        BTreeMap::from([
            (
                SECRET_KEY_EMAIL.to_string(),
                ByteString(self.email.as_bytes().to_vec()),
            ),
            (
                SECRET_KEY_PRIVATE_KEY.to_string(),
                ByteString(self.key.0.clone()),
            ),
        ])
    }
}

#[derive(Debug, Snafu)]
pub enum AcmeError {
    #[snafu(display("failed to parse stored account credentials"))]
    ParseCredentials { source: serde_json::Error },

    #[snafu(display("failed to serialize account credentials"))]
    SerializeCredentials { source: serde_json::Error },

    #[snafu(display("failed to restore ACME account"))]
    RestoreAccount { source: instant_acme::Error },

    #[snafu(display("failed to register ACME account at {server}"))]
    RegisterAccount {
        source: instant_acme::Error,
        server: String,
    },

    #[snafu(display("failed to decode EAB HMAC key"))]
    DecodeEabKey { source: base64::DecodeError },
}

/// Talks to an ACME server.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AcmeClient: Send + Sync {
    /// Registers a new account, or looks up the account owning `request.key`.
    async fn register(&self, request: RegistrationRequest) -> Result<RegistrationUser, AcmeError>;
}

/// A registration, stored in the Issuer status together with the hash of the Secret that it
/// was registered from.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WrappedRegistration {
    pub registration: serde_json::Value,
    pub secret_hash: String,
}

pub fn wrap_registration(
    raw_registration: &[u8],
    secret_hash: &str,
) -> Result<serde_json::Value, serde_json::Error> {
    serde_json::to_value(WrappedRegistration {
        registration: serde_json::from_slice(raw_registration)?,
        secret_hash: secret_hash.to_string(),
    })
}

/// Returns the raw registration stored in `status_acme`, if it was registered from a Secret with
/// the hash `secret_hash`.
pub fn existing_registration(
    status_acme: Option<&serde_json::Value>,
    secret_hash: &str,
) -> Option<Vec<u8>> {
    if secret_hash.is_empty() {
        return None;
    }
    let wrapped = WrappedRegistration::deserialize(status_acme?).ok()?;
    if wrapped.secret_hash != secret_hash {
        return None;
    }
    serde_json::to_vec(&wrapped.registration).ok()
}
