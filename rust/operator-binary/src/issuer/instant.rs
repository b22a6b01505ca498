//! [`AcmeClient`] backed by `instant-acme`

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use instant_acme::{Account, AccountCredentials, ExternalAccountKey, NewAccount};
use snafu::ResultExt;

use super::registration::{
    AcmeClient, AcmeError, DecodeEabKeySnafu, ParseCredentialsSnafu, RegisterAccountSnafu,
    Registration, RegistrationRequest, RegistrationUser, RestoreAccountSnafu,
    SerializeCredentialsSnafu,
};

/// Stores the serialized [`AccountCredentials`] as the account key.
pub struct InstantAcmeClient;

#[async_trait]
impl AcmeClient for InstantAcmeClient {
    async fn register(&self, request: RegistrationRequest) -> Result<RegistrationUser, AcmeError> {
        let contact = format!("mailto:{}", request.email);
        let (account, key) = match request.key {
            Some(key) => {
                let credentials: AccountCredentials =
                    serde_json::from_slice(&key).context(ParseCredentialsSnafu)?;
                let account = Account::from_credentials(credentials)
                    .await
                    .context(RestoreAccountSnafu)?;
                (account, key.0)
            }
            None => {
                let eab = request
                    .eab
                    .map(|eab| {
                        decode_base64url(&eab.hmac_key)
                            .map(|hmac_key| ExternalAccountKey::new(eab.key_id, &hmac_key))
                    })
                    .transpose()?;
                let contacts: &[&str] = &[&contact];
                let (account, credentials) = Account::create(
                    &NewAccount {
                        contact: contacts,
                        terms_of_service_agreed: true,
                        only_return_existing: false,
                    },
                    &request.server,
                    eab.as_ref(),
                )
                .await
                .context(RegisterAccountSnafu {
                    server: &request.server,
                })?;
                let key = serde_json::to_vec(&credentials).context(SerializeCredentialsSnafu)?;
                (account, key)
            }
        };
        tracing::info!(
            account = account.id(),
            server = %request.server,
            "ACME account is registered"
        );
        Ok(RegistrationUser::new(
            request.email,
            Registration {
                uri: account.id().to_string(),
                contact: vec![contact],
            },
            key,
        ))
    }
}

/// Decodes unpadded base64url, the encoding that EAB keys are handed out in.
fn decode_base64url(encoded: &[u8]) -> Result<Vec<u8>, AcmeError> {
    let compact = encoded
        .iter()
        .copied()
        .filter(|byte| !byte.is_ascii_whitespace())
        .collect::<Vec<u8>>();
    let end = compact
        .iter()
        .rposition(|byte| *byte != b'=')
        .map_or(0, |last| last + 1);
    URL_SAFE_NO_PAD
        .decode(&compact[..end])
        .context(DecodeEabKeySnafu)
}
