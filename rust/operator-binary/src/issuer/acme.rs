//! Registers ACME accounts for [`Issuer`]s

use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;
use stackable_operator::{
    k8s_openapi::ByteString,
    kube::runtime::reflector::ObjectRef,
};
use tracing::{debug, info};

use super::{
    registration::{
        existing_registration, wrap_registration, AcmeClient, RegistrationRequest,
        RegistrationUser,
    },
    support::Support,
    Error, IssuerHandler,
};
use crate::{
    crd::{AcmeSpec, Issuer, IssuerState},
    status::Status,
    utils::Unloggable,
};

pub const ACME_TYPE: &str = "acme";

pub struct AcmeIssuerHandler {
    support: Arc<Support>,
    acme: Arc<dyn AcmeClient>,
}

impl AcmeIssuerHandler {
    pub fn new(support: Arc<Support>, acme: Arc<dyn AcmeClient>) -> Self {
        Self { support, acme }
    }

    /// Fails until the Issuer is changed.
    async fn failed(&self, issuer: &Issuer, err: Error) -> Status<Error> {
        self.support
            .failed(issuer, ACME_TYPE, IssuerState::Error, err, false)
            .await
    }

    async fn failed_retry(&self, issuer: &Issuer, err: Error) -> Status<Error> {
        self.support
            .failed(issuer, ACME_TYPE, IssuerState::Error, err, true)
            .await
    }

    /// Confirms the account stored in `secret`, registering it again only if the Secret changed
    /// since the last successful pass.
    async fn reconcile_existing_account(
        &self,
        issuer: &Issuer,
        acme: &AcmeSpec,
        issuer_ref: &ObjectRef<Issuer>,
        secret_data: &BTreeMap<String, ByteString>,
        secret_hash: &str,
    ) -> Status<Error> {
        let eab = match self.support.load_eab_hmac_key(issuer_ref, acme).await {
            Ok(eab) => eab,
            Err(source) => return self.failed_retry(issuer, Error::LoadEabSecret { source }).await,
        };
        let previous = issuer.status.as_ref().and_then(|status| status.acme.as_ref());
        let raw_registration = match existing_registration(previous, secret_hash) {
            Some(raw_registration) => {
                debug!(issuer = %issuer_ref, "account secret is unchanged, reusing registration");
                raw_registration
            }
            None => {
                let key = match RegistrationUser::account_key(secret_data) {
                    Ok(key) => key,
                    Err(source) => {
                        return self
                            .failed_retry(issuer, Error::InvalidIssuerSecret { source })
                            .await
                    }
                };
                let request = RegistrationRequest {
                    email: acme.email.clone(),
                    server: acme.server.clone(),
                    key: Some(Unloggable(key)),
                    eab,
                };
                let user = match self.acme.register(request).await {
                    Ok(user) => user,
                    Err(source) => {
                        return self
                            .failed_retry(issuer, Error::CreateRegistrationUser { source })
                            .await
                    }
                };
                match user.raw_registration() {
                    Ok(raw_registration) => raw_registration,
                    Err(source) => {
                        return self
                            .failed(issuer, Error::MarshalRegistration { source })
                            .await
                    }
                }
            }
        };
        let user =
            match RegistrationUser::from_secret_data(&acme.email, &raw_registration, secret_data) {
                Ok(user) => user,
                Err(source) => {
                    return self
                        .failed_retry(issuer, Error::InvalidIssuerSecret { source })
                        .await
                }
            };
        if user.email() != acme.email {
            return self
                .failed(
                    issuer,
                    Error::EmailMismatch {
                        secret_email: user.email().to_string(),
                        spec_email: acme.email.clone(),
                    },
                )
                .await;
        }
        let wrapped = match wrap_registration(&raw_registration, secret_hash) {
            Ok(wrapped) => wrapped,
            Err(source) => return self.failed(issuer, Error::WrapRegistration { source }).await,
        };
        self.support
            .succeeded_and_trigger_certificates(issuer, ACME_TYPE, wrapped)
            .await
    }

    /// Registers a new account, and points the Issuer at the Secret that it is stored in.
    async fn register_new_account(
        &self,
        issuer: &Issuer,
        acme: &AcmeSpec,
        issuer_ref: &ObjectRef<Issuer>,
    ) -> Status<Error> {
        let eab = match self.support.load_eab_hmac_key(issuer_ref, acme).await {
            Ok(eab) => eab,
            Err(source) => return self.failed_retry(issuer, Error::LoadEabSecret { source }).await,
        };
        let request = RegistrationRequest {
            email: acme.email.clone(),
            server: acme.server.clone(),
            key: None,
            eab,
        };
        let user = match self.acme.register(request).await {
            Ok(user) => user,
            Err(source) => {
                return self
                    .failed_retry(issuer, Error::CreateRegistrationUser { source })
                    .await
            }
        };
        info!(
            issuer = %issuer_ref,
            account = %user.registration().uri,
            "registered new ACME account"
        );
        let (secret_ref, secret) = match self
            .support
            .write_issuer_secret_from_registration_user(
                issuer,
                &user,
                acme.private_key_secret_ref.as_ref(),
            )
            .await
        {
            Ok(written) => written,
            Err(source) => {
                return self
                    .failed_retry(issuer, Error::WriteIssuerSecret { source })
                    .await
            }
        };
        let secret_hash = Support::calc_secret_hash(Some(&secret));
        self.support
            .remember_issuer_secret(issuer_ref, Some(&secret_ref), &secret_hash);
        self.support
            .remember_alt_issuer_secret(issuer_ref, &secret_ref, &secret, &acme.email);

        let raw_registration = match user.raw_registration() {
            Ok(raw_registration) => raw_registration,
            Err(source) => return self.failed(issuer, Error::MarshalRegistration { source }).await,
        };
        let mut updated = issuer.clone();
        if let Some(acme) = updated.spec.acme.as_mut() {
            acme.private_key_secret_ref = Some(secret_ref);
        }
        let updated = match self.support.update_issuer(&updated).await {
            Ok(updated) => updated,
            Err(source) => {
                return self
                    .failed_retry(
                        issuer,
                        Error::UpdateIssuer {
                            source,
                            issuer: issuer_ref.clone(),
                        },
                    )
                    .await
            }
        };
        let wrapped = match wrap_registration(&raw_registration, &secret_hash) {
            Ok(wrapped) => wrapped,
            Err(source) => return self.failed(&updated, Error::WrapRegistration { source }).await,
        };
        self.support
            .succeeded_and_trigger_certificates(&updated, ACME_TYPE, wrapped)
            .await
    }
}

#[async_trait]
impl IssuerHandler for AcmeIssuerHandler {
    fn issuer_type(&self) -> &'static str {
        ACME_TYPE
    }

    fn can_reconcile(&self, issuer: &Issuer) -> bool {
        issuer.spec.acme.is_some()
    }

    async fn reconcile(&self, issuer: &Issuer) -> Status<Error> {
        let issuer_ref = ObjectRef::from_obj(issuer);
        info!(issuer = %issuer_ref, "reconciling ACME issuer");
        let Some(acme) = &issuer.spec.acme else {
            return self.failed(issuer, Error::MissingAcmeSpec).await;
        };
        if acme.email.is_empty() {
            return self.failed(issuer, Error::MissingEmail).await;
        }
        if acme.server.is_empty() {
            return self.failed(issuer, Error::MissingServer).await;
        }
        self.support
            .add_issuer_domains(&issuer_ref, acme.domains.as_ref());
        self.support
            .remember_issuer_secret(&issuer_ref, acme.private_key_secret_ref.as_ref(), "");

        let mut existing = None;
        if let Some(secret_ref) = &acme.private_key_secret_ref {
            match self.support.read_issuer_secret(&issuer_ref, secret_ref).await {
                Ok(secret) => {
                    let secret_hash = Support::calc_secret_hash(Some(&secret));
                    self.support
                        .remember_issuer_secret(&issuer_ref, Some(secret_ref), &secret_hash);
                    self.support.remember_alt_issuer_secret(
                        &issuer_ref,
                        secret_ref,
                        &secret,
                        &acme.email,
                    );
                    existing = Some((secret.data.unwrap_or_default(), secret_hash));
                }
                Err(err) if acme.auto_registration => {
                    info!(
                        issuer = %issuer_ref,
                        secret = %secret_ref,
                        error = &err as &dyn std::error::Error,
                        "account secret is not available, registering a new account"
                    );
                }
                Err(source) => {
                    return self
                        .failed_retry(issuer, Error::LoadIssuerSecret { source })
                        .await
                }
            }
        }

        match existing {
            Some((secret_data, secret_hash)) => {
                self.reconcile_existing_account(
                    issuer,
                    acme,
                    &issuer_ref,
                    &secret_data,
                    &secret_hash,
                )
                .await
            }
            None if acme.auto_registration => {
                self.register_new_account(issuer, acme, &issuer_ref).await
            }
            None => self.failed(issuer, Error::NoAccountSource).await,
        }
    }
}
