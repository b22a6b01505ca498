//! Keeps the certificate authority accounts of [`Issuer`]s registered

use async_trait::async_trait;
use snafu::Snafu;
use stackable_operator::{
    kube::{self, api::DynamicObject, runtime::reflector::ObjectRef},
    logging::controller::ReconcilerError,
};
use strum::{EnumDiscriminants, IntoStaticStr};

use crate::{crd::Issuer, status::Status};

pub mod acme;
pub mod client;
pub mod controller;
pub mod instant;
pub mod registration;
pub mod support;

#[derive(Debug, Snafu, EnumDiscriminants)]
#[strum_discriminants(derive(IntoStaticStr))]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("no issuer handler can reconcile {issuer}"))]
    NoHandler { issuer: ObjectRef<Issuer> },

    #[snafu(display("missing ACME spec"))]
    MissingAcmeSpec,

    #[snafu(display("missing email in ACME spec"))]
    MissingEmail,

    #[snafu(display("missing server in ACME spec"))]
    MissingServer,

    #[snafu(display("neither privateKeySecretRef nor autoRegistration is set"))]
    NoAccountSource,

    #[snafu(display("failed to load account secret"))]
    LoadIssuerSecret { source: support::Error },

    #[snafu(display("failed to load EAB secret"))]
    LoadEabSecret { source: support::Error },

    #[snafu(display("invalid account secret"))]
    InvalidIssuerSecret {
        source: registration::FromSecretDataError,
    },

    #[snafu(display("failed to register ACME account"))]
    CreateRegistrationUser { source: registration::AcmeError },

    #[snafu(display("failed to serialize registration"))]
    MarshalRegistration { source: serde_json::Error },

    #[snafu(display(
        "email {secret_email:?} of the account secret does not match {spec_email:?}"
    ))]
    EmailMismatch {
        secret_email: String,
        spec_email: String,
    },

    #[snafu(display("failed to wrap registration"))]
    WrapRegistration { source: serde_json::Error },

    #[snafu(display("failed to store new ACME account"))]
    WriteIssuerSecret { source: support::Error },

    #[snafu(display("failed to update {issuer}"))]
    UpdateIssuer {
        source: kube::Error,
        issuer: ObjectRef<Issuer>,
    },

    #[snafu(display("failed to update status of {issuer}"))]
    UpdateStatus {
        source: kube::Error,
        issuer: ObjectRef<Issuer>,
    },
}

impl ReconcilerError for Error {
    fn category(&self) -> &'static str {
        ErrorDiscriminants::from(self).into()
    }

    fn secondary_object(&self) -> Option<ObjectRef<DynamicObject>> {
        match self {
            Error::LoadIssuerSecret { source } => source.secondary_object(),
            Error::LoadEabSecret { source } => source.secondary_object(),
            Error::WriteIssuerSecret { source } => source.secondary_object(),
            _ => None,
        }
    }
}

/// Reconciles [`Issuer`]s of one type, such as ACME.
#[async_trait]
pub trait IssuerHandler: Send + Sync {
    fn issuer_type(&self) -> &'static str;

    fn can_reconcile(&self, issuer: &Issuer) -> bool;

    async fn reconcile(&self, issuer: &Issuer) -> Status<Error>;
}
