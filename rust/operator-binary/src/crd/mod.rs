//! Custom resources owned by the cert-operator

mod certificate;
mod issuer;

pub use certificate::{
    Certificate, CertificateSpec, CertificateState, CertificateStatus, IssuerRef,
    ANNOTATION_CLASS, ANNOTATION_FORWARD_OWNER_REFS, ANNOTATION_OWNER, LABEL_OWNER_KIND,
};
pub use issuer::{
    AcmeSpec, DomainSelection, ExternalAccountBinding, Issuer, IssuerSpec, IssuerState,
    IssuerStatus,
};
