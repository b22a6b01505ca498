//! Requests certificates for annotated [`Service`]s

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use async_trait::async_trait;
use const_format::concatcp;
use snafu::Snafu;
use stackable_operator::{
    k8s_openapi::api::core::v1::Service,
    kube::{runtime::events::EventType, ResourceExt},
};
use tokio::sync::Mutex;

use super::{
    CertCurrentState, CertFeedback, CertInfo, CertSource, CertsInfo, OwnerKey, SourceAccess,
};
use crate::OPERATOR_NAME;

/// Name of the Secret that the certificate is stored in, a Service without it requests nothing.
pub const ANNOTATION_SECRET_NAME: &str = concatcp!(OPERATOR_NAME, "/secretname");
/// Comma separated list of domains, the first one is the common name.
pub const ANNOTATION_DNS_NAMES: &str = concatcp!(OPERATOR_NAME, "/dnsnames");
pub const ANNOTATION_ISSUER: &str = concatcp!(OPERATOR_NAME, "/issuer");
pub const ANNOTATION_FOLLOW_CNAME: &str = concatcp!(OPERATOR_NAME, "/follow-cname");

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("annotation {ANNOTATION_FOLLOW_CNAME} must be \"true\" or \"false\", not {value:?}"))]
    InvalidFollowCname { value: String },
}

/// Last report published per Service and secret, [`None`] standing for the Service as a whole.
type Reported = Mutex<HashMap<(OwnerKey, Option<String>), (&'static str, String)>>;

pub struct ServiceSource {
    access: Arc<dyn SourceAccess<Service>>,
    reported: Arc<Reported>,
}

impl ServiceSource {
    pub fn new(access: Arc<dyn SourceAccess<Service>>) -> Self {
        Self {
            access,
            reported: Arc::default(),
        }
    }

    async fn forget(&self, key: &OwnerKey) {
        self.reported
            .lock()
            .await
            .retain(|(service, _), _| service != key);
    }
}

#[async_trait]
impl CertSource<Service> for ServiceSource {
    type Error = Error;

    async fn get_certs_info(
        &self,
        service: &Service,
        _current: &CertCurrentState,
    ) -> Result<Option<CertsInfo>, Error> {
        let mut info = CertsInfo::with_feedback(ServiceFeedback {
            access: self.access.clone(),
            service: service.clone(),
            key: OwnerKey::from_obj(service),
            reported: self.reported.clone(),
            seen: Mutex::default(),
        });
        let annotations = service.annotations();
        let Some(secret_name) = annotations
            .get(ANNOTATION_SECRET_NAME)
            .filter(|name| !name.is_empty())
        else {
            return Ok(Some(info));
        };
        let follow_cname = match annotations.get(ANNOTATION_FOLLOW_CNAME).map(String::as_str) {
            None | Some("false") => false,
            Some("true") => true,
            Some(value) => return InvalidFollowCnameSnafu { value }.fail(),
        };
        let domains = annotations
            .get(ANNOTATION_DNS_NAMES)
            .map(|names| {
                names
                    .split(',')
                    .map(str::trim)
                    .filter(|name| !name.is_empty())
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        if domains.is_empty() {
            info.warnings.push(format!(
                "annotation {ANNOTATION_DNS_NAMES} is missing or empty, no certificate requested for secret {secret_name}"
            ));
            return Ok(Some(info));
        }
        info.insert(CertInfo {
            secret_name: secret_name.clone(),
            domains,
            issuer_name: annotations
                .get(ANNOTATION_ISSUER)
                .filter(|issuer| !issuer.is_empty())
                .cloned(),
            follow_cname,
        });
        Ok(Some(info))
    }

    async fn deleted(&self, key: &OwnerKey) {
        self.forget(key).await;
    }

    async fn delete(&self, service: &Service) -> Result<(), Error> {
        self.forget(&OwnerKey::from_obj(service)).await;
        Ok(())
    }
}

/// Reports certificate states as events on the Service, whenever they differ from the
/// previous pass.
struct ServiceFeedback {
    access: Arc<dyn SourceAccess<Service>>,
    service: Service,
    key: OwnerKey,
    reported: Arc<Reported>,
    /// Secrets reported during this pass.
    seen: Mutex<HashSet<Option<String>>>,
}

impl ServiceFeedback {
    async fn publish(
        &self,
        event_type: EventType,
        reason: &'static str,
        info: Option<&CertInfo>,
        message: &str,
    ) {
        let note = match (info, message) {
            (Some(info), "") => format!("certificate for secret {}", info.secret_name),
            (Some(info), message) => format!("secret {}: {message}", info.secret_name),
            (None, message) => message.to_string(),
        };
        let secret = info.map(|info| info.secret_name.clone());
        self.seen.lock().await.insert(secret.clone());
        let report = (reason, note);
        {
            let mut reported = self.reported.lock().await;
            let entry = reported.entry((self.key.clone(), secret)).or_default();
            if *entry == report {
                tracing::trace!(service = %self.key, reason, "certificate state is unchanged");
                return;
            }
            *entry = report.clone();
        }
        self.access
            .publish_event(&self.service, event_type, reason, &report.1)
            .await;
    }
}

#[async_trait]
impl CertFeedback for ServiceFeedback {
    async fn pending(&self, info: Option<&CertInfo>, message: &str) {
        self.publish(EventType::Normal, "CertificatePending", info, message)
            .await;
    }

    async fn ready(&self, info: Option<&CertInfo>, message: &str) {
        self.publish(EventType::Normal, "CertificateReady", info, message)
            .await;
    }

    async fn failed(&self, info: Option<&CertInfo>, error: &str) {
        self.publish(EventType::Warning, "CertificateError", info, error)
            .await;
    }

    async fn succeeded(&self) {
        let seen = self.seen.lock().await;
        self.reported
            .lock()
            .await
            .retain(|(service, secret), _| *service != self.key || seen.contains(secret));
        tracing::debug!(service = %self.service.name_any(), "reported certificate states");
    }
}
