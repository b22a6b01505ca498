//! Reconciles a certificate source against the [`Certificate`]s that it owns

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
    time::Duration,
};

use snafu::Snafu;
use stackable_operator::{
    k8s_openapi::chrono::Utc,
    kube::{
        self,
        api::{DynamicObject, ObjectMeta},
        runtime::{events::EventType, reflector::ObjectRef},
        Resource, ResourceExt,
    },
    logging::controller::ReconcilerError,
};
use strum::{EnumDiscriminants, IntoStaticStr};
use tracing::{debug, info, warn};

use super::{
    registry::{CertificateRegistry, Owner, OwnerKey},
    CertCurrentState, CertFeedback, CertInfo, CertSource, CertState, CertsInfo, NestedReconciler,
    SourceAccess,
};
use crate::{
    crd::{
        Certificate, CertificateSpec, CertificateState, IssuerRef, ANNOTATION_CLASS,
        ANNOTATION_FORWARD_OWNER_REFS,
    },
    status::Status,
    utils::{error_full_message, is_not_found},
};

pub const DEFAULT_PENDING_STALENESS: Duration = Duration::from_secs(120);

const EVENT_REASON: &str = "reconcile";

#[derive(Debug, Snafu, EnumDiscriminants)]
#[strum_discriminants(derive(IntoStaticStr))]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("failed to look up certificates owned by {owner}"))]
    LookupCertificates { source: kube::Error, owner: OwnerKey },

    #[snafu(display("failed to determine the certificates requested by {owner}"))]
    GetCertsInfo {
        source: Box<dyn std::error::Error + Send + Sync>,
        owner: OwnerKey,
    },

    #[snafu(display("failed to add finalizer to {owner}"))]
    SetFinalizer { source: kube::Error, owner: OwnerKey },

    #[snafu(display("failed to remove finalizer from {owner}"))]
    RemoveFinalizer { source: kube::Error, owner: OwnerKey },

    #[snafu(display("failed to apply certificates of {owner}: {message}"))]
    ApplyCertificates { owner: OwnerKey, message: String },

    #[snafu(display("failed to clean up certificate source {owner}"))]
    DeleteSource {
        source: Box<dyn std::error::Error + Send + Sync>,
        owner: OwnerKey,
    },

    #[snafu(display("failed to look up {owner}"))]
    LookupOwner { source: kube::Error, owner: OwnerKey },
}

impl ReconcilerError for Error {
    fn category(&self) -> &'static str {
        ErrorDiscriminants::from(self).into()
    }

    fn secondary_object(&self) -> Option<ObjectRef<DynamicObject>> {
        None
    }
}

#[derive(Clone, Debug)]
pub struct ReconcilerOptions {
    /// Class put on created [`Certificate`]s, so that a matching issuing controller picks them up.
    pub target_class: Option<String>,
    /// Namespace to create [`Certificate`]s in, defaults to the namespace of the source.
    pub namespace: Option<String>,
    pub name_prefix: String,
    /// How long a [`Certificate`] without any state is assumed to be waiting for its controller.
    pub pending_staleness: Duration,
}

impl Default for ReconcilerOptions {
    fn default() -> Self {
        Self {
            target_class: None,
            namespace: None,
            name_prefix: String::new(),
            pending_staleness: DEFAULT_PENDING_STALENESS,
        }
    }
}

/// Keeps the [`Certificate`]s owned by objects of kind `K` in line with what the source `S`
/// derives from them.
pub struct SourceReconciler<K, S> {
    source: S,
    registry: Arc<dyn CertificateRegistry>,
    access: Arc<dyn SourceAccess<K>>,
    nested: Arc<dyn NestedReconciler<K>>,
    options: ReconcilerOptions,
}

impl<K, S> SourceReconciler<K, S>
where
    K: Resource<DynamicType = ()> + Send + Sync + 'static,
    S: CertSource<K>,
{
    pub fn new(
        source: S,
        registry: Arc<dyn CertificateRegistry>,
        access: Arc<dyn SourceAccess<K>>,
        nested: Arc<dyn NestedReconciler<K>>,
        options: ReconcilerOptions,
    ) -> Self {
        Self {
            source,
            registry,
            access,
            nested,
            options,
        }
    }

    pub fn setup(&self) {
        self.source.setup();
        self.nested.setup();
    }

    pub fn start(&self) {
        self.source.start();
        self.nested.start();
    }

    pub async fn reconcile(&self, obj: &K) -> Status<Error> {
        let owner = Owner::from_obj(obj);
        let mut owned = match self.registry.lookup_by_owner(&owner.key).await {
            Ok(owned) => owned,
            Err(source) => {
                return Status::delay(Error::LookupCertificates {
                    source,
                    owner: owner.key,
                })
            }
        };
        // The oldest certificate of a secret wins, later ones are duplicates
        owned.sort_by_key(|cert| cert.metadata.creation_timestamp.as_ref().map(|ts| ts.0));

        let mut current_state = CertCurrentState::default();
        let mut current = Vec::new();
        let mut obsolete = Vec::new();
        for cert in &owned {
            let Some(secret_name) = cert.secret_name() else {
                warn!(
                    certificate = %cert.name_any(),
                    "certificate has neither secretName nor secretRef, ignoring"
                );
                continue;
            };
            if current_state.contains_secret_name(secret_name) {
                obsolete.push(cert);
            } else {
                current_state
                    .cert_states
                    .insert(secret_name.to_string(), CertState::from(cert));
                current.push((secret_name, cert));
            }
        }

        let info = match self.source.get_certs_info(obj, &current_state).await {
            Ok(Some(info)) => info,
            Ok(None) => return Status::Stop,
            Err(err) => {
                self.access
                    .publish_event(obj, EventType::Warning, EVENT_REASON, &error_full_message(&err))
                    .await;
                return Status::delay(Error::GetCertsInfo {
                    source: Box::new(err),
                    owner: owner.key,
                });
            }
        };
        for warning in &info.warnings {
            self.access
                .publish_event(obj, EventType::Warning, EVENT_REASON, warning)
                .await;
        }

        let finalizer_result = if info.certs.is_empty() {
            self.access
                .remove_finalizer(obj)
                .await
                .map_err(|source| Error::RemoveFinalizer {
                    source,
                    owner: owner.key.clone(),
                })
        } else {
            self.access
                .set_finalizer(obj)
                .await
                .map_err(|source| Error::SetFinalizer {
                    source,
                    owner: owner.key.clone(),
                })
        };
        if let Err(err) = finalizer_result {
            return Status::delay(err);
        }

        let missing = info
            .certs
            .values()
            .filter(|cert_info| !current_state.contains_secret_name(&cert_info.secret_name))
            .collect::<Vec<_>>();
        let mut existing = Vec::new();
        for (secret_name, cert) in current {
            match info.certs.get(secret_name) {
                Some(cert_info) => existing.push((cert_info, cert)),
                None => obsolete.push(cert),
            }
        }

        let feedback = info.feedback.as_deref();
        let mut errors = Vec::new();
        if !missing.is_empty() {
            info!(
                owner = %owner.key,
                secrets = ?missing.iter().map(|cert_info| &cert_info.secret_name).collect::<Vec<_>>(),
                "found missing certificates"
            );
            for cert_info in missing {
                if let Err(err) = self.create_entry(obj, &owner, cert_info, feedback).await {
                    errors.push(format!(
                        "cannot create certificate for secret {}: {}",
                        cert_info.secret_name,
                        error_full_message(&err)
                    ));
                }
            }
        }
        if !obsolete.is_empty() {
            info!(
                owner = %owner.key,
                certificates = ?obsolete.iter().map(|cert| cert.name_any()).collect::<Vec<_>>(),
                "found obsolete certificates"
            );
            for cert in obsolete {
                if let Err(err) = self.delete_entry(obj, cert).await {
                    errors.push(format!(
                        "cannot remove certificate {}: {}",
                        cert.name_any(),
                        error_full_message(&err)
                    ));
                }
            }
        }
        let mut modified = BTreeSet::new();
        for (cert_info, cert) in existing {
            match self.update_entry(cert_info, cert).await {
                Ok(false) => {}
                Ok(true) => {
                    modified.insert(cert_info.secret_name.as_str());
                }
                Err(err) => errors.push(format!(
                    "cannot update certificate {}: {}",
                    cert.name_any(),
                    error_full_message(&err)
                )),
            }
        }

        if !errors.is_empty() {
            let message = errors.join(", ");
            if let Some(feedback) = feedback {
                feedback.failed(None, &message).await;
            }
            return Status::delay(Error::ApplyCertificates {
                owner: owner.key,
                message,
            });
        }

        if let Some(feedback) = feedback {
            self.report_states(&info, &current_state, &modified, feedback)
                .await;
        }

        let status = self.nested.reconcile(obj).await;
        if info.certs.is_empty() {
            status.stop()
        } else {
            status
        }
    }

    /// The source object disappeared without having been cleaned up.
    ///
    /// Every orphaned [`Certificate`] of `key` leads here, so only the call that actually
    /// removed some of them notifies the source and the nested reconciler.
    pub async fn deleted(&self, key: &OwnerKey) -> Status<Error> {
        info!(owner = %key, "certificate source is gone, deleting its certificates");
        match self.delete_owned(key).await {
            Ok(0) => {
                debug!(owner = %key, "certificates of gone source are already deleted");
                Status::Succeeded
            }
            Ok(_) => {
                self.source.deleted(key).await;
                self.nested.deleted(key).await
            }
            Err(status) => status,
        }
    }

    /// The source object is being deleted, its finalizer is only released once every
    /// owned [`Certificate`] is gone.
    pub async fn delete(&self, obj: &K) -> Status<Error> {
        let owner = OwnerKey::from_obj(obj);
        info!(owner = %owner, "certificate source is being deleted, deleting its certificates");
        if let Err(status) = self.delete_owned(&owner).await {
            return status;
        }
        if let Err(err) = self.source.delete(obj).await {
            return Status::delay(Error::DeleteSource {
                source: Box::new(err),
                owner,
            });
        }
        let status = self.nested.delete(obj).await;
        if status.is_succeeded() {
            if let Err(source) = self.access.remove_finalizer(obj).await {
                return Status::delay(Error::RemoveFinalizer { source, owner });
            }
        }
        status
    }

    /// Deletes every [`Certificate`] owned by `owner`, returning how many this call removed.
    async fn delete_owned(&self, owner: &OwnerKey) -> Result<usize, Status<Error>> {
        let owned = match self.registry.lookup_by_owner(owner).await {
            Ok(owned) => owned,
            Err(source) => {
                return Err(Status::delay(Error::LookupCertificates {
                    source,
                    owner: owner.clone(),
                }))
            }
        };
        let mut removed = 0;
        let mut failed = false;
        for cert in &owned {
            match self.registry.delete(cert).await {
                Ok(()) => {
                    removed += 1;
                    info!(
                        certificate = %cert.name_any(),
                        common_name = cert.safe_common_name(),
                        "deleted certificate object"
                    );
                }
                Err(err) if is_not_found(&err) => {}
                Err(err) => {
                    warn!(
                        certificate = %cert.name_any(),
                        error = &err as &dyn std::error::Error,
                        "cannot delete certificate object"
                    );
                    failed = true;
                }
            }
        }
        if failed {
            Err(Status::Delay(None))
        } else {
            Ok(removed)
        }
    }

    async fn create_entry(
        &self,
        obj: &K,
        owner: &Owner,
        cert_info: &CertInfo,
        feedback: Option<&dyn CertFeedback>,
    ) -> Result<(), kube::Error> {
        let certificate = self.new_certificate(obj, cert_info);
        match self.registry.create_for_owner(owner, certificate).await {
            Ok(created) => {
                let name = created.name_any();
                info!(
                    certificate = %name,
                    secret = %cert_info.secret_name,
                    "created certificate object"
                );
                self.access
                    .publish_event(
                        obj,
                        EventType::Normal,
                        EVENT_REASON,
                        &format!("created certificate object {name}"),
                    )
                    .await;
                if let Some(feedback) = feedback {
                    feedback.pending(Some(cert_info), "").await;
                }
                Ok(())
            }
            Err(err) => {
                if let Some(feedback) = feedback {
                    feedback
                        .failed(Some(cert_info), &error_full_message(&err))
                        .await;
                }
                Err(err)
            }
        }
    }

    async fn delete_entry(&self, obj: &K, cert: &Certificate) -> Result<(), kube::Error> {
        match self.registry.delete(cert).await {
            Ok(()) => {
                let name = cert.name_any();
                info!(
                    certificate = %name,
                    common_name = cert.safe_common_name(),
                    "deleted certificate object"
                );
                self.access
                    .publish_event(
                        obj,
                        EventType::Normal,
                        EVENT_REASON,
                        &format!("deleted certificate object {name}"),
                    )
                    .await;
                Ok(())
            }
            Err(err) if is_not_found(&err) => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Returns whether `cert` had drifted and was updated.
    async fn update_entry(
        &self,
        cert_info: &CertInfo,
        cert: &Certificate,
    ) -> Result<bool, kube::Error> {
        let mut updated = cert.clone();
        let mut modified = false;
        modified |= set_annotation(&mut updated.metadata, ANNOTATION_FORWARD_OWNER_REFS, "true");
        modified |= match &self.options.target_class {
            Some(class) => set_annotation(&mut updated.metadata, ANNOTATION_CLASS, class),
            None => remove_annotation(&mut updated.metadata, ANNOTATION_CLASS),
        };
        let (common_name, dns_names) = split_domains(&cert_info.domains);
        modified |= assure(&mut updated.spec.common_name, common_name);
        modified |= assure(&mut updated.spec.dns_names, dns_names);
        match &cert_info.issuer_name {
            Some(issuer_name)
                if updated.spec.issuer_ref.as_ref().map(|issuer| &issuer.name)
                    != Some(issuer_name) =>
            {
                updated.spec.issuer_ref = Some(IssuerRef::new(issuer_name));
                modified = true;
            }
            None if updated.spec.issuer_ref.is_some() => {
                updated.spec.issuer_ref = None;
                modified = true;
            }
            _ => {}
        }
        if !modified {
            return Ok(false);
        }
        info!(
            certificate = %cert.name_any(),
            secret = %cert_info.secret_name,
            "updating certificate object"
        );
        self.registry.update(&updated).await?;
        Ok(true)
    }

    fn new_certificate(&self, obj: &K, cert_info: &CertInfo) -> Certificate {
        let mut annotations = BTreeMap::from([(
            ANNOTATION_FORWARD_OWNER_REFS.to_string(),
            "true".to_string(),
        )]);
        if let Some(class) = &self.options.target_class {
            annotations.insert(ANNOTATION_CLASS.to_string(), class.clone());
        }
        let (common_name, dns_names) = split_domains(&cert_info.domains);
        Certificate {
            metadata: ObjectMeta {
                generate_name: Some(
                    format!(
                        "{}{}-{}-",
                        self.options.name_prefix,
                        obj.name_any(),
                        K::kind(&())
                    )
                    .to_lowercase(),
                ),
                namespace: self.options.namespace.clone().or_else(|| obj.namespace()),
                annotations: Some(annotations),
                ..ObjectMeta::default()
            },
            spec: CertificateSpec {
                common_name,
                dns_names,
                secret_name: Some(cert_info.secret_name.clone()),
                secret_ref: None,
                issuer_ref: cert_info.issuer_name.as_ref().map(IssuerRef::new),
                follow_cname: cert_info.follow_cname.then_some(true),
            },
            status: None,
        }
    }

    /// Reports the state of every certificate that wasn't touched in this pass.
    async fn report_states(
        &self,
        info: &CertsInfo,
        current_state: &CertCurrentState,
        modified: &BTreeSet<&str>,
        feedback: &dyn CertFeedback,
    ) {
        for (secret_name, cert_info) in &info.certs {
            if modified.contains(secret_name.as_str()) {
                continue;
            }
            let Some(cert_state) = current_state.get(secret_name) else {
                // Created in this pass, already reported as pending
                continue;
            };
            let message = cert_state
                .message
                .as_deref()
                .filter(|message| !message.is_empty());
            match cert_state.state {
                Some(CertificateState::Error) => {
                    feedback
                        .failed(
                            Some(cert_info),
                            &with_detail("erroneous certificate", message),
                        )
                        .await
                }
                Some(CertificateState::Pending) => {
                    feedback
                        .pending(Some(cert_info), &with_detail("certificate pending", message))
                        .await
                }
                Some(CertificateState::Ready) => {
                    feedback
                        .ready(Some(cert_info), message.unwrap_or("certificate ready"))
                        .await
                }
                Some(CertificateState::Unknown) | None => {
                    if self.is_stale(cert_state) {
                        debug!(secret = %secret_name, "certificate was never picked up");
                        feedback
                            .pending(Some(cert_info), "no certificate controller running?")
                            .await
                    }
                }
            }
        }
        feedback.succeeded().await;
    }

    fn is_stale(&self, cert_state: &CertState) -> bool {
        cert_state.creation_timestamp.as_ref().is_some_and(|created| {
            Utc::now()
                .signed_duration_since(created.0)
                .to_std()
                .is_ok_and(|age| age > self.options.pending_staleness)
        })
    }
}

fn with_detail(summary: &str, detail: Option<&str>) -> String {
    match detail {
        Some(detail) => format!("{summary}: {detail}"),
        None => summary.to_string(),
    }
}

/// The first domain is the common name, the rest are additional names.
fn split_domains(domains: &[String]) -> (Option<String>, Vec<String>) {
    match domains.split_first() {
        Some((common_name, dns_names)) => (Some(common_name.clone()), dns_names.to_vec()),
        None => (None, Vec::new()),
    }
}

fn assure<T: PartialEq>(field: &mut T, value: T) -> bool {
    if *field == value {
        false
    } else {
        *field = value;
        true
    }
}

fn set_annotation(meta: &mut ObjectMeta, key: &str, value: &str) -> bool {
    let annotations = meta.annotations.get_or_insert_with(BTreeMap::new);
    if annotations.get(key).map(String::as_str) == Some(value) {
        false
    } else {
        annotations.insert(key.to_string(), value.to_string());
        true
    }
}

fn remove_annotation(meta: &mut ObjectMeta, key: &str) -> bool {
    meta.annotations
        .as_mut()
        .is_some_and(|annotations| annotations.remove(key).is_some())
}

#[cfg(test)]
mod tests {
    use std::{
        collections::BTreeMap,
        sync::{Arc, Mutex},
        time::Duration,
    };

    use async_trait::async_trait;
    use snafu::Snafu;
    use stackable_operator::{
        k8s_openapi::{
            api::core::v1::Service,
            apimachinery::pkg::apis::meta::v1::Time,
            chrono::{self, Utc},
        },
        kube::{self, api::ObjectMeta, runtime::events::EventType, ResourceExt},
    };

    use super::{Error, ReconcilerOptions, SourceReconciler};
    use crate::{
        crd::{
            Certificate, CertificateState, CertificateStatus, IssuerRef, ANNOTATION_CLASS,
            ANNOTATION_FORWARD_OWNER_REFS,
        },
        source::{
            registry::{is_owned_by, stamp_owner, CertificateRegistry, Owner, OwnerKey},
            CertCurrentState, CertFeedback, CertInfo, CertSource, CertsInfo, NoNested,
            SourceAccess,
        },
        status::Status,
        utils::test_util::api_error,
    };

    #[derive(Default)]
    struct FakeRegistry {
        certificates: Mutex<Vec<Certificate>>,
        created: Mutex<u32>,
        updated: Mutex<u32>,
        deleted: Mutex<u32>,
        fail_create_for: Mutex<Option<String>>,
        fail_delete: Mutex<bool>,
    }

    impl FakeRegistry {
        fn certificates(&self) -> Vec<Certificate> {
            self.certificates.lock().unwrap().clone()
        }

        fn writes(&self) -> (u32, u32, u32) {
            (
                *self.created.lock().unwrap(),
                *self.updated.lock().unwrap(),
                *self.deleted.lock().unwrap(),
            )
        }

        /// Adds an existing certificate that was created `age` ago.
        fn seed(&self, owner: &Owner, name: &str, cert_info: &CertInfo, age: Duration) {
            let mut certificate = Certificate::new(
                name,
                crate::crd::CertificateSpec {
                    common_name: cert_info.domains.first().cloned(),
                    dns_names: cert_info.domains.iter().skip(1).cloned().collect(),
                    secret_name: Some(cert_info.secret_name.clone()),
                    issuer_ref: cert_info.issuer_name.as_ref().map(IssuerRef::new),
                    ..Default::default()
                },
            );
            certificate.metadata.namespace = owner.key.namespace.clone();
            certificate.metadata.creation_timestamp =
                Some(Time(Utc::now() - chrono::Duration::from_std(age).unwrap()));
            certificate.metadata.annotations = Some(BTreeMap::from([(
                ANNOTATION_FORWARD_OWNER_REFS.to_string(),
                "true".to_string(),
            )]));
            stamp_owner(owner, &mut certificate);
            self.certificates.lock().unwrap().push(certificate);
        }

        fn set_state(&self, secret_name: &str, state: CertificateState, message: Option<&str>) {
            for certificate in self.certificates.lock().unwrap().iter_mut() {
                if certificate.secret_name() == Some(secret_name) {
                    certificate.status = Some(CertificateStatus {
                        state: Some(state),
                        message: message.map(str::to_string),
                    });
                }
            }
        }
    }

    #[async_trait]
    impl CertificateRegistry for FakeRegistry {
        async fn lookup_by_owner(
            &self,
            owner: &OwnerKey,
        ) -> Result<Vec<Certificate>, kube::Error> {
            Ok(self
                .certificates()
                .into_iter()
                .filter(|certificate| is_owned_by(certificate, owner))
                .collect())
        }

        async fn create_for_owner(
            &self,
            owner: &Owner,
            mut certificate: Certificate,
        ) -> Result<Certificate, kube::Error> {
            if self.fail_create_for.lock().unwrap().as_deref() == certificate.secret_name() {
                return Err(api_error(403, "Forbidden"));
            }
            let mut created = self.created.lock().unwrap();
            *created += 1;
            certificate.metadata.name = Some(format!(
                "{}{}",
                certificate.metadata.generate_name.clone().unwrap_or_default(),
                created
            ));
            certificate.metadata.creation_timestamp = Some(Time(Utc::now()));
            stamp_owner(owner, &mut certificate);
            self.certificates.lock().unwrap().push(certificate.clone());
            Ok(certificate)
        }

        async fn update(&self, certificate: &Certificate) -> Result<Certificate, kube::Error> {
            *self.updated.lock().unwrap() += 1;
            let mut certificates = self.certificates.lock().unwrap();
            let existing = certificates
                .iter_mut()
                .find(|existing| existing.name_any() == certificate.name_any())
                .ok_or_else(|| api_error(404, "NotFound"))?;
            *existing = certificate.clone();
            Ok(certificate.clone())
        }

        async fn delete(&self, certificate: &Certificate) -> Result<(), kube::Error> {
            if *self.fail_delete.lock().unwrap() {
                return Err(api_error(500, "InternalError"));
            }
            let mut certificates = self.certificates.lock().unwrap();
            let before = certificates.len();
            certificates.retain(|existing| existing.name_any() != certificate.name_any());
            if certificates.len() == before {
                return Err(api_error(404, "NotFound"));
            }
            *self.deleted.lock().unwrap() += 1;
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeAccess {
        has_finalizer: Mutex<bool>,
        finalizer_patches: Mutex<u32>,
        events: Mutex<Vec<(EventType, String)>>,
        fail_finalizer: Mutex<bool>,
    }

    impl FakeAccess {
        fn has_finalizer(&self) -> bool {
            *self.has_finalizer.lock().unwrap()
        }

        fn set(&self, present: bool) -> Result<(), kube::Error> {
            if *self.fail_finalizer.lock().unwrap() {
                return Err(api_error(409, "Conflict"));
            }
            let mut has_finalizer = self.has_finalizer.lock().unwrap();
            if *has_finalizer != present {
                *has_finalizer = present;
                *self.finalizer_patches.lock().unwrap() += 1;
            }
            Ok(())
        }
    }

    #[async_trait]
    impl SourceAccess<Service> for FakeAccess {
        async fn set_finalizer(&self, _source: &Service) -> Result<(), kube::Error> {
            self.set(true)
        }

        async fn remove_finalizer(&self, _source: &Service) -> Result<(), kube::Error> {
            self.set(false)
        }

        async fn publish_event(
            &self,
            _source: &Service,
            event_type: EventType,
            _reason: &str,
            note: &str,
        ) {
            self.events
                .lock()
                .unwrap()
                .push((event_type, note.to_string()));
        }
    }

    #[derive(Clone, Debug, PartialEq, Eq)]
    enum Report {
        Pending(Option<String>, String),
        Ready(Option<String>, String),
        Failed(Option<String>, String),
        Succeeded,
    }

    #[derive(Default)]
    struct RecordingFeedback {
        reports: Mutex<Vec<Report>>,
    }

    impl RecordingFeedback {
        fn take(&self) -> Vec<Report> {
            std::mem::take(&mut *self.reports.lock().unwrap())
        }

        fn push(&self, report: Report) {
            self.reports.lock().unwrap().push(report);
        }
    }

    fn secret_of(info: Option<&CertInfo>) -> Option<String> {
        info.map(|info| info.secret_name.clone())
    }

    #[async_trait]
    impl CertFeedback for Arc<RecordingFeedback> {
        async fn pending(&self, info: Option<&CertInfo>, message: &str) {
            self.push(Report::Pending(secret_of(info), message.to_string()));
        }

        async fn ready(&self, info: Option<&CertInfo>, message: &str) {
            self.push(Report::Ready(secret_of(info), message.to_string()));
        }

        async fn failed(&self, info: Option<&CertInfo>, error: &str) {
            self.push(Report::Failed(secret_of(info), error.to_string()));
        }

        async fn succeeded(&self) {
            self.push(Report::Succeeded);
        }
    }

    #[derive(Debug, Snafu)]
    #[snafu(display("source is broken"))]
    struct BrokenSource;

    enum Desired {
        Certs(Vec<CertInfo>),
        Nothing,
        Broken,
    }

    struct FakeSource {
        desired: Mutex<Desired>,
        feedback: Arc<RecordingFeedback>,
        deleted: Mutex<Vec<OwnerKey>>,
    }

    #[async_trait]
    impl CertSource<Service> for FakeSource {
        type Error = BrokenSource;

        async fn get_certs_info(
            &self,
            _source: &Service,
            _current: &CertCurrentState,
        ) -> Result<Option<CertsInfo>, BrokenSource> {
            match &*self.desired.lock().unwrap() {
                Desired::Certs(certs) => {
                    let mut info = CertsInfo::with_feedback(self.feedback.clone());
                    for cert in certs {
                        info.insert(cert.clone());
                    }
                    Ok(Some(info))
                }
                Desired::Nothing => Ok(None),
                Desired::Broken => Err(BrokenSource),
            }
        }

        async fn deleted(&self, key: &OwnerKey) {
            self.deleted.lock().unwrap().push(key.clone());
        }
    }

    struct Fixture {
        registry: Arc<FakeRegistry>,
        access: Arc<FakeAccess>,
        feedback: Arc<RecordingFeedback>,
        reconciler: SourceReconciler<Service, FakeSource>,
        service: Service,
    }

    impl Fixture {
        fn new(desired: Vec<CertInfo>) -> Self {
            Self::with_options(desired, ReconcilerOptions::default())
        }

        fn with_options(desired: Vec<CertInfo>, options: ReconcilerOptions) -> Self {
            let registry = Arc::new(FakeRegistry::default());
            let access = Arc::new(FakeAccess::default());
            let feedback = Arc::new(RecordingFeedback::default());
            let reconciler = SourceReconciler::new(
                FakeSource {
                    desired: Mutex::new(Desired::Certs(desired)),
                    feedback: feedback.clone(),
                    deleted: Mutex::default(),
                },
                registry.clone(),
                access.clone(),
                Arc::new(NoNested),
                options,
            );
            Self {
                registry,
                access,
                feedback,
                reconciler,
                service: Service {
                    metadata: ObjectMeta {
                        name: Some("web".to_string()),
                        namespace: Some("default".to_string()),
                        uid: Some("0e6bb0de".to_string()),
                        ..ObjectMeta::default()
                    },
                    ..Service::default()
                },
            }
        }

        fn desire(&self, desired: Desired) {
            *self.reconciler.source.desired.lock().unwrap() = desired;
        }

        fn owner(&self) -> Owner {
            Owner::from_obj(&self.service)
        }

        async fn reconcile(&self) -> Status<Error> {
            self.reconciler.reconcile(&self.service).await
        }
    }

    fn cert_info(secret_name: &str, domains: &[&str]) -> CertInfo {
        CertInfo {
            secret_name: secret_name.to_string(),
            domains: domains.iter().map(|domain| domain.to_string()).collect(),
            issuer_name: None,
            follow_cname: false,
        }
    }

    #[tokio::test]
    async fn creates_missing_certificate() {
        let web_tls = cert_info("web-tls", &["a.example.com", "b.example.com"]);
        let fixture = Fixture::new(vec![web_tls]);

        let status = fixture.reconcile().await;
        assert!(matches!(status, Status::Succeeded), "{status:?}");
        assert!(fixture.access.has_finalizer());

        let certificates = fixture.registry.certificates();
        assert_eq!(certificates.len(), 1);
        let certificate = &certificates[0];
        assert_eq!(certificate.name_any(), "web-service-1");
        assert_eq!(certificate.namespace().as_deref(), Some("default"));
        assert_eq!(certificate.spec.common_name.as_deref(), Some("a.example.com"));
        assert_eq!(certificate.spec.dns_names, vec!["b.example.com".to_string()]);
        assert_eq!(certificate.secret_name(), Some("web-tls"));
        assert_eq!(
            certificate
                .annotations()
                .get(ANNOTATION_FORWARD_OWNER_REFS)
                .map(String::as_str),
            Some("true")
        );
        assert!(!certificate.annotations().contains_key(ANNOTATION_CLASS));
        assert_eq!(certificate.owner_references().len(), 1);

        assert_eq!(
            fixture.feedback.take(),
            vec![
                Report::Pending(Some("web-tls".to_string()), String::new()),
                Report::Succeeded,
            ]
        );
        assert_eq!(fixture.access.events.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn reconciling_twice_changes_nothing() {
        let fixture = Fixture::with_options(
            vec![
                cert_info("web-tls", &["a.example.com"]),
                cert_info("api-tls", &["api.example.com"]),
            ],
            ReconcilerOptions {
                target_class: Some("internal".to_string()),
                ..ReconcilerOptions::default()
            },
        );
        assert!(fixture.reconcile().await.is_succeeded());
        assert_eq!(fixture.registry.writes(), (2, 0, 0));
        assert_eq!(*fixture.access.finalizer_patches.lock().unwrap(), 1);
        fixture.feedback.take();

        assert!(matches!(fixture.reconcile().await, Status::Succeeded));
        assert_eq!(fixture.registry.writes(), (2, 0, 0));
        assert_eq!(*fixture.access.finalizer_patches.lock().unwrap(), 1);
        assert_eq!(fixture.registry.certificates().len(), 2);
        for certificate in fixture.registry.certificates() {
            assert_eq!(
                certificate.annotations().get(ANNOTATION_CLASS).map(String::as_str),
                Some("internal")
            );
        }
    }

    #[tokio::test]
    async fn removes_obsolete_certificates() {
        let fixture = Fixture::new(vec![]);
        let web_tls = cert_info("web-tls", &["a.example.com"]);
        fixture.registry.seed(
            &fixture.owner(),
            "web-service-old",
            &web_tls,
            Duration::from_secs(3600),
        );
        fixture.access.set(true).unwrap();

        let status = fixture.reconcile().await;
        assert!(matches!(status, Status::Stop), "{status:?}");
        assert!(fixture.registry.certificates().is_empty());
        assert!(!fixture.access.has_finalizer());
        assert_eq!(fixture.feedback.take(), vec![Report::Succeeded]);
    }

    #[tokio::test]
    async fn reports_ready_certificate_without_writes() {
        let web_tls = cert_info("web-tls", &["a.example.com"]);
        let fixture = Fixture::new(vec![web_tls.clone()]);
        fixture.registry.seed(
            &fixture.owner(),
            "web-service-abc",
            &web_tls,
            Duration::from_secs(60),
        );
        fixture
            .registry
            .set_state("web-tls", CertificateState::Ready, Some("issued"));

        assert!(matches!(fixture.reconcile().await, Status::Succeeded));
        assert_eq!(fixture.registry.writes(), (0, 0, 0));
        assert_eq!(
            fixture.feedback.take(),
            vec![
                Report::Ready(Some("web-tls".to_string()), "issued".to_string()),
                Report::Succeeded,
            ]
        );
    }

    #[tokio::test]
    async fn maps_certificate_states_to_feedback() {
        let errored = cert_info("errored-tls", &["errored.example.com"]);
        let pending = cert_info("pending-tls", &["pending.example.com"]);
        let fresh = cert_info("fresh-tls", &["fresh.example.com"]);
        let stale = cert_info("stale-tls", &["stale.example.com"]);
        let fixture = Fixture::new(vec![
            errored.clone(),
            pending.clone(),
            fresh.clone(),
            stale.clone(),
        ]);
        let owner = fixture.owner();
        let minute = Duration::from_secs(60);
        fixture.registry.seed(&owner, "errored", &errored, minute);
        fixture.registry.seed(&owner, "pending", &pending, minute);
        fixture.registry.seed(&owner, "fresh", &fresh, minute);
        fixture.registry.seed(&owner, "stale", &stale, 10 * minute);
        fixture
            .registry
            .set_state("errored-tls", CertificateState::Error, Some("rate limited"));
        fixture
            .registry
            .set_state("pending-tls", CertificateState::Pending, Some("waiting for DNS"));

        assert!(fixture.reconcile().await.is_succeeded());
        assert_eq!(
            fixture.feedback.take(),
            vec![
                Report::Failed(
                    Some("errored-tls".to_string()),
                    "erroneous certificate: rate limited".to_string()
                ),
                Report::Pending(
                    Some("pending-tls".to_string()),
                    "certificate pending: waiting for DNS".to_string()
                ),
                Report::Pending(
                    Some("stale-tls".to_string()),
                    "no certificate controller running?".to_string()
                ),
                Report::Succeeded,
            ]
        );
    }

    #[tokio::test]
    async fn updates_drifted_certificate() {
        let mut web_tls = cert_info("web-tls", &["a.example.com"]);
        let fixture = Fixture::new(vec![]);
        fixture.registry.seed(
            &fixture.owner(),
            "web-service-abc",
            &web_tls,
            Duration::from_secs(60),
        );
        fixture
            .registry
            .set_state("web-tls", CertificateState::Ready, Some("issued"));
        web_tls.domains.push("b.example.com".to_string());
        web_tls.issuer_name = Some("letsencrypt".to_string());
        fixture.desire(Desired::Certs(vec![web_tls]));

        assert!(matches!(fixture.reconcile().await, Status::Succeeded));
        assert_eq!(fixture.registry.writes(), (0, 1, 0));
        let certificate = &fixture.registry.certificates()[0];
        assert_eq!(certificate.spec.dns_names, vec!["b.example.com".to_string()]);
        assert_eq!(
            certificate.spec.issuer_ref,
            Some(IssuerRef::new("letsencrypt"))
        );
        // Modified certificates are not reported until their controller has seen the change
        assert_eq!(fixture.feedback.take(), vec![Report::Succeeded]);

        assert!(fixture.reconcile().await.is_succeeded());
        assert_eq!(fixture.registry.writes(), (0, 1, 0));
    }

    #[tokio::test]
    async fn keeps_oldest_duplicate() {
        let web_tls = cert_info("web-tls", &["a.example.com"]);
        let fixture = Fixture::new(vec![web_tls.clone()]);
        let owner = fixture.owner();
        fixture
            .registry
            .seed(&owner, "newer", &web_tls, Duration::from_secs(60));
        fixture
            .registry
            .seed(&owner, "older", &web_tls, Duration::from_secs(600));

        assert!(fixture.reconcile().await.is_succeeded());
        let names = fixture
            .registry
            .certificates()
            .iter()
            .map(|certificate| certificate.name_any())
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["older".to_string()]);
    }

    #[tokio::test]
    async fn aggregates_failures_and_retries() {
        let fixture = Fixture::new(vec![
            cert_info("web-tls", &["a.example.com"]),
            cert_info("api-tls", &["api.example.com"]),
        ]);
        *fixture.registry.fail_create_for.lock().unwrap() = Some("web-tls".to_string());

        let status = fixture.reconcile().await;
        let Status::Delay(Some(Error::ApplyCertificates { message, .. })) = &status else {
            panic!("expected delayed apply failure, got {status:?}");
        };
        assert!(message.starts_with("cannot create certificate for secret web-tls"));
        // The other certificate is still created
        assert_eq!(fixture.registry.certificates().len(), 1);

        let reports = fixture.feedback.take();
        assert_eq!(reports.len(), 3, "{reports:?}");
        assert_eq!(
            reports[0],
            Report::Pending(Some("api-tls".to_string()), String::new())
        );
        assert!(matches!(&reports[1], Report::Failed(Some(secret), _) if secret == "web-tls"));
        assert_eq!(reports[2], Report::Failed(None, message.clone()));
    }

    #[tokio::test]
    async fn source_errors_are_retried() {
        let fixture = Fixture::new(vec![]);
        fixture.desire(Desired::Broken);
        let status = fixture.reconcile().await;
        assert!(
            matches!(status, Status::Delay(Some(Error::GetCertsInfo { .. }))),
            "{status:?}"
        );
        assert_eq!(
            fixture.access.events.lock().unwrap().as_slice(),
            &[(EventType::Warning, "source is broken".to_string())]
        );

        fixture.desire(Desired::Nothing);
        assert!(matches!(fixture.reconcile().await, Status::Stop));
        assert_eq!(fixture.registry.writes(), (0, 0, 0));
    }

    #[tokio::test]
    async fn finalizer_failure_delays_before_writes() {
        let fixture = Fixture::new(vec![cert_info("web-tls", &["a.example.com"])]);
        *fixture.access.fail_finalizer.lock().unwrap() = true;
        let status = fixture.reconcile().await;
        assert!(
            matches!(status, Status::Delay(Some(Error::SetFinalizer { .. }))),
            "{status:?}"
        );
        assert!(fixture.registry.certificates().is_empty());
    }

    #[tokio::test]
    async fn deletion_releases_finalizer_only_after_cleanup() {
        let web_tls = cert_info("web-tls", &["a.example.com"]);
        let fixture = Fixture::new(vec![web_tls.clone()]);
        assert!(fixture.reconcile().await.is_succeeded());
        assert!(fixture.access.has_finalizer());

        *fixture.registry.fail_delete.lock().unwrap() = true;
        let status = fixture.reconciler.delete(&fixture.service).await;
        assert!(matches!(status, Status::Delay(None)), "{status:?}");
        assert!(fixture.access.has_finalizer());
        assert_eq!(fixture.registry.certificates().len(), 1);

        *fixture.registry.fail_delete.lock().unwrap() = false;
        let status = fixture.reconciler.delete(&fixture.service).await;
        assert!(matches!(status, Status::Succeeded), "{status:?}");
        assert!(!fixture.access.has_finalizer());
        assert!(fixture.registry.certificates().is_empty());
    }

    #[tokio::test]
    async fn deleted_owner_cleans_up_by_key() {
        let web_tls = cert_info("web-tls", &["a.example.com"]);
        let fixture = Fixture::new(vec![web_tls]);
        assert!(fixture.reconcile().await.is_succeeded());

        let status = fixture.reconciler.deleted(&fixture.owner().key).await;
        assert!(matches!(status, Status::Succeeded), "{status:?}");
        assert!(fixture.registry.certificates().is_empty());

        // Nothing left to delete
        let status = fixture.reconciler.deleted(&fixture.owner().key).await;
        assert!(matches!(status, Status::Succeeded), "{status:?}");
        assert_eq!(
            *fixture.reconciler.source.deleted.lock().unwrap(),
            vec![fixture.owner().key]
        );
    }

    #[tokio::test]
    async fn single_domain_becomes_common_name_only() {
        let fixture = Fixture::new(vec![cert_info("tls-a", &["a.example.com"])]);

        assert!(matches!(fixture.reconcile().await, Status::Succeeded));
        assert_eq!(fixture.registry.writes(), (1, 0, 0));
        let certificate = &fixture.registry.certificates()[0];
        assert_eq!(certificate.spec.common_name.as_deref(), Some("a.example.com"));
        assert!(certificate.spec.dns_names.is_empty());
        assert_eq!(
            fixture.feedback.take(),
            vec![
                Report::Pending(Some("tls-a".to_string()), String::new()),
                Report::Succeeded,
            ]
        );
    }

    #[tokio::test]
    async fn states_without_message_use_defaults() {
        let ready = cert_info("ready-tls", &["ready.example.com"]);
        let errored = cert_info("errored-tls", &["errored.example.com"]);
        let pending = cert_info("pending-tls", &["pending.example.com"]);
        let fresh = cert_info("fresh-tls", &["fresh.example.com"]);
        let fixture = Fixture::new(vec![
            ready.clone(),
            errored.clone(),
            pending.clone(),
            fresh.clone(),
        ]);
        let owner = fixture.owner();
        let minute = Duration::from_secs(60);
        fixture.registry.seed(&owner, "ready", &ready, minute);
        fixture.registry.seed(&owner, "errored", &errored, minute);
        fixture.registry.seed(&owner, "pending", &pending, minute);
        fixture
            .registry
            .seed(&owner, "fresh", &fresh, Duration::from_secs(10));
        fixture
            .registry
            .set_state("ready-tls", CertificateState::Ready, None);
        fixture
            .registry
            .set_state("errored-tls", CertificateState::Error, None);
        fixture
            .registry
            .set_state("pending-tls", CertificateState::Pending, Some(""));

        assert!(matches!(fixture.reconcile().await, Status::Succeeded));
        assert_eq!(fixture.registry.writes(), (0, 0, 0));
        assert_eq!(
            fixture.feedback.take(),
            vec![
                Report::Failed(
                    Some("errored-tls".to_string()),
                    "erroneous certificate".to_string()
                ),
                Report::Pending(
                    Some("pending-tls".to_string()),
                    "certificate pending".to_string()
                ),
                Report::Ready(
                    Some("ready-tls".to_string()),
                    "certificate ready".to_string()
                ),
                Report::Succeeded,
            ]
        );
    }

    #[tokio::test]
    async fn finalizer_follows_desired_set() {
        let fixture = Fixture::new(vec![cert_info("web-tls", &["a.example.com"])]);
        assert!(matches!(fixture.reconcile().await, Status::Succeeded));
        assert!(fixture.access.has_finalizer());
        assert_eq!(fixture.registry.certificates().len(), 1);

        fixture.desire(Desired::Certs(vec![]));
        assert!(matches!(fixture.reconcile().await, Status::Stop));
        assert!(!fixture.access.has_finalizer());
        assert!(fixture.registry.certificates().is_empty());

        fixture.desire(Desired::Certs(vec![cert_info("api-tls", &["api.example.com"])]));
        assert!(matches!(fixture.reconcile().await, Status::Succeeded));
        assert!(fixture.access.has_finalizer());
        assert_eq!(*fixture.access.finalizer_patches.lock().unwrap(), 3);
    }

    #[tokio::test]
    async fn deleted_owner_is_reported_only_after_cleanup() {
        let fixture = Fixture::new(vec![cert_info("web-tls", &["a.example.com"])]);
        assert!(fixture.reconcile().await.is_succeeded());
        let key = fixture.owner().key;

        *fixture.registry.fail_delete.lock().unwrap() = true;
        let status = fixture.reconciler.deleted(&key).await;
        assert!(matches!(status, Status::Delay(None)), "{status:?}");
        assert_eq!(fixture.registry.certificates().len(), 1);
        assert!(fixture.reconciler.source.deleted.lock().unwrap().is_empty());

        *fixture.registry.fail_delete.lock().unwrap() = false;
        let status = fixture.reconciler.deleted(&key).await;
        assert!(matches!(status, Status::Succeeded), "{status:?}");
        assert!(fixture.registry.certificates().is_empty());
        assert_eq!(*fixture.reconciler.source.deleted.lock().unwrap(), vec![key]);
    }
}
