//! Runs the [`SourceReconciler`] for [`Service`]s, and sweeps up [`Certificate`]s whose
//! [`Service`] disappeared without being cleaned up

use std::sync::Arc;

use const_format::concatcp;
use futures::{Stream, StreamExt};
use stackable_operator::{
    k8s_openapi::api::core::v1::Service,
    kube::{
        runtime::{
            controller::Action,
            events::{Recorder, Reporter},
            reflector::ObjectRef,
            watcher, Controller,
        },
        Api, Resource, ResourceExt,
    },
    logging::controller::report_controller_reconciled,
    namespace::WatchNamespace,
};

use super::{
    access::KubeSourceAccess, reconciler::Error, registry::KubeRegistry, service::ServiceSource,
    Classes, NoNested, OwnerKey, ReconcilerOptions, SourceReconciler, FINALIZER,
};
use crate::{
    crd::{Certificate, ANNOTATION_OWNER, LABEL_OWNER_KIND},
    status::{Failure, RequeuePolicy},
    OPERATOR_NAME,
};

const CONTROLLER_NAME: &str = "certificate-source";
const FULL_CONTROLLER_NAME: &str = concatcp!(CONTROLLER_NAME, ".", OPERATOR_NAME);
const SWEEP_CONTROLLER_NAME: &str = "certificate-sweep";
const FULL_SWEEP_CONTROLLER_NAME: &str = concatcp!(SWEEP_CONTROLLER_NAME, ".", OPERATOR_NAME);

pub struct SourceControllerOptions {
    pub classes: Classes,
    pub reconciler: ReconcilerOptions,
    pub requeue: RequeuePolicy,
}

struct Ctx {
    reconciler: SourceReconciler<Service, ServiceSource>,
    classes: Classes,
    requeue: RequeuePolicy,
    client: stackable_operator::client::Client,
}

/// Runs until the controllers terminate, `trigger` reconciles every Service whenever it fires.
pub async fn start(
    client: &stackable_operator::client::Client,
    watch_namespace: &WatchNamespace,
    options: SourceControllerOptions,
    trigger: impl Stream<Item = ()> + Send + Sync + 'static,
) {
    let kube_client = client.as_kube_client();
    let event_recorder = Arc::new(Recorder::new(
        kube_client.clone(),
        Reporter {
            controller: FULL_CONTROLLER_NAME.to_string(),
            instance: None,
        },
    ));
    let sweep_event_recorder = Arc::new(Recorder::new(
        kube_client.clone(),
        Reporter {
            controller: FULL_SWEEP_CONTROLLER_NAME.to_string(),
            instance: None,
        },
    ));
    let access = Arc::new(KubeSourceAccess::<Service>::new(
        kube_client.clone(),
        Recorder::new(
            kube_client.clone(),
            Reporter {
                controller: FULL_CONTROLLER_NAME.to_string(),
                instance: None,
            },
        ),
    ));
    let certificates = match &options.reconciler.namespace {
        Some(namespace) => Api::<Certificate>::namespaced(kube_client.clone(), namespace),
        None => watch_namespace.get_api::<Certificate>(client),
    };
    let reconciler = SourceReconciler::new(
        ServiceSource::new(access.clone()),
        Arc::new(KubeRegistry::new(
            kube_client,
            options.reconciler.namespace.clone(),
        )),
        access,
        Arc::new(NoNested),
        options.reconciler,
    );
    reconciler.setup();
    reconciler.start();
    let ctx = Arc::new(Ctx {
        reconciler,
        classes: options.classes,
        requeue: options.requeue,
        client: client.clone(),
    });

    let owned_certificates = watcher::Config::default().labels(&format!("{LABEL_OWNER_KIND}=service"));
    let source_controller = Controller::new(
        watch_namespace.get_api::<Service>(client),
        watcher::Config::default(),
    )
    .watches(certificates.clone(), owned_certificates.clone(), |certificate| {
        owner_key(&certificate).and_then(|owner| owner.object_ref::<Service>())
    })
    .reconcile_all_on(trigger)
    .run(reconcile_source, error_policy, ctx.clone())
    .for_each_concurrent(16, move |res| {
        let event_recorder = event_recorder.clone();
        async move { report_controller_reconciled(&event_recorder, FULL_CONTROLLER_NAME, &res).await }
    });

    let sweep_controller = Controller::new(certificates, owned_certificates)
        .run(sweep_certificate, sweep_error_policy, ctx)
        .for_each_concurrent(16, move |res| {
            let event_recorder = sweep_event_recorder.clone();
            async move {
                report_controller_reconciled(&event_recorder, FULL_SWEEP_CONTROLLER_NAME, &res)
                    .await
            }
        });

    futures::future::join(source_controller, sweep_controller).await;
}

fn owner_key(certificate: &Certificate) -> Option<OwnerKey> {
    certificate.annotations().get(ANNOTATION_OWNER)?.parse().ok()
}

fn has_finalizer(service: &Service) -> bool {
    service.finalizers().iter().any(|finalizer| finalizer == FINALIZER)
}

async fn reconcile_source(service: Arc<Service>, ctx: Arc<Ctx>) -> Result<Action, Failure<Error>> {
    let status = if service.meta().deletion_timestamp.is_some() {
        if !has_finalizer(&service) {
            return Ok(Action::await_change());
        }
        ctx.reconciler.delete(&service).await
    } else if !ctx.classes.is_responsible_for(service.annotations()) {
        if !has_finalizer(&service) {
            return Ok(Action::await_change());
        }
        tracing::info!(
            service = %ObjectRef::from_obj(&*service),
            class = ctx.classes.main(),
            "Service moved to another class, releasing its certificates"
        );
        ctx.reconciler.delete(&service).await
    } else {
        ctx.reconciler.reconcile(&service).await
    };
    status.into_action(&ctx.requeue)
}

fn error_policy(_obj: Arc<Service>, error: &Failure<Error>, ctx: Arc<Ctx>) -> Action {
    error.action(&ctx.requeue)
}

async fn sweep_certificate(
    certificate: Arc<Certificate>,
    ctx: Arc<Ctx>,
) -> Result<Action, Failure<Error>> {
    if certificate.meta().deletion_timestamp.is_some() {
        return Ok(Action::await_change());
    }
    let Some(owner) = owner_key(&certificate) else {
        return Ok(Action::await_change());
    };
    let Some(service_ref) = owner.object_ref::<Service>() else {
        return Ok(Action::await_change());
    };
    let services = Api::<Service>::namespaced(
        ctx.client.as_kube_client(),
        service_ref.namespace.as_deref().unwrap_or_default(),
    );
    match services.get_opt(&service_ref.name).await {
        Ok(Some(_)) => Ok(Action::await_change()),
        Ok(None) => ctx.reconciler.deleted(&owner).await.into_action(&ctx.requeue),
        Err(source) => Err(Failure::Retry(Error::LookupOwner { source, owner })),
    }
}

fn sweep_error_policy(_obj: Arc<Certificate>, error: &Failure<Error>, ctx: Arc<Ctx>) -> Action {
    error.action(&ctx.requeue)
}
