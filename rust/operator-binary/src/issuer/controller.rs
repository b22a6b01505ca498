//! Reconciles [`Issuer`]s, and reconciles them again whenever their account Secrets change

use std::sync::Arc;

use const_format::concatcp;
use futures::StreamExt;
use stackable_operator::{
    k8s_openapi::api::core::v1::Secret,
    kube::{
        api::PartialObjectMeta,
        runtime::{
            controller::Action,
            events::{Recorder, Reporter},
            reflector::{self, ObjectRef},
            watcher, Controller,
        },
        ResourceExt,
    },
    logging::controller::report_controller_reconciled,
    namespace::WatchNamespace,
};
use tokio::sync::mpsc;

use super::{
    acme::AcmeIssuerHandler, client::KubeIssuerClient, instant::InstantAcmeClient,
    support::Support, Error, IssuerHandler,
};
use crate::{
    crd::{Issuer, IssuerState},
    status::{Failure, RequeuePolicy},
    OPERATOR_NAME,
};

const CONTROLLER_NAME: &str = "issuer";
const FULL_CONTROLLER_NAME: &str = concatcp!(CONTROLLER_NAME, ".", OPERATOR_NAME);

struct Ctx {
    handlers: Vec<Box<dyn IssuerHandler>>,
    support: Arc<Support>,
    requeue: RequeuePolicy,
}

/// Runs until the controller terminates, every Issuer that becomes ready fires `trigger`.
pub async fn start(
    client: &stackable_operator::client::Client,
    watch_namespace: &WatchNamespace,
    requeue: RequeuePolicy,
    trigger: mpsc::UnboundedSender<()>,
) {
    let kube_client = client.as_kube_client();
    let support = Arc::new(Support::new(
        Arc::new(KubeIssuerClient::new(kube_client.clone())),
        Arc::new(trigger),
    ));
    let handlers: Vec<Box<dyn IssuerHandler>> = vec![Box::new(AcmeIssuerHandler::new(
        support.clone(),
        Arc::new(InstantAcmeClient),
    ))];
    let event_recorder = Arc::new(Recorder::new(
        kube_client,
        Reporter {
            controller: FULL_CONTROLLER_NAME.to_string(),
            instance: None,
        },
    ));
    let controller = Controller::new(
        watch_namespace.get_api::<Issuer>(client),
        watcher::Config::default(),
    );
    let issuers = controller.store();
    controller
        .owns(
            watch_namespace.get_api::<PartialObjectMeta<Secret>>(client),
            watcher::Config::default(),
        )
        .watches(
            watch_namespace.get_api::<PartialObjectMeta<Secret>>(client),
            watcher::Config::default(),
            secret_watch_mapper(issuers),
        )
        .run(
            reconcile,
            error_policy,
            Arc::new(Ctx {
                handlers,
                support,
                requeue,
            }),
        )
        .for_each_concurrent(16, move |res| {
            let event_recorder = event_recorder.clone();
            async move {
                report_controller_reconciled(&event_recorder, FULL_CONTROLLER_NAME, &res).await
            }
        })
        .await;
}

/// Resolves modifications to Secrets into the [`Issuer`]s that refer to them.
fn secret_watch_mapper(
    issuers: reflector::Store<Issuer>,
) -> impl Fn(PartialObjectMeta<Secret>) -> Vec<ObjectRef<Issuer>> {
    move |secret| {
        issuers
            .state()
            .into_iter()
            .filter(|issuer| refers_to_secret(issuer, &secret))
            .map(|issuer| ObjectRef::from_obj(&*issuer))
            .collect()
    }
}

/// Whether `secret` holds the account or the EAB key of `issuer`.
fn refers_to_secret(issuer: &Issuer, secret: &PartialObjectMeta<Secret>) -> bool {
    let Some(acme) = &issuer.spec.acme else {
        return false;
    };
    let namespace = issuer.namespace().unwrap_or_default();
    let account = acme
        .private_key_secret_ref
        .as_ref()
        .is_some_and(|secret_ref| secret_ref.refers_to_secret(secret, &namespace));
    let eab = acme
        .external_account_binding
        .as_ref()
        .is_some_and(|eab| eab.key_secret_ref.refers_to_secret(secret, &namespace));
    account || eab
}

async fn reconcile(issuer: Arc<Issuer>, ctx: Arc<Ctx>) -> Result<Action, Failure<Error>> {
    let status = match ctx
        .handlers
        .iter()
        .find(|handler| handler.can_reconcile(&issuer))
    {
        Some(handler) => {
            tracing::debug!(
                issuer = %ObjectRef::from_obj(&*issuer),
                issuer_type = handler.issuer_type(),
                "found issuer handler"
            );
            handler.reconcile(&issuer).await
        }
        None => {
            ctx.support
                .failed(
                    &issuer,
                    "",
                    IssuerState::Error,
                    Error::NoHandler {
                        issuer: ObjectRef::from_obj(&*issuer),
                    },
                    false,
                )
                .await
        }
    };
    status.into_action(&ctx.requeue)
}

fn error_policy(_obj: Arc<Issuer>, error: &Failure<Error>, ctx: Arc<Ctx>) -> Action {
    error.action(&ctx.requeue)
}
