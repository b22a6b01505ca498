use std::time::Duration as StdDuration;

use clap::{crate_description, crate_version, Parser};
use stackable_operator::{
    logging::TracingTarget, namespace::WatchNamespace, time::Duration, CustomResourceExt,
};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

mod crd;
mod issuer;
mod source;
mod status;
mod utils;

pub const APP_NAME: &str = "cert";
pub const OPERATOR_NAME: &str = "certs.stackable.tech";

#[derive(clap::Parser)]
#[clap(author, version)]
struct Opts {
    #[clap(subcommand)]
    cmd: stackable_operator::cli::Command<CertOperatorRun>,
}

#[derive(clap::Parser)]
struct CertOperatorRun {
    /// Namespace to watch, all namespaces are watched if empty
    #[arg(long, env, default_value = "")]
    watch_namespace: WatchNamespace,
    /// Class of the annotated objects that this operator is responsible for
    #[arg(long, env, default_value = source::DEFAULT_CLASS)]
    class: String,
    /// Class put on created Certificates, defaults to the own class if that is not the default
    #[arg(long, env)]
    target_class: Option<String>,
    /// Namespace to create Certificates in, defaults to the namespace of their source
    #[arg(long, env)]
    target_namespace: Option<String>,
    #[arg(long, env, default_value = "")]
    name_prefix: String,
    /// How long a Certificate may go without a state before it is reported as pending
    #[arg(long, env, default_value = "2m")]
    pending_staleness: Duration,
    #[arg(long, env, default_value = "10m")]
    resync_interval: Duration,
    /// Delay before retrying a failed reconciliation
    #[arg(long, env, default_value = "30s")]
    retry_delay: Duration,
    /// Tracing log collector system
    #[arg(long, env, default_value_t, value_enum)]
    pub tracing_target: TracingTarget,
}

mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
    pub const TARGET: Option<&str> = option_env!("TARGET");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opts = Opts::parse();
    match opts.cmd {
        stackable_operator::cli::Command::Crd => {
            crd::Certificate::print_yaml_schema(built_info::PKG_VERSION)?;
            crd::Issuer::print_yaml_schema(built_info::PKG_VERSION)?;
        }
        stackable_operator::cli::Command::Run(CertOperatorRun {
            watch_namespace,
            class,
            target_class,
            target_namespace,
            name_prefix,
            pending_staleness,
            resync_interval,
            retry_delay,
            tracing_target,
        }) => {
            stackable_operator::logging::initialize_logging(
                "CERT_OPERATOR_LOG",
                APP_NAME,
                tracing_target,
            );
            stackable_operator::utils::print_startup_string(
                crate_description!(),
                crate_version!(),
                built_info::GIT_VERSION,
                built_info::TARGET.unwrap_or("unknown target"),
                built_info::BUILT_TIME_UTC,
                built_info::RUSTC_VERSION,
            );
            let client =
                stackable_operator::client::create_client(Some(OPERATOR_NAME.to_string())).await?;

            let requeue = status::RequeuePolicy {
                resync_interval: StdDuration::from_secs(resync_interval.as_secs()),
                retry_delay: StdDuration::from_secs(retry_delay.as_secs()),
            };
            let classes = source::Classes::new(class);
            let reconciler = source::ReconcilerOptions {
                target_class: classes.target_class(target_class),
                namespace: target_namespace.filter(|namespace| !namespace.is_empty()),
                name_prefix,
                pending_staleness: StdDuration::from_secs(pending_staleness.as_secs()),
            };
            let (trigger, triggered) = mpsc::unbounded_channel();
            futures::future::join(
                source::controller::start(
                    &client,
                    &watch_namespace,
                    source::controller::SourceControllerOptions {
                        classes,
                        reconciler,
                        requeue,
                    },
                    UnboundedReceiverStream::new(triggered),
                ),
                issuer::controller::start(&client, &watch_namespace, requeue, trigger),
            )
            .await;
        }
    }
    Ok(())
}
