#[macro_use]
extern crate log;

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use clap::{ArgAction, Args, Parser, Subcommand};
use kube::Client;
use metrics_operator_apis::{v1alpha1, v1beta1};

use access::AccessResolver;
use controller::{Context, MetricController};
use discovery::GvrResolver;
use leader_election::LeaderElector;
use sink::SinkPool;
use telemetry::Endpoint;
use utils::{env_var, operator_namespace};

mod access;
mod cluster;
mod controller;
mod discovery;
mod errors;
mod flavors;
mod handlers;
mod install;
mod leader_election;
mod orchestrator;
mod projection;
mod secrets;
mod sink;
mod status;
mod target_watcher;
mod telemetry;
mod utils;

/// The K8s field manager name.
const MANAGER: &str = "metrics-operator";

/// Measures Kubernetes resources and ships the results to OTLP data sinks.
#[derive(Parser)]
#[command(name = "metrics-operator", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Install or upgrade the CustomResourceDefinitions and exit.
    Init,
    /// Run the metric controllers.
    Start(StartArgs),
}

#[derive(Args)]
struct StartArgs {
    /// Address of the self-metrics endpoint, `0` disables it.
    #[arg(long, default_value = ":8080")]
    metrics_bind_address: String,
    /// Address of the health probe endpoints, `0` disables them.
    #[arg(long, default_value = ":8081")]
    health_probe_bind_address: String,
    /// Only measure while holding the leader election Lease.
    #[arg(long, action = ArgAction::Set, default_value_t = false, num_args = 0..=1, default_missing_value = "true")]
    leader_elect: bool,
    /// Re-measure metrics when their target resources change.
    #[arg(long, action = ArgAction::Set, default_value_t = true, num_args = 0..=1, default_missing_value = "true")]
    use_event_driven_controller: bool,
}

async fn start(args: StartArgs) -> anyhow::Result<()> {
    let registry = telemetry::init_meter_provider()?;
    let ready = Arc::new(AtomicBool::new(false));
    telemetry::start(&args.metrics_bind_address, Endpoint::Metrics(registry)).await?;
    telemetry::start(
        &args.health_probe_bind_address,
        Endpoint::Health(ready.clone()),
    )
    .await?;
    let client = Client::try_default().await?;
    let namespace = operator_namespace();
    info!("default DataSinks are read from namespace {}", namespace);

    let elector = if args.leader_elect {
        let identity = env_var("POD_NAME")
            .or_else(|| env_var("HOSTNAME"))
            .unwrap_or_else(|| format!("{}-{}", MANAGER, std::process::id()));
        let elector = LeaderElector::new(client.clone(), &namespace, identity);
        tokio::select! {
            _ = elector.acquire() => {}
            _ = tokio::signal::ctrl_c() => return Ok(()),
        }
        Some(elector)
    } else {
        None
    };

    let context = Arc::new(Context {
        client: client.clone(),
        namespace,
        access: AccessResolver::new(client, Arc::new(GvrResolver::default())),
        sinks: SinkPool::default(),
    });
    let event_driven = args.use_event_driven_controller;
    let controllers = async {
        tokio::join!(
            MetricController::<v1alpha1::Metric>::new(context.clone()).start(event_driven),
            MetricController::<v1alpha1::ManagedMetric>::new(context.clone()).start(event_driven),
            MetricController::<v1alpha1::FederatedMetric>::new(context.clone()).start(event_driven),
            MetricController::<v1alpha1::FederatedManagedMetric>::new(context.clone())
                .start(event_driven),
            MetricController::<v1beta1::SingleMetric>::new(context.clone()).start(event_driven),
            MetricController::<v1beta1::CompoundMetric>::new(context.clone()).start(event_driven),
        );
    };
    ready.store(true, Ordering::Relaxed);
    info!("start controllers ...");
    let lost = match &elector {
        Some(elector) => tokio::select! {
            _ = controllers => false,
            _ = elector.keep_alive() => true,
        },
        None => {
            controllers.await;
            false
        }
    };
    ready.store(false, Ordering::Relaxed);
    context.sinks.close_all().await;
    if lost {
        anyhow::bail!("lost leadership");
    }
    if let Some(elector) = &elector {
        elector.release().await;
    }
    info!("shut down");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        debug!("a rustls crypto provider is already installed");
    }
    match Cli::parse().command {
        Command::Init => install::install_crds(Client::try_default().await?).await?,
        Command::Start(args) => start(args).await?,
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_flags() {
        let cli = Cli::try_parse_from(["metrics-operator", "start"]).unwrap();
        let Command::Start(args) = cli.command else {
            panic!("expected start");
        };
        assert_eq!(":8080", args.metrics_bind_address);
        assert_eq!(":8081", args.health_probe_bind_address);
        assert!(!args.leader_elect);
        assert!(args.use_event_driven_controller);

        let cli = Cli::try_parse_from([
            "metrics-operator",
            "start",
            "--leader-elect",
            "--use-event-driven-controller=false",
            "--metrics-bind-address=0",
        ])
        .unwrap();
        let Command::Start(args) = cli.command else {
            panic!("expected start");
        };
        assert!(args.leader_elect);
        assert!(!args.use_event_driven_controller);
        assert_eq!("0", args.metrics_bind_address);
    }

    #[test]
    fn init_command() {
        let cli = Cli::try_parse_from(["metrics-operator", "init"]).unwrap();
        assert!(matches!(cli.command, Command::Init));
        assert!(Cli::try_parse_from(["metrics-operator"]).is_err());
    }
}
