#[macro_use]
extern crate log;

use std::{net::SocketAddr, time::Duration};

use kube::Client;
use kube_runtime::events::{Recorder, Reporter};
use opentelemetry::global;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use prometheus::Registry;
use prometheus_exporter::start_prometheus_metrics_server;
use provider_bitbucket_apis::{Repo, RepoPermissionUser};

mod bitbucket;
mod clients;
mod errors;
mod managed;
mod modifications;
mod prometheus_exporter;
mod provider_config_controller;
mod repo_controller;
mod repo_permission_user_controller;
mod utils;

use managed::ManagedReconciler;
use provider_config_controller::ProviderConfigController;
use repo_controller::{REPO_CONTROLLER, RepoExternal};
use repo_permission_user_controller::{
    REPO_PERMISSION_USER_CONTROLLER, RepoPermissionUserExternal,
};
use utils::{env_var, parse_seconds};

/// The K8s field manager name.
const MANAGER: &'static str = "provider-bitbucket";

/// The K8s finalizer name of managed resources.
///
/// Note, changing the finalizer name is a breaking change and needs
/// additional code to remove the old finalizer (name) from all affected
/// K8s objects. Otherwise users might be stuck with managed resources which
/// cannot be deleted.
const FINALIZER: &'static str = "finalizer.managedresource.crossplane.io";

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(60);

struct Configuration {
    metrics_addr: SocketAddr,
    /// How often up to date managed resources are observed again.
    poll_interval: Duration,
}

impl Configuration {
    fn from_env() -> anyhow::Result<Self> {
        let metrics_addr = env_var("METRICS_LISTEN_ADDR").unwrap_or_else(|| "0.0.0.0".to_string());
        let metrics_port = env_var("METRICS_LISTEN_PORT").unwrap_or_else(|| "9000".to_string());
        let metrics_addr = format!("{}:{}", metrics_addr, metrics_port).parse()?;
        let poll_interval = match env_var("POLL_INTERVAL_SECONDS") {
            Some(v) => parse_seconds(&v)
                .ok_or_else(|| anyhow::anyhow!("invalid POLL_INTERVAL_SECONDS {:?}", v))?,
            None => DEFAULT_POLL_INTERVAL,
        };
        Ok(Self {
            metrics_addr,
            poll_interval,
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        debug!("rustls crypto provider already installed");
    }
    let configuration = Configuration::from_env()?;

    let registry = Registry::new();
    let exporter = opentelemetry_prometheus::exporter()
        .with_registry(registry.clone())
        .build()?;
    let meter_provider = SdkMeterProvider::builder().with_reader(exporter).build();
    global::set_meter_provider(meter_provider);
    let metrics_server = start_prometheus_metrics_server(configuration.metrics_addr, registry);

    let client = Client::try_default().await?;
    let reporter = Reporter {
        controller: MANAGER.to_string(),
        instance: env_var("POD_NAME"),
    };
    let recorder = Recorder::new(client.clone(), reporter);

    let repos = ManagedReconciler::<Repo, _>::new(
        REPO_CONTROLLER,
        client.clone(),
        recorder.clone(),
        configuration.poll_interval,
        RepoExternal::new,
    )
    .start();
    let repo_permission_users = ManagedReconciler::<RepoPermissionUser, _>::new(
        REPO_PERMISSION_USER_CONTROLLER,
        client.clone(),
        recorder,
        configuration.poll_interval,
        RepoPermissionUserExternal::new,
    )
    .start();
    let provider_configs = ProviderConfigController::new(client).start();

    info!(
        "start controllers, polling every {}s ...",
        configuration.poll_interval.as_secs()
    );
    tokio::select! {
       _ = repos => (),
       _ = repo_permission_users => (),
       _ = provider_configs => (),
       r = metrics_server => r?,
    };
    Ok(())
}
