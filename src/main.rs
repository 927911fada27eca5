//! Cache Operator - keeps a Deployment, ConfigMap and Service per CacheInstance

use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Service};
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, CustomResourceExt};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cache_operator::config::{
    ApplyPolicy, CacheDefaults, OperatorConfig, ValidationLimits, DEFAULT_EVICTION_POLICY,
    DEFAULT_IMAGE, DEFAULT_MAX_MEMORY, DEFAULT_PORT, DEFAULT_REQUEUE_SECS,
};
use cache_operator::controller::{error_policy, reconcile, Context};
use cache_operator::crd::{crd_yaml, CacheInstance};

/// Cache Operator - CRD-driven Kubernetes operator for cache instances
#[derive(Parser, Debug)]
#[command(name = "cache-operator", version, about, long_about = None)]
struct Cli {
    /// Generate CRD manifests and exit
    #[arg(long)]
    crd: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run as controller (default mode)
    ///
    /// Watches CacheInstance resources in every namespace and keeps their
    /// ConfigMap, Deployment and Service in step with the spec.
    Controller(ControllerArgs),
}

/// Controller mode arguments
#[derive(Args, Debug)]
struct ControllerArgs {
    /// Image used when a CacheInstance leaves `image` empty
    #[arg(long, env = "CACHE_DEFAULT_IMAGE", default_value = DEFAULT_IMAGE)]
    default_image: String,

    /// Port used when a CacheInstance leaves `port` at zero
    #[arg(long, env = "CACHE_DEFAULT_PORT", default_value_t = DEFAULT_PORT)]
    default_port: i32,

    /// Memory ceiling used when a CacheInstance leaves `maxMemory` empty
    #[arg(long, env = "CACHE_DEFAULT_MAX_MEMORY", default_value = DEFAULT_MAX_MEMORY)]
    default_max_memory: String,

    /// Eviction policy used when a CacheInstance leaves it empty
    #[arg(long, env = "CACHE_DEFAULT_EVICTION_POLICY", default_value = DEFAULT_EVICTION_POLICY)]
    default_eviction_policy: String,

    /// Largest `maxMemory` a CacheInstance may request without a status error
    #[arg(long, env = "CACHE_MAX_MEMORY_CEILING", default_value = "5gb")]
    max_memory_ceiling: String,

    /// When to write children: `defaulting-gate` or `always`
    #[arg(long, env = "CACHE_APPLY_POLICY", default_value = "defaulting-gate")]
    apply_policy: ApplyPolicy,

    /// Seconds before a failed reconciliation is retried
    #[arg(long, env = "CACHE_REQUEUE_SECS", default_value_t = DEFAULT_REQUEUE_SECS)]
    requeue_secs: u64,
}

impl Default for ControllerArgs {
    fn default() -> Self {
        Self {
            default_image: DEFAULT_IMAGE.to_string(),
            default_port: DEFAULT_PORT,
            default_max_memory: DEFAULT_MAX_MEMORY.to_string(),
            default_eviction_policy: DEFAULT_EVICTION_POLICY.to_string(),
            max_memory_ceiling: "5gb".to_string(),
            apply_policy: ApplyPolicy::default(),
            requeue_secs: DEFAULT_REQUEUE_SECS,
        }
    }
}

impl ControllerArgs {
    fn into_config(self) -> anyhow::Result<OperatorConfig> {
        let config = OperatorConfig {
            defaults: CacheDefaults {
                image: self.default_image,
                port: self.default_port,
                max_memory: self.default_max_memory,
                max_memory_eviction_policy: self.default_eviction_policy,
            },
            limits: ValidationLimits::with_max_memory(&self.max_memory_ceiling)?,
            apply_policy: self.apply_policy,
            requeue_after: Duration::from_secs(self.requeue_secs),
        };
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // kube's rustls transport needs a process-wide crypto provider
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: Failed to install crypto provider: {:?}", e);
        std::process::exit(1);
    }

    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if cli.crd {
        println!("{}", crd_yaml()?);
        return Ok(());
    }

    let args = match cli.command {
        Some(Commands::Controller(args)) => args,
        None => ControllerArgs::default(),
    };
    run_controller(args.into_config()?).await
}

/// Ensure the CacheInstance CRD is installed
///
/// The operator installs its own CRD on startup using server-side apply so
/// the schema always matches the binary.
async fn ensure_crd_installed(client: &Client) -> anyhow::Result<()> {
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
    use kube::api::{Patch, PatchParams};

    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply("cache-operator").force();

    tracing::info!("Installing CacheInstance CRD...");
    crds.patch(
        "cacheinstances.cache-operator.io",
        &params,
        &Patch::Apply(&CacheInstance::crd()),
    )
    .await
    .map_err(|e| anyhow::anyhow!("Failed to install CacheInstance CRD: {}", e))?;

    Ok(())
}

/// Run the CacheInstance controller until a shutdown signal arrives
async fn run_controller(config: OperatorConfig) -> anyhow::Result<()> {
    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    ensure_crd_installed(&client).await?;

    tracing::info!(
        image = %config.defaults.image,
        port = config.defaults.port,
        max_memory = %config.defaults.max_memory,
        ceiling = %config.limits.max_memory,
        policy = %config.apply_policy,
        "Starting CacheInstance controller"
    );

    let ctx = Arc::new(Context::builder(client.clone()).config(config).build());

    let instances: Api<CacheInstance> = Api::all(client.clone());

    Controller::new(instances, WatcherConfig::default())
        .owns(Api::<Deployment>::all(client.clone()), WatcherConfig::default())
        .owns(Api::<ConfigMap>::all(client.clone()), WatcherConfig::default())
        .owns(Api::<Service>::all(client), WatcherConfig::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok(action) => {
                    tracing::debug!(?action, "CacheInstance reconciliation completed");
                }
                Err(e) => {
                    tracing::error!(error = ?e, "CacheInstance reconciliation error");
                }
            }
        })
        .await;

    tracing::info!("CacheInstance controller stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_defaults_to_controller_mode() {
        let cli = Cli::try_parse_from(["cache-operator"]).unwrap();
        assert!(!cli.crd);
        assert!(cli.command.is_none());
    }

    #[test]
    fn controller_flags_build_config() {
        let cli = Cli::try_parse_from([
            "cache-operator",
            "controller",
            "--default-port",
            "7000",
            "--max-memory-ceiling",
            "1gb",
            "--apply-policy",
            "always",
            "--requeue-secs",
            "30",
        ])
        .unwrap();

        let Some(Commands::Controller(args)) = cli.command else {
            panic!("expected controller subcommand");
        };
        let config = args.into_config().unwrap();
        assert_eq!(config.defaults.port, 7000);
        assert_eq!(config.limits.max_memory.to_string(), "1gb");
        assert_eq!(config.apply_policy, ApplyPolicy::Always);
        assert_eq!(config.requeue_after, Duration::from_secs(30));
    }

    #[test]
    fn invalid_ceiling_is_rejected() {
        let args = ControllerArgs {
            max_memory_ceiling: "huge".to_string(),
            ..Default::default()
        };
        assert!(args.into_config().is_err());
    }

    #[test]
    fn default_args_match_library_defaults() {
        let config = ControllerArgs::default().into_config().unwrap();
        assert_eq!(config, OperatorConfig::default());
    }
}
