use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use kube::Config;
use prometheus_client::registry::Registry;

use kuroboros::{
    ControllerConfig, ControllerConfigVersion, GroupVersionInfo, Operator, OperatorConfig,
    OperatorMetrics,
};
use kuroboros_k8s_util::client::new_client_with_metrics;

use demo_operator::widget::{Widget, WidgetMutation, WidgetReconciler, WidgetValidation};

#[derive(Parser, Debug)]
#[command(
    name = "kuroboros-demo-operator",
    about = "Reference operator built on the kuroboros runtime, managing the Widget CR",
    version
)]
struct Args {
    /// Set logging filter directive for `tracing_subscriber::filter::EnvFilter`.
    #[arg(long, default_value = "info", env = "KUROBOROS_LOG_FILTER")]
    log_filter: String,

    /// Set log output format.
    #[arg(long, value_enum, default_value_t = kuroboros::telemetry::LogFormat::Text, env = "KUROBOROS_LOG_FORMAT")]
    log_format: kuroboros::telemetry::LogFormat,

    /// Run with the controllers disabled (webhook server only).
    #[arg(long, env = "KUROBOROS_SKIP_CONTROLLERS")]
    skip_controllers: bool,

    /// Run with the admission webhook server disabled (controllers only).
    #[arg(long, env = "KUROBOROS_SKIP_WEBHOOK_SERVER")]
    skip_webhook_server: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    kuroboros::telemetry::init(&args.log_filter, args.log_format)?;

    let config = OperatorConfig::load()?;
    tracing::info!(name = %config.name, "loaded operator configuration");

    let mut registry = Registry::with_prefix("kuroboros_demo");
    let kube_config = Config::infer().await?;
    let client = new_client_with_metrics(kube_config, &mut registry).await?;
    let metrics = OperatorMetrics::with_registry(registry);

    if !args.skip_webhook_server {
        ensure_dev_certs(&config).await?;
    }

    let mut operator = Operator::with_metrics(client.clone(), config.clone(), metrics);

    let run_version = GroupVersionInfo::new("kuroboros.example.com", "v1", "Widget")?;
    let legacy_version = GroupVersionInfo::new("kuroboros.example.com", "v1beta1", "Widget")?;
    let reconciler = Arc::new(WidgetReconciler::new(client.clone()));

    let controller_config = ControllerConfig::<Widget> {
        name: "widget".to_string(),
        versions: vec![
            ControllerConfigVersion {
                name: "v1beta1".to_string(),
                gvi: legacy_version,
                reconciler: reconciler.clone(),
                validation_webhook: None,
                mutation_webhook: None,
            },
            ControllerConfigVersion {
                name: "v1".to_string(),
                gvi: run_version,
                reconciler,
                validation_webhook: Some(Arc::new(WidgetValidation)),
                mutation_webhook: Some(Arc::new(WidgetMutation)),
            },
        ],
    };

    let cleanup_interval = Duration::from_secs_f64(config.pending_remove_interval_seconds);
    operator
        .add_controller(controller_config, "v1", cleanup_interval)
        .await?;

    operator
        .start(args.skip_controllers, args.skip_webhook_server)
        .await?;

    Ok(())
}

/// In a real deployment, cert-manager (or an equivalent) provisions
/// `config.cert_path`/`config.key_path` ahead of time. For local
/// development against a throwaway cluster, generate a self-signed pair on
/// first run so the demo operator's webhook server has something to serve.
async fn ensure_dev_certs(config: &OperatorConfig) -> anyhow::Result<()> {
    if Path::new(&config.cert_path).exists() && Path::new(&config.key_path).exists() {
        return Ok(());
    }
    tracing::warn!(
        cert_path = %config.cert_path,
        key_path = %config.key_path,
        "no TLS material found, generating a throwaway self-signed certificate for local development"
    );
    let (cert_pem, key_pem) = kuroboros::utils::self_signed_cert(vec!["localhost".to_string()])?;
    if let Some(parent) = Path::new(&config.cert_path).parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    if let Some(parent) = Path::new(&config.key_path).parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(&config.cert_path, cert_pem).await?;
    tokio::fs::write(&config.key_path, key_pem).await?;
    Ok(())
}
