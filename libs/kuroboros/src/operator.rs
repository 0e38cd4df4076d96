//! Operator supervisor: leader election, controller lifecycle, metrics
//! reporting, webhook server lifecycle, graceful shutdown.
//!
//! `OperatorContext` is a value built once in `Operator::new` and threaded
//! through `start`, rather than mutable state scattered across the
//! supervisor's fields.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, PostParams};
use kube::Client;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::{operator_namespace, OperatorConfig};
use crate::controller::Controller;
use crate::error::{Error, Result};
use crate::gvi::GroupVersionInfo;
use crate::metrics::OperatorMetrics;
use crate::reconciler::Reconciler;
use crate::resource::CrBound;
use crate::utils::StopSignal;
use crate::webhook::{MutationWebhook, ValidationWebhook, WebhookEndpoint};
use crate::webhook_server::WebhookServer;

/// One version entry of a [`ControllerConfig`]: a `GroupVersionInfo` plus
/// factories for its reconciler and optional webhooks.
pub struct ControllerConfigVersion<K: CrBound> {
    pub name: String,
    pub gvi: GroupVersionInfo,
    pub reconciler: Arc<dyn Reconciler<K>>,
    pub validation_webhook: Option<Arc<dyn ValidationWebhook<K>>>,
    pub mutation_webhook: Option<Arc<dyn MutationWebhook<K>>>,
}

/// A named group of `ControllerConfigVersion`s — one per API version a kind
/// has ever shipped. Only the entry whose name matches the GVI currently
/// being served (the "run version") gets a live `Controller`; the rest are
/// inert metadata.
pub struct ControllerConfig<K: CrBound> {
    pub name: String,
    pub versions: Vec<ControllerConfigVersion<K>>,
}

impl<K: CrBound> ControllerConfig<K> {
    pub fn run_version(&self, run_version_name: &str) -> Result<&ControllerConfigVersion<K>> {
        self.versions
            .iter()
            .find(|v| v.name == run_version_name)
            .ok_or_else(|| Error::Unrecoverable(format!("no version matches {run_version_name}")))
    }
}

/// Type-erases a `Controller<K>` so the supervisor can hold controllers of
/// different CR kinds in one `Vec` without itself being generic.
trait ControllerHandle: Send + Sync {
    fn name(&self) -> &str;
    fn member_count_dyn(&self) -> BoxFuture<'_, usize>;
    fn run_dyn(&self) -> (JoinHandle<()>, JoinHandle<()>);
    fn stop_dyn(&self) -> BoxFuture<'_, ()>;
    fn webhook_endpoints_dyn(&self) -> Vec<(String, Arc<dyn WebhookEndpoint>)>;
}

impl<K: CrBound> ControllerHandle for Controller<K> {
    fn name(&self) -> &str {
        &self.name
    }

    fn member_count_dyn(&self) -> BoxFuture<'_, usize> {
        Box::pin(self.member_count())
    }

    fn run_dyn(&self) -> (JoinHandle<()>, JoinHandle<()>) {
        self.run()
    }

    fn stop_dyn(&self) -> BoxFuture<'_, ()> {
        Box::pin(self.stop())
    }

    fn webhook_endpoints_dyn(&self) -> Vec<(String, Arc<dyn WebhookEndpoint>)> {
        self.webhook_endpoints()
    }
}

/// Built once in `Operator::new`, threaded through every long-running task
/// the operator owns.
pub struct OperatorContext {
    pub client: Client,
    pub config: OperatorConfig,
    pub namespace: String,
    pub uid: String,
    pub metrics: Arc<OperatorMetrics>,
}

struct LeaderState {
    flag: AtomicBool,
}

impl LeaderState {
    fn new() -> Self {
        Self {
            flag: AtomicBool::new(false),
        }
    }

    /// Non-recursive: a plain atomic read, deliberately not re-derived from
    /// any other state on every call.
    fn is_leader(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    fn set_leader(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }
}

/// Top-level process supervisor: acquires leadership, runs every configured
/// controller, serves admission webhooks, exposes metrics, and shuts down
/// gracefully on SIGINT.
pub struct Operator {
    ctx: Arc<OperatorContext>,
    controllers: Vec<Arc<dyn ControllerHandle>>,
    leader: Arc<LeaderState>,
    stop: Arc<StopSignal>,
    running: bool,
}

impl Operator {
    pub fn new(client: Client, config: OperatorConfig) -> Self {
        Self::with_metrics(client, config, OperatorMetrics::new())
    }

    /// Like [`Operator::new`], but registers the operator's own gauges into
    /// an already-constructed [`OperatorMetrics`] — used by callers that
    /// build the client with `kuroboros-k8s-util`'s request-metrics layer
    /// and want both served from the same registry.
    pub fn with_metrics(client: Client, config: OperatorConfig, metrics: OperatorMetrics) -> Self {
        let namespace = operator_namespace();
        let uid = Uuid::new_v4().to_string();
        let ctx = Arc::new(OperatorContext {
            client,
            config,
            namespace,
            uid,
            metrics: Arc::new(metrics),
        });
        Self {
            ctx,
            controllers: Vec::new(),
            leader: Arc::new(LeaderState::new()),
            stop: Arc::new(StopSignal::new()),
            running: false,
        }
    }

    pub fn context(&self) -> Arc<OperatorContext> {
        self.ctx.clone()
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn is_leader(&self) -> bool {
        self.leader.is_leader()
    }

    /// Resolves `config`'s run version, constructs its `Controller`, and
    /// registers it with the operator. Errors propagate from
    /// `Controller::new`'s permission pre-flight or from a duplicate
    /// controller name.
    pub async fn add_controller<K: CrBound>(
        &mut self,
        config: ControllerConfig<K>,
        run_version_name: &str,
        cleanup_interval: Duration,
    ) -> Result<()> {
        if self.running {
            return Err(Error::Unrecoverable(
                "cannot add a controller while the operator is running".into(),
            ));
        }
        let version = config.run_version(run_version_name)?;
        let controller = Controller::<K>::new(
            config.name.clone(),
            version.gvi.clone(),
            self.ctx.client.clone(),
            version.reconciler.clone(),
            version.validation_webhook.clone(),
            version.mutation_webhook.clone(),
            cleanup_interval,
        )
        .await?;
        if self.controllers.iter().any(|c| c.name() == controller.name) {
            return Err(Error::Unrecoverable(format!(
                "controller {} already added",
                controller.name
            )));
        }
        self.controllers.push(Arc::new(controller));
        Ok(())
    }

    /// Starts the operator: leader election, controllers, webhook server,
    /// metrics reporting, supervision loop, SIGINT handling. Returns once a
    /// graceful shutdown has completed.
    pub async fn start(&mut self, skip_controllers: bool, skip_webhook_server: bool) -> Result<()> {
        if skip_controllers && skip_webhook_server {
            return Err(Error::Unrecoverable(
                "cannot skip both controllers and the webhook server".into(),
            ));
        }
        if self.controllers.is_empty() {
            return Err(Error::Unrecoverable(
                "no controllers found to run the operator".into(),
            ));
        }
        if self.running {
            return Err(Error::Unrecoverable("operator already started".into()));
        }

        let mut task_handles: Vec<(&'static str, JoinHandle<()>)> = Vec::new();

        task_handles.push(("metrics-server", self.spawn_metrics_server()));

        let webhook_endpoints: Vec<_> = self
            .controllers
            .iter()
            .flat_map(|c| c.webhook_endpoints_dyn())
            .collect();
        if !webhook_endpoints.is_empty() && !skip_webhook_server {
            let handle = self.spawn_webhook_server(webhook_endpoints).await?;
            task_handles.push(("webhook-server", handle));
        }

        if !skip_controllers {
            let leader_election = self.spawn_leader_election();
            while !self.leader.is_leader() {
                if leader_election.is_finished() {
                    return Err(Error::Unrecoverable(
                        "leader election loop died while trying to acquire leadership".into(),
                    ));
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            task_handles.push(("leader-election", leader_election));

            for controller in &self.controllers {
                let (watcher, cleanup) = controller.run_dyn();
                task_handles.push(("watcher", watcher));
                task_handles.push(("cleanup", cleanup));
            }

            task_handles.push(("metrics-reporter", self.spawn_metrics_reporter()));
        }

        self.running = true;
        self.supervise(task_handles).await
    }

    async fn spawn_webhook_server(
        &self,
        endpoints: Vec<(String, Arc<dyn WebhookEndpoint>)>,
    ) -> Result<JoinHandle<()>> {
        let cert = tokio::fs::read_to_string(&self.ctx.config.cert_path)
            .await
            .map_err(|e| Error::Tls(format!("failed to read {}: {e}", self.ctx.config.cert_path)))?;
        let key = tokio::fs::read_to_string(&self.ctx.config.key_path)
            .await
            .map_err(|e| Error::Tls(format!("failed to read {}: {e}", self.ctx.config.key_path)))?;
        let mut server = WebhookServer::new(self.ctx.config.webhook_port, cert, key);
        for (path, endpoint) in endpoints {
            server.register(path, endpoint);
        }
        let stop = self.stop.clone();
        Ok(tokio::spawn(async move {
            if let Err(e) = server.run(stop).await {
                tracing::error!(error = %e, "webhook server exited with an error");
            }
        }))
    }

    fn spawn_metrics_server(&self) -> JoinHandle<()> {
        let metrics = self.ctx.metrics.clone();
        let port = self.ctx.config.metrics_port;
        let stop = self.stop.clone();
        tokio::spawn(async move {
            if let Err(e) = crate::metrics_server::run(metrics, port, stop).await {
                tracing::error!(error = %e, "metrics server exited with an error");
            }
        })
    }

    fn spawn_leader_election(&self) -> JoinHandle<()> {
        let ctx = self.ctx.clone();
        let leader = self.leader.clone();
        let stop = self.stop.clone();
        tokio::spawn(async move {
            leader_election_loop(ctx, leader, stop).await;
        })
    }

    fn spawn_metrics_reporter(&self) -> JoinHandle<()> {
        let ctx = self.ctx.clone();
        let stop = self.stop.clone();
        let controllers = self.controllers.clone();
        let interval = Duration::from_secs_f64(ctx.config.metrics_update_interval_seconds.max(0.01));
        tokio::spawn(async move {
            while !stop.is_set() {
                let mut total = 0usize;
                for controller in &controllers {
                    let count = controller.member_count_dyn().await;
                    total += count;
                    ctx.metrics
                        .set_reconciler_count(&ctx.namespace, controller.name(), count as i64);
                }
                ctx.metrics.set_active_threads(total as i64);
                stop.sleep(interval).await;
            }
        })
    }

    /// Watches every owned task; any single one exiting is fatal to the
    /// operator, unless it exited because a graceful shutdown was already
    /// in progress.
    async fn supervise(&mut self, handles: Vec<(&'static str, JoinHandle<()>)>) -> Result<()> {
        let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
            .map_err(|e| Error::Unexpected(format!("failed to install SIGINT handler: {e}")))?;
        let mut shutting_down = false;

        loop {
            if shutting_down && handles.iter().all(|(_, h)| h.is_finished()) {
                break;
            }

            tokio::select! {
                _ = sigint.recv() => {
                    if shutting_down {
                        tracing::warn!("second SIGINT received, exiting immediately");
                        std::process::exit(1);
                    }
                    tracing::info!("SIGINT received, shutting down gracefully");
                    shutting_down = true;
                    self.graceful_shutdown().await;
                }
                _ = tokio::time::sleep(Duration::from_millis(200)) => {
                    if !shutting_down {
                        for (name, handle) in &handles {
                            if handle.is_finished() {
                                return Err(Error::Unrecoverable(format!(
                                    "{name} task exited unexpectedly"
                                )));
                            }
                        }
                    }
                }
            }
        }
        self.running = false;
        Ok(())
    }

    /// Stops every controller (which cascades into its reconcilers) and
    /// signals every other process-wide task to exit.
    async fn graceful_shutdown(&self) {
        for controller in &self.controllers {
            controller.stop_dyn().await;
        }
        self.stop.set();
    }
}

async fn leader_election_loop(ctx: Arc<OperatorContext>, leader: Arc<LeaderState>, stop: Arc<StopSignal>) {
    let api: Api<Lease> = Api::namespaced(ctx.client.clone(), &ctx.namespace);
    let lease_name = format!("{}-leader", ctx.config.name);
    let lease_duration = 10i32;
    tracing::info!(uid = %ctx.uid, "trying to acquire leadership");

    while !stop.is_set() {
        match acquire_once(&api, &lease_name, &ctx.uid, lease_duration).await {
            Ok(acquired) => {
                if acquired && !leader.is_leader() {
                    tracing::info!(uid = %ctx.uid, "leadership acquired");
                    leader.set_leader();
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "error while trying to acquire leadership lease");
                return;
            }
        }
        tokio::time::sleep(Duration::from_secs_f64(
            ctx.config.leader_acquire_interval_seconds.max(0.01),
        ))
        .await;
    }
}

async fn acquire_once(
    api: &Api<Lease>,
    lease_name: &str,
    uid: &str,
    lease_duration: i32,
) -> Result<bool> {
    let now = now_utc();
    match api.get(lease_name).await {
        Err(kube::Error::Api(resp)) if resp.code == 404 => {
            let lease = Lease {
                metadata: ObjectMeta {
                    name: Some(lease_name.to_string()),
                    ..Default::default()
                },
                spec: Some(LeaseSpec {
                    holder_identity: Some(uid.to_string()),
                    renew_time: Some(MicroTime(now)),
                    lease_duration_seconds: Some(lease_duration),
                    ..Default::default()
                }),
            };
            api.create(&PostParams::default(), &lease).await?;
            Ok(true)
        }
        Err(e) => Err(Error::from(e)),
        Ok(mut existing) => {
            let spec = existing
                .spec
                .as_ref()
                .ok_or_else(|| Error::Unrecoverable("lease has no spec".into()))?;
            let renew_time = spec.renew_time.as_ref().map(|t| t.0).unwrap_or(now_utc());
            let duration = spec.lease_duration_seconds.unwrap_or(lease_duration);
            let expired = now > renew_time + chrono::Duration::seconds(duration as i64);
            let held_by_us = spec.holder_identity.as_deref() == Some(uid);
            if !expired && !held_by_us {
                return Ok(false);
            }
            let spec = existing.spec.get_or_insert_with(Default::default);
            spec.holder_identity = Some(uid.to_string());
            spec.renew_time = Some(MicroTime(now));
            spec.lease_duration_seconds = Some(lease_duration);
            api.replace(lease_name, &PostParams::default(), &existing)
                .await
                .map_err(Error::from)?;
            Ok(true)
        }
    }
}

fn now_utc() -> DateTime<Utc> {
    let since_epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    DateTime::<Utc>::from(UNIX_EPOCH + since_epoch)
}
