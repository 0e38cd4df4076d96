//! Demo CR: `Widget`, a minimal stand-in for a real operator's managed
//! resource. Reconciling a `Widget` creates/updates a `Deployment` running
//! `n` replicas of an echo-server image, wired through the `kuroboros`
//! runtime's `Reconciler`/`ValidationWebhook`/`MutationWebhook` traits rather
//! than a bespoke `kube::runtime::Controller` loop.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{Container, ContainerPort, PodSpec, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::api::{Api, DeleteParams, ObjectMeta, Patch, PatchParams};
use kube::{Client, CustomResource};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use kuroboros::{Action, Error, ManagedResource, MutationWebhook, Reconciler, ValidationWebhook};

const FINALIZER: &str = "kuroboros.example.com/widget-protection";
const FIELD_MANAGER: &str = "kuroboros-demo-operator";

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[kube(
    group = "kuroboros.example.com",
    version = "v1",
    kind = "Widget",
    namespaced,
    status = "WidgetStatus",
    shortname = "wg"
)]
#[serde(rename_all = "camelCase")]
pub struct WidgetSpec {
    /// Desired replica count of the backing `Deployment`.
    pub replicas: i32,
    /// Message echoed by each replica; defaulted by the mutation webhook
    /// when absent.
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WidgetStatus {
    pub observed_replicas: Option<i32>,
}

/// Reconciles `Widget` CRs by driving a same-named `Deployment` toward
/// `spec.replicas`. Holds its own `Client` to reach the `Deployment` API,
/// distinct from the `Api<Widget>` carried by the `ManagedResource` the loop
/// hands it: a reconciler's API access is independent of the controller's.
pub struct WidgetReconciler {
    client: Client,
}

impl WidgetReconciler {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

impl Reconciler<Widget> for WidgetReconciler {
    fn reconcile_timeout(&self) -> Option<Duration> {
        Some(Duration::from_secs(30))
    }

    fn timeout_retry(&self) -> bool {
        true
    }

    fn timeout_requeue_time(&self) -> Duration {
        Duration::from_secs(60)
    }

    fn reconcile(
        &self,
        mut object: ManagedResource<Widget>,
        _stop: Arc<kuroboros::utils::StopSignal>,
    ) -> Pin<Box<dyn Future<Output = Result<Action, Error>> + Send + '_>> {
        Box::pin(async move {
            let (namespace, name) = object.namespace_name();
            let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), &namespace);

            if object.marked_for_deletion() {
                match deployments.delete(&name, &DeleteParams::default()).await {
                    Ok(_) => {}
                    Err(kube::Error::Api(resp)) if resp.code == 404 => {}
                    Err(e) => return Err(Error::from(e)),
                }
                object.remove_finalizer(FINALIZER).await?;
                return Ok(Action::Stop);
            }

            object.add_finalizer(FINALIZER).await?;

            let replicas = object.data().spec.replicas;
            let message = object
                .data()
                .spec
                .message
                .clone()
                .unwrap_or_else(|| "hello from kuroboros".to_string());
            let owner = object.owner_ref(true)?;
            let deployment = desired_deployment(&name, &namespace, replicas, &message, owner);
            deployments
                .patch(
                    &name,
                    &PatchParams::apply(FIELD_MANAGER).force(),
                    &Patch::Apply(&deployment),
                )
                .await
                .map_err(Error::from)?;

            object.data_mut()?.status = Some(WidgetStatus {
                observed_replicas: Some(replicas),
            });
            object.patch(true).await?;

            Ok(Action::requeue(Duration::from_secs(30)))
        })
    }
}

fn desired_deployment(
    name: &str,
    namespace: &str,
    replicas: i32,
    message: &str,
    owner: k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference,
) -> Deployment {
    let mut labels = BTreeMap::new();
    labels.insert("app".to_string(), name.to_string());

    Deployment {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels.clone()),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(replicas),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                match_expressions: None,
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: name.to_string(),
                        image: Some("inanimate/echo-server:latest".to_string()),
                        env: Some(vec![k8s_openapi::api::core::v1::EnvVar {
                            name: "ECHO_MESSAGE".to_string(),
                            value: Some(message.to_string()),
                            ..Default::default()
                        }]),
                        ports: Some(vec![ContainerPort {
                            container_port: 8080,
                            ..Default::default()
                        }]),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Rejects negative replica counts before they ever reach `reconcile`.
pub struct WidgetValidation;

impl ValidationWebhook<Widget> for WidgetValidation {
    fn on_create<'a>(
        &'a self,
        object: &'a ManagedResource<Widget>,
    ) -> Pin<Box<dyn Future<Output = Result<(), Error>> + Send + 'a>> {
        Box::pin(async move { validate_replicas(object.data().spec.replicas) })
    }

    fn on_update<'a>(
        &'a self,
        _old: &'a ManagedResource<Widget>,
        new: &'a ManagedResource<Widget>,
    ) -> Pin<Box<dyn Future<Output = Result<(), Error>> + Send + 'a>> {
        Box::pin(async move { validate_replicas(new.data().spec.replicas) })
    }
}

fn validate_replicas(replicas: i32) -> Result<(), Error> {
    if replicas < 0 {
        Err(Error::Validation("spec.replicas must be non-negative".into()))
    } else {
        Ok(())
    }
}

/// Defaults `spec.message` to a fixed greeting when the author left it unset.
pub struct WidgetMutation;

impl MutationWebhook<Widget> for WidgetMutation {
    fn on_create<'a>(
        &'a self,
        mut object: Widget,
    ) -> Pin<Box<dyn Future<Output = Result<Widget, Error>> + Send + 'a>> {
        Box::pin(async move {
            if object.spec.message.is_none() {
                object.spec.message = Some("hello from kuroboros".to_string());
            }
            Ok(object)
        })
    }
}
