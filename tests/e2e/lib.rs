#[cfg(all(test, feature = "e2e-tests"))]
mod test {
    use std::time::Duration;

    use demo_operator::widget::{Widget, WidgetSpec};
    use k8s_openapi::api::apps::v1::Deployment;
    use kube::api::{Api, Patch, PatchParams, PostParams};
    use kube::client::Client;
    use kube::runtime::wait::{await_condition, conditions, Condition};
    use kube::ResourceExt;
    use serde_json::json;
    use tokio::time::timeout;

    fn is_widget_observed(replicas: i32) -> impl Condition<Widget> {
        move |obj: Option<&Widget>| {
            obj.and_then(|w| w.status.as_ref())
                .and_then(|s| s.observed_replicas)
                .map(|observed| observed == replicas)
                .unwrap_or(false)
        }
    }

    fn is_widget_not_observed(replicas: i32) -> impl Condition<Widget> {
        move |obj: Option<&Widget>| {
            obj.and_then(|w| w.status.as_ref())
                .and_then(|s| s.observed_replicas)
                .map(|observed| observed != replicas)
                .unwrap_or(true)
        }
    }

    fn is_deployment_ready() -> impl Condition<Deployment> {
        |obj: Option<&Deployment>| {
            if let Some(deployment) = &obj {
                if let Some(status) = &deployment.status {
                    return status.replicas == status.updated_replicas
                        && status.replicas == status.ready_replicas;
                }
            }
            false
        }
    }

    async fn wait_for<R, C>(api: Api<R>, name: &str, condition: C)
    where
        R: kube::Resource
            + Clone
            + std::fmt::Debug
            + for<'de> k8s_openapi::serde::Deserialize<'de>
            + 'static
            + Send,
        C: Condition<R>,
    {
        timeout(
            Duration::from_secs(20),
            await_condition(api, name, condition),
        )
        .await
        .unwrap()
        .unwrap();
    }

    async fn setup(name: &str, replicas: i32) -> (Api<Widget>, Api<Deployment>) {
        let widget = Widget::new(
            name,
            WidgetSpec {
                replicas,
                message: None,
            },
        );

        let client = Client::try_default().await.unwrap();
        let widget_api = Api::<Widget>::namespaced(client.clone(), "default");

        widget_api
            .create(&PostParams::default(), &widget)
            .await
            .unwrap();

        let deployment_api = Api::<Deployment>::namespaced(client.clone(), "default");
        wait_for(deployment_api.clone(), name, is_deployment_ready()).await;
        wait_for(widget_api.clone(), name, is_widget_observed(replicas)).await;
        (widget_api, deployment_api)
    }

    #[tokio::test]
    async fn widget_create() {
        let name = "test-create";
        setup(name, 1).await;
    }

    #[tokio::test]
    async fn widget_delete_removes_deployment() {
        let name = "test-delete-widget";
        let (widget_api, deployment_api) = setup(name, 1).await;

        let deploy = deployment_api.get(name).await.unwrap();
        let widget = widget_api.get(name).await.unwrap();
        widget_api.delete(name, &Default::default()).await.unwrap();

        wait_for(
            widget_api.clone(),
            name,
            conditions::is_deleted(&widget.uid().unwrap()),
        )
        .await;

        wait_for(
            deployment_api.clone(),
            name,
            conditions::is_deleted(&deploy.uid().unwrap()),
        )
        .await;
    }

    #[tokio::test]
    async fn widget_deployment_survives_direct_edit() {
        let name = "test-change-deployment";
        let (widget_api, deployment_api) = setup(name, 1).await;

        let mut deploy = deployment_api.get(name).await.unwrap();
        deploy.spec.as_mut().unwrap().replicas = Some(5);
        deploy.metadata.managed_fields = None;
        deployment_api
            .patch(
                name,
                &PatchParams::apply("e2e-tests").force(),
                &Patch::Apply(&deploy),
            )
            .await
            .unwrap();

        // The reconciler's next requeue re-applies spec.replicas over the
        // direct edit; since field ownership goes through server-side
        // apply, the operator's value wins back.
        wait_for(widget_api.clone(), name, is_widget_not_observed(5)).await;

        let check_deploy_replicas = deployment_api.get(name).await.unwrap();
        assert_eq!(check_deploy_replicas.spec.unwrap().replicas.unwrap(), 1);
    }

    #[tokio::test]
    async fn widget_change_replicas() {
        let name = "test-change-widget";
        let (widget_api, deployment_api) = setup(name, 1).await;

        let mut widget = widget_api.get(name).await.unwrap();
        widget.spec.replicas = 3;
        widget.metadata.managed_fields = None;
        widget_api
            .patch(
                name,
                &PatchParams::apply("e2e-tests").force(),
                &Patch::Apply(&widget),
            )
            .await
            .unwrap();

        wait_for(widget_api.clone(), name, is_widget_observed(3)).await;
        wait_for(deployment_api.clone(), name, is_deployment_ready()).await;

        let check_deploy_replicas = deployment_api.get(name).await.unwrap();
        assert_eq!(check_deploy_replicas.spec.unwrap().replicas.unwrap(), 3);
    }

    #[tokio::test]
    async fn widget_deployment_already_exists() {
        let name = "test-deployment-already-exists";
        let deployment = json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {
                "name": name
            },
            "spec": {
                "replicas": 1,
                "selector": {
                    "matchLabels": {
                        "app": name
                    }
                },
                "template": {
                    "metadata": {
                        "labels": {
                            "app": name
                        }
                    },
                    "spec": {
                        "containers": [
                            {
                                "name": name,
                                "image": "inanimate/echo-server:latest"
                            }
                        ]
                    }
                }
            }
        });
        let deployment_api =
            Api::<Deployment>::namespaced(Client::try_default().await.unwrap(), "default");
        deployment_api
            .create(
                &PostParams::default(),
                &serde_json::from_value(deployment).unwrap(),
            )
            .await
            .unwrap();

        setup(name, 1).await;
    }
}
