//! Reconciler loop: one long-running task per managed CR instance.
//!
//! The user hook returns a plain `Result<Action, Error>` rather than
//! signalling retry/stop through exceptions, with `Error::Timeout` reserved
//! for the scheduler wrapper — user code can never construct it.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use kube::api::Api;
use tracing::Instrument;

use crate::error::Error;
use crate::gvi::GroupVersionInfo;
use crate::resource::{CrBound, ManagedResource};
use crate::utils::StopSignal;

/// What the user hook asks the loop to do next.
#[derive(Debug, Clone, Copy)]
pub enum Action {
    /// No more runs until an external event re-adds this CR as a member.
    Stop,
    /// Run again after `Duration`.
    RequeueAfter(Duration),
}

impl Action {
    pub fn requeue(d: Duration) -> Self {
        Action::RequeueAfter(d)
    }
}

/// User-supplied reconciliation logic for one CR kind.
///
/// `reconcile` receives a fresh, server-fetched view of the object on every
/// invocation (spec invariant: "the CR used by the user hook was fetched
/// from the server within that iteration") and a handle to the loop's stop
/// signal, usable for cooperative cancellation inside long-running hooks.
pub trait Reconciler<K: CrBound>: Send + Sync + 'static {
    /// `None` means no timeout (§8 boundary: a zero duration is also
    /// treated as "no timeout" by callers that configure this from a
    /// user-facing duration field).
    fn reconcile_timeout(&self) -> Option<Duration> {
        None
    }

    fn timeout_retry(&self) -> bool {
        false
    }

    fn timeout_requeue_time(&self) -> Duration {
        Duration::from_secs(300)
    }

    fn reconcile(
        &self,
        object: ManagedResource<K>,
        stop: Arc<StopSignal>,
    ) -> Pin<Box<dyn Future<Output = Result<Action, Error>> + Send + '_>>;
}

/// Handle returned to a controller for a running reconciler task: observes
/// liveness and carries the stop signal.
pub struct ReconcilerHandle {
    pub stop: Arc<StopSignal>,
    pub join: tokio::task::JoinHandle<()>,
}

impl ReconcilerHandle {
    pub fn is_alive(&self) -> bool {
        !self.join.is_finished()
    }

    pub fn signal_stop(&self) {
        self.stop.set();
    }
}

/// Spawns the per-object reconciliation loop.
/// `R: ?Sized` so a type-erased `Arc<dyn Reconciler<K>>` (as held by
/// `Controller<K>`) can be passed directly, with no extra indirection.
pub fn spawn<K: CrBound, R: Reconciler<K> + ?Sized>(
    reconciler: Arc<R>,
    api: Api<K>,
    gvi: GroupVersionInfo,
    namespace: String,
    name: String,
) -> ReconcilerHandle {
    let stop = Arc::new(StopSignal::new());
    let loop_stop = stop.clone();
    let join = tokio::spawn(async move {
        run_loop(reconciler, api, gvi, namespace, name, loop_stop).await;
    });
    ReconcilerHandle { stop, join }
}

async fn run_loop<K: CrBound, R: Reconciler<K> + ?Sized>(
    reconciler: Arc<R>,
    api: Api<K>,
    gvi: GroupVersionInfo,
    namespace: String,
    name: String,
    stop: Arc<StopSignal>,
) {
    let mut last_interval: Option<Duration> = None;

    loop {
        if stop.is_set() {
            break;
        }

        let latest = match api.get(&name).await {
            Ok(obj) => obj,
            Err(e) => {
                let err = Error::from(e);
                if err.is_not_found() {
                    tracing::info!(namespace = %namespace, name = %name, "object no longer found, ending reconcile loop");
                    break;
                }
                tracing::error!(namespace = %namespace, name = %name, error = %err, "api error fetching latest object");
                if let Some(interval) = last_interval {
                    stop.sleep(interval).await;
                    continue;
                }
                break;
            }
        };

        let resource_version = kube::ResourceExt::resource_version(&latest)
            .unwrap_or_default()
            .to_string();
        let span = tracing::info_span!(
            "reconcile",
            namespace = %namespace,
            name = %name,
            resource_version = %resource_version,
            version = %gvi.api_version,
        );

        let resource = ManagedResource::writable(latest, api.clone(), gvi.clone());
        let outcome = invoke(&reconciler, resource, stop.clone())
            .instrument(span)
            .await;

        match outcome {
            Ok(Action::RequeueAfter(d)) => {
                last_interval = Some(d);
                stop.sleep(d).await;
            }
            Ok(Action::Stop) => break,
            Err(Error::Retriable { backoff }) => {
                tracing::warn!(namespace = %namespace, name = %name, ?backoff, "retriable error");
                last_interval = Some(backoff);
                stop.sleep(backoff).await;
            }
            Err(Error::Unrecoverable(msg)) => {
                tracing::error!(namespace = %namespace, name = %name, fatal = true, %msg, "unrecoverable error, ending reconcile loop");
                break;
            }
            Err(e) if e.is_not_found() => {
                tracing::info!(namespace = %namespace, name = %name, "object vanished mid-reconcile");
                break;
            }
            Err(Error::Timeout) => {
                tracing::warn!(namespace = %namespace, name = %name, "reconcile timed out");
                if reconciler.timeout_retry() {
                    let d = reconciler.timeout_requeue_time();
                    last_interval = Some(d);
                    stop.sleep(d).await;
                } else {
                    break;
                }
            }
            Err(other) => {
                tracing::error!(namespace = %namespace, name = %name, error = %other, "unexpected error, retrying with previous interval");
                match last_interval {
                    Some(d) => stop.sleep(d).await,
                    None => break,
                }
            }
        }
    }
    tracing::info!(namespace = %namespace, name = %name, "reconcile loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    use http::{Request, Response};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use kube::client::Body;
    use kube::{Client, CustomResource};
    use schemars::JsonSchema;
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;
    use tower_test::mock;

    #[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
    #[kube(group = "example.com", version = "v1", kind = "Thing", namespaced)]
    #[serde(rename_all = "camelCase")]
    struct ThingSpec {
        size: i32,
    }

    fn thing() -> Thing {
        Thing {
            metadata: ObjectMeta {
                name: Some("x".into()),
                namespace: Some("default".into()),
                resource_version: Some("1".into()),
                ..Default::default()
            },
            spec: ThingSpec { size: 1 },
        }
    }

    /// Fails the first two reconciles with a retriable backoff, then stops
    /// — spec.md §8 scenario 4.
    struct RetriesTwiceThenStops {
        backoff: Duration,
        calls: Arc<AtomicUsize>,
    }

    impl Reconciler<Thing> for RetriesTwiceThenStops {
        fn reconcile(
            &self,
            _object: ManagedResource<Thing>,
            _stop: Arc<StopSignal>,
        ) -> Pin<Box<dyn Future<Output = Result<Action, Error>> + Send + '_>> {
            let calls = self.calls.clone();
            let backoff = self.backoff;
            Box::pin(async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(Error::Retriable { backoff })
                } else {
                    Ok(Action::Stop)
                }
            })
        }
    }

    /// Answers every `GET /apis/example.com/v1/namespaces/default/things/x`
    /// the loop issues with the same object, for as long as the test runs.
    async fn serve_gets_forever(mut handle: mock::Handle<Request<Body>, Response<Body>>) {
        loop {
            let Some((_, send)) = handle.next_request().await else {
                return;
            };
            let bytes = serde_json::to_vec(&thing()).unwrap();
            send.send_response(Response::builder().body(Body::from(bytes)).unwrap());
        }
    }

    #[tokio::test]
    async fn retriable_backoff_requeues_with_backoff_then_stops() {
        let (mock_service, handle) = mock::pair::<Request<Body>, Response<Body>>();
        let client = Client::new(mock_service, "default");
        let server = tokio::spawn(serve_gets_forever(handle));

        let api: Api<Thing> = Api::namespaced(client, "default");
        let gvi = GroupVersionInfo::new("example.com", "v1", "Thing").unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let reconciler = Arc::new(RetriesTwiceThenStops {
            backoff: Duration::from_millis(30),
            calls: calls.clone(),
        });

        let start = Instant::now();
        let handle = spawn(reconciler, api, gvi, "default".into(), "x".into());
        tokio::time::timeout(Duration::from_secs(5), handle.join)
            .await
            .expect("reconcile loop did not stop in time")
            .unwrap();

        // Three invocations (two retriable, one stopping), each of the two
        // retriable outcomes separated by at least `backoff`.
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(start.elapsed() >= Duration::from_millis(60));

        server.abort();
    }

    /// `reconcile_timeout = 0` is treated as "no timeout" — spec.md §8
    /// boundary behaviour.
    #[tokio::test]
    async fn zero_timeout_runs_inline_with_no_deadline() {
        struct Inline;
        impl Reconciler<Thing> for Inline {
            fn reconcile_timeout(&self) -> Option<Duration> {
                Some(Duration::from_secs(0))
            }

            fn reconcile(
                &self,
                _object: ManagedResource<Thing>,
                _stop: Arc<StopSignal>,
            ) -> Pin<Box<dyn Future<Output = Result<Action, Error>> + Send + '_>> {
                Box::pin(async move {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    Ok(Action::Stop)
                })
            }
        }

        let (mock_service, handle) = mock::pair::<Request<Body>, Response<Body>>();
        let client = Client::new(mock_service, "default");
        let server = tokio::spawn(serve_gets_forever(handle));
        let api: Api<Thing> = Api::namespaced(client, "default");
        let gvi = GroupVersionInfo::new("example.com", "v1", "Thing").unwrap();

        let reconciler = Arc::new(Inline);
        let resource = ManagedResource::writable(thing(), api.clone(), gvi.clone());
        let stop = Arc::new(StopSignal::new());
        let outcome = invoke(&reconciler, resource, stop).await;
        assert!(matches!(outcome, Ok(Action::Stop)));

        server.abort();
    }
}

/// Runs the user hook inline, or under a hard wall-clock cap via a
/// separately-spawned task that's aborted on overrun (cooperative
/// cancellation at the hook's next `.await` point).
async fn invoke<K: CrBound, R: Reconciler<K> + ?Sized>(
    reconciler: &Arc<R>,
    object: ManagedResource<K>,
    stop: Arc<StopSignal>,
) -> Result<Action, Error> {
    let timeout = reconciler.reconcile_timeout().filter(|d| !d.is_zero());
    match timeout {
        None => reconciler.reconcile(object, stop).await,
        Some(timeout) => {
            let reconciler = reconciler.clone();
            let mut handle = tokio::spawn(async move { reconciler.reconcile(object, stop).await });
            tokio::select! {
                res = &mut handle => match res {
                    Ok(outcome) => outcome,
                    Err(_join_err) => Err(Error::Unrecoverable("reconcile task panicked".into())),
                },
                _ = tokio::time::sleep(timeout) => {
                    handle.abort();
                    Err(Error::Timeout)
                }
            }
        }
    }
}
