//! Admission webhooks: validation/mutation hook traits and
//! `AdmissionReview` request/response plumbing.
//!
//! Dynamic per-operation dispatch becomes three named trait methods with
//! no-op defaults — a hook only overrides the operations it cares about.

use base64::Engine;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Status;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Error;
use crate::resource::{CrBound, ManagedResource};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operation {
    Create,
    Update,
    Delete,
    Connect,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AdmissionRequest {
    pub uid: String,
    pub operation: Operation,
    #[serde(default)]
    pub object: Option<Value>,
    #[serde(default, rename = "oldObject")]
    pub old_object: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AdmissionReviewRequest {
    pub request: AdmissionRequest,
}

#[derive(Debug, Clone, Serialize)]
pub struct AdmissionResponse {
    pub uid: String,
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<Status>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub patch: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "patchType")]
    pub patch_type: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AdmissionReviewResponse {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub kind: String,
    pub response: AdmissionResponse,
}

impl AdmissionReviewResponse {
    fn allow(uid: String) -> Self {
        Self::wrap(AdmissionResponse {
            uid,
            allowed: true,
            status: None,
            patch: None,
            patch_type: None,
        })
    }

    fn deny(uid: String, message: String) -> Self {
        Self::wrap(AdmissionResponse {
            uid,
            allowed: false,
            status: Some(Status {
                message: Some(message),
                ..Default::default()
            }),
            patch: None,
            patch_type: None,
        })
    }

    fn wrap(response: AdmissionResponse) -> Self {
        Self {
            api_version: "admission.k8s.io/v1".to_string(),
            kind: "AdmissionReview".to_string(),
            response,
        }
    }
}

/// Rejects or allows an operation on a CR. All three hooks default to a
/// no-op allow; a hook overrides only the operations it cares about and
/// signals rejection with `Error::Validation`.
pub trait ValidationWebhook<K: CrBound>: Send + Sync + 'static {
    fn on_create<'a>(
        &'a self,
        object: &'a ManagedResource<K>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), Error>> + Send + 'a>> {
        let _ = object;
        Box::pin(async { Ok(()) })
    }

    fn on_update<'a>(
        &'a self,
        old: &'a ManagedResource<K>,
        new: &'a ManagedResource<K>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), Error>> + Send + 'a>> {
        let _ = (old, new);
        Box::pin(async { Ok(()) })
    }

    fn on_delete<'a>(
        &'a self,
        object: &'a ManagedResource<K>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), Error>> + Send + 'a>> {
        let _ = object;
        Box::pin(async { Ok(()) })
    }
}

/// Rewrites a CR before it's persisted. All three hooks default to
/// returning the object unchanged.
pub trait MutationWebhook<K: CrBound>: Send + Sync + 'static {
    fn on_create<'a>(
        &'a self,
        object: K,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<K, Error>> + Send + 'a>>
    where
        K: 'a,
    {
        Box::pin(async move { Ok(object) })
    }

    fn on_update<'a>(
        &'a self,
        old: K,
        new: K,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<K, Error>> + Send + 'a>>
    where
        K: 'a,
    {
        let _ = old;
        Box::pin(async move { Ok(new) })
    }

    fn on_delete<'a>(
        &'a self,
        object: K,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<K, Error>> + Send + 'a>>
    where
        K: 'a,
    {
        Box::pin(async move { Ok(object) })
    }
}

fn parse_object<K: CrBound>(value: Option<&Value>) -> Result<K, Error> {
    let value = value.ok_or_else(|| Error::RequestShape("admission request has no object".into()))?;
    serde_json::from_value(value.clone())
        .map_err(|e| Error::RequestShape(format!("object does not match CR schema: {e}")))
}

/// What a webhook invocation produced, at the HTTP layer: every variant is
/// a well-formed `AdmissionReview` echoing the request's `uid` with
/// `allowed` set accordingly; a shaped response is always HTTP 200
/// regardless of `allowed`, a malformed request is HTTP 400, anything else
/// is HTTP 500.
pub enum WebhookOutcome {
    Review(AdmissionReviewResponse),
    BadRequest(AdmissionReviewResponse),
    InternalError(AdmissionReviewResponse),
}

impl WebhookOutcome {
    pub fn status(&self) -> u16 {
        match self {
            WebhookOutcome::Review(_) => 200,
            WebhookOutcome::BadRequest(_) => 400,
            WebhookOutcome::InternalError(_) => 500,
        }
    }

    fn from_error(uid: String, e: Error) -> Self {
        match e {
            Error::RequestShape(msg) => {
                WebhookOutcome::BadRequest(AdmissionReviewResponse::deny(uid, msg))
            }
            Error::Validation(_) | Error::Mutation(_) => {
                WebhookOutcome::Review(AdmissionReviewResponse::deny(uid, e.to_string()))
            }
            other => {
                tracing::error!(error = %other, "internal error handling admission review");
                WebhookOutcome::InternalError(AdmissionReviewResponse::deny(
                    uid,
                    "internal error processing admission review".to_string(),
                ))
            }
        }
    }
}

/// Dispatches one `AdmissionReview` request through a validation hook and
/// builds the HTTP-ready allow/deny response.
pub async fn handle_validation<K: CrBound>(
    hook: &dyn ValidationWebhook<K>,
    review: AdmissionReviewRequest,
) -> WebhookOutcome {
    let req = review.request;
    let uid = req.uid.clone();

    let outcome: Result<(), Error> = (|| async {
        match req.operation {
            Operation::Create => {
                if req.old_object.is_some() {
                    return Err(Error::RequestShape(
                        "admission request for CREATE must not carry oldObject".into(),
                    ));
                }
                let object: K = parse_object(req.object.as_ref())?;
                hook.on_create(&ManagedResource::read_only(object)).await
            }
            Operation::Update => {
                let old: K = parse_object(req.old_object.as_ref())?;
                let new: K = parse_object(req.object.as_ref())?;
                hook.on_update(
                    &ManagedResource::read_only(old),
                    &ManagedResource::read_only(new),
                )
                .await
            }
            Operation::Delete => {
                if req.object.is_some() {
                    return Err(Error::RequestShape(
                        "admission request for DELETE must not carry object".into(),
                    ));
                }
                let object: K = parse_object(req.old_object.as_ref())?;
                hook.on_delete(&ManagedResource::read_only(object)).await
            }
            Operation::Connect => Ok(()),
        }
    })()
    .await;

    match outcome {
        Ok(()) => WebhookOutcome::Review(AdmissionReviewResponse::allow(uid)),
        Err(e) => WebhookOutcome::from_error(uid, e),
    }
}

/// Dispatches one `AdmissionReview` request through a mutation hook,
/// diffing the hook's output against the original object to produce a
/// base64-encoded RFC 6902 JSON Patch.
pub async fn handle_mutation<K: CrBound>(
    hook: &dyn MutationWebhook<K>,
    review: AdmissionReviewRequest,
) -> WebhookOutcome {
    let req = review.request;
    let uid = req.uid.clone();

    let outcome: Result<Option<(Value, Value)>, Error> = (|| async {
        match req.operation {
            Operation::Create => {
                if req.old_object.is_some() {
                    return Err(Error::RequestShape(
                        "admission request for CREATE must not carry oldObject".into(),
                    ));
                }
                let original = req
                    .object
                    .clone()
                    .ok_or_else(|| Error::RequestShape("admission request has no object".into()))?;
                let object: K = parse_object(req.object.as_ref())?;
                let mutated = hook.on_create(object).await?;
                Ok(Some((original, serde_json::to_value(mutated)?)))
            }
            Operation::Update => {
                let original = req
                    .object
                    .clone()
                    .ok_or_else(|| Error::RequestShape("admission request has no object".into()))?;
                let old: K = parse_object(req.old_object.as_ref())?;
                let new: K = parse_object(req.object.as_ref())?;
                let mutated = hook.on_update(old, new).await?;
                Ok(Some((original, serde_json::to_value(mutated)?)))
            }
            Operation::Delete => {
                if req.object.is_some() {
                    return Err(Error::RequestShape(
                        "admission request for DELETE must not carry object".into(),
                    ));
                }
                let object: K = parse_object(req.old_object.as_ref())?;
                hook.on_delete(object).await?;
                Ok(None)
            }
            Operation::Connect => Ok(None),
        }
    })()
    .await;

    match outcome {
        Ok(Some((original, mutated))) => match json_patch::diff(&original, &mutated) {
            diff if diff.0.is_empty() => WebhookOutcome::Review(AdmissionReviewResponse::allow(uid)),
            diff => {
                let patch_json = match serde_json::to_vec(&diff) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        tracing::error!(error = %e, "internal error encoding JSON patch");
                        return WebhookOutcome::InternalError(AdmissionReviewResponse::deny(
                            uid,
                            "internal error processing admission review".to_string(),
                        ));
                    }
                };
                let encoded = base64::engine::general_purpose::STANDARD.encode(patch_json);
                WebhookOutcome::Review(AdmissionReviewResponse::wrap(AdmissionResponse {
                    uid,
                    allowed: true,
                    status: None,
                    patch: Some(encoded),
                    patch_type: Some("JSONPatch".to_string()),
                }))
            }
        },
        Ok(None) => WebhookOutcome::Review(AdmissionReviewResponse::allow(uid)),
        Err(e) => WebhookOutcome::from_error(uid, e),
    }
}

/// Type-erased endpoint so the webhook server can route by URL path
/// without knowing each controller's `K`. `Controller::new` wraps its
/// validation/mutation hooks behind this before registration.
pub trait WebhookEndpoint: Send + Sync {
    fn handle<'a>(
        &'a self,
        body: Value,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = (u16, Value)> + Send + 'a>>;
}

/// Best-effort `uid` extraction from a request body that failed to parse
/// into an `AdmissionReviewRequest` at all — still lets the 400 response
/// echo the caller's uid when the body was at least valid JSON shaped
/// roughly right.
fn salvage_uid(body: &Value) -> String {
    body.get("request")
        .and_then(|r| r.get("uid"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn outcome_to_response(outcome: WebhookOutcome) -> (u16, Value) {
    let status = outcome.status();
    let response = match outcome {
        WebhookOutcome::Review(r) | WebhookOutcome::BadRequest(r) | WebhookOutcome::InternalError(r) => r,
    };
    (status, serde_json::to_value(response).unwrap_or_default())
}

pub(crate) struct ValidationEndpoint<K: CrBound> {
    pub hook: std::sync::Arc<dyn ValidationWebhook<K>>,
}

impl<K: CrBound> WebhookEndpoint for ValidationEndpoint<K> {
    fn handle<'a>(
        &'a self,
        body: Value,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = (u16, Value)> + Send + 'a>> {
        Box::pin(async move {
            let uid = salvage_uid(&body);
            let review: AdmissionReviewRequest = match serde_json::from_value(body) {
                Ok(r) => r,
                Err(e) => {
                    return outcome_to_response(WebhookOutcome::BadRequest(
                        AdmissionReviewResponse::deny(uid, format!("malformed AdmissionReview: {e}")),
                    ));
                }
            };
            outcome_to_response(handle_validation(self.hook.as_ref(), review).await)
        })
    }
}

pub(crate) struct MutationEndpoint<K: CrBound> {
    pub hook: std::sync::Arc<dyn MutationWebhook<K>>,
}

impl<K: CrBound> WebhookEndpoint for MutationEndpoint<K> {
    fn handle<'a>(
        &'a self,
        body: Value,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = (u16, Value)> + Send + 'a>> {
        Box::pin(async move {
            let uid = salvage_uid(&body);
            let review: AdmissionReviewRequest = match serde_json::from_value(body) {
                Ok(r) => r,
                Err(e) => {
                    return outcome_to_response(WebhookOutcome::BadRequest(
                        AdmissionReviewResponse::deny(uid, format!("malformed AdmissionReview: {e}")),
                    ));
                }
            };
            outcome_to_response(handle_mutation(self.hook.as_ref(), review).await)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use kube::CustomResource;
    use schemars::JsonSchema;

    #[derive(
        CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq,
    )]
    #[kube(group = "example.com", version = "v1", kind = "Widget", namespaced)]
    #[serde(rename_all = "camelCase")]
    struct WidgetSpec {
        size: i32,
    }

    struct RejectsNegativeSize;
    impl ValidationWebhook<Widget> for RejectsNegativeSize {
        fn on_create<'a>(
            &'a self,
            object: &'a ManagedResource<Widget>,
        ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), Error>> + Send + 'a>>
        {
            let size = object.data().spec.size;
            Box::pin(async move {
                if size < 0 {
                    Err(Error::Validation("size must be non-negative".into()))
                } else {
                    Ok(())
                }
            })
        }
    }

    struct DoublesSize;
    impl MutationWebhook<Widget> for DoublesSize {
        fn on_create<'a>(
            &'a self,
            mut object: Widget,
        ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<Widget, Error>> + Send + 'a>>
        {
            Box::pin(async move {
                object.spec.size *= 2;
                Ok(object)
            })
        }
    }

    fn sample_request(size: i32) -> AdmissionReviewRequest {
        let widget = Widget {
            metadata: ObjectMeta {
                name: Some("demo".into()),
                namespace: Some("default".into()),
                ..Default::default()
            },
            spec: WidgetSpec { size },
        };
        AdmissionReviewRequest {
            request: AdmissionRequest {
                uid: "abc-123".into(),
                operation: Operation::Create,
                object: Some(serde_json::to_value(widget).unwrap()),
                old_object: None,
            },
        }
    }

    fn expect_review(outcome: WebhookOutcome) -> AdmissionReviewResponse {
        match outcome {
            WebhookOutcome::Review(r) => r,
            WebhookOutcome::BadRequest(r) => panic!("expected a review response, got 400: {:?}", r.response),
            WebhookOutcome::InternalError(r) => panic!("expected a review response, got 500: {:?}", r.response),
        }
    }

    #[tokio::test]
    async fn validation_allows_non_negative_size() {
        let resp = expect_review(handle_validation(&RejectsNegativeSize, sample_request(5)).await);
        assert!(resp.response.allowed);
    }

    #[tokio::test]
    async fn validation_denies_negative_size() {
        let resp = expect_review(handle_validation(&RejectsNegativeSize, sample_request(-1)).await);
        assert!(!resp.response.allowed);
        assert!(resp.response.status.is_some());
    }

    #[tokio::test]
    async fn validation_rejects_malformed_object_with_bad_request() {
        let mut req = sample_request(5);
        req.request.object = None;
        let outcome = handle_validation(&RejectsNegativeSize, req).await;
        assert_eq!(outcome.status(), 400);
        match outcome {
            WebhookOutcome::BadRequest(r) => {
                assert_eq!(r.response.uid, "abc-123");
                assert!(!r.response.allowed);
                assert!(r.response.status.is_some());
            }
            _ => panic!("expected a bad-request response"),
        }
    }

    #[tokio::test]
    async fn validation_rejects_create_carrying_old_object() {
        let mut req = sample_request(5);
        req.request.old_object = req.request.object.clone();
        let outcome = handle_validation(&RejectsNegativeSize, req).await;
        assert_eq!(outcome.status(), 400);
    }

    #[tokio::test]
    async fn validation_rejects_delete_carrying_object() {
        let mut req = sample_request(5);
        req.request.operation = Operation::Delete;
        req.request.old_object = req.request.object.clone();
        let outcome = handle_validation(&RejectsNegativeSize, req).await;
        assert_eq!(outcome.status(), 400);
    }

    #[tokio::test]
    async fn mutation_produces_json_patch() {
        let resp = expect_review(handle_mutation(&DoublesSize, sample_request(5)).await);
        assert!(resp.response.allowed);
        assert_eq!(resp.response.patch_type.as_deref(), Some("JSONPatch"));
        assert!(resp.response.patch.is_some());
    }

    #[tokio::test]
    async fn mutation_is_noop_when_unchanged() {
        struct Identity;
        impl MutationWebhook<Widget> for Identity {}
        let resp = expect_review(handle_mutation(&Identity, sample_request(5)).await);
        assert!(resp.response.allowed);
        assert!(resp.response.patch.is_none());
    }
}
