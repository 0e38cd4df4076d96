//! `kuroboros` is a small async framework for writing Kubernetes operators:
//! a `GroupVersionInfo`-aware custom resource wrapper, a per-object
//! reconciler loop, a per-kind controller that owns a watch stream and a
//! pending-removal cleanup loop, admission webhook plumbing with an
//! in-process TLS server, and an operator supervisor tying it all together
//! with leader election, metrics and graceful shutdown.
//!
//! See `DESIGN.md` for the rationale behind each module's design.

pub mod config;
pub mod controller;
pub mod error;
pub mod gvi;
pub mod metrics;
pub mod metrics_server;
pub mod operator;
pub mod reconciler;
pub mod resource;
pub mod telemetry;
pub mod utils;
pub mod webhook;
pub mod webhook_server;

pub use config::OperatorConfig;
pub use controller::Controller;
pub use error::{Error, Result};
pub use gvi::{GroupVersionInfo, GroupVersionInfoBuilder, Scope, Stability};
pub use metrics::OperatorMetrics;
pub use operator::{ControllerConfig, ControllerConfigVersion, Operator, OperatorContext};
pub use reconciler::{Action, Reconciler, ReconcilerHandle};
pub use resource::{CrBound, ManagedResource};
pub use webhook::{MutationWebhook, ValidationWebhook, WebhookEndpoint};
