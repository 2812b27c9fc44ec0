//! A Kubernetes operator for `Gateway` custom resources. For every gateway, the operator
//! maintains a deployment, a service, and (when the gateway asks to be exposed) an ingress, and it
//! keeps `status.deployedImage` of the gateway in line with the image that's actually deployed.
//!
//! The core of the operator is the `reconcile::Reconciler`, which runs a single reconciliation
//! pass for one gateway against a `store::Store`. Everything around it lives in `runner`: the
//! api server client, the watches that turn cluster events into reconcile requests, and the work
//! queue and workers that dispatch those requests.
//!
//! Running the operator with the default configuration:
//! ```no_run
//! use gateway_operator::prelude::*;
//!
//! let operator_config = OperatorConfig::from_env().expect("invalid configuration");
//! let client_config = ClientConfig::load(operator_config.operator_name.as_str())
//!     .expect("failed to load client configuration");
//!
//! // blocks the current thread until the operator stops
//! if let Err(err) = run_operator(operator_config, client_config) {
//!     eprintln!("operator stopped: {}", err);
//! }
//! ```
//!
//! The children of a gateway are computed by a `ResourceFactory` and written by a
//! `ConvergenceDelegate`. Both can be swapped out by building the `Reconciler` directly.

#[macro_use]
extern crate serde_derive;

pub mod config;
pub mod error;
pub mod gateway;
pub mod k8s_types;
pub mod label_selector;
pub mod reconcile;
pub mod resource;
pub mod runner;
pub mod store;

pub use serde_json;

pub mod prelude {
    pub use crate::config::{BackoffConfig, ClientConfig, OperatorConfig};
    pub use crate::error::Error;
    pub use crate::gateway::factory::{DefaultGatewayFactory, ResourceFactory};
    pub use crate::gateway::{Gateway, GATEWAY};
    pub use crate::k8s_types::{self, K8sType};
    pub use crate::label_selector::LabelSelector;
    pub use crate::reconcile::{
        ChildApplier, ConvergenceDelegate, ReconcileRequest, ReconcileResult, Reconciler,
    };
    pub use crate::resource::{K8sResource, ObjectId, ObjectIdRef};
    pub use crate::runner::run_operator;
    pub use crate::store::{Store, StoreError};
}
