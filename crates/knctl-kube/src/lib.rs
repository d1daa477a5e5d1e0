//! knctl Kube - serving backends and service lifecycle for knctl
//!
//! This crate provides:
//! - **Gateways**: one trait over the Knative serving API, a GitOps file tree and an in-memory mock
//! - **Readiness Waiting**: watch-driven waits with an error window for transient failures
//! - **Polling Fallback**: watch-like event streams built from periodic reads
//! - **Apply**: three-way merge patches driven by the last-applied annotation
//! - **Lifecycle**: create, update, apply, delete, export, import and migrate of services
//! - **Progress Reporting**: per-operation feedback while waiting

pub mod actions;
pub mod apply;
pub mod error;
pub mod gateway;
pub mod manager;
pub mod poll;
pub mod progress;
pub mod wait;

pub use actions::{
    ApplyOptions, CreateOptions, DeleteOptions, ImportOptions, MigrateOptions, UpdateOptions,
};
pub use apply::{ApplyOutcome, apply_service, compute_patch};
pub use error::{KubeError, Result};
pub use gateway::{
    ClusterGateway, EventStream, GitOpsGateway, ListFilter, MockGateway, PatchStrategy,
    ScriptedError, ServingGateway, WatchEvent, connect_client,
};
pub use manager::{MigrateSummary, RevisionSummary, ServiceDescription, ServiceManager};
pub use poll::PollingWatcher;
pub use progress::ProgressReporter;
pub use wait::{MessageCallback, WaitConfig, WaitOutcome};
