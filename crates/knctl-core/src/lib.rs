//! knctl Core - Knative service model and pure client-side algorithms
//!
//! This crate holds everything that can be computed without talking to a
//! cluster:
//! - `resources`: typed `serving.knative.dev/v1` Service, Revision, Configuration and Route
//! - `editflags`: the accumulator turning sparse CLI flags into a service mutation
//! - `traffic`: the routing table resolver
//! - `canonical` / `merge`: last-applied serialization and three-way merge patches
//! - `export`: the portable export document

pub mod annotations;
pub mod canonical;
pub mod editflags;
pub mod error;
pub mod export;
pub mod keyvalue;
pub mod merge;
pub mod podspec;
pub mod quantity;
pub mod resources;
pub mod traffic;

pub use editflags::{EditFlags, EditMode, RevisionName, ServiceEdit, pin_image_to_digest};
pub use error::{CoreError, Result};
pub use export::Export;
pub use keyvalue::KeyValueUpdates;
pub use resources::{
    Condition, ConditionStatus, Conditioned, Configuration, Revision, Route, Service,
    TrafficTarget,
};
pub use traffic::{TrafficError, TrafficInstructions};
