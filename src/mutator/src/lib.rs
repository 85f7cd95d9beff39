//! Guarded schema-level mutations on MySQL fleets.
//!
//! Permanent database rename and truncate/drop of database contents, run
//! per instance through stage databases so that nothing is dropped before
//! its contents provably exist elsewhere.

pub mod driver;
pub mod error;
pub mod in_use;
pub mod mover;
pub mod stage;
pub mod target;
pub mod verify;

pub use driver::{
    DriverContext, InstanceReport, PipelineState, PreDropParams, RenameParams, RenameRequest,
    RoutingTierParams, RunReport, ShardMap, TruncateMode, TruncateParams,
};
pub use error::{MutationError, Result};
pub use target::{Target, TargetFilter};
