//! Carry strategy
//!
//! - `risk` - rate annualization and liquidation distance
//! - `tracker` - derives hedge positions from the account stream
//! - `projection` - expected return before and after entry
//! - `workflow` - the five-step entry sequence

pub mod projection;
pub mod risk;
pub mod tracker;
pub mod workflow;

pub use projection::{fetch_inputs, global_return, project, Projection, ProjectionInputs};
pub use tracker::{AssetContextCache, PositionTracker};
pub use workflow::{
    should_execute, ExecutionReport, ExecutionStep, ExecutionWorkflow, RetryPolicy,
    WorkflowParams,
};
