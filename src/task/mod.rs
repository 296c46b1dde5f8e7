pub mod executor;
pub mod resources;

pub use executor::{
    Engine, ExecutionConfig, ExecutionReport, ExecutionRequest, NodeOutcome, RetryStrategy,
    TraversalDetails,
};
pub use resources::TaskResources;
