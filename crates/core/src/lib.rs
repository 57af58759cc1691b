// Core types and pipeline composition for Switchyard

pub mod composer;
pub mod dispatch;
pub mod error;
pub mod graph;
pub mod pipeline;
pub mod types;

pub use composer::ServiceComposer;
pub use dispatch::{Dispatcher, HttpDispatcher};
pub use error::{ComposeError, ComposeResult, DispatchError, GraphError};
pub use graph::ServiceGraph;
pub use pipeline::{PipelineError, PipelineSpec};
pub use types::*;
