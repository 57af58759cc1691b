// Service lifecycle supervision for Switchyard

pub mod config;
pub mod echo;
pub mod error;
pub mod listener;
pub mod supervisor;

pub use config::{Protocol, ServiceConfig};
pub use error::{LifecycleError, ListenerError};
pub use listener::{HttpListener, Listener};
pub use supervisor::{
    ExitReason, LifecycleReport, LifecycleSupervisor, Phase, ShutdownCause, Signal,
    SupervisorHandle,
};
