//! Error types for graph construction, composition and dispatch.

use crate::types::NodeId;

/// Errors raised while building or ordering a service graph.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    /// An edge or query referenced a node that was never added.
    #[error("Unknown node: {0}")]
    UnknownNode(NodeId),

    /// Topological ordering could not place every node.
    #[error("Cycle detected among nodes: {}", format_nodes(.nodes))]
    CycleDetected { nodes: Vec<NodeId> },
}

fn format_nodes(nodes: &[NodeId]) -> String {
    nodes
        .iter()
        .map(NodeId::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Errors raised while dispatching a payload to a service endpoint.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// Transport-level failure (connect, timeout, body read).
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The service answered with a non-success status.
    #[error("Service returned status {status}: {body}")]
    Status { status: u16, body: String },

    /// The response body was not a JSON object.
    #[error("Malformed response body: {0}")]
    MalformedBody(String),

    /// The endpoint could not be turned into a request URL.
    #[error("Invalid endpoint URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

/// Errors raised by the service composer.
#[derive(Debug, thiserror::Error)]
pub enum ComposeError {
    #[error("Service {0} is already registered")]
    DuplicateService(NodeId),

    #[error(transparent)]
    Graph(#[from] GraphError),

    /// A graph node has no descriptor in the registry.
    #[error("No service registered for node {0}")]
    UnregisteredService(NodeId),

    /// Dispatch to a node failed; the run was aborted at this node.
    #[error("Dispatch to {node} failed: {source}")]
    Dispatch {
        node: NodeId,
        #[source]
        source: DispatchError,
    },
}

impl ComposeError {
    /// Node whose dispatch aborted the run, if this is a dispatch failure.
    pub fn failed_node(&self) -> Option<&NodeId> {
        match self {
            Self::Dispatch { node, .. } => Some(node),
            _ => None,
        }
    }
}

pub type ComposeResult<T> = Result<T, ComposeError>;
