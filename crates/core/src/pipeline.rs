//! Declarative pipeline definitions loaded from TOML.
//!
//! ```toml
//! name = "summarize-and-translate"
//!
//! [[services]]
//! id = "summarize"
//! url = "http://localhost:8001/summarize"
//!
//! [[services]]
//! id = "translate"
//! url = "http://localhost:8002/translate"
//!
//! [[edges]]
//! from = "summarize"
//! to = "translate"
//! ```

use crate::composer::ServiceComposer;
use crate::dispatch::{Dispatcher, HttpDispatcher};
use crate::error::{ComposeError, DispatchError};
use crate::types::{Endpoint, NodeId, ServiceDescriptor};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Failed to read pipeline file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse pipeline definition: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Service {id} has an invalid url {url:?}: {source}")]
    InvalidUrl {
        id: NodeId,
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("Edge {from} -> {to} references an unknown service")]
    UnknownEdge { from: NodeId, to: NodeId },

    #[error(transparent)]
    Compose(#[from] ComposeError),

    #[error("Failed to create HTTP dispatcher: {0}")]
    Dispatch(#[from] DispatchError),
}

/// A service entry in a pipeline file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceEntry {
    pub id: NodeId,
    pub url: String,
}

/// A data dependency between two services
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeEntry {
    pub from: NodeId,
    pub to: NodeId,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineSpec {
    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub services: Vec<ServiceEntry>,

    #[serde(default)]
    pub edges: Vec<EdgeEntry>,
}

impl PipelineSpec {
    pub fn from_toml_str(content: &str) -> Result<Self, PipelineError> {
        Ok(toml::from_str(content)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, PipelineError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| PipelineError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Build a composer that dispatches over HTTP
    pub fn into_composer(self) -> Result<ServiceComposer<HttpDispatcher>, PipelineError> {
        self.into_composer_with(HttpDispatcher::new()?)
    }

    /// Register every service in declaration order, then connect every edge.
    ///
    /// An edge naming an undeclared service is rejected here rather than
    /// skipped the way `ServiceComposer::connect` would.
    pub fn into_composer_with<D: Dispatcher>(
        self,
        dispatcher: D,
    ) -> Result<ServiceComposer<D>, PipelineError> {
        let mut composer = ServiceComposer::with_dispatcher(dispatcher);

        for entry in self.services {
            let endpoint =
                Endpoint::parse(&entry.url).map_err(|source| PipelineError::InvalidUrl {
                    id: entry.id.clone(),
                    url: entry.url.clone(),
                    source,
                })?;
            composer.register(ServiceDescriptor::new(entry.id, endpoint))?;
        }

        for edge in self.edges {
            if !composer.connect(&edge.from, &edge.to) {
                return Err(PipelineError::UnknownEdge {
                    from: edge.from,
                    to: edge.to,
                });
            }
        }

        if let Some(name) = &self.name {
            tracing::info!("Loaded pipeline {} with {} services", name, composer.len());
        }

        Ok(composer)
    }
}
