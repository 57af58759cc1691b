use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

/// JSON object exchanged between pipeline nodes
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// Unique identifier for a pipeline run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a service node in the graph
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for NodeId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Network address a service can be reached at
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    #[serde(default = "default_scheme")]
    pub scheme: String,
    pub host: String,
    pub port: u16,
    #[serde(default = "default_path")]
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
}

fn default_scheme() -> String {
    "http".to_string()
}

fn default_path() -> String {
    "/".to_string()
}

impl Endpoint {
    /// Plain HTTP endpoint at the root path
    pub fn http(host: impl Into<String>, port: u16) -> Self {
        Self {
            scheme: default_scheme(),
            host: host.into(),
            port,
            path: default_path(),
            query: None,
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        let path = path.into();
        self.path = if path.starts_with('/') {
            path
        } else {
            format!("/{}", path)
        };
        self
    }

    /// Parse an endpoint from a URL such as `http://localhost:8001/summarize?model=small`.
    ///
    /// Fragments are never sent on the wire and are dropped.
    pub fn parse(raw: &str) -> Result<Self, url::ParseError> {
        let url = Url::parse(raw)?;
        let host = url
            .host_str()
            .ok_or(url::ParseError::EmptyHost)?
            .to_string();
        let port = url
            .port_or_known_default()
            .ok_or(url::ParseError::InvalidPort)?;

        Ok(Self {
            scheme: url.scheme().to_string(),
            host,
            port,
            path: url.path().to_string(),
            query: url.query().map(str::to_string),
        })
    }

    /// Full request URL for this endpoint
    pub fn url(&self) -> Result<Url, url::ParseError> {
        Url::parse(&self.to_string())
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}:{}{}", self.scheme, self.host, self.port, self.path)?;
        if let Some(query) = &self.query {
            write!(f, "?{}", query)?;
        }
        Ok(())
    }
}

/// Binds a node identifier to the endpoint serving it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    pub id: NodeId,
    pub endpoint: Endpoint,
}

impl ServiceDescriptor {
    pub fn new(id: impl Into<NodeId>, endpoint: Endpoint) -> Self {
        Self {
            id: id.into(),
            endpoint,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_display() {
        let endpoint = Endpoint::http("localhost", 8001).with_path("summarize");
        assert_eq!(endpoint.to_string(), "http://localhost:8001/summarize");
    }

    #[test]
    fn test_endpoint_parse() {
        let endpoint = Endpoint::parse("http://127.0.0.1:9000/translate").unwrap();
        assert_eq!(endpoint.scheme, "http");
        assert_eq!(endpoint.host, "127.0.0.1");
        assert_eq!(endpoint.port, 9000);
        assert_eq!(endpoint.path, "/translate");
    }

    #[test]
    fn test_endpoint_parse_default_port() {
        let endpoint = Endpoint::parse("http://example.com").unwrap();
        assert_eq!(endpoint.port, 80);
        assert_eq!(endpoint.path, "/");
    }

    #[test]
    fn test_endpoint_parse_rejects_hostless_url() {
        assert!(Endpoint::parse("unix:/tmp/socket").is_err());
    }

    #[test]
    fn test_endpoint_parse_keeps_query() {
        let endpoint = Endpoint::parse("http://localhost:8001/summarize?model=small").unwrap();
        assert_eq!(endpoint.query.as_deref(), Some("model=small"));
        assert_eq!(
            endpoint.url().unwrap().as_str(),
            "http://localhost:8001/summarize?model=small"
        );

        let plain = Endpoint::parse("http://localhost:8001/summarize#top").unwrap();
        assert_eq!(plain.query, None);
        assert_eq!(plain.to_string(), "http://localhost:8001/summarize");
    }

    #[test]
    fn test_endpoint_url() {
        let url = Endpoint::http("localhost", 8080).url().unwrap();
        assert_eq!(url.as_str(), "http://localhost:8080/");
    }
}
