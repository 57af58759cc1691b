//! Network listeners driven by the lifecycle supervisor.

use crate::error::ListenerError;
use async_trait::async_trait;
use axum::Router;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};

/// A network listener with an explicit bind / serve / stop lifecycle.
///
/// `serve` receives a token that is cancelled when the supervisor shuts down.
/// A listener may also cancel the token itself to ask the supervisor to exit.
#[async_trait]
pub trait Listener: Send {
    /// Bind to `addr` and return the address actually bound.
    async fn bind(&mut self, addr: SocketAddr) -> Result<SocketAddr, ListenerError>;

    /// Serve until the token is cancelled or the listener finishes on its own.
    async fn serve(&mut self, shutdown: CancellationToken) -> anyhow::Result<()>;

    /// Release the socket. Returns `AlreadyClosed` if nothing is held.
    async fn stop(&mut self) -> Result<(), ListenerError>;
}

/// HTTP listener serving an axum router
pub struct HttpListener {
    router: Router,
    listener: Option<TcpListener>,
    served: bool,
}

impl HttpListener {
    pub fn new(router: Router) -> Self {
        let router = router.layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().include_headers(true))
                .on_response(DefaultOnResponse::new().include_headers(true)),
        );

        Self {
            router,
            listener: None,
            served: false,
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }
}

#[async_trait]
impl Listener for HttpListener {
    async fn bind(&mut self, addr: SocketAddr) -> Result<SocketAddr, ListenerError> {
        let listener = TcpListener::bind(addr).await?;
        let bound = listener.local_addr()?;
        self.listener = Some(listener);
        self.served = false;
        Ok(bound)
    }

    async fn serve(&mut self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let listener = self.listener.take().ok_or(ListenerError::NotBound)?;
        let addr = listener.local_addr()?;
        self.served = true;

        tracing::info!("HTTP listener serving on {}", addr);

        axum::serve(listener, self.router.clone())
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await?;

        tracing::info!("HTTP listener on {} stopped", addr);
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), ListenerError> {
        match self.listener.take() {
            Some(listener) => {
                drop(listener);
                Ok(())
            }
            // serve() consumed the socket and closed it on return
            None if self.served => Err(ListenerError::AlreadyClosed),
            None => Err(ListenerError::NotBound),
        }
    }
}
