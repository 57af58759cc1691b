//! Lifecycle supervision for a single service listener.
//!
//! A [`LifecycleSupervisor`] moves through `Created → Setup → Serving →
//! TornDown`. Setup resolves the configured address, refuses to start when the
//! port is already taken and binds the listener. Serving races the listener's
//! serve loop against the cancellation token. Teardown releases the listener
//! and runs exactly once, whatever ended Serving.
//!
//! Cancellation is cooperative. Signals, [`SupervisorHandle::shutdown`] and
//! the listener itself only cancel a token; the listener is then given
//! `shutdown_grace_secs` to drain before it is dropped.

use crate::config::ServiceConfig;
use crate::error::{LifecycleError, ListenerError};
use crate::listener::Listener;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Lifecycle phase of a supervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Created,
    Setup,
    Serving,
    TornDown,
}

/// Process signals that trigger a graceful shutdown
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Signal {
    Interrupt,
    Terminate,
    Hangup,
    Quit,
    Abort,
    BusError,
}

impl Signal {
    /// Every signal the supervisor listens for
    pub const ALL: [Signal; 6] = [
        Signal::Interrupt,
        Signal::Terminate,
        Signal::Hangup,
        Signal::Quit,
        Signal::Abort,
        Signal::BusError,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Interrupt => "SIGINT",
            Self::Terminate => "SIGTERM",
            Self::Hangup => "SIGHUP",
            Self::Quit => "SIGQUIT",
            Self::Abort => "SIGABRT",
            Self::BusError => "SIGBUS",
        }
    }

    /// Fault-class signals mean the process may already be corrupted; only
    /// best-effort cleanup is attempted.
    pub fn is_fault(&self) -> bool {
        matches!(self, Self::Abort | Self::BusError)
    }

    #[cfg(unix)]
    fn kind(&self) -> tokio::signal::unix::SignalKind {
        use tokio::signal::unix::SignalKind;
        match self {
            Self::Interrupt => SignalKind::interrupt(),
            Self::Terminate => SignalKind::terminate(),
            Self::Hangup => SignalKind::hangup(),
            Self::Quit => SignalKind::quit(),
            Self::Abort => SignalKind::from_raw(libc::SIGABRT),
            Self::BusError => SignalKind::from_raw(libc::SIGBUS),
        }
    }
}

impl std::fmt::Display for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Why shutdown was requested from outside the listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "signal")]
pub enum ShutdownCause {
    Signal(Signal),
    Requested,
}

/// Why the Serving phase ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "detail")]
pub enum ExitReason {
    Signal(Signal),
    Requested,
    /// The listener cancelled its token to ask for shutdown.
    ListenerExited,
    /// `serve` returned on its own without error.
    ListenerCompleted,
    /// `serve` returned an error or panicked.
    ListenerFailed(String),
}

impl From<ShutdownCause> for ExitReason {
    fn from(cause: ShutdownCause) -> Self {
        match cause {
            ShutdownCause::Signal(signal) => Self::Signal(signal),
            ShutdownCause::Requested => Self::Requested,
        }
    }
}

/// Summary of one completed lifecycle
#[derive(Debug, Clone, Serialize)]
pub struct LifecycleReport {
    pub service: String,
    pub exit: ExitReason,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: DateTime<Utc>,
    #[serde(with = "duration_ms")]
    pub uptime: Duration,
}

impl LifecycleReport {
    pub fn is_failure(&self) -> bool {
        matches!(self.exit, ExitReason::ListenerFailed(_))
    }
}

mod duration_ms {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }
}

/// Cloneable handle for observing or triggering a supervisor's shutdown.
#[derive(Debug, Clone)]
pub struct SupervisorHandle {
    token: CancellationToken,
    cause: Arc<OnceLock<ShutdownCause>>,
    phase: Arc<watch::Sender<Phase>>,
}

impl SupervisorHandle {
    fn new() -> Self {
        let (phase, _) = watch::channel(Phase::Created);
        Self {
            token: CancellationToken::new(),
            cause: Arc::new(OnceLock::new()),
            phase: Arc::new(phase),
        }
    }

    /// Deliver a signal. Returns `false` if shutdown was already requested.
    pub fn signal(&self, signal: Signal) -> bool {
        if signal.is_fault() {
            warn!("Received fault signal {}, attempting best-effort shutdown", signal);
        }
        self.trigger(ShutdownCause::Signal(signal))
    }

    /// Request a graceful shutdown. Returns `false` if one was already requested.
    pub fn shutdown(&self) -> bool {
        self.trigger(ShutdownCause::Requested)
    }

    fn trigger(&self, cause: ShutdownCause) -> bool {
        if self.cause.set(cause).is_err() {
            debug!("Shutdown already in progress, ignoring {:?}", cause);
            return false;
        }

        info!("Shutdown requested: {:?}", cause);
        self.token.cancel();
        true
    }

    /// First recorded shutdown cause, if any
    pub fn cause(&self) -> Option<ShutdownCause> {
        self.cause.get().copied()
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Token cancelled when the supervisor shuts down, for sub-tasks to observe
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    /// Wait until the supervisor has reached `phase` (or moved past it).
    pub async fn wait_for(&self, phase: Phase) {
        let mut rx = self.phase.subscribe();
        // the sender lives in self, so the channel cannot close here
        let _ = rx.wait_for(|current| *current >= phase).await;
    }
}

/// Runs one listener through setup, serving and teardown.
pub struct LifecycleSupervisor<L> {
    config: ServiceConfig,
    listener: L,
    handle: SupervisorHandle,
    handle_signals: bool,
    signal_tasks: Vec<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
    started_at: Option<DateTime<Utc>>,
    started: Option<Instant>,
    stopped_at: Option<DateTime<Utc>>,
}

impl<L: Listener> LifecycleSupervisor<L> {
    pub fn new(config: ServiceConfig, listener: L) -> Self {
        Self {
            config,
            listener,
            handle: SupervisorHandle::new(),
            handle_signals: true,
            signal_tasks: Vec::new(),
            local_addr: None,
            started_at: None,
            started: None,
            stopped_at: None,
        }
    }

    /// Do not install OS signal handlers; shutdown only via the handle.
    pub fn without_signal_handlers(mut self) -> Self {
        self.handle_signals = false;
        self
    }

    pub fn handle(&self) -> SupervisorHandle {
        self.handle.clone()
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn phase(&self) -> Phase {
        self.handle.phase()
    }

    /// Address the listener is bound to after a successful setup
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Drive the whole lifecycle on a dedicated single-threaded runtime.
    ///
    /// Blocks until teardown has finished.
    pub fn run_forever(mut self) -> Result<LifecycleReport, LifecycleError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .thread_name(format!("{}-supervisor", self.config.name))
            .build()
            .map_err(LifecycleError::Runtime)?;

        let result = runtime.block_on(async {
            if let Err(e) = self.setup().await {
                self.teardown().await;
                return Err(e);
            }
            self.run().await
        });

        runtime.shutdown_timeout(Duration::from_secs(1));
        result
    }

    /// Resolve the configured address, check it is free and bind the listener.
    pub async fn setup(&mut self) -> Result<SocketAddr, LifecycleError> {
        self.expect_phase(Phase::Created)?;
        self.set_phase(Phase::Setup);

        let addr = resolve(&self.config.host, self.config.port).await?;
        ensure_port_available(addr)?;

        let bound = self.listener.bind(addr).await.map_err(|source| match source {
            ListenerError::Io(ref e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                LifecycleError::PortInUse { addr }
            }
            source => LifecycleError::Bind { addr, source },
        })?;

        info!(
            "Service {} bound to {}://{} (replicas={})",
            self.config.name, self.config.protocol, bound, self.config.replicas
        );

        self.local_addr = Some(bound);
        Ok(bound)
    }

    /// Serve until cancelled or until the listener stops, then tear down.
    ///
    /// Failures while serving are logged and reported in the returned
    /// [`LifecycleReport`]; they never skip teardown.
    pub async fn run(&mut self) -> Result<LifecycleReport, LifecycleError> {
        self.expect_phase(Phase::Setup)?;

        if self.handle_signals {
            if let Err(e) = self.install_signal_handlers() {
                warn!("Failed to install signal handlers: {}", e);
            }
        }

        self.started_at = Some(Utc::now());
        self.started = Some(Instant::now());
        self.set_phase(Phase::Serving);
        info!("Service {} serving", self.config.name);

        let listener_token = self.handle.token.child_token();
        let grace = self.config.shutdown_grace();

        let outcome = {
            let serve =
                AssertUnwindSafe(self.listener.serve(listener_token.clone())).catch_unwind();
            tokio::pin!(serve);

            tokio::select! {
                outcome = &mut serve => Some(outcome),
                _ = listener_token.cancelled() => {
                    debug!("Cancellation observed, draining listener");
                    match tokio::time::timeout(grace, &mut serve).await {
                        Ok(outcome) => Some(outcome),
                        Err(_) => {
                            warn!("Listener did not stop within {:?}, dropping it", grace);
                            None
                        }
                    }
                }
            }
        };

        let failure = match outcome {
            Some(Ok(Ok(()))) | None => None,
            Some(Ok(Err(e))) => {
                self.log_failure(&e);
                Some(format!("{:#}", e))
            }
            Some(Err(panic)) => {
                let message = panic_message(panic.as_ref());
                error!("Listener panicked: {}", message);
                Some(format!("listener panicked: {}", message))
            }
        };

        let exit = match (failure, self.handle.cause()) {
            (Some(failure), _) => ExitReason::ListenerFailed(failure),
            (None, Some(cause)) => cause.into(),
            (None, None) if listener_token.is_cancelled() => ExitReason::ListenerExited,
            (None, None) => ExitReason::ListenerCompleted,
        };

        self.teardown().await;

        let report = LifecycleReport {
            service: self.config.name.clone(),
            exit,
            started_at: self.started_at,
            stopped_at: self.stopped_at.unwrap_or_else(Utc::now),
            uptime: self.started.map(|s| s.elapsed()).unwrap_or_default(),
        };

        info!(
            "Service {} stopped after {}ms: {:?}",
            report.service,
            report.uptime.as_millis(),
            report.exit
        );

        Ok(report)
    }

    /// Release the listener and cancel outstanding work. Runs at most once;
    /// later calls return immediately.
    pub async fn teardown(&mut self) {
        if self.phase() == Phase::TornDown {
            debug!("Teardown already completed for {}", self.config.name);
            return;
        }

        info!("Tearing down service {}", self.config.name);

        match self.listener.stop().await {
            Ok(()) => debug!("Listener released"),
            Err(ListenerError::AlreadyClosed) | Err(ListenerError::NotBound) => {
                debug!("Listener already closed")
            }
            Err(e) => error!("Failed to release listener: {}", e),
        }

        for task in self.signal_tasks.drain(..) {
            task.abort();
        }

        self.handle.token.cancel();
        self.local_addr = None;
        self.stopped_at = Some(Utc::now());
        self.set_phase(Phase::TornDown);
    }

    #[cfg(unix)]
    fn install_signal_handlers(&mut self) -> std::io::Result<()> {
        use tokio::signal::unix::signal;

        for sig in Signal::ALL {
            // register before spawning so no signal slips through the gap
            let mut stream = signal(sig.kind())?;
            let handle = self.handle.clone();

            self.signal_tasks.push(tokio::spawn(async move {
                while stream.recv().await.is_some() {
                    handle.signal(sig);
                }
            }));
        }

        debug!("Installed handlers for {} signals", Signal::ALL.len());
        Ok(())
    }

    #[cfg(not(unix))]
    fn install_signal_handlers(&mut self) -> std::io::Result<()> {
        let handle = self.handle.clone();
        self.signal_tasks.push(tokio::spawn(async move {
            while tokio::signal::ctrl_c().await.is_ok() {
                handle.signal(Signal::Interrupt);
            }
        }));
        Ok(())
    }

    fn log_failure(&self, err: &anyhow::Error) {
        if self.config.log_backtrace {
            error!("Listener failed: {:?}", err);
        } else {
            error!("Listener failed: {:#}", err);
        }
    }

    fn expect_phase(&self, expected: Phase) -> Result<(), LifecycleError> {
        let actual = self.phase();
        if actual != expected {
            return Err(LifecycleError::InvalidPhase { expected, actual });
        }
        Ok(())
    }

    fn set_phase(&self, phase: Phase) {
        debug!("Service {} entering phase {:?}", self.config.name, phase);
        self.handle.phase.send_replace(phase);
    }
}

async fn resolve(host: &str, port: u16) -> Result<SocketAddr, LifecycleError> {
    let unresolved = || LifecycleError::Resolve {
        host: host.to_string(),
        port,
    };

    tokio::net::lookup_host((host, port))
        .await
        .map_err(|_| unresolved())?
        .next()
        .ok_or_else(unresolved)
}

/// Fail fast if something is already listening on `addr`.
fn ensure_port_available(addr: SocketAddr) -> Result<(), LifecycleError> {
    if addr.port() == 0 {
        return Ok(());
    }

    match std::net::TcpListener::bind(addr) {
        Ok(probe) => {
            drop(probe);
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
            Err(LifecycleError::PortInUse { addr })
        }
        // anything else surfaces again, with context, when the listener binds
        Err(_) => Ok(()),
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
