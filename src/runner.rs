//! Server Runner: one supervisory task per server, executing in the
//! supervisor's execution context. Owns exactly one Connection at a time
//! and drives it through `Connecting -> Serving -> (Backoff) -> Stopped`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use rmcp::model::Tool;
use tokio::sync::{Notify, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::TransportConfig;
use crate::connection::Connection;
use crate::error::{Result, SupervisorError};
use crate::proxy::{ArgumentAdaptor, ConnectionSlot, ToolProxy};
use crate::registry::ToolRegistry;
use crate::supervisor::SupervisorInner;

/// Attempts per (re)connection cycle before giving up for this cycle.
pub(crate) const CONNECT_ATTEMPTS: u32 = 3;
/// Spacing between attempts within one cycle.
pub(crate) const CONNECT_RETRY_SPACING: Duration = Duration::from_secs(2);
/// Sleep before re-entering `Connecting` after a non-first-connect cycle
/// exhausts its attempts.
pub(crate) const RECONNECT_BACKOFF: Duration = Duration::from_secs(5);

/// A single-fire-until-reset latch: `fire` sets it and wakes the one waiter.
/// `take` both observes and resets the flag atomically, which is what lets
/// `reconnectSignal` be "auto-reset at the top of each Runner iteration"
/// (§9) while still being safe to fire from a concurrent context.
///
/// Uses [`Notify::notify_one`] rather than `notify_waiters`: there is
/// exactly one consumer (the Runner's serving loop), and `notify_one`
/// stores a permit for a `notified()` call that hasn't registered yet,
/// so a `fire()` landing between the flag check and the await is not lost.
struct Signal {
    flag: AtomicBool,
    notify: Notify,
}

impl Signal {
    fn new() -> Self {
        Self {
            flag: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    fn fire(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    /// Observe-and-clear: returns whether it was set, and clears it either way.
    fn take(&self) -> bool {
        self.flag.swap(false, Ordering::SeqCst)
    }
}

enum WakeReason {
    Stop,
    Reconnect,
    Spurious,
}

/// What the Supervisor holds onto for a running server: the primitives used
/// to control it from outside the Runner's own task, and the task handle
/// itself so `removeServer`/`cleanup` can await its exit.
///
/// `stop` is a [`CancellationToken`] rather than a bespoke latch: it is
/// fired exactly once, is terminal, and every suspension point in `run`
/// (connect retries, backoff sleeps, the serving wait) needs to race
/// against it — precisely the shape `tokio_util`'s cancellation token is
/// built for, and the pattern the grounding crate uses throughout its own
/// request lifecycle.
pub(crate) struct RunnerHandle {
    pub(crate) server_name: String,
    stop: CancellationToken,
    reconnect: Arc<Signal>,
    waiters: Arc<StdMutex<Vec<oneshot::Sender<()>>>>,
    pub(crate) join_handle: JoinHandle<()>,
    pub(crate) connection: Arc<ConnectionSlot>,
}

impl RunnerHandle {
    /// Request a stop. Idempotent; safe to call more than once.
    pub(crate) fn request_stop(&self) {
        self.stop.cancel();
    }

    /// Register a waiter and fire the reconnect signal. Called both from
    /// the supervisor's own context (`reloadServer`) and, indirectly, from
    /// `Supervisor::request_reconnect`'s cross-context command handler.
    pub(crate) fn request_reconnect(&self, waiter: oneshot::Sender<()>) {
        self.waiters.lock().unwrap().push(waiter);
        self.reconnect.fire();
    }
}

/// Configuration a Runner needs to manage one server, independent of the
/// Supervisor's own bookkeeping.
pub(crate) struct RunnerConfig {
    pub(crate) server_name: String,
    pub(crate) transport: TransportConfig,
    pub(crate) include_tools: Option<Vec<String>>,
    pub(crate) adaptor: Option<Arc<dyn ArgumentAdaptor>>,
}

/// Spawn a Runner task for `config`. Blocks the *caller* of this function
/// (not the task) until the first connect attempt resolves, matching
/// `addServer`'s synchronous-escalation contract: the returned `Result`
/// reflects first-connect success or the terminal error, and `RunnerHandle`
/// is returned either way so the caller can still await/stop it.
pub(crate) async fn spawn(
    config: RunnerConfig,
    registry: Arc<dyn ToolRegistry>,
    supervisor: Weak<SupervisorInner>,
) -> (RunnerHandle, Result<()>) {
    let server_name = config.server_name.clone();
    let stop = CancellationToken::new();
    let reconnect = Arc::new(Signal::new());
    let waiters = Arc::new(StdMutex::new(Vec::new()));
    let connection: Arc<ConnectionSlot> = Arc::new(tokio::sync::RwLock::new(None));
    let (ready_tx, ready_rx) = oneshot::channel();

    let task_stop = stop.clone();
    let task_reconnect = reconnect.clone();
    let task_waiters = waiters.clone();
    let task_connection = connection.clone();

    let join_handle = tokio::spawn(run(
        config,
        registry,
        supervisor,
        task_stop,
        task_reconnect,
        task_waiters,
        task_connection,
        ready_tx,
    ));

    let first_connect_result = ready_rx
        .await
        .unwrap_or_else(|_| Err(SupervisorError::Cancelled("runner task exited before ready".into())));

    let handle = RunnerHandle {
        server_name,
        stop,
        reconnect,
        waiters,
        join_handle,
        connection,
    };

    (handle, first_connect_result)
}

/// Outcome of racing a connect attempt or a backoff sleep against `stop`.
enum ConnectOutcome {
    Connected(Connection),
    Failed(anyhow::Error),
    Stopped,
}

async fn run(
    config: RunnerConfig,
    registry: Arc<dyn ToolRegistry>,
    supervisor: Weak<SupervisorInner>,
    stop: CancellationToken,
    reconnect: Arc<Signal>,
    waiters: Arc<StdMutex<Vec<oneshot::Sender<()>>>>,
    connection_slot: Arc<ConnectionSlot>,
    ready_tx: oneshot::Sender<Result<()>>,
) {
    let RunnerConfig {
        server_name,
        transport,
        include_tools,
        adaptor,
    } = config;

    let mut ready_tx = Some(ready_tx);
    let mut first_connect = true;

    'outer: loop {
        if stop.is_cancelled() {
            drain_waiters(&waiters);
            if let Some(tx) = ready_tx.take() {
                let _ = tx.send(Err(SupervisorError::Cancelled(server_name.clone())));
            }
            return;
        }

        // Connecting
        let mut last_error = None;
        let mut connection = None;
        let mut was_stopped = false;
        for attempt in 1..=CONNECT_ATTEMPTS {
            match race_connect(&server_name, &transport, &stop).await {
                ConnectOutcome::Connected(opened) => {
                    connection = Some(opened);
                    break;
                }
                ConnectOutcome::Stopped => {
                    was_stopped = true;
                    break;
                }
                ConnectOutcome::Failed(error) => {
                    tracing::warn!(
                        server = %server_name,
                        attempt,
                        error = %error,
                        "MCP connect attempt failed"
                    );
                    last_error = Some(error);
                    if attempt < CONNECT_ATTEMPTS {
                        tokio::select! {
                            _ = tokio::time::sleep(CONNECT_RETRY_SPACING) => {}
                            _ = stop.cancelled() => { was_stopped = true; }
                        }
                        if was_stopped {
                            break;
                        }
                    }
                }
            }
        }

        if was_stopped {
            drain_waiters(&waiters);
            if first_connect {
                if let Some(tx) = ready_tx.take() {
                    let _ = tx.send(Err(SupervisorError::Cancelled(server_name.clone())));
                }
            }
            return;
        }

        let Some(connection) = connection else {
            let error = SupervisorError::transport(
                server_name.clone(),
                CONNECT_ATTEMPTS,
                last_error.unwrap_or_else(|| anyhow::anyhow!("connect failed without a cause")),
            );

            if first_connect {
                drain_waiters(&waiters);
                tracing::error!(server = %server_name, error = %error, "MCP server first connect exhausted retries");
                if let Some(tx) = ready_tx.take() {
                    let _ = tx.send(Err(error));
                }
                return;
            } else {
                tracing::warn!(
                    server = %server_name,
                    error = %error,
                    backoff_secs = RECONNECT_BACKOFF.as_secs(),
                    "MCP server reconnect exhausted retries, backing off"
                );
                drain_waiters(&waiters);
                tokio::select! {
                    _ = tokio::time::sleep(RECONNECT_BACKOFF) => {}
                    _ = stop.cancelled() => {}
                }
                continue 'outer;
            }
        };

        let connection = Arc::new(connection);

        if let Err(error) = publish_or_patch(
            &server_name,
            &connection,
            first_connect,
            include_tools.as_deref(),
            &registry,
            &connection_slot,
            &supervisor,
            &adaptor,
        )
        .await
        {
            tracing::error!(server = %server_name, error = %error, "failed to publish/patch tools after connect");
            if let Ok(connection) = Arc::try_unwrap(connection) {
                connection.close().await;
            }
            if first_connect {
                drain_waiters(&waiters);
                if let Some(tx) = ready_tx.take() {
                    let _ = tx.send(Err(error));
                }
                return;
            }
            drain_waiters(&waiters);
            tokio::select! {
                _ = tokio::time::sleep(RECONNECT_BACKOFF) => {}
                _ = stop.cancelled() => {}
            }
            continue 'outer;
        }

        *connection_slot.write().await = Some(connection.clone());
        tracing::info!(server = %server_name, "MCP server connected");

        drain_waiters(&waiters);
        if first_connect {
            first_connect = false;
            if let Some(tx) = ready_tx.take() {
                let _ = tx.send(Ok(()));
            }
        }

        // Serving
        loop {
            match wait_stop_or_reconnect(&stop, &reconnect).await {
                WakeReason::Stop => {
                    let connection = connection_slot.write().await.take();
                    if let Some(Ok(connection)) = connection.map(Arc::try_unwrap) {
                        connection.close().await;
                    }
                    drain_waiters(&waiters);
                    return;
                }
                WakeReason::Reconnect => {
                    let connection = connection_slot.write().await.take();
                    if let Some(Ok(connection)) = connection.map(Arc::try_unwrap) {
                        connection.close().await;
                    }
                    continue 'outer;
                }
                WakeReason::Spurious => continue,
            }
        }
    }
}

/// Attempt one `Connection::open`, racing it against `stop` so a caller
/// blocked in `removeServer`/`cleanup` is never held up by a hung or slow
/// connect attempt on a server already told to stop.
async fn race_connect(
    server_name: &str,
    transport: &TransportConfig,
    stop: &CancellationToken,
) -> ConnectOutcome {
    tokio::select! {
        result = Connection::open(server_name, transport) => match result {
            Ok(connection) => ConnectOutcome::Connected(connection),
            Err(error) => ConnectOutcome::Failed(error),
        },
        _ = stop.cancelled() => ConnectOutcome::Stopped,
    }
}

#[allow(clippy::too_many_arguments)]
async fn publish_or_patch(
    server_name: &str,
    connection: &Arc<Connection>,
    first_connect: bool,
    include_tools: Option<&[String]>,
    registry: &Arc<dyn ToolRegistry>,
    connection_slot: &Arc<ConnectionSlot>,
    supervisor: &Weak<SupervisorInner>,
    adaptor: &Option<Arc<dyn ArgumentAdaptor>>,
) -> Result<()> {
    let tools = connection
        .list_tools()
        .await
        .map_err(|source| SupervisorError::protocol(server_name.to_string(), source))?;

    if !first_connect {
        // Reconnect: existing Proxies keep their identity; only the shared
        // Connection reference changes, which the caller does by writing
        // to `connection_slot` after this returns.
        tracing::debug!(server = %server_name, "patched connection reference for existing proxies");
        return Ok(());
    }

    let filtered: Vec<Tool> = match include_tools {
        Some(include) => tools
            .into_iter()
            .filter(|tool| include.iter().any(|name| name == tool.name.as_ref()))
            .collect(),
        None => tools,
    };

    for tool in filtered {
        let proxy = Arc::new(ToolProxy::new(
            server_name.to_string(),
            tool.name.to_string(),
            tool.description.as_ref().map(|d| d.to_string()),
            Arc::new(tool.input_schema.as_ref().clone()),
            connection_slot.clone(),
            supervisor.clone(),
            adaptor.clone(),
        ));
        registry.register(proxy).await?;
    }

    Ok(())
}

fn drain_waiters(waiters: &Arc<StdMutex<Vec<oneshot::Sender<()>>>>) {
    let drained: Vec<_> = std::mem::take(&mut *waiters.lock().unwrap());
    for waiter in drained {
        let _ = waiter.send(());
    }
}

/// Wait for `stop` or `reconnect`, whichever fires first; cancels the other
/// await and, per §5's ordering guarantee, resolves `Stop` even if
/// `reconnect` also fired before this was polled.
async fn wait_stop_or_reconnect(stop: &CancellationToken, reconnect: &Arc<Signal>) -> WakeReason {
    if stop.is_cancelled() {
        return WakeReason::Stop;
    }
    if reconnect.take() {
        return WakeReason::Reconnect;
    }

    let stopped = stop.cancelled();
    let reconnected = reconnect.notify.notified();
    tokio::select! {
        _ = stopped => {},
        _ = reconnected => {},
    }

    // stop dominates: if both fired before this wakes, Stopped wins.
    if stop.is_cancelled() {
        WakeReason::Stop
    } else if reconnect.take() {
        WakeReason::Reconnect
    } else {
        WakeReason::Spurious
    }
}
