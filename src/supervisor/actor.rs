//! Single-writer task owning a [`ProcessSupervisor`].
//!
//! All foreground requests and the periodic heartbeat run on one task, so a
//! sweep can never interleave with a `start` or `stop` of the same service.

use super::{LogTail, ProcessSupervisor, SweepReport};
use crate::config::CommandSpec;
use crate::error::{Error, Result};
use crate::state::ManagedService;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Pending requests before senders wait.
const REQUEST_QUEUE: usize = 64;

/// Upper bound of the random delay added to each heartbeat tick.
const HEARTBEAT_JITTER_MS: u64 = 500;

enum Request {
    Start {
        name: String,
        spec: CommandSpec,
        config: serde_json::Value,
        reply: oneshot::Sender<bool>,
    },
    Stop {
        name: String,
        reply: oneshot::Sender<bool>,
    },
    Restart {
        name: String,
        reply: oneshot::Sender<Result<bool>>,
    },
    Status {
        name: String,
        reply: oneshot::Sender<Result<Option<ManagedService>>>,
    },
    List {
        reply: oneshot::Sender<Result<Vec<ManagedService>>>,
    },
    LogTail {
        name: String,
        lines: usize,
        reply: oneshot::Sender<Result<LogTail>>,
    },
    Sweep {
        reply: oneshot::Sender<Result<SweepReport>>,
    },
}

impl Request {
    fn label(&self) -> &'static str {
        match self {
            Request::Start { .. } => "start",
            Request::Stop { .. } => "stop",
            Request::Restart { .. } => "restart",
            Request::Status { .. } => "status",
            Request::List { .. } => "list",
            Request::LogTail { .. } => "log-tail",
            Request::Sweep { .. } => "sweep",
        }
    }
}

/// Cloneable front door to a running supervisor task.
#[derive(Clone)]
pub struct SupervisorHandle {
    tx: mpsc::Sender<Request>,
}

/// Join handle and cancellation for the supervisor task.
pub struct SupervisorTask {
    join: JoinHandle<()>,
    cancel: CancellationToken,
}

impl SupervisorTask {
    /// Cancel the loop and wait up to `timeout` for it to finish.
    pub async fn shutdown(self, timeout: Duration) -> Result<()> {
        self.cancel.cancel();
        match tokio::time::timeout(timeout, self.join).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(Error::Process(format!("supervisor task failed: {}", e))),
            Err(_) => Err(Error::Timeout("supervisor task shutdown".to_string())),
        }
    }
}

/// Spawn the supervisor loop. A zero `heartbeat_interval` disables the sweep.
pub fn spawn(
    supervisor: ProcessSupervisor,
    heartbeat_interval: Duration,
    cancel: CancellationToken,
) -> (SupervisorHandle, SupervisorTask) {
    let (tx, rx) = mpsc::channel(REQUEST_QUEUE);
    let join = tokio::spawn(run_supervisor_loop(
        supervisor,
        rx,
        heartbeat_interval,
        cancel.clone(),
    ));
    (SupervisorHandle { tx }, SupervisorTask { join, cancel })
}

impl SupervisorHandle {
    async fn call<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Request) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(build(reply))
            .await
            .map_err(|_| Error::Process("supervisor task is not running".to_string()))?;
        rx.await
            .map_err(|_| Error::Process("supervisor task dropped the request".to_string()))
    }

    pub async fn start(
        &self,
        name: &str,
        spec: CommandSpec,
        config: serde_json::Value,
    ) -> Result<bool> {
        let name = name.to_string();
        self.call(|reply| Request::Start {
            name,
            spec,
            config,
            reply,
        })
        .await
    }

    pub async fn stop(&self, name: &str) -> Result<bool> {
        let name = name.to_string();
        self.call(|reply| Request::Stop { name, reply }).await
    }

    pub async fn restart(&self, name: &str) -> Result<bool> {
        let name = name.to_string();
        self.call(|reply| Request::Restart { name, reply }).await?
    }

    pub async fn status(&self, name: &str) -> Result<Option<ManagedService>> {
        let name = name.to_string();
        self.call(|reply| Request::Status { name, reply }).await?
    }

    pub async fn list_services(&self) -> Result<Vec<ManagedService>> {
        self.call(|reply| Request::List { reply }).await?
    }

    pub async fn log_tail(&self, name: &str, lines: usize) -> Result<LogTail> {
        let name = name.to_string();
        self.call(|reply| Request::LogTail { name, lines, reply })
            .await?
    }

    pub async fn heartbeat_sweep(&self) -> Result<SweepReport> {
        self.call(|reply| Request::Sweep { reply }).await?
    }
}

async fn apply_heartbeat_jitter() {
    use rand::Rng;
    let jitter_ms = {
        let mut rng = rand::thread_rng();
        rng.gen_range(0..=HEARTBEAT_JITTER_MS)
    };
    tokio::time::sleep(Duration::from_millis(jitter_ms)).await;
}

fn panic_message(panic_info: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic_info.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic_info.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic".to_string()
    }
}

async fn handle_request(supervisor: &ProcessSupervisor, request: Request) {
    // A dropped reply receiver means the caller gave up; nothing to report
    match request {
        Request::Start {
            name,
            spec,
            config,
            reply,
        } => {
            let _ = reply.send(supervisor.start(&name, spec, config).await);
        }
        Request::Stop { name, reply } => {
            let _ = reply.send(supervisor.stop(&name).await);
        }
        Request::Restart { name, reply } => {
            let _ = reply.send(supervisor.restart(&name).await);
        }
        Request::Status { name, reply } => {
            let _ = reply.send(supervisor.status(&name).await);
        }
        Request::List { reply } => {
            let _ = reply.send(supervisor.list_services().await);
        }
        Request::LogTail { name, lines, reply } => {
            let _ = reply.send(supervisor.log_tail(&name, lines));
        }
        Request::Sweep { reply } => {
            let _ = reply.send(supervisor.heartbeat_sweep().await);
        }
    }
}

/// Serve requests and tick the heartbeat until cancelled or every handle is
/// dropped. Panics in a request or sweep are logged and the loop continues.
async fn run_supervisor_loop(
    supervisor: ProcessSupervisor,
    mut rx: mpsc::Receiver<Request>,
    heartbeat_interval: Duration,
    cancel_token: CancellationToken,
) {
    use futures::FutureExt;
    use std::panic::AssertUnwindSafe;

    let heartbeat_enabled = !heartbeat_interval.is_zero();
    let mut interval = tokio::time::interval(if heartbeat_enabled {
        heartbeat_interval
    } else {
        Duration::from_secs(3600)
    });
    // The first tick fires immediately; skip it so startup is not a sweep
    interval.tick().await;

    loop {
        tokio::select! {
            biased;
            _ = cancel_token.cancelled() => {
                tracing::debug!("Supervisor loop shutting down");
                break;
            }
            request = rx.recv() => {
                let Some(request) = request else {
                    tracing::debug!("All supervisor handles dropped, stopping loop");
                    break;
                };
                let label = request.label();
                let result = AssertUnwindSafe(handle_request(&supervisor, request))
                    .catch_unwind()
                    .await;
                if let Err(panic_info) = result {
                    tracing::error!(
                        "Supervisor {} request panicked: {}. Continuing...",
                        label,
                        panic_message(panic_info.as_ref())
                    );
                }
            }
            _ = interval.tick(), if heartbeat_enabled => {
                apply_heartbeat_jitter().await;

                let result = AssertUnwindSafe(supervisor.heartbeat_sweep())
                    .catch_unwind()
                    .await;
                match result {
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => tracing::warn!("Heartbeat sweep failed: {}", e),
                    Err(panic_info) => tracing::error!(
                        "Heartbeat sweep panicked: {}. Continuing...",
                        panic_message(panic_info.as_ref())
                    ),
                }
            }
        }
    }
}
