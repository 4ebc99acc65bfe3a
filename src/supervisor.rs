//! The privileged half of the exporter.
//!
//! The supervisor keeps the rights needed to read certmonger over the system
//! bus and never touches the network. It spawns the worker, waits for it to
//! report ready, then answers its scrape requests until told to stop.

use std::env;
use std::io;
use std::net::Shutdown;
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::process::{Child, Command, ExitStatus};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::UnixStream;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::collector::SnapshotSource;
use crate::config::Config;
use crate::error::ExporterError;
use crate::ipc;
use crate::notify::{Notifier, NOTIFY_SOCKET};
use crate::Snapshot;

const REAP_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// A spawned worker and the supervisor's end of the channel to it.
pub struct WorkerProcess {
    pub child: Child,
    pub stream: StdUnixStream,
}

/// Re-executes the current binary as a worker, handing it one end of a fresh
/// socket pair. Must run before any other thread is started.
pub fn spawn_worker(config: &Config) -> Result<WorkerProcess, ExporterError> {
    let spawn_error = |source| ExporterError::Spawn { source };

    let (stream, worker_end) = StdUnixStream::pair().map_err(spawn_error)?;
    fcntl(worker_end.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::empty()))
        .map_err(|e| spawn_error(io::Error::from(e)))?;

    let exe = env::current_exe().map_err(spawn_error)?;
    let child = Command::new(exe)
        .arg("worker")
        .arg("--ipc-fd")
        .arg(worker_end.as_raw_fd().to_string())
        .arg("--user")
        .arg(config.user())
        .arg("--listen-address")
        .arg(config.listen_address())
        .arg("--port")
        .arg(config.port().to_string())
        .arg("--log-level")
        .arg(config.log_level())
        .arg("--scrape-timeout")
        .arg(config.scrape_timeout().as_secs().to_string())
        .env_remove(NOTIFY_SOCKET)
        .spawn()
        .map_err(spawn_error)?;
    drop(worker_end);

    info!(pid = child.id(), "Spawned worker");
    Ok(WorkerProcess { child, stream })
}

pub struct Supervisor<S> {
    source: Arc<S>,
    notifier: Notifier,
    collect_timeout: Duration,
    shutdown_timeout: Duration,
}

impl<S: SnapshotSource + 'static> Supervisor<S> {
    pub fn new(
        source: S,
        notifier: Notifier,
        collect_timeout: Duration,
        shutdown_timeout: Duration,
    ) -> Self {
        Supervisor {
            source: Arc::new(source),
            notifier,
            collect_timeout,
            shutdown_timeout,
        }
    }

    /// Runs until a termination signal or a worker failure, then stops the
    /// worker. Returns the process exit status.
    pub fn run(self, worker: WorkerProcess) -> i32 {
        let WorkerProcess { mut child, stream } = worker;

        let code = match self.serve(&stream) {
            Ok(code) => code,
            Err(e) => {
                error!(error = %e, "Supervisor failed");
                1
            }
        };

        // Tell the worker to exit.
        if let Err(e) = stream.shutdown(Shutdown::Write) {
            debug!(error = %e, "Channel already closed");
        }
        match reap_child(&mut child, self.shutdown_timeout) {
            Ok(Reaped::Exited(status)) => info!(%status, "Worker exited"),
            Ok(Reaped::Killed(status)) => {
                warn!(%status, "Worker did not exit itself, sent SIGKILL")
            }
            Err(e) => error!(error = %e, "Failed to reap worker"),
        }
        code
    }

    fn serve(&self, stream: &StdUnixStream) -> Result<i32, ExporterError> {
        let stream = stream.try_clone()?;
        stream.set_nonblocking(true)?;
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        let outcome = runtime.block_on(async {
            let mut stream = UnixStream::from_std(stream)?;
            let shutdown = Arc::new(Notify::new());
            watch_signals(shutdown.clone(), self.notifier.clone())?;
            supervise(
                &mut stream,
                self.source.clone(),
                &shutdown,
                &self.notifier,
                self.collect_timeout,
            )
            .await
        });
        // A collector stuck on the bus must not hold up shutdown.
        runtime.shutdown_background();
        outcome
    }
}

/// Waits for the readiness token, signals readiness, and serves requests.
pub async fn supervise<T, S>(
    stream: &mut T,
    source: Arc<S>,
    shutdown: &Notify,
    notifier: &Notifier,
    collect_timeout: Duration,
) -> Result<i32, ExporterError>
where
    T: AsyncRead + AsyncWrite + Unpin,
    S: SnapshotSource + 'static,
{
    debug!("Waiting for worker to be ready");
    let ready = tokio::select! {
        ready = ipc::expect_token(stream, ipc::READY) => ready?,
        _ = shutdown.notified() => return Ok(0),
    };
    if !ready {
        error!("Worker failed to initialize");
        return Ok(1);
    }
    info!("Worker is ready");
    notifier.ready();
    serve_requests(stream, source, shutdown, collect_timeout).await
}

/// Answers scrape requests one at a time until `shutdown` is notified.
pub async fn serve_requests<T, S>(
    stream: &mut T,
    source: Arc<S>,
    shutdown: &Notify,
    collect_timeout: Duration,
) -> Result<i32, ExporterError>
where
    T: AsyncRead + AsyncWrite + Unpin,
    S: SnapshotSource + 'static,
{
    loop {
        tokio::select! {
            _ = shutdown.notified() => {
                debug!("Bye");
                return Ok(0);
            }
            request = ipc::expect_token(stream, ipc::SCRAPE_REQUEST) => {
                if !request? {
                    error!("Worker closed the channel");
                    return Ok(1);
                }
                // Shutdown does not wait for the collector or the write.
                tokio::select! {
                    _ = shutdown.notified() => {
                        debug!("Bye, abandoning in-flight scrape");
                        return Ok(0);
                    }
                    sent = respond(stream, source.clone(), collect_timeout) => sent?,
                }
            }
        }
    }
}

async fn respond<T, S>(
    stream: &mut T,
    source: Arc<S>,
    collect_timeout: Duration,
) -> Result<(), ExporterError>
where
    T: AsyncWrite + Unpin,
    S: SnapshotSource + 'static,
{
    debug!("Scraping certmonger");
    let snapshot = take_snapshot(source, collect_timeout).await;
    let bytes = ipc::write_snapshot(stream, &snapshot).await?;
    debug!(bytes, requests = snapshot.requests.len(), "Sent snapshot to worker");
    Ok(())
}

/// Runs the collector off the runtime. A collector that panics or does not
/// finish within `collect_timeout` yields an unreachable snapshot.
async fn take_snapshot<S: SnapshotSource + 'static>(
    source: Arc<S>,
    collect_timeout: Duration,
) -> Snapshot {
    let collect = tokio::task::spawn_blocking(move || source.snapshot());
    match tokio::time::timeout(collect_timeout, collect).await {
        Ok(Ok(snapshot)) => snapshot,
        Ok(Err(e)) => {
            error!(error = %e, "Collector failed");
            Snapshot::unreachable()
        }
        Err(_) => {
            error!(timeout = ?collect_timeout, "Collector did not finish in time");
            Snapshot::unreachable()
        }
    }
}

fn watch_signals(shutdown: Arc<Notify>, notifier: Notifier) -> io::Result<()> {
    let mut terminate = signal(SignalKind::terminate())?;
    let mut interrupt = signal(SignalKind::interrupt())?;
    tokio::spawn(async move {
        tokio::select! {
            _ = terminate.recv() => info!("Received SIGTERM"),
            _ = interrupt.recv() => info!("Received SIGINT"),
        }
        notifier.stopping();
        shutdown.notify_one();
    });
    Ok(())
}

#[derive(Debug)]
pub enum Reaped {
    /// The child exited on its own within the timeout.
    Exited(ExitStatus),
    /// The child had to be killed.
    Killed(ExitStatus),
}

/// Waits up to `timeout` for `child` to exit, then kills it.
pub fn reap_child(child: &mut Child, timeout: Duration) -> io::Result<Reaped> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Reaped::Exited(status));
        }
        if Instant::now() >= deadline {
            break;
        }
        thread::sleep(REAP_POLL_INTERVAL);
    }
    child.kill()?;
    Ok(Reaped::Killed(child.wait()?))
}
