//! The unprivileged, network-facing half of the exporter.
//!
//! The worker drops to an unprivileged user, serves `/metrics`, and funnels
//! every scrape through a single coordinator task that owns the IPC channel.
//! HTTP handlers queue a [`ScrapeRequest`] carrying their own reply channel, so
//! a handler only ever sees the snapshot fetched for its own request.

use std::net::SocketAddr;
use std::os::fd::{FromRawFd, RawFd};
use std::os::unix::net::UnixStream as StdUnixStream;
use std::time::Duration;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use nix::unistd::{setgid, setgroups, setuid, User};
use prometheus::Registry;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::{TcpListener, UnixStream};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::error::ExporterError;
use crate::ipc;
use crate::metrics::{prom, SnapshotCollector};
use crate::Snapshot;

/// Exit status when privileges cannot be dropped (`EX_NOPERM`).
pub const EXIT_NOPERM: i32 = 77;

const SCRAPE_QUEUE_DEPTH: usize = 16;

pub struct WorkerOptions {
    pub ipc_fd: RawFd,
    pub user: String,
    pub listen: SocketAddr,
    pub scrape_timeout: Duration,
}

/// A pending scrape and where to deliver its snapshot.
pub struct ScrapeRequest {
    reply: oneshot::Sender<Result<Snapshot, ExporterError>>,
}

/// Handle used by metric collection to ask the coordinator for a snapshot.
#[derive(Clone)]
pub struct ScrapeClient {
    requests: mpsc::Sender<ScrapeRequest>,
    timeout: Duration,
}

pub fn scrape_channel(timeout: Duration) -> (ScrapeClient, mpsc::Receiver<ScrapeRequest>) {
    let (requests, queue) = mpsc::channel(SCRAPE_QUEUE_DEPTH);
    (ScrapeClient { requests, timeout }, queue)
}

impl ScrapeClient {
    /// Fetches one fresh snapshot. Queueing and the round trip together take
    /// at most the configured timeout.
    pub async fn scrape_async(&self) -> Result<Snapshot, ExporterError> {
        let exchange = async {
            let (reply, response) = oneshot::channel();
            self.requests
                .send(ScrapeRequest { reply })
                .await
                .map_err(|_| ExporterError::CoordinatorGone)?;
            response.await.map_err(|_| ExporterError::CoordinatorGone)?
        };
        match tokio::time::timeout(self.timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(ExporterError::ScrapeTimeout {
                timeout: self.timeout,
            }),
        }
    }

    /// Blocking variant for synchronous callers such as registry collectors.
    /// Must run on a thread that is not driving the runtime (e.g. `spawn_blocking`).
    pub fn scrape(&self) -> Result<Snapshot, ExporterError> {
        let handle =
            tokio::runtime::Handle::try_current().map_err(|_| ExporterError::CoordinatorGone)?;
        handle.block_on(self.scrape_async())
    }
}

/// Owns the IPC channel. Serves queued scrape requests one at a time until the
/// supervisor closes its end.
pub async fn coordinate<S>(
    stream: &mut S,
    mut requests: mpsc::Receiver<ScrapeRequest>,
) -> Result<(), ExporterError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut peek = [0u8; 1];
    loop {
        debug!("Worker waiting");
        tokio::select! {
            read = stream.read(&mut peek) => {
                return match read? {
                    0 => {
                        debug!("Supervisor closed the channel");
                        Ok(())
                    }
                    _ => Err(ExporterError::Protocol {
                        details: format!(
                            "unexpected message from supervisor {:?}",
                            String::from_utf8_lossy(&peek)
                        ),
                    }),
                };
            }
            request = requests.recv() => {
                let Some(request) = request else {
                    return Err(ExporterError::CoordinatorGone);
                };
                if request.reply.is_closed() {
                    debug!("Dropping abandoned scrape request");
                    continue;
                }
                match round_trip(stream).await {
                    Ok(snapshot) => {
                        if request.reply.send(Ok(snapshot)).is_err() {
                            debug!("Scrape finished after its caller gave up");
                        }
                    }
                    Err(e) => {
                        let _ = request.reply.send(Err(ExporterError::CoordinatorGone));
                        return Err(e);
                    }
                }
            }
        }
    }
}

async fn round_trip<S>(stream: &mut S) -> Result<Snapshot, ExporterError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    debug!("Requesting snapshot from supervisor");
    ipc::send_token(stream, ipc::SCRAPE_REQUEST).await?;
    let snapshot = ipc::read_snapshot(stream).await?;
    debug!(requests = snapshot.requests.len(), "Received snapshot");
    Ok(snapshot)
}

/// Switches to `user`'s group and then to the user itself.
pub fn drop_privileges(user: &str) -> Result<(), ExporterError> {
    let entry = User::from_name(user)
        .map_err(|source| ExporterError::PrivilegeDrop {
            user: user.to_string(),
            source,
        })?
        .ok_or_else(|| ExporterError::UnknownUser {
            user: user.to_string(),
        })?;
    let denied = |source| ExporterError::PrivilegeDrop {
        user: user.to_string(),
        source,
    };
    setgroups(&[entry.gid]).map_err(denied)?;
    setgid(entry.gid).map_err(denied)?;
    setuid(entry.uid).map_err(denied)?;
    debug!(user, uid = entry.uid.as_raw(), gid = entry.gid.as_raw(), "Dropped privileges");
    Ok(())
}

pub fn build_registry(client: ScrapeClient) -> Result<Registry, ExporterError> {
    let registry = Registry::new();
    registry.register(Box::new(SnapshotCollector::new(client)?))?;
    registry.register(Box::new(
        prometheus::process_collector::ProcessCollector::for_self(),
    ))?;
    Ok(registry)
}

pub fn router(registry: Registry) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(registry)
}

async fn metrics_handler(State(registry): State<Registry>) -> Response {
    match tokio::task::spawn_blocking(move || prom::render_metrics(&registry)).await {
        Ok(Ok(body)) => ([(header::CONTENT_TYPE, prom::content_type())], body).into_response(),
        Ok(Err(e)) => {
            error!(error = %e, "Failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics").into_response()
        }
        Err(e) => {
            error!(error = %e, "Metrics collection panicked");
            (StatusCode::INTERNAL_SERVER_ERROR, "Failed to collect metrics").into_response()
        }
    }
}

/// Serves the metrics endpoint until `stop` fires or is dropped.
pub async fn serve_metrics(
    listener: TcpListener,
    registry: Registry,
    stop: oneshot::Receiver<()>,
) -> std::io::Result<()> {
    axum::serve(listener, router(registry))
        .with_graceful_shutdown(async {
            let _ = stop.await;
        })
        .await
}

/// Entry point of the worker process. Returns the process exit status.
pub fn run(options: WorkerOptions) -> i32 {
    // SAFETY: the supervisor passes us the worker end of its socket pair and
    // nothing else in this process owns that descriptor.
    let stream = unsafe { StdUnixStream::from_raw_fd(options.ipc_fd) };

    match drop_privileges(&options.user) {
        Ok(()) => {}
        Err(e @ ExporterError::UnknownUser { .. }) => {
            error!(error = %e, "Configured worker user does not exist");
            return 1;
        }
        Err(e) => {
            error!(
                error = %e,
                "certmonger-exporter needs to be launched as root. The network-facing component drops privileges by switching to the user {:?}.",
                options.user
            );
            return EXIT_NOPERM;
        }
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("certmonger-exporter-http")
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "Failed to start worker runtime");
            return 1;
        }
    };

    match runtime.block_on(serve(stream, options.listen, options.scrape_timeout)) {
        Ok(()) => 0,
        Err(e) => {
            error!(error = %e, "Worker failed");
            1
        }
    }
}

async fn serve(
    stream: StdUnixStream,
    listen: SocketAddr,
    scrape_timeout: Duration,
) -> Result<(), ExporterError> {
    stream.set_nonblocking(true)?;
    let mut stream = UnixStream::from_std(stream)?;

    // Terminal signals reach the whole process group; the supervisor decides
    // when we stop by closing the channel.
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = interrupt.recv() => debug!("Ignoring SIGINT, waiting for supervisor"),
                _ = terminate.recv() => debug!("Ignoring SIGTERM, waiting for supervisor"),
            }
        }
    });

    let (client, requests) = scrape_channel(scrape_timeout);
    let registry = build_registry(client)?;

    let listener = TcpListener::bind(listen).await?;
    info!(address = %listener.local_addr()?, "Serving metrics");

    let (stop, stopped) = oneshot::channel();
    let http = tokio::spawn(serve_metrics(listener, registry, stopped));

    ipc::send_token(&mut stream, ipc::READY).await?;
    let outcome = coordinate(&mut stream, requests).await;

    let _ = stop.send(());
    match http.await {
        Ok(Ok(())) => debug!("HTTP server stopped"),
        Ok(Err(e)) => warn!(error = %e, "HTTP server failed"),
        Err(e) => warn!(error = %e, "HTTP server task failed"),
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::SnapshotSource;
    use crate::supervisor::serve_requests;
    use crate::{CertStorage, RequestRecord};
    use std::os::fd::IntoRawFd;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc as std_mpsc;
    use std::sync::{Arc, Mutex};
    use tokio::io::AsyncWriteExt;
    use tokio::sync::Notify;

    /// Returns a snapshot with `n` records on the n-th call.
    #[derive(Default)]
    struct CountingSource {
        calls: AtomicUsize,
    }

    impl SnapshotSource for CountingSource {
        fn snapshot(&self) -> Snapshot {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            Snapshot {
                service_enabled: Some(true),
                bus_reachable: true,
                requests: (0..n)
                    .map(|i| RequestRecord {
                        nickname: format!("scrape{}-{}", n, i),
                        ca: "SelfSign".to_string(),
                        storage: CertStorage::File {
                            path: format!("/var/lib/certs/{}.pem", i),
                        },
                        status: "MONITORING".to_string(),
                        ca_error: false,
                        key_generated_date: None,
                        key_issued_count: 0,
                        last_checked: 0,
                        not_valid_after: 0,
                        not_valid_before: 0,
                        stuck: false,
                    })
                    .collect(),
            }
        }
    }

    /// Holds the first snapshot until the test opens the gate.
    struct GatedSource {
        inner: CountingSource,
        started: Arc<Notify>,
        gate: Mutex<std_mpsc::Receiver<()>>,
    }

    impl SnapshotSource for GatedSource {
        fn snapshot(&self) -> Snapshot {
            let snapshot = self.inner.snapshot();
            if snapshot.requests.len() == 1 {
                self.started.notify_one();
                let _ = self.gate.lock().unwrap().recv();
            }
            snapshot
        }
    }

    fn fake_supervisor<S: SnapshotSource + 'static>(
        mut stream: UnixStream,
        source: Arc<S>,
    ) -> (Arc<Notify>, tokio::task::JoinHandle<i32>) {
        let shutdown = Arc::new(Notify::new());
        let stop = shutdown.clone();
        let handle = tokio::spawn(async move {
            serve_requests(&mut stream, source, &stop, Duration::from_secs(10))
                .await
                .unwrap()
        });
        (shutdown, handle)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_scrapes_get_their_own_snapshot() {
        let (supervisor_end, mut worker_end) = UnixStream::pair().unwrap();
        let (open, gate) = std_mpsc::channel();
        let started = Arc::new(Notify::new());
        let source = Arc::new(GatedSource {
            inner: CountingSource::default(),
            started: started.clone(),
            gate: Mutex::new(gate),
        });
        let (_shutdown, _supervisor) = fake_supervisor(supervisor_end, source);

        let (client, requests) = scrape_channel(Duration::from_secs(10));
        let coordinator = tokio::spawn(async move { coordinate(&mut worker_end, requests).await });

        // A is being collected when B arrives, so B overlaps A.
        let first = client.clone();
        let a = tokio::task::spawn_blocking(move || first.scrape());
        started.notified().await;
        let second = client.clone();
        let b = tokio::task::spawn_blocking(move || second.scrape());
        while client.requests.capacity() == SCRAPE_QUEUE_DEPTH {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        open.send(()).unwrap();

        let a = a.await.unwrap().unwrap();
        let b = b.await.unwrap().unwrap();
        assert_eq!(a.requests.len(), 1);
        assert!(a.requests.iter().all(|r| r.nickname.starts_with("scrape1-")));
        assert_eq!(b.requests.len(), 2);
        assert!(b.requests.iter().all(|r| r.nickname.starts_with("scrape2-")));

        drop(client);
        assert!(matches!(
            coordinator.await.unwrap(),
            Err(ExporterError::CoordinatorGone)
        ));
    }

    #[tokio::test]
    async fn test_scrapes_keep_timing_out_when_supervisor_is_stuck() {
        let (_supervisor_end, mut worker_end) = UnixStream::pair().unwrap();
        let (client, requests) = scrape_channel(Duration::from_millis(50));
        tokio::spawn(async move { coordinate(&mut worker_end, requests).await });

        // More scrapes than the queue holds; none may block past its deadline.
        for _ in 0..SCRAPE_QUEUE_DEPTH + 4 {
            let outcome = tokio::time::timeout(Duration::from_secs(2), client.scrape_async())
                .await
                .expect("scrape outlived its timeout");
            assert!(matches!(outcome, Err(ExporterError::ScrapeTimeout { .. })));
        }
    }

    #[test]
    fn test_unknown_user_is_a_configuration_error() {
        let (_supervisor_end, worker_end) = StdUnixStream::pair().unwrap();
        let code = run(WorkerOptions {
            ipc_fd: worker_end.into_raw_fd(),
            user: "certmonger-exporter-missing".to_string(),
            listen: "127.0.0.1:0".parse().unwrap(),
            scrape_timeout: Duration::from_secs(1),
        });
        assert_eq!(code, 1);
        assert_ne!(code, EXIT_NOPERM);
    }

    #[tokio::test]
    async fn test_sequential_scrapes_are_fresh() {
        let (supervisor_end, mut worker_end) = UnixStream::pair().unwrap();
        let source = Arc::new(CountingSource::default());
        let (_shutdown, _supervisor) = fake_supervisor(supervisor_end, source);

        let (client, requests) = scrape_channel(Duration::from_secs(10));
        tokio::spawn(async move { coordinate(&mut worker_end, requests).await });

        assert_eq!(client.scrape_async().await.unwrap().requests.len(), 1);
        assert_eq!(client.scrape_async().await.unwrap().requests.len(), 2);
        assert_eq!(client.scrape_async().await.unwrap().requests.len(), 3);
    }

    #[tokio::test]
    async fn test_coordinator_exits_when_supervisor_closes() {
        let (mut supervisor_end, mut worker_end) = UnixStream::pair().unwrap();
        let (_client, requests) = scrape_channel(Duration::from_secs(1));

        supervisor_end.shutdown().await.unwrap();
        assert!(coordinate(&mut worker_end, requests).await.is_ok());
    }

    #[tokio::test]
    async fn test_coordinator_rejects_unsolicited_data() {
        let (mut supervisor_end, mut worker_end) = UnixStream::pair().unwrap();
        let (_client, requests) = scrape_channel(Duration::from_secs(1));

        supervisor_end.write_all(b"hi").await.unwrap();
        assert!(matches!(
            coordinate(&mut worker_end, requests).await,
            Err(ExporterError::Protocol { .. })
        ));
    }

    #[tokio::test]
    async fn test_scrape_times_out_without_supervisor_reply() {
        let (_supervisor_end, mut worker_end) = UnixStream::pair().unwrap();
        let (client, requests) = scrape_channel(Duration::from_millis(100));
        tokio::spawn(async move { coordinate(&mut worker_end, requests).await });

        assert!(matches!(
            client.scrape_async().await,
            Err(ExporterError::ScrapeTimeout { .. })
        ));
    }

    #[tokio::test]
    async fn test_scrape_fails_when_supervisor_dies_mid_response() {
        let (mut supervisor_end, mut worker_end) = UnixStream::pair().unwrap();
        let (client, requests) = scrape_channel(Duration::from_secs(5));
        let coordinator = tokio::spawn(async move { coordinate(&mut worker_end, requests).await });

        let scrape = tokio::spawn(async move { client.scrape_async().await });
        assert!(ipc::expect_token(&mut supervisor_end, ipc::SCRAPE_REQUEST)
            .await
            .unwrap());
        supervisor_end.write_all(&64u32.to_be_bytes()).await.unwrap();
        drop(supervisor_end);

        assert!(scrape.await.unwrap().is_err());
        assert!(matches!(
            coordinator.await.unwrap(),
            Err(ExporterError::PrematureClose { expected: 64, .. })
        ));
    }
}
