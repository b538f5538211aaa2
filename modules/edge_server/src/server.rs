//! HTTP and gRPC endpoints served as one unit.
//!
//! Both listeners are bound when the server is created so that a port clash
//! fails the module during construction, not after the rest of the process
//! has started. Serving begins with [`EdgeServer::run`] and ends with
//! [`EdgeServer::shutdown`] or [`EdgeServer::request_stop`].

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{http::StatusCode, Router};
use musterkit_bootstrap::{ServerConfig, SignalHandler};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

use crate::grpc::{GrpcInstallerStore, RegisterGrpcServiceFn};

/// Why [`EdgeServer::run`] returned without an error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunOutcome {
    /// [`EdgeServer::request_stop`] asked the whole process to end.
    StopRequested,
    /// The server was shut down, or an endpoint closed on its own.
    Closed,
}

struct Serving {
    http: JoinHandle<()>,
    grpc: JoinHandle<()>,
}

type EndpointResult = (&'static str, Result<()>);

pub struct EdgeServer {
    cfg: ServerConfig,
    http_addr: SocketAddr,
    grpc_addr: SocketAddr,
    listeners: Mutex<Option<(std::net::TcpListener, std::net::TcpListener)>>,
    router: Mutex<Router>,
    grpc: GrpcInstallerStore,
    signals: SignalHandler,
    http_stop: CancellationToken,
    grpc_stop: CancellationToken,
    closing: AtomicBool,
    serving: Mutex<Option<Serving>>,
}

impl EdgeServer {
    /// Bind both endpoints. Fails if either address is unavailable.
    pub fn bind(cfg: ServerConfig) -> Result<Self> {
        let http = bind_listener(cfg.http_bind_addr).context("binding HTTP endpoint")?;
        let grpc = bind_listener(cfg.grpc_bind_addr).context("binding gRPC endpoint")?;
        let http_addr = http.local_addr()?;
        let grpc_addr = grpc.local_addr()?;
        tracing::info!(%http_addr, %grpc_addr, "edge server bound");

        Ok(Self {
            cfg,
            http_addr,
            grpc_addr,
            listeners: Mutex::new(Some((http, grpc))),
            router: Mutex::new(Router::new()),
            grpc: GrpcInstallerStore::default(),
            signals: SignalHandler::new(Vec::new()),
            http_stop: CancellationToken::new(),
            grpc_stop: CancellationToken::new(),
            closing: AtomicBool::new(false),
            serving: Mutex::new(None),
        })
    }

    pub fn http_addr(&self) -> SocketAddr {
        self.http_addr
    }

    pub fn grpc_addr(&self) -> SocketAddr {
        self.grpc_addr
    }

    /// Add HTTP routes. Only possible before serving starts.
    pub fn merge_router(&self, routes: Router) -> Result<()> {
        self.ensure_not_serving()?;
        let mut router = self.router.lock();
        *router = std::mem::take(&mut *router).merge(routes);
        Ok(())
    }

    /// Add a gRPC service. Only possible before serving starts.
    pub fn add_grpc_service(&self, installer: RegisterGrpcServiceFn) -> Result<()> {
        self.ensure_not_serving()?;
        self.grpc.add(installer)
    }

    pub fn grpc_service_names(&self) -> Vec<&'static str> {
        self.grpc.service_names()
    }

    /// Ask the process to end: [`EdgeServer::run`] returns
    /// [`RunOutcome::StopRequested`]. The endpoints keep serving until
    /// [`EdgeServer::shutdown`].
    pub fn request_stop(&self) {
        tracing::info!("edge server: stop requested");
        self.signals.stop();
    }

    fn ensure_not_serving(&self) -> Result<()> {
        if self.listeners.lock().is_none() {
            anyhow::bail!("edge server is already serving");
        }
        Ok(())
    }

    /// Serve both endpoints until the server is stopped or one of them ends.
    pub async fn run(&self) -> Result<RunOutcome> {
        if self.closing.load(Ordering::SeqCst) {
            return Ok(RunOutcome::Closed);
        }
        let (http, grpc) = self
            .listeners
            .lock()
            .take()
            .context("edge server is already serving")?;
        let http = tokio::net::TcpListener::from_std(http)?;
        let grpc = tokio::net::TcpListener::from_std(grpc)?;

        let router = std::mem::take(&mut *self.router.lock())
            .layer(TimeoutLayer::with_status_code(
                StatusCode::REQUEST_TIMEOUT,
                self.cfg.http_request_timeout,
            ))
            .layer(TraceLayer::new_for_http());
        let routes = self.grpc.take_routes()?;

        let (done_tx, mut done_rx) = mpsc::channel::<EndpointResult>(2);

        let http_task = {
            let stop = self.http_stop.clone();
            let done = done_tx.clone();
            tokio::spawn(async move {
                tracing::info!(addr = ?http.local_addr().ok(), "HTTP endpoint serving");
                let result = axum::serve(http, router)
                    .with_graceful_shutdown(async move { stop.cancelled().await })
                    .await
                    .map_err(anyhow::Error::from);
                let _ = done.send(("HTTP", result)).await;
            })
        };

        let grpc_task = {
            let stop = self.grpc_stop.clone();
            let request_timeout = self.cfg.grpc_request_timeout;
            let keepalive = self.cfg.grpc_keepalive_interval;
            let done = done_tx;
            tokio::spawn(async move {
                tracing::info!(addr = ?grpc.local_addr().ok(), "gRPC endpoint serving");
                let result = tonic::transport::Server::builder()
                    .timeout(request_timeout)
                    .http2_keepalive_interval(Some(keepalive))
                    .layer(TraceLayer::new_for_grpc())
                    .add_routes(routes)
                    .serve_with_incoming_shutdown(TcpListenerStream::new(grpc), async move {
                        stop.cancelled().await
                    })
                    .await
                    .map_err(anyhow::Error::from);
                let _ = done.send(("gRPC", result)).await;
            })
        };

        *self.serving.lock() = Some(Serving {
            http: http_task,
            grpc: grpc_task,
        });

        // nothing ever sends on this channel; the loop ends on stop()
        let (_, never) = mpsc::channel(1);
        tokio::select! {
            result = self.signals.run_with(never) => {
                result?;
                if self.closing.load(Ordering::SeqCst) {
                    Ok(RunOutcome::Closed)
                } else {
                    Ok(RunOutcome::StopRequested)
                }
            }
            Some((endpoint, result)) = done_rx.recv() => match result {
                Ok(()) => {
                    tracing::info!(endpoint, "endpoint closed");
                    Ok(RunOutcome::Closed)
                }
                Err(e) => Err(e.context(format!("{endpoint} endpoint failed"))),
            },
        }
    }

    /// Stop accepting connections on both endpoints and wait for them to
    /// close. Both endpoints drain at the same time; in-flight requests and
    /// calls get `drain_timeout` to finish.
    pub async fn shutdown(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            tracing::debug!("edge server shutdown already requested");
        }
        self.signals.stop();
        self.http_stop.cancel();
        self.grpc_stop.cancel();

        let Some(serving) = self.serving.lock().take() else {
            return;
        };
        drain_endpoints(serving, self.cfg.drain_timeout).await;
        tracing::info!("edge server stopped");
    }
}

fn bind_listener(addr: SocketAddr) -> Result<std::net::TcpListener> {
    let listener =
        std::net::TcpListener::bind(addr).with_context(|| format!("address {addr} is not available"))?;
    listener.set_nonblocking(true)?;
    Ok(listener)
}

// gRPC streams such as health `Watch` never end on their own, so the gRPC
// drain is bounded too.
async fn drain_endpoints(serving: Serving, limit: Duration) {
    tokio::join!(
        drain("HTTP", serving.http, limit),
        drain("gRPC", serving.grpc, limit),
    );
}

async fn drain(endpoint: &'static str, mut task: JoinHandle<()>, limit: Duration) {
    match tokio::time::timeout(limit, &mut task).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!(endpoint, error = %e, "endpoint task aborted"),
        Err(_) => {
            tracing::warn!(endpoint, ?limit, "endpoint did not drain in time, aborting");
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::get;
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    fn local_cfg() -> ServerConfig {
        ServerConfig {
            http_bind_addr: "127.0.0.1:0".parse().unwrap(),
            grpc_bind_addr: "127.0.0.1:0".parse().unwrap(),
            drain_timeout: Duration::from_secs(1),
            ..ServerConfig::default()
        }
    }

    async fn http_get(addr: SocketAddr, path: &str) -> String {
        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[tokio::test]
    async fn binding_a_used_port_fails() {
        let first = EdgeServer::bind(local_cfg()).unwrap();
        let cfg = ServerConfig {
            http_bind_addr: first.http_addr(),
            ..local_cfg()
        };
        let err = EdgeServer::bind(cfg).err().unwrap();
        assert!(format!("{err:#}").contains("binding HTTP endpoint"));
    }

    #[tokio::test]
    async fn serves_routes_until_shutdown() {
        let server = Arc::new(EdgeServer::bind(local_cfg()).unwrap());
        server
            .merge_router(Router::new().route("/ping", get(|| async { "pong" })))
            .unwrap();

        let running = {
            let server = Arc::clone(&server);
            tokio::spawn(async move { server.run().await })
        };

        let mut response = String::new();
        for _ in 0..50 {
            response = http_get(server.http_addr(), "/ping").await;
            if !response.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(response.starts_with("HTTP/1.1 200"), "{response}");
        assert!(response.ends_with("pong"));

        // routes are frozen once serving
        assert!(server.merge_router(Router::new()).is_err());

        timeout(WAIT, server.shutdown()).await.unwrap();
        let outcome = timeout(WAIT, running).await.unwrap().unwrap().unwrap();
        assert_eq!(outcome, RunOutcome::Closed);
    }

    #[tokio::test]
    async fn slow_handlers_time_out_with_408() {
        let cfg = ServerConfig {
            http_request_timeout: Duration::from_millis(100),
            ..local_cfg()
        };
        let server = Arc::new(EdgeServer::bind(cfg).unwrap());
        server
            .merge_router(Router::new().route(
                "/slow",
                get(|| async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    "late"
                }),
            ))
            .unwrap();
        let running = {
            let server = Arc::clone(&server);
            tokio::spawn(async move { server.run().await })
        };

        let response = timeout(WAIT, http_get(server.http_addr(), "/slow")).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 408"), "{response}");

        timeout(WAIT, server.shutdown()).await.unwrap();
        timeout(WAIT, running).await.unwrap().unwrap().unwrap();
    }

    #[tokio::test]
    async fn endpoints_drain_together_within_the_limit() {
        let limit = Duration::from_millis(200);
        let hanging = || tokio::spawn(std::future::pending::<()>());
        let serving = Serving {
            http: hanging(),
            grpc: hanging(),
        };

        let started = std::time::Instant::now();
        timeout(WAIT, drain_endpoints(serving, limit)).await.unwrap();
        let elapsed = started.elapsed();
        assert!(elapsed >= limit, "{elapsed:?}");
        assert!(elapsed < limit * 2, "drained one after the other: {elapsed:?}");
    }

    #[tokio::test]
    async fn shutdown_does_not_wait_for_a_stuck_request() {
        let cfg = ServerConfig {
            drain_timeout: Duration::from_millis(200),
            ..local_cfg()
        };
        let server = Arc::new(EdgeServer::bind(cfg).unwrap());
        server
            .merge_router(Router::new().route(
                "/stuck",
                get(|| async {
                    tokio::time::sleep(Duration::from_secs(10)).await;
                    "done"
                }),
            ))
            .unwrap();
        let running = {
            let server = Arc::clone(&server);
            tokio::spawn(async move { server.run().await })
        };
        let addr = server.http_addr();
        let _client = tokio::spawn(async move { http_get(addr, "/stuck").await });
        tokio::time::sleep(Duration::from_millis(100)).await;

        let started = std::time::Instant::now();
        timeout(WAIT, server.shutdown()).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(2), "{:?}", started.elapsed());
        timeout(WAIT, running).await.unwrap().unwrap().unwrap();
    }

    #[tokio::test]
    async fn request_stop_ends_run_with_stop_requested() {
        let server = Arc::new(EdgeServer::bind(local_cfg()).unwrap());
        let running = {
            let server = Arc::clone(&server);
            tokio::spawn(async move { server.run().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        server.request_stop();
        let outcome = timeout(WAIT, running).await.unwrap().unwrap().unwrap();
        assert_eq!(outcome, RunOutcome::StopRequested);

        timeout(WAIT, server.shutdown()).await.unwrap();
    }

    #[tokio::test]
    async fn run_after_shutdown_is_closed() {
        let server = EdgeServer::bind(local_cfg()).unwrap();
        server.shutdown().await;
        assert_eq!(server.run().await.unwrap(), RunOutcome::Closed);
    }

    #[tokio::test]
    async fn duplicate_grpc_service_is_rejected() {
        let server = EdgeServer::bind(local_cfg()).unwrap();
        server
            .add_grpc_service(RegisterGrpcServiceFn::new("muster.v1.Users", |_| {}))
            .unwrap();
        assert!(server
            .add_grpc_service(RegisterGrpcServiceFn::new("muster.v1.Users", |_| {}))
            .is_err());
        assert_eq!(server.grpc_service_names(), vec!["muster.v1.Users"]);
    }
}
