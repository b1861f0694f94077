//! Accept loop and graceful shutdown orchestration.
//!
//! [`Listener::bind`] opens the listening socket; [`Listener::serve`] then
//! round-robins accepted connections across a [`WorkerPool`] and coordinates
//! graceful shutdown: once asked to stop, it stops accepting, broadcasts
//! shutdown to every connection's keep-alive loop, and waits for in-flight
//! connections to drain before returning. Splitting bind from serve lets a
//! caller read [`Listener::bound_port`] and [`Listener::live_connections`]
//! while the accept loop is still running.

mod registry;
mod worker_pool;

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body::Body;
use socket2::{Domain, Socket, Type};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::config::ServerConfig;
use crate::handler::Handler;
use registry::ConnectionRegistry;
use worker_pool::WorkerPool;

/// Interval the listener polls the connection registry while draining
/// in-flight connections during graceful shutdown.
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// A bound listening socket together with its live-connection registry.
///
/// Cloning the registry handle out via [`Listener::live_connections`] before
/// calling [`Listener::serve`] is how a caller observes the live count while
/// the accept loop (which consumes `self`) is running.
pub struct Listener {
    tcp: TcpListener,
    registry: Arc<ConnectionRegistry>,
}

impl Listener {
    /// Binds a listening socket with an explicit backlog, which
    /// `TcpListener::bind` doesn't expose.
    pub fn bind(addr: SocketAddr, backlog: u32) -> io::Result<Self> {
        let domain = Domain::for_address(addr);
        let socket = Socket::new(domain, Type::STREAM, None)?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        socket.listen(backlog as i32)?;

        Ok(Self { tcp: TcpListener::from_std(socket.into())?, registry: Arc::new(ConnectionRegistry::new()) })
    }

    /// The port the kernel assigned, useful when [`ServerConfig::addr`] was
    /// bound with port `0`.
    pub fn bound_port(&self) -> io::Result<u16> {
        Ok(self.tcp.local_addr()?.port())
    }

    /// Number of connections currently dispatched to a worker.
    pub fn live_connections(&self) -> usize {
        self.registry.active_connections()
    }

    /// Runs the accept loop until `shutdown`'s watched value becomes `true`,
    /// then waits for every dispatched connection to finish before returning.
    ///
    /// Connections are round-robined across a pool of single-threaded
    /// workers sized to [`ServerConfig::worker_threads`]; `shutdown` is
    /// cloned into each worker so in-flight requests are allowed to complete
    /// while no new connection is accepted.
    pub async fn serve<H>(self, config: ServerConfig, handler: Arc<H>, mut shutdown: watch::Receiver<bool>) -> io::Result<()>
    where
        H: Handler + 'static,
        H::RespBody: Body<Data = Bytes> + Unpin + 'static,
        <H::RespBody as Body>::Error: std::fmt::Display,
    {
        let config = Arc::new(config);
        info!(addr = %config.addr(), "listening");

        let pool = WorkerPool::spawn(Arc::clone(&config), handler, Arc::clone(&self.registry), shutdown.clone());

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    info!("shutdown requested, no longer accepting new connections");
                    break;
                }
                result = self.tcp.accept() => {
                    match result {
                        Ok((stream, _addr)) => {
                            let std_stream = match stream.into_std() {
                                Ok(std_stream) => std_stream,
                                Err(e) => {
                                    error!("failed to hand off accepted socket: {}", e);
                                    continue;
                                }
                            };
                            if let Err(e) = pool.dispatch(std_stream) {
                                error!("failed to dispatch accepted connection: {}", e);
                            }
                        }
                        Err(e) => warn!("failed to accept connection: {}", e),
                    }
                }
            }
        }

        while self.registry.active_connections() > 0 {
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }
        info!("all connections drained, shutdown complete");

        Ok(())
    }
}
