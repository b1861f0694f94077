//! Round-robins accepted connections across a fixed pool of single-threaded
//! worker runtimes.
//!
//! A connection's response writer queue holds non-`Send` state so that its
//! mutex guard can be held across the `.await` points needed to write to the
//! socket; so once a connection is assigned to a worker, it and every task it
//! spawns stay on that worker's thread for the connection's whole lifetime.
//! Each worker therefore owns a `current_thread` runtime paired with a
//! `LocalSet` rather than sharing a multi-threaded one.

use std::io;
use std::net::TcpStream as StdTcpStream;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::Bytes;
use http_body::Body;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::LocalSet;
use tracing::{error, warn};

use crate::config::ServerConfig;
use crate::connection::HttpConnection;
use crate::handler::Handler;
use crate::listener::registry::ConnectionRegistry;

struct Worker {
    sender: mpsc::UnboundedSender<StdTcpStream>,
}

/// A fixed pool of worker threads that accepted connections are dispatched
/// to in round-robin order.
pub(crate) struct WorkerPool {
    workers: Vec<Worker>,
    next: AtomicUsize,
}

impl WorkerPool {
    pub(crate) fn spawn<H>(
        config: Arc<ServerConfig>,
        handler: Arc<H>,
        registry: Arc<ConnectionRegistry>,
        shutdown: watch::Receiver<bool>,
    ) -> Self
    where
        H: Handler + 'static,
        H::RespBody: Body<Data = Bytes> + Unpin + 'static,
        <H::RespBody as Body>::Error: std::fmt::Display,
    {
        let worker_count = config.worker_threads().get();
        let mut workers = Vec::with_capacity(worker_count);

        for index in 0..worker_count {
            let (sender, receiver) = mpsc::unbounded_channel::<StdTcpStream>();
            let handler = Arc::clone(&handler);
            let config = Arc::clone(&config);
            let registry = Arc::clone(&registry);
            let shutdown = shutdown.clone();

            std::thread::Builder::new()
                .name(format!("streamcore-worker-{index}"))
                .spawn(move || run_worker(receiver, handler, config, registry, shutdown))
                .expect("failed to spawn worker thread");

            workers.push(Worker { sender });
        }

        Self { workers, next: AtomicUsize::new(0) }
    }

    /// Hands an accepted socket to the next worker in round-robin order.
    pub(crate) fn dispatch(&self, stream: StdTcpStream) -> io::Result<()> {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        self.workers[index].sender.send(stream).map_err(|_| io::Error::other("worker thread has shut down"))
    }
}

fn run_worker<H>(
    mut receiver: mpsc::UnboundedReceiver<StdTcpStream>,
    handler: Arc<H>,
    config: Arc<ServerConfig>,
    registry: Arc<ConnectionRegistry>,
    shutdown: watch::Receiver<bool>,
) where
    H: Handler + 'static,
    H::RespBody: Body<Data = Bytes> + Unpin + 'static,
    <H::RespBody as Body>::Error: std::fmt::Display,
{
    let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().expect("failed to build worker runtime");
    let local = LocalSet::new();

    local.block_on(&runtime, async move {
        while let Some(std_stream) = receiver.recv().await {
            let stream = match TcpStream::from_std(std_stream) {
                Ok(stream) => stream,
                Err(e) => {
                    error!("failed to register accepted socket on worker runtime: {}", e);
                    continue;
                }
            };
            if let Err(e) = stream.set_nodelay(true) {
                warn!("failed to set TCP_NODELAY: {}", e);
            }

            let handler = Arc::clone(&handler);
            let config = Arc::clone(&config);
            let guard = registry.register();
            let shutdown = shutdown.clone();

            tokio::task::spawn_local(async move {
                let _guard = guard;
                let (reader, writer) = stream.into_split();
                let connection = HttpConnection::with_config(reader, writer, config.keep_alive_timeout(), config.max_pipeline_depth());

                if let Err(e) = connection.process(handler, shutdown).await {
                    error!("connection ended with error: {}", e);
                }
            });
        }
    });
}
