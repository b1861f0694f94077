//! Server configuration.
//!
//! `ServerConfig` gathers the knobs the listener and each connection need:
//! where to bind, how long a connection may sit idle on keep-alive, how deep
//! a single connection's pipeline may get before it applies back-pressure, and
//! how many worker threads to spread accepted connections across.
//!
//! A fluent builder returning a `Result` from `build()`, generalized from a
//! single router-backed handler to an arbitrary bind target and worker pool
//! size.

use std::net::{SocketAddr, ToSocketAddrs};
use std::num::NonZeroUsize;
use std::time::Duration;

use thiserror::Error;

const DEFAULT_KEEP_ALIVE_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_BACKLOG: u32 = 4096;
const DEFAULT_MAX_PIPELINE_DEPTH: usize = 32;

/// Immutable server configuration produced by [`ServerConfigBuilder`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub(crate) addr: SocketAddr,
    pub(crate) keep_alive_timeout: Duration,
    pub(crate) backlog: u32,
    pub(crate) max_pipeline_depth: usize,
    pub(crate) worker_threads: NonZeroUsize,
    pub(crate) tls: Option<TlsConfig>,
}

impl ServerConfig {
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::new()
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn keep_alive_timeout(&self) -> Duration {
        self.keep_alive_timeout
    }

    pub fn backlog(&self) -> u32 {
        self.backlog
    }

    pub fn max_pipeline_depth(&self) -> usize {
        self.max_pipeline_depth
    }

    pub fn worker_threads(&self) -> NonZeroUsize {
        self.worker_threads
    }

    pub fn tls(&self) -> Option<&TlsConfig> {
        self.tls.as_ref()
    }
}

/// Opaque placeholder for TLS configuration. The core network engine never
/// performs a TLS handshake itself; a caller that wants TLS terminates it in
/// front of the engine and this type exists only so that intent can be
/// threaded through `ServerConfig` without the engine depending on a TLS
/// implementation.
#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    _private: (),
}

/// Builder for [`ServerConfig`].
#[derive(Debug, Default)]
pub struct ServerConfigBuilder {
    addr: Option<SocketAddr>,
    keep_alive_timeout: Option<Duration>,
    backlog: Option<u32>,
    max_pipeline_depth: Option<usize>,
    worker_threads: Option<NonZeroUsize>,
    tls: Option<TlsConfig>,
}

impl ServerConfigBuilder {
    fn new() -> Self {
        Self::default()
    }

    pub fn bind<A: ToSocketAddrs>(mut self, addr: A) -> Result<Self, ConfigError> {
        let addr = addr.to_socket_addrs().map_err(|e| ConfigError::InvalidAddress { reason: e.to_string() })?.next().ok_or_else(|| {
            ConfigError::InvalidAddress { reason: "address resolved to no socket addresses".to_string() }
        })?;
        self.addr = Some(addr);
        Ok(self)
    }

    pub fn keep_alive_timeout(mut self, timeout: Duration) -> Self {
        self.keep_alive_timeout = Some(timeout);
        self
    }

    pub fn backlog(mut self, backlog: u32) -> Self {
        self.backlog = Some(backlog);
        self
    }

    pub fn max_pipeline_depth(mut self, depth: usize) -> Self {
        self.max_pipeline_depth = Some(depth);
        self
    }

    /// Number of single-threaded worker runtimes connections are round-robined
    /// across. Defaults to [`std::thread::available_parallelism`].
    pub fn worker_threads(mut self, threads: NonZeroUsize) -> Self {
        self.worker_threads = Some(threads);
        self
    }

    /// Sets opaque TLS configuration. The engine never reads this beyond
    /// carrying it; terminating TLS is the caller's responsibility.
    pub fn tls(mut self, tls: TlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn build(self) -> Result<ServerConfig, ConfigError> {
        let addr = self.addr.ok_or(ConfigError::MissingAddress)?;
        let worker_threads = match self.worker_threads {
            Some(n) => n,
            None => std::thread::available_parallelism().unwrap_or(NonZeroUsize::new(1).unwrap()),
        };

        Ok(ServerConfig {
            addr,
            keep_alive_timeout: self.keep_alive_timeout.unwrap_or(DEFAULT_KEEP_ALIVE_TIMEOUT),
            backlog: self.backlog.unwrap_or(DEFAULT_BACKLOG),
            max_pipeline_depth: self.max_pipeline_depth.unwrap_or(DEFAULT_MAX_PIPELINE_DEPTH),
            worker_threads,
            tls: self.tls,
        })
    }
}

/// Errors that can occur while building a [`ServerConfig`].
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("address must be set")]
    MissingAddress,

    #[error("invalid bind address: {reason}")]
    InvalidAddress { reason: String },
}
