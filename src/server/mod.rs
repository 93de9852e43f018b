//! Server Bootstrap
//!
//! Binds the listener, starts the worker threads and hands each accepted
//! socket to one of them, round-robin.
//!
//! ```text
//!            ┌──────────────┐
//!            │  acceptor    │  (multi-threaded runtime)
//!            └──────┬───────┘
//!                   │ std::net::TcpStream
//!       ┌───────────┼───────────┐
//!       ▼           ▼           ▼
//!  ┌─────────┐ ┌─────────┐ ┌─────────┐
//!  │worker 0 │ │worker 1 │ │worker N │  current_thread runtime + LocalSet
//!  │sessions │ │sessions │ │sessions │  each, one OS thread each
//!  └─────────┘ └─────────┘ └─────────┘
//!       │           │           │
//!       └───────────┴───────────┘
//!                   │
//!                   ▼
//!            Arc<ServerContext>
//! ```

pub mod context;
pub mod pubsub;
pub mod slowlog;
pub mod stats;

pub use context::{ServerContext, ServerStatus};
pub use pubsub::{Mailbox, PubSubRegistry};
pub use slowlog::{SlowLog, SlowLogEntry};
pub use stats::{CommandStatsSnapshot, ServerStats};

use crate::config::Config;
use crate::connection::{serve_connection, Worker};
use crate::storage::{ExpirySweeper, StorageEngine, DEFAULT_SWEEP_INTERVAL};
use anyhow::Context as _;
use std::cell::RefCell;
use std::future::Future;
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::LocalSet;
use tracing::{debug, error, info, warn};

type Handoff = (std::net::TcpStream, SocketAddr);

/// Handle to one worker thread.
struct WorkerThread {
    id: usize,
    handoff: mpsc::UnboundedSender<Handoff>,
    thread: JoinHandle<()>,
}

impl WorkerThread {
    fn spawn(id: usize, ctx: Arc<ServerContext>) -> std::io::Result<Self> {
        let (handoff, rx) = mpsc::unbounded_channel();
        let thread = std::thread::Builder::new()
            .name(format!("sparkkv-worker-{}", id))
            .spawn(move || run_worker(id, ctx, rx))?;
        Ok(Self {
            id,
            handoff,
            thread,
        })
    }

    /// Hands an accepted socket to this worker.
    fn assign(&self, stream: std::net::TcpStream, peer: SocketAddr) -> bool {
        self.handoff.send((stream, peer)).is_ok()
    }
}

/// Body of a worker thread: a single-threaded runtime whose `LocalSet` runs
/// every connection task of this worker.
fn run_worker(id: usize, ctx: Arc<ServerContext>, mut rx: mpsc::UnboundedReceiver<Handoff>) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(worker = id, error = %e, "Failed to build worker runtime");
            return;
        }
    };

    let idle_timeout = ctx.config.idle_timeout();
    let worker = Rc::new(RefCell::new(Worker::new(id, ctx)));
    let local = LocalSet::new();

    local.block_on(&runtime, async move {
        debug!(worker = id, "Worker started");
        while let Some((stream, peer)) = rx.recv().await {
            let stream = match TcpStream::from_std(stream) {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(worker = id, client = %peer, error = %e, "Failed to register socket");
                    continue;
                }
            };
            if let Err(e) = stream.set_nodelay(true) {
                debug!(worker = id, error = %e, "Failed to set TCP_NODELAY");
            }
            tokio::task::spawn_local(serve_connection(
                Rc::clone(&worker),
                stream,
                peer,
                idle_timeout,
            ));
        }
        debug!(worker = id, sessions = worker.borrow().len(), "Worker stopping");
    });
}

/// The assembled server.
pub struct Server {
    ctx: Arc<ServerContext>,
}

impl Server {
    pub fn new(config: Config) -> Self {
        let storage = Arc::new(StorageEngine::new());
        Self {
            ctx: Arc::new(ServerContext::new(config, storage)),
        }
    }

    pub fn context(&self) -> &Arc<ServerContext> {
        &self.ctx
    }

    /// Binds the configured address.
    pub async fn bind(&self) -> anyhow::Result<TcpListener> {
        let addr = self.ctx.config.bind_address();
        TcpListener::bind(&addr)
            .await
            .with_context(|| format!("failed to bind {}", addr))
    }

    /// Serves `listener` until `shutdown` resolves.
    ///
    /// Must be called from a Tokio runtime; worker threads run their own.
    pub async fn run(
        self,
        listener: TcpListener,
        shutdown: impl Future<Output = ()>,
    ) -> anyhow::Result<()> {
        let _sweeper = ExpirySweeper::start(Arc::clone(&self.ctx.storage), DEFAULT_SWEEP_INTERVAL);

        let workers = (0..self.ctx.config.workers)
            .map(|id| WorkerThread::spawn(id, Arc::clone(&self.ctx)))
            .collect::<std::io::Result<Vec<_>>>()
            .context("failed to spawn worker threads")?;
        info!(
            address = %listener.local_addr()?,
            workers = workers.len(),
            "Accepting connections"
        );

        tokio::select! {
            _ = accept_loop(&listener, &workers) => {}
            _ = shutdown => info!("Shutdown signal received, stopping server..."),
        }

        // Closing the handoff channels lets each worker's loop finish.
        let threads: Vec<_> = workers
            .into_iter()
            .map(|WorkerThread { id, handoff, thread }| {
                drop(handoff);
                (id, thread)
            })
            .collect();
        tokio::task::spawn_blocking(move || {
            for (id, thread) in threads {
                if thread.join().is_err() {
                    error!(worker = id, "Worker thread panicked");
                }
            }
        })
        .await?;

        info!("Server shutdown complete");
        Ok(())
    }
}

async fn accept_loop(listener: &TcpListener, workers: &[WorkerThread]) {
    let mut next = 0usize;
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                error!(error = %e, "Failed to accept connection");
                continue;
            }
        };
        let stream = match stream.into_std() {
            Ok(stream) => stream,
            Err(e) => {
                warn!(client = %peer, error = %e, "Failed to detach socket");
                continue;
            }
        };

        let worker = &workers[next % workers.len()];
        next = next.wrapping_add(1);
        if !worker.assign(stream, peer) {
            error!(worker = worker.id, client = %peer, "Worker is gone, dropping connection");
        }
    }
}
