//! Ordered command processor pool.
//!
//! A fixed set of worker tasks, each draining its own FIFO queue. Commands
//! are sharded by connection token, so one connection's commands execute in
//! arrival order while different connections run in parallel.

use crate::connection::Connection;
use crate::dispatch::{Dispatcher, Outcome};
use crate::error::ConnectionError;
use crate::protocol::Command;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

enum Job {
    Execute { conn: Arc<Connection>, cmd: Command },
    /// Completes once every job queued before it on the shard has run.
    Barrier(oneshot::Sender<()>),
}

/// Pool of ordered command workers.
pub struct CommandProcessorPool {
    shards: Vec<mpsc::UnboundedSender<Job>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl CommandProcessorPool {
    /// Spawn `workers` shard workers (at least one) on the current runtime.
    pub fn new(workers: usize, dispatcher: Arc<Dispatcher>) -> Self {
        let workers = workers.max(1);
        let mut shards = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);

        for shard in 0..workers {
            let (tx, rx) = mpsc::unbounded_channel();
            shards.push(tx);
            handles.push(tokio::spawn(worker_loop(shard, rx, Arc::clone(&dispatcher))));
        }
        debug!(workers, "Command processor pool started");

        Self {
            shards,
            workers: Mutex::new(handles),
        }
    }

    pub fn worker_count(&self) -> usize {
        self.shards.len()
    }

    fn shard(&self, token: usize) -> &mpsc::UnboundedSender<Job> {
        &self.shards[token % self.shards.len()]
    }

    /// Queue a command behind everything previously queued for its connection.
    pub fn submit(&self, conn: Arc<Connection>, cmd: Command) -> Result<(), ConnectionError> {
        let token = conn.token();
        self.shard(token)
            .send(Job::Execute { conn, cmd })
            .map_err(|_| ConnectionError::Disposed)
    }

    /// Wait until every command queued so far for `token` has executed.
    pub async fn barrier(&self, token: usize) {
        let (tx, rx) = oneshot::channel();
        if self.shard(token).send(Job::Barrier(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    /// Stop every worker. Queued jobs are dropped.
    pub fn shutdown(&self) {
        for handle in self.workers.lock().drain(..) {
            handle.abort();
        }
    }
}

impl Drop for CommandProcessorPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn worker_loop(shard: usize, mut rx: mpsc::UnboundedReceiver<Job>, dispatcher: Arc<Dispatcher>) {
    while let Some(job) = rx.recv().await {
        match job {
            Job::Execute { conn, cmd } => {
                if conn.is_disposed() {
                    trace!(shard, conn_id = conn.token(), "Skipping command for disposed connection");
                    continue;
                }
                let kind = cmd.kind;
                if dispatcher.dispatch(&conn, cmd) != Outcome::Continue {
                    // Handshake and disconnect run on the reader task.
                    warn!(shard, conn_id = conn.token(), command = %kind, "Connection control command ran on a worker");
                }
            }
            Job::Barrier(done) => {
                let _ = done.send(());
            }
        }
    }
    trace!(shard, "Command processor stopped");
}
