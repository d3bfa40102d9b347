//! TCP server for cache client connections.
//!
//! The [`ConnectionManager`] owns the listening socket and every connection's
//! lifecycle: it accepts sockets, runs one reader task per connection that
//! decodes frames and dispatches commands, and runs the background tasks
//! (bad-client/idle monitor, event routing and bulk delivery, ledger janitor,
//! storage expiry).

use crate::buffer::BufferPool;
use crate::config::Config;
use crate::connection::{Connection, Priority};
use crate::dispatch::{DispatchSettings, Dispatcher, Outcome, Throttle};
use crate::engine::{CacheEngine, LocalCache};
use crate::error::ConnectionError;
use crate::events::{encode_events, event_channel, Event, SubscriptionTable};
use crate::ledger::{Ledger, RequestStatus};
use crate::processor::CommandProcessorPool;
use crate::protocol::header::MAX_REQUEST_LEN;
use crate::protocol::{token, Command, FrameDecoder, Response};
use crate::registry::ConnectionRegistry;
use crate::storage::Storage;
use parking_lot::Mutex;
use socket2::SockRef;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// Longest wait between event-queue checks.
const EVENT_TICK: Duration = Duration::from_millis(100);

/// Server instance
pub struct ConnectionManager {
    config: Config,
    registry: Arc<ConnectionRegistry>,
    subscriptions: Arc<SubscriptionTable>,
    dispatcher: Arc<Dispatcher>,
    buffers: BufferPool,
    processors: Option<CommandProcessorPool>,
    /// Set when the bundled local engine is in use.
    storage: Option<Arc<Storage>>,
    events: Mutex<Option<mpsc::UnboundedReceiver<Event>>>,
    shutdown: watch::Sender<bool>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl ConnectionManager {
    /// Create a server in front of `engine`, routing the events it publishes.
    ///
    /// Must be called inside a Tokio runtime when command processors are
    /// configured.
    pub fn new(
        config: Config,
        engine: Arc<dyn CacheEngine>,
        events: mpsc::UnboundedReceiver<Event>,
    ) -> Arc<Self> {
        Self::build(config, engine, events, None)
    }

    /// Create a server backed by the bundled in-process cache.
    pub fn with_local_cache(config: Config) -> Arc<Self> {
        let storage = Storage::new(config.max_memory, config.default_ttl);
        let (publisher, events) = event_channel();
        let engine = Arc::new(LocalCache::new(Arc::clone(&storage), publisher));
        Self::build(config, engine, events, Some(storage))
    }

    fn build(
        config: Config,
        engine: Arc<dyn CacheEngine>,
        events: mpsc::UnboundedReceiver<Event>,
        storage: Option<Arc<Storage>>,
    ) -> Arc<Self> {
        let registry = Arc::new(ConnectionRegistry::new(config.max_connections));
        let subscriptions = Arc::new(SubscriptionTable::new());
        let dispatcher = Arc::new(Dispatcher::new(
            engine,
            Arc::new(Ledger::new()),
            Arc::clone(&registry),
            Arc::clone(&subscriptions),
            Throttle::new(config.max_requests_per_second),
            DispatchSettings::from(&config),
        ));
        let processors = (config.command_processors > 0)
            .then(|| CommandProcessorPool::new(config.command_processors, Arc::clone(&dispatcher)));
        let (shutdown, _) = watch::channel(false);

        Arc::new(Self {
            buffers: BufferPool::new(config.buffer_pool_size, config.buffer_size),
            config,
            registry,
            subscriptions,
            dispatcher,
            processors,
            storage,
            events: Mutex::new(Some(events)),
            shutdown,
            background: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    /// Ledger status of a client's request.
    pub fn request_status(&self, client_id: &str, request_id: i64, command_id: i64) -> RequestStatus {
        self.dispatcher.request_status(client_id, request_id, command_id)
    }

    /// Bind the configured listen address.
    pub fn bind(&self) -> io::Result<TcpListener> {
        let addr: SocketAddr = self
            .config
            .listen
            .parse()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let socket = socket2::Socket::new(
            match addr {
                SocketAddr::V4(_) => socket2::Domain::IPV4,
                SocketAddr::V6(_) => socket2::Domain::IPV6,
            },
            socket2::Type::STREAM,
            Some(socket2::Protocol::TCP),
        )?;

        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        socket.listen(self.config.max_pending_connections as i32)?;

        TcpListener::from_std(socket.into())
    }

    /// Bind and serve until [`shutdown`](Self::shutdown) is called.
    pub async fn run(self: Arc<Self>) -> io::Result<()> {
        let listener = self.bind()?;
        self.serve(listener).await
    }

    /// Accept connections on `listener` until shutdown.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> io::Result<()> {
        let local = listener.local_addr()?;
        info!(
            address = %local,
            max_connections = self.config.max_connections,
            processors = self.processors.as_ref().map_or(0, CommandProcessorPool::worker_count),
            ack = self.config.enable_acknowledgement,
            pipeline = self.config.enable_pipelining,
            fragment_size = self.config.fragment_size,
            "Server listening"
        );
        self.start_background();

        let mut shutdown = self.shutdown.subscribe();
        loop {
            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                _ = shutdown.wait_for(|stop| *stop) => break,
            };
            match accepted {
                Ok((stream, peer)) => self.accept(stream, peer),
                Err(e) => error!(error = %e, "Failed to accept connection"),
            }
        }

        info!(address = %local, "Server stopped accepting connections");
        Ok(())
    }

    /// Dispose every connection and stop the background tasks. Runs once.
    pub fn shutdown(&self) {
        if self.shutdown.send_replace(true) {
            return;
        }
        let connections = self.registry.snapshot();
        info!(connections = connections.len(), "Shutting down");
        for conn in connections {
            conn.dispose();
        }
        if let Some(pool) = &self.processors {
            pool.shutdown();
        }
        for handle in self.background.lock().drain(..) {
            handle.abort();
        }
    }

    fn accept(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        if let Err(e) = self.configure_socket(&stream) {
            debug!(peer = %peer, error = %e, "Failed to set socket options");
        }

        let (reader, writer) = stream.into_split();
        let ratio = self.config.event_priority_ratio;
        let Some(conn) = self
            .registry
            .insert_with(|token| Connection::new(token, peer, Box::new(writer), ratio))
        else {
            warn!(
                peer = %peer,
                max_connections = self.registry.capacity(),
                "Connection limit reached, rejecting"
            );
            return;
        };

        debug!(conn_id = conn.token(), peer = %peer, "New connection");
        tokio::spawn(Arc::clone(self).handle_connection(conn, reader));
    }

    fn configure_socket(&self, stream: &TcpStream) -> io::Result<()> {
        stream.set_nodelay(true)?;
        let socket = SockRef::from(stream);
        socket.set_send_buffer_size(self.config.send_buffer_size)?;
        socket.set_recv_buffer_size(self.config.receive_buffer_size)?;
        Ok(())
    }

    /// Reader task: runs until the connection is disposed or fails, then
    /// releases it.
    async fn handle_connection(self: Arc<Self>, conn: Arc<Connection>, mut reader: OwnedReadHalf) {
        let mut decoder = FrameDecoder::new(self.buffers.checkout(), MAX_REQUEST_LEN);

        match self.read_commands(&conn, &mut reader, &mut decoder).await {
            Ok(()) => trace!(conn_id = conn.token(), "Client left"),
            Err(e) if e.is_disconnect() => trace!(conn_id = conn.token(), error = %e, "Connection ended"),
            Err(ConnectionError::Protocol(e)) => warn!(
                conn_id = conn.token(),
                peer = %conn.peer(),
                error = %e,
                "Protocol violation, closing connection"
            ),
            Err(e) => debug!(conn_id = conn.token(), peer = %conn.peer(), error = %e, "Connection error"),
        }

        conn.dispose();
        conn.shutdown().await;
        self.release(&conn);
        self.buffers.checkin(decoder.into_buffer());
    }

    async fn read_commands(
        &self,
        conn: &Arc<Connection>,
        reader: &mut OwnedReadHalf,
        decoder: &mut FrameDecoder,
    ) -> Result<(), ConnectionError> {
        let mut closed = conn.closed();
        let min_read = self.buffers.buffer_size().max(1024);

        loop {
            while let Some(frame) = decoder.next_frame()? {
                let cmd = Command::parse(frame)?;
                match self.execute(conn, cmd).await? {
                    Outcome::Continue => {}
                    Outcome::Handshake(caps) => decoder.set_capabilities(caps),
                    Outcome::Close => {
                        conn.close_after_flush();
                        let flushed = tokio::time::timeout(
                            self.config.client_send_timeout,
                            closed.wait_for(|closed| *closed),
                        );
                        if flushed.await.is_err() {
                            debug!(conn_id = conn.token(), "Timed out flushing before close");
                        }
                        return Ok(());
                    }
                }
            }

            let buf = decoder.buffer_mut();
            if buf.capacity() - buf.len() < min_read / 4 {
                buf.reserve(min_read);
            }
            let n = tokio::select! {
                read = reader.read_buf(buf) => read?,
                _ = closed.wait_for(|closed| *closed) => return Err(ConnectionError::Disposed),
            };
            if n == 0 {
                return Err(ConnectionError::ClientQuit);
            }
            conn.touch();
        }
    }

    /// Run a command inline or hand it to the processor pool. Connection
    /// control commands always run inline once the connection's queued
    /// commands finished, since they change how the next bytes are decoded.
    async fn execute(&self, conn: &Arc<Connection>, cmd: Command) -> Result<Outcome, ConnectionError> {
        match &self.processors {
            Some(pool) if !cmd.kind.is_connection_control() => {
                pool.submit(Arc::clone(conn), cmd)?;
                Ok(Outcome::Continue)
            }
            Some(pool) => {
                pool.barrier(conn.token()).await;
                Ok(self.dispatcher.dispatch(conn, cmd))
            }
            None => Ok(self.dispatcher.dispatch(conn, cmd)),
        }
    }

    /// Drop a disposed connection from every table. Called once per
    /// connection, by its reader task.
    fn release(&self, conn: &Arc<Connection>) {
        // Subscriptions go first so a reused token starts with none.
        self.subscriptions.remove_connection(conn.token());
        self.registry.remove(conn.token());

        if let Some(client_id) = conn.client_id() {
            let rebound = self.registry.by_client(&client_id).is_some();
            let ledger = self.dispatcher.ledger();
            if conn.left_gracefully() {
                ledger.remove_client_account(&client_id);
            } else if !rebound {
                ledger.client_disconnected(&client_id);
            }
            if rebound {
                debug!(client_id = %client_id, conn_id = conn.token(), "Client already rebound, skipping disconnect notification");
            } else {
                self.dispatcher.engine().on_client_disconnected(&client_id);
            }
        }

        debug!(
            conn_id = conn.token(),
            peer = %conn.peer(),
            client_id = ?conn.client_id(),
            graceful = conn.left_gracefully(),
            "Connection closed"
        );
    }

    fn start_background(self: &Arc<Self>) {
        let mut tasks = Vec::new();

        if self.config.enable_bad_client_detection || self.config.idle_timeout.is_some() {
            let server = Arc::clone(self);
            tasks.push(self.every(self.config.monitor_interval, move || {
                server.scan(Instant::now());
            }));
        }

        if let Some(events) = self.events.lock().take() {
            tasks.push(tokio::spawn(Arc::clone(self).route_events(events)));
        }
        let server = Arc::clone(self);
        tasks.push(self.every(self.config.event_bulk_interval.min(EVENT_TICK), move || {
            server.flush_due_events(Instant::now());
        }));

        let ledger = Arc::clone(self.dispatcher.ledger());
        let retention = self.config.ledger_retention;
        tasks.push(self.every(self.config.ledger_cleanup_interval, move || {
            ledger.cleanup(retention);
        }));

        if let Some(storage) = self.storage.clone() {
            let period = Duration::from_secs(self.config.cleanup_interval.max(1));
            tasks.push(self.every(period, move || {
                let count = storage.cleanup_expired();
                if count > 0 {
                    debug!(count, "Cleaned up expired items");
                }
            }));
        }

        self.background.lock().extend(tasks);
    }

    /// Spawn a task running `tick` every `period` until shutdown.
    fn every(&self, period: Duration, mut tick: impl FnMut() + Send + 'static) -> JoinHandle<()> {
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period.max(Duration::from_millis(1)));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => tick(),
                    _ = shutdown.wait_for(|stop| *stop) => break,
                }
            }
        })
    }

    /// One monitor pass. Returns how many connections were disposed.
    ///
    /// With bad-client detection on, a connection whose send or command has
    /// been running longer than the send timeout is dropped and the engine
    /// is told it was a forced disconnect. With an idle timeout, connections
    /// quiet for longer than it are dropped normally.
    pub fn scan(&self, now: Instant) -> usize {
        let mut disposed = 0;

        for conn in self.registry.snapshot() {
            if conn.is_disposed() {
                continue;
            }

            if self.config.enable_bad_client_detection {
                let stalled = conn
                    .operation_elapsed(now)
                    .filter(|elapsed| *elapsed > self.config.client_send_timeout);
                if let Some(elapsed) = stalled {
                    if conn.dispose() {
                        warn!(
                            conn_id = conn.token(),
                            peer = %conn.peer(),
                            client_id = ?conn.client_id(),
                            elapsed_ms = elapsed.as_millis() as u64,
                            "Disconnecting bad client"
                        );
                        if let Some(client_id) = conn.client_id() {
                            self.dispatcher
                                .engine()
                                .on_client_forcefully_disconnected(&client_id);
                        }
                        disposed += 1;
                    }
                    continue;
                }
            }

            if let Some(timeout) = self.config.idle_timeout {
                let idle = conn.idle_for(now).is_some_and(|idle| idle > timeout);
                if idle && conn.dispose() {
                    debug!(conn_id = conn.token(), peer = %conn.peer(), "Disconnecting idle client");
                    disposed += 1;
                }
            }
        }

        disposed
    }

    async fn route_events(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<Event>) {
        while let Some(event) = events.recv().await {
            self.route_event(event);
        }
        trace!("Event channel closed");
    }

    /// Queue `event` for every subscribed connection.
    fn route_event(&self, event: Event) {
        for token in self.subscriptions.subscribers(event.kind()) {
            if let Some(conn) = self.registry.get(token) {
                conn.enqueue_event(event.clone(), self.config.event_max_queued);
            }
        }
    }

    /// Queue `event` for one client, regardless of its subscriptions.
    pub fn enqueue_event(&self, client_id: &str, event: Event) -> bool {
        self.registry
            .by_client(client_id)
            .is_some_and(|conn| conn.enqueue_event(event, self.config.event_max_queued))
    }

    /// Send `EVENTS` batches to every connection whose queue is due. A
    /// backlog of full batches is drained in the same pass.
    fn flush_due_events(&self, now: Instant) {
        let bulk_count = self.config.event_bulk_count.max(1);
        for conn in self.registry.snapshot() {
            let events = conn.events();
            if !events.is_due(bulk_count, self.config.event_bulk_interval, now) {
                continue;
            }
            let mut batches = 0;
            loop {
                let batch = events.take_batch(bulk_count);
                if batch.is_empty() {
                    break;
                }
                let response = Response::new(token::EVENTS, encode_events(&batch));
                if let Err(e) = conn.send(response.encode(), Priority::Low) {
                    trace!(conn_id = conn.token(), error = %e, "Event batch dropped");
                    events.clear();
                    break;
                }
                batches += 1;
                if events.len() < bulk_count {
                    break;
                }
            }
            if batches > 0 {
                trace!(conn_id = conn.token(), batches, "Event batches queued");
            }
        }
    }
}
