//! Command dispatch.
//!
//! Maps each [`CommandType`] to a handler, runs it, and hands the encoded
//! response to the connection's send path. Mutating commands from clients
//! that negotiated acknowledgment go through the [`Ledger`] first, so a
//! retried command replays its stored response instead of executing again.
//! Handler failures become `ERROR` responses; they never close the
//! connection.

mod operations;
mod throttle;

pub use throttle::Throttle;

use crate::config::Config;
use crate::connection::{Connection, Priority};
use crate::engine::{CacheEngine, Reply};
use crate::error::HandlerError;
use crate::events::{EventKind, SubscriptionTable};
use crate::ledger::{Ledger, Registration, RequestStatus};
use crate::protocol::response::fragment;
use crate::protocol::{token, Capabilities, Command, CommandType, Response};
use crate::registry::ConnectionRegistry;
use bytes::Bytes;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Oldest client version that understands fragmented responses.
pub const MIN_FRAGMENTATION_VERSION: u32 = 4122;

/// What the reader task should do after a command was dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Continue,
    /// The handshake fixed these capabilities.
    Handshake(Capabilities),
    /// The client asked to disconnect.
    Close,
}

type Handler = fn(&Dispatcher, &Arc<Connection>, &Command) -> Result<Option<Response>, HandlerError>;

/// Handler table.
fn handler_for(kind: CommandType) -> Handler {
    match kind {
        CommandType::Init => Dispatcher::handle_init,
        CommandType::GetProductVersion => Dispatcher::handle_product_version,
        CommandType::Ping => Dispatcher::handle_ping,
        CommandType::RequestStatus => Dispatcher::handle_request_status,
        CommandType::Dispose => Dispatcher::handle_dispose,
        CommandType::GetConnectedClients => Dispatcher::handle_connected_clients,
        CommandType::RegisterNotif => Dispatcher::handle_register_notif,
        CommandType::UnregisterNotif => Dispatcher::handle_unregister_notif,
        CommandType::Add
        | CommandType::AddBulk
        | CommandType::Insert
        | CommandType::InsertBulk
        | CommandType::Get
        | CommandType::GetBulk
        | CommandType::Remove
        | CommandType::RemoveBulk
        | CommandType::Delete
        | CommandType::DeleteBulk
        | CommandType::Contains
        | CommandType::ContainsBulk
        | CommandType::Count
        | CommandType::Clear
        | CommandType::RaiseCustomEvent => Dispatcher::handle_cache_operation,
    }
}

/// Server-side protocol switches the handshake is ANDed with.
#[derive(Debug, Clone, Copy)]
pub struct DispatchSettings {
    pub enable_acknowledgement: bool,
    pub enable_pipelining: bool,
    /// Responses above this many bytes are fragmented.
    pub fragment_size: usize,
}

impl From<&Config> for DispatchSettings {
    fn from(config: &Config) -> Self {
        Self {
            enable_acknowledgement: config.enable_acknowledgement,
            enable_pipelining: config.enable_pipelining,
            fragment_size: config.fragment_size,
        }
    }
}

/// Shared command dispatcher.
pub struct Dispatcher {
    engine: Arc<dyn CacheEngine>,
    ledger: Arc<Ledger>,
    registry: Arc<ConnectionRegistry>,
    subscriptions: Arc<SubscriptionTable>,
    throttle: Throttle,
    settings: DispatchSettings,
    message_ids: AtomicI64,
}

impl Dispatcher {
    pub fn new(
        engine: Arc<dyn CacheEngine>,
        ledger: Arc<Ledger>,
        registry: Arc<ConnectionRegistry>,
        subscriptions: Arc<SubscriptionTable>,
        throttle: Throttle,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            engine,
            ledger,
            registry,
            subscriptions,
            throttle,
            settings,
            message_ids: AtomicI64::new(0),
        }
    }

    pub fn engine(&self) -> &Arc<dyn CacheEngine> {
        &self.engine
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    /// Execute one command and queue its response.
    pub fn dispatch(&self, conn: &Arc<Connection>, cmd: Command) -> Outcome {
        conn.begin_command();
        let outcome = self.dispatch_inner(conn, &cmd);
        conn.end_command();
        outcome
    }

    fn dispatch_inner(&self, conn: &Arc<Connection>, cmd: &Command) -> Outcome {
        trace!(
            conn_id = conn.token(),
            command = %cmd.kind,
            request_id = ?cmd.request_id,
            command_id = cmd.command_id,
            "Dispatching command"
        );

        if !conn.is_initialized() && !cmd.kind.allowed_before_init() {
            self.reply(conn, cmd, Response::error(HandlerError::NotInitialized).encode());
            return Outcome::Continue;
        }

        if !cmd.kind.bypasses_throttle() && !self.throttle.admit() {
            debug!(conn_id = conn.token(), command = %cmd.kind, "Throttled command");
            self.reply(conn, cmd, Response::status(token::BUSY).encode());
            return Outcome::Continue;
        }

        let caps = conn.capabilities();
        let client_id = conn.client_id();
        let ledgered = match (&client_id, cmd.kind.is_unsafe() && caps.acknowledgment) {
            (Some(client_id), true) => {
                let Some(request_id) = cmd.request_id else {
                    // Without a client-supplied id the ledger cannot tell a
                    // retry from a new write.
                    if let Some(ack_id) = cmd.ack_id {
                        self.ledger.acknowledge(client_id, ack_id);
                    }
                    debug!(client_id, command = %cmd.kind, "Mutating command without a request id rejected");
                    self.reply(conn, cmd, Response::error(HandlerError::MissingArgument("rid")).encode());
                    return Outcome::Continue;
                };
                match self
                    .ledger
                    .register(client_id, request_id, cmd.command_id, cmd.ack_id)
                {
                    Registration::New => Some((client_id.as_str(), request_id)),
                    Registration::InFlight => {
                        debug!(
                            client_id,
                            request_id,
                            command_id = cmd.command_id,
                            "Duplicate of an in-flight command dropped"
                        );
                        return Outcome::Continue;
                    }
                    Registration::Completed { status, response } => {
                        debug!(
                            client_id,
                            request_id,
                            command_id = cmd.command_id,
                            %status,
                            "Replaying ledgered response"
                        );
                        if let Some(response) = response {
                            self.reply(conn, cmd, response);
                        }
                        return Outcome::Continue;
                    }
                }
            }
            (Some(client_id), false) => {
                if let Some(ack_id) = cmd.ack_id {
                    self.ledger.acknowledge(client_id, ack_id);
                }
                None
            }
            (None, _) => None,
        };

        let result = handler_for(cmd.kind)(self, conn, cmd);
        let (status, encoded) = match result {
            Ok(response) => (
                RequestStatus::ReceivedAndExecuted,
                response.map(|r| r.encode()),
            ),
            Err(e) => {
                warn!(
                    conn_id = conn.token(),
                    command = %cmd.kind,
                    request_id = ?cmd.request_id,
                    error = %e,
                    "Command failed"
                );
                (
                    RequestStatus::ReceivedWithError,
                    Some(Response::error(&e).encode()),
                )
            }
        };

        if let Some((client_id, request_id)) = ledgered {
            self.ledger.complete(
                client_id,
                request_id,
                cmd.command_id,
                status,
                encoded.clone(),
            );
        }
        if let Some(encoded) = encoded {
            self.reply(conn, cmd, encoded);
        }

        match cmd.kind {
            CommandType::Init if status == RequestStatus::ReceivedAndExecuted => {
                Outcome::Handshake(conn.capabilities())
            }
            CommandType::Dispose => Outcome::Close,
            _ => Outcome::Continue,
        }
    }

    /// Queue an encoded response, fragmenting it when the client allows.
    fn reply(&self, conn: &Arc<Connection>, cmd: &Command, encoded: Bytes) {
        if cmd.is_async {
            return;
        }
        let caps = conn.capabilities();
        let result = if caps.fragmentation && encoded.len() > self.settings.fragment_size {
            let message_id = self.message_ids.fetch_add(1, Ordering::Relaxed) + 1;
            let frames = fragment(&encoded, self.settings.fragment_size, message_id);
            trace!(
                conn_id = conn.token(),
                message_id,
                fragments = frames.len(),
                "Fragmenting response"
            );
            conn.send_all(frames, Priority::Normal)
        } else {
            conn.send(encoded, Priority::Normal)
        };
        if let Err(e) = result {
            trace!(conn_id = conn.token(), error = %e, "Response dropped");
        }
    }

    /// Status of a ledgered request.
    pub fn request_status(&self, client_id: &str, request_id: i64, command_id: i64) -> RequestStatus {
        self.ledger.request_status(client_id, request_id, command_id)
    }

    fn handle_init(&self, conn: &Arc<Connection>, cmd: &Command) -> Result<Option<Response>, HandlerError> {
        if conn.is_initialized() {
            return Err(HandlerError::InvalidArgument(
                "handshake already completed".into(),
            ));
        }
        let client_id = cmd
            .option("client")
            .filter(|id| !id.is_empty())
            .ok_or(HandlerError::MissingArgument("client"))?
            .to_string();
        let version = cmd.option_parsed::<u32>("version")?.unwrap_or(0);
        let caps = Capabilities {
            acknowledgment: cmd.flag("ack")? && self.settings.enable_acknowledgement,
            pipelining: cmd.flag("pipeline")? && self.settings.enable_pipelining,
            fragmentation: cmd.flag("fragment")? && version >= MIN_FRAGMENTATION_VERSION,
        };

        conn.complete_handshake(client_id.clone(), version, caps);
        if let Some(previous) = self.registry.bind_client(conn.token(), &client_id) {
            debug!(client_id, previous, conn_id = conn.token(), "Client id rebound to new connection");
        }
        self.ledger.client_connected(&client_id);
        self.engine.on_client_connected(&client_id);
        debug!(
            client_id,
            version,
            peer = %conn.peer(),
            ack = caps.acknowledgment,
            pipeline = caps.pipelining,
            fragment = caps.fragmentation,
            "Handshake completed"
        );

        Ok(Some(Response::new(
            token::OK,
            format!(
                "ack={} pipeline={} fragment={}",
                u8::from(caps.acknowledgment),
                u8::from(caps.pipelining),
                u8::from(caps.fragmentation)
            ),
        )))
    }

    fn handle_ping(&self, _conn: &Arc<Connection>, _cmd: &Command) -> Result<Option<Response>, HandlerError> {
        Ok(Some(Response::status(token::PONG)))
    }

    fn handle_product_version(
        &self,
        _conn: &Arc<Connection>,
        _cmd: &Command,
    ) -> Result<Option<Response>, HandlerError> {
        Ok(Some(Response::new(
            token::OK,
            self.engine.product_version().to_string(),
        )))
    }

    fn handle_request_status(
        &self,
        conn: &Arc<Connection>,
        cmd: &Command,
    ) -> Result<Option<Response>, HandlerError> {
        let parse_id = |index: usize, name: &'static str| -> Result<i64, HandlerError> {
            let raw = cmd.require_arg(index, name)?;
            raw.parse()
                .map_err(|_| HandlerError::InvalidArgument(format!("{name} '{raw}' is not a number")))
        };
        let request_id = parse_id(0, "request id")?;
        let command_id = parse_id(1, "command id")?;
        let client_id = match cmd.option("client") {
            Some(client_id) => client_id.to_string(),
            None => conn.client_id().ok_or(HandlerError::MissingArgument("client"))?,
        };

        let status = self.request_status(&client_id, request_id, command_id);
        Ok(Some(Response::new(token::STATUS, status.as_str())))
    }

    fn handle_dispose(&self, conn: &Arc<Connection>, _cmd: &Command) -> Result<Option<Response>, HandlerError> {
        conn.mark_left_gracefully();
        Ok(None)
    }

    fn handle_connected_clients(
        &self,
        _conn: &Arc<Connection>,
        _cmd: &Command,
    ) -> Result<Option<Response>, HandlerError> {
        let entries = self
            .registry
            .clients()
            .into_iter()
            .map(|client| {
                let detail = format!(
                    "{} {} {}",
                    client.peer,
                    client.connected_at.to_rfc3339(),
                    client.version
                );
                (client.client_id, Bytes::from(detail))
            })
            .collect();
        Ok(Some(Reply::Entries(entries).into_response()))
    }

    fn handle_register_notif(
        &self,
        conn: &Arc<Connection>,
        cmd: &Command,
    ) -> Result<Option<Response>, HandlerError> {
        let kinds = event_kinds(cmd)?;
        self.subscriptions.subscribe(conn.token(), &kinds);
        Ok(Some(Response::status(token::OK)))
    }

    fn handle_unregister_notif(
        &self,
        conn: &Arc<Connection>,
        cmd: &Command,
    ) -> Result<Option<Response>, HandlerError> {
        let kinds = event_kinds(cmd)?;
        self.subscriptions.unsubscribe(conn.token(), &kinds);
        Ok(Some(Response::status(token::OK)))
    }

    fn handle_cache_operation(
        &self,
        conn: &Arc<Connection>,
        cmd: &Command,
    ) -> Result<Option<Response>, HandlerError> {
        let op = operations::decode(cmd)?.ok_or_else(|| {
            HandlerError::InvalidArgument(format!("{} is not a cache operation", cmd.kind))
        })?;
        let client_id = conn.client_id().unwrap_or_default();
        let reply = self.engine.execute(&client_id, op)?;
        Ok(Some(reply.into_response()))
    }
}

fn event_kinds(cmd: &Command) -> Result<Vec<EventKind>, HandlerError> {
    let raw = cmd.option("kinds").ok_or(HandlerError::MissingArgument("kinds"))?;
    EventKind::parse_list(raw).map_err(HandlerError::InvalidArgument)
}
