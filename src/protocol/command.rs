//! Command payload decoding.
//!
//! A command payload is an ASCII line followed by an optional data block:
//!
//! ```text
//! VERB [positional ...] [name=value ...]\r\n<len bytes of data>
//! ```
//!
//! `rid`, `cid`, `len` and `async` are reserved option names consumed here;
//! every other option is left for the handler.

use super::framing::Frame;
use crate::error::{HandlerError, ProtocolError};
use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Enumerated operation carried by a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandType {
    Init,
    GetProductVersion,
    Ping,
    RequestStatus,
    Dispose,
    GetConnectedClients,
    RegisterNotif,
    UnregisterNotif,
    Add,
    AddBulk,
    Insert,
    InsertBulk,
    Get,
    GetBulk,
    Remove,
    RemoveBulk,
    Delete,
    DeleteBulk,
    Contains,
    ContainsBulk,
    Count,
    Clear,
    RaiseCustomEvent,
}

impl CommandType {
    /// Every command type, in wire-verb order.
    pub const ALL: [CommandType; 23] = [
        CommandType::Init,
        CommandType::GetProductVersion,
        CommandType::Ping,
        CommandType::RequestStatus,
        CommandType::Dispose,
        CommandType::GetConnectedClients,
        CommandType::RegisterNotif,
        CommandType::UnregisterNotif,
        CommandType::Add,
        CommandType::AddBulk,
        CommandType::Insert,
        CommandType::InsertBulk,
        CommandType::Get,
        CommandType::GetBulk,
        CommandType::Remove,
        CommandType::RemoveBulk,
        CommandType::Delete,
        CommandType::DeleteBulk,
        CommandType::Contains,
        CommandType::ContainsBulk,
        CommandType::Count,
        CommandType::Clear,
        CommandType::RaiseCustomEvent,
    ];

    /// Wire verb for this command type.
    pub fn verb(self) -> &'static str {
        match self {
            CommandType::Init => "INIT",
            CommandType::GetProductVersion => "GET_PRODUCT_VERSION",
            CommandType::Ping => "PING",
            CommandType::RequestStatus => "REQUEST_STATUS",
            CommandType::Dispose => "DISPOSE",
            CommandType::GetConnectedClients => "GET_CONNECTED_CLIENTS",
            CommandType::RegisterNotif => "REGISTER_NOTIF",
            CommandType::UnregisterNotif => "UNREGISTER_NOTIF",
            CommandType::Add => "ADD",
            CommandType::AddBulk => "ADD_BULK",
            CommandType::Insert => "INSERT",
            CommandType::InsertBulk => "INSERT_BULK",
            CommandType::Get => "GET",
            CommandType::GetBulk => "GET_BULK",
            CommandType::Remove => "REMOVE",
            CommandType::RemoveBulk => "REMOVE_BULK",
            CommandType::Delete => "DELETE",
            CommandType::DeleteBulk => "DELETE_BULK",
            CommandType::Contains => "CONTAINS",
            CommandType::ContainsBulk => "CONTAINS_BULK",
            CommandType::Count => "COUNT",
            CommandType::Clear => "CLEAR",
            CommandType::RaiseCustomEvent => "RAISE_CUSTOM_EVENT",
        }
    }

    /// Look up a verb, ignoring ASCII case.
    pub fn from_verb(verb: &str) -> Option<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|kind| kind.verb().eq_ignore_ascii_case(verb))
    }

    /// Mutating commands get a ledger entry when acknowledgment is on.
    pub fn is_unsafe(self) -> bool {
        matches!(
            self,
            CommandType::Add
                | CommandType::AddBulk
                | CommandType::Insert
                | CommandType::InsertBulk
                | CommandType::Remove
                | CommandType::RemoveBulk
                | CommandType::RaiseCustomEvent
        )
    }

    /// Handshake and metadata commands must succeed while shedding load.
    pub fn bypasses_throttle(self) -> bool {
        matches!(
            self,
            CommandType::Init
                | CommandType::GetProductVersion
                | CommandType::Ping
                | CommandType::RequestStatus
                | CommandType::Dispose
                | CommandType::GetConnectedClients
        )
    }

    /// Commands a client may send before the handshake completed.
    pub fn allowed_before_init(self) -> bool {
        matches!(
            self,
            CommandType::Init | CommandType::Ping | CommandType::GetProductVersion
        )
    }

    /// Commands that change connection state and must run on the reader
    /// task rather than a command processor.
    pub fn is_connection_control(self) -> bool {
        matches!(self, CommandType::Init | CommandType::Dispose)
    }
}

impl fmt::Display for CommandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.verb())
    }
}

/// A decoded unit of work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub kind: CommandType,
    /// Client-supplied request id (`rid=`). Mutating commands need one when
    /// acknowledgment is on, since it keys the ledger.
    pub request_id: Option<i64>,
    pub command_id: i64,
    /// Present iff the connection negotiated acknowledgment.
    pub ack_id: Option<i64>,
    /// Fire-and-forget: no response is sent.
    pub is_async: bool,
    pub args: Vec<String>,
    pub options: HashMap<String, String>,
    pub data: Bytes,
}

impl Command {
    /// Decode a framed payload.
    pub fn parse(frame: Frame) -> Result<Command, ProtocolError> {
        let Frame {
            ack_id,
            mut payload,
            ..
        } = frame;

        let line_end = payload
            .windows(2)
            .position(|w| w == b"\r\n")
            .ok_or_else(|| ProtocolError::MalformedCommand("missing line terminator".into()))?;
        let line = payload.split_to(line_end);
        let data = payload.split_off(2);

        let line = std::str::from_utf8(&line)
            .map_err(|_| ProtocolError::MalformedCommand("command line is not UTF-8".into()))?;
        let mut tokens = line.split_ascii_whitespace();

        let verb = tokens
            .next()
            .ok_or_else(|| ProtocolError::MalformedCommand("empty command line".into()))?;
        let kind = CommandType::from_verb(verb)
            .ok_or_else(|| ProtocolError::UnknownCommand(verb.to_string()))?;

        let mut command = Command {
            kind,
            request_id: None,
            command_id: 0,
            ack_id,
            is_async: false,
            args: Vec::new(),
            options: HashMap::new(),
            data: Bytes::new(),
        };
        let mut declared_len = 0usize;

        for token in tokens {
            let Some((name, value)) = token.split_once('=') else {
                command.args.push(token.to_string());
                continue;
            };
            if name.is_empty() {
                return Err(ProtocolError::MalformedCommand(format!(
                    "option without a name: {token:?}"
                )));
            }
            match name {
                "rid" => command.request_id = Some(reserved(name, value)?),
                "cid" => command.command_id = reserved(name, value)?,
                "len" => declared_len = reserved(name, value)?,
                "async" => command.is_async = reserved::<u8>(name, value)? != 0,
                _ => {
                    command.options.insert(name.to_string(), value.to_string());
                }
            }
        }

        if data.len() != declared_len {
            return Err(ProtocolError::MalformedCommand(format!(
                "declared {declared_len} data bytes, found {}",
                data.len()
            )));
        }
        command.data = data;

        Ok(command)
    }

    /// Positional argument `index`, if present.
    pub fn arg(&self, index: usize) -> Option<&str> {
        self.args.get(index).map(String::as_str)
    }

    /// Positional argument `index`, or a handler error naming it.
    pub fn require_arg(&self, index: usize, name: &'static str) -> Result<&str, HandlerError> {
        self.arg(index).ok_or(HandlerError::MissingArgument(name))
    }

    /// Named option, if present.
    pub fn option(&self, name: &str) -> Option<&str> {
        self.options.get(name).map(String::as_str)
    }

    /// Parse a named option, `Ok(None)` when absent.
    pub fn option_parsed<T: FromStr>(&self, name: &str) -> Result<Option<T>, HandlerError> {
        self.option(name)
            .map(|raw| {
                raw.parse().map_err(|_| {
                    HandlerError::InvalidArgument(format!("{name}={raw} is not valid"))
                })
            })
            .transpose()
    }

    /// Parse a `0`/`1` flag option, `false` when absent.
    pub fn flag(&self, name: &str) -> Result<bool, HandlerError> {
        Ok(self.option_parsed::<u8>(name)?.is_some_and(|v| v != 0))
    }
}

fn reserved<T: FromStr>(name: &str, value: &str) -> Result<T, ProtocolError> {
    value
        .parse()
        .map_err(|_| ProtocolError::MalformedCommand(format!("invalid {name}={value}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(payload: &'static [u8]) -> Frame {
        Frame {
            sequence: 7,
            ack_id: None,
            payload: Bytes::from_static(payload),
        }
    }

    #[test]
    fn test_parse_add_with_data() {
        let cmd = Command::parse(frame(b"ADD key1 flags=0 exp=0 len=10\r\n0123456789")).unwrap();
        assert_eq!(cmd.kind, CommandType::Add);
        assert_eq!(cmd.args, vec!["key1"]);
        assert_eq!(cmd.option("flags"), Some("0"));
        assert_eq!(cmd.option_parsed::<u64>("exp"), Ok(Some(0)));
        assert_eq!(&cmd.data[..], b"0123456789");
        assert_eq!(cmd.request_id, None);
        assert_eq!(cmd.command_id, 0);
        assert!(!cmd.is_async);
        assert!(cmd.option("len").is_none());
    }

    #[test]
    fn test_reserved_options() {
        let cmd = Command::parse(frame(b"remove k rid=42 cid=3 async=1\r\n")).unwrap();
        assert_eq!(cmd.kind, CommandType::Remove);
        assert_eq!(cmd.request_id, Some(42));
        assert_eq!(cmd.command_id, 3);
        assert!(cmd.is_async);
        assert!(cmd.data.is_empty());
    }

    #[test]
    fn test_unknown_verb() {
        assert_eq!(
            Command::parse(frame(b"FROBNICATE x\r\n")),
            Err(ProtocolError::UnknownCommand("FROBNICATE".into()))
        );
    }

    #[test]
    fn test_malformed_lines() {
        for payload in [
            &b"PING"[..],
            b"\r\n",
            b"ADD k len=3\r\nab",
            b"ADD k len=abc\r\n",
            b"GET =x\r\n",
            b"GET k rid=x\r\n",
        ] {
            let frame = Frame {
                sequence: 1,
                ack_id: None,
                payload: Bytes::copy_from_slice(payload),
            };
            assert!(
                matches!(Command::parse(frame), Err(ProtocolError::MalformedCommand(_))),
                "{payload:?}"
            );
        }
    }

    #[test]
    fn test_argument_accessors() {
        let cmd = Command::parse(frame(b"INIT client=abc version=x ack=1\r\n")).unwrap();
        assert_eq!(
            cmd.require_arg(0, "key"),
            Err(HandlerError::MissingArgument("key"))
        );
        assert!(cmd.flag("ack").unwrap());
        assert!(!cmd.flag("pipeline").unwrap());
        assert!(matches!(
            cmd.option_parsed::<u32>("version"),
            Err(HandlerError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_classification() {
        assert!(CommandType::Add.is_unsafe());
        assert!(CommandType::RaiseCustomEvent.is_unsafe());
        assert!(!CommandType::Get.is_unsafe());
        assert!(!CommandType::Delete.is_unsafe());

        assert!(CommandType::Init.bypasses_throttle());
        assert!(CommandType::RequestStatus.bypasses_throttle());
        assert!(!CommandType::Insert.bypasses_throttle());

        assert!(CommandType::Ping.allowed_before_init());
        assert!(!CommandType::Get.allowed_before_init());

        for kind in CommandType::ALL {
            assert_eq!(CommandType::from_verb(kind.verb()), Some(kind));
        }
    }
}
