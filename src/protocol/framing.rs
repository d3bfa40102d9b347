//! Receive state machine for the length-prefixed request protocol.
//!
//! ```text
//! legacy:     [discard:20] [ackId:20]? [length:10] [command bytes]
//! pipelined:  [length:10] { [ackId:20]? [commandSize:10] [command bytes] }*
//! ```
//!
//! A connection starts in legacy mode because the capability flags are only
//! known after the handshake command has been dispatched. Legacy mode yields
//! exactly one command per physical request and expects the discard buffer
//! before the next one; pipelined mode loops over the sub-frames packed into
//! the declared length and goes straight back to the next length header.
//!
//! The decoder owns its receive buffer and never blocks: callers append
//! whatever bytes arrived and pull complete frames until `Ok(None)`.

use super::header::{
    parse_ack_id, parse_length, put_ack_id, put_length, ACK_ID_HEADER_LEN, DISCARD_LEN,
    LENGTH_HEADER_LEN,
};
use crate::error::ProtocolError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::VecDeque;

/// Protocol capabilities negotiated during the handshake.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// Every command carries an acknowledgment id.
    pub acknowledgment: bool,
    /// Several commands may share one declared length.
    pub pipelining: bool,
    /// Oversized responses may be split into fragments.
    pub fragmentation: bool,
}

/// Where the decoder is within the current physical request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvState {
    /// Legacy mode: consume and ignore the discard buffer.
    AwaitingHandshakeDiscard,
    /// Legacy mode with acknowledgment: read the ack id for the next command.
    AwaitingAcknowledgmentId,
    /// Read the 10-byte declared request length.
    AwaitingLength { ack_id: Option<i64> },
    /// Accumulate `len` payload bytes.
    AwaitingPayload { ack_id: Option<i64>, len: usize },
}

/// One decoded command payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Physical request sequence number; pipelined sub-frames share it.
    pub sequence: u64,
    /// Acknowledgment id, present iff acknowledgment was negotiated.
    pub ack_id: Option<i64>,
    /// Command bytes.
    pub payload: Bytes,
}

/// Incremental decoder for one connection.
pub struct FrameDecoder {
    state: RecvState,
    caps: Capabilities,
    buf: BytesMut,
    /// Sub-frames of the last pipelined request not yet handed out.
    pending: VecDeque<Frame>,
    sequence: u64,
    max_request_len: usize,
}

impl FrameDecoder {
    /// Create a decoder that accumulates into `buf`.
    pub fn new(buf: BytesMut, max_request_len: usize) -> Self {
        Self {
            state: RecvState::AwaitingHandshakeDiscard,
            caps: Capabilities::default(),
            buf,
            pending: VecDeque::new(),
            sequence: 0,
            max_request_len,
        }
    }

    /// Current state.
    pub fn state(&self) -> RecvState {
        self.state
    }

    /// Capabilities currently used for decoding.
    pub fn capabilities(&self) -> Capabilities {
        self.caps
    }

    /// Bytes received but not yet consumed by a complete state.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Receive buffer to read socket data into.
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    /// Append received bytes.
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Give the receive buffer back, e.g. to return it to the pool.
    pub fn into_buffer(self) -> BytesMut {
        self.buf
    }

    /// Switch capabilities after a handshake.
    ///
    /// Enabling pipelining while waiting for the next legacy request drops
    /// the discard step from then on.
    pub fn set_capabilities(&mut self, caps: Capabilities) {
        self.caps = caps;
        if caps.pipelining && self.state == RecvState::AwaitingHandshakeDiscard {
            self.state = RecvState::AwaitingLength { ack_id: None };
        }
    }

    /// Pull the next complete command, if the buffered bytes contain one.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, ProtocolError> {
        loop {
            if let Some(frame) = self.pending.pop_front() {
                return Ok(Some(frame));
            }

            match self.state {
                RecvState::AwaitingHandshakeDiscard => {
                    if self.buf.len() < DISCARD_LEN {
                        return Ok(None);
                    }
                    self.buf.advance(DISCARD_LEN);
                    self.state = if self.caps.acknowledgment {
                        RecvState::AwaitingAcknowledgmentId
                    } else {
                        RecvState::AwaitingLength { ack_id: None }
                    };
                }
                RecvState::AwaitingAcknowledgmentId => {
                    if self.buf.len() < ACK_ID_HEADER_LEN {
                        return Ok(None);
                    }
                    let ack_id = parse_ack_id(&self.buf[..ACK_ID_HEADER_LEN])?;
                    self.buf.advance(ACK_ID_HEADER_LEN);
                    self.state = RecvState::AwaitingLength {
                        ack_id: Some(ack_id),
                    };
                }
                RecvState::AwaitingLength { ack_id } => {
                    if self.buf.len() < LENGTH_HEADER_LEN {
                        return Ok(None);
                    }
                    let len = parse_length(
                        "request length",
                        &self.buf[..LENGTH_HEADER_LEN],
                        self.max_request_len,
                    )?;
                    self.buf.advance(LENGTH_HEADER_LEN);
                    if self.buf.len() < len {
                        self.buf.reserve(len - self.buf.len());
                    }
                    self.state = RecvState::AwaitingPayload { ack_id, len };
                }
                RecvState::AwaitingPayload { ack_id, len } => {
                    if self.buf.len() < len {
                        return Ok(None);
                    }
                    let payload = self.buf.split_to(len).freeze();
                    self.sequence = self.sequence.wrapping_add(1);

                    if self.caps.pipelining {
                        self.state = RecvState::AwaitingLength { ack_id: None };
                        let frames =
                            split_pipelined(payload, self.caps.acknowledgment, self.sequence)?;
                        self.pending.extend(frames);
                    } else {
                        self.state = RecvState::AwaitingHandshakeDiscard;
                        return Ok(Some(Frame {
                            sequence: self.sequence,
                            ack_id,
                            payload,
                        }));
                    }
                }
            }
        }
    }
}

/// Split a pipelined request body into its back-to-back sub-frames.
fn split_pipelined(
    mut body: Bytes,
    acknowledgment: bool,
    sequence: u64,
) -> Result<Vec<Frame>, ProtocolError> {
    let mut frames = Vec::new();

    while body.has_remaining() {
        let ack_id = if acknowledgment {
            ensure_remaining(&body, ACK_ID_HEADER_LEN)?;
            let ack_id = parse_ack_id(&body[..ACK_ID_HEADER_LEN])?;
            body.advance(ACK_ID_HEADER_LEN);
            Some(ack_id)
        } else {
            None
        };

        ensure_remaining(&body, LENGTH_HEADER_LEN)?;
        let size = parse_length("command size", &body[..LENGTH_HEADER_LEN], usize::MAX)?;
        body.advance(LENGTH_HEADER_LEN);
        ensure_remaining(&body, size)?;

        frames.push(Frame {
            sequence,
            ack_id,
            payload: body.split_to(size),
        });
    }

    Ok(frames)
}

fn ensure_remaining(body: &Bytes, needed: usize) -> Result<(), ProtocolError> {
    if body.remaining() < needed {
        return Err(ProtocolError::FrameOverrun {
            declared: needed,
            remaining: body.remaining(),
        });
    }
    Ok(())
}

/// Encode one legacy (non-pipelined) request as a client would send it.
pub fn encode_legacy_request(buf: &mut BytesMut, ack_id: Option<i64>, command: &[u8]) {
    buf.put_bytes(b' ', DISCARD_LEN);
    if let Some(ack_id) = ack_id {
        put_ack_id(buf, ack_id);
    }
    put_length(buf, command.len());
    buf.put_slice(command);
}

/// Encode one pipelined request carrying `commands` as a client would send it.
pub fn encode_pipelined_request(buf: &mut BytesMut, commands: &[(Option<i64>, &[u8])]) {
    let body_len: usize = commands
        .iter()
        .map(|(ack, cmd)| {
            ack.map_or(0, |_| ACK_ID_HEADER_LEN) + LENGTH_HEADER_LEN + cmd.len()
        })
        .sum();

    put_length(buf, body_len);
    for (ack_id, command) in commands {
        if let Some(ack_id) = ack_id {
            put_ack_id(buf, *ack_id);
        }
        put_length(buf, command.len());
        buf.put_slice(command);
    }
}
