//! Wire protocol: headers, request framing, command lines and responses.

pub mod command;
pub mod framing;
pub mod header;
pub mod response;

pub use command::{Command, CommandType};
pub use framing::{Capabilities, Frame, FrameDecoder, RecvState};
pub use response::{token, Response};
