//! Wire vocabulary for the kiln fork engine.
//!
//! Everything that crosses the boundary between the controller process and a
//! forked worker lives here: the event model (worker → controller), the
//! command model (controller → worker), and the framed binary codec that
//! moves both across pipes without ever scanning payload text for
//! delimiters.
//!
//! ## Notes
//! - This crate is intentionally transport-free: it turns values into bytes
//!   and bytes back into values. Spawning processes, reading pipes, and
//!   reacting to events is the `kiln` crate's business.
//! - The codec is resumable: partial frames across read boundaries are
//!   buffered and retried without loss or duplication.

pub mod command;
pub mod decode;
pub mod encode;
pub mod event;

pub use command::{Command, ShutdownMode};
pub use decode::{DecodeOutcome, Decoded, FrameDecoder, MalformedFrame};
pub use encode::{encode_command, encode_event};
pub use event::{ConsoleLevel, Event, EventData, ReportEntry, RunMode, StackTrace};

/// Marker opening every event frame (worker → controller).
pub const MAGIC_EVENT: &[u8] = b":kiln-event:";

/// Marker opening every command frame (controller → worker).
pub const MAGIC_COMMAND: &[u8] = b":kiln-command:";

/// The only charset the codec emits or accepts for payload fields.
pub const CHARSET: &str = "UTF-8";

/// Wire sentinel meaning "field absent" in a length prefix.
pub const NULL_FIELD: i32 = -1;
