//! Inter-process communication for spindle
//!
//! This crate provides the message types and the line-delimited JSON
//! transport used between the pool controller and its worker processes.

pub mod error;
pub mod protocol;
pub mod transport;

// Re-export commonly used types
pub use error::IpcError;
pub use protocol::{
    CoordinatorMessage, MessageEnvelope, ResultMessage, TaskId, TaskMessage, TaskOutcome,
    WorkerId, WorkerInfo, WorkerMessage, WorkerState, IPC_PROTOCOL_VERSION,
};
pub use transport::{
    decode_frame, encode_frame, FrameReader, FrameWriter, FramedTransport, IpcTransport,
    StdioTransport,
};
