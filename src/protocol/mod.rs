//! PostgreSQL v3 wire protocol: framing, message codec and startup handling.

pub mod framing;
pub mod messages;
pub mod sqlstate;
pub mod startup;

pub use framing::{Frame, FrameDecoder};
pub use messages::{
    BackendMessage, FrontendMessage, ProtocolError, ReadyForQueryStatus, RowDescriptionField,
    StartupAction,
};
pub use startup::StartupPacket;
