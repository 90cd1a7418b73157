//! nmlink Control Core
//!
//! Request/response correlation, push dispatch and chunked file transfer for
//! antenna terminals reached through a WebSocket relay. This crate holds the
//! transport-agnostic parts: anything implementing [`Channel`] can carry the
//! frames. The WebSocket channel lives in `nmlink-relay`.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod channel;
pub mod commands;
pub mod config;
pub mod dispatcher;
pub mod errors;
pub mod multiplexer;
pub mod protocol;
pub mod transfer;
pub mod types;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use channel::{Channel, ChannelEvent, ChannelState};
pub use commands::{
    ControlModule, ReportConfig, ResetKind, RtcSetting, StoredFile, TurnAxis, TurnCommand,
    TurnDirection,
};
pub use config::{ConsoleConfig, TransferConfig, DEFAULT_RELAY_ADDRESS};
pub use dispatcher::{PushDispatcher, SubscriptionFilter, SubscriptionHandle};
pub use errors::{ControlError, Result};
pub use multiplexer::{FrameDisposition, Multiplexer, PendingResponse};
pub use protocol::{ControlCommand, ControlResponse, InboundFrame, PushFrame};
pub use transfer::{
    TransferEngine, TransferEvent, TransferFile, TransferReport, TransferSession, TransferState,
};
pub use types::{CorrelationId, CorrelationIdGenerator, DeviceTarget};
