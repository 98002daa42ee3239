//! # Gateway Common
//!
//! Building blocks shared by the stdio gateway crates:
//!
//! - [`frame`]: newline framing of raw byte streams (`tokio_util` codec).
//! - [`message`]: JSON-RPC request/response/notification codec.
//! - [`lifecycle`]: watch-based bridge lifecycle observed by every component.
//! - [`headers`]: `Name: value` header argument parsing.

pub mod frame;
pub mod headers;
pub mod lifecycle;
pub mod message;

pub use frame::{FrameDecoder, FrameError};
pub use lifecycle::{BridgeLifecycle, BridgeState};
pub use message::{
    CodecError, ErrorObject, Message, Notification, Request, RequestId, Response, ResponsePayload,
};
