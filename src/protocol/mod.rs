//! Core-to-core wire protocol: framing, message payloads, the per-connection
//! server dispatch, and client-side request helpers used by the download
//! manager.

pub mod client;
pub mod frame;
pub mod messages;
pub mod server;

pub use frame::{FrameHeader, MAGIC, MAX_FRAME_BODY};
pub use messages::MessageType;
pub use server::{ServerContext, dispatch_get_chunk_via_pool, serve_connection};
