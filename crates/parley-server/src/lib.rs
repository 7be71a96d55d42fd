pub mod client;
pub mod event_bridge;
pub mod handlers;
pub mod orchestrator;
pub mod rpc;
pub mod server;

pub use client::{ConnectionId, ConnectionRegistry};
pub use orchestrator::{ChatOrchestrator, RelayOrchestrator, SendAck, SendParams};
pub use server::{start, ServerConfig, ServerHandle};
