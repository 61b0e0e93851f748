// fleetlink-api: wire protocol and WebSocket transport for printer agents and dashboards.

pub mod client;
pub mod error;
pub mod handshake;
pub mod protocol;
pub mod server;

pub use error::Error;
pub use handshake::{ConnectionId, Handshake, Role};
pub use protocol::{
    AgentCommand, AgentMessage, CommandReply, ObserverEvent, ObserverMessage, PrinterState,
    ToAgent,
};
pub use server::{ConnectionHandler, Outbound, ServerConfig};
