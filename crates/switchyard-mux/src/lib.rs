//! Multiplexer core for Switchyard.
//!
//! Spawns stdio child processes that speak newline-delimited JSON-RPC 2.0,
//! performs the MCP handshake with each, merges their tool catalogs under
//! `{child}_{tool}` names and routes `tools/call` requests to the owning
//! child, correlating responses by request id.

pub mod config;
pub mod correlator;
pub mod error;
pub mod framer;
pub mod gateway;
pub mod jsonrpc;
pub mod registry;
pub mod supervisor;

pub use config::{ChildSpec, GatewaySettings};
pub use correlator::{Correlator, RequestSink};
pub use error::{GatewayError, MuxError};
pub use framer::LineFramer;
pub use gateway::{ChildStatus, Gateway};
pub use jsonrpc::{ChildMessage, ErrorObject, RequestId, ToolDescriptor};
pub use registry::{RegistryEntry, ToolRegistry, qualified_name};
pub use supervisor::{ChildEvent, ChildState, ChildSupervisor, ClientInfo};
