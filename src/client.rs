//! Request/response clients for the two host variants.
//!
//! - [`EditorClient`] speaks the raw command dialect straight to the editor
//!   socket, one connection per call.
//! - [`SidecarClient`] drives the sidecar process over Content-Length
//!   framed JSON-RPC on its standard streams, with notifications and
//!   batches.

pub mod editor;
pub mod sidecar;

pub use editor::{ConnectionState, ConnectionStatus, EditorClient};
pub use sidecar::{SidecarClient, ToolInfo};
