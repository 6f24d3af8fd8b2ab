//! editorlink library
//!
//! A command/response protocol client for remote-controlling a running editor
//! host. Two wire variants are supported:
//!
//! - `client::editor` - raw JSON commands on the editor's TCP socket, one
//!   reply per connection, completion detected by parsing
//! - `client::sidecar` - Content-Length framed JSON-RPC over a sidecar
//!   process's standard streams, with notifications and batches
//!
//! The layers underneath are usable on their own: `transport` moves bytes,
//! `framing` turns bytes into [`Message`]s, `correlator` matches replies to
//! requests and `notify` fans out host notifications.
//!
//! # Example
//!
//! ```ignore
//! use editorlink::{BatchCall, BatchOptions, LinkConfig, SidecarClient};
//!
//! let config = LinkConfig::from_env()?;
//! let mut sidecar = SidecarClient::spawn(&config.sidecar_spec(), &config).await?;
//! sidecar.initialize().await?;
//!
//! let calls = vec![BatchCall::new("unreal.ping", Default::default())];
//! let result = sidecar
//!     .batch(&calls, BatchOptions::default(), |n| println!("{}", n.method))
//!     .await?;
//! ```

pub mod batch;
pub mod client;
pub mod config;
pub mod correlator;
pub mod error;
pub mod framing;
pub mod message;
pub mod notify;
pub mod transport;

pub use batch::{BatchCall, BatchEntry, BatchExecutor, BatchOptions, BatchResult, BatchSummary};
pub use client::{EditorClient, SidecarClient};
pub use config::LinkConfig;
pub use correlator::{Correlator, PendingRequest};
pub use error::{LinkError, Result};
pub use framing::{Framer, Framing};
pub use message::{Message, Params, RemoteFailure, Reply, RequestId};
pub use notify::{BatchProgress, Notification, NotificationRouter, Subscription};
pub use transport::{Connection, Endpoint, ProcessSpec};
