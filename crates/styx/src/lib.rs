#![forbid(unsafe_code)]
//! Asynchronous client and server for the 9P2000.x resource-sharing
//! protocol.
//!
//! 9P is the Plan 9 file protocol: a tagged, framed request/response
//! protocol in which clients navigate a hierarchical namespace of named
//! resources exported by a server. Resources behave like files — they are
//! walked to by path, opened, read, written and clunked — but are usually
//! synthetic: in-memory data blobs, control endpoints, directories of
//! mounted subtrees. 9P2000.x is the compact dialect this crate speaks.
//!
//! # Overview
//!
//! The crate splits into the layers of the protocol:
//!
//! - [`fcall`] — message types and protocol constants
//! - [`serialize`] — binary encoding of every message variant
//! - [`codec`] — framing over a byte stream, with negotiated size limits
//! - [`session`] — version negotiation and fid allocation
//! - [`client`] — the asynchronous client: a transaction multiplexer that
//!   supports many outstanding requests per connection
//! - [`nodes`] — the server-side namespace: a tree of mountable directory
//!   and data nodes
//! - [`srv`] — the per-connection server session and the acceptors
//!
//! # Serving a namespace
//!
//! ```no_run
//! use std::sync::Arc;
//! use tokio::sync::RwLock;
//! use styx::{Endpoint, Namespace};
//!
//! #[tokio::main]
//! async fn main() -> styx::Result<()> {
//!     let mut ns = Namespace::new();
//!     let root = ns.root();
//!     let motd = ns.add_data(b"hello".to_vec());
//!     ns.mount(root, "motd", motd)?;
//!
//!     let endpoint: Endpoint = "tcp!127.0.0.1!5640".parse()?;
//!     styx::srv::serve(Arc::new(RwLock::new(ns)), &endpoint).await
//! }
//! ```
//!
//! # Talking to one
//!
//! ```no_run
//! use styx::{Client, Endpoint};
//!
//! #[tokio::main]
//! async fn main() -> styx::Result<()> {
//!     let endpoint: Endpoint = "tcp!127.0.0.1!5640".parse()?;
//!     let client = Client::connect(&endpoint).await?;
//!     client.attach("glenda", "").await?;
//!
//!     let motd = client.read_path("motd").await?;
//!     println!("{}", String::from_utf8_lossy(&motd));
//!     Ok(())
//! }
//! ```
//!
//! # Concurrency
//!
//! A client may keep as many requests in flight as its transaction pool
//! holds; replies are matched to callers by tag, in whatever order they
//! arrive. A server session is deliberately sequential — it does not read
//! the next request until the current reply is written — which gives
//! per-fid causal order without locks. Different connections are served by
//! independent sessions sharing one namespace.
//!
//! # Errors
//!
//! Every fallible operation returns [`utils::Result`]. Framing and
//! transport failures poison a connection; namespace failures travel back
//! to the peer as error replies and the session carries on.

pub mod client;
pub mod codec;
pub mod endpoint;
pub mod error;
pub mod fcall;
pub mod nodes;
pub mod serialize;
pub mod session;
pub mod srv;
mod tx;
#[macro_use]
pub mod utils;

pub use crate::client::Client;
pub use crate::endpoint::Endpoint;
pub use crate::error::Error;
pub use crate::fcall::*;
pub use crate::nodes::{Namespace, NodeId};
pub use crate::utils::Result;
