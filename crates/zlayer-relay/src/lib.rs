//! `ZLayer` Relay - publish local HTTP APIs under short public keys
//!
//! An operator registers an origin and receives a key. Third parties then call
//! `/api/{key}/...` on the broker, which reaches the origin in one of two ways:
//!
//! - **Direct fetch** - the broker calls the registered origin URL itself
//! - **Socket relay** - the origin keeps a WebSocket open to `/ws/{key}` and the
//!   broker serializes each request over it, waiting for the matching response
//!
//! # Architecture
//!
//! - **Registry**: key bindings and the single live tunnel session per key
//! - **Session**: one tunnel connection, driven by a dedicated task that owns the
//!   socket; requests queue and are answered strictly one at a time
//! - **Server**: axum router with registration, relay, tunnel and health routes
//! - **Agent**: origin-side client that answers relayed requests from a local API
//!
//! # Protocol
//!
//! ```text
//! origin -> broker   "<key>"                                   (handshake)
//! broker -> origin   {"id","method","url","headers","body"}    (request)
//! origin -> broker   {"id","status","headers","body"}          (response)
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use zlayer_relay::{RelayServer, RelayServerConfig};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = RelayServerConfig {
//!     bind: "127.0.0.1:8080".parse()?,
//!     ..Default::default()
//! };
//! RelayServer::new(config).run().await
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod client;
pub mod config;
pub mod error;
pub mod forward;
pub mod keys;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;

// Re-export main types at crate root
pub use client::{AgentState, RelayAgent};
pub use config::{CorsConfig, RelayClientConfig, RelayServerConfig};
pub use error::{ErrorResponse, RelayError, Result};
pub use forward::DirectForwarder;
pub use keys::{KeyAllocator, KeyStrategy, PublicKey};
pub use protocol::{BodyEncoding, HeaderMultimap, RequestEnvelope, ResponseEnvelope};
pub use registry::{OriginBinding, SessionRegistry};
pub use server::{build_router, AppState, RegisterRequest, RegisterResponse, RelayServer};
pub use session::{CloseReason, SessionInbox, SessionInfo, TunnelSession};
