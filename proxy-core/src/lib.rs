//! Core library for the local multi-backend inference proxy: model
//! resolution, backend lifecycle, the streaming reverse proxy, the peer
//! blob-transfer service, and the control API, assembled by the `proxy`
//! binary crate.

pub mod child_log;
pub mod config;
pub mod content_index;
pub mod error;
pub mod model;
pub mod peer;
pub mod pool;
pub mod port_allocator;
pub mod presence;
pub mod registry;
pub mod routes;
pub mod server;
pub mod state;
pub mod supervisor;

pub use config::ProxyConfig;
pub use error::{ProxyError, ProxyResult};
pub use model::ModelId;
