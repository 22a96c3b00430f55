//! Network side of conversation sync.
//!
//! [`api`] talks to the request/response API, [`connection`] owns one push
//! socket per open attempt, and [`runtime`] ties both to the `sync-core`
//! state behind a single session actor.

pub mod api;
pub mod connection;
pub mod runtime;

pub use api::{ChatApi, HttpChatApi};
pub use connection::{
    ConnectRequest, ConnectionEvent, ConnectionHandle, TransportEvent, spawn_connection,
};
pub use runtime::{SyncHandle, spawn_runtime};
