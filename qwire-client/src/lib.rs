//! # qwire-client
//!
//! Async client library for the qwire protocol.
//!
//! This crate provides:
//! - A connection session multiplexing concurrent requests over one stream
//! - Routing of unsolicited events to subscribers
//! - TCP, TLS and child-process pipe transports
//! - A high-level API for ping, auth, query, run, watch and unwatch

pub mod client;
pub mod connection;
pub mod correlation;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod stream;
pub mod tls;

pub use client::{normalize_scope, Client, DEFAULT_SCOPE};
pub use connection::{
    Connection, ConnectionConfig, Credentials, Endpoint, SessionState, TlsClientConfig,
};
pub use correlation::CorrelationTable;
pub use dispatch::{Dispatched, Dispatcher};
pub use error::ClientError;
pub use event::{Disconnect, DisconnectReason, Event};
pub use stream::{ClientStream, Transport};
