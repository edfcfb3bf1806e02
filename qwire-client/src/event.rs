//! Unsolicited events and connection lifecycle notifications.

use crate::error::ClientError;
use bytes::Bytes;
use qwire_protocol::message::{NodeStatus, WarningPayload};
use qwire_protocol::{EventKind, MsgPack};
use serde::de::DeserializeOwned;
use std::sync::Arc;

/// An event pushed by the node, not tied to any request.
#[derive(Debug, Clone)]
pub struct Event {
    pub kind: EventKind,
    pub payload: Bytes,
}

impl Event {
    /// Decodes the payload.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, ClientError> {
        Ok(MsgPack::decode(&self.payload)?)
    }

    /// Node status carried by a `NodeStatus` event.
    pub fn node_status(&self) -> Option<NodeStatus> {
        match self.kind {
            EventKind::NodeStatus => self.decode().ok(),
            _ => None,
        }
    }

    /// Warning carried by a `Warning` event.
    pub fn warning(&self) -> Option<WarningPayload> {
        match self.kind {
            EventKind::Warning => self.decode().ok(),
            _ => None,
        }
    }
}

/// Why a connection went away.
#[derive(Debug, Clone)]
pub enum DisconnectReason {
    /// `close()` was called locally.
    Closed,
    /// The peer closed the stream.
    Eof,
    /// The connection failed; the error that ended it.
    Failed(Arc<ClientError>),
}

/// Sent once per transition to `Disconnected`.
#[derive(Debug, Clone)]
pub struct Disconnect {
    /// Number of requests that were pending and failed with `ConnectionClosed`.
    pub pending_failed: usize,
    pub reason: DisconnectReason,
}
