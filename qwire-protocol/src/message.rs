//! Packet type tags and the payload shapes the transport layer itself reads.
//!
//! Tags share one numeric space split into bands:
//!
//! | band      | tags   |
//! |-----------|--------|
//! | events    | 0..=4  |
//! | responses | 16..=21|
//! | requests  | 32..=37|

use serde::{Deserialize, Serialize};

/// Unsolicited packets pushed by the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EventKind {
    NodeStatus = 0,
    WatchInit = 1,
    WatchUpdate = 2,
    WatchDelete = 3,
    Warning = 4,
}

/// Responses to client requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ResponseKind {
    Ping = 16,
    Auth = 17,
    Query = 18,
    Watch = 19,
    Unwatch = 20,
    Error = 21,
}

/// Requests a client may send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RequestKind {
    Ping = 32,
    Auth = 33,
    Query = 34,
    Watch = 35,
    Unwatch = 36,
    Run = 37,
}

/// Classification of a type tag, resolved once per frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketKind {
    Event(EventKind),
    Response(ResponseKind),
    Request(RequestKind),
    Unknown(u8),
}

impl PacketKind {
    pub fn from_tag(tag: u8) -> Self {
        match tag {
            0 => PacketKind::Event(EventKind::NodeStatus),
            1 => PacketKind::Event(EventKind::WatchInit),
            2 => PacketKind::Event(EventKind::WatchUpdate),
            3 => PacketKind::Event(EventKind::WatchDelete),
            4 => PacketKind::Event(EventKind::Warning),
            16 => PacketKind::Response(ResponseKind::Ping),
            17 => PacketKind::Response(ResponseKind::Auth),
            18 => PacketKind::Response(ResponseKind::Query),
            19 => PacketKind::Response(ResponseKind::Watch),
            20 => PacketKind::Response(ResponseKind::Unwatch),
            21 => PacketKind::Response(ResponseKind::Error),
            32 => PacketKind::Request(RequestKind::Ping),
            33 => PacketKind::Request(RequestKind::Auth),
            34 => PacketKind::Request(RequestKind::Query),
            35 => PacketKind::Request(RequestKind::Watch),
            36 => PacketKind::Request(RequestKind::Unwatch),
            37 => PacketKind::Request(RequestKind::Run),
            other => PacketKind::Unknown(other),
        }
    }

    pub fn tag(&self) -> u8 {
        match self {
            PacketKind::Event(kind) => kind.tag(),
            PacketKind::Response(kind) => kind.tag(),
            PacketKind::Request(kind) => kind.tag(),
            PacketKind::Unknown(tag) => *tag,
        }
    }
}

impl From<u8> for PacketKind {
    fn from(tag: u8) -> Self {
        PacketKind::from_tag(tag)
    }
}

impl EventKind {
    pub fn tag(self) -> u8 {
        self as u8
    }
}

impl ResponseKind {
    pub fn tag(self) -> u8 {
        self as u8
    }
}

impl RequestKind {
    pub fn tag(self) -> u8 {
        self as u8
    }

    /// The response kind a successful reply to this request carries.
    pub fn expected_response(self) -> ResponseKind {
        match self {
            RequestKind::Ping => ResponseKind::Ping,
            RequestKind::Auth => ResponseKind::Auth,
            RequestKind::Query | RequestKind::Run => ResponseKind::Query,
            RequestKind::Watch => ResponseKind::Watch,
            RequestKind::Unwatch => ResponseKind::Unwatch,
        }
    }
}

/// Payload of an error response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub error_msg: String,
    pub error_code: i64,
}

/// Payload of a warning event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WarningPayload {
    pub warn_msg: String,
    pub warn_code: i64,
}

/// Node states reported through node status events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeStatus {
    Offline,
    Connecting,
    Building,
    ShuttingDown,
    Synchronizing,
    Away,
    AwaySoon,
    Ready,
}
