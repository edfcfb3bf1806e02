//! Routing of assembled frames to the event sink or the waiting request.

use crate::correlation::CorrelationTable;
use crate::event::Event;
use qwire_protocol::{Frame, PacketKind};
use std::sync::Arc;
use tokio::sync::broadcast;

/// What happened to a dispatched frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatched {
    /// Published to event subscribers.
    Event,
    /// Handed to the pending request with its correlation id.
    Response,
    /// A response nobody was waiting for (timed out or cancelled).
    Unmatched,
    /// Not something a client should receive.
    Dropped,
}

/// Routes frames by their type tag.
pub struct Dispatcher {
    table: Arc<CorrelationTable>,
    events: broadcast::Sender<Event>,
}

impl Dispatcher {
    pub fn new(table: Arc<CorrelationTable>, events: broadcast::Sender<Event>) -> Self {
        Self { table, events }
    }

    pub fn dispatch(&self, frame: Frame) -> Dispatched {
        let id = frame.correlation_id();
        match PacketKind::from_tag(frame.type_tag()) {
            PacketKind::Event(kind) => {
                tracing::debug!("dispatch: event {:?} ({} bytes)", kind, frame.payload_length());
                // No subscribers is fine; events are simply not observed.
                let _ = self.events.send(Event {
                    kind,
                    payload: frame.into_payload(),
                });
                Dispatched::Event
            }
            PacketKind::Response(kind) => {
                if self.table.deliver(id, Ok(frame)) {
                    tracing::debug!("dispatch: response {:?} for id={}", kind, id);
                    Dispatched::Response
                } else {
                    tracing::debug!(
                        "dispatch: no pending request for id={}, probably timed out",
                        id
                    );
                    Dispatched::Unmatched
                }
            }
            PacketKind::Request(kind) => {
                tracing::warn!("dispatch: dropping request packet {:?} from peer", kind);
                Dispatched::Dropped
            }
            PacketKind::Unknown(tag) => {
                tracing::warn!("dispatch: dropping packet with unknown type {}", tag);
                Dispatched::Dropped
            }
        }
    }
}
