//! Pending-request table keyed by correlation id.

use crate::error::ClientError;
use parking_lot::Mutex;
use qwire_protocol::Frame;
use std::collections::HashMap;
use tokio::sync::oneshot;

/// Result delivered to a waiting request.
pub type Delivery = Result<Frame, ClientError>;

/// Maps in-flight correlation ids to single-use response slots.
///
/// Every mutation runs under one lock. Delivery and removal race on the same
/// entry; whichever takes it out of the map first wins and the other is a
/// no-op.
#[derive(Debug, Default)]
pub struct CorrelationTable {
    slots: Mutex<HashMap<u16, oneshot::Sender<Delivery>>>,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a slot for `id` and returns its receiving end.
    pub fn register(&self, id: u16) -> Result<oneshot::Receiver<Delivery>, ClientError> {
        let mut slots = self.slots.lock();
        if slots.contains_key(&id) {
            return Err(ClientError::IdInUse(id));
        }

        let (tx, rx) = oneshot::channel();
        slots.insert(id, tx);
        Ok(rx)
    }

    /// Hands `result` to the waiter for `id` and frees the slot.
    ///
    /// Returns `false` if no slot exists.
    pub fn deliver(&self, id: u16, result: Delivery) -> bool {
        let tx = self.slots.lock().remove(&id);
        match tx {
            Some(tx) => {
                // The waiter may have given up already; its result is dropped.
                let _ = tx.send(result);
                true
            }
            None => false,
        }
    }

    /// Frees the slot for `id` without a result.
    pub fn remove(&self, id: u16) -> bool {
        self.slots.lock().remove(&id).is_some()
    }

    /// Fails every pending slot with `ConnectionClosed` and empties the table.
    ///
    /// Returns the number of slots drained.
    pub fn drain_all(&self) -> usize {
        let drained: Vec<_> = self.slots.lock().drain().collect();
        let count = drained.len();
        for (_, tx) in drained {
            let _ = tx.send(Err(ClientError::ConnectionClosed));
        }
        count
    }

    pub fn contains(&self, id: u16) -> bool {
        self.slots.lock().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }
}
