//! Session lifecycle events.
//!
//! Sessions push events into an unbounded channel so a slow consumer never
//! stalls the transfer. Every session emits `Connected` first and `Finished`
//! last, with exactly one `Succeeded` or `Failed` in between.

use super::TransferId;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferEventKind {
    Connected,
    /// Receiver learned what is coming.
    HeaderReceived {
        device_name: String,
        count: u64,
        size: u64,
    },
    ItemSent {
        name: String,
        size: u64,
    },
    ItemReceived {
        name: String,
        size: u64,
    },
    Progress(u8),
    Succeeded,
    Failed(String),
    Finished,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferEvent {
    pub id: TransferId,
    pub kind: TransferEventKind,
}

/// Sender half handed to sessions.
pub type EventSender = mpsc::UnboundedSender<TransferEvent>;

/// Receiver half for notification/UI consumers.
pub type EventReceiver = mpsc::UnboundedReceiver<TransferEvent>;

pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

/// Totals reported when a session ends successfully.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TransferStats {
    /// Device name from the transfer header (the peer's for receivers).
    pub device_name: String,
    pub items: u64,
    pub bytes_transferred: u64,
    pub total_bytes: u64,
}
