/// Which end of the connection a session drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Send,
    Receive,
}

/// Protocol state, shared by both directions.
///
/// `TransferHeader -> (ItemHeader -> ItemContent?)* -> Finished`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    TransferHeader,
    ItemHeader,
    ItemContent,
    Finished,
}

impl TransferState {
    /// State after an item completes: the next header, or `Finished` once
    /// the cursor reaches the item count.
    pub fn after_item(index: u64, count: u64) -> Self {
        if index >= count {
            Self::Finished
        } else {
            Self::ItemHeader
        }
    }
}

/// `floor(100 * transferred / total)`, 0 for an empty transfer.
pub fn progress_percent(transferred: u64, total: u64) -> u8 {
    if total == 0 {
        return 0;
    }
    let pct = (transferred as u128 * 100) / total as u128;
    pct.min(100) as u8
}
