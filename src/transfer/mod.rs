//! Transfer sessions and their lifecycle events.

pub mod event;
pub mod id;
pub mod session;
pub mod state;

pub use event::{
    event_channel, EventReceiver, EventSender, TransferEvent, TransferEventKind, TransferStats,
};
pub use id::{IdAllocator, TransferId};
pub use session::{SessionConfig, SessionContext, StopHandle, TransferSession, DEFAULT_IDLE_TIMEOUT};
pub use state::{progress_percent, Direction, TransferState};

use crate::error::Result;
use crate::item::Bundle;
use tokio::net::{TcpStream, ToSocketAddrs};
use tracing::debug;

/// Connect to a receiving peer and prepare a session that sends `bundle`.
pub async fn connect<A: ToSocketAddrs>(
    addr: A,
    id: TransferId,
    bundle: Bundle,
    ctx: SessionContext,
) -> Result<(TransferSession<TcpStream>, StopHandle)> {
    let stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    if let Ok(peer) = stream.peer_addr() {
        debug!(transfer = %id, peer = %peer, items = bundle.len(), "connected");
    }
    Ok(TransferSession::sender(id, stream, bundle, ctx))
}
