//! Session acceptor - runs when invoked as `lanbeam receive`
//!
//! Listens for inbound connections and runs one receiving session per
//! connection on its own task. Stopping the acceptor only stops intake;
//! sessions already running are left alone.

use crate::error::Result;
use crate::transfer::session::stop_requested;
use crate::transfer::{IdAllocator, SessionContext, StopHandle, TransferId, TransferSession};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Well-known transfer port
pub const DEFAULT_PORT: u16 = 40818;

/// Pause after a failed accept (e.g. out of file descriptors)
const ACCEPT_BACKOFF: Duration = Duration::from_millis(250);

type SessionTable = Arc<Mutex<HashMap<TransferId, StopHandle>>>;

fn lock(table: &SessionTable) -> MutexGuard<'_, HashMap<TransferId, StopHandle>> {
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Controls a running [`SessionAcceptor`] from other tasks.
#[derive(Debug, Clone)]
pub struct AcceptorHandle {
    shutdown: Arc<watch::Sender<bool>>,
    sessions: SessionTable,
}

impl AcceptorHandle {
    /// Stop accepting new connections. Safe to call more than once.
    pub fn shutdown(&self) {
        if !self.shutdown.send_replace(true) {
            debug!("acceptor shutdown requested");
        }
    }

    pub fn is_shutdown(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Ask one running transfer to stop. Returns false if it is not running.
    pub fn stop_transfer(&self, id: TransferId) -> bool {
        match lock(&self.sessions).get(&id) {
            Some(handle) => {
                handle.stop();
                true
            }
            None => false,
        }
    }

    /// Ids of sessions that have not finished yet.
    pub fn active_transfers(&self) -> Vec<TransferId> {
        let mut ids: Vec<TransferId> = lock(&self.sessions).keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

pub struct SessionAcceptor {
    listener: TcpListener,
    ctx: SessionContext,
    ids: IdAllocator,
    shutdown: watch::Receiver<bool>,
    handle: AcceptorHandle,
}

impl SessionAcceptor {
    pub async fn bind<A: ToSocketAddrs>(addr: A, ctx: SessionContext) -> Result<Self> {
        Self::with_ids(addr, ctx, IdAllocator::default()).await
    }

    /// Bind with a caller-supplied id allocator.
    pub async fn with_ids<A: ToSocketAddrs>(
        addr: A,
        ctx: SessionContext,
        ids: IdAllocator,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let (tx, rx) = watch::channel(false);
        Ok(Self {
            listener,
            ctx,
            ids,
            shutdown: rx,
            handle: AcceptorHandle {
                shutdown: Arc::new(tx),
                sessions: Arc::new(Mutex::new(HashMap::new())),
            },
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn handle(&self) -> AcceptorHandle {
        self.handle.clone()
    }

    /// Accept connections until [`AcceptorHandle::shutdown`] is called.
    pub async fn run(self) -> Result<()> {
        let addr = self.local_addr()?;
        info!(addr = %addr, root = %self.ctx.destination.display(), "accepting transfers");

        let mut shutdown = self.shutdown.clone();
        loop {
            tokio::select! {
                biased;

                _ = stop_requested(&mut shutdown) => break,

                res = self.listener.accept() => match res {
                    Ok((stream, peer)) => self.dispatch(stream, peer),
                    Err(e) => {
                        warn!("Failed to accept connection: {}", e);
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
            }
        }

        info!(addr = %addr, "acceptor stopped");
        Ok(())
    }

    fn dispatch(&self, stream: TcpStream, peer: SocketAddr) {
        let id = self.ids.allocate();
        if let Err(e) = stream.set_nodelay(true) {
            debug!(transfer = %id, "Failed to set TCP_NODELAY: {}", e);
        }
        info!(transfer = %id, peer = %peer, "accepted connection");

        let (session, stop) = TransferSession::receiver(id, stream, self.ctx.clone());
        lock(&self.handle.sessions).insert(id, stop);

        let sessions = Arc::clone(&self.handle.sessions);
        tokio::spawn(async move {
            if let Err(e) = session.run().await {
                debug!(transfer = %id, peer = %peer, "session ended with error: {}", e);
            }
            lock(&sessions).remove(&id);
        });
    }
}
