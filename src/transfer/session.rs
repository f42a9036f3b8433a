//! Transfer session: drives one connection through the protocol.
//!
//! The session loop is readiness-driven. Each iteration recomputes whether
//! the session wants to read (feed the decoder) and whether it has a frame to
//! write, then waits on whichever of those, the stop signal or the idle timer
//! fires first. Reads and writes are partial; the decoder and the pending
//! outbound frame keep track of how far they got.

use super::event::{EventSender, TransferEvent, TransferEventKind, TransferStats};
use super::state::{progress_percent, Direction, TransferState};
use super::TransferId;
use crate::error::{Result, TransferError};
use crate::item::{Bundle, Item, ItemRegistry, OpenMode, Properties};
use crate::protocol::{
    write_packet, Packet, PacketDecoder, PacketType, TransferHeader, CHUNK_SIZE, HEADER_LEN,
    MAX_FRAME_SIZE,
};
use bytes::{Buf, Bytes, BytesMut};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Inbound buffer reservation per read (64KB)
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// How long a failing session waits to tell the peer why.
const ERROR_NOTIFY_TIMEOUT: Duration = Duration::from_secs(2);

/// Default idle timeout (30s)
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Per-session protocol limits
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Maximum content bytes per Binary packet
    pub chunk_size: usize,
    /// Largest frame length accepted from the peer
    pub max_frame_size: u32,
    /// Fail when no read or write completes for this long (None = never)
    pub idle_timeout: Option<Duration>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            chunk_size: CHUNK_SIZE,
            max_frame_size: MAX_FRAME_SIZE,
            idle_timeout: Some(DEFAULT_IDLE_TIMEOUT),
        }
    }
}

impl SessionConfig {
    /// Chunk size clamped so every Binary frame fits under `max_frame_size`.
    fn effective_chunk_size(&self) -> usize {
        let frame_limit = (self.max_frame_size as usize).saturating_sub(HEADER_LEN).max(1);
        self.chunk_size.clamp(1, frame_limit)
    }
}

/// Everything a session needs besides its connection.
#[derive(Debug, Clone)]
pub struct SessionContext {
    /// Name announced in the transfer header when sending
    pub device_name: String,
    /// Root directory for received items
    pub destination: PathBuf,
    pub registry: Arc<ItemRegistry>,
    pub config: SessionConfig,
    pub events: EventSender,
}

/// Requests a running session to stop.
#[derive(Debug, Clone)]
pub struct StopHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.tx.borrow()
    }
}

pub(crate) async fn stop_requested(stop: &mut watch::Receiver<bool>) {
    loop {
        if *stop.borrow_and_update() {
            return;
        }
        if stop.changed().await.is_err() {
            // Every handle is gone; nobody can stop us any more.
            std::future::pending::<()>().await;
        }
    }
}

async fn idle(timeout: Option<Duration>) {
    match timeout {
        Some(d) => tokio::time::sleep(d).await,
        None => std::future::pending().await,
    }
}

/// One transfer over one connection.
pub struct TransferSession<S> {
    stream: S,
    stop: watch::Receiver<bool>,
    engine: Engine,
}

impl<S> TransferSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Session that transmits `bundle` over `stream`.
    pub fn sender(id: TransferId, stream: S, bundle: Bundle, ctx: SessionContext) -> (Self, StopHandle) {
        let count = bundle.len() as u64;
        let total = bundle.total_size();
        let device_name = ctx.device_name.clone();
        let engine = Engine::new(id, Direction::Send, bundle.into_items(), count, total, device_name, ctx);
        Self::with_engine(stream, engine)
    }

    /// Session that accepts a transfer from `stream` into `ctx.destination`.
    pub fn receiver(id: TransferId, stream: S, ctx: SessionContext) -> (Self, StopHandle) {
        let engine = Engine::new(id, Direction::Receive, Vec::new(), 0, 0, String::new(), ctx);
        Self::with_engine(stream, engine)
    }

    fn with_engine(stream: S, engine: Engine) -> (Self, StopHandle) {
        let (tx, rx) = watch::channel(false);
        let session = Self {
            stream,
            stop: rx,
            engine,
        };
        (session, StopHandle { tx: Arc::new(tx) })
    }

    pub fn id(&self) -> TransferId {
        self.engine.id
    }

    pub fn direction(&self) -> Direction {
        self.engine.direction
    }

    /// Run the transfer to completion, closing the connection afterwards.
    pub async fn run(self) -> Result<TransferStats> {
        let TransferSession {
            stream,
            mut stop,
            mut engine,
        } = self;
        let (mut reader, mut writer) = tokio::io::split(stream);

        engine.emit(TransferEventKind::Connected);
        debug!(transfer = %engine.id, direction = ?engine.direction, "transfer started");

        let result = engine.drive(&mut reader, &mut writer, &mut stop).await;
        engine.abort_current().await;

        match &result {
            Ok(stats) => {
                info!(
                    transfer = %engine.id,
                    items = stats.items,
                    bytes = stats.bytes_transferred,
                    "transfer succeeded"
                );
                engine.emit(TransferEventKind::Succeeded);
            }
            Err(err) => {
                warn!(transfer = %engine.id, state = ?engine.state, "transfer failed: {}", err);
                // Only safe when no half-written frame is on the wire.
                if err.should_notify_peer() && engine.outgoing.is_empty() {
                    let packet = Packet::error(&err.to_string());
                    let notify = write_packet(&mut writer, &packet);
                    if tokio::time::timeout(ERROR_NOTIFY_TIMEOUT, notify).await.is_err() {
                        debug!(transfer = %engine.id, "peer did not accept error packet");
                    }
                }
                engine.emit(TransferEventKind::Failed(err.to_string()));
            }
        }

        let _ = tokio::time::timeout(ERROR_NOTIFY_TIMEOUT, writer.shutdown()).await;
        engine.emit(TransferEventKind::Finished);
        result
    }
}

/// Protocol state for one session, independent of the connection halves.
struct Engine {
    id: TransferId,
    direction: Direction,
    ctx: SessionContext,
    state: TransferState,
    /// Items still to send (sender only)
    pending: std::vec::IntoIter<Box<dyn Item>>,
    /// Item currently in its content phase
    current: Option<Box<dyn Item>>,
    /// Received items waiting for `finalize`, in arrival order
    deferred: Vec<Box<dyn Item>>,
    device_name: String,
    index: u64,
    count: u64,
    remaining: u64,
    transferred: u64,
    total: u64,
    progress: u8,
    decoder: PacketDecoder,
    /// Unsent tail of the frame being written
    outgoing: Bytes,
    success_queued: bool,
    done: bool,
}

impl Engine {
    fn new(
        id: TransferId,
        direction: Direction,
        items: Vec<Box<dyn Item>>,
        count: u64,
        total: u64,
        device_name: String,
        ctx: SessionContext,
    ) -> Self {
        let decoder = PacketDecoder::new(ctx.config.max_frame_size);
        Self {
            id,
            direction,
            ctx,
            state: TransferState::TransferHeader,
            pending: items.into_iter(),
            current: None,
            deferred: Vec::new(),
            device_name,
            index: 0,
            count,
            remaining: 0,
            transferred: 0,
            total,
            progress: 0,
            decoder,
            outgoing: Bytes::new(),
            success_queued: false,
            done: false,
        }
    }

    fn emit(&self, kind: TransferEventKind) {
        let _ = self.ctx.events.send(TransferEvent { id: self.id, kind });
    }

    fn stats(&self) -> TransferStats {
        TransferStats {
            device_name: self.device_name.clone(),
            items: self.index,
            bytes_transferred: self.transferred,
            total_bytes: self.total,
        }
    }

    fn wants_read(&self) -> bool {
        match self.direction {
            // Senders must notice an Error packet at any time.
            Direction::Send => true,
            Direction::Receive => self.state != TransferState::Finished,
        }
    }

    fn wants_packet(&self) -> bool {
        match self.direction {
            Direction::Send => self.state != TransferState::Finished,
            Direction::Receive => self.state == TransferState::Finished && !self.success_queued,
        }
    }

    async fn drive<R, W>(
        &mut self,
        reader: &mut R,
        writer: &mut W,
        stop: &mut watch::Receiver<bool>,
    ) -> Result<TransferStats>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut inbound = BytesMut::with_capacity(READ_BUFFER_SIZE);
        let idle_timeout = self.ctx.config.idle_timeout;

        while !self.done {
            if self.outgoing.is_empty() && self.wants_packet() {
                if let Some(packet) = self.next_packet().await? {
                    self.outgoing = packet.encode();
                }
            }

            let want_read = self.wants_read();
            let want_write = !self.outgoing.is_empty();
            if !want_read && !want_write {
                return Err(TransferError::protocol(format!(
                    "session stalled in state {:?}",
                    self.state
                )));
            }
            inbound.reserve(READ_BUFFER_SIZE);

            tokio::select! {
                biased;

                _ = stop_requested(stop) => return Err(TransferError::Cancelled),

                res = reader.read_buf(&mut inbound), if want_read => {
                    if res? == 0 {
                        return Err(TransferError::ConnectionClosed);
                    }
                    while !inbound.is_empty() && self.wants_read() && !self.done {
                        match self.decoder.decode(&mut inbound)? {
                            Some(packet) => self.handle_packet(packet).await?,
                            None => break,
                        }
                    }
                }

                res = writer.write(&self.outgoing), if want_write => {
                    let n = res?;
                    if n == 0 {
                        return Err(io::Error::from(io::ErrorKind::WriteZero).into());
                    }
                    self.outgoing.advance(n);
                    if self.outgoing.is_empty() {
                        writer.flush().await?;
                        if self.success_queued {
                            self.done = true;
                        }
                    }
                }

                _ = idle(idle_timeout) => {
                    let secs = idle_timeout.map(|d| d.as_secs()).unwrap_or_default();
                    return Err(TransferError::Timeout(secs));
                }
            }
        }

        Ok(self.stats())
    }

    async fn next_packet(&mut self) -> Result<Option<Packet>> {
        match self.direction {
            Direction::Send => self.next_send_packet().await,
            Direction::Receive => {
                self.finalize_deferred().await?;
                self.success_queued = true;
                debug!(transfer = %self.id, "all items received, sending success");
                Ok(Some(Packet::success()))
            }
        }
    }

    async fn next_send_packet(&mut self) -> Result<Option<Packet>> {
        match self.state {
            TransferState::TransferHeader => {
                let header = TransferHeader::new(self.device_name.clone(), self.count, self.total);
                debug!(
                    transfer = %self.id,
                    count = self.count,
                    size = self.total,
                    "sending transfer header"
                );
                self.state = TransferState::after_item(0, self.count);
                Ok(Some(Packet::metadata(&header)?))
            }
            TransferState::ItemHeader => {
                let mut item = self.pending.next().ok_or_else(|| {
                    TransferError::protocol(format!("bundle ran out of items at {}", self.index))
                })?;
                let packet = Packet::metadata(&item.properties())?;
                if item.size() > 0 {
                    item.open(OpenMode::Read).await?;
                    self.remaining = item.size();
                    self.current = Some(item);
                    self.state = TransferState::ItemContent;
                } else {
                    self.finish_item(item.as_ref());
                }
                Ok(Some(packet))
            }
            TransferState::ItemContent => {
                let want = self
                    .remaining
                    .min(self.ctx.config.effective_chunk_size() as u64) as usize;
                let item = self
                    .current
                    .as_mut()
                    .ok_or_else(|| TransferError::protocol("no item in content phase"))?;

                let mut chunk = vec![0u8; want];
                let mut filled = 0;
                while filled < want {
                    let n = item.read(&mut chunk[filled..]).await?;
                    if n == 0 {
                        break;
                    }
                    filled += n;
                }
                if filled == 0 {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!(
                            "{} ended {} bytes before its declared size",
                            item.name(),
                            self.remaining
                        ),
                    )
                    .into());
                }
                chunk.truncate(filled);

                self.remaining -= filled as u64;
                self.add_progress(filled as u64);
                if self.remaining == 0 {
                    if let Some(mut item) = self.current.take() {
                        item.close().await?;
                        self.finish_item(item.as_ref());
                    }
                }
                Ok(Some(Packet::binary(chunk)))
            }
            TransferState::Finished => Ok(None),
        }
    }

    async fn handle_packet(&mut self, packet: Packet) -> Result<()> {
        if packet.packet_type == PacketType::Error {
            return Err(TransferError::Remote(packet.error_message()));
        }

        match (self.direction, self.state, packet.packet_type) {
            // Only once the last frame has fully left.
            (Direction::Send, TransferState::Finished, PacketType::Success)
                if self.outgoing.is_empty() =>
            {
                debug!(transfer = %self.id, "peer confirmed transfer");
                self.done = true;
                Ok(())
            }
            (Direction::Receive, TransferState::TransferHeader, PacketType::Metadata) => {
                self.on_transfer_header(&packet)
            }
            (Direction::Receive, TransferState::ItemHeader, PacketType::Metadata) => {
                self.on_item_header(&packet).await
            }
            (Direction::Receive, TransferState::ItemContent, PacketType::Binary) => {
                self.on_item_content(packet.payload).await
            }
            (_, state, packet_type) => Err(TransferError::protocol(format!(
                "unexpected {:?} packet in state {:?}",
                packet_type, state
            ))),
        }
    }

    fn on_transfer_header(&mut self, packet: &Packet) -> Result<()> {
        let header: TransferHeader = packet.parse_metadata()?;
        info!(
            transfer = %self.id,
            device = %header.name,
            count = header.count,
            size = header.size,
            "incoming transfer"
        );

        self.device_name = header.name.clone();
        self.count = header.count;
        self.total = header.size;
        self.state = TransferState::after_item(0, self.count);
        self.emit(TransferEventKind::HeaderReceived {
            device_name: header.name,
            count: header.count,
            size: header.size,
        });
        Ok(())
    }

    async fn on_item_header(&mut self, packet: &Packet) -> Result<()> {
        let props: Properties = packet.parse_metadata()?;
        let mut item = self.ctx.registry.create(&props, &self.ctx.destination)?;
        debug!(transfer = %self.id, item = item.name(), size = item.size(), "receiving item");

        item.open(OpenMode::Write).await?;
        if item.size() > 0 {
            self.remaining = item.size();
            self.current = Some(item);
            self.state = TransferState::ItemContent;
        } else {
            item.close().await?;
            self.finish_item(item.as_ref());
            self.retain_deferred(item);
        }
        Ok(())
    }

    async fn on_item_content(&mut self, payload: Bytes) -> Result<()> {
        let len = payload.len() as u64;
        if len > self.remaining {
            return Err(TransferError::protocol(format!(
                "binary packet of {} bytes exceeds the {} bytes left in the item",
                len, self.remaining
            )));
        }
        let item = self
            .current
            .as_mut()
            .ok_or_else(|| TransferError::protocol("no item in content phase"))?;
        item.write(&payload).await?;

        self.remaining -= len;
        self.add_progress(len);
        if self.remaining == 0 {
            if let Some(mut item) = self.current.take() {
                item.close().await?;
                self.finish_item(item.as_ref());
                self.retain_deferred(item);
            }
        }
        Ok(())
    }

    fn finish_item(&mut self, item: &dyn Item) {
        let name = item.name().to_string();
        let size = item.size();
        self.emit(match self.direction {
            Direction::Send => TransferEventKind::ItemSent { name, size },
            Direction::Receive => TransferEventKind::ItemReceived { name, size },
        });
        self.index += 1;
        self.state = TransferState::after_item(self.index, self.count);
    }

    fn retain_deferred(&mut self, item: Box<dyn Item>) {
        if item.has_deferred_attributes() {
            self.deferred.push(item);
        }
    }

    async fn finalize_deferred(&mut self) -> Result<()> {
        while let Some(mut item) = self.deferred.pop() {
            item.finalize().await?;
        }
        Ok(())
    }

    fn add_progress(&mut self, bytes: u64) {
        self.transferred += bytes;
        let pct = progress_percent(self.transferred, self.total);
        if pct != self.progress {
            self.progress = pct;
            self.emit(TransferEventKind::Progress(pct));
        }
    }

    async fn abort_current(&mut self) {
        if let Some(mut item) = self.current.take() {
            item.abort().await;
        }
    }
}
