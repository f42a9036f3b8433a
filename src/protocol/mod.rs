//! Wire protocol for lanbeam transfers.
//!
//! # Packet sequence
//!
//! ```text
//! Sender                                  Receiver
//!   | Metadata {name, count, size}          |
//!   |-------------------------------------->|
//!   | Metadata {item properties}            |   (per item)
//!   |-------------------------------------->|
//!   | Binary (<= chunk size) ...            |   (items with size > 0)
//!   |-------------------------------------->|
//!   |                               Success |
//!   |<--------------------------------------|
//! ```
//!
//! Either side may send an Error packet at any point to abort the transfer.

pub mod header;
pub mod packet;

pub use header::TransferHeader;
pub use packet::{
    read_packet, write_packet, Packet, PacketDecoder, PacketType, CHUNK_SIZE, HEADER_LEN,
    MAX_FRAME_SIZE,
};
