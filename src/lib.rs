//! lanbeam: point-to-point file transfer over the local network.
//!
//! A sender connects to a receiver's [`server::SessionAcceptor`] and streams
//! a [`item::Bundle`] through a [`transfer::TransferSession`]. The wire
//! format lives in [`protocol`].

pub mod config;
pub mod error;
pub mod item;
pub mod protocol;
pub mod server;
pub mod transfer;

pub use error::{Result, TransferError};
