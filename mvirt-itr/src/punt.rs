//! Map-cache miss notifications to the control plane
//!
//! A punt is one compact JSON object per message:
//!
//! ```text
//! {"Type":"discovery","Deid":"fd00::2","Seid":"fd00::1","Iface":"eth0"}
//! ```
//!
//! Sending never blocks the forwarding path; a full channel drops the punt
//! and the entry's rate limiter retries after the punt interval.

use std::net::Ipv6Addr;

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default punt channel capacity
pub const PUNT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Error)]
pub enum PuntError {
    #[error("failed to serialize punt: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("punt channel full")]
    ChannelFull,
    #[error("punt channel disconnected")]
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PuntKind {
    Discovery,
}

/// A request to resolve a destination EID.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PuntMessage {
    #[serde(rename = "Type")]
    pub kind: PuntKind,
    /// Destination EID that missed
    #[serde(rename = "Deid")]
    pub dst_eid: Ipv6Addr,
    /// Source EID of the packet that missed
    #[serde(rename = "Seid")]
    pub src_eid: Ipv6Addr,
    /// Capture interface
    #[serde(rename = "Iface")]
    pub iface: String,
}

impl PuntMessage {
    pub fn discovery(dst_eid: Ipv6Addr, src_eid: Ipv6Addr, iface: &str) -> Self {
        PuntMessage {
            kind: PuntKind::Discovery,
            dst_eid,
            src_eid,
            iface: iface.to_string(),
        }
    }

    pub fn to_json(&self) -> Result<Vec<u8>, PuntError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, PuntError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Worker side of the punt channel.
#[derive(Clone)]
pub struct PuntEmitter {
    tx: Sender<Vec<u8>>,
}

impl PuntEmitter {
    pub fn new(tx: Sender<Vec<u8>>) -> Self {
        PuntEmitter { tx }
    }

    /// Serialize and queue `msg` without blocking.
    pub fn emit(&self, msg: &PuntMessage) -> Result<(), PuntError> {
        let bytes = msg.to_json()?;
        self.tx.try_send(bytes).map_err(|e| match e {
            TrySendError::Full(_) => PuntError::ChannelFull,
            TrySendError::Disconnected(_) => PuntError::Disconnected,
        })
    }
}

/// Bounded punt channel.
pub fn punt_channel(capacity: usize) -> (PuntEmitter, Receiver<Vec<u8>>) {
    let (tx, rx) = bounded(capacity);
    (PuntEmitter::new(tx), rx)
}
