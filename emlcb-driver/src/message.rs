//! Inbound message object

use emlcb_core::{Mti, NodeHandle};

#[derive(Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct InvalidLength;

/// Fixed-capacity message payload
///
/// Holds the data part of a complete (reassembled) OpenLCB message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Payload {
    length: u8,
    bytes: [u8; Payload::MAX],
}

impl Payload {
    pub const MAX: usize = 72;

    pub const EMPTY: Payload = Payload {
        length: 0,
        bytes: [0; Payload::MAX],
    };

    /// Creates a new vector from a slice no longer than [`Payload::MAX`].
    pub fn new(data: &[u8]) -> Result<Self, InvalidLength> {
        if data.len() > Self::MAX {
            return Err(InvalidLength);
        }
        let mut bytes = [0; Self::MAX];
        bytes[..data.len()].copy_from_slice(data);

        Ok(Self {
            length: data.len() as u8,
            bytes,
        })
    }
}

impl Default for Payload {
    fn default() -> Self {
        Self::EMPTY
    }
}

impl core::ops::Deref for Payload {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.bytes[..usize::from(self.length)]
    }
}

impl core::ops::DerefMut for Payload {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.bytes[..usize::from(self.length)]
    }
}

/// Complete inbound OpenLCB message
///
/// The destination should be consistent with the MTI:
/// * `None` for global messages
/// * `Some` for addressed messages
///
/// A transport may leave the destination empty for an addressed message when it cannot resolve
/// it; the stack treats such messages as malformed where the destination matters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Message {
    pub mti: Mti,
    pub src: NodeHandle,
    pub dst: Option<NodeHandle>,
    pub payload: Payload,
}

impl Message {
    pub const fn new(mti: Mti, src: NodeHandle, dst: Option<NodeHandle>, payload: Payload) -> Self {
        Self {
            mti,
            src,
            dst,
            payload,
        }
    }
}
