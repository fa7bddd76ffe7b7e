//!
//! Common CAN data types
//!

use core::convert::TryFrom;

use borealis_core::{InvalidValue, TransferId};

use crate::FRAME_CAPACITY;

/// A 29-bit extended CAN ID
///
/// CAN IDs sort in bus arbitration order: a numerically smaller ID wins arbitration.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct CanId(u32);

impl CanId {
    /// The largest valid 29-bit CAN ID
    pub const MAX: CanId = CanId(0x1fff_ffff);
}

impl TryFrom<u32> for CanId {
    type Error = InvalidValue;
    fn try_from(bits: u32) -> Result<Self, Self::Error> {
        if bits <= CanId::MAX.0 {
            Ok(CanId(bits))
        } else {
            Err(InvalidValue)
        }
    }
}

impl From<CanId> for u32 {
    fn from(id: CanId) -> Self {
        id.0
    }
}

/// A CAN or CAN FD data frame with an extended 29-bit ID
///
/// `I` is the timestamp type. For incoming frames the timestamp records when the frame was
/// received; for outgoing frames it is the transmission deadline chosen by the application.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Frame<I> {
    timestamp: I,
    id: CanId,
    data: heapless::Vec<u8, FRAME_CAPACITY>,
}

impl<I> Frame<I> {
    /// Creates a frame
    ///
    /// # Panics
    ///
    /// This function panics if `data` is longer than `FRAME_CAPACITY` bytes.
    pub fn new(timestamp: I, id: CanId, data: &[u8]) -> Self {
        Frame {
            timestamp,
            id,
            data: heapless::Vec::from_slice(data).expect("Frame data too long"),
        }
    }

    /// Returns the timestamp
    pub fn timestamp(&self) -> I
    where
        I: Clone,
    {
        self.timestamp.clone()
    }

    /// Returns the CAN ID
    pub fn id(&self) -> CanId {
        self.id
    }

    /// Returns the frame data
    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

/// The tail byte that ends the data of every transfer frame
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct TailByte {
    /// This frame is the first frame of its transfer
    pub start: bool,
    /// This frame is the last frame of its transfer
    pub end: bool,
    /// Alternating bit, starting at 1 on the first frame
    ///
    /// A start-of-transfer frame with the toggle bit cleared belongs to the incompatible
    /// version 0 protocol.
    pub toggle: bool,
    /// The transfer ID, common to all frames of the transfer
    pub transfer_id: TransferId,
}

impl TailByte {
    /// Creates a tail byte from its fields
    pub fn new(start: bool, end: bool, toggle: bool, transfer_id: TransferId) -> Self {
        TailByte {
            start,
            end,
            toggle,
            transfer_id,
        }
    }

    /// Unpacks a tail byte from its wire form
    pub fn parse(bits: u8) -> Self {
        TailByte {
            start: bits & 0x80 != 0,
            end: bits & 0x40 != 0,
            toggle: bits & 0x20 != 0,
            transfer_id: TransferId::from_truncating(bits),
        }
    }
}

impl From<TailByte> for u8 {
    fn from(tail: TailByte) -> Self {
        ((tail.start as u8) << 7)
            | ((tail.end as u8) << 6)
            | ((tail.toggle as u8) << 5)
            | u8::from(tail.transfer_id)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn can_id_range() {
        assert!(CanId::try_from(0).is_ok());
        assert!(CanId::try_from(0x1fff_ffff).is_ok());
        assert!(CanId::try_from(0x2000_0000).is_err());
    }

    #[test]
    fn tail_byte_fields() {
        // Single-frame transfer with ID 7
        let tail = TailByte::parse(0xe7);
        assert!(tail.start && tail.end && tail.toggle);
        assert_eq!(u8::from(tail.transfer_id), 7);
        assert_eq!(u8::from(tail), 0xe7);

        // Middle frame with the toggle cleared
        let tail = TailByte::parse(0x07);
        assert!(!tail.start && !tail.end && !tail.toggle);
        assert_eq!(u8::from(tail.transfer_id), 7);
    }
}
