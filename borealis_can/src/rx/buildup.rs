//!
//! Reassembly of one transfer's payload from a sequence of frames
//!

use alloc::vec::Vec;
use core::mem;

use fallible_collections::{FallibleVec, TryReserveError};

use borealis_core::TransferId;

use crate::crc::TransferCrc;
use crate::data::TailByte;

/// Errors when adding a frame to a partially assembled transfer
///
/// Both of these indicate a duplicated, reordered, or lost frame. The session that reported
/// one keeps its state, so a later frame with the expected sequence can still continue the
/// transfer.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum BuildupError {
    /// The toggle bit did not match the expected alternating value
    InvalidToggle,
    /// A start bit appeared after the first frame, or was missing from the first frame
    InvalidStart,
}

/// Reassembles the payload of one transfer
#[derive(Debug)]
pub struct Buildup {
    /// The transfer ID that every frame of this transfer carries
    transfer_id: TransferId,
    /// The expected toggle bit of the next frame
    toggle: bool,
    /// The payload bytes collected so far
    ///
    /// Allocated once, when the buildup is created. Never grows beyond `max_length`.
    payload: Vec<u8>,
    /// The maximum number of payload bytes to store, transfer CRC included
    max_length: usize,
    /// The CRC of every payload byte seen, including bytes dropped because of `max_length`
    ///
    /// Keeping the CRC over the full wire payload lets a truncated transfer still validate.
    crc: TransferCrc,
    /// The number of frames processed
    frames: usize,
}

impl Buildup {
    /// Creates a buildup, allocating storage for `max_length` payload bytes
    pub fn new(transfer_id: TransferId, max_length: usize) -> Result<Self, TryReserveError> {
        let payload: Vec<u8> = FallibleVec::try_with_capacity(max_length)?;
        Ok(Buildup {
            transfer_id,
            toggle: true,
            payload,
            max_length,
            crc: TransferCrc::new(),
            frames: 0,
        })
    }

    /// Handles the data of one frame, tail byte included
    ///
    /// If this frame ends the transfer, the collected payload is returned. For a multi-frame
    /// transfer it still ends with the transfer CRC, unless the CRC bytes fell beyond
    /// `max_length`.
    pub fn add(&mut self, frame_data: &[u8]) -> Result<Option<Vec<u8>>, BuildupError> {
        let tail = TailByte::parse(*frame_data.last().expect("Bug: empty frame data"));
        if tail.start != (self.frames == 0) {
            return Err(BuildupError::InvalidStart);
        }
        if tail.toggle != self.toggle {
            return Err(BuildupError::InvalidToggle);
        }

        let payload = &frame_data[..frame_data.len() - 1];
        self.crc.add_bytes(payload);
        // Store what fits; the capacity was allocated up front, so this cannot allocate
        let room = self.max_length - self.payload.len();
        self.payload.extend_from_slice(&payload[..payload.len().min(room)]);

        self.toggle = !self.toggle;
        self.frames += 1;
        if tail.end {
            Ok(Some(mem::take(&mut self.payload)))
        } else {
            Ok(None)
        }
    }

    /// Returns the transfer ID that this transfer started with
    pub fn transfer_id(&self) -> TransferId {
        self.transfer_id
    }

    /// Returns the number of frames processed so far
    pub fn frames(&self) -> usize {
        self.frames
    }

    /// Returns the running CRC of all payload bytes seen
    ///
    /// After the last frame of a multi-frame transfer, this is zero if and only if the
    /// transfer CRC matched.
    pub fn crc(&self) -> u16 {
        self.crc.get()
    }
}
