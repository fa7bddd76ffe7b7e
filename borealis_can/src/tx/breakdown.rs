//!
//! Splitting a byte stream into tail-byte-terminated frames
//!

use core::mem;

use borealis_core::TransferId;

use crate::data::TailByte;
use crate::FRAME_CAPACITY;

/// The data bytes of one frame, tail byte included
pub type FrameData = heapless::Vec<u8, FRAME_CAPACITY>;

/// Accumulates a stream of payload bytes into frames
///
/// Every frame except the last is emitted from [`add`](Breakdown::add) as soon as the byte
/// after it arrives, so the caller never needs to know the stream length in advance. The last
/// frame, which may be shorter than the MTU, is emitted from [`finish`](Breakdown::finish).
pub struct Breakdown {
    /// Maximum bytes per frame, tail byte included
    mtu: usize,
    /// Transfer ID for every tail byte of this transfer
    transfer_id: TransferId,
    /// Toggle bit for the next frame
    toggle: bool,
    /// True if at least one frame has been emitted
    started: bool,
    /// Data of the frame under construction
    current: FrameData,
}

impl Breakdown {
    /// Creates a breakdown
    ///
    /// `mtu` is the maximum number of bytes per frame, including the tail byte.
    pub fn new(mtu: usize, transfer_id: TransferId) -> Self {
        debug_assert!(mtu > 1 && mtu <= FRAME_CAPACITY);
        Breakdown {
            mtu,
            transfer_id,
            toggle: true,
            started: false,
            current: FrameData::new(),
        }
    }

    /// Accepts one byte of the payload stream
    ///
    /// If the frame under construction was already full, it is completed with a tail byte and
    /// returned, and the provided byte starts the next frame.
    pub fn add(&mut self, byte: u8) -> Option<FrameData> {
        let completed = if self.current.len() == self.mtu - 1 {
            Some(self.take_frame(false))
        } else {
            None
        };
        self.current
            .push(byte)
            .expect("Bug: frame data exceeds capacity");
        completed
    }

    /// Ends the transfer, producing its last frame
    pub fn finish(mut self) -> FrameData {
        self.take_frame(true)
    }

    fn take_frame(&mut self, last: bool) -> FrameData {
        let tail = TailByte::new(!self.started, last, self.toggle, self.transfer_id);
        self.current
            .push(tail.into())
            .expect("Bug: frame data exceeds capacity");
        self.toggle = !self.toggle;
        self.started = true;
        mem::take(&mut self.current)
    }
}
