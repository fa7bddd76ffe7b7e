//!
//! UAVCAN transmission
//!

use core::convert::TryFrom;
use core::iter;

use borealis_core::transfer::{Header, ServiceHeader, Transfer};
use borealis_core::NodeId;

use crate::crc::TransferCrc;
use crate::data::{CanId, Frame};
use crate::error::{OutOfMemoryError, TransmitError};
use crate::queue::FrameSink;
use crate::tx::breakdown::Breakdown;
use crate::{calculate_frame_stats, Mtu};

mod breakdown;

/// Splits outgoing transfers into frames
pub struct Transmitter<Q> {
    /// Queue of frames waiting to be sent
    frame_queue: Q,
    /// Transport MTU
    mtu: usize,
    /// Number of transfers successfully broken into frames
    ///
    /// Success means that the frames were placed into the frame queue. CAN bus errors are
    /// invisible at this layer.
    transfer_count: u64,
    /// Number of transfers that could not be broken into frames
    error_count: u64,
}

impl<Q> Transmitter<Q> {
    /// Creates a transmitter
    ///
    /// mtu: The maximum number of bytes in a frame
    pub fn new(mtu: Mtu, frame_queue: Q) -> Self {
        Transmitter {
            frame_queue,
            mtu: mtu as usize,
            transfer_count: 0,
            error_count: 0,
        }
    }

    /// Sets the MTU
    ///
    /// This will take effect on the next call to push().
    pub fn set_mtu(&mut self, mtu: Mtu) {
        self.mtu = mtu as usize;
    }

    /// Breaks a transfer into frames and inserts them into the frame queue
    ///
    /// The frames can be retrieved and sent using the queue's peek and pop functions. All the
    /// frames of the transfer are inserted in one step, so frames of another transfer pushed
    /// earlier or later can never end up between them.
    ///
    /// On success, this function returns the number of frames enqueued (at least 1). If the
    /// queue cannot allocate space for all the frames, nothing is enqueued and the queue is
    /// left exactly as it was.
    pub fn push<P, I>(&mut self, transfer: Transfer<P, I>) -> Result<usize, TransmitError>
    where
        P: AsRef<[u8]>,
        Q: FrameSink<I>,
        I: Clone,
    {
        // Convert the transfer payload into borrowed form
        let Transfer { header, payload } = transfer;
        let transfer = Transfer {
            header,
            payload: payload.as_ref(),
        };

        match self.push_inner(transfer) {
            Ok(frames) => {
                self.transfer_count = self.transfer_count.wrapping_add(1);
                Ok(frames)
            }
            Err(e) => {
                self.error_count = self.error_count.wrapping_add(1);
                Err(e)
            }
        }
    }

    fn push_inner<I>(&mut self, transfer: Transfer<&[u8], I>) -> Result<usize, TransmitError>
    where
        Q: FrameSink<I>,
        I: Clone,
    {
        if transfer.header.source().is_none() && transfer.payload.len() > self.mtu - 1 {
            // An anonymous transfer must fit into one frame
            return Err(TransmitError::AnonymousNotSingleFrame);
        }
        let can_id = make_can_id(&transfer.header, transfer.payload);

        let frame_stats = calculate_frame_stats(transfer.payload.len(), self.mtu);
        // Reserve space for all the frames up front, so that a failed allocation leaves the
        // queue unchanged
        self.frame_queue.try_reserve(frame_stats.frames)?;

        // Iterate over the payload bytes and the padding of the last frame, running the CRC
        // over both
        let mut crc = TransferCrc::new();
        let payload_and_padding = transfer
            .payload
            .iter()
            .cloned()
            .chain(iter::repeat(0).take(frame_stats.last_frame_padding))
            .inspect(|byte| crc.add(*byte));

        let mut breakdown = Breakdown::new(self.mtu, transfer.header.transfer_id());
        let mut frames = 0;
        // Do the non-last frames
        for byte in payload_and_padding {
            if let Some(frame_data) = breakdown.add(byte) {
                // Filled up a frame
                self.push_frame(transfer.header.timestamp(), can_id, &frame_data)?;
                frames += 1;
            }
        }
        if frames != 0 {
            // The payload and padding were split across at least one full frame (handled
            // above) and the last frame (still in the Breakdown), so this is a multi-frame
            // transfer and the CRC goes before the last tail byte
            let crc_value = crc.get();
            // Most significant byte first
            let crc_bytes = [(crc_value >> 8) as u8, crc_value as u8];
            for &byte in crc_bytes.iter() {
                if let Some(frame_data) = breakdown.add(byte) {
                    // Filled up a frame
                    self.push_frame(transfer.header.timestamp(), can_id, &frame_data)?;
                    frames += 1;
                }
            }
        }
        let last_frame_data = breakdown.finish();
        self.push_frame(transfer.header.timestamp(), can_id, &last_frame_data)?;
        frames += 1;
        Ok(frames)
    }

    /// Creates a frame and adds it to the queue
    fn push_frame<I>(
        &mut self,
        timestamp: I,
        id: CanId,
        data: &[u8],
    ) -> Result<(), OutOfMemoryError>
    where
        Q: FrameSink<I>,
        I: Clone,
    {
        let frame = Frame::new(timestamp, id, data);
        self.frame_queue.push_frame(frame)
    }

    /// Returns a reference to the frame queue, where outgoing frames are stored
    pub fn frame_queue(&self) -> &Q {
        &self.frame_queue
    }

    /// Returns a mutable reference to the frame queue, where outgoing frames are stored
    pub fn frame_queue_mut(&mut self) -> &mut Q {
        &mut self.frame_queue
    }

    /// Returns the number of transfers successfully broken into frames
    #[inline]
    pub fn transfer_count(&self) -> u64 {
        self.transfer_count
    }

    /// Returns the number of transfers that could not be broken into frames
    #[inline]
    pub fn error_count(&self) -> u64 {
        self.error_count
    }
}

fn make_can_id<I>(header: &Header<I>, payload: &[u8]) -> CanId {
    let mut bits = 0u32;

    // Common fields for all transfer types
    bits |= (header.priority() as u32) << 26;
    let source_node = header.source().unwrap_or_else(|| make_pseudo_id(payload));
    bits |= u32::from(u8::from(source_node));

    match header {
        Header::Message(message_header) => {
            // Subject ID
            bits |= u32::from(u16::from(message_header.subject)) << 8;
            // Bits 21 and 22 are reserved, transmitted as 1 and ignored on reception
            bits |= (1 << 21) | (1 << 22);
            // Anonymous
            if message_header.source.is_none() {
                bits |= 1 << 24;
            }
        }
        Header::Request(service_header) => {
            bits |= encode_common_service_fields(service_header);
            // Set bit 24 to indicate a request
            bits |= 1 << 24;
        }
        Header::Response(service_header) => {
            bits |= encode_common_service_fields(service_header);
            // Leave bit 24 clear
        }
    }

    CanId::try_from(bits).expect("Bug: Generated CAN ID does not fit into 29 bits")
}

/// Encodes the service ID, destination node ID, and service flag of a 29-bit CAN ID
fn encode_common_service_fields<I>(header: &ServiceHeader<I>) -> u32 {
    // Service ID
    (u32::from(u16::from(header.service)) << 14)
        // Destination node ID
        | (u32::from(u8::from(header.destination)) << 7)
        // Set bit 25 to indicate a service
        | (1 << 25)
}

/// Generates a pseudo node ID for an anonymous transfer
///
/// The low 7 bits of the payload CRC make collisions between different anonymous senders
/// unlikely while keeping retransmissions of the same payload stable.
fn make_pseudo_id(payload: &[u8]) -> NodeId {
    let mut crc = TransferCrc::new();
    crc.add_bytes(payload);
    NodeId::from_truncating(crc.get() as u8)
}
