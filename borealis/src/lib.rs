#![no_std]

//!
//! A UAVCAN v1 transfer engine for CAN and CAN FD
//!
//! This crate re-exports the lower-level `borealis_core` and `borealis_can` crates, and adds
//! [`Node`], which bundles a transmitter and a receiver behind the handful of operations that
//! a typical application needs:
//!
//! * [`push`](Node::push) breaks an outgoing transfer into frames and enqueues them
//! * [`peek`](Node::peek) and [`pop`](Node::pop) hand the queued frames to the CAN driver in
//!   bus arbitration order
//! * [`accept`](Node::accept) reassembles incoming frames into transfers
//! * [`subscribe_message`](Node::subscribe_message) and friends manage subscriptions
//!
//! The node never reads a clock and never blocks. The application timestamps incoming frames,
//! picks transmission deadlines for outgoing transfers, and serializes calls on one node.
//!

extern crate alloc;

// Re-exports from the other borealis crates
pub use borealis_can::*;
pub use borealis_core::transfer;
pub use borealis_core::*;

use alloc::vec::Vec;

use borealis_can::queue::{FrameQueue, FrameQueueSource};
use borealis_core::time::Instant;
use borealis_core::transfer::Transfer;

/// A UAVCAN/CAN node: a transmitter and receiver pair with a shared node ID
///
/// Type parameter `I` is the timestamp type used for frames and transfers.
pub struct Node<I: Instant> {
    /// The ID of this node, or None if this node is anonymous
    node_id: Option<NodeId>,
    transmitter: Transmitter<FrameQueue<I>>,
    receiver: Receiver<I>,
}

impl<I: Instant> Node<I> {
    /// Creates a node
    ///
    /// * `node_id`: The ID of this node, or None to run anonymously. An anonymous node can
    ///   only send single-frame messages and cannot use services.
    /// * `mtu`: The size of the frames to produce. Incoming frames of any valid size are
    ///   accepted regardless of this setting.
    pub fn new(node_id: Option<NodeId>, mtu: Mtu) -> Self {
        Node {
            node_id,
            transmitter: Transmitter::new(mtu, FrameQueue::new()),
            receiver: Receiver::new(node_id),
        }
    }

    /// Returns the ID of this node, or None if this node is anonymous
    pub fn node_id(&self) -> Option<NodeId> {
        self.node_id
    }

    /// Changes the ID of this node
    ///
    /// This takes effect immediately, for transfers already in the transmit queue as well as
    /// for partially received transfers.
    pub fn set_node_id(&mut self, node_id: Option<NodeId>) {
        self.node_id = node_id;
        self.receiver.set_node_id(node_id);
    }

    /// Sets the MTU used for outgoing frames, effective on the next push
    pub fn set_mtu(&mut self, mtu: Mtu) {
        self.transmitter.set_mtu(mtu);
    }

    /// Breaks an outgoing transfer into frames and inserts them into the transmit queue
    ///
    /// Returns the number of frames enqueued. On error nothing is enqueued.
    pub fn push<P>(&mut self, transfer: Transfer<P, I>) -> Result<usize, TransmitError>
    where
        P: AsRef<[u8]>,
    {
        self.transmitter.push(transfer)
    }

    /// Returns the frame that should be transmitted next, or None if the queue is empty
    pub fn peek(&self) -> Option<&Frame<I>> {
        self.transmitter.frame_queue().peek_frame()
    }

    /// Removes and returns the frame that should be transmitted next
    pub fn pop(&mut self) -> Option<Frame<I>> {
        self.transmitter.frame_queue_mut().pop_frame()
    }

    /// Puts a frame back at the head of the transmit queue
    ///
    /// This is for drivers whose hardware turned out not to have room after all.
    pub fn return_frame(&mut self, frame: Frame<I>) -> Result<(), OutOfMemoryError> {
        self.transmitter.frame_queue_mut().return_frame(frame)
    }

    /// Handles an incoming frame, returning a completed transfer if this frame finished one
    ///
    /// `iface_index` identifies the redundant interface the frame arrived on.
    pub fn accept(
        &mut self,
        frame: Frame<I>,
        iface_index: u8,
    ) -> Result<Option<Transfer<Vec<u8>, I>>, OutOfMemoryError> {
        self.receiver.accept(frame, iface_index)
    }

    /// Subscribes to messages on a subject
    ///
    /// Returns true if an existing subscription on the same subject was replaced.
    pub fn subscribe_message(
        &mut self,
        subject: SubjectId,
        payload_size_max: usize,
        timeout: I::Duration,
    ) -> Result<bool, OutOfMemoryError> {
        self.receiver
            .subscribe_message(subject, payload_size_max, timeout)
    }

    /// Unsubscribes from messages on a subject, freeing all associated reassembly state
    pub fn unsubscribe_message(&mut self, subject: SubjectId) -> bool {
        self.receiver.unsubscribe_message(subject)
    }

    /// Subscribes to requests for a service
    pub fn subscribe_request(
        &mut self,
        service: ServiceId,
        payload_size_max: usize,
        timeout: I::Duration,
    ) -> Result<bool, OutOfMemoryError> {
        self.receiver
            .subscribe_request(service, payload_size_max, timeout)
    }

    /// Unsubscribes from requests for a service
    pub fn unsubscribe_request(&mut self, service: ServiceId) -> bool {
        self.receiver.unsubscribe_request(service)
    }

    /// Subscribes to responses for a service
    pub fn subscribe_response(
        &mut self,
        service: ServiceId,
        payload_size_max: usize,
        timeout: I::Duration,
    ) -> Result<bool, OutOfMemoryError> {
        self.receiver
            .subscribe_response(service, payload_size_max, timeout)
    }

    /// Unsubscribes from responses for a service
    pub fn unsubscribe_response(&mut self, service: ServiceId) -> bool {
        self.receiver.unsubscribe_response(service)
    }

    /// Returns a reference to the transmitter
    pub fn transmitter(&self) -> &Transmitter<FrameQueue<I>> {
        &self.transmitter
    }

    /// Returns a mutable reference to the transmitter
    pub fn transmitter_mut(&mut self) -> &mut Transmitter<FrameQueue<I>> {
        &mut self.transmitter
    }

    /// Returns a reference to the receiver
    pub fn receiver(&self) -> &Receiver<I> {
        &self.receiver
    }

    /// Returns a mutable reference to the receiver
    pub fn receiver_mut(&mut self) -> &mut Receiver<I> {
        &mut self.receiver
    }
}

impl<I: Instant> Default for Node<I> {
    /// Returns an anonymous node with the largest supported MTU
    fn default() -> Self {
        Node::new(None, Mtu::default())
    }
}
