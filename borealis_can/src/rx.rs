//!
//! UAVCAN reception
//!

mod buildup;

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::convert::TryFrom;
use core::fmt;

use fallible_collections::{FallibleBox, FallibleVec, TryReserveError};

use borealis_core::time::Instant;
use borealis_core::transfer::{Header, MessageHeader, ServiceHeader, Transfer, TransferKind};
use borealis_core::{NodeId, PortId, Priority, ServiceId, SubjectId, TransferId};

use crate::crc::CRC_SIZE;
use crate::data::{CanId, Frame, TailByte};
use crate::error::OutOfMemoryError;
use crate::rx::buildup::{Buildup, BuildupError};

/// One session per source node ID
const RX_SESSIONS_PER_SUBSCRIPTION: usize = NodeId::MAX.to_u8() as usize + 1;

/// Transfer subscription state. The application registers its interest in a particular kind of
/// data exchanged over the bus by subscribing. Frames that carry data for which there is no
/// active subscription are silently dropped.
struct Subscription<I: Instant> {
    /// A session for each source node ID
    sessions: [Option<Box<Session<I>>>; RX_SESSIONS_PER_SUBSCRIPTION],
    /// Maximum time difference between the first and last frames in a transfer
    timeout: I::Duration,
    /// Maximum number of payload bytes to deliver; the rest of a longer transfer is truncated
    payload_size_max: usize,
    /// Subject or service ID that this subscription is about
    port_id: PortId,
}

impl<I: Instant> fmt::Debug for Subscription<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("sessions", &DebugSessions(&self.sessions))
            .field("timeout", &self.timeout)
            .field("payload_size_max", &self.payload_size_max)
            .field("port_id", &self.port_id)
            .finish()
    }
}

/// A debug adapter for the session list
struct DebugSessions<'s, I>(&'s [Option<Box<Session<I>>>; RX_SESSIONS_PER_SUBSCRIPTION]);

impl<I: fmt::Debug> fmt::Debug for DebugSessions<'_, I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Display as a set, showing only the non-empty entries
        f.debug_set()
            .entries(self.0.iter().flat_map(Option::as_deref))
            .finish()
    }
}

impl<I: Instant> Subscription<I> {
    /// Creates a subscription with no active sessions
    pub fn new(timeout: I::Duration, payload_size_max: usize, port_id: PortId) -> Self {
        Subscription {
            sessions: [(); RX_SESSIONS_PER_SUBSCRIPTION].map(|()| None),
            timeout,
            payload_size_max,
            port_id,
        }
    }

    /// Returns a reference to the active session for the provided node ID
    pub fn session_mut(&mut self, node: NodeId) -> Option<&mut Session<I>> {
        self.sessions[usize::from(u8::from(node))].as_deref_mut()
    }

    /// Creates a session and returns a reference to it
    ///
    /// Returns an error if memory allocation fails.
    pub fn create_session(
        &mut self,
        node: NodeId,
        transfer_timestamp: I,
        iface_index: u8,
        transfer_id: TransferId,
    ) -> Result<&mut Session<I>, TryReserveError> {
        let session = Session::new(
            transfer_timestamp,
            iface_index,
            transfer_id,
            self.payload_size_max + CRC_SIZE,
        )?;
        let slot = &mut self.sessions[usize::from(u8::from(node))];
        *slot = Some(FallibleBox::try_new(session)?);
        Ok(slot.as_deref_mut().unwrap())
    }

    /// Destroys the session for the provided node, freeing its payload storage
    pub fn destroy_session(&mut self, node: NodeId) {
        self.sessions[usize::from(u8::from(node))] = None;
    }
}

/// A receive session, associated with a particular subscription and source node
struct Session<I> {
    /// Timestamp of the first frame received in this transfer
    transfer_timestamp: I,
    /// Index of the redundant interface that started this transfer
    ///
    /// Stored for diagnostics only; sources are tracked independently of the interface.
    iface_index: u8,
    /// Transfer reassembly
    buildup: Buildup,
}

impl<I: fmt::Debug> fmt::Debug for Session<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("transfer_timestamp", &self.transfer_timestamp)
            .field("iface_index", &self.iface_index)
            .field("buildup", &self.buildup)
            .finish()
    }
}

impl<I> Session<I> {
    pub fn new(
        transfer_timestamp: I,
        iface_index: u8,
        transfer_id: TransferId,
        max_length: usize,
    ) -> Result<Self, TryReserveError> {
        Ok(Session {
            transfer_timestamp,
            iface_index,
            buildup: Buildup::new(transfer_id, max_length)?,
        })
    }
}

/// Handles subscriptions and assembles incoming frames into transfers
#[derive(Debug)]
pub struct Receiver<I: Instant> {
    /// Subscriptions for messages
    subscriptions_message: Vec<Subscription<I>>,
    /// Subscriptions for service responses
    subscriptions_response: Vec<Subscription<I>>,
    /// Subscriptions for service requests
    subscriptions_request: Vec<Subscription<I>>,
    /// The ID of this node, or None if this node is anonymous
    ///
    /// Incoming service transfers are accepted only when this is set and matches the frame
    /// destination.
    id: Option<NodeId>,
    /// Number of transfers successfully received
    transfer_count: u64,
    /// Number of transfers that could not be received
    ///
    /// Errors include failure to allocate memory (when handling incoming frames only), missing
    /// frames, and malformed frames.
    error_count: u64,
}

impl<I: Instant> Receiver<I> {
    /// Creates a receiver
    ///
    /// id: The ID of this node, used to filter incoming service requests and responses. A
    /// receiver without an ID only accepts messages.
    pub fn new(id: Option<NodeId>) -> Self {
        Receiver {
            subscriptions_message: Vec::new(),
            subscriptions_response: Vec::new(),
            subscriptions_request: Vec::new(),
            id,
            transfer_count: 0,
            error_count: 0,
        }
    }

    /// Returns the ID of this node, or None if this node is anonymous
    pub fn node_id(&self) -> Option<NodeId> {
        self.id
    }

    /// Changes the ID of this node
    pub fn set_node_id(&mut self, id: Option<NodeId>) {
        self.id = id;
    }

    /// Handles an incoming CAN or CAN FD frame
    ///
    /// If this frame is the last frame in a transfer, this function returns the completed
    /// transfer. The transfer payload is owned by the caller; it does not include any tail
    /// bytes or transfer CRC.
    ///
    /// `iface_index` identifies the redundant interface the frame arrived on. It is recorded
    /// in the reassembly session but each source node is tracked independently of it.
    ///
    /// This function returns an error only if memory allocation fails. Unusable frames, such
    /// as duplicates, malformed frames, or frames on ports with no subscription, are silently
    /// dropped and increment the error counter at most.
    pub fn accept(
        &mut self,
        frame: Frame<I>,
        iface_index: u8,
    ) -> Result<Option<Transfer<Vec<u8>, I>>, OutOfMemoryError> {
        // The current time is equal to or greater than the frame timestamp. Use that timestamp
        // to clean up expired sessions.
        self.clean_expired_sessions(frame.timestamp());

        // Part 1: basic frame checks
        let (fields, tail) = match Self::frame_sanity_check(self.id, &frame) {
            Some(data) => data,
            None => {
                // Can't use this frame
                #[cfg(feature = "log")]
                log::debug!("Frame {:08x} failed sanity checks, ignoring", u32::from(frame.id()));
                self.increment_error_count();
                return Ok(None);
            }
        };

        // Part 2: check for a subscription on this port
        let subscriptions = self.subscriptions_for_kind(fields.kind.kind());
        let subscription = match subscriptions
            .iter_mut()
            .find(|sub| sub.port_id == fields.kind.port_id())
        {
            Some(subscription) => subscription,
            None => {
                // No matching subscription, ignore
                return Ok(None);
            }
        };

        // Part 3: anonymous transfers have no session; the frame is the whole transfer
        if fields.is_anonymous() {
            let length = (frame.data().len() - 1).min(subscription.payload_size_max);
            let payload = match try_copy_payload(&frame.data()[..length]) {
                Ok(payload) => payload,
                Err(_) => {
                    self.increment_error_count();
                    return Err(OutOfMemoryError);
                }
            };
            let transfer = Transfer {
                header: make_header(frame.timestamp(), fields, tail.transfer_id),
                payload,
            };
            self.increment_transfer_count();
            return Ok(Some(transfer));
        }

        // Part 4: find or create the session for this source node
        let max_payload_length = subscription.payload_size_max;
        let source = fields.source;
        let session = if let Some(session) = subscription.session_mut(source) {
            if session.buildup.transfer_id() != tail.transfer_id {
                // A frame from some other transfer; drop it and keep the session
                #[cfg(feature = "log")]
                log::debug!("Frame associated with a different transfer, ignoring");
                return Ok(None);
            }
            session
        } else {
            if !tail.start {
                // No session, and this is not the start of a transfer. Ignore frame.
                return Ok(None);
            }
            // This is the start, create a new session
            let new_session = subscription.create_session(
                source,
                frame.timestamp(),
                iface_index,
                tail.transfer_id,
            );
            match new_session {
                Ok(session) => session,
                Err(_) => {
                    self.increment_error_count();
                    // Don't need to do any cleanup.
                    return Err(OutOfMemoryError);
                }
            }
        };

        // Part 5: reassembly
        match session.buildup.add(frame.data()) {
            Ok(Some(mut transfer_data)) => {
                // Got a transfer
                let transfer_timestamp = session.transfer_timestamp.clone();
                let multi_frame = session.buildup.frames() > 1;
                let crc = session.buildup.crc();
                if multi_frame {
                    // The last two bytes of a multi-frame transfer are its CRC. Running the
                    // CRC over the payload, the padding, and the CRC itself leaves zero.
                    if crc != 0 {
                        #[cfg(feature = "log")]
                        log::debug!("Invalid transfer CRC, discarding transfer");
                        subscription.destroy_session(source);
                        self.increment_error_count();
                        return Ok(None);
                    }
                    transfer_data.truncate(transfer_data.len() - CRC_SIZE);
                } else {
                    transfer_data.truncate(max_payload_length);
                }

                let transfer = Transfer {
                    header: make_header(transfer_timestamp, fields, tail.transfer_id),
                    payload: transfer_data,
                };
                subscription.destroy_session(source);
                self.increment_transfer_count();
                Ok(Some(transfer))
            }
            Ok(None) => {
                // Processed, transfer not yet done. Keep session around.
                Ok(None)
            }
            Err(BuildupError::InvalidToggle) | Err(BuildupError::InvalidStart) => {
                // A duplicated or reordered frame; drop it and keep the session, so frames
                // with the expected sequence can still finish the transfer
                #[cfg(feature = "log")]
                log::debug!("Frame out of sequence, ignoring");
                self.increment_error_count();
                Ok(None)
            }
        }
    }

    /// Runs basic sanity checks on an incoming frame. Returns the decoded CAN ID fields and
    /// tail byte if the frame is usable.
    fn frame_sanity_check(
        local_id: Option<NodeId>,
        frame: &Frame<I>,
    ) -> Option<(IdFields, TailByte)> {
        // Frame must have a tail byte to be valid
        let tail = TailByte::parse(*frame.data().last()?);

        // A set start bit with a cleared toggle marks the incompatible version 0 protocol
        if tail.start && !tail.toggle {
            return None;
        }

        let fields = parse_can_id(frame.id()).ok()?;

        match &fields.kind {
            KindFields::Message { anonymous, .. } => {
                // Anonymous message transfers must always fit into one frame
                if *anonymous && !(tail.start && tail.end) {
                    return None;
                }
            }
            KindFields::Request { destination, .. } | KindFields::Response { destination, .. } => {
                // This frame is a service request or response going to some other node
                if local_id != Some(*destination) {
                    return None;
                }
            }
        }

        Some((fields, tail))
    }

    /// Subscribes to messages on a subject
    ///
    /// This will enable incoming transfers from all nodes on the specified subject ID.
    ///
    /// subject: The subject ID to subscribe to
    ///
    /// payload_size_max: The maximum number of payload bytes expected on this subject. Longer
    /// transfers are truncated to this size, in a way that still validates their CRC.
    ///
    /// timeout: The maximum time between the first and last frames in a transfer. Transfers
    /// that do not finish within this time are dropped. If all transfers fit into one frame,
    /// the timeout has no meaning and may be zero.
    ///
    /// Returns true if an existing subscription on the same subject was replaced.
    pub fn subscribe_message(
        &mut self,
        subject: SubjectId,
        payload_size_max: usize,
        timeout: I::Duration,
    ) -> Result<bool, OutOfMemoryError> {
        self.subscribe(
            TransferKind::Message,
            PortId::from(subject),
            payload_size_max,
            timeout,
        )
    }

    /// Unsubscribes from messages on a subject
    ///
    /// Returns true if a subscription was removed. All reassembly sessions of the subscription
    /// and their payload storage are freed.
    pub fn unsubscribe_message(&mut self, subject: SubjectId) -> bool {
        self.unsubscribe(TransferKind::Message, PortId::from(subject))
    }

    /// Subscribes to requests for a service
    ///
    /// This is otherwise like [`subscribe_message`](Receiver::subscribe_message), but accepts
    /// service request transfers addressed to this node.
    pub fn subscribe_request(
        &mut self,
        service: ServiceId,
        payload_size_max: usize,
        timeout: I::Duration,
    ) -> Result<bool, OutOfMemoryError> {
        self.subscribe(
            TransferKind::Request,
            PortId::from(service),
            payload_size_max,
            timeout,
        )
    }

    /// Unsubscribes from requests for a service
    pub fn unsubscribe_request(&mut self, service: ServiceId) -> bool {
        self.unsubscribe(TransferKind::Request, PortId::from(service))
    }

    /// Subscribes to responses for a service
    ///
    /// This is otherwise like [`subscribe_message`](Receiver::subscribe_message), but accepts
    /// service response transfers addressed to this node.
    pub fn subscribe_response(
        &mut self,
        service: ServiceId,
        payload_size_max: usize,
        timeout: I::Duration,
    ) -> Result<bool, OutOfMemoryError> {
        self.subscribe(
            TransferKind::Response,
            PortId::from(service),
            payload_size_max,
            timeout,
        )
    }

    /// Unsubscribes from responses for a service
    pub fn unsubscribe_response(&mut self, service: ServiceId) -> bool {
        self.unsubscribe(TransferKind::Response, PortId::from(service))
    }

    fn subscribe(
        &mut self,
        kind: TransferKind,
        port_id: PortId,
        payload_size_max: usize,
        timeout: I::Duration,
    ) -> Result<bool, OutOfMemoryError> {
        // Remove any existing subscription first. Keeping it around would let sessions sized
        // for a different payload limit survive into the new subscription.
        let displaced = self.unsubscribe(kind, port_id);

        let new_subscription = Subscription::new(timeout, payload_size_max, port_id);

        let subscriptions = self.subscriptions_for_kind(kind);
        // Logical safety: If a subscription previously existed and was removed, this Vec must
        // have space for it. Therefore, this function cannot remove a subscription and fail to
        // add its replacement.
        FallibleVec::try_push(subscriptions, new_subscription)?;
        Ok(displaced)
    }

    fn unsubscribe(&mut self, kind: TransferKind, port_id: PortId) -> bool {
        let subscriptions = self.subscriptions_for_kind(kind);
        match subscriptions.iter().position(|sub| sub.port_id == port_id) {
            Some(index) => {
                // Dropping the subscription frees its sessions and their payload storage
                subscriptions.remove(index);
                true
            }
            None => false,
        }
    }

    fn subscriptions_for_kind(&mut self, kind: TransferKind) -> &mut Vec<Subscription<I>> {
        match kind {
            TransferKind::Message => &mut self.subscriptions_message,
            TransferKind::Response => &mut self.subscriptions_response,
            TransferKind::Request => &mut self.subscriptions_request,
        }
    }

    /// Returns the number of transfers successfully received
    pub fn transfer_count(&self) -> u64 {
        self.transfer_count
    }

    /// Returns the number of transfers that could not be received correctly
    ///
    /// Errors include failure to allocate memory (when handling incoming frames only), missing
    /// frames, and malformed frames.
    pub fn error_count(&self) -> u64 {
        self.error_count
    }

    fn increment_transfer_count(&mut self) {
        self.transfer_count = self.transfer_count.wrapping_add(1)
    }
    fn increment_error_count(&mut self) {
        self.error_count = self.error_count.wrapping_add(1)
    }

    fn clean_expired_sessions(&mut self, now: I) {
        clean_sessions_from_subscriptions(&mut self.subscriptions_message, &now);
        clean_sessions_from_subscriptions(&mut self.subscriptions_request, &now);
        clean_sessions_from_subscriptions(&mut self.subscriptions_response, &now);
    }
}

fn clean_sessions_from_subscriptions<I: Instant>(
    subscriptions: &mut Vec<Subscription<I>>,
    now: &I,
) {
    for subscription in subscriptions {
        for slot in subscription.sessions.iter_mut() {
            if let Some(session) = slot.as_deref_mut() {
                let time_since_first_frame = now.duration_since(&session.transfer_timestamp);
                if time_since_first_frame > subscription.timeout {
                    // This session has timed out, delete it. A new transfer from the same
                    // source can then start with its next start-of-transfer frame.
                    *slot = None;
                }
            }
        }
    }
}

/// Copies a payload into an owned buffer, failing cleanly if memory cannot be allocated
fn try_copy_payload(payload: &[u8]) -> Result<Vec<u8>, TryReserveError> {
    let mut buffer: Vec<u8> = FallibleVec::try_with_capacity(payload.len())?;
    buffer.extend_from_slice(payload);
    Ok(buffer)
}

/// Builds a transfer header from decoded CAN ID fields
fn make_header<I>(timestamp: I, fields: IdFields, transfer_id: TransferId) -> Header<I> {
    match fields.kind {
        KindFields::Message { anonymous, subject } => Header::Message(MessageHeader {
            timestamp,
            transfer_id,
            priority: fields.priority,
            subject,
            source: if anonymous { None } else { Some(fields.source) },
        }),
        KindFields::Request {
            service,
            destination,
        } => Header::Request(ServiceHeader {
            timestamp,
            transfer_id,
            priority: fields.priority,
            service,
            source: fields.source,
            destination,
        }),
        KindFields::Response {
            service,
            destination,
        } => Header::Response(ServiceHeader {
            timestamp,
            transfer_id,
            priority: fields.priority,
            service,
            source: fields.source,
            destination,
        }),
    }
}

#[derive(Debug)]
pub enum CanIdParseError {
    /// Reserved bit 23 was set
    Bit23Set,
    /// On a message frame, reserved bit 7 was set
    Bit7Set,
}

/// Transfer properties decoded from a 29-bit CAN ID
#[derive(Debug, Clone, Eq, PartialEq)]
struct IdFields {
    priority: Priority,
    /// The source node; a pseudo-ID if the transfer is anonymous
    source: NodeId,
    kind: KindFields,
}

impl IdFields {
    fn is_anonymous(&self) -> bool {
        matches!(
            self.kind,
            KindFields::Message {
                anonymous: true,
                ..
            }
        )
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
enum KindFields {
    Message {
        anonymous: bool,
        subject: SubjectId,
    },
    Request {
        service: ServiceId,
        destination: NodeId,
    },
    Response {
        service: ServiceId,
        destination: NodeId,
    },
}

impl KindFields {
    fn kind(&self) -> TransferKind {
        match self {
            KindFields::Message { .. } => TransferKind::Message,
            KindFields::Request { .. } => TransferKind::Request,
            KindFields::Response { .. } => TransferKind::Response,
        }
    }

    fn port_id(&self) -> PortId {
        match self {
            KindFields::Message { subject, .. } => PortId::from(*subject),
            KindFields::Request { service, .. } | KindFields::Response { service, .. } => {
                PortId::from(*service)
            }
        }
    }
}

fn parse_can_id(id: CanId) -> Result<IdFields, CanIdParseError> {
    let bits = u32::from(id);

    if bits.bit_set(23) {
        return Err(CanIdParseError::Bit23Set);
    }
    // Ignore bits 22 and 21

    let priority = Priority::try_from(bits.get_u8(26)).expect("Bug: Invalid priority");
    let source = NodeId::from_truncating(bits.get_u8(0));

    let kind = if bits.bit_set(25) {
        // Service
        let service =
            ServiceId::try_from(bits.get_u16(14) & 0x1ff).expect("Bug: Invalid service ID");
        let destination = NodeId::from_truncating(bits.get_u8(7));
        if bits.bit_set(24) {
            KindFields::Request {
                service,
                destination,
            }
        } else {
            KindFields::Response {
                service,
                destination,
            }
        }
    } else {
        // Message
        if bits.bit_set(7) {
            return Err(CanIdParseError::Bit7Set);
        }
        KindFields::Message {
            anonymous: bits.bit_set(24),
            // Subject ID is 13 bits, 0..=8191
            subject: SubjectId::try_from(bits.get_u16(8) & 0x1fff)
                .expect("Bug: Invalid subject ID"),
        }
    };

    Ok(IdFields {
        priority,
        source,
        kind,
    })
}

/// Basic extension trait for extracting bits from a CAN ID
trait GetBits {
    fn bit_set(self, offset: u32) -> bool;
    fn get_u8(self, offset: u32) -> u8;
    fn get_u16(self, offset: u32) -> u16;
}

impl GetBits for u32 {
    fn bit_set(self, offset: u32) -> bool {
        ((self >> offset) & 1) == 1
    }
    fn get_u8(self, offset: u32) -> u8 {
        (self >> offset) as u8
    }
    fn get_u16(self, offset: u32) -> u16 {
        (self >> offset) as u16
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::crc::TransferCrc;
    use borealis_core::time::Microseconds64;

    type TestDuration = <Microseconds64 as Instant>::Duration;

    fn node(id: u8) -> NodeId {
        NodeId::try_from(id).unwrap()
    }

    fn frame(id: u32, data: &[u8], ticks: u64) -> Frame<Microseconds64> {
        Frame::new(
            Microseconds64::from_ticks(ticks),
            CanId::try_from(id).unwrap(),
            data,
        )
    }

    #[test]
    fn test_parse_can_id() {
        // Examples from section 4.2.3 of the specification
        // Heartbeat
        check_can_id(
            IdFields {
                source: node(42),
                priority: Priority::Nominal,
                kind: KindFields::Message {
                    anonymous: false,
                    subject: SubjectId::try_from(7509).unwrap(),
                },
            },
            0x107d552a,
        );
        // String primitive
        check_can_id(
            IdFields {
                // Anonymous pseudo-ID
                source: node(0x75),
                priority: Priority::Nominal,
                kind: KindFields::Message {
                    anonymous: true,
                    subject: SubjectId::try_from(4919).unwrap(),
                },
            },
            0x11733775,
        );
        // Node info request
        check_can_id(
            IdFields {
                source: node(123),
                priority: Priority::Nominal,
                kind: KindFields::Request {
                    service: ServiceId::try_from(430).unwrap(),
                    destination: node(42),
                },
            },
            0x136b957b,
        );
        // Node info response
        check_can_id(
            IdFields {
                source: node(42),
                priority: Priority::Nominal,
                kind: KindFields::Response {
                    service: ServiceId::try_from(430).unwrap(),
                    destination: node(123),
                },
            },
            0x126bbdaa,
        );
        // Array message
        check_can_id(
            IdFields {
                source: node(59),
                priority: Priority::Nominal,
                kind: KindFields::Message {
                    anonymous: false,
                    subject: SubjectId::try_from(4919).unwrap(),
                },
            },
            0x1073373b,
        );
    }

    fn check_can_id(expected_fields: IdFields, bits: u32) {
        let id = CanId::try_from(bits).unwrap();
        let actual_fields = parse_can_id(id).unwrap();
        assert_eq!(actual_fields, expected_fields);
    }

    #[test]
    fn reserved_bits_rejected() {
        // Bit 23 set
        assert!(parse_can_id(CanId::try_from(0x1080_0000).unwrap()).is_err());
        // Bit 7 set on a message frame
        assert!(parse_can_id(CanId::try_from(0x1060_0080).unwrap()).is_err());
    }

    /// A receiver with node ID 42, subscribed to messages on subject 7509
    fn heartbeat_receiver() -> Receiver<Microseconds64> {
        let mut receiver = Receiver::new(Some(node(42)));
        receiver
            .subscribe_message(
                SubjectId::try_from(7509).unwrap(),
                16,
                TestDuration::from_ticks(1_000_000),
            )
            .unwrap();
        receiver
    }

    /// Builds the three frames of a 13-byte message transfer on subject 7509 from node 59
    /// with transfer ID 7
    fn multi_frame_transfer() -> ([u8; 13], [Frame<Microseconds64>; 3]) {
        let payload: [u8; 13] = [1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13];
        let mut crc = TransferCrc::new();
        crc.add_bytes(&payload);
        let crc_value = crc.get();

        let id = 0x107d553b;
        let frames = [
            frame(id, &[1, 2, 3, 4, 5, 6, 7, 0xa7], 0),
            frame(id, &[8, 9, 10, 11, 12, 13, (crc_value >> 8) as u8, 0x07], 10),
            frame(id, &[crc_value as u8, 0x67], 20),
        ];
        (payload, frames)
    }

    #[test]
    fn accept_single_frame_message() {
        let mut receiver = heartbeat_receiver();
        // Heartbeat from node 42 with transfer ID 2
        let transfer = receiver
            .accept(frame(0x107d552a, &[0x05, 0x00, 0x00, 0x00, 0x9d, 0x05, 0x00, 0xe2], 100), 0)
            .unwrap()
            .expect("Expected a completed transfer");

        assert_eq!(
            transfer.header,
            Header::Message(MessageHeader {
                timestamp: Microseconds64::from_ticks(100),
                transfer_id: TransferId::try_from(2).unwrap(),
                priority: Priority::Nominal,
                subject: SubjectId::try_from(7509).unwrap(),
                source: Some(node(42)),
            })
        );
        assert_eq!(transfer.payload, [0x05, 0x00, 0x00, 0x00, 0x9d, 0x05, 0x00]);
        assert_eq!(receiver.transfer_count(), 1);
        assert_eq!(receiver.error_count(), 0);
    }

    #[test]
    fn accept_multi_frame_message() {
        let mut receiver = heartbeat_receiver();
        let (payload, frames) = multi_frame_transfer();
        let [first, second, third] = frames;

        assert!(receiver.accept(first, 0).unwrap().is_none());
        assert!(receiver.accept(second, 0).unwrap().is_none());
        let transfer = receiver
            .accept(third, 0)
            .unwrap()
            .expect("Expected a completed transfer");

        // The timestamp is the time of the first frame, and the CRC is stripped
        assert_eq!(transfer.header.timestamp(), Microseconds64::from_ticks(0));
        assert_eq!(transfer.header.source(), Some(node(59)));
        assert_eq!(transfer.payload, payload);
    }

    #[test]
    fn toggle_violation_ignored() {
        let mut receiver = heartbeat_receiver();
        let (_, frames) = multi_frame_transfer();
        let [first, second, third] = frames;

        assert!(receiver.accept(first, 0).unwrap().is_none());
        // Corrupt the toggle bit of the second frame
        let mut corrupted = second.data().to_vec();
        *corrupted.last_mut().unwrap() ^= 0x20;
        let second = frame(0x107d553b, &corrupted, 10);
        assert!(receiver.accept(second, 0).unwrap().is_none());
        // The third frame no longer matches the expected toggle either
        assert!(receiver.accept(third, 0).unwrap().is_none());
        assert_eq!(receiver.transfer_count(), 0);
        assert_eq!(receiver.error_count(), 2);
    }

    #[test]
    fn corrupted_payload_fails_crc() {
        let mut receiver = heartbeat_receiver();
        let (_, frames) = multi_frame_transfer();
        let [first, second, third] = frames;

        assert!(receiver.accept(first, 0).unwrap().is_none());
        // Flip a payload bit in the second frame
        let mut corrupted = second.data().to_vec();
        corrupted[0] ^= 0x01;
        let second = frame(0x107d553b, &corrupted, 10);
        assert!(receiver.accept(second, 0).unwrap().is_none());
        assert!(receiver.accept(third, 0).unwrap().is_none());
        assert_eq!(receiver.transfer_count(), 0);
    }

    #[test]
    fn session_restarts_after_timeout() {
        let mut receiver = Receiver::new(Some(node(42)));
        receiver
            .subscribe_message(
                SubjectId::try_from(7509).unwrap(),
                16,
                TestDuration::from_ticks(1000),
            )
            .unwrap();

        // Start a multi-frame transfer that never finishes
        let (_, frames) = multi_frame_transfer();
        let [first, _, _] = frames;
        assert!(receiver.accept(first, 0).unwrap().is_none());

        // Long after the timeout, the same source starts over with a new transfer ID
        let transfer = receiver
            .accept(frame(0x107d553b, &[0xaa, 0xe8], 5000), 0)
            .unwrap()
            .expect("Expected the new transfer to complete");
        assert_eq!(transfer.header.transfer_id(), TransferId::try_from(8).unwrap());
        assert_eq!(transfer.payload, [0xaa]);
    }

    #[test]
    fn stale_transfer_id_ignored() {
        let mut receiver = heartbeat_receiver();
        let (payload, frames) = multi_frame_transfer();
        let [first, second, third] = frames;

        assert!(receiver.accept(first, 0).unwrap().is_none());
        // A single-frame transfer with a different transfer ID does not disturb the session
        assert!(receiver
            .accept(frame(0x107d553b, &[0xbb, 0xe9], 11), 0)
            .unwrap()
            .is_none());
        assert!(receiver.accept(second, 0).unwrap().is_none());
        let transfer = receiver.accept(third, 0).unwrap().unwrap();
        assert_eq!(transfer.payload, payload);
    }

    #[test]
    fn long_transfer_truncated() {
        let mut receiver = Receiver::new(Some(node(42)));
        receiver
            .subscribe_message(
                SubjectId::try_from(7509).unwrap(),
                4,
                TestDuration::from_ticks(1_000_000),
            )
            .unwrap();

        let (_, frames) = multi_frame_transfer();
        let [first, second, third] = frames;
        assert!(receiver.accept(first, 0).unwrap().is_none());
        assert!(receiver.accept(second, 0).unwrap().is_none());
        let transfer = receiver
            .accept(third, 0)
            .unwrap()
            .expect("Truncated transfer must still validate");
        assert_eq!(transfer.payload, [1, 2, 3, 4]);
    }

    #[test]
    fn anonymous_message() {
        let mut receiver = Receiver::new(Some(node(42)));
        receiver
            .subscribe_message(
                SubjectId::try_from(4919).unwrap(),
                16,
                TestDuration::from_ticks(1000),
            )
            .unwrap();

        let transfer = receiver
            .accept(frame(0x11733775, &[0x68, 0x69, 0xe0], 0), 0)
            .unwrap()
            .expect("Expected an anonymous transfer");
        assert_eq!(transfer.header.source(), None);
        assert_eq!(transfer.payload, [0x68, 0x69]);

        // An anonymous frame that does not complete a transfer by itself is dropped
        assert!(receiver
            .accept(frame(0x11733775, &[0x68, 0xa0], 1), 0)
            .unwrap()
            .is_none());
    }

    #[test]
    fn services_filtered_by_destination() {
        let mut receiver = Receiver::new(Some(node(42)));
        receiver
            .subscribe_request(
                ServiceId::try_from(430).unwrap(),
                16,
                TestDuration::from_ticks(1000),
            )
            .unwrap();

        // Request from node 123 to node 42
        let transfer = receiver
            .accept(frame(0x136b957b, &[0xe0], 0), 0)
            .unwrap()
            .expect("Expected a request transfer");
        match transfer.header {
            Header::Request(header) => {
                assert_eq!(header.source, node(123));
                assert_eq!(header.destination, node(42));
                assert_eq!(header.service, ServiceId::try_from(430).unwrap());
            }
            _ => panic!("Wrong transfer kind"),
        }

        // The same request addressed to node 43 is not ours
        assert!(receiver
            .accept(frame(0x136b95fb, &[0xe0], 1), 0)
            .unwrap()
            .is_none());

        // An anonymous receiver accepts no service transfers at all
        receiver.set_node_id(None);
        assert!(receiver
            .accept(frame(0x136b957b, &[0xe0], 2), 0)
            .unwrap()
            .is_none());
    }

    #[test]
    fn no_subscription_no_transfer() {
        let mut receiver: Receiver<Microseconds64> = Receiver::new(Some(node(42)));
        assert!(receiver
            .accept(frame(0x107d552a, &[0xe0], 0), 0)
            .unwrap()
            .is_none());
        // Not an error, just not interesting
        assert_eq!(receiver.error_count(), 0);
    }

    #[test]
    fn subscription_displacement() {
        let mut receiver: Receiver<Microseconds64> = Receiver::new(Some(node(42)));
        let subject = SubjectId::try_from(7509).unwrap();
        assert_eq!(
            receiver
                .subscribe_message(subject, 16, TestDuration::from_ticks(1000))
                .unwrap(),
            false
        );
        assert_eq!(
            receiver
                .subscribe_message(subject, 32, TestDuration::from_ticks(1000))
                .unwrap(),
            true
        );
        assert_eq!(receiver.unsubscribe_message(subject), true);
        assert_eq!(receiver.unsubscribe_message(subject), false);
    }

    #[test]
    fn unsubscribe_discards_partial_transfers() {
        let mut receiver = heartbeat_receiver();
        let (_, frames) = multi_frame_transfer();
        let [first, second, third] = frames;
        assert!(receiver.accept(first, 0).unwrap().is_none());

        // Unsubscribing frees the session; resubscribing must not resurrect it
        assert!(receiver.unsubscribe_message(SubjectId::try_from(7509).unwrap()));
        receiver
            .subscribe_message(
                SubjectId::try_from(7509).unwrap(),
                16,
                TestDuration::from_ticks(1_000_000),
            )
            .unwrap();
        assert!(receiver.accept(second, 0).unwrap().is_none());
        assert!(receiver.accept(third, 0).unwrap().is_none());
        assert_eq!(receiver.transfer_count(), 0);
    }
}
