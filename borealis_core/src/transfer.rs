//!
//! Transfer and header definitions
//!

use crate::{NodeId, PortId, Priority, ServiceId, SubjectId, TransferId};

/// The three categories of transfers
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum TransferKind {
    /// A broadcast message on a subject
    Message,
    /// A service request addressed to one node
    Request,
    /// A service response addressed to one node
    Response,
}

/// The header of a message transfer
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct MessageHeader<I> {
    /// For incoming transfers, the time when the first frame was received. For outgoing
    /// transfers, the transmission deadline for all frames
    pub timestamp: I,
    /// The transfer ID, common to all frames of this transfer
    pub transfer_id: TransferId,
    pub priority: Priority,
    /// The subject of the message
    pub subject: SubjectId,
    /// The source node, or None if the transfer is anonymous
    ///
    /// An anonymous transfer is sent with a pseudo-ID derived from the payload, and must fit
    /// into a single frame.
    pub source: Option<NodeId>,
}

/// The header of a service request or response transfer
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ServiceHeader<I> {
    /// For incoming transfers, the time when the first frame was received. For outgoing
    /// transfers, the transmission deadline for all frames
    pub timestamp: I,
    /// The transfer ID, common to all frames of this transfer
    pub transfer_id: TransferId,
    pub priority: Priority,
    /// The service being invoked
    pub service: ServiceId,
    /// The node sending this transfer
    pub source: NodeId,
    /// The node this transfer is addressed to
    pub destination: NodeId,
}

/// The complete header of a transfer of any kind
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Header<I> {
    Message(MessageHeader<I>),
    Request(ServiceHeader<I>),
    Response(ServiceHeader<I>),
}

impl<I> Header<I> {
    /// Returns the timestamp of this transfer
    pub fn timestamp(&self) -> I
    where
        I: Clone,
    {
        match self {
            Header::Message(header) => header.timestamp.clone(),
            Header::Request(header) | Header::Response(header) => header.timestamp.clone(),
        }
    }

    /// Returns the transfer ID
    pub fn transfer_id(&self) -> TransferId {
        match self {
            Header::Message(header) => header.transfer_id,
            Header::Request(header) | Header::Response(header) => header.transfer_id,
        }
    }

    /// Returns the priority
    pub fn priority(&self) -> Priority {
        match self {
            Header::Message(header) => header.priority,
            Header::Request(header) | Header::Response(header) => header.priority,
        }
    }

    /// Returns the source node, or None for an anonymous transfer
    pub fn source(&self) -> Option<NodeId> {
        match self {
            Header::Message(header) => header.source,
            Header::Request(header) | Header::Response(header) => Some(header.source),
        }
    }

    /// Returns the kind of this transfer
    pub fn kind(&self) -> TransferKind {
        match self {
            Header::Message(_) => TransferKind::Message,
            Header::Request(_) => TransferKind::Request,
            Header::Response(_) => TransferKind::Response,
        }
    }

    /// Returns the subject or service ID
    pub fn port_id(&self) -> PortId {
        match self {
            Header::Message(header) => header.subject.into(),
            Header::Request(header) | Header::Response(header) => header.service.into(),
        }
    }

    /// Returns the service header, if this is a request or response transfer
    pub fn service_header(&self) -> Option<&ServiceHeader<I>> {
        match self {
            Header::Message(_) => None,
            Header::Request(header) | Header::Response(header) => Some(header),
        }
    }
}

/// An application-level transfer
///
/// The payload type `P` is normally `&[u8]` for outgoing transfers, which are copied into
/// frames, and `Vec<u8>` for incoming transfers, which the application owns.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Transfer<P, I> {
    pub header: Header<I>,
    /// The transfer payload, without any tail bytes, padding, or transfer CRC
    pub payload: P,
}
