//! Packet and message wire model
//!
//! Every frame is one encoded value document: an envelope
//! `{i, r, t, p}` carrying the latency header and the payload. The payload's
//! `m` field selects the packet type; `Messages` packets nest an `mm` array
//! of messages, each again selected by `m`.

use muster_primitives::PrimitiveError;

/// Top-level packet types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum PacketKind {
    /// Keep-alive
    Heartbeat = 0,
    /// Peer identification
    Handshake = 1,
    /// Subject credentials
    Authenticate = 2,
    /// Batch of messages
    Messages = 3,
    /// A process joined a federation
    FederationProcessAdded = 4,
    /// A process left a federation
    FederationProcessRemoved = 5,
    /// Ask the master to host a lobby/match pair
    FederationHostingRequest = 6,
}

impl TryFrom<i32> for PacketKind {
    type Error = PrimitiveError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Heartbeat),
            1 => Ok(Self::Handshake),
            2 => Ok(Self::Authenticate),
            3 => Ok(Self::Messages),
            4 => Ok(Self::FederationProcessAdded),
            5 => Ok(Self::FederationProcessRemoved),
            6 => Ok(Self::FederationHostingRequest),
            other => Err(PrimitiveError::UnknownDiscriminant(other)),
        }
    }
}

/// Message types inside a `Messages` packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum MessageKind {
    /// No message
    None = 0,
    /// Object discover/update/delete with property payloads
    ObjectChanges = 1,
    /// Event fanout
    EventDispatch = 2,
    /// Service invocation
    ServiceRequest = 3,
    /// Service success response
    ServiceFulfill = 4,
    /// Service failure response
    ServiceReject = 5,
    /// Ask the peer to divest (negotiated)
    RoutingRequestDownstream = 6,
    /// Force the peer to divest
    RoutingEnableDownstream = 7,
    /// Deny the peer's upstream claim
    RoutingUpstreamDenied = 8,
    /// Ask to acquire from the peer
    RoutingRequestUpstream = 9,
    /// Force-acquire from the peer
    RoutingEnableUpstream = 10,
    /// Stop propagating a property on this session
    RoutingDisable = 11,
}

impl TryFrom<i32> for MessageKind {
    type Error = PrimitiveError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::None),
            1 => Ok(Self::ObjectChanges),
            2 => Ok(Self::EventDispatch),
            3 => Ok(Self::ServiceRequest),
            4 => Ok(Self::ServiceFulfill),
            5 => Ok(Self::ServiceReject),
            6 => Ok(Self::RoutingRequestDownstream),
            7 => Ok(Self::RoutingEnableDownstream),
            8 => Ok(Self::RoutingUpstreamDenied),
            9 => Ok(Self::RoutingRequestUpstream),
            10 => Ok(Self::RoutingEnableUpstream),
            11 => Ok(Self::RoutingDisable),
            other => Err(PrimitiveError::UnknownDiscriminant(other)),
        }
    }
}
