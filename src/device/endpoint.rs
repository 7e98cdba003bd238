//! Device endpoint bookkeeping

use crate::buffer::Buffer;
use usb_device::{
    endpoint::{EndpointAddress, EndpointType},
    UsbDirection,
};

bitflags::bitflags! {
    /// IN endpoint interrupt status and mask bits
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct InEndpointInterrupt : u32 {
        const TRANSFER_COMPLETE = 1 << 0;
        const DISABLED = 1 << 1;
        const TIMEOUT = 1 << 3;
        const TOKEN_FIFO_EMPTY = 1 << 4;
        const NAK_EFFECTIVE = 1 << 6;
        /// Read-only; masked through `DIEPEMPMSK`
        const TX_FIFO_EMPTY = 1 << 7;
    }
}

bitflags::bitflags! {
    /// OUT endpoint interrupt status and mask bits
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct OutEndpointInterrupt : u32 {
        const TRANSFER_COMPLETE = 1 << 0;
        const DISABLED = 1 << 1;
        const SETUP_DONE = 1 << 3;
        const TOKEN_WHILE_DISABLED = 1 << 4;
        const STATUS_PHASE_RECEIVED = 1 << 5;
    }
}

/// Software view of an endpoint's hardware state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EndpointState {
    Inactive,
    /// Active, no transfer in flight
    Idle,
    Transferring,
}

/// One direction of one device endpoint
pub struct Endpoint {
    pub(super) address: EndpointAddress,
    pub(super) kind: EndpointType,
    pub(super) max_packet: usize,
    pub(super) buffer: Option<Buffer>,
    pub(super) state: EndpointState,
    /// Buffer offset where the current transfer starts
    pub(super) base: usize,
    /// Bytes requested by the current transfer
    pub(super) xfer_len: usize,
    /// Bytes moved through the FIFO so far
    pub(super) xfer_count: usize,
    /// Transfer size programmed into the hardware
    pub(super) programmed: usize,
    pub(super) stalled: bool,
}

impl Endpoint {
    pub(super) fn new(index: usize, direction: UsbDirection) -> Self {
        Endpoint {
            address: EndpointAddress::from_parts(index, direction),
            kind: EndpointType::Control,
            max_packet: 64,
            buffer: None,
            state: EndpointState::Inactive,
            base: 0,
            xfer_len: 0,
            xfer_count: 0,
            programmed: 0,
            stalled: false,
        }
    }

    pub fn address(&self) -> EndpointAddress {
        self.address
    }

    pub fn kind(&self) -> EndpointType {
        self.kind
    }

    pub fn max_packet(&self) -> usize {
        self.max_packet
    }

    pub fn state(&self) -> EndpointState {
        self.state
    }

    pub fn is_stalled(&self) -> bool {
        self.stalled
    }

    /// The transmit FIFO that an IN endpoint pushes to
    pub fn tx_fifo(&self) -> usize {
        self.address.index()
    }

    /// Bytes the current transfer still has to move
    pub(super) fn remaining(&self) -> usize {
        self.xfer_len.saturating_sub(self.xfer_count)
    }

    /// Forget the transfer in flight
    pub(super) fn drop_transfer(&mut self) {
        if self.state == EndpointState::Transferring {
            self.state = EndpointState::Idle;
        }
        self.base = 0;
        self.xfer_len = 0;
        self.xfer_count = 0;
        self.programmed = 0;
    }

    pub(super) fn is_isochronous(&self) -> bool {
        matches!(self.kind, EndpointType::Isochronous { .. })
    }

    /// Bulk and interrupt endpoints restart at DATA0 after a halt
    pub(super) fn resets_toggle(&self) -> bool {
        matches!(self.kind, EndpointType::Bulk | EndpointType::Interrupt)
    }

    /// Value for the endpoint type field
    pub(super) fn type_bits(&self) -> u32 {
        match self.kind {
            EndpointType::Control => 0,
            EndpointType::Isochronous { .. } => 1,
            EndpointType::Bulk => 2,
            EndpointType::Interrupt => 3,
        }
    }
}

/// Packet count for a transfer of `len` bytes
///
/// A zero-length transfer is one zero-length packet.
pub(crate) fn packet_count(len: usize, max_packet: usize) -> usize {
    if len == 0 {
        1
    } else {
        len.div_ceil(max_packet.max(1))
    }
}

/// EP0's two-bit max packet size encoding
pub(super) fn ep0_mps_code(max_packet: usize) -> u32 {
    match max_packet {
        64.. => 0,
        32..=63 => 1,
        16..=31 => 2,
        _ => 3,
    }
}
