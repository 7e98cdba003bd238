//! Host channel bookkeeping

use crate::{buffer::Buffer, config::Speed};
use usb_device::{
    endpoint::{EndpointAddress, EndpointType},
    UsbDirection,
};

bitflags::bitflags! {
    /// Channel interrupt status and mask bits
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct ChannelInterrupt : u32 {
        const TRANSFER_COMPLETE = 1 << 0;
        const HALTED = 1 << 1;
        const AHB_ERROR = 1 << 2;
        const STALL = 1 << 3;
        const NAK = 1 << 4;
        const ACK = 1 << 5;
        const NYET = 1 << 6;
        const TRANSACTION_ERROR = 1 << 7;
        const BABBLE = 1 << 8;
        const FRAME_OVERRUN = 1 << 9;
        const DATA_TOGGLE_ERROR = 1 << 10;
    }
}

/// Hardware packet count limit for one programmed transfer
pub(super) const MAX_PACKETS: usize = 256;

/// What a channel talks to
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChannelConfig {
    pub device_address: u8,
    /// Endpoint number and direction, as seen by the device
    pub endpoint: EndpointAddress,
    pub kind: EndpointType,
    pub max_packet: usize,
    pub speed: Speed,
    /// Size of the channel's transfer buffer
    pub buffer_len: usize,
}

impl ChannelConfig {
    pub fn new(device_address: u8, endpoint: EndpointAddress, kind: EndpointType, max_packet: usize) -> Self {
        ChannelConfig {
            device_address,
            endpoint,
            kind,
            max_packet,
            speed: Speed::Full,
            buffer_len: max_packet,
        }
    }

    pub fn with_speed(mut self, speed: Speed) -> Self {
        self.speed = speed;
        self
    }

    pub fn with_buffer_len(mut self, buffer_len: usize) -> Self {
        self.buffer_len = buffer_len;
        self
    }

    pub(super) fn is_in(&self) -> bool {
        self.endpoint.direction() == UsbDirection::In
    }

    /// Interrupt and isochronous channels use the periodic queue
    pub(super) fn is_periodic(&self) -> bool {
        matches!(
            self.kind,
            EndpointType::Interrupt | EndpointType::Isochronous { .. }
        )
    }

    pub(super) fn is_isochronous(&self) -> bool {
        matches!(self.kind, EndpointType::Isochronous { .. })
    }

    /// Bulk and control OUT at high speed use the PING protocol
    pub(super) fn pings(&self) -> bool {
        !self.is_in()
            && self.speed == Speed::High
            && matches!(self.kind, EndpointType::Bulk | EndpointType::Control)
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

    /// Channel interrupts that matter for this kind of transfer
    pub(super) fn interrupt_mask(&self) -> ChannelInterrupt {
        let mut mask = ChannelInterrupt::TRANSFER_COMPLETE | ChannelInterrupt::HALTED;
        match self.kind {
            EndpointType::Control | EndpointType::Bulk => {
                mask |= ChannelInterrupt::STALL
                    | ChannelInterrupt::TRANSACTION_ERROR
                    | ChannelInterrupt::DATA_TOGGLE_ERROR
                    | ChannelInterrupt::NAK;
                if self.is_in() {
                    mask |= ChannelInterrupt::BABBLE;
                } else {
                    mask |= ChannelInterrupt::ACK;
                    if self.speed == Speed::High {
                        mask |= ChannelInterrupt::NYET;
                    }
                }
            }
            EndpointType::Interrupt => {
                mask |= ChannelInterrupt::STALL
                    | ChannelInterrupt::TRANSACTION_ERROR
                    | ChannelInterrupt::DATA_TOGGLE_ERROR
                    | ChannelInterrupt::NAK
                    | ChannelInterrupt::FRAME_OVERRUN;
                if self.is_in() {
                    mask |= ChannelInterrupt::BABBLE;
                } else {
                    mask |= ChannelInterrupt::ACK;
                }
            }
            EndpointType::Isochronous { .. } => {
                mask |= ChannelInterrupt::ACK | ChannelInterrupt::FRAME_OVERRUN;
                if self.is_in() {
                    mask |= ChannelInterrupt::TRANSACTION_ERROR | ChannelInterrupt::BABBLE;
                }
            }
        }
        mask
    }
}

/// Why a transfer failed
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelError {
    /// CRC, timeout, bit stuffing, or a false EOP, past the retry limit
    Transaction,
    /// Data toggle mismatch, past the retry limit
    DataToggle,
    /// The device talked past the end of the packet
    Babble,
    /// A periodic transaction missed its frame
    FrameOverrun,
    /// The device went away
    Disconnected,
}

/// Software view of a channel
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelStatus {
    /// Not allocated
    Free,
    /// Allocated, nothing running
    Idle,
    Transferring,
    /// The transfer moved all of its data, or ended on a short packet
    Complete,
    /// Halted on request
    Halted,
    /// The device wasn't ready; start the transfer again later
    Nak,
    Stall,
    Error(ChannelError),
}

/// Progress of a channel disable request
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) enum HaltState {
    None,
    /// Waiting for a request queue slot
    Pending,
    /// Disable written; waiting for the halted interrupt
    Requested,
}

/// What to do once the channel reports that it halted
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) enum HaltReason {
    /// Everything moved, and counted
    Complete,
    /// A chunk moved, and counted; program the next one
    NextChunk,
    /// Count what moved, and carry on with the rest
    Resume,
    /// Count what moved, and report this status
    Finish(ChannelStatus),
    /// Count what moved, and retry within the limit
    Failed(ChannelError),
}

pub(super) struct Channel {
    pub(super) config: Option<ChannelConfig>,
    pub(super) buffer: Option<Buffer>,
    pub(super) status: ChannelStatus,
    pub(super) halt: HaltState,
    pub(super) reason: Option<HaltReason>,
    /// Bytes requested by the transfer
    pub(super) xfer_len: usize,
    /// Bytes moved so far
    pub(super) xfer_count: usize,
    /// `xfer_count` when the current chunk was programmed
    pub(super) chunk_start: usize,
    /// Size and packet count of the current chunk
    pub(super) programmed: usize,
    pub(super) packets: usize,
    /// OUT bytes pushed into the FIFO for the current chunk
    pub(super) pushed: usize,
    /// Slave mode OUT data waits for FIFO space
    pub(super) out_waiting: bool,
    /// The next data packet is DATA1
    pub(super) toggle: bool,
    pub(super) setup: bool,
    pub(super) do_ping: bool,
    pub(super) err_count: u8,
}

impl Channel {
    pub(super) const fn new() -> Self {
        Channel {
            config: None,
            buffer: None,
            status: ChannelStatus::Free,
            halt: HaltState::None,
            reason: None,
            xfer_len: 0,
            xfer_count: 0,
            chunk_start: 0,
            programmed: 0,
            packets: 0,
            pushed: 0,
            out_waiting: false,
            toggle: false,
            setup: false,
            do_ping: false,
            err_count: 0,
        }
    }

    /// Forget the transfer, keeping the configuration and toggle
    pub(super) fn reset_transfer(&mut self) {
        self.halt = HaltState::None;
        self.reason = None;
        self.xfer_len = 0;
        self.xfer_count = 0;
        self.chunk_start = 0;
        self.programmed = 0;
        self.packets = 0;
        self.pushed = 0;
        self.out_waiting = false;
        self.err_count = 0;
    }

    /// Flip the data toggle once for each of `packets` packets
    pub(super) fn advance_toggle(&mut self, packets: usize) {
        if packets % 2 == 1 {
            self.toggle = !self.toggle;
        }
    }
}
