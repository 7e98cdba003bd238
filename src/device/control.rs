//! EP0 control transfer state machine
//!
//! `ControlContext` only decides what happens next. The device engine feeds
//! it hardware events and carries out the [`ControlAction`]s it returns.

use crate::setup::SetupPacket;

/// Where EP0 is within a control transfer
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlPhase {
    Idle,
    SetupReceived,
    /// Host to device data stage
    DataOut,
    /// Device to host data stage
    DataIn,
    /// Waiting for the host's zero-length status packet
    StatusOut,
    /// Sending the device's zero-length status packet
    StatusIn,
}

/// The next EP0 hardware operation
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlAction {
    /// Send `len` bytes of the EP0 IN staging buffer, starting at `offset`
    SendIn { offset: usize, len: usize },
    /// Receive up to `len` bytes into the EP0 OUT staging buffer at `offset`
    ReceiveOut { offset: usize, len: usize },
    /// Send the zero-length IN status packet
    SendStatus,
    /// Accept the zero-length OUT status packet
    ReceiveStatus,
    /// The OUT data stage is complete; ask the class before the status stage
    DataOutDone,
    /// Status stage finished
    Complete,
    /// Protocol stall on both EP0 directions
    Stall,
    /// Nothing to do
    None,
}

#[derive(Debug)]
pub struct ControlContext {
    setup: SetupPacket,
    phase: ControlPhase,
    max_packet: usize,
    /// Length of the data stage
    total: usize,
    /// Data stage bytes moved so far
    done: usize,
    /// Length of the IN chunk in flight
    in_flight: usize,
    zlp_pending: bool,
}

impl ControlContext {
    pub const fn new(max_packet: usize) -> Self {
        ControlContext {
            setup: SetupPacket {
                request_type: 0,
                request: 0,
                value: 0,
                index: 0,
                length: 0,
            },
            phase: ControlPhase::Idle,
            max_packet,
            total: 0,
            done: 0,
            in_flight: 0,
            zlp_pending: false,
        }
    }

    pub fn phase(&self) -> ControlPhase {
        self.phase
    }

    pub fn setup(&self) -> &SetupPacket {
        &self.setup
    }

    pub fn max_packet(&self) -> usize {
        self.max_packet
    }

    pub fn set_max_packet(&mut self, max_packet: usize) {
        self.max_packet = max_packet.max(8);
    }

    /// Bytes received in the OUT data stage, or sent in the IN data stage
    pub fn transferred(&self) -> usize {
        self.done
    }

    /// Drop any transfer, as after a bus reset
    pub fn reset(&mut self) {
        self.phase = ControlPhase::Idle;
        self.total = 0;
        self.done = 0;
        self.in_flight = 0;
        self.zlp_pending = false;
    }

    /// A SETUP packet arrived
    ///
    /// Always wins: whatever phase the previous transfer was in is dropped
    /// along with its counters.
    pub fn setup_received(&mut self, setup: SetupPacket) {
        if !matches!(self.phase, ControlPhase::Idle | ControlPhase::SetupReceived) {
            debug!("SETUP aborted control phase {:?}", self.phase);
        }
        self.reset();
        self.setup = setup;
        self.phase = ControlPhase::SetupReceived;
    }

    /// Begin a device to host data stage with `len` bytes staged
    ///
    /// `len` is clipped to the host's requested length. A zero-length packet
    /// follows the data when it ends on a packet boundary, but is shorter
    /// than what the host asked for. A request for zero bytes has no data
    /// stage, and goes straight to the IN status packet.
    pub fn start_data_in(&mut self, len: usize) -> ControlAction {
        let requested = usize::from(self.setup.length);
        if requested == 0 {
            return self.no_data();
        }
        self.total = len.min(requested);
        self.done = 0;
        self.zlp_pending =
            self.total > 0 && self.total % self.max_packet == 0 && self.total < requested;
        self.phase = ControlPhase::DataIn;
        self.next_in_chunk()
    }

    /// Begin a host to device data stage for the request's full length
    pub fn start_data_out(&mut self) -> ControlAction {
        self.total = usize::from(self.setup.length);
        self.done = 0;
        self.phase = ControlPhase::DataOut;
        ControlAction::ReceiveOut {
            offset: 0,
            len: self.total.min(self.max_packet),
        }
    }

    /// A request without a data stage was accepted
    pub fn no_data(&mut self) -> ControlAction {
        self.phase = ControlPhase::StatusIn;
        ControlAction::SendStatus
    }

    /// The class accepted or rejected the received OUT data
    pub fn finish_data_out(&mut self, accepted: bool) -> ControlAction {
        if accepted {
            self.phase = ControlPhase::StatusIn;
            ControlAction::SendStatus
        } else {
            self.reject()
        }
    }

    /// Stall the request
    pub fn reject(&mut self) -> ControlAction {
        self.reset();
        ControlAction::Stall
    }

    /// EP0 IN finished its last packet
    pub fn in_complete(&mut self) -> ControlAction {
        match self.phase {
            ControlPhase::DataIn => {
                self.done += self.in_flight;
                self.in_flight = 0;
                if self.done < self.total {
                    self.next_in_chunk()
                } else if self.zlp_pending {
                    self.zlp_pending = false;
                    ControlAction::SendIn {
                        offset: self.done,
                        len: 0,
                    }
                } else {
                    self.phase = ControlPhase::StatusOut;
                    ControlAction::ReceiveStatus
                }
            }
            ControlPhase::StatusIn => {
                self.phase = ControlPhase::Idle;
                ControlAction::Complete
            }
            _ => ControlAction::None,
        }
    }

    /// EP0 OUT finished a packet of `len` bytes
    pub fn out_complete(&mut self, len: usize) -> ControlAction {
        match self.phase {
            ControlPhase::DataOut => {
                self.done = (self.done + len).min(self.total);
                if self.done < self.total && len == self.max_packet {
                    ControlAction::ReceiveOut {
                        offset: self.done,
                        len: (self.total - self.done).min(self.max_packet),
                    }
                } else {
                    ControlAction::DataOutDone
                }
            }
            ControlPhase::StatusOut => {
                self.phase = ControlPhase::Idle;
                ControlAction::Complete
            }
            _ => ControlAction::None,
        }
    }

    fn next_in_chunk(&mut self) -> ControlAction {
        self.in_flight = (self.total - self.done).min(self.max_packet);
        ControlAction::SendIn {
            offset: self.done,
            len: self.in_flight,
        }
    }
}
