//! Host interrupt dispatch

use super::{
    channel::{ChannelError, ChannelInterrupt, ChannelStatus, HaltReason, HaltState},
    tx_empty, Host, STAGING_LEN,
};
use crate::{
    config::Phy,
    fifo::{HostPacket, HostStatus},
    ral,
    usbcore::{Interrupts, Mode, Spin},
};

bitflags::bitflags! {
    /// Root port and frame events
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct PortEvents : u8 {
        const CONNECTED = 1 << 0;
        const DISCONNECTED = 1 << 1;
        /// Reset finished, and the device can take transactions
        const ENABLED = 1 << 2;
        const DISABLED = 1 << 3;
        const OVERCURRENT = 1 << 4;
        const SOF = 1 << 5;
        /// The PHY clock changed to suit the device; reset the port again
        const RESET_REQUIRED = 1 << 6;
        const INCOMPLETE_PERIODIC = 1 << 7;
    }
}

/// What happened during one [`Host::on_interrupt()`] call
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HostEvents {
    pub port: PortEvents,
    /// One bit for each channel whose transfer ended; see [`Host::status()`]
    pub channels: u16,
}

impl HostEvents {
    const fn new() -> Self {
        HostEvents {
            port: PortEvents::empty(),
            channels: 0,
        }
    }

    /// Did channel `n`'s transfer end?
    pub fn channel(&self, n: usize) -> bool {
        n < 16 && self.channels & (1 << n) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.port.is_empty() && self.channels == 0
    }
}

impl Host {
    /// Service every pending host interrupt
    ///
    /// Call this from the OTG interrupt handler, or poll it. Returns the
    /// port events, and the channels whose transfers ended, since the last
    /// call. Halt requests that waited for a request queue slot are retried
    /// first. This never blocks.
    pub fn on_interrupt(&mut self) -> HostEvents {
        let mut events = HostEvents::new();
        if self.core.mode() != Mode::Host {
            return events;
        }
        self.retry_halts();
        let pending = self.core.pending();

        if pending.contains(Interrupts::MODE_MISMATCH) {
            warn!("Register access in the wrong mode");
            self.core.clear(Interrupts::MODE_MISMATCH);
        }
        if pending.contains(Interrupts::SOF) {
            self.core.clear(Interrupts::SOF);
            events.port |= PortEvents::SOF;
        }
        if pending.contains(Interrupts::RX_FIFO_LEVEL) {
            self.receive_fifo();
        }
        if pending.contains(Interrupts::NP_TX_FIFO_EMPTY) {
            self.refill(false);
        }
        if pending.contains(Interrupts::P_TX_FIFO_EMPTY) {
            self.refill(true);
        }
        if pending.contains(Interrupts::HOST_PORT) {
            self.port_change(&mut events);
        }
        if pending.contains(Interrupts::DISCONNECT) {
            self.core.clear(Interrupts::DISCONNECT);
            self.disconnected(&mut events);
        }
        if pending.contains(Interrupts::INCOMPLETE_PERIODIC) {
            self.core.clear(Interrupts::INCOMPLETE_PERIODIC);
            events.port |= PortEvents::INCOMPLETE_PERIODIC;
        }
        if pending.contains(Interrupts::HOST_CHANNEL) {
            let regs = self.core.regs();
            let haint = ral::read_reg!(ral::otg, regs, HAINT) & ral::read_reg!(ral::otg, regs, HAINTMSK);
            for n in 0..self.core.config().channel_count() {
                if haint & (1 << n) != 0 {
                    self.channel_interrupt(n, &mut events);
                }
            }
        }
        events
    }

    fn retry_halts(&mut self) {
        for n in 0..self.core.config().channel_count() {
            if self.channels[n].halt == HaltState::Pending && self.request_halt(n).is_ok() {
                debug!("Channel {} halt issued", n);
            }
        }
    }

    fn receive_fifo(&mut self) {
        self.core.mask(Interrupts::RX_FIFO_LEVEL);
        let status = HostStatus::from_bits(self.core.pop_status());
        match status.kind {
            HostPacket::InData => self.receive_packet(status.number, status.byte_count),
            HostPacket::InComplete | HostPacket::DataToggleError | HostPacket::ChannelHalted => {}
            HostPacket::Reserved(code) => {
                warn!("Unexpected receive status {}", code);
                self.core.discard_packet(status.byte_count);
            }
        }
        self.core.unmask(Interrupts::RX_FIFO_LEVEL);
    }

    /// Copy an IN packet from the receive FIFO into channel `n`'s buffer
    ///
    /// Re-enables the channel while packets remain.
    fn receive_packet(&mut self, n: usize, len: usize) {
        let regs = self.core.regs();
        let ch = match self.channels.get_mut(n) {
            Some(ch) if ch.status == ChannelStatus::Transferring => ch,
            _ => {
                warn!("Dropped {} bytes for channel {}", len, n);
                self.core.discard_packet(len);
                return;
            }
        };
        let Some(buffer) = ch.buffer.as_mut() else {
            self.core.discard_packet(len);
            return;
        };
        let start = ch.xfer_count;
        let mut staging = [0u8; STAGING_LEN];
        let mut copied = 0;
        while copied < len {
            let part = (len - copied).min(STAGING_LEN);
            self.core.read_packet(&mut staging[..part]);
            buffer.volatile_write(start + copied, &staging[..part]);
            copied += part;
        }
        let stored = len.min(buffer.len().saturating_sub(start));
        if stored < len {
            warn!("Channel {} overran its buffer by {} bytes", n, len - stored);
        }
        ch.xfer_count += stored;
        ch.advance_toggle(1);

        let hc = &regs.hc[n];
        if ral::read_reg!(ral::hc, hc, HCTSIZ, PKTCNT) > 0 {
            ral::modify_reg!(ral::hc, hc, HCCHAR, CHDIS: 0, CHENA: 1);
        }
    }

    /// Push waiting OUT data, and mask the FIFO empty interrupt once
    /// nothing waits on it
    fn refill(&mut self, periodic: bool) {
        let waits = |ch: &super::Channel| ch.config.map_or(false, |config| config.is_periodic() == periodic);
        for n in 0..self.core.config().channel_count() {
            if self.channels[n].out_waiting && waits(&self.channels[n]) {
                self.push_out(n);
            }
        }
        let waiting = self
            .channels
            .iter()
            .any(|ch| (ch.out_waiting || ch.halt == HaltState::Pending) && waits(ch));
        if !waiting {
            self.core.mask(tx_empty(periodic));
        }
    }

    fn port_change(&mut self, events: &mut HostEvents) {
        use ral::otg::HPRT;
        let regs = self.core.regs();
        let hprt = ral::read_reg!(ral::otg, regs, HPRT);
        let mut ack = 0;
        if hprt & HPRT::PCDET::mask != 0 {
            ack |= HPRT::PCDET::mask;
            if hprt & HPRT::PCSTS::mask != 0 {
                debug!("Device connected");
                events.port |= PortEvents::CONNECTED;
            }
        }
        if hprt & HPRT::PENCHNG::mask != 0 {
            ack |= HPRT::PENCHNG::mask;
            if hprt & HPRT::PENA::mask != 0 {
                debug!("Port enabled");
                events.port |= PortEvents::ENABLED;
                if self.port_enabled(hprt) {
                    events.port |= PortEvents::RESET_REQUIRED;
                }
            } else {
                events.port |= PortEvents::DISABLED;
            }
        }
        if hprt & HPRT::POCCHNG::mask != 0 {
            ack |= HPRT::POCCHNG::mask;
            if hprt & HPRT::POCA::mask != 0 {
                warn!("Port overcurrent");
                events.port |= PortEvents::OVERCURRENT;
            }
        }
        ral::write_reg!(ral::otg, regs, HPRT, (hprt & !super::HPRT_W1C) | ack);
    }

    /// Match the frame timer and PHY clock to the device on the port
    ///
    /// Returns `true` if the PHY clock changed.
    fn port_enabled(&mut self, hprt: u32) -> bool {
        use ral::otg::{HCFG::FSLSPCS, HPRT::PSPD};
        if self.core.config().phy != Phy::Embedded {
            return false;
        }
        let regs = self.core.regs();
        let low = ral::field(hprt, PSPD::mask, PSPD::offset) == PSPD::RW::LOW;
        let (clock, frame) = if low {
            (FSLSPCS::RW::CLK_6MHZ, 6_000)
        } else {
            (FSLSPCS::RW::CLK_48MHZ, 48_000)
        };
        ral::write_reg!(ral::otg, regs, HFIR, FRIVL: frame);
        if ral::read_reg!(ral::otg, regs, HCFG, FSLSPCS) == clock {
            return false;
        }
        ral::modify_reg!(ral::otg, regs, HCFG, FSLSPCS: clock);
        debug!("PHY clock changed");
        true
    }

    /// Fail every transfer in flight, and drop what's queued
    fn disconnected(&mut self, events: &mut HostEvents) {
        debug!("Device disconnected");
        events.port |= PortEvents::DISCONNECTED;
        let regs = self.core.regs();
        for n in 0..self.core.config().channel_count() {
            let ch = &mut self.channels[n];
            if ch.status != ChannelStatus::Transferring {
                continue;
            }
            let hc = &regs.hc[n];
            if ral::read_reg!(ral::hc, hc, HCCHAR, CHENA == 1) {
                ral::modify_reg!(ral::hc, hc, HCCHAR, CHDIS: 1, CHENA: 1);
            }
            ch.halt = HaltState::None;
            ch.reason = None;
            ch.out_waiting = false;
            ch.status = ChannelStatus::Error(ChannelError::Disconnected);
            events.channels |= 1 << n;
        }
        self.core.mask(Interrupts::NP_TX_FIFO_EMPTY | Interrupts::P_TX_FIFO_EMPTY);
        if self.core.flush_all_tx_fifos(&mut Spin).is_err() || self.core.flush_rx_fifo(&mut Spin).is_err() {
            warn!("FIFO flush timed out after disconnect");
        }
    }

    /// Handle one channel's interrupts
    ///
    /// Events that end the transfer record what happened, and halt the
    /// channel. The outcome is reported once the channel has halted.
    fn channel_interrupt(&mut self, n: usize, events: &mut HostEvents) {
        let hc = &self.core.regs().hc[n];
        let hcint = ral::read_reg!(ral::hc, hc, HCINT) & ral::read_reg!(ral::hc, hc, HCINTMSK);
        let raised = ChannelInterrupt::from_bits_truncate(hcint);
        ral::write_reg!(ral::hc, hc, HCINT, raised.bits());

        let ch = &mut self.channels[n];
        let Some(config) = ch.config else {
            return;
        };
        if ch.status != ChannelStatus::Transferring {
            return;
        }

        if raised.contains(ChannelInterrupt::ACK) {
            ch.err_count = 0;
            ch.do_ping = false;
        }
        if raised.contains(ChannelInterrupt::TRANSFER_COMPLETE) {
            self.transfer_done(n);
            if self.request_halt(n).is_err() {
                trace!("Channel {} complete, halt deferred", n);
            }
        } else if raised.contains(ChannelInterrupt::STALL) {
            self.end_transfer(n, HaltReason::Finish(ChannelStatus::Stall));
        } else if raised.contains(ChannelInterrupt::BABBLE) {
            self.end_transfer(n, HaltReason::Failed(ChannelError::Babble));
        } else if raised.contains(ChannelInterrupt::FRAME_OVERRUN) {
            self.end_transfer(n, HaltReason::Failed(ChannelError::FrameOverrun));
        } else if raised.contains(ChannelInterrupt::TRANSACTION_ERROR) {
            ch.err_count = ch.err_count.saturating_add(1);
            self.end_transfer(n, HaltReason::Failed(ChannelError::Transaction));
        } else if raised.contains(ChannelInterrupt::DATA_TOGGLE_ERROR) {
            ch.err_count = ch.err_count.saturating_add(1);
            self.end_transfer(n, HaltReason::Failed(ChannelError::DataToggle));
        } else if raised.contains(ChannelInterrupt::NYET) {
            ch.do_ping = true;
            self.end_transfer(n, HaltReason::Resume);
        } else if raised.contains(ChannelInterrupt::NAK) {
            if config.is_in() && !config.is_periodic() {
                // Keep polling the device
                ch.err_count = 0;
                if ch.halt == HaltState::None {
                    ral::modify_reg!(ral::hc, hc, HCCHAR, CHDIS: 0, CHENA: 1);
                }
            } else {
                if config.pings() {
                    ch.do_ping = true;
                }
                self.end_transfer(n, HaltReason::Finish(ChannelStatus::Nak));
            }
        }

        if raised.contains(ChannelInterrupt::HALTED) {
            self.channel_halted(n, events);
        }
    }

    /// Record why the transfer ends, then halt the channel
    fn end_transfer(&mut self, n: usize, reason: HaltReason) {
        let ch = &mut self.channels[n];
        if ch.reason.is_none() {
            ch.reason = Some(reason);
        }
        if self.request_halt(n).is_err() {
            trace!("Channel {} halt deferred", n);
        }
    }

    /// Count a completed chunk, and decide whether another one follows
    fn transfer_done(&mut self, n: usize) {
        let dma = self.core.config().dma;
        let hc = &self.core.regs().hc[n];
        let ch = &mut self.channels[n];
        let Some(config) = ch.config else {
            return;
        };
        let moved = if config.is_in() {
            if dma {
                let left = ral::read_reg!(ral::hc, hc, HCTSIZ, XFRSIZ) as usize;
                let packets_left = ral::read_reg!(ral::hc, hc, HCTSIZ, PKTCNT) as usize;
                ch.advance_toggle(ch.packets.saturating_sub(packets_left));
                ch.programmed.saturating_sub(left)
            } else {
                ch.xfer_count - ch.chunk_start
            }
        } else {
            if ch.setup {
                ch.setup = false;
                ch.toggle = true;
            } else {
                ch.advance_toggle(ch.packets);
            }
            ch.programmed
        };
        ch.xfer_count = ch.chunk_start + moved;
        ch.err_count = 0;
        let more = moved == ch.programmed && ch.xfer_count < ch.xfer_len;
        ch.reason = Some(if more {
            HaltReason::NextChunk
        } else {
            HaltReason::Complete
        });
    }

    /// Count what moved before the channel stopped short of the end of a chunk
    fn settle(&mut self, n: usize) {
        let dma = self.core.config().dma;
        let hc = &self.core.regs().hc[n];
        let ch = &mut self.channels[n];
        let Some(config) = ch.config else {
            return;
        };
        let packets_left = ral::read_reg!(ral::hc, hc, HCTSIZ, PKTCNT) as usize;
        let done = ch.packets.saturating_sub(packets_left);
        if config.is_in() {
            if dma {
                let left = ral::read_reg!(ral::hc, hc, HCTSIZ, XFRSIZ) as usize;
                ch.xfer_count = ch.chunk_start + ch.programmed.saturating_sub(left);
                ch.advance_toggle(done);
            }
        } else {
            let mps = config.max_packet.max(1);
            ch.xfer_count = ch.chunk_start + (done * mps).min(ch.programmed);
            if ch.setup {
                if done > 0 {
                    ch.setup = false;
                    ch.toggle = true;
                }
            } else {
                ch.advance_toggle(done);
            }
        }
    }

    /// The channel halted; report the outcome, or carry on with the transfer
    fn channel_halted(&mut self, n: usize, events: &mut HostEvents) {
        let retry_limit = self.core.config().retry_limit;
        let reason = self.channels[n].reason.take();
        if !matches!(reason, Some(HaltReason::Complete | HaltReason::NextChunk)) {
            self.settle(n);
        }
        let ch = &mut self.channels[n];
        ch.halt = HaltState::None;
        ch.out_waiting = false;
        let iso = ch.config.map_or(false, |config| config.is_isochronous());
        let outcome = match reason {
            Some(HaltReason::NextChunk | HaltReason::Resume) => None,
            Some(HaltReason::Complete) => Some(ChannelStatus::Complete),
            Some(HaltReason::Finish(status)) => Some(status),
            Some(HaltReason::Failed(error)) => {
                let retryable = matches!(error, ChannelError::Transaction | ChannelError::DataToggle);
                if retryable && !iso && ch.err_count < retry_limit {
                    warn!("Channel {} error {:?}, retry {}", n, error, ch.err_count);
                    None
                } else {
                    Some(ChannelStatus::Error(error))
                }
            }
            None => Some(ChannelStatus::Halted),
        };
        match outcome {
            Some(status) => {
                ch.status = status;
                events.channels |= 1 << n;
                trace!("Channel {} done, {} bytes", n, ch.xfer_count);
            }
            None => self.program(n),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{HostEvents, PortEvents};
    use crate::{
        config::Config,
        host::{ChannelConfig, ChannelError, ChannelInterrupt, ChannelStatus, Host},
        ral::{self, RegisterBlock},
        testing,
        usbcore::{Interrupts, UsbCore},
    };
    use usb_device::{
        endpoint::{EndpointAddress, EndpointType},
        UsbDirection,
    };

    fn host(config: Config) -> (Host, &'static RegisterBlock) {
        let (instance, regs) = testing::instance();
        let mut host = Host::new(UsbCore::new(instance, config), testing::memory::<4096>());
        host.initialize(&mut testing::Delay::new(regs)).unwrap();
        testing::clear_latched(regs);
        ral::write_reg!(ral::otg, regs, GNPTXSTS, NPTXFSAV: 256, NPTQXSAV: 8);
        ral::write_reg!(ral::otg, regs, HPTXSTS, PTXFSAVL: 96, PTXQSAV: 8);
        (host, regs)
    }

    fn channel(host: &mut Host, direction: UsbDirection, kind: EndpointType, mps: usize, len: usize) -> usize {
        let ch = host.alloc_channel().unwrap();
        let endpoint = EndpointAddress::from_parts(1, direction);
        let config = ChannelConfig::new(5, endpoint, kind, mps).with_buffer_len(len);
        host.init_channel(ch, config).unwrap();
        ch
    }

    /// Latch `interrupts` in host mode, then run the handler
    fn dispatch(host: &mut Host, regs: &RegisterBlock, interrupts: Interrupts) -> HostEvents {
        testing::raise(regs, interrupts | Interrupts::CURRENT_MODE);
        let events = host.on_interrupt();
        testing::clear_latched(regs);
        events
    }

    fn channel_event(host: &mut Host, regs: &RegisterBlock, ch: usize, raised: ChannelInterrupt) -> HostEvents {
        regs.hc[ch].HCINT.write(raised.bits());
        regs.HAINT.write(1 << ch);
        dispatch(host, regs, Interrupts::HOST_CHANNEL)
    }

    fn receive(host: &mut Host, regs: &RegisterBlock, ch: usize, data: &[u8]) {
        ral::write_reg!(ral::otg, regs, GRXSTSP, EPNUM: ch as u32, BCNT: data.len() as u32, PKTSTS: 2);
        for (slot, chunk) in regs.fifo[0].iter().zip(data.chunks(4)) {
            let mut word = [0; 4];
            word[..chunk.len()].copy_from_slice(chunk);
            slot.write(u32::from_le_bytes(word));
        }
        dispatch(host, regs, Interrupts::RX_FIFO_LEVEL);
    }

    fn halted() -> ChannelInterrupt {
        ChannelInterrupt::HALTED
    }

    #[test]
    fn port_connect_and_enable() {
        let (mut host, regs) = host(Config::full_speed());
        ral::write_reg!(ral::otg, regs, HPRT, PCSTS: 1, PCDET: 1, PPWR: 1);
        let events = dispatch(&mut host, regs, Interrupts::HOST_PORT);
        assert_eq!(events.port, PortEvents::CONNECTED);
        // Acknowledged with a one
        assert!(ral::read_reg!(ral::otg, regs, HPRT, PCDET == 1));
        assert!(ral::read_reg!(ral::otg, regs, HPRT, PPWR == 1));

        ral::write_reg!(ral::otg, regs, HPRT, PCSTS: 1, PENA: 1, PENCHNG: 1, PPWR: 1, PSPD: FULL);
        let events = dispatch(&mut host, regs, Interrupts::HOST_PORT);
        assert_eq!(events.port, PortEvents::ENABLED);
        assert!(ral::read_reg!(ral::otg, regs, HFIR, FRIVL == 48_000));
        // Never write a one to the enable bit; that disables the port
        assert!(ral::read_reg!(ral::otg, regs, HPRT, PENA == 0));
        assert_eq!(host.port_speed(), Some(crate::config::Speed::Full));
    }

    #[test]
    fn low_speed_device_changes_the_clock() {
        let (mut host, regs) = host(Config::full_speed());
        ral::write_reg!(ral::otg, regs, HPRT, PCSTS: 1, PENA: 1, PENCHNG: 1, PSPD: LOW);
        let events = dispatch(&mut host, regs, Interrupts::HOST_PORT);
        assert!(events.port.contains(PortEvents::ENABLED | PortEvents::RESET_REQUIRED));
        assert!(ral::read_reg!(ral::otg, regs, HCFG, FSLSPCS == CLK_6MHZ));
        assert!(ral::read_reg!(ral::otg, regs, HFIR, FRIVL == 6_000));

        // Same clock after the next reset
        ral::write_reg!(ral::otg, regs, HPRT, PCSTS: 1, PENA: 1, PENCHNG: 1, PSPD: LOW);
        let events = dispatch(&mut host, regs, Interrupts::HOST_PORT);
        assert_eq!(events.port, PortEvents::ENABLED);
    }

    #[test]
    fn overcurrent_and_sof() {
        let (mut host, regs) = host(Config::full_speed());
        ral::write_reg!(ral::otg, regs, HPRT, POCA: 1, POCCHNG: 1);
        let events = dispatch(&mut host, regs, Interrupts::HOST_PORT | Interrupts::SOF);
        assert_eq!(events.port, PortEvents::OVERCURRENT | PortEvents::SOF);
        assert_eq!(events.channels, 0);
    }

    #[test]
    fn ignored_in_device_mode() {
        let (mut host, regs) = host(Config::full_speed());
        testing::raise(regs, Interrupts::SOF);
        assert!(host.on_interrupt().is_empty());
    }

    #[test]
    fn bulk_in_in_slave_mode() {
        let (mut host, regs) = host(Config::full_speed());
        let ch = channel(&mut host, UsbDirection::In, EndpointType::Bulk, 64, 128);
        host.start_transfer(ch, 100).unwrap();
        let hc = &regs.hc[ch];
        assert!(ral::read_reg!(ral::hc, hc, HCTSIZ, PKTCNT == 2));

        let data: [u8; 100] = core::array::from_fn(|i| i as u8);
        receive(&mut host, regs, ch, &data[..64]);
        assert_eq!(host.transferred(ch), 64);
        assert!(host.data_toggle(ch));
        ral::modify_reg!(ral::hc, hc, HCCHAR, CHENA: 0);
        receive(&mut host, regs, ch, &data[64..]);
        // Re-enabled while packets remain
        assert!(ral::read_reg!(ral::hc, hc, HCCHAR, CHENA == 1));

        let events = channel_event(&mut host, regs, ch, ChannelInterrupt::TRANSFER_COMPLETE);
        assert!(!events.channel(ch));
        assert!(ral::read_reg!(ral::hc, hc, HCCHAR, CHDIS == 1));
        assert_eq!(host.status(ch), ChannelStatus::Transferring);

        let events = channel_event(&mut host, regs, ch, halted());
        assert!(events.channel(ch));
        assert_eq!(host.status(ch), ChannelStatus::Complete);
        let mut buf = [0; 128];
        assert_eq!(host.read(ch, &mut buf), Ok(100));
        assert_eq!(&buf[..100], &data[..]);
        assert!(!host.data_toggle(ch));
    }

    #[test]
    fn packets_for_idle_channels_are_dropped() {
        let (mut host, regs) = host(Config::full_speed());
        let ch = channel(&mut host, UsbDirection::In, EndpointType::Bulk, 64, 64);
        receive(&mut host, regs, ch, &[1; 8]);
        assert_eq!(host.transferred(ch), 0);
        assert!(!host.data_toggle(ch));
    }

    #[test]
    fn in_nak_polls_again() {
        let (mut host, regs) = host(Config::full_speed());
        let ch = channel(&mut host, UsbDirection::In, EndpointType::Bulk, 64, 64);
        host.start_transfer(ch, 64).unwrap();
        let hc = &regs.hc[ch];
        ral::modify_reg!(ral::hc, hc, HCCHAR, CHENA: 0);
        let events = channel_event(&mut host, regs, ch, ChannelInterrupt::NAK);
        assert!(events.is_empty());
        assert!(ral::read_reg!(ral::hc, hc, HCCHAR, CHENA == 1));
        assert!(ral::read_reg!(ral::hc, hc, HCCHAR, CHDIS == 0));
        assert_eq!(host.status(ch), ChannelStatus::Transferring);
    }

    #[test]
    fn interrupt_in_nak_is_reported() {
        let (mut host, regs) = host(Config::full_speed());
        let ch = channel(&mut host, UsbDirection::In, EndpointType::Interrupt, 8, 8);
        host.start_transfer(ch, 8).unwrap();
        channel_event(&mut host, regs, ch, ChannelInterrupt::NAK);
        assert!(ral::read_reg!(ral::hc, &regs.hc[ch], HCCHAR, CHDIS == 1));
        let events = channel_event(&mut host, regs, ch, halted());
        assert!(events.channel(ch));
        assert_eq!(host.status(ch), ChannelStatus::Nak);
        // Poll again next interval
        host.start_transfer(ch, 8).unwrap();
    }

    #[test]
    fn stall_is_reported() {
        let (mut host, regs) = host(Config::full_speed());
        let ch = channel(&mut host, UsbDirection::In, EndpointType::Bulk, 64, 64);
        host.start_transfer(ch, 64).unwrap();
        let events = channel_event(&mut host, regs, ch, ChannelInterrupt::STALL | halted());
        assert!(events.channel(ch));
        assert_eq!(host.status(ch), ChannelStatus::Stall);
    }

    #[test]
    fn transaction_errors_retry_up_to_the_limit() {
        let (mut host, regs) = host(Config::full_speed().with_retry_limit(3));
        let ch = channel(&mut host, UsbDirection::In, EndpointType::Bulk, 64, 64);
        host.start_transfer(ch, 64).unwrap();
        let error = ChannelInterrupt::TRANSACTION_ERROR | halted();

        for count in 1..3 {
            let events = channel_event(&mut host, regs, ch, error);
            assert!(!events.channel(ch));
            assert_eq!(host.error_count(ch), count);
            assert_eq!(host.status(ch), ChannelStatus::Transferring);
            assert!(ral::read_reg!(ral::hc, &regs.hc[ch], HCCHAR, CHENA == 1));
            assert!(ral::read_reg!(ral::hc, &regs.hc[ch], HCCHAR, CHDIS == 0));
        }
        let events = channel_event(&mut host, regs, ch, error);
        assert!(events.channel(ch));
        assert_eq!(host.status(ch), ChannelStatus::Error(ChannelError::Transaction));
        assert_eq!(host.error_count(ch), 3);

        host.start_transfer(ch, 64).unwrap();
        assert_eq!(host.error_count(ch), 0);
    }

    #[test]
    fn progress_resets_the_error_count() {
        let (mut host, regs) = host(Config::full_speed().with_retry_limit(3));
        let ch = channel(&mut host, UsbDirection::In, EndpointType::Bulk, 64, 64);
        host.start_transfer(ch, 64).unwrap();
        let error = ChannelInterrupt::TRANSACTION_ERROR | halted();

        channel_event(&mut host, regs, ch, error);
        channel_event(&mut host, regs, ch, error);
        assert_eq!(host.error_count(ch), 2);

        // The device answered, so the next error is the first in a row
        channel_event(&mut host, regs, ch, ChannelInterrupt::NAK);
        assert_eq!(host.error_count(ch), 0);
        let events = channel_event(&mut host, regs, ch, error);
        assert!(!events.channel(ch));
        assert_eq!(host.error_count(ch), 1);
        assert_eq!(host.status(ch), ChannelStatus::Transferring);
    }

    #[test]
    fn babble_is_not_retried() {
        let (mut host, regs) = host(Config::full_speed());
        let ch = channel(&mut host, UsbDirection::In, EndpointType::Bulk, 64, 64);
        host.start_transfer(ch, 64).unwrap();
        let events = channel_event(&mut host, regs, ch, ChannelInterrupt::BABBLE | halted());
        assert!(events.channel(ch));
        assert_eq!(host.status(ch), ChannelStatus::Error(ChannelError::Babble));
    }

    #[test]
    fn halt_is_reported_once_the_channel_stops() {
        let (mut host, regs) = host(Config::full_speed());
        let ch = channel(&mut host, UsbDirection::In, EndpointType::Bulk, 64, 64);
        host.start_transfer(ch, 64).unwrap();
        ral::write_reg!(ral::otg, regs, GNPTXSTS, NPTXFSAV: 256, NPTQXSAV: 0);
        assert!(host.halt(ch).is_err());

        // A later pass issues the disable once a slot frees up
        dispatch(&mut host, regs, Interrupts::SOF);
        assert!(ral::read_reg!(ral::hc, &regs.hc[ch], HCCHAR, CHDIS == 0));
        ral::write_reg!(ral::otg, regs, GNPTXSTS, NPTXFSAV: 256, NPTQXSAV: 1);
        dispatch(&mut host, regs, Interrupts::SOF);
        assert!(ral::read_reg!(ral::hc, &regs.hc[ch], HCCHAR, CHDIS == 1));
        assert_eq!(host.status(ch), ChannelStatus::Transferring);

        let events = channel_event(&mut host, regs, ch, halted());
        assert!(events.channel(ch));
        assert_eq!(host.status(ch), ChannelStatus::Halted);
    }

    #[test]
    fn out_data_follows_fifo_space() {
        let (mut host, regs) = host(Config::full_speed());
        ral::write_reg!(ral::otg, regs, GNPTXSTS, NPTXFSAV: 4, NPTQXSAV: 8);
        let ch = channel(&mut host, UsbDirection::Out, EndpointType::Bulk, 64, 64);
        host.write(ch, &[0x5A; 64]).unwrap();
        assert_eq!(regs.fifo[ch][0].read(), 0);

        ral::write_reg!(ral::otg, regs, GNPTXSTS, NPTXFSAV: 96, NPTQXSAV: 8);
        regs.GINTSTS.write((Interrupts::NP_TX_FIFO_EMPTY | Interrupts::CURRENT_MODE).bits());
        host.on_interrupt();
        assert_eq!(regs.fifo[ch][0].read(), 0x5A5A_5A5A);
        let mask = Interrupts::from_bits_truncate(regs.GINTMSK.read());
        assert!(!mask.contains(Interrupts::NP_TX_FIFO_EMPTY));

        channel_event(&mut host, regs, ch, ChannelInterrupt::ACK | ChannelInterrupt::TRANSFER_COMPLETE);
        let events = channel_event(&mut host, regs, ch, halted());
        assert!(events.channel(ch));
        assert_eq!(host.status(ch), ChannelStatus::Complete);
        assert_eq!(host.transferred(ch), 64);
        assert!(host.data_toggle(ch));
    }

    #[test]
    fn long_out_transfer_runs_in_chunks() {
        let (mut host, regs) = host(Config::full_speed());
        let ch = channel(&mut host, UsbDirection::Out, EndpointType::Bulk, 8, 2056);
        host.start_transfer(ch, 2056).unwrap();
        assert!(ral::read_reg!(ral::hc, &regs.hc[ch], HCTSIZ, PKTCNT == 256));

        let events = channel_event(&mut host, regs, ch, ChannelInterrupt::TRANSFER_COMPLETE | halted());
        assert!(!events.channel(ch));
        assert_eq!(host.transferred(ch), 2048);
        let hc = &regs.hc[ch];
        assert!(ral::read_reg!(ral::hc, hc, HCTSIZ, PKTCNT == 1));
        assert!(ral::read_reg!(ral::hc, hc, HCTSIZ, XFRSIZ == 8));
        assert!(ral::read_reg!(ral::hc, hc, HCTSIZ, DPID == DATA0));

        let events = channel_event(&mut host, regs, ch, ChannelInterrupt::TRANSFER_COMPLETE | halted());
        assert!(events.channel(ch));
        assert_eq!(host.status(ch), ChannelStatus::Complete);
        assert_eq!(host.transferred(ch), 2056);
        assert!(host.data_toggle(ch));
    }

    #[test]
    fn nyet_switches_to_ping() {
        let (mut host, regs) = host(Config::high_speed_ulpi());
        let ch = host.alloc_channel().unwrap();
        let endpoint = EndpointAddress::from_parts(2, UsbDirection::Out);
        let config = ChannelConfig::new(5, endpoint, EndpointType::Bulk, 512)
            .with_speed(crate::config::Speed::High)
            .with_buffer_len(1024);
        host.init_channel(ch, config).unwrap();
        host.write(ch, &[7; 1024]).unwrap();
        let hc = &regs.hc[ch];
        assert!(ral::read_reg!(ral::hc, hc, HCTSIZ, DOPNG == 0));

        // The first packet landed, the device isn't ready for the next
        channel_event(&mut host, regs, ch, ChannelInterrupt::NYET);
        ral::write_reg!(ral::hc, hc, HCTSIZ, PKTCNT: 1);
        let events = channel_event(&mut host, regs, ch, halted());
        assert!(!events.channel(ch));
        assert_eq!(host.transferred(ch), 512);
        assert!(ral::read_reg!(ral::hc, hc, HCTSIZ, DOPNG == 1));
        assert!(ral::read_reg!(ral::hc, hc, HCTSIZ, XFRSIZ == 512));
        assert!(ral::read_reg!(ral::hc, hc, HCTSIZ, DPID == DATA1));

        channel_event(&mut host, regs, ch, ChannelInterrupt::ACK | ChannelInterrupt::TRANSFER_COMPLETE);
        let events = channel_event(&mut host, regs, ch, halted());
        assert!(events.channel(ch));
        assert_eq!(host.transferred(ch), 1024);
        assert_eq!(host.status(ch), ChannelStatus::Complete);
    }

    #[test]
    fn disconnect_fails_transfers_in_flight() {
        let (mut host, regs) = host(Config::full_speed());
        let busy = channel(&mut host, UsbDirection::In, EndpointType::Bulk, 64, 64);
        let idle = channel(&mut host, UsbDirection::In, EndpointType::Bulk, 64, 64);
        host.start_transfer(busy, 64).unwrap();
        let events = dispatch(&mut host, regs, Interrupts::DISCONNECT);
        assert!(events.port.contains(PortEvents::DISCONNECTED));
        assert!(events.channel(busy));
        assert!(!events.channel(idle));
        assert_eq!(host.status(busy), ChannelStatus::Error(ChannelError::Disconnected));
        assert_eq!(host.status(idle), ChannelStatus::Idle);

        // A late halt doesn't change the outcome
        let events = channel_event(&mut host, regs, busy, halted());
        assert!(!events.channel(busy));
    }
}
