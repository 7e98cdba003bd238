//! Device interrupt dispatch

use super::{
    endpoint::ep0_mps_code, ControlAction, Device, EndpointState, InEndpointInterrupt,
    OutEndpointInterrupt, STAGING_LEN,
};
use crate::{
    class::{Class, ControlResponse},
    config::Speed,
    fifo::{DevicePacket, DeviceStatus},
    ral,
    setup::SetupPacket,
    usbcore::{Interrupts, Mode, Spin},
};
use usb_device::{
    endpoint::{EndpointAddress, EndpointType},
    UsbDirection,
};

impl Device {
    /// Service every pending device interrupt
    ///
    /// Call this from the OTG interrupt handler, or poll it. Sources are
    /// handled in a fixed order, and each handler acknowledges its own
    /// source. Work that's left over, like a transfer that needs more FIFO
    /// space, raises the interrupt again. This never blocks.
    pub fn on_interrupt<C: Class>(&mut self, class: &mut C) {
        if self.core.mode() != Mode::Device {
            return;
        }
        let regs = self.core.regs();
        let pending = self.core.pending();

        if pending.contains(Interrupts::OUT_ENDPOINT) {
            self.out_endpoints(class);
        }
        if pending.contains(Interrupts::IN_ENDPOINT) {
            self.in_endpoints(class);
        }
        if pending.contains(Interrupts::MODE_MISMATCH) {
            warn!("Register access in the wrong mode");
            self.core.clear(Interrupts::MODE_MISMATCH);
        }
        if pending.contains(Interrupts::WAKEUP) {
            ral::modify_reg!(ral::otg, regs, DCTL, RWUSIG: 0);
            if self.core.config().low_power {
                ral::modify_reg!(ral::otg, regs, PCGCCTL, STPPCLK: 0, GATEHCLK: 0);
            }
            self.core.clear(Interrupts::WAKEUP);
            debug!("Resumed");
            class.resumed(self);
        }
        if pending.contains(Interrupts::SUSPEND) {
            let suspended = ral::read_reg!(ral::otg, regs, DSTS, SUSPSTS == 1);
            if suspended && self.core.config().low_power {
                ral::modify_reg!(ral::otg, regs, PCGCCTL, STPPCLK: 1);
            }
            self.core.clear(Interrupts::SUSPEND);
            if suspended {
                debug!("Suspended");
                class.suspended(self);
            }
        }
        if pending.contains(Interrupts::SOF) {
            self.core.clear(Interrupts::SOF);
            class.sof(self);
        }
        if pending.contains(Interrupts::RX_FIFO_LEVEL) {
            self.receive_fifo();
        }
        if pending.contains(Interrupts::RESET) {
            self.bus_reset();
            self.core.clear(Interrupts::RESET);
        }
        if pending.contains(Interrupts::ENUM_DONE) {
            self.enumeration_done();
            self.core.clear(Interrupts::ENUM_DONE);
            let speed = self.speed;
            class.device_reset(self, speed);
        }
        if pending.contains(Interrupts::INCOMPLETE_ISO_IN) {
            self.core.clear(Interrupts::INCOMPLETE_ISO_IN);
            class.iso_in_incomplete(self);
        }
        if pending.contains(Interrupts::INCOMPLETE_ISO_OUT) {
            self.core.clear(Interrupts::INCOMPLETE_ISO_OUT);
            class.iso_out_incomplete(self);
        }
        if pending.contains(Interrupts::SESSION_REQUEST) {
            self.core.clear(Interrupts::SESSION_REQUEST);
            class.connected(self);
        }
        if pending.contains(Interrupts::OTG) {
            let gotgint = ral::read_reg!(ral::otg, regs, GOTGINT);
            ral::write_reg!(ral::otg, regs, GOTGINT, gotgint);
            if gotgint & ral::otg::GOTGINT::SEDET::mask != 0 {
                class.disconnected(self);
            }
        }
    }

    /// OUT endpoint events, in ascending endpoint order
    fn out_endpoints<C: Class>(&mut self, class: &mut C) {
        let regs = self.core.regs();
        let daint = ral::read_reg!(ral::otg, regs, DAINT, OEPINT)
            & ral::read_reg!(ral::otg, regs, DAINTMSK, OEPM);
        let enabled = OutEndpointInterrupt::from_bits_truncate(ral::read_reg!(ral::otg, regs, DOEPMSK));

        for n in 0..self.core.config().endpoint_count() {
            if daint & (1 << n) == 0 {
                continue;
            }
            let outep = &regs.outep[n];
            let status =
                OutEndpointInterrupt::from_bits_truncate(ral::read_reg!(ral::outep, outep, DOEPINT));
            let raised = status & enabled;

            if raised.contains(OutEndpointInterrupt::TRANSFER_COMPLETE) {
                ral::write_reg!(ral::outep, outep, DOEPINT, OutEndpointInterrupt::TRANSFER_COMPLETE.bits());
                self.out_complete(n, class);
            }
            if n == 0 && raised.contains(OutEndpointInterrupt::SETUP_DONE) {
                ral::write_reg!(ral::outep, outep, DOEPINT, OutEndpointInterrupt::SETUP_DONE.bits());
                self.setup_stage(class);
            }
            let other = status
                & (OutEndpointInterrupt::DISABLED
                    | OutEndpointInterrupt::TOKEN_WHILE_DISABLED
                    | OutEndpointInterrupt::STATUS_PHASE_RECEIVED);
            if !other.is_empty() {
                ral::write_reg!(ral::outep, outep, DOEPINT, other.bits());
            }
        }
    }

    /// IN endpoint events, in ascending endpoint order
    fn in_endpoints<C: Class>(&mut self, class: &mut C) {
        let regs = self.core.regs();
        let daint = ral::read_reg!(ral::otg, regs, DAINT, IEPINT)
            & ral::read_reg!(ral::otg, regs, DAINTMSK, IEPM);
        let diepmsk = ral::read_reg!(ral::otg, regs, DIEPMSK);
        let empty = ral::read_reg!(ral::otg, regs, DIEPEMPMSK, INEPTXFEM);

        for n in 0..self.core.config().endpoint_count() {
            if daint & (1 << n) == 0 {
                continue;
            }
            let mut enabled = InEndpointInterrupt::from_bits_truncate(diepmsk);
            if empty & (1 << n) != 0 {
                enabled |= InEndpointInterrupt::TX_FIFO_EMPTY;
            }
            let inep = &regs.inep[n];
            let status =
                InEndpointInterrupt::from_bits_truncate(ral::read_reg!(ral::inep, inep, DIEPINT));
            let raised = status & enabled;

            if raised.contains(InEndpointInterrupt::TRANSFER_COMPLETE) {
                ral::modify_reg!(ral::otg, regs, DIEPEMPMSK, |empmsk| empmsk & !(1 << n));
                ral::write_reg!(ral::inep, inep, DIEPINT, InEndpointInterrupt::TRANSFER_COMPLETE.bits());
                self.in_complete(n, class);
            }
            let other = status
                & (InEndpointInterrupt::TIMEOUT
                    | InEndpointInterrupt::DISABLED
                    | InEndpointInterrupt::TOKEN_FIFO_EMPTY
                    | InEndpointInterrupt::NAK_EFFECTIVE);
            if !other.is_empty() {
                ral::write_reg!(ral::inep, inep, DIEPINT, other.bits());
            }
            if raised.contains(InEndpointInterrupt::TX_FIFO_EMPTY) {
                self.fill_tx_fifo(n);
            }
        }
    }

    fn in_complete<C: Class>(&mut self, n: usize, class: &mut C) {
        let ep = &mut self.ep_in[n];
        if ep.state != EndpointState::Transferring {
            return;
        }
        ep.state = EndpointState::Idle;
        ep.xfer_count = ep.xfer_len;
        if n == 0 {
            let action = self.control.in_complete();
            self.run_control(action, class);
        } else {
            class.data_in(self, EndpointAddress::from_parts(n, UsbDirection::In));
        }
    }

    fn out_complete<C: Class>(&mut self, n: usize, class: &mut C) {
        let regs = self.core.regs();
        let dma = self.core.config().dma;
        let ep = &mut self.ep_out[n];
        if ep.state != EndpointState::Transferring {
            return;
        }
        if dma {
            let remaining = ral::read_reg!(ral::outep, &regs.outep[n], DOEPTSIZ, XFRSIZ) as usize;
            ep.xfer_count = ep.programmed.saturating_sub(remaining);
        }
        ep.state = EndpointState::Idle;
        let count = ep.xfer_count;
        trace!("OUT {} complete, {} bytes", n, count);
        if n == 0 {
            let action = self.control.out_complete(count);
            self.run_control(action, class);
        } else {
            class.data_out(self, EndpointAddress::from_parts(n, UsbDirection::Out), count);
        }
    }

    /// Pop one status word and the packet it describes
    fn receive_fifo(&mut self) {
        self.core.mask(Interrupts::RX_FIFO_LEVEL);
        let status = DeviceStatus::from_bits(self.core.pop_status());
        match status.kind {
            DevicePacket::OutData => self.receive_packet(status.number, status.byte_count),
            DevicePacket::SetupData if status.byte_count == 8 => {
                self.core.read_packet(&mut self.setup_bytes);
            }
            DevicePacket::SetupData => {
                warn!("SETUP packet of {} bytes", status.byte_count);
                self.core.discard_packet(status.byte_count);
            }
            DevicePacket::GlobalOutNak | DevicePacket::OutComplete | DevicePacket::SetupComplete => {}
            DevicePacket::Reserved(code) => {
                warn!("Unexpected receive status {}", code);
                self.core.discard_packet(status.byte_count);
            }
        }
        self.core.unmask(Interrupts::RX_FIFO_LEVEL);
    }

    /// Copy an OUT packet from the receive FIFO into endpoint `n`'s buffer
    fn receive_packet(&mut self, n: usize, len: usize) {
        if len == 0 {
            return;
        }
        let ep = match self.ep_out.get_mut(n) {
            Some(ep) if ep.state == EndpointState::Transferring => ep,
            _ => {
                warn!("Dropped {} bytes for OUT {}", len, n);
                self.core.discard_packet(len);
                return;
            }
        };
        let Some(buffer) = ep.buffer.as_mut() else {
            self.core.discard_packet(len);
            return;
        };
        let start = ep.base + ep.xfer_count;
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
            warn!("OUT {} overran its buffer by {} bytes", n, len - stored);
        }
        ep.xfer_count += stored;
    }

    /// A SETUP packet is complete; ask the class what to do with it
    fn setup_stage<C: Class>(&mut self, class: &mut C) {
        if self.core.config().dma {
            let regs = self.core.regs();
            let left = ral::read_reg!(ral::outep, &regs.outep[0], DOEPTSIZ, STUPCNT) as usize;
            let last = 2usize.saturating_sub(left);
            if let Some(buffer) = &self.ep_out[0].buffer {
                buffer.clean_invalidate_dcache(3 * 8);
                buffer.volatile_read(last * 8, &mut self.setup_bytes);
            }
        }
        let setup = SetupPacket::parse(&self.setup_bytes);
        trace!("SETUP {:?}", setup);

        self.control.setup_received(setup);
        for ep in [&mut self.ep_in[0], &mut self.ep_out[0]] {
            ep.drop_transfer();
            ep.stalled = false;
        }

        let action = match class.setup(self, &setup) {
            ControlResponse::Reject => self.control.reject(),
            ControlResponse::DataIn(data) if setup.direction() == UsbDirection::In => {
                match self.stage_control_in(data, usize::from(setup.length)) {
                    Some(len) => self.control.start_data_in(len),
                    None => self.control.reject(),
                }
            }
            ControlResponse::DataIn(_) => {
                warn!("IN data for an OUT request");
                self.control.reject()
            }
            ControlResponse::Accept if setup.has_out_data() => {
                let room = self.ep_out[0].buffer.as_ref().map_or(0, |buffer| buffer.len());
                if usize::from(setup.length) > room {
                    warn!("Control OUT of {} bytes exceeds the EP0 buffer", setup.length);
                    self.control.reject()
                } else {
                    self.control.start_data_out()
                }
            }
            ControlResponse::Accept if setup.direction() == UsbDirection::In && setup.length > 0 => {
                self.control.start_data_in(0)
            }
            ControlResponse::Accept => self.control.no_data(),
        };
        self.run_control(action, class);
    }

    /// Carry out control actions until one needs the hardware
    fn run_control<C: Class>(&mut self, mut action: ControlAction, class: &mut C) {
        loop {
            let result = match action {
                ControlAction::SendIn { offset, len } => self.start_control_in(offset, len),
                ControlAction::ReceiveOut { offset, len } => self.start_control_out(offset, len),
                ControlAction::SendStatus => self.start_control_in(0, 0),
                ControlAction::ReceiveStatus => self.start_control_out(0, 0),
                ControlAction::DataOutDone => {
                    let setup = *self.control.setup();
                    let accepted = class.control_out(self, &setup);
                    action = self.control.finish_data_out(accepted);
                    continue;
                }
                ControlAction::Complete => {
                    let setup = *self.control.setup();
                    self.ep0_out_start();
                    class.control_complete(self, &setup);
                    Ok(())
                }
                ControlAction::Stall => {
                    self.stall_control();
                    Ok(())
                }
                ControlAction::None => Ok(()),
            };
            if let Err(err) = result {
                warn!("EP0 transfer failed: {:?}", err);
                self.stall_control();
            }
            return;
        }
    }

    /// Protocol stall on both EP0 directions
    ///
    /// The core clears it on the next SETUP.
    fn stall_control(&mut self) {
        self.control.reject();
        for direction in [UsbDirection::In, UsbDirection::Out] {
            if self.set_stall(EndpointAddress::from_parts(0, direction)).is_err() {
                warn!("Failed to stall EP0");
            }
        }
        self.ep0_out_start();
    }

    /// USB bus reset
    fn bus_reset(&mut self) {
        let regs = self.core.regs();
        ral::modify_reg!(ral::otg, regs, DCTL, RWUSIG: 0);
        if self.core.flush_tx_fifo(0, &mut Spin).is_err() {
            warn!("TX FIFO 0 flush timed out");
        }

        for n in 0..self.core.config().endpoint_count() {
            let inep = &regs.inep[n];
            ral::write_reg!(ral::inep, inep, DIEPINT, 0xFB7F);
            ral::modify_reg!(ral::inep, inep, DIEPCTL, STALL: 0, SNAK: 1);
            let outep = &regs.outep[n];
            ral::write_reg!(ral::outep, outep, DOEPINT, 0xFB7F);
            ral::modify_reg!(ral::outep, outep, DOEPCTL, STALL: 0, SNAK: 1);
            if n > 0 {
                ral::modify_reg!(ral::inep, inep, DIEPCTL, USBAEP: 0);
                ral::modify_reg!(ral::outep, outep, DOEPCTL, USBAEP: 0);
            }
        }
        ral::write_reg!(ral::otg, regs, DAINT, u32::MAX);
        ral::write_reg!(ral::otg, regs, DAINTMSK, IEPM: 1, OEPM: 1);
        ral::write_reg!(
            ral::otg,
            regs,
            DOEPMSK,
            (OutEndpointInterrupt::SETUP_DONE
                | OutEndpointInterrupt::TRANSFER_COMPLETE
                | OutEndpointInterrupt::DISABLED)
                .bits()
        );
        ral::write_reg!(
            ral::otg,
            regs,
            DIEPMSK,
            (InEndpointInterrupt::TRANSFER_COMPLETE
                | InEndpointInterrupt::TIMEOUT
                | InEndpointInterrupt::DISABLED)
                .bits()
        );
        ral::write_reg!(ral::otg, regs, DIEPEMPMSK, 0);
        ral::modify_reg!(ral::otg, regs, DCFG, DAD: 0);

        self.release_endpoints();
        self.control.reset();
        self.ep0_out_start();
        debug!("USB bus reset");
    }

    /// Speed is known; size EP0 for it
    fn enumeration_done(&mut self) {
        let regs = self.core.regs();
        let speed = match ral::read_reg!(ral::otg, regs, DSTS, ENUMSPD) {
            ral::otg::DSTS::ENUMSPD::RW::HIGH => Speed::High,
            ral::otg::DSTS::ENUMSPD::RW::LOW => Speed::Low,
            _ => Speed::Full,
        };
        let max_packet = if speed == Speed::Low { 8 } else { 64 };
        self.speed = speed;

        ral::modify_reg!(ral::inep, &regs.inep[0], DIEPCTL, MPSIZ: ep0_mps_code(max_packet), USBAEP: 1);
        ral::modify_reg!(ral::outep, &regs.outep[0], DOEPCTL, USBAEP: 1);
        for ep in [&mut self.ep_in[0], &mut self.ep_out[0]] {
            ep.kind = EndpointType::Control;
            ep.max_packet = max_packet;
            if ep.state == EndpointState::Inactive {
                ep.state = EndpointState::Idle;
            }
        }
        self.control.set_max_packet(max_packet);

        ral::modify_reg!(ral::otg, regs, DCTL, CGINAK: 1);
        let trdt = if speed == Speed::High { 9 } else { 6 };
        ral::modify_reg!(ral::otg, regs, GUSBCFG, TRDT: trdt);
        debug!("Enumerated, {:?} speed", speed);
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::super::{ControlPhase, Device, EndpointState, OutEndpointInterrupt};
    use crate::{
        class::{Class, ControlResponse},
        config::{Config, Speed},
        ral::{self, RegisterBlock},
        setup::SetupPacket,
        testing,
        usbcore::{Interrupts, UsbCore},
    };
    use std::vec::Vec;
    use usb_device::{
        control::Request,
        endpoint::{EndpointAddress, EndpointType},
        UsbDirection,
    };

    const DEVICE_DESCRIPTOR: [u8; 18] = [
        18, 1, 0x00, 0x02, 0, 0, 0, 64, 0x09, 0x12, 0x01, 0x00, 0x00, 0x01, 1, 2, 3, 1,
    ];

    /// Larger than the default EP0 buffer
    static LARGE: [u8; 300] = [0xEE; 300];

    #[derive(Debug, PartialEq)]
    enum Event {
        Reset(Speed),
        Setup(SetupPacket),
        ControlOut(usize),
        Complete(u8),
        DataIn(usize),
        DataOut(usize, usize),
        Sof,
        Suspended,
        Resumed,
    }

    #[derive(Default)]
    struct Recorder {
        events: Vec<Event>,
        descriptor: [u8; 18],
    }

    impl Class for Recorder {
        fn device_reset(&mut self, _: &mut Device, speed: Speed) {
            self.events.push(Event::Reset(speed));
        }

        fn setup<'a>(&'a mut self, _: &mut Device, setup: &SetupPacket) -> ControlResponse<'a> {
            self.events.push(Event::Setup(*setup));
            match setup.request {
                Request::GET_DESCRIPTOR => {
                    self.descriptor = DEVICE_DESCRIPTOR;
                    ControlResponse::DataIn(&self.descriptor)
                }
                0x30 => ControlResponse::DataIn(&LARGE),
                0xFF => ControlResponse::Reject,
                _ => ControlResponse::Accept,
            }
        }

        fn control_out(&mut self, device: &mut Device, _: &SetupPacket) -> bool {
            let mut data = [0; 64];
            self.events.push(Event::ControlOut(device.control_data(&mut data)));
            true
        }

        fn control_complete(&mut self, _: &mut Device, setup: &SetupPacket) {
            self.events.push(Event::Complete(setup.request));
        }

        fn data_in(&mut self, _: &mut Device, endpoint: EndpointAddress) {
            self.events.push(Event::DataIn(endpoint.index()));
        }

        fn data_out(&mut self, _: &mut Device, endpoint: EndpointAddress, len: usize) {
            self.events.push(Event::DataOut(endpoint.index(), len));
        }

        fn sof(&mut self, _: &mut Device) {
            self.events.push(Event::Sof);
        }

        fn suspended(&mut self, _: &mut Device) {
            self.events.push(Event::Suspended);
        }

        fn resumed(&mut self, _: &mut Device) {
            self.events.push(Event::Resumed);
        }
    }

    fn device(config: Config) -> (Device, &'static RegisterBlock) {
        let (instance, regs) = testing::instance();
        let core = UsbCore::new(instance, config);
        let mut device = Device::new(core, testing::memory::<4096>()).unwrap();
        device.initialize(&mut testing::Delay::new(regs)).unwrap();
        (device, regs)
    }

    fn dispatch(device: &mut Device, regs: &RegisterBlock, class: &mut Recorder, raised: Interrupts) {
        testing::raise(regs, raised);
        device.on_interrupt(class);
        testing::clear_latched(regs);
    }

    /// Bus reset and full speed enumeration
    fn enumerate(device: &mut Device, regs: &RegisterBlock, class: &mut Recorder) {
        dispatch(device, regs, class, Interrupts::RESET);
        ral::write_reg!(ral::otg, regs, DSTS, ENUMSPD: FULL);
        dispatch(device, regs, class, Interrupts::ENUM_DONE);
    }

    fn receive(regs: &RegisterBlock, endpoint: u32, kind: u32, data: &[u8]) {
        ral::write_reg!(ral::otg, regs, GRXSTSP, EPNUM: endpoint, BCNT: data.len() as u32, PKTSTS: kind);
        for (slot, chunk) in regs.fifo[0].iter().zip(data.chunks(4)) {
            let mut word = [0; 4];
            word[..chunk.len()].copy_from_slice(chunk);
            slot.write(u32::from_le_bytes(word));
        }
    }

    fn setup(device: &mut Device, regs: &RegisterBlock, class: &mut Recorder, bytes: [u8; 8]) {
        receive(regs, 0, 6, &bytes);
        dispatch(device, regs, class, Interrupts::RX_FIFO_LEVEL);
        regs.outep[0].DOEPINT.write(OutEndpointInterrupt::SETUP_DONE.bits());
        ral::write_reg!(ral::otg, regs, DAINT, OEPINT: 1);
        dispatch(device, regs, class, Interrupts::OUT_ENDPOINT);
    }

    fn in_complete(device: &mut Device, regs: &RegisterBlock, class: &mut Recorder, n: usize) {
        regs.inep[n].DIEPINT.write(1);
        ral::write_reg!(ral::otg, regs, DAINT, IEPINT: 1 << n);
        dispatch(device, regs, class, Interrupts::IN_ENDPOINT);
    }

    fn out_complete(device: &mut Device, regs: &RegisterBlock, class: &mut Recorder, n: usize) {
        regs.outep[n].DOEPINT.write(1);
        ral::write_reg!(ral::otg, regs, DAINT, OEPINT: 1 << n);
        dispatch(device, regs, class, Interrupts::OUT_ENDPOINT);
    }

    #[test]
    fn reset_and_enumeration() {
        let (mut device, regs) = device(Config::full_speed());
        let mut class = Recorder::default();
        device.set_address(12);
        enumerate(&mut device, regs, &mut class);

        assert_eq!(class.events, [Event::Reset(Speed::Full)]);
        assert_eq!(device.address(), 0);
        assert_eq!(regs.DAINTMSK.read(), 0x1_0001);
        assert!(ral::read_reg!(ral::outep, &regs.outep[0], DOEPTSIZ, STUPCNT == 3));
        assert!(ral::read_reg!(ral::inep, &regs.inep[0], DIEPCTL, MPSIZ == 0));
        assert!(ral::read_reg!(ral::otg, regs, GUSBCFG, TRDT == 6));
        assert_eq!(device.control_phase(), ControlPhase::Idle);
    }

    #[test]
    fn get_device_descriptor() {
        let (mut device, regs) = device(Config::full_speed());
        let mut class = Recorder::default();
        enumerate(&mut device, regs, &mut class);

        setup(&mut device, regs, &mut class, [0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x12, 0x00]);
        assert_eq!(device.control_phase(), ControlPhase::DataIn);
        let inep = &regs.inep[0];
        assert!(ral::read_reg!(ral::inep, inep, DIEPTSIZ, PKTCNT == 1));
        assert!(ral::read_reg!(ral::inep, inep, DIEPTSIZ, XFRSIZ == 18));
        assert!(ral::read_reg!(ral::inep, inep, DIEPCTL, EPENA == 1));
        // No FIFO space yet
        assert_eq!(regs.DIEPEMPMSK.read(), 1);

        ral::write_reg!(ral::inep, inep, DTXFSTS, INEPTFSAV: 64);
        ral::write_reg!(ral::inep, inep, DIEPINT, 1 << 7);
        ral::write_reg!(ral::otg, regs, DAINT, IEPINT: 1);
        dispatch(&mut device, regs, &mut class, Interrupts::IN_ENDPOINT);
        assert_eq!(regs.DIEPEMPMSK.read(), 0);
        assert_eq!(regs.fifo[0][0].read().to_le_bytes(), DEVICE_DESCRIPTOR[..4]);

        in_complete(&mut device, regs, &mut class, 0);
        assert_eq!(device.control_phase(), ControlPhase::StatusOut);
        assert!(ral::read_reg!(ral::outep, &regs.outep[0], DOEPCTL, EPENA == 1));

        out_complete(&mut device, regs, &mut class, 0);
        assert_eq!(device.control_phase(), ControlPhase::Idle);
        assert_eq!(class.events.last(), Some(&Event::Complete(Request::GET_DESCRIPTOR)));
    }

    #[test]
    fn in_request_for_zero_bytes_ends_with_status_in() {
        let (mut device, regs) = device(Config::full_speed());
        let mut class = Recorder::default();
        enumerate(&mut device, regs, &mut class);

        // The class has a descriptor to send, but the host asked for none
        setup(&mut device, regs, &mut class, [0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00]);
        assert_eq!(device.control_phase(), ControlPhase::StatusIn);
        let inep = &regs.inep[0];
        assert!(ral::read_reg!(ral::inep, inep, DIEPTSIZ, XFRSIZ == 0));
        assert!(ral::read_reg!(ral::inep, inep, DIEPTSIZ, PKTCNT == 1));
        assert!(ral::read_reg!(ral::inep, inep, DIEPCTL, EPENA == 1));

        in_complete(&mut device, regs, &mut class, 0);
        assert_eq!(device.control_phase(), ControlPhase::Idle);
        assert_eq!(class.events.last(), Some(&Event::Complete(Request::GET_DESCRIPTOR)));

        // Accepted with nothing to send, the same way
        setup(&mut device, regs, &mut class, [0xC0, 0x01, 0, 0, 0, 0, 0, 0]);
        assert_eq!(device.control_phase(), ControlPhase::StatusIn);
        in_complete(&mut device, regs, &mut class, 0);
        assert_eq!(device.control_phase(), ControlPhase::Idle);
        assert_eq!(class.events.last(), Some(&Event::Complete(0x01)));
    }

    #[test]
    fn control_write_with_data() {
        let (mut device, regs) = device(Config::full_speed());
        let mut class = Recorder::default();
        enumerate(&mut device, regs, &mut class);

        setup(&mut device, regs, &mut class, [0x21, 0x09, 0x00, 0x02, 0x00, 0x00, 70, 0]);
        assert_eq!(device.control_phase(), ControlPhase::DataOut);
        assert!(ral::read_reg!(ral::outep, &regs.outep[0], DOEPTSIZ, PKTCNT == 1));

        receive(regs, 0, 2, &[0xA5; 64]);
        dispatch(&mut device, regs, &mut class, Interrupts::RX_FIFO_LEVEL);
        out_complete(&mut device, regs, &mut class, 0);
        assert_eq!(device.control_phase(), ControlPhase::DataOut);

        receive(regs, 0, 2, &[0x5A; 6]);
        dispatch(&mut device, regs, &mut class, Interrupts::RX_FIFO_LEVEL);
        out_complete(&mut device, regs, &mut class, 0);
        assert_eq!(device.control_phase(), ControlPhase::StatusIn);
        assert!(ral::read_reg!(ral::inep, &regs.inep[0], DIEPTSIZ, XFRSIZ == 0));
        assert!(ral::read_reg!(ral::inep, &regs.inep[0], DIEPTSIZ, PKTCNT == 1));

        let mut data = [0; 70];
        assert_eq!(device.control_data(&mut data), 70);
        assert_eq!(data[63], 0xA5);
        assert_eq!(data[64], 0x5A);

        in_complete(&mut device, regs, &mut class, 0);
        assert_eq!(device.control_phase(), ControlPhase::Idle);
        assert!(class.events.ends_with(&[Event::ControlOut(64), Event::Complete(0x09)]));
    }

    #[test]
    fn rejected_request_stalls_ep0() {
        let (mut device, regs) = device(Config::full_speed());
        let mut class = Recorder::default();
        enumerate(&mut device, regs, &mut class);

        setup(&mut device, regs, &mut class, [0xC0, 0xFF, 0, 0, 0, 0, 4, 0]);
        assert_eq!(device.control_phase(), ControlPhase::Idle);
        assert!(ral::read_reg!(ral::inep, &regs.inep[0], DIEPCTL, STALL == 1));
        assert!(ral::read_reg!(ral::outep, &regs.outep[0], DOEPCTL, STALL == 1));
        assert!(device.is_stalled(EndpointAddress::from_parts(0, UsbDirection::In)));

        // The next SETUP starts over
        setup(&mut device, regs, &mut class, [0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x12, 0x00]);
        assert_eq!(device.control_phase(), ControlPhase::DataIn);
        assert!(!device.is_stalled(EndpointAddress::from_parts(0, UsbDirection::In)));
    }

    #[test]
    fn response_larger_than_ep0_buffer() {
        let (mut device, regs) = device(Config::full_speed());
        let mut class = Recorder::default();
        enumerate(&mut device, regs, &mut class);

        // Only the requested part has to fit
        setup(&mut device, regs, &mut class, [0xC0, 0x30, 0, 0, 0, 0, 200, 0]);
        assert_eq!(device.control_phase(), ControlPhase::DataIn);
        assert!(ral::read_reg!(ral::inep, &regs.inep[0], DIEPTSIZ, XFRSIZ == 64));

        setup(&mut device, regs, &mut class, [0xC0, 0x30, 0, 0, 0, 0, 0xFF, 0xFF]);
        assert_eq!(device.control_phase(), ControlPhase::Idle);
        assert!(ral::read_reg!(ral::inep, &regs.inep[0], DIEPCTL, STALL == 1));
        assert!(ral::read_reg!(ral::outep, &regs.outep[0], DOEPCTL, STALL == 1));
    }

    #[test]
    fn setup_during_data_stage_starts_over() {
        let (mut device, regs) = device(Config::full_speed());
        let mut class = Recorder::default();
        enumerate(&mut device, regs, &mut class);

        setup(&mut device, regs, &mut class, [0x21, 0x09, 0x00, 0x02, 0x00, 0x00, 100, 0]);
        receive(regs, 0, 2, &[1; 64]);
        dispatch(&mut device, regs, &mut class, Interrupts::RX_FIFO_LEVEL);
        out_complete(&mut device, regs, &mut class, 0);
        assert_eq!(device.control_phase(), ControlPhase::DataOut);

        setup(&mut device, regs, &mut class, [0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x12, 0x00]);
        assert_eq!(device.control_phase(), ControlPhase::DataIn);
        assert!(ral::read_reg!(ral::inep, &regs.inep[0], DIEPTSIZ, XFRSIZ == 18));
        assert!(!class.events.iter().any(|event| matches!(event, Event::ControlOut(_))));
    }

    #[test]
    fn bulk_out_packets_land_in_order() {
        let (mut device, regs) = device(Config::full_speed());
        let mut class = Recorder::default();
        enumerate(&mut device, regs, &mut class);

        let ep1 = EndpointAddress::from_parts(1, UsbDirection::Out);
        let ep2 = EndpointAddress::from_parts(2, UsbDirection::Out);
        device.activate(ep1, EndpointType::Bulk, 64, 130).unwrap();
        device.activate(ep2, EndpointType::Bulk, 64, 64).unwrap();
        device.start_transfer(ep1, 130).unwrap();
        device.start_transfer(ep2, 64).unwrap();

        // Packets for the two endpoints interleave in the shared FIFO
        receive(regs, 1, 2, &[1; 64]);
        dispatch(&mut device, regs, &mut class, Interrupts::RX_FIFO_LEVEL);
        receive(regs, 2, 2, &[2; 10]);
        dispatch(&mut device, regs, &mut class, Interrupts::RX_FIFO_LEVEL);
        receive(regs, 1, 2, &[3; 64]);
        dispatch(&mut device, regs, &mut class, Interrupts::RX_FIFO_LEVEL);
        receive(regs, 1, 2, &[4; 2]);
        dispatch(&mut device, regs, &mut class, Interrupts::RX_FIFO_LEVEL);

        out_complete(&mut device, regs, &mut class, 1);
        assert_eq!(class.events.last(), Some(&Event::DataOut(1, 130)));
        assert_eq!(device.transferred(ep2), 10);

        let mut data = [0; 130];
        assert_eq!(device.read(ep1, &mut data).unwrap(), 130);
        assert_eq!(data[0], 1);
        assert_eq!(data[64], 3);
        assert_eq!(data[129], 4);
    }

    #[test]
    fn packets_for_idle_endpoints_are_dropped() {
        let (mut device, regs) = device(Config::full_speed());
        let mut class = Recorder::default();
        enumerate(&mut device, regs, &mut class);
        let ep1 = EndpointAddress::from_parts(1, UsbDirection::Out);
        device.activate(ep1, EndpointType::Bulk, 64, 64).unwrap();

        receive(regs, 1, 2, &[9; 8]);
        dispatch(&mut device, regs, &mut class, Interrupts::RX_FIFO_LEVEL);
        assert_eq!(device.transferred(ep1), 0);
        // Still listening for the next status word
        assert_ne!(regs.GINTMSK.read() & Interrupts::RX_FIFO_LEVEL.bits(), 0);
    }

    #[test]
    fn bulk_in_completion() {
        let (mut device, regs) = device(Config::full_speed());
        let mut class = Recorder::default();
        enumerate(&mut device, regs, &mut class);

        let ep1 = EndpointAddress::from_parts(1, UsbDirection::In);
        device.activate(ep1, EndpointType::Bulk, 64, 256).unwrap();
        ral::write_reg!(ral::inep, &regs.inep[1], DTXFSTS, INEPTFSAV: 64);
        device.write(ep1, &[7; 130]).unwrap();
        assert_eq!(regs.DIEPEMPMSK.read(), 0);
        assert_eq!(device.transferred(ep1), 130);
        assert!(ral::read_reg!(ral::inep, &regs.inep[1], DIEPTSIZ, PKTCNT == 3));

        in_complete(&mut device, regs, &mut class, 1);
        assert_eq!(class.events.last(), Some(&Event::DataIn(1)));
        assert_eq!(device.endpoint(ep1).unwrap().state(), EndpointState::Idle);
    }

    #[test]
    fn sof_and_suspend() {
        let (mut device, regs) = device(Config::full_speed().with_low_power(true));
        let mut class = Recorder::default();

        dispatch(&mut device, regs, &mut class, Interrupts::SOF);
        ral::write_reg!(ral::otg, regs, DSTS, SUSPSTS: 1);
        dispatch(&mut device, regs, &mut class, Interrupts::SUSPEND);
        assert!(ral::read_reg!(ral::otg, regs, PCGCCTL, STPPCLK == 1));
        dispatch(&mut device, regs, &mut class, Interrupts::WAKEUP);
        assert!(ral::read_reg!(ral::otg, regs, PCGCCTL, STPPCLK == 0));

        assert_eq!(class.events, [Event::Sof, Event::Suspended, Event::Resumed]);
    }

    #[test]
    fn ignored_in_host_mode() {
        let (mut device, regs) = device(Config::full_speed());
        let mut class = Recorder::default();
        testing::raise(regs, Interrupts::CURRENT_MODE | Interrupts::SOF);
        device.on_interrupt(&mut class);
        assert!(class.events.is_empty());
    }
}
