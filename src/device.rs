//! Device transfer engine
//!
//! [`Device`] drives the core in device mode. It owns the endpoint state,
//! starts and completes IN and OUT transfers, and runs EP0 control
//! transfers through a [`ControlContext`]. Hardware events reach it through
//! [`Device::on_interrupt()`], which dispatches to a [`Class`](crate::Class).
//!
//! # Example
//!
//! ```no_run
//! use dwc_otg::{Config, Device, EndpointMemory, Peripherals, UsbCore};
//! use usb_device::{endpoint::{EndpointAddress, EndpointType}, UsbDirection};
//! # struct Otg; unsafe impl Peripherals for Otg { fn otg(&self) -> *const () { 0x5000_0000 as _ } }
//! # struct Delay; impl embedded_hal::delay::DelayNs for Delay { fn delay_ns(&mut self, _: u32) {} }
//!
//! static EP_MEMORY: EndpointMemory<2048> = EndpointMemory::new();
//!
//! let core = UsbCore::new(Otg, Config::full_speed());
//! let mut device = Device::new(core, &EP_MEMORY).unwrap();
//! device.initialize(&mut Delay).unwrap();
//! device.connect(&mut Delay);
//!
//! // Once configured...
//! let bulk_in = EndpointAddress::from_parts(1, UsbDirection::In);
//! device.activate(bulk_in, EndpointType::Bulk, 64, 512).unwrap();
//! device.write(bulk_in, b"hello").unwrap();
//! ```

mod control;
mod endpoint;
mod interrupt;

pub use control::{ControlAction, ControlContext, ControlPhase};
pub use endpoint::{Endpoint, EndpointState, InEndpointInterrupt, OutEndpointInterrupt};

use crate::{
    buffer::{Allocator, Buffer, EndpointMemory, Watermark},
    config::{Phy, Speed},
    error::{Error, Result},
    fifo::FifoLayout,
    ral,
    usbcore::{Interrupts, Mode, UsbCore},
    MAX_ENDPOINTS,
};
use embedded_hal::delay::DelayNs;
pub(crate) use endpoint::packet_count;
use endpoint::ep0_mps_code;
use usb_device::{
    endpoint::{EndpointAddress, EndpointType},
    UsbDirection,
};

/// Bytes staged per FIFO access
const STAGING_LEN: usize = 64;

/// A USB device on top of the transaction core
pub struct Device {
    core: UsbCore,
    allocator: Allocator,
    /// Allocation point after the EP0 buffers
    watermark: Watermark,
    ep_in: [Endpoint; MAX_ENDPOINTS],
    ep_out: [Endpoint; MAX_ENDPOINTS],
    control: ControlContext,
    setup_bytes: [u8; 8],
    speed: Speed,
}

impl Device {
    /// Create a device, and assign it endpoint memory
    ///
    /// The two EP0 staging buffers are allocated here. Fails if the memory
    /// is too small for them.
    ///
    /// # Panics
    ///
    /// Panics if `memory` was already assigned to another driver.
    pub fn new<const SIZE: usize>(
        usb: UsbCore,
        memory: &'static EndpointMemory<SIZE>,
    ) -> Result<Self> {
        let mut allocator = memory
            .allocator()
            .expect("Endpoint memory already assigned");
        let len = usb.config().control_buffer_len.max(64).next_multiple_of(64);
        let ep0_in = allocator
            .allocate(len)
            .ok_or(Error::EndpointMemoryOverflow)?;
        let ep0_out = allocator
            .allocate(len)
            .ok_or(Error::EndpointMemoryOverflow)?;
        let watermark = allocator.watermark();

        let mut ep_in: [Endpoint; MAX_ENDPOINTS] =
            core::array::from_fn(|n| Endpoint::new(n, UsbDirection::In));
        let mut ep_out: [Endpoint; MAX_ENDPOINTS] =
            core::array::from_fn(|n| Endpoint::new(n, UsbDirection::Out));
        ep_in[0].buffer = Some(ep0_in);
        ep_out[0].buffer = Some(ep0_out);

        Ok(Device {
            core: usb,
            allocator,
            watermark,
            ep_in,
            ep_out,
            control: ControlContext::new(64),
            setup_bytes: [0; 8],
            speed: Speed::Full,
        })
    }

    /// Bring up the core in device mode
    ///
    /// Leaves the device soft-disconnected; call [`connect()`](Device::connect)
    /// when the class is ready.
    pub fn initialize(&mut self, delay: &mut impl DelayNs) -> Result<()> {
        self.core.initialize(delay)?;
        self.core.set_mode(Mode::Device, delay);
        let regs = self.core.regs();
        let config = *self.core.config();

        ral::write_reg!(ral::otg, regs, PCGCCTL, 0);
        let dspd = match (config.phy, config.speed) {
            (Phy::Ulpi, Speed::High) => ral::otg::DCFG::DSPD::RW::HIGH,
            (Phy::Ulpi, _) => ral::otg::DCFG::DSPD::RW::FULL_ULPI,
            (Phy::Embedded, _) => ral::otg::DCFG::DSPD::RW::FULL,
        };
        ral::modify_reg!(ral::otg, regs, DCFG, DSPD: dspd, PFIVL: 0);

        let layout = FifoLayout::device(&config)?;
        self.core.apply_fifo_layout(&layout, Mode::Device);
        self.core.flush_all_tx_fifos(delay)?;
        self.core.flush_rx_fifo(delay)?;

        ral::write_reg!(ral::otg, regs, DIEPMSK, 0);
        ral::write_reg!(ral::otg, regs, DOEPMSK, 0);
        ral::write_reg!(ral::otg, regs, DAINTMSK, 0);
        ral::write_reg!(ral::otg, regs, DIEPEMPMSK, 0);
        ral::write_reg!(ral::otg, regs, DAINT, u32::MAX);
        for n in 0..config.endpoint_count() {
            self.reset_endpoint_registers(n);
        }
        ral::modify_reg!(ral::otg, regs, DCTL, SDIS: 1);

        let mut interrupts = Interrupts::RESET
            | Interrupts::ENUM_DONE
            | Interrupts::IN_ENDPOINT
            | Interrupts::OUT_ENDPOINT
            | Interrupts::SUSPEND
            | Interrupts::WAKEUP
            | Interrupts::SOF
            | Interrupts::MODE_MISMATCH
            | Interrupts::INCOMPLETE_ISO_IN
            | Interrupts::INCOMPLETE_ISO_OUT;
        if !config.dma {
            interrupts |= Interrupts::RX_FIFO_LEVEL;
        }
        if config.vbus_sensing {
            interrupts |= Interrupts::SESSION_REQUEST | Interrupts::OTG;
        }
        self.core.clear(Interrupts::all());
        self.core.set_mask(interrupts);
        self.core.enable_interrupts();
        debug!("Device initialized");
        Ok(())
    }

    /// Disable and quiesce one endpoint pair's registers
    fn reset_endpoint_registers(&self, n: usize) {
        let regs = self.core.regs();
        let inep = &regs.inep[n];
        if ral::read_reg!(ral::inep, inep, DIEPCTL, EPENA == 1) {
            ral::write_reg!(ral::inep, inep, DIEPCTL, EPDIS: 1, SNAK: 1);
        } else {
            ral::write_reg!(ral::inep, inep, DIEPCTL, 0);
        }
        ral::write_reg!(ral::inep, inep, DIEPTSIZ, 0);
        ral::write_reg!(ral::inep, inep, DIEPINT, 0xFB7F);

        let outep = &regs.outep[n];
        if ral::read_reg!(ral::outep, outep, DOEPCTL, EPENA == 1) {
            ral::write_reg!(ral::outep, outep, DOEPCTL, EPDIS: 1, SNAK: 1);
        } else {
            ral::write_reg!(ral::outep, outep, DOEPCTL, 0);
        }
        ral::write_reg!(ral::outep, outep, DOEPTSIZ, 0);
        ral::write_reg!(ral::outep, outep, DOEPINT, 0xFB7F);
    }

    pub fn core(&self) -> &UsbCore {
        &self.core
    }

    /// The enumerated bus speed
    pub fn speed(&self) -> Speed {
        self.speed
    }

    /// Release the soft disconnect, so the host sees the pull-up
    pub fn connect(&mut self, delay: &mut impl DelayNs) {
        ral::modify_reg!(ral::otg, self.core.regs(), DCTL, SDIS: 0);
        delay.delay_ms(3);
    }

    /// Soft disconnect from the bus
    pub fn disconnect(&mut self, delay: &mut impl DelayNs) {
        ral::modify_reg!(ral::otg, self.core.regs(), DCTL, SDIS: 1);
        delay.delay_ms(3);
    }

    /// Respond to `address` from now on
    ///
    /// The core must learn the address before the status stage of
    /// SET_ADDRESS, unlike most other controllers.
    pub fn set_address(&mut self, address: u8) {
        ral::modify_reg!(ral::otg, self.core.regs(), DCFG, DAD: u32::from(address & 0x7F));
    }

    pub fn address(&self) -> u8 {
        ral::read_reg!(ral::otg, self.core.regs(), DCFG, DAD) as u8
    }

    /// Signal remote wakeup to a suspended host
    pub fn remote_wakeup(&mut self, delay: &mut impl DelayNs) {
        let regs = self.core.regs();
        if ral::read_reg!(ral::otg, regs, DSTS, SUSPSTS == 0) {
            return;
        }
        if self.core.config().low_power {
            ral::modify_reg!(ral::otg, regs, PCGCCTL, STPPCLK: 0, GATEHCLK: 0);
        }
        ral::modify_reg!(ral::otg, regs, DCTL, RWUSIG: 1);
        delay.delay_ms(10);
        ral::modify_reg!(ral::otg, regs, DCTL, RWUSIG: 0);
    }

    /// Frame number of the last SOF
    pub fn frame_number(&self) -> u16 {
        ral::read_reg!(ral::otg, self.core.regs(), DSTS, FNSOF) as u16
    }

    fn check_index(&self, address: EndpointAddress) -> Result<usize> {
        let n = address.index();
        if n < self.core.config().endpoint_count() {
            Ok(n)
        } else {
            Err(Error::InvalidEndpoint)
        }
    }

    /// Look at an endpoint's state
    pub fn endpoint(&self, address: EndpointAddress) -> Option<&Endpoint> {
        let n = self.check_index(address).ok()?;
        Some(match address.direction() {
            UsbDirection::In => &self.ep_in[n],
            UsbDirection::Out => &self.ep_out[n],
        })
    }

    /// Activate an endpoint, allocating a `buffer_len` byte buffer for it
    ///
    /// An endpoint that's already active keeps its type, max packet size
    /// and data toggle; the call then only makes sure that its interrupt is
    /// unmasked.
    pub fn activate(
        &mut self,
        address: EndpointAddress,
        kind: EndpointType,
        max_packet: usize,
        buffer_len: usize,
    ) -> Result<()> {
        let n = self.check_index(address)?;
        let regs = self.core.regs();
        match address.direction() {
            UsbDirection::In => {
                let fifo_bytes = usize::from(self.core.config().tx_fifo_words[n]) * 4;
                if n > 0 && fifo_bytes < max_packet {
                    return Err(Error::FifoOverflow);
                }
                let ep = &mut self.ep_in[n];
                ensure_buffer(ep, &mut self.allocator, buffer_len.max(max_packet))?;
                let inep = &regs.inep[n];
                if ral::read_reg!(ral::inep, inep, DIEPCTL, USBAEP == 0) {
                    ep.kind = kind;
                    ep.max_packet = max_packet;
                    let mpsiz = mps_bits(n, max_packet);
                    ral::modify_reg!(ral::inep, inep, DIEPCTL,
                        MPSIZ: mpsiz,
                        EPTYP: ep.type_bits(),
                        TXFNUM: n as u32,
                        SD0PID_SEVNFRM: 1,
                        USBAEP: 1
                    );
                    debug!("Activated IN endpoint {}", n);
                }
                ral::modify_reg!(ral::otg, regs, DAINTMSK, |daintmsk| daintmsk | (1 << n));
                if ep.state == EndpointState::Inactive {
                    ep.state = EndpointState::Idle;
                }
            }
            UsbDirection::Out => {
                let ep = &mut self.ep_out[n];
                ensure_buffer(ep, &mut self.allocator, buffer_len.max(max_packet))?;
                let outep = &regs.outep[n];
                if ral::read_reg!(ral::outep, outep, DOEPCTL, USBAEP == 0) {
                    ep.kind = kind;
                    ep.max_packet = max_packet;
                    let mpsiz = mps_bits(n, max_packet);
                    ral::modify_reg!(ral::outep, outep, DOEPCTL,
                        MPSIZ: mpsiz,
                        EPTYP: ep.type_bits(),
                        SD0PID_SEVNFRM: 1,
                        USBAEP: 1
                    );
                    debug!("Activated OUT endpoint {}", n);
                }
                ral::modify_reg!(ral::otg, regs, DAINTMSK, |daintmsk| daintmsk | (1 << (16 + n)));
                if ep.state == EndpointState::Inactive {
                    ep.state = EndpointState::Idle;
                }
            }
        }
        Ok(())
    }

    /// Deactivate an endpoint, dropping any transfer in flight
    ///
    /// No further events are dispatched for the endpoint. EP0 can't be
    /// deactivated.
    pub fn deactivate(&mut self, address: EndpointAddress) -> Result<()> {
        let n = self.check_index(address)?;
        if n == 0 {
            return Err(Error::InvalidEndpoint);
        }
        let regs = self.core.regs();
        match address.direction() {
            UsbDirection::In => {
                let inep = &regs.inep[n];
                if ral::read_reg!(ral::inep, inep, DIEPCTL, EPENA == 1) {
                    ral::modify_reg!(ral::inep, inep, DIEPCTL, EPDIS: 1, SNAK: 1);
                }
                ral::modify_reg!(ral::inep, inep, DIEPCTL, USBAEP: 0);
                ral::modify_reg!(ral::otg, regs, DAINTMSK, |daintmsk| daintmsk & !(1 << n));
                ral::modify_reg!(ral::otg, regs, DIEPEMPMSK, |empmsk| empmsk & !(1 << n));
                let ep = &mut self.ep_in[n];
                ep.drop_transfer();
                ep.state = EndpointState::Inactive;
                ep.stalled = false;
            }
            UsbDirection::Out => {
                let outep = &regs.outep[n];
                if ral::read_reg!(ral::outep, outep, DOEPCTL, EPENA == 1) {
                    ral::modify_reg!(ral::outep, outep, DOEPCTL, EPDIS: 1, SNAK: 1);
                }
                ral::modify_reg!(ral::outep, outep, DOEPCTL, USBAEP: 0);
                ral::modify_reg!(ral::otg, regs, DAINTMSK, |daintmsk| daintmsk & !(1 << (16 + n)));
                let ep = &mut self.ep_out[n];
                ep.drop_transfer();
                ep.state = EndpointState::Inactive;
                ep.stalled = false;
            }
        }
        debug!("Deactivated endpoint {:?}", address);
        Ok(())
    }

    /// Start a transfer of `len` bytes
    ///
    /// IN endpoints send the first `len` bytes of their buffer; see
    /// [`write()`](Device::write). OUT endpoints arm for `len` bytes.
    pub fn start_transfer(&mut self, address: EndpointAddress, len: usize) -> Result<()> {
        let n = self.check_index(address)?;
        match address.direction() {
            UsbDirection::In => self.start_in(n, 0, len),
            UsbDirection::Out => self.start_out(n, 0, len),
        }
    }

    /// Copy `data` into the endpoint buffer and send it
    pub fn write(&mut self, address: EndpointAddress, data: &[u8]) -> Result<usize> {
        let n = self.check_index(address)?;
        if address.direction() != UsbDirection::In {
            return Err(Error::InvalidEndpoint);
        }
        let ep = &mut self.ep_in[n];
        match ep.state {
            EndpointState::Inactive => return Err(Error::EndpointInactive),
            EndpointState::Transferring => return Err(Error::EndpointBusy),
            EndpointState::Idle => {}
        }
        let buffer = ep.buffer.as_mut().ok_or(Error::EndpointInactive)?;
        if data.len() > buffer.len() {
            return Err(Error::BufferOverflow);
        }
        buffer.volatile_write(0, data);
        self.start_in(n, 0, data.len())?;
        Ok(data.len())
    }

    /// Copy the data of the last completed OUT transfer into `data`
    pub fn read(&mut self, address: EndpointAddress, data: &mut [u8]) -> Result<usize> {
        let n = self.check_index(address)?;
        if address.direction() != UsbDirection::Out {
            return Err(Error::InvalidEndpoint);
        }
        let ep = &self.ep_out[n];
        match ep.state {
            EndpointState::Inactive => return Err(Error::EndpointInactive),
            EndpointState::Transferring => return Err(Error::EndpointBusy),
            EndpointState::Idle => {}
        }
        let buffer = ep.buffer.as_ref().ok_or(Error::EndpointInactive)?;
        let size = ep.xfer_count.min(data.len());
        if self.core.config().dma {
            buffer.clean_invalidate_dcache(ep.base + size);
        }
        Ok(buffer.volatile_read(ep.base, &mut data[..size]))
    }

    /// Bytes moved by the last (or current) transfer
    pub fn transferred(&self, address: EndpointAddress) -> usize {
        self.endpoint(address).map_or(0, |ep| ep.xfer_count)
    }

    /// Where EP0 is within the current control transfer
    pub fn control_phase(&self) -> ControlPhase {
        self.control.phase()
    }

    /// Copy the OUT data stage of the current control request into `data`
    pub fn control_data(&self, data: &mut [u8]) -> usize {
        let len = self.control.transferred().min(data.len());
        match &self.ep_out[0].buffer {
            Some(buffer) => buffer.volatile_read(0, &mut data[..len]),
            None => 0,
        }
    }

    /// Stall an endpoint
    ///
    /// A transfer in flight is disabled and NAKed first, then dropped.
    pub fn set_stall(&mut self, address: EndpointAddress) -> Result<()> {
        let n = self.check_index(address)?;
        let regs = self.core.regs();
        match address.direction() {
            UsbDirection::In => {
                let ep = &mut self.ep_in[n];
                if n > 0 && ep.state == EndpointState::Inactive {
                    return Err(Error::EndpointInactive);
                }
                let inep = &regs.inep[n];
                if ral::read_reg!(ral::inep, inep, DIEPCTL, EPENA == 1) {
                    ral::modify_reg!(ral::inep, inep, DIEPCTL, EPDIS: 1, SNAK: 1);
                }
                ral::modify_reg!(ral::inep, inep, DIEPCTL, STALL: 1);
                ral::modify_reg!(ral::otg, regs, DIEPEMPMSK, |empmsk| empmsk & !(1 << n));
                ep.drop_transfer();
                ep.stalled = true;
            }
            UsbDirection::Out => {
                let ep = &mut self.ep_out[n];
                if n > 0 && ep.state == EndpointState::Inactive {
                    return Err(Error::EndpointInactive);
                }
                let outep = &regs.outep[n];
                if ral::read_reg!(ral::outep, outep, DOEPCTL, EPENA == 1) {
                    ral::modify_reg!(ral::outep, outep, DOEPCTL, EPDIS: 1, SNAK: 1);
                }
                ral::modify_reg!(ral::outep, outep, DOEPCTL, STALL: 1);
                ep.drop_transfer();
                ep.stalled = true;
            }
        }
        debug!("Stalled endpoint {:?}", address);
        Ok(())
    }

    /// Clear an endpoint stall
    ///
    /// Bulk and interrupt endpoints restart at DATA0.
    pub fn clear_stall(&mut self, address: EndpointAddress) -> Result<()> {
        let n = self.check_index(address)?;
        let regs = self.core.regs();
        match address.direction() {
            UsbDirection::In => {
                let ep = &mut self.ep_in[n];
                let inep = &regs.inep[n];
                ral::modify_reg!(ral::inep, inep, DIEPCTL, STALL: 0);
                if ep.resets_toggle() {
                    ral::modify_reg!(ral::inep, inep, DIEPCTL, SD0PID_SEVNFRM: 1);
                }
                ep.stalled = false;
            }
            UsbDirection::Out => {
                let ep = &mut self.ep_out[n];
                let outep = &regs.outep[n];
                ral::modify_reg!(ral::outep, outep, DOEPCTL, STALL: 0);
                if ep.resets_toggle() {
                    ral::modify_reg!(ral::outep, outep, DOEPCTL, SD0PID_SEVNFRM: 1);
                }
                ep.stalled = false;
            }
        }
        Ok(())
    }

    pub fn is_stalled(&self, address: EndpointAddress) -> bool {
        self.endpoint(address).map_or(false, Endpoint::is_stalled)
    }

    /// Start an IN transfer of `len` bytes from the buffer at `base`
    ///
    /// EP0 transfers are clamped to one packet.
    fn start_in(&mut self, n: usize, base: usize, len: usize) -> Result<()> {
        let dma = self.core.config().dma;
        let regs = self.core.regs();
        let ep = &mut self.ep_in[n];
        match ep.state {
            EndpointState::Inactive => return Err(Error::EndpointInactive),
            EndpointState::Transferring => return Err(Error::EndpointBusy),
            EndpointState::Idle => {}
        }
        let len = if n == 0 { len.min(ep.max_packet) } else { len };
        let buffer = ep.buffer.as_ref().ok_or(Error::EndpointInactive)?;
        if base + len > buffer.len() {
            return Err(Error::BufferOverflow);
        }
        let pktcnt = packet_count(len, ep.max_packet) as u32;

        let inep = &regs.inep[n];
        if ep.is_isochronous() {
            ral::write_reg!(ral::inep, inep, DIEPTSIZ, XFRSIZ: len as u32, PKTCNT: pktcnt, MCNT: 1);
        } else {
            ral::write_reg!(ral::inep, inep, DIEPTSIZ, XFRSIZ: len as u32, PKTCNT: pktcnt);
        }
        if dma {
            buffer.clean_invalidate_dcache(base + len);
            ral::write_reg!(ral::inep, inep, DIEPDMA, buffer.as_ptr() as u32 + base as u32);
        }
        if ep.is_isochronous() {
            if ral::read_reg!(ral::otg, regs, DSTS, FNSOF) & 1 == 0 {
                ral::modify_reg!(ral::inep, inep, DIEPCTL, SODDFRM: 1);
            } else {
                ral::modify_reg!(ral::inep, inep, DIEPCTL, SD0PID_SEVNFRM: 1);
            }
        }

        ep.base = base;
        ep.xfer_len = len;
        ep.xfer_count = 0;
        ep.programmed = len;
        ep.state = EndpointState::Transferring;
        ral::modify_reg!(ral::inep, inep, DIEPCTL, CNAK: 1, EPENA: 1);
        trace!("IN {} start, {} bytes", n, len);

        if !dma && len > 0 {
            self.fill_tx_fifo(n);
        }
        Ok(())
    }

    /// Push whole packets while the endpoint's TX FIFO has room
    ///
    /// Keeps the FIFO empty interrupt unmasked until everything is queued.
    fn fill_tx_fifo(&mut self, n: usize) {
        let regs = self.core.regs();
        let ep = &mut self.ep_in[n];
        let Some(buffer) = ep.buffer.as_ref() else {
            return;
        };
        let inep = &regs.inep[n];
        while ep.remaining() > 0 {
            let len = ep.remaining().min(ep.max_packet);
            let space = ral::read_reg!(ral::inep, inep, DTXFSTS, INEPTFSAV) as usize;
            if space < len.div_ceil(4) {
                break;
            }
            let mut staging = [0u8; STAGING_LEN];
            let mut sent = 0;
            while sent < len {
                let part = (len - sent).min(STAGING_LEN);
                buffer.volatile_read(ep.base + ep.xfer_count + sent, &mut staging[..part]);
                self.core.write_packet(n, &staging[..part]);
                sent += part;
            }
            ep.xfer_count += len;
        }
        if ep.remaining() == 0 {
            ral::modify_reg!(ral::otg, regs, DIEPEMPMSK, |empmsk| empmsk & !(1 << n));
        } else {
            ral::modify_reg!(ral::otg, regs, DIEPEMPMSK, |empmsk| empmsk | (1 << n));
        }
    }

    /// Arm an OUT transfer for `len` bytes into the buffer at `base`
    ///
    /// The transfer size is rounded up to whole packets. EP0 arms for one
    /// packet, and keeps accepting SETUP packets.
    fn start_out(&mut self, n: usize, base: usize, len: usize) -> Result<()> {
        let dma = self.core.config().dma;
        let regs = self.core.regs();
        let ep = &mut self.ep_out[n];
        match ep.state {
            EndpointState::Inactive => return Err(Error::EndpointInactive),
            EndpointState::Transferring => return Err(Error::EndpointBusy),
            EndpointState::Idle => {}
        }
        let (len, pktcnt) = if n == 0 {
            (len.min(ep.max_packet), 1)
        } else {
            (len, packet_count(len, ep.max_packet))
        };
        let xfrsiz = pktcnt * ep.max_packet;
        let buffer = ep.buffer.as_ref().ok_or(Error::EndpointInactive)?;
        let reach = if dma { xfrsiz } else { len };
        if base + reach > buffer.len() {
            return Err(Error::BufferOverflow);
        }

        let outep = &regs.outep[n];
        if n == 0 {
            ral::write_reg!(ral::outep, outep, DOEPTSIZ, XFRSIZ: xfrsiz as u32, PKTCNT: 1, STUPCNT: 3);
        } else {
            ral::write_reg!(ral::outep, outep, DOEPTSIZ, XFRSIZ: xfrsiz as u32, PKTCNT: pktcnt as u32);
        }
        if dma {
            buffer.clean_invalidate_dcache(base + xfrsiz);
            ral::write_reg!(ral::outep, outep, DOEPDMA, buffer.as_ptr() as u32 + base as u32);
        }
        if ep.is_isochronous() {
            if ral::read_reg!(ral::otg, regs, DSTS, FNSOF) & 1 == 0 {
                ral::modify_reg!(ral::outep, outep, DOEPCTL, SODDFRM: 1);
            } else {
                ral::modify_reg!(ral::outep, outep, DOEPCTL, SD0PID_SEVNFRM: 1);
            }
        }

        ep.base = base;
        ep.xfer_len = len;
        ep.xfer_count = 0;
        ep.programmed = xfrsiz;
        ep.state = EndpointState::Transferring;
        ral::modify_reg!(ral::outep, outep, DOEPCTL, CNAK: 1, EPENA: 1);
        trace!("OUT {} armed, {} bytes", n, len);
        Ok(())
    }

    /// Send one EP0 packet of at most a max packet from the IN staging buffer
    pub fn start_control_in(&mut self, offset: usize, len: usize) -> Result<()> {
        self.start_in(0, offset, len)
    }

    /// Arm EP0 OUT for one packet into the OUT staging buffer
    pub fn start_control_out(&mut self, offset: usize, len: usize) -> Result<()> {
        self.start_out(0, offset, len)
    }

    /// Prepare EP0 OUT to take up to three back-to-back SETUP packets
    fn ep0_out_start(&mut self) {
        let regs = self.core.regs();
        let outep = &regs.outep[0];
        ral::write_reg!(ral::outep, outep, DOEPTSIZ, XFRSIZ: 3 * 8, PKTCNT: 1, STUPCNT: 3);
        if self.core.config().dma {
            if let Some(buffer) = &self.ep_out[0].buffer {
                ral::write_reg!(ral::outep, outep, DOEPDMA, buffer.as_ptr() as u32);
            }
            ral::modify_reg!(ral::outep, outep, DOEPCTL, EPENA: 1, USBAEP: 1);
        }
    }

    /// Copy the part of a control response that the host asked for into the
    /// EP0 IN staging buffer
    ///
    /// Returns `None` if that part doesn't fit.
    fn stage_control_in(&mut self, data: &[u8], requested: usize) -> Option<usize> {
        let data = &data[..data.len().min(requested)];
        let buffer = self.ep_in[0].buffer.as_mut()?;
        if data.len() > buffer.len() {
            warn!("Control response of {} bytes exceeds the EP0 buffer", data.len());
            return None;
        }
        Some(buffer.volatile_write(0, data))
    }

    /// Release every non-control endpoint, as after a bus reset
    fn release_endpoints(&mut self) {
        for ep in self.ep_in[1..].iter_mut().chain(self.ep_out[1..].iter_mut()) {
            ep.drop_transfer();
            ep.state = EndpointState::Inactive;
            ep.stalled = false;
            ep.buffer = None;
        }
        self.allocator.release_to(self.watermark);
        for ep in [&mut self.ep_in[0], &mut self.ep_out[0]] {
            ep.drop_transfer();
            ep.state = EndpointState::Idle;
            ep.stalled = false;
        }
    }
}

/// Value for the max packet size field
fn mps_bits(n: usize, max_packet: usize) -> u32 {
    if n == 0 {
        ep0_mps_code(max_packet)
    } else {
        max_packet as u32
    }
}

fn ensure_buffer(ep: &mut Endpoint, allocator: &mut Allocator, len: usize) -> Result<()> {
    if ep.buffer.is_none() {
        let buffer: Buffer = allocator
            .allocate(len)
            .ok_or(Error::EndpointMemoryOverflow)?;
        ep.buffer = Some(buffer);
    }
    Ok(())
}
