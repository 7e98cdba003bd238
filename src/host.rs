//! Host transfer engine
//!
//! [`Host`] drives the core in host mode. It powers and resets the root
//! port, and hands out channels. A channel carries transfers to one
//! endpoint of one device: allocate it, describe the endpoint with
//! [`Host::init_channel()`], then start transfers and watch
//! [`Host::on_interrupt()`] for the channels that finished.
//!
//! # Example
//!
//! ```no_run
//! use dwc_otg::{Config, EndpointMemory, Host, Peripherals, SetupPacket, UsbCore};
//! use dwc_otg::host::{ChannelConfig, ChannelStatus};
//! use usb_device::{endpoint::{EndpointAddress, EndpointType}, UsbDirection};
//! # struct Otg; unsafe impl Peripherals for Otg { fn otg(&self) -> *const () { 0x5000_0000 as _ } }
//! # struct Delay; impl embedded_hal::delay::DelayNs for Delay { fn delay_ns(&mut self, _: u32) {} }
//!
//! static CHANNEL_MEMORY: EndpointMemory<1024> = EndpointMemory::new();
//!
//! let core = UsbCore::new(Otg, Config::full_speed());
//! let mut host = Host::new(core, &CHANNEL_MEMORY);
//! host.initialize(&mut Delay).unwrap();
//!
//! // Once a device is connected...
//! host.reset_port(&mut Delay);
//!
//! let ep0 = EndpointAddress::from_parts(0, UsbDirection::Out);
//! let ch = host.alloc_channel().unwrap();
//! host.init_channel(ch, ChannelConfig::new(0, ep0, EndpointType::Control, 64)).unwrap();
//! host.start_setup(ch, &SetupPacket::get_descriptor(1, 0, 18)).unwrap();
//!
//! loop {
//!     let events = host.on_interrupt();
//!     if events.channel(ch) {
//!         assert_eq!(host.status(ch), ChannelStatus::Complete);
//!         break;
//!     }
//! }
//! ```

mod channel;
mod interrupt;

pub use channel::{ChannelConfig, ChannelError, ChannelInterrupt, ChannelStatus};
pub use interrupt::{HostEvents, PortEvents};

use crate::{
    buffer::{Allocator, EndpointMemory, Watermark},
    config::{Phy, Speed},
    device::packet_count,
    error::{Error, Result},
    fifo::FifoLayout,
    ral,
    setup::SetupPacket,
    usbcore::{Interrupts, Mode, UsbCore},
    MAX_CHANNELS,
};
use channel::{Channel, HaltReason, HaltState, MAX_PACKETS};
use embedded_hal::delay::DelayNs;
use usb_device::endpoint::EndpointType;

/// Bytes staged per FIFO access
const STAGING_LEN: usize = 64;

/// How long the port drives reset
const PORT_RESET_MS: u32 = 100;
/// Recovery time after reset, before the first transaction
const RESET_RECOVERY_MS: u32 = 20;
/// Time for VBUS to settle after power up
const POWER_GOOD_MS: u32 = 200;

/// HPRT bits that clear when written with one
const HPRT_W1C: u32 = ral::otg::HPRT::PCDET::mask
    | ral::otg::HPRT::PENA::mask
    | ral::otg::HPRT::PENCHNG::mask
    | ral::otg::HPRT::POCCHNG::mask;

/// A USB host on top of the transaction core
pub struct Host {
    core: UsbCore,
    allocator: Allocator,
    watermark: Watermark,
    channels: [Channel; MAX_CHANNELS],
    /// One bit per allocated channel
    allocated: u16,
}

impl Host {
    /// Create a host, and assign it memory for channel buffers
    ///
    /// # Panics
    ///
    /// Panics if `memory` was already assigned to another driver.
    pub fn new<const SIZE: usize>(usb: UsbCore, memory: &'static EndpointMemory<SIZE>) -> Self {
        let allocator = memory
            .allocator()
            .expect("Endpoint memory already assigned");
        let watermark = allocator.watermark();
        Host {
            core: usb,
            allocator,
            watermark,
            channels: core::array::from_fn(|_| Channel::new()),
            allocated: 0,
        }
    }

    /// Bring up the core in host mode, and power the port
    pub fn initialize(&mut self, delay: &mut impl DelayNs) -> Result<()> {
        self.core.initialize(delay)?;
        self.core.set_mode(Mode::Host, delay);
        let regs = self.core.regs();
        let config = *self.core.config();

        ral::write_reg!(ral::otg, regs, PCGCCTL, 0);
        let fs_only = config.phy == Phy::Embedded || config.speed != Speed::High;
        ral::modify_reg!(ral::otg, regs, HCFG, FSLSPCS: CLK_48MHZ, FSLSS: fs_only as u32);

        let layout = FifoLayout::host(&config)?;
        self.core.apply_fifo_layout(&layout, Mode::Host);
        self.core.flush_all_tx_fifos(delay)?;
        self.core.flush_rx_fifo(delay)?;

        ral::write_reg!(ral::otg, regs, HAINTMSK, 0);
        ral::write_reg!(ral::otg, regs, HAINT, u32::MAX);
        for n in 0..config.channel_count() {
            self.reset_channel_registers(n);
        }
        self.set_port_power(true, delay);

        let mut interrupts = Interrupts::HOST_PORT
            | Interrupts::HOST_CHANNEL
            | Interrupts::DISCONNECT
            | Interrupts::SOF
            | Interrupts::INCOMPLETE_PERIODIC
            | Interrupts::MODE_MISMATCH;
        if !config.dma {
            interrupts |= Interrupts::RX_FIFO_LEVEL;
        }
        self.core.clear(Interrupts::all());
        self.core.set_mask(interrupts);
        self.core.enable_interrupts();
        debug!("Host initialized");
        Ok(())
    }

    /// Disable a channel and mask its interrupts
    fn reset_channel_registers(&self, n: usize) {
        let hc = &self.core.regs().hc[n];
        if ral::read_reg!(ral::hc, hc, HCCHAR, CHENA == 1) {
            ral::modify_reg!(ral::hc, hc, HCCHAR, CHDIS: 1, CHENA: 1);
        } else {
            ral::write_reg!(ral::hc, hc, HCCHAR, 0);
        }
        ral::write_reg!(ral::hc, hc, HCINTMSK, 0);
        ral::write_reg!(ral::hc, hc, HCTSIZ, 0);
        ral::write_reg!(ral::hc, hc, HCINT, 0x7FF);
    }

    pub fn core(&self) -> &UsbCore {
        &self.core
    }

    /// HPRT, without the bits that clear when written with one
    fn port_bits(&self) -> u32 {
        ral::read_reg!(ral::otg, self.core.regs(), HPRT) & !HPRT_W1C
    }

    /// Switch VBUS on the port
    ///
    /// Powering up waits for the supply to settle.
    pub fn set_port_power(&mut self, on: bool, delay: &mut impl DelayNs) {
        let hprt = if on {
            self.port_bits() | ral::otg::HPRT::PPWR::mask
        } else {
            self.port_bits() & !ral::otg::HPRT::PPWR::mask
        };
        ral::write_reg!(ral::otg, self.core.regs(), HPRT, hprt);
        if on {
            delay.delay_ms(POWER_GOOD_MS);
        }
    }

    /// Drive reset on the port, then wait out the recovery time
    ///
    /// The port reports [`PortEvents::ENABLED`] once the device is ready.
    /// This blocks for a little over 100ms.
    pub fn reset_port(&mut self, delay: &mut impl DelayNs) {
        let regs = self.core.regs();
        let hprt = self.port_bits();
        ral::write_reg!(ral::otg, regs, HPRT, hprt | ral::otg::HPRT::PRST::mask);
        delay.delay_ms(PORT_RESET_MS);
        let hprt = self.port_bits();
        ral::write_reg!(ral::otg, regs, HPRT, hprt & !ral::otg::HPRT::PRST::mask);
        delay.delay_ms(RESET_RECOVERY_MS);
        debug!("Port reset");
    }

    pub fn is_connected(&self) -> bool {
        ral::read_reg!(ral::otg, self.core.regs(), HPRT, PCSTS == 1)
    }

    pub fn is_port_enabled(&self) -> bool {
        ral::read_reg!(ral::otg, self.core.regs(), HPRT, PENA == 1)
    }

    /// Speed of the connected device
    pub fn port_speed(&self) -> Option<Speed> {
        if !self.is_connected() {
            return None;
        }
        Some(speed_from_bits(ral::read_reg!(
            ral::otg,
            self.core.regs(),
            HPRT,
            PSPD
        )))
    }

    /// Number of the frame on the bus
    pub fn frame_number(&self) -> u16 {
        ral::read_reg!(ral::otg, self.core.regs(), HFNUM, FRNUM) as u16
    }

    fn check_channel(&self, n: usize) -> Result<()> {
        if n < self.core.config().channel_count() && self.allocated & (1 << n) != 0 {
            Ok(())
        } else {
            Err(Error::InvalidChannel)
        }
    }

    /// Take the lowest free channel
    pub fn alloc_channel(&mut self) -> Result<usize> {
        let n = (0..self.core.config().channel_count())
            .find(|n| self.allocated & (1 << n) == 0)
            .ok_or(Error::NoFreeChannel)?;
        self.allocated |= 1 << n;
        let ch = &mut self.channels[n];
        ch.reset_transfer();
        ch.config = None;
        ch.status = ChannelStatus::Idle;
        Ok(n)
    }

    /// Return a channel to the pool, disabling it if it's busy
    ///
    /// The channel keeps its buffer for whoever allocates it next.
    pub fn free_channel(&mut self, n: usize) -> Result<()> {
        self.check_channel(n)?;
        self.reset_channel_registers(n);
        ral::modify_reg!(ral::otg, self.core.regs(), HAINTMSK, |haintmsk| haintmsk & !(1 << n));
        self.allocated &= !(1 << n);
        let ch = &mut self.channels[n];
        ch.reset_transfer();
        ch.config = None;
        ch.status = ChannelStatus::Free;
        Ok(())
    }

    /// Free every channel, and reclaim all channel buffers
    pub fn release_channels(&mut self) {
        for n in 0..self.core.config().channel_count() {
            if self.allocated & (1 << n) != 0 {
                self.reset_channel_registers(n);
            }
        }
        ral::write_reg!(ral::otg, self.core.regs(), HAINTMSK, 0);
        for ch in self.channels.iter_mut() {
            *ch = Channel::new();
        }
        self.allocated = 0;
        self.allocator.release_to(self.watermark);
    }

    /// Point channel `n` at a device endpoint
    ///
    /// Allocates the channel buffer, unless the one it has is big enough.
    /// The data toggle restarts at DATA0.
    pub fn init_channel(&mut self, n: usize, config: ChannelConfig) -> Result<()> {
        self.check_channel(n)?;
        if self.channels[n].status == ChannelStatus::Transferring {
            return Err(Error::ChannelBusy);
        }
        let port_low = self.port_speed() == Some(Speed::Low);
        let len = config.buffer_len.max(config.max_packet);
        let ch = &mut self.channels[n];
        if ch.buffer.as_ref().map_or(true, |buffer| buffer.len() < len) {
            let buffer = self
                .allocator
                .allocate(len)
                .ok_or(Error::EndpointMemoryOverflow)?;
            ch.buffer = Some(buffer);
        }

        let regs = self.core.regs();
        let hc = &regs.hc[n];
        ral::write_reg!(ral::hc, hc, HCINT, 0x7FF);
        ral::write_reg!(ral::hc, hc, HCINTMSK, config.interrupt_mask().bits());
        ral::write_reg!(ral::hc, hc, HCCHAR,
            MPSIZ: config.max_packet as u32,
            EPNUM: config.endpoint.index() as u32,
            EPDIR: config.is_in() as u32,
            LSDEV: (config.speed == Speed::Low && !port_low) as u32,
            EPTYP: config.type_bits(),
            MCNT: 1,
            DAD: u32::from(config.device_address & 0x7F)
        );
        ral::modify_reg!(ral::otg, regs, HAINTMSK, |haintmsk| haintmsk | (1 << n));
        self.core.unmask(Interrupts::HOST_CHANNEL);

        ch.reset_transfer();
        ch.config = Some(config);
        ch.toggle = false;
        ch.setup = false;
        ch.do_ping = false;
        ch.status = ChannelStatus::Idle;
        debug!("Channel {} for device {} endpoint {}", n, config.device_address, config.endpoint.index());
        Ok(())
    }

    /// Check that channel `n` is configured and free to start a transfer
    fn ready(&self, n: usize) -> Result<ChannelConfig> {
        self.check_channel(n)?;
        let ch = &self.channels[n];
        let config = ch.config.ok_or(Error::InvalidChannel)?;
        if ch.status == ChannelStatus::Transferring {
            return Err(Error::ChannelBusy);
        }
        Ok(config)
    }

    /// Start a transfer of `len` bytes
    ///
    /// OUT channels send the first `len` bytes of their buffer; see
    /// [`write()`](Host::write). IN channels receive up to `len` bytes, and
    /// finish early on a short packet.
    pub fn start_transfer(&mut self, n: usize, len: usize) -> Result<()> {
        let config = self.ready(n)?;
        let dma = self.core.config().dma;
        let mps = config.max_packet.max(1);
        let reach = if config.is_in() && dma {
            packet_count(len, mps).min(MAX_PACKETS) * mps
        } else {
            len
        };
        let ch = &mut self.channels[n];
        let buffer_len = ch.buffer.as_ref().map_or(0, |buffer| buffer.len());
        if reach.max(len) > buffer_len {
            return Err(Error::BufferOverflow);
        }
        ch.reset_transfer();
        ch.setup = false;
        ch.xfer_len = len;
        self.program(n);
        Ok(())
    }

    /// Send a SETUP packet on a control OUT channel
    ///
    /// Once it completes, the channel's toggle is DATA1 for the data stage.
    pub fn start_setup(&mut self, n: usize, setup: &SetupPacket) -> Result<()> {
        let config = self.ready(n)?;
        if config.kind != EndpointType::Control || config.is_in() {
            return Err(Error::InvalidEndpoint);
        }
        let ch = &mut self.channels[n];
        let buffer = ch.buffer.as_mut().ok_or(Error::InvalidChannel)?;
        if buffer.volatile_write(0, &setup.to_bytes()) < 8 {
            return Err(Error::BufferOverflow);
        }
        ch.reset_transfer();
        ch.setup = true;
        ch.xfer_len = 8;
        self.program(n);
        Ok(())
    }

    /// Copy `data` into an OUT channel's buffer and send it
    pub fn write(&mut self, n: usize, data: &[u8]) -> Result<usize> {
        let config = self.ready(n)?;
        if config.is_in() {
            return Err(Error::InvalidEndpoint);
        }
        let buffer = self.channels[n]
            .buffer
            .as_mut()
            .ok_or(Error::InvalidChannel)?;
        if data.len() > buffer.len() {
            return Err(Error::BufferOverflow);
        }
        buffer.volatile_write(0, data);
        self.start_transfer(n, data.len())?;
        Ok(data.len())
    }

    /// Copy what the last IN transfer received into `data`
    pub fn read(&mut self, n: usize, data: &mut [u8]) -> Result<usize> {
        let config = self.ready(n)?;
        if !config.is_in() {
            return Err(Error::InvalidEndpoint);
        }
        let ch = &self.channels[n];
        let buffer = ch.buffer.as_ref().ok_or(Error::InvalidChannel)?;
        let size = ch.xfer_count.min(data.len());
        if self.core.config().dma {
            buffer.clean_invalidate_dcache(size);
        }
        Ok(buffer.volatile_read(0, &mut data[..size]))
    }

    /// What channel `n` is doing; [`ChannelStatus::Free`] for channels that aren't allocated
    pub fn status(&self, n: usize) -> ChannelStatus {
        match self.check_channel(n) {
            Ok(()) => self.channels[n].status,
            Err(_) => ChannelStatus::Free,
        }
    }

    /// Bytes moved by the last (or current) transfer
    pub fn transferred(&self, n: usize) -> usize {
        self.channels.get(n).map_or(0, |ch| ch.xfer_count)
    }

    /// Consecutive transaction errors in the current transfer
    pub fn error_count(&self, n: usize) -> u8 {
        self.channels.get(n).map_or(0, |ch| ch.err_count)
    }

    /// `true` if the next data packet is DATA1
    pub fn data_toggle(&self, n: usize) -> bool {
        self.channels.get(n).map_or(false, |ch| ch.toggle)
    }

    /// Set the toggle for the next data packet
    ///
    /// Control transfers use this to start data and status stages at DATA1
    /// on the IN channel. A cleared halt restarts at DATA0.
    pub fn set_data_toggle(&mut self, n: usize, data1: bool) -> Result<()> {
        self.ready(n)?;
        self.channels[n].toggle = data1;
        Ok(())
    }

    /// Halt channel `n`
    ///
    /// The channel reports [`ChannelStatus::Halted`] once the core confirms
    /// the halt in [`on_interrupt()`](Host::on_interrupt). With no request
    /// queue slot free, the disable can't be issued yet: the request is
    /// kept and retried by the interrupt handler, and this returns
    /// [`Error::RequestQueueFull`]. Halting an idle channel does nothing.
    pub fn halt(&mut self, n: usize) -> Result<()> {
        self.check_channel(n)?;
        if self.channels[n].status != ChannelStatus::Transferring {
            return Ok(());
        }
        self.channels[n].reason = None;
        self.request_halt(n)
    }

    /// Disable channel `n`, or defer until the request queue has a free slot
    fn request_halt(&mut self, n: usize) -> Result<()> {
        let regs = self.core.regs();
        let ch = &mut self.channels[n];
        if ch.halt == HaltState::Requested {
            return Ok(());
        }
        let periodic = ch.config.map_or(false, |config| config.is_periodic());
        let slots = if periodic {
            ral::read_reg!(ral::otg, regs, HPTXSTS, PTXQSAV)
        } else {
            ral::read_reg!(ral::otg, regs, GNPTXSTS, NPTQXSAV)
        };
        if slots == 0 {
            if ch.halt != HaltState::Pending {
                debug!("Channel {} halt waits for a request slot", n);
            }
            ch.halt = HaltState::Pending;
            self.core.unmask(tx_empty(periodic));
            return Err(Error::RequestQueueFull);
        }
        let hc = &regs.hc[n];
        ral::modify_reg!(ral::hc, hc, HCINTMSK, |hcintmsk| hcintmsk | ChannelInterrupt::HALTED.bits());
        ral::modify_reg!(ral::hc, hc, HCCHAR, CHDIS: 1, CHENA: 1);
        ch.halt = HaltState::Requested;
        Ok(())
    }

    /// Program and enable the next chunk of channel `n`'s transfer
    ///
    /// Chunks hold at most 256 packets; a zero-length chunk is one packet.
    fn program(&mut self, n: usize) {
        let dma = self.core.config().dma;
        let regs = self.core.regs();
        let frame = ral::read_reg!(ral::otg, regs, HFNUM, FRNUM);
        let ch = &mut self.channels[n];
        let Some(config) = ch.config else {
            return;
        };
        let mps = config.max_packet.max(1);
        let remaining = ch.xfer_len.saturating_sub(ch.xfer_count);
        let packets = packet_count(remaining, mps).min(MAX_PACKETS);
        let size = if config.is_in() {
            packets * mps
        } else {
            remaining.min(packets * mps)
        };
        let pid = if ch.setup {
            ral::hc::HCTSIZ::DPID::RW::SETUP
        } else if ch.toggle && !config.is_isochronous() {
            ral::hc::HCTSIZ::DPID::RW::DATA1
        } else {
            ral::hc::HCTSIZ::DPID::RW::DATA0
        };
        let ping = ch.do_ping && config.pings() && !dma;

        let hc = &regs.hc[n];
        ral::write_reg!(ral::hc, hc, HCTSIZ,
            XFRSIZ: size as u32,
            PKTCNT: packets as u32,
            DPID: pid,
            DOPNG: ping as u32
        );
        if dma {
            if let Some(buffer) = &ch.buffer {
                buffer.clean_invalidate_dcache(ch.xfer_count + size);
                ral::write_reg!(ral::hc, hc, HCDMA, buffer.as_ptr() as u32 + ch.xfer_count as u32);
            }
        }
        if config.is_periodic() {
            // Go in the next frame
            let odd = frame & 1 == 0;
            ral::modify_reg!(ral::hc, hc, HCCHAR, ODDFRM: odd as u32);
        }

        ch.chunk_start = ch.xfer_count;
        ch.programmed = size;
        ch.packets = packets;
        ch.pushed = 0;
        ch.out_waiting = false;
        ch.reason = None;
        ch.halt = HaltState::None;
        ch.status = ChannelStatus::Transferring;
        ral::modify_reg!(ral::hc, hc, HCCHAR, CHDIS: 0, CHENA: 1);
        trace!("Channel {} start, {} bytes in {} packets", n, size, packets);

        if !dma && !config.is_in() && size > 0 {
            self.push_out(n);
        }
    }

    /// Queue OUT packets while the transmit FIFO and request queue have room
    ///
    /// Leaves the matching FIFO empty interrupt unmasked until the whole
    /// chunk is queued.
    fn push_out(&mut self, n: usize) {
        let regs = self.core.regs();
        let ch = &mut self.channels[n];
        let (Some(config), Some(buffer)) = (ch.config, ch.buffer.as_ref()) else {
            return;
        };
        let periodic = config.is_periodic();
        let mps = config.max_packet.max(1);
        while ch.pushed < ch.programmed {
            let len = (ch.programmed - ch.pushed).min(mps);
            let (space, slots) = if periodic {
                (
                    ral::read_reg!(ral::otg, regs, HPTXSTS, PTXFSAVL),
                    ral::read_reg!(ral::otg, regs, HPTXSTS, PTXQSAV),
                )
            } else {
                (
                    ral::read_reg!(ral::otg, regs, GNPTXSTS, NPTXFSAV),
                    ral::read_reg!(ral::otg, regs, GNPTXSTS, NPTQXSAV),
                )
            };
            if (space as usize) < len.div_ceil(4) || slots == 0 {
                break;
            }
            let mut staging = [0u8; STAGING_LEN];
            let mut sent = 0;
            while sent < len {
                let part = (len - sent).min(STAGING_LEN);
                buffer.volatile_read(ch.chunk_start + ch.pushed + sent, &mut staging[..part]);
                self.core.write_packet(n, &staging[..part]);
                sent += part;
            }
            ch.pushed += len;
        }
        ch.out_waiting = ch.pushed < ch.programmed;
        if ch.out_waiting {
            self.core.unmask(tx_empty(periodic));
        }
    }
}

/// The FIFO empty interrupt that serves periodic or non-periodic channels
fn tx_empty(periodic: bool) -> Interrupts {
    if periodic {
        Interrupts::P_TX_FIFO_EMPTY
    } else {
        Interrupts::NP_TX_FIFO_EMPTY
    }
}

fn speed_from_bits(pspd: u32) -> Speed {
    match pspd {
        ral::otg::HPRT::PSPD::RW::HIGH => Speed::High,
        ral::otg::HPRT::PSPD::RW::LOW => Speed::Low,
        _ => Speed::Full,
    }
}
