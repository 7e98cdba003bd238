//! Transaction core
//!
//! `UsbCore` owns the OTG register block and everything that's shared by the
//! device and host engines: core soft reset, PHY and mode selection, the
//! global interrupt mask, the FIFO partition, and raw packet I/O through the
//! FIFO windows.

use crate::{
    config::{Config, Phy},
    error::{Error, Result},
    fifo::FifoLayout,
    ral::{self, RegisterBlock, FIFO_WINDOW_WORDS},
};
use embedded_hal::delay::DelayNs;

bitflags::bitflags! {
    /// Core interrupt status and mask bits
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Interrupts : u32 {
        const CURRENT_MODE = 1 << 0;
        const MODE_MISMATCH = 1 << 1;
        const OTG = 1 << 2;
        const SOF = 1 << 3;
        const RX_FIFO_LEVEL = 1 << 4;
        const NP_TX_FIFO_EMPTY = 1 << 5;
        const GLOBAL_IN_NAK = 1 << 6;
        const GLOBAL_OUT_NAK = 1 << 7;
        const EARLY_SUSPEND = 1 << 10;
        const SUSPEND = 1 << 11;
        const RESET = 1 << 12;
        const ENUM_DONE = 1 << 13;
        const ISO_OUT_DROP = 1 << 14;
        const END_OF_PERIODIC_FRAME = 1 << 15;
        const IN_ENDPOINT = 1 << 18;
        const OUT_ENDPOINT = 1 << 19;
        const INCOMPLETE_ISO_IN = 1 << 20;
        /// Incomplete isochronous OUT in device mode
        const INCOMPLETE_ISO_OUT = 1 << 21;
        /// Incomplete periodic transfer in host mode
        const INCOMPLETE_PERIODIC = 1 << 21;
        const HOST_PORT = 1 << 24;
        const HOST_CHANNEL = 1 << 25;
        const P_TX_FIFO_EMPTY = 1 << 26;
        const CONNECTOR_ID = 1 << 28;
        const DISCONNECT = 1 << 29;
        const SESSION_REQUEST = 1 << 30;
        const WAKEUP = 1 << 31;
    }
}

/// Core operating mode
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    Device,
    Host,
}

/// Poll budget for the reset and flush handshakes, one microsecond per poll
const POLL_LIMIT: u32 = 200_000;

/// Spins without waiting
///
/// Used where the caller can't block, like the interrupt handlers.
pub(crate) struct Spin;

impl DelayNs for Spin {
    fn delay_ns(&mut self, _: u32) {
        core::hint::spin_loop();
    }
}

/// The transaction core
pub struct UsbCore {
    regs: &'static RegisterBlock,
    config: Config,
}

// Safety: the register block is owned by this object; see `Peripherals`.
unsafe impl Send for UsbCore {}

impl UsbCore {
    /// Take ownership of the OTG registers
    ///
    /// Nothing is written to the hardware until [`initialize()`](UsbCore::initialize).
    pub fn new<P: crate::Peripherals>(peripherals: P, config: Config) -> Self {
        // Safety: the Peripherals contract says that the address is
        // valid and uniquely owned.
        let regs = unsafe { &*peripherals.otg().cast::<RegisterBlock>() };
        UsbCore { regs, config }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub(crate) fn regs(&self) -> &'static RegisterBlock {
        self.regs
    }

    /// Returns the value of the core ID register
    pub fn core_id(&self) -> u32 {
        ral::read_reg!(ral::otg, self.regs, CID)
    }

    /// Select the PHY, soft-reset the core, and set up the AHB interface
    ///
    /// The global interrupt stays masked; the device and host engines
    /// enable it once their own state is ready.
    pub fn initialize(&mut self, delay: &mut impl DelayNs) -> Result<()> {
        self.disable_interrupts();
        if self.config.core_id != 0 && self.core_id() != self.config.core_id {
            warn!("Unexpected OTG core ID {:#x}", self.core_id());
        }

        match self.config.phy {
            Phy::Embedded => {
                ral::modify_reg!(ral::otg, self.regs, GUSBCFG, PHYSEL: 1);
                self.reset(delay)?;
                ral::modify_reg!(ral::otg, self.regs, GCCFG, PWRDWN: 1);
            }
            Phy::Ulpi => {
                ral::modify_reg!(ral::otg, self.regs, GCCFG, PWRDWN: 0);
                ral::modify_reg!(
                    ral::otg,
                    self.regs,
                    GUSBCFG,
                    PHYSEL: 0,
                    TSDPS: 0,
                    ULPIFSLS: 0,
                    ULPIEVBUSD: self.config.vbus_sensing as u32,
                    ULPIEVBUSI: 0
                );
                self.reset(delay)?;
            }
        }

        if self.config.vbus_sensing {
            ral::modify_reg!(ral::otg, self.regs, GCCFG, NOVBUSSENS: 0, VBUSBSEN: 1);
        } else {
            ral::modify_reg!(ral::otg, self.regs, GCCFG, NOVBUSSENS: 1, VBUSBSEN: 0, VBUSASEN: 0);
        }
        ral::modify_reg!(ral::otg, self.regs, GCCFG, SOFOUTEN: self.config.sof_output as u32);

        if self.config.dma {
            ral::modify_reg!(ral::otg, self.regs, GAHBCFG, HBSTLEN: INCR4, DMAEN: 1);
        }
        debug!("OTG core initialized, DMA: {}", self.config.dma);
        Ok(())
    }

    /// Core soft reset
    ///
    /// Waits for the AHB master to go idle, asserts the soft reset, then
    /// waits for the core to release it. Fails if either handshake doesn't
    /// settle within the poll budget.
    pub fn reset(&mut self, delay: &mut impl DelayNs) -> Result<()> {
        let regs = self.regs;
        if !poll(delay, || ral::read_reg!(ral::otg, regs, GRSTCTL, AHBIDL == 1)) {
            error!("AHB never became idle");
            return Err(Error::CoreResetTimeout);
        }
        ral::modify_reg!(ral::otg, regs, GRSTCTL, CSRST: 1);
        if !poll(delay, || ral::read_reg!(ral::otg, regs, GRSTCTL, CSRST == 0)) {
            error!("Core soft reset never completed");
            return Err(Error::CoreResetTimeout);
        }
        // A few PHY clocks before the core is usable again
        delay.delay_us(3);
        Ok(())
    }

    /// Force the core into device or host mode
    pub fn set_mode(&mut self, mode: Mode, delay: &mut impl DelayNs) {
        match mode {
            Mode::Device => ral::modify_reg!(ral::otg, self.regs, GUSBCFG, FHMOD: 0, FDMOD: 1),
            Mode::Host => ral::modify_reg!(ral::otg, self.regs, GUSBCFG, FHMOD: 1, FDMOD: 0),
        }
        delay.delay_ms(50);
    }

    /// The mode that the core is operating in right now
    pub fn mode(&self) -> Mode {
        if ral::read_reg!(ral::otg, self.regs, GINTSTS, CMOD == HOST) {
            Mode::Host
        } else {
            Mode::Device
        }
    }

    pub fn enable_interrupts(&self) {
        ral::modify_reg!(ral::otg, self.regs, GAHBCFG, GINT: 1);
    }

    pub fn disable_interrupts(&self) {
        ral::modify_reg!(ral::otg, self.regs, GAHBCFG, GINT: 0);
    }

    /// Interrupts that are both raised and unmasked
    pub fn pending(&self) -> Interrupts {
        let status = ral::read_reg!(ral::otg, self.regs, GINTSTS);
        let mask = ral::read_reg!(ral::otg, self.regs, GINTMSK);
        Interrupts::from_bits_truncate(status & mask)
    }

    /// Acknowledge latched interrupts
    pub fn clear(&self, interrupts: Interrupts) {
        ral::write_reg!(ral::otg, self.regs, GINTSTS, interrupts.bits());
    }

    pub fn unmask(&self, interrupts: Interrupts) {
        ral::modify_reg!(ral::otg, self.regs, GINTMSK, |gintmsk| gintmsk | interrupts.bits());
    }

    pub fn mask(&self, interrupts: Interrupts) {
        ral::modify_reg!(ral::otg, self.regs, GINTMSK, |gintmsk| gintmsk & !interrupts.bits());
    }

    /// Replace the whole interrupt mask
    pub fn set_mask(&self, interrupts: Interrupts) {
        ral::write_reg!(ral::otg, self.regs, GINTMSK, interrupts.bits());
    }

    /// Flush one transmit FIFO, or all of them with `0x10`
    pub fn flush_tx_fifo(&self, fifo: u32, delay: &mut impl DelayNs) -> Result<()> {
        let regs = self.regs;
        ral::write_reg!(ral::otg, regs, GRSTCTL, TXFFLSH: 1, TXFNUM: fifo);
        if poll(delay, || ral::read_reg!(ral::otg, regs, GRSTCTL, TXFFLSH == 0)) {
            Ok(())
        } else {
            Err(Error::FifoFlushTimeout)
        }
    }

    pub fn flush_all_tx_fifos(&self, delay: &mut impl DelayNs) -> Result<()> {
        self.flush_tx_fifo(ral::otg::GRSTCTL::TXFNUM::RW::ALL, delay)
    }

    pub fn flush_rx_fifo(&self, delay: &mut impl DelayNs) -> Result<()> {
        let regs = self.regs;
        ral::write_reg!(ral::otg, regs, GRSTCTL, RXFFLSH: 1);
        if poll(delay, || ral::read_reg!(ral::otg, regs, GRSTCTL, RXFFLSH == 0)) {
            Ok(())
        } else {
            Err(Error::FifoFlushTimeout)
        }
    }

    /// Program the FIFO partition for `mode`
    pub fn apply_fifo_layout(&self, layout: &FifoLayout, mode: Mode) {
        ral::write_reg!(ral::otg, self.regs, GRXFSIZ, RXFD: u32::from(layout.rx.depth));
        ral::write_reg!(ral::otg, self.regs, GNPTXFSIZ, layout.tx[0].register_value());
        match mode {
            Mode::Host => {
                ral::write_reg!(ral::otg, self.regs, HPTXFSIZ, layout.tx[1].register_value());
            }
            Mode::Device => {
                for (dieptxf, region) in self
                    .regs
                    .DIEPTXF
                    .iter()
                    .zip(&layout.tx[1..layout.tx_count.max(1)])
                {
                    dieptxf.write(region.register_value());
                }
            }
        }
    }

    /// Copy `bytes` into the transmit FIFO `fifo`
    ///
    /// Writes `ceil(len / 4)` words; the tail of the last word is padding.
    /// The caller has checked that the FIFO has room. With DMA enabled the
    /// core fetches data itself, and this does nothing.
    pub fn write_packet(&self, fifo: usize, bytes: &[u8]) {
        if self.config.dma {
            return;
        }
        let window = &self.regs.fifo[fifo % self.regs.fifo.len()];
        for (slot, chunk) in window.iter().cycle().zip(bytes.chunks(4)) {
            let mut word = [0u8; 4];
            word[..chunk.len()].copy_from_slice(chunk);
            slot.write(u32::from_le_bytes(word));
        }
    }

    /// Copy the next `bytes.len()` bytes out of the receive FIFO
    ///
    /// Reads `ceil(len / 4)` words; padding in the last word is dropped.
    pub fn read_packet(&self, bytes: &mut [u8]) {
        let window = &self.regs.fifo[0];
        for (slot, chunk) in window.iter().cycle().zip(bytes.chunks_mut(4)) {
            let word = slot.read().to_le_bytes();
            chunk.copy_from_slice(&word[..chunk.len()]);
        }
    }

    /// Pop and drop `len` bytes from the receive FIFO
    pub fn discard_packet(&self, len: usize) {
        let words = len.div_ceil(4).min(FIFO_WINDOW_WORDS);
        for slot in &self.regs.fifo[0][..words] {
            slot.read();
        }
    }

    /// Pop the next receive status word
    pub(crate) fn pop_status(&self) -> u32 {
        ral::read_reg!(ral::otg, self.regs, GRXSTSP)
    }
}

/// Poll `done` once per microsecond, up to the poll budget
fn poll(delay: &mut impl DelayNs, mut done: impl FnMut() -> bool) -> bool {
    for _ in 0..POLL_LIMIT {
        if done() {
            return true;
        }
        delay.delay_us(1);
    }
    done()
}

#[cfg(test)]
mod tests {
    use super::{Interrupts, Mode, UsbCore};
    use crate::{config::Config, error::Error, fifo::FifoLayout, ral, testing};

    fn core() -> (UsbCore, testing::Delay) {
        let (instance, regs) = testing::instance();
        (UsbCore::new(instance, Config::full_speed()), testing::Delay::new(regs))
    }

    #[test]
    fn reset_handshake() {
        let (mut core, mut delay) = core();
        core.reset(&mut delay).unwrap();
        assert!(ral::read_reg!(ral::otg, core.regs(), GRSTCTL, CSRST == 0));
        assert!(delay.elapsed_us() >= 3);
    }

    #[test]
    fn reset_times_out_when_stuck() {
        let (mut core, mut delay) = core();
        delay.stuck = true;
        assert_eq!(core.reset(&mut delay), Err(Error::CoreResetTimeout));
    }

    #[test]
    fn initialize_embedded_phy() {
        let (mut core, mut delay) = core();
        core.initialize(&mut delay).unwrap();
        let regs = core.regs();
        assert!(ral::read_reg!(ral::otg, regs, GUSBCFG, PHYSEL == 1));
        assert!(ral::read_reg!(ral::otg, regs, GCCFG, PWRDWN == 1));
        assert!(ral::read_reg!(ral::otg, regs, GCCFG, NOVBUSSENS == 1));
        assert!(ral::read_reg!(ral::otg, regs, GAHBCFG, GINT == 0));
        assert!(ral::read_reg!(ral::otg, regs, GAHBCFG, DMAEN == 0));
    }

    #[test]
    fn forced_mode() {
        let (mut core, mut delay) = core();
        core.set_mode(Mode::Host, &mut delay);
        let regs = core.regs();
        assert!(ral::read_reg!(ral::otg, regs, GUSBCFG, FHMOD == 1));
        assert!(ral::read_reg!(ral::otg, regs, GUSBCFG, FDMOD == 0));
        assert!(delay.elapsed_us() >= 50_000);

        assert_eq!(core.mode(), Mode::Device);
        ral::write_reg!(ral::otg, regs, GINTSTS, CMOD: HOST);
        assert_eq!(core.mode(), Mode::Host);
    }

    #[test]
    fn packet_round_trip() {
        let (core, _) = core();
        let data = [1u8, 2, 3, 4, 5, 6, 7];
        core.write_packet(0, &data);
        // The padding byte stays in the FIFO word
        assert_eq!(core.regs().fifo[0][1].read(), 0x00_07_06_05);

        let mut out = [0u8; 7];
        core.read_packet(&mut out);
        assert_eq!(out, data);
    }

    #[test]
    fn write_packet_skips_fifo_with_dma() {
        let (instance, regs) = testing::instance();
        let core = UsbCore::new(instance, Config::full_speed().with_dma(true));
        core.write_packet(1, &[0xAA; 4]);
        assert_eq!(regs.fifo[1][0].read(), 0);
    }

    #[test]
    fn pending_respects_mask() {
        let (core, _) = core();
        testing::raise(core.regs(), Interrupts::RESET | Interrupts::SOF);
        assert!(core.pending().is_empty());
        core.unmask(Interrupts::RESET);
        assert_eq!(core.pending(), Interrupts::RESET);
        core.mask(Interrupts::RESET);
        assert!(core.pending().is_empty());
    }

    #[test]
    fn flush_fifos() {
        let (core, mut delay) = core();
        core.flush_tx_fifo(2, &mut delay).unwrap();
        core.flush_rx_fifo(&mut delay).unwrap();
        assert!(ral::read_reg!(ral::otg, core.regs(), GRSTCTL, TXFFLSH == 0));

        delay.stuck = true;
        assert_eq!(core.flush_all_tx_fifos(&mut delay), Err(Error::FifoFlushTimeout));
    }

    #[test]
    fn device_fifo_registers() {
        let (core, _) = core();
        let layout = FifoLayout::device(core.config()).unwrap();
        core.apply_fifo_layout(&layout, Mode::Device);
        let regs = core.regs();
        assert_eq!(regs.GRXFSIZ.read(), 128);
        assert_eq!(regs.GNPTXFSIZ.read(), 128 | (64 << 16));
        assert_eq!(regs.DIEPTXF[0].read(), 192 | (64 << 16));
        assert_eq!(regs.DIEPTXF[2].read(), 288 | (32 << 16));
        assert_eq!(regs.DIEPTXF[3].read(), 0);
    }
}
