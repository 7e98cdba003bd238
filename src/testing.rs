//! Test doubles for the OTG hardware
//!
//! Registers live in zeroed, leaked memory. Reads return whatever was last
//! written, so tests raise interrupts by writing status registers directly.
//! The `Delay` mock emulates the bits that hardware clears on its own.

extern crate std;

use crate::{buffer::EndpointMemory, ral, ral::RegisterBlock, usbcore::Interrupts};
use embedded_hal::delay::DelayNs;
use std::boxed::Box;

/// A zeroed register block that lives for the rest of the test
pub fn registers() -> &'static RegisterBlock {
    let layout = std::alloc::Layout::new::<RegisterBlock>();
    // Safety: all-zero is a valid register block; it's never freed.
    unsafe {
        let ptr = std::alloc::alloc_zeroed(layout);
        assert!(!ptr.is_null());
        &*ptr.cast::<RegisterBlock>()
    }
}

pub struct Instance(&'static RegisterBlock);

unsafe impl crate::Peripherals for Instance {
    fn otg(&self) -> *const () {
        (self.0 as *const RegisterBlock).cast()
    }
}

pub fn instance() -> (Instance, &'static RegisterBlock) {
    let regs = registers();
    (Instance(regs), regs)
}

pub fn memory<const SIZE: usize>() -> &'static EndpointMemory<SIZE> {
    Box::leak(Box::new(EndpointMemory::new()))
}

/// Latch `interrupts` in the core status register, replacing what's there
pub fn raise(regs: &RegisterBlock, interrupts: Interrupts) {
    regs.GINTSTS.write(interrupts.bits());
}

/// Simulated time that also plays the part of the core
///
/// Every wait finishes pending soft reset and FIFO flush requests and
/// reports the AHB as idle, unless `stuck` is set.
pub struct Delay {
    regs: &'static RegisterBlock,
    elapsed_ns: u64,
    port_reset_ns: u64,
    pub stuck: bool,
}

impl Delay {
    pub fn new(regs: &'static RegisterBlock) -> Self {
        Delay {
            regs,
            elapsed_ns: 0,
            port_reset_ns: 0,
            stuck: false,
        }
    }

    pub fn elapsed_us(&self) -> u64 {
        self.elapsed_ns / 1_000
    }

    /// How long the port reset signal was held
    pub fn port_reset_ms(&self) -> u64 {
        self.port_reset_ns / 1_000_000
    }
}

impl DelayNs for Delay {
    fn delay_ns(&mut self, ns: u32) {
        self.elapsed_ns += u64::from(ns);
        if ral::read_reg!(ral::otg, self.regs, HPRT, PRST == 1) {
            self.port_reset_ns += u64::from(ns);
        }
        if !self.stuck {
            ral::modify_reg!(ral::otg, self.regs, GRSTCTL, CSRST: 0, RXFFLSH: 0, TXFFLSH: 0, AHBIDL: 1);
        }
    }
}

/// Zero the write-one-to-clear status registers
///
/// Acknowledging an interrupt writes ones, which RAM keeps. Call this
/// between dispatch passes.
pub fn clear_latched(regs: &RegisterBlock) {
    regs.GINTSTS.write(0);
    regs.GOTGINT.write(0);
    regs.DAINT.write(0);
    regs.HAINT.write(0);
    for inep in &regs.inep {
        inep.DIEPINT.write(0);
    }
    for outep in &regs.outep {
        outep.DOEPINT.write(0);
    }
    for channel in &regs.hc {
        channel.HCINT.write(0);
    }
}
