//! Device and host transaction engines for DesignWare USB OTG cores
//!
//! `dwc-otg` drives the OTG controller found in many microcontrollers, in
//! either operating mode:
//!
//! - [`Device`] runs endpoint transfers and EP0 control transfers, and
//!   dispatches hardware events to a [`Class`]. A [`Session`] answers the
//!   standard requests and tracks the device state on top of it.
//! - [`Host`] powers and resets the root port, and moves transfers through
//!   host channels.
//!
//! Both sit on a [`UsbCore`], which owns the registers, the FIFO partition,
//! and the core interrupt mask. Describe the core with a [`Config`], and
//! hand the driver its registers through a safe implementation of
//! [`Peripherals`]. Transfer buffers come from a static [`EndpointMemory`].
//!
//! The engines never block in their interrupt handlers. Calls that wait,
//! like core initialization and port reset, take an
//! [`embedded_hal::delay::DelayNs`].

#![no_std]

#[macro_use]
mod log;

mod buffer;
mod cache;
mod ral;
mod vcell;

#[cfg(test)]
mod testing;

pub mod class;
pub mod config;
pub mod device;
pub mod error;
pub mod fifo;
pub mod host;
pub mod session;
pub mod setup;
pub mod usbcore;

pub use buffer::EndpointMemory;
pub use class::{Class, ControlResponse};
pub use config::{Config, Phy, Speed};
pub use device::Device;
pub use error::{Error, Result};
pub use host::Host;
pub use session::{DeviceState, Session};
pub use setup::SetupPacket;
pub use usbcore::{Interrupts, Mode, UsbCore};

/// Endpoints per direction that the register block covers
pub const MAX_ENDPOINTS: usize = 16;

/// Host channels that the register block covers
pub const MAX_CHANNELS: usize = 16;

/// A type that owns an OTG core's register block
///
/// # Safety
///
/// `Peripherals` should only be implemented on a type that owns the OTG
/// register block: global, host, device, power and FIFO registers, as one
/// contiguous region. The pointer returned by [`otg()`](Peripherals::otg)
/// is assumed to be valid for the life of the driver, and will be cast to a
/// register definition.
///
/// # Example
///
/// A safe implementation of `Peripherals` for the OTG_FS core of an STM32F4.
///
/// ```no_run
/// use dwc_otg::Peripherals;
///
/// pub struct OtgFs {
///     _private: (),
/// }
///
/// static mut TAKEN: bool = false;
///
/// impl OtgFs {
///     /// Returns `None` if the instance is already taken
///     pub fn take() -> Option<Self> {
///         cortex_m::interrupt::free(|_| unsafe {
///             if TAKEN {
///                 None
///             } else {
///                 TAKEN = true;
///                 Some(OtgFs { _private: () })
///             }
///         })
///     }
/// }
///
/// unsafe impl Peripherals for OtgFs {
///     fn otg(&self) -> *const () {
///         0x5000_0000 as *const ()
///     }
/// }
///
/// let instance = OtgFs::take().unwrap();
/// assert_eq!(instance.otg(), 0x5000_0000 as *const ());
/// ```
pub unsafe trait Peripherals {
    /// Returns the address of the OTG register block
    fn otg(&self) -> *const ();
}
