//! Class binding
//!
//! The device engine calls into a [`Class`] from its interrupt handler, in
//! the order that the hardware raised the events. Every callback receives
//! the [`Device`] so it can queue the next transfer before returning.

use crate::{config::Speed, device::Device, setup::SetupPacket};
use usb_device::endpoint::EndpointAddress;

/// How a class answers a SETUP request
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlResponse<'a> {
    /// Accept the request; for host to device requests, receive the data stage
    Accept,
    /// Send these bytes in the data stage
    DataIn(&'a [u8]),
    /// Stall the request
    Reject,
}

/// Callbacks for a USB class, or for a stack of classes
///
/// Only [`setup()`](Class::setup) is required. A class sees only the
/// requests that the [`Session`](crate::Session) doesn't answer itself.
pub trait Class {
    /// A bus reset finished and the link runs at `speed`
    fn device_reset(&mut self, _device: &mut Device, _speed: Speed) {}

    /// The host selected configuration `config`
    fn device_configured(&mut self, _device: &mut Device, _config: u8) {}

    /// The host left configuration `config`
    fn device_deconfigured(&mut self, _device: &mut Device, _config: u8) {}

    /// Number of configurations the class offers
    fn configurations(&self) -> u8 {
        1
    }

    /// A SETUP request arrived
    fn setup<'a>(&'a mut self, device: &mut Device, setup: &SetupPacket) -> ControlResponse<'a>;

    /// The OUT data stage of `setup` arrived; read it with
    /// [`Device::control_data()`]. Return `false` to stall.
    fn control_out(&mut self, _device: &mut Device, _setup: &SetupPacket) -> bool {
        true
    }

    /// The host cleared ENDPOINT_HALT on `endpoint`, and its data toggle
    /// is back to DATA0
    fn endpoint_halt_cleared(&mut self, _device: &mut Device, _endpoint: EndpointAddress) {}

    /// The status stage of `setup` completed
    fn control_complete(&mut self, _device: &mut Device, _setup: &SetupPacket) {}

    /// An IN transfer on `endpoint` completed
    fn data_in(&mut self, _device: &mut Device, _endpoint: EndpointAddress) {}

    /// An OUT transfer on `endpoint` completed with `len` bytes
    fn data_out(&mut self, _device: &mut Device, _endpoint: EndpointAddress, _len: usize) {}

    fn sof(&mut self, _device: &mut Device) {}

    fn suspended(&mut self, _device: &mut Device) {}

    fn resumed(&mut self, _device: &mut Device) {}

    /// VBUS became valid
    fn connected(&mut self, _device: &mut Device) {}

    /// VBUS went away
    fn disconnected(&mut self, _device: &mut Device) {}

    fn iso_in_incomplete(&mut self, _device: &mut Device) {}

    fn iso_out_incomplete(&mut self, _device: &mut Device) {}
}
