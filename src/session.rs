//! Standard request handling
//!
//! [`Session`] answers the USB chapter 9 requests that belong to the device
//! itself, tracks the device state, and hands everything else to the class
//! that it wraps. Pass a `Session` to [`Device::on_interrupt()`].
//!
//! ```no_run
//! use dwc_otg::{Class, ControlResponse, Device, SetupPacket, Session};
//!
//! struct Descriptors;
//!
//! impl Class for Descriptors {
//!     fn setup<'a>(&'a mut self, _: &mut Device, _: &SetupPacket) -> ControlResponse<'a> {
//!         // Answer GET_DESCRIPTOR here
//!         ControlResponse::Reject
//!     }
//! }
//!
//! let mut session = Session::new(Descriptors).with_self_powered(true);
//! # let device: &mut Device = todo!();
//! device.on_interrupt(&mut session);
//! ```

use crate::{
    class::{Class, ControlResponse},
    config::Speed,
    device::Device,
    setup::SetupPacket,
};
use usb_device::{
    control::{Recipient, Request, RequestType},
    endpoint::EndpointAddress,
    UsbDirection,
};

/// USB device states that the session tracks
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceState {
    /// Reset, responding at address 0
    Default,
    Addressed,
    Configured,
    Suspended,
}

/// Standard request handler wrapping a class
pub struct Session<C> {
    class: C,
    state: DeviceState,
    /// State to restore on resume
    resume_state: DeviceState,
    configuration: u8,
    remote_wakeup: bool,
    self_powered: bool,
    reply: [u8; 2],
}

impl<C: Class> Session<C> {
    pub const fn new(class: C) -> Self {
        Session {
            class,
            state: DeviceState::Default,
            resume_state: DeviceState::Default,
            configuration: 0,
            remote_wakeup: false,
            self_powered: false,
            reply: [0; 2],
        }
    }

    /// Report the device as self powered in GET_STATUS
    pub const fn with_self_powered(mut self, self_powered: bool) -> Self {
        self.self_powered = self_powered;
        self
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    /// The selected configuration, or 0
    pub fn configuration(&self) -> u8 {
        self.configuration
    }

    /// Indicates if the host allowed remote wakeup
    pub fn remote_wakeup_enabled(&self) -> bool {
        self.remote_wakeup
    }

    pub fn class(&self) -> &C {
        &self.class
    }

    pub fn class_mut(&mut self) -> &mut C {
        &mut self.class
    }

    pub fn into_inner(self) -> C {
        self.class
    }

    fn configured(&self) -> bool {
        self.state == DeviceState::Configured
    }

    /// Leave the current configuration, if any
    fn deconfigure(&mut self, device: &mut Device) {
        if self.configuration != 0 {
            let configuration = self.configuration;
            self.configuration = 0;
            debug!("Left configuration {}", configuration);
            self.class.device_deconfigured(device, configuration);
        }
    }

    fn device_request<'a>(
        &'a mut self,
        device: &mut Device,
        setup: &SetupPacket,
    ) -> ControlResponse<'a> {
        match (setup.direction(), setup.request) {
            (UsbDirection::In, Request::GET_STATUS) => {
                let status = u8::from(self.self_powered) | (u8::from(self.remote_wakeup) << 1);
                self.reply = [status, 0];
                ControlResponse::DataIn(&self.reply)
            }
            (UsbDirection::Out, Request::CLEAR_FEATURE)
                if setup.value == Request::FEATURE_DEVICE_REMOTE_WAKEUP =>
            {
                self.remote_wakeup = false;
                ControlResponse::Accept
            }
            (UsbDirection::Out, Request::SET_FEATURE)
                if setup.value == Request::FEATURE_DEVICE_REMOTE_WAKEUP =>
            {
                self.remote_wakeup = true;
                ControlResponse::Accept
            }
            (UsbDirection::Out, Request::SET_ADDRESS) => {
                if setup.value > 127 || self.configured() {
                    return ControlResponse::Reject;
                }
                let address = setup.value as u8;
                device.set_address(address);
                self.state = if address == 0 {
                    DeviceState::Default
                } else {
                    DeviceState::Addressed
                };
                debug!("Address {}", address);
                ControlResponse::Accept
            }
            (UsbDirection::Out, Request::SET_CONFIGURATION) => {
                let value = setup.value;
                if self.state == DeviceState::Default
                    || value > u16::from(self.class.configurations())
                {
                    return ControlResponse::Reject;
                }
                self.deconfigure(device);
                if value == 0 {
                    self.state = DeviceState::Addressed;
                } else {
                    self.configuration = value as u8;
                    self.state = DeviceState::Configured;
                    debug!("Configuration {}", value);
                    self.class.device_configured(device, value as u8);
                }
                ControlResponse::Accept
            }
            (UsbDirection::In, Request::GET_CONFIGURATION) => {
                self.reply[0] = self.configuration;
                ControlResponse::DataIn(&self.reply[..1])
            }
            (UsbDirection::In, Request::GET_DESCRIPTOR) => self.class.setup(device, setup),
            _ => ControlResponse::Reject,
        }
    }

    fn endpoint_request<'a>(
        &'a mut self,
        device: &mut Device,
        setup: &SetupPacket,
    ) -> ControlResponse<'a> {
        let address = EndpointAddress::from(setup.index as u8);
        match (setup.direction(), setup.request) {
            (UsbDirection::In, Request::GET_STATUS) => {
                if address.index() != 0 && !self.configured() {
                    return ControlResponse::Reject;
                }
                self.reply = [u8::from(device.is_stalled(address)), 0];
                ControlResponse::DataIn(&self.reply)
            }
            (UsbDirection::Out, Request::SET_FEATURE | Request::CLEAR_FEATURE)
                if setup.value == Request::FEATURE_ENDPOINT_HALT =>
            {
                if address.index() == 0 {
                    return ControlResponse::Accept;
                }
                if !self.configured() {
                    return ControlResponse::Reject;
                }
                if setup.request == Request::SET_FEATURE {
                    match device.set_stall(address) {
                        Ok(()) => ControlResponse::Accept,
                        Err(_) => ControlResponse::Reject,
                    }
                } else {
                    if device.clear_stall(address).is_err() {
                        return ControlResponse::Reject;
                    }
                    self.class.endpoint_halt_cleared(device, address);
                    ControlResponse::Accept
                }
            }
            (UsbDirection::In, Request::SYNCH_FRAME) if self.configured() => {
                self.class.setup(device, setup)
            }
            _ => ControlResponse::Reject,
        }
    }
}

impl<C: Class> Class for Session<C> {
    fn device_reset(&mut self, device: &mut Device, speed: Speed) {
        self.deconfigure(device);
        self.state = DeviceState::Default;
        self.resume_state = DeviceState::Default;
        self.remote_wakeup = false;
        self.class.device_reset(device, speed);
    }

    fn configurations(&self) -> u8 {
        self.class.configurations()
    }

    fn setup<'a>(&'a mut self, device: &mut Device, setup: &SetupPacket) -> ControlResponse<'a> {
        match (setup.kind(), setup.recipient()) {
            (_, Recipient::Reserved) | (RequestType::Reserved, _) => ControlResponse::Reject,
            (RequestType::Standard, Recipient::Device) => self.device_request(device, setup),
            (RequestType::Standard, Recipient::Interface) if self.configured() => {
                self.class.setup(device, setup)
            }
            (RequestType::Standard, Recipient::Endpoint) => self.endpoint_request(device, setup),
            (RequestType::Standard, _) => ControlResponse::Reject,
            _ => self.class.setup(device, setup),
        }
    }

    fn control_out(&mut self, device: &mut Device, setup: &SetupPacket) -> bool {
        self.class.control_out(device, setup)
    }

    fn endpoint_halt_cleared(&mut self, device: &mut Device, endpoint: EndpointAddress) {
        self.class.endpoint_halt_cleared(device, endpoint);
    }

    fn control_complete(&mut self, device: &mut Device, setup: &SetupPacket) {
        self.class.control_complete(device, setup);
    }

    fn data_in(&mut self, device: &mut Device, endpoint: EndpointAddress) {
        if self.configured() {
            self.class.data_in(device, endpoint);
        }
    }

    fn data_out(&mut self, device: &mut Device, endpoint: EndpointAddress, len: usize) {
        if self.configured() {
            self.class.data_out(device, endpoint, len);
        }
    }

    fn sof(&mut self, device: &mut Device) {
        if self.configured() {
            self.class.sof(device);
        }
    }

    fn suspended(&mut self, device: &mut Device) {
        if self.state != DeviceState::Suspended {
            self.resume_state = self.state;
            self.state = DeviceState::Suspended;
        }
        self.class.suspended(device);
    }

    fn resumed(&mut self, device: &mut Device) {
        if self.state == DeviceState::Suspended {
            self.state = self.resume_state;
        }
        self.class.resumed(device);
    }

    fn connected(&mut self, device: &mut Device) {
        self.class.connected(device);
    }

    fn disconnected(&mut self, device: &mut Device) {
        self.deconfigure(device);
        self.state = DeviceState::Default;
        self.class.disconnected(device);
    }

    fn iso_in_incomplete(&mut self, device: &mut Device) {
        if self.configured() {
            self.class.iso_in_incomplete(device);
        }
    }

    fn iso_out_incomplete(&mut self, device: &mut Device) {
        if self.configured() {
            self.class.iso_out_incomplete(device);
        }
    }
}
