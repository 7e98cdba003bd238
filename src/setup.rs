//! Control transfer setup packets

use usb_device::{
    control::{Recipient, Request, RequestType},
    UsbDirection,
};

/// The 8-byte header of a control transfer
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SetupPacket {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl SetupPacket {
    /// Parse the little-endian wire layout
    pub const fn parse(bytes: &[u8; 8]) -> Self {
        SetupPacket {
            request_type: bytes[0],
            request: bytes[1],
            value: u16::from_le_bytes([bytes[2], bytes[3]]),
            index: u16::from_le_bytes([bytes[4], bytes[5]]),
            length: u16::from_le_bytes([bytes[6], bytes[7]]),
        }
    }

    pub fn to_bytes(&self) -> [u8; 8] {
        let [value_lo, value_hi] = self.value.to_le_bytes();
        let [index_lo, index_hi] = self.index.to_le_bytes();
        let [length_lo, length_hi] = self.length.to_le_bytes();
        [
            self.request_type,
            self.request,
            value_lo,
            value_hi,
            index_lo,
            index_hi,
            length_lo,
            length_hi,
        ]
    }

    /// Direction of the data stage
    ///
    /// Requests without a data stage report `Out`, but have no data.
    pub fn direction(&self) -> UsbDirection {
        if self.request_type & 0x80 != 0 {
            UsbDirection::In
        } else {
            UsbDirection::Out
        }
    }

    pub fn kind(&self) -> RequestType {
        match (self.request_type >> 5) & 0b11 {
            0 => RequestType::Standard,
            1 => RequestType::Class,
            2 => RequestType::Vendor,
            _ => RequestType::Reserved,
        }
    }

    pub fn recipient(&self) -> Recipient {
        match self.request_type & 0b1_1111 {
            0 => Recipient::Device,
            1 => Recipient::Interface,
            2 => Recipient::Endpoint,
            3 => Recipient::Other,
            _ => Recipient::Reserved,
        }
    }

    /// Indicates that a data stage follows, host to device
    pub fn has_out_data(&self) -> bool {
        self.direction() == UsbDirection::Out && self.length > 0
    }

    pub fn get_descriptor(kind: u8, index: u8, length: u16) -> Self {
        SetupPacket {
            request_type: 0x80,
            request: Request::GET_DESCRIPTOR,
            value: (u16::from(kind) << 8) | u16::from(index),
            index: 0,
            length,
        }
    }

    pub fn set_address(address: u8) -> Self {
        SetupPacket {
            request_type: 0x00,
            request: Request::SET_ADDRESS,
            value: address.into(),
            index: 0,
            length: 0,
        }
    }

    pub fn set_configuration(value: u8) -> Self {
        SetupPacket {
            request_type: 0x00,
            request: Request::SET_CONFIGURATION,
            value: value.into(),
            index: 0,
            length: 0,
        }
    }
}

impl From<SetupPacket> for Request {
    fn from(setup: SetupPacket) -> Self {
        Request {
            direction: setup.direction(),
            request_type: setup.kind(),
            recipient: setup.recipient(),
            request: setup.request,
            value: setup.value,
            index: setup.index,
            length: setup.length,
        }
    }
}
