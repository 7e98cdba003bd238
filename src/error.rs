//! Driver errors

use usb_device::UsbError;

/// Errors surfaced synchronously by the core, device, and host engines
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    /// The AHB idle or soft reset bits never settled
    CoreResetTimeout,
    /// A FIFO flush never completed
    FifoFlushTimeout,
    /// The configured FIFO partition exceeds the core's FIFO RAM
    FifoOverflow,
    /// Not enough endpoint memory for the requested buffer
    EndpointMemoryOverflow,
    /// The endpoint number is beyond what the core supports
    InvalidEndpoint,
    /// The endpoint hasn't been activated
    EndpointInactive,
    /// The endpoint still has a transfer in flight
    EndpointBusy,
    /// The channel number is beyond what the core supports
    InvalidChannel,
    /// Every host channel is allocated
    NoFreeChannel,
    /// The channel still has a transfer in flight
    ChannelBusy,
    /// No request queue slot is free; the request was recorded and is
    /// retried by the interrupt handler
    RequestQueueFull,
    /// The data doesn't fit the endpoint or channel buffer
    BufferOverflow,
}

pub type Result<T> = core::result::Result<T, Error>;

impl From<Error> for UsbError {
    fn from(err: Error) -> Self {
        match err {
            Error::EndpointMemoryOverflow => UsbError::EndpointMemoryOverflow,
            Error::InvalidEndpoint | Error::InvalidChannel => UsbError::InvalidEndpoint,
            Error::NoFreeChannel => UsbError::EndpointOverflow,
            Error::EndpointBusy | Error::ChannelBusy | Error::RequestQueueFull => {
                UsbError::WouldBlock
            }
            Error::BufferOverflow => UsbError::BufferOverflow,
            Error::FifoOverflow => UsbError::EndpointMemoryOverflow,
            Error::CoreResetTimeout
            | Error::FifoFlushTimeout
            | Error::EndpointInactive => UsbError::InvalidState,
        }
    }
}
