//! FIFO partition and receive status words
//!
//! The core has one block of FIFO RAM that software splits into a single
//! receive FIFO and several transmit FIFOs. The split is computed once from
//! the [`Config`] and programmed during initialization.

use crate::{
    config::Config,
    error::{Error, Result},
    ral::{self, otg::GRXSTSP},
};

/// A region of FIFO RAM, in 32-bit words
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FifoRegion {
    pub start: u16,
    pub depth: u16,
}

impl FifoRegion {
    /// The value for a FIFO size register: start address low, depth high
    pub(crate) fn register_value(&self) -> u32 {
        u32::from(self.start) | (u32::from(self.depth) << 16)
    }
}

/// Smallest depth the core accepts for the EP0 / non-periodic TX FIFO
const MIN_TX_FIFO_WORDS: u16 = 16;

/// A static FIFO partition
///
/// In device mode `tx[n]` is the IN FIFO for endpoint `n`. In host mode
/// `tx[0]` is the non-periodic and `tx[1]` the periodic transmit FIFO.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FifoLayout {
    pub rx: FifoRegion,
    pub tx: [FifoRegion; 16],
    pub tx_count: usize,
}

impl FifoLayout {
    /// The device-mode partition: RX first, then TX0..TXn back-to-back
    pub fn device(config: &Config) -> Result<Self> {
        let count = config.endpoint_count();
        let mut depths = [0u16; 16];
        depths[..count].copy_from_slice(&config.tx_fifo_words[..count]);
        depths[0] = depths[0].max(MIN_TX_FIFO_WORDS);
        Self::pack(config, &depths[..count])
    }

    /// The host-mode partition: RX, non-periodic TX, periodic TX
    pub fn host(config: &Config) -> Result<Self> {
        let depths = [
            config.host_np_tx_fifo_words.max(MIN_TX_FIFO_WORDS),
            config.host_p_tx_fifo_words,
        ];
        Self::pack(config, &depths)
    }

    fn pack(config: &Config, depths: &[u16]) -> Result<Self> {
        let rx = FifoRegion {
            start: 0,
            depth: config.rx_fifo_words,
        };
        let mut layout = FifoLayout {
            rx,
            tx: [FifoRegion::default(); 16],
            tx_count: depths.len(),
        };
        let mut next = u32::from(rx.depth);
        for (region, &depth) in layout.tx.iter_mut().zip(depths) {
            *region = FifoRegion {
                start: u16::try_from(next).map_err(|_| Error::FifoOverflow)?,
                depth,
            };
            next += u32::from(depth);
        }
        if next > u32::from(config.fifo_words) {
            return Err(Error::FifoOverflow);
        }
        Ok(layout)
    }

    /// Total words consumed by this layout
    pub fn words(&self) -> u32 {
        u32::from(self.rx.depth)
            + self.tx[..self.tx_count]
                .iter()
                .map(|region| u32::from(region.depth))
                .sum::<u32>()
    }
}

/// Decodes the 4-bit packet status code from a receive status word
pub trait PacketKind: Sized {
    fn from_code(code: u8) -> Self;
}

/// Device-mode packet status
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DevicePacket {
    GlobalOutNak,
    OutData,
    OutComplete,
    SetupComplete,
    SetupData,
    Reserved(u8),
}

impl PacketKind for DevicePacket {
    fn from_code(code: u8) -> Self {
        match code {
            1 => DevicePacket::GlobalOutNak,
            2 => DevicePacket::OutData,
            3 => DevicePacket::OutComplete,
            4 => DevicePacket::SetupComplete,
            6 => DevicePacket::SetupData,
            code => DevicePacket::Reserved(code),
        }
    }
}

/// Host-mode packet status
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HostPacket {
    InData,
    InComplete,
    DataToggleError,
    ChannelHalted,
    Reserved(u8),
}

impl PacketKind for HostPacket {
    fn from_code(code: u8) -> Self {
        match code {
            2 => HostPacket::InData,
            3 => HostPacket::InComplete,
            5 => HostPacket::DataToggleError,
            7 => HostPacket::ChannelHalted,
            code => HostPacket::Reserved(code),
        }
    }
}

/// A decoded receive status word
///
/// `number` is the endpoint number in device mode, and the channel number
/// in host mode. It's the only key for routing the packet that follows.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReceiveStatus<K> {
    pub number: usize,
    pub byte_count: usize,
    pub pid: u8,
    pub frame: u8,
    pub kind: K,
}

impl<K: PacketKind> ReceiveStatus<K> {
    pub fn from_bits(word: u32) -> Self {
        let get = |mask, offset| ral::field(word, mask, offset);
        ReceiveStatus {
            number: get(GRXSTSP::EPNUM::mask, GRXSTSP::EPNUM::offset) as usize,
            byte_count: get(GRXSTSP::BCNT::mask, GRXSTSP::BCNT::offset) as usize,
            pid: get(GRXSTSP::DPID::mask, GRXSTSP::DPID::offset) as u8,
            frame: get(GRXSTSP::FRMNUM::mask, GRXSTSP::FRMNUM::offset) as u8,
            kind: K::from_code(get(GRXSTSP::PKTSTS::mask, GRXSTSP::PKTSTS::offset) as u8),
        }
    }
}

pub type DeviceStatus = ReceiveStatus<DevicePacket>;
pub type HostStatus = ReceiveStatus<HostPacket>;
