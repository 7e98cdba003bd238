//! Core configuration
//!
//! A `Config` describes one physical OTG core: the PHY that's wired to it,
//! how many endpoints and host channels the silicon implements, and how
//! the shared FIFO RAM is partitioned. Start from a preset, then override
//! single fields with the `with_*` methods.
//!
//! ```
//! use dwc_otg::{Config, Speed};
//!
//! const CONFIG: Config = Config::full_speed()
//!     .with_dma(false)
//!     .with_retry_limit(5)
//!     .with_tx_fifo_words(1, 64);
//!
//! assert_eq!(CONFIG.speed, Speed::Full);
//! assert_eq!(CONFIG.tx_fifo_words[1], 64);
//! ```

/// USB bus speed
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Speed {
    /// 480 Mbit/s
    High,
    /// 12 Mbit/s
    Full,
    /// 1.5 Mbit/s
    Low,
}

/// The PHY interface that the core drives
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phy {
    /// The on-chip full-speed transceiver
    Embedded,
    /// An external high-speed ULPI transceiver
    Ulpi,
}

/// Static description of an OTG core and its resource partition
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Config {
    /// Expected value of the core ID register; zero skips the check
    pub core_id: u32,
    /// Highest speed that the core should negotiate
    pub speed: Speed,
    pub phy: Phy,
    /// Number of device endpoints per direction, including EP0
    pub endpoints: usize,
    /// Number of host channels
    pub channels: usize,
    /// Total FIFO RAM, in 32-bit words
    pub fifo_words: u16,
    /// Receive FIFO depth, shared by device and host modes
    pub rx_fifo_words: u16,
    /// Device IN FIFO depths, indexed by endpoint number
    pub tx_fifo_words: [u16; 16],
    /// Host non-periodic transmit FIFO depth
    pub host_np_tx_fifo_words: u16,
    /// Host periodic transmit FIFO depth
    pub host_p_tx_fifo_words: u16,
    /// Use the core's internal DMA instead of slave-mode FIFO access
    pub dma: bool,
    /// Monitor VBUS for session valid / session end
    pub vbus_sensing: bool,
    /// Gate the PHY clock while suspended
    pub low_power: bool,
    /// Drive the SOF pulse output
    pub sof_output: bool,
    /// Host mode: consecutive transaction or toggle errors that end a
    /// transfer with an error
    ///
    /// Any progress on the channel (an ACK, a NAK on an IN poll, or a
    /// finished chunk) starts the count over.
    pub retry_limit: u8,
    /// Size of each EP0 staging buffer, in bytes
    ///
    /// This bounds every control data stage. An IN response longer than
    /// this, after clipping to the host's requested length, stalls EP0.
    /// Size it for the largest descriptor the device returns.
    pub control_buffer_len: usize,
}

impl Config {
    /// A full-speed core with the embedded PHY
    pub const fn full_speed() -> Self {
        Config {
            core_id: 0,
            speed: Speed::Full,
            phy: Phy::Embedded,
            endpoints: 4,
            channels: 8,
            fifo_words: 320,
            rx_fifo_words: 128,
            tx_fifo_words: [64, 64, 32, 32, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0],
            host_np_tx_fifo_words: 96,
            host_p_tx_fifo_words: 96,
            dma: false,
            vbus_sensing: false,
            low_power: false,
            sof_output: false,
            retry_limit: 3,
            control_buffer_len: 256,
        }
    }

    /// A high-speed core with an external ULPI PHY
    pub const fn high_speed_ulpi() -> Self {
        Config {
            core_id: 0,
            speed: Speed::High,
            phy: Phy::Ulpi,
            endpoints: 6,
            channels: 12,
            fifo_words: 1024,
            rx_fifo_words: 512,
            tx_fifo_words: [128, 128, 64, 64, 64, 64, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0],
            host_np_tx_fifo_words: 256,
            host_p_tx_fifo_words: 256,
            dma: false,
            vbus_sensing: false,
            low_power: false,
            sof_output: false,
            retry_limit: 3,
            control_buffer_len: 256,
        }
    }

    pub const fn with_core_id(mut self, core_id: u32) -> Self {
        self.core_id = core_id;
        self
    }

    pub const fn with_speed(mut self, speed: Speed) -> Self {
        self.speed = speed;
        self
    }

    pub const fn with_dma(mut self, dma: bool) -> Self {
        self.dma = dma;
        self
    }

    pub const fn with_vbus_sensing(mut self, vbus_sensing: bool) -> Self {
        self.vbus_sensing = vbus_sensing;
        self
    }

    pub const fn with_low_power(mut self, low_power: bool) -> Self {
        self.low_power = low_power;
        self
    }

    pub const fn with_sof_output(mut self, sof_output: bool) -> Self {
        self.sof_output = sof_output;
        self
    }

    pub const fn with_retry_limit(mut self, retry_limit: u8) -> Self {
        self.retry_limit = retry_limit;
        self
    }

    pub const fn with_rx_fifo_words(mut self, words: u16) -> Self {
        self.rx_fifo_words = words;
        self
    }

    /// Set the IN FIFO depth for `endpoint`
    ///
    /// # Panics
    ///
    /// Panics if `endpoint` is not less than 16.
    pub const fn with_tx_fifo_words(mut self, endpoint: usize, words: u16) -> Self {
        self.tx_fifo_words[endpoint] = words;
        self
    }

    pub const fn with_host_fifo_words(mut self, non_periodic: u16, periodic: u16) -> Self {
        self.host_np_tx_fifo_words = non_periodic;
        self.host_p_tx_fifo_words = periodic;
        self
    }

    pub const fn with_control_buffer_len(mut self, len: usize) -> Self {
        self.control_buffer_len = len;
        self
    }

    /// Returns the number of endpoints, clamped to what the register block supports
    pub(crate) const fn endpoint_count(&self) -> usize {
        if self.endpoints > crate::MAX_ENDPOINTS {
            crate::MAX_ENDPOINTS
        } else {
            self.endpoints
        }
    }

    /// Returns the number of channels, clamped to what the register block supports
    pub(crate) const fn channel_count(&self) -> usize {
        if self.channels > crate::MAX_CHANNELS {
            crate::MAX_CHANNELS
        } else {
            self.channels
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::full_speed()
    }
}
