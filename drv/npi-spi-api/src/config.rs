// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Typed transport configuration.
//!
//! The records here are what the configuration loader in the server-core
//! crate produces from an INI-shaped source, and what `Transport::open`
//! consumes. They are immutable once the transport is open.

use core::time::Duration;

/// Default server port, used when the configuration omits `[PORT] port`.
pub const NPI_PORT_DEFAULT: &str = "2533";

/// Default UART baud rate.
pub const UART_SPEED_DEFAULT: u32 = 115_200;

/// Default SPI clock.
pub const SPI_SPEED_DEFAULT: u32 = 500_000;

/// Default threshold above which a slow SRDY rise during a request is
/// taken as evidence of a slave reset.
pub const RESET_DETECT_DEFAULT: Duration = Duration::from_millis(500);

/// The serial device selected by `[DEVICE] deviceKey`. Only `Spi` is
/// served by this workspace; the other variants exist so a configuration
/// written for the full NPI server parses faithfully.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DeviceKind {
    Uart = 0,
    Spi = 1,
    I2c = 2,
    UartUsb = 3,
}

impl DeviceKind {
    pub fn from_key(key: u8) -> Option<Self> {
        match key {
            0 => Some(DeviceKind::Uart),
            1 => Some(DeviceKind::Spi),
            2 => Some(DeviceKind::I2c),
            3 => Some(DeviceKind::UartUsb),
            _ => None,
        }
    }
}

/// Electrical polarity of a handshake line. The typical wiring is
/// active-low for all three lines.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Polarity {
    #[default]
    ActiveLow,
    ActiveHigh,
}

/// One `GPIO_<line>.GPIO` configuration block.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GpioLineConfig {
    /// Platform pin identifier, passed through to the GPIO HAL.
    pub value: String,
    pub direction: String,
    /// Edge sensitivity for the SRDY readiness handle.
    pub edge: String,
    pub polarity: Polarity,
}

/// `[SPI]` section parameters, handed to the SPI HAL at init.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SpiParams {
    pub speed: u32,
    pub mode: u8,
    pub bits_per_word: u8,
    /// Whether the HAL should use its full-duplex transfer API; reads
    /// clock dummy bytes either way.
    pub use_full_duplex: bool,
}

impl Default for SpiParams {
    fn default() -> Self {
        Self {
            speed: SPI_SPEED_DEFAULT,
            mode: 0,
            bits_per_word: 8,
            use_full_duplex: true,
        }
    }
}

/// How the transport learns that SRDY fell: an edge-triggered readiness
/// handle serviced by a dedicated event thread, or a 10 ms polling cadence
/// in the poll thread itself.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum ListenMode {
    #[default]
    Interrupt,
    Polling,
}

/// `[MRDY_SRDY]` handshake behavior flags.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MrdySrdyFlags {
    /// De-assert MRDY immediately after the SRDY response edge, before the
    /// payload transfer, to beat GPIO latency on slow hosts.
    pub early_mrdy_deassert: bool,
    /// Interpret a slow SRDY rise during a request as a slave reset.
    pub detect_reset_from_slow_srdy_assert: bool,
    /// Byte written after a hardware reset to ask the slave to run.
    pub force_run_on_reset: Option<u8>,
    /// Perform the explicit 4-edge handshake after reset.
    pub srdy_mrdy_handshake_support: bool,
    pub listen_mode: ListenMode,
}

impl Default for MrdySrdyFlags {
    fn default() -> Self {
        Self {
            early_mrdy_deassert: true,
            detect_reset_from_slow_srdy_assert: true,
            force_run_on_reset: None,
            srdy_mrdy_handshake_support: true,
            listen_mode: ListenMode::default(),
        }
    }
}

/// The complete transport configuration record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NpiConfig {
    pub device: DeviceKind,
    pub dev_path: String,
    pub log_path: String,
    pub port: String,
    pub debug_supported: bool,
    /// Optional delay applied once before hardware bring-up.
    pub startup_delay: Duration,
    pub srdy: GpioLineConfig,
    pub mrdy: GpioLineConfig,
    /// Absent when the board has no reset line; the transport then falls
    /// back to the software reset sequence.
    pub reset: Option<GpioLineConfig>,
    pub spi: SpiParams,
    pub flags: MrdySrdyFlags,
    /// Threshold for reset detection from a slow SRDY rise.
    pub reset_detect: Duration,
}

impl Default for NpiConfig {
    fn default() -> Self {
        Self {
            device: DeviceKind::Spi,
            dev_path: String::new(),
            log_path: String::new(),
            port: NPI_PORT_DEFAULT.to_string(),
            debug_supported: false,
            startup_delay: Duration::ZERO,
            srdy: GpioLineConfig::default(),
            mrdy: GpioLineConfig::default(),
            reset: None,
            spi: SpiParams::default(),
            flags: MrdySrdyFlags::default(),
            reset_detect: RESET_DETECT_DEFAULT,
        }
    }
}

/// The seam to the external configuration-file machinery: anything that
/// can resolve a `(section, key)` pair to a value string.
pub trait ConfigSource {
    fn lookup(&self, section: &str, key: &str) -> Option<String>;
}
