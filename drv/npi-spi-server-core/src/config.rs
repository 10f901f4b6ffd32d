// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Configuration loading.
//!
//! [`load_config`] turns a `(section, key)` lookup into the typed
//! [`NpiConfig`] record, applying the documented defaults and numeric
//! bases (`mode` and `forceRunOnReset` parse base-16, everything else
//! base-10). [`IniSource`] is the stock lookup over an INI-shaped file:
//! `[SECTION]` headers, `key=value` lines, `#` comments, the `""`
//! empty-value idiom, and a 128-byte line limit.

use std::io;
use std::path::Path;
use std::time::Duration;

use log::{info, warn};

use drv_npi_spi_api::config::{
    ConfigSource, DeviceKind, GpioLineConfig, ListenMode, MrdySrdyFlags,
    NpiConfig, Polarity, SpiParams, NPI_PORT_DEFAULT, RESET_DETECT_DEFAULT,
    SPI_SPEED_DEFAULT,
};
use drv_npi_spi_api::NpiError;

/// No configuration line may span more than this many bytes; over-long
/// lines are skipped whole.
pub const MAX_LINE: usize = 128;

const SEC_STARTUP: &str = "STARTUP";
const SEC_DEVICE: &str = "DEVICE";
const SEC_LOG: &str = "LOG";
const SEC_DEBUG: &str = "DEBUG";
const SEC_PORT: &str = "PORT";
const SEC_SPI: &str = "SPI";
const SEC_MRDY_SRDY: &str = "MRDY_SRDY";
const SEC_GPIO_SRDY: &str = "GPIO_SRDY.GPIO";
const SEC_GPIO_MRDY: &str = "GPIO_MRDY.GPIO";
const SEC_GPIO_RESET: &str = "GPIO_RESET.GPIO";

/// Builds the typed transport configuration from a lookup source.
pub fn load_config(src: &dyn ConfigSource) -> Result<NpiConfig, NpiError> {
    let startup_delay = match src.lookup(SEC_STARTUP, "delaySeconds") {
        Some(v) => {
            let seconds =
                parse_num(&v, 10, SEC_STARTUP, "delaySeconds")? as u64;
            if seconds > 0 {
                info!("found optional startup delay of {seconds} seconds");
            }
            Duration::from_secs(seconds)
        }
        None => Duration::ZERO,
    };

    let device = {
        let v = require(src, SEC_DEVICE, "deviceKey")?;
        let key = parse_num(&v, 10, SEC_DEVICE, "deviceKey")?;
        u8::try_from(key)
            .ok()
            .and_then(DeviceKind::from_key)
            .ok_or(NpiError::ConfigInvalid {
                section: SEC_DEVICE,
                key: "deviceKey",
            })?
    };

    let dev_path = require(src, SEC_DEVICE, "devPath")?;
    let log_path = require(src, SEC_LOG, "log")?;
    if log_path.is_empty() {
        info!("no log file path configured, logs go to stderr");
    }

    let debug_supported = match src.lookup(SEC_DEBUG, "supported") {
        Some(v) => parse_num(&v, 10, SEC_DEBUG, "supported")? != 0,
        None => false,
    };

    let srdy = gpio_line(src, SEC_GPIO_SRDY)?;
    let mrdy = gpio_line(src, SEC_GPIO_MRDY)?;
    // A board without a reset line gets the software-reset fallback.
    let reset = match src.lookup(SEC_GPIO_RESET, "value") {
        Some(_) => Some(gpio_line(src, SEC_GPIO_RESET)?),
        None => {
            warn!("no GPIO_RESET configured, software reset will be used");
            None
        }
    };

    let spi = SpiParams {
        speed: match src.lookup(SEC_SPI, "speed") {
            Some(v) => parse_num(&v, 10, SEC_SPI, "speed")?,
            None => SPI_SPEED_DEFAULT,
        },
        mode: match src.lookup(SEC_SPI, "mode") {
            Some(v) => parse_num(&v, 16, SEC_SPI, "mode")? as u8,
            None => 0,
        },
        bits_per_word: match src.lookup(SEC_SPI, "bitsPerWord") {
            Some(v) => parse_num(&v, 10, SEC_SPI, "bitsPerWord")? as u8,
            None => 8,
        },
        use_full_duplex: flag(src, "useFullDuplexAPI", true)?,
    };

    let flags = MrdySrdyFlags {
        early_mrdy_deassert: flag(src, "earlyMrdyDeAssert", true)?,
        detect_reset_from_slow_srdy_assert: flag(
            src,
            "detectResetFromSlowSrdyAssert",
            true,
        )?,
        force_run_on_reset: match src.lookup(SEC_SPI, "forceRunOnReset") {
            Some(v) => {
                Some(parse_num(&v, 16, SEC_SPI, "forceRunOnReset")? as u8)
            }
            None => None,
        },
        srdy_mrdy_handshake_support: flag(src, "srdyMrdyHandshakeSupport", true)?,
        listen_mode: if flag(src, "srdyInterrupt", true)? {
            ListenMode::Interrupt
        } else {
            ListenMode::Polling
        },
    };

    let port = match src.lookup(SEC_PORT, "port") {
        Some(v) => v,
        None => {
            warn!("port not found in configuration, using {NPI_PORT_DEFAULT}");
            NPI_PORT_DEFAULT.to_string()
        }
    };

    Ok(NpiConfig {
        device,
        dev_path,
        log_path,
        port,
        debug_supported,
        startup_delay,
        srdy,
        mrdy,
        reset,
        spi,
        flags,
        reset_detect: RESET_DETECT_DEFAULT,
    })
}

fn gpio_line(
    src: &dyn ConfigSource,
    section: &'static str,
) -> Result<GpioLineConfig, NpiError> {
    let value = require(src, section, "value")?;
    let direction = require(src, section, "direction")?;
    // Only SRDY's readiness handle cares about the edge; absent means the
    // conventional falling edge.
    let edge = src
        .lookup(section, "edge")
        .unwrap_or_else(|| "falling".to_string());
    let polarity = match src.lookup(section, "active_high_low") {
        Some(v) => {
            if parse_num(&v, 10, section, "active_high_low")? != 0 {
                Polarity::ActiveHigh
            } else {
                Polarity::ActiveLow
            }
        }
        None => {
            warn!("key 'active_high_low' missing for {section}, assuming active low");
            Polarity::default()
        }
    };
    Ok(GpioLineConfig {
        value,
        direction,
        edge,
        polarity,
    })
}

fn flag(
    src: &dyn ConfigSource,
    key: &'static str,
    default: bool,
) -> Result<bool, NpiError> {
    match src.lookup(SEC_MRDY_SRDY, key) {
        Some(v) => Ok(parse_num(&v, 10, SEC_MRDY_SRDY, key)? != 0),
        None => Ok(default),
    }
}

fn require(
    src: &dyn ConfigSource,
    section: &'static str,
    key: &'static str,
) -> Result<String, NpiError> {
    src.lookup(section, key)
        .ok_or(NpiError::ConfigMissing { section, key })
}

fn parse_num(
    v: &str,
    radix: u32,
    section: &'static str,
    key: &'static str,
) -> Result<u32, NpiError> {
    let v = v.trim();
    let v = if radix == 16 {
        v.strip_prefix("0x").or_else(|| v.strip_prefix("0X")).unwrap_or(v)
    } else {
        v
    };
    u32::from_str_radix(v, radix).map_err(|_| NpiError::ConfigInvalid {
        section,
        key,
    })
}

/// The stock `(section, key)` lookup over an INI-shaped text. Sections
/// match by substring, keys match by substring within the section,
/// values run from the first `=` to the next delimiter (`"`, `;`, `=`),
/// and `""` denotes the empty value.
pub struct IniSource {
    text: String,
}

impl IniSource {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }

    pub fn from_file(path: impl AsRef<Path>) -> io::Result<Self> {
        Ok(Self::new(std::fs::read_to_string(path)?))
    }
}

impl ConfigSource for IniSource {
    fn lookup(&self, section: &str, key: &str) -> Option<String> {
        let mut in_section = false;
        for line in self.text.lines() {
            if line.len() >= MAX_LINE {
                continue;
            }
            let line = line.trim_end_matches('\r');
            if line.starts_with('[') {
                in_section = line.contains(section);
                continue;
            }
            if !in_section || line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some(pos) = line.find(key) else {
                continue;
            };
            let rest = &line[pos + key.len()..];
            let Some(eq) = rest.find('=') else {
                continue;
            };
            let value = &rest[eq + 1..];
            // `""` can't round-trip through the tokenizer below (it would
            // skip both quotes), so the empty value is special-cased.
            if value.starts_with("\"\"") {
                return Some(String::new());
            }
            let value = value.trim_start_matches(['=', ';', '"']);
            let value = value.split(['=', ';', '"']).next().unwrap_or("");
            return Some(value.to_string());
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
[PORT]
port=2533

[DEVICE]
# 0=UART, 1=SPI, 2=I2C, 3=UART/USB
deviceKey=1
devPath=/dev/spidev0.0

[LOG]
log=\"\"

[GPIO_SRDY.GPIO]
value=7
direction=in
edge=falling
active_high_low=0

[GPIO_MRDY.GPIO]
value=30
direction=out
active_high_low=0

[GPIO_RESET.GPIO]
value=157
direction=out
active_high_low=0

[SPI]
speed=2000000
mode=0x2
bitsPerWord=8
forceRunOnReset=0x07

[MRDY_SRDY]
useFullDuplexAPI=0
earlyMrdyDeAssert=1
detectResetFromSlowSrdyAssert=1
srdyMrdyHandshakeSupport=1
";

    #[test]
    fn sample_config_parses() {
        let src = IniSource::new(SAMPLE);
        let cfg = load_config(&src).unwrap();
        assert_eq!(cfg.device, DeviceKind::Spi);
        assert_eq!(cfg.dev_path, "/dev/spidev0.0");
        assert_eq!(cfg.log_path, "");
        assert_eq!(cfg.port, "2533");
        assert_eq!(cfg.spi.speed, 2_000_000);
        assert_eq!(cfg.spi.mode, 0x2);
        assert_eq!(cfg.spi.bits_per_word, 8);
        assert!(!cfg.spi.use_full_duplex);
        assert_eq!(cfg.flags.force_run_on_reset, Some(0x07));
        assert!(cfg.flags.early_mrdy_deassert);
        assert_eq!(cfg.flags.listen_mode, ListenMode::Interrupt);
        assert_eq!(cfg.srdy.value, "7");
        assert_eq!(cfg.srdy.edge, "falling");
        assert_eq!(cfg.srdy.polarity, Polarity::ActiveLow);
        assert_eq!(cfg.reset.as_ref().unwrap().value, "157");
        assert_eq!(cfg.reset_detect, RESET_DETECT_DEFAULT);
    }

    #[test]
    fn defaults_apply_when_sections_missing() {
        let src = IniSource::new(
            "[DEVICE]\ndeviceKey=1\ndevPath=/dev/spidev1.0\n\
             [LOG]\nlog=/var/log/npi\n\
             [GPIO_SRDY.GPIO]\nvalue=1\ndirection=in\n\
             [GPIO_MRDY.GPIO]\nvalue=2\ndirection=out\n",
        );
        let cfg = load_config(&src).unwrap();
        assert_eq!(cfg.port, NPI_PORT_DEFAULT);
        assert_eq!(cfg.spi.speed, SPI_SPEED_DEFAULT);
        assert_eq!(cfg.spi.mode, 0);
        assert_eq!(cfg.spi.bits_per_word, 8);
        assert!(cfg.spi.use_full_duplex);
        assert!(cfg.flags.early_mrdy_deassert);
        assert!(cfg.flags.detect_reset_from_slow_srdy_assert);
        assert!(cfg.flags.srdy_mrdy_handshake_support);
        assert_eq!(cfg.flags.force_run_on_reset, None);
        // No reset line configured: software fallback.
        assert_eq!(cfg.reset, None);
        assert!(!cfg.debug_supported);
        assert_eq!(cfg.startup_delay, Duration::ZERO);
    }

    #[test]
    fn missing_mandatory_key_is_an_error() {
        let src = IniSource::new("[DEVICE]\ndeviceKey=1\n");
        assert_eq!(
            load_config(&src),
            Err(NpiError::ConfigMissing {
                section: "DEVICE",
                key: "devPath",
            })
        );
    }

    #[test]
    fn bad_numeric_value_is_an_error() {
        let src = IniSource::new("[STARTUP]\ndelaySeconds=soon\n");
        assert_eq!(
            load_config(&src),
            Err(NpiError::ConfigInvalid {
                section: "STARTUP",
                key: "delaySeconds",
            })
        );
    }

    #[test]
    fn comments_and_blanks_are_skipped() {
        let src = IniSource::new(
            "[SPI]\n\n# speed=1\nspeed=1000000\n",
        );
        assert_eq!(src.lookup("SPI", "speed").unwrap(), "1000000");
    }

    #[test]
    fn empty_value_idiom() {
        let src = IniSource::new("[LOG]\nlog=\"\"\n");
        assert_eq!(src.lookup("LOG", "log").unwrap(), "");
    }

    #[test]
    fn value_stops_at_delimiters() {
        let src = IniSource::new("[LOG]\nlog=/tmp/npi.log;trailing\n");
        assert_eq!(src.lookup("LOG", "log").unwrap(), "/tmp/npi.log");
    }

    #[test]
    fn overlong_lines_are_skipped() {
        let long_value = "x".repeat(MAX_LINE);
        let text = format!("[LOG]\nlog={long_value}\n[PORT]\nport=9999\n");
        let src = IniSource::new(text);
        assert_eq!(src.lookup("LOG", "log"), None);
        assert_eq!(src.lookup("PORT", "port").unwrap(), "9999");
    }

    #[test]
    fn hex_prefix_accepted_for_base16_fields() {
        assert_eq!(parse_num("0x2", 16, "SPI", "mode").unwrap(), 2);
        assert_eq!(parse_num("2", 16, "SPI", "mode").unwrap(), 2);
    }

    #[test]
    fn polling_mode_selectable() {
        let src = IniSource::new(
            "[DEVICE]\ndeviceKey=1\ndevPath=/dev/spidev1.0\n\
             [LOG]\nlog=l\n\
             [GPIO_SRDY.GPIO]\nvalue=1\ndirection=in\n\
             [GPIO_MRDY.GPIO]\nvalue=2\ndirection=out\n\
             [MRDY_SRDY]\nsrdyInterrupt=0\n",
        );
        let cfg = load_config(&src).unwrap();
        assert_eq!(cfg.flags.listen_mode, ListenMode::Polling);
    }
}
