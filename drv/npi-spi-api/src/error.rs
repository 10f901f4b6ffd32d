// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Errors for the NPI SPI transport.

use core::fmt;

/// The three handshake lines, for error attribution.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LineName {
    Srdy,
    Mrdy,
    Reset,
}

impl fmt::Display for LineName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LineName::Srdy => "SRDY",
            LineName::Mrdy => "MRDY",
            LineName::Reset => "RESET",
        };
        f.write_str(name)
    }
}

/// The upper layer refused a polled frame.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CallbackError;

/// Every failure the transport can surface, in one tagged code.
///
/// The distinction that matters operationally: `PossibleSlaveReset` asks
/// the caller to re-issue `reset_slave`; `IllegalHeader` during a poll is
/// logged and dropped; `PollLockVarError` is a programmer error and is
/// never recovered. Everything else is a fault of the current call.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum NpiError {
    /// A mandatory configuration key is absent.
    ConfigMissing {
        section: &'static str,
        key: &'static str,
    },
    /// A configuration value failed numeric parsing.
    ConfigInvalid {
        section: &'static str,
        key: &'static str,
    },
    GpioInitFailed(LineName),
    SpiInitFailed,
    ThreadCreateFailed,

    /// SRDY did not reach the expected state in time.
    SrdyWaitTimeout,
    /// MRDY did not reach the expected state in time.
    MrdyWaitTimeout,
    /// SRDY took suspiciously long to rise after a request; the slave has
    /// probably rebooted and answered with its reset handshake.
    PossibleSlaveReset,
    /// The reserved all-0xFF header arrived where a frame was expected.
    IllegalHeader,
    /// A frame or wire header exceeds the legal payload bounds.
    BadLength,
    SpiIoError,
    GpioIoError(LineName),

    /// The poll-lock shadow flag disagreed with the lock hold-state. The
    /// payload is the source line of the instrumentation that tripped.
    PollLockVarError(u32),
    /// The upper layer refused a delivered frame.
    CallbackFailure,
    /// The transport has been shut down.
    Closed,
}

impl NpiError {
    /// Stable numeric form of the error, module tag in the high byte:
    /// configuration 0x01, GPIO 0x02, SPI 0x03, transport 0x04. This is
    /// what travels on the fatal-fault notification channel.
    pub fn code(&self) -> u16 {
        match self {
            NpiError::ConfigMissing { .. } => 0x0101,
            NpiError::ConfigInvalid { .. } => 0x0102,
            NpiError::GpioInitFailed(_) => 0x0201,
            NpiError::GpioIoError(_) => 0x0202,
            NpiError::SrdyWaitTimeout => 0x0203,
            NpiError::MrdyWaitTimeout => 0x0204,
            NpiError::SpiInitFailed => 0x0301,
            NpiError::SpiIoError => 0x0302,
            NpiError::ThreadCreateFailed => 0x0401,
            NpiError::PossibleSlaveReset => 0x0402,
            NpiError::IllegalHeader => 0x0403,
            NpiError::BadLength => 0x0404,
            NpiError::PollLockVarError(_) => 0x0405,
            NpiError::CallbackFailure => 0x0406,
            NpiError::Closed => 0x0407,
        }
    }

    /// Whether the poll thread must terminate on this error. The lone
    /// exception is the illegal header, which is logged and the frame
    /// dropped.
    pub fn is_fatal_for_poll(&self) -> bool {
        !matches!(self, NpiError::IllegalHeader)
    }
}

impl From<CallbackError> for NpiError {
    fn from(_: CallbackError) -> Self {
        NpiError::CallbackFailure
    }
}

impl fmt::Display for NpiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NpiError::ConfigMissing { section, key } => {
                write!(f, "missing configuration key [{section}] {key}")
            }
            NpiError::ConfigInvalid { section, key } => {
                write!(f, "unparseable configuration value [{section}] {key}")
            }
            NpiError::GpioInitFailed(line) => {
                write!(f, "failed to initialize GPIO line {line}")
            }
            NpiError::SpiInitFailed => f.write_str("failed to initialize SPI device"),
            NpiError::ThreadCreateFailed => {
                f.write_str("failed to start a transport thread")
            }
            NpiError::SrdyWaitTimeout => f.write_str("timed out waiting on SRDY"),
            NpiError::MrdyWaitTimeout => f.write_str("timed out waiting on MRDY"),
            NpiError::PossibleSlaveReset => {
                f.write_str("slow SRDY rise; slave probably reset")
            }
            NpiError::IllegalHeader => f.write_str("illegal frame header (FF FF FF)"),
            NpiError::BadLength => f.write_str("frame length out of bounds"),
            NpiError::SpiIoError => f.write_str("SPI transfer failed"),
            NpiError::GpioIoError(line) => write!(f, "GPIO I/O failed on {line}"),
            NpiError::PollLockVarError(line) => {
                write!(f, "poll lock shadow flag mismatch at line {line}")
            }
            NpiError::CallbackFailure => {
                f.write_str("upper layer refused a delivered frame")
            }
            NpiError::Closed => f.write_str("transport is shut down"),
        }
    }
}

impl std::error::Error for NpiError {}
