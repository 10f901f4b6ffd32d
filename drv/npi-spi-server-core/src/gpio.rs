// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Handshake line control.
//!
//! [`GpioPin`] is the seam to the platform GPIO HAL; [`Line`] layers the
//! configured polarity on top so the rest of the transport only speaks in
//! asserted/deasserted terms. Blocking waits are sliced so a pending wait
//! observes shutdown well inside the 100 ms cancellation bound.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use drv_npi_spi_api::config::Polarity;
use drv_npi_spi_api::{LineName, NpiError};

/// Physical level of a line, before polarity is applied.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Level {
    Low,
    High,
}

/// Outcome of waiting on a pin's edge-readiness handle.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EdgeEvent {
    /// An edge fired since the last wait.
    Edge,
    TimedOut,
}

/// Error from the pin backend; [`Line`] tags it with the line name.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PinError;

/// One GPIO pin as supplied by the platform HAL.
pub trait GpioPin: Send + Sync {
    fn set_high(&self) -> Result<(), PinError>;
    fn set_low(&self) -> Result<(), PinError>;
    fn level(&self) -> Result<Level, PinError>;

    /// Blocks until an edge fires or `timeout` elapses. This is the
    /// OS-level readiness handle the event thread polls; pins that do not
    /// provide one simply time out.
    fn wait_edge(&self, timeout: Duration) -> Result<EdgeEvent, PinError> {
        thread::sleep(timeout);
        Ok(EdgeEvent::TimedOut)
    }
}

/// Granularity of the level-wait loop. Coarse enough to stay off the CPU,
/// fine enough that shutdown and timeouts are observed well inside the
/// 100 ms cancellation bound.
const WAIT_SLICE: Duration = Duration::from_millis(1);

/// A handshake line: a shared pin plus its configured polarity.
pub struct Line<P> {
    pin: Arc<P>,
    name: LineName,
    polarity: Polarity,
    shutdown: Arc<AtomicBool>,
}

impl<P: GpioPin> Line<P> {
    pub fn new(
        pin: Arc<P>,
        name: LineName,
        polarity: Polarity,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            pin,
            name,
            polarity,
            shutdown,
        }
    }

    fn active_level(&self) -> Level {
        match self.polarity {
            Polarity::ActiveLow => Level::Low,
            Polarity::ActiveHigh => Level::High,
        }
    }

    fn io_err(&self) -> NpiError {
        NpiError::GpioIoError(self.name)
    }

    fn timeout_err(&self) -> NpiError {
        match self.name {
            LineName::Srdy => NpiError::SrdyWaitTimeout,
            LineName::Mrdy => NpiError::MrdyWaitTimeout,
            LineName::Reset => NpiError::GpioIoError(LineName::Reset),
        }
    }

    pub fn assert(&self) -> Result<(), NpiError> {
        let r = match self.active_level() {
            Level::Low => self.pin.set_low(),
            Level::High => self.pin.set_high(),
        };
        r.map_err(|_| self.io_err())
    }

    pub fn deassert(&self) -> Result<(), NpiError> {
        let r = match self.active_level() {
            Level::Low => self.pin.set_high(),
            Level::High => self.pin.set_low(),
        };
        r.map_err(|_| self.io_err())
    }

    pub fn is_asserted(&self) -> Result<bool, NpiError> {
        let level = self.pin.level().map_err(|_| self.io_err())?;
        Ok(level == self.active_level())
    }

    pub fn wait_asserted(&self, timeout: Duration) -> Result<(), NpiError> {
        self.wait_state(true, timeout)
    }

    pub fn wait_deasserted(&self, timeout: Duration) -> Result<(), NpiError> {
        self.wait_state(false, timeout)
    }

    fn wait_state(
        &self,
        want_asserted: bool,
        timeout: Duration,
    ) -> Result<(), NpiError> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.is_asserted()? == want_asserted {
                return Ok(());
            }
            if self.shutdown.load(Ordering::Acquire) {
                return Err(NpiError::Closed);
            }
            if Instant::now() >= deadline {
                return Err(self.timeout_err());
            }
            thread::sleep(WAIT_SLICE);
        }
    }

    /// Drives the line active for `width`, then releases it. RESET wants
    /// at least a millisecond.
    pub fn pulse(&self, width: Duration) -> Result<(), NpiError> {
        self.assert()?;
        thread::sleep(width);
        self.deassert()
    }

    pub fn wait_edge(&self, timeout: Duration) -> Result<EdgeEvent, NpiError> {
        self.pin.wait_edge(timeout).map_err(|_| self.io_err())
    }
}
