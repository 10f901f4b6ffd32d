// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Core of the NPI SPI transport.
//!
//! [`Transport::open`] initializes the GPIO lines and the SPI device
//! through the supplied [`NpiHal`], runs the reset/sync bring-up, and
//! starts the poll (and, in interrupt mode, event) threads. The handle it
//! returns carries the client operations: `send_async`, `send_sync`,
//! `reset_slave`, `sync_slave`.
//!
//! # Locking
//!
//! One mutex, the poll lock, owns the entire handshake engine: bus,
//! lines, statistics. Every frame on the wire happens inside a
//! [`TxnGuard`], which couples the mutex guard with the `poll_lock_var`
//! shadow flag. The scoped guard makes the MRDY discipline structural,
//! and the shadow flag keeps the lock pairing observable: it only ever
//! moves 0 → 1 → 0 under the lock, and
//! any disagreement is a programmer error surfaced as
//! [`NpiError::PollLockVarError`] with the tripping source line.
//!
//! In interrupt mode a second mutex, the SRDY gate, keeps the event
//! thread from mistaking a client transaction's SRDY activity for
//! slave-initiated traffic: client paths hold it for the duration of the
//! transaction and the event thread only try-locks it.

#![deny(elided_lifetimes_in_paths)]

pub mod config;
pub mod gpio;
mod link;
mod poll;
pub mod spi;

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use log::{debug, info};

use drv_npi_spi_api::config::{
    GpioLineConfig, ListenMode, NpiConfig, SpiParams,
};
use drv_npi_spi_api::{LineName, LinkStats, NpiError, NpiHandler, NpiMsg};

use gpio::{GpioPin, Line, PinError};
use link::Link;
use spi::{BusError, SpiBus};

/// The platform HAL the transport is built on: one initializer per
/// handshake line plus the SPI device itself. `open` maps failures to
/// `GpioInitFailed`/`SpiInitFailed`.
pub trait NpiHal {
    type Pin: GpioPin + 'static;
    type Bus: SpiBus + 'static;

    fn init_srdy(&self, cfg: &GpioLineConfig) -> Result<Self::Pin, PinError>;
    fn init_mrdy(&self, cfg: &GpioLineConfig) -> Result<Self::Pin, PinError>;
    fn init_reset(&self, cfg: &GpioLineConfig) -> Result<Self::Pin, PinError>;
    fn init_spi(
        &self,
        path: &str,
        params: &SpiParams,
    ) -> Result<Self::Bus, BusError>;
}

/// Wakes the poll thread: a pending-signal count under a condvar. Signals
/// are counted, not flagged, so SRDY edges observed back-to-back each get
/// their drain.
pub(crate) struct Wake {
    pending: Mutex<u32>,
    cond: Condvar,
}

/// Slice for condvar waits, so shutdown is observed promptly.
const WAKE_SLICE: Duration = Duration::from_millis(100);

impl Wake {
    fn new() -> Self {
        Self {
            pending: Mutex::new(0),
            cond: Condvar::new(),
        }
    }

    pub(crate) fn signal(&self) {
        if let Ok(mut pending) = self.pending.lock() {
            *pending = pending.saturating_add(1);
        }
        self.cond.notify_all();
    }

    /// Interrupt-mode wait: blocks until a signal is pending, consuming
    /// one. Returns `false` on shutdown (or a poisoned wake lock, which
    /// only happens when the process is already coming down in pieces).
    pub(crate) fn wait(&self, terminate: &AtomicBool) -> bool {
        let Ok(mut pending) = self.pending.lock() else {
            return false;
        };
        loop {
            if terminate.load(Ordering::Acquire) {
                return false;
            }
            if *pending > 0 {
                *pending -= 1;
                return true;
            }
            match self.cond.wait_timeout(pending, WAKE_SLICE) {
                Ok((guard, _)) => pending = guard,
                Err(_) => return false,
            }
        }
    }

    /// Polling-mode tick: sleeps for `period` unless poked earlier.
    pub(crate) fn wait_timeout(&self, period: Duration) {
        if let Ok(pending) = self.pending.lock() {
            let _ = self.cond.wait_timeout(pending, period);
        }
    }
}

/// State shared between the client handle and the transport threads.
pub(crate) struct Shared<B, P> {
    pub(crate) link: Mutex<Link<B, P>>,
    pub(crate) poll_lock_var: AtomicU8,
    pub(crate) srdy_gate: Mutex<()>,
    pub(crate) wake: Wake,
    pub(crate) terminate: Arc<AtomicBool>,
    pub(crate) listen_mode: ListenMode,
    /// Last SRDY level the event thread observed; the poll thread always
    /// re-verifies against the line itself before touching the wire.
    pub(crate) global_srdy: AtomicBool,
    pub(crate) missed_interrupts: AtomicU32,
    /// The event thread's own view of SRDY. Reading the line is all it is
    /// allowed to do; the SPI bus stays behind the poll lock.
    pub(crate) event_srdy: Line<P>,
    pub(crate) handler: Arc<dyn NpiHandler>,
}

/// The scoped transaction body: poll lock plus shadow flag, plus the SRDY
/// gate on client paths in interrupt mode. Constructing one asserts the
/// flag was clear; releasing asserts it was set. A mismatch either way is
/// `PollLockVarError` carrying the instrumentation line.
pub(crate) struct TxnGuard<'a, B, P> {
    pub(crate) link: MutexGuard<'a, Link<B, P>>,
    _srdy_gate: Option<MutexGuard<'a, ()>>,
    var: &'a AtomicU8,
    released: bool,
}

impl<'a, B, P> TxnGuard<'a, B, P> {
    pub(crate) fn acquire(
        shared: &'a Shared<B, P>,
        take_srdy_gate: bool,
        line: u32,
    ) -> Result<Self, NpiError> {
        // A poisoned lock means a transaction body panicked; that is the
        // same class of unrecoverable programmer error the shadow flag
        // exists to catch.
        let link = shared
            .link
            .lock()
            .map_err(|_| NpiError::PollLockVarError(line))?;
        let srdy_gate = if take_srdy_gate {
            Some(
                shared
                    .srdy_gate
                    .lock()
                    .map_err(|_| NpiError::PollLockVarError(line))?,
            )
        } else {
            None
        };
        if shared
            .poll_lock_var
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(NpiError::PollLockVarError(line));
        }
        Ok(Self {
            link,
            _srdy_gate: srdy_gate,
            var: &shared.poll_lock_var,
            released: false,
        })
    }

    /// Ends the transaction, verifying the shadow flag pairing.
    pub(crate) fn release(mut self, line: u32) -> Result<(), NpiError> {
        self.released = true;
        self.var
            .compare_exchange(1, 0, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| NpiError::PollLockVarError(line))
    }
}

impl<B, P> Drop for TxnGuard<'_, B, P> {
    fn drop(&mut self) {
        // Unwind path (an early `?` between acquire and release): clear
        // the flag so the holder that set it is the one that clears it.
        if !self.released {
            let _ = self.var.compare_exchange(
                1,
                0,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
        }
    }
}

/// A live transport. Dropping it shuts the threads down.
pub struct Transport<H: NpiHal> {
    shared: Arc<Shared<H::Bus, H::Pin>>,
    poll_thread: Option<thread::JoinHandle<()>>,
    event_thread: Option<thread::JoinHandle<()>>,
}

impl<H: NpiHal> fmt::Debug for Transport<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport").finish_non_exhaustive()
    }
}

impl<H: NpiHal> Transport<H> {
    /// Opens the transport: initializes the lines and the bus, resets and
    /// synchronizes the slave, then starts the transport threads. On any
    /// failure everything initialized so far is torn down before the
    /// error is returned.
    pub fn open(
        hal: &H,
        cfg: &NpiConfig,
        handler: Arc<dyn NpiHandler>,
    ) -> Result<Self, NpiError> {
        if cfg.startup_delay > Duration::ZERO {
            info!(
                "sleeping {}s before bring-up",
                cfg.startup_delay.as_secs()
            );
            thread::sleep(cfg.startup_delay);
        }

        let terminate = Arc::new(AtomicBool::new(false));

        // GPIO first, so SPI init cannot glitch a bus the slave is
        // already watching.
        let reset = match &cfg.reset {
            Some(line_cfg) => {
                let pin = hal
                    .init_reset(line_cfg)
                    .map_err(|_| NpiError::GpioInitFailed(LineName::Reset))?;
                Some(Line::new(
                    Arc::new(pin),
                    LineName::Reset,
                    line_cfg.polarity,
                    terminate.clone(),
                ))
            }
            None => None,
        };
        let mrdy = hal
            .init_mrdy(&cfg.mrdy)
            .map_err(|_| NpiError::GpioInitFailed(LineName::Mrdy))?;
        let mrdy = Line::new(
            Arc::new(mrdy),
            LineName::Mrdy,
            cfg.mrdy.polarity,
            terminate.clone(),
        );
        let srdy_pin = Arc::new(
            hal.init_srdy(&cfg.srdy)
                .map_err(|_| NpiError::GpioInitFailed(LineName::Srdy))?,
        );
        let srdy = Line::new(
            srdy_pin.clone(),
            LineName::Srdy,
            cfg.srdy.polarity,
            terminate.clone(),
        );
        let event_srdy = Line::new(
            srdy_pin,
            LineName::Srdy,
            cfg.srdy.polarity,
            terminate.clone(),
        );
        let bus = hal
            .init_spi(&cfg.dev_path, &cfg.spi)
            .map_err(|_| NpiError::SpiInitFailed)?;

        debug!(
            "opening SPI transport on {}: earlyMrdyDeAssert={} \
             detectReset={} forceRun={:?} handshake={}",
            cfg.dev_path,
            cfg.flags.early_mrdy_deassert,
            cfg.flags.detect_reset_from_slow_srdy_assert,
            cfg.flags.force_run_on_reset,
            cfg.flags.srdy_mrdy_handshake_support,
        );

        let link = Link::new(
            bus,
            srdy,
            mrdy,
            reset,
            cfg.flags,
            cfg.reset_detect,
        );
        let shared = Arc::new(Shared {
            link: Mutex::new(link),
            poll_lock_var: AtomicU8::new(0),
            srdy_gate: Mutex::new(()),
            wake: Wake::new(),
            terminate,
            listen_mode: cfg.flags.listen_mode,
            global_srdy: AtomicBool::new(false),
            missed_interrupts: AtomicU32::new(0),
            event_srdy,
            handler,
        });

        // Bring-up happens under the transaction guard, before the
        // threads exist: polling is forbidden until reset and sync are
        // done.
        {
            let mut guard = TxnGuard::acquire(&shared, false, line!())?;
            guard.link.reset_slave()?;
            guard.link.sync_slave()?;
            guard.release(line!())?;
        }

        let mut transport = Self {
            shared: shared.clone(),
            poll_thread: None,
            event_thread: None,
        };

        let poll_shared = shared.clone();
        transport.poll_thread = Some(
            thread::Builder::new()
                .name("npi-poll".to_string())
                .spawn(move || poll::poll_loop(poll_shared))
                .map_err(|_| NpiError::ThreadCreateFailed)?,
        );

        if cfg.flags.listen_mode == ListenMode::Interrupt {
            let event_shared = shared.clone();
            match thread::Builder::new()
                .name("npi-event".to_string())
                .spawn(move || poll::event_loop(event_shared))
            {
                Ok(handle) => transport.event_thread = Some(handle),
                Err(_) => {
                    transport.close();
                    return Err(NpiError::ThreadCreateFailed);
                }
            }
        }

        Ok(transport)
    }

    fn take_srdy_gate(&self) -> bool {
        self.shared.listen_mode == ListenMode::Interrupt
    }

    fn check_open(&self) -> Result<(), NpiError> {
        if self.shared.terminate.load(Ordering::Acquire) {
            return Err(NpiError::Closed);
        }
        Ok(())
    }

    /// Sends a fire-and-forget AREQ frame.
    pub fn send_async(&self, msg: &mut NpiMsg) -> Result<(), NpiError> {
        self.check_open()?;
        let mut guard =
            TxnGuard::acquire(&self.shared, self.take_srdy_gate(), line!())?;
        let r = guard.link.send_areq(msg);
        guard.release(line!()).and(r)
    }

    /// Sends an SREQ frame and waits for its SRSP, which overwrites `msg`.
    ///
    /// A `PossibleSlaveReset` return means the slave answered with its
    /// reset handshake instead of a response; re-issue [`Self::reset_slave`]
    /// (and [`Self::sync_slave`]) before retrying.
    pub fn send_sync(&self, msg: &mut NpiMsg) -> Result<(), NpiError> {
        self.check_open()?;
        let mut guard =
            TxnGuard::acquire(&self.shared, self.take_srdy_gate(), line!())?;
        let r = guard.link.send_sreq(msg);
        guard.release(line!()).and(r)
    }

    /// Runs the reset sequence: hardware pulse (plus the optional
    /// force-run byte) or the software fallback.
    pub fn reset_slave(&self) -> Result<(), NpiError> {
        self.check_open()?;
        let mut guard =
            TxnGuard::acquire(&self.shared, self.take_srdy_gate(), line!())?;
        let r = guard.link.reset_slave();
        guard.release(line!()).and(r)
    }

    /// Runs the 4-edge post-reset handshake (a no-op when the slave does
    /// not support it).
    pub fn sync_slave(&self) -> Result<(), NpiError> {
        self.check_open()?;
        let mut guard =
            TxnGuard::acquire(&self.shared, self.take_srdy_gate(), line!())?;
        let r = guard.link.sync_slave();
        guard.release(line!()).and(r)
    }

    /// Snapshot of the transport counters.
    pub fn stats(&self) -> LinkStats {
        let mut stats = self
            .shared
            .link
            .lock()
            .map(|link| link.stats)
            .unwrap_or_default();
        stats.missed_interrupts = stats.missed_interrupts.wrapping_add(
            self.shared.missed_interrupts.load(Ordering::Relaxed),
        );
        stats
    }

    /// Whether the transport threads are still running. False after
    /// `close`, and after a fatal fault took the poll thread down.
    pub fn is_running(&self) -> bool {
        !self.shared.terminate.load(Ordering::Acquire)
    }

    /// Shuts the transport down: raises the terminate flag, wakes
    /// whatever is waiting, and joins the threads. Idempotent; also run
    /// on drop. HAL handles close when the transport is dropped.
    pub fn close(&mut self) {
        self.shared.terminate.store(true, Ordering::Release);
        self.shared.wake.signal();
        if let Some(handle) = self.poll_thread.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.event_thread.take() {
            let _ = handle.join();
        }
    }
}

impl<H: NpiHal> Drop for Transport<H> {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpio::Level;
    use drv_npi_spi_api::config::{MrdySrdyFlags, Polarity};

    struct NullPin;

    impl GpioPin for NullPin {
        fn set_high(&self) -> Result<(), PinError> {
            Ok(())
        }
        fn set_low(&self) -> Result<(), PinError> {
            Ok(())
        }
        fn level(&self) -> Result<Level, PinError> {
            Ok(Level::High)
        }
    }

    struct NullBus;

    impl SpiBus for NullBus {
        fn write(&mut self, _tx: &[u8]) -> Result<(), BusError> {
            Ok(())
        }
        fn read(&mut self, _rx: &mut [u8]) -> Result<(), BusError> {
            Ok(())
        }
    }

    struct NullHandler;

    impl NpiHandler for NullHandler {
        fn areq(
            &self,
            _msg: &NpiMsg,
        ) -> Result<(), drv_npi_spi_api::CallbackError> {
            Ok(())
        }
        fn fault(&self, _err: NpiError, _detail: &str) {}
    }

    fn null_shared() -> Shared<NullBus, NullPin> {
        let terminate = Arc::new(AtomicBool::new(false));
        let line = |name, terminate: &Arc<AtomicBool>| {
            Line::new(
                Arc::new(NullPin),
                name,
                Polarity::ActiveLow,
                terminate.clone(),
            )
        };
        let srdy = line(LineName::Srdy, &terminate);
        let mrdy = line(LineName::Mrdy, &terminate);
        Shared {
            link: Mutex::new(Link::new(
                NullBus,
                srdy,
                mrdy,
                None,
                MrdySrdyFlags::default(),
                Duration::from_millis(500),
            )),
            poll_lock_var: AtomicU8::new(0),
            srdy_gate: Mutex::new(()),
            wake: Wake::new(),
            terminate,
            listen_mode: ListenMode::Polling,
            global_srdy: AtomicBool::new(false),
            missed_interrupts: AtomicU32::new(0),
            event_srdy: Line::new(
                Arc::new(NullPin),
                LineName::Srdy,
                Polarity::ActiveLow,
                Arc::new(AtomicBool::new(false)),
            ),
            handler: Arc::new(NullHandler),
        }
    }

    #[test]
    fn guard_pairs_shadow_flag() {
        let shared = null_shared();
        assert_eq!(shared.poll_lock_var.load(Ordering::Acquire), 0);
        let guard = TxnGuard::acquire(&shared, false, line!()).unwrap();
        assert_eq!(shared.poll_lock_var.load(Ordering::Acquire), 1);
        guard.release(line!()).unwrap();
        assert_eq!(shared.poll_lock_var.load(Ordering::Acquire), 0);
    }

    #[test]
    fn acquire_detects_stuck_flag() {
        let shared = null_shared();
        shared.poll_lock_var.store(1, Ordering::Release);
        let here = line!();
        match TxnGuard::acquire(&shared, false, here) {
            Err(NpiError::PollLockVarError(line)) => assert_eq!(line, here),
            Err(other) => panic!("expected PollLockVarError, got {other:?}"),
            Ok(_) => panic!("acquire succeeded with the flag stuck"),
        };
    }

    #[test]
    fn release_detects_cleared_flag() {
        let shared = null_shared();
        let guard = TxnGuard::acquire(&shared, false, line!()).unwrap();
        // Someone else cleared the flag under us.
        shared.poll_lock_var.store(0, Ordering::Release);
        let here = line!();
        match guard.release(here) {
            Err(NpiError::PollLockVarError(line)) => assert_eq!(line, here),
            other => panic!("expected PollLockVarError, got {other:?}"),
        }
    }

    #[test]
    fn guard_unwind_clears_flag() {
        let shared = null_shared();
        {
            let _guard = TxnGuard::acquire(&shared, false, line!()).unwrap();
            // Dropped without release, as on an early error return.
        }
        assert_eq!(shared.poll_lock_var.load(Ordering::Acquire), 0);
        // And the next transaction proceeds normally.
        let guard = TxnGuard::acquire(&shared, false, line!()).unwrap();
        guard.release(line!()).unwrap();
    }
}
