// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The poll thread and, in interrupt mode, the SRDY event thread.
//!
//! The poll thread drains slave-initiated frames: it waits until SRDY has
//! been observed asserted, takes the transaction guard, re-verifies SRDY
//! (the observation races the wire), runs the poll primitive, and hands
//! AREQ frames to the upper layer. Any transport-level failure is fatal
//! for the thread: it raises the terminate flag, notifies the fault sink,
//! and exits.
//!
//! The event thread never touches the SPI bus. It turns the SRDY
//! readiness handle's edges into wake signals for the poll thread, and
//! adapts its own poll timeout to the observed traffic cadence so that a
//! missed edge interrupt (they do get lost) degrades latency rather than
//! stalling the link.

use std::sync::atomic::Ordering;
use std::sync::{Arc, TryLockError};
use std::time::{Duration, Instant};

use log::{debug, error, trace};

use drv_npi_spi_api::config::ListenMode;
use drv_npi_spi_api::{MsgType, NpiError};

use crate::gpio::{EdgeEvent, GpioPin};
use crate::spi::SpiBus;
use crate::{Shared, TxnGuard};

/// Polling-mode cadence: with no readiness handle the slave queue is
/// checked this often.
const POLL_PERIOD: Duration = Duration::from_millis(10);

/// Bounds of the event thread's adaptive timeout.
const EVENT_TIMEOUT_MIN: Duration = Duration::from_millis(3);
const EVENT_TIMEOUT_MAX: Duration = Duration::from_millis(100);

/// After this many consecutive quiet timeouts at a tightened cadence, the
/// timeout relaxes back to the maximum.
const CONSECUTIVE_TIMEOUT_LIMIT: u32 = 100;

/// Adapts the event poll timeout to the inter-arrival time of SRDY
/// assertions.
pub(crate) fn next_timeout(delta: Duration) -> Duration {
    delta.clamp(EVENT_TIMEOUT_MIN, EVENT_TIMEOUT_MAX)
}

pub(crate) fn poll_loop<B: SpiBus, P: GpioPin>(shared: Arc<Shared<B, P>>) {
    debug!("[POLL] thread started");
    let mut failure: Option<NpiError> = None;
    // After a successful drain, poll again immediately to empty the
    // slave's queue before sleeping.
    let mut drained = false;

    while !shared.terminate.load(Ordering::Acquire) {
        match shared.listen_mode {
            ListenMode::Interrupt => {
                if !shared.wake.wait(&shared.terminate) {
                    break;
                }
                trace!(
                    "[POLL] woken (SRDY={})",
                    shared.global_srdy.load(Ordering::Relaxed)
                );
            }
            ListenMode::Polling => {
                if !drained {
                    shared.wake.wait_timeout(POLL_PERIOD);
                }
            }
        }
        if shared.terminate.load(Ordering::Acquire) {
            break;
        }

        let mut guard = match TxnGuard::acquire(&shared, false, line!()) {
            Ok(guard) => guard,
            Err(e) => {
                failure = Some(e);
                break;
            }
        };

        // The wake (or the cadence) said SRDY was asserted a moment ago;
        // verify it still is before touching the wire. An AREQ of ours may
        // have drained the queue in between.
        match guard.link.srdy_is_asserted() {
            Ok(true) => {}
            Ok(false) => {
                trace!("[POLL] SRDY not asserted, nothing to drain");
                drained = false;
                match guard.release(line!()) {
                    Ok(()) => continue,
                    Err(e) => {
                        failure = Some(e);
                        break;
                    }
                }
            }
            Err(e) => {
                failure = Some(e);
                break;
            }
        }

        let mut step = Ok(());
        match guard.link.poll_slave() {
            Ok(Some(msg)) if msg.msg_type() == MsgType::Areq => {
                if shared.handler.areq(&msg).is_err() {
                    error!("[POLL] upper layer refused a frame, terminating");
                    step = Err(NpiError::CallbackFailure);
                }
            }
            // Non-AREQ frames and dropped illegal headers are not
            // delivered.
            Ok(_) => {}
            Err(e) => step = Err(e),
        }
        let released = guard.release(line!());
        match released.and(step) {
            Ok(()) => drained = true,
            Err(e) => {
                if e == NpiError::PossibleSlaveReset {
                    error!("[POLL] unexpected handshake received, slave may have reset");
                }
                failure = Some(e);
                break;
            }
        }
    }

    shared.terminate.store(true, Ordering::Release);
    match failure {
        Some(e) => {
            error!("[POLL] thread exiting on error: {e}");
            shared
                .handler
                .fault(e, "SPI poll thread exited with error");
        }
        None => debug!("[POLL] thread exiting"),
    }
}

pub(crate) fn event_loop<B: SpiBus, P: GpioPin>(shared: Arc<Shared<B, P>>) {
    debug!("[EVENT] SRDY event thread started");
    let mut timeout = EVENT_TIMEOUT_MAX;
    let mut missed: u32 = 0;
    let mut consecutive_timeouts: u32 = 0;
    let mut prev_assert: Option<Instant> = None;
    let mut failure: Option<NpiError> = None;

    while !shared.terminate.load(Ordering::Acquire) {
        let event = shared.event_srdy.wait_edge(timeout);

        // A client transaction owns SRDY right now; whatever we saw was
        // its handshake, not slave-initiated traffic.
        let gate = match shared.srdy_gate.try_lock() {
            Ok(gate) => gate,
            Err(TryLockError::WouldBlock) => continue,
            Err(TryLockError::Poisoned(_)) => {
                failure = Some(NpiError::PollLockVarError(line!()));
                break;
            }
        };

        let asserted = match event {
            Err(e) => {
                failure = Some(e);
                break;
            }
            Ok(EdgeEvent::TimedOut) => match shared.event_srdy.is_asserted() {
                Ok(true) => {
                    // The edge came and went without an event: a missed
                    // interrupt. Recover by level and tighten the cadence.
                    missed += 1;
                    consecutive_timeouts = 0;
                    shared
                        .missed_interrupts
                        .fetch_add(1, Ordering::Relaxed);
                    trace!("[EVENT] missed interrupt ({missed})");
                    true
                }
                Ok(false) => {
                    consecutive_timeouts += 1;
                    if timeout < EVENT_TIMEOUT_MAX
                        && consecutive_timeouts > CONSECUTIVE_TIMEOUT_LIMIT
                    {
                        consecutive_timeouts = 0;
                        timeout = EVENT_TIMEOUT_MAX;
                    }
                    missed = 0;
                    false
                }
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            },
            Ok(EdgeEvent::Edge) => {
                consecutive_timeouts = 0;
                if missed > 0 {
                    missed = 0;
                    timeout = EVENT_TIMEOUT_MAX;
                }
                match shared.event_srdy.is_asserted() {
                    Ok(asserted) => asserted,
                    Err(e) => {
                        failure = Some(e);
                        break;
                    }
                }
            }
        };
        shared.global_srdy.store(asserted, Ordering::Release);

        if asserted {
            let now = Instant::now();
            if let Some(prev) = prev_assert {
                timeout = next_timeout(now - prev);
            }
            prev_assert = Some(now);
            if missed > 0 && timeout > EVENT_TIMEOUT_MIN {
                timeout = EVENT_TIMEOUT_MIN;
            }

            // Release the gate before serializing on the transport lock:
            // a sync call in progress must complete (and may consume this
            // very SRDY assertion) before the poll thread is woken.
            drop(gate);
            match shared.link.lock() {
                Ok(link) => drop(link),
                Err(_) => {
                    failure = Some(NpiError::PollLockVarError(line!()));
                    break;
                }
            }
            trace!("[EVENT] signaling poll thread");
            shared.wake.signal();
        } else {
            drop(gate);
        }
    }

    shared.terminate.store(true, Ordering::Release);
    shared.wake.signal();
    match failure {
        Some(e) => {
            error!("[EVENT] thread exiting on error: {e}");
            shared
                .handler
                .fault(e, "SPI event thread exited with error");
        }
        None => debug!("[EVENT] thread exiting"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_tracks_cadence() {
        assert_eq!(
            next_timeout(Duration::from_millis(1)),
            Duration::from_millis(3)
        );
        assert_eq!(
            next_timeout(Duration::from_millis(50)),
            Duration::from_millis(50)
        );
        assert_eq!(
            next_timeout(Duration::from_millis(500)),
            Duration::from_millis(100)
        );
    }

    #[test]
    fn timeout_bounds_are_inclusive() {
        assert_eq!(next_timeout(EVENT_TIMEOUT_MIN), EVENT_TIMEOUT_MIN);
        assert_eq!(next_timeout(EVENT_TIMEOUT_MAX), EVENT_TIMEOUT_MAX);
    }
}
