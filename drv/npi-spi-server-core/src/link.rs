// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The MRDY/SRDY handshake engine.
//!
//! All four primitive operations live here: the asynchronous send, the
//! synchronous request/response, the slave-initiated poll drain, and the
//! reset/sync bring-up. Every primitive runs with the transport lock held
//! (its `&mut self` receiver is only reachable through the transaction
//! guard) and must leave MRDY deasserted on every exit path, surfacing the
//! first error encountered.
//!
//! Handshake shape, with the usual active-low wiring:
//!
//! ```text
//! AREQ:  MRDY v ... SRDY v (ack) ... write frame ............. MRDY ^
//! SREQ:  MRDY v ... SRDY v (ack) ... write frame ... SRDY ^ (response
//!        ready) ... read header+payload ...................... MRDY ^
//! POLL:  MRDY v ... write 3-byte preamble ... SRDY ^ ... read
//!        header+payload ................................ MRDY ^
//! ```
//!
//! A slow SRDY rise on the response edge is how a freshly rebooted slave
//! answers: it performs its reset handshake instead of a response. With
//! `detect_reset_from_slow_srdy_assert` set, an elapsed time above the
//! configured threshold is reported as `PossibleSlaveReset` so the caller
//! can re-run the reset sequence.

use std::thread;
use std::time::{Duration, Instant};

use log::{debug, trace, warn};

use drv_npi_spi_api::config::MrdySrdyFlags;
use drv_npi_spi_api::{LineName, LinkStats, MsgType, NpiError, NpiMsg};

use crate::gpio::{GpioPin, Line};
use crate::spi::SpiBus;

/// How long a handshake edge may take before the wait is abandoned.
pub(crate) const SRDY_WAIT_TIMEOUT: Duration = Duration::from_secs(2);

/// Width of the hardware reset pulse.
const RESET_PULSE: Duration = Duration::from_millis(1);

/// Slave firmware init window after a reset.
const RESET_SETTLE: Duration = Duration::from_micros(500);

/// Grace period after a failed SRDY read on the response edge; the slave
/// may be mid-reset and recover.
const SRDY_READ_FAIL_GRACE: Duration = Duration::from_millis(5);

/// Subsystem and command id of the canned software-reset request, for
/// peers wired without a reset line. The command id comes from the peer's
/// RTI surrogate command table.
const SUBSYS_RCAF: u8 = 0x01;
const CMD_SW_RESET: u8 = 0x28;

pub(crate) struct Link<B, P> {
    spi: B,
    srdy: Line<P>,
    mrdy: Line<P>,
    reset: Option<Line<P>>,
    flags: MrdySrdyFlags,
    reset_detect: Duration,
    pub(crate) stats: LinkStats,
}

impl<B: SpiBus, P: GpioPin> Link<B, P> {
    pub fn new(
        spi: B,
        srdy: Line<P>,
        mrdy: Line<P>,
        reset: Option<Line<P>>,
        flags: MrdySrdyFlags,
        reset_detect: Duration,
    ) -> Self {
        Self {
            spi,
            srdy,
            mrdy,
            reset,
            flags,
            reset_detect,
            stats: LinkStats::default(),
        }
    }

    pub fn srdy_is_asserted(&self) -> Result<bool, NpiError> {
        self.srdy.is_asserted()
    }

    /// Fire-and-forget send. The frame is retagged AREQ; the slave
    /// acknowledges MRDY by asserting SRDY, after which the frame is
    /// clocked out in one transfer.
    pub fn send_areq(&mut self, msg: &mut NpiMsg) -> Result<(), NpiError> {
        msg.set_msg_type(MsgType::Areq);
        trace!("[AREQ] sending {} byte frame", msg.wire().len());
        self.mrdy.assert()?;
        let r = self.areq_body(msg);
        let m = self.mrdy.deassert();
        self.finish_tx(r.and(m))
    }

    fn areq_body(&mut self, msg: &NpiMsg) -> Result<(), NpiError> {
        self.srdy.wait_asserted(SRDY_WAIT_TIMEOUT)?;
        self.spi
            .write(msg.wire())
            .map_err(|_| NpiError::SpiIoError)
    }

    /// Synchronous request/response. The SRSP overwrites `msg` in place.
    pub fn send_sreq(&mut self, msg: &mut NpiMsg) -> Result<(), NpiError> {
        msg.set_msg_type(MsgType::Sreq);
        trace!("[SREQ] sending {} byte frame", msg.wire().len());
        self.mrdy.assert()?;
        let mut mrdy_live = true;
        let mut r = self.sreq_body(msg, &mut mrdy_live);
        if mrdy_live {
            r = r.and(self.mrdy.deassert());
        }
        let r = self.finish_tx(r);
        if r.is_ok() {
            self.stats.rx_received = self.stats.rx_received.wrapping_add(1);
            trace!(
                "[SREQ] response {:02x?} + {} payload bytes",
                msg.header(),
                msg.len()
            );
        }
        r
    }

    fn sreq_body(
        &mut self,
        msg: &mut NpiMsg,
        mrdy_live: &mut bool,
    ) -> Result<(), NpiError> {
        self.srdy.wait_asserted(SRDY_WAIT_TIMEOUT)?;
        self.spi
            .write(msg.wire())
            .map_err(|_| NpiError::SpiIoError)?;

        let t0 = Instant::now();
        if let Err(e) = self.srdy.wait_deasserted(SRDY_WAIT_TIMEOUT) {
            if e == NpiError::GpioIoError(LineName::Srdy) {
                // The slave may be mid-reset; give it a beat before the
                // caller sees the failure.
                thread::sleep(SRDY_READ_FAIL_GRACE);
            }
            return Err(e);
        }
        let elapsed = t0.elapsed();

        if self.flags.early_mrdy_deassert {
            // Deassert before the payload transfer: if the slave sees MRDY
            // still low at the end of the transaction it takes it for a
            // new one and re-asserts SRDY.
            self.mrdy.deassert()?;
            *mrdy_live = false;
        }

        self.check_reset_detect("SREQ", elapsed)?;
        self.read_frame_into(msg)
    }

    /// Reads a response header and payload into `msg`. The illegal header
    /// and oversized length claims are transport errors here; the poll
    /// path has its own, more forgiving reader.
    fn read_frame_into(&mut self, msg: &mut NpiMsg) -> Result<(), NpiError> {
        let region = msg.header_region_mut();
        self.spi.read(region).map_err(|_| NpiError::SpiIoError)?;
        if msg.header().is_illegal() {
            self.stats.rx_invalid = self.stats.rx_invalid.wrapping_add(1);
            return Err(NpiError::IllegalHeader);
        }
        let len = msg.len();
        if len > 0 {
            let region = match msg.payload_region_mut(len) {
                Ok(region) => region,
                Err(e) => {
                    self.stats.rx_invalid =
                        self.stats.rx_invalid.wrapping_add(1);
                    return Err(e);
                }
            };
            self.spi.read(region).map_err(|_| NpiError::SpiIoError)?;
        }
        Ok(())
    }

    /// Drains one slave-initiated frame. The caller has already observed
    /// SRDY asserted, so there is no acknowledge wait: the poll preamble
    /// goes straight out and SRDY's rise signals the frame is ready.
    ///
    /// Returns `Ok(None)` when the slave answered with the illegal header
    /// or an unframeable length; those are logged and dropped.
    pub fn poll_slave(&mut self) -> Result<Option<NpiMsg>, NpiError> {
        let mut msg = NpiMsg::poll();
        self.stats.polls = self.stats.polls.wrapping_add(1);
        self.mrdy.assert()?;
        let mut mrdy_live = true;
        let mut r = self.poll_body(&mut msg, &mut mrdy_live);
        if mrdy_live {
            if let Err(e) = self.mrdy.deassert() {
                r = r.and(Err(e));
            }
        }
        match &r {
            Ok(Some(_)) => {
                self.stats.rx_received = self.stats.rx_received.wrapping_add(1)
            }
            Ok(None) => {}
            Err(e) => self.note_error(e),
        }
        r
    }

    fn poll_body(
        &mut self,
        msg: &mut NpiMsg,
        mrdy_live: &mut bool,
    ) -> Result<Option<NpiMsg>, NpiError> {
        self.spi
            .write(msg.wire())
            .map_err(|_| NpiError::SpiIoError)?;

        let t0 = Instant::now();
        self.srdy.wait_deasserted(SRDY_WAIT_TIMEOUT)?;
        let elapsed = t0.elapsed();

        if self.flags.early_mrdy_deassert {
            self.mrdy.deassert()?;
            *mrdy_live = false;
        }

        self.check_reset_detect("POLL", elapsed)?;

        let region = msg.header_region_mut();
        self.spi.read(region).map_err(|_| NpiError::SpiIoError)?;
        if msg.header().is_illegal() {
            warn!("[POLL] invalid header (FF FF FF) received, dropping");
            self.stats.rx_invalid = self.stats.rx_invalid.wrapping_add(1);
            return Ok(None);
        }
        let len = msg.header().len as usize;
        if len > 0 {
            let region = match msg.payload_region_mut(len) {
                Ok(region) => region,
                Err(_) => {
                    warn!("[POLL] header claims {len} payload bytes, dropping");
                    self.stats.rx_invalid =
                        self.stats.rx_invalid.wrapping_add(1);
                    return Ok(None);
                }
            };
            self.spi.read(region).map_err(|_| NpiError::SpiIoError)?;
        }
        Ok(Some(*msg))
    }

    fn check_reset_detect(
        &mut self,
        what: &str,
        elapsed: Duration,
    ) -> Result<(), NpiError> {
        if self.flags.detect_reset_from_slow_srdy_assert
            && elapsed > self.reset_detect
        {
            warn!(
                "[{what}] SRDY took {} us to go high, slave may have reset",
                elapsed.as_micros()
            );
            return Err(NpiError::PossibleSlaveReset);
        }
        Ok(())
    }

    /// Resets the slave: a hardware pulse when a reset line is wired, the
    /// software fallback otherwise. Ends with the firmware init window
    /// either way.
    pub fn reset_slave(&mut self) -> Result<(), NpiError> {
        debug!("[RESET] resetting slave");
        let r = match &self.reset {
            Some(_) => self.hard_reset(),
            None => self.soft_reset(),
        };
        thread::sleep(RESET_SETTLE);
        r
    }

    fn hard_reset(&mut self) -> Result<(), NpiError> {
        // Checked by reset_slave.
        let Some(reset) = &self.reset else {
            return Err(NpiError::GpioIoError(LineName::Reset));
        };
        reset.pulse(RESET_PULSE)?;

        if let Some(byte) = self.flags.force_run_on_reset {
            let r = self
                .srdy
                .wait_asserted(SRDY_WAIT_TIMEOUT)
                .and_then(|()| {
                    self.spi.write(&[byte]).map_err(|_| NpiError::SpiIoError)
                });
            // Wait out the SRDY release even on failure so the slave is
            // not left mid-handshake; the original error wins.
            let release = self.srdy.wait_deasserted(SRDY_WAIT_TIMEOUT);
            r.and(release)?;
        }
        Ok(())
    }

    /// No reset line: ask the slave to reset itself. Skipped when SRDY is
    /// already asserted, which means the slave is just coming out of a
    /// cold boot and is already in its reset handshake.
    fn soft_reset(&mut self) -> Result<(), NpiError> {
        if self.srdy.is_asserted()? {
            return Ok(());
        }
        warn!("[RESET] no reset line wired, attempting software reset");
        let mut msg = NpiMsg::new(MsgType::Areq, SUBSYS_RCAF, CMD_SW_RESET, &[])?;
        self.send_areq(&mut msg)?;

        // If the slave was sitting in its bootloader, clock three dummy
        // bytes to resynchronize it. Best-effort: the reset request has
        // already gone out.
        if self.mrdy.assert().is_ok() {
            let _ = self.spi.write(&[0u8; drv_npi_spi_api::RPC_FRAME_HDR_SZ]);
            let _ = self.mrdy.deassert();
        }
        Ok(())
    }

    /// The 4-edge post-reset handshake: SRDY falls (slave requests sync),
    /// MRDY answers, SRDY rises, MRDY releases. Afterwards SRDY must rest
    /// deasserted.
    pub fn sync_slave(&mut self) -> Result<(), NpiError> {
        if !self.flags.srdy_mrdy_handshake_support {
            return Ok(());
        }
        debug!("[HANDSHAKE] waiting for SRDY to go low");
        self.srdy.wait_asserted(SRDY_WAIT_TIMEOUT)?;
        self.mrdy.assert()?;
        let r = self.srdy.wait_deasserted(SRDY_WAIT_TIMEOUT);
        let m = self.mrdy.deassert();
        r.and(m)?;
        if self.srdy.is_asserted()? {
            // The slave dropped SRDY again right after the handshake; it
            // did not come out of sync.
            return Err(NpiError::SrdyWaitTimeout);
        }
        debug!("[HANDSHAKE] success");
        Ok(())
    }

    fn finish_tx(&mut self, r: Result<(), NpiError>) -> Result<(), NpiError> {
        match &r {
            Ok(()) => {
                self.stats.tx_sent = self.stats.tx_sent.wrapping_add(1)
            }
            Err(e) => self.note_error(e),
        }
        r
    }

    fn note_error(&mut self, e: &NpiError) {
        self.stats.tx_errors = self.stats.tx_errors.wrapping_add(1);
        match e {
            NpiError::SrdyWaitTimeout | NpiError::MrdyWaitTimeout => {
                self.stats.timeouts = self.stats.timeouts.wrapping_add(1)
            }
            NpiError::PossibleSlaveReset => {
                self.stats.possible_resets =
                    self.stats.possible_resets.wrapping_add(1)
            }
            _ => {}
        }
    }
}
