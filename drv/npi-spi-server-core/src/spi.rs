// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The seam to the raw SPI HAL.
//!
//! No framing, no retry: the handshake engine sequences whole frames and
//! the HAL moves bytes. Reads clock dummy bytes; whether the HAL uses its
//! full-duplex transfer API underneath is selected at init time via
//! [`SpiParams::use_full_duplex`](drv_npi_spi_api::config::SpiParams).

/// Error from the bus backend.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BusError;

/// One opened SPI device as supplied by the platform HAL.
pub trait SpiBus: Send {
    fn write(&mut self, tx: &[u8]) -> Result<(), BusError>;
    fn read(&mut self, rx: &mut [u8]) -> Result<(), BusError>;
}
