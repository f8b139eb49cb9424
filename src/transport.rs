//! The hardware the controller drives.
//!
//! The data link only needs a byte stream, which can be clocked at two different rates, and three
//! signals: the ready line driven by the agent, the wake line driven by us and the interrupt
//! latched on the rising edge of the ready line.
use embassy_time::Duration;

use crate::sync::await_condition;

/// Errors reported by a [ByteTransport].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransportError {
    /// The peripheral reported an error during the transfer.
    Bus,
    /// The requested clock rate can't be configured.
    UnsupportedFrequency,
}

/// A blocking, byte oriented bus like SPI or SDIO.
///
/// Transfers don't time out on their own. Flow control is handled by the data link through the
/// [SignalLines].
pub trait ByteTransport {
    /// Clock out all of `data`.
    async fn transmit(&mut self, data: &[u8]) -> Result<(), TransportError>;
    /// Clock in exactly `buffer.len()` bytes.
    async fn receive(&mut self, buffer: &mut [u8]) -> Result<(), TransportError>;
    /// Change the bus clock for all following transfers.
    fn set_frequency(&mut self, frequency: u32) -> Result<(), TransportError>;
}

/// The handshake lines between controller and agent.
pub trait SignalLines {
    /// Sample the ready line.
    fn is_ready_high(&mut self) -> bool;
    /// Drive the wake line.
    fn set_wake(&mut self, asserted: bool);
    /// Allow the rising edge of the ready line to raise an interrupt.
    fn enable_ready_irq(&mut self);
    /// Mask the ready line interrupt.
    fn disable_ready_irq(&mut self);
    /// Discard an edge, that was latched while the interrupt was masked.
    fn clear_ready_irq(&mut self);

    /// Wait until the ready line is high. Returns `false` on timeout.
    async fn wait_ready_high(&mut self, timeout: Duration) -> bool {
        await_condition(|| self.is_ready_high(), timeout).await
    }
    /// Wait until the ready line is low. Returns `false` on timeout.
    async fn wait_ready_low(&mut self, timeout: Duration) -> bool {
        await_condition(|| !self.is_ready_high(), timeout).await
    }
}
