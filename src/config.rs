use embassy_time::Duration;

use crate::datalink::{DatalinkError, DatalinkResult};

/// Tunables of the data link.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DatalinkConfig {
    /// How long to wait for the agent to raise the ready line after we asserted wake.
    ///
    /// The agent may be busy with something else entirely at this point, so this is very long.
    pub handshake_timeout: Duration,
    /// How long to wait for every other ready line transition within a transaction.
    pub ready_timeout: Duration,
    /// How many times a transaction is attempted, before giving up. Must be at least one.
    pub retry_attempts: u8,
    /// The clock used when transmitting to the agent.
    pub fast_clock_hz: u32,
    /// The clock used when receiving from the agent.
    ///
    /// The agent can't transmit as fast as it can receive, so this has to be lower than
    /// [DatalinkConfig::fast_clock_hz]. Getting this wrong produces bit errors, not protocol
    /// errors.
    pub slow_clock_hz: u32,
}
impl DatalinkConfig {
    /// Check that the configuration is usable.
    pub const fn validate(&self) -> DatalinkResult<()> {
        if self.retry_attempts == 0
            || self.fast_clock_hz == 0
            || self.slow_clock_hz == 0
            || self.slow_clock_hz > self.fast_clock_hz
        {
            Err(DatalinkError::InvalidConfig)
        } else {
            Ok(())
        }
    }
}
impl Default for DatalinkConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_millis(0xffff),
            ready_timeout: Duration::from_millis(100),
            retry_attempts: 3,
            // The agent can receive at up to 100 MHz, but only transmit below 38.5 MHz.
            fast_clock_hz: 80_000_000,
            slow_clock_hz: 20_000_000,
        }
    }
}
