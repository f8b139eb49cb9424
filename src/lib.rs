//! # `halow-datalink`
//! This is the controller side of the data link between a host microcontroller and a Wi-Fi HaLow
//! agent chip. It moves opaque packets over a half duplex byte bus (usually SPI) and is agnostic to
//! what's inside them.
//!
//! ## Hardware overview
//! Besides the bus itself, there are two signal lines. The wake line is driven by us and asserted
//! for the entire duration of a transaction. The ready line is driven by the agent and used for
//! flow control: it goes high, when the agent is prepared for the next step, and low, once it's
//! processing what we sent. A rising edge on the ready line outside of a transaction means, that
//! the agent has a packet for us, so that edge is wired to an interrupt.
//!
//! The agent can receive a lot faster than it can transmit, so the bus is clocked at a high rate
//! while transmitting and at a lower one while receiving.
//!
//! ### Transmit (TX)
//! A write starts by asserting wake and waiting for ready to go high. We then send a [FrameHeader]
//! with [FrameType::Write] and the payload length, wait for ready to go low again, send the
//! payload, wait for ready to go high and read back a single byte, which has to be
//! [FrameType::Ack]. After the trailing low transition, the transaction is over. The whole thing is
//! attempted up to three times, which may duplicate packets. The upper layers deal with that.
//!
//! ### Receive (RX)
//! The ready line interrupt only raises a [WakeSignal], which is awaited by the RX task
//! ([Datalink::run_rx]). That task then runs a read: assert wake, wait for ready, send a
//! [FrameType::Read] header, wait for ready to drop, read the two byte length, wait for ready,
//! read the payload, wait for ready to drop. A length of zero means, that the agent had nothing to
//! send after all. If a read fails, we ask the agent to send the same packet again with
//! [FrameType::Reread], so no packet gets lost.
//!
//! ### Mutual exclusion
//! TX and RX share the bus, so every transaction holds a lock for its entire duration. While that
//! lock is held, the ready line interrupt is masked, since the agent toggles the line as part of
//! the handshake. Once the transaction ends, a latched edge is discarded, the interrupt is unmasked
//! and wake is deasserted, in that order, no matter how the transaction ended.
//!
//! ## Usage
//! Implement [ByteTransport] and [SignalLines] for your board, create a [BufferPool] and pass all
//! of it to [Datalink::new]. Spawn [Datalink::run_rx] as a task and call
//! [Datalink::on_ready_edge] from the ready line interrupt handler.

#![cfg_attr(not(any(test, feature = "sim")), no_std)]
#![allow(async_fn_in_trait)]
pub(crate) mod fmt;

mod buffer;
mod config;
mod datalink;
mod frame;
mod sync;
mod transport;

#[cfg(any(test, feature = "sim"))]
pub mod sim;

pub use buffer::{BufferAllocator, BufferPool, PacketBuffer};
pub use config::DatalinkConfig;
pub use datalink::{Datalink, DatalinkError, DatalinkResult, RxHandler};
pub use frame::*;
pub use sync::{await_condition, WakeSignal};
pub use transport::{ByteTransport, SignalLines, TransportError};

cfg_if::cfg_if! {
    if #[cfg(feature = "critical_section")] {
        type DefaultRawMutex = embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
    } else {
        type DefaultRawMutex = embassy_sync::blocking_mutex::raw::NoopRawMutex;
    }
}
