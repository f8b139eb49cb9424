//! A host side model of the agent.
//!
//! [SimAgent] implements both [ByteTransport] and [SignalLines], so a [Datalink](crate::Datalink)
//! can be driven against it without any hardware. The ready line is derived from the state of the
//! agent, just like on the real chip, and rising edges are latched, while the interrupt is masked.
//!
//! Since the model can't call into the interrupt handler itself, edges, that would have fired the
//! interrupt, are collected and have to be forwarded to
//! [Datalink::on_ready_edge](crate::Datalink::on_ready_edge) by whoever drives the simulation,
//! after checking [SimAgent::take_edge].
use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use embassy_futures::yield_now;

use crate::{
    frame::{FrameHeader, FrameType, FRAME_HEADER_SIZE, FRAME_LENGTH_SIZE},
    transport::{ByteTransport, SignalLines, TransportError},
};

/// The fastest clock, at which the agent can still transmit.
pub const AGENT_MAX_TRANSMIT_HZ: u32 = 38_500_000;
/// The fastest clock, at which the agent can still receive.
pub const AGENT_MAX_RECEIVE_HZ: u32 = 100_000_000;

/// Misbehaviour, that can be injected into a transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Fault {
    /// Ready never goes high after wake was asserted.
    ReadyStuckLow,
    /// Ready never goes low once it's high.
    ReadyStuckHigh,
    /// The header transfer fails and the agent doesn't see it.
    HeaderTransmitError,
    /// The payload transfer to the agent fails.
    PayloadTransmitError,
    /// Ready doesn't go high again before the payload or ACK phase.
    PayloadNotReady,
    /// Reading the length fails, although the agent sent it.
    LengthReceiveError,
    /// The agent declares a length of zero.
    ZeroLength,
    /// Reading the payload fails, although the agent sent it.
    PayloadReceiveError,
    /// Reading the ACK fails, while the agent keeps ready high.
    AckReceiveError,
    /// The agent rejects a write.
    Nack,
    /// The agent keeps ready high at the end of the transaction.
    TrailingReadyHigh,
}

/// Something the controller did, that it shouldn't have.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Violation {
    /// Wake was asserted, while it already was.
    OverlappingTransaction,
    /// A transfer was started, while another one was still running.
    OverlappingTransfer,
    TransferWithoutWake,
    TransferWithIrqEnabled,
    /// The agent didn't expect a transfer of this kind or size in its current state.
    UnexpectedTransfer,
    /// The bus was clocked faster, than the agent can handle in this direction.
    ClockTooFast,
}

/// A single interaction with the simulated hardware.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BusEvent {
    WakeAsserted,
    WakeDeasserted,
    IrqEnabled,
    IrqDisabled,
    IrqCleared,
    Transmit { len: usize, clock_hz: u32 },
    Receive { len: usize, clock_hz: u32 },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum AgentState {
    /// Wake isn't asserted.
    Sleeping,
    AwaitHeader,
    /// Waiting for `len` bytes of payload from the controller.
    ControllerPayload { len: usize },
    ControllerAck,
    AgentLength { reread: bool },
    AgentPayload { reread: bool },
    /// Wake is still asserted, but the transaction is over.
    Done,
}

struct AgentModel {
    state: AgentState,
    wake: bool,
    irq_enabled: bool,
    irq_latched: bool,
    edge_pending: bool,
    /// Ready is pulled low, while the agent resets to idle.
    resetting: bool,
    in_transfer: bool,
    clock_hz: u32,

    outbound: VecDeque<Vec<u8>>,
    previous: Option<Vec<u8>>,
    inbound: Vec<Vec<u8>>,

    pending_fault: Option<(Fault, usize)>,
    active_fault: Option<Fault>,

    transactions: usize,
    headers: Vec<FrameHeader>,
    events: Vec<BusEvent>,
    violations: Vec<Violation>,
}
impl AgentModel {
    fn new() -> Self {
        Self {
            state: AgentState::Sleeping,
            wake: false,
            irq_enabled: false,
            irq_latched: false,
            edge_pending: false,
            resetting: false,
            in_transfer: false,
            clock_hz: 0,
            outbound: VecDeque::new(),
            previous: None,
            inbound: Vec::new(),
            pending_fault: None,
            active_fault: None,
            transactions: 0,
            headers: Vec::new(),
            events: Vec::new(),
            violations: Vec::new(),
        }
    }
    fn faulted(&self, fault: Fault) -> bool {
        self.active_fault == Some(fault)
    }
    fn ready(&self) -> bool {
        if self.resetting {
            return false;
        }
        if self.wake && self.faulted(Fault::ReadyStuckLow) {
            return false;
        }
        if self.wake && self.faulted(Fault::ReadyStuckHigh) {
            return true;
        }
        match self.state {
            AgentState::Sleeping => !self.outbound.is_empty(),
            AgentState::AwaitHeader => true,
            AgentState::ControllerPayload { .. } | AgentState::AgentLength { .. } => false,
            AgentState::ControllerAck | AgentState::AgentPayload { .. } => {
                !self.faulted(Fault::PayloadNotReady)
            }
            AgentState::Done => self.faulted(Fault::TrailingReadyHigh),
        }
    }
    fn violation(&mut self, violation: Violation) {
        self.violations.push(violation);
    }
    fn set_wake(&mut self, asserted: bool) {
        if asserted {
            self.events.push(BusEvent::WakeAsserted);
            if self.wake {
                self.violation(Violation::OverlappingTransaction);
            }
            self.wake = true;
            self.transactions += 1;
            self.active_fault = match self.pending_fault {
                Some((fault, remaining)) if remaining > 0 => {
                    self.pending_fault = Some((fault, remaining - 1));
                    Some(fault)
                }
                _ => None,
            };
            self.state = AgentState::AwaitHeader;
        } else {
            self.events.push(BusEvent::WakeDeasserted);
            self.wake = false;
            self.active_fault = None;
            self.state = AgentState::Sleeping;
        }
    }
    fn begin_transfer(&mut self, event: BusEvent) {
        self.events.push(event);
        if self.in_transfer {
            self.violation(Violation::OverlappingTransfer);
        }
        if !self.wake {
            self.violation(Violation::TransferWithoutWake);
        }
        if self.irq_enabled {
            self.violation(Violation::TransferWithIrqEnabled);
        }
        self.in_transfer = true;
    }
    fn controller_transmit(&mut self, data: &[u8]) -> Result<(), TransportError> {
        if self.clock_hz > AGENT_MAX_RECEIVE_HZ {
            self.violation(Violation::ClockTooFast);
        }
        match self.state {
            AgentState::AwaitHeader => {
                if self.faulted(Fault::HeaderTransmitError) {
                    return Err(TransportError::Bus);
                }
                let Ok(bytes) = <&[u8; FRAME_HEADER_SIZE]>::try_from(data) else {
                    self.violation(Violation::UnexpectedTransfer);
                    self.state = AgentState::Done;
                    return Ok(());
                };
                let header = FrameHeader::parse(bytes);
                self.headers.push(header);
                self.state = match header.frame_type {
                    FrameType::Write => {
                        if header.length == 0 {
                            self.violation(Violation::UnexpectedTransfer);
                        }
                        AgentState::ControllerPayload {
                            len: header.length as usize,
                        }
                    }
                    FrameType::Read => AgentState::AgentLength { reread: false },
                    FrameType::Reread => AgentState::AgentLength { reread: true },
                    _ => {
                        self.violation(Violation::UnexpectedTransfer);
                        AgentState::Done
                    }
                };
                Ok(())
            }
            AgentState::ControllerPayload { len } => {
                if self.faulted(Fault::PayloadTransmitError) {
                    self.state = AgentState::Done;
                    return Err(TransportError::Bus);
                }
                if data.len() != len {
                    self.violation(Violation::UnexpectedTransfer);
                }
                if !self.faulted(Fault::Nack) {
                    self.inbound.push(data.to_vec());
                }
                self.state = AgentState::ControllerAck;
                Ok(())
            }
            _ => {
                self.violation(Violation::UnexpectedTransfer);
                Err(TransportError::Bus)
            }
        }
    }
    fn controller_receive(&mut self, buffer: &mut [u8]) -> Result<(), TransportError> {
        if self.clock_hz > AGENT_MAX_TRANSMIT_HZ {
            self.violation(Violation::ClockTooFast);
        }
        match self.state {
            AgentState::ControllerAck => {
                if buffer.len() != 1 {
                    self.violation(Violation::UnexpectedTransfer);
                }
                let response = if self.faulted(Fault::Nack) {
                    FrameType::Nack
                } else {
                    FrameType::Ack
                };
                buffer.fill(response.into_bits());
                if self.faulted(Fault::AckReceiveError) {
                    // The byte never made it out, so the agent keeps offering it.
                    return Err(TransportError::Bus);
                }
                self.state = AgentState::Done;
                Ok(())
            }
            AgentState::AgentLength { reread } => {
                if buffer.len() != FRAME_LENGTH_SIZE {
                    self.violation(Violation::UnexpectedTransfer);
                }
                let packet = if reread {
                    self.previous.as_ref()
                } else {
                    self.outbound.front()
                };
                let len = match packet {
                    Some(packet) if !self.faulted(Fault::ZeroLength) => packet.len() as u16,
                    _ => 0,
                };
                for (dst, src) in buffer.iter_mut().zip(len.to_be_bytes()) {
                    *dst = src;
                }
                self.state = if len == 0 {
                    AgentState::Done
                } else {
                    AgentState::AgentPayload { reread }
                };
                if self.faulted(Fault::LengthReceiveError) {
                    return Err(TransportError::Bus);
                }
                Ok(())
            }
            AgentState::AgentPayload { reread } => {
                let packet = if reread {
                    self.previous.clone()
                } else {
                    self.outbound.pop_front()
                };
                let packet = packet.unwrap_or_default();
                if buffer.len() != packet.len() {
                    self.violation(Violation::UnexpectedTransfer);
                }
                let len = buffer.len().min(packet.len());
                buffer[..len].copy_from_slice(&packet[..len]);
                if !reread {
                    self.previous = Some(packet);
                }
                self.state = AgentState::Done;
                if self.faulted(Fault::PayloadReceiveError) {
                    return Err(TransportError::Bus);
                }
                Ok(())
            }
            _ => {
                self.violation(Violation::UnexpectedTransfer);
                Err(TransportError::Bus)
            }
        }
    }
}

/// A simulated agent.
///
/// Clones share the same agent, so one clone can be passed to the data link as transport, another
/// one as signal lines and a third one kept for inspection.
#[derive(Clone)]
pub struct SimAgent {
    model: Arc<Mutex<AgentModel>>,
}
impl SimAgent {
    pub fn new() -> Self {
        Self {
            model: Arc::new(Mutex::new(AgentModel::new())),
        }
    }
    fn lock(&self) -> MutexGuard<'_, AgentModel> {
        self.model.lock().unwrap_or_else(PoisonError::into_inner)
    }
    /// Run `f` on the model and track the ready line across it.
    fn update<R>(&self, f: impl FnOnce(&mut AgentModel) -> R) -> R {
        let mut model = self.lock();
        let was_ready = model.ready();
        let res = f(&mut *model);
        if !was_ready && model.ready() {
            if model.irq_enabled {
                model.edge_pending = true;
            } else {
                model.irq_latched = true;
            }
        }
        res
    }

    /// Queue a packet for delivery to the controller.
    pub fn queue_packet(&self, data: &[u8]) {
        self.update(|model| model.outbound.push_back(data.to_vec()));
    }
    /// Inject `fault` into the next `transactions` transactions.
    pub fn inject_fault(&self, fault: Fault, transactions: usize) {
        self.lock().pending_fault = Some((fault, transactions));
    }
    /// Consume an edge, that would have raised the ready line interrupt.
    pub fn take_edge(&self) -> bool {
        core::mem::take(&mut self.lock().edge_pending)
    }

    /// Packets written by the controller.
    pub fn received(&self) -> Vec<Vec<u8>> {
        self.lock().inbound.clone()
    }
    /// Packets not yet read by the controller.
    pub fn pending_packets(&self) -> usize {
        self.lock().outbound.len()
    }
    /// Every header received, in order.
    pub fn headers(&self) -> Vec<FrameHeader> {
        self.lock().headers.clone()
    }
    pub fn header_types(&self) -> Vec<FrameType> {
        self.lock()
            .headers
            .iter()
            .map(|header| header.frame_type)
            .collect()
    }
    /// The number of times wake was asserted.
    pub fn transactions(&self) -> usize {
        self.lock().transactions
    }
    pub fn events(&self) -> Vec<BusEvent> {
        self.lock().events.clone()
    }
    pub fn violations(&self) -> Vec<Violation> {
        self.lock().violations.clone()
    }
    pub fn wake_asserted(&self) -> bool {
        self.lock().wake
    }
    pub fn irq_enabled(&self) -> bool {
        self.lock().irq_enabled
    }
}
impl Default for SimAgent {
    fn default() -> Self {
        Self::new()
    }
}
impl ByteTransport for SimAgent {
    async fn transmit(&mut self, data: &[u8]) -> Result<(), TransportError> {
        self.update(|model| {
            let clock_hz = model.clock_hz;
            model.begin_transfer(BusEvent::Transmit {
                len: data.len(),
                clock_hz,
            })
        });
        // Give anyone else a chance to touch the bus mid transfer.
        yield_now().await;
        self.update(|model| {
            model.in_transfer = false;
            model.controller_transmit(data)
        })
    }
    async fn receive(&mut self, buffer: &mut [u8]) -> Result<(), TransportError> {
        self.update(|model| {
            let clock_hz = model.clock_hz;
            model.begin_transfer(BusEvent::Receive {
                len: buffer.len(),
                clock_hz,
            })
        });
        yield_now().await;
        self.update(|model| {
            model.in_transfer = false;
            model.controller_receive(buffer)
        })
    }
    fn set_frequency(&mut self, frequency: u32) -> Result<(), TransportError> {
        if frequency == 0 {
            return Err(TransportError::UnsupportedFrequency);
        }
        self.lock().clock_hz = frequency;
        Ok(())
    }
}
impl SignalLines for SimAgent {
    fn is_ready_high(&mut self) -> bool {
        self.lock().ready()
    }
    fn set_wake(&mut self, asserted: bool) {
        if asserted {
            self.update(|model| model.set_wake(true));
        } else {
            // The agent drops ready while resetting and raises it again, if it has a packet.
            self.update(|model| {
                model.set_wake(false);
                model.resetting = true;
            });
            self.update(|model| model.resetting = false);
        }
    }
    fn enable_ready_irq(&mut self) {
        self.update(|model| {
            model.events.push(BusEvent::IrqEnabled);
            model.irq_enabled = true;
            // An edge latched while masked fires as soon as the interrupt is unmasked.
            if core::mem::take(&mut model.irq_latched) {
                model.edge_pending = true;
            }
        });
    }
    fn disable_ready_irq(&mut self) {
        self.update(|model| {
            model.events.push(BusEvent::IrqDisabled);
            model.irq_enabled = false;
        });
    }
    fn clear_ready_irq(&mut self) {
        self.update(|model| {
            model.events.push(BusEvent::IrqCleared);
            model.irq_latched = false;
        });
    }
}
