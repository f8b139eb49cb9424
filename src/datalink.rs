use core::ops::{Deref, DerefMut};

use embassy_futures::yield_now;
use embassy_sync::mutex::{Mutex, MutexGuard};
use portable_atomic::{AtomicBool, Ordering};

use crate::{
    buffer::{BufferAllocator, PacketBuffer},
    config::DatalinkConfig,
    frame::{
        is_ack, length_from_bytes, FrameHeader, FrameType, FRAME_HEADER_SIZE, FRAME_LENGTH_SIZE,
        MAX_PAYLOAD_LEN,
    },
    sync::WakeSignal,
    transport::{ByteTransport, SignalLines, TransportError},
    DefaultRawMutex,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DatalinkError {
    /// The agent didn't raise the ready line in time.
    ReadyHighTimeout,
    /// The agent didn't drop the ready line in time.
    ReadyLowTimeout,
    Transport(TransportError),
    /// The agent had nothing to deliver.
    NoData,
    AllocationFailed,
    /// The agent didn't acknowledge a write.
    Nack,
    /// The payload is empty or doesn't fit the length field.
    InvalidLength,
    InvalidConfig,
    /// The data link was deinitialized.
    ShutDown,
}
impl From<TransportError> for DatalinkError {
    fn from(value: TransportError) -> Self {
        Self::Transport(value)
    }
}

pub type DatalinkResult<T> = Result<T, DatalinkError>;

/// Receives the packets delivered by the agent.
///
/// This is called from the RX task and owns the buffer from then on.
///
/// The handler is stored inside the [Datalink], so it can't reach the link itself. A handler that
/// wants to answer a packet has to pass the buffer on to another task, for example through an
/// [embassy_sync::channel::Channel], which then calls [Datalink::tx_buffer]. Calling back into
/// the link from here would also stall the RX task for the duration of the transmission.
pub trait RxHandler<'res> {
    fn on_rx(&self, buffer: PacketBuffer<'res>);
}
impl<'res, F: Fn(PacketBuffer<'res>)> RxHandler<'res> for F {
    fn on_rx(&self, buffer: PacketBuffer<'res>) {
        self(buffer)
    }
}

/// Everything, that may only be touched while holding the bus lock.
struct Bus<T, L> {
    transport: T,
    lines: L,
    fast_clock_hz: u32,
    slow_clock_hz: u32,
}
impl<T: ByteTransport, L: SignalLines> Bus<T, L> {
    async fn transmit(&mut self, data: &[u8]) -> DatalinkResult<()> {
        // The agent receives reliably at our maximum rate.
        self.transport.set_frequency(self.fast_clock_hz)?;
        self.transport.transmit(data).await?;
        Ok(())
    }
    async fn receive(&mut self, buffer: &mut [u8]) -> DatalinkResult<()> {
        // The agent can't transmit at the full rate.
        self.transport.set_frequency(self.slow_clock_hz)?;
        self.transport.receive(buffer).await?;
        Ok(())
    }
}

/// An ongoing transaction.
///
/// This holds the bus lock for its entire lifetime. Dropping it, whether the transaction completed
/// or not, runs the exit path: clear a latched edge, re-enable the ready interrupt and deassert
/// wake, after which the lock is released.
struct Transaction<'a, T: ByteTransport, L: SignalLines> {
    bus: MutexGuard<'a, DefaultRawMutex, Bus<T, L>>,
}
impl<'a, T: ByteTransport, L: SignalLines> Transaction<'a, T, L> {
    async fn begin(bus: &'a Mutex<DefaultRawMutex, Bus<T, L>>) -> Self {
        let mut bus = bus.lock().await;
        bus.lines.disable_ready_irq();
        bus.lines.set_wake(true);
        Self { bus }
    }
    /// Wake the agent and exchange the header.
    async fn send_header(
        &mut self,
        header: FrameHeader,
        config: &DatalinkConfig,
    ) -> DatalinkResult<()> {
        if !self.lines.wait_ready_high(config.handshake_timeout).await {
            return Err(DatalinkError::ReadyHighTimeout);
        }
        self.transmit(&header.to_bytes()).await?;
        // The agent is now processing the header.
        if !self.lines.wait_ready_low(config.ready_timeout).await {
            return Err(DatalinkError::ReadyLowTimeout);
        }
        Ok(())
    }
}
impl<T: ByteTransport, L: SignalLines> Deref for Transaction<'_, T, L> {
    type Target = Bus<T, L>;
    fn deref(&self) -> &Self::Target {
        &self.bus
    }
}
impl<T: ByteTransport, L: SignalLines> DerefMut for Transaction<'_, T, L> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.bus
    }
}
impl<T: ByteTransport, L: SignalLines> Drop for Transaction<'_, T, L> {
    fn drop(&mut self) {
        let lines = &mut self.bus.lines;
        lines.clear_ready_irq();
        lines.enable_ready_irq();
        lines.set_wake(false);
    }
}

/// Controller side of the data link to the agent.
///
/// All transfers are serialized through a single lock, so the link is strictly half duplex. TX is
/// driven by the caller of [Datalink::tx_buffer], RX by [Datalink::run_rx], which has to be
/// spawned as a task and is woken by [Datalink::on_ready_edge].
pub struct Datalink<'res, T, L, H> {
    bus: Mutex<DefaultRawMutex, Bus<T, L>>,
    pool: &'res dyn BufferAllocator,
    rx_handler: H,
    config: DatalinkConfig,
    rx_signal: WakeSignal,
    shutdown: AtomicBool,
    rx_running: AtomicBool,
    rx_finished: AtomicBool,
}
impl<'res, T: ByteTransport, L: SignalLines, H: RxHandler<'res>> Datalink<'res, T, L, H> {
    /// Initialize the data link.
    ///
    /// After this returns, the ready line interrupt is enabled, so [Datalink::run_rx] should be
    /// spawned right away.
    pub fn new(
        transport: T,
        mut lines: L,
        pool: &'res dyn BufferAllocator,
        config: DatalinkConfig,
        rx_handler: H,
    ) -> DatalinkResult<Self> {
        config.validate()?;
        trace!("Initializing data link.");
        lines.set_wake(false);
        lines.clear_ready_irq();
        lines.enable_ready_irq();
        Ok(Self {
            bus: Mutex::new(Bus {
                transport,
                lines,
                fast_clock_hz: config.fast_clock_hz,
                slow_clock_hz: config.slow_clock_hz,
            }),
            pool,
            rx_handler,
            config,
            rx_signal: WakeSignal::new(),
            shutdown: AtomicBool::new(false),
            rx_running: AtomicBool::new(false),
            rx_finished: AtomicBool::new(false),
        })
    }
    /// The configuration in use.
    pub fn config(&self) -> &DatalinkConfig {
        &self.config
    }
    #[cfg(test)]
    pub(crate) fn is_bus_locked(&self) -> bool {
        self.bus.try_lock().is_err()
    }
    /// Notify the RX task, that the agent raised the ready line.
    ///
    /// This is meant to be called from the ready line interrupt handler, after the latched edge was
    /// cleared. It doesn't touch the bus, so it's safe to call from interrupt context.
    pub fn on_ready_edge(&self) {
        self.rx_signal.signal();
    }
    /// Allocate a buffer for [Datalink::tx_buffer].
    ///
    /// In addition to `header_room`, space for the data link header is reserved.
    pub fn alloc_tx_buffer(
        &self,
        header_room: usize,
        payload_room: usize,
    ) -> Option<PacketBuffer<'res>> {
        let pool = self.pool;
        pool.alloc(header_room.checked_add(FRAME_HEADER_SIZE)?, payload_room)
    }
    /// A single read transaction.
    async fn receive_attempt(&self, reread: bool) -> DatalinkResult<PacketBuffer<'res>> {
        let mut transaction = Transaction::begin(&self.bus).await;
        transaction
            .send_header(FrameHeader::read(reread), &self.config)
            .await?;

        let mut length = [0u8; FRAME_LENGTH_SIZE];
        transaction.receive(&mut length).await?;
        let payload_len = length_from_bytes(length) as usize;
        if payload_len == 0 {
            return Err(DatalinkError::NoData);
        }

        let pool = self.pool;
        let mut buffer = pool
            .alloc(0, payload_len)
            .ok_or(DatalinkError::AllocationFailed)?;
        if !transaction
            .lines
            .wait_ready_high(self.config.ready_timeout)
            .await
        {
            return Err(DatalinkError::ReadyHighTimeout);
        }
        let data = buffer
            .append(payload_len)
            .ok_or(DatalinkError::AllocationFailed)?;
        transaction.receive(data).await?;

        // We already have the data, so a missing end of transaction is tolerated.
        let _ = transaction
            .lines
            .wait_ready_low(self.config.ready_timeout)
            .await;
        Ok(buffer)
    }
    /// Read the next packet from the agent.
    ///
    /// If the first attempt fails, the agent is asked to send the same packet again.
    pub(crate) async fn receive_buffer(&self) -> DatalinkResult<PacketBuffer<'res>> {
        let mut res = self.receive_attempt(false).await;
        for attempt in 1..self.config.retry_attempts {
            match res {
                Ok(_) => break,
                Err(err) => debug!("RX attempt {} failed: {:?}. Rereading.", attempt, err),
            }
            res = self.receive_attempt(true).await;
        }
        res
    }
    /// The RX task.
    ///
    /// This waits for [Datalink::on_ready_edge], reads the packet and passes it to the
    /// [RxHandler]. It returns once [Datalink::deinit] was called.
    pub async fn run_rx(&self) {
        if self.rx_running.swap(true, Ordering::AcqRel) {
            warn!("The RX task is already running.");
            return;
        }
        trace!("RX task started.");
        while !self.shutdown.load(Ordering::Acquire) {
            self.rx_signal.wait().await;
            if self.shutdown.load(Ordering::Acquire) {
                break;
            }
            // Notifications coalesce and may outlive the packet, that raised them. A REREAD
            // would then return the last packet a second time.
            let agent_ready = self.bus.lock().await.lines.is_ready_high();
            if !agent_ready {
                trace!("Ready line is low, nothing to read.");
                continue;
            }
            match self.receive_buffer().await {
                Ok(buffer) => {
                    trace!("Received packet. len: {}", buffer.len());
                    self.rx_handler.on_rx(buffer);
                }
                Err(err) => warn!("Failed to read packet from agent: {:?}", err),
            }
        }
        trace!("RX task finished.");
        self.rx_finished.store(true, Ordering::Release);
    }
    /// A single write transaction.
    ///
    /// Returns the payload length, if the agent acknowledged it.
    async fn transmit_attempt(&self, payload: &[u8]) -> DatalinkResult<usize> {
        let header = FrameHeader::new(FrameType::Write, payload.len() as u16);
        let mut transaction = Transaction::begin(&self.bus).await;
        transaction.send_header(header, &self.config).await?;
        transaction.transmit(payload).await?;

        // The agent raises ready, once it consumed the payload.
        if !transaction
            .lines
            .wait_ready_high(self.config.ready_timeout)
            .await
        {
            return Err(DatalinkError::ReadyHighTimeout);
        }
        let mut ack = [FrameType::Nack.into_bits()];
        if let Err(err) = transaction.receive(&mut ack).await {
            debug!("Failed to receive ACK: {:?}", err);
            return Err(DatalinkError::Nack);
        }

        let _ = transaction
            .lines
            .wait_ready_low(self.config.ready_timeout)
            .await;
        if is_ack(ack[0]) {
            Ok(payload.len())
        } else {
            Err(DatalinkError::Nack)
        }
    }
    /// Transmit a buffer to the agent.
    ///
    /// The buffer is consumed in all cases. The write is retried up to
    /// [DatalinkConfig::retry_attempts] times, which is fine, since the upper layers drop
    /// duplicates. Returns the number of bytes sent.
    pub async fn tx_buffer(&self, buffer: PacketBuffer<'res>) -> DatalinkResult<usize> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(DatalinkError::ShutDown);
        }
        let payload = buffer.data();
        if payload.is_empty() || payload.len() > MAX_PAYLOAD_LEN {
            return Err(DatalinkError::InvalidLength);
        }
        let mut res = self.transmit_attempt(payload).await;
        for attempt in 1..self.config.retry_attempts {
            match res {
                Ok(_) => break,
                Err(err) => debug!("TX attempt {} failed: {:?}. Retransmitting.", attempt, err),
            }
            res = self.transmit_attempt(payload).await;
        }
        if let Err(err) = res {
            warn!("Failed to transmit {} bytes: {:?}", payload.len(), err);
        }
        drop(buffer);
        res
    }
    /// Shut the data link down.
    ///
    /// This stops the RX task, waiting for it to finish, and masks the ready line interrupt. All
    /// following transmissions fail with [DatalinkError::ShutDown].
    pub async fn deinit(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        trace!("Deinitializing data link.");
        self.rx_signal.signal();
        if self.rx_running.load(Ordering::Acquire) {
            while !self.rx_finished.load(Ordering::Acquire) {
                yield_now().await;
            }
        }
        let mut bus = self.bus.lock().await;
        bus.lines.disable_ready_irq();
        bus.lines.set_wake(false);
        debug!("Data link shut down.");
    }
}
