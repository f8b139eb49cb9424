use core::{cell::UnsafeCell, fmt};

use embassy_sync::channel::Channel;

use crate::DefaultRawMutex;

/// Access to the backing storage of a pool.
///
/// SAFETY:
/// An index handed out by [SlotStore::take] is owned by exactly one [PacketBuffer] until it's
/// passed back to [SlotStore::recycle], so the memory behind [SlotStore::slot] is never aliased.
pub(crate) trait SlotStore {
    fn take(&self) -> Option<usize>;
    fn slot(&self, index: usize) -> *mut [u8];
    fn recycle(&self, index: usize);
}

/// Something, that can hand out [PacketBuffer]s.
pub trait BufferAllocator {
    /// Allocate a buffer with `header_room` bytes reserved in front of the data and room for
    /// `payload_room` bytes to be appended.
    ///
    /// Returns [None], if the pool is exhausted or the request doesn't fit a slot.
    fn alloc(&self, header_room: usize, payload_room: usize) -> Option<PacketBuffer<'_>>;
}

/// A fixed size pool of packet buffers.
///
/// The slots are allocated up front and the indices of the free ones are kept in a queue. Taking
/// a buffer pops an index, dropping the [PacketBuffer] pushes it back.
pub struct BufferPool<const BUFFER_SIZE: usize, const BUFFER_COUNT: usize> {
    buffers: [UnsafeCell<[u8; BUFFER_SIZE]>; BUFFER_COUNT],
    free_slots: Channel<DefaultRawMutex, usize, BUFFER_COUNT>,
}
impl<const BUFFER_SIZE: usize, const BUFFER_COUNT: usize> BufferPool<BUFFER_SIZE, BUFFER_COUNT> {
    #[allow(clippy::declare_interior_mutable_const)]
    const EMPTY_SLOT: UnsafeCell<[u8; BUFFER_SIZE]> = UnsafeCell::new([0u8; BUFFER_SIZE]);

    pub fn new() -> Self {
        let temp = Self {
            buffers: [Self::EMPTY_SLOT; BUFFER_COUNT],
            free_slots: Channel::new(),
        };
        for slot in 0..BUFFER_COUNT {
            let _ = temp.free_slots.try_send(slot);
        }
        temp
    }
    /// The number of buffers currently not in use.
    pub fn available(&self) -> usize {
        self.free_slots.len()
    }
    /// The total number of buffers.
    pub const fn capacity(&self) -> usize {
        BUFFER_COUNT
    }
    /// The size of a single buffer, including head room.
    pub const fn buffer_size(&self) -> usize {
        BUFFER_SIZE
    }
}
impl<const BUFFER_SIZE: usize, const BUFFER_COUNT: usize> Default
    for BufferPool<BUFFER_SIZE, BUFFER_COUNT>
{
    fn default() -> Self {
        Self::new()
    }
}
impl<const BUFFER_SIZE: usize, const BUFFER_COUNT: usize> SlotStore
    for BufferPool<BUFFER_SIZE, BUFFER_COUNT>
{
    fn take(&self) -> Option<usize> {
        self.free_slots.try_receive().ok()
    }
    fn slot(&self, index: usize) -> *mut [u8] {
        self.buffers[index].get() as *mut [u8]
    }
    fn recycle(&self, index: usize) {
        // The index was taken from the queue, so there's always space for it.
        let _ = self.free_slots.try_send(index);
        trace!("Buffer slot {} is now free again.", index);
    }
}
impl<const BUFFER_SIZE: usize, const BUFFER_COUNT: usize> BufferAllocator
    for BufferPool<BUFFER_SIZE, BUFFER_COUNT>
{
    fn alloc(&self, header_room: usize, payload_room: usize) -> Option<PacketBuffer<'_>> {
        if header_room.checked_add(payload_room)? > BUFFER_SIZE {
            return None;
        }
        let index = self.take()?;
        Some(PacketBuffer {
            pool: self,
            index,
            head: header_room,
            tail: header_room,
        })
    }
}

/// A buffer borrowed from a [BufferPool].
///
/// The valid data lives between `head` and `tail`. The bytes in front of `head` are the head room,
/// which can be claimed with [PacketBuffer::prepend]. Once dropped, the buffer is returned to the
/// pool.
pub struct PacketBuffer<'res> {
    pool: &'res dyn SlotStore,
    index: usize,
    head: usize,
    tail: usize,
}
impl PacketBuffer<'_> {
    fn storage(&self) -> &[u8] {
        // SAFETY: This buffer owns the slot until it's recycled on drop. See SlotStore.
        unsafe { &*self.pool.slot(self.index) }
    }
    fn storage_mut(&mut self) -> &mut [u8] {
        // SAFETY: This buffer owns the slot until it's recycled on drop and `&mut self` rules out
        // other borrows of it. See SlotStore.
        unsafe { &mut *self.pool.slot(self.index) }
    }
    /// The data currently held by the buffer.
    pub fn data(&self) -> &[u8] {
        &self.storage()[self.head..self.tail]
    }
    pub fn data_mut(&mut self) -> &mut [u8] {
        let (head, tail) = (self.head, self.tail);
        &mut self.storage_mut()[head..tail]
    }
    pub fn len(&self) -> usize {
        self.tail - self.head
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
    /// Bytes available in front of the data.
    pub fn headroom(&self) -> usize {
        self.head
    }
    /// Bytes available after the data.
    pub fn tailroom(&self) -> usize {
        self.storage().len() - self.tail
    }
    /// Extend the data by `len` bytes at the end and return the new region.
    pub fn append(&mut self, len: usize) -> Option<&mut [u8]> {
        if len > self.tailroom() {
            return None;
        }
        let start = self.tail;
        self.tail += len;
        Some(&mut self.storage_mut()[start..start + len])
    }
    /// Copy `data` to the end of the buffer.
    pub fn append_data(&mut self, data: &[u8]) -> Option<()> {
        self.append(data.len())?.copy_from_slice(data);
        Some(())
    }
    /// Extend the data by `len` bytes into the head room and return the new region.
    pub fn prepend(&mut self, len: usize) -> Option<&mut [u8]> {
        if len > self.head {
            return None;
        }
        self.head -= len;
        let head = self.head;
        Some(&mut self.storage_mut()[head..head + len])
    }
}
impl fmt::Debug for PacketBuffer<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketBuffer")
            .field("slot", &self.index)
            .field("headroom", &self.headroom())
            .field("len", &self.len())
            .finish()
    }
}
impl Drop for PacketBuffer<'_> {
    fn drop(&mut self) {
        self.pool.recycle(self.index);
    }
}
