//! Guest transfer queues
//!
//! A [`TransferQueue`] is the fixed-capacity ring of [`Block`]s the virtual
//! controller builds for one endpoint direction. The controller owns it; the
//! engine only mutates block contents, the per-slot request record and the
//! status. Data queues are shared with completions through [`SharedQueue`].

use crate::backend::CancelHandle;
use crate::error::UsbStatus;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Role of a fragment within a logical packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockRole {
    /// Zero-length placeholder (e.g. a link entry)
    None,
    /// Interior fragment of a multi-fragment packet
    Part,
    /// Terminal fragment of a packet
    Full,
}

impl BlockRole {
    pub fn carries_data(self) -> bool {
        matches!(self, Self::Part | Self::Full)
    }
}

/// Processing state; only ever advances
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BlockStatus {
    Free,
    Handling,
    Handled,
}

/// One guest data fragment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    data: Vec<u8>,
    remaining: usize,
    done: usize,
    role: BlockRole,
    status: BlockStatus,
}

impl Block {
    /// A fragment whose remaining length is the whole buffer
    pub fn new(data: Vec<u8>, role: BlockRole) -> Self {
        Self {
            remaining: data.len(),
            data,
            done: 0,
            role,
            status: BlockStatus::Free,
        }
    }

    /// A zeroed receive buffer of `len` bytes
    pub fn receive(len: usize, role: BlockRole) -> Self {
        Self::new(vec![0; len], role)
    }

    pub fn placeholder() -> Self {
        Self::new(Vec::new(), BlockRole::None)
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Bytes moved so far, as a prefix of the buffer
    pub fn transferred(&self) -> &[u8] {
        &self.data[..self.done.min(self.data.len())]
    }

    pub fn remaining(&self) -> usize {
        self.remaining
    }

    pub fn done(&self) -> usize {
        self.done
    }

    pub fn role(&self) -> BlockRole {
        self.role
    }

    pub fn status(&self) -> BlockStatus {
        self.status
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    /// Bytes still to move, as stored in the buffer
    pub(crate) fn payload(&self) -> &[u8] {
        &self.data[..self.remaining.min(self.data.len())]
    }

    pub(crate) fn buffer_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Move to `next` unless that would go backwards
    pub(crate) fn advance(&mut self, next: BlockStatus) {
        if next > self.status {
            self.status = next;
        }
    }

    /// Account for `bytes` moved by a data transfer
    pub(crate) fn record(&mut self, bytes: usize) {
        let bytes = bytes.min(self.remaining);
        self.remaining -= bytes;
        self.done += bytes;
    }

    /// Account for a control data stage of `requested` bytes that moved `moved`
    pub(crate) fn settle(&mut self, requested: usize, moved: usize) {
        self.remaining = requested.saturating_sub(moved);
        self.done += moved;
    }
}

/// Setup stage of a control transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ControlRequest {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl ControlRequest {
    pub fn is_in(&self) -> bool {
        self.request_type & 0x80 != 0
    }
}

/// Record of the native request covering a run that starts at a slot
#[derive(Clone)]
pub struct PendingRequest {
    pub seq: u64,
    pub(crate) cancel: Option<CancelHandle>,
}

impl fmt::Debug for PendingRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingRequest")
            .field("seq", &self.seq)
            .field("cancellable", &self.cancel.is_some())
            .finish()
    }
}

/// Fixed-capacity ring of blocks for one endpoint direction
#[derive(Debug)]
pub struct TransferQueue {
    blocks: Vec<Block>,
    requests: Vec<Option<PendingRequest>>,
    head: usize,
    tail: usize,
    count: usize,
    status: UsbStatus,
    endpoint_id: u8,
    setup: Option<ControlRequest>,
}

/// Queue shared between the submitting thread and completions
pub type SharedQueue = Arc<Mutex<TransferQueue>>;

/// Lock a shared queue, recovering from a poisoned lock
pub fn lock_queue(queue: &SharedQueue) -> MutexGuard<'_, TransferQueue> {
    queue.lock().unwrap_or_else(PoisonError::into_inner)
}

impl TransferQueue {
    /// `endpoint_id` is the controller's own endpoint identifier, passed
    /// back through the lock hooks
    pub fn new(endpoint_id: u8, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            blocks: vec![Block::placeholder(); capacity],
            requests: vec![None; capacity],
            head: 0,
            tail: 0,
            count: 0,
            status: UsbStatus::NormalCompletion,
            endpoint_id,
            setup: None,
        }
    }

    pub fn into_shared(self) -> SharedQueue {
        Arc::new(Mutex::new(self))
    }

    pub fn capacity(&self) -> usize {
        self.blocks.len()
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn head(&self) -> usize {
        self.head
    }

    pub fn tail(&self) -> usize {
        self.tail
    }

    pub fn status(&self) -> UsbStatus {
        self.status
    }

    pub fn set_status(&mut self, status: UsbStatus) {
        self.status = status;
    }

    pub fn endpoint_id(&self) -> u8 {
        self.endpoint_id
    }

    pub fn setup(&self) -> Option<ControlRequest> {
        self.setup
    }

    pub fn set_setup(&mut self, setup: ControlRequest) {
        self.setup = Some(setup);
    }

    /// Append a block at the tail, returning its slot
    pub fn push(&mut self, block: Block) -> Result<usize, Block> {
        if self.count == self.capacity() {
            return Err(block);
        }
        let slot = self.tail;
        self.blocks[slot] = block;
        self.tail = self.next_index(slot);
        self.count += 1;
        Ok(slot)
    }

    /// Retire the head block once it is handled
    pub fn pop_handled(&mut self) -> Option<Block> {
        if self.count == 0 || self.blocks[self.head].status != BlockStatus::Handled {
            return None;
        }
        let slot = self.head;
        let block = std::mem::replace(&mut self.blocks[slot], Block::placeholder());
        self.head = self.next_index(slot);
        self.count -= 1;
        Some(block)
    }

    pub fn block(&self, slot: usize) -> Option<&Block> {
        self.blocks.get(slot)
    }

    pub fn blocks(&self) -> impl Iterator<Item = &Block> + '_ {
        self.live_slots().map(move |slot| &self.blocks[slot])
    }

    /// In-flight request record of the run starting at `slot`
    pub fn pending(&self, slot: usize) -> Option<&PendingRequest> {
        self.requests.get(slot).and_then(Option::as_ref)
    }

    pub fn has_pending(&self) -> bool {
        self.requests.iter().any(Option::is_some)
    }

    pub(crate) fn next_index(&self, slot: usize) -> usize {
        (slot + 1) % self.capacity()
    }

    /// Slots of the live blocks, head first
    pub(crate) fn live_slots(&self) -> impl Iterator<Item = usize> + use<> {
        let capacity = self.capacity();
        let head = self.head;
        (0..self.count).map(move |i| (head + i) % capacity)
    }

    /// Slots of a run of `len` blocks starting at `first`
    pub(crate) fn run_slots(&self, first: usize, len: usize) -> impl Iterator<Item = usize> + use<> {
        let capacity = self.capacity();
        (0..len).map(move |i| (first + i) % capacity)
    }

    pub(crate) fn block_mut(&mut self, slot: usize) -> &mut Block {
        &mut self.blocks[slot]
    }

    pub(crate) fn set_pending(&mut self, slot: usize, pending: Option<PendingRequest>) {
        if let Some(entry) = self.requests.get_mut(slot) {
            *entry = pending;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_status_never_regresses() {
        let mut block = Block::new(vec![1, 2, 3], BlockRole::Full);
        block.advance(BlockStatus::Handling);
        block.advance(BlockStatus::Handled);
        block.advance(BlockStatus::Handling);
        block.advance(BlockStatus::Free);
        assert_eq!(block.status(), BlockStatus::Handled);
    }

    #[test]
    fn test_block_record() {
        let mut block = Block::receive(8, BlockRole::Full);
        block.record(5);
        assert_eq!(block.remaining(), 3);
        assert_eq!(block.done(), 5);
        block.record(10);
        assert_eq!(block.remaining(), 0);
        assert_eq!(block.done(), 8);
    }

    #[test]
    fn test_ring_wraps() {
        let mut queue = TransferQueue::new(3, 2);
        assert_eq!(queue.push(Block::receive(1, BlockRole::Full)), Ok(0));
        assert_eq!(queue.push(Block::receive(1, BlockRole::Full)), Ok(1));
        assert!(queue.push(Block::receive(1, BlockRole::Full)).is_err());

        assert!(queue.pop_handled().is_none());
        queue.block_mut(0).advance(BlockStatus::Handled);
        assert!(queue.pop_handled().is_some());

        assert_eq!(queue.push(Block::receive(1, BlockRole::Full)), Ok(0));
        assert_eq!(queue.live_slots().collect::<Vec<_>>(), vec![1, 0]);
    }
}
