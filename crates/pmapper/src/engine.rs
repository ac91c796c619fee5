//! Transfer engine
//!
//! Bridges a [`TransferQueue`] to asynchronous native transfers for bulk,
//! interrupt and isochronous endpoints.
//!
//! Submission walks the queue from its head, claims every free fragment
//! (marking it Handling) and gathers the claimed run into one [`Request`]
//! with a flat scratch buffer. The native layer later hands the request to
//! [`complete`], which scatters received data back into the run, updates
//! the queue status and asks the controller whether to interrupt the guest.
//!
//! A [`Request`] owns its scratch buffer and native transfer. Both are
//! released when the request is dropped, which happens at the end of every
//! completion path, cancellation included.

use crate::backend::SubmitRejected;
use crate::device::VirtualDevice;
use crate::error::{PortMapperError, UsbStatus};
use crate::hooks::PortMapperHooks;
use crate::queue::{
    BlockRole, BlockStatus, PendingRequest, SharedQueue, TransferQueue, lock_queue,
};
use crate::types::{DevicePath, Direction, EndpointType};
use async_channel::{Receiver, Sender, unbounded};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, error, trace, warn};

/// How a native transfer ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOutcome {
    Completed,
    Stall,
    /// Transport error while the device is still present
    Error,
    /// Device gone, including transport errors caused by its removal
    NoDevice,
    Cancelled,
    TimedOut,
    Overflow,
    /// The native layer refused the submission
    SubmitFailed,
}

/// Result of one isochronous packet descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IsoPacket {
    /// Declared length
    pub length: usize,
    pub actual_length: usize,
}

/// What the native layer observed when a transfer finished
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub outcome: TransferOutcome,
    pub actual_length: usize,
    pub iso_packets: Vec<IsoPacket>,
}

impl Completion {
    pub fn completed(actual_length: usize) -> Self {
        Self {
            outcome: TransferOutcome::Completed,
            actual_length,
            iso_packets: Vec::new(),
        }
    }

    pub fn isochronous(iso_packets: Vec<IsoPacket>) -> Self {
        Self {
            outcome: TransferOutcome::Completed,
            actual_length: iso_packets.iter().map(|p| p.actual_length).sum(),
            iso_packets,
        }
    }

    pub fn failed(outcome: TransferOutcome) -> Self {
        Self {
            outcome,
            actual_length: 0,
            iso_packets: Vec::new(),
        }
    }
}

/// Native resource tied to a request's lifetime
pub type NativeResource = Box<dyn Send>;

/// One in-flight native transfer covering a run of blocks
pub struct Request {
    native: Option<NativeResource>,
    buffer: Vec<u8>,
    iso_lengths: Vec<u32>,
    seq: u64,
    direction: Direction,
    kind: EndpointType,
    endpoint_address: u8,
    endpoint_id: u8,
    first: usize,
    len: usize,
    queue: SharedQueue,
    device: DevicePath,
    port: CompletionPort,
}

impl Request {
    /// Diagnostic sequence number
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn kind(&self) -> EndpointType {
        self.kind
    }

    pub fn endpoint_address(&self) -> u8 {
        self.endpoint_address
    }

    pub fn device(&self) -> &DevicePath {
        &self.device
    }

    /// Queue slot of the first block in the run
    pub fn first_slot(&self) -> usize {
        self.first
    }

    /// Number of queue slots in the run
    pub fn block_count(&self) -> usize {
        self.len
    }

    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    /// Scratch buffer handed to the native transfer
    pub fn buffer_mut(&mut self) -> &mut [u8] {
        &mut self.buffer
    }

    /// Declared length of each isochronous packet descriptor
    pub fn iso_packet_lengths(&self) -> &[u32] {
        &self.iso_lengths
    }

    /// Tie a native resource to this request; it is released before the
    /// scratch buffer
    pub fn attach_native(&mut self, resource: NativeResource) {
        self.native = Some(resource);
    }
}

impl Drop for Request {
    fn drop(&mut self) {
        self.native.take();
        trace!("{}: request {} released", self.device, self.seq);
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("seq", &self.seq)
            .field("device", &self.device)
            .field("endpoint", &format_args!("{:#04x}", self.endpoint_address))
            .field("kind", &self.kind)
            .field("first", &self.first)
            .field("len", &self.len)
            .field("bytes", &self.buffer.len())
            .finish()
    }
}

type Deferred = (Request, Completion);

/// Route from submission back to the completion path
///
/// Carries the controller hooks, the request sequence counter and the
/// channel through which rejected submissions reach the runtime thread.
#[derive(Clone)]
pub struct CompletionPort {
    hooks: Arc<dyn PortMapperHooks>,
    deferred: Sender<Deferred>,
    waker: Option<Arc<dyn Fn() + Send + Sync>>,
    seq: Arc<AtomicU64>,
}

impl CompletionPort {
    pub fn hooks(&self) -> &Arc<dyn PortMapperHooks> {
        &self.hooks
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Queue a completion for the runtime thread
    fn defer(&self, request: Request, completion: Completion) {
        if let Err(e) = self.deferred.try_send((request, completion)) {
            // Dropping the returned request releases its resources
            warn!("Runtime stopped, discarding deferred completion: {}", e);
            return;
        }
        if let Some(wake) = &self.waker {
            wake();
        }
    }
}

/// Receiving end of deferred completions, drained by the runtime thread
pub struct DeferredCompletions {
    rx: Receiver<Deferred>,
}

impl DeferredCompletions {
    /// Run every queued completion, returning how many ran
    pub fn drain(&self) -> usize {
        let mut ran = 0;
        while let Ok((request, completion)) = self.rx.try_recv() {
            complete(request, completion);
            ran += 1;
        }
        ran
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

/// Create the completion port shared by devices and its drain
///
/// `waker` is invoked after a completion is deferred so a blocked event
/// loop can pick it up promptly.
pub fn completion_channel(
    hooks: Arc<dyn PortMapperHooks>,
    waker: Option<Arc<dyn Fn() + Send + Sync>>,
) -> (CompletionPort, DeferredCompletions) {
    let (tx, rx) = unbounded();
    (
        CompletionPort {
            hooks,
            deferred: tx,
            waker,
            seq: Arc::new(AtomicU64::new(0)),
        },
        DeferredCompletions { rx },
    )
}

/// Contiguous run of blocks claimed for one request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Batch {
    pub first: usize,
    pub len: usize,
    pub total: usize,
}

/// Claim every free block from the head onward
///
/// Data fragments become Handling and count towards the total;
/// placeholders are Handled at once. Blocks already owned by an earlier
/// request are skipped.
pub(crate) fn prepare(queue: &mut TransferQueue) -> Option<Batch> {
    let mut first = None;
    let mut total = 0;

    for (step, slot) in queue.live_slots().enumerate() {
        let block = queue.block_mut(slot);
        if block.status() != BlockStatus::Free {
            continue;
        }
        if first.is_none() {
            first = Some((slot, step));
        }
        match block.role() {
            BlockRole::Part | BlockRole::Full => {
                total += block.remaining();
                block.advance(BlockStatus::Handling);
            }
            BlockRole::None => block.advance(BlockStatus::Handled),
        }
    }

    let (first, step) = first?;
    Some(Batch {
        first,
        len: queue.len() - step,
        total,
    })
}

/// Declared packet lengths of an isochronous run
///
/// Part fragments accumulate into the current packet; a Full fragment
/// closes it.
pub(crate) fn iso_frame_lengths(queue: &TransferQueue, batch: &Batch, frame_len: usize) -> Vec<u32> {
    let mut frames = Vec::new();
    let mut current = 0usize;

    for slot in queue.run_slots(batch.first, batch.len) {
        let Some(block) = queue.block(slot) else {
            continue;
        };
        if block.remaining() > frame_len {
            error!(
                "Isochronous fragment of {} bytes exceeds frame length {}",
                block.remaining(),
                frame_len
            );
        }
        match block.role() {
            BlockRole::None => {}
            BlockRole::Part => current += block.remaining(),
            BlockRole::Full => {
                current += block.remaining();
                frames.push(current as u32);
                current = 0;
            }
        }
    }

    if current > 0 {
        warn!("Isochronous run ends inside a packet ({} bytes)", current);
    }
    frames
}

/// Mark every block of a run Handled without moving data
fn drain_run(queue: &mut TransferQueue, first: usize, len: usize) {
    for slot in queue.run_slots(first, len) {
        queue.block_mut(slot).advance(BlockStatus::Handled);
    }
}

/// Scatter a successful completion back into its run
fn deliver(queue: &mut TransferQueue, request: &Request, completion: &Completion) {
    let isochronous = request.kind == EndpointType::Isochronous;
    let mut packets = completion.iso_packets.iter();
    let mut next_packet_offset = 0usize;
    let mut in_packet = false;
    let mut cursor = 0usize;
    let mut budget = completion.actual_length;

    for slot in queue.run_slots(request.first, request.len) {
        let block = queue.block_mut(slot);

        if block.status() == BlockStatus::Free && block.role() != BlockRole::None {
            error!(
                "{}: free block in completed run at slot {}",
                request.device, slot
            );
        }

        if block.role() == BlockRole::None {
            block.advance(BlockStatus::Handled);
            continue;
        }

        if isochronous && !in_packet {
            let packet = packets.next().copied().unwrap_or_default();
            cursor = next_packet_offset;
            budget = packet.actual_length;
            next_packet_offset += packet.length;
            in_packet = true;
        }

        let moved = budget.min(block.remaining());
        if request.direction == Direction::In && moved > 0 {
            let offset = block.done();
            let src = request.buffer.get(cursor..cursor + moved);
            let dst = block.buffer_mut().get_mut(offset..offset + moved);
            match (src, dst) {
                (Some(src), Some(dst)) => dst.copy_from_slice(src),
                _ => error!(
                    "{}: completion overruns request {} buffer",
                    request.device, request.seq
                ),
            }
        }
        cursor += moved;
        budget -= moved;
        block.record(moved);
        block.advance(BlockStatus::Handled);

        if block.role() == BlockRole::Full {
            in_packet = false;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    /// Move data into the run
    Deliver,
    /// Mark the run Handled with no data
    Drain,
    /// Leave the run as is
    Keep,
    /// Leave the run as is and skip every controller hook
    Suppress,
}

fn disposition(outcome: TransferOutcome) -> (Disposition, UsbStatus) {
    match outcome {
        // Residue is per block; the controller judges short packets
        TransferOutcome::Completed => (Disposition::Deliver, UsbStatus::NormalCompletion),
        TransferOutcome::Stall | TransferOutcome::Error => (Disposition::Drain, UsbStatus::Stalled),
        TransferOutcome::SubmitFailed => (Disposition::Drain, UsbStatus::IoError),
        TransferOutcome::TimedOut => (Disposition::Keep, UsbStatus::Timeout),
        TransferOutcome::Overflow => (Disposition::Keep, UsbStatus::BadBufferSize),
        TransferOutcome::Cancelled | TransferOutcome::NoDevice => {
            (Disposition::Suppress, UsbStatus::IoError)
        }
    }
}

/// Finish a request
///
/// Called exactly once per request, on the runtime thread. Consumes the
/// request, so its buffer and native transfer are released on return.
pub fn complete(request: Request, completion: Completion) {
    let (disposition, status) = disposition(completion.outcome);
    debug!(
        "{}: complete rq-{} ep {:#04x} [{}+{}] {:?} actual {} -> {}",
        request.device,
        request.seq,
        request.endpoint_address,
        request.first,
        request.len,
        completion.outcome,
        completion.actual_length,
        status
    );

    if disposition == Disposition::Suppress {
        // Reconciled by the disconnect path
        let mut queue = lock_queue(&request.queue);
        queue.set_status(status);
        queue.set_pending(request.first, None);
        return;
    }

    let hooks = Arc::clone(&request.port.hooks);
    hooks.lock_endpoint(&request.device, request.endpoint_id);
    {
        let mut queue = lock_queue(&request.queue);
        queue.set_status(status);
        match disposition {
            Disposition::Deliver => deliver(&mut queue, &request, &completion),
            Disposition::Drain => drain_run(&mut queue, request.first, request.len),
            Disposition::Keep | Disposition::Suppress => {}
        }
        queue.set_pending(request.first, None);
    }
    hooks.unlock_endpoint(&request.device, request.endpoint_id);

    // notify runs with the queue unlocked
    if hooks.notify(&request.device, &request.queue) {
        hooks.interrupt(&request.device);
    }
}

/// Cancel the native request whose run starts at `slot`
///
/// The completion arrives later as [`TransferOutcome::Cancelled`].
pub fn cancel_request(queue: &SharedQueue, slot: usize) -> Result<(), PortMapperError> {
    // Held across the cancel so the completion cannot release the transfer
    let queue = lock_queue(queue);
    let pending = queue
        .pending(slot)
        .ok_or(PortMapperError::Usb(rusb::Error::NotFound))?;
    match &pending.cancel {
        Some(cancel) => cancel().map_err(PortMapperError::from),
        None => Ok(()),
    }
}

impl VirtualDevice {
    /// Submit the free blocks of a data queue as one native transfer
    ///
    /// Returns the queue status after submission. Completion is reported
    /// later through the hooks.
    pub fn submit_data(
        &mut self,
        queue: &SharedQueue,
        direction: Direction,
        endpoint: u8,
    ) -> UsbStatus {
        let mut guard = lock_queue(queue);
        guard.set_status(UsbStatus::NormalCompletion);

        let Some(batch) = prepare(&mut guard) else {
            return guard.status();
        };
        if batch.total == 0 {
            drain_run(&mut guard, batch.first, batch.len);
            return guard.status();
        }

        let endpoint_info = self
            .endpoints
            .get(direction, endpoint)
            .copied()
            .unwrap_or_default();
        let kind = endpoint_info.kind;
        if !matches!(
            kind,
            EndpointType::Bulk | EndpointType::Interrupt | EndpointType::Isochronous
        ) {
            error!(
                "{}: wrong endpoint type {:?} for ep{} {:?}",
                self.info.path, kind, endpoint, direction
            );
            drain_run(&mut guard, batch.first, batch.len);
            guard.set_status(UsbStatus::InvalidArgument);
            return guard.status();
        }

        let iso_lengths = if kind == EndpointType::Isochronous {
            let frame_len = endpoint_info.frame_len();
            let frames = iso_frame_lengths(&guard, &batch, frame_len);
            debug!(
                "iso maxp {:#x} framelen {} framecnt {}",
                endpoint_info.max_packet,
                frame_len,
                frames.len()
            );
            frames
        } else {
            Vec::new()
        };

        let mut buffer = Vec::new();
        if buffer.try_reserve_exact(batch.total).is_err() {
            error!(
                "{}: cannot allocate {} byte request buffer",
                self.info.path, batch.total
            );
            drain_run(&mut guard, batch.first, batch.len);
            guard.set_status(UsbStatus::IoError);
            return guard.status();
        }
        match direction {
            Direction::Out => {
                for slot in guard.run_slots(batch.first, batch.len) {
                    if let Some(block) = guard.block(slot)
                        && block.role().carries_data()
                        && block.status() == BlockStatus::Handling
                    {
                        buffer.extend_from_slice(block.payload());
                    }
                }
            }
            Direction::In => buffer.resize(batch.total, 0),
        }

        let request = Request {
            native: None,
            buffer,
            iso_lengths,
            seq: self.port.next_seq(),
            direction,
            kind,
            endpoint_address: direction.endpoint_address(endpoint),
            endpoint_id: guard.endpoint_id(),
            first: batch.first,
            len: batch.len,
            queue: Arc::clone(queue),
            device: self.info.path.clone(),
            port: self.port.clone(),
        };
        let seq = request.seq;
        debug!(
            "{}: submit rq-{} ep{} {:?} {:?} [{}+{}] {} bytes",
            self.info.path, seq, endpoint, direction, kind, batch.first, batch.len, batch.total
        );

        // The queue stays locked until the slot records the request, so a
        // racing completion cannot clear it first
        match self.native.submit(request) {
            Ok(cancel) => {
                guard.set_pending(
                    batch.first,
                    Some(PendingRequest {
                        seq,
                        cancel: Some(cancel),
                    }),
                );
            }
            Err(SubmitRejected { error, request }) => {
                warn!("{}: submit of rq-{} failed: {}", self.info.path, seq, error);
                guard.set_status(UsbStatus::IoError);
                guard.set_pending(batch.first, Some(PendingRequest { seq, cancel: None }));
                self.port
                    .defer(request, Completion::failed(TransferOutcome::SubmitFailed));
            }
        }
        guard.status()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::Block;

    fn queue_with(blocks: Vec<Block>) -> TransferQueue {
        let mut queue = TransferQueue::new(2, 8);
        for block in blocks {
            queue.push(block).unwrap();
        }
        queue
    }

    #[test]
    fn test_prepare_sums_data_fragments() {
        let mut queue = queue_with(vec![
            Block::new(vec![1; 10], BlockRole::Part),
            Block::placeholder(),
            Block::new(vec![2; 6], BlockRole::Full),
        ]);

        let batch = prepare(&mut queue).unwrap();
        assert_eq!(batch, Batch { first: 0, len: 3, total: 16 });

        let statuses: Vec<_> = queue.blocks().map(|b| b.status()).collect();
        assert_eq!(
            statuses,
            vec![BlockStatus::Handling, BlockStatus::Handled, BlockStatus::Handling]
        );
    }

    #[test]
    fn test_prepare_skips_owned_blocks() {
        let mut queue = queue_with(vec![
            Block::new(vec![1; 4], BlockRole::Full),
            Block::new(vec![2; 4], BlockRole::Full),
        ]);
        prepare(&mut queue).unwrap();

        queue.push(Block::new(vec![3; 5], BlockRole::Full)).unwrap();
        let batch = prepare(&mut queue).unwrap();
        assert_eq!(batch, Batch { first: 2, len: 1, total: 5 });
    }

    #[test]
    fn test_prepare_nothing_free() {
        let mut queue = queue_with(vec![Block::new(vec![1; 4], BlockRole::Full)]);
        prepare(&mut queue).unwrap();
        assert!(prepare(&mut queue).is_none());
        assert!(prepare(&mut TransferQueue::new(1, 4)).is_none());
    }

    #[test]
    fn test_iso_frames_close_on_full() {
        let mut queue = queue_with(vec![
            Block::new(vec![0; 100], BlockRole::Part),
            Block::new(vec![0; 92], BlockRole::Full),
            Block::placeholder(),
            Block::new(vec![0; 192], BlockRole::Full),
            Block::new(vec![0; 10], BlockRole::Full),
        ]);
        let batch = prepare(&mut queue).unwrap();
        let frames = iso_frame_lengths(&queue, &batch, 192);
        assert_eq!(frames, vec![192, 192, 10]);
    }
}
