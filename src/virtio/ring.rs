// Copyright 2019 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Driver-side split virtqueue engine.
//!
//! A [`Vring`] owns the shared-memory arena holding the descriptor table,
//! the available ring and the used ring of one queue, and runs the driver
//! half of the split-ring protocol: it allocates descriptors out of a free
//! list, publishes scatter-gather chains on the available ring, kicks the
//! host (with flag- or event-index-based suppression) and reclaims chains
//! the host hands back on the used ring. The kernel's vhost thread mutates
//! the same memory concurrently; all cross-party fields are accessed through
//! 16-bit atomics with the ordering the virtio spec requires.
//!
//! Descriptor exhaustion is not an error: producers take permits from the
//! [`Vring::reserve`] semaphore, which backpressures them until reclaim
//! returns descriptors to the pool.

use std::alloc::{alloc_zeroed, dealloc, handle_alloc_error, Layout};
use std::cell::RefCell;
use std::fmt;
use std::num::Wrapping;
use std::ptr;
use std::rc::Rc;
use std::sync::atomic::{fence, AtomicU16, Ordering};

use log::error;
use tokio::io::unix::AsyncFd;
use tokio::sync::Semaphore;
use vmm_sys_util::eventfd::EventFd;

use crate::virtio::gen::virtio_ring::{
    VRING_AVAIL_F_NO_INTERRUPT, VRING_DESC_F_NEXT, VRING_DESC_F_WRITE, VRING_USED_F_NO_NOTIFY,
};

/// One entry of the descriptor table, exactly as the device reads it.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct Descriptor {
    pub addr: u64,
    pub len: u32,
    pub flags: u16,
    pub next: u16,
}

/// One entry of the used ring, exactly as the device writes it.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct UsedElement {
    pub id: u32,
    pub len: u32,
}

/// Backing storage for one split ring, laid out the way vhost expects it:
/// descriptor table at offset 0, available ring right behind it, used ring
/// aligned up to the next 4 KiB boundary. The arena is identity-mapped for
/// the host (guest physical address == userspace virtual address), so the
/// pointers handed out here go into `VHOST_SET_VRING_ADDR` verbatim.
pub struct VringStorage {
    base: *mut u8,
    layout: Layout,
    size: u16,
    used_offset: usize,
}

impl VringStorage {
    pub fn new(size: u16) -> VringStorage {
        let desc_bytes = 16 * usize::from(size);
        let avail_bytes = 6 + 2 * usize::from(size);
        let used_offset = (desc_bytes + avail_bytes + 0xfff) & !0xfff;
        let used_bytes = 6 + 8 * usize::from(size);
        // The arithmetic above cannot overflow isize for a u16 ring size.
        let layout = Layout::from_size_align(used_offset + used_bytes, 4096).unwrap();
        // SAFETY: `layout` has non-zero size.
        let base = unsafe { alloc_zeroed(layout) };
        if base.is_null() {
            handle_alloc_error(layout);
        }
        VringStorage {
            base,
            layout,
            size,
            used_offset,
        }
    }

    pub fn size(&self) -> u16 {
        self.size
    }

    pub fn desc_table(&self) -> *mut u8 {
        self.base
    }

    pub fn avail_ring(&self) -> *mut u8 {
        // SAFETY: offset is within the allocation by construction.
        unsafe { self.base.add(16 * usize::from(self.size)) }
    }

    pub fn used_ring(&self) -> *mut u8 {
        // SAFETY: offset is within the allocation by construction.
        unsafe { self.base.add(self.used_offset) }
    }
}

impl Drop for VringStorage {
    fn drop(&mut self) {
        // SAFETY: `base` was returned by `alloc_zeroed` with this layout.
        unsafe { dealloc(self.base, self.layout) };
    }
}

impl fmt::Debug for VringStorage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("VringStorage")
            .field("size", &self.size)
            .field("base", &self.base)
            .finish()
    }
}

/// Ring geometry and transport features, fixed at construction.
///
/// `indirect` and `mergeable_buffers` are advisory for the queue adapters;
/// the engine itself only acts on `event_index`.
#[derive(Debug, Clone, Copy)]
pub struct VringConfig {
    pub size: u16,
    pub event_index: bool,
    pub indirect: bool,
    pub mergeable_buffers: bool,
}

/// Continuation attached to a chain, invoked exactly once with the byte
/// count from the used element after the host has returned the chain.
pub type Completion = Box<dyn FnOnce(u32)>;

/// One entry of a scatter-gather chain handed to [`Vring::post`].
pub struct Buffer {
    /// Identity-mapped address of the payload.
    pub addr: u64,
    pub len: u32,
    /// Whether the device may write to the buffer (RX) or only read it (TX).
    pub writeable: bool,
    pub completed: Option<Completion>,
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("addr", &self.addr)
            .field("len", &self.len)
            .field("writeable", &self.writeable)
            .field("completed", &self.completed.is_some())
            .finish()
    }
}

struct RingState {
    /// Head of the free list threaded through the descriptors' next fields.
    free_head: u16,
    free_count: u16,
    /// Monotonic position in the available ring; wraps in 16 bits only.
    avail_head: Wrapping<u16>,
    /// Chains published since the last emitted kick.
    added_since_kick: u16,
    /// First used-ring slot not yet reclaimed.
    used_tail: Wrapping<u16>,
    /// Completion slot per descriptor; only chain heads occupy theirs.
    completions: Vec<Option<Completion>>,
}

/// Driver side of one split virtqueue.
pub struct Vring {
    config: VringConfig,
    storage: VringStorage,
    kick: EventFd,
    notified: EventFd,
    state: RefCell<RingState>,
    available: Semaphore,
}

impl fmt::Debug for Vring {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Vring")
            .field("size", &self.config.size)
            .field("event_index", &self.config.event_index)
            .finish_non_exhaustive()
    }
}

impl Vring {
    /// Build a vring over `storage`. `notified` is the call eventfd the host
    /// signals on used-ring updates; `kick` is the eventfd the host polls
    /// for available-ring updates.
    pub fn new(
        config: VringConfig,
        storage: VringStorage,
        notified: EventFd,
        kick: EventFd,
    ) -> Vring {
        assert!(
            config.size >= 2 && config.size.is_power_of_two(),
            "vring size {} is not a power of two",
            config.size
        );
        assert_eq!(storage.size(), config.size);

        let vring = Vring {
            config,
            storage,
            kick,
            notified,
            state: RefCell::new(RingState {
                free_head: 0,
                free_count: 0,
                avail_head: Wrapping(0),
                added_since_kick: 0,
                used_tail: Wrapping(0),
                completions: (0..config.size).map(|_| None).collect(),
            }),
            available: Semaphore::new(0),
        };
        {
            let mut state = vring.state.borrow_mut();
            for idx in 0..config.size {
                vring.free_desc(&mut state, idx);
            }
        }
        vring
    }

    /// Total number of descriptors in the ring.
    pub fn size(&self) -> u16 {
        self.config.size
    }

    /// Descriptors currently free; also the number of permits `reserve` can
    /// hand out without blocking.
    pub fn free_descriptors(&self) -> usize {
        self.available.available_permits()
    }

    /// Wait until `count` descriptors are free and claim them for a
    /// subsequent [`Vring::post`]. Claimed permits return to the pool one
    /// per descriptor as the host hands chains back.
    pub async fn reserve(&self, count: u16) {
        self.available
            .acquire_many(u32::from(count))
            .await
            // The semaphore is never closed.
            .unwrap()
            .forget();
    }

    /// Claim every descriptor that is free right now without waiting.
    /// Returns how many were claimed.
    pub fn try_reserve_all(&self) -> u16 {
        let spare = self.available.available_permits();
        if spare == 0 {
            return 0;
        }
        // Single-threaded: nobody raced us between the read and the acquire.
        let spare = u16::try_from(spare).unwrap();
        match self.available.try_acquire_many(u32::from(spare)) {
            Ok(permits) => {
                permits.forget();
                spare
            }
            Err(_) => 0,
        }
    }

    /// Install `chains` in the descriptor table, publish them on the
    /// available ring, kick the host if it asked for it, and run one
    /// non-blocking reclaim pass.
    ///
    /// The caller must hold one permit per buffer, taken via `reserve` or
    /// `try_reserve_all`; the permits are consumed here.
    pub fn post<I>(&self, chains: I)
    where
        I: IntoIterator<Item = Vec<Buffer>>,
    {
        {
            let mut state = self.state.borrow_mut();
            for chain in chains {
                debug_assert!(!chain.is_empty());
                let mut has_next = false;
                let mut prev_idx = 0u16;
                // Walk the chain backwards so every descriptor can link to
                // the one allocated just before it.
                for mut buf in chain.into_iter().rev() {
                    let idx = self.allocate_desc(&mut state);
                    let mut flags = 0u16;
                    if buf.writeable {
                        flags |= VRING_DESC_F_WRITE;
                    }
                    if has_next {
                        flags |= VRING_DESC_F_NEXT;
                    }
                    // SAFETY: `idx` indexes the descriptor table; the host
                    // does not read it until avail idx is published below.
                    unsafe {
                        ptr::write(
                            self.desc_ptr(idx),
                            Descriptor {
                                addr: buf.addr,
                                len: buf.len,
                                flags,
                                next: prev_idx,
                            },
                        );
                    }
                    state.completions[usize::from(idx)] = buf.completed.take();
                    has_next = true;
                    prev_idx = idx;
                }
                let head = prev_idx;
                self.write_avail_slot(state.avail_head.0 & self.mask(), head);
                state.avail_head += Wrapping(1);
                state.added_since_kick = state.added_since_kick.wrapping_add(1);
            }
            // Publish all new chains at once; the release pairs with the
            // host's acquire on the same index.
            self.avail_idx()
                .store(state.avail_head.0, Ordering::Release);
            self.kick(&mut state);
        }
        self.process_used();
    }

    /// Permanent completion-service loop: reclaim whatever the host already
    /// returned, then sleep until it signals the call eventfd again.
    pub async fn run(self: Rc<Self>) {
        let notified = match self.notified.try_clone().and_then(AsyncFd::new) {
            Ok(notified) => notified,
            Err(err) => {
                error!("failed to register vring call eventfd: {err}");
                return;
            }
        };
        loop {
            self.process_used();
            let mut guard = match notified.readable().await {
                Ok(guard) => guard,
                Err(err) => {
                    error!("vring notification wait failed: {err}");
                    return;
                }
            };
            match guard.try_io(|fd| fd.get_ref().read()) {
                Ok(Ok(_)) => {}
                Ok(Err(err)) => {
                    error!("vring call eventfd read failed: {err}");
                    return;
                }
                // Spurious readiness; poll again.
                Err(_) => {}
            }
        }
    }

    /// Reclaim every chain the host has returned, in the canonical
    /// disable / drain / enable / re-check sequence. A completion the host
    /// publishes between the last drain and the notification re-enable is
    /// picked up by the post-fence re-check instead of being lost until the
    /// next kick.
    pub fn process_used(&self) {
        loop {
            self.disable_interrupts();
            self.drain_used();
            if !self.enable_interrupts() {
                break;
            }
        }
    }

    /// One reclaim pass up to the currently visible used idx.
    fn drain_used(&self) {
        let used_idx = Wrapping(self.used_idx().load(Ordering::Acquire));
        let mut ready: Vec<(Completion, u32)> = Vec::new();
        {
            let mut state = self.state.borrow_mut();
            while state.used_tail != used_idx {
                let elem = self.read_used_elem(state.used_tail.0 & self.mask());
                state.used_tail += Wrapping(1);
                if elem.id >= u32::from(self.config.size) {
                    panic!(
                        "host completed descriptor id {} outside the ring of size {}",
                        elem.id, self.config.size
                    );
                }
                let head = elem.id as u16;
                if let Some(done) = state.completions[usize::from(head)].take() {
                    ready.push((done, elem.len));
                }
                self.free_chain(&mut state, head);
            }
        }
        // Continuations run with the ring state released: an RX continuation
        // pokes its queue, a TX one drops the packet and wakes the sender.
        for (done, len) in ready {
            done(len);
        }
    }

    /// Return every descriptor of the chain starting at `head` to the pool.
    fn free_chain(&self, state: &mut RingState, head: u16) {
        let mut idx = head;
        let mut ttl = self.config.size;
        loop {
            // SAFETY: `idx` is checked against the ring size before use.
            let desc = unsafe { ptr::read(self.desc_ptr(idx)) };
            self.free_desc(state, idx);
            if desc.flags & VRING_DESC_F_NEXT == 0 {
                break;
            }
            if desc.next >= self.config.size {
                panic!(
                    "descriptor chain returned by host links out of the ring: {}",
                    desc.next
                );
            }
            ttl -= 1;
            if ttl == 0 {
                panic!("descriptor chain returned by host contains a cycle");
            }
            idx = desc.next;
        }
    }

    fn allocate_desc(&self, state: &mut RingState) -> u16 {
        // The semaphore hands out at most one permit per descriptor, so a
        // holder always finds the pool non-empty.
        assert!(
            state.free_count > 0,
            "descriptor pool empty with permits outstanding"
        );
        let idx = state.free_head;
        // SAFETY: free-list entries are always valid indices.
        state.free_head = unsafe { (*self.desc_ptr(idx)).next };
        state.free_count -= 1;
        idx
    }

    fn free_desc(&self, state: &mut RingState, idx: u16) {
        // SAFETY: `idx` is within the table; only the next field is written.
        unsafe {
            (*self.desc_ptr(idx)).next = state.free_head;
        }
        state.free_head = idx;
        state.free_count += 1;
        self.available.add_permits(1);
    }

    /// Notify the host about new available entries, unless it asked us not
    /// to. With event-index the host publishes the avail idx it wants to be
    /// woken at; without it, it sets NO_NOTIFY while it is already polling.
    fn kick(&self, state: &mut RingState) {
        // The host must observe the new avail idx before we read its
        // suppression state; its check runs mirrored on the other side.
        fence(Ordering::SeqCst);
        let need_kick = if self.config.event_index {
            let avail_idx = self.avail_idx().load(Ordering::Relaxed);
            let avail_event = self.avail_event().load(Ordering::Relaxed);
            avail_idx.wrapping_sub(avail_event).wrapping_sub(1) < state.added_since_kick
        } else {
            self.used_flags().load(Ordering::Relaxed) & VRING_USED_F_NO_NOTIFY == 0
        };
        // Kick unconditionally once half the index space has accumulated,
        // before the unkicked count becomes ambiguous under wraparound.
        if need_kick || state.added_since_kick >= u16::MAX / 2 {
            if let Err(err) = self.kick.write(1) {
                error!("vring kick failed: {err}");
            }
            state.added_since_kick = 0;
        }
    }

    fn disable_interrupts(&self) {
        if !self.config.event_index {
            self.avail_flags()
                .store(VRING_AVAIL_F_NO_INTERRUPT, Ordering::Relaxed);
        }
        // With event-index the host ignores the flag; the event is simply
        // left behind until enable_interrupts advances it.
    }

    /// Re-arm host notifications. Returns true if the used ring grew in the
    /// meantime and another drain pass is required.
    fn enable_interrupts(&self) -> bool {
        let tail = self.state.borrow().used_tail.0;
        if !self.config.event_index {
            self.avail_flags().store(0, Ordering::Relaxed);
        } else {
            self.used_event().store(tail, Ordering::Relaxed);
        }
        // The host must observe the re-armed notification state before we
        // conclude the ring is empty; otherwise a completion racing the
        // store above would neither interrupt nor be seen here.
        fence(Ordering::SeqCst);
        self.used_idx().load(Ordering::Relaxed) != tail
    }

    fn mask(&self) -> u16 {
        self.config.size - 1
    }

    fn desc_ptr(&self, idx: u16) -> *mut Descriptor {
        debug_assert!(idx < self.config.size);
        // SAFETY: the table spans `size` descriptors inside the arena.
        unsafe {
            self.storage
                .desc_table()
                .cast::<Descriptor>()
                .add(usize::from(idx))
        }
    }

    fn atomic16(&self, ptr: *mut u8) -> &AtomicU16 {
        // SAFETY: every caller passes a two-byte-aligned pointer into the
        // arena owned by `self.storage`; the host accesses the same field
        // atomically from its side.
        unsafe { AtomicU16::from_ptr(ptr.cast()) }
    }

    fn avail_flags(&self) -> &AtomicU16 {
        self.atomic16(self.storage.avail_ring())
    }

    pub(crate) fn avail_idx(&self) -> &AtomicU16 {
        // SAFETY: in bounds of the avail ring.
        self.atomic16(unsafe { self.storage.avail_ring().add(2) })
    }

    fn write_avail_slot(&self, slot: u16, head: u16) {
        debug_assert!(slot < self.config.size);
        // SAFETY: slot is masked; the host does not read it until the idx
        // store publishes it.
        unsafe {
            ptr::write(
                self.storage
                    .avail_ring()
                    .add(4 + 2 * usize::from(slot))
                    .cast::<u16>(),
                head,
            );
        }
    }

    /// Trailing field of the available ring; we publish the used idx we
    /// next want an interrupt at.
    fn used_event(&self) -> &AtomicU16 {
        // SAFETY: the trailing field sits right after the slot array.
        self.atomic16(unsafe {
            self.storage
                .avail_ring()
                .add(4 + 2 * usize::from(self.config.size))
        })
    }

    pub(crate) fn used_flags(&self) -> &AtomicU16 {
        self.atomic16(self.storage.used_ring())
    }

    pub(crate) fn used_idx(&self) -> &AtomicU16 {
        // SAFETY: in bounds of the used ring.
        self.atomic16(unsafe { self.storage.used_ring().add(2) })
    }

    fn read_used_elem(&self, slot: u16) -> UsedElement {
        debug_assert!(slot < self.config.size);
        // SAFETY: slot is masked; the element was published before the used
        // idx we acquire-loaded.
        unsafe {
            ptr::read(
                self.storage
                    .used_ring()
                    .add(4 + 8 * usize::from(slot))
                    .cast::<UsedElement>(),
            )
        }
    }

    /// Trailing field of the used ring; the host publishes the avail idx it
    /// next wants a kick at.
    pub(crate) fn avail_event(&self) -> &AtomicU16 {
        // SAFETY: the trailing field sits right after the element array.
        self.atomic16(unsafe {
            self.storage
                .used_ring()
                .add(4 + 8 * usize::from(self.config.size))
        })
    }

    #[cfg(test)]
    pub(crate) fn read_avail_slot(&self, slot: u16) -> u16 {
        // SAFETY: test-only peek at memory this vring owns.
        unsafe {
            ptr::read(
                self.storage
                    .avail_ring()
                    .add(4 + 2 * usize::from(slot))
                    .cast::<u16>(),
            )
        }
    }

    #[cfg(test)]
    pub(crate) fn read_desc(&self, idx: u16) -> Descriptor {
        // SAFETY: test-only peek at memory this vring owns.
        unsafe { ptr::read(self.desc_ptr(idx)) }
    }

    #[cfg(test)]
    pub(crate) fn write_used_elem(&self, slot: u16, id: u32, len: u32) {
        // SAFETY: test-only host emulation on memory this vring owns.
        unsafe {
            ptr::write(
                self.storage
                    .used_ring()
                    .add(4 + 8 * usize::from(slot))
                    .cast::<UsedElement>(),
                UsedElement { id, len },
            );
        }
    }

    #[cfg(test)]
    pub(crate) fn ring_mask(&self) -> u16 {
        self.mask()
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;
    use crate::virtio::test_utils::{kick_count, test_vring, VhostSim};

    fn chain_of(addrs: &[(u64, u32)], completed: Option<Completion>) -> Vec<Buffer> {
        let mut chain: Vec<Buffer> = addrs
            .iter()
            .map(|&(addr, len)| Buffer {
                addr,
                len,
                writeable: false,
                completed: None,
            })
            .collect();
        chain[0].completed = completed;
        chain
    }

    #[test]
    fn test_fresh_ring_has_all_descriptors_free() {
        let (ring, _kick, _notified) = test_vring(8, false);
        assert_eq!(ring.free_descriptors(), 8);
        assert_eq!(ring.state.borrow().free_count, 8);
    }

    #[tokio::test]
    async fn test_post_links_chain_and_publishes_head() {
        let (ring, _kick, _notified) = test_vring(8, false);
        ring.reserve(3).await;
        ring.post(std::iter::once(chain_of(
            &[(0x1000, 10), (0x2000, 64), (0x3000, 32)],
            None,
        )));

        assert_eq!(ring.avail_idx().load(Ordering::Relaxed), 1);
        assert_eq!(ring.free_descriptors(), 5);

        let mut sim = VhostSim::new(Rc::clone(&ring));
        let head = sim.pop_avail();
        let descs = sim.chain(head);
        assert_eq!(descs.len(), 3);
        assert_eq!(descs[0].addr, 0x1000);
        assert_eq!(descs[0].len, 10);
        assert_ne!(descs[0].flags & VRING_DESC_F_NEXT, 0);
        assert_eq!(descs[1].addr, 0x2000);
        assert_eq!(descs[2].addr, 0x3000);
        // Last descriptor terminates the chain and none are device-writeable.
        assert_eq!(descs[2].flags & VRING_DESC_F_NEXT, 0);
        assert!(descs.iter().all(|d| d.flags & VRING_DESC_F_WRITE == 0));
    }

    #[tokio::test]
    async fn test_completion_fires_and_pool_refills() {
        let (ring, _kick, _notified) = test_vring(8, false);
        let seen = Rc::new(Cell::new(None));

        ring.reserve(2).await;
        let seen_in = Rc::clone(&seen);
        ring.post(std::iter::once(chain_of(
            &[(0x1000, 10), (0x2000, 64)],
            Some(Box::new(move |len| seen_in.set(Some(len)))),
        )));
        assert_eq!(ring.free_descriptors(), 6);

        let mut sim = VhostSim::new(Rc::clone(&ring));
        let head = sim.pop_avail();
        sim.complete(head, 74);
        ring.process_used();

        assert_eq!(seen.get(), Some(74));
        // Both descriptors of the chain returned to the pool.
        assert_eq!(ring.free_descriptors(), 8);
        assert_eq!(ring.state.borrow().free_count, 8);
    }

    #[tokio::test]
    async fn test_out_of_order_completion() {
        let (ring, _kick, _notified) = test_vring(8, false);
        let first = Rc::new(Cell::new(false));
        let second = Rc::new(Cell::new(false));

        ring.reserve(2).await;
        let flag = Rc::clone(&first);
        ring.post(std::iter::once(chain_of(
            &[(0x1000, 16)],
            Some(Box::new(move |_| flag.set(true))),
        )));
        let flag = Rc::clone(&second);
        ring.post(std::iter::once(chain_of(
            &[(0x2000, 16)],
            Some(Box::new(move |_| flag.set(true))),
        )));

        let mut sim = VhostSim::new(Rc::clone(&ring));
        let head_a = sim.pop_avail();
        let head_b = sim.pop_avail();

        // The host consumes the second chain first.
        sim.complete(head_b, 0);
        ring.process_used();
        assert!(!first.get());
        assert!(second.get());

        sim.complete(head_a, 0);
        ring.process_used();
        assert!(first.get());
        assert_eq!(ring.free_descriptors(), 8);
    }

    #[tokio::test]
    async fn test_kick_emitted_without_suppression() {
        let (ring, kick, _notified) = test_vring(8, false);
        ring.reserve(1).await;
        ring.post(std::iter::once(chain_of(&[(0x1000, 16)], None)));
        assert_eq!(kick_count(&kick), 1);
    }

    #[tokio::test]
    async fn test_no_notify_flag_suppresses_kick() {
        let (ring, kick, _notified) = test_vring(8, false);
        ring.used_flags()
            .store(VRING_USED_F_NO_NOTIFY, Ordering::Relaxed);

        ring.reserve(1).await;
        ring.post(std::iter::once(chain_of(&[(0x1000, 16)], None)));
        assert_eq!(kick_count(&kick), 0);

        ring.used_flags().store(0, Ordering::Relaxed);
        ring.reserve(1).await;
        ring.post(std::iter::once(chain_of(&[(0x2000, 16)], None)));
        assert_eq!(kick_count(&kick), 1);
    }

    #[tokio::test]
    async fn test_event_index_kick_suppression() {
        let (ring, kick, _notified) = test_vring(16, true);
        let mut sim = VhostSim::new(Rc::clone(&ring));

        // First chain: avail_event still 0, so avail idx 1 produces a kick.
        ring.reserve(1).await;
        ring.post(std::iter::once(chain_of(&[(0x1000, 16)], None)));
        assert_eq!(kick_count(&kick), 1);

        // Host wants to be woken when avail idx passes 5.
        ring.avail_event().store(5, Ordering::Relaxed);
        for i in 2..=6u64 {
            ring.reserve(1).await;
            ring.post(std::iter::once(chain_of(&[(0x1000 * i, 16)], None)));
            let expected = u64::from(i == 6);
            assert_eq!(kick_count(&kick), expected, "avail idx {i}");
        }

        // Keep the sim honest about what was published.
        assert_eq!(sim.pending(), 6);
        let _ = sim.pop_avail();
    }

    #[tokio::test]
    async fn test_reclaim_recheck_catches_late_completion() {
        let (ring, kick, _notified) = test_vring(8, false);
        ring.reserve(1).await;
        ring.post(std::iter::once(chain_of(&[(0x1000, 16)], None)));
        // Drain the kick emitted by the post itself.
        assert_eq!(kick_count(&kick), 1);

        let mut sim = VhostSim::new(Rc::clone(&ring));
        let head = sim.pop_avail();

        // Empty drain with interrupts disabled, then the host completes the
        // chain right before notifications get re-armed.
        ring.disable_interrupts();
        ring.drain_used();
        sim.complete(head, 0);

        // The post-fence re-check must see the new element.
        assert!(ring.enable_interrupts());
        ring.drain_used();
        assert!(!ring.enable_interrupts());

        assert_eq!(ring.free_descriptors(), 8);
        // Reclaim never kicks on its own.
        assert_eq!(kick_count(&kick), 0);
    }

    #[tokio::test]
    #[should_panic(expected = "outside the ring")]
    async fn test_used_id_out_of_bounds_is_fatal() {
        let (ring, _kick, _notified) = test_vring(8, false);
        ring.reserve(1).await;
        ring.post(std::iter::once(chain_of(&[(0x1000, 16)], None)));

        ring.write_used_elem(0, 1000, 0);
        ring.used_idx().store(1, Ordering::Release);
        ring.process_used();
    }

    #[tokio::test]
    #[should_panic(expected = "cycle")]
    async fn test_chain_cycle_is_fatal() {
        let (ring, _kick, _notified) = test_vring(8, false);
        ring.reserve(2).await;
        ring.post(std::iter::once(chain_of(
            &[(0x1000, 16), (0x2000, 16)],
            None,
        )));

        let mut sim = VhostSim::new(Rc::clone(&ring));
        let head = sim.pop_avail();
        // Corrupt the chain so its head links back to itself forever.
        // SAFETY: test-only corruption of memory the ring owns.
        unsafe {
            let d = ring.desc_ptr(head);
            (*d).flags |= VRING_DESC_F_NEXT;
            (*d).next = head;
        }
        sim.complete(head, 0);
        ring.process_used();
    }
}
