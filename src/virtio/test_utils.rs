// Copyright 2019 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Test helpers emulating the host side of a vring: consume published
//! chains in order, write into writeable buffers and report used elements,
//! the way the kernel's vhost worker would.

use std::num::Wrapping;
use std::rc::Rc;
use std::sync::atomic::Ordering;

use vmm_sys_util::eventfd::EventFd;

use crate::virtio::gen::virtio_ring::VRING_DESC_F_NEXT;
use crate::virtio::ring::{Descriptor, Vring, VringConfig, VringStorage};

/// A fresh vring plus handles to the eventfds a real host would hold.
pub(crate) fn test_vring(size: u16, event_index: bool) -> (Rc<Vring>, EventFd, EventFd) {
    let kick = EventFd::new(libc::EFD_NONBLOCK).unwrap();
    let notified = EventFd::new(libc::EFD_NONBLOCK).unwrap();
    let ring = Vring::new(
        VringConfig {
            size,
            event_index,
            indirect: false,
            mergeable_buffers: false,
        },
        VringStorage::new(size),
        notified.try_clone().unwrap(),
        kick.try_clone().unwrap(),
    );
    (Rc::new(ring), kick, notified)
}

/// Number of kicks pending on the eventfd; draining it resets the count.
pub(crate) fn kick_count(kick: &EventFd) -> u64 {
    kick.read().unwrap_or(0)
}

/// Minimal in-order vhost worker over one vring.
pub(crate) struct VhostSim {
    ring: Rc<Vring>,
    next_avail: Wrapping<u16>,
    used_idx: Wrapping<u16>,
}

impl VhostSim {
    pub fn new(ring: Rc<Vring>) -> VhostSim {
        VhostSim {
            ring,
            next_avail: Wrapping(0),
            used_idx: Wrapping(0),
        }
    }

    /// Chains published by the driver and not yet popped here.
    pub fn pending(&self) -> u16 {
        (Wrapping(self.ring.avail_idx().load(Ordering::Acquire)) - self.next_avail).0
    }

    /// Take the next published chain head, consuming in ring order.
    pub fn pop_avail(&mut self) -> u16 {
        assert!(self.pending() > 0, "no chains available");
        let slot = self.next_avail.0 & self.ring.ring_mask();
        let head = self.ring.read_avail_slot(slot);
        self.next_avail += Wrapping(1);
        head
    }

    /// Walk the chain starting at `head` the way the device does.
    pub fn chain(&self, head: u16) -> Vec<Descriptor> {
        let mut descs = Vec::new();
        let mut idx = head;
        loop {
            let desc = self.ring.read_desc(idx);
            let has_next = desc.flags & VRING_DESC_F_NEXT != 0;
            let next = desc.next;
            descs.push(desc);
            if !has_next {
                break;
            }
            idx = next;
        }
        descs
    }

    /// Copy `data` into the buffer a writeable descriptor points at.
    pub fn write_buf(&self, desc: &Descriptor, data: &[u8]) {
        assert!(data.len() <= desc.len as usize);
        // SAFETY: the descriptor points at a buffer the driver posted and
        // keeps alive until the chain completes.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), desc.addr as *mut u8, data.len());
        }
    }

    /// Read back the bytes of a whole (device read-only) chain.
    pub fn read_chain_bytes(&self, head: u16) -> Vec<u8> {
        let mut bytes = Vec::new();
        for desc in self.chain(head) {
            // SAFETY: same lifetime argument as write_buf.
            let slice =
                unsafe { std::slice::from_raw_parts(desc.addr as *const u8, desc.len as usize) };
            bytes.extend_from_slice(slice);
        }
        bytes
    }

    /// Publish a used element for `head` with `len` bytes written.
    pub fn complete(&mut self, head: u16, len: u32) {
        let slot = self.used_idx.0 & self.ring.ring_mask();
        self.ring.write_used_elem(slot, u32::from(head), len);
        self.used_idx += Wrapping(1);
        self.ring
            .used_idx()
            .store(self.used_idx.0, Ordering::Release);
    }
}
