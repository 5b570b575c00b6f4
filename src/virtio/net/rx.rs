// Copyright 2020 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Receive half of the device: keep the ring stocked with writeable
//! buffers, reassemble frames the host spread over several of them
//! (mergeable rx buffers), and emit packets downstream in arrival order.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::mem;
use std::rc::Rc;

use tokio::sync::mpsc;
use tokio::sync::Notify;

use crate::virtio::gen::virtio_net::virtio_net_hdr;
use crate::virtio::net::packet::{Fragment, Packet};
use crate::virtio::ring::{Buffer, Vring};

/// Every posted receive buffer is one page; a frame larger than this spans
/// multiple buffers via the mergeable-rxbuf protocol.
pub(crate) const RX_BUFFER_SIZE: usize = 4096;

/// Receive queue over one vring. Runs autonomously once started.
#[derive(Debug)]
pub struct RxQueue {
    inner: Rc<RxInner>,
}

struct RxInner {
    ring: Rc<Vring>,
    header_len: usize,
    mergeable: bool,
    reassembly: RefCell<Reassembly>,
    outbound: RefCell<VecDeque<Packet>>,
    packet_ready: Notify,
}

impl std::fmt::Debug for RxInner {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("RxInner")
            .field("header_len", &self.header_len)
            .field("mergeable", &self.mergeable)
            .finish_non_exhaustive()
    }
}

/// In-progress multi-buffer frame: how many buffers the host still owes us
/// and the payload windows collected so far.
#[derive(Default)]
struct Reassembly {
    remaining_buffers: u16,
    fragments: Vec<Fragment>,
}

impl RxQueue {
    pub(crate) fn new(ring: Rc<Vring>, header_len: usize, mergeable: bool) -> RxQueue {
        RxQueue {
            inner: Rc::new(RxInner {
                ring,
                header_len,
                mergeable,
                reassembly: RefCell::new(Reassembly::default()),
                outbound: RefCell::new(VecDeque::new()),
                packet_ready: Notify::new(),
            }),
        }
    }

    /// Spawn the refill and delivery tasks plus the ring's completion
    /// service loop; must run within a `LocalSet`. The returned stream
    /// yields packets strictly in arrival order and backpressures the
    /// delivery task when the consumer lags.
    pub(crate) fn start(&self) -> mpsc::Receiver<Packet> {
        let (frames, stream) = mpsc::channel(1);
        tokio::task::spawn_local(Rc::clone(&self.inner.ring).run());
        tokio::task::spawn_local(RxInner::refill(Rc::clone(&self.inner)));
        tokio::task::spawn_local(RxInner::deliver(Rc::clone(&self.inner), frames));
        stream
    }
}

impl RxInner {
    /// Keep the ring full of fresh buffers. Blocks for one free descriptor,
    /// then opportunistically grabs every other free one so a single post
    /// re-stocks as much of the ring as possible.
    async fn refill(self: Rc<Self>) {
        loop {
            self.ring.reserve(1).await;
            let count = 1 + usize::from(self.ring.try_reserve_all());
            self.ring.post((0..count).map(|_| Self::buffer_chain(&self)));
        }
    }

    /// One writeable single-descriptor chain over a fresh page. The
    /// completion owns the page until the host has filled it.
    fn buffer_chain(inner: &Rc<RxInner>) -> Vec<Buffer> {
        let buf = vec![0u8; RX_BUFFER_SIZE].into_boxed_slice();
        let addr = buf.as_ptr() as u64;
        let inner = Rc::clone(inner);
        vec![Buffer {
            addr,
            len: RX_BUFFER_SIZE as u32,
            writeable: true,
            completed: Some(Box::new(move |len| inner.buffer_done(buf, len))),
        }]
    }

    /// Fold one completed buffer into the frame under reassembly; on the
    /// final buffer, queue the packet for in-order delivery.
    ///
    /// The used ring reports buffers in the order the host consumed them,
    /// which is the only thing tying the buffers of one frame together.
    fn buffer_done(&self, buf: Box<[u8]>, len: u32) {
        let mut off = 0;
        let mut frag_len = len as usize;

        let mut reassembly = self.reassembly.borrow_mut();
        if reassembly.remaining_buffers == 0 {
            // First buffer of a frame: it leads with the virtio-net header.
            if frag_len < self.header_len {
                panic!("host returned an rx buffer shorter than the virtio-net header: {frag_len} bytes");
            }
            let num_buffers = if self.mergeable {
                let at = mem::size_of::<virtio_net_hdr>();
                u16::from_le_bytes([buf[at], buf[at + 1]])
            } else {
                1
            };
            if num_buffers == 0 {
                panic!("host announced a frame spanning zero rx buffers");
            }
            reassembly.remaining_buffers = num_buffers;
            off = self.header_len;
            frag_len -= self.header_len;
        }

        reassembly.fragments.push(Fragment::with_window(buf, off, frag_len));
        reassembly.remaining_buffers -= 1;

        if reassembly.remaining_buffers == 0 {
            let packet = Packet::from_fragments(mem::take(&mut reassembly.fragments));
            drop(reassembly);
            self.outbound.borrow_mut().push_back(packet);
            self.packet_ready.notify_one();
        }
    }

    /// Forward assembled packets downstream, strictly in completion order.
    /// A dropped receiver (or a downstream failure surfaced as one) halts
    /// delivery for good.
    async fn deliver(self: Rc<Self>, frames: mpsc::Sender<Packet>) {
        loop {
            let packet = loop {
                if let Some(packet) = self.outbound.borrow_mut().pop_front() {
                    break packet;
                }
                self.packet_ready.notified().await;
            };
            if frames.send(packet).await.is_err() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::virtio::gen::virtio_net::virtio_net_hdr_mrg_rxbuf;
    use crate::virtio::test_utils::{test_vring, VhostSim};

    const MRG_HDR_LEN: usize = mem::size_of::<virtio_net_hdr_mrg_rxbuf>();
    const HDR_LEN: usize = mem::size_of::<virtio_net_hdr>();

    /// Post `count` receive buffers the way the refill task would.
    async fn stock(rxq: &RxQueue, count: u16) {
        let inner = &rxq.inner;
        inner.ring.reserve(count).await;
        inner
            .ring
            .post((0..count).map(|_| RxInner::buffer_chain(inner)));
    }

    fn mrg_header(num_buffers: u16) -> [u8; MRG_HDR_LEN] {
        let mut hdr = [0u8; MRG_HDR_LEN];
        hdr[HDR_LEN..].copy_from_slice(&num_buffers.to_le_bytes());
        hdr
    }

    #[tokio::test]
    async fn test_mergeable_reassembly_spans_three_buffers() {
        let (ring, _kick, _notified) = test_vring(8, false);
        let rxq = RxQueue::new(Rc::clone(&ring), MRG_HDR_LEN, true);
        stock(&rxq, 3).await;

        let mut sim = VhostSim::new(Rc::clone(&ring));
        let heads: Vec<u16> = (0..3).map(|_| sim.pop_avail()).collect();

        // First buffer: header announcing 3 buffers, then payload 0x11.
        let descs: Vec<_> = heads.iter().map(|&h| sim.chain(h)[0]).collect();
        let mut first = vec![0x11u8; 4096];
        first[..MRG_HDR_LEN].copy_from_slice(&mrg_header(3));
        sim.write_buf(&descs[0], &first);
        sim.write_buf(&descs[1], &vec![0x22u8; 4096]);
        sim.write_buf(&descs[2], &vec![0x33u8; 200]);

        sim.complete(heads[0], 4096);
        sim.complete(heads[1], 4096);
        sim.complete(heads[2], 200);
        ring.process_used();

        let packet = rxq.inner.outbound.borrow_mut().pop_front().unwrap();
        let lens: Vec<usize> = packet.fragments().map(Fragment::len).collect();
        assert_eq!(lens, vec![4096 - MRG_HDR_LEN, 4096, 200]);
        assert_eq!(packet.len(), 4096 - MRG_HDR_LEN + 4096 + 200);

        let frags: Vec<&Fragment> = packet.fragments().collect();
        assert!(frags[0].as_slice().iter().all(|&b| b == 0x11));
        assert!(frags[1].as_slice().iter().all(|&b| b == 0x22));
        assert!(frags[2].as_slice().iter().all(|&b| b == 0x33));

        // All three descriptors went back to the pool.
        assert_eq!(ring.free_descriptors(), 8);
    }

    #[tokio::test]
    async fn test_non_mergeable_buffer_is_whole_packet() {
        let (ring, _kick, _notified) = test_vring(8, false);
        let rxq = RxQueue::new(Rc::clone(&ring), HDR_LEN, false);
        stock(&rxq, 1).await;

        let mut sim = VhostSim::new(Rc::clone(&ring));
        let head = sim.pop_avail();
        sim.write_buf(&sim.chain(head)[0], &vec![0xabu8; 100]);
        sim.complete(head, 100);
        ring.process_used();

        let packet = rxq.inner.outbound.borrow_mut().pop_front().unwrap();
        assert_eq!(packet.nr_frags(), 1);
        assert_eq!(packet.len(), 100 - HDR_LEN);
    }

    #[tokio::test]
    async fn test_packets_queued_in_completion_order() {
        let (ring, _kick, _notified) = test_vring(8, false);
        let rxq = RxQueue::new(Rc::clone(&ring), HDR_LEN, false);
        stock(&rxq, 2).await;

        let mut sim = VhostSim::new(Rc::clone(&ring));
        let head_a = sim.pop_avail();
        let head_b = sim.pop_avail();
        let mut frame = vec![0u8; HDR_LEN + 4];
        frame[HDR_LEN..].copy_from_slice(b"aaaa");
        sim.write_buf(&sim.chain(head_a)[0], &frame);
        frame[HDR_LEN..].copy_from_slice(b"bbbb");
        sim.write_buf(&sim.chain(head_b)[0], &frame);

        sim.complete(head_a, (HDR_LEN + 4) as u32);
        sim.complete(head_b, (HDR_LEN + 4) as u32);
        ring.process_used();

        let mut outbound = rxq.inner.outbound.borrow_mut();
        let first = outbound.pop_front().unwrap();
        let second = outbound.pop_front().unwrap();
        assert_eq!(first.fragments().next().unwrap().as_slice(), b"aaaa");
        assert_eq!(second.fragments().next().unwrap().as_slice(), b"bbbb");
    }

    #[tokio::test]
    #[should_panic(expected = "zero rx buffers")]
    async fn test_zero_num_buffers_is_fatal() {
        let (ring, _kick, _notified) = test_vring(8, false);
        let rxq = RxQueue::new(Rc::clone(&ring), MRG_HDR_LEN, true);
        stock(&rxq, 1).await;

        let mut sim = VhostSim::new(Rc::clone(&ring));
        let head = sim.pop_avail();
        sim.write_buf(&sim.chain(head)[0], &mrg_header(0));
        sim.complete(head, 64);
        ring.process_used();
    }

    #[tokio::test]
    async fn test_rx_stream_end_to_end() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let (ring, _kick, notified) = test_vring(8, false);
                let rxq = RxQueue::new(Rc::clone(&ring), HDR_LEN, false);
                let mut stream = rxq.start();

                // Let the refill task stock the whole ring.
                while ring.avail_idx().load(Ordering::Relaxed) == 0 {
                    tokio::task::yield_now().await;
                }
                assert_eq!(ring.free_descriptors(), 0);

                let mut sim = VhostSim::new(Rc::clone(&ring));
                let head = sim.pop_avail();
                let mut frame = vec![0u8; HDR_LEN + 42];
                frame[HDR_LEN..].fill(0x42);
                sim.write_buf(&sim.chain(head)[0], &frame);
                sim.complete(head, (HDR_LEN + 42) as u32);
                // Ring the call eventfd the way vhost would.
                notified.write(1).unwrap();

                let packet = stream.recv().await.unwrap();
                assert_eq!(packet.len(), 42);
                assert!(packet
                    .fragments()
                    .next()
                    .unwrap()
                    .as_slice()
                    .iter()
                    .all(|&b| b == 0x42));
            })
            .await;
    }
}
