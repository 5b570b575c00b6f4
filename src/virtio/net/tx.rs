// Copyright 2020 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Transmit half of the device: prepend the virtio-net header carrying the
//! offload hints, post the frame as a read-only scatter-gather chain, and
//! keep the frame alive until the host acknowledges it.

use std::mem;
use std::rc::Rc;

use tokio::sync::oneshot;

use crate::virtio::gen::virtio_net::{
    virtio_net_hdr_mrg_rxbuf, VIRTIO_NET_HDR_F_NEEDS_CSUM, VIRTIO_NET_HDR_GSO_TCPV4,
    VIRTIO_NET_HDR_GSO_UDP,
};
use crate::virtio::net::packet::{Fragment, IpProtocol, Packet};
use crate::virtio::net::HwFeatures;
use crate::virtio::ring::{Buffer, Vring};

const ETH_HLEN: u16 = 14;

/// Transmit queue over one vring.
#[derive(Debug)]
pub struct TxQueue {
    ring: Rc<Vring>,
    hw_features: HwFeatures,
    header_len: usize,
}

impl TxQueue {
    pub(crate) fn new(ring: Rc<Vring>, hw_features: HwFeatures, header_len: usize) -> TxQueue {
        TxQueue {
            ring,
            hw_features,
            header_len,
        }
    }

    pub(crate) fn ring(&self) -> &Rc<Vring> {
        &self.ring
    }

    /// Post `packet` on the ring, virtio-net header first. Suspends while
    /// the ring is out of descriptors, and resolves once the host has
    /// acknowledged the chain head, at which point the frame has been
    /// released.
    pub async fn send(&self, mut packet: Packet) {
        let vhdr = build_vnet_hdr(&self.hw_features, &packet);
        packet.prepend(header_fragment(&vhdr, self.header_len));

        let nr_frags =
            u16::try_from(packet.nr_frags()).expect("packet fragment count exceeds ring capacity");
        self.ring.reserve(nr_frags).await;

        let mut chain: Vec<Buffer> = packet
            .fragments()
            .map(|frag| Buffer {
                addr: frag.as_ptr() as u64,
                len: u32::try_from(frag.len()).unwrap(),
                writeable: false,
                completed: None,
            })
            .collect();
        let (done, acked) = oneshot::channel();
        chain[0].completed = Some(Box::new(move |_len| {
            // The frame dies here, after the host is finished with every
            // fragment address in the chain.
            drop(packet);
            let _ = done.send(());
        }));
        self.ring.post(std::iter::once(chain));

        // An error here means the ring was torn down with the chain still
        // in flight; there is nothing left to wait for.
        let _ = acked.await;
    }
}

/// Translate a packet's offload metadata into the virtio-net header fields
/// the host kernel acts on (checksum placement and segmentation geometry).
fn build_vnet_hdr(hw: &HwFeatures, packet: &Packet) -> virtio_net_hdr_mrg_rxbuf {
    let mut vhdr = virtio_net_hdr_mrg_rxbuf::default();
    if !hw.tx_csum_offload {
        return vhdr;
    }

    let offload = packet.offload();
    let mtu = hw.mtu;
    match offload.protocol {
        IpProtocol::Tcp => {
            vhdr.hdr.flags = VIRTIO_NET_HDR_F_NEEDS_CSUM;
            vhdr.hdr.csum_start = ETH_HLEN + offload.ip_hdr_len;
            // Checksum field offset within the TCP header.
            vhdr.hdr.csum_offset = 16;
            if hw.tx_tso && packet.len() > usize::from(mtu) + usize::from(ETH_HLEN) {
                vhdr.hdr.gso_type = VIRTIO_NET_HDR_GSO_TCPV4;
                vhdr.hdr.hdr_len = ETH_HLEN + offload.ip_hdr_len + offload.tcp_hdr_len;
                vhdr.hdr.gso_size = mtu - offload.ip_hdr_len - offload.tcp_hdr_len;
            }
        }
        IpProtocol::Udp => {
            vhdr.hdr.flags = VIRTIO_NET_HDR_F_NEEDS_CSUM;
            vhdr.hdr.csum_start = ETH_HLEN + offload.ip_hdr_len;
            // Checksum field offset within the UDP header.
            vhdr.hdr.csum_offset = 6;
            if hw.tx_ufo && packet.len() > usize::from(mtu) + usize::from(ETH_HLEN) {
                vhdr.hdr.gso_type = VIRTIO_NET_HDR_GSO_UDP;
                vhdr.hdr.hdr_len = ETH_HLEN + offload.ip_hdr_len + offload.udp_hdr_len;
                vhdr.hdr.gso_size = mtu - offload.ip_hdr_len - offload.udp_hdr_len;
            }
        }
        IpProtocol::Other => {}
    }
    vhdr
}

/// Serialize the first `header_len` bytes of the header into an owned
/// fragment. Truncation drops only the num_buffers field, which is what the
/// 10-byte non-mergeable layout expects.
fn header_fragment(vhdr: &virtio_net_hdr_mrg_rxbuf, header_len: usize) -> Fragment {
    debug_assert!(header_len <= mem::size_of::<virtio_net_hdr_mrg_rxbuf>());
    // SAFETY: the header is a repr(C) POD with no padding.
    let bytes = unsafe {
        std::slice::from_raw_parts(
            (vhdr as *const virtio_net_hdr_mrg_rxbuf).cast::<u8>(),
            mem::size_of::<virtio_net_hdr_mrg_rxbuf>(),
        )
    };
    Fragment::new(bytes[..header_len].to_vec().into_boxed_slice())
}
