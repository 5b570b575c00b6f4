// Copyright 2020 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The device: one TX and one RX vring over a tap interface, with the data
//! path serviced by the kernel's vhost-net engine.

use std::cell::Cell;
use std::mem;
use std::rc::Rc;

use tokio::sync::mpsc;
use vmm_sys_util::eventfd::EventFd;

use crate::config::NetConfig;
use crate::mac::MacAddr;
use crate::virtio::gen::if_tun::{TUN_F_CSUM, TUN_F_TSO4, TUN_F_UFO};
use crate::virtio::gen::virtio_net::{
    virtio_net_hdr, virtio_net_hdr_mrg_rxbuf, VIRTIO_NET_F_CSUM, VIRTIO_NET_F_GUEST_CSUM,
    VIRTIO_NET_F_GUEST_TSO4, VIRTIO_NET_F_GUEST_UFO, VIRTIO_NET_F_HOST_TSO4,
    VIRTIO_NET_F_HOST_UFO, VIRTIO_NET_F_MRG_RXBUF,
};
use crate::virtio::gen::virtio_ring::{VIRTIO_RING_F_EVENT_IDX, VIRTIO_RING_F_INDIRECT_DESC};
use crate::virtio::net::packet::Packet;
use crate::virtio::net::rx::RxQueue;
use crate::virtio::net::tap::Tap;
use crate::virtio::net::tx::TxQueue;
use crate::virtio::net::vhost::VhostNetHandle;
use crate::virtio::net::{HwFeatures, NetError, RX_INDEX, TX_INDEX};
use crate::virtio::ring::{Vring, VringConfig, VringStorage};

/// The device does not negotiate VIRTIO_NET_F_MAC, so the address is a
/// driver-fixed constant, same for every instance.
const FIXED_MAC: [u8; 6] = [0x12, 0x23, 0x34, 0x56, 0x67, 0x78];

/// Virtio network device over vhost-net.
///
/// Construction wires the whole control plane: tap configuration, feature
/// negotiation, memory table and per-queue ring registration. After that,
/// [`Net::start`] and [`Net::receive`] spawn the queue service tasks; both
/// must be called from within a `tokio::task::LocalSet`, matching the
/// one-driver-per-core model.
#[derive(Debug)]
pub struct Net {
    tap: Tap,
    vhost: VhostNetHandle,
    features: u64,
    hw_features: HwFeatures,
    header_len: usize,
    mac: MacAddr,
    txq: TxQueue,
    rxq: RxQueue,
    tx_started: Cell<bool>,
    rx_started: Cell<bool>,
}

/// Driver-side feature mask plus the offload surface it implies, derived
/// from the configuration knobs.
fn driver_features(config: &NetConfig) -> (u64, HwFeatures) {
    let mut features =
        1u64 << VIRTIO_RING_F_INDIRECT_DESC | 1 << VIRTIO_NET_F_MRG_RXBUF;
    let mut hw_features = HwFeatures::default();

    if config.event_index {
        features |= 1 << VIRTIO_RING_F_EVENT_IDX;
    }
    if config.csum_offload {
        features |= 1 << VIRTIO_NET_F_CSUM | 1 << VIRTIO_NET_F_GUEST_CSUM;
        hw_features.tx_csum_offload = true;
        hw_features.rx_csum_offload = true;
    }
    if config.tso {
        features |= 1 << VIRTIO_NET_F_HOST_TSO4 | 1 << VIRTIO_NET_F_GUEST_TSO4;
        hw_features.tx_tso = true;
    }
    if config.ufo {
        features |= 1 << VIRTIO_NET_F_HOST_UFO | 1 << VIRTIO_NET_F_GUEST_UFO;
        hw_features.tx_ufo = true;
    }
    (features, hw_features)
}

impl Net {
    /// Create the device on the TAP interface named `if_name`.
    pub fn new(if_name: &str, config: &NetConfig) -> Result<Net, NetError> {
        config.validate()?;
        let ring_size = config.ring_size;

        let tap = Tap::open_named(if_name)?;
        let vhost = VhostNetHandle::open()?;
        vhost.set_owner()?;

        let (driver_mask, hw_features) = driver_features(config);
        let features = vhost.get_features()? & driver_mask;
        vhost.set_features(features)?;

        let mergeable = features & (1 << VIRTIO_NET_F_MRG_RXBUF) != 0;
        let header_len = if mergeable {
            mem::size_of::<virtio_net_hdr_mrg_rxbuf>()
        } else {
            mem::size_of::<virtio_net_hdr>()
        };

        let mut offload = 0;
        if hw_features.tx_csum_offload && hw_features.rx_csum_offload {
            offload = TUN_F_CSUM;
            if hw_features.tx_tso {
                offload |= TUN_F_TSO4;
            }
            if hw_features.tx_ufo {
                offload |= TUN_F_UFO;
            }
        }
        tap.set_offload(offload)?;
        tap.set_vnet_hdr_size(i32::try_from(header_len).unwrap())?;

        vhost.set_mem_table()?;

        let event_index = features & (1 << VIRTIO_RING_F_EVENT_IDX) != 0;
        let rx_ring = Self::setup_vring(&vhost, &tap, RX_INDEX, ring_size, event_index, true)?;
        let tx_ring = Self::setup_vring(&vhost, &tap, TX_INDEX, ring_size, event_index, false)?;

        Ok(Net {
            tap,
            vhost,
            features,
            hw_features,
            header_len,
            mac: MacAddr::from(FIXED_MAC),
            txq: TxQueue::new(tx_ring, hw_features, header_len),
            rxq: RxQueue::new(rx_ring, header_len, mergeable),
            tx_started: Cell::new(false),
            rx_started: Cell::new(false),
        })
    }

    /// Allocate, register and build one ring. Each queue owns its own kick
    /// and call eventfd pair.
    fn setup_vring(
        vhost: &VhostNetHandle,
        tap: &Tap,
        queue_index: usize,
        size: u16,
        event_index: bool,
        mergeable_buffers: bool,
    ) -> Result<Rc<Vring>, NetError> {
        let storage = VringStorage::new(size);
        let kick = EventFd::new(libc::EFD_NONBLOCK).map_err(NetError::EventFd)?;
        let call = EventFd::new(libc::EFD_NONBLOCK).map_err(NetError::EventFd)?;

        vhost.set_vring_num(queue_index, size)?;
        vhost.set_vring_addr(queue_index, &storage)?;
        vhost.set_vring_kick(queue_index, &kick)?;
        vhost.set_vring_call(queue_index, &call)?;
        vhost.set_backend(queue_index, tap)?;

        Ok(Rc::new(Vring::new(
            VringConfig {
                size,
                event_index,
                indirect: false,
                mergeable_buffers,
            },
            storage,
            call,
            kick,
        )))
    }

    /// Spawn the TX completion service loop. Must be called once, from
    /// within a `LocalSet`, before the first `send`.
    pub fn start(&self) {
        if !self.tx_started.replace(true) {
            tokio::task::spawn_local(Rc::clone(self.txq.ring()).run());
        }
    }

    /// Start the receive side and return its packet stream: strict arrival
    /// order, single consumer, bounded. Panics if called twice.
    pub fn receive(&self) -> mpsc::Receiver<Packet> {
        assert!(
            !self.rx_started.replace(true),
            "the receive stream has already been taken"
        );
        self.rxq.start()
    }

    /// Post one frame. Resolves when the host has acknowledged it.
    pub async fn send(&self, packet: Packet) {
        self.txq.send(packet).await;
    }

    pub fn mac_address(&self) -> MacAddr {
        self.mac
    }

    pub fn hw_features(&self) -> HwFeatures {
        self.hw_features
    }

    /// The feature set negotiated with the kernel.
    pub fn features(&self) -> u64 {
        self.features
    }

    /// Length of the per-frame virtio-net header after negotiation: 12 with
    /// mergeable receive buffers, 10 without.
    pub fn vnet_hdr_len(&self) -> usize {
        self.header_len
    }

    /// Control handle to the kernel engine. Kept open for the device's
    /// lifetime; closing it tears the vhost instance down.
    pub fn vhost_handle(&self) -> &VhostNetHandle {
        &self.vhost
    }

    /// Host interface name the device is bound to.
    pub fn iface_name(&self) -> String {
        self.tap.if_name_as_str().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_driver_features_all_knobs_on() {
        let (mask, hw) = driver_features(&NetConfig::default());
        assert_ne!(mask & (1 << VIRTIO_RING_F_EVENT_IDX), 0);
        assert_ne!(mask & (1 << VIRTIO_RING_F_INDIRECT_DESC), 0);
        assert_ne!(mask & (1 << VIRTIO_NET_F_MRG_RXBUF), 0);
        assert_ne!(mask & (1 << VIRTIO_NET_F_CSUM), 0);
        assert_ne!(mask & (1 << VIRTIO_NET_F_GUEST_CSUM), 0);
        assert_ne!(mask & (1 << VIRTIO_NET_F_HOST_TSO4), 0);
        assert_ne!(mask & (1 << VIRTIO_NET_F_HOST_UFO), 0);
        assert!(hw.tx_csum_offload && hw.rx_csum_offload);
        assert!(hw.tx_tso);
        assert!(hw.tx_ufo);
        assert_eq!(hw.mtu, 1500);
    }

    #[test]
    fn test_driver_features_offloads_disabled() {
        let config = NetConfig {
            event_index: false,
            csum_offload: false,
            tso: false,
            ufo: false,
            ..NetConfig::default()
        };
        let (mask, hw) = driver_features(&config);

        // Mergeable buffers and indirect descriptors are always offered.
        assert_eq!(
            mask,
            1u64 << VIRTIO_RING_F_INDIRECT_DESC | 1 << VIRTIO_NET_F_MRG_RXBUF
        );
        assert!(!hw.tx_csum_offload);
        assert!(!hw.tx_tso);
        assert!(!hw.tx_ufo);
    }
}
