// Copyright 2019 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Userspace virtio-net driver backed by the kernel's vhost-net engine.
//!
//! The driver moves Ethernet frames between an in-process network stack and
//! a TAP device through two shared-memory virtqueues serviced by the
//! kernel's vhost worker on the other side. [`virtio::ring::Vring`] is the
//! split-ring engine; [`virtio::net::tx::TxQueue`] and
//! [`virtio::net::rx::RxQueue`] layer packet semantics (offload headers,
//! mergeable receive buffers) on top; [`virtio::net::Net`] composes one of
//! each over a tap interface.
//!
//! The driver is single-threaded and cooperative: one instance is pinned to
//! one core and all of its tasks run on a `tokio::task::LocalSet`. There is
//! no internal locking; the only synchronization is the atomics of the ring
//! protocol shared with the kernel.

pub mod config;
pub mod mac;
pub mod virtio;

pub use config::NetConfig;
pub use virtio::net::packet::{Fragment, IpProtocol, OffloadInfo, Packet};
pub use virtio::net::{HwFeatures, Net, NetError};
