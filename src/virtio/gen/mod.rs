// Copyright 2019 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Linux ABI constants and structs for the virtio transport, kept in the
//! flat C naming of the kernel headers they mirror.

#![allow(non_upper_case_globals)]
#![allow(non_camel_case_types)]
#![allow(non_snake_case)]

pub mod if_tun;
pub mod iff;
pub mod vhost;
pub mod virtio_net;
pub mod virtio_ring;
