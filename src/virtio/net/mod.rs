// Copyright 2020 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::io;

use crate::config::ConfigError;

pub mod device;
pub mod packet;
pub mod rx;
pub mod tap;
pub mod tx;
pub mod vhost;

pub use device::Net;
pub use tap::{Tap, TapError};
pub use vhost::{VhostError, VhostNetHandle};

// The index of the rx queue in the vhost device.
pub const RX_INDEX: usize = 0;
// The index of the tx queue in the vhost device.
pub const TX_INDEX: usize = 1;

#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum NetError {
    /// Configuration error: {0}
    Config(#[from] ConfigError),
    /// Tap device error: {0}
    Tap(#[from] TapError),
    /// Vhost error: {0}
    Vhost(#[from] VhostError),
    /// EventFd error: {0}
    EventFd(io::Error),
}

/// Offload surface the device ended up with after negotiation; consumed by
/// the stack above and by the TX header builder.
#[derive(Debug, Clone, Copy)]
pub struct HwFeatures {
    pub tx_csum_offload: bool,
    pub rx_csum_offload: bool,
    pub tx_tso: bool,
    pub tx_ufo: bool,
    pub mtu: u16,
}

impl Default for HwFeatures {
    fn default() -> HwFeatures {
        HwFeatures {
            tx_csum_offload: false,
            rx_csum_offload: false,
            tx_tso: false,
            tx_ufo: false,
            mtu: 1500,
        }
    }
}
