// Copyright 2020 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Driver configuration knobs, typically deserialized from the embedding
//! application's config file.

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum ConfigError {
    /// Virtio ring size {0} is not a power of two
    InvalidRingSize(u16),
}

/// Feature and sizing knobs for one device instance.
///
/// Every knob defaults to on (ring size 256); negotiation with the kernel
/// may still strip features a knob asked for.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default, rename_all = "kebab-case")]
pub struct NetConfig {
    /// Offer VIRTIO_RING_F_EVENT_IDX (kick/interrupt suppression by index).
    pub event_index: bool,
    /// Offer checksum offload in both directions.
    pub csum_offload: bool,
    /// Offer TCP segmentation offload.
    pub tso: bool,
    /// Offer UDP fragmentation offload.
    pub ufo: bool,
    /// Descriptors per vring; must be a power of two.
    #[serde(rename = "virtio-ring-size")]
    pub ring_size: u16,
}

impl Default for NetConfig {
    fn default() -> NetConfig {
        NetConfig {
            event_index: true,
            csum_offload: true,
            tso: true,
            ufo: true,
            ring_size: 256,
        }
    }
}

impl NetConfig {
    /// The ring size is used for ring math with a mask, so it has to be a
    /// power of two, whatever the other knobs say.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ring_size < 2 || !self.ring_size.is_power_of_two() {
            return Err(ConfigError::InvalidRingSize(self.ring_size));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = NetConfig::default();
        assert!(config.event_index);
        assert!(config.csum_offload);
        assert!(config.tso);
        assert!(config.ufo);
        assert_eq!(config.ring_size, 256);
        config.validate().unwrap();
    }

    #[test]
    fn test_deserialize_kebab_case_knobs() {
        let config: NetConfig = serde_json::from_str(
            r#"{
                "event-index": false,
                "csum-offload": true,
                "tso": false,
                "virtio-ring-size": 128
            }"#,
        )
        .unwrap();
        assert!(!config.event_index);
        assert!(config.csum_offload);
        assert!(!config.tso);
        // Missing knobs take their defaults.
        assert!(config.ufo);
        assert_eq!(config.ring_size, 128);
    }

    #[test]
    fn test_unknown_fields_rejected() {
        serde_json::from_str::<NetConfig>(r#"{ "mtu": 9000 }"#).unwrap_err();
    }

    #[test]
    fn test_ring_size_must_be_power_of_two() {
        let config = NetConfig {
            ring_size: 100,
            ..NetConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidRingSize(100))
        ));

        let config = NetConfig {
            ring_size: 0,
            ..NetConfig::default()
        };
        config.validate().unwrap_err();
    }
}
