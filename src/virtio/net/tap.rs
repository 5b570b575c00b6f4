// Copyright 2019 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
//
// Portions Copyright 2017 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the THIRD-PARTY file.

//! Handle for the TAP interface that backs the device. The data path runs
//! entirely inside the kernel (vhost reads and writes the fd); this handle
//! only configures the interface.

use std::fmt::{self, Debug};
use std::fs::File;
use std::io::Error as IoError;
use std::os::raw::{c_int, c_short, c_uint, c_ulong};
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};

use vmm_sys_util::ioctl::{ioctl_with_mut_ref, ioctl_with_ref, ioctl_with_val};
use vmm_sys_util::{ioctl_ioc_nr, ioctl_iow_nr};

use crate::virtio::gen::if_tun::{IFF_NO_PI, IFF_ONE_QUEUE, IFF_TAP, IFF_VNET_HDR};
use crate::virtio::gen::iff::{ifreq, IFNAMSIZ};

// As defined in the Linux UAPI:
// https://elixir.bootlin.com/linux/v4.17/source/include/uapi/linux/if.h#L33
const IFACE_NAME_MAX_LEN: usize = IFNAMSIZ;

/// List of errors the tap implementation can throw.
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum TapError {
    /// Couldn't open /dev/net/tun: {0}
    OpenTun(IoError),
    /// Invalid interface name
    InvalidIfname,
    /// Error while creating ifreq structure: {0}
    IfreqExecuteError(IoError),
    /// Error while setting the offload flags: {0}
    SetOffloadFlags(IoError),
    /// Error while setting size of the vnet header: {0}
    SetSizeOfVnetHdr(IoError),
}

const TUNTAP: c_uint = 84;
ioctl_iow_nr!(TUNSETIFF, TUNTAP, 202, c_int);
ioctl_iow_nr!(TUNSETOFFLOAD, TUNTAP, 208, c_uint);
ioctl_iow_nr!(TUNSETVNETHDRSZ, TUNTAP, 216, c_int);

/// Handle for a network tap interface.
///
/// Wraps the file descriptor for the tap device so methods can run ioctls
/// on the interface. The tap interface fd will be closed when Tap goes out
/// of scope, and the kernel will clean up the interface automatically.
pub struct Tap {
    tap_file: File,
    if_name: [u8; IFACE_NAME_MAX_LEN],
}

impl Debug for Tap {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Tap {{ if_name: {:?} }}", self.if_name_as_str())
    }
}

// Returns a byte array representing the contents of a null terminated C
// string containing if_name.
fn build_terminated_if_name(if_name: &str) -> Result<[u8; IFACE_NAME_MAX_LEN], TapError> {
    let if_name = if_name.as_bytes();
    if if_name.len() >= IFACE_NAME_MAX_LEN {
        return Err(TapError::InvalidIfname);
    }

    let mut terminated_if_name = [b'\0'; IFACE_NAME_MAX_LEN];
    terminated_if_name[..if_name.len()].copy_from_slice(if_name);
    Ok(terminated_if_name)
}

impl Tap {
    /// Attach to the TAP interface named `if_name`, single-queue with the
    /// vnet header enabled and no packet-info prefix.
    pub fn open_named(if_name: &str) -> Result<Tap, TapError> {
        // SAFETY: open is called with a constant null-terminated path and
        // the result is checked.
        let fd = unsafe {
            libc::open(
                c"/dev/net/tun".as_ptr(),
                libc::O_RDWR | libc::O_NONBLOCK | libc::O_CLOEXEC,
            )
        };
        if fd < 0 {
            return Err(TapError::OpenTun(IoError::last_os_error()));
        }
        // SAFETY: we just checked that the fd is valid.
        let tuntap = unsafe { File::from_raw_fd(fd) };

        let mut ifreq = ifreq {
            ifrn_name: build_terminated_if_name(if_name)?,
            ifru_flags: c_short::try_from(IFF_TAP | IFF_NO_PI | IFF_ONE_QUEUE | IFF_VNET_HDR)
                .unwrap(),
            ..Default::default()
        };
        // SAFETY: ioctl is called with a valid tap fd and a properly sized
        // ifreq; the return value is checked.
        if unsafe { ioctl_with_mut_ref(&tuntap, TUNSETIFF(), &mut ifreq) } < 0 {
            return Err(TapError::IfreqExecuteError(IoError::last_os_error()));
        }

        Ok(Tap {
            tap_file: tuntap,
            // The kernel writes back the resolved name (e.g. for "tap%d").
            if_name: ifreq.ifrn_name,
        })
    }

    /// Retrieve the interface's name as a str.
    pub fn if_name_as_str(&self) -> &str {
        let len = self
            .if_name
            .iter()
            .position(|x| *x == 0)
            .unwrap_or(IFACE_NAME_MAX_LEN);
        std::str::from_utf8(&self.if_name[..len]).unwrap_or("")
    }

    /// Set the offload flags for the tap interface.
    pub fn set_offload(&self, flags: c_uint) -> Result<(), TapError> {
        // SAFETY: ioctl is called with a valid tap fd and the return value
        // is checked.
        if unsafe { ioctl_with_val(&self.tap_file, TUNSETOFFLOAD(), c_ulong::from(flags)) } < 0 {
            return Err(TapError::SetOffloadFlags(IoError::last_os_error()));
        }
        Ok(())
    }

    /// Set the size of the vnet hdr.
    pub fn set_vnet_hdr_size(&self, size: c_int) -> Result<(), TapError> {
        // SAFETY: ioctl is called with a valid tap fd and the return value
        // is checked.
        if unsafe { ioctl_with_ref(&self.tap_file, TUNSETVNETHDRSZ(), &size) } < 0 {
            return Err(TapError::SetSizeOfVnetHdr(IoError::last_os_error()));
        }
        Ok(())
    }
}

impl AsRawFd for Tap {
    fn as_raw_fd(&self) -> RawFd {
        self.tap_file.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ifreq_layout_matches_kernel() {
        // struct ifreq is 16 name bytes plus a 24-byte union.
        assert_eq!(std::mem::size_of::<ifreq>(), 40);
    }

    #[test]
    fn test_terminated_if_name() {
        let name = build_terminated_if_name("tap0").unwrap();
        assert_eq!(&name[..5], b"tap0\0");

        // 16 characters - too long.
        assert!(matches!(
            build_terminated_if_name("a123456789abcdef"),
            Err(TapError::InvalidIfname)
        ));

        // 15 characters - OK.
        build_terminated_if_name("a123456789abcde").unwrap();
    }

    // Opening the device requires CAP_NET_ADMIN; run as root.
    #[test]
    #[ignore]
    fn test_tap_open_and_configure() {
        let tap = Tap::open_named("").unwrap();
        assert_eq!("tap0", tap.if_name_as_str());
        tap.set_vnet_hdr_size(12).unwrap();
        tap.set_offload(0).unwrap();
    }
}
