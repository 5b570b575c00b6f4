// Copyright 2019 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
//
// Portions Copyright 2017 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the THIRD-PARTY file.

//! Control handle for the in-kernel vhost-net engine. The handle only deals
//! with setting up the kernel driver; once the rings and the tap backend
//! are wired, the kernel moves all the data by itself.

use std::fs::File;
use std::io::Error as IoError;
use std::os::unix::io::{AsRawFd, FromRawFd};

use vmm_sys_util::ioctl::{ioctl, ioctl_with_mut_ref, ioctl_with_ptr, ioctl_with_ref};

use crate::virtio::gen::vhost::{
    vhost_memory, vhost_memory_region, vhost_memory_single, vhost_vring_addr, vhost_vring_file,
    vhost_vring_state, VHOST_GET_FEATURES, VHOST_NET_SET_BACKEND, VHOST_SET_FEATURES,
    VHOST_SET_MEM_TABLE, VHOST_SET_OWNER, VHOST_SET_VRING_ADDR, VHOST_SET_VRING_CALL,
    VHOST_SET_VRING_KICK, VHOST_SET_VRING_NUM,
};
use crate::virtio::ring::VringStorage;

#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum VhostError {
    /// Couldn't open /dev/vhost-net: {0}
    VhostOpen(IoError),
    /// Error while running ioctl: {0}
    IoctlError(IoError),
}

type Result<T> = std::result::Result<T, VhostError>;

fn ioctl_error<T>() -> Result<T> {
    Err(VhostError::IoctlError(IoError::last_os_error()))
}

/// Control connection to /dev/vhost-net.
#[derive(Debug)]
pub struct VhostNetHandle {
    vhost: File,
}

impl VhostNetHandle {
    pub fn open() -> Result<VhostNetHandle> {
        // SAFETY: open is called with a constant null-terminated path and
        // the result is checked.
        let fd = unsafe { libc::open(c"/dev/vhost-net".as_ptr(), libc::O_RDWR | libc::O_CLOEXEC) };
        if fd < 0 {
            return Err(VhostError::VhostOpen(IoError::last_os_error()));
        }
        // SAFETY: we just checked that the fd is valid.
        Ok(VhostNetHandle {
            vhost: unsafe { File::from_raw_fd(fd) },
        })
    }

    /// Set the current process as the owner of this file descriptor.
    /// This must be run before any other vhost ioctls.
    pub fn set_owner(&self) -> Result<()> {
        // SAFETY: ioctl is called on a valid vhost fd and the return value
        // is checked.
        let ret = unsafe { ioctl(&self.vhost, VHOST_SET_OWNER()) };
        if ret < 0 {
            return ioctl_error();
        }
        Ok(())
    }

    /// Get a bitmask of supported virtio/vhost features.
    pub fn get_features(&self) -> Result<u64> {
        let mut avail_features: u64 = 0;
        // SAFETY: ioctl is called on a valid vhost fd, the kernel writes a
        // u64, and the return value is checked.
        let ret = unsafe { ioctl_with_mut_ref(&self.vhost, VHOST_GET_FEATURES(), &mut avail_features) };
        if ret < 0 {
            return ioctl_error();
        }
        Ok(avail_features)
    }

    /// Inform the vhost subsystem which features to enable. This should be
    /// a subset of the supported features from VHOST_GET_FEATURES.
    pub fn set_features(&self, features: u64) -> Result<()> {
        // SAFETY: ioctl is called on a valid vhost fd and the return value
        // is checked.
        let ret = unsafe { ioctl_with_ref(&self.vhost, VHOST_SET_FEATURES(), &features) };
        if ret < 0 {
            return ioctl_error();
        }
        Ok(())
    }

    /// Register the memory mapping with the kernel: one region covering the
    /// whole process address space, identity-mapped, so guest physical
    /// address == userspace virtual address and every ring or payload
    /// pointer is directly usable.
    pub fn set_mem_table(&self) -> Result<()> {
        let table = vhost_memory_single {
            mem: vhost_memory {
                nregions: 1,
                padding: 0,
            },
            region: vhost_memory_region {
                guest_phys_addr: 0,
                memory_size: (1u64 << 47) - 4096,
                userspace_addr: 0,
                flags_padding: 0,
            },
        };
        // SAFETY: the pointer is valid for the duration of the call and the
        // kernel copies the table; the return value is checked.
        let ret = unsafe { ioctl_with_ptr(&self.vhost, VHOST_SET_MEM_TABLE(), &table) };
        if ret < 0 {
            return ioctl_error();
        }
        Ok(())
    }

    /// Set the number of descriptors in the vring.
    pub fn set_vring_num(&self, queue_index: usize, num: u16) -> Result<()> {
        let vring_state = vhost_vring_state {
            index: queue_index as u32,
            num: u32::from(num),
        };
        // SAFETY: ioctl is called on a valid vhost fd and the return value
        // is checked.
        let ret = unsafe { ioctl_with_ref(&self.vhost, VHOST_SET_VRING_NUM(), &vring_state) };
        if ret < 0 {
            return ioctl_error();
        }
        Ok(())
    }

    /// Hand the kernel the three ring regions of a queue. The addresses are
    /// userspace pointers, valid under the identity mapping above.
    pub fn set_vring_addr(&self, queue_index: usize, storage: &VringStorage) -> Result<()> {
        let vring_addr = vhost_vring_addr {
            index: queue_index as u32,
            flags: 0,
            desc_user_addr: storage.desc_table() as u64,
            used_user_addr: storage.used_ring() as u64,
            avail_user_addr: storage.avail_ring() as u64,
            log_guest_addr: 0,
        };
        // SAFETY: ioctl is called on a valid vhost fd and the return value
        // is checked.
        let ret = unsafe { ioctl_with_ref(&self.vhost, VHOST_SET_VRING_ADDR(), &vring_addr) };
        if ret < 0 {
            return ioctl_error();
        }
        Ok(())
    }

    /// Set the eventfd the driver signals when buffers are available for
    /// the kernel to process.
    pub fn set_vring_kick<F: AsRawFd>(&self, queue_index: usize, fd: &F) -> Result<()> {
        self.set_vring_fd(VHOST_SET_VRING_KICK(), queue_index, fd)
    }

    /// Set the eventfd the kernel signals when buffers have been used.
    pub fn set_vring_call<F: AsRawFd>(&self, queue_index: usize, fd: &F) -> Result<()> {
        self.set_vring_fd(VHOST_SET_VRING_CALL(), queue_index, fd)
    }

    /// Bind a queue to the tap device carrying the traffic.
    pub fn set_backend<F: AsRawFd>(&self, queue_index: usize, fd: &F) -> Result<()> {
        self.set_vring_fd(VHOST_NET_SET_BACKEND(), queue_index, fd)
    }

    fn set_vring_fd<F: AsRawFd>(&self, req: u64, queue_index: usize, fd: &F) -> Result<()> {
        let vring_file = vhost_vring_file {
            index: queue_index as u32,
            fd: fd.as_raw_fd(),
        };
        // SAFETY: ioctl is called on a valid vhost fd and the return value
        // is checked.
        let ret = unsafe { ioctl_with_ref(&self.vhost, req, &vring_file) };
        if ret < 0 {
            return ioctl_error();
        }
        Ok(())
    }
}

impl AsRawFd for VhostNetHandle {
    fn as_raw_fd(&self) -> i32 {
        self.vhost.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_table_layout() {
        // The kernel parses the header then nregions regions behind it.
        assert_eq!(std::mem::size_of::<vhost_memory>(), 8);
        assert_eq!(std::mem::size_of::<vhost_memory_region>(), 32);
        assert_eq!(std::mem::size_of::<vhost_memory_single>(), 40);
    }

    // Requires /dev/vhost-net and CAP_NET_ADMIN; run as root.
    #[test]
    #[ignore]
    fn test_open_and_own() {
        let vhost = VhostNetHandle::open().unwrap();
        vhost.set_owner().unwrap();
        assert!(vhost.get_features().unwrap() != 0);
    }
}
