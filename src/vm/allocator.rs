//! VM identity allocation
//!
//! The vsock CID counter and the TAP index set are the only state shared
//! between VMs. Both live in one [`ResourceAllocator`] behind a single mutex,
//! so one `allocate` call is one critical section.
//!
//! ```text
//! CID:  3, 4, 5, ...            monotonic, never reused in-process,
//!                               floor raised from vm.json records on disk
//! TAP:  lowest i in 0..253 with i ∉ (tracked ∪ host scan of <prefix>N)
//!       guest ip = <subnet>.(2 + i), gateway = <subnet>.1
//! ```

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::error::{IsolationError, Result};

/// CIDs 0-2 are reserved by vsock (hypervisor, local, host)
pub const FIRST_CID: u32 = 3;
/// TAP indices are `0..TAP_INDEX_LIMIT`, keeping guest addresses within .2-.254
pub const TAP_INDEX_LIMIT: u32 = 253;

pub type SharedAllocator = Arc<Mutex<ResourceAllocator>>;

/// Identities handed to one VM
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    pub cid: u32,
    pub tap_index: Option<u32>,
}

#[derive(Debug)]
pub struct ResourceAllocator {
    next_cid: u32,
    taps_in_use: BTreeSet<u32>,
    sysfs_net_dir: PathBuf,
    tap_prefix: String,
}

impl ResourceAllocator {
    pub fn new(sysfs_net_dir: impl Into<PathBuf>, tap_prefix: impl Into<String>) -> Self {
        Self {
            next_cid: FIRST_CID,
            taps_in_use: BTreeSet::new(),
            sysfs_net_dir: sysfs_net_dir.into(),
            tap_prefix: tap_prefix.into(),
        }
    }

    pub fn shared(self) -> SharedAllocator {
        Arc::new(Mutex::new(self))
    }

    /// Allocate a CID and, when networking is available, a TAP index
    pub fn allocate(&mut self, want_tap: bool) -> Result<Allocation> {
        let tap_index = if want_tap {
            Some(self.allocate_tap()?)
        } else {
            None
        };
        let cid = self.allocate_cid();
        Ok(Allocation { cid, tap_index })
    }

    pub fn allocate_cid(&mut self) -> u32 {
        let cid = self.next_cid;
        self.next_cid += 1;
        cid
    }

    /// Make sure `cid` is never issued again
    pub fn observe_cid(&mut self, cid: u32) {
        if cid >= self.next_cid {
            self.next_cid = cid + 1;
        }
    }

    /// Lowest index free both in this process and on the host
    pub fn allocate_tap(&mut self) -> Result<u32> {
        let on_host = scan_host_taps(&self.sysfs_net_dir, &self.tap_prefix);
        let index = (0..TAP_INDEX_LIMIT)
            .find(|i| !self.taps_in_use.contains(i) && !on_host.contains(i))
            .ok_or_else(|| {
                IsolationError::AllocationExhausted(format!(
                    "no free {}N index below {}",
                    self.tap_prefix, TAP_INDEX_LIMIT
                ))
            })?;
        self.taps_in_use.insert(index);
        Ok(index)
    }

    /// Record an index held by a re-adopted VM
    pub fn claim_tap(&mut self, index: u32) {
        self.taps_in_use.insert(index);
    }

    pub fn release_tap(&mut self, index: u32) {
        self.taps_in_use.remove(&index);
    }
}

pub fn tap_name(prefix: &str, index: u32) -> String {
    format!("{}{}", prefix, index)
}

/// Guest address for a TAP index: `<subnet>.(2 + index)`
pub fn guest_ip(subnet: &str, index: u32) -> String {
    format!("{}.{}", subnet, 2 + index)
}

/// Locally administered MAC derived from the TAP index
pub fn guest_mac(index: u32) -> String {
    format!("02:a5:00:00:{:02x}:{:02x}", (index >> 8) & 0xff, index & 0xff)
}

/// Indices of `<prefix>N` interfaces present under the sysfs net directory
pub fn scan_host_taps(sysfs_net_dir: &Path, prefix: &str) -> BTreeSet<u32> {
    let Ok(entries) = std::fs::read_dir(sysfs_net_dir) else {
        return BTreeSet::new();
    };
    entries
        .flatten()
        .filter_map(|entry| {
            entry
                .file_name()
                .to_str()
                .and_then(|name| name.strip_prefix(prefix))
                .and_then(|rest| rest.parse::<u32>().ok())
        })
        .collect()
}
