/*!
 * System Platform
 * Linux implementation of the platform capabilities over nix
 */

use super::{MapViewError, MappedView, Platform, ViewAccess};
use crate::core::limits::FALLBACK_PAGE_SIZE;
use crate::core::types::ProcessorInfo;
use nix::errno::Errno;
use nix::sys::mman::{self, MapFlags, MmapAdvise, MsFlags, ProtFlags};
use nix::unistd::{self, SysconfVar};
use std::ffi::c_void;
use std::fs::{self, File};
use std::io;
use std::num::NonZeroUsize;
use std::ptr::NonNull;
use std::sync::OnceLock;
use tracing::{debug, trace};

/// Root of the sysfs NUMA topology
const NODE_SYSFS_ROOT: &str = "/sys/devices/system/node";

/// OS-backed platform
#[derive(Debug)]
pub struct SystemPlatform {
    page_size: usize,
    /// Processor index to NUMA node, scanned once on first use
    numa_nodes: OnceLock<Vec<u8>>,
}

impl SystemPlatform {
    pub fn new() -> Self {
        let page_size = unistd::sysconf(SysconfVar::PAGE_SIZE)
            .ok()
            .flatten()
            .and_then(|size| usize::try_from(size).ok())
            .filter(|size| size.is_power_of_two())
            .unwrap_or(FALLBACK_PAGE_SIZE);

        Self {
            page_size,
            numa_nodes: OnceLock::new(),
        }
    }

    fn numa_node_of(&self, processor: usize) -> u8 {
        let nodes = self.numa_nodes.get_or_init(scan_numa_topology);
        nodes.get(processor).copied().unwrap_or(0)
    }
}

impl Default for SystemPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl Platform for SystemPlatform {
    #[inline]
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn extend_file(&self, file: &File, len: u64) -> io::Result<()> {
        if file.metadata()?.len() < len {
            file.set_len(len)?;
        }
        Ok(())
    }

    fn file_len(&self, file: &File) -> io::Result<u64> {
        Ok(file.metadata()?.len())
    }

    fn truncate_file(&self, file: &File, len: u64) -> io::Result<()> {
        file.set_len(len)
    }

    fn map_view(
        &self,
        file: &File,
        offset: u64,
        len: usize,
        access: ViewAccess,
        preferred: Option<usize>,
    ) -> Result<MappedView, MapViewError> {
        let length = NonZeroUsize::new(len).ok_or(MapViewError::Os(Errno::EINVAL))?;
        let offset = nix::libc::off_t::try_from(offset).map_err(|_| MapViewError::Os(Errno::EOVERFLOW))?;

        let (prot, flags) = match access {
            ViewAccess::ReadWrite => (ProtFlags::PROT_READ | ProtFlags::PROT_WRITE, MapFlags::MAP_SHARED),
            ViewAccess::CopyOnWrite => (ProtFlags::PROT_READ | ProtFlags::PROT_WRITE, MapFlags::MAP_PRIVATE),
            ViewAccess::ReadOnly => (ProtFlags::PROT_READ, MapFlags::MAP_SHARED),
        };

        // The preferred address is only a hint; a view landing elsewhere is
        // released again and reported as unavailable.
        let hint = preferred.and_then(NonZeroUsize::new);

        // SAFETY: no fixed placement is requested, so the kernel never
        // replaces an existing mapping.
        let ptr = unsafe { mman::mmap(hint, length, prot, flags, file, offset) }.map_err(MapViewError::Os)?;

        if let Some(preferred) = preferred {
            if ptr.as_ptr() as usize != preferred {
                // SAFETY: ptr/len is the mapping created just above.
                if let Err(errno) = unsafe { mman::munmap(ptr, len) } {
                    debug!(errno = %errno, "failed to release misplaced view");
                }
                return Err(MapViewError::AddressUnavailable { preferred });
            }
        }

        trace!(address = ptr.as_ptr() as usize, len, ?access, "view mapped");

        // SAFETY: the mapping was created above and is handed to the view.
        Ok(unsafe { MappedView::from_raw(ptr.cast::<u8>(), len, access) })
    }

    fn flush_view(&self, view: &MappedView) -> Result<(), Errno> {
        if view.access() != ViewAccess::ReadWrite {
            return Ok(());
        }
        // SAFETY: the view is still mapped while borrowed.
        unsafe { mman::msync(view.base().cast::<c_void>(), view.len(), MsFlags::MS_ASYNC) }
    }

    fn unmap_view(&self, view: MappedView) -> Result<(), Errno> {
        // SAFETY: views are created only by `map_view` and consumed here.
        unsafe { mman::munmap(view.base().cast::<c_void>(), view.len()) }
    }

    fn prefault(&self, address: usize) {
        let page = address & !(self.page_size - 1);
        let Some(page) = NonNull::new(page as *mut c_void) else {
            return;
        };
        // SAFETY: madvise never faults; a range that is no longer mapped
        // fails with ENOMEM, which is ignored.
        let _ = unsafe { mman::madvise(page, self.page_size, MmapAdvise::MADV_WILLNEED) };
    }

    fn current_processor(&self) -> ProcessorInfo {
        let thread_id = u32::try_from(unistd::gettid().as_raw()).unwrap_or(0);
        let processor = nix::sched::sched_getcpu().unwrap_or(0);
        ProcessorInfo {
            thread_id,
            processor: u16::try_from(processor).unwrap_or(u16::MAX),
            numa_node: self.numa_node_of(processor),
        }
    }

    fn process_id(&self) -> u32 {
        u32::try_from(unistd::getpid().as_raw()).unwrap_or(0)
    }
}

/// Build the processor to NUMA node table from sysfs
///
/// Machines without NUMA topology map every processor to node 0.
fn scan_numa_topology() -> Vec<u8> {
    let mut table = Vec::new();
    let Ok(entries) = fs::read_dir(NODE_SYSFS_ROOT) else {
        return table;
    };

    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(node) = name
            .to_str()
            .and_then(|n| n.strip_prefix("node"))
            .and_then(|n| n.parse::<u8>().ok())
        else {
            continue;
        };
        let Ok(cpulist) = fs::read_to_string(entry.path().join("cpulist")) else {
            continue;
        };
        for cpu in parse_cpu_list(&cpulist) {
            if table.len() <= cpu {
                table.resize(cpu + 1, 0);
            }
            table[cpu] = node;
        }
    }
    table
}

/// Parse a sysfs cpu list such as `0-3,8-11,16`
fn parse_cpu_list(list: &str) -> Vec<usize> {
    let mut cpus = Vec::new();
    for part in list.trim().split(',').filter(|p| !p.is_empty()) {
        match part.split_once('-') {
            Some((start, end)) => {
                if let (Ok(start), Ok(end)) = (start.parse::<usize>(), end.parse::<usize>()) {
                    cpus.extend(start..=end);
                }
            }
            None => {
                if let Ok(cpu) = part.parse::<usize>() {
                    cpus.push(cpu);
                }
            }
        }
    }
    cpus
}
