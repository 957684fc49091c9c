//! A minimal reader for the perf mmap ring buffer.
//!
//! The kernel appends records at `data_head` (published with a release
//! store) and user space consumes up to `data_tail` (which only we write).
//! Records wrap around the data area, so a copy may have to stitch two
//! slices back together; records are small here (tracepoint samples), so
//! each one is copied out into a caller-provided buffer.

use std::fs::File;
use std::io;
use std::ptr::{self, addr_of};
use std::sync::atomic::{AtomicU64, Ordering};

use memmap2::MmapRaw;
use perf_event_open_sys::bindings::{perf_event_header, perf_event_mmap_page};

use crate::check_errno_syscall;

/// Size of the on-ring record header: type, misc, size.
const HEADER_SIZE: usize = std::mem::size_of::<perf_event_header>();

pub(crate) struct RingBuffer {
    mmap: MmapRaw,
}

impl RingBuffer {
    /// Map a ring of `data_pages` (rounded up to a power of two) plus the
    /// control page over a perf event fd.
    pub(crate) fn new(file: &File, data_pages: usize) -> io::Result<RingBuffer> {
        let page_size =
            check_errno_syscall(|| unsafe { libc::sysconf(libc::_SC_PAGESIZE) })? as usize;
        let len = page_size * (1 + data_pages.next_power_of_two().max(1));
        let mmap = memmap2::MmapOptions::new().len(len).map_raw(file)?;
        Ok(RingBuffer { mmap })
    }

    fn page(&self) -> *const perf_event_mmap_page {
        self.mmap.as_ptr() as *const perf_event_mmap_page
    }

    /// Pop the next record, copying its payload (header excluded) into
    /// `payload`. Returns the record type, or `None` when the ring is empty.
    pub(crate) fn next_record(&mut self, payload: &mut Vec<u8>) -> Option<u32> {
        let page = self.page();

        // SAFETY: page points at the live control page; data_tail is only
        // ever written from this side, so a plain read is fine. The acquire
        // load of data_head pairs with the kernel's release store and makes
        // the records up to head visible.
        let (tail, head, data_offset, data_size) = unsafe {
            (
                ptr::read(addr_of!((*page).data_tail)),
                (*(addr_of!((*page).data_head) as *const AtomicU64)).load(Ordering::Acquire),
                ptr::read(addr_of!((*page).data_offset)),
                ptr::read(addr_of!((*page).data_size)),
            )
        };
        if tail == head || data_size == 0 {
            return None;
        }

        // SAFETY: perf_event_open guarantees data_offset/data_size lie
        // within the mapping.
        let data = unsafe { self.mmap.as_ptr().add(data_offset as usize) };

        let mut header = [0_u8; HEADER_SIZE];
        copy_wrapped(data, data_size, tail, &mut header);
        let ty = u32::from_ne_bytes(header[0..4].try_into().unwrap());
        let size = u16::from_ne_bytes(header[6..8].try_into().unwrap()) as usize;
        if size < HEADER_SIZE {
            // A corrupt header would otherwise wedge the ring; drop
            // everything buffered and resynchronize at head.
            unsafe {
                (*(addr_of!((*page).data_tail) as *const AtomicU64))
                    .store(head, Ordering::Release);
            }
            return None;
        }

        payload.resize(size - HEADER_SIZE, 0);
        copy_wrapped(data, data_size, tail + HEADER_SIZE as u64, payload);

        // SAFETY: the release store publishes that we are done with the
        // bytes up to the new tail, letting the kernel reuse them.
        unsafe {
            (*(addr_of!((*page).data_tail) as *const AtomicU64))
                .store(tail + size as u64, Ordering::Release);
        }
        Some(ty)
    }
}

/// Copy `out.len()` bytes starting at ring position `from`, stitching the
/// wrap-around seam if the record crosses it.
fn copy_wrapped(data: *const u8, data_size: u64, from: u64, out: &mut [u8]) {
    let start = (from % data_size) as usize;
    let first = out.len().min(data_size as usize - start);
    // SAFETY: both ranges are within the data area; `out` is disjoint from
    // the mapping.
    unsafe {
        ptr::copy_nonoverlapping(data.add(start), out.as_mut_ptr(), first);
        if first < out.len() {
            ptr::copy_nonoverlapping(data, out.as_mut_ptr().add(first), out.len() - first);
        }
    }
}
