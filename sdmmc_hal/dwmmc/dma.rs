//! Descriptor ring for the internal DMA controller (IDMAC).
//!
//! The ring is a fixed array of chained descriptors, the last one linking back
//! to the first. Software fills entries and hands them to the IDMAC by setting
//! the OWN bit; the IDMAC clears it once the buffer has been moved. Transfers
//! longer than the ring are streamed by refilling entries as they come back.

use core::sync::atomic::{AtomicU32, Ordering};

use crate::hw::SdmmcHardware;

/// Bytes one descriptor can carry
pub const DMA_MAX_BUF_LEN: usize = 4092;
pub const DMA_ALIGNMENT: usize = 4;
/// Descriptor count used unless the host is instantiated with another one
pub const DMA_DESC_CNT: usize = 4;

// Descriptor word 0. Disable-interrupt-on-completion (bit 1) is never set:
// the refill path relies on RI/TI for every entry, the final one included.
const DESC_LAST: u32 = 1 << 2; // Last descriptor of the transfer
const DESC_FIRST: u32 = 1 << 3; // First descriptor of the transfer
const DESC_CHAINED: u32 = 1 << 4; // Second address holds the next descriptor
const DESC_OWN: u32 = 1 << 31; // Owned by the IDMAC

// Descriptor word 1
const DESC_BUF1_SIZE_MASK: u32 = 0x1FFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescOwner {
    Cpu,
    Dma,
}

/// One IDMAC descriptor, laid out as the hardware reads it.
#[repr(C, align(4))]
#[derive(Debug)]
pub struct DmaDescriptor {
    status: AtomicU32,
    sizes: u32,
    buffer1: usize,
    next: usize,
}

impl DmaDescriptor {
    const fn new() -> Self {
        DmaDescriptor {
            status: AtomicU32::new(0),
            sizes: 0,
            buffer1: 0,
            next: 0,
        }
    }

    /// Ownership as last written by either side
    pub fn owner(&self) -> DescOwner {
        if self.status.load(Ordering::Acquire) & DESC_OWN != 0 {
            DescOwner::Dma
        } else {
            DescOwner::Cpu
        }
    }

    pub fn is_last(&self) -> bool {
        self.status.load(Ordering::Acquire) & DESC_LAST != 0
    }

    fn clear(&mut self) {
        self.sizes = 0;
        self.buffer1 = 0;
        self.next = 0;
        self.status.store(0, Ordering::Release);
    }

    /// Point the entry at `len` bytes from `addr` and give it to the IDMAC.
    ///
    /// The ownership bit is published last so the IDMAC never sees a half
    /// written entry.
    fn arm(&mut self, addr: usize, len: usize, first: bool, last: bool, next: usize) {
        // The IDMAC moves whole words
        let size = (len + DMA_ALIGNMENT - 1) & !(DMA_ALIGNMENT - 1);
        self.sizes = size as u32 & DESC_BUF1_SIZE_MASK;
        self.buffer1 = addr;
        self.next = next;

        let mut status = DESC_CHAINED | DESC_OWN;
        if first {
            status |= DESC_FIRST;
        }
        if last {
            status |= DESC_LAST;
        }
        self.status.store(status, Ordering::Release);
    }
}

// What the IDMAC reads, used by the hardware model
#[cfg(test)]
impl DmaDescriptor {
    const DIC: u32 = 1 << 1;

    /// Whether completing this entry raises RI/TI
    pub(crate) fn interrupts_on_completion(&self) -> bool {
        self.status.load(Ordering::Acquire) & Self::DIC == 0
    }

    pub(crate) fn is_first(&self) -> bool {
        self.status.load(Ordering::Acquire) & DESC_FIRST != 0
    }

    /// Buffer address and length the entry points at
    pub(crate) fn buffer(&self) -> (usize, usize) {
        (self.buffer1, (self.sizes & DESC_BUF1_SIZE_MASK) as usize)
    }

    pub(crate) fn next_addr(&self) -> usize {
        self.next
    }

    /// Return the entry to the CPU, as the IDMAC does after moving its buffer
    pub(crate) fn release(&self) {
        self.status.fetch_and(!DESC_OWN, Ordering::Release);
    }
}

/// Ring of `N` descriptors plus the software cursor for the transfer in progress.
#[derive(Debug)]
pub struct DmaRing<const N: usize> {
    desc: [DmaDescriptor; N],
    // Next entry software will fill
    next_desc: usize,
    size_remaining: usize,
    ptr: usize,
    first_pending: bool,
}

impl<const N: usize> DmaRing<N> {
    pub fn new() -> Self {
        DmaRing {
            desc: core::array::from_fn(|_| DmaDescriptor::new()),
            next_desc: 0,
            size_remaining: 0,
            ptr: 0,
            first_pending: false,
        }
    }

    /// Address the IDMAC starts walking from
    pub fn base_addr(&self) -> usize {
        self.desc.as_ptr() as usize
    }

    fn desc_addr(&self, index: usize) -> usize {
        &self.desc[index] as *const DmaDescriptor as usize
    }

    pub fn size_remaining(&self) -> usize {
        self.size_remaining
    }

    pub fn descriptor(&self, index: usize) -> &DmaDescriptor {
        &self.desc[index]
    }

    /// Entries currently handed to the IDMAC
    pub fn dma_owned(&self) -> usize {
        self.desc
            .iter()
            .filter(|desc| desc.owner() == DescOwner::Dma)
            .count()
    }

    /// Start a new transfer of `len` bytes at `addr` and fill the whole ring.
    pub fn prepare(&mut self, addr: usize, len: usize) {
        for desc in self.desc.iter_mut() {
            desc.clear();
        }
        self.next_desc = 0;
        self.size_remaining = len;
        self.ptr = addr;
        self.first_pending = true;
        self.fill(N);
    }

    /// Arm up to `n` entries from the cursor with the next chunks of the
    /// transfer. Returns how many entries were armed.
    pub fn fill(&mut self, n: usize) -> usize {
        let mut armed = 0;
        while armed < n.min(N) && self.size_remaining > 0 {
            let index = self.next_desc;
            if self.desc[index].owner() == DescOwner::Dma {
                break;
            }

            let chunk = self.size_remaining.min(DMA_MAX_BUF_LEN);
            let last = chunk == self.size_remaining;
            let first = core::mem::take(&mut self.first_pending);
            let next = if last {
                0
            } else {
                self.desc_addr((index + 1) % N)
            };
            self.desc[index].arm(self.ptr, chunk, first, last, next);

            self.size_remaining -= chunk;
            self.ptr += chunk;
            self.next_desc = (index + 1) % N;
            armed += 1;
        }
        armed
    }

    /// Entries the IDMAC has handed back since the cursor, ready to be refilled.
    ///
    /// Counting stops at the first entry still owned by the IDMAC and after an
    /// entry marked last.
    pub fn free_count(&self) -> usize {
        let mut count = 0;
        let mut index = self.next_desc;
        while count < N {
            let desc = &self.desc[index];
            if desc.owner() == DescOwner::Dma {
                break;
            }
            count += 1;
            if desc.is_last() {
                break;
            }
            index = (index + 1) % N;
        }
        count
    }

    /// Reset the IDMAC and take every entry back. Safe to call repeatedly.
    pub fn stop<H: SdmmcHardware + ?Sized>(&mut self, hw: &H) {
        hw.dma_stop();
        for desc in self.desc.iter_mut() {
            desc.clear();
        }
        self.size_remaining = 0;
        self.ptr = 0;
        self.next_desc = 0;
        self.first_pending = false;
    }

    /// Make the IDMAC re-read the descriptor it stalled on
    pub fn resume<H: SdmmcHardware + ?Sized>(&self, hw: &H) {
        hw.dma_resume();
    }
}

impl<const N: usize> Default for DmaRing<N> {
    fn default() -> Self {
        Self::new()
    }
}
