//! Linear memory split into three disjoint regions.
//!
//! Guests produced by C/C++ toolchains touch both low addresses (data,
//! heap) and very high addresses (stack placed near the top), with a huge
//! untouched gap in between. Instead of committing the whole 4 GiB address
//! space, memory is kept as:
//!
//! - *lower*: a contiguous buffer growing up from address 0;
//! - *upper*: a window `[begin, end)` floating high in the address space,
//!   grown outward on demand and merged into lower once the two approach
//!   each other;
//! - *arguments*: a fixed-base buffer at [`ARGUMENTS_BASE`] holding the
//!   host-supplied argv block.
//!
//! The regions never overlap; worst-case commitment is bounded by the
//! guest's working set, not by its address spread.

use memory_units::wasm32::Pages;
use memory_units::Bytes;

/// Size of a linear memory page: 64 KiB.
pub const LINEAR_MEMORY_PAGE_SIZE: Bytes = Bytes(65536);

/// Guest address where the host places argv strings and the pointer array.
pub const ARGUMENTS_BASE: u32 = 0xff00_0000;

/// Page count may never reach the arguments region.
pub const MAX_PAGES: u32 = ARGUMENTS_BASE / LINEAR_MEMORY_PAGE_SIZE.0 as u32;

/// Ceiling for the arguments region, one past the 32-bit address space.
const ADDRESS_SPACE_END: usize = 0x1_0000_0000;

/// Growable zero-filled byte buffer; the committed prefix of a region.
///
/// Indexed access past the end commits more bytes (doubling, never
/// shrinking). Callers that need strict bounds check before asking.
#[derive(Debug)]
pub struct ByteBuf {
    bytes: Vec<u8>,
}

impl ByteBuf {
    pub fn new() -> ByteBuf {
        ByteBuf { bytes: Vec::new() }
    }

    /// Number of committed (zero-initialised) bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn grow_to(&mut self, needed: usize) {
        if needed <= self.bytes.len() {
            return;
        }
        let mut cap = self.bytes.len().max(256);
        while cap < needed {
            cap *= 2;
        }
        self.bytes.resize(cap, 0);
    }

    /// Mutable view of `[offset, offset + len)`, committing as needed.
    pub fn slice_grow(&mut self, offset: usize, len: usize) -> &mut [u8] {
        self.grow_to(offset + len);
        &mut self.bytes[offset..offset + len]
    }

    pub fn slice(&self, offset: usize, len: usize) -> Option<&[u8]> {
        self.bytes.get(offset..offset + len)
    }

    pub fn slice_mut(&mut self, offset: usize, len: usize) -> Option<&mut [u8]> {
        self.bytes.get_mut(offset..offset + len)
    }
}

/// Buffer serving a `[begin, end)` window of a wider address space.
///
/// Growth rounds outward to a multiple of `inc` so that scattered writes do
/// not trigger a reallocation each; `inc` doubles (capped) every time the
/// window moves on an even boundary, keeping total copy work linear.
#[derive(Debug)]
pub struct SplitBuf {
    begin: usize,
    end: usize,
    inc: usize,
    bytes: Vec<u8>,
}

const SPLIT_BUF_FIRST_INC: usize = 0x1000;
const SPLIT_BUF_MAX_INC: usize = 0x2000_0000;

impl SplitBuf {
    pub fn new() -> SplitBuf {
        SplitBuf {
            begin: 0,
            end: 0,
            inc: 0,
            bytes: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.end == 0
    }

    pub fn begin(&self) -> usize {
        self.begin
    }

    pub fn end(&self) -> usize {
        self.end
    }

    pub fn committed(&self) -> usize {
        self.end - self.begin
    }

    pub fn clear(&mut self) {
        self.begin = 0;
        self.end = 0;
        self.inc = 0;
        self.bytes = Vec::new();
    }

    /// Contents of the window, for merging into another region.
    pub fn window(&self) -> &[u8] {
        &self.bytes
    }

    /// Grow the window so it covers `[addr, addr + len)`, clamped to
    /// `[min, max)`. Existing content keeps its logical placement.
    pub fn grow(&mut self, addr: usize, len: usize, min: usize, max: usize) {
        let mut begin = addr.max(min);
        let mut end = (addr + len).min(max);
        debug_assert!(begin < end);

        if begin >= self.begin && end < self.end {
            return;
        }

        if self.inc == 0 {
            self.inc = SPLIT_BUF_FIRST_INC;
        }

        begin = (begin / self.inc) * self.inc;
        end = (end).div_ceil(self.inc) * self.inc;

        if begin < min || end > max {
            begin = begin.max(min);
            end = end.min(max);
        } else if self.inc < SPLIT_BUF_MAX_INC {
            // Landed on an even boundary; coarsen the next rounding.
            self.inc *= 2;
        }

        if self.bytes.is_empty() {
            self.bytes = vec![0; end - begin];
        } else {
            // Never shrink an established window.
            begin = begin.min(self.begin);
            end = end.max(self.end);
            let mut grown = vec![0; end - begin];
            let move_to = self.begin - begin;
            grown[move_to..move_to + self.bytes.len()].copy_from_slice(&self.bytes);
            self.bytes = grown;
        }
        self.begin = begin;
        self.end = end;
    }

    pub fn slice_mut(&mut self, addr: usize, len: usize) -> &mut [u8] {
        let at = addr - self.begin;
        &mut self.bytes[at..at + len]
    }
}

/// One instance's linear memory.
#[derive(Debug)]
pub struct LinearMemory {
    current_pages: u32,
    maximum_pages: u32,
    lower: ByteBuf,
    upper: SplitBuf,
    arguments: ByteBuf,
}

/// Accesses ending below this stay in lower memory even when lower has not
/// grown that far yet.
const LOWER_CUT: usize = 0xf000;

impl LinearMemory {
    pub fn new() -> LinearMemory {
        LinearMemory {
            current_pages: 0,
            maximum_pages: MAX_PAGES,
            lower: ByteBuf::new(),
            upper: SplitBuf::new(),
            arguments: ByteBuf::new(),
        }
    }

    pub fn set_limits(&mut self, initial: u32, maximum: u32) {
        self.current_pages = initial;
        self.maximum_pages = maximum;
    }

    pub fn current_pages(&self) -> Pages {
        Pages(self.current_pages as usize)
    }

    pub fn maximum_pages(&self) -> Pages {
        Pages(self.maximum_pages as usize)
    }

    /// Current size in bytes as recorded by the page count. Commitment is
    /// lazy; this is the bound the translator enforces, not bytes allocated.
    pub fn byte_size(&self) -> usize {
        Bytes::from(Pages(self.current_pages as usize)).0
    }

    /// `memory.grow`: record the new page count, return the previous one,
    /// or `None` when the request passes the declared maximum.
    pub fn grow_pages(&mut self, additional: u32) -> Option<u32> {
        let previous = self.current_pages;
        let grown = previous.checked_add(additional)?;
        if grown > self.maximum_pages {
            return None;
        }
        self.current_pages = grown;
        Some(previous)
    }

    /// Overwrite the recorded page count, clamped to the absolute page
    /// limit. Used by hosts that manage the heap for the guest.
    pub fn set_current_pages(&mut self, pages: u32) {
        let clamped = pages.min(MAX_PAGES);
        if clamped > self.maximum_pages {
            tracing::warn!(
                pages = clamped,
                maximum = self.maximum_pages,
                "page count pushed past the declared maximum"
            );
        }
        self.current_pages = clamped;
    }

    /// Bytes actually committed across all regions.
    pub fn committed_bytes(&self) -> usize {
        self.lower.len() + self.upper.committed() + self.arguments.len()
    }

    pub fn lower_committed(&self) -> usize {
        self.lower.len()
    }

    pub fn upper_window(&self) -> Option<(usize, usize)> {
        if self.upper.is_empty() {
            None
        } else {
            Some((self.upper.begin(), self.upper.end()))
        }
    }

    pub fn arguments_len(&self) -> usize {
        self.arguments.len()
    }

    /// Direct access to the arguments region, `offset` relative to
    /// [`ARGUMENTS_BASE`]. Grows on demand.
    pub fn arguments_slice(&mut self, offset: usize, len: usize) -> &mut [u8] {
        self.arguments.slice_grow(offset, len)
    }

    fn merge_upper_into_lower(&mut self) {
        debug_assert!(self.lower.len() <= self.upper.begin());
        let (begin, end) = (self.upper.begin(), self.upper.end());
        self.lower.grow_to(end);
        self.lower
            .slice_grow(begin, end - begin)
            .copy_from_slice(self.upper.window());
        self.upper.clear();
    }

    /// Translate a guest range to a host slice, growing regions lazily.
    ///
    /// `None` means the range is not representable: it crosses the
    /// arguments base, exceeds the recorded page count, or runs past the
    /// end of the arguments region.
    pub fn translate(&mut self, addr: u32, len: usize) -> Option<&mut [u8]> {
        let addr = addr as usize;
        let end = addr + len;

        if end <= self.lower.len() {
            return Some(self.lower.slice_mut(addr, len).expect("range is committed"));
        }

        if !self.upper.is_empty() && addr >= self.upper.begin() && end <= self.upper.end() {
            return Some(self.upper.slice_mut(addr, len));
        }

        let args_base = ARGUMENTS_BASE as usize;
        if addr >= args_base && end <= args_base + self.arguments.len() {
            return self.arguments.slice_mut(addr - args_base, len);
        }

        // The range is not in committed memory; some region has to grow.

        if !self.upper.is_empty()
            && (self.lower.len() >= self.upper.begin() || addr > 4 * self.upper.end())
        {
            // Lower caught up with upper, or upper is far below the access
            // and mostly stale either way.
            self.merge_upper_into_lower();
        }

        if end <= LOWER_CUT || addr <= 2 * self.lower.len() {
            if !self.upper.is_empty()
                && (end >= self.upper.begin() || self.lower.len() * 2 >= self.upper.begin())
            {
                self.merge_upper_into_lower();
            }
            Some(self.lower.slice_grow(addr, len))
        } else if end <= self.byte_size() {
            let min = self.lower.len();
            let max = self.byte_size();
            self.upper.grow(addr, len, min, max);
            Some(self.upper.slice_mut(addr, len))
        } else if addr >= args_base && end <= ADDRESS_SPACE_END {
            Some(self.arguments.slice_grow(addr - args_base, len))
        } else {
            None
        }
    }

    pub fn load_bytes<const N: usize>(&mut self, addr: u32) -> Option<[u8; N]> {
        let slice = self.translate(addr, N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(slice);
        Some(out)
    }

    pub fn store_bytes(&mut self, addr: u32, bytes: &[u8]) -> Option<()> {
        let slice = self.translate(addr, bytes.len())?;
        slice.copy_from_slice(bytes);
        Some(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_buf_grows_doubling_and_zero_filled() {
        let mut buf = ByteBuf::new();
        buf.slice_grow(10, 4).copy_from_slice(&[1, 2, 3, 4]);
        assert!(buf.len() >= 14);
        assert_eq!(buf.slice(0, 10).unwrap(), &[0u8; 10][..]);
        let before = buf.len();
        buf.grow_to(before + 1);
        assert!(buf.len() >= 2 * before);
    }

    #[test]
    fn split_buf_preserves_placement_across_growth() {
        let mut buf = SplitBuf::new();
        buf.grow(0x100_000, 4, 0, usize::MAX);
        buf.slice_mut(0x100_000, 4).copy_from_slice(&[9, 9, 9, 9]);
        buf.grow(0xf0_000, 1, 0, usize::MAX);
        assert!(buf.begin() <= 0xf0_000);
        assert_eq!(buf.slice_mut(0x100_000, 4), &[9, 9, 9, 9]);
    }

    #[test]
    fn split_buf_rounds_to_increment() {
        let mut buf = SplitBuf::new();
        buf.grow(0x12_345, 1, 0, usize::MAX);
        assert_eq!(buf.begin() % SPLIT_BUF_FIRST_INC, 0);
        assert_eq!(buf.end() % SPLIT_BUF_FIRST_INC, 0);
    }

    #[test]
    fn translate_low_addresses_use_lower() {
        let mut mem = LinearMemory::new();
        mem.set_limits(2, MAX_PAGES);
        mem.store_bytes(0x10, &[0xaa]).unwrap();
        assert_eq!(mem.load_bytes::<1>(0x10), Some([0xaa]));
        assert!(mem.upper_window().is_none());
    }

    #[test]
    fn translate_high_addresses_open_upper_window() {
        let mut mem = LinearMemory::new();
        mem.set_limits(MAX_PAGES, MAX_PAGES);
        mem.store_bytes(0x10, &[1]).unwrap();
        mem.store_bytes(0xfe00_0000, &[2]).unwrap();
        let (begin, end) = mem.upper_window().unwrap();
        assert!(begin <= 0xfe00_0000 && 0xfe00_0001 <= end);
        // Regions stay disjoint.
        assert!(mem.lower_committed() <= begin);
        assert_eq!(mem.load_bytes::<1>(0x10), Some([1]));
        assert_eq!(mem.load_bytes::<1>(0xfe00_0000), Some([2]));
    }

    #[test]
    fn translate_rejects_past_page_count() {
        let mut mem = LinearMemory::new();
        mem.set_limits(1, 1);
        assert!(mem.translate(0x2_0000, 4).is_none());
    }

    #[test]
    fn grow_pages_reports_previous_size_and_respects_maximum() {
        let mut mem = LinearMemory::new();
        mem.set_limits(2, 4);
        assert_eq!(mem.grow_pages(1), Some(2));
        assert_eq!(mem.current_pages(), Pages(3));
        assert_eq!(mem.grow_pages(2), None);
        assert_eq!(mem.current_pages(), Pages(3));
        // Newly recorded pages are loadable.
        assert_eq!(mem.load_bytes::<1>(0x2_0008), Some([0]));
    }

    #[test]
    fn arguments_region_is_fixed_base() {
        let mut mem = LinearMemory::new();
        mem.set_limits(1, MAX_PAGES);
        mem.arguments_slice(0, 4).copy_from_slice(&[1, 2, 3, 4]);
        assert_eq!(mem.load_bytes::<4>(ARGUMENTS_BASE), Some([1, 2, 3, 4]));
        // A range crossing out of the address space is unrepresentable.
        assert!(mem.translate(0xffff_ffff, 2).is_none());
    }
}
