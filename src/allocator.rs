//! The block-pool allocator of executable memory.
//!
//! Implementation notes:
//!
//! - Granularity of allocated regions is different from the granularity of a
//!   typical C malloc. The allocator can also use several memory pools having
//!   a different granularity to minimize its own maintenance overhead; the
//!   multiple-pools feature requires
//!   [use_multiple_pools](JitAllocatorOptions::use_multiple_pools).
//!
//! - The allocator doesn't store any information in the executable memory
//!   itself. Each block carries two bit vectors instead: 'used' tracks
//!   occupied slots (one bit per granule) and 'stop' marks the last slot of
//!   each live allocation, so the extent of an allocation can be recovered
//!   from its start.
//!
//! - An ordered map keyed by RX address tracks all blocks across all pools,
//!   so [release](JitAllocator::release), [shrink](JitAllocator::shrink) and
//!   [query](JitAllocator::query) can find the owning block of any pointer
//!   in logarithmic time.

use std::collections::BTreeMap;
use std::mem::size_of;
use std::sync::{Mutex, MutexGuard, PoisonError};

use log::debug;

use crate::util::{
    align_up, bit_vector_clear, bit_vector_fill, bit_vector_get_bit, bit_vector_index_of,
    bit_vector_set_bit, BitVectorRangeIterator, BIT_WORD_SIZE,
};
use crate::virtual_memory as vm;
use crate::virtual_memory::{DualMapping, MemoryFlags, ProtectJitReadWriteScope};
use crate::Error;

/// Number of pools when
/// [use_multiple_pools](JitAllocatorOptions::use_multiple_pools) is enabled.
/// Each pool doubles the granularity of the previous one.
const MULTI_POOL_COUNT: usize = 3;

/// Minimum granularity (and the default granularity of pool #0).
const BASE_GRANULARITY: u32 = 64;

/// Soft cap on the size of a newly created block (the block size doubles
/// until it reaches this).
const MAX_BLOCK_SIZE: usize = 32 * 1024 * 1024;

fn default_fill_pattern() -> u32 {
    // 4x 'int3' on X86/X86_64, nothing special elsewhere.
    if cfg!(any(target_arch = "x86", target_arch = "x86_64")) {
        0xCCCC_CCCC
    } else {
        0
    }
}

/// Options given to [JitAllocator::new].
///
/// Sizes set to zero (the default) are replaced by platform defaults; values
/// outside the supported range or not a power of two are silently replaced
/// as well.
#[derive(Debug, Clone, Copy)]
pub struct JitAllocatorOptions {
    /// Maps the memory of each block twice: one view with read+execute
    /// permissions and a second view with read+write permissions, backed by
    /// the same physical pages.
    ///
    /// Dual mapping is turned on automatically when the process runs under a
    /// hardened runtime that enforces `W^X` and provides no `MAP_JIT`-style
    /// escape, so setting this flag forces dual mapping even where RWX pages
    /// could be allocated directly.
    pub use_dual_mapping: bool,
    /// Enables multiple pools with increasing granularity instead of a
    /// single pool: 3 pools with granularities `g`, `2g` and `4g`.
    ///
    /// Only recommended when a lot of code is generated: the allocator needs
    /// to create more blocks up front before the variable granularity pays
    /// off.
    pub use_multiple_pools: bool,
    /// Always fill reserved memory with the fill pattern: new blocks are
    /// cleared on creation and released regions are cleared before they can
    /// be reused.
    pub fill_unused_memory: bool,
    /// Release a block back to the operating system as soon as it becomes
    /// empty. Without this flag the allocator keeps one empty block per pool
    /// to dampen repeated map/unmap cycles caused by an alloc/release
    /// ping-pong at a block boundary.
    pub immediate_release: bool,
    /// Do not reserve the first granule of each block. By default the first
    /// granule is kept as padding so that no allocation ever starts at the
    /// very beginning of a mapping.
    pub disable_initial_padding: bool,
    /// The 32-bit pattern used by
    /// [fill_unused_memory](Self::fill_unused_memory). When not provided, an
    /// architecture-specific trap pattern is used.
    pub custom_fill_pattern: Option<u32>,
    /// Size of a block in bytes, a power of two in
    /// `[64 KiB, 256 MiB]`. Zero picks the virtual-memory allocation
    /// granularity.
    pub block_size: usize,
    /// Allocation granularity of pool #0, a power of two in `[64, 256]`.
    /// Zero picks 64.
    pub granularity: u32,
}

impl Default for JitAllocatorOptions {
    fn default() -> Self {
        Self {
            use_dual_mapping: true,
            use_multiple_pools: true,
            fill_unused_memory: true,
            immediate_release: false,
            disable_initial_padding: false,
            custom_fill_pattern: None,
            block_size: 0,
            granularity: 0,
        }
    }
}

/// Reset behavior, see [JitAllocator::reset].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetPolicy {
    /// Keep one wiped block per pool to serve future allocations without a
    /// new mapping (unless
    /// [immediate_release](JitAllocatorOptions::immediate_release) is set).
    Soft,
    /// Release every block.
    Hard,
}

/// A point-in-time snapshot of allocator counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Statistics {
    /// Number of blocks across all pools.
    pub block_count: usize,
    /// Number of live allocations.
    pub allocation_count: usize,
    /// Bytes in use out of `reserved_size` (including initial padding).
    pub used_size: usize,
    /// Bytes of virtual memory reserved by all blocks.
    pub reserved_size: usize,
    /// Bookkeeping bytes allocated on the regular heap (block records and
    /// bit vectors).
    pub overhead_size: usize,
}

impl Statistics {
    pub fn unused_size(&self) -> usize {
        self.reserved_size - self.used_size
    }

    pub fn used_size_as_percent(&self) -> f64 {
        (self.used_size as f64 * 100.0) / self.reserved_size.max(1) as f64
    }

    pub fn unused_size_as_percent(&self) -> f64 {
        (self.unused_size() as f64 * 100.0) / self.reserved_size.max(1) as f64
    }

    pub fn overhead_size_as_percent(&self) -> f64 {
        (self.overhead_size as f64 * 100.0) / self.reserved_size.max(1) as f64
    }
}

// Block flags. INITIAL_PADDING is deliberately bit 0: its numeric value is
// the index of the first usable slot.
const BLOCK_FLAG_INITIAL_PADDING: u32 = 0x0000_0001;
const BLOCK_FLAG_EMPTY: u32 = 0x0000_0002;
const BLOCK_FLAG_DIRTY: u32 = 0x0000_0004;
const BLOCK_FLAG_DUAL_MAPPED: u32 = 0x0000_0008;

/// A single virtual-memory mapping subdivided into slots, with 'used' and
/// 'stop' bit vectors tracking live allocations.
///
/// The cached `search_start..search_end` window bounds where any free slot
/// may live and `largest_unused_area` caches the longest free run. After an
/// operation that can make them stale the block is flagged dirty and the
/// next allocation scan recomputes them.
struct Block {
    pool_id: usize,
    mapping: DualMapping,
    block_size: usize,

    flags: u32,
    /// Size of the block area in slots (bits of each bit vector).
    area_size: u32,
    /// Slots in use, including the initial padding slot.
    area_used: u32,
    /// Longest free run, possibly stale when dirty (never an overestimate
    /// once recomputed).
    largest_unused_area: u32,
    search_start: u32,
    search_end: u32,

    /// Both bit vectors in one allocation: `used` occupies the first
    /// `bit_word_count` words, `stop` the rest.
    bit_word_count: u32,
    bit_words: Box<[u32]>,
}

impl Block {
    fn rx_ptr(&self) -> *const u8 {
        self.mapping.rx
    }

    fn rw_ptr(&self) -> *mut u8 {
        self.mapping.rw
    }

    fn has_flag(&self, flag: u32) -> bool {
        self.flags & flag != 0
    }

    fn add_flags(&mut self, flags: u32) {
        self.flags |= flags;
    }

    fn clear_flags(&mut self, flags: u32) {
        self.flags &= !flags;
    }

    fn initial_area_start(&self) -> u32 {
        self.flags & BLOCK_FLAG_INITIAL_PADDING
    }

    fn is_empty_block(&self) -> bool {
        self.has_flag(BLOCK_FLAG_EMPTY)
    }

    fn is_dirty(&self) -> bool {
        self.has_flag(BLOCK_FLAG_DIRTY)
    }

    fn area_available(&self) -> u32 {
        self.area_size - self.area_used
    }

    fn used_bits(&self) -> &[u32] {
        &self.bit_words[..self.bit_word_count as usize]
    }

    fn stop_bits(&self) -> &[u32] {
        &self.bit_words[self.bit_word_count as usize..]
    }

    fn used_and_stop_bits_mut(&mut self) -> (&mut [u32], &mut [u32]) {
        self.bit_words.split_at_mut(self.bit_word_count as usize)
    }

    /// Wipes all bookkeeping: both bit vectors are zeroed (except the
    /// optional padding slot) and the search window spans the whole area.
    fn clear_block(&mut self) {
        let padding = self.initial_area_start() != 0;

        self.bit_words.fill(0);
        if padding {
            let (used, stop) = self.used_and_stop_bits_mut();
            bit_vector_set_bit(used, 0, true);
            bit_vector_set_bit(stop, 0, true);
        }

        let start = self.initial_area_start();
        self.area_used = start;
        self.largest_unused_area = self.area_size - start;
        self.search_start = start;
        self.search_end = self.area_size;

        self.add_flags(BLOCK_FLAG_EMPTY);
        self.clear_flags(BLOCK_FLAG_DIRTY);
    }

    fn mark_allocated_area(&mut self, area_start: u32, area_end: u32) {
        let area_size = area_end - area_start;

        // Mark the allocated slots as occupied and set the sentinel.
        let (used, stop) = self.used_and_stop_bits_mut();
        bit_vector_fill(used, area_start as usize, area_size as usize);
        bit_vector_set_bit(stop, area_end as usize - 1, true);

        self.area_used += area_size;

        if self.area_available() == 0 {
            // Full: there is no free slot to search for.
            self.search_start = self.area_size;
            self.search_end = 0;
            self.largest_unused_area = 0;
            self.clear_flags(BLOCK_FLAG_DIRTY | BLOCK_FLAG_EMPTY);
        } else {
            if self.search_start == area_start {
                self.search_start = area_end;
            }
            if self.search_end == area_end {
                self.search_end = area_start;
            }
            self.add_flags(BLOCK_FLAG_DIRTY);
            self.clear_flags(BLOCK_FLAG_EMPTY);
        }
    }

    fn mark_released_area(&mut self, area_start: u32, area_end: u32) {
        let area_size = area_end - area_start;

        let (used, stop) = self.used_and_stop_bits_mut();
        bit_vector_clear(used, area_start as usize, area_size as usize);
        bit_vector_set_bit(stop, area_end as usize - 1, false);

        self.area_used -= area_size;
        self.search_start = self.search_start.min(area_start);
        self.search_end = self.search_end.max(area_end);

        if self.area_used == self.initial_area_start() {
            self.search_start = self.initial_area_start();
            self.search_end = self.area_size;
            self.largest_unused_area = self.area_size - self.initial_area_start();
            self.add_flags(BLOCK_FLAG_EMPTY);
            self.clear_flags(BLOCK_FLAG_DIRTY);
        } else {
            self.add_flags(BLOCK_FLAG_DIRTY);
        }
    }

    fn mark_shrunk_area(&mut self, area_start: u32, area_end: u32) {
        let area_size = area_end - area_start;

        // A shrunk area cannot start at zero: shrinking the whole
        // allocation to nothing is a release, not a shrink.
        debug_assert!(area_start != 0);
        debug_assert!(area_end > area_start);

        // Unmark the tail and move the sentinel to the retained prefix.
        let (used, stop) = self.used_and_stop_bits_mut();
        bit_vector_clear(used, area_start as usize, area_size as usize);
        bit_vector_set_bit(stop, area_end as usize - 1, false);
        bit_vector_set_bit(stop, area_start as usize - 1, true);

        self.area_used -= area_size;
        self.search_start = self.search_start.min(area_start);
        self.search_end = self.search_end.max(area_end);

        self.add_flags(BLOCK_FLAG_DIRTY);
    }
}

impl Drop for Block {
    fn drop(&mut self) {
        if self.mapping.rx.is_null() {
            return;
        }

        if self.has_flag(BLOCK_FLAG_DUAL_MAPPED) {
            let _ = vm::release_dual_mapping(&mut self.mapping, self.block_size);
        } else {
            let _ = vm::release(self.mapping.rx as *mut u8, self.block_size);
        }
    }
}

/// A collection of blocks sharing one slot granularity.
struct Pool {
    /// RX keys of this pool's blocks in insertion order, walked as a ring.
    blocks: Vec<usize>,
    /// Index of the block where the next allocation scan starts.
    cursor: usize,
    granularity: u32,
    granularity_log2: u32,
    /// Count of retained empty blocks, either 0 or 1.
    empty_block_count: u32,

    /// Slots reserved across all blocks.
    total_area_size: usize,
    /// Slots used across all blocks.
    total_area_used: usize,
    /// Heap overhead of all blocks in bytes.
    total_overhead_bytes: usize,
}

impl Pool {
    fn new(granularity: u32) -> Self {
        Self {
            blocks: Vec::new(),
            cursor: 0,
            granularity,
            granularity_log2: granularity.trailing_zeros(),
            empty_block_count: 0,
            total_area_size: 0,
            total_area_used: 0,
            total_overhead_bytes: 0,
        }
    }

    fn reset(&mut self) {
        self.blocks.clear();
        self.cursor = 0;
        self.empty_block_count = 0;
        self.total_area_size = 0;
        self.total_area_used = 0;
        self.total_overhead_bytes = 0;
    }

    fn byte_size_from_area_size(&self, area_size: u32) -> usize {
        area_size as usize * self.granularity as usize
    }

    fn area_size_from_byte_size(&self, size: usize) -> u32 {
        ((size + self.granularity as usize - 1) >> self.granularity_log2) as u32
    }

    fn bit_word_count_from_area_size(area_size: u32) -> u32 {
        (area_size + BIT_WORD_SIZE as u32 - 1) / BIT_WORD_SIZE as u32
    }
}

struct Inner {
    options: JitAllocatorOptions,
    block_size: usize,
    granularity: u32,
    fill_pattern: u32,
    #[allow(dead_code)]
    page_size: u32,
    allocation_count: usize,

    pools: Vec<Pool>,
    /// All blocks of all pools, keyed by the RX address of their mapping.
    tree: BTreeMap<usize, Block>,
}

fn fill_memory(dst: *mut u8, pattern: u32, size: usize) {
    // Sizes are always a multiple of the granularity, hence of 4.
    let words = size / size_of::<u32>();
    let dst = dst.cast::<u32>();
    for i in 0..words {
        unsafe {
            dst.add(i).write(pattern);
        }
    }
}

fn block_by_ptr(tree: &BTreeMap<usize, Block>, ptr: usize) -> Option<(usize, &Block)> {
    let (&rx, block) = tree.range(..=ptr).next_back()?;
    if ptr < rx + block.block_size {
        Some((rx, block))
    } else {
        None
    }
}

fn block_by_ptr_mut(tree: &mut BTreeMap<usize, Block>, ptr: usize) -> Option<(usize, &mut Block)> {
    let (&rx, block) = tree.range_mut(..=ptr).next_back()?;
    if ptr < rx + block.block_size {
        Some((rx, block))
    } else {
        None
    }
}

impl Inner {
    /// Picks the coarsest pool whose granularity divides `size` without
    /// waste. Large requests land in coarse pools (less bit-vector
    /// pressure), small odd sizes stay fine-grained.
    fn size_to_pool_id(&self, size: usize) -> usize {
        let mut pool_id = self.pools.len() - 1;
        let mut granularity = (self.granularity as usize) << pool_id;

        while pool_id != 0 {
            if align_up(size, granularity) == size {
                break;
            }
            pool_id -= 1;
            granularity >>= 1;
        }

        pool_id
    }

    /// Block size for the next block of a pool: the last block's size
    /// doubled (up to the soft cap), or enough to fit an oversized request.
    fn ideal_block_size(&self, pool_id: usize, allocation_size: usize) -> Result<usize, Error> {
        let pool = &self.pools[pool_id];
        let mut block_size = match pool.blocks.last() {
            Some(rx) => self.tree[rx].block_size,
            None => self.block_size,
        };

        let mut allocation_size = allocation_size;
        if !self.options.disable_initial_padding {
            allocation_size = allocation_size.checked_add(64).ok_or(Error::OutOfMemory)?;
        }

        if block_size < MAX_BLOCK_SIZE {
            block_size *= 2;
        }

        if allocation_size > block_size {
            block_size = align_up(allocation_size, self.block_size);
            if block_size < allocation_size {
                return Err(Error::OutOfMemory);
            }
        }

        Ok(block_size)
    }

    fn new_block(&self, pool_id: usize, block_size: usize) -> Result<Block, Error> {
        let pool = &self.pools[pool_id];
        let area_size =
            ((block_size + pool.granularity as usize - 1) >> pool.granularity_log2) as u32;
        let bit_word_count = Pool::bit_word_count_from_area_size(area_size);

        let mut flags = 0;
        if !self.options.disable_initial_padding {
            flags |= BLOCK_FLAG_INITIAL_PADDING;
        }

        let mapping = if self.options.use_dual_mapping {
            flags |= BLOCK_FLAG_DUAL_MAPPED;
            vm::alloc_dual_mapping(block_size, MemoryFlags(MemoryFlags::ACCESS_RWX))?
        } else {
            let ptr = vm::alloc(block_size, MemoryFlags(MemoryFlags::ACCESS_RWX))?;
            DualMapping { rx: ptr, rw: ptr }
        };

        if self.options.fill_unused_memory {
            let _scope = ProtectJitReadWriteScope::new(mapping.rx, block_size);
            fill_memory(mapping.rw, self.fill_pattern, block_size);
        }

        let mut block = Block {
            pool_id,
            mapping,
            block_size,
            flags,
            area_size,
            area_used: 0,
            largest_unused_area: 0,
            search_start: 0,
            search_end: 0,
            bit_word_count,
            bit_words: vec![0u32; bit_word_count as usize * 2].into_boxed_slice(),
        };
        block.clear_block();

        debug!(
            "mapped a {} byte block ({} slots) for pool #{}",
            block_size, area_size, pool_id
        );
        Ok(block)
    }

    /// Links a block into its pool and the index tree, updating counters.
    fn insert_block(&mut self, block: Block) {
        let rx_key = block.mapping.rx as usize;
        let pool = &mut self.pools[block.pool_id];

        pool.blocks.push(rx_key);
        pool.total_area_size += block.area_size as usize;
        pool.total_area_used += block.area_used as usize;
        pool.total_overhead_bytes +=
            size_of::<Block>() + block.bit_words.len() * size_of::<u32>();

        self.tree.insert(rx_key, block);
    }

    /// Unlinks a block from its pool and the index tree. The returned block
    /// releases its mapping on drop.
    fn remove_block(&mut self, rx_key: usize) -> Option<Block> {
        let block = self.tree.remove(&rx_key)?;
        let pool = &mut self.pools[block.pool_id];

        if let Some(position) = pool.blocks.iter().position(|&key| key == rx_key) {
            pool.blocks.remove(position);
            if position < pool.cursor {
                pool.cursor -= 1;
            }
            if pool.cursor >= pool.blocks.len() {
                pool.cursor = 0;
            }
        }

        pool.total_area_size -= block.area_size as usize;
        pool.total_area_used -= block.area_used as usize;
        pool.total_overhead_bytes -=
            size_of::<Block>() + block.bit_words.len() * size_of::<u32>();

        debug!(
            "unmapped a {} byte block of pool #{}",
            block.block_size, block.pool_id
        );
        Some(block)
    }

    /// Overwrites everything a kept block contained and clears its
    /// bookkeeping, leaving it as good as a freshly mapped block.
    fn wipe_out_block(&self, block: &mut Block) {
        if block.is_empty_block() {
            return;
        }

        if self.options.fill_unused_memory {
            let granularity = self.pools[block.pool_id].granularity as usize;

            vm::protect_jit_memory(vm::ProtectJitAccess::ReadWrite);

            // Fill every area that held code and flush its span.
            let it = BitVectorRangeIterator::<true>::new(
                block.used_bits(),
                block.bit_word_count as usize,
            );
            for (range_start, range_end) in it {
                let span_ptr = unsafe { block.rw_ptr().add(range_start * granularity) };
                let span_size = (range_end - range_start) * granularity;

                fill_memory(span_ptr, self.fill_pattern, span_size);
                vm::flush_instruction_cache(span_ptr, span_size);
            }

            vm::protect_jit_memory(vm::ProtectJitAccess::ReadExecute);
        }

        block.clear_block();
    }
}

/// A memory allocator for JIT code.
///
/// All operations lock a single internal mutex for their whole duration, so
/// a `JitAllocator` can be shared freely between threads. Returned RX/RW
/// pointer pairs are owned by the caller until released.
pub struct JitAllocator {
    inner: Mutex<Inner>,
}

// The inner state holds raw pointers into the managed mappings; every
// access goes through the mutex.
unsafe impl Send for JitAllocator {}
unsafe impl Sync for JitAllocator {}

impl Default for JitAllocator {
    fn default() -> Self {
        Self::new(JitAllocatorOptions::default())
    }
}

impl JitAllocator {
    /// Creates an allocator. Out-of-range or non-power-of-two sizes in
    /// `options` are replaced with platform defaults; dual mapping is forced
    /// when the process is hardened and `MAP_JIT` is unavailable.
    pub fn new(options: JitAllocatorOptions) -> Self {
        let vm_info = vm::info();
        let mut options = options;

        if options.block_size < 64 * 1024
            || options.block_size > 256 * 1024 * 1024
            || !options.block_size.is_power_of_two()
        {
            options.block_size = vm_info.page_granularity as usize;
        }

        if options.granularity < 64
            || options.granularity > 256
            || !options.granularity.is_power_of_two()
        {
            options.granularity = BASE_GRANULARITY;
        }

        let hardened = vm::hardened_runtime_info();
        if hardened.enabled && !hardened.map_jit {
            // W^X is enforced and MAP_JIT cannot help: without dual mapping
            // every allocation would fail.
            options.use_dual_mapping = true;
        }

        let fill_pattern = options.custom_fill_pattern.unwrap_or_else(default_fill_pattern);

        let pool_count = if options.use_multiple_pools {
            MULTI_POOL_COUNT
        } else {
            1
        };
        let pools = (0..pool_count)
            .map(|pool_id| Pool::new(options.granularity << pool_id))
            .collect();

        Self {
            inner: Mutex::new(Inner {
                options,
                block_size: options.block_size,
                granularity: options.granularity,
                fill_pattern,
                page_size: vm_info.page_size,
                allocation_count: 0,
                pools,
                tree: BTreeMap::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The allocation granularity of pool #0.
    pub fn granularity(&self) -> u32 {
        self.lock().granularity
    }

    /// The options the allocator was built with, after normalization.
    pub fn options(&self) -> JitAllocatorOptions {
        self.lock().options
    }

    /// Allocates `size` bytes of executable memory and returns the pair of
    /// pointers addressing it: read+execute and read+write. The pointers
    /// are equal unless the block is dual-mapped.
    pub fn alloc(&self, size: usize) -> Result<(*const u8, *mut u8), Error> {
        let mut guard = self.lock();
        let inner = &mut *guard;

        // Align to the minimum granularity by default.
        let size = align_up(size, inner.granularity as usize);
        if size == 0 {
            return Err(Error::InvalidArgument);
        }
        if size > u32::MAX as usize / 2 {
            return Err(Error::TooLarge);
        }

        let pool_id = inner.size_to_pool_id(size);
        let granularity_log2 = inner.pools[pool_id].granularity_log2;
        let area_size = inner.pools[pool_id].area_size_from_byte_size(size);

        // Walk the pool's blocks as a ring starting at the cursor.
        let block_count = inner.pools[pool_id].blocks.len();
        let cursor = inner.pools[pool_id].cursor;

        for step in 0..block_count {
            let block_index = (cursor + step) % block_count;
            let rx_key = inner.pools[pool_id].blocks[block_index];
            let Some(block) = inner.tree.get_mut(&rx_key) else {
                continue;
            };

            if block.area_available() < area_size {
                continue;
            }
            if !block.is_dirty() && block.largest_unused_area < area_size {
                continue;
            }

            // First-fit scan over the free window; also track enough to
            // refresh the cached bounds when the scan fails.
            let mut area_index = None;
            let mut observed_start = usize::MAX;
            let mut observed_end = 0usize;
            let mut largest_area = 0usize;

            {
                let mut it = BitVectorRangeIterator::<false>::with_range(
                    block.used_bits(),
                    block.bit_word_count as usize,
                    block.search_start as usize,
                    block.search_end as usize,
                );

                while let Some((range_start, range_end)) = it.next_range(area_size as usize) {
                    let range_size = range_end - range_start;
                    if range_size >= area_size as usize {
                        area_index = Some(range_start as u32);
                        break;
                    }

                    observed_start = observed_start.min(range_start);
                    observed_end = range_end;
                    largest_area = largest_area.max(range_size);
                }
            }

            if let Some(area_index) = area_index {
                let was_empty = block.is_empty_block();
                block.mark_allocated_area(area_index, area_index + area_size);

                let offset = (area_index as usize) << granularity_log2;
                debug_assert!(offset <= block.block_size - size);
                let rx = unsafe { block.rx_ptr().add(offset) };
                let rw = unsafe { block.rw_ptr().add(offset) };

                let pool = &mut inner.pools[pool_id];
                pool.cursor = block_index;
                pool.total_area_used += area_size as usize;
                if was_empty {
                    pool.empty_block_count -= 1;
                }
                inner.allocation_count += 1;

                return Ok((rx, rw));
            }

            // The whole block was scanned without success; refresh the
            // cached bounds from what was observed.
            if observed_start != usize::MAX {
                block.search_start = observed_start as u32;
                block.search_end = observed_end as u32;
                block.largest_unused_area = largest_area as u32;
                block.clear_flags(BLOCK_FLAG_DIRTY);
            }
        }

        // No existing block can satisfy the request; map a new one. Its
        // first allocation starts right after the initial padding.
        let block_size = inner.ideal_block_size(pool_id, size)?;
        let mut block = inner.new_block(pool_id, block_size)?;

        let area_index = block.initial_area_start();
        block.search_start += area_size;
        block.largest_unused_area -= area_size;
        block.mark_allocated_area(area_index, area_index + area_size);

        let offset = (area_index as usize) << granularity_log2;
        debug_assert!(offset <= block.block_size - size);
        let rx = unsafe { block.rx_ptr().add(offset) };
        let rw = unsafe { block.rw_ptr().add(offset) };

        inner.insert_block(block);
        let pool = &mut inner.pools[pool_id];
        pool.cursor = pool.blocks.len() - 1;
        inner.allocation_count += 1;

        Ok((rx, rw))
    }

    /// Releases an allocation previously returned by
    /// [alloc](Self::alloc), given its RX pointer.
    pub fn release(&self, rx_ptr: *const u8) -> Result<(), Error> {
        if rx_ptr.is_null() {
            return Err(Error::InvalidArgument);
        }

        let mut guard = self.lock();
        let inner = &mut *guard;

        let Some((rx_key, block)) = block_by_ptr_mut(&mut inner.tree, rx_ptr as usize) else {
            return Err(Error::InvalidState);
        };

        let pool_id = block.pool_id;
        let granularity = inner.pools[pool_id].granularity as usize;
        let granularity_log2 = inner.pools[pool_id].granularity_log2;

        let offset = rx_ptr as usize - rx_key;
        let area_index = (offset >> granularity_log2) as u32;

        if !bit_vector_get_bit(block.used_bits(), area_index as usize) {
            return Err(Error::InvalidState);
        }

        let area_end =
            (bit_vector_index_of(block.stop_bits(), area_index as usize, true) + 1) as u32;
        let area_size = area_end - area_index;

        block.mark_released_area(area_index, area_end);
        let became_empty = block.is_empty_block();
        let rw_base = block.rw_ptr();

        inner.allocation_count -= 1;
        inner.pools[pool_id].total_area_used -= area_size as usize;

        if inner.options.fill_unused_memory {
            let span_ptr = unsafe { rw_base.add(area_index as usize * granularity) };
            let span_size = area_size as usize * granularity;

            let _scope = ProtectJitReadWriteScope::new(span_ptr, span_size);
            fill_memory(span_ptr, inner.fill_pattern, span_size);
        }

        if became_empty {
            // At most one empty block is retained per pool.
            if inner.pools[pool_id].empty_block_count > 0 || inner.options.immediate_release {
                drop(inner.remove_block(rx_key));
            } else {
                inner.pools[pool_id].empty_block_count += 1;
            }
        }

        Ok(())
    }

    /// Shrinks an allocation to `new_size` bytes, releasing the tail. A
    /// `new_size` of zero releases the whole allocation.
    pub fn shrink(&self, rx_ptr: *const u8, new_size: usize) -> Result<(), Error> {
        if rx_ptr.is_null() {
            return Err(Error::InvalidArgument);
        }
        if new_size == 0 {
            return self.release(rx_ptr);
        }

        let mut guard = self.lock();
        let inner = &mut *guard;

        let Some((rx_key, block)) = block_by_ptr_mut(&mut inner.tree, rx_ptr as usize) else {
            return Err(Error::InvalidArgument);
        };

        let pool_id = block.pool_id;
        let granularity = inner.pools[pool_id].granularity as usize;
        let granularity_log2 = inner.pools[pool_id].granularity_log2;

        let offset = rx_ptr as usize - rx_key;
        let area_start = (offset >> granularity_log2) as u32;

        if !bit_vector_get_bit(block.used_bits(), area_start as usize) {
            return Err(Error::InvalidState);
        }

        let area_end =
            (bit_vector_index_of(block.stop_bits(), area_start as usize, true) + 1) as u32;
        let area_prev_size = area_end - area_start;
        let area_shrunk_size = inner.pools[pool_id].area_size_from_byte_size(new_size);

        if area_shrunk_size > area_prev_size {
            return Err(Error::InvalidState);
        }

        let area_diff = area_prev_size - area_shrunk_size;
        if area_diff != 0 {
            block.mark_shrunk_area(area_start + area_shrunk_size, area_end);
            let rw_base = block.rw_ptr();

            inner.pools[pool_id].total_area_used -= area_diff as usize;

            if inner.options.fill_unused_memory {
                let span_ptr =
                    unsafe { rw_base.add((area_start + area_shrunk_size) as usize * granularity) };
                let span_size = area_diff as usize * granularity;

                let _scope = ProtectJitReadWriteScope::new(span_ptr, span_size);
                fill_memory(span_ptr, inner.fill_pattern, span_size);
            }
        }

        Ok(())
    }

    /// Returns the full `(rx, rw, size)` span of the allocation covering
    /// `rx_ptr`. The pointer may address anywhere inside the allocation.
    pub fn query(&self, rx_ptr: *const u8) -> Result<(*const u8, *mut u8, usize), Error> {
        if rx_ptr.is_null() {
            return Err(Error::InvalidArgument);
        }

        let guard = self.lock();
        let inner = &*guard;

        let Some((rx_key, block)) = block_by_ptr(&inner.tree, rx_ptr as usize) else {
            return Err(Error::InvalidArgument);
        };

        let pool = &inner.pools[block.pool_id];
        let offset = rx_ptr as usize - rx_key;
        let area_start = (offset >> pool.granularity_log2) as u32;

        if !bit_vector_get_bit(block.used_bits(), area_start as usize) {
            return Err(Error::InvalidState);
        }

        let area_end =
            (bit_vector_index_of(block.stop_bits(), area_start as usize, true) + 1) as u32;

        let byte_offset = pool.byte_size_from_area_size(area_start);
        let byte_size = pool.byte_size_from_area_size(area_end - area_start);

        let rx = unsafe { block.rx_ptr().add(byte_offset) };
        let rw = unsafe { block.rw_ptr().add(byte_offset) };
        Ok((rx, rw, byte_size))
    }

    /// Invalidates all allocations. With [ResetPolicy::Soft] the first block
    /// of each pool is kept, wiped and reused; with [ResetPolicy::Hard]
    /// every block is released. The caller must guarantee that no returned
    /// pointer is used afterwards.
    pub fn reset(&self, policy: ResetPolicy) {
        let mut guard = self.lock();
        let inner = &mut *guard;

        debug!("reset ({:?})", policy);
        inner.allocation_count = 0;

        for pool_id in 0..inner.pools.len() {
            let keys = std::mem::take(&mut inner.pools[pool_id].blocks);

            let keep_key = if policy == ResetPolicy::Soft && !inner.options.immediate_release {
                keys.first().copied()
            } else {
                None
            };

            let mut kept = None;
            for key in keys {
                let block = inner.tree.remove(&key);
                if Some(key) == keep_key {
                    kept = block;
                }
                // Other blocks drop here, releasing their mappings.
            }

            inner.pools[pool_id].reset();

            if let Some(mut block) = kept {
                inner.wipe_out_block(&mut block);
                inner.insert_block(block);
                inner.pools[pool_id].empty_block_count = 1;
            }
        }
    }

    /// Returns a snapshot of the allocator counters.
    pub fn statistics(&self) -> Statistics {
        let guard = self.lock();

        let mut statistics = Statistics::default();
        for pool in &guard.pools {
            statistics.block_count += pool.blocks.len();
            statistics.reserved_size += pool.total_area_size * pool.granularity as usize;
            statistics.used_size += pool.total_area_used * pool.granularity as usize;
            statistics.overhead_size += pool.total_overhead_bytes;
        }
        statistics.allocation_count = guard.allocation_count;

        statistics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    /// xorshift128+, enough to drive allocation scripts deterministically.
    struct Random {
        state: [u64; 2],
    }

    impl Random {
        fn new(seed: u64) -> Self {
            const ZERO_SEED: u64 = 0x1F0A_2BE7_1D16_3FA0;

            // Expand the seed with splitmix64.
            let mut seed = seed;
            let mut state = [0u64; 2];
            for word in state.iter_mut() {
                seed = seed.wrapping_add(0x9E37_79B9_7F4A_7C15);
                let mut x = seed;
                x = (x ^ (x >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
                x = (x ^ (x >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
                x ^= x >> 31;
                *word = if x != 0 { x } else { ZERO_SEED };
            }

            Self { state }
        }

        fn next_u64(&mut self) -> u64 {
            let mut x = self.state[0];
            let y = self.state[1];

            x ^= x << 23;
            x ^= x >> 18;
            x ^= y ^ (y >> 5);

            self.state[0] = y;
            self.state[1] = x;
            x.wrapping_add(y)
        }

        fn next_u32(&mut self) -> u32 {
            (self.next_u64() >> 32) as u32
        }
    }

    fn write_pattern(dst: *mut u8, pattern: u64, size: usize) {
        let words = size / 8;
        let dst = dst.cast::<u64>();
        for i in 0..words {
            unsafe {
                dst.add(i).write(pattern);
            }
        }
    }

    fn assert_pattern(src: *const u8, pattern: u64, size: usize) {
        let words = size / 8;
        let src = src.cast::<u64>();
        for i in 0..words {
            let value = unsafe { src.add(i).read() };
            assert_eq!(
                value, pattern,
                "pattern mismatch at {:p}[{}]: {:#018X} != {:#018X}",
                src, i, value, pattern
            );
        }
    }

    struct LiveRange {
        rw: *mut u8,
        size: usize,
        rounded_size: usize,
        pattern: u64,
    }

    /// Wraps a [JitAllocator] with an external interval table that verifies
    /// non-overlap of returned regions, RW/RX aliasing, and accounting.
    struct Checked {
        allocator: JitAllocator,
        live: BTreeMap<usize, LiveRange>,
        rng: Random,
    }

    impl Checked {
        fn new(options: JitAllocatorOptions) -> Self {
            Self {
                allocator: JitAllocator::new(options),
                live: BTreeMap::new(),
                rng: Random::new(0x1234_5678_9ABC_DEF0),
            }
        }

        fn assert_no_overlap(&self, rx: usize, size: usize) {
            if let Some((&start, range)) = self.live.range(..rx + size).next_back() {
                assert!(
                    start + range.size <= rx || start >= rx + size,
                    "range {:#X}..{:#X} overlaps live range {:#X}..{:#X}",
                    rx,
                    rx + size,
                    start,
                    start + range.size
                );
            }
        }

        fn alloc(&mut self, size: usize) -> *const u8 {
            let (rx, rw) = self
                .allocator
                .alloc(size)
                .unwrap_or_else(|e| panic!("failed to allocate {size} bytes: {e}"));

            self.assert_no_overlap(rx as usize, size);

            let rounded_size = self.allocator.query(rx).expect("query after alloc").2;
            assert!(rounded_size >= size);

            let pattern = self.rng.next_u64();
            {
                let _scope = ProtectJitReadWriteScope::new(rx, size);
                write_pattern(rw, pattern, size);
            }
            assert_pattern(rx, pattern, size);

            self.live.insert(
                rx as usize,
                LiveRange {
                    rw,
                    size,
                    rounded_size,
                    pattern,
                },
            );
            rx
        }

        fn release(&mut self, rx: *const u8) {
            let range = self
                .live
                .remove(&(rx as usize))
                .expect("releasing a pointer that is not live");

            assert_pattern(rx, range.pattern, range.size);
            assert_pattern(range.rw, range.pattern, range.size);

            self.allocator
                .release(rx)
                .unwrap_or_else(|e| panic!("failed to release {rx:p}: {e}"));
        }

        fn shrink(&mut self, rx: *const u8, new_size: usize) {
            if new_size == 0 {
                self.release(rx);
                return;
            }

            self.allocator
                .shrink(rx, new_size)
                .unwrap_or_else(|e| panic!("failed to shrink {rx:p} to {new_size} bytes: {e}"));

            let rounded_size = self.allocator.query(rx).expect("query after shrink").2;
            let range = self.live.get_mut(&(rx as usize)).expect("unknown pointer");
            range.size = range.size.min(new_size);
            range.rounded_size = rounded_size;
        }

        fn assert_accounting(&self) {
            let statistics = self.allocator.statistics();
            let expected: usize = self.live.values().map(|range| range.rounded_size).sum();

            assert_eq!(statistics.allocation_count, self.live.len());
            assert!(statistics.used_size >= expected);
            // Anything beyond the live allocations is initial padding: at
            // most one slot of the coarsest granularity per block.
            assert!(statistics.used_size - expected <= statistics.block_count * 1024);
            assert!(statistics.reserved_size >= statistics.used_size);

            if self.allocator.options().disable_initial_padding {
                assert_eq!(statistics.used_size, expected);
            }
        }
    }

    fn shuffle<T>(items: &mut [T], rng: &mut Random) {
        for i in 0..items.len() {
            let j = rng.next_u32() as usize % items.len();
            items.swap(i, j);
        }
    }

    fn base_options() -> JitAllocatorOptions {
        JitAllocatorOptions {
            use_dual_mapping: false,
            use_multiple_pools: false,
            fill_unused_memory: false,
            immediate_release: false,
            disable_initial_padding: false,
            custom_fill_pattern: None,
            block_size: 0,
            granularity: 0,
        }
    }

    /// The alloc/release/shrink script the original test harness runs for
    /// every option combination.
    fn run_alloc_release_script(options: JitAllocatorOptions, count: usize) {
        let mut checked = Checked::new(options);
        let mut prng = Random::new(100);

        let mut ptrs: Vec<*const u8> = Vec::with_capacity(count);

        // Random sizes, released in insertion order.
        for _ in 0..count {
            ptrs.push(checked.alloc((prng.next_u32() % 1024) as usize + 8));
        }
        checked.assert_accounting();

        for &ptr in &ptrs {
            checked.release(ptr);
        }
        ptrs.clear();
        checked.assert_accounting();

        // Random sizes again; shuffle, release half, refill, then release
        // everything in reverse order.
        for _ in 0..count {
            ptrs.push(checked.alloc((prng.next_u32() % 1024) as usize + 8));
        }
        shuffle(&mut ptrs, &mut prng);

        for &ptr in &ptrs[..count / 2] {
            checked.release(ptr);
        }
        for slot in 0..count / 2 {
            ptrs[slot] = checked.alloc((prng.next_u32() % 1024) as usize + 8);
        }
        checked.assert_accounting();

        for &ptr in ptrs.iter().rev() {
            checked.release(ptr);
        }
        ptrs.clear();
        checked.assert_accounting();

        // Fixed-size regions shrunk to a single byte, with small regions
        // reusing the freed tails.
        for _ in 0..count / 2 {
            ptrs.push(checked.alloc(256));
        }
        for &ptr in &ptrs {
            checked.shrink(ptr, 1);
        }
        checked.assert_accounting();

        for _ in count / 2..count {
            ptrs.push(checked.alloc(64));
        }
        checked.assert_accounting();

        for &ptr in &ptrs {
            checked.release(ptr);
        }
        checked.assert_accounting();

        // Everything is released; at most one retained empty block per pool
        // may remain.
        let statistics = checked.allocator.statistics();
        assert_eq!(statistics.allocation_count, 0);
        if options.immediate_release {
            assert_eq!(statistics.block_count, 0);
            assert_eq!(statistics.reserved_size, 0);
        } else {
            let pool_count = if options.use_multiple_pools { 3 } else { 1 };
            assert!(statistics.block_count <= pool_count);
        }
    }

    #[test]
    fn alloc_release_default_options() {
        run_alloc_release_script(JitAllocatorOptions::default(), 5000);
    }

    #[test]
    fn alloc_release_option_matrix() {
        let configs: [(&str, JitAllocatorOptions); 9] = [
            ("base", base_options()),
            (
                "16MB blocks",
                JitAllocatorOptions {
                    block_size: 16 * 1024 * 1024,
                    ..base_options()
                },
            ),
            (
                "256B granularity",
                JitAllocatorOptions {
                    granularity: 256,
                    ..base_options()
                },
            ),
            (
                "dual mapping",
                JitAllocatorOptions {
                    use_dual_mapping: true,
                    ..base_options()
                },
            ),
            (
                "multiple pools",
                JitAllocatorOptions {
                    use_multiple_pools: true,
                    ..base_options()
                },
            ),
            (
                "fill unused memory",
                JitAllocatorOptions {
                    fill_unused_memory: true,
                    ..base_options()
                },
            ),
            (
                "immediate release",
                JitAllocatorOptions {
                    immediate_release: true,
                    ..base_options()
                },
            ),
            (
                "no initial padding",
                JitAllocatorOptions {
                    disable_initial_padding: true,
                    ..base_options()
                },
            ),
            (
                "dual mapping + fill",
                JitAllocatorOptions {
                    use_dual_mapping: true,
                    fill_unused_memory: true,
                    ..base_options()
                },
            ),
        ];

        for (name, options) in configs {
            eprintln!("running the alloc/release script: {name}");
            run_alloc_release_script(options, 1500);
        }
    }

    #[test]
    fn pool_routing() {
        let allocator = JitAllocator::new(JitAllocatorOptions {
            use_multiple_pools: true,
            ..base_options()
        });
        let inner = allocator.lock();

        assert_eq!(inner.size_to_pool_id(64), 0);
        assert_eq!(inner.size_to_pool_id(128), 1);
        assert_eq!(inner.size_to_pool_id(192), 0);
        assert_eq!(inner.size_to_pool_id(256), 2);
        assert_eq!(inner.size_to_pool_id(320), 0);
        assert_eq!(inner.size_to_pool_id(384), 1);

        // Any multiple of the coarsest granularity routes to the coarsest
        // pool.
        for multiple in 1..64usize {
            assert_eq!(inner.size_to_pool_id(multiple * 256), 2);
        }
    }

    #[test]
    fn query_returns_the_covering_span() {
        let allocator = JitAllocator::new(base_options());
        let (rx, rw) = allocator.alloc(100).unwrap();

        let (rx_q, rw_q, size) = allocator.query(rx).unwrap();
        assert_eq!(rx_q, rx);
        assert_eq!(rw_q, rw);
        assert_eq!(size, align_up(100, allocator.granularity() as usize));

        // Interior pointers resolve to the same span.
        let (rx_q, rw_q, size) = allocator.query(unsafe { rx.add(5) }).unwrap();
        assert_eq!(rx_q, rx);
        assert_eq!(rw_q, rw);
        assert_eq!(size, 128);

        allocator.release(rx).unwrap();
    }

    #[test]
    fn argument_errors() {
        let allocator = JitAllocator::new(base_options());

        assert_eq!(allocator.alloc(0).unwrap_err(), Error::InvalidArgument);
        assert_eq!(
            allocator.alloc(3 * 1024 * 1024 * 1024).unwrap_err(),
            Error::TooLarge
        );

        assert_eq!(
            allocator.release(core::ptr::null()).unwrap_err(),
            Error::InvalidArgument
        );
        assert_eq!(
            allocator.release(0x1000 as *const u8).unwrap_err(),
            Error::InvalidState
        );
        assert_eq!(
            allocator.query(0x1000 as *const u8).unwrap_err(),
            Error::InvalidArgument
        );
        assert_eq!(
            allocator.shrink(0x1000 as *const u8, 16).unwrap_err(),
            Error::InvalidArgument
        );
    }

    #[test]
    fn double_release_is_detected() {
        let allocator = JitAllocator::new(base_options());

        let (rx, _rw) = allocator.alloc(64).unwrap();
        allocator.release(rx).unwrap();

        // The block is retained empty, so the pointer still maps to a block
        // but its slot is no longer in use.
        assert_eq!(allocator.release(rx).unwrap_err(), Error::InvalidState);
        assert_eq!(allocator.query(rx).unwrap_err(), Error::InvalidState);
    }

    #[test]
    fn shrink_is_monotonic() {
        let allocator = JitAllocator::new(base_options());

        let (rx, _rw) = allocator.alloc(256).unwrap();
        allocator.shrink(rx, 100).unwrap();
        assert_eq!(allocator.query(rx).unwrap().2, 128);

        // Growing back is not possible.
        assert_eq!(allocator.shrink(rx, 200).unwrap_err(), Error::InvalidState);

        // Shrinking to zero releases.
        allocator.shrink(rx, 0).unwrap();
        assert_eq!(allocator.statistics().allocation_count, 0);
    }

    #[test]
    fn shrink_frees_tails_for_reuse() {
        let allocator = JitAllocator::new(JitAllocatorOptions {
            block_size: 64 * 1024,
            ..base_options()
        });

        let mut ptrs = Vec::new();
        for _ in 0..512 {
            ptrs.push(allocator.alloc(256).unwrap().0);
        }
        let reserved_before = allocator.statistics().reserved_size;
        let used_before = allocator.statistics().used_size;

        for &ptr in &ptrs {
            allocator.shrink(ptr, 1).unwrap();
        }
        let used_after = allocator.statistics().used_size;
        assert_eq!(used_before - used_after, 512 * (256 - 64));

        // The freed tails satisfy small allocations without growing the
        // reservation.
        for _ in 0..512 {
            ptrs.push(allocator.alloc(64).unwrap().0);
        }
        assert_eq!(allocator.statistics().reserved_size, reserved_before);

        for &ptr in &ptrs {
            allocator.release(ptr).unwrap();
        }
    }

    #[test]
    fn dual_mapping_aliases_and_fills_on_release() {
        let allocator = JitAllocator::new(JitAllocatorOptions {
            use_dual_mapping: true,
            fill_unused_memory: true,
            custom_fill_pattern: Some(0xA5A5_A5A5),
            ..base_options()
        });

        let (rx, rw) = allocator.alloc(1024).unwrap();
        assert_ne!(rx, rw as *const u8);

        let pattern = 0xDEAD_BEEF_CAFE_BABEu64;
        {
            let _scope = ProtectJitReadWriteScope::new(rx, 1024);
            write_pattern(rw, pattern, 1024);
        }
        assert_pattern(rx, pattern, 1024);

        allocator.release(rx).unwrap();

        // The block is retained, so the fill pattern is observable through
        // the still-mapped RX view.
        assert_eq!(allocator.statistics().block_count, 1);
        assert_pattern(rx, 0xA5A5_A5A5_A5A5_A5A5, 1024);
    }

    #[test]
    fn empty_block_retention() {
        let allocator = JitAllocator::new(base_options());

        for _ in 0..16 {
            let (rx, _) = allocator.alloc(1024).unwrap();
            allocator.release(rx).unwrap();
        }
        let statistics = allocator.statistics();
        assert_eq!(statistics.allocation_count, 0);
        assert_eq!(statistics.block_count, 1);

        let allocator = JitAllocator::new(JitAllocatorOptions {
            immediate_release: true,
            ..base_options()
        });

        for _ in 0..16 {
            let (rx, _) = allocator.alloc(1024).unwrap();
            allocator.release(rx).unwrap();
        }
        let statistics = allocator.statistics();
        assert_eq!(statistics.block_count, 0);
        assert_eq!(statistics.reserved_size, 0);
    }

    #[test]
    fn reset_soundness() {
        let allocator = JitAllocator::new(base_options());

        for _ in 0..64 {
            allocator.alloc(512).unwrap();
        }
        assert!(allocator.statistics().block_count >= 1);

        allocator.reset(ResetPolicy::Soft);
        let statistics = allocator.statistics();
        assert_eq!(statistics.allocation_count, 0);
        assert_eq!(statistics.block_count, 1);
        // Only the initial padding slot of the kept block remains in use.
        assert_eq!(statistics.used_size, 64);

        for _ in 0..64 {
            allocator.alloc(512).unwrap();
        }

        allocator.reset(ResetPolicy::Hard);
        let statistics = allocator.statistics();
        assert_eq!(statistics, Statistics::default());

        // The allocator is still usable after a hard reset.
        let (rx, _) = allocator.alloc(64).unwrap();
        allocator.release(rx).unwrap();
    }

    #[test]
    fn reset_soft_with_immediate_release_drops_everything() {
        let allocator = JitAllocator::new(JitAllocatorOptions {
            immediate_release: true,
            ..base_options()
        });

        allocator.alloc(128).unwrap();
        allocator.reset(ResetPolicy::Soft);
        assert_eq!(allocator.statistics().block_count, 0);
    }

    #[test]
    fn oversized_requests_get_their_own_block() {
        let allocator = JitAllocator::new(base_options());

        // Larger than the default block size, so a block is sized for it.
        let size = 2 * 1024 * 1024;
        let (rx, rw) = allocator.alloc(size).unwrap();

        let pattern = 0x0102_0304_0506_0708u64;
        {
            let _scope = ProtectJitReadWriteScope::new(rx, size);
            write_pattern(rw, pattern, size);
        }
        assert_pattern(rx, pattern, size);

        assert_eq!(allocator.query(rx).unwrap().2, size);
        allocator.release(rx).unwrap();
    }

    #[test]
    fn no_initial_padding_uses_the_block_start() {
        let allocator = JitAllocator::new(JitAllocatorOptions {
            disable_initial_padding: true,
            ..base_options()
        });

        let (rx, _) = allocator.alloc(64).unwrap();
        assert_eq!(allocator.statistics().used_size, 64);

        allocator.release(rx).unwrap();
        assert_eq!(allocator.statistics().used_size, 0);
    }

    #[test]
    fn concurrent_alloc_release() {
        use std::sync::Arc;

        let allocator = Arc::new(JitAllocator::new(JitAllocatorOptions::default()));
        let mut handles = Vec::new();

        for thread_id in 0..4u64 {
            let allocator = Arc::clone(&allocator);
            handles.push(std::thread::spawn(move || {
                let mut prng = Random::new(thread_id);
                let mut ptrs = Vec::new();

                for _ in 0..500 {
                    let size = (prng.next_u32() % 512) as usize + 8;
                    let (rx, rw) = allocator.alloc(size).expect("alloc");
                    {
                        let _scope = ProtectJitReadWriteScope::new(rx, size);
                        write_pattern(rw, rx as u64, size);
                    }
                    ptrs.push((rx, size));

                    if ptrs.len() > 32 {
                        let (rx, size) = ptrs.swap_remove(
                            prng.next_u32() as usize % ptrs.len(),
                        );
                        assert_pattern(rx, rx as u64, size);
                        allocator.release(rx).expect("release");
                    }
                }

                for (rx, size) in ptrs {
                    assert_pattern(rx, rx as u64, size);
                    allocator.release(rx).expect("release");
                }
            }));
        }

        for handle in handles {
            handle.join().expect("worker panicked");
        }

        assert_eq!(allocator.statistics().allocation_count, 0);
    }
}
