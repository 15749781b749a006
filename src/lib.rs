//! Slab allocator over a single caller-supplied arena.
//!
//! The arena is carved into pages. Requests of at least half a page are served
//! as whole page runs; smaller requests are rounded up to a power of two and
//! packed into pages of same-sized chunks. The chunk occupancy is encoded in
//! the page descriptors (and, for the smallest classes, in a bitmap at the head
//! of the page), so a bare pointer is enough to free a chunk.
//!
//! All pool metadata lives inside the arena and is addressed by offsets, which
//! makes the arena shareable between processes that map it with the same page
//! alignment and the same build (word width, page size, `min_shift`).
//!
//! Writing past the end of a chunk corrupts its neighbours or the page bitmap.
//! The allocator does not guard against it.

#![allow(clippy::missing_safety_doc)]

use core::{
  cmp::Ordering as CmpOrdering,
  fmt, hint,
  marker::PhantomData,
  mem::{align_of, size_of},
  ptr::{self, NonNull},
  slice,
  sync::atomic::{AtomicBool, Ordering},
};

use log::{debug, error, info};
use parking_lot::lock_api::RawMutex as RawMutexApi;
use thiserror::Error;

// =============================================================================
// Constants
// =============================================================================

/// Magic number identifying an initialized pool header.
const POOL_MAGIC: u64 = 0x534C_4142_504F_4F4C; // "SLABPOOL"

const WORD_BITS: usize = usize::BITS as usize;

/// Run head marker, OR-ed with the run length.
const PAGE_START: usize = 1 << (WORD_BITS - 1);
/// Occupancy word of every page of a run but the first.
const PAGE_BUSY: usize = usize::MAX;
/// A fully occupied bitmap word.
const SLAB_BUSY: usize = usize::MAX;

/// Low bits of a small/big occupancy word holding the chunk shift.
const SHIFT_MASK: usize = 0xf;
/// Big pages keep their chunk map in the upper half-word.
const MAP_SHIFT: usize = WORD_BITS / 2;
const MAP_MASK: usize = usize::MAX << MAP_SHIFT;

const JUNK_BYTE: u8 = 0xA5;

const DEFAULT_PAGE_SIZE: usize = 4096;
const DEFAULT_MIN_SHIFT: u32 = 3;

/// The largest chunk shift (page_shift - 1) must fit `SHIFT_MASK`.
const MIN_PAGE_SHIFT: u32 = 8;
const MAX_PAGE_SHIFT: u32 = 16;

const FLAG_PAGE_MERGE: u32 = 1;
const FLAG_JUNK_FILL: u32 = 1 << 1;

// =============================================================================
// Compile-Time Assertions
// =============================================================================

const _: () = assert!(WORD_BITS == 32 || WORD_BITS == 64);
const _: () = assert!(size_of::<PoolHeader>() % align_of::<PageDesc>() == 0);
const _: () = assert!(align_of::<PoolHeader>() >= align_of::<PageDesc>());
const _: () = assert!((MAX_PAGE_SHIFT as usize - 1) <= SHIFT_MASK);
const _: () = assert!(SHIFT_MASK < 1 << MAP_SHIFT);

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SlabError {
  #[error("no memory for a {size} byte allocation")]
  OutOfMemory { size: usize },

  #[error("invalid pointer {addr:#x}: {reason}")]
  InvalidPointer { addr: usize, reason: &'static str },

  /// Also returned for an unaligned pointer into a page run or free run: the
  /// alignment check runs before the page state is looked at.
  #[error("pointer {addr:#x} is not aligned to its chunk")]
  MisalignedChunk { addr: usize },

  #[error("chunk {addr:#x} is already free")]
  DoubleFree { addr: usize },

  #[error("arena of {len} bytes cannot hold the pool header and one page")]
  ArenaTooSmall { len: usize },

  #[error("invalid pool configuration: {0}")]
  InvalidConfig(&'static str),

  #[error("arena does not hold a pool header compatible with this build")]
  BadHeader,
}

// =============================================================================
// Configuration
// =============================================================================

/// Construction parameters of a pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolConfig {
  /// log2 of the smallest chunk handed out.
  pub min_shift: u32,
  pub page_size: usize,
  /// Coalesce a freed run with the free runs right before and after it.
  pub page_merge: bool,
  /// Fill freed memory with `0xA5`.
  pub junk_fill: bool,
}

impl Default for PoolConfig {
  fn default() -> Self {
    Self {
      min_shift: DEFAULT_MIN_SHIFT,
      page_size: host_page_size(),
      page_merge: true,
      junk_fill: false,
    }
  }
}

impl PoolConfig {
  pub fn with_min_shift(mut self, min_shift: u32) -> Self {
    self.min_shift = min_shift;
    self
  }

  pub fn with_page_size(mut self, page_size: usize) -> Self {
    self.page_size = page_size;
    self
  }

  pub fn with_page_merge(mut self, page_merge: bool) -> Self {
    self.page_merge = page_merge;
    self
  }

  pub fn with_junk_fill(mut self, junk_fill: bool) -> Self {
    self.junk_fill = junk_fill;
    self
  }

  pub fn geometry(&self) -> Result<Geometry, SlabError> {
    Geometry::new(self.page_size, self.min_shift)
  }

  fn flags(&self) -> u32 {
    let mut flags = 0;
    if self.page_merge {
      flags |= FLAG_PAGE_MERGE;
    }
    if self.junk_fill {
      flags |= FLAG_JUNK_FILL;
    }
    flags
  }
}

#[cfg(unix)]
fn host_page_size() -> usize {
  match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
    n if n > 0 => n as usize,
    _ => DEFAULT_PAGE_SIZE,
  }
}

#[cfg(not(unix))]
fn host_page_size() -> usize {
  DEFAULT_PAGE_SIZE
}

/// Size-class constants of a pool, derived once from its page size and `min_shift`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Geometry {
  page_size: usize,
  page_shift: u32,
  min_size: usize,
  min_shift: u32,
  /// Requests of at least this size are served as page runs.
  max_size: usize,
  /// Chunk size at which one page holds exactly one word worth of chunks.
  exact_size: usize,
  exact_shift: u32,
}

/// Occupancy encoding used for a size class.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Tier {
  /// Bitmap words at the head of the page.
  Bitmap,
  /// The descriptor's occupancy word is the bitmap.
  Exact,
  /// Chunk map in the upper half of the occupancy word, shift in the low bits.
  Big,
}

impl Geometry {
  pub fn new(page_size: usize, min_shift: u32) -> Result<Self, SlabError> {
    if !page_size.is_power_of_two() {
      return Err(SlabError::InvalidConfig("page size must be a power of two"));
    }
    let page_shift = page_size.trailing_zeros();
    if !(MIN_PAGE_SHIFT..=MAX_PAGE_SHIFT).contains(&page_shift) {
      return Err(SlabError::InvalidConfig(
        "page size must be between 256 bytes and 64 KiB",
      ));
    }
    if min_shift == 0 || min_shift + 1 >= page_shift {
      return Err(SlabError::InvalidConfig(
        "min_shift must leave at least one chunk class below half a page",
      ));
    }

    let exact_size = page_size / WORD_BITS;
    Ok(Self {
      page_size,
      page_shift,
      min_size: 1 << min_shift,
      min_shift,
      max_size: page_size / 2,
      exact_size,
      exact_shift: exact_size.trailing_zeros(),
    })
  }

  pub fn page_size(&self) -> usize {
    self.page_size
  }

  pub fn page_shift(&self) -> u32 {
    self.page_shift
  }

  pub fn min_size(&self) -> usize {
    self.min_size
  }

  pub fn min_shift(&self) -> u32 {
    self.min_shift
  }

  pub fn max_size(&self) -> usize {
    self.max_size
  }

  pub fn exact_size(&self) -> usize {
    self.exact_size
  }

  pub fn word_bits(&self) -> usize {
    WORD_BITS
  }

  /// Chunk shift serving `size`, or `None` when it is served as a page run.
  pub fn class_of(&self, size: usize) -> Option<u32> {
    if size >= self.max_size {
      None
    } else if size <= self.min_size {
      Some(self.min_shift)
    } else {
      Some(usize::BITS - (size - 1).leading_zeros())
    }
  }

  /// Bytes actually reserved for a request of `size` bytes.
  pub fn rounded_size(&self, size: usize) -> usize {
    match self.class_of(size) {
      Some(shift) => 1 << shift,
      None => self.pages_for(size) << self.page_shift,
    }
  }

  fn pages_for(&self, size: usize) -> usize {
    size.div_ceil(self.page_size)
  }

  /// Number of slot anchors, one per chunk shift in `min_shift..page_shift`.
  fn slots(&self) -> usize {
    (self.page_shift - self.min_shift) as usize
  }

  fn slot_of(&self, shift: u32) -> usize {
    (shift - self.min_shift) as usize
  }

  fn tier(&self, shift: u32) -> Tier {
    match shift.cmp(&self.exact_shift) {
      CmpOrdering::Less => Tier::Bitmap,
      CmpOrdering::Equal => Tier::Exact,
      CmpOrdering::Greater => Tier::Big,
    }
  }

  fn bitmap_words(&self, shift: u32) -> usize {
    (self.page_size >> shift) / WORD_BITS
  }

  /// Leading chunks of a bitmap page overlapped by the bitmap itself.
  fn bitmap_reserved(&self, shift: u32) -> usize {
    let bitmap_bytes = (self.page_size >> shift) / 8;
    bitmap_bytes.div_ceil(1 << shift)
  }

  /// Chunk map of a completely full big page, in occupancy-word position.
  fn big_mask(&self, shift: u32) -> usize {
    ((1usize << (self.page_size >> shift)) - 1) << MAP_SHIFT
  }
}

// =============================================================================
// Locking
// =============================================================================

/// Mutual exclusion around every pool operation. The pool never locks internally
/// beyond one acquire/release pair per call.
pub trait PoolLock {
  fn acquire(&self);

  /// Must only be called by the current holder.
  unsafe fn release(&self);
}

/// Spin lock stored inside the arena header, shared by every process mapping it.
#[repr(C)]
#[derive(Debug, Default)]
pub struct SpinLock {
  locked: AtomicBool,
}

impl SpinLock {
  pub const fn new() -> Self {
    Self {
      locked: AtomicBool::new(false),
    }
  }
}

impl PoolLock for SpinLock {
  #[inline]
  fn acquire(&self) {
    while self
      .locked
      .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
      .is_err()
    {
      while self.locked.load(Ordering::Relaxed) {
        hint::spin_loop();
      }
    }
  }

  #[inline]
  unsafe fn release(&self) {
    self.locked.store(false, Ordering::Release);
  }
}

impl PoolLock for parking_lot::RawMutex {
  fn acquire(&self) {
    RawMutexApi::lock(self);
  }

  unsafe fn release(&self) {
    unsafe { RawMutexApi::unlock(self) };
  }
}

struct LockGuard<'l, L: PoolLock>(&'l L);

impl<L: PoolLock> Drop for LockGuard<'_, L> {
  fn drop(&mut self) {
    unsafe { self.0.release() };
  }
}

// =============================================================================
// Arena Layout
// =============================================================================

/// Start of the arena. Followed by the node table: one anchor per slot, the
/// free-run anchor, then one descriptor per page. Data pages start at the next
/// page boundary after the table.
#[repr(C)]
struct PoolHeader {
  magic: u64,
  word_bits: u32,
  page_shift: u32,
  min_shift: u32,
  flags: u32,
  /// Bytes from the header to the end of the arena.
  len: usize,
  slots: usize,
  /// Page descriptors in the node table.
  pages: usize,
  /// Pages that actually fit after aligning the data start (`pages` or one less).
  real_pages: usize,
  data_offset: usize,
  lock: SpinLock,
}

/// Classification tag of a page descriptor.
#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum PageKind {
  Page = 0,
  Big = 1,
  Exact = 2,
  Small = 3,
}

/// List membership of a page descriptor.
#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Linkage {
  /// On no list: a full chunk page, a granted run, or a free run's interior.
  Packed = 0,
  /// Head of a free run.
  Free = 1,
  /// Chunk page with free capacity, linked into its slot.
  Slotted = 2,
}

/// One per page, plus the list anchors. Links are node-table indices.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct PageDesc {
  /// Occupancy word, interpreted according to `kind`.
  slab: usize,
  next: u32,
  prev: u32,
  kind: u8,
  link: u8,
}

/// Decoded view of a page descriptor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PageState {
  FreeRun { pages: usize },
  FreeInterior,
  Run { pages: usize },
  RunInterior,
  Small { shift: u32 },
  Exact { map: usize },
  Big { shift: u32, map: usize },
}

impl PageDesc {
  const EMPTY: Self = Self {
    slab: 0,
    next: 0,
    prev: 0,
    kind: PageKind::Page as u8,
    link: Linkage::Packed as u8,
  };

  fn anchor(idx: usize) -> Self {
    Self {
      next: idx as u32,
      prev: idx as u32,
      ..Self::EMPTY
    }
  }

  fn chunk_page(kind: PageKind, slab: usize) -> Self {
    Self {
      slab,
      kind: kind as u8,
      ..Self::EMPTY
    }
  }

  fn kind(&self) -> PageKind {
    match self.kind & 3 {
      1 => PageKind::Big,
      2 => PageKind::Exact,
      3 => PageKind::Small,
      _ => PageKind::Page,
    }
  }

  fn link(&self) -> Linkage {
    match self.link {
      1 => Linkage::Free,
      2 => Linkage::Slotted,
      _ => Linkage::Packed,
    }
  }

  /// Free run head or free run interior.
  fn is_free(&self) -> bool {
    self.link() == Linkage::Free || *self == Self::EMPTY
  }

  fn state(&self) -> PageState {
    match self.kind() {
      PageKind::Small => PageState::Small {
        shift: (self.slab & SHIFT_MASK) as u32,
      },
      PageKind::Exact => PageState::Exact { map: self.slab },
      PageKind::Big => PageState::Big {
        shift: (self.slab & SHIFT_MASK) as u32,
        map: self.slab >> MAP_SHIFT,
      },
      PageKind::Page => match (self.link(), self.slab) {
        (Linkage::Free, pages) => PageState::FreeRun { pages },
        (_, 0) => PageState::FreeInterior,
        (_, PAGE_BUSY) => PageState::RunInterior,
        (_, slab) => PageState::Run {
          pages: slab & !PAGE_START,
        },
      },
    }
  }
}

// =============================================================================
// Node Lists
// =============================================================================

fn push_front(nodes: &mut [PageDesc], anchor: usize, node: usize, link: Linkage) {
  let head = nodes[anchor].next;
  nodes[node].next = head;
  nodes[node].prev = anchor as u32;
  nodes[node].link = link as u8;
  nodes[head as usize].prev = node as u32;
  nodes[anchor].next = node as u32;
}

fn unlink(nodes: &mut [PageDesc], node: usize) {
  let (prev, next) = (nodes[node].prev, nodes[node].next);
  nodes[prev as usize].next = next;
  nodes[next as usize].prev = prev;
  nodes[node].next = 0;
  nodes[node].prev = 0;
  nodes[node].link = Linkage::Packed as u8;
}

/// Puts `new` at the list position of `old`.
fn replace(nodes: &mut [PageDesc], old: usize, new: usize) {
  let (prev, next, link) = (nodes[old].prev, nodes[old].next, nodes[old].link);
  nodes[new].prev = prev;
  nodes[new].next = next;
  nodes[new].link = link;
  nodes[prev as usize].next = new as u32;
  nodes[next as usize].prev = new as u32;
}

fn set_leading_bits(bitmap: &mut [usize], count: usize) {
  for (n, word) in bitmap.iter_mut().enumerate() {
    let first = n * WORD_BITS;
    if first >= count {
      break;
    }
    let bits = count - first;
    *word = if bits >= WORD_BITS {
      SLAB_BUSY
    } else {
      (1 << bits) - 1
    };
  }
}

/// Whether any chunk past the `reserved` bitmap chunks is taken.
fn bitmap_in_use(bitmap: &[usize], reserved: usize) -> bool {
  bitmap.iter().enumerate().any(|(n, &word)| {
    let first = n * WORD_BITS;
    let mask = match reserved.saturating_sub(first) {
      0 => SLAB_BUSY,
      r if r >= WORD_BITS => 0,
      r => SLAB_BUSY << r,
    };
    word & mask != 0
  })
}

// =============================================================================
// Statistics
// =============================================================================

/// Pages and bytes held by one allocation tier.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TierUsage {
  pub pages: usize,
  pub bytes: usize,
}

/// Point-in-time usage snapshot of a pool.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStat {
  /// Bytes from the first data page to the end of the arena.
  pub pool_size: usize,
  /// Bytes of live chunks and runs, counted at their rounded size.
  pub used_size: usize,
  pub used_pct: usize,
  pub pages: usize,
  pub free_page: usize,
  pub small: TierUsage,
  pub exact: TierUsage,
  pub big: TierUsage,
  pub page: TierUsage,
  /// Longest free run, in pages.
  pub max_free_pages: usize,
}

impl PoolStat {
  fn report(&self) {
    info!("pool_size : {} bytes", self.pool_size);
    info!("used_size : {} bytes", self.used_size);
    info!("used_pct  : {}%", self.used_pct);
    info!("total page count : {}", self.pages);
    info!("free page count  : {}", self.free_page);
    info!("small slab use page : {},\tbytes : {}", self.small.pages, self.small.bytes);
    info!("exact slab use page : {},\tbytes : {}", self.exact.pages, self.exact.bytes);
    info!("big   slab use page : {},\tbytes : {}", self.big.pages, self.big.bytes);
    info!("page slab use page  : {},\tbytes : {}", self.page.pages, self.page.bytes);
    info!("max free pages : {}", self.max_free_pages);
  }
}

// =============================================================================
// Pool
// =============================================================================

/// Handle to a pool living inside an arena. Several handles (in one or many
/// processes) may refer to the same arena; they all serialize on `L`.
pub struct SlabPool<'a, L: PoolLock = SpinLock> {
  nodes: NonNull<PageDesc>,
  node_count: usize,
  /// First data page, page aligned.
  start: NonNull<u8>,
  end: usize,
  /// Usable data pages.
  pages: usize,
  geometry: Geometry,
  page_merge: bool,
  junk_fill: bool,
  lock: &'a L,
  _arena: PhantomData<&'a mut [u8]>,
}

unsafe impl<L: PoolLock + Sync> Send for SlabPool<'_, L> {}
unsafe impl<L: PoolLock + Sync> Sync for SlabPool<'_, L> {}

impl<'a> SlabPool<'a, SpinLock> {
  /// Lays out a fresh pool over `arena`.
  pub fn init(arena: &'a mut [u8], config: PoolConfig) -> Result<Self, SlabError> {
    let len = arena.len();
    let base = NonNull::new(arena.as_mut_ptr()).ok_or(SlabError::ArenaTooSmall { len })?;
    unsafe { Self::init_raw(base, len, config) }
  }

  /// Lays out a fresh pool over `len` bytes at `base`.
  ///
  /// The bytes must be writable, untouched by anything else while the returned
  /// handle (or any handle attached later) is in use, and outlive `'a`.
  pub unsafe fn init_raw(base: NonNull<u8>, len: usize, config: PoolConfig) -> Result<Self, SlabError> {
    let geometry = config.geometry()?;
    let addr = base.as_ptr() as usize;
    let end = addr
      .checked_add(len)
      .ok_or(SlabError::InvalidConfig("arena wraps around the address space"))?;

    let header_addr = align_up(addr, align_of::<PoolHeader>());
    let slots = geometry.slots();
    let table_addr = header_addr + size_of::<PoolHeader>();
    let pages_addr = table_addr + (slots + 1) * size_of::<PageDesc>();
    if pages_addr >= end {
      return Err(SlabError::ArenaTooSmall { len });
    }

    let pages = (end - pages_addr) / (geometry.page_size + size_of::<PageDesc>());
    let data_addr = align_up(pages_addr + pages * size_of::<PageDesc>(), geometry.page_size);
    // Aligning the data start can only cost pages, never add one past the table.
    let real_pages = (end.saturating_sub(data_addr) >> geometry.page_shift).min(pages);
    if real_pages == 0 {
      return Err(SlabError::ArenaTooSmall { len });
    }
    let node_count = slots + 1 + pages;
    if node_count > u32::MAX as usize {
      return Err(SlabError::InvalidConfig(
        "arena needs more page descriptors than a node link can address",
      ));
    }

    let header = header_addr as *mut PoolHeader;
    unsafe {
      header.write(PoolHeader {
        magic: 0,
        word_bits: WORD_BITS as u32,
        page_shift: geometry.page_shift,
        min_shift: geometry.min_shift,
        flags: config.flags(),
        len: end - header_addr,
        slots,
        pages,
        real_pages,
        data_offset: data_addr - header_addr,
        lock: SpinLock::new(),
      });
      ptr::write_bytes(table_addr as *mut PageDesc, 0, node_count);
    }

    let nodes = unsafe { slice::from_raw_parts_mut(table_addr as *mut PageDesc, node_count) };
    for (idx, anchor) in nodes[..=slots].iter_mut().enumerate() {
      *anchor = PageDesc::anchor(idx);
    }
    nodes[slots + 1].slab = real_pages;
    push_front(nodes, slots, slots + 1, Linkage::Free);

    // The magic goes in last so attach never sees a half-built pool.
    let magic = unsafe { ptr::addr_of_mut!((*header).magic) };
    unsafe { magic.write(POOL_MAGIC) };
    let pool = match Self::from_header(unsafe { &*header }) {
      Ok(pool) => pool,
      Err(err) => {
        unsafe { magic.write(0) };
        return Err(err);
      }
    };

    debug!(
      "slab pool: {} pages of {} bytes at {:p}",
      real_pages, geometry.page_size, pool.start
    );
    Ok(pool)
  }

  /// Opens a handle on a pool another handle (possibly in another process)
  /// already laid out at `base`.
  ///
  /// Same requirements as [`SlabPool::init_raw`]; the arena must have been
  /// initialized with this `len` by a build with the same word width.
  pub unsafe fn attach(base: NonNull<u8>, len: usize) -> Result<Self, SlabError> {
    let addr = base.as_ptr() as usize;
    let header_addr = align_up(addr, align_of::<PoolHeader>());
    if header_addr + size_of::<PoolHeader>() > addr.saturating_add(len) {
      return Err(SlabError::ArenaTooSmall { len });
    }

    let header = unsafe { &*(header_addr as *const PoolHeader) };
    if header.magic != POOL_MAGIC
      || header.word_bits != WORD_BITS as u32
      || header_addr + header.len != addr + len
    {
      return Err(SlabError::BadHeader);
    }
    Self::from_header(header)
  }

  fn from_header(header: &'a PoolHeader) -> Result<Self, SlabError> {
    let page_size = 1usize
      .checked_shl(header.page_shift)
      .ok_or(SlabError::BadHeader)?;
    let geometry = Geometry::new(page_size, header.min_shift)?;
    let data_end = header
      .real_pages
      .checked_mul(page_size)
      .and_then(|bytes| bytes.checked_add(header.data_offset));
    if header.slots != geometry.slots()
      || header.real_pages > header.pages
      || data_end.is_none_or(|data_end| data_end > header.len)
    {
      return Err(SlabError::BadHeader);
    }

    let base = header as *const PoolHeader as usize;
    Ok(Self {
      nodes: NonNull::new((base + size_of::<PoolHeader>()) as *mut PageDesc).ok_or(SlabError::BadHeader)?,
      node_count: header.slots + 1 + header.pages,
      start: NonNull::new((base + header.data_offset) as *mut u8).ok_or(SlabError::BadHeader)?,
      end: base + header.len,
      pages: header.real_pages,
      geometry,
      page_merge: header.flags & FLAG_PAGE_MERGE != 0,
      junk_fill: header.flags & FLAG_JUNK_FILL != 0,
      lock: &header.lock,
      _arena: PhantomData,
    })
  }
}

impl<'a, L: PoolLock> SlabPool<'a, L> {
  /// Serializes this handle on `lock` instead. Every handle on the arena must
  /// use the same lock.
  pub fn with_lock<M: PoolLock>(self, lock: &'a M) -> SlabPool<'a, M> {
    SlabPool {
      nodes: self.nodes,
      node_count: self.node_count,
      start: self.start,
      end: self.end,
      pages: self.pages,
      geometry: self.geometry,
      page_merge: self.page_merge,
      junk_fill: self.junk_fill,
      lock,
      _arena: PhantomData,
    }
  }

  pub fn geometry(&self) -> &Geometry {
    &self.geometry
  }

  /// Usable data pages.
  pub fn pages(&self) -> usize {
    self.pages
  }

  /// Whether `ptr` falls in the data region of the pool.
  pub fn contains(&self, ptr: *const u8) -> bool {
    let addr = ptr as usize;
    addr >= self.start.as_ptr() as usize && addr < self.end
  }

  pub fn alloc(&self, size: usize) -> Result<NonNull<u8>, SlabError> {
    let _guard = self.guard();
    unsafe { self.alloc_locked(size) }
  }

  /// Returns a chunk or run. Invalid pointers are reported and otherwise ignored.
  pub fn free(&self, ptr: NonNull<u8>) -> Result<(), SlabError> {
    let _guard = self.guard();
    unsafe { self.free_locked(ptr) }
  }

  /// Usage snapshot, also written to the log at info level.
  pub fn stat(&self) -> PoolStat {
    let stat = {
      let _guard = self.guard();
      unsafe { self.stat_locked() }
    };
    stat.report();
    stat
  }

  /// Size reserved for the live allocation at `ptr`.
  pub fn usable_size(&self, ptr: NonNull<u8>) -> Option<usize> {
    let _guard = self.guard();
    let addr = ptr.as_ptr() as usize;
    let page = self.page_index(addr).ok()?;
    let nodes = unsafe { self.nodes_mut() };
    let offset = addr & (self.geometry.page_size - 1);

    let (shift, live) = match nodes[self.page_base() + page].state() {
      PageState::Small { shift } => {
        let chunk = offset >> shift;
        let bitmap = unsafe { self.bitmap_mut(page, shift) };
        let live = chunk >= self.geometry.bitmap_reserved(shift)
          && bitmap[chunk / WORD_BITS] & (1 << (chunk % WORD_BITS)) != 0;
        (shift, live)
      }
      PageState::Exact { map } => {
        let shift = self.geometry.exact_shift;
        (shift, map & (1 << (offset >> shift)) != 0)
      }
      PageState::Big { shift, map } => (shift, map & (1 << (offset >> shift)) != 0),
      PageState::Run { pages } if offset == 0 => return Some(pages << self.geometry.page_shift),
      _ => return None,
    };
    (live && offset & ((1 << shift) - 1) == 0).then_some(1 << shift)
  }

  /// [`SlabPool::alloc`] for a caller already holding the pool lock.
  pub unsafe fn alloc_locked(&self, size: usize) -> Result<NonNull<u8>, SlabError> {
    let nodes = unsafe { self.nodes_mut() };
    let chunk = match self.geometry.class_of(size) {
      None => self
        .alloc_pages(nodes, self.geometry.pages_for(size))
        .map(|node| self.page_ptr(node - self.page_base())),
      Some(shift) => self.alloc_chunk(nodes, shift),
    };

    match chunk {
      Some(ptr) => {
        debug!("slab alloc: {size} -> {ptr:p}");
        Ok(ptr)
      }
      None => {
        error!("slab alloc: {size} bytes failed: no memory");
        Err(SlabError::OutOfMemory { size })
      }
    }
  }

  /// [`SlabPool::free`] for a caller already holding the pool lock.
  pub unsafe fn free_locked(&self, ptr: NonNull<u8>) -> Result<(), SlabError> {
    debug!("slab free: {ptr:p}");
    let nodes = unsafe { self.nodes_mut() };
    match self.reclaim(nodes, ptr) {
      Ok(size) => {
        if self.junk_fill {
          unsafe { ptr::write_bytes(ptr.as_ptr(), JUNK_BYTE, size) };
        }
        Ok(())
      }
      Err(err) => {
        error!("slab free: {err}");
        Err(err)
      }
    }
  }

  /// [`SlabPool::stat`] for a caller already holding the pool lock. Does not log.
  pub unsafe fn stat_locked(&self) -> PoolStat {
    let nodes = unsafe { self.nodes_mut() };
    let geo = &self.geometry;
    let mut stat = PoolStat {
      pool_size: self.end - self.start.as_ptr() as usize,
      pages: self.pages,
      ..PoolStat::default()
    };

    let mut page = 0;
    while page < self.pages {
      let mut span = 1;
      match nodes[self.page_base() + page].state() {
        PageState::Small { shift } => {
          let bitmap = unsafe { self.bitmap_mut(page, shift) };
          let taken: usize = bitmap.iter().map(|w| w.count_ones() as usize).sum();
          stat.small.pages += 1;
          stat.small.bytes += (taken - geo.bitmap_reserved(shift)) << shift;
        }
        PageState::Exact { map } => {
          stat.exact.pages += 1;
          stat.exact.bytes += map.count_ones() as usize * geo.exact_size;
        }
        PageState::Big { shift, map } => {
          stat.big.pages += 1;
          stat.big.bytes += (map.count_ones() as usize) << shift;
        }
        PageState::Run { pages } => {
          stat.page.pages += pages;
          stat.page.bytes += pages << geo.page_shift;
          span = pages;
        }
        PageState::FreeRun { pages } => {
          stat.free_page += pages;
          stat.max_free_pages = stat.max_free_pages.max(pages);
          span = pages;
        }
        PageState::FreeInterior | PageState::RunInterior => {}
      }
      page += span.max(1);
    }

    stat.used_size = stat.small.bytes + stat.exact.bytes + stat.big.bytes + stat.page.bytes;
    stat.used_pct = stat.used_size * 100 / stat.pool_size;
    stat
  }

  fn guard(&self) -> LockGuard<'a, L> {
    self.lock.acquire();
    LockGuard(self.lock)
  }

  /// Index of the free-run anchor in the node table.
  fn free_anchor(&self) -> usize {
    self.geometry.slots()
  }

  /// Index of page 0's descriptor in the node table.
  fn page_base(&self) -> usize {
    self.geometry.slots() + 1
  }

  /// Page number of a data address. The single place pointers become indices.
  fn page_index(&self, addr: usize) -> Result<usize, SlabError> {
    let start = self.start.as_ptr() as usize;
    let page = addr.checked_sub(start).map(|off| off >> self.geometry.page_shift);
    match page {
      Some(page) if page < self.pages => Ok(page),
      _ => Err(SlabError::InvalidPointer {
        addr,
        reason: "outside of pool",
      }),
    }
  }

  fn page_ptr(&self, page: usize) -> NonNull<u8> {
    debug_assert!(page < self.pages);
    unsafe { self.start.add(page << self.geometry.page_shift) }
  }

  /// Caller holds the lock and no other reference into the node table is live.
  #[allow(clippy::mut_from_ref)]
  unsafe fn nodes_mut(&self) -> &mut [PageDesc] {
    unsafe { slice::from_raw_parts_mut(self.nodes.as_ptr(), self.node_count) }
  }

  /// Bitmap words at the head of a bitmap-tier page.
  #[allow(clippy::mut_from_ref)]
  unsafe fn bitmap_mut(&self, page: usize, shift: u32) -> &mut [usize] {
    let words = self.geometry.bitmap_words(shift);
    unsafe { slice::from_raw_parts_mut(self.page_ptr(page).cast::<usize>().as_ptr(), words) }
  }

  // ---------------------------------------------------------------------------
  // Page runs
  // ---------------------------------------------------------------------------

  /// First fit over the free-run list. Returns the node of the run head.
  fn alloc_pages(&self, nodes: &mut [PageDesc], pages: usize) -> Option<usize> {
    let anchor = self.free_anchor();
    let mut node = nodes[anchor].next as usize;

    while node != anchor {
      let run = nodes[node].slab;
      if run >= pages {
        if run > pages {
          let rest = node + pages;
          nodes[rest].slab = run - pages;
          nodes[rest].kind = PageKind::Page as u8;
          replace(nodes, node, rest);
        } else {
          unlink(nodes, node);
        }

        nodes[node] = PageDesc::chunk_page(PageKind::Page, pages | PAGE_START);
        for interior in &mut nodes[node + 1..node + pages] {
          *interior = PageDesc::chunk_page(PageKind::Page, PAGE_BUSY);
        }
        return Some(node);
      }
      node = nodes[node].next as usize;
    }

    error!("slab alloc of {pages} pages failed: no free run is long enough");
    None
  }

  fn free_pages(&self, nodes: &mut [PageDesc], node: usize, pages: usize) {
    nodes[node + 1..node + pages].fill(PageDesc::EMPTY);
    if nodes[node].link() == Linkage::Slotted {
      unlink(nodes, node);
    }

    nodes[node] = PageDesc::chunk_page(PageKind::Page, pages);
    push_front(nodes, self.free_anchor(), node, Linkage::Free);

    if self.page_merge {
      self.merge_runs(nodes, node);
    }
  }

  /// Coalesces the free run at `node` with free runs directly before and after it.
  fn merge_runs(&self, nodes: &mut [PageDesc], node: usize) {
    let base = self.page_base();
    let mut head = node;

    if node > base && nodes[node - 1].is_free() {
      // Walk back over the preceding run's interior; page 0 bounds the scan.
      let mut prev = node - 1;
      while nodes[prev].slab == 0 && prev > base {
        prev -= 1;
      }
      if nodes[prev].link() == Linkage::Free {
        unlink(nodes, node);
        nodes[prev].slab += nodes[node].slab;
        nodes[node] = PageDesc::EMPTY;
        head = prev;
      }
    }

    let next = head + nodes[head].slab;
    if next < base + self.pages && nodes[next].link() == Linkage::Free {
      unlink(nodes, next);
      nodes[head].slab += nodes[next].slab;
      nodes[next] = PageDesc::EMPTY;
    }
  }

  // ---------------------------------------------------------------------------
  // Chunks
  // ---------------------------------------------------------------------------

  fn alloc_chunk(&self, nodes: &mut [PageDesc], shift: u32) -> Option<NonNull<u8>> {
    let slot = self.geometry.slot_of(shift);
    let tier = self.geometry.tier(shift);

    let mut node = nodes[slot].next as usize;
    while node != slot {
      let next = nodes[node].next as usize;
      let chunk = match tier {
        Tier::Bitmap => self.take_bitmap_chunk(nodes, node, shift),
        Tier::Exact => self.take_exact_chunk(nodes, node),
        Tier::Big => self.take_big_chunk(nodes, node, shift),
      };
      if chunk.is_some() {
        return chunk;
      }
      node = next;
    }

    let node = self.alloc_pages(nodes, 1)?;
    Some(self.carve(nodes, node, shift, tier))
  }

  /// Turns a freshly granted page into a chunk page and takes its first chunk.
  fn carve(&self, nodes: &mut [PageDesc], node: usize, shift: u32, tier: Tier) -> NonNull<u8> {
    let page = node - self.page_base();
    let offset = match tier {
      Tier::Bitmap => {
        let reserved = self.geometry.bitmap_reserved(shift);
        let bitmap = unsafe { self.bitmap_mut(page, shift) };
        bitmap.fill(0);
        // Chunks under the bitmap are never handed out; the next one is.
        set_leading_bits(bitmap, reserved + 1);
        nodes[node] = PageDesc::chunk_page(PageKind::Small, shift as usize);
        reserved << shift
      }
      Tier::Exact => {
        nodes[node] = PageDesc::chunk_page(PageKind::Exact, 1);
        0
      }
      Tier::Big => {
        nodes[node] = PageDesc::chunk_page(PageKind::Big, (1 << MAP_SHIFT) | shift as usize);
        0
      }
    };

    push_front(nodes, self.geometry.slot_of(shift), node, Linkage::Slotted);
    unsafe { self.page_ptr(page).add(offset) }
  }

  fn take_bitmap_chunk(&self, nodes: &mut [PageDesc], node: usize, shift: u32) -> Option<NonNull<u8>> {
    let page = node - self.page_base();
    let bitmap = unsafe { self.bitmap_mut(page, shift) };
    let n = bitmap.iter().position(|&word| word != SLAB_BUSY)?;
    let bit = (!bitmap[n]).trailing_zeros() as usize;
    bitmap[n] |= 1 << bit;

    if bitmap[n..].iter().all(|&word| word == SLAB_BUSY) {
      unlink(nodes, node);
    }
    Some(unsafe { self.page_ptr(page).add((n * WORD_BITS + bit) << shift) })
  }

  fn take_exact_chunk(&self, nodes: &mut [PageDesc], node: usize) -> Option<NonNull<u8>> {
    let map = nodes[node].slab;
    if map == SLAB_BUSY {
      return None;
    }
    let bit = (!map).trailing_zeros() as usize;
    nodes[node].slab = map | 1 << bit;

    if nodes[node].slab == SLAB_BUSY {
      unlink(nodes, node);
    }
    let page = node - self.page_base();
    Some(unsafe { self.page_ptr(page).add(bit << self.geometry.exact_shift) })
  }

  fn take_big_chunk(&self, nodes: &mut [PageDesc], node: usize, shift: u32) -> Option<NonNull<u8>> {
    let mask = self.geometry.big_mask(shift);
    let slab = nodes[node].slab;
    if slab & MAP_MASK == mask {
      return None;
    }
    let bit = (!(slab >> MAP_SHIFT)).trailing_zeros() as usize;
    let slab = slab | 1 << (bit + MAP_SHIFT);
    nodes[node].slab = slab;

    if slab & MAP_MASK == mask {
      unlink(nodes, node);
    }
    let page = node - self.page_base();
    Some(unsafe { self.page_ptr(page).add(bit << shift) })
  }

  // ---------------------------------------------------------------------------
  // Reclaim
  // ---------------------------------------------------------------------------

  /// Clears the occupancy of `ptr` and returns how many bytes it released.
  /// Leaves the pool untouched on error.
  fn reclaim(&self, nodes: &mut [PageDesc], ptr: NonNull<u8>) -> Result<usize, SlabError> {
    let addr = ptr.as_ptr() as usize;
    let page = self.page_index(addr)?;
    let node = self.page_base() + page;
    let offset = addr & (self.geometry.page_size - 1);
    let misaligned = |shift: u32| offset & ((1 << shift) - 1) != 0;

    match nodes[node].state() {
      PageState::Small { shift } => {
        if misaligned(shift) {
          return Err(SlabError::MisalignedChunk { addr });
        }
        let chunk = offset >> shift;
        let reserved = self.geometry.bitmap_reserved(shift);
        if chunk < reserved {
          return Err(SlabError::InvalidPointer {
            addr,
            reason: "points into a page bitmap",
          });
        }

        let bitmap = unsafe { self.bitmap_mut(page, shift) };
        let (word, bit) = (chunk / WORD_BITS, 1usize << (chunk % WORD_BITS));
        if bitmap[word] & bit == 0 {
          return Err(SlabError::DoubleFree { addr });
        }
        bitmap[word] &= !bit;
        let in_use = bitmap_in_use(bitmap, reserved);

        self.relink_if_packed(nodes, node, shift);
        if !in_use {
          self.free_pages(nodes, node, 1);
        }
        Ok(1 << shift)
      }

      PageState::Exact { map } => {
        let shift = self.geometry.exact_shift;
        if misaligned(shift) {
          return Err(SlabError::MisalignedChunk { addr });
        }
        let bit = 1usize << (offset >> shift);
        if map & bit == 0 {
          return Err(SlabError::DoubleFree { addr });
        }

        self.relink_if_packed(nodes, node, shift);
        nodes[node].slab = map & !bit;
        if nodes[node].slab == 0 {
          self.free_pages(nodes, node, 1);
        }
        Ok(self.geometry.exact_size)
      }

      PageState::Big { shift, map } => {
        if misaligned(shift) {
          return Err(SlabError::MisalignedChunk { addr });
        }
        let bit = 1usize << (offset >> shift);
        if map & bit == 0 {
          return Err(SlabError::DoubleFree { addr });
        }

        self.relink_if_packed(nodes, node, shift);
        nodes[node].slab &= !(bit << MAP_SHIFT);
        if nodes[node].slab & MAP_MASK == 0 {
          self.free_pages(nodes, node, 1);
        }
        Ok(1 << shift)
      }

      _ if offset != 0 => Err(SlabError::MisalignedChunk { addr }),

      PageState::Run { pages } => {
        self.free_pages(nodes, node, pages);
        Ok(pages << self.geometry.page_shift)
      }

      PageState::RunInterior => Err(SlabError::InvalidPointer {
        addr,
        reason: "pointer to wrong page",
      }),

      PageState::FreeRun { .. } | PageState::FreeInterior => Err(SlabError::InvalidPointer {
        addr,
        reason: "page is already free",
      }),
    }
  }

  /// A full chunk page regains capacity: put it back on its slot.
  fn relink_if_packed(&self, nodes: &mut [PageDesc], node: usize, shift: u32) {
    if nodes[node].link() == Linkage::Packed {
      push_front(nodes, self.geometry.slot_of(shift), node, Linkage::Slotted);
    }
  }
}

impl<L: PoolLock> fmt::Debug for SlabPool<'_, L> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("SlabPool")
      .field("start", &self.start)
      .field("end", &(self.end as *const u8))
      .field("pages", &self.pages)
      .field("geometry", &self.geometry)
      .field("page_merge", &self.page_merge)
      .field("junk_fill", &self.junk_fill)
      .finish_non_exhaustive()
  }
}

// =============================================================================
// C API (enabled with --features c_api)
// =============================================================================

#[cfg(feature = "c_api")]
mod c_api {
  use core::{
    ffi::c_void,
    ptr::{NonNull, null_mut},
  };

  use log::error;

  use super::{PoolConfig, PoolStat, SlabPool};

  type Pool = SlabPool<'static>;

  unsafe fn pool<'p>(handle: *mut c_void) -> Option<&'p Pool> {
    unsafe { handle.cast::<Pool>().as_ref() }
  }

  fn into_handle(pool: Pool) -> *mut c_void {
    Box::into_raw(Box::new(pool)).cast()
  }

  #[unsafe(no_mangle)]
  pub unsafe extern "C" fn slab_pool_init(base: *mut u8, len: usize, min_shift: u32) -> *mut c_void {
    let Some(base) = NonNull::new(base) else {
      return null_mut();
    };
    let config = PoolConfig::default().with_min_shift(min_shift);
    match unsafe { SlabPool::init_raw(base, len, config) } {
      Ok(pool) => into_handle(pool),
      Err(err) => {
        error!("slab_pool_init: {err}");
        null_mut()
      }
    }
  }

  #[unsafe(no_mangle)]
  pub unsafe extern "C" fn slab_pool_attach(base: *mut u8, len: usize) -> *mut c_void {
    let Some(base) = NonNull::new(base) else {
      return null_mut();
    };
    match unsafe { SlabPool::attach(base, len) } {
      Ok(pool) => into_handle(pool),
      Err(err) => {
        error!("slab_pool_attach: {err}");
        null_mut()
      }
    }
  }

  #[unsafe(no_mangle)]
  pub unsafe extern "C" fn slab_pool_alloc(handle: *mut c_void, size: usize) -> *mut u8 {
    match unsafe { pool(handle) } {
      Some(pool) => pool.alloc(size).map_or(null_mut(), NonNull::as_ptr),
      None => null_mut(),
    }
  }

  #[unsafe(no_mangle)]
  pub unsafe extern "C" fn slab_pool_free(handle: *mut c_void, ptr: *mut u8) {
    if let (Some(pool), Some(ptr)) = (unsafe { pool(handle) }, NonNull::new(ptr)) {
      let _ = pool.free(ptr);
    }
  }

  /// Returns 0 on success, -1 on a null handle or output.
  #[unsafe(no_mangle)]
  pub unsafe extern "C" fn slab_pool_stat(handle: *mut c_void, out: *mut PoolStat) -> i32 {
    match unsafe { pool(handle) } {
      Some(pool) if !out.is_null() => {
        unsafe { out.write(pool.stat()) };
        0
      }
      _ => -1,
    }
  }

  /// Drops the handle. The arena and its pool are left intact.
  #[unsafe(no_mangle)]
  pub unsafe extern "C" fn slab_pool_release(handle: *mut c_void) {
    if !handle.is_null() {
      drop(unsafe { Box::from_raw(handle.cast::<Pool>()) });
    }
  }
}

// =============================================================================
// Utils
// =============================================================================

/// Rounds `x` up to the next multiple of alignment `align`. Alignment must be a power of 2.
#[inline(always)]
const fn align_up(x: usize, align: usize) -> usize {
  let mask = align - 1;
  (x + mask) & !mask
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
impl<L: PoolLock> SlabPool<'_, L> {
  fn snapshot(&self) -> Vec<PageDesc> {
    let _guard = self.guard();
    unsafe { self.nodes_mut() }.to_vec()
  }

  /// `(first page, length)` of every free run, in page order.
  fn free_runs(&self) -> Vec<(usize, usize)> {
    let _guard = self.guard();
    let nodes = unsafe { self.nodes_mut() };
    let anchor = self.free_anchor();
    let mut runs = Vec::new();
    let mut node = nodes[anchor].next as usize;
    while node != anchor {
      runs.push((node - self.page_base(), nodes[node].slab));
      node = nodes[node].next as usize;
    }
    runs.sort_unstable();
    runs
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::collections::BTreeMap;

  const PAGE: usize = 4096;

  fn config() -> PoolConfig {
    PoolConfig::default().with_page_size(PAGE).with_min_shift(3)
  }

  fn page_of(pool: &SlabPool, ptr: NonNull<u8>) -> usize {
    pool.page_index(ptr.as_ptr() as usize).unwrap()
  }

  #[test]
  fn geometry_matches_word_width() {
    let geo = Geometry::new(PAGE, 3).unwrap();
    assert_eq!(geo.max_size(), 2048);
    assert_eq!(geo.exact_size(), PAGE / WORD_BITS);
    assert_eq!(geo.slots(), 9);
    assert_eq!(geo.class_of(0), Some(3));
    assert_eq!(geo.class_of(8), Some(3));
    assert_eq!(geo.class_of(9), Some(4));
    assert_eq!(geo.class_of(2047), Some(11));
    assert_eq!(geo.class_of(2048), None);
    assert_eq!(geo.rounded_size(2049), PAGE);
    assert_eq!(geo.rounded_size(PAGE + 1), 2 * PAGE);
  }

  #[test]
  fn geometry_rejects_bad_parameters() {
    assert!(matches!(Geometry::new(3000, 3), Err(SlabError::InvalidConfig(_))));
    assert!(matches!(Geometry::new(128, 3), Err(SlabError::InvalidConfig(_))));
    assert!(matches!(Geometry::new(1 << 17, 3), Err(SlabError::InvalidConfig(_))));
    assert!(matches!(Geometry::new(PAGE, 0), Err(SlabError::InvalidConfig(_))));
    assert!(matches!(Geometry::new(PAGE, 11), Err(SlabError::InvalidConfig(_))));
  }

  #[test]
  fn init_rejects_tiny_arena() {
    let mut arena = vec![0u8; PAGE];
    assert!(matches!(
      SlabPool::init(&mut arena, config()),
      Err(SlabError::ArenaTooSmall { .. })
    ));
  }

  #[test]
  fn init_hands_whole_data_region_to_one_free_run() {
    let mut arena = vec![0u8; 256 * 1024];
    let pool = SlabPool::init(&mut arena, config()).unwrap();
    assert!(pool.pages() >= 60);
    assert_eq!(pool.start.as_ptr() as usize % PAGE, 0);
    assert!(pool.end - pool.start.as_ptr() as usize >= pool.pages() * PAGE);
    assert_eq!(pool.free_runs(), vec![(0, pool.pages())]);

    let stat = pool.stat();
    assert_eq!(stat.used_size, 0);
    assert_eq!(stat.free_page, pool.pages());
    assert_eq!(stat.max_free_pages, pool.pages());
  }

  #[test]
  fn init_is_deterministic() {
    let mut arena = vec![0u8; 256 * 1024];
    let first = SlabPool::init(&mut arena, config()).unwrap().snapshot();
    let second = SlabPool::init(&mut arena, config()).unwrap().snapshot();
    assert_eq!(first, second);
  }

  #[test]
  fn alloc_then_free_restores_descriptors() {
    let mut arena = vec![0u8; 1 << 20];
    let pool = SlabPool::init(&mut arena, config()).unwrap();

    for size in [1, 7, 8, 63, 64, 65, 2047, 2048, 2049, 3 * PAGE] {
      let before = pool.snapshot();
      let ptr = pool.alloc(size).unwrap();
      assert_ne!(pool.snapshot(), before, "size {size}");
      pool.free(ptr).unwrap();
      assert_eq!(pool.snapshot(), before, "size {size}");
    }
  }

  #[test]
  fn sizes_land_in_expected_tiers() {
    let mut arena = vec![0u8; 1 << 20];
    let pool = SlabPool::init(&mut arena, config()).unwrap();
    let exact = pool.geometry().exact_size();

    let small = pool.alloc(exact / 2).unwrap();
    let exact_chunk = pool.alloc(exact).unwrap();
    let big = pool.alloc(exact * 2).unwrap();
    let run = pool.alloc(2048).unwrap();

    let nodes = pool.snapshot();
    let kind = |ptr| nodes[pool.page_base() + page_of(&pool, ptr)].kind();
    assert_eq!(kind(small), PageKind::Small);
    assert_eq!(kind(exact_chunk), PageKind::Exact);
    assert_eq!(kind(big), PageKind::Big);
    assert_eq!(kind(run), PageKind::Page);
  }

  #[test]
  fn bitmap_page_skips_its_own_bitmap() {
    let mut arena = vec![0u8; 1 << 20];
    let pool = SlabPool::init(&mut arena, config()).unwrap();

    // 8-byte chunks: 512 bits = 64 bytes of bitmap = 8 reserved chunks.
    let first = pool.alloc(8).unwrap();
    assert_eq!(first.as_ptr() as usize % PAGE, 64);

    let page_start = pool.page_ptr(page_of(&pool, first));
    assert!(matches!(
      pool.free(page_start),
      Err(SlabError::InvalidPointer { .. })
    ));
    pool.free(first).unwrap();
  }

  #[test]
  fn full_pages_leave_and_rejoin_their_slot() {
    let mut arena = vec![0u8; 1 << 20];
    let pool = SlabPool::init(&mut arena, config()).unwrap();
    let exact = pool.geometry().exact_size();

    let chunks: Vec<_> = (0..WORD_BITS).map(|_| pool.alloc(exact).unwrap()).collect();
    let page = page_of(&pool, chunks[0]);
    assert!(chunks.iter().all(|&c| page_of(&pool, c) == page));

    let node = pool.page_base() + page;
    assert_eq!(pool.snapshot()[node].link(), Linkage::Packed);
    assert_eq!(pool.snapshot()[node].slab, SLAB_BUSY);

    pool.free(chunks[5]).unwrap();
    assert_eq!(pool.snapshot()[node].link(), Linkage::Slotted);
    assert_eq!(pool.alloc(exact).unwrap(), chunks[5]);
    assert_eq!(pool.snapshot()[node].link(), Linkage::Packed);
  }

  #[test]
  fn big_page_fills_after_page_size_over_chunk_size_allocations() {
    let mut arena = vec![0u8; 1 << 20];
    let pool = SlabPool::init(&mut arena, config()).unwrap();

    let chunks: Vec<_> = (0..4).map(|_| pool.alloc(1024).unwrap()).collect();
    let page = page_of(&pool, chunks[0]);
    assert!(chunks.iter().all(|&c| page_of(&pool, c) == page));
    assert_eq!(pool.snapshot()[pool.page_base() + page].link(), Linkage::Packed);

    let fifth = pool.alloc(1024).unwrap();
    assert_ne!(page_of(&pool, fifth), page);
  }

  #[test]
  fn double_free_is_rejected_and_siblings_survive() {
    let mut arena = vec![0u8; 1 << 20];
    let pool = SlabPool::init(&mut arena, config()).unwrap();

    let a = pool.alloc(32).unwrap();
    let b = pool.alloc(32).unwrap();
    let c = pool.alloc(32).unwrap();
    pool.free(b).unwrap();

    let before = pool.snapshot();
    assert_eq!(
      pool.free(b),
      Err(SlabError::DoubleFree {
        addr: b.as_ptr() as usize
      })
    );
    assert_eq!(pool.snapshot(), before);
    assert_eq!(pool.stat().used_size, 64);

    pool.free(a).unwrap();
    pool.free(c).unwrap();
    assert_eq!(pool.free_runs(), vec![(0, pool.pages())]);
  }

  #[test]
  fn exact_and_big_pages_reject_double_and_misaligned_frees() {
    let mut arena = vec![0u8; 1 << 20];
    let pool = SlabPool::init(&mut arena, config()).unwrap();

    for size in [pool.geometry().exact_size(), 1024] {
      let freed = pool.alloc(size).unwrap();
      let sibling = pool.alloc(size).unwrap();
      assert_eq!(page_of(&pool, freed), page_of(&pool, sibling));
      pool.free(freed).unwrap();

      let before = pool.snapshot();
      assert_eq!(
        pool.free(freed),
        Err(SlabError::DoubleFree {
          addr: freed.as_ptr() as usize
        }),
        "size {size}"
      );
      assert!(
        matches!(
          pool.free(unsafe { sibling.add(8) }),
          Err(SlabError::MisalignedChunk { .. })
        ),
        "size {size}"
      );
      assert_eq!(pool.snapshot(), before, "size {size}");
      assert_eq!(pool.usable_size(sibling), Some(size));

      pool.free(sibling).unwrap();
    }
    assert_eq!(pool.stat().used_size, 0);
    assert_eq!(pool.free_runs(), vec![(0, pool.pages())]);
  }

  #[test]
  fn page_aligned_arenas_never_gain_a_page() {
    let mut backing = vec![0u8; 2_070_000 + PAGE];
    let skew = backing.as_ptr().align_offset(PAGE);
    let arena = &mut backing[skew..];

    let mut lens = vec![651_264, 1_355_776, 1_355_784, 2_060_288, 2_060_296, 2_060_304];
    lens.extend((2_055_000..2_066_000).step_by(8));
    for len in lens {
      let pool = SlabPool::init(&mut arena[..len], config())
        .unwrap_or_else(|err| panic!("arena of {len} bytes: {err}"));
      let descriptors = pool.node_count - pool.page_base();
      assert!(pool.pages() <= descriptors, "arena of {len} bytes");
      assert!(
        pool.start.as_ptr() as usize + pool.pages() * PAGE <= pool.end,
        "arena of {len} bytes"
      );
      assert_eq!(pool.free_runs(), vec![(0, pool.pages())]);
    }
  }

  #[test]
  fn foreign_pointers_leave_pool_untouched() {
    let mut arena = vec![0u8; 1 << 20];
    let pool = SlabPool::init(&mut arena, config()).unwrap();
    let live = pool.alloc(100).unwrap();

    let mut outside = 0u64;
    let before = pool.snapshot();
    assert!(matches!(
      pool.free(NonNull::from(&mut outside).cast()),
      Err(SlabError::InvalidPointer { .. })
    ));

    let table = pool.nodes.cast::<u8>();
    assert!(matches!(pool.free(table), Err(SlabError::InvalidPointer { .. })));
    assert_eq!(pool.snapshot(), before);
    assert_eq!(pool.usable_size(live), Some(128));
  }

  #[test]
  fn misaligned_and_interior_pointers_are_rejected() {
    let mut arena = vec![0u8; 1 << 20];
    let pool = SlabPool::init(&mut arena, config()).unwrap();

    let chunk = pool.alloc(32).unwrap();
    let run = pool.alloc(2 * PAGE).unwrap();
    let before = pool.snapshot();

    assert!(matches!(
      pool.free(unsafe { chunk.add(1) }),
      Err(SlabError::MisalignedChunk { .. })
    ));
    assert!(matches!(
      pool.free(unsafe { run.add(8) }),
      Err(SlabError::MisalignedChunk { .. })
    ));
    assert!(matches!(
      pool.free(unsafe { run.add(PAGE) }),
      Err(SlabError::InvalidPointer { .. })
    ));
    assert_eq!(pool.snapshot(), before);

    pool.free(run).unwrap();
    assert!(matches!(pool.free(run), Err(SlabError::InvalidPointer { .. })));
  }

  #[test]
  fn exhaustion_stops_at_theoretical_capacity() {
    let mut arena = vec![0u8; 64 * 1024];
    let pool = SlabPool::init(&mut arena, config()).unwrap();
    let per_page = PAGE / 32 - pool.geometry().bitmap_reserved(5);

    let mut count = 0;
    let err = loop {
      match pool.alloc(32) {
        Ok(_) => count += 1,
        Err(err) => break err,
      }
    };
    assert_eq!(err, SlabError::OutOfMemory { size: 32 });
    assert_eq!(count, pool.pages() * per_page);
    assert_eq!(pool.stat().free_page, 0);
  }

  #[test]
  fn adjacent_runs_coalesce_when_merging() {
    let mut arena = vec![0u8; 256 * 1024];
    let pool = SlabPool::init(&mut arena, config()).unwrap();
    let total = pool.pages();

    let runs: Vec<_> = (0..4).map(|_| pool.alloc(PAGE).unwrap()).collect();
    for i in [1, 3, 0, 2] {
      pool.free(runs[i]).unwrap();
    }
    assert_eq!(pool.free_runs(), vec![(0, total)]);
    assert_eq!(pool.stat().max_free_pages, total);
  }

  #[test]
  fn runs_stay_split_without_merging() {
    let mut arena = vec![0u8; 256 * 1024];
    let pool = SlabPool::init(&mut arena, config().with_page_merge(false)).unwrap();
    let total = pool.pages();

    let runs: Vec<_> = (0..4).map(|_| pool.alloc(PAGE).unwrap()).collect();
    for i in [1, 3, 0, 2] {
      pool.free(runs[i]).unwrap();
    }
    assert_eq!(
      pool.free_runs(),
      vec![(0, 1), (1, 1), (2, 1), (3, 1), (4, total - 4)]
    );
    assert_eq!(pool.stat().free_page, total);
  }

  #[test]
  fn backward_merge_walks_to_a_run_at_the_first_page() {
    let mut arena = vec![0u8; 256 * 1024];
    let pool = SlabPool::init(&mut arena, config()).unwrap();
    let total = pool.pages();

    let head = pool.alloc(3 * PAGE).unwrap();
    let tail = pool.alloc(PAGE).unwrap();
    let guard = pool.alloc(PAGE).unwrap();
    assert_eq!(page_of(&pool, head), 0);

    pool.free(head).unwrap();
    assert_eq!(pool.free_runs(), vec![(0, 3), (5, total - 5)]);
    pool.free(tail).unwrap();
    assert_eq!(pool.free_runs(), vec![(0, 4), (5, total - 5)]);
    pool.free(guard).unwrap();
    assert_eq!(pool.free_runs(), vec![(0, total)]);
  }

  #[test]
  fn stat_counts_rounded_sizes_per_tier() {
    let mut arena = vec![0u8; 1 << 20];
    let pool = SlabPool::init(&mut arena, config()).unwrap();
    let geo = *pool.geometry();

    let sizes = [1, 20, 32, 64, 100, 500, 1500, 2048, 5000, 9000, 33, 17];
    let ptrs: Vec<_> = sizes.iter().map(|&s| pool.alloc(s).unwrap()).collect();
    for (i, &ptr) in ptrs.iter().enumerate() {
      if i % 4 == 1 {
        pool.free(ptr).unwrap();
      }
    }

    let expected: usize = sizes
      .iter()
      .enumerate()
      .filter(|(i, _)| i % 4 != 1)
      .map(|(_, &s)| geo.rounded_size(s))
      .sum();
    let stat = pool.stat();
    assert_eq!(stat.used_size, expected);
    assert_eq!(stat.used_pct, expected * 100 / stat.pool_size);
    assert_eq!(stat.page.bytes, geo.rounded_size(2048) + geo.rounded_size(5000));
    assert_eq!(stat.page.pages, 1 + 2);
    assert_eq!(stat.pages, pool.pages());
    assert_eq!(
      stat.free_page + stat.page.pages + stat.small.pages + stat.exact.pages + stat.big.pages,
      pool.pages()
    );
  }

  #[test]
  fn live_chunks_never_overlap() {
    let mut arena = vec![0u8; 2 << 20];
    let pool = SlabPool::init(&mut arena, config()).unwrap();
    let geo = *pool.geometry();

    let mut live: Vec<(NonNull<u8>, usize)> = Vec::new();
    let mut seed = 0x2545_f491_4f6c_dd1du64;
    let mut next = move || {
      seed ^= seed << 13;
      seed ^= seed >> 7;
      seed ^= seed << 17;
      seed as usize
    };

    for _ in 0..4000 {
      if live.is_empty() || next() % 3 != 0 {
        let size = 1 + next() % 6000;
        if let Ok(ptr) = pool.alloc(size) {
          assert!(pool.contains(ptr.as_ptr()));
          live.push((ptr, geo.rounded_size(size)));
        }
      } else {
        let (ptr, _) = live.swap_remove(next() % live.len());
        pool.free(ptr).unwrap();
      }

      let mut ranges = BTreeMap::new();
      for &(ptr, len) in &live {
        assert!(ranges.insert(ptr.as_ptr() as usize, len).is_none());
      }
      let mut prev_end = 0;
      for (&start, &len) in &ranges {
        assert!(start >= prev_end, "chunk at {start:#x} overlaps its predecessor");
        prev_end = start + len;
      }
    }

    let expected: usize = live.iter().map(|&(_, len)| len).sum();
    assert_eq!(pool.stat().used_size, expected);
    for (ptr, _) in live {
      pool.free(ptr).unwrap();
    }
    assert_eq!(pool.free_runs(), vec![(0, pool.pages())]);
  }

  #[test]
  fn junk_fill_poisons_freed_chunks() {
    let mut arena = vec![0u8; 256 * 1024];
    let pool = SlabPool::init(&mut arena, config().with_junk_fill(true)).unwrap();

    let keep = pool.alloc(64).unwrap();
    let ptr = pool.alloc(64).unwrap();
    unsafe { ptr::write_bytes(ptr.as_ptr(), 0, 64) };
    pool.free(ptr).unwrap();

    let bytes = unsafe { slice::from_raw_parts(ptr.as_ptr(), 64) };
    assert!(bytes.iter().all(|&b| b == JUNK_BYTE));
    pool.free(keep).unwrap();
  }

  #[test]
  fn usable_size_tracks_live_chunks() {
    let mut arena = vec![0u8; 256 * 1024];
    let pool = SlabPool::init(&mut arena, config()).unwrap();

    let chunk = pool.alloc(20).unwrap();
    let run = pool.alloc(5000).unwrap();
    assert_eq!(pool.usable_size(chunk), Some(32));
    assert_eq!(pool.usable_size(run), Some(2 * PAGE));

    pool.free(chunk).unwrap();
    assert_eq!(pool.usable_size(chunk), None);
    assert_eq!(pool.usable_size(unsafe { run.add(PAGE) }), None);
  }

  #[test]
  fn parking_lot_mutex_serializes_threads() {
    let mutex = <parking_lot::RawMutex as RawMutexApi>::INIT;
    let mut arena = vec![0u8; 4 << 20];
    let pool = SlabPool::init(&mut arena, config()).unwrap().with_lock(&mutex);

    std::thread::scope(|scope| {
      for t in 0..4 {
        let pool = &pool;
        scope.spawn(move || {
          for round in 0..200 {
            let ptrs: Vec<_> = (0..16)
              .map(|i| pool.alloc(8 + (t * 97 + round * 13 + i * 31) % 3000).unwrap())
              .collect();
            for ptr in ptrs {
              pool.free(ptr).unwrap();
            }
          }
        });
      }
    });

    assert_eq!(pool.stat().used_size, 0);
    assert_eq!(pool.free_runs(), vec![(0, pool.pages())]);
  }
}
