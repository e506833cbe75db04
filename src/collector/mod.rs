//! The mark-sweep collector and its chunk allocator.
//!
//! Every object lives in its own chunk. Chunks are carved from one heap region with a bump
//! cursor, or reused first-fit from the unused list. A chunk's mark is a parity bit: a collection
//! flips the global parity, so every chunk starts out unmarked without being touched. Marking moves
//! a chunk to the front of the used list. After marking, the unmarked chunks form the tail of the
//! used list, and the sweep pops them from there until it reaches a marked chunk.

pub mod chunk;
mod trace;

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use self::chunk::{ChunkArena, ChunkId, ChunkList, ListKind};
use crate::monitor::header::{HeaderWord, LockState, MARK_BIT};
use crate::threads::{Mutator, ThreadId, NO_THREAD};
use crate::util::constants::BYTES_IN_WORD;
use crate::util::os::memory;
use crate::util::{Address, RuntimeError};
use crate::vm::{ObjectReference, TypeDescriptor, OBJECT_HEADER_WORDS};

/// The smallest chunk: an object with an empty payload.
const MIN_CHUNK_WORDS: usize = OBJECT_HEADER_WORDS;

/// What a sweep found dead.
#[derive(Default, Debug)]
pub struct SweepResult {
    pub freed_bytes: usize,
    pub freed_objects: usize,
    /// Dead objects whose finalizer must run. Their memory stays untouched until the collector
    /// lock is released.
    pub finalizable: Vec<ObjectReference>,
    /// Dead objects that had a fat lock.
    pub inflated: Vec<ObjectReference>,
}

/// The state guarded by the collector lock.
pub struct MarkSweepSpace {
    mapping: Address,
    mapping_size: usize,
    cursor: Address,
    limit: Address,
    arena: ChunkArena,
    used: ChunkList,
    unused: ChunkList,
    /// The used chunk of each object, by object address.
    objects: HashMap<Address, ChunkId>,
    parity: bool,
    /// Bytes left to allocate before the next automatic collection.
    bytes_until_collection: isize,
    /// Bytes in used chunks.
    live_bytes: usize,
    /// Objects kept alive regardless of roots.
    pinned: Vec<ObjectReference>,
}

impl MarkSweepSpace {
    pub fn new(heap_size: usize, initial_budget: usize) -> Result<Self, RuntimeError> {
        let mapping = memory::mmap_anonymous(heap_size).map_err(RuntimeError::HeapReservation)?;
        debug!("Mapped a heap of {} bytes at {}", heap_size, mapping);
        Ok(MarkSweepSpace {
            mapping,
            mapping_size: heap_size,
            cursor: mapping,
            limit: (mapping + heap_size).align_down(BYTES_IN_WORD),
            arena: ChunkArena::new(),
            used: ChunkList::new(ListKind::Used),
            unused: ChunkList::new(ListKind::Unused),
            objects: HashMap::new(),
            parity: false,
            bytes_until_collection: initial_budget as isize,
            live_bytes: 0,
            pinned: Vec::new(),
        })
    }

    /// Allocate an object with `payload` zeroed payload words. The object is marked at the current
    /// parity and its header is unlocked. Returns `None` if no chunk is large enough.
    pub fn alloc_object(
        &mut self,
        ty: &'static TypeDescriptor,
        payload: usize,
    ) -> Option<ObjectReference> {
        let words = OBJECT_HEADER_WORDS.checked_add(payload)?;
        let id = self.take_free_chunk(words).or_else(|| self.carve(words))?;
        let (start, bytes) = {
            let node = self.arena.get_mut(id);
            node.mark = self.parity;
            node.finalize = ty.finalize.is_some();
            (node.start, node.bytes())
        };
        // Carved memory is fresh from the mapping, reused memory is not.
        unsafe { std::ptr::write_bytes(start.to_mut_ptr::<u8>(), 0, bytes) };
        let object = unsafe { ObjectReference::from_raw_address(start) }?;
        object.initialize(ty, HeaderWord::initial(self.parity), payload);
        self.used.push_front(&mut self.arena, id);
        self.objects.insert(start, id);
        self.live_bytes += bytes;
        self.bytes_until_collection -= bytes as isize;
        Some(object)
    }

    fn take_free_chunk(&mut self, words: usize) -> Option<ChunkId> {
        let id = self
            .unused
            .iter(&self.arena)
            .find(|id| self.arena.get(*id).words >= words)?;
        self.unused.remove(&mut self.arena, id);
        let spare = self.arena.get(id).words - words;
        if spare >= MIN_CHUNK_WORDS {
            let node = self.arena.get_mut(id);
            node.words = words;
            let rest_start = node.end();
            let rest = self.arena.create(rest_start, spare, ListKind::Unused);
            self.unused.push_front(&mut self.arena, rest);
        }
        Some(id)
    }

    fn carve(&mut self, words: usize) -> Option<ChunkId> {
        let bytes = words.checked_mul(BYTES_IN_WORD)?;
        if bytes > self.limit - self.cursor {
            return None;
        }
        let start = self.cursor;
        self.cursor += bytes;
        Some(self.arena.create(start, words, ListKind::Used))
    }

    pub fn parity(&self) -> bool {
        self.parity
    }

    /// Start a collection: every chunk becomes unmarked.
    pub fn flip_parity(&mut self) {
        self.parity = !self.parity;
    }

    pub fn is_object(&self, addr: Address) -> bool {
        self.objects.contains_key(&addr)
    }

    pub fn object_at(&self, addr: Address) -> Option<ObjectReference> {
        if self.is_object(addr) {
            unsafe { ObjectReference::from_raw_address(addr) }
        } else {
            None
        }
    }

    /// Mark the object at `addr` if it is an unmarked object. Returns the object if it was marked
    /// by this call.
    pub fn try_mark(&mut self, addr: Address) -> Option<ObjectReference> {
        let id = *self.objects.get(&addr)?;
        if self.arena.get(id).mark == self.parity {
            return None;
        }
        self.arena.get_mut(id).mark = self.parity;
        self.used.move_to_front(&mut self.arena, id);
        let object = unsafe { ObjectReference::from_raw_address(addr) }?;
        HeaderWord::new(object.header()).set_gc_bit(MARK_BIT, self.parity);
        Some(object)
    }

    /// Is `object` marked at the current parity?
    pub fn is_marked(&self, object: ObjectReference) -> bool {
        self.objects
            .get(&object.to_raw_address())
            .is_some_and(|id| self.arena.get(*id).mark == self.parity)
    }

    /// Mark everything reachable from `roots`. Pinned objects are roots too.
    pub fn mark(&mut self, roots: &[Address]) -> usize {
        let mut all_roots: Vec<Address> = self.pinned.iter().map(|o| o.to_raw_address()).collect();
        all_roots.extend_from_slice(roots);
        trace::mark_from_roots(self, &all_roots)
    }

    /// Reclaim every chunk left unmarked by [`MarkSweepSpace::mark`], then reset the budget.
    pub fn sweep(&mut self, min_heap: usize, max_heap: usize) -> SweepResult {
        let mut result = SweepResult::default();
        while let Some(id) = self.used.last() {
            let (start, bytes, finalize) = {
                let node = self.arena.get(id);
                if node.mark == self.parity {
                    break;
                }
                (node.start, node.bytes(), node.finalize)
            };
            self.used.remove(&mut self.arena, id);
            self.unused.push_front(&mut self.arena, id);
            self.objects.remove(&start);
            if let Some(object) = unsafe { ObjectReference::from_raw_address(start) } {
                if finalize {
                    result.finalizable.push(object);
                }
                if matches!(HeaderWord::new(object.header()).state(), LockState::Fat { .. }) {
                    result.inflated.push(object);
                }
            }
            self.live_bytes -= bytes;
            result.freed_bytes += bytes;
            result.freed_objects += 1;
        }
        self.bytes_until_collection = Self::budget(self.live_bytes, min_heap, max_heap);
        result
    }

    /// The allocation budget after a collection that left `live` bytes.
    fn budget(live: usize, min_heap: usize, max_heap: usize) -> isize {
        let target = live.saturating_mul(2).clamp(min_heap, max_heap.max(min_heap));
        target as isize - live as isize
    }

    /// Has the allocation budget run out?
    pub fn budget_exhausted(&self) -> bool {
        self.bytes_until_collection <= 0
    }

    pub fn bytes_until_collection(&self) -> isize {
        self.bytes_until_collection
    }

    pub fn live_bytes(&self) -> usize {
        self.live_bytes
    }

    /// Bytes the bump cursor has handed out so far.
    pub fn carved_bytes(&self) -> usize {
        self.cursor - self.mapping
    }

    pub fn used_objects(&self) -> Vec<ObjectReference> {
        self.used
            .iter(&self.arena)
            .filter_map(|id| unsafe {
                ObjectReference::from_raw_address(self.arena.get(id).start)
            })
            .collect()
    }

    pub fn used_chunks(&self) -> usize {
        self.used.len()
    }

    pub fn unused_chunks(&self) -> usize {
        self.unused.len()
    }

    /// Size in payload words that `object`'s chunk can hold.
    pub fn capacity(&self, object: ObjectReference) -> Option<usize> {
        let id = self.objects.get(&object.to_raw_address())?;
        Some(self.arena.get(*id).words - OBJECT_HEADER_WORDS)
    }

    /// Do not run the finalizer of `object` when it dies.
    pub fn suppress_finalizer(&mut self, object: ObjectReference) {
        if let Some(id) = self.objects.get(&object.to_raw_address()) {
            self.arena.get_mut(*id).finalize = false;
        }
    }

    pub fn pin(&mut self, object: ObjectReference) {
        self.pinned.push(object);
    }

    pub fn unpin(&mut self, object: ObjectReference) {
        if let Some(i) = self.pinned.iter().rposition(|o| *o == object) {
            self.pinned.swap_remove(i);
        }
    }
}

impl Drop for MarkSweepSpace {
    fn drop(&mut self) {
        if let Err(e) = memory::munmap(self.mapping, self.mapping_size) {
            warn!("Failed to unmap the heap at {}: {}", self.mapping, e);
        }
    }
}

/// The collector lock and the space it guards.
///
/// The lock records its holder so that a thread that already holds it, for example a finalizer
/// that allocates, fails loudly instead of deadlocking.
pub struct Collector {
    space: Mutex<MarkSweepSpace>,
    holder: AtomicUsize,
}

impl Collector {
    pub fn new(space: MarkSweepSpace) -> Self {
        Collector {
            space: Mutex::new(space),
            holder: AtomicUsize::new(NO_THREAD),
        }
    }

    /// Take the collector lock. Blocks in native mode if another thread holds it.
    pub fn lock(&self, mutator: &Mutator) -> CollectorGuard<'_> {
        let me = mutator.id();
        assert_ne!(
            self.holder.load(Ordering::SeqCst),
            me.0,
            "Thread {} takes the collector lock it already holds. Finalizers must not allocate.",
            me
        );
        let space = match self.space.try_lock() {
            Ok(space) => space,
            Err(_) => mutator.in_native(|| self.space.lock().unwrap()),
        };
        self.holder.store(me.0, Ordering::SeqCst);
        CollectorGuard {
            space,
            holder: &self.holder,
        }
    }

    pub fn holder(&self) -> Option<ThreadId> {
        match self.holder.load(Ordering::SeqCst) {
            NO_THREAD => None,
            id => Some(ThreadId(id)),
        }
    }
}

pub struct CollectorGuard<'a> {
    space: MutexGuard<'a, MarkSweepSpace>,
    holder: &'a AtomicUsize,
}

impl Deref for CollectorGuard<'_> {
    type Target = MarkSweepSpace;
    fn deref(&self) -> &MarkSweepSpace {
        &self.space
    }
}

impl DerefMut for CollectorGuard<'_> {
    fn deref_mut(&mut self) -> &mut MarkSweepSpace {
        &mut self.space
    }
}

impl Drop for CollectorGuard<'_> {
    fn drop(&mut self) {
        self.holder.store(NO_THREAD, Ordering::SeqCst);
    }
}

/// Bytes occupied by an object with `payload` words.
pub const fn object_bytes(payload: usize) -> usize {
    OBJECT_HEADER_WORDS
        .saturating_add(payload)
        .saturating_mul(BYTES_IN_WORD)
}
