use crate::util::constants::LOG_BYTES_IN_WORD;
use crate::util::Address;

/// A stable index into a [`ChunkArena`].
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct ChunkId(usize);

/// Which list a chunk is on.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum ListKind {
    Used,
    Unused,
}

/// The bookkeeping of one chunk of heap memory. A used chunk holds exactly one object, which starts
/// at `start`.
#[derive(Debug)]
pub struct ChunkNode {
    pub start: Address,
    /// Size of the chunk in words, object header included.
    pub words: usize,
    /// The mark parity at which the chunk was last proven live.
    pub mark: bool,
    /// Run the type's finalizer when the object dies.
    pub finalize: bool,
    list: ListKind,
    prev: Option<ChunkId>,
    next: Option<ChunkId>,
}

impl ChunkNode {
    pub fn bytes(&self) -> usize {
        self.words << LOG_BYTES_IN_WORD
    }

    pub fn end(&self) -> Address {
        self.start + self.bytes()
    }

    pub fn list(&self) -> ListKind {
        self.list
    }
}

/// Owner of all chunk nodes. Nodes are never freed, so a [`ChunkId`] stays valid for the life of
/// the arena.
#[derive(Default)]
pub struct ChunkArena {
    nodes: Vec<ChunkNode>,
}

impl ChunkArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an unlinked node.
    pub fn create(&mut self, start: Address, words: usize, list: ListKind) -> ChunkId {
        self.nodes.push(ChunkNode {
            start,
            words,
            mark: false,
            finalize: false,
            list,
            prev: None,
            next: None,
        });
        ChunkId(self.nodes.len() - 1)
    }

    pub fn get(&self, id: ChunkId) -> &ChunkNode {
        &self.nodes[id.0]
    }

    pub fn get_mut(&mut self, id: ChunkId) -> &mut ChunkNode {
        &mut self.nodes[id.0]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// A doubly linked list of chunks, threaded through the arena.
#[derive(Debug)]
pub struct ChunkList {
    kind: ListKind,
    first: Option<ChunkId>,
    last: Option<ChunkId>,
    len: usize,
}

impl ChunkList {
    pub const fn new(kind: ListKind) -> Self {
        ChunkList {
            kind,
            first: None,
            last: None,
            len: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.first.is_none()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn first(&self) -> Option<ChunkId> {
        self.first
    }

    pub fn last(&self) -> Option<ChunkId> {
        self.last
    }

    pub fn prev(&self, arena: &ChunkArena, id: ChunkId) -> Option<ChunkId> {
        arena.get(id).prev
    }

    // Push chunk to the front of the list
    pub fn push_front(&mut self, arena: &mut ChunkArena, id: ChunkId) {
        let old_first = self.first;
        {
            let node = arena.get_mut(id);
            node.list = self.kind;
            node.prev = None;
            node.next = old_first;
        }
        match old_first {
            Some(first) => arena.get_mut(first).prev = Some(id),
            None => self.last = Some(id),
        }
        self.first = Some(id);
        self.len += 1;
    }

    // Push chunk to the back of the list
    pub fn push_back(&mut self, arena: &mut ChunkArena, id: ChunkId) {
        let old_last = self.last;
        {
            let node = arena.get_mut(id);
            node.list = self.kind;
            node.prev = old_last;
            node.next = None;
        }
        match old_last {
            Some(last) => arena.get_mut(last).next = Some(id),
            None => self.first = Some(id),
        }
        self.last = Some(id);
        self.len += 1;
    }

    // Remove a chunk from the list
    pub fn remove(&mut self, arena: &mut ChunkArena, id: ChunkId) {
        let (prev, next) = {
            let node = arena.get_mut(id);
            debug_assert_eq!(node.list, self.kind, "{:?} is not on the {:?} list", id, self.kind);
            let links = (node.prev, node.next);
            node.prev = None;
            node.next = None;
            links
        };
        match prev {
            Some(prev) => arena.get_mut(prev).next = next,
            None => self.first = next,
        }
        match next {
            Some(next) => arena.get_mut(next).prev = prev,
            None => self.last = prev,
        }
        self.len -= 1;
    }

    pub fn move_to_front(&mut self, arena: &mut ChunkArena, id: ChunkId) {
        if self.first == Some(id) {
            return;
        }
        self.remove(arena, id);
        self.push_front(arena, id);
    }

    /// Iterate from the front.
    pub fn iter<'a>(&self, arena: &'a ChunkArena) -> impl Iterator<Item = ChunkId> + 'a {
        std::iter::successors(self.first, move |id| arena.get(*id).next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup(n: usize) -> (ChunkArena, ChunkList, Vec<ChunkId>) {
        let mut arena = ChunkArena::new();
        let mut list = ChunkList::new(ListKind::Used);
        let ids: Vec<ChunkId> = (0..n)
            .map(|i| arena.create(unsafe { Address::from_usize(0x1000 * (i + 1)) }, 4, ListKind::Used))
            .collect();
        for id in &ids {
            list.push_back(&mut arena, *id);
        }
        (arena, list, ids)
    }

    #[test]
    fn push_and_iterate() {
        let (arena, list, ids) = setup(3);
        assert_eq!(list.len(), 3);
        assert_eq!(list.iter(&arena).collect::<Vec<_>>(), ids);
        assert_eq!(list.first(), Some(ids[0]));
        assert_eq!(list.last(), Some(ids[2]));
    }

    #[test]
    fn remove_middle_and_ends() {
        let (mut arena, mut list, ids) = setup(4);
        list.remove(&mut arena, ids[1]);
        assert_eq!(list.iter(&arena).collect::<Vec<_>>(), vec![ids[0], ids[2], ids[3]]);
        list.remove(&mut arena, ids[0]);
        list.remove(&mut arena, ids[3]);
        assert_eq!(list.iter(&arena).collect::<Vec<_>>(), vec![ids[2]]);
        assert_eq!(list.first(), list.last());
        list.remove(&mut arena, ids[2]);
        assert!(list.is_empty());
        assert_eq!(list.last(), None);
    }

    #[test]
    fn move_to_front() {
        let (mut arena, mut list, ids) = setup(3);
        list.move_to_front(&mut arena, ids[2]);
        assert_eq!(list.iter(&arena).collect::<Vec<_>>(), vec![ids[2], ids[0], ids[1]]);
        assert_eq!(list.last(), Some(ids[1]));
        assert_eq!(list.prev(&arena, ids[1]), Some(ids[0]));
        list.move_to_front(&mut arena, ids[2]);
        assert_eq!(list.len(), 3);
    }

    #[test]
    fn moving_between_lists() {
        let (mut arena, mut used, ids) = setup(2);
        let mut unused = ChunkList::new(ListKind::Unused);
        used.remove(&mut arena, ids[0]);
        unused.push_front(&mut arena, ids[0]);
        assert_eq!(arena.get(ids[0]).list(), ListKind::Unused);
        assert_eq!(used.len() + unused.len(), 2);
        assert_eq!(arena.get(ids[0]).bytes(), 4 << LOG_BYTES_IN_WORD);
    }
}
