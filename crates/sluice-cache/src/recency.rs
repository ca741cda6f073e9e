use crate::entry::Entry;

/// Sentinel index meaning "no node".
pub const NIL: u32 = u32::MAX;

struct Link {
    entry: Entry,
    prev: u32,
    next: u32,
}

/// Arena-backed doubly-linked recency ordering, front = most recently used.
///
/// Entries live in a `Vec<Option<Link>>` and are addressed by `u32` handles
/// that stay stable for the lifetime of the entry. `prev`/`next` are indices
/// into the same vector, so there are no owning back-pointers. Freed slots go
/// on a free list and are reused before the vector grows.
///
/// All structural operations (`detach`, `insert_front`, `remove_tail`) are O(1).
pub struct RecencyList {
    slots: Vec<Option<Link>>,
    free_list: Vec<u32>,
    head: u32,
    tail: u32,
    len: usize,
}

impl RecencyList {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            free_list: Vec::new(),
            head: NIL,
            tail: NIL,
            len: 0,
        }
    }

    /// Number of entries currently linked into the ordering.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Handle of the most recently used entry, or `NIL`.
    #[inline]
    pub fn head(&self) -> u32 {
        self.head
    }

    /// Handle of the least recently used entry, or `NIL`.
    #[inline]
    pub fn tail(&self) -> u32 {
        self.tail
    }

    #[inline]
    pub fn get(&self, index: u32) -> Option<&Entry> {
        self.link(index).map(|l| &l.entry)
    }

    #[inline]
    pub fn get_mut(&mut self, index: u32) -> Option<&mut Entry> {
        self.link_mut(index).map(|l| &mut l.entry)
    }

    /// Store `entry` in a free slot and link it at the front.
    pub fn push_front(&mut self, entry: Entry) -> u32 {
        let link = Link {
            entry,
            prev: NIL,
            next: NIL,
        };
        let index = match self.free_list.pop() {
            Some(index) => {
                self.slots[index as usize] = Some(link);
                index
            }
            None => {
                self.slots.push(Some(link));
                (self.slots.len() - 1) as u32
            }
        };
        self.insert_front(index);
        index
    }

    /// Unlink a node from wherever it sits. The slot stays allocated so the
    /// node can be relinked with `insert_front`.
    pub fn detach(&mut self, index: u32) {
        let (prev, next) = match self.link(index) {
            Some(link) => (link.prev, link.next),
            None => return,
        };
        // An unlinked node has no prev and is not the head.
        if prev == NIL && self.head != index {
            return;
        }

        if prev != NIL {
            if let Some(p) = self.link_mut(prev) {
                p.next = next;
            }
        } else {
            self.head = next;
        }

        if next != NIL {
            if let Some(n) = self.link_mut(next) {
                n.prev = prev;
            }
        } else {
            self.tail = prev;
        }

        if let Some(link) = self.link_mut(index) {
            link.prev = NIL;
            link.next = NIL;
        }
        self.len -= 1;
    }

    /// Link a detached node immediately after the head position.
    pub fn insert_front(&mut self, index: u32) {
        let old_head = self.head;
        match self.link_mut(index) {
            Some(link) => {
                link.prev = NIL;
                link.next = old_head;
            }
            None => return,
        }

        if old_head != NIL {
            if let Some(h) = self.link_mut(old_head) {
                h.prev = index;
            }
        } else {
            self.tail = index;
        }

        self.head = index;
        self.len += 1;
    }

    /// Promote a linked node to most recently used.
    pub fn move_to_front(&mut self, index: u32) {
        if self.head == index {
            return;
        }
        self.detach(index);
        self.insert_front(index);
    }

    /// Unlink a node and release its slot, returning the entry.
    pub fn remove(&mut self, index: u32) -> Option<Entry> {
        self.link(index)?;
        self.detach(index);
        let link = self.slots[index as usize].take()?;
        self.free_list.push(index);
        Some(link.entry)
    }

    /// Remove and return the least recently used entry.
    pub fn remove_tail(&mut self) -> Option<Entry> {
        if self.tail == NIL {
            return None;
        }
        self.remove(self.tail)
    }

    pub fn clear(&mut self) {
        self.slots.clear();
        self.free_list.clear();
        self.head = NIL;
        self.tail = NIL;
        self.len = 0;
    }

    /// Walk entries from most to least recently used without touching them.
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            list: self,
            cursor: self.head,
        }
    }

    #[inline]
    fn link(&self, index: u32) -> Option<&Link> {
        self.slots.get(index as usize).and_then(|s| s.as_ref())
    }

    #[inline]
    fn link_mut(&mut self, index: u32) -> Option<&mut Link> {
        self.slots.get_mut(index as usize).and_then(|s| s.as_mut())
    }
}

pub struct Iter<'a> {
    list: &'a RecencyList,
    cursor: u32,
}

impl<'a> Iterator for Iter<'a> {
    type Item = &'a Entry;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor == NIL {
            return None;
        }
        let link = self.list.link(self.cursor)?;
        self.cursor = link.next;
        Some(&link.entry)
    }
}
