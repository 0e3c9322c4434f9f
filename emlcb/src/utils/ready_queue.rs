use crate::core::{Priority, PrioritySet};
use crate::utils::DuplexArray;

const CLASS_COUNT: usize = Priority::MAX.into_u8() as usize + 1;

pub const MAX_CAPACITY: usize = u8::MAX as usize + 1 - CLASS_COUNT;

#[derive(Clone, Copy)]
struct Node {
    next: u8,
    prev: u8,
}

/// Per-priority FIFO queues of entry indices
///
/// Each priority class is a cyclic doubly-linked list threaded through a shared node array:
/// the first `CLASS_COUNT` nodes are list heads, the rest stand for entries. An entry is
/// queued at most once, in at most one class.
pub struct ReadyQueue<const N: usize> {
    nodes: DuplexArray<Node, CLASS_COUNT, N>,
    // Superset of non-empty classes
    classes: PrioritySet,
}

impl<const N: usize> ReadyQueue<N> {
    const _ASSERT: usize = MAX_CAPACITY - N;
    const ENTRY_OFFSET: u8 = CLASS_COUNT as u8;

    pub fn new() -> Self {
        let _ = Self::_ASSERT;
        Self {
            nodes: DuplexArray::from_fn(|i| {
                let node = unwrap!(u8::try_from(i));
                Node {
                    next: node,
                    prev: node,
                }
            }),
            classes: PrioritySet::NONE,
        }
    }

    pub fn contains(&self, entry: u8) -> bool {
        assert!(usize::from(entry) < N);
        let node = Self::ENTRY_OFFSET + entry;
        self.nodes[usize::from(node)].next != node
    }

    pub fn is_empty(&self) -> bool {
        self.classes
            .into_iter()
            .all(|class| self.front(class).is_none())
    }

    /// Appends the entry to the class queue. Returns false if the entry is already queued.
    pub fn push_back(&mut self, class: Priority, entry: u8) -> bool {
        if self.contains(entry) {
            return false;
        }
        let head = class.into_u8();
        let node = Self::ENTRY_OFFSET + entry;
        let prev = self.nodes[usize::from(head)].prev;
        self.nodes[usize::from(node)] = Node { next: head, prev };
        self.nodes[usize::from(prev)].next = node;
        self.nodes[usize::from(head)].prev = node;
        self.classes.insert(class);
        true
    }

    /// Removes and returns the front entry of the highest non-empty class
    pub fn pop_front(&mut self) -> Option<u8> {
        for class in self.classes {
            match self.front(class) {
                Some(entry) => {
                    self.remove(entry);
                    return Some(entry);
                }
                None => self.classes.remove(class),
            }
        }
        None
    }

    pub fn remove(&mut self, entry: u8) {
        assert!(usize::from(entry) < N);
        let node = Self::ENTRY_OFFSET + entry;
        let Node { next, prev } = self.nodes[usize::from(node)];
        self.nodes[usize::from(node)] = Node {
            next: node,
            prev: node,
        };
        self.nodes[usize::from(next)].prev = prev;
        self.nodes[usize::from(prev)].next = next;
    }

    fn front(&self, class: Priority) -> Option<u8> {
        let head = class.into_u8();
        self.nodes[usize::from(head)]
            .next
            .checked_sub(Self::ENTRY_OFFSET)
    }
}

impl<const N: usize> Default for ReadyQueue<N> {
    fn default() -> Self {
        Self::new()
    }
}
