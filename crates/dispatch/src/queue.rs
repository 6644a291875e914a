/// Priority of a queued element. Higher values dispatch first.
pub type Priority = u8;

const NIL: u32 = u32::MAX;

/// Handle to an element held in a [`PriorityQueue`].
///
/// A handle stays valid until its element is erased or re-queued at a
/// different priority. Using a handle after that is a programming error
/// and panics.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct Handle {
    priority: Priority,
    slot: u32,
    generation: u64,
}

impl Handle {
    pub fn priority(&self) -> Priority {
        self.priority
    }
}

struct Node<T> {
    value: T,
    generation: u64,
    priority: Priority,
    prev: u32,
    next: u32,
}

#[derive(Copy, Clone)]
struct Level {
    head: u32,
    tail: u32,
}

/// A stable multi-level FIFO.
///
/// Elements live in a slab and are linked into one doubly linked list per
/// priority level, so erasure through a handle is O(1). Each insertion
/// stamps a fresh generation into both the node and the returned handle;
/// a mismatch detects stale handles even when the slot was reused.
pub struct PriorityQueue<T> {
    nodes: Vec<Option<Node<T>>>,
    free: Vec<u32>,
    levels: Vec<Level>,
    next_generation: u64,
    len: usize,
}

impl<T> PriorityQueue<T> {
    pub fn new(num_priorities: usize) -> Self {
        assert!(num_priorities > 0 && num_priorities <= usize::from(Priority::MAX) + 1);
        Self {
            nodes: Vec::new(),
            free: Vec::new(),
            levels: vec![Level { head: NIL, tail: NIL }; num_priorities],
            next_generation: 0,
            len: 0,
        }
    }

    pub fn num_priorities(&self) -> usize {
        self.levels.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Appends `value` at the tail of its priority level.
    pub fn insert(&mut self, value: T, priority: Priority) -> Handle {
        let handle = self.alloc(value, priority);
        let slot = handle.slot;
        let mut level = self.levels[usize::from(priority)];
        if level.tail == NIL {
            level.head = slot;
        } else {
            let tail = level.tail;
            self.node_mut(tail).next = slot;
            self.node_mut(slot).prev = tail;
        }
        level.tail = slot;
        self.levels[usize::from(priority)] = level;
        handle
    }

    /// Prepends `value` at the head of its priority level.
    pub fn insert_at_front(&mut self, value: T, priority: Priority) -> Handle {
        let handle = self.alloc(value, priority);
        let slot = handle.slot;
        let mut level = self.levels[usize::from(priority)];
        if level.head == NIL {
            level.tail = slot;
        } else {
            let head = level.head;
            self.node_mut(head).prev = slot;
            self.node_mut(slot).next = head;
        }
        level.head = slot;
        self.levels[usize::from(priority)] = level;
        handle
    }

    /// Removes the element designated by `handle` and returns it.
    ///
    /// Panics if the handle is stale: its element was already erased, or
    /// was re-queued under a new handle.
    pub fn erase(&mut self, handle: Handle) -> T {
        match self.nodes.get(handle.slot as usize) {
            Some(Some(node)) if node.generation == handle.generation => (),
            _ => panic!("use of a stale priority queue handle"),
        }
        let node = self.nodes[handle.slot as usize]
            .take()
            .expect("checked occupied above");
        let Node {
            value,
            priority,
            prev,
            next,
            ..
        } = node;

        if prev == NIL {
            self.levels[usize::from(priority)].head = next;
        } else {
            self.node_mut(prev).next = next;
        }
        if next == NIL {
            self.levels[usize::from(priority)].tail = prev;
        } else {
            self.node_mut(next).prev = prev;
        }

        self.free.push(handle.slot);
        self.len -= 1;
        value
    }

    /// Handle of the oldest element at the highest non-empty priority.
    pub fn first_max(&self) -> Option<Handle> {
        self.levels
            .iter()
            .enumerate()
            .rev()
            .find(|(_, level)| level.head != NIL)
            .map(|(priority, level)| self.handle_of(level.head, priority as Priority))
    }

    /// Handle of the oldest element at the lowest non-empty priority.
    pub fn first_min(&self) -> Option<Handle> {
        self.levels
            .iter()
            .enumerate()
            .find(|(_, level)| level.head != NIL)
            .map(|(priority, level)| self.handle_of(level.head, priority as Priority))
    }

    /// Borrows the element designated by `handle`. Panics if stale.
    pub fn peek(&self, handle: Handle) -> &T {
        match self.nodes.get(handle.slot as usize) {
            Some(Some(node)) if node.generation == handle.generation => &node.value,
            _ => panic!("use of a stale priority queue handle"),
        }
    }

    fn alloc(&mut self, value: T, priority: Priority) -> Handle {
        assert!(
            usize::from(priority) < self.levels.len(),
            "priority out of range"
        );
        let generation = self.next_generation;
        self.next_generation += 1;
        let node = Node {
            value,
            generation,
            priority,
            prev: NIL,
            next: NIL,
        };
        let slot = match self.free.pop() {
            Some(slot) => {
                self.nodes[slot as usize] = Some(node);
                slot
            }
            None => {
                self.nodes.push(Some(node));
                (self.nodes.len() - 1) as u32
            }
        };
        self.len += 1;
        Handle {
            priority,
            slot,
            generation,
        }
    }

    fn node_mut(&mut self, slot: u32) -> &mut Node<T> {
        self.nodes[slot as usize]
            .as_mut()
            .expect("linked slot is occupied")
    }

    fn handle_of(&self, slot: u32, priority: Priority) -> Handle {
        let generation = self.nodes[slot as usize]
            .as_ref()
            .expect("linked slot is occupied")
            .generation;
        Handle {
            priority,
            slot,
            generation,
        }
    }
}
