use common::Track;
use tracing::debug;

/// Slot-table node. Links are indices into the arena rather than owned
/// pointers, which keeps the parent link cheap and makes the two-child
/// deletion splice a matter of relinking indices.
#[derive(Debug)]
struct Node {
    track: Track,
    parent: Option<usize>,
    left: Option<usize>,
    right: Option<usize>,
}

/// Ordered index over every catalogued track, keyed by `Track::id`.
///
/// A binary search tree in a flat arena: freed slots go on a free list and
/// are reused by later inserts. Balance is only guaranteed for the cold-load
/// path (`from_sorted`); incremental inserts land wherever the comparison
/// walk puts them.
#[derive(Debug, Default)]
pub struct TrackIndex {
    nodes: Vec<Option<Node>>,
    root: Option<usize>,
    free: Vec<usize>,
    len: usize,
}

impl TrackIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Balanced build from tracks already sorted by id: the median of each
    /// sub-range becomes that subtree's root.
    pub fn from_sorted(tracks: Vec<Track>) -> Self {
        let mut index = Self::new();
        index.insert_median(&tracks[..]);
        index
    }

    fn insert_median(&mut self, tracks: &[Track]) {
        if tracks.is_empty() {
            return;
        }
        let mid = tracks.len() / 2;
        self.insert(tracks[mid].clone());
        self.insert_median(&tracks[..mid]);
        self.insert_median(&tracks[mid + 1..]);
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Inserts a track at the first open slot found by the id comparison
    /// walk. An exact id match anywhere on the way down means the track is
    /// already catalogued and the insert is a no-op.
    pub fn insert(&mut self, track: Track) {
        let Some(mut current) = self.root else {
            self.root = Some(self.alloc(track, None));
            return;
        };

        loop {
            let node = self.node(current);
            match track.id().cmp(node.track.id()) {
                std::cmp::Ordering::Less => match node.left {
                    Some(left) => current = left,
                    None => {
                        let slot = self.alloc(track, Some(current));
                        self.node_mut(current).left = Some(slot);
                        return;
                    }
                },
                std::cmp::Ordering::Greater => match node.right {
                    Some(right) => current = right,
                    None => {
                        let slot = self.alloc(track, Some(current));
                        self.node_mut(current).right = Some(slot);
                        return;
                    }
                },
                std::cmp::Ordering::Equal => {
                    debug!(id = track.id(), "track already catalogued");
                    return;
                }
            }
        }
    }

    /// Batch insert used after sorting new arrivals by id.
    pub fn insert_sorted(&mut self, tracks: Vec<Track>) {
        for track in tracks {
            self.insert(track);
        }
    }

    pub fn find(&self, id: &str) -> Option<&Track> {
        let mut current = self.root;
        while let Some(slot) = current {
            let node = self.node(slot);
            match id.cmp(node.track.id()) {
                std::cmp::Ordering::Less => current = node.left,
                std::cmp::Ordering::Greater => current = node.right,
                std::cmp::Ordering::Equal => return Some(&node.track),
            }
        }
        None
    }

    /// In-order traversal: every track in ascending id order. This doubles
    /// as the wire representation of the whole catalog.
    pub fn in_order(&self) -> Vec<&Track> {
        let mut out = Vec::with_capacity(self.len);
        self.walk(self.root, &mut out);
        out
    }

    fn walk<'a>(&'a self, slot: Option<usize>, out: &mut Vec<&'a Track>) {
        let Some(slot) = slot else { return };
        let node = self.node(slot);
        self.walk(node.left, out);
        out.push(&node.track);
        self.walk(node.right, out);
    }

    /// Removes the track with the given id, if present. Three cases: a leaf
    /// detaches from its parent; a one-child node splices its child into its
    /// own position; a two-child node takes the payload of its in-order
    /// successor after that successor is detached by the first two cases.
    pub fn remove(&mut self, id: &str) -> bool {
        let mut current = self.root;
        let slot = loop {
            let Some(slot) = current else {
                debug!(id, "track not in index, nothing to remove");
                return false;
            };
            let node = self.node(slot);
            match id.cmp(node.track.id()) {
                std::cmp::Ordering::Less => current = node.left,
                std::cmp::Ordering::Greater => current = node.right,
                std::cmp::Ordering::Equal => break slot,
            }
        };

        let (left, right) = {
            let node = self.node(slot);
            (node.left, node.right)
        };
        match (left, right) {
            (None, None) => self.replace_in_parent(slot, None),
            (Some(child), None) | (None, Some(child)) => {
                self.replace_in_parent(slot, Some(child));
            }
            (Some(_), Some(right)) => {
                // In-order successor: leftmost below the right child. It has
                // no left child by construction, so detaching it reduces to
                // the leaf or one-child case.
                let mut successor = right;
                while let Some(left) = self.node(successor).left {
                    successor = left;
                }
                let successor_child = self.node(successor).right;
                self.replace_in_parent(successor, successor_child);
                let track = self.take(successor);
                self.node_mut(slot).track = track;
                self.len -= 1;
                return true;
            }
        }
        self.take(slot);
        self.len -= 1;
        true
    }

    /// Points `slot`'s parent (or the root) at `replacement` and fixes the
    /// replacement's parent link.
    fn replace_in_parent(&mut self, slot: usize, replacement: Option<usize>) {
        let parent = self.node(slot).parent;
        match parent {
            Some(parent_slot) => {
                let parent_node = self.node_mut(parent_slot);
                if parent_node.left == Some(slot) {
                    parent_node.left = replacement;
                } else {
                    parent_node.right = replacement;
                }
            }
            None => self.root = replacement,
        }
        if let Some(replacement) = replacement {
            self.node_mut(replacement).parent = parent;
        }
    }

    fn alloc(&mut self, track: Track, parent: Option<usize>) -> usize {
        self.len += 1;
        let node = Node {
            track,
            parent,
            left: None,
            right: None,
        };
        match self.free.pop() {
            Some(slot) => {
                self.nodes[slot] = Some(node);
                slot
            }
            None => {
                self.nodes.push(Some(node));
                self.nodes.len() - 1
            }
        }
    }

    fn take(&mut self, slot: usize) -> Track {
        self.free.push(slot);
        match self.nodes[slot].take() {
            Some(node) => node.track,
            None => unreachable!("freed slot referenced by tree"),
        }
    }

    fn node(&self, slot: usize) -> &Node {
        match self.nodes[slot].as_ref() {
            Some(node) => node,
            None => unreachable!("freed slot referenced by tree"),
        }
    }

    fn node_mut(&mut self, slot: usize) -> &mut Node {
        match self.nodes[slot].as_mut() {
            Some(node) => node,
            None => unreachable!("freed slot referenced by tree"),
        }
    }
}
