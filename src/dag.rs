// Commit graph traversal. The history is a DAG with at most two parents per
// commit; the merge machinery needs the lowest common ancestor of two heads.

use std::collections::{HashMap, VecDeque};

use crate::commit::Commit;
use crate::errors::Result;
use crate::hash::ObjectHash;
use crate::object::ObjectKind;
use crate::store::ObjectStore;

const OURS: u8 = 1;
const THEIRS: u8 = 2;

#[derive(Debug, Default)]
pub struct CommitDag {
    parents: HashMap<ObjectHash, (ObjectHash, ObjectHash)>,
}

impl CommitDag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, hash: ObjectHash, commit: &Commit) {
        self.parents.insert(hash, (commit.parent1, commit.parent2));
    }

    /// Build the DAG from every commit object in the store.
    pub fn from_store(store: &ObjectStore) -> Result<CommitDag> {
        let mut dag = CommitDag::new();
        for info in store.list()? {
            if info.kind != ObjectKind::Commit {
                continue;
            }
            let object = store.get(&info.hash)?;
            let commit = Commit::from_bytes(&object.payload)?;
            dag.insert(info.hash, &commit);
        }
        Ok(dag)
    }

    pub fn contains(&self, hash: &ObjectHash) -> bool {
        self.parents.contains_key(hash)
    }

    /// Lowest common ancestor by interleaved BFS from both sides: each side
    /// colors the commits it reaches, and the first commit colored by both is
    /// the LCA. Disjoint histories yield the zero sentinel.
    pub fn find_lca(&self, a: ObjectHash, b: ObjectHash) -> ObjectHash {
        if a.is_zero() || b.is_zero() {
            return ObjectHash::ZERO;
        }
        if a == b {
            return a;
        }

        let mut color: HashMap<ObjectHash, u8> = HashMap::new();
        color.insert(a, OURS);
        color.insert(b, THEIRS);

        let mut our_queue = VecDeque::from([a]);
        let mut their_queue = VecDeque::from([b]);

        while !our_queue.is_empty() || !their_queue.is_empty() {
            if let Some(found) = self.advance(&mut our_queue, OURS, &mut color) {
                return found;
            }
            if let Some(found) = self.advance(&mut their_queue, THEIRS, &mut color) {
                return found;
            }
        }

        ObjectHash::ZERO
    }

    fn advance(
        &self,
        queue: &mut VecDeque<ObjectHash>,
        side: u8,
        color: &mut HashMap<ObjectHash, u8>,
    ) -> Option<ObjectHash> {
        let node = queue.pop_front()?;
        let (p1, p2) = *self.parents.get(&node)?;

        for parent in [p1, p2] {
            if parent.is_zero() {
                continue;
            }
            let mark = color.entry(parent).or_insert(0);
            if *mark & side == 0 {
                *mark |= side;
                if *mark == OURS | THEIRS {
                    return Some(parent);
                }
                queue.push_back(parent);
            }
        }
        None
    }
}
