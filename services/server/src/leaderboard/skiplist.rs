//! Indexable skiplist.
//!
//! Ordered set with O(log n) insert, remove, rank lookup, and access by
//! rank.  Each link carries a span (the number of elements it skips,
//! target included; links to the tail count the remaining elements), which
//! is what makes 1-based rank queries cheap.
//!
//! Nodes live in a slab-style arena addressed by index, with a free list
//! for reuse, so the structure is safe Rust throughout.

use rand::Rng;

const MAX_LEVEL: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Link {
    next: Option<usize>,
    span: usize,
}

#[derive(Debug)]
struct Node<K> {
    key: K,
    links: Vec<Link>,
}

#[derive(Debug, Default)]
pub struct SkipList<K: Ord> {
    head: Vec<Link>,
    nodes: Vec<Option<Node<K>>>,
    free: Vec<usize>,
    len: usize,
}

impl<K: Ord> SkipList<K> {
    pub fn new() -> Self {
        Self {
            head: Vec::new(),
            nodes: Vec::new(),
            free: Vec::new(),
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn node(&self, idx: usize) -> &Node<K> {
        self.nodes[idx].as_ref().expect("skiplist node vacant")
    }

    fn node_mut(&mut self, idx: usize) -> &mut Node<K> {
        self.nodes[idx].as_mut().expect("skiplist node vacant")
    }

    fn link(&self, at: Option<usize>, level: usize) -> Link {
        match at {
            None => self.head[level],
            Some(idx) => self.node(idx).links[level],
        }
    }

    fn link_mut(&mut self, at: Option<usize>, level: usize) -> &mut Link {
        match at {
            None => &mut self.head[level],
            Some(idx) => &mut self.node_mut(idx).links[level],
        }
    }

    fn alloc(&mut self, node: Node<K>) -> usize {
        if let Some(idx) = self.free.pop() {
            self.nodes[idx] = Some(node);
            idx
        } else {
            self.nodes.push(Some(node));
            self.nodes.len() - 1
        }
    }

    fn random_level() -> usize {
        let mut level = 1;
        let mut rng = rand::thread_rng();
        while level < MAX_LEVEL && rng.gen_ratio(1, 4) {
            level += 1;
        }
        level
    }

    /// Path of strict predecessors per level, with the rank accumulated at
    /// each predecessor.
    fn search_path(&self, key: &K) -> Vec<(Option<usize>, usize)> {
        let levels = self.head.len();
        let mut update = vec![(None, 0usize); levels];
        let mut at: Option<usize> = None;
        let mut rank = 0usize;
        for level in (0..levels).rev() {
            loop {
                let link = self.link(at, level);
                match link.next {
                    Some(next) if self.node(next).key < *key => {
                        rank += link.span;
                        at = Some(next);
                    }
                    _ => break,
                }
            }
            update[level] = (at, rank);
        }
        update
    }

    /// Insert a key the list does not already contain.  Returns the
    /// 1-based rank the key landed at.
    pub fn insert(&mut self, key: K) -> usize {
        let mut update = self.search_path(&key);
        let node_rank = update.first().map_or(0, |&(_, rank)| rank);

        let new_level = Self::random_level();
        if new_level > self.head.len() {
            // Fresh levels span the whole current list.
            self.head.resize(
                new_level,
                Link {
                    next: None,
                    span: self.len,
                },
            );
            update.resize(new_level, (None, 0));
        }

        let idx = self.alloc(Node {
            key,
            links: vec![Link { next: None, span: 0 }; new_level],
        });
        for level in 0..new_level {
            let (prev, prev_rank) = update[level];
            let prev_link = self.link(prev, level);
            let delta = node_rank - prev_rank;
            self.node_mut(idx).links[level] = Link {
                next: prev_link.next,
                span: prev_link.span - delta,
            };
            *self.link_mut(prev, level) = Link {
                next: Some(idx),
                span: delta + 1,
            };
        }
        for level in new_level..update.len() {
            let (prev, _) = update[level];
            self.link_mut(prev, level).span += 1;
        }

        self.len += 1;
        node_rank + 1
    }

    pub fn remove(&mut self, key: &K) -> bool {
        let update = self.search_path(key);
        let Some(&(prev0, _)) = update.first() else {
            return false;
        };
        let target = match self.link(prev0, 0).next {
            Some(idx) if self.node(idx).key == *key => idx,
            _ => return false,
        };

        for level in 0..update.len() {
            let (prev, _) = update[level];
            let prev_link = self.link(prev, level);
            if prev_link.next == Some(target) {
                let target_link = self.node(target).links[level];
                *self.link_mut(prev, level) = Link {
                    next: target_link.next,
                    span: prev_link.span + target_link.span - 1,
                };
            } else {
                self.link_mut(prev, level).span -= 1;
            }
        }

        self.nodes[target] = None;
        self.free.push(target);
        self.len -= 1;
        while self.head.last().is_some_and(|link| link.next.is_none()) {
            let _ = self.head.pop();
        }
        true
    }

    /// 1-based rank of a key, if present.
    pub fn rank(&self, key: &K) -> Option<usize> {
        let update = self.search_path(key);
        let &(prev0, rank) = update.first()?;
        match self.link(prev0, 0).next {
            Some(idx) if self.node(idx).key == *key => Some(rank + 1),
            _ => None,
        }
    }

    /// Key at a 1-based rank.
    pub fn get_by_rank(&self, rank: usize) -> Option<&K> {
        if rank == 0 || rank > self.len {
            return None;
        }
        let mut traversed = 0usize;
        let mut at: Option<usize> = None;
        for level in (0..self.head.len()).rev() {
            loop {
                let link = self.link(at, level);
                if link.next.is_some() && traversed + link.span <= rank {
                    traversed += link.span;
                    at = link.next;
                } else {
                    break;
                }
            }
            if traversed == rank {
                return at.map(|idx| &self.node(idx).key);
            }
        }
        None
    }

    /// Ordered iteration over level-0 links; used by listings and tests.
    pub fn iter(&self) -> impl Iterator<Item = &K> {
        let mut at = self.head.first().and_then(|link| link.next);
        std::iter::from_fn(move || {
            let idx = at?;
            at = self.node(idx).links[0].next;
            Some(&self.node(idx).key)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ranks_are_consistent(list: &SkipList<i64>) {
        for (position, key) in list.iter().enumerate() {
            assert_eq!(list.rank(key), Some(position + 1), "rank of {key}");
            assert_eq!(list.get_by_rank(position + 1), Some(key));
        }
    }

    #[test]
    fn insert_returns_the_landing_rank() {
        let mut list = SkipList::new();
        assert_eq!(list.insert(50), 1);
        assert_eq!(list.insert(10), 1);
        assert_eq!(list.insert(30), 2);
        assert_eq!(list.insert(70), 4);
        assert_eq!(list.len(), 4);
        ranks_are_consistent(&list);
    }

    #[test]
    fn remove_keeps_ranks_dense() {
        let mut list = SkipList::new();
        for key in [5, 1, 9, 3, 7] {
            let _ = list.insert(key);
        }
        assert!(list.remove(&5));
        assert!(!list.remove(&5));
        assert_eq!(list.len(), 4);
        assert_eq!(list.rank(&7), Some(3));
        assert_eq!(list.get_by_rank(4), Some(&9));
        ranks_are_consistent(&list);
    }

    #[test]
    fn out_of_range_ranks_are_none() {
        let mut list = SkipList::new();
        assert_eq!(list.get_by_rank(1), None);
        let _ = list.insert(1);
        assert_eq!(list.get_by_rank(0), None);
        assert_eq!(list.get_by_rank(2), None);
        assert_eq!(list.rank(&2), None);
    }

    #[test]
    fn drain_to_empty_and_reuse() {
        let mut list = SkipList::new();
        for key in 0..10 {
            let _ = list.insert(key);
        }
        for key in 0..10 {
            assert!(list.remove(&key));
        }
        assert!(list.is_empty());
        assert_eq!(list.insert(42), 1);
        assert_eq!(list.rank(&42), Some(1));
    }

    #[test]
    fn large_randomized_ordering() {
        let mut list = SkipList::new();
        let mut keys: Vec<i64> = (0..500).map(|i| (i * 7919) % 1000).collect();
        keys.sort_unstable();
        keys.dedup();
        // Insert in a scrambled order.
        let mut scrambled = keys.clone();
        scrambled.reverse();
        scrambled.rotate_left(keys.len() / 3);
        for &key in &scrambled {
            let _ = list.insert(key);
        }
        assert_eq!(list.len(), keys.len());
        let collected: Vec<i64> = list.iter().copied().collect();
        assert_eq!(collected, keys);
        ranks_are_consistent(&list);

        // Remove every third key and re-check.
        for key in keys.iter().step_by(3) {
            assert!(list.remove(key));
        }
        ranks_are_consistent(&list);
    }
}
