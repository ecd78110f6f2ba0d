//! Region quadtree over the entities present on one map.
//!
//! Each node covers a rectangle of tiles and holds up to [`NODE_CAPACITY`]
//! entries before it splits into four quadrants. Removal walks straight to
//! the leaf holding the entry (the tree remembers every key's position) and
//! collapses quadrants back into their parent once they thin out, so neither
//! moves nor removals ever rebuild the tree.

use crate::geometry::{Point, Rect};
use std::collections::HashMap;
use std::hash::Hash;

const NODE_CAPACITY: usize = 8;
const MAX_DEPTH: u8 = 8;

/// Spatial index keyed by entity id.
///
/// A key can be indexed at most once; `insert` refuses a key that is already
/// present instead of creating a second entry.
#[derive(Debug)]
pub struct QuadTree<K> {
    root: Node<K>,
    positions: HashMap<K, Point>,
}

#[derive(Debug)]
struct Node<K> {
    bounds: Rect,
    depth: u8,
    items: Vec<(K, Point)>,
    children: Option<Box<[Node<K>; 4]>>,
}

impl<K: Copy + Eq + Hash> QuadTree<K> {
    /// Creates an empty index covering a `width` x `height` map.
    pub fn new(width: u8, height: u8) -> Self {
        Self {
            root: Node::leaf(Rect::new(0, 0, i32::from(width), i32::from(height)), 0),
            positions: HashMap::new(),
        }
    }

    /// Indexes `key` at `point`. Returns false if the key is already indexed
    /// or the point lies outside the map.
    pub fn insert(&mut self, key: K, point: Point) -> bool {
        if self.positions.contains_key(&key) || !self.root.bounds.contains(point) {
            return false;
        }
        self.root.insert(key, point);
        self.positions.insert(key, point);
        true
    }

    /// Removes `key`, returning the position it was indexed at.
    pub fn remove(&mut self, key: &K) -> Option<Point> {
        let point = self.positions.remove(key)?;
        self.root.remove(key, point);
        Some(point)
    }

    /// Moves an indexed key to a new position.
    pub fn relocate(&mut self, key: &K, point: Point) -> bool {
        if !self.root.bounds.contains(point) {
            return false;
        }
        match self.remove(key) {
            Some(_) => self.insert(*key, point),
            None => false,
        }
    }

    pub fn contains(&self, key: &K) -> bool {
        self.positions.contains_key(key)
    }

    pub fn position(&self, key: &K) -> Option<Point> {
        self.positions.get(key).copied()
    }

    /// All keys whose position falls inside `rect`, in no particular order.
    pub fn query(&self, rect: &Rect) -> Vec<K> {
        let mut found = Vec::new();
        if !rect.is_empty() {
            self.root.query(rect, &mut found);
        }
        found
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    #[cfg(test)]
    fn depth(&self) -> u8 {
        self.root.max_depth()
    }
}

impl<K: Copy + Eq + Hash> Node<K> {
    fn leaf(bounds: Rect, depth: u8) -> Self {
        Self {
            bounds,
            depth,
            items: Vec::new(),
            children: None,
        }
    }

    fn insert(&mut self, key: K, point: Point) {
        if let Some(children) = self.children.as_mut() {
            if let Some(child) = children.iter_mut().find(|c| c.bounds.contains(point)) {
                child.insert(key, point);
                return;
            }
        }

        self.items.push((key, point));

        let splittable = self.bounds.width * self.bounds.height > 1 && self.depth < MAX_DEPTH;
        if self.children.is_none() && self.items.len() > NODE_CAPACITY && splittable {
            self.split();
        }
    }

    fn split(&mut self) {
        let [nw, ne, sw, se] = self.bounds.quadrants();
        let depth = self.depth + 1;
        self.children = Some(Box::new([
            Node::leaf(nw, depth),
            Node::leaf(ne, depth),
            Node::leaf(sw, depth),
            Node::leaf(se, depth),
        ]));

        for (key, point) in std::mem::take(&mut self.items) {
            self.insert(key, point);
        }
    }

    fn remove(&mut self, key: &K, point: Point) -> bool {
        if let Some(index) = self.items.iter().position(|(k, _)| k == key) {
            self.items.swap_remove(index);
            return true;
        }

        let removed = match self.children.as_mut() {
            Some(children) => children
                .iter_mut()
                .filter(|c| c.bounds.contains(point))
                .any(|c| c.remove(key, point)),
            None => false,
        };

        if removed {
            self.try_collapse();
        }
        removed
    }

    /// Pulls the children's entries back up once they fit in this node.
    fn try_collapse(&mut self) {
        let Some(children) = self.children.as_mut() else {
            return;
        };
        if children.iter().any(|c| c.children.is_some()) {
            return;
        }

        let total: usize = self.items.len() + children.iter().map(|c| c.items.len()).sum::<usize>();
        if total <= NODE_CAPACITY {
            for child in children.iter_mut() {
                self.items.append(&mut child.items);
            }
            self.children = None;
        }
    }

    fn query(&self, rect: &Rect, found: &mut Vec<K>) {
        if !self.bounds.intersects(rect) {
            return;
        }

        found.extend(
            self.items
                .iter()
                .filter(|(_, point)| rect.contains(*point))
                .map(|(key, _)| *key),
        );

        if let Some(children) = self.children.as_ref() {
            for child in children.iter() {
                child.query(rect, found);
            }
        }
    }

    #[cfg(test)]
    fn max_depth(&self) -> u8 {
        match self.children.as_ref() {
            Some(children) => children.iter().map(|c| c.max_depth()).max().unwrap_or(self.depth),
            None => self.depth,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn sorted(mut keys: Vec<u32>) -> Vec<u32> {
        keys.sort_unstable();
        keys
    }

    #[test]
    fn test_insert_and_query() {
        let mut tree = QuadTree::new(20, 20);
        assert!(tree.insert(1, Point::new(2, 2)));
        assert!(tree.insert(2, Point::new(5, 5)));
        assert!(tree.insert(3, Point::new(15, 15)));

        let found = sorted(tree.query(&Rect::new(0, 0, 10, 10)));
        assert_eq!(found, vec![1, 2]);
        assert_eq!(tree.len(), 3);
    }

    #[test]
    fn test_duplicate_insert_is_refused() {
        let mut tree = QuadTree::new(10, 10);
        assert!(tree.insert(7, Point::new(1, 1)));
        assert!(!tree.insert(7, Point::new(2, 2)));

        assert_eq!(tree.len(), 1);
        assert_eq!(tree.position(&7), Some(Point::new(1, 1)));
        assert_eq!(tree.query(&Rect::new(0, 0, 10, 10)), vec![7]);
    }

    #[test]
    fn test_out_of_bounds_insert_is_refused() {
        let mut tree = QuadTree::new(10, 10);
        assert!(!tree.insert(1, Point::new(10, 3)));
        assert!(!tree.insert(1, Point::new(3, 10)));
        assert!(tree.is_empty());
    }

    #[test]
    fn test_remove() {
        let mut tree = QuadTree::new(10, 10);
        tree.insert(1, Point::new(3, 3));
        tree.insert(2, Point::new(3, 3));

        assert_eq!(tree.remove(&1), Some(Point::new(3, 3)));
        assert_eq!(tree.remove(&1), None);
        assert!(!tree.contains(&1));
        assert_eq!(tree.query(&Rect::new(3, 3, 1, 1)), vec![2]);
    }

    #[test]
    fn test_split_and_collapse() {
        let mut tree = QuadTree::new(64, 64);
        for i in 0..200u32 {
            let point = Point::new((i * 7 % 64) as u8, (i * 13 % 64) as u8);
            assert!(tree.insert(i, point));
        }
        assert!(tree.depth() > 0);

        let everything: HashSet<u32> = tree.query(&Rect::new(0, 0, 64, 64)).into_iter().collect();
        assert_eq!(everything.len(), 200);

        for i in 0..200u32 {
            assert!(tree.remove(&i).is_some());
        }
        assert!(tree.is_empty());
        assert_eq!(tree.depth(), 0);
        assert!(tree.query(&Rect::new(0, 0, 64, 64)).is_empty());
    }

    #[test]
    fn test_query_matches_linear_scan() {
        let mut tree = QuadTree::new(100, 100);
        let mut points = Vec::new();
        for i in 0..500u32 {
            let point = Point::new((i * 37 % 100) as u8, (i * 91 % 100) as u8);
            tree.insert(i, point);
            points.push((i, point));
        }

        let rects = [
            Rect::new(-12, -12, 24, 24),
            Rect::new(40, 40, 24, 24),
            Rect::new(88, 10, 24, 24),
            Rect::new(0, 0, 1, 1),
            Rect::new(50, 50, 0, 10),
        ];
        for rect in rects {
            let expected: Vec<u32> = points
                .iter()
                .filter(|(_, p)| rect.contains(*p))
                .map(|(k, _)| *k)
                .collect();
            assert_eq!(sorted(tree.query(&rect)), sorted(expected), "rect {:?}", rect);
        }
    }

    #[test]
    fn test_many_entries_on_one_tile() {
        let mut tree = QuadTree::new(16, 16);
        for i in 0..50u32 {
            assert!(tree.insert(i, Point::new(9, 9)));
        }
        assert!(tree.depth() <= MAX_DEPTH);
        assert_eq!(tree.query(&Rect::new(9, 9, 1, 1)).len(), 50);
        assert!(tree.query(&Rect::new(8, 8, 1, 1)).is_empty());
    }

    #[test]
    fn test_relocate() {
        let mut tree = QuadTree::new(30, 30);
        tree.insert(1, Point::new(1, 1));

        assert!(tree.relocate(&1, Point::new(25, 25)));
        assert!(tree.query(&Rect::new(0, 0, 5, 5)).is_empty());
        assert_eq!(tree.query(&Rect::new(20, 20, 10, 10)), vec![1]);

        // Refused moves leave the entry where it was
        assert!(!tree.relocate(&1, Point::new(30, 0)));
        assert_eq!(tree.position(&1), Some(Point::new(25, 25)));
        assert!(!tree.relocate(&2, Point::new(0, 0)));
        assert!(!tree.contains(&2));
    }
}
