//! In-memory insert and split tests.
//!
//! These drive [`Node::insert`] and [`insert_into_btree`] directly with a
//! tiny branching order (`m = 1`, so a node holds at most three keys) and
//! never touch a store: fresh nodes are fully loaded, so no block reads
//! happen.

#[cfg(test)]
mod tests {
    use crate::btree::{insert_into_btree, KeyValue, Node};
    use crate::store::{Address, BlockReader, Reader, StoreError};

    /// All nodes in these tests live purely in memory.
    struct NullReader;

    impl Reader for NullReader {
        fn get_block(&self, address: Address) -> Result<BlockReader<'_>, StoreError> {
            Err(StoreError::NotFound(address))
        }
    }

    fn kv(key: &[u8], value: u64) -> KeyValue {
        KeyValue {
            key: key.to_vec(),
            value: Address::new(value),
        }
    }

    fn empty(m: usize) -> Node {
        Node::empty_leaf(m)
    }

    /// Builds a tree by repeated root-level inserts.
    fn tree(m: usize, kvs: &[(&[u8], u64)]) -> Node {
        let mut node = empty(m);
        for (key, value) in kvs {
            let (next, inserted) = insert_into_btree(&NullReader, node, kv(key, *value)).unwrap();
            assert!(inserted);
            node = next;
        }
        node
    }

    /// # Scenario
    /// Inserting into an empty node stores the pair and bumps the count.
    #[test]
    fn insert_into_empty_node() {
        let mut node = empty(3);
        let result = node.insert(&NullReader, kv(&[1, 2, 3], 333)).unwrap();

        assert!(result.did_insert);
        assert!(result.split.is_none());
        assert_eq!(node.kvs, vec![kv(&[1, 2, 3], 333)]);
        assert_eq!(node.count, 1);
    }

    /// # Scenario
    /// A lower key lands before the existing one.
    #[test]
    fn insert_lower_key() {
        let mut node = empty(3);
        node.insert(&NullReader, kv(&[1, 2, 3], 333)).unwrap();
        let result = node.insert(&NullReader, kv(&[1, 0, 0], 334)).unwrap();

        assert!(result.did_insert);
        assert_eq!(node.kvs, vec![kv(&[1, 0, 0], 334), kv(&[1, 2, 3], 333)]);
        assert_eq!(node.count, 2);
    }

    /// # Scenario
    /// A higher key lands after the existing one.
    #[test]
    fn insert_higher_key() {
        let mut node = empty(3);
        node.insert(&NullReader, kv(&[1, 2, 3], 333)).unwrap();
        let result = node.insert(&NullReader, kv(&[1, 2, 4], 334)).unwrap();

        assert!(result.did_insert);
        assert_eq!(node.kvs, vec![kv(&[1, 2, 3], 333), kv(&[1, 2, 4], 334)]);
        assert_eq!(node.count, 2);
    }

    /// # Scenario
    /// Inserting an existing key replaces the value and leaves the count
    /// alone.
    #[test]
    fn replace_value() {
        let mut node = empty(3);
        node.insert(&NullReader, kv(&[1, 2, 3], 333)).unwrap();
        let result = node.insert(&NullReader, kv(&[1, 2, 3], 334)).unwrap();

        assert!(!result.did_insert);
        assert_eq!(node.kvs, vec![kv(&[1, 2, 3], 334)]);
        assert_eq!(node.count, 1);
    }

    /// # Scenario
    /// With `m = 1` a leaf holds three keys; the fourth insert splits it at
    /// the middle key.
    ///
    /// # Expected behavior
    /// Middle `[1,2,1]`, left `[[1,2,0]]`, right `[[1,2,2], [1,2,3]]`.
    #[test]
    fn fourth_insert_splits_leaf() {
        let mut node = empty(1);
        for (key, value) in [(&[1u8, 2, 0], 330), (&[1, 2, 1], 331), (&[1, 2, 2], 332)] {
            let result = node.insert(&NullReader, kv(key, value)).unwrap();
            assert!(result.did_insert);
            assert!(result.split.is_none());
        }

        let result = node.insert(&NullReader, kv(&[1, 2, 3], 333)).unwrap();
        assert!(result.did_insert);
        let split = result.split.expect("fourth insert must split");

        assert_eq!(split.middle, kv(&[1, 2, 1], 331));
        assert_eq!(split.left.count, 1);
        assert_eq!(split.left.kvs, vec![kv(&[1, 2, 0], 330)]);
        assert_eq!(split.right.count, 2);
        assert_eq!(
            split.right.kvs,
            vec![kv(&[1, 2, 2], 332), kv(&[1, 2, 3], 333)]
        );
    }

    /// # Scenario
    /// Root-level inserts promote the middle key into a fresh internal root;
    /// a following insert descends into the right leaf without splitting.
    #[test]
    fn root_promotion_then_plain_insert() {
        let mut node = tree(
            1,
            &[
                (&[1, 2, 0], 330),
                (&[1, 2, 1], 331),
                (&[1, 2, 2], 332),
                (&[1, 2, 3], 333),
            ],
        );
        assert!(!node.is_leaf());
        assert_eq!(node.count, 4);

        let result = node.insert(&NullReader, kv(&[1, 2, 4], 334)).unwrap();
        assert!(result.did_insert);
        assert!(result.split.is_none());

        assert_eq!(node.count, 5);
        assert_eq!(node.kvs, vec![kv(&[1, 2, 1], 331)]);
        assert_eq!(node.children.len(), 2);
        assert_eq!(node.children[0].count, 1);
        assert_eq!(node.children[0].kvs, vec![kv(&[1, 2, 0], 330)]);
        assert_eq!(node.children[1].count, 3);
        assert_eq!(
            node.children[1].kvs,
            vec![kv(&[1, 2, 2], 332), kv(&[1, 2, 3], 333), kv(&[1, 2, 4], 334)]
        );
    }

    /// # Scenario
    /// Replacing the value of a key that lives in the internal root changes
    /// neither the count nor the shape.
    #[test]
    fn replace_value_in_internal_node() {
        let mut node = tree(
            1,
            &[
                (&[1, 2, 0], 330),
                (&[1, 2, 1], 331),
                (&[1, 2, 2], 332),
                (&[1, 2, 3], 333),
            ],
        );
        assert!(!node.is_leaf());

        let result = node.insert(&NullReader, kv(&[1, 2, 1], 666)).unwrap();
        assert!(!result.did_insert);
        assert!(result.split.is_none());

        assert_eq!(node.count, 4);
        assert_eq!(node.kvs, vec![kv(&[1, 2, 1], 666)]);
        assert_eq!(node.children[0].kvs, vec![kv(&[1, 2, 0], 330)]);
        assert_eq!(
            node.children[1].kvs,
            vec![kv(&[1, 2, 2], 332), kv(&[1, 2, 3], 333)]
        );
    }

    /// # Scenario
    /// Overflowing the rightmost leaf promotes its middle key into the root.
    #[test]
    fn right_leaf_split_promotes_into_root() {
        let mut node = tree(
            1,
            &[
                (&[1, 2, 0], 330),
                (&[1, 2, 1], 331),
                (&[1, 2, 2], 332),
                (&[1, 2, 3], 333),
                (&[1, 2, 4], 334),
            ],
        );

        let result = node.insert(&NullReader, kv(&[1, 2, 5], 335)).unwrap();
        assert!(result.did_insert);
        assert!(result.split.is_none());

        assert_eq!(node.count, 6);
        assert_eq!(node.kvs, vec![kv(&[1, 2, 1], 331), kv(&[1, 2, 3], 333)]);
        assert_eq!(node.children.len(), 3);
        assert_eq!(node.children[0].kvs, vec![kv(&[1, 2, 0], 330)]);
        assert_eq!(node.children[1].kvs, vec![kv(&[1, 2, 2], 332)]);
        assert_eq!(
            node.children[2].kvs,
            vec![kv(&[1, 2, 4], 334), kv(&[1, 2, 5], 335)]
        );
    }

    /// # Scenario
    /// Overflowing the leftmost leaf splits it at the post-insert middle,
    /// shifting the existing separators right.
    #[test]
    fn left_leaf_split_promotes_into_root() {
        let mut node = tree(
            1,
            &[
                (&[1, 2, 0], 330),
                (&[1, 2, 1], 331),
                (&[1, 2, 2], 332),
                (&[1, 2, 3], 333),
                (&[1, 2, 4], 334),
                (&[1, 1, 2], 322),
                (&[1, 1, 1], 321),
            ],
        );

        let result = node.insert(&NullReader, kv(&[1, 1, 0], 320)).unwrap();
        assert!(result.did_insert);
        assert!(result.split.is_none());

        assert_eq!(node.count, 8);
        assert_eq!(node.kvs, vec![kv(&[1, 1, 1], 321), kv(&[1, 2, 1], 331)]);
        assert_eq!(node.children.len(), 3);
        assert_eq!(node.children[0].kvs, vec![kv(&[1, 1, 0], 320)]);
        assert_eq!(node.children[0].count, 1);
        assert_eq!(
            node.children[1].kvs,
            vec![kv(&[1, 1, 2], 322), kv(&[1, 2, 0], 330)]
        );
        assert_eq!(node.children[1].count, 2);
        assert_eq!(
            node.children[2].kvs,
            vec![kv(&[1, 2, 2], 332), kv(&[1, 2, 3], 333), kv(&[1, 2, 4], 334)]
        );
        assert_eq!(node.children[2].count, 3);
    }

    /// # Scenario
    /// Once the internal root itself overflows, the tree grows to depth
    /// three with correct subtree counts on both halves.
    #[test]
    fn root_split_grows_tree() {
        let node = tree(
            1,
            &[
                (&[1, 2, 0], 330),
                (&[1, 2, 1], 331),
                (&[1, 2, 2], 332),
                (&[1, 2, 3], 333),
                (&[1, 2, 4], 334),
                (&[1, 1, 2], 322),
                (&[1, 1, 1], 321),
                (&[1, 1, 0], 320),
                (&[1, 2, 5], 335),
                (&[1, 2, 6], 336),
                (&[1, 2, 7], 337),
            ],
        );

        assert_eq!(node.count, 11);
        assert_eq!(node.kvs, vec![kv(&[1, 2, 1], 331)]);
        assert_eq!(node.children.len(), 2);

        let left = &node.children[0];
        assert_eq!(left.count, 4);
        assert_eq!(left.kvs, vec![kv(&[1, 1, 1], 321)]);
        assert_eq!(left.children[0].kvs, vec![kv(&[1, 1, 0], 320)]);
        assert_eq!(
            left.children[1].kvs,
            vec![kv(&[1, 1, 2], 322), kv(&[1, 2, 0], 330)]
        );

        let right = &node.children[1];
        assert_eq!(right.count, 6);
        assert_eq!(right.kvs, vec![kv(&[1, 2, 3], 333), kv(&[1, 2, 5], 335)]);
        assert_eq!(right.children[0].kvs, vec![kv(&[1, 2, 2], 332)]);
        assert_eq!(right.children[1].kvs, vec![kv(&[1, 2, 4], 334)]);
        assert_eq!(
            right.children[2].kvs,
            vec![kv(&[1, 2, 6], 336), kv(&[1, 2, 7], 337)]
        );
    }

    /// # Scenario
    /// Zero bytes and empty-adjacent keys order strictly lexicographically.
    #[test]
    fn lexicographic_ordering_with_zero_bytes() {
        let mut node = empty(3);
        node.insert(&NullReader, kv(&[0, 0], 2)).unwrap();
        node.insert(&NullReader, kv(&[0], 1)).unwrap();
        node.insert(&NullReader, kv(&[], 0)).unwrap();
        node.insert(&NullReader, kv(&[0, 1], 3)).unwrap();

        assert_eq!(
            node.kvs,
            vec![kv(&[], 0), kv(&[0], 1), kv(&[0, 0], 2), kv(&[0, 1], 3)]
        );
    }
}
