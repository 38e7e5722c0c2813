//! Node persist/load round-trips against a real staging segment.

#[cfg(test)]
mod tests {
    use crate::btree::{KeyValue, Node};
    use crate::data;
    use crate::store::{Address, BlockType, Context, Reader, Store, WriteTransaction};
    use tempfile::TempDir;
    use tracing::Level;
    use tracing_subscriber::fmt::Subscriber;

    fn init_tracing() {
        let _ = Subscriber::builder()
            .with_max_level(Level::TRACE)
            .try_init();
    }

    fn new_write_transaction() -> (TempDir, Store, WriteTransaction) {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let (tx, _root) = store.new_write_transaction(&Context::background()).unwrap();
        (dir, store, tx)
    }

    fn store_value(tx: &mut WriteTransaction, bytes: &[u8]) -> Address {
        data::store_data(tx, bytes, 256, 4).unwrap()
    }

    /// # Scenario
    /// Persist a two-key leaf, reload it through a stub, and compare.
    #[test]
    fn leaf_roundtrip() {
        init_tracing();
        let (_dir, _store, mut tx) = new_write_transaction();

        let v1 = store_value(&mut tx, &[3, 3, 3]);
        let v2 = store_value(&mut tx, &[3, 3, 4]);

        let mut node = Node {
            count: 2,
            kvs: vec![
                KeyValue { key: vec![1, 2, 3], value: v1 },
                KeyValue { key: vec![1, 2, 4], value: v2 },
            ],
            children: Vec::new(),
            address: Address::NIL,
            loaded: true,
            m: 1,
        };

        let address = node.persist(&mut tx).unwrap();
        assert_eq!(address, node.address);

        let mut loaded = Node::stub(address, 1);
        loaded.load(&tx).unwrap();
        assert_eq!(loaded.count, 2);
        assert_eq!(loaded.kvs, node.kvs);
        assert!(loaded.is_leaf());
    }

    /// # Scenario
    /// Persist an internal node with two leaf children; loading gives back
    /// the same keys, and the children reload from their stub addresses.
    #[test]
    fn internal_node_roundtrip() {
        init_tracing();
        let (_dir, _store, mut tx) = new_write_transaction();

        let v1 = store_value(&mut tx, &[3, 3, 3]);
        let v2 = store_value(&mut tx, &[3, 3, 4]);
        let v3 = store_value(&mut tx, &[3, 3, 5]);

        let leaf = |key: Vec<u8>, value: Address| Node {
            count: 1,
            kvs: vec![KeyValue { key, value }],
            children: Vec::new(),
            address: Address::NIL,
            loaded: true,
            m: 1,
        };

        let mut node = Node {
            count: 3,
            kvs: vec![KeyValue { key: vec![1, 2, 4], value: v2 }],
            children: vec![leaf(vec![1, 2, 3], v1), leaf(vec![1, 2, 5], v3)],
            address: Address::NIL,
            loaded: true,
            m: 1,
        };

        let address = node.persist(&mut tx).unwrap();
        assert_eq!(address, node.address);
        // Children were persisted first, post-order.
        assert!(!node.children[0].address.is_nil());
        assert!(!node.children[1].address.is_nil());

        let mut loaded = Node::stub(address, 1);
        loaded.load(&tx).unwrap();
        assert_eq!(loaded.count, 3);
        assert_eq!(loaded.kvs, node.kvs);
        assert_eq!(loaded.children.len(), 2);

        for (i, expected) in [(0usize, vec![1u8, 2, 3]), (1, vec![1, 2, 5])] {
            let mut child = Node::stub(loaded.children[i].address, 1);
            child.load(&tx).unwrap();
            assert_eq!(child.count, 1);
            assert_eq!(child.kvs[0].key, expected);
        }
    }

    /// # Scenario
    /// Persisting a node that already has an address is a no-op: same
    /// address, nothing appended.
    #[test]
    fn persist_is_idempotent_for_clean_nodes() {
        init_tracing();
        let (_dir, _store, mut tx) = new_write_transaction();

        let mut node = Node::empty_leaf(1);
        let first = node.persist(&mut tx).unwrap();
        let second = node.persist(&mut tx).unwrap();
        assert_eq!(first, second);
    }

    /// # Scenario
    /// The persisted block layout matches the contract: a leaf with k keys
    /// carries k children (the value addresses), an internal node with k
    /// keys carries 2k+1 (subtrees first, then values), and the payload
    /// starts with the subtree count and k.
    #[test]
    fn persisted_block_layout() {
        init_tracing();
        let (_dir, _store, mut tx) = new_write_transaction();

        let v1 = store_value(&mut tx, b"a");
        let v2 = store_value(&mut tx, b"b");

        // Leaf with two keys.
        let mut leaf = Node {
            count: 2,
            kvs: vec![
                KeyValue { key: vec![1], value: v1 },
                KeyValue { key: vec![2], value: v2 },
            ],
            children: Vec::new(),
            address: Address::NIL,
            loaded: true,
            m: 1,
        };
        let leaf_address = leaf.persist(&mut tx).unwrap();

        let block = tx.get_block(leaf_address).unwrap();
        assert_eq!(block.block_type(), BlockType::BTreeNode);
        assert_eq!(block.n_children(), 2);
        assert_eq!(block.child_address(0), v1);
        assert_eq!(block.child_address(1), v2);
        assert_eq!(&block.payload()[..8], &2u64.to_be_bytes());
        assert_eq!(&block.payload()[8..12], &2u32.to_be_bytes());

        // Internal node with one key and two subtree children.
        let child = |address: Address| Node::stub(address, 1);
        let left = {
            let mut n = Node::empty_leaf(1);
            n.persist(&mut tx).unwrap();
            n
        };
        let right = {
            let mut n = Node::empty_leaf(1);
            n.persist(&mut tx).unwrap();
            n
        };
        let (left_address, right_address) = (left.address, right.address);
        let mut internal = Node {
            count: 1,
            kvs: vec![KeyValue { key: vec![9], value: v1 }],
            children: vec![child(left_address), child(right_address)],
            address: Address::NIL,
            loaded: true,
            m: 1,
        };
        let internal_address = internal.persist(&mut tx).unwrap();

        let block = tx.get_block(internal_address).unwrap();
        assert_eq!(block.n_children(), 3);
        assert_eq!(block.child_address(0), left_address);
        assert_eq!(block.child_address(1), right_address);
        assert_eq!(block.child_address(2), v1);
    }

    /// # Scenario
    /// Loading a block of the wrong kind fails with corruption, not garbage.
    #[test]
    fn load_rejects_non_btree_blocks() {
        init_tracing();
        let (_dir, _store, mut tx) = new_write_transaction();

        let data_address = store_value(&mut tx, b"not a node");
        let mut stub = Node::stub(data_address, 1);
        let err = stub.load(&tx).unwrap_err();
        assert!(matches!(err, crate::btree::BTreeError::Corruption(_)));
    }
}
