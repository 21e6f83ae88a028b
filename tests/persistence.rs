//! Close-and-reopen scenarios: the on-disk state must reproduce the same
//! multiset of pairs across sessions, and a damaged file pair must fail
//! loudly instead of opening.

use perchdb::{BPlusTree, Key, Value};
use tempfile::tempdir;

fn numbered_key(n: u32) -> Key {
    Key::from_bytes(format!("{:020}", n).as_bytes()).unwrap()
}

fn key(text: &str) -> Key {
    Key::from_bytes(text.as_bytes()).unwrap()
}

#[test]
fn pairs_survive_close_and_reopen() {
    let dir = tempdir().unwrap();
    let prefix = dir.path().join("t");

    {
        let mut tree = BPlusTree::open(&prefix).unwrap();
        for n in 0..1000 {
            tree.insert(&numbered_key(n), n as Value).unwrap();
        }
        tree.close().unwrap();
    }

    let tree = BPlusTree::open(&prefix).unwrap();
    tree.verify().unwrap();
    assert_eq!(tree.find(&numbered_key(500)).unwrap().as_slice(), &[500]);
    assert_eq!(tree.find(&numbered_key(0)).unwrap().as_slice(), &[0]);
    assert_eq!(tree.find(&numbered_key(999)).unwrap().as_slice(), &[999]);
    assert!(tree.find(&numbered_key(1000)).unwrap().is_empty());
}

#[test]
fn duplicate_key_values_survive_reopen() {
    let dir = tempdir().unwrap();
    let prefix = dir.path().join("t");

    {
        let mut tree = BPlusTree::open(&prefix).unwrap();
        for value in (0..200).rev() {
            tree.insert(&key("dup"), value).unwrap();
        }
        tree.close().unwrap();
    }

    let tree = BPlusTree::open(&prefix).unwrap();
    let values = tree.find(&key("dup")).unwrap();
    let expected: Vec<Value> = (0..200).collect();
    assert_eq!(values.as_slice(), expected.as_slice());
}

#[test]
fn reopened_tree_accepts_further_mutation() {
    let dir = tempdir().unwrap();
    let prefix = dir.path().join("t");

    {
        let mut tree = BPlusTree::open(&prefix).unwrap();
        for n in 0..600 {
            tree.insert(&numbered_key(n), n as Value).unwrap();
        }
        tree.close().unwrap();
    }

    {
        let mut tree = BPlusTree::open(&prefix).unwrap();
        for n in 0..300 {
            tree.erase(&numbered_key(n), n as Value).unwrap();
        }
        for n in 600..800 {
            tree.insert(&numbered_key(n), n as Value).unwrap();
        }
        tree.verify().unwrap();
        tree.close().unwrap();
    }

    let tree = BPlusTree::open(&prefix).unwrap();
    tree.verify().unwrap();
    assert!(tree.find(&numbered_key(100)).unwrap().is_empty());
    assert_eq!(tree.find(&numbered_key(400)).unwrap().as_slice(), &[400]);
    assert_eq!(tree.find(&numbered_key(700)).unwrap().as_slice(), &[700]);
}

#[test]
fn bulk_insert_then_erase_every_other_pair() {
    let dir = tempdir().unwrap();
    let prefix = dir.path().join("t");

    let mut tree = BPlusTree::open(&prefix).unwrap();
    for n in 0..10_000 {
        tree.insert(&numbered_key(n), n as Value).unwrap();
    }
    for n in (0..10_000).step_by(2) {
        tree.erase(&numbered_key(n), n as Value).unwrap();
    }

    tree.verify().unwrap();
    for n in (1..10_000).step_by(501) {
        assert_eq!(
            tree.find(&numbered_key(n)).unwrap().as_slice(),
            &[n as Value],
            "odd key {} lost",
            n
        );
    }
    for n in (0..10_000).step_by(500) {
        assert!(
            tree.find(&numbered_key(n)).unwrap().is_empty(),
            "even key {} survived erase",
            n
        );
    }
}

#[test]
fn empty_tree_round_trips() {
    let dir = tempdir().unwrap();
    let prefix = dir.path().join("t");

    BPlusTree::open(&prefix).unwrap().close().unwrap();

    let tree = BPlusTree::open(&prefix).unwrap();
    assert!(tree.is_empty());
    tree.verify().unwrap();
}

#[test]
fn deleting_the_meta_file_makes_reopen_fatal() {
    let dir = tempdir().unwrap();
    let prefix = dir.path().join("t");

    {
        let mut tree = BPlusTree::open(&prefix).unwrap();
        for n in 0..500 {
            tree.insert(&numbered_key(n), n as Value).unwrap();
        }
        tree.close().unwrap();
    }

    std::fs::remove_file(dir.path().join("t.bin")).unwrap();

    let result = BPlusTree::open(&prefix);
    assert!(result.is_err());
}

#[test]
fn recycled_blocks_are_reused_after_reopen() {
    let dir = tempdir().unwrap();
    let prefix = dir.path().join("t");

    let minted = {
        let mut tree = BPlusTree::open(&prefix).unwrap();
        for n in 0..2000 {
            tree.insert(&numbered_key(n), n as Value).unwrap();
        }
        for n in 0..2000 {
            tree.erase(&numbered_key(n), n as Value).unwrap();
        }
        let minted = tree.size();
        tree.close().unwrap();
        minted
    };

    // Refilling the emptied tree draws from the free list instead of
    // growing the file.
    let mut tree = BPlusTree::open(&prefix).unwrap();
    for n in 0..2000 {
        tree.insert(&numbered_key(n), n as Value).unwrap();
    }
    tree.verify().unwrap();
    assert_eq!(tree.size(), minted);
}
