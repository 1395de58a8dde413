use std::collections::HashMap;
use syncmap_rs::SyncMap;

#[test]
fn test_store_load_range_delete() {
    let map = SyncMap::new();
    map.store("foo".to_string(), 42);
    assert_eq!(map.load("foo"), Some(42));

    let mut visited = Vec::new();
    map.range(|k, v| {
        visited.push((k.clone(), *v));
        true
    });
    assert_eq!(visited, vec![("foo".to_string(), 42)]);

    map.delete("foo");
    assert_eq!(map.load("foo"), None);
}

#[test]
fn test_load_missing() {
    let map: SyncMap<u64, u64> = SyncMap::new();
    assert_eq!(map.load(&1), None);
    assert!(map.is_empty());
    assert_eq!(map.len(), 0);
}

#[test]
fn test_store_overwrites() {
    let map = SyncMap::new();
    map.store(1, "a");
    map.store(1, "b");
    assert_eq!(map.load(&1), Some("b"));
    // Once promoted, overwrites go through the lock-free path.
    map.range(|_, _| true);
    map.store(1, "c");
    assert_eq!(map.load(&1), Some("c"));
}

#[test]
fn test_store_after_delete() {
    let map = SyncMap::new();
    map.store(1, 10);
    map.range(|_, _| true);
    map.delete(&1);
    assert_eq!(map.load(&1), None);
    map.store(2, 20);
    map.store(1, 11);
    assert_eq!(map.load(&1), Some(11));
    assert_eq!(map.load(&2), Some(20));
    assert_eq!(map.len(), 2);
}

#[test]
fn test_load_or_store() {
    let map = SyncMap::new();
    assert_eq!(map.load_or_store("k", 1), (1, false));
    assert_eq!(map.load_or_store("k", 2), (1, true));
    map.delete("k");
    assert_eq!(map.load_or_store("k", 3), (3, false));
    assert_eq!(map.load(&"k"), Some(3));
}

#[test]
fn test_load_or_store_after_expunge() {
    let map = SyncMap::new();
    map.store(1, 1);
    map.range(|_, _| true);
    map.delete(&1);
    map.store(2, 2);
    assert_eq!(map.load_or_store(1, 5), (5, false));
    assert_eq!(map.load_or_store(1, 6), (5, true));
    map.range(|_, _| true);
    assert_eq!(map.load(&1), Some(5));
}

#[test]
fn test_load_and_delete() {
    let map = SyncMap::new();
    assert_eq!(map.load_and_delete(&1), None);
    map.store(1, 100);
    assert_eq!(map.load_and_delete(&1), Some(100));
    assert_eq!(map.load_and_delete(&1), None);

    map.store(2, 200);
    map.range(|_, _| true);
    assert_eq!(map.load_and_delete(&2), Some(200));
    assert_eq!(map.load(&2), None);
}

#[test]
fn test_swap() {
    let map = SyncMap::new();
    assert_eq!(map.swap(1, 10), None);
    assert_eq!(map.swap(1, 11), Some(10));
    map.delete(&1);
    assert_eq!(map.swap(1, 12), None);
    assert_eq!(map.load(&1), Some(12));
}

#[test]
fn test_compare_and_swap() {
    let map = SyncMap::new();
    assert!(!map.compare_and_swap(&1, &0, 1));
    assert_eq!(map.load(&1), None);

    map.store(1, 10);
    assert!(map.compare_and_swap(&1, &10, 11));
    assert!(!map.compare_and_swap(&1, &10, 12));
    assert_eq!(map.load(&1), Some(11));

    map.range(|_, _| true);
    assert!(map.compare_and_swap(&1, &11, 13));
    assert_eq!(map.load(&1), Some(13));

    map.delete(&1);
    assert!(!map.compare_and_swap(&1, &13, 14));
    assert_eq!(map.load(&1), None);
}

#[test]
fn test_compare_and_delete() {
    let map = SyncMap::new();
    assert!(!map.compare_and_delete(&1, &0));

    map.store(1, 10);
    assert!(!map.compare_and_delete(&1, &9));
    assert_eq!(map.load(&1), Some(10));
    assert!(map.compare_and_delete(&1, &10));
    assert_eq!(map.load(&1), None);
    assert!(!map.compare_and_delete(&1, &10));
}

#[test]
fn test_range_early_stop() {
    let map = SyncMap::new();
    for i in 0..100 {
        map.store(i, i);
    }
    let mut calls = 0;
    map.range(|_, _| {
        calls += 1;
        calls < 10
    });
    assert_eq!(calls, 10);
}

#[test]
fn test_range_visits_each_key_once() {
    let map = SyncMap::new();
    for i in 0..1000 {
        map.store(i, i * 2);
    }
    for i in (0..1000).step_by(3) {
        map.delete(&i);
    }

    let mut seen = HashMap::new();
    map.range(|k, v| {
        assert!(seen.insert(*k, *v).is_none(), "key {} visited twice", k);
        true
    });

    let expected: HashMap<_, _> = (0..1000).filter(|i| i % 3 != 0).map(|i| (i, i * 2)).collect();
    assert_eq!(seen, expected);
}

#[test]
fn test_range_reentrant() {
    let map = SyncMap::new();
    for i in 0..10 {
        map.store(i, i);
    }
    map.range(|k, v| {
        assert_eq!(map.load(k), Some(*v));
        map.store(k + 100, *v);
        map.delete(k);
        true
    });
    for i in 0..10 {
        assert_eq!(map.load(&i), None);
        assert_eq!(map.load(&(i + 100)), Some(i));
    }
}

#[test]
fn test_iter() {
    let map = SyncMap::new();
    for i in 0..10 {
        map.store(i, format!("value_{}", i));
    }
    let mut items: Vec<_> = map.iter().collect();
    items.sort();
    let expected: Vec<_> = (0..10).map(|i| (i, format!("value_{}", i))).collect();
    assert_eq!(items, expected);
}

#[test]
fn test_iter_skips_keys_deleted_after_creation() {
    let map = SyncMap::new();
    map.store(1, 1);
    map.store(2, 2);
    let mut iter = map.iter();
    map.delete(&1);
    map.delete(&2);
    assert_eq!(iter.next(), None);
}

#[test]
fn test_clear() {
    let map = SyncMap::new();
    for i in 0..10 {
        map.store(i, i);
    }
    map.range(|_, _| true);
    map.store(10, 10);
    map.clear();
    assert!(map.is_empty());
    for i in 0..=10 {
        assert_eq!(map.load(&i), None);
    }
    map.store(3, 33);
    assert_eq!(map.load(&3), Some(33));
    assert_eq!(map.len(), 1);
}

#[test]
fn test_from_iter_and_debug() {
    let map: SyncMap<i32, &str> = vec![(1, "one")].into_iter().collect();
    assert_eq!(map.load(&1), Some("one"));
    assert_eq!(format!("{:?}", map), r#"{1: "one"}"#);
}

#[test]
fn test_with_hasher() {
    let map = SyncMap::with_hasher(std::collections::hash_map::RandomState::new());
    map.store(String::from("a"), 1);
    assert_eq!(map.load("a"), Some(1));
}
