//! The concurrent-map surface: conditional writes, atomic computes,
//! borrowed-key lookups, and the live views.

use cortado::{CacheBuilder, Error};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn unbounded() -> cortado::Cache<String, String> {
    CacheBuilder::unbounded().build()
}

// ---------------------------------------------------------------------------
// Conditional writes
// ---------------------------------------------------------------------------

#[test]
fn insert_returns_previous_value() {
    let cache = unbounded();
    assert!(cache.insert("k".into(), "v1".into()).is_none());
    assert_eq!(
        cache.insert("k".into(), "v2".into()),
        Some(Arc::new("v1".to_string()))
    );
}

#[test]
fn insert_if_absent_keeps_the_incumbent() {
    let cache = unbounded();
    assert!(cache.insert_if_absent("k".into(), "v1".into()).is_none());
    let existing = cache.insert_if_absent("k".into(), "v2".into());
    assert_eq!(existing, Some(Arc::new("v1".to_string())));
    assert_eq!(cache.get("k"), Some(Arc::new("v1".to_string())));
}

#[test]
fn replace_requires_presence() {
    let cache = unbounded();
    assert!(cache.replace(&"k".to_string(), "v1".into()).is_none());
    assert!(cache.get("k").is_none(), "replace must not install on absent");

    cache.insert("k".into(), "v1".into());
    let prev = cache.replace(&"k".to_string(), "v2".into());
    assert_eq!(prev, Some(Arc::new("v1".to_string())));
    assert_eq!(cache.get("k"), Some(Arc::new("v2".to_string())));
}

#[test]
fn compare_replace_checks_the_expected_value() {
    let cache = unbounded();
    cache.insert("k".into(), "v1".into());

    assert!(!cache.compare_replace(&"k".to_string(), &"wrong".to_string(), "v2".into()));
    assert_eq!(cache.get("k"), Some(Arc::new("v1".to_string())));

    assert!(cache.compare_replace(&"k".to_string(), &"v1".to_string(), "v2".into()));
    assert_eq!(cache.get("k"), Some(Arc::new("v2".to_string())));
}

#[test]
fn compare_invalidate_checks_the_expected_value() {
    let cache = unbounded();
    cache.insert("k".into(), "v1".into());

    assert!(!cache.compare_invalidate("k", &"wrong".to_string()));
    assert!(cache.get("k").is_some());

    assert!(cache.compare_invalidate("k", &"v1".to_string()));
    assert!(cache.get("k").is_none());
}

// ---------------------------------------------------------------------------
// Atomic computes
// ---------------------------------------------------------------------------

#[test]
fn compute_inserts_on_absent() {
    let cache = unbounded();
    let r = cache
        .compute("k".to_string(), |prev| {
            assert!(prev.is_none());
            Some("v1".to_string())
        })
        .unwrap();
    assert_eq!(r, Some(Arc::new("v1".to_string())));
    // The compute result is immediately observable.
    assert_eq!(cache.get("k"), Some(Arc::new("v1".to_string())));
}

#[test]
fn compute_replaces_and_removes() {
    let cache = unbounded();
    cache.insert("k".into(), "1".into());

    let r = cache
        .compute("k".to_string(), |prev| {
            let n: u64 = prev.unwrap().parse().unwrap();
            Some((n + 1).to_string())
        })
        .unwrap();
    assert_eq!(r, Some(Arc::new("2".to_string())));

    let r = cache.compute("k".to_string(), |_| None).unwrap();
    assert!(r.is_none());
    assert!(cache.get("k").is_none());
}

#[test]
fn compute_none_to_none_is_a_noop() {
    let cache = unbounded();
    let r = cache.compute("k".to_string(), |prev| prev.map(|v| (*v).clone())).unwrap();
    assert!(r.is_none());
    assert!(cache.is_empty());
}

#[test]
fn compute_if_present_skips_absent_keys() {
    let cache = unbounded();
    let called = AtomicUsize::new(0);
    let r = cache
        .compute_if_present("k".to_string(), |_| {
            called.fetch_add(1, Ordering::SeqCst);
            Some("v".to_string())
        })
        .unwrap();
    assert!(r.is_none());
    assert_eq!(called.load(Ordering::SeqCst), 0);

    cache.insert("k".into(), "v1".into());
    let r = cache
        .compute_if_present("k".to_string(), |v| Some(format!("{v}!")))
        .unwrap();
    assert_eq!(r, Some(Arc::new("v1!".to_string())));
}

#[test]
fn merge_combines_values() {
    let cache: cortado::Cache<String, u64> = CacheBuilder::unbounded().build();

    let r = cache
        .merge("n".to_string(), 5, |old, new| Some(*old + new))
        .unwrap();
    assert_eq!(r, Some(Arc::new(5)), "absent key takes the given value");

    let r = cache
        .merge("n".to_string(), 7, |old, new| Some(*old + new))
        .unwrap();
    assert_eq!(r, Some(Arc::new(12)));

    let r = cache.merge("n".to_string(), 0, |_, _| None).unwrap();
    assert!(r.is_none());
    assert!(cache.get("n").is_none(), "merge to None removes the mapping");
}

#[test]
fn get_with_computes_once_per_key() {
    let cache = unbounded();
    let calls = AtomicUsize::new(0);

    let v1 = cache
        .get_with("k".to_string(), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            "computed".to_string()
        })
        .unwrap();
    let v2 = cache
        .get_with("k".to_string(), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            "recomputed".to_string()
        })
        .unwrap();

    assert_eq!(v1, v2);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn concurrent_get_with_loads_once() {
    let cache: Arc<cortado::Cache<u64, u64>> = Arc::new(CacheBuilder::new(100).build());
    let calls = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let c = Arc::clone(&cache);
        let calls = Arc::clone(&calls);
        handles.push(std::thread::spawn(move || {
            c.get_with(7, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                std::thread::sleep(std::time::Duration::from_millis(5));
                42
            })
            .unwrap()
        }));
    }
    for h in handles {
        assert_eq!(*h.join().unwrap(), 42);
    }
    assert_eq!(
        calls.load(Ordering::SeqCst),
        1,
        "losers must observe the winner's value"
    );
}

// ---------------------------------------------------------------------------
// Reentrancy
// ---------------------------------------------------------------------------

#[test]
fn reentrant_compute_on_a_colliding_key_is_rejected() {
    // One shard makes every key pair collide by construction.
    let cache: cortado::Cache<u64, u64> = CacheBuilder::new(100).num_shards(1).build();
    let nested = cache.clone();

    let result = cache.try_get_with(1, |_| {
        let inner = nested.get_with(2, |_| 22);
        assert!(
            matches!(inner, Err(Error::ReentrantCompute)),
            "nested compute on the held shard must fail, got {inner:?}"
        );
        Err("outer aborted".into())
    });

    assert!(result.is_err());
    // The failed calls left no trace.
    assert!(cache.get(&1).is_none());
    assert!(cache.get(&2).is_none());
}

#[test]
fn computes_on_distinct_caches_may_nest() {
    let outer: cortado::Cache<u64, u64> = CacheBuilder::new(10).num_shards(1).build();
    let backing: cortado::Cache<u64, u64> = CacheBuilder::new(10).num_shards(1).build();

    let b = backing.clone();
    let v = outer
        .get_with(1, move |_| *b.get_with(1, |_| 99).unwrap())
        .unwrap();
    assert_eq!(*v, 99);
}

// ---------------------------------------------------------------------------
// Borrowed-key lookups
// ---------------------------------------------------------------------------

#[test]
fn borrowed_forms_share_equality() {
    let cache = CacheBuilder::unbounded().build();
    for i in 0..500u32 {
        cache.insert(format!("key-{i}"), i.to_string());
    }
    for i in 0..500u32 {
        let owned = format!("key-{i}");
        // Owned and borrowed forms of the same base key both match.
        assert!(cache.contains_key(&owned));
        assert!(cache.contains_key(owned.as_str()));
        assert_eq!(cache.get(owned.as_str()), Some(Arc::new(i.to_string())));
    }
}

// ---------------------------------------------------------------------------
// Views
// ---------------------------------------------------------------------------

#[test]
fn iteration_visits_each_live_key_once() {
    let cache = unbounded();
    for i in 0..100 {
        cache.insert(format!("k{i}"), format!("v{i}"));
    }

    let mut seen: Vec<String> = cache.keys().collect();
    seen.sort();
    seen.dedup();
    assert_eq!(seen.len(), 100, "each key must be visited exactly once");
}

#[test]
fn iterator_tolerates_concurrent_removal() {
    let cache = unbounded();
    for i in 0..20 {
        cache.insert(format!("k{i}"), format!("v{i}"));
    }

    let mut iter = cache.iter();
    let first = iter.next().expect("cache is non-empty");
    cache.invalidate("k7"); // mutate mid-iteration
    let visited: usize = 1 + iter.count();
    assert!(visited <= 20);
    assert!(!first.key().is_empty());
}

#[test]
fn entry_view_set_value_writes_through() {
    let cache = unbounded();
    for i in 0..20 {
        cache.insert(format!("k{i}"), format!("v{i}"));
    }

    let entry = cache.iter().next().expect("cache is non-empty");
    let other = (0..20)
        .map(|i| format!("k{i}"))
        .find(|k| k != entry.key())
        .unwrap();
    cache.invalidate(other.as_str());

    entry.set_value("XYZ".to_string());
    assert!(
        cache.contains_value(&"XYZ".to_string()),
        "set_value on a captured entry must write through to the map"
    );
    assert_eq!(cache.get(entry.key().as_str()), Some(Arc::new("XYZ".to_string())));
}

#[test]
fn values_view_reflects_the_map() {
    let cache: cortado::Cache<u64, u64> = CacheBuilder::unbounded().build();
    for i in 0..10u64 {
        cache.insert(i, i * i);
    }
    let mut values: Vec<u64> = cache.values().map(|v| *v).collect();
    values.sort_unstable();
    assert_eq!(values, (0..10u64).map(|i| i * i).collect::<Vec<_>>());
}

// ---------------------------------------------------------------------------
// Laws
// ---------------------------------------------------------------------------

#[test]
fn insert_all_round_trips() {
    let cache = unbounded();
    let entries: Vec<(String, String)> = (0..64)
        .map(|i| (format!("k{i}"), format!("v{i}")))
        .collect();
    cache.insert_all(entries.clone());

    for (k, v) in &entries {
        assert_eq!(cache.get(k.as_str()).as_deref(), Some(v));
    }
}

#[test]
fn contains_value_scans_live_entries() {
    let cache = unbounded();
    cache.insert("a".into(), "x".into());
    cache.insert("b".into(), "y".into());
    assert!(cache.contains_value(&"x".to_string()));
    assert!(!cache.contains_value(&"z".to_string()));
}
