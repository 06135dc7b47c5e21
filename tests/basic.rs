use cortado::listener::RemovalCause;
use cortado::CacheBuilder;
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn make_cache(cap: u64) -> cortado::Cache<String, String> {
    CacheBuilder::new(cap).build()
}

// ---------------------------------------------------------------------------
// Fundamental API correctness
// ---------------------------------------------------------------------------

#[test]
fn get_returns_none_on_miss() {
    let cache = make_cache(10);
    assert_eq!(cache.get("missing"), None);
}

#[test]
fn insert_and_get() {
    let cache = make_cache(10);
    cache.insert("hello".to_string(), "world".to_string());
    assert_eq!(cache.get("hello"), Some(Arc::new("world".to_string())));
}

#[test]
fn update_replaces_value() {
    let cache = make_cache(10);
    assert!(cache.insert("k".to_string(), "v1".to_string()).is_none());
    let prev = cache.insert("k".to_string(), "v2".to_string());
    assert_eq!(prev, Some(Arc::new("v1".to_string())));
    assert_eq!(cache.get("k"), Some(Arc::new("v2".to_string())));
    assert_eq!(cache.entry_count(), 1, "update must not create a second entry");
}

#[test]
fn invalidate_removes_entry() {
    let cache = make_cache(10);
    cache.insert("key".to_string(), "val".to_string());
    let removed = cache.invalidate("key");
    assert_eq!(removed, Some(Arc::new("val".to_string())));
    assert_eq!(cache.get("key"), None);
}

#[test]
fn invalidate_is_idempotent() {
    let cache = make_cache(10);
    cache.insert("key".to_string(), "val".to_string());
    assert!(cache.invalidate("key").is_some());
    assert!(cache.invalidate("key").is_none());
    assert!(cache.invalidate("never-there").is_none());
    assert!(cache.is_empty());
}

#[test]
fn invalidate_all_empties_the_cache() {
    let cache = make_cache(100);
    for i in 0..50 {
        cache.insert(format!("k{i}"), format!("v{i}"));
    }
    cache.invalidate_all();
    assert!(cache.is_empty());
    assert_eq!(cache.get("k0"), None);
}

#[test]
fn stats_track_hits_and_misses() {
    let cache = make_cache(10);
    cache.insert("k".to_string(), "v".to_string());
    cache.get("k"); // hit
    cache.get("k"); // hit
    cache.get("nope"); // miss

    let stats = cache.stats();
    assert_eq!(stats.hit_count, 2);
    assert_eq!(stats.miss_count, 1);
    assert!(
        (stats.hit_rate() - 2.0 / 3.0).abs() < 1e-9,
        "hit_rate = {}",
        stats.hit_rate()
    );
}

#[test]
fn cache_is_clone_and_shared() {
    let c1 = make_cache(10);
    let c2 = c1.clone();
    c1.insert("shared".to_string(), "yes".to_string());
    assert!(
        c2.get("shared").is_some(),
        "cloned handle must see the same entries"
    );
}

// ---------------------------------------------------------------------------
// Capacity enforcement
// ---------------------------------------------------------------------------

#[test]
fn capacity_is_respected_under_load() {
    let cap = 50u64;
    let cache = make_cache(cap);
    for i in 0..250u64 {
        cache.insert(i.to_string(), i.to_string());
    }
    cache.clean_up();
    assert!(
        cache.entry_count() as u64 <= cap,
        "entry_count {} exceeds capacity {}",
        cache.entry_count(),
        cap
    );
    assert!(cache.weighted_size() <= cap);
}

#[test]
fn sequential_overflow_settles_at_exactly_capacity() {
    // Insert 1..=200 into a size-100 cache with no reads: cold arrivals
    // lose the admission duel, so the population stays pinned at the bound.
    let cache: cortado::Cache<u64, u64> = CacheBuilder::new(100).build();
    for i in 1..=200u64 {
        cache.insert(i, i);
    }
    cache.clean_up();
    assert_eq!(cache.entry_count(), 100);
    let stats = cache.stats();
    assert_eq!(stats.eviction_count, 100, "100 arrivals must have been evicted");
}

// ---------------------------------------------------------------------------
// W-TinyLFU admission semantics
// ---------------------------------------------------------------------------

#[test]
fn hot_items_survive_scan_pollution() {
    let cache: cortado::Cache<u64, u64> = CacheBuilder::new(100).build();

    // Warm up 20 hot keys.
    for i in 0..20u64 {
        cache.insert(i, i);
    }
    // Build frequency (must cross the doorkeeper threshold).
    for _ in 0..6 {
        for i in 0..20u64 {
            cache.get(&i);
        }
    }

    // Scan: 400 cold one-hit-wonder insertions.
    for i in 10_000..10_400u64 {
        cache.insert(i, i);
    }
    cache.clean_up();

    let survivors: usize = (0..20).filter(|i| cache.get(i).is_some()).count();
    assert!(
        survivors >= 12,
        "only {survivors}/20 hot items survived — admission should do better"
    );
}

#[test]
fn high_frequency_key_survives_eviction_pressure() {
    let cache: cortado::Cache<u64, u64> = CacheBuilder::new(10).build();

    for i in 0..10u64 {
        cache.insert(i, i);
    }
    for _ in 0..10 {
        cache.get(&0u64);
    }
    for i in 100..120u64 {
        cache.insert(i, i);
    }

    assert!(
        cache.get(&0u64).is_some(),
        "key 0 with high frequency should survive"
    );
    cache.clean_up();
    assert!(cache.entry_count() as u64 <= 10);
}

// ---------------------------------------------------------------------------
// Concurrency
// ---------------------------------------------------------------------------

#[test]
fn concurrent_insert_and_get() {
    let cache: Arc<cortado::Cache<String, String>> = Arc::new(CacheBuilder::new(1_000).build());
    let mut handles = Vec::new();

    for t in 0..8 {
        let c = Arc::clone(&cache);
        handles.push(std::thread::spawn(move || {
            for j in 0..200 {
                let key = format!("t{t}-k{j}");
                c.insert(key.clone(), key.clone());
                let _ = c.get(&key);
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    cache.clean_up();
    assert!(
        cache.entry_count() <= 1_000,
        "entry_count {} exceeds capacity",
        cache.entry_count()
    );
}

#[test]
fn write_visibility_across_threads() {
    let cache: Arc<cortado::Cache<u64, u64>> = Arc::new(CacheBuilder::new(100).build());
    cache.insert(1, 10);
    let c = Arc::clone(&cache);
    let seen = std::thread::spawn(move || c.get(&1))
        .join()
        .unwrap();
    assert_eq!(seen, Some(Arc::new(10)), "a completed write must be visible");
}

// ---------------------------------------------------------------------------
// Weigher
// ---------------------------------------------------------------------------

#[test]
fn weigher_controls_capacity_in_bytes() {
    // Budget = 100 bytes.  Each value weighs len + 1 = 11, so at most 9 fit.
    let cache: cortado::Cache<u64, Vec<u8>> = CacheBuilder::unbounded()
        .max_weight(100)
        .weigher(|_k: &u64, v: &Vec<u8>| v.len() as u64 + 1)
        .build();

    for i in 0..20u64 {
        cache.insert(i, vec![0u8; 10]);
    }
    cache.clean_up();
    assert!(
        cache.entry_count() <= 9,
        "too many entries for the byte budget: {}",
        cache.entry_count()
    );
    assert!(cache.weighted_size() <= 100);
}

// ---------------------------------------------------------------------------
// TTL / TTI against the wall clock
// ---------------------------------------------------------------------------

#[test]
fn ttl_entry_not_returned_after_expiry() {
    let cache: cortado::Cache<String, String> = CacheBuilder::new(100)
        .time_to_live(Duration::from_millis(50))
        .build();

    cache.insert("k".to_string(), "v".to_string());
    assert!(cache.get("k").is_some(), "entry should be alive");

    std::thread::sleep(Duration::from_millis(100));

    assert!(cache.get("k").is_none(), "entry should have expired");
}

#[test]
fn ttl_entry_replaced_resets_expiry() {
    let cache: cortado::Cache<String, String> = CacheBuilder::new(100)
        .time_to_live(Duration::from_millis(80))
        .build();

    cache.insert("k".to_string(), "v1".to_string());
    std::thread::sleep(Duration::from_millis(50));
    cache.insert("k".to_string(), "v2".to_string());
    std::thread::sleep(Duration::from_millis(50));
    // 100 ms since the first write, but only 50 ms since the replace.
    assert!(
        cache.get("k").is_some(),
        "re-inserted entry should still be alive"
    );
}

#[test]
fn tti_entry_expires_without_access() {
    let cache: cortado::Cache<String, String> = CacheBuilder::new(100)
        .time_to_idle(Duration::from_millis(60))
        .build();

    cache.insert("k".to_string(), "v".to_string());
    std::thread::sleep(Duration::from_millis(100));

    assert!(cache.get("k").is_none(), "idle entry should have expired");
}

#[test]
fn tti_access_resets_idle_timer() {
    let cache: cortado::Cache<String, String> = CacheBuilder::new(100)
        .time_to_idle(Duration::from_millis(80))
        .build();

    cache.insert("k".to_string(), "v".to_string());

    for _ in 0..3 {
        std::thread::sleep(Duration::from_millis(50));
        assert!(
            cache.get("k").is_some(),
            "entry should be alive while being accessed"
        );
    }

    std::thread::sleep(Duration::from_millis(120));
    assert!(
        cache.get("k").is_none(),
        "entry should expire after the idle period"
    );
}

// ---------------------------------------------------------------------------
// Removal listener
// ---------------------------------------------------------------------------

#[test]
fn listener_fires_on_size_eviction() {
    let log: Arc<Mutex<Vec<(u64, RemovalCause)>>> = Arc::new(Mutex::new(Vec::new()));
    let log2 = Arc::clone(&log);

    let cache: cortado::Cache<u64, u64> = CacheBuilder::new(5)
        .removal_listener(move |key: &u64, _val, cause| {
            log2.lock().unwrap().push((*key, cause));
        })
        .build();

    for i in 0..20u64 {
        cache.insert(i, i * 10);
    }
    cache.clean_up();

    let events = log.lock().unwrap();
    assert!(!events.is_empty(), "expected at least one eviction event");
    assert!(
        events.iter().all(|(_, c)| *c == RemovalCause::Size),
        "all events should be Size: {events:?}"
    );
}

#[test]
fn listener_fires_on_explicit_invalidate() {
    let log: Arc<Mutex<Vec<(u64, RemovalCause)>>> = Arc::new(Mutex::new(Vec::new()));
    let log2 = Arc::clone(&log);

    let cache: cortado::Cache<u64, u64> = CacheBuilder::new(100)
        .removal_listener(move |key: &u64, _val, cause| {
            log2.lock().unwrap().push((*key, cause));
        })
        .build();

    cache.insert(42, 420);
    cache.invalidate(&42);

    let events = log.lock().unwrap();
    assert_eq!(events.as_slice(), &[(42, RemovalCause::Explicit)]);
}

#[test]
fn listener_fires_replaced_on_overwrite() {
    let log: Arc<Mutex<Vec<(u64, u64, RemovalCause)>>> = Arc::new(Mutex::new(Vec::new()));
    let log2 = Arc::clone(&log);

    let cache: cortado::Cache<u64, u64> = CacheBuilder::new(100)
        .removal_listener(move |key: &u64, val: Arc<u64>, cause| {
            log2.lock().unwrap().push((*key, *val, cause));
        })
        .build();

    cache.insert(1, 10);
    cache.insert(1, 11);

    let events = log.lock().unwrap();
    assert_eq!(events.as_slice(), &[(1, 10, RemovalCause::Replaced)]);
}

#[test]
fn listener_fires_on_ttl_expiry() {
    let log: Arc<Mutex<Vec<RemovalCause>>> = Arc::new(Mutex::new(Vec::new()));
    let log2 = Arc::clone(&log);

    let cache: cortado::Cache<u64, u64> = CacheBuilder::new(100)
        .time_to_live(Duration::from_millis(50))
        .removal_listener(move |_key, _val, cause| {
            log2.lock().unwrap().push(cause);
        })
        .build();

    cache.insert(1, 100);

    std::thread::sleep(Duration::from_millis(100));
    let _ = cache.get(&1); // inline expiry detection

    let events = log.lock().unwrap();
    assert!(
        events.iter().any(|c| *c == RemovalCause::Expired),
        "expected an Expired event"
    );
}

#[test]
fn panicking_listener_does_not_break_the_cache() {
    let cache: cortado::Cache<u64, u64> = CacheBuilder::new(100)
        .removal_listener(|_key: &u64, _val, _cause| {
            panic!("listener blew up");
        })
        .build();

    cache.insert(1, 10);
    cache.invalidate(&1); // must not propagate the panic
    cache.insert(2, 20);
    assert_eq!(cache.get(&2), Some(Arc::new(20)));
}
