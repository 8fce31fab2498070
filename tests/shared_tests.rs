//! Integration tests for the shared-memory backend through the facade.

use tmpl_module_cache::module::format::unix_now;
use tmpl_module_cache::module::reloc;
use tmpl_module_cache::{CacheError, CacheLimits, CompiledModule, ModuleBuilder, ModuleCache};
use xxhash_rust::xxh64::xxh64;

fn module_with(text: &str) -> CompiledModule {
    let mut builder = ModuleBuilder::new();
    builder.timestamp(unix_now());
    builder.begin_program(0).text(text).var("name").halt();
    builder.finish()
}

#[test]
fn test_end_to_end_fill_and_reset() {
    let mut cache =
        ModuleCache::shared_memory(CacheLimits::default(), 2_097_152, 2_053).unwrap();

    let keys = ["{{foo}}", "{{bar}}", "{{baz}}"];
    let modules: Vec<_> = keys.iter().map(|key| module_with(key)).collect();
    for (key, module) in keys.iter().zip(&modules) {
        cache.add(key, module.clone()).unwrap();
    }

    for (key, module) in keys.iter().zip(&modules) {
        let handle = cache.find(key).unwrap().unwrap();
        assert!(
            reloc::same_content(module.as_bytes(), handle.as_bytes()).unwrap(),
            "{key} returned different content"
        );
        cache.release(key, handle).unwrap();
    }
    assert_eq!(cache.stat().hits, 3);
    assert_eq!(cache.stat().current_entries, 3);

    cache.reset().unwrap();

    for key in keys {
        assert!(cache.find(key).unwrap().is_none(), "{key} survived reset");
    }
    assert_eq!(cache.stat().current_entries, 0);
}

#[test]
fn test_found_content_matches_added_content() {
    let mut cache =
        ModuleCache::shared_memory(CacheLimits::default(), 1 << 20, 101).unwrap();
    let module = module_with("shared hello");
    cache.add("k", module.clone()).unwrap();

    let handle = cache.find("k").unwrap().unwrap();
    assert!(reloc::same_content(module.as_bytes(), handle.as_bytes()).unwrap());
    // The view addresses live shared memory; verification passes in place.
    assert!(reloc::verify(handle.as_bytes(), true).unwrap());
    cache.release("k", handle).unwrap();
}

/// Find two distinct keys that land on the same slot of a small table.
fn colliding_keys(table_count: u64) -> (String, String) {
    let first = "{{first}}".to_string();
    let target = xxh64(first.as_bytes(), 0) % table_count;
    for i in 0.. {
        let candidate = format!("{{{{c{i}}}}}");
        if candidate != first && xxh64(candidate.as_bytes(), 0) % table_count == target {
            return (first, candidate);
        }
    }
    unreachable!("search space exhausted");
}

#[test]
fn test_colliding_insert_is_counted_and_dropped() {
    let table_count = 7;
    let mut cache =
        ModuleCache::shared_memory(CacheLimits::default(), 1 << 20, table_count).unwrap();
    let (first, second) = colliding_keys(table_count as u64);

    let first_module = module_with("first wins");
    cache.add(&first, first_module.clone()).unwrap();
    assert_eq!(cache.stat().collisions, 0);

    cache.add(&second, module_with("never stored")).unwrap();
    assert_eq!(cache.stat().collisions, 1);
    assert_eq!(cache.stat().current_entries, 1);

    // The resident entry is untouched.
    let handle = cache.find(&first).unwrap().unwrap();
    assert!(reloc::same_content(first_module.as_bytes(), handle.as_bytes()).unwrap());
    cache.release(&first, handle).unwrap();

    // The collided key reads as a miss (and counts another collision).
    assert!(cache.find(&second).unwrap().is_none());
    assert_eq!(cache.stat().collisions, 2);
}

#[test]
fn test_refcount_gates_reset_and_drains_to_zero() {
    let mut cache =
        ModuleCache::shared_memory(CacheLimits::default(), 1 << 20, 101).unwrap();
    cache.add("a", module_with("one")).unwrap();
    cache.add("b", module_with("two")).unwrap();

    let ha = cache.find("a").unwrap().unwrap();
    let hb = cache.find("b").unwrap().unwrap();
    assert_eq!(cache.stat().readers, 2);

    cache.release("a", ha).unwrap();
    assert_eq!(cache.stat().readers, 1);
    assert!(matches!(
        cache.reset(),
        Err(CacheError::ResetTimeout { readers: 1 })
    ));
    // An aborted reset leaves prior entries intact.
    assert_eq!(cache.stat().current_entries, 2);

    cache.release("b", hb).unwrap();
    assert_eq!(cache.stat().readers, 0);
    cache.reset().unwrap();
    assert_eq!(cache.stat().current_entries, 0);
}

#[test]
fn test_gc_is_a_no_op() {
    let mut cache =
        ModuleCache::shared_memory(CacheLimits::default(), 1 << 20, 101).unwrap();
    cache.add("k", module_with("v")).unwrap();
    assert_eq!(cache.gc().unwrap(), 0);
    assert_eq!(cache.stat().current_entries, 1);
}
