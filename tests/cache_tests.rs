//! Integration tests for the cache facade over the in-process and
//! persistent backends.

use tmpl_module_cache::module::format::unix_now;
use tmpl_module_cache::module::reloc;
use tmpl_module_cache::{CacheLimits, CompiledModule, ModuleBuilder, ModuleCache};

fn module_with(text: &str, timestamp: u64) -> CompiledModule {
    let mut builder = ModuleBuilder::new();
    builder.timestamp(timestamp);
    builder
        .begin_program(0)
        .text(text)
        .var("user")
        .jump_if_empty(3)
        .halt();
    builder.finish()
}

#[test]
fn test_add_then_find_returns_equal_content() {
    let mut cache = ModuleCache::in_memory(CacheLimits::default());
    let module = module_with("Hello, ", unix_now());

    cache.add("{{user}}", module.clone()).unwrap();
    let handle = cache.find("{{user}}").unwrap().unwrap();
    assert!(reloc::same_content(module.as_bytes(), handle.as_bytes()).unwrap());
    cache.release("{{user}}", handle).unwrap();
}

#[test]
fn test_miss_increments_misses_only() {
    let mut cache = ModuleCache::in_memory(CacheLimits::default());
    cache.add("present", module_with("x", unix_now())).unwrap();

    let before = cache.stat();
    assert!(cache.find("absent").unwrap().is_none());
    let after = cache.stat();

    assert_eq!(after.misses, before.misses + 1);
    assert_eq!(after.current_entries, before.current_entries);
    assert_eq!(after.hits, before.hits);
}

#[test]
fn test_reset_is_idempotent() {
    let mut cache = ModuleCache::in_memory(CacheLimits::default());
    cache.add("a", module_with("1", unix_now())).unwrap();
    cache.add("b", module_with("2", unix_now())).unwrap();

    cache.reset().unwrap();
    let first = cache.stat();
    cache.reset().unwrap();
    let second = cache.stat();

    assert_eq!(first.current_entries, 0);
    assert_eq!(second.current_entries, 0);
    assert_eq!(first, second);
}

#[test]
fn test_count_gc_keeps_most_recently_added() {
    let limits = CacheLimits {
        max_entries: 3,
        ..Default::default()
    };
    let mut cache = ModuleCache::in_memory(limits);

    for i in 0..5 {
        let key = format!("tpl{i}");
        cache.add(&key, module_with(&key, unix_now())).unwrap();
    }

    assert_eq!(cache.gc().unwrap(), 2);
    assert_eq!(cache.stat().current_entries, 3);
    assert!(cache.find("tpl0").unwrap().is_none());
    assert!(cache.find("tpl1").unwrap().is_none());
    for i in 2..5 {
        assert!(cache.find(&format!("tpl{i}")).unwrap().is_some());
    }
}

#[test]
fn test_persistent_round_trip_and_restart() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("modules.mdb");
    let module = module_with("durable", unix_now());

    {
        let mut cache = ModuleCache::persistent(CacheLimits::default(), &path).unwrap();
        cache.add("{{page}}", module.clone()).unwrap();
        let handle = cache.find("{{page}}").unwrap().unwrap();
        assert!(reloc::same_content(module.as_bytes(), handle.as_bytes()).unwrap());
        cache.release("{{page}}", handle).unwrap();
    }

    // A fresh process would reopen the same file; the module must survive.
    let mut cache = ModuleCache::persistent(CacheLimits::default(), &path).unwrap();
    let handle = cache.find("{{page}}").unwrap().unwrap();
    assert!(reloc::same_content(module.as_bytes(), handle.as_bytes()).unwrap());
}

#[test]
fn test_persistent_age_gc_removes_exactly_the_stale() {
    let dir = tempfile::TempDir::new().unwrap();
    let limits = CacheLimits {
        max_age_secs: 300,
        ..Default::default()
    };
    let mut cache =
        ModuleCache::persistent(limits, dir.path().join("modules.mdb")).unwrap();

    let now = unix_now();
    cache.add("t1", module_with("a", now - 1000)).unwrap();
    cache.add("t2", module_with("b", now - 400)).unwrap();
    cache.add("t3", module_with("c", now - 10)).unwrap();
    cache.add("t4", module_with("d", now)).unwrap();

    assert_eq!(cache.gc().unwrap(), 2);
    assert!(cache.find("t1").unwrap().is_none());
    assert!(cache.find("t2").unwrap().is_none());
    assert!(cache.find("t3").unwrap().is_some());
    assert!(cache.find("t4").unwrap().is_some());
}

#[test]
fn test_gc_without_limits_removes_nothing() {
    let mut cache = ModuleCache::in_memory(CacheLimits::default());
    cache.add("k", module_with("v", unix_now() - 999_999)).unwrap();
    assert_eq!(cache.gc().unwrap(), 0);
    assert!(cache.find("k").unwrap().is_some());
}
