use frankenrouter::core::cache::VariableCache;
use frankenrouter::core::catalogue::VariableCatalogue;

const CATALOGUE: &str = r#"
Qs121="PiBaHeAlTas"; Mode=ECON; Min=10; Max=200;
Qi198="GroundElev"; Mode=ECON; Min=-1000; Max=100000;
Qs468="FansDnResp"; Mode=DELTA; Min=0; Max=500;
Qi16="FltDeck"; Mode=ECON; Min=0; Max=9;
"#;

fn catalogue() -> VariableCatalogue {
    VariableCatalogue::from_data(CATALOGUE).unwrap()
}

#[test]
fn basic_put_get() {
    let mut cache = VariableCache::new();
    assert_eq!(cache.len(), 0);
    cache.put("Qs123", "456");
    cache.put("Qs128", "somestring");
    assert_eq!(cache.len(), 2);
    assert_eq!(cache.get("Qs128"), Some("somestring"));
    assert_eq!(cache.get("Qs999"), None);
    assert!(cache.age("Qs123").unwrap() >= 0.0);
    assert!(cache.age("Qs999").is_none());
}

#[test]
fn update_replaces_value() {
    let mut cache = VariableCache::new();
    cache.put("Qi16", "1");
    cache.put("Qi16", "2");
    assert_eq!(cache.get("Qi16"), Some("2"));
    assert_eq!(cache.len(), 1);
}

#[test]
fn welcome_snapshot_follows_catalogue_order() {
    let cat = catalogue();
    let mut cache = VariableCache::new();
    // Insert in an order unlike the catalogue's.
    cache.put("Qi16", "3");
    cache.put("Qs121", "hello");
    cache.put("Qi198", "42");
    let snapshot = cache.snapshot_for_welcome(&cat);
    let keys: Vec<&str> = snapshot.iter().map(|(k, _)| k.as_str()).collect();
    assert_eq!(keys, vec!["Qs121", "Qi198", "Qi16"]);
}

#[test]
fn welcome_snapshot_excludes_pure_delta() {
    let cat = catalogue();
    let mut cache = VariableCache::new();
    cache.put("Qs121", "hello");
    // The router never caches pure-DELTA keywords, but even if one sneaks
    // in the snapshot must not replay it.
    cache.put("Qs468", "pulse");
    let snapshot = cache.snapshot_for_welcome(&cat);
    let keys: Vec<&str> = snapshot.iter().map(|(k, _)| k.as_str()).collect();
    assert_eq!(keys, vec!["Qs121"]);
}

#[test]
fn unknown_keywords_sort_after_catalogue_entries() {
    let cat = catalogue();
    let mut cache = VariableCache::new();
    cache.put("Qs999", "late");
    cache.put("Qs121", "hello");
    cache.put("Qs100", "earlier");
    let keys = cache.keywords_in_catalogue_order(&cat);
    assert_eq!(keys, vec!["Qs121", "Qs100", "Qs999"]);
}

#[test]
fn snapshot_file_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");

    let mut cache = VariableCache::new();
    cache.put("Qs121", "hello");
    cache.put("version", "10.184");
    cache.write_to_file(&path).unwrap();

    let mut restored = VariableCache::new();
    restored.read_from_file(&path).unwrap();
    assert_eq!(restored.len(), 2);
    assert_eq!(restored.get("Qs121"), Some("hello"));
    assert_eq!(restored.get("version"), Some("10.184"));
}

#[test]
fn bad_snapshot_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");
    std::fs::write(&path, "{not json").unwrap();

    let mut cache = VariableCache::new();
    cache.read_from_file(&path).unwrap();
    assert!(cache.is_empty());

    // Old format versions are rejected too.
    std::fs::write(&path, r#"{"version":1,"variables":{"Qs1":"x"}}"#).unwrap();
    cache.read_from_file(&path).unwrap();
    assert!(cache.is_empty());
}

#[test]
fn missing_snapshot_is_fine() {
    let dir = tempfile::tempdir().unwrap();
    let mut cache = VariableCache::new();
    cache
        .read_from_file(&dir.path().join("nothing-here.json"))
        .unwrap();
    assert!(cache.is_empty());
}

#[test]
fn empty_cache_writes_no_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");
    let cache = VariableCache::new();
    cache.write_to_file(&path).unwrap();
    assert!(!path.exists());
}
