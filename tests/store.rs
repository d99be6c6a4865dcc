use std::fs;

use camino::Utf8PathBuf;
use kira_netpharm::cache::{CacheBackend, CacheKey, CacheManager, InvalidateScope};
use kira_netpharm::domain::Options;
use kira_netpharm::store::{FileStore, write_atomic};
use kira_netpharm::table::{Association, ResultTable};

fn root(temp: &tempfile::TempDir) -> Utf8PathBuf {
    Utf8PathBuf::from_path_buf(temp.path().join("cache")).unwrap()
}

#[test]
fn entries_survive_a_new_manager() {
    let temp = tempfile::tempdir().unwrap();
    let key = CacheKey::new("targets", "chembl", "CCO", &Options::new(), false);
    let table = ResultTable::from_rows(vec![Association::new("CCO", "ADH1B").with_score(0.6)]);

    let first = CacheManager::new(Box::new(FileStore::new_with_root(root(&temp))));
    first.put(&key, &table, None);
    drop(first);

    let second = CacheManager::new(Box::new(FileStore::new_with_root(root(&temp))));
    let entry = second.get(&key).unwrap();
    assert_eq!(entry.table, table);
    assert_eq!(entry.strategy, "chembl");

    let path = root(&temp).join(format!("{}.json", key.storage_key()));
    assert!(path.as_std_path().is_file());
}

#[test]
fn step_scope_removes_only_that_step() {
    let temp = tempfile::tempdir().unwrap();
    let cache = CacheManager::new(Box::new(FileStore::new_with_root(root(&temp))));
    let table = ResultTable::from_rows(vec![Association::new("x", "Y")]);
    let targets = CacheKey::new("targets", "chembl", "CCO", &Options::new(), false);
    let other = CacheKey::new("targets", "stitch", "CCO", &Options::new(), false);
    let disease = CacheKey::new("disease", "omim", "asthma", &Options::new(), false);
    for key in [&targets, &other, &disease] {
        cache.put(key, &table, None);
    }

    assert_eq!(cache.invalidate(&InvalidateScope::Step("targets".to_string())), 2);
    assert!(cache.get(&targets).is_none());
    assert!(cache.get(&disease).is_some());
    assert_eq!(cache.invalidate(&InvalidateScope::Key(disease.clone())), 1);
    assert!(cache.get(&disease).is_none());
}

#[test]
fn torn_write_is_treated_as_a_miss() {
    let temp = tempfile::tempdir().unwrap();
    let store = FileStore::new_with_root(root(&temp));
    let key = CacheKey::new("targets", "chembl", "CCO", &Options::new(), false);
    let path = store.entry_path(&key.storage_key()).unwrap();
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(&path, br#"{"created_at": "2026-01-01T00:00:00Z", "strat"#).unwrap();

    let cache = CacheManager::new(Box::new(store.clone()));
    assert!(cache.get(&key).is_none());
    assert!(cache.is_available());
    assert_eq!(store.get(&key.storage_key()).unwrap(), None);
}

#[test]
fn atomic_write_replaces_content() {
    let temp = tempfile::tempdir().unwrap();
    let path = Utf8PathBuf::from_path_buf(temp.path().join("out/targets.tsv")).unwrap();
    write_atomic(&path, b"first").unwrap();
    write_atomic(&path, b"second").unwrap();
    assert_eq!(fs::read_to_string(&path).unwrap(), "second");
    let leftovers = fs::read_dir(path.parent().unwrap())
        .unwrap()
        .count();
    assert_eq!(leftovers, 1);
}
