//! Database initialisation semantics: backup on collision, reopen on
//! bootstrap, and persistence across reopen.

use filament_store::{init_store, RocksStore, Store, DB_DIR_NAME};
use filament_types::test_utils::{test_keypair, test_peer_set};
use filament_types::Event;

fn db_dirs(datadir: &std::path::Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(datadir)
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().to_string())
        .filter(|n| n.contains(DB_DIR_NAME))
        .collect();
    names.sort();
    names
}

#[test]
fn second_init_backs_up_existing_database() {
    let dir = tempfile::tempdir().unwrap();

    let store = init_store(dir.path(), 100, false).unwrap();
    drop(store);
    assert_eq!(db_dirs(dir.path()), vec![DB_DIR_NAME.to_string()]);

    let store = init_store(dir.path(), 100, false).unwrap();
    drop(store);

    let dirs = db_dirs(dir.path());
    assert_eq!(dirs.len(), 2, "expected fresh db plus one backup: {dirs:?}");
    assert!(dirs.contains(&DB_DIR_NAME.to_string()));
    assert!(dirs
        .iter()
        .any(|n| n.starts_with(&format!("{DB_DIR_NAME}_"))));
}

#[test]
fn bootstrap_reopens_in_place() {
    let dir = tempfile::tempdir().unwrap();
    let (peers, keys) = test_peer_set(3);

    {
        let mut store = init_store(dir.path(), 100, false).unwrap();
        store.set_peer_set(0, &peers).unwrap();

        let creator = keys[0].public_key();
        let mut event = Event::new(
            vec![b"tx".to_vec()],
            vec![],
            vec![],
            Event::root_self_parent(&creator),
            None,
            creator,
            0,
            1234,
        );
        event.sign(&keys[0]).unwrap();
        store.set_event(&event).unwrap();
        store.flush().unwrap();
    }

    let mut store = init_store(dir.path(), 100, true).unwrap();
    assert_eq!(db_dirs(dir.path()), vec![DB_DIR_NAME.to_string()]);

    // Index and content survived the reopen.
    assert_eq!(store.get_peer_set(0).unwrap(), peers);
    let creator_hex = keys[0].public_key().to_hex();
    let head = store.last_event_from(&creator_hex).unwrap().unwrap();
    let event = store.get_event(&head).unwrap();
    assert_eq!(event.body.transactions, vec![b"tx".to_vec()]);
    assert_eq!(event.body.index, 0);

    let replay = store.topological_events().unwrap();
    assert_eq!(replay.len(), 1);
}

#[test]
fn persisted_entities_survive_cache_eviction() {
    let dir = tempfile::tempdir().unwrap();
    let (peers, keys) = test_peer_set(3);

    // Cache of 2 events: the first insert is evicted quickly.
    let mut store = RocksStore::open(&dir.path().join(DB_DIR_NAME), 2).unwrap();
    store.set_peer_set(0, &peers).unwrap();

    let key = &keys[1];
    let creator = key.public_key();
    let mut parent = Event::root_self_parent(&creator);
    let mut hashes = Vec::new();
    for i in 0..6 {
        let mut event = Event::new(vec![], vec![], vec![], parent, None, creator, i, 1000 + i);
        event.sign(key).unwrap();
        let hash = event.hash().unwrap();
        store.set_event(&event).unwrap();
        hashes.push(hash);
        parent = hash;
    }
    store.flush().unwrap();

    // All six readable even though the LRU holds two.
    for (i, hash) in hashes.iter().enumerate() {
        let event = store.get_event(hash).unwrap();
        assert_eq!(event.body.index, i as i64);
    }
    assert_eq!(store.known_events()[&1], 5);
}

#[test]
fn test_keypair_is_stable() {
    // Seeded keys must be identical across processes for fixtures to agree.
    assert_eq!(
        test_keypair(5).public_key(),
        test_keypair(5).public_key()
    );
}
