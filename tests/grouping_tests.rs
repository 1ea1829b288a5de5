mod common;

use ahash::AHashSet;
use seshat::prelude::*;
use std::sync::Arc;
use std::thread;

use common::{
    AmbiguousKey, GroupedKey, create_record_batch, kx_grouper, setup_cluster,
    setup_grouped_cluster,
};

fn keys(keys: &[GroupedKey]) -> AHashSet<CacheKey> {
    keys.iter().cloned().map(CacheKey::new).collect()
}

#[test]
fn test_group_resolution_is_deterministic() {
    let cluster = setup_grouped_cluster(3, vec![kx_grouper()]);
    let key = CacheKey::new(GroupedKey::new("orders", 7));

    for node in cluster.nodes() {
        for _ in 0..3 {
            assert_eq!(node.get_group(&key).unwrap(), Some("orders".to_string()));
        }
    }
    // A plain key with no accessor and no matching grouper has no group.
    assert_eq!(
        cluster.nodes()[0].get_group(&CacheKey::new(42u64)).unwrap(),
        None
    );
}

#[test]
fn test_concurrent_first_resolution_agrees() {
    let manager = Arc::new(GroupManager::new(vec![kx_grouper()]));
    let handles: Vec<_> = (0..8)
        .map(|i| {
            let manager = Arc::clone(&manager);
            thread::spawn(move || {
                let key = CacheKey::new(GroupedKey::new("shared", i));
                manager.get_group(&key).unwrap()
            })
        })
        .collect();

    for handle in handles {
        assert_eq!(handle.join().unwrap(), Some("shared".to_string()));
    }
    assert_eq!(manager.cached_key_types(), 1);
}

#[test]
fn test_ambiguous_accessors_fail_every_time() {
    let cluster = setup_grouped_cluster(2, Vec::new());
    let node = &cluster.nodes()[0];
    let key = CacheKey::new(AmbiguousKey::new("eu", "acme"));

    let first = node.get_group(&key).unwrap_err();
    let second = node.get_group(&key).unwrap_err();
    assert!(matches!(first, SeshatError::Configuration(_)));
    assert_eq!(first, second);

    // Routing a write needs the group too.
    let result = node.put(key, create_record_batch(vec![1], vec![Some("x")]));
    assert_eq!(result.unwrap_err(), first);
}

#[test]
fn test_groupers_run_in_registration_order() {
    let tag = grouper_for::<String, _>(|_, _| Some("a".to_string()));
    let suffix = grouper_for::<String, _>(|_, group| group.map(|g| format!("{}-b", g)));
    let ignored = grouper_for::<u64, _>(|_, _| Some("numbers".to_string()));
    let manager = GroupManager::new(vec![tag, ignored, suffix]);

    assert_eq!(
        manager.get_group(&CacheKey::from("anything")).unwrap(),
        Some("a-b".to_string())
    );
}

#[test]
fn test_grouper_sees_intrinsic_group() {
    let upper = grouper_for::<GroupedKey, _>(|_, group| group.map(|g| g.to_uppercase()));
    let manager = GroupManager::new(vec![upper]);

    assert_eq!(
        manager
            .get_group(&CacheKey::new(GroupedKey::new("emea", 1)))
            .unwrap(),
        Some("EMEA".to_string())
    );
}

#[test]
fn test_kx_keys_are_colocated() {
    let cluster = setup_grouped_cluster(4, vec![kx_grouper()]);
    let node = &cluster.nodes()[0];

    assert_eq!(node.get_group(&CacheKey::from("k1")).unwrap(), Some("1".to_string()));
    assert_eq!(node.get_group(&CacheKey::from("k2")).unwrap(), Some("0".to_string()));

    let odd = cluster.owners_of(&CacheKey::from("k1")).unwrap();
    assert_eq!(odd, cluster.owners_of(&CacheKey::from("k3")).unwrap());
    let even = cluster.owners_of(&CacheKey::from("k2")).unwrap();
    assert_eq!(even, cluster.owners_of(&CacheKey::from("k4")).unwrap());
    assert_eq!(odd[0], node.group_owner("1").unwrap());
}

#[test]
fn test_get_keys_in_group() {
    let cluster = setup_grouped_cluster(3, Vec::new());
    let writer = &cluster.nodes()[0];

    let group_a = [GroupedKey::new("groupA", 1), GroupedKey::new("groupA", 3)];
    let group_b = [GroupedKey::new("groupB", 2), GroupedKey::new("groupB", 4)];
    for (i, key) in group_a.iter().chain(group_b.iter()).enumerate() {
        writer
            .put(
                CacheKey::new(key.clone()),
                create_record_batch(vec![i as i64], vec![Some("v")]),
            )
            .unwrap();
    }

    // Every member asks the primary owner, so every member sees the same set.
    for node in cluster.nodes() {
        assert_eq!(node.get_group_keys("groupA").unwrap(), keys(&group_a));
        assert_eq!(node.get_group_keys("groupB").unwrap(), keys(&group_b));
        assert!(node.get_group_keys("groupC").unwrap().is_empty());
    }
}

#[test]
fn test_removed_key_leaves_group() {
    let cluster = setup_grouped_cluster(3, Vec::new());
    let node = &cluster.nodes()[1];
    let first = GroupedKey::new("carts", 1);
    let second = GroupedKey::new("carts", 2);

    node.put(
        CacheKey::new(first.clone()),
        create_record_batch(vec![1], vec![Some("a")]),
    )
    .unwrap();
    node.put(
        CacheKey::new(second.clone()),
        create_record_batch(vec![2], vec![Some("b")]),
    )
    .unwrap();
    node.remove(CacheKey::new(first)).unwrap();

    assert_eq!(node.get_group_keys("carts").unwrap(), keys(&[second]));
}

#[test]
fn test_unreachable_owner_is_an_error() {
    let cluster = setup_grouped_cluster(3, Vec::new());
    let key = GroupedKey::new("inventory", 1);
    cluster.nodes()[0]
        .put(
            CacheKey::new(key),
            create_record_batch(vec![1], vec![Some("a")]),
        )
        .unwrap();

    let owner = cluster.nodes()[0].group_owner("inventory").unwrap();
    let asker = cluster
        .nodes()
        .iter()
        .find(|node| node.node_id() != owner)
        .unwrap();

    cluster.disconnect(owner);
    let result = asker.get_group_keys("inventory");
    assert!(matches!(result, Err(SeshatError::NodeUnreachable(node)) if node == owner));

    cluster.reconnect(owner);
    assert_eq!(asker.get_group_keys("inventory").unwrap().len(), 1);
}

#[test]
fn test_enumeration_requires_grouping() {
    let cluster = setup_cluster(2, false);
    let result = cluster.nodes()[0].get_group_keys("anything");
    assert!(matches!(result, Err(SeshatError::IllegalState(_))));
}

#[test]
fn test_grouping_stage_only_when_enabled() {
    let grouped = setup_cluster(1, true);
    assert_eq!(
        grouped.nodes()[0].interceptors(),
        vec!["grouping", "total-order", "distribution", "call"]
    );

    let plain = setup_cluster(1, false);
    assert_eq!(
        plain.nodes()[0].interceptors(),
        vec!["total-order", "distribution", "call"]
    );
}
