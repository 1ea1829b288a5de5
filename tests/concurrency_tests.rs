// Declare the common module *within this test crate*
mod common;

use rand::Rng;
use rand::seq::SliceRandom;
use seshat::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use common::{counter_batch, owner_entries, read_counter};

const WORKERS: usize = 6;
const INCREMENTS_PER_WORKER: usize = 5;

fn start_cluster(size: usize) -> LocalCluster {
    LocalCluster::start(size, SeshatConfig::new(0), Vec::new()).unwrap()
}

/// Increments `key` in a transaction, retrying whenever validation finds a
/// concurrent update. Returns the number of failed attempts.
fn increment(node: &Arc<Seshat>, key: &'static str) -> usize {
    let mut rng = rand::rng();
    let mut failed = 0;
    loop {
        let mut txn = node.begin();
        let current = txn.read(key).unwrap().map(|batch| read_counter(&batch)).unwrap_or(0);
        txn.write(key, counter_batch(current + 1)).unwrap();
        match txn.commit() {
            Ok(()) => return failed,
            Err(SeshatError::ValidationFailure(_)) => {
                failed += 1;
                thread::sleep(Duration::from_millis(rng.random_range(0..5)));
            }
            Err(e) => panic!("Increment on node {} failed: {:?}", node.node_id(), e),
        }
    }
}

#[test]
fn test_concurrent_read_modify_write() {
    let cluster = start_cluster(3);
    let mut assignments: Vec<Arc<Seshat>> = (0..WORKERS)
        .map(|i| Arc::clone(&cluster.nodes()[i % 3]))
        .collect();
    assignments.shuffle(&mut rand::rng());

    let barrier = Arc::new(Barrier::new(WORKERS));
    let retries = Arc::new(AtomicUsize::new(0));
    let handles: Vec<_> = assignments
        .into_iter()
        .map(|node| {
            let barrier = Arc::clone(&barrier);
            let retries = Arc::clone(&retries);
            thread::spawn(move || {
                barrier.wait();
                for _ in 0..INCREMENTS_PER_WORKER {
                    retries.fetch_add(increment(&node, "counter"), Ordering::Relaxed);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let expected = (WORKERS * INCREMENTS_PER_WORKER) as i64;
    for node in cluster.nodes() {
        let value = node.get("counter").unwrap().unwrap();
        assert_eq!(read_counter(&value), expected);
        assert_eq!(node.manager().active_local_transactions(), 0);
        assert_eq!(node.manager().active_remote_transactions(), 0);
    }
    println!(
        "{} increments committed after {} retries",
        expected,
        retries.load(Ordering::Relaxed)
    );
}

#[test]
fn test_disjoint_transactions_commit_concurrently() {
    let cluster = start_cluster(4);
    let keys = ["north", "south", "east", "west"];

    let handles: Vec<_> = keys
        .iter()
        .enumerate()
        .map(|(i, key)| {
            let node = Arc::clone(&cluster.nodes()[i]);
            let key = *key;
            thread::spawn(move || {
                for value in 1..=10 {
                    let mut txn = node.begin();
                    txn.write(key, counter_batch(value)).unwrap();
                    txn.commit().unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    for node in cluster.nodes() {
        for key in keys {
            assert_eq!(read_counter(&node.get(key).unwrap().unwrap()), 10);
        }
    }
}

#[test]
fn test_concurrent_commits_share_one_order() {
    let cluster = start_cluster(3);
    let handles: Vec<_> = cluster
        .nodes()
        .iter()
        .map(|node| {
            let node = Arc::clone(node);
            thread::spawn(move || {
                for round in 0..10 {
                    let mut txn = node.begin();
                    txn.write("shared", counter_batch(node.node_id() as i64 * 100 + round))
                        .unwrap();
                    txn.commit().unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    // Every member applied the blind writes in the same order.
    let key = CacheKey::from("shared");
    let owners = cluster.owners_of(&key).unwrap();
    let values: Vec<i64> = owners
        .iter()
        .map(|owner| {
            let entry = cluster.node(*owner).unwrap().container().get(&key).unwrap();
            read_counter(entry.data())
        })
        .collect();
    assert!(values.windows(2).all(|pair| pair[0] == pair[1]));
    assert_eq!(cluster.sequencer().last_seqno(), 30);
}

#[test]
fn test_concurrent_puts_leave_owners_in_agreement() {
    const ROUNDS: i64 = 100;
    let cluster = start_cluster(3);
    let key = CacheKey::from("hot");
    // Three writers plus this thread, which checks the owners between rounds.
    let start = Arc::new(Barrier::new(4));
    let done = Arc::new(Barrier::new(4));

    let handles: Vec<_> = cluster
        .nodes()
        .iter()
        .map(|node| {
            let node = Arc::clone(node);
            let (start, done) = (Arc::clone(&start), Arc::clone(&done));
            thread::spawn(move || {
                for round in 0..ROUNDS {
                    start.wait();
                    node.put("hot", counter_batch(node.node_id() as i64 * 1_000 + round))
                        .unwrap();
                    done.wait();
                }
            })
        })
        .collect();

    for round in 0..ROUNDS {
        start.wait();
        done.wait();
        let entries = owner_entries(&cluster, &key);
        assert_eq!(entries.len(), 2);
        assert!(entries[0].is_some());
        assert_eq!(entries[0], entries[1], "owners disagree after round {}", round);
        // Every round wrote three times.
        assert_eq!(entries[0].map(|(_, version)| version), Some(3 * (round as u64 + 1)));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    let (value, _) = owner_entries(&cluster, &key)[0].unwrap();
    for node in cluster.nodes() {
        assert_eq!(read_counter(&node.get("hot").unwrap().unwrap()), value);
    }
}

#[test]
fn test_put_all_is_ordered_by_each_primary() {
    let cluster = start_cluster(4);
    let keys: Vec<CacheKey> = (0..16).map(|i| CacheKey::new(format!("item-{}", i))).collect();

    let handles: Vec<_> = cluster
        .nodes()
        .iter()
        .map(|node| {
            let node = Arc::clone(node);
            let keys = keys.clone();
            thread::spawn(move || {
                let value = node.node_id() as i64;
                let entries = keys
                    .into_iter()
                    .map(|key| (key, counter_batch(value)))
                    .collect();
                node.put_all(entries).unwrap();
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    for key in &keys {
        let entries = owner_entries(&cluster, key);
        assert_eq!(entries[0], entries[1]);
        assert_eq!(entries[0].map(|(_, version)| version), Some(4));
    }
}
