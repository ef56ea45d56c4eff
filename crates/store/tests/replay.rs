#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use kache_core::{Delta, DeltaKind, ObjectKey, Resource, ResourceVersion};
use kache_store::{DeltaQueue, Popped, StoreWriter};
use serde_json::json;

fn obj(name: &str, rv: u64) -> Resource {
    Resource::new(ObjectKey::new(Some("ns"), name), ResourceVersion(rv), json!({ "name": name, "rv": rv }))
}

fn apply(writer: &StoreWriter, p: &Popped) {
    match p.delta.kind {
        DeltaKind::Deleted => {
            writer.delete(&p.key);
        }
        _ => {
            writer.update_shared(p.object());
        }
    }
}

async fn drain(queue: &DeltaQueue, writer: &StoreWriter) {
    while !queue.is_empty() {
        let Some(p) = queue.pop().await else { break };
        apply(writer, &p);
        queue.complete(&p);
    }
}

fn contents(writer: &StoreWriter) -> BTreeMap<String, u64> {
    writer.reader().list().into_iter().map(|r| (r.key.name.clone(), r.version.0)).collect()
}

struct Lcg(u64);

impl Lcg {
    fn next(&mut self, bound: u64) -> u64 {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        (self.0 >> 33) % bound
    }
}

/// A valid per-key event history plus the state it ends in.
fn script(seed: u64, steps: u64) -> (Vec<Delta>, BTreeMap<String, u64>) {
    let mut rng = Lcg(seed);
    let mut model: BTreeMap<String, u64> = BTreeMap::new();
    let mut out = Vec::new();
    for rv in 1..=steps {
        let name = format!("o{}", rng.next(8));
        if model.contains_key(&name) {
            if rng.next(3) == 0 {
                model.remove(&name);
                out.push(Delta::new(DeltaKind::Deleted, obj(&name, rv)));
            } else {
                model.insert(name.clone(), rv);
                out.push(Delta::new(DeltaKind::Updated, obj(&name, rv)));
            }
        } else {
            model.insert(name.clone(), rv);
            out.push(Delta::new(DeltaKind::Added, obj(&name, rv)));
        }
    }
    (out, model)
}

#[tokio::test]
async fn replay_is_independent_of_drain_timing() {
    for seed in [1u64, 7, 42, 1234] {
        let (deltas, expected) = script(seed, 300);
        for chunk in [1usize, 3, 17, usize::MAX] {
            let queue = DeltaQueue::new();
            let writer = StoreWriter::new();
            for batch in deltas.chunks(chunk.min(deltas.len())) {
                for d in batch {
                    queue.push(d.clone());
                }
                drain(&queue, &writer).await;
            }
            assert_eq!(contents(&writer), expected, "seed {} chunk {}", seed, chunk);
        }
    }
}

#[tokio::test]
async fn pending_changes_coalesce_to_one_per_key() {
    let queue = DeltaQueue::new();
    for rv in 1..=50 {
        let kind = if rv == 1 { DeltaKind::Added } else { DeltaKind::Updated };
        queue.push(Delta::new(kind, obj("hot", rv)));
    }
    queue.push(Delta::new(DeltaKind::Added, obj("cold", 51)));
    assert_eq!(queue.len(), 2);
    let first = queue.pop().await.unwrap();
    assert_eq!(first.delta.kind, DeltaKind::Added);
    assert_eq!(first.delta.object.version, ResourceVersion(50));
    assert_eq!(queue.pop().await.unwrap().key.name, "cold");
}

#[tokio::test]
async fn relist_reconciles_store_with_listing() {
    let queue = DeltaQueue::new();
    let writer = StoreWriter::new();
    queue.replace(vec![obj("a", 1), obj("b", 2), obj("c", 3)], writer.reader().list());
    drain(&queue, &writer).await;
    assert!(queue.has_synced());

    // Pending, never-dispatched object that the next listing no longer shows.
    queue.push(Delta::new(DeltaKind::Added, obj("d", 4)));
    let known: Vec<Arc<Resource>> = writer.reader().list();
    queue.replace(vec![obj("b", 5), obj("e", 6)], known);

    let mut seen = Vec::new();
    while !queue.is_empty() {
        let p = queue.pop().await.unwrap();
        seen.push((p.key.name.clone(), p.delta.kind));
        apply(&writer, &p);
        queue.complete(&p);
    }
    seen.sort_by(|x, y| x.0.cmp(&y.0));
    assert_eq!(
        seen,
        vec![
            ("a".to_string(), DeltaKind::Deleted),
            ("b".to_string(), DeltaKind::Sync),
            ("c".to_string(), DeltaKind::Deleted),
            ("e".to_string(), DeltaKind::Sync),
        ]
    );
    let expected: BTreeMap<String, u64> = [("b".to_string(), 5), ("e".to_string(), 6)].into_iter().collect();
    assert_eq!(contents(&writer), expected);
    assert_eq!(writer.reader().snapshot().items.len(), 2);
}

#[tokio::test]
async fn relist_while_item_in_flight_leaves_no_ghost() {
    let queue = DeltaQueue::new();
    let writer = StoreWriter::new();
    queue.replace(Vec::new(), writer.reader().list());
    assert!(queue.has_synced());

    queue.push(Delta::new(DeltaKind::Added, obj("y", 1)));
    let in_flight = queue.pop().await.unwrap();
    // Relist lands after the pop but before the consumer applies it.
    queue.replace(Vec::new(), writer.reader().list());
    apply(&writer, &in_flight);
    queue.complete(&in_flight);
    assert_eq!(contents(&writer).len(), 1);

    drain(&queue, &writer).await;
    assert!(contents(&writer).is_empty());
}

#[tokio::test]
async fn relist_with_stale_snapshot_still_deletes() {
    let queue = DeltaQueue::new();
    let writer = StoreWriter::new();
    queue.replace(vec![obj("a", 1)], writer.reader().list());
    drain(&queue, &writer).await;

    queue.push(Delta::new(DeltaKind::Added, obj("b", 2)));
    let stale = writer.reader().list();
    drain(&queue, &writer).await;
    queue.replace(vec![obj("a", 3)], stale);
    drain(&queue, &writer).await;

    let expected: BTreeMap<String, u64> = [("a".to_string(), 3)].into_iter().collect();
    assert_eq!(contents(&writer), expected);
}
