#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use kache_core::{InformerConfig, ObjectKey, Resource};
use kache_informer::testing::{FakeSource, Recorded, Recorder};
use kache_informer::{Controller, HandlerFuncs, ResourceEventHandler};
use serde_json::json;
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(3);

fn key(name: &str) -> ObjectKey { ObjectKey::new(Some("default"), name) }

fn config() -> InformerConfig {
    let mut c = InformerConfig::default().with_backoff(Duration::from_millis(10), Duration::from_millis(50));
    c.drain_timeout = Duration::from_millis(200);
    c
}

fn start(informer: &Arc<Controller>) -> (CancellationToken, tokio::task::JoinHandle<Result<(), kache_informer::InformerError>>) {
    let token = CancellationToken::new();
    let run = tokio::spawn({
        let informer = informer.clone();
        let token = token.clone();
        async move { informer.run(token).await }
    });
    (token, run)
}

/// Per-key chains must start with an add and every update must continue from the prior version.
fn assert_consistent_history(events: &[Recorded]) -> HashMap<String, u64> {
    let mut last: HashMap<String, u64> = HashMap::new();
    for e in events {
        match e {
            Recorded::Add { key, version } => {
                assert!(!last.contains_key(key), "duplicate add for {}", key);
                last.insert(key.clone(), *version);
            }
            Recorded::Update { key, old, new } => {
                assert_eq!(last.get(key), Some(old), "update for {} does not continue from last seen", key);
                assert!(new > old, "update for {} goes backwards", key);
                last.insert(key.clone(), *new);
            }
            Recorded::Delete { key, .. } => {
                assert!(last.remove(key).is_some(), "delete for unseen {}", key);
            }
        }
    }
    last
}

struct Stalled;

#[async_trait::async_trait]
impl ResourceEventHandler for Stalled {
    async fn on_add(&self, _obj: &Resource) -> anyhow::Result<()> {
        futures::future::pending::<()>().await;
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stalled_listener_does_not_hold_back_others() {
    let source = FakeSource::new();
    for name in ["a", "b", "c"] {
        source.apply(key(name), json!({}));
    }
    let informer = Arc::new(Controller::new(source.clone(), config()));
    informer.add_listener(Stalled);
    let rec = Recorder::new();
    informer.add_listener(rec.clone());
    let (token, run) = start(&informer);

    assert!(informer.wait_for_cache_sync(&token).await);
    assert!(rec.wait_for(3, WAIT).await);
    assert!(source.wait_for_watches(1, WAIT).await);

    source.apply(key("d"), json!({}));
    assert!(rec.wait_for(4, WAIT).await);
    assert_eq!(informer.store().len(), 4);

    // Stop must give up on the stuck listener after the drain timeout.
    assert!(tokio::time::timeout(WAIT, informer.stop()).await.is_ok());
    assert!(run.await.unwrap().is_ok());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failing_and_panicking_callbacks_are_isolated() {
    let source = FakeSource::new();
    source.apply(key("boom"), json!({}));
    source.apply(key("fail"), json!({}));
    source.apply(key("ok"), json!({}));

    let calls = Arc::new(AtomicUsize::new(0));
    let flaky = HandlerFuncs::new().on_add({
        let calls = calls.clone();
        move |obj| {
            calls.fetch_add(1, Ordering::SeqCst);
            match obj.key.name.as_str() {
                "boom" => panic!("callback exploded"),
                "fail" => Err(anyhow::anyhow!("callback refused")),
                _ => Ok(()),
            }
        }
    });
    let informer = Arc::new(Controller::new(source.clone(), config()));
    informer.add_listener(flaky);
    let rec = Recorder::new();
    informer.add_listener(rec.clone());
    let (token, run) = start(&informer);

    assert!(informer.wait_for_cache_sync(&token).await);
    assert!(rec.wait_for(3, WAIT).await);
    assert!(source.wait_for_watches(1, WAIT).await);
    source.apply(key("later"), json!({}));
    assert!(rec.wait_for(4, WAIT).await);

    // The flaky listener survived both failures and saw every object.
    let deadline = tokio::time::Instant::now() + WAIT;
    while calls.load(Ordering::SeqCst) < 4 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(calls.load(Ordering::SeqCst), 4);
    assert_eq!(informer.store().len(), 4);

    token.cancel();
    assert!(run.await.unwrap().is_ok());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn late_listener_catches_up_without_gaps_or_duplicates() {
    let source = FakeSource::new();
    for i in 0..5 {
        source.apply(key(&format!("k{}", i)), json!({ "gen": 0 }));
    }
    let informer = Arc::new(Controller::new(source.clone(), config()));
    let (token, run) = start(&informer);
    assert!(informer.wait_for_cache_sync(&token).await);
    assert!(source.wait_for_watches(1, WAIT).await);

    let writer = tokio::spawn({
        let source = source.clone();
        async move {
            for gen in 1..=40 {
                source.apply(key(&format!("k{}", gen % 5)), json!({ "gen": gen }));
                tokio::task::yield_now().await;
            }
        }
    });
    tokio::time::sleep(Duration::from_millis(1)).await;
    let late = Recorder::new();
    informer.add_listener(late.clone());
    writer.await.unwrap();

    let expected: HashMap<String, u64> =
        source.objects().into_iter().map(|r| (r.key.to_string(), r.version.0)).collect();
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let last = assert_consistent_history(&late.events());
        if last == expected {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "late listener never converged: {:?}", last);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    token.cancel();
    assert!(run.await.unwrap().is_ok());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn per_key_order_holds_for_every_listener() {
    let source = FakeSource::new();
    let informer = Arc::new(Controller::new(source.clone(), config()));
    let listeners: Vec<Recorder> = (0..3).map(|_| Recorder::new()).collect();
    for l in &listeners {
        informer.add_listener(l.clone());
    }
    let (token, run) = start(&informer);
    assert!(informer.wait_for_cache_sync(&token).await);
    assert!(source.wait_for_watches(1, WAIT).await);

    for round in 0..30 {
        source.apply(key(&format!("k{}", round % 4)), json!({ "round": round }));
        if round % 7 == 6 {
            source.delete(&key(&format!("k{}", round % 4)));
        }
    }
    let expected: HashMap<String, u64> =
        source.objects().into_iter().map(|r| (r.key.to_string(), r.version.0)).collect();

    for l in &listeners {
        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            let last = assert_consistent_history(&l.events());
            if last == expected {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "listener never converged: {:?}", last);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    token.cancel();
    assert!(run.await.unwrap().is_ok());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn removed_listener_stops_receiving() {
    let source = FakeSource::new();
    let seen = Arc::new(Mutex::new(Vec::<String>::new()));
    let informer = Arc::new(Controller::new(source.clone(), config()));
    let id = informer.add_listener(HandlerFuncs::new().on_add({
        let seen = seen.clone();
        move |obj| {
            seen.lock().unwrap().push(obj.key.name.clone());
            Ok(())
        }
    }));
    let rec = Recorder::new();
    informer.add_listener(rec.clone());
    let (token, run) = start(&informer);
    assert!(informer.wait_for_cache_sync(&token).await);
    assert!(source.wait_for_watches(1, WAIT).await);

    source.apply(key("first"), json!({}));
    assert!(rec.wait_for(1, WAIT).await);
    let deadline = tokio::time::Instant::now() + WAIT;
    while seen.lock().unwrap().is_empty() {
        assert!(tokio::time::Instant::now() < deadline, "first add never delivered");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(informer.remove_listener(id));
    assert_eq!(informer.listener_count(), 1);
    source.apply(key("second"), json!({}));
    assert!(rec.wait_for(2, WAIT).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(*seen.lock().unwrap(), vec!["first".to_string()]);

    token.cancel();
    assert!(run.await.unwrap().is_ok());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn no_callbacks_after_stop_returns() {
    let source = FakeSource::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let informer = Arc::new(Controller::new(source.clone(), config()));
    informer.add_listener(HandlerFuncs::new().on_add({
        let calls = calls.clone();
        move |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }));
    let (token, run) = start(&informer);
    assert!(informer.wait_for_cache_sync(&token).await);
    assert!(source.wait_for_watches(1, WAIT).await);

    let pump = tokio::spawn({
        let source = source.clone();
        async move {
            for i in 0..200 {
                source.apply(key(&format!("p{}", i)), json!({}));
                tokio::task::yield_now().await;
            }
        }
    });
    tokio::time::sleep(Duration::from_millis(2)).await;
    informer.stop().await;
    let at_stop = calls.load(Ordering::SeqCst);
    let epoch_at_stop = informer.store().epoch();
    pump.await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(calls.load(Ordering::SeqCst), at_stop);
    assert_eq!(informer.store().epoch(), epoch_at_stop);
    informer.stop().await;
    assert!(run.await.unwrap().is_ok());
}
