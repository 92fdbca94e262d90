// Copyright 2024 RiftKV Project Authors. Licensed under Apache-2.0.

//! End-to-end transaction tests against the in-process mock cluster.

use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use riftkv_client::kvpb;
use riftkv_client::mock::mock_client;
use riftkv_client::mock::MockCluster;
use riftkv_client::mvcc::MvccEngine;
use riftkv_client::Error;
use riftkv_client::TimestampExt;
use riftkv_client::TransactionOptions;

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[tokio::test]
async fn optimistic_commit_happy_path() {
    init();
    let cluster = Arc::new(MockCluster::new(3));
    let client = mock_client(cluster.clone());

    let mut txn = client.begin_optimistic().await.unwrap();
    txn.put("a", "1").await.unwrap();
    txn.put("b", "2").await.unwrap();
    let commit_ts = txn.commit().await.unwrap().expect("committed with mutations");

    // Visible at and after the commit version, absent below it.
    let engine = cluster.engine();
    assert_eq!(
        engine
            .get(b"a", commit_ts.version(), kvpb::IsolationLevel::Si, &[])
            .unwrap(),
        Some(b"1".to_vec())
    );
    assert_eq!(
        engine
            .get(b"a", commit_ts.version() - 1, kvpb::IsolationLevel::Si, &[])
            .unwrap(),
        None
    );

    let mut snapshot = client.snapshot(commit_ts, TransactionOptions::new_optimistic());
    assert_eq!(snapshot.get("a").await.unwrap(), Some(b"1".to_vec()));
    assert_eq!(snapshot.get("b").await.unwrap(), Some(b"2".to_vec()));
}

#[tokio::test]
async fn read_resolves_lock_left_by_lost_secondary_commit() {
    init();
    let cluster = Arc::new(MockCluster::new(3));
    let client = mock_client(cluster.clone());
    let engine = cluster.engine();

    // T1 prewrites "a" (primary) and "b", commits the primary, and its
    // secondary commit is lost.
    let t1_start = client.current_timestamp().await.unwrap().version();
    let result = engine.prewrite(&kvpb::PrewriteRequest {
        mutations: vec![
            kvpb::Mutation {
                op: kvpb::Op::Put as i32,
                key: b"a".to_vec(),
                value: b"1".to_vec(),
                assertion: kvpb::Assertion::None as i32,
            },
            kvpb::Mutation {
                op: kvpb::Op::Put as i32,
                key: b"b".to_vec(),
                value: b"2".to_vec(),
                assertion: kvpb::Assertion::None as i32,
            },
        ],
        primary_lock: b"a".to_vec(),
        start_version: t1_start,
        lock_ttl: 3000,
        ..Default::default()
    });
    assert!(result.errors.is_empty());
    let t1_commit = client.current_timestamp().await.unwrap().version();
    engine.commit(&[b"a".to_vec()], t1_start, t1_commit).unwrap();

    // T2 reads "b": it finds T1's lock, checks the primary's status
    // (committed), resolves the lock, and reads the value.
    let mut t2 = client.begin_optimistic().await.unwrap();
    assert_eq!(t2.get("b").await.unwrap(), Some(b"2".to_vec()));
    t2.rollback().await.unwrap();

    // The resolver committed "b" at T1's commit version.
    assert_eq!(
        engine
            .get(b"b", t1_commit, kvpb::IsolationLevel::Si, &[])
            .unwrap(),
        Some(b"2".to_vec())
    );
}

#[tokio::test]
async fn optimistic_prewrite_write_conflict() {
    init();
    let cluster = Arc::new(MockCluster::new(3));
    let client = mock_client(cluster.clone());

    let mut old = client.begin_optimistic().await.unwrap();
    old.put("k", "old").await.unwrap();

    // A younger transaction commits "k" after `old` started.
    let mut young = client.begin_optimistic().await.unwrap();
    young.put("k", "young").await.unwrap();
    young.commit().await.unwrap();

    let err = old.commit().await.unwrap_err();
    assert!(err.is_write_conflict(), "expected write conflict: {err}");

    // No lock may be left behind.
    let locks = cluster.engine().scan_lock(b"", b"", u64::MAX).unwrap();
    assert!(locks.is_empty(), "{locks:?}");
}

#[tokio::test]
async fn one_pc_commits_in_a_single_round() {
    init();
    let cluster = Arc::new(MockCluster::new(3));
    let client = mock_client(cluster.clone());

    let mut txn = client
        .begin_with_options(TransactionOptions::new_optimistic().try_one_pc())
        .await
        .unwrap();
    txn.put("a", "1").await.unwrap();
    txn.put("b", "2").await.unwrap();
    let commit_ts = txn.commit().await.unwrap().expect("1pc commit ts");

    let engine = cluster.engine();
    assert_eq!(
        engine
            .get(b"a", commit_ts.version(), kvpb::IsolationLevel::Si, &[])
            .unwrap(),
        Some(b"1".to_vec())
    );
    assert!(engine.scan_lock(b"", b"", u64::MAX).unwrap().is_empty());
}

#[tokio::test]
async fn one_pc_falls_back_to_two_phase_commit() {
    init();
    let cluster = Arc::new(MockCluster::new(3));
    let client = mock_client(cluster.clone());

    // Push the engine's max timestamp far past any feasible max_commit_ts,
    // so the server refuses the single-phase path.
    let now = client.current_timestamp().await.unwrap().version();
    cluster
        .engine()
        .observe_max_ts(now + (3_600_000u64 << 18));

    let mut txn = client
        .begin_with_options(
            TransactionOptions::new_optimistic()
                .try_one_pc()
                .use_async_commit(),
        )
        .await
        .unwrap();
    txn.put("a", "1").await.unwrap();
    let commit_ts = txn.commit().await.unwrap().expect("fallback commit ts");

    // The fallback ran an ordinary primary commit and the value landed.
    let mut snapshot = client.snapshot(commit_ts, TransactionOptions::new_optimistic());
    assert_eq!(snapshot.get("a").await.unwrap(), Some(b"1".to_vec()));
}

#[tokio::test]
async fn epoch_not_match_fans_out_to_split_regions() {
    init();
    let cluster = Arc::new(MockCluster::new(3));
    let client = mock_client(cluster.clone());

    // Warm the routing cache with the pre-split region.
    let mut warmup = client.begin_optimistic().await.unwrap();
    let _ = warmup.get("a").await.unwrap();
    warmup.rollback().await.unwrap();

    // The region splits under the transaction.
    cluster.split(b"f");

    let mut txn = client.begin_optimistic().await.unwrap();
    txn.put("a", "1").await.unwrap();
    txn.put("g", "2").await.unwrap();
    let commit_ts = txn.commit().await.unwrap().expect("commit ts");

    let mut snapshot = client.snapshot(commit_ts, TransactionOptions::new_optimistic());
    assert_eq!(snapshot.get("a").await.unwrap(), Some(b"1".to_vec()));
    assert_eq!(snapshot.get("g").await.unwrap(), Some(b"2".to_vec()));
    assert_ne!(cluster.region_id_for(b"a"), cluster.region_id_for(b"g"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pessimistic_deadlock_victimizes_second_transaction() {
    init();
    let cluster = Arc::new(MockCluster::new(3));
    let client = mock_client(cluster.clone());

    let mut t1 = client.begin_pessimistic().await.unwrap();
    let mut t2 = client.begin_pessimistic().await.unwrap();

    t1.lock_keys(vec!["x"]).await.unwrap();
    t2.lock_keys(vec!["y"]).await.unwrap();

    // T1 blocks on "y" in the background.
    let t1_wait = tokio::spawn(async move {
        t1.lock_keys(vec!["y"]).await?;
        Ok::<_, Error>(t1)
    });
    tokio::time::sleep(Duration::from_millis(200)).await;

    // T2 closing the cycle gets the deadlock error.
    let err = t2.lock_keys(vec!["x"]).await.unwrap_err();
    assert!(err.is_deadlock(), "expected deadlock: {err}");
    t2.rollback().await.unwrap();

    // With the cycle broken, T1 acquires "y" and commits.
    let mut t1 = t1_wait.await.unwrap().unwrap();
    t1.put("x", "by t1").await.unwrap();
    t1.commit().await.unwrap();
}

#[tokio::test]
async fn pessimistic_get_for_update_blocks_conflicting_writes() {
    init();
    let cluster = Arc::new(MockCluster::new(3));
    let client = mock_client(cluster.clone());

    let mut setup = client.begin_optimistic().await.unwrap();
    setup.put("stock", "10").await.unwrap();
    setup.commit().await.unwrap();

    let mut txn = client.begin_pessimistic().await.unwrap();
    let value = txn.get_for_update("stock").await.unwrap();
    assert_eq!(value, Some(b"10".to_vec()));

    // A competing optimistic write loses against the pessimistic lock
    // (resolution keeps the live lock, and its newer commit then conflicts).
    let mut competitor = client.begin_optimistic().await.unwrap();
    competitor.put("stock", "0").await.unwrap();

    txn.put("stock", "9").await.unwrap();
    txn.commit().await.unwrap();
    let err = competitor.commit().await.unwrap_err();
    assert!(err.is_write_conflict(), "{err}");

    let mut check = client.begin_optimistic().await.unwrap();
    assert_eq!(check.get("stock").await.unwrap(), Some(b"9".to_vec()));
    check.rollback().await.unwrap();
}

#[tokio::test]
async fn insert_surfaces_existing_key() {
    init();
    let cluster = Arc::new(MockCluster::new(1));
    let client = mock_client(cluster.clone());

    let mut setup = client.begin_optimistic().await.unwrap();
    setup.put("k", "v").await.unwrap();
    setup.commit().await.unwrap();

    let mut txn = client.begin_optimistic().await.unwrap();
    txn.insert("k", "w").await.unwrap();
    let err = txn.commit().await.unwrap_err();
    assert!(err.is_key_exists(), "{err}");
}

#[tokio::test]
async fn scan_merges_buffer_over_snapshot() {
    init();
    let cluster = Arc::new(MockCluster::new(3));
    let client = mock_client(cluster.clone());

    let mut setup = client.begin_optimistic().await.unwrap();
    for (key, value) in [("a", "1"), ("c", "3"), ("e", "5")] {
        setup.put(key, value).await.unwrap();
    }
    setup.commit().await.unwrap();
    cluster.split(b"d");

    let mut txn = client.begin_optimistic().await.unwrap();
    txn.put("b", "2").await.unwrap();
    txn.delete("c").await.unwrap();

    let pairs = txn.scan("a".."z", 10).await.unwrap();
    let keys: Vec<&[u8]> = pairs.iter().map(|p| <&[u8]>::from(p.key())).collect();
    assert_eq!(keys, vec![b"a" as &[u8], b"b", b"e"]);

    let pairs = txn.scan_reverse("a".."z", 2).await.unwrap();
    let keys: Vec<&[u8]> = pairs.iter().map(|p| <&[u8]>::from(p.key())).collect();
    assert_eq!(keys, vec![b"e" as &[u8], b"b"]);

    txn.rollback().await.unwrap();
}

#[tokio::test]
async fn batch_get_reads_across_regions() {
    init();
    let cluster = Arc::new(MockCluster::new(3));
    let client = mock_client(cluster.clone());

    let mut setup = client.begin_optimistic().await.unwrap();
    setup.put("a", "1").await.unwrap();
    setup.put("m", "2").await.unwrap();
    setup.commit().await.unwrap();
    cluster.split(b"g");

    let mut txn = client.begin_optimistic().await.unwrap();
    txn.put("z", "3").await.unwrap();
    let mut pairs = txn.batch_get(vec!["a", "m", "z", "nope"]).await.unwrap();
    pairs.sort_by(|a, b| a.key().cmp(b.key()));
    let keys: Vec<&[u8]> = pairs.iter().map(|p| <&[u8]>::from(p.key())).collect();
    assert_eq!(keys, vec![b"a" as &[u8], b"m", b"z"]);
    txn.rollback().await.unwrap();
}

#[tokio::test]
async fn transport_failures_fail_over_and_recover() {
    init();
    let cluster = Arc::new(MockCluster::new(3));
    let client = mock_client(cluster.clone());

    // Fail the first two prewrite dispatches with a transport error.
    let failures = Arc::new(AtomicUsize::new(0));
    let counter = failures.clone();
    cluster.set_interceptor(Some(Box::new(move |request| {
        if request.label() == "kv_prewrite" && counter.fetch_add(1, Ordering::SeqCst) < 2 {
            return Some(Err(Error::GrpcApi(tonic::Status::unavailable(
                "injected outage",
            ))));
        }
        None
    })));

    let mut txn = client.begin_optimistic().await.unwrap();
    txn.put("k", "v").await.unwrap();
    let commit_ts = txn.commit().await.unwrap().expect("commit ts");
    assert!(failures.load(Ordering::SeqCst) >= 2);

    cluster.set_interceptor(None);
    let mut snapshot = client.snapshot(commit_ts, TransactionOptions::new_optimistic());
    assert_eq!(snapshot.get("k").await.unwrap(), Some(b"v".to_vec()));
}

#[tokio::test]
async fn async_commit_prewrite_rpc_failure_is_undetermined() {
    init();
    let cluster = Arc::new(MockCluster::new(1));
    let client = mock_client(cluster.clone());

    // First attempt dies on the wire; the retry is refused outright. The
    // client can no longer know whether the transaction became durable.
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    cluster.set_interceptor(Some(Box::new(move |request| {
        if request.label() != "kv_prewrite" {
            return None;
        }
        if counter.fetch_add(1, Ordering::SeqCst) == 0 {
            Some(Err(Error::GrpcApi(tonic::Status::unavailable(
                "injected outage",
            ))))
        } else {
            let mut resp = kvpb::PrewriteResponse::default();
            resp.errors = vec![kvpb::KeyError {
                already_exist: Some(kvpb::AlreadyExist { key: b"k".to_vec() }),
                ..Default::default()
            }];
            Some(Ok(Box::new(resp) as Box<dyn std::any::Any>))
        }
    })));

    let mut txn = client
        .begin_with_options(TransactionOptions::new_optimistic().use_async_commit())
        .await
        .unwrap();
    txn.put("k", "v").await.unwrap();
    let err = txn.commit().await.unwrap_err();
    assert!(err.is_undetermined(), "expected undetermined: {err}");
}

#[tokio::test]
async fn commit_retries_past_pushed_min_commit_ts() {
    init();
    let cluster = Arc::new(MockCluster::new(1));
    let client = mock_client(cluster.clone());
    let engine = cluster.engine();

    let mut txn = client.begin_optimistic().await.unwrap();
    txn.put("k", "v").await.unwrap();
    let start_ts = txn.start_timestamp().version();

    // A reader pushes the (future) lock's min_commit_ts far ahead between
    // prewrite and commit.
    let pushed = client.current_timestamp().await.unwrap().version() + (60_000u64 << 18);
    let armed = Arc::new(std::sync::atomic::AtomicBool::new(true));
    cluster.set_interceptor(Some(Box::new({
        let engine: Arc<MvccEngine> = engine.clone();
        move |request| {
            if request.label() == "kv_commit" && armed.swap(false, Ordering::SeqCst) {
                engine
                    .check_txn_status(b"k", start_ts, pushed, pushed, false, false)
                    .ok();
            }
            None
        }
    })));

    let commit_ts = txn.commit().await.unwrap().expect("commit ts");
    assert!(commit_ts.version() > pushed, "commit rode over the push");
}

#[tokio::test]
async fn heartbeat_extends_pessimistic_primary_lock() {
    init();
    let cluster = Arc::new(MockCluster::new(1));
    let client = mock_client(cluster.clone());

    let mut txn = client.begin_pessimistic().await.unwrap();
    txn.lock_keys(vec!["k"]).await.unwrap();
    let ttl = txn.send_heart_beat().await.unwrap();
    assert!(ttl >= 3_000, "ttl {ttl}");
    txn.rollback().await.unwrap();
}

#[tokio::test]
async fn gc_resolves_stale_locks_and_advances_safepoint() {
    init();
    let cluster = Arc::new(MockCluster::new(1));
    let client = mock_client(cluster.clone());
    let engine = cluster.engine();

    let mut setup = client.begin_optimistic().await.unwrap();
    setup.put("a", "1").await.unwrap();
    setup.commit().await.unwrap();

    // An abandoned prewrite leaves a lock behind.
    let orphan_start = client.current_timestamp().await.unwrap().version();
    let result = engine.prewrite(&kvpb::PrewriteRequest {
        mutations: vec![kvpb::Mutation {
            op: kvpb::Op::Put as i32,
            key: b"orphan".to_vec(),
            value: b"?".to_vec(),
            assertion: kvpb::Assertion::None as i32,
        }],
        primary_lock: b"orphan".to_vec(),
        start_version: orphan_start,
        lock_ttl: 100,
        ..Default::default()
    });
    assert!(result.errors.is_empty());

    let safepoint = client.current_timestamp().await.unwrap();
    assert!(client.gc(safepoint).await.unwrap());
    assert!(engine.scan_lock(b"", b"", u64::MAX).unwrap().is_empty());
}
