//! End-to-end integration tests for the pipeline interpreter.
//!
//! Each test drives a complete pipeline: build the step list -> run -> verify
//! the produced value, the failure, or the observed side effects.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_core::Stream;
use riptide_pipeline::{Queue, Task};
use tokio_stream::wrappers::IntervalStream;
use tokio_stream::StreamExt;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Stream of `0..count` with one value per `period` tick.
fn paced(count: usize, period: Duration) -> impl Stream<Item = usize> + Send {
    let mut next = 0usize;
    IntervalStream::new(tokio::time::interval(period))
        .map(move |_| {
            let value = next;
            next += 1;
            value
        })
        .take(count)
}

// ---------------------------------------------------------------------------
// Test 1: Linear pipeline through every transform kind
// ---------------------------------------------------------------------------

#[tokio::test]
async fn linear_pipeline_composes_all_transform_kinds() {
    let out = Task::succeed(2)
        .map(|v| v + 1)
        .try_map(|v| if v > 0 { Ok(v * 10) } else { Err("negative") })
        .map_async(|v| async move { v + 2 })
        .chain(|v| Task::succeed(format!("value={v}")))
        .run()
        .await
        .expect("pipeline should succeed");
    assert_eq!(out, "value=32");
}

// ---------------------------------------------------------------------------
// Test 2: Sub-pipeline loops stay inside the sub-pipeline
// ---------------------------------------------------------------------------

#[tokio::test]
async fn subpipeline_loops_do_not_leak_into_the_parent() {
    let taps = Arc::new(AtomicUsize::new(0));
    let inner = Arc::clone(&taps);
    let outer = Arc::clone(&taps);
    Task::succeed(0)
        .chain(move |v| {
            let probe = Arc::clone(&inner);
            Task::succeed(v).repeat(2).tap(move |_| {
                probe.fetch_add(1, Ordering::SeqCst);
            })
        })
        .repeat(2)
        .tap(move |_| {
            outer.fetch_add(1, Ordering::SeqCst);
        })
        .run()
        .await
        .expect("pipeline should succeed");
    // Inner loop taps 3 times inside one chain execution, outer loop taps 3.
    assert_eq!(taps.load(Ordering::SeqCst), 6);
}

// ---------------------------------------------------------------------------
// Test 3: Deep pipelines run flat, without recursion
// ---------------------------------------------------------------------------

#[tokio::test]
async fn twenty_thousand_maps_complete_without_overflow() {
    let mut task = Task::succeed(0u64);
    for _ in 0..20_000 {
        task = task.map(|v| v + 1);
    }
    assert_eq!(task.run().await.expect("pipeline should succeed"), 20_000);
}

// ---------------------------------------------------------------------------
// Test 4: Throttle drops values arriving inside the window
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn throttle_paces_a_stream_of_values() {
    let out = Task::sequence_from_stream(paced(10, Duration::from_millis(30)))
        .throttle(Duration::from_millis(45))
        .collect_all()
        .run()
        .await
        .expect("pipeline should succeed");
    // Arrivals at 0,30,60..270ms against a 45ms window: every other passes.
    assert_eq!(out, vec![0, 2, 4, 6, 8]);
}

// ---------------------------------------------------------------------------
// Test 5: A wide throttle window keeps only sparse values
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn wide_throttle_window_keeps_sparse_values() {
    let out = Task::sequence_from_stream(paced(10, Duration::from_millis(100)))
        .throttle(Duration::from_millis(500))
        .collect_all()
        .run()
        .await
        .expect("pipeline should succeed");
    assert_eq!(out, vec![0, 5]);
}

// ---------------------------------------------------------------------------
// Test 6: Flatten, filter, and collect in one pipeline
// ---------------------------------------------------------------------------

#[tokio::test]
async fn flatten_filter_collect_round_trip() {
    let out = Task::succeed(vec![1, 2, 3, 4, 5, 6])
        .flat()
        .filter(|v| v % 2 == 0)
        .collect_all()
        .run()
        .await
        .expect("pipeline should succeed");
    assert_eq!(out, vec![2, 4, 6]);
}

// ---------------------------------------------------------------------------
// Test 7: Retry re-arms the deadline, so each attempt gets a full window
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn retry_gives_each_attempt_a_fresh_deadline() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let probe = Arc::clone(&attempts);
    let out = Task::succeed(1)
        .retry_while(|| true)
        .timeout(Duration::from_millis(50))
        .map_async(move |v| {
            let attempt = probe.fetch_add(1, Ordering::SeqCst) + 1;
            let wait = if attempt == 1 {
                Duration::from_millis(200)
            } else {
                Duration::from_millis(5)
            };
            async move {
                tokio::time::sleep(wait).await;
                v + 1
            }
        })
        .run()
        .await
        .expect("second attempt should fit the window");
    assert_eq!(out, 2);
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
}

// ---------------------------------------------------------------------------
// Test 8: A deadline bounds an unresolved callback behind chain
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn deadline_kills_an_unresolved_callback() {
    let err = Task::unit()
        .timeout(Duration::from_millis(10))
        .chain(|_| {
            Task::<i32>::from_callback(|resolver| {
                std::mem::forget(resolver);
            })
        })
        .run()
        .await
        .expect_err("the callback never resolves");
    assert!(err.is_timeout());
}

// ---------------------------------------------------------------------------
// Test 9: Cleanup still runs after a deadline kill
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn cleanup_runs_after_a_deadline_kill() {
    let seen: Arc<Mutex<Vec<Option<i32>>>> = Arc::new(Mutex::new(Vec::new()));
    let probe = Arc::clone(&seen);
    let err = Task::succeed(3)
        .timeout(Duration::from_millis(10))
        .ensure(move |value| {
            probe.lock().unwrap().push(value);
        })
        .delay(Duration::from_millis(100))
        .run()
        .await
        .expect_err("the delay outlives the deadline");
    assert!(err.is_timeout());
    assert_eq!(*seen.lock().unwrap(), vec![Some(3)]);
}

// ---------------------------------------------------------------------------
// Test 10: A queue feeds a pipeline until cleared
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn queue_feeds_a_pipeline_until_cleared() {
    let queue = Queue::new();
    let feeder = queue.clone();
    let producer = tokio::spawn(async move {
        for n in 0..4 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            feeder.add(n);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        feeder.clear();
    });

    let collected = Task::sequence_from_stream(queue.iterate())
        .collect_all()
        .run()
        .await
        .expect("pipeline should end on clear");
    producer.await.expect("producer should finish");
    assert_eq!(collected, vec![0, 1, 2, 3]);
}

// ---------------------------------------------------------------------------
// Test 11: Queue values split round-robin across parallel consumers
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn queue_values_split_round_robin_across_consumers() {
    let queue: Queue<i32> = Queue::new();
    let feeder = queue.clone();
    let consumers = Task::struct_par([
        ("left", Task::sequence_from_stream(queue.iterate()).collect_all()),
        ("right", Task::sequence_from_stream(queue.iterate()).collect_all()),
    ]);

    let producer = tokio::spawn(async move {
        for n in 0..6 {
            // The sleep lets both consumers park before each value lands.
            tokio::time::sleep(Duration::from_millis(5)).await;
            feeder.add(n);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
        feeder.clear();
    });

    let out = consumers.run().await.expect("both consumers should end on clear");
    producer.await.expect("producer should finish");
    assert_eq!(out.get("left"), Some(&vec![0, 2, 4]));
    assert_eq!(out.get("right"), Some(&vec![1, 3, 5]));
}

// ---------------------------------------------------------------------------
// Test 12: Producer and consumer share a queue through the environment
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn pipelines_share_a_queue_through_the_environment() {
    let queue: Queue<i32> = Queue::new();
    let out = Task::struct_par([
        (
            "feed",
            Task::unit()
                .access::<Queue<i32>>()
                .delay(Duration::from_millis(5))
                .tap(|q: &Queue<i32>| {
                    for n in 1..=3 {
                        q.add(n);
                    }
                })
                .delay(Duration::from_millis(5))
                .tap(|q: &Queue<i32>| q.clear())
                .map_to(0),
        ),
        (
            "sum",
            Task::unit().access::<Queue<i32>>().chain(|q| {
                Task::sequence_from_stream(q.iterate()).reduce(0, |acc, n| acc + n)
            }),
        ),
    ])
    .provide(queue)
    .run()
    .await
    .expect("both fields should settle");
    assert_eq!(out.get("feed"), Some(&0));
    assert_eq!(out.get("sum"), Some(&6));
}
