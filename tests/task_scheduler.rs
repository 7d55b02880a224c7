use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, unbounded};
use slv_terrain::config::WorkerConfig;
use slv_terrain::{RenderContextToken, TaskScheduler};

const TIMEOUT: Duration = Duration::from_secs(5);

#[test]
fn test_cancel_drops_queued_tasks_and_waits_for_running_one() {
    let scheduler: TaskScheduler<()> = TaskScheduler::new(&WorkerConfig::default()).unwrap();
    let (started_tx, started_rx) = bounded(1);
    let (release_tx, release_rx) = bounded::<()>(1);
    let ran = Arc::new(AtomicUsize::new(0));
    let running_finished = Arc::new(AtomicUsize::new(0));

    let finished = Arc::clone(&running_finished);
    scheduler.add(move || {
        started_tx.send(())?;
        release_rx.recv()?;
        finished.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });
    started_rx.recv_timeout(TIMEOUT).unwrap();

    for _ in 0..5 {
        let ran = Arc::clone(&ran);
        scheduler.add(move || {
            ran.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
    }
    assert_eq!(scheduler.background().len(), 5);

    let releaser = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        release_tx.send(()).unwrap();
    });
    scheduler.cancel();
    releaser.join().unwrap();

    // Cancel only returns once the running task is done
    assert_eq!(running_finished.load(Ordering::SeqCst), 1);
    assert_eq!(ran.load(Ordering::SeqCst), 0);
    assert!(scheduler.background().is_empty());
    assert_eq!(scheduler.background().stats().discarded, 5);

    // Cancelled queues refuse work until resumed
    assert!(!scheduler.add(|| Ok(())));
    scheduler.background().resume();
    let (tx, rx) = bounded(1);
    assert!(scheduler.add(move || Ok(tx.send(7)?)));
    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), 7);
}

#[test]
fn test_background_task_chains_into_upload() {
    let scheduler: TaskScheduler<Vec<u32>> = TaskScheduler::new(&WorkerConfig::default()).unwrap();
    let token = RenderContextToken::new();
    let (done_tx, done_rx) = unbounded();

    for i in 0..4u32 {
        let upload = scheduler.upload().clone();
        let done_tx = done_tx.clone();
        scheduler.add(move || {
            let squared = i * i;
            upload.add(move |context: &mut Vec<u32>| {
                context.push(squared);
                Ok(())
            });
            done_tx.send(())?;
            Ok(())
        });
    }
    for _ in 0..4 {
        done_rx.recv_timeout(TIMEOUT).unwrap();
    }

    let mut context = Vec::new();
    assert_eq!(scheduler.upload().drain(&token, &mut context, 2), 2);
    assert_eq!(context, vec![0, 1]);
    assert_eq!(scheduler.upload().drain(&token, &mut context, 10), 2);
    assert_eq!(context, vec![0, 1, 4, 9]);
    assert!(!scheduler.upload_one(&token, &mut context));
}

#[test]
fn test_failing_and_panicking_tasks_do_not_stop_the_worker() {
    let scheduler: TaskScheduler<()> = TaskScheduler::new(&WorkerConfig::default()).unwrap();
    let (tx, rx) = bounded(1);

    scheduler.add(|| anyhow::bail!("source unavailable"));
    scheduler.add(|| panic!("reduction blew up"));
    scheduler.add(move || Ok(tx.send("still alive")?));

    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), "still alive");
    let stats = scheduler.background().stats();
    assert_eq!(stats.failed, 2);
    assert_eq!(stats.submitted, 3);
}

#[test]
fn test_empty_handler_sequences_work() {
    let scheduler: TaskScheduler<()> = TaskScheduler::new(&WorkerConfig::default()).unwrap();
    let (gate_tx, gate_rx) = bounded::<()>(1);
    let (idle_tx, idle_rx) = bounded(1);
    let finished = Arc::new(AtomicUsize::new(0));

    scheduler.add(move || {
        gate_rx.recv()?;
        Ok(())
    });
    for _ in 0..3 {
        let finished = Arc::clone(&finished);
        scheduler.add(move || {
            finished.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
    }
    let seen = Arc::clone(&finished);
    assert!(scheduler
        .background()
        .set_empty_handler(move || idle_tx.send(seen.load(Ordering::SeqCst)).unwrap_or(())));
    // Only one handler may be pending at a time
    assert!(!scheduler.background().set_empty_handler(|| {}));

    gate_tx.send(()).unwrap();
    assert_eq!(idle_rx.recv_timeout(TIMEOUT).unwrap(), 3);
}
