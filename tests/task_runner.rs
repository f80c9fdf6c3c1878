use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::bail;
use serde_json::json;

use property_reel::progress::{ProgressUpdate, RenderStage};
use property_reel::tasks::{TaskRunner, TaskRunnerConfig, TaskSnapshot, TaskStatus};

fn runner() -> TaskRunner {
    TaskRunner::new(TaskRunnerConfig::default()).expect("runner should start")
}

fn wait_terminal(runner: &TaskRunner, id: &str) -> TaskSnapshot {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let snapshot = runner.status(id).expect("task should be tracked");
        if snapshot.status.is_terminal() {
            return snapshot;
        }
        assert!(Instant::now() < deadline, "task {id} never finished: {snapshot:?}");
        thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn completed_task_carries_result_and_full_progress() {
    let runner = runner();
    let id = runner
        .submit("video_generation", None, |ctx| {
            ctx.report_progress(&ProgressUpdate {
                fraction: 0.5,
                stage: RenderStage::ProcessingImages,
                message: "Görüntü işleniyor 1/2...".to_owned(),
            });
            Ok(json!({ "output": "output/video.mp4" }))
        })
        .expect("submit");
    assert!(id.starts_with("video_generation-"));

    let done = wait_terminal(&runner, &id);
    assert_eq!(done.status, TaskStatus::Completed);
    assert_eq!(done.progress, 100);
    assert_eq!(done.result, Some(json!({ "output": "output/video.mp4" })));
    assert!(done.error.is_none());
    assert!(done.started_at.is_some() && done.finished_at.is_some());
}

#[test]
fn freshly_submitted_task_polls_as_starting_or_running() {
    let runner = runner();
    let (release, gate) = mpsc::channel::<()>();
    let id = runner
        .submit("video_generation", None, move |_| {
            let _ = gate.recv_timeout(Duration::from_secs(5));
            Ok(json!("released"))
        })
        .expect("submit");

    let polled = runner.status(&id).expect("task should be tracked");
    assert!(
        matches!(polled.status, TaskStatus::Starting | TaskStatus::Running),
        "unexpected status {:?}",
        polled.status
    );
    assert!(polled.progress < 100);
    assert!(polled.result.is_none() && polled.error.is_none());

    release.send(()).expect("release");
    assert_eq!(wait_terminal(&runner, &id).status, TaskStatus::Completed);
}

#[test]
fn failing_and_panicking_jobs_are_reported_as_failed() {
    let runner = runner();
    let failing = runner
        .submit("video_generation", None, |_| bail!("ffmpeg bulunamadı"))
        .expect("submit");
    let panicking = runner
        .submit("video_generation", None, |_| panic!("boom"))
        .expect("submit");

    let failed = wait_terminal(&runner, &failing);
    assert_eq!(failed.status, TaskStatus::Failed);
    assert_eq!(failed.error.as_deref(), Some("ffmpeg bulunamadı"));
    assert!(failed.result.is_none());
    assert!(failed.error_details.is_some());

    let panicked = wait_terminal(&runner, &panicking);
    assert_eq!(panicked.status, TaskStatus::Failed);
    assert_eq!(panicked.error.as_deref(), Some("boom"));

    // The worker survives a panic.
    let after = runner
        .submit("video_generation", None, |_| Ok(json!(1)))
        .expect("submit");
    assert_eq!(wait_terminal(&runner, &after).status, TaskStatus::Completed);
}

#[test]
fn timeout_is_sticky_even_if_the_job_finishes_later() {
    let runner = runner();
    let id = runner
        .submit("video_generation", Some(Duration::from_millis(50)), |ctx| {
            while !ctx.is_canceled() {
                thread::sleep(Duration::from_millis(5));
            }
            // Late progress and a late success must both be ignored.
            ctx.report(TaskStatus::GeneratingVideo, 90, "geç kalan güncelleme");
            Ok(json!("late"))
        })
        .expect("submit");

    let timed_out = wait_terminal(&runner, &id);
    assert_eq!(timed_out.status, TaskStatus::Failed);
    assert_eq!(timed_out.error.as_deref(), Some("İşlem zaman aşımına uğradı"));
    assert_eq!(timed_out.message, "Zaman aşımı hatası!");

    // Let the job observe the cancel flag and return.
    let marker = runner
        .submit("video_generation", None, |_| Ok(json!("next")))
        .expect("submit");
    wait_terminal(&runner, &marker);

    let settled = runner.status(&id).expect("still tracked");
    assert_eq!(settled.status, TaskStatus::Failed);
    assert!(settled.result.is_none());
    assert_eq!(settled.message, "Zaman aşımı hatası!");
}

#[test]
fn tasks_run_one_at_a_time_in_submission_order() {
    let runner = runner();
    let order = Arc::new(Mutex::new(Vec::new()));
    let running = Arc::new(AtomicUsize::new(0));
    let max_running = Arc::new(AtomicUsize::new(0));

    let ids: Vec<String> = (0..4)
        .map(|index| {
            let order = Arc::clone(&order);
            let running = Arc::clone(&running);
            let max_running = Arc::clone(&max_running);
            runner
                .submit("video_generation", None, move |_| {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    max_running.fetch_max(now, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(15));
                    order.lock().expect("lock").push(index);
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(json!(index))
                })
                .expect("submit")
        })
        .collect();

    for id in &ids {
        wait_terminal(&runner, id);
    }
    assert_eq!(*order.lock().expect("lock"), vec![0, 1, 2, 3]);
    assert_eq!(max_running.load(Ordering::SeqCst), 1);
}

#[test]
fn canceling_a_queued_task_prevents_it_from_running() {
    let runner = runner();
    let (release, gate) = mpsc::channel::<()>();
    let blocker = runner
        .submit("video_generation", None, move |_| {
            let _ = gate.recv_timeout(Duration::from_secs(5));
            Ok(json!("blocker"))
        })
        .expect("submit");

    let ran = Arc::new(AtomicUsize::new(0));
    let ran_in_job = Arc::clone(&ran);
    let queued = runner
        .submit("video_generation", None, move |_| {
            ran_in_job.fetch_add(1, Ordering::SeqCst);
            Ok(json!("queued"))
        })
        .expect("submit");

    assert!(runner.cancel(&queued));
    assert!(!runner.cancel(&queued), "second cancel is a no-op");
    release.send(()).expect("release blocker");
    wait_terminal(&runner, &blocker);

    // Drain the queue before checking that the canceled job never ran.
    let marker = runner
        .submit("video_generation", None, |_| Ok(json!("marker")))
        .expect("submit");
    wait_terminal(&runner, &marker);

    let canceled = runner.status(&queued).expect("tracked");
    assert_eq!(canceled.status, TaskStatus::Canceled);
    assert!(canceled.error.is_some());
    assert_eq!(ran.load(Ordering::SeqCst), 0);
}

#[test]
fn cleanup_only_removes_finished_tasks_past_max_age() {
    let runner = runner();
    let (release, gate) = mpsc::channel::<()>();
    let finished = runner
        .submit("video_generation", None, |_| Ok(json!("done")))
        .expect("submit");
    wait_terminal(&runner, &finished);
    let pending = runner
        .submit("video_generation", None, move |_| {
            let _ = gate.recv_timeout(Duration::from_secs(5));
            Ok(json!("pending"))
        })
        .expect("submit");

    assert_eq!(runner.cleanup_finished(Duration::from_secs(3600)), 0);
    thread::sleep(Duration::from_millis(20));
    assert_eq!(runner.cleanup_finished(Duration::from_millis(1)), 1);
    assert!(runner.status(&finished).is_none());
    assert!(runner.status(&pending).is_some());

    release.send(()).expect("release");
    wait_terminal(&runner, &pending);
    assert_eq!(runner.list().len(), 1);
}
