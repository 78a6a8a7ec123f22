
use diffusion_queue::*;
use serde_json::json;
use std::sync::Arc;
use test_helpers::{events_until_finished, form, wait_idle, FakeBackend};

fn runner(backend: FakeBackend) -> Arc<TaskRunner<FakeBackend>> {
    Arc::new(TaskRunner::new(backend, RunnerConfig::default()))
}

#[tokio::test]
async fn test_form_fields_to_sequential_seeds() {
    let fields: FormConfig = serde_json::from_value(json!({
        "promptField": "cat",
        "numOutputsTotalField": "2",
        "numOutputsParallelField": "1",
        "randomSeed": false,
        "seedField": "5"
    }))
    .unwrap();

    let runner = runner(FakeBackend::new());
    let task_id = runner.make_image(&fields);
    runner.spawn();
    wait_idle(&runner).await;

    let requests = runner.backend().requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(runner.backend().seeds(), vec![Some(5), Some(6)]);
    assert!(requests.iter().all(|r| r.prompt == "cat"));
    assert!(requests.iter().all(|r| r.session_id == task_id));
    assert!(requests.iter().all(|r| r.num_outputs == Some(1)));
}

#[tokio::test]
async fn test_parallel_batches_step_seed_by_batch_size() {
    let runner = runner(FakeBackend::new());
    runner.make_image(&form("fox", 5, 2));
    runner.spawn();
    wait_idle(&runner).await;

    assert_eq!(
        runner.backend().seeds(),
        vec![Some(100), Some(102), Some(104)]
    );
}

#[tokio::test]
async fn test_only_one_task_runs_at_a_time() {
    let runner = runner(FakeBackend::gated());
    let first = runner.make_image(&form("first", 1, 1));
    runner.spawn();
    runner.backend().wait_for_calls(1).await;

    let second = runner.make_image(&form("second", 1, 1));
    let third = runner.make_image(&form("third", 1, 1));
    let fourth = runner.make_image(&form("fourth", 1, 1));

    assert_eq!(runner.current_task().unwrap().id, first);
    assert_eq!(runner.state().queued, 3);
    assert!(runner.state().is_processing);
    assert_eq!(runner.backend().call_count(), 1);

    runner.backend().release(1);
    runner.backend().wait_for_calls(2).await;
    assert_eq!(runner.current_task().unwrap().id, fourth);
    assert_eq!(runner.state().queued, 2);

    runner.backend().release(1);
    runner.backend().wait_for_calls(3).await;
    assert_eq!(runner.current_task().unwrap().id, third);
    assert_eq!(runner.state().queued, 1);

    runner.backend().release(1);
    runner.backend().wait_for_calls(4).await;
    assert_eq!(runner.current_task().unwrap().id, second);
    assert_eq!(runner.state().queued, 0);
    assert!(runner.state().is_processing);

    runner.backend().release(1);
    wait_idle(&runner).await;

    assert!(runner.current_task().is_none());
    assert_eq!(runner.backend().max_active(), 1);
    assert_eq!(
        runner.backend().session_ids(),
        vec![first, fourth, third, second]
    );
}

#[tokio::test]
async fn test_oldest_first_runs_in_submission_order() {
    let config = RunnerConfig::builder()
        .with_queue_order(QueueOrder::OldestFirst)
        .build();
    let runner = Arc::new(TaskRunner::new(FakeBackend::new(), config));
    let a = runner.make_image(&form("a", 1, 1));
    let b = runner.make_image(&form("b", 1, 1));
    let c = runner.make_image(&form("c", 1, 1));
    runner.spawn();
    wait_idle(&runner).await;

    assert_eq!(runner.backend().session_ids(), vec![a, b, c]);
}

#[tokio::test]
async fn test_stop_takes_effect_at_batch_boundary() {
    let runner = runner(FakeBackend::gated());
    let mut rx = runner.subscribe();
    let task_id = runner.make_image(&form("long", 3, 1));
    runner.spawn();
    runner.backend().wait_for_calls(1).await;

    assert_eq!(runner.stop_task().await, Some(task_id));
    assert_eq!(runner.backend().stop_count(), 1);
    assert_eq!(runner.backend().call_count(), 1);

    runner.backend().release(1);
    let events = events_until_finished(&mut rx).await;
    wait_idle(&runner).await;

    assert_eq!(runner.backend().call_count(), 1);
    assert!(matches!(
        events.last().unwrap(),
        RunnerEvent::TaskFinished {
            status: TaskStatus::Cancelled,
            successful_batches: 1,
            batches_done: 1,
            ..
        }
    ));
    assert!(events
        .iter()
        .any(|e| matches!(e, RunnerEvent::Image { task_id: id, .. } if *id == task_id)));
    assert!(events.iter().any(|e| matches!(
        e,
        RunnerEvent::Message { message, .. } if message.kind == MessageKind::Info
    )));
}

#[tokio::test]
async fn test_stop_during_last_batch_still_completes() {
    let runner = runner(FakeBackend::gated());
    let mut rx = runner.subscribe();
    let task_id = runner.make_image(&form("single", 1, 1));
    runner.spawn();
    runner.backend().wait_for_calls(1).await;

    assert_eq!(runner.stop_task().await, Some(task_id));
    runner.backend().release(1);
    let events = events_until_finished(&mut rx).await;

    assert!(matches!(
        events.last().unwrap(),
        RunnerEvent::TaskFinished {
            status: TaskStatus::Completed,
            successful_batches: 1,
            batches_done: 1,
            ..
        }
    ));
    assert_eq!(runner.backend().call_count(), 1);
}

#[tokio::test]
async fn test_cancel_queued_task_issues_no_requests() {
    let runner = runner(FakeBackend::gated());
    let running = runner.make_image(&form("running", 1, 1));
    runner.spawn();
    runner.backend().wait_for_calls(1).await;

    let waiting = runner.make_image(&form("waiting", 2, 1));
    assert!(runner.cancel(waiting).await);
    assert!(runner.queued_tasks().is_empty());
    assert_eq!(runner.backend().stop_count(), 0);

    runner.backend().release(1);
    wait_idle(&runner).await;

    assert_eq!(runner.backend().session_ids(), vec![running]);
}

#[tokio::test]
async fn test_cancel_running_task_by_id() {
    let runner = runner(FakeBackend::gated());
    let task_id = runner.make_image(&form("running", 2, 1));
    runner.spawn();
    runner.backend().wait_for_calls(1).await;

    assert!(runner.cancel(task_id).await);
    assert!(!runner.cancel(task_id + 1_000_000).await);
    runner.backend().release(1);
    wait_idle(&runner).await;

    assert_eq!(runner.backend().call_count(), 1);
    assert_eq!(runner.backend().stop_count(), 1);
}

#[tokio::test]
async fn test_failed_batch_does_not_stop_loop() {
    let runner = runner(FakeBackend::new().failing_on(0));
    let mut rx = runner.subscribe();
    let task_id = runner.make_image(&form("oom", 2, 1));
    runner.spawn();

    let events = events_until_finished(&mut rx).await;
    wait_idle(&runner).await;

    assert_eq!(runner.backend().call_count(), 2);
    match events.last().unwrap() {
        RunnerEvent::TaskFinished {
            task_id: id,
            status,
            successful_batches,
            batches_done,
            ..
        } => {
            assert_eq!(*id, task_id);
            assert_eq!(*status, TaskStatus::Errored);
            assert_eq!(*successful_batches, 1);
            assert_eq!(*batches_done, 2);
        }
        other => panic!("unexpected event {:?}", other),
    }

    let message = runner.state().message.unwrap();
    assert_eq!(message.kind, MessageKind::Error);
    assert!(message.msg.contains("Suggestions:"));
}

#[tokio::test]
async fn test_event_sequence_for_completed_task() {
    let runner = runner(FakeBackend::new().with_invalid_entries(1));
    let mut rx = runner.subscribe();
    let task_id = runner.make_image(&form("owl", 1, 1));
    runner.spawn();

    let events = events_until_finished(&mut rx).await;
    assert!(matches!(events[0], RunnerEvent::TaskQueued { queued: 1, .. }));
    assert!(matches!(events[1], RunnerEvent::TaskStarted { batch_count: 1, .. }));
    assert!(matches!(
        events[2],
        RunnerEvent::BatchStarted { batch: 0, seed: Some(100), .. }
    ));
    assert!(matches!(
        events[3],
        RunnerEvent::Progress { progress: ProgressUpdate { percent: 100, .. }, .. }
    ));
    assert!(events
        .iter()
        .any(|e| matches!(e, RunnerEvent::InvalidImage { skipped: 1, .. })));
    assert!(matches!(
        events.last().unwrap(),
        RunnerEvent::TaskFinished { status: TaskStatus::Completed, .. }
    ));

    let idle = tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(idle, RunnerEvent::Idle);

    let state = runner.state();
    assert_eq!(state.result.as_deref(), Some("data:image/png;base64,0"));
    assert_eq!(state.current_task, None);
    assert!(runner.queued_tasks().iter().all(|t| t.id != task_id));
}

#[tokio::test]
async fn test_zero_outputs_completes_without_requests() {
    let runner = runner(FakeBackend::new());
    let mut rx = runner.subscribe();
    runner.make_image(&form("nothing", 0, 1));
    runner.spawn();

    let events = events_until_finished(&mut rx).await;
    assert!(matches!(
        events.last().unwrap(),
        RunnerEvent::TaskFinished { status: TaskStatus::Completed, batches_done: 0, .. }
    ));
    assert_eq!(runner.backend().call_count(), 0);
}

#[tokio::test]
async fn test_enqueue_while_idle_restarts_loop() {
    let runner = runner(FakeBackend::new());
    runner.spawn();
    tokio::task::yield_now().await;

    runner.make_image(&form("late", 1, 1));
    wait_idle(&runner).await;
    assert_eq!(runner.backend().call_count(), 1);

    runner.make_image(&form("later", 1, 1));
    wait_idle(&runner).await;
    assert_eq!(runner.backend().call_count(), 2);
}
