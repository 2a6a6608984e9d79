//! Worker-to-worker messages, relay selection, background delivery, and metrics.

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value, json};
use tokio::sync::Notify;

use common::{ScriptedLlm, ScriptedRunner, swarm_with, within};
use worker_swarm::error::{Error, WorkerError};
use worker_swarm::llm::Role;
use worker_swarm::worker::{
    Scheduler, TaskRequest, WorkerActivity, WorkerRole, WorkerSpec, WorkerStatus,
};

fn spec(name: &str, role: WorkerRole) -> WorkerSpec {
    WorkerSpec::new(name, "scripted", "http://stub").with_role(role)
}

fn data(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

#[tokio::test]
async fn message_merges_data_and_runs_reply_operations() {
    let (dir, swarm) = swarm_with(ScriptedRunner::succeeding(""));
    let coder = swarm
        .spawn_worker(spec("coder", WorkerRole::Coder), ScriptedLlm::repeating(""))
        .await;
    let reviewer_llm = ScriptedLlm::repeating("Looks fine.\nwriteFile('review.md', 'LGTM')");
    let reviewer = swarm
        .spawn_worker(spec("reviewer", WorkerRole::Reviewer), reviewer_llm.clone())
        .await;

    let outcome = within(swarm.send_message(
        coder.id,
        reviewer.id,
        "please review",
        data(json!({"code": "let x = 1;", "files": ["a.js"]})),
    ))
    .await
    .unwrap();

    assert_eq!(outcome.from, coder.id);
    assert_eq!(outcome.to, reviewer.id);
    assert_eq!(outcome.operations.len(), 1);
    assert!(outcome.operations[0].is_success());
    assert!(dir.path().join("review.md").exists());

    let turns = reviewer_llm.conversation(0);
    assert_eq!(turns[0].role, Role::User);
    assert!(turns[0].content.starts_with("Message from coder (coder): please review"));
    assert!(turns[0].content.contains("let x = 1;"));

    let reviewer_record = swarm.get_worker(reviewer.id).await.unwrap();
    assert_eq!(reviewer_record.state.status, WorkerStatus::Idle);
    assert_eq!(reviewer_record.shared_data["code"], "let x = 1;");
    assert_eq!(reviewer_record.shared_data["fromWorker"], coder.id.to_string());
    assert!(reviewer_record.shared_data.contains_key("lastUpdate"));
    assert_eq!(reviewer_record.memory.files_created, vec!["review.md".to_string()]);

    let coder_record = swarm.get_worker(coder.id).await.unwrap();
    assert_eq!(coder_record.state.status, WorkerStatus::Idle);

    let sent = swarm.worker_activity(coder.id).await.unwrap();
    assert!(sent.iter().any(|e| matches!(e.activity, WorkerActivity::MessageSent { to, .. } if to == reviewer.id)));
    let received = swarm.worker_activity(reviewer.id).await.unwrap();
    assert!(
        received
            .iter()
            .any(|e| matches!(e.activity, WorkerActivity::MessageReceived { from, .. } if from == coder.id))
    );
}

#[tokio::test]
async fn message_errors() {
    let (_dir, swarm) = swarm_with(ScriptedRunner::succeeding(""));
    let a = swarm
        .spawn_worker(spec("a", WorkerRole::Coder), ScriptedLlm::repeating(""))
        .await;
    let broken = swarm
        .spawn_worker(spec("b", WorkerRole::Tester), ScriptedLlm::failing())
        .await;

    let err = swarm
        .send_message(a.id, uuid::Uuid::new_v4(), "hi", Map::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Worker(WorkerError::NotFound { .. })));

    let err = swarm.send_message(a.id, a.id, "hi", Map::new()).await.unwrap_err();
    assert!(matches!(err, Error::Worker(WorkerError::InvalidTask { .. })));

    let err = within(swarm.send_message(a.id, broken.id, "hi", Map::new()))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Llm(_)));
    assert_eq!(
        swarm.get_worker(broken.id).await.unwrap().state.status,
        WorkerStatus::Error
    );
    assert_eq!(
        swarm.get_worker(a.id).await.unwrap().state.status,
        WorkerStatus::Idle
    );
}

async fn wait_for_calls(llm: &ScriptedLlm, n: usize) {
    within(async {
        while llm.call_count() < n {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
}

#[tokio::test]
async fn finished_message_leaves_a_running_sender_task_alone() {
    let (_dir, swarm) = swarm_with(ScriptedRunner::succeeding(""));
    let sender_gate = Arc::new(Notify::new());
    let sender_llm = ScriptedLlm::gated("writeFile('a.txt', 'a')", sender_gate.clone());
    let sender = swarm
        .spawn_worker(spec("sender", WorkerRole::Coder), sender_llm.clone())
        .await;
    let receiver_gate = Arc::new(Notify::new());
    let receiver_llm = ScriptedLlm::gated("noted", receiver_gate.clone());
    let receiver = swarm
        .spawn_worker(spec("receiver", WorkerRole::Tester), receiver_llm.clone())
        .await;

    let message = {
        let swarm = swarm.clone();
        tokio::spawn(async move {
            swarm
                .send_message(sender.id, receiver.id, "ping", Map::new())
                .await
        })
    };
    wait_for_calls(&receiver_llm, 1).await;
    assert_eq!(
        swarm.get_worker(sender.id).await.unwrap().state.status,
        WorkerStatus::Communicating
    );

    // A task starts on the sender and reaches its reflecting step.
    let task = {
        let swarm = swarm.clone();
        tokio::spawn(async move {
            swarm
                .assign_task(sender.id, TaskRequest::new("write").max_iterations(2))
                .await
        })
    };
    wait_for_calls(&sender_llm, 1).await;
    sender_gate.notify_one();
    wait_for_calls(&sender_llm, 2).await;

    receiver_gate.notify_one();
    within(message).await.unwrap().unwrap();
    assert_eq!(
        swarm.get_worker(sender.id).await.unwrap().state.status,
        WorkerStatus::Communicating
    );

    sender_gate.notify_one();
    within(task).await.unwrap().unwrap();
    assert_eq!(
        swarm.get_worker(sender.id).await.unwrap().state.status,
        WorkerStatus::Idle
    );
}

#[tokio::test]
async fn relay_follows_the_role_rotation() {
    let (_dir, swarm) = swarm_with(ScriptedRunner::succeeding(""));
    let coder = swarm
        .spawn_worker(spec("coder", WorkerRole::Coder), ScriptedLlm::repeating("ok"))
        .await;
    let tester = swarm
        .spawn_worker(spec("tester", WorkerRole::Tester), ScriptedLlm::repeating("ok"))
        .await;
    let architect = swarm
        .spawn_worker(spec("architect", WorkerRole::Architect), ScriptedLlm::repeating("ok"))
        .await;

    // architect first, then coder (the sender, skipped), optimizer (absent), tester.
    let first = within(swarm.relay(coder.id, "design?", Map::new())).await.unwrap();
    assert_eq!(first.to, architect.id);
    let second = within(swarm.relay(coder.id, "test?", Map::new())).await.unwrap();
    assert_eq!(second.to, tester.id);

    let lonely = {
        let (_dir, swarm) = swarm_with(ScriptedRunner::succeeding(""));
        let only = swarm
            .spawn_worker(spec("only", WorkerRole::Coder), ScriptedLlm::repeating(""))
            .await;
        swarm.relay(only.id, "anyone?", Map::new()).await
    };
    assert!(matches!(
        lonely,
        Err(Error::Worker(WorkerError::NoPeer { .. }))
    ));
}

#[tokio::test]
async fn scheduler_delivers_in_the_background() {
    let (_dir, swarm) = swarm_with(ScriptedRunner::succeeding(""));
    let a = swarm
        .spawn_worker(spec("a", WorkerRole::Coder), ScriptedLlm::repeating(""))
        .await;
    let b = swarm
        .spawn_worker(spec("b", WorkerRole::Debugger), ScriptedLlm::repeating("on it"))
        .await;
    let scheduler = Scheduler::new(swarm.clone());

    let message = scheduler.post_message(a.id, b.id, "help", Map::new()).await;
    let task = scheduler
        .assign_task(a.id, TaskRequest::new("note").auto_debug(false))
        .await;

    let outcome = within(message).await.unwrap().unwrap();
    assert_eq!(outcome.response, "on it");
    within(task).await.unwrap().unwrap();
    assert!(scheduler.running().await.is_empty());
}

#[tokio::test]
async fn metrics_follow_worker_lifecycle() {
    let (_dir, swarm) = swarm_with(ScriptedRunner::succeeding(""));
    let mut rx = swarm.subscribe_metrics();

    let worker = swarm
        .spawn_worker(spec("a", WorkerRole::Coder), ScriptedLlm::repeating("writeFile('a', 'b')"))
        .await;
    let spawned = rx.recv().await.unwrap();
    assert_eq!(spawned.active_workers, 1);
    assert_eq!(spawned.active_tasks, 0);

    within(swarm.assign_task(worker.id, TaskRequest::new("x").auto_debug(false)))
        .await
        .unwrap();
    let started = rx.recv().await.unwrap();
    assert_eq!(started.active_tasks, 1);
    let finished = rx.recv().await.unwrap();
    assert_eq!(finished.active_tasks, 0);

    swarm.remove_worker(worker.id).await.unwrap();
    let removed = rx.recv().await.unwrap();
    assert_eq!(removed.active_workers, 0);
}
