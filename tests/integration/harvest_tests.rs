//! End-to-end task runs against a mock upstream

use crate::common::{cipher_key_body, read_lines, search_body, word, Harness};
use index_harvester::crawler::{REASON_EXHAUSTED, REASON_SHUTDOWN};
use index_harvester::output::{data_path, stats_path};
use index_harvester::scheduler::ControlOutcome;
use index_harvester::state::{TaskStatus, TaskType};
use serde_json::json;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const SEARCH_PATH: &str = "/api/SearchApi/index";

async fn mount_success(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path(SEARCH_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(search_body("a")))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/Interface/ptbk"))
        .respond_with(ResponseTemplate::new(200).set_body_json(cipher_key_body()))
        .mount(server)
        .await;
}

async fn search_requests(server: &MockServer) -> Vec<wiremock::Request> {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .into_iter()
        .filter(|r| r.url.path() == SEARCH_PATH)
        .collect()
}

async fn wait_until_running(harness: &Harness, task_id: &str) {
    for _ in 0..250 {
        if harness.scheduler.running_tasks().iter().any(|id| id == task_id) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("task {} never started", task_id);
}

#[tokio::test]
async fn test_failed_item_gets_placeholder_row() {
    let server = MockServer::start().await;

    // Mounted first so it wins over the catch-all success mock
    Mock::given(method("GET"))
        .and(path(SEARCH_PATH))
        .and(query_param("area", "57"))
        .and(query_param("word", word("beta").as_str()))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;
    mount_success(&server).await;

    let harness = Harness::new(&server.uri(), 2);
    harness.add_credential("c1");

    let id = harness.create(json!({
        "task_type": "search-index",
        "parameters": {
            "keywords": ["alpha", "beta"],
            "regions": {"514": "Beijing", "57": "Shanghai"},
            "date_ranges": [["2024-01-01", "2024-01-01"]],
        },
    }));
    harness.run_until_idle().await;

    let task = harness.task(&id);
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.total_items, 4);
    assert_eq!(task.completed_items, 3);
    assert_eq!(task.failed_items, 1);
    assert_eq!(task.output_files.len(), 2);

    let lines = read_lines(&data_path(&harness.output_dir(), TaskType::SearchIndex, &id));
    assert_eq!(lines[0], "keyword,region_code,region,date,all,pc,wise");
    assert_eq!(lines.len(), 5);
    assert!(lines.contains(&"beta,57,Shanghai,2024-01-01,0,0,0".to_string()));
    assert!(lines.contains(&"alpha,514,Beijing,2024-01-01,1,1,1".to_string()));
    assert_eq!(
        lines[1..].iter().filter(|l| l.ends_with(",1,1,1")).count(),
        3
    );

    let stats = read_lines(&stats_path(&harness.output_dir(), TaskType::SearchIndex, &id));
    assert_eq!(stats.len(), 5);

    // The failing item was tried once more before giving up
    let failing = search_requests(&server)
        .await
        .into_iter()
        .filter(|r| r.url.query().map_or(false, |q| q.contains("area=57")))
        .filter(|r| r.url.query_pairs().any(|(k, v)| k == "word" && v == word("beta")))
        .count();
    assert_eq!(failing, 2);
}

#[tokio::test]
async fn test_resume_replaces_placeholder_with_real_row() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(SEARCH_PATH))
        .and(query_param("area", "57"))
        .and(query_param("word", word("beta").as_str()))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;
    mount_success(&server).await;

    let harness = Harness::new(&server.uri(), 2);
    harness.add_credential("c1");

    let first = harness.create(json!({
        "task_type": "search-index",
        "parameters": {
            "keywords": ["alpha", "beta"],
            "regions": {"514": "Beijing", "57": "Shanghai"},
            "date_ranges": [["2024-01-01", "2024-01-01"]],
        },
    }));
    harness.run_until_idle().await;
    assert_eq!(harness.task(&first).failed_items, 1);

    let output = data_path(&harness.output_dir(), TaskType::SearchIndex, &first);
    assert!(read_lines(&output).contains(&"beta,57,Shanghai,2024-01-01,0,0,0".to_string()));

    // The upstream recovers; only the failed item is fetched again
    server.reset().await;
    mount_success(&server).await;

    let second = harness.create(json!({
        "task_type": "search-index",
        "parameters": {"resume": true, "task_id": first},
    }));
    harness.run_until_idle().await;

    let task = harness.task(&second);
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.completed_items, 4);
    assert_eq!(task.failed_items, 0);
    assert_eq!(search_requests(&server).await.len(), 1);

    let lines = read_lines(&output);
    assert_eq!(lines.len(), 5);
    assert!(lines[1..].iter().all(|l| l.ends_with(",1,1,1")));
    assert_eq!(
        lines
            .iter()
            .filter(|l| l.starts_with("beta,57,Shanghai,2024-01-01,"))
            .count(),
        1
    );

    let stats = read_lines(&stats_path(&harness.output_dir(), TaskType::SearchIndex, &first));
    assert_eq!(stats.len(), 5);
}

#[tokio::test]
async fn test_out_of_range_days_never_reach_the_engine() {
    let server = MockServer::start().await;
    mount_success(&server).await;

    let harness = Harness::new(&server.uri(), 1);
    harness.add_credential("c1");

    let rejected = harness.scheduler.create(
        serde_json::from_value(json!({
            "task_type": "search-index",
            "parameters": {"keywords": ["alpha"], "days": 4_000_000_000u64},
        }))
        .unwrap(),
    );
    assert!(rejected.is_err());
    harness.run_until_idle().await;

    let failed = harness.scheduler.list(Some(TaskStatus::Failed)).unwrap();
    assert_eq!(failed.len(), 1);
    assert!(failed[0].end_time.is_some());
    assert!(harness.scheduler.list(Some(TaskStatus::Running)).unwrap().is_empty());
    assert!(harness.scheduler.running_tasks().is_empty());
    assert!(search_requests(&server).await.is_empty());
}

#[tokio::test]
async fn test_exhausted_pool_pauses_then_resumes_from_checkpoint() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(SEARCH_PATH))
        .and(query_param("word", word("beta").as_str()))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"status": 10001, "message": "request block"})),
        )
        .mount(&server)
        .await;
    mount_success(&server).await;

    let harness = Harness::new(&server.uri(), 1);
    harness.add_credential("c1");

    let id = harness.create(json!({
        "task_type": "search-index",
        "parameters": {
            "keywords": ["alpha", "beta"],
            "date_ranges": [["2024-01-01", "2024-01-01"]],
        },
    }));
    harness.run_until_idle().await;

    let task = harness.task(&id);
    assert_eq!(task.status, TaskStatus::Paused);
    assert_eq!(task.error_message.as_deref(), Some(REASON_EXHAUSTED));
    assert_eq!(task.completed_items, 1);
    assert_eq!(task.failed_items, 0);
    assert_eq!(harness.pool.status().unwrap().temp_banned, 1);

    // The upstream recovers and the credential's cooldown is lifted
    server.reset().await;
    mount_success(&server).await;
    assert!(harness.pool.unban("c1").unwrap());

    assert_eq!(harness.scheduler.resume(&id).unwrap(), ControlOutcome::Applied);
    harness.run_until_idle().await;

    let task = harness.task(&id);
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.completed_items, 2);
    assert!(task.error_message.is_none());

    // Only the unfinished keyword was fetched again
    let requests = search_requests(&server).await;
    assert_eq!(requests.len(), 1);
    assert!(requests[0]
        .url
        .query_pairs()
        .any(|(k, v)| k == "word" && v == word("beta")));

    let lines = read_lines(&data_path(&harness.output_dir(), TaskType::SearchIndex, &id));
    assert_eq!(lines.len(), 3);
}

#[tokio::test]
async fn test_resume_of_finished_task_fetches_nothing() {
    let server = MockServer::start().await;
    mount_success(&server).await;

    let harness = Harness::new(&server.uri(), 2);
    harness.add_credential("c1");

    let first = harness.create(json!({
        "task_type": "search-index",
        "parameters": {
            "keywords": ["alpha", "beta"],
            "date_ranges": [["2024-01-01", "2024-01-02"]],
        },
    }));
    harness.run_until_idle().await;
    assert_eq!(harness.task(&first).status, TaskStatus::Completed);

    let output = data_path(&harness.output_dir(), TaskType::SearchIndex, &first);
    let before = read_lines(&output);
    assert_eq!(before.len(), 5);
    server.reset().await;
    mount_success(&server).await;

    let second = harness.create(json!({
        "task_type": "search-index",
        "parameters": {"resume": true, "task_id": first},
    }));
    harness.run_until_idle().await;

    let task = harness.task(&second);
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.completed_items, 2);
    assert_eq!(task.checkpoint_ref.as_deref(), Some(first.as_str()));
    assert!(search_requests(&server).await.is_empty());
    assert_eq!(read_lines(&output), before);
}

#[tokio::test]
async fn test_cancel_running_task() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(SEARCH_PATH))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(search_body(""))
                .set_delay(Duration::from_secs(5)),
        )
        .mount(&server)
        .await;

    let harness = Harness::new(&server.uri(), 1);
    harness.add_credential("c1");

    let id = harness.create(json!({
        "task_type": "search-index",
        "parameters": {"keywords": ["alpha", "beta"], "days": 7},
    }));

    let scheduler = harness.scheduler.clone();
    let run = tokio::spawn(scheduler.run(CancellationToken::new(), true));
    wait_until_running(&harness, &id).await;

    assert_eq!(harness.scheduler.cancel(&id).unwrap(), ControlOutcome::Applied);
    tokio::time::timeout(Duration::from_secs(10), run)
        .await
        .expect("run did not stop")
        .unwrap()
        .unwrap();

    let task = harness.task(&id);
    assert_eq!(task.status, TaskStatus::Cancelled);
    assert_eq!(task.completed_items, 0);
    assert!(matches!(
        harness.scheduler.resume(&id),
        Err(index_harvester::scheduler::SchedulerError::InvalidTransition { .. })
    ));
}

#[tokio::test]
async fn test_shutdown_leaves_task_resumable() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(SEARCH_PATH))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(search_body(""))
                .set_delay(Duration::from_secs(5)),
        )
        .mount(&server)
        .await;

    let harness = Harness::new(&server.uri(), 1);
    harness.add_credential("c1");

    let id = harness.create(json!({
        "task_type": "search-index",
        "parameters": {"keywords": ["alpha"], "days": 3},
    }));

    let shutdown = CancellationToken::new();
    let run = tokio::spawn(harness.scheduler.clone().run(shutdown.clone(), false));
    wait_until_running(&harness, &id).await;

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(10), run)
        .await
        .expect("run did not stop")
        .unwrap()
        .unwrap();

    let task = harness.task(&id);
    assert_eq!(task.status, TaskStatus::Paused);
    assert_eq!(task.error_message.as_deref(), Some(REASON_SHUTDOWN));

    let view = harness.scheduler.get(&id).unwrap();
    assert!(view.logs.iter().any(|l| l.message.contains(REASON_SHUTDOWN)));
}

#[tokio::test]
async fn test_pending_task_cancelled_before_run_never_fetches() {
    let server = MockServer::start().await;
    mount_success(&server).await;

    let harness = Harness::new(&server.uri(), 1);
    harness.add_credential("c1");

    let id = harness.create(json!({
        "task_type": "search-index",
        "parameters": {"keywords": ["alpha"], "days": 1},
    }));
    assert_eq!(harness.scheduler.cancel(&id).unwrap(), ControlOutcome::Applied);
    harness.run_until_idle().await;

    assert_eq!(harness.task(&id).status, TaskStatus::Cancelled);
    assert!(search_requests(&server).await.is_empty());
}
