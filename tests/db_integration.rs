//! Database integration tests.
//!
//! All tests require TEST_DATABASE_URL to be set.
//! Run with: TEST_DATABASE_URL=postgres://... cargo test --test db_integration
//!
//! Tests should be run single-threaded to avoid conflicts:
//!   cargo test --test db_integration -- --test-threads=1

mod common;

use std::sync::Arc;

use polaris::db::Database;
use polaris::model::{
    NewRecord, NewResult, NewServer, ProjectRow, RecordState, TaskRow, TestCounts, Verdict,
    BACKFILL_VERSION,
};
use polaris::store::{Admission, Store};

/// Skip the test if TEST_DATABASE_URL is not set.
macro_rules! require_db {
    () => {
        if !common::has_test_db() {
            eprintln!("Skipping: TEST_DATABASE_URL not set");
            return;
        }
    };
}

async fn setup() -> Database {
    common::setup_test_db().await
}

async fn seed(db: &Database) -> (ProjectRow, TaskRow) {
    let server = db
        .insert_server(&NewServer {
            host: common::AGENT.into(),
            username: "tester".into(),
            password: "secret".into(),
            workspace: "/home/tester".into(),
            info: String::new(),
        })
        .await
        .unwrap();
    let project = db
        .insert_project(server.id, common::PROJECT, "web shop")
        .await
        .unwrap();
    let task = db
        .insert_task(project.id, common::JOB, &common::draft(common::NICKNAME))
        .await
        .unwrap();
    (project, task)
}

fn new_record(task: &TaskRow, build_number: i64, state: RecordState) -> NewRecord {
    NewRecord {
        user_id: Some(7),
        project_id: task.project_id,
        task_id: task.id,
        build_number,
        version: "1.4.0".into(),
        state,
    }
}

fn result(verdict: Verdict, counts: TestCounts) -> NewResult {
    NewResult {
        console: "Finished".into(),
        verdict,
        counts,
    }
}

// --- Catalog ---

#[tokio::test]
async fn connect_and_ping() {
    require_db!();
    let db = setup().await;
    db.ping().await.unwrap();
    db.health_check().await.unwrap();
}

#[tokio::test]
async fn catalog_round_trip() {
    require_db!();
    let db = setup().await;
    let (project, task) = seed(&db).await;

    assert_eq!(db.list_projects().await.unwrap().len(), 1);
    let tasks = db.list_tasks(project.id).await.unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].name, common::JOB);
    assert_eq!(
        tasks[0].recipients(),
        vec!["qa@example.com", "lead@example.com"]
    );

    let mut edited = common::draft(common::NICKNAME);
    edited.command = "pytest -q tests".into();
    let updated = db.update_task(task.id, &edited).await.unwrap().unwrap();
    assert_eq!(updated.command, "pytest -q tests");
    assert_eq!(updated.name, common::JOB);
}

#[tokio::test]
async fn newest_email_template_wins() {
    require_db!();
    let db = setup().await;
    assert_eq!(db.latest_email_template().await.unwrap(), None);
    db.insert_email_template("<p>old</p>").await.unwrap();
    db.insert_email_template("<p>new</p>").await.unwrap();
    assert_eq!(
        db.latest_email_template().await.unwrap().as_deref(),
        Some("<p>new</p>")
    );
}

// --- Admission ---

#[tokio::test]
async fn admission_enforces_one_in_flight() {
    require_db!();
    let db = setup().await;
    let (_, task) = seed(&db).await;

    let first = db
        .admit_record(&new_record(&task, 1, RecordState::Queued))
        .await
        .unwrap();
    assert!(matches!(first, Admission::Admitted(_)));

    let second = db
        .admit_record(&new_record(&task, 2, RecordState::Deferred))
        .await
        .unwrap();
    assert!(matches!(second, Admission::Busy));
    assert_eq!(db.count_inflight().await.unwrap(), 1);
}

#[tokio::test]
async fn concurrent_admissions_admit_one() {
    require_db!();
    let db = Arc::new(setup().await);
    let (_, task) = seed(&db).await;

    let mut handles = Vec::new();
    for n in 0..8 {
        let db = Arc::clone(&db);
        let record = new_record(&task, 100 + n, RecordState::Queued);
        handles.push(tokio::spawn(async move { db.admit_record(&record).await }));
    }
    let mut admitted = 0;
    for h in handles {
        if let Admission::Admitted(_) = h.await.unwrap().unwrap() {
            admitted += 1;
        }
    }
    assert_eq!(admitted, 1);
}

// --- Record lifecycle ---

#[tokio::test]
async fn completion_is_compare_and_set() {
    require_db!();
    let db = setup().await;
    let (_, task) = seed(&db).await;
    let Admission::Admitted(record) = db
        .admit_record(&new_record(&task, 42, RecordState::Queued))
        .await
        .unwrap()
    else {
        panic!("expected admission");
    };

    let counts = TestCounts::new(10, 1, 2, 0);
    assert!(db
        .complete_record(record.id, &result(Verdict::Failure, counts))
        .await
        .unwrap());
    assert!(!db
        .complete_record(record.id, &result(Verdict::Success, TestCounts::default()))
        .await
        .unwrap());

    let stored = db.get_record(record.id).await.unwrap().unwrap();
    assert_eq!(stored.state, RecordState::Failed);
    let res = db.result_for_record(record.id).await.unwrap().unwrap();
    assert_eq!(res.status, -1);
    assert_eq!(res.counts(), counts);

    // A finished record frees the task.
    let next = db
        .admit_record(&new_record(&task, 43, RecordState::Queued))
        .await
        .unwrap();
    assert!(matches!(next, Admission::Admitted(_)));
}

#[tokio::test]
async fn abandoned_record_releases_its_build_number() {
    require_db!();
    let db = setup().await;
    let (_, task) = seed(&db).await;
    let Admission::Admitted(record) = db
        .admit_record(&new_record(&task, 42, RecordState::Queued))
        .await
        .unwrap()
    else {
        panic!("expected admission");
    };

    let note = result(Verdict::Failure, TestCounts::default());
    assert!(db.abandon_record(record.id, &note).await.unwrap());
    assert!(!db.abandon_record(record.id, &note).await.unwrap());
    let stored = db.get_record(record.id).await.unwrap().unwrap();
    assert_eq!(stored.state, RecordState::Failed);
    assert_eq!(stored.build_number, -record.id);

    let again = db
        .admit_record(&new_record(&task, 42, RecordState::Queued))
        .await
        .unwrap();
    assert!(matches!(again, Admission::Admitted(r) if r.build_number == 42));
}

#[tokio::test]
async fn admission_reports_a_taken_build_number() {
    require_db!();
    let db = setup().await;
    let (project, task) = seed(&db).await;
    let done = db.backfill_record(project.id, task.id, 7).await.unwrap();
    db.complete_record(done.id, &result(Verdict::Success, TestCounts::default()))
        .await
        .unwrap();

    let clash = db
        .admit_record(&new_record(&task, 7, RecordState::Queued))
        .await
        .unwrap();
    assert!(matches!(clash, Admission::BuildTaken));
    assert_eq!(db.count_inflight().await.unwrap(), 0);
}

#[tokio::test]
async fn backfill_is_idempotent() {
    require_db!();
    let db = setup().await;
    let (project, task) = seed(&db).await;

    let a = db.backfill_record(project.id, task.id, 5).await.unwrap();
    let b = db.backfill_record(project.id, task.id, 5).await.unwrap();
    assert_eq!(a.id, b.id);
    assert_eq!(a.version, BACKFILL_VERSION);
    assert_eq!(a.state, RecordState::Queued);
    assert_eq!(a.user_id, None);
    assert_eq!(
        db.find_record(task.id, 5).await.unwrap().map(|r| r.id),
        Some(a.id)
    );
}

#[tokio::test]
async fn deferred_records_promote_once() {
    require_db!();
    let db = setup().await;
    let (_, task) = seed(&db).await;
    let Admission::Admitted(record) = db
        .admit_record(&new_record(&task, 42, RecordState::Deferred))
        .await
        .unwrap()
    else {
        panic!("expected admission");
    };

    let deferred = db
        .records_in_state(task.id, RecordState::Deferred)
        .await
        .unwrap();
    assert_eq!(deferred.len(), 1);
    assert!(deferred[0].queued_at.is_none());

    assert!(db.promote_deferred(record.id, 44).await.unwrap());
    assert!(!db.promote_deferred(record.id, 45).await.unwrap());

    let promoted = db.get_record(record.id).await.unwrap().unwrap();
    assert_eq!(promoted.state, RecordState::Queued);
    assert_eq!(promoted.build_number, 44);
    assert!(promoted.queued_at.is_some());
}

// --- Queries ---

#[tokio::test]
async fn pages_are_newest_first() {
    require_db!();
    let db = setup().await;
    let (project, task) = seed(&db).await;
    for n in 1..=5 {
        db.backfill_record(project.id, task.id, n).await.unwrap();
    }

    let page = db
        .records_page(project.id, Some(task.id), 1, 2)
        .await
        .unwrap();
    assert_eq!(page.total, 5);
    let builds: Vec<i64> = page.records.iter().map(|r| r.build_number).collect();
    assert_eq!(builds, vec![5, 4]);

    let last = db.records_page(project.id, None, 3, 2).await.unwrap();
    assert_eq!(last.records.len(), 1);
    assert_eq!(last.records[0].build_number, 1);

    let clamped = db.records_page(project.id, None, 0, 2).await.unwrap();
    assert_eq!(clamped.page, 1);
}

#[tokio::test]
async fn trend_skips_runs_without_metrics() {
    require_db!();
    let db = setup().await;
    let (project, task) = seed(&db).await;
    for (n, tests) in [(1, 4), (2, 0), (3, 8)] {
        let r = db.backfill_record(project.id, task.id, n).await.unwrap();
        db.complete_record(
            r.id,
            &result(Verdict::Success, TestCounts::new(tests, 0, 0, 0)),
        )
        .await
        .unwrap();
    }
    let trend = db.task_trend(task.id).await.unwrap();
    let builds: Vec<i64> = trend.iter().map(|r| r.build_number).collect();
    assert_eq!(builds, vec![1, 3]);
}

#[tokio::test]
async fn deleting_a_task_removes_its_history() {
    require_db!();
    let db = setup().await;
    let (project, task) = seed(&db).await;
    let r = db.backfill_record(project.id, task.id, 1).await.unwrap();
    db.complete_record(r.id, &result(Verdict::Success, TestCounts::new(1, 0, 0, 0)))
        .await
        .unwrap();

    assert!(db.delete_task(task.id).await.unwrap());
    assert!(!db.delete_task(task.id).await.unwrap());
    assert!(db.get_record(r.id).await.unwrap().is_none());
    assert!(db.result_for_record(r.id).await.unwrap().is_none());
}
