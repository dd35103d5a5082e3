//! Tests for the experiment database contract.

use chrono::Utc;

use exprunner::db::{ExperimentDb, ExperimentPatch, MemoryDb};
use exprunner::error::RunnerError;
use exprunner::experiment::{ArtifactRef, Experiment, ExperimentStatus};

#[tokio::test]
async fn test_create_get_round_trip() {
    let db = MemoryDb::new();
    db.create(Experiment::new("exp1", "train.py", vec!["arg0".into()]))
        .await
        .unwrap();

    let experiment = db.get("exp1").await.unwrap();
    assert_eq!(experiment.script, "train.py");
    assert_eq!(experiment.status, ExperimentStatus::Queued);
}

#[tokio::test]
async fn test_duplicate_create_fails() {
    let db = MemoryDb::new();
    db.create(Experiment::new("exp1", "a.py", vec![]))
        .await
        .unwrap();

    let err = db
        .create(Experiment::new("exp1", "b.py", vec![]))
        .await
        .unwrap_err();
    assert!(matches!(err, RunnerError::DuplicateExperiment(_)));

    // The original record is untouched.
    assert_eq!(db.get("exp1").await.unwrap().script, "a.py");
}

#[tokio::test]
async fn test_get_missing_fails_with_not_found() {
    let db = MemoryDb::new();
    let err = db.get("ghost").await.unwrap_err();
    assert!(matches!(err, RunnerError::NotFound(_)));
}

#[tokio::test]
async fn test_update_is_read_your_writes() {
    let db = MemoryDb::new();
    db.create(Experiment::new("exp1", "train.py", vec![]))
        .await
        .unwrap();

    let started = Utc::now();
    db.update(
        "exp1",
        ExperimentPatch::status(ExperimentStatus::Running).with_started_at(started),
    )
    .await
    .unwrap();

    let experiment = db.get("exp1").await.unwrap();
    assert_eq!(experiment.status, ExperimentStatus::Running);
    assert_eq!(experiment.started_at, Some(started));
    assert!(experiment.finished_at.is_none());
}

#[tokio::test]
async fn test_update_merges_manifest_entries() {
    let db = MemoryDb::new();
    db.create(Experiment::new("exp1", "train.py", vec![]))
        .await
        .unwrap();

    let output = ArtifactRef {
        experiment: "exp1".to_string(),
        name: "output".to_string(),
    };
    let weights = ArtifactRef {
        experiment: "exp1".to_string(),
        name: "weights".to_string(),
    };

    db.update(
        "exp1",
        ExperimentPatch::default().with_artifact("output", output.clone()),
    )
    .await
    .unwrap();
    db.update(
        "exp1",
        ExperimentPatch::default().with_artifact("weights", weights.clone()),
    )
    .await
    .unwrap();

    let experiment = db.get("exp1").await.unwrap();
    assert_eq!(experiment.artifacts.len(), 2);
    assert_eq!(experiment.artifacts.get("output"), Some(&output));
    assert_eq!(experiment.artifacts.get("weights"), Some(&weights));
}

#[tokio::test]
async fn test_update_missing_fails_with_not_found() {
    let db = MemoryDb::new();
    let err = db
        .update("ghost", ExperimentPatch::status(ExperimentStatus::Failed))
        .await
        .unwrap_err();
    assert!(matches!(err, RunnerError::NotFound(_)));
}

#[tokio::test]
async fn test_delete_makes_subsequent_get_fail() {
    let db = MemoryDb::new();
    db.create(Experiment::new("exp1", "train.py", vec![]))
        .await
        .unwrap();

    db.delete("exp1").await.unwrap();
    let err = db.get("exp1").await.unwrap_err();
    assert!(matches!(err, RunnerError::NotFound(_)));
}

#[tokio::test]
async fn test_delete_missing_fails_with_not_found() {
    let db = MemoryDb::new();
    let err = db.delete("ghost").await.unwrap_err();
    assert!(matches!(err, RunnerError::NotFound(_)));
}
