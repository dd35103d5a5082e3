//! Tests for the driver-facing client surface.

mod test_harness;

use exprunner::error::RunnerError;
use exprunner::experiment::Experiment;
use test_harness::{test_queue_name, TestEnv};

#[tokio::test]
async fn test_submit_creates_record_and_publishes_job() {
    let env = TestEnv::new();
    let queue_name = test_queue_name();

    env.client
        .submit(&queue_name, Experiment::new("exp1", "run.sh", vec![]))
        .await
        .unwrap();

    assert_eq!(env.queue.pending_len(&queue_name).await, 1);
    let experiment = env.client.get_experiment("exp1").await.unwrap();
    assert_eq!(
        experiment.status,
        exprunner::experiment::ExperimentStatus::Queued
    );
}

#[tokio::test]
async fn test_duplicate_submit_fails_before_anything_is_queued() {
    let env = TestEnv::new();
    let first_queue = test_queue_name();
    let second_queue = test_queue_name();

    env.client
        .submit(&first_queue, Experiment::new("exp1", "a.sh", vec![]))
        .await
        .unwrap();

    let err = env
        .client
        .submit(&second_queue, Experiment::new("exp1", "b.sh", vec![]))
        .await
        .unwrap_err();
    assert!(matches!(err, RunnerError::DuplicateExperiment(_)));
    assert_eq!(env.queue.pending_len(&second_queue).await, 0);
}

#[tokio::test]
async fn test_delete_experiment_then_get_fails() {
    let env = TestEnv::new();
    let queue_name = test_queue_name();

    env.client
        .submit(&queue_name, Experiment::new("exp1", "run.sh", vec![]))
        .await
        .unwrap();
    env.client.delete_experiment("exp1").await.unwrap();

    let err = env.client.get_experiment("exp1").await.unwrap_err();
    assert!(matches!(err, RunnerError::NotFound(_)));
}
