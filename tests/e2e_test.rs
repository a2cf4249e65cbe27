//! End-to-end tests against a running deployment
//!
//! These tests require:
//! 1. Redis and RabbitMQ running
//! 2. The API server running
//! 3. A worker per job type, pointed at a live inference server
//!
//! Run with: cargo test --test e2e_test -- --ignored --nocapture
//!
//! Set API_BASE_URL to override default (http://localhost:8000)

mod helpers;

use capts::models::job::JobType;
use helpers::*;

#[tokio::test]
#[ignore] // Requires running API server and infrastructure
async fn test_e2e_health_check() {
    let client = reqwest::Client::new();

    let response = client
        .get(format!("{}/health", base_url()))
        .send()
        .await
        .expect("Health check failed");

    assert!(
        response.status().is_success(),
        "Health check returned non-success status: {}",
        response.status()
    );
}

#[tokio::test]
#[ignore] // Requires running API server, workers, and infrastructure
async fn test_e2e_captcha_round_trip() {
    let base_url = base_url();
    let client = reqwest::Client::new();

    for (captcha_type, job_type) in [("fns", JobType::Fns), ("alcolicenziat", JobType::Alco)] {
        let submitted = submit_captcha(&client, &base_url, captcha_type, captcha_png(job_type))
            .await
            .expect("Submit failed");

        let task = poll_result(&client, &base_url, &submitted.id, 120)
            .await
            .expect("Task did not complete");

        assert_eq!(task.status, "Processed", "task {} for {}", submitted.id, captcha_type);
        let result = task.result.expect("Processed task without a result");
        assert!((0.0..=1.0).contains(&result.confidence));
    }
}

#[tokio::test]
#[ignore] // Requires running API server and infrastructure
async fn test_e2e_rejects_non_image() {
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{}/process_captcha/fns", base_url()))
        .body("definitely not an image")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), reqwest::StatusCode::UNSUPPORTED_MEDIA_TYPE);
}

#[tokio::test]
#[ignore] // Requires running API server and infrastructure
async fn test_e2e_unknown_task_is_404() {
    let client = reqwest::Client::new();

    let response = client
        .get(format!("{}/result/{}", base_url(), uuid::Uuid::new_v4()))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
}
