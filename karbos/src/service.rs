//! Submission, inspection, and forecast facade.
//!
//! [`JobService`] is the library-level surface the API role exposes over
//! HTTP: validate a submission, obtain a scheduling decision, persist the
//! job, and route it into the right queue lane. Carbon-data availability
//! never fails a submission; the only submission errors are validation,
//! a refused store write, and an unavailable broker.

use crate::job::{Job, JobStatus, DEFAULT_ESTIMATED_DURATION_SECS};
use crate::queue::{JobQueue, QueueEntry, QueueError};
use crate::scheduler::{CarbonScheduler, ForecastSource, ScheduleRequest, SchedulerError};
use crate::store::{JobStore, StoreError};
use chrono::{DateTime, Duration as ChronoDuration, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

/// Default region applied when the submitter names none.
pub const DEFAULT_REGION: &str = "US-EAST";

/// Hard cap on per-user listing sizes.
pub const MAX_USER_LIMIT: i64 = 100;

/// Hard cap on global listing sizes.
pub const MAX_LIST_LIMIT: i64 = 500;

/// Hours of forecast returned by the forecast view.
const FORECAST_HOURS: i64 = 24;

/// Errors surfaced by the service, mapped onto HTTP-like status codes.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{0} is required")]
    MissingField(&'static str),
    #[error("deadline must be an ISO-8601 instant (e.g. 2025-12-05T18:00:00Z)")]
    BadDeadlineFormat,
    #[error("deadline must be in the future")]
    DeadlineInPast,
    #[error("invalid schedule request: {0}")]
    InvalidSchedule(#[from] SchedulerError),
    #[error("job {0} not found")]
    NotFound(Uuid),
    #[error("store failure: {0}")]
    Store(StoreError),
    #[error("broker unavailable: {0}")]
    Broker(#[from] QueueError),
}

impl ServiceError {
    /// HTTP-like status code for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            ServiceError::MissingField(_)
            | ServiceError::BadDeadlineFormat
            | ServiceError::DeadlineInPast
            | ServiceError::InvalidSchedule(_) => 400,
            ServiceError::NotFound(_) => 404,
            ServiceError::Store(_) => 500,
            ServiceError::Broker(_) => 503,
        }
    }
}

impl From<StoreError> for ServiceError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => ServiceError::NotFound(id),
            other => ServiceError::Store(other),
        }
    }
}

/// A job submission.
#[derive(Debug, Clone, Deserialize)]
pub struct SubmitRequest {
    pub user_id: String,
    pub docker_image: String,
    #[serde(default)]
    pub command: Option<Vec<String>>,
    /// ISO-8601 instant.
    pub deadline: String,
    /// Estimated runtime in seconds.
    #[serde(default)]
    pub estimated_duration: Option<i64>,
    #[serde(default)]
    pub region: Option<String>,
}

/// The submission outcome returned to the caller.
#[derive(Debug, Clone, Serialize)]
pub struct SubmitResponse {
    pub id: Uuid,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    /// ISO-8601 instant the job will start.
    pub scheduled_time: String,
    pub immediate: bool,
    pub expected_intensity: f64,
    pub carbon_savings: f64,
    pub message: String,
}

/// Listing wrapper for per-user queries.
#[derive(Debug, Clone, Serialize)]
pub struct UserJobs {
    pub user_id: String,
    pub count: usize,
    pub jobs: Vec<Job>,
}

/// One point of the forecast view.
#[derive(Debug, Clone, Serialize)]
pub struct ForecastPoint {
    pub region: String,
    pub instant: DateTime<Utc>,
    pub intensity: f64,
    pub unit: String,
}

/// Up to 24 hours of forecast for a region.
#[derive(Debug, Clone, Serialize)]
pub struct ForecastView {
    pub region: String,
    pub samples: Vec<ForecastPoint>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_intensity: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub optimal_instant: Option<DateTime<Utc>>,
}

/// Submission, inspection, and forecast operations.
pub struct JobService {
    store: Arc<dyn JobStore>,
    queue: Arc<dyn JobQueue>,
    scheduler: CarbonScheduler,
    source: Arc<dyn ForecastSource>,
    default_region: String,
}

impl JobService {
    pub fn new(
        store: Arc<dyn JobStore>,
        queue: Arc<dyn JobQueue>,
        scheduler: CarbonScheduler,
        source: Arc<dyn ForecastSource>,
    ) -> Self {
        Self {
            store,
            queue,
            scheduler,
            source,
            default_region: DEFAULT_REGION.to_string(),
        }
    }

    /// Overrides the deployment's default region.
    pub fn with_default_region(mut self, region: impl Into<String>) -> Self {
        self.default_region = region.into();
        self
    }

    /// Submits a job. With `dry_run`, the decision is returned without
    /// persisting or enqueuing anything.
    pub async fn submit(&self, req: &SubmitRequest, dry_run: bool) -> Result<SubmitResponse, ServiceError> {
        let deadline = Self::validate(req)?;

        let region = req
            .region
            .as_deref()
            .filter(|r| !r.is_empty())
            .unwrap_or(&self.default_region)
            .to_string();

        let duration_secs = req
            .estimated_duration
            .filter(|d| *d > 0)
            .unwrap_or(DEFAULT_ESTIMATED_DURATION_SECS);

        let decision = self
            .scheduler
            .schedule(&ScheduleRequest {
                region: region.clone(),
                duration: Duration::from_secs(duration_secs as u64),
                deadline,
                window_size: None,
                earliest_start: None,
            })
            .await?;

        info!(
            region = %region,
            immediate = decision.immediate,
            scheduled_time = %decision.scheduled_time,
            savings = decision.carbon_savings,
            "carbon scheduling decision"
        );

        let mut job = Job::new(&req.user_id, &req.docker_image, deadline);
        job.command = req.command.clone();
        job.scheduled_time = Some(decision.scheduled_time);
        job.estimated_duration = Some(duration_secs);
        job.region = Some(region);

        if dry_run {
            return Ok(Self::response(&job, &decision.scheduled_time.to_rfc3339_opts(SecondsFormat::Secs, true), decision.immediate, decision.expected_intensity, decision.carbon_savings, "Dry run - job not created"));
        }

        // The store write gates the enqueue: a refused write means the job
        // was never submitted.
        let job = self.store.create(job).await.map_err(ServiceError::from)?;

        let mut entry = QueueEntry::new(job.id, &job.docker_image, decision.scheduled_time);
        entry.command = job.command.clone();

        let mut status = job.status;
        let message = if decision.immediate {
            self.queue.enqueue_immediate(&entry).await?;
            "Job submitted successfully"
        } else {
            self.queue.enqueue_delayed(&entry).await?;
            // The lifecycle transition mirrors the queue routing. Losing
            // this write leaves the job Pending, which the worker's claim
            // guard handles the same way.
            match self.store.update_status(job.id, JobStatus::Delayed).await {
                Ok(()) => status = JobStatus::Delayed,
                Err(err) => warn!(job_id = %job.id, error = %err, "failed to mark job delayed"),
            }
            "Job scheduled for optimal carbon efficiency"
        };

        info!(job_id = %job.id, user = %job.user_id, immediate = decision.immediate, "job submitted");

        let mut response = Self::response(
            &job,
            &decision.scheduled_time.to_rfc3339_opts(SecondsFormat::Secs, true),
            decision.immediate,
            decision.expected_intensity,
            decision.carbon_savings,
            message,
        );
        response.status = status;
        Ok(response)
    }

    /// Fetches one job.
    pub async fn job(&self, id: Uuid) -> Result<Job, ServiceError> {
        self.store.get_by_id(id).await.map_err(ServiceError::from)
    }

    /// Jobs for one user, newest first. The limit is clamped to 100.
    pub async fn jobs_for_user(&self, user_id: &str, limit: i64) -> Result<UserJobs, ServiceError> {
        if user_id.is_empty() {
            return Err(ServiceError::MissingField("user_id"));
        }
        let limit = clamp_limit(limit, MAX_USER_LIMIT, 50);
        let jobs = self.store.list_by_user(user_id, limit).await.map_err(ServiceError::from)?;
        Ok(UserJobs {
            user_id: user_id.to_string(),
            count: jobs.len(),
            jobs,
        })
    }

    /// All jobs, newest first. The limit is clamped to 500.
    pub async fn all_jobs(&self, limit: i64) -> Result<Vec<Job>, ServiceError> {
        let limit = clamp_limit(limit, MAX_LIST_LIMIT, 100);
        self.store.list_all(limit).await.map_err(ServiceError::from)
    }

    /// Up to 24 hours of intensity forecast for a region.
    pub async fn forecast(&self, region: Option<&str>) -> ForecastView {
        let region = region
            .filter(|r| !r.is_empty())
            .unwrap_or(&self.default_region)
            .to_string();

        let now = Utc::now();
        let samples = self
            .source
            .forecast(&region, now, now + ChronoDuration::hours(FORECAST_HOURS))
            .await;

        let current_intensity = samples.first().map(|s| s.intensity);
        let optimal_instant = samples
            .iter()
            .min_by(|a, b| a.intensity.total_cmp(&b.intensity))
            .map(|s| s.instant);

        ForecastView {
            region: region.clone(),
            samples: samples
                .into_iter()
                .map(|s| ForecastPoint {
                    region: s.region,
                    instant: s.instant,
                    intensity: s.intensity,
                    unit: s.unit,
                })
                .collect(),
            current_intensity,
            optimal_instant,
        }
    }

    fn validate(req: &SubmitRequest) -> Result<DateTime<Utc>, ServiceError> {
        if req.user_id.is_empty() {
            return Err(ServiceError::MissingField("user_id"));
        }
        if req.docker_image.is_empty() {
            return Err(ServiceError::MissingField("docker_image"));
        }
        if req.deadline.is_empty() {
            return Err(ServiceError::MissingField("deadline"));
        }

        let deadline = DateTime::parse_from_rfc3339(&req.deadline)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|_| ServiceError::BadDeadlineFormat)?;

        if deadline <= Utc::now() {
            return Err(ServiceError::DeadlineInPast);
        }
        Ok(deadline)
    }

    fn response(
        job: &Job,
        scheduled_time: &str,
        immediate: bool,
        expected_intensity: f64,
        carbon_savings: f64,
        message: &str,
    ) -> SubmitResponse {
        SubmitResponse {
            id: job.id,
            status: job.status,
            created_at: job.created_at,
            scheduled_time: scheduled_time.to_string(),
            immediate,
            expected_intensity,
            carbon_savings,
            message: message.to_string(),
        }
    }
}

fn clamp_limit(requested: i64, max: i64, default: i64) -> i64 {
    if requested <= 0 {
        default
    } else {
        requested.min(max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::carbon::IntensitySample;
    use crate::queue::MemoryQueue;
    use crate::store::MemoryJobStore;
    use async_trait::async_trait;

    /// Hourly curve anchored at request time.
    struct Curve(Vec<f64>);

    #[async_trait]
    impl ForecastSource for Curve {
        async fn forecast(
            &self,
            region: &str,
            start: DateTime<Utc>,
            end: DateTime<Utc>,
        ) -> Vec<IntensitySample> {
            self.0
                .iter()
                .enumerate()
                .map(|(i, v)| IntensitySample::live(region, start + ChronoDuration::hours(i as i64), *v))
                .filter(|s| s.instant <= end)
                .collect()
        }

        async fn current(&self, region: &str) -> IntensitySample {
            IntensitySample::live(region, Utc::now(), self.0.first().copied().unwrap_or(0.0))
        }
    }

    struct Fixture {
        store: Arc<MemoryJobStore>,
        queue: Arc<MemoryQueue>,
        service: JobService,
    }

    fn fixture(curve: Vec<f64>) -> Fixture {
        let store = Arc::new(MemoryJobStore::new());
        let queue = Arc::new(MemoryQueue::new());
        let source = Arc::new(Curve(curve));
        let scheduler = CarbonScheduler::new(source.clone() as Arc<dyn ForecastSource>);
        let service = JobService::new(
            store.clone() as Arc<dyn JobStore>,
            queue.clone() as Arc<dyn JobQueue>,
            scheduler,
            source as Arc<dyn ForecastSource>,
        );
        Fixture { store, queue, service }
    }

    fn request(deadline_hours: i64) -> SubmitRequest {
        SubmitRequest {
            user_id: "alice".to_string(),
            docker_image: "alpine:latest".to_string(),
            command: None,
            deadline: (Utc::now() + ChronoDuration::hours(deadline_hours))
                .to_rfc3339_opts(SecondsFormat::Secs, true),
            estimated_duration: Some(3600),
            region: None,
        }
    }

    #[tokio::test]
    async fn missing_fields_are_rejected() {
        let f = fixture(vec![400.0]);

        let mut req = request(6);
        req.user_id = String::new();
        let err = f.service.submit(&req, false).await.unwrap_err();
        assert_eq!(err.status_code(), 400);
        assert!(matches!(err, ServiceError::MissingField("user_id")));

        let mut req = request(6);
        req.docker_image = String::new();
        assert!(matches!(
            f.service.submit(&req, false).await.unwrap_err(),
            ServiceError::MissingField("docker_image")
        ));

        let mut req = request(6);
        req.deadline = String::new();
        assert!(matches!(
            f.service.submit(&req, false).await.unwrap_err(),
            ServiceError::MissingField("deadline")
        ));
    }

    #[tokio::test]
    async fn malformed_deadline_is_rejected() {
        let f = fixture(vec![400.0]);
        let mut req = request(6);
        req.deadline = "tomorrow at noon".to_string();
        let err = f.service.submit(&req, false).await.unwrap_err();
        assert!(matches!(err, ServiceError::BadDeadlineFormat));
        assert_eq!(err.status_code(), 400);
    }

    #[tokio::test]
    async fn past_deadline_is_rejected() {
        let f = fixture(vec![400.0]);
        let mut req = request(6);
        req.deadline = (Utc::now() - ChronoDuration::hours(1))
            .to_rfc3339_opts(SecondsFormat::Secs, true)
            .to_string();
        assert!(matches!(
            f.service.submit(&req, false).await.unwrap_err(),
            ServiceError::DeadlineInPast
        ));
    }

    #[tokio::test]
    async fn duration_that_cannot_meet_the_deadline_is_rejected() {
        let f = fixture(vec![400.0; 6]);
        let mut req = request(1);
        req.estimated_duration = Some(2 * 3600);
        let err = f.service.submit(&req, false).await.unwrap_err();
        assert_eq!(err.status_code(), 400);
        assert!(matches!(err, ServiceError::InvalidSchedule(SchedulerError::InsufficientTime)));
    }

    #[tokio::test]
    async fn clean_grid_submission_goes_to_the_immediate_lane() {
        // Flat 300s are under the 400 threshold.
        let f = fixture(vec![300.0; 6]);
        let response = f.service.submit(&request(6), false).await.unwrap();

        assert!(response.immediate);
        assert_eq!(response.status, JobStatus::Pending);
        assert_eq!(f.queue.immediate_depth().await.unwrap(), 1);
        assert_eq!(f.queue.delayed_depth().await.unwrap(), 0);

        let stored = f.store.get_by_id(response.id).await.unwrap();
        assert_eq!(stored.status, JobStatus::Pending);
        assert_eq!(stored.region.as_deref(), Some(DEFAULT_REGION));
    }

    #[tokio::test]
    async fn dirty_grid_submission_is_delayed_with_the_deadline_honored() {
        // Steep curve: waiting 3 hours saves 42%.
        let f = fixture(vec![450.0, 410.0, 370.0, 260.0, 290.0, 320.0]);
        let response = f.service.submit(&request(6), false).await.unwrap();

        assert!(!response.immediate);
        assert_eq!(response.status, JobStatus::Delayed);
        assert_eq!(f.queue.delayed_depth().await.unwrap(), 1);
        assert_eq!(f.queue.immediate_depth().await.unwrap(), 0);

        let stored = f.store.get_by_id(response.id).await.unwrap();
        assert_eq!(stored.status, JobStatus::Delayed);

        // scheduled_time + estimated_duration <= deadline.
        let scheduled = stored.scheduled_time.unwrap();
        assert!(scheduled + ChronoDuration::seconds(3600) <= stored.deadline);
        assert!(response.carbon_savings > 0.0);
    }

    #[tokio::test]
    async fn dry_run_persists_and_enqueues_nothing() {
        let f = fixture(vec![450.0, 410.0, 370.0, 260.0, 290.0, 320.0]);
        let response = f.service.submit(&request(6), true).await.unwrap();

        assert_eq!(response.message, "Dry run - job not created");
        assert_eq!(f.store.job_count(), 0);
        assert_eq!(f.queue.immediate_depth().await.unwrap(), 0);
        assert_eq!(f.queue.delayed_depth().await.unwrap(), 0);
    }

    /// Broker double whose writes always fail.
    struct DownQueue;

    #[async_trait]
    impl JobQueue for DownQueue {
        async fn enqueue_immediate(&self, _entry: &QueueEntry) -> Result<(), QueueError> {
            Err(QueueError::Unavailable("connection refused".to_string()))
        }

        async fn dequeue_immediate(&self) -> Result<Option<QueueEntry>, QueueError> {
            Err(QueueError::Unavailable("connection refused".to_string()))
        }

        async fn enqueue_delayed(&self, _entry: &QueueEntry) -> Result<(), QueueError> {
            Err(QueueError::Unavailable("connection refused".to_string()))
        }

        async fn scan_due(&self, _now: DateTime<Utc>) -> Result<Vec<QueueEntry>, QueueError> {
            Err(QueueError::Unavailable("connection refused".to_string()))
        }

        async fn remove_from_delayed(&self, _job_id: Uuid) -> Result<(), QueueError> {
            Err(QueueError::Unavailable("connection refused".to_string()))
        }

        async fn immediate_depth(&self) -> Result<i64, QueueError> {
            Err(QueueError::Unavailable("connection refused".to_string()))
        }

        async fn delayed_depth(&self) -> Result<i64, QueueError> {
            Err(QueueError::Unavailable("connection refused".to_string()))
        }

        async fn set_heartbeat(&self, _worker_id: &str, _ttl: std::time::Duration) -> Result<(), QueueError> {
            Err(QueueError::Unavailable("connection refused".to_string()))
        }

        async fn list_active_workers(&self) -> Result<Vec<String>, QueueError> {
            Err(QueueError::Unavailable("connection refused".to_string()))
        }

        async fn ping(&self) -> Result<(), QueueError> {
            Err(QueueError::Unavailable("connection refused".to_string()))
        }
    }

    #[tokio::test]
    async fn unavailable_broker_is_a_503() {
        let store = Arc::new(MemoryJobStore::new());
        let source = Arc::new(Curve(vec![300.0; 4]));
        let service = JobService::new(
            store.clone() as Arc<dyn JobStore>,
            Arc::new(DownQueue) as Arc<dyn JobQueue>,
            CarbonScheduler::new(source.clone() as Arc<dyn ForecastSource>),
            source as Arc<dyn ForecastSource>,
        );

        let err = service.submit(&request(6), false).await.unwrap_err();
        assert!(matches!(err, ServiceError::Broker(_)));
        assert_eq!(err.status_code(), 503);
    }

    #[tokio::test]
    async fn unknown_job_is_a_404() {
        let f = fixture(vec![400.0]);
        let err = f.service.job(Uuid::new_v4()).await.unwrap_err();
        assert_eq!(err.status_code(), 404);
    }

    #[tokio::test]
    async fn user_listing_wraps_jobs_with_a_count() {
        let f = fixture(vec![300.0; 4]);
        f.service.submit(&request(6), false).await.unwrap();
        f.service.submit(&request(6), false).await.unwrap();

        let listing = f.service.jobs_for_user("alice", 10).await.unwrap();
        assert_eq!(listing.user_id, "alice");
        assert_eq!(listing.count, 2);
        assert_eq!(listing.jobs.len(), 2);

        assert_eq!(f.service.jobs_for_user("bob", 10).await.unwrap().count, 0);
    }

    #[tokio::test]
    async fn forecast_view_reports_current_and_optimal() {
        let f = fixture(vec![450.0, 410.0, 260.0, 320.0]);
        let view = f.service.forecast(None).await;

        assert_eq!(view.region, DEFAULT_REGION);
        assert_eq!(view.samples.len(), 4);
        assert_eq!(view.current_intensity, Some(450.0));
        assert_eq!(view.optimal_instant, Some(view.samples[2].instant));
        assert!(view.samples.iter().all(|s| s.unit == "gCO2eq/kWh"));
    }

    #[tokio::test]
    async fn forecast_view_with_no_data_has_no_current_or_optimal() {
        let f = fixture(vec![]);
        let view = f.service.forecast(Some("EU-WEST")).await;
        assert!(view.samples.is_empty());
        assert!(view.current_intensity.is_none());
        assert!(view.optimal_instant.is_none());
    }

    #[test]
    fn limits_clamp_to_their_maxima_and_defaults() {
        assert_eq!(clamp_limit(0, 100, 50), 50);
        assert_eq!(clamp_limit(-3, 100, 50), 50);
        assert_eq!(clamp_limit(10, 100, 50), 10);
        assert_eq!(clamp_limit(5000, 100, 50), 100);
        assert_eq!(clamp_limit(5000, 500, 100), 500);
    }
}
