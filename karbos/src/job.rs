//! Job and execution-record models.
//!
//! A [`Job`] is the unit of work submitted to the system: a container image,
//! a completion deadline, and enough metadata for the scheduler to decide
//! when it should run. Jobs move through a fixed lifecycle:
//!
//! ```text
//! Pending ──► Delayed ──► Running ──► Completed
//!    │                      ▲   └───► Failed
//!    └──────────────────────┘
//! ```
//!
//! Terminal states are immutable. Every transition is validated twice: here
//! via [`JobStatus::can_transition_to`], and again at the store with a
//! conditional update, so two racing workers cannot both move a job into
//! `Running`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Default estimated runtime when the submitter does not provide one.
pub const DEFAULT_ESTIMATED_DURATION_SECS: i64 = 600;

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Accepted, not yet routed to a queue lane.
    Pending,
    /// Scheduled for a future start; parked in the delayed lane.
    Delayed,
    /// A worker has claimed the job and the container is in flight.
    Running,
    /// Container exited with code zero.
    Completed,
    /// Container failed, exited non-zero, or execution was aborted.
    Failed,
}

impl JobStatus {
    /// Database / wire representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Delayed => "DELAYED",
            JobStatus::Running => "RUNNING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
        }
    }

    /// Parses the database representation. Unknown strings are rejected
    /// rather than mapped onto a default.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(JobStatus::Pending),
            "DELAYED" => Some(JobStatus::Delayed),
            "RUNNING" => Some(JobStatus::Running),
            "COMPLETED" => Some(JobStatus::Completed),
            "FAILED" => Some(JobStatus::Failed),
            _ => None,
        }
    }

    /// Whether this status is terminal (no further transitions allowed).
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Whether the lifecycle graph permits moving from `self` to `next`.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Delayed)
                | (JobStatus::Pending, JobStatus::Running)
                | (JobStatus::Delayed, JobStatus::Running)
                | (JobStatus::Running, JobStatus::Completed)
                | (JobStatus::Running, JobStatus::Failed)
        )
    }

    /// The set of statuses a job may hold immediately before entering
    /// `self`. Used by stores to build the conditional-update guard.
    pub fn allowed_predecessors(&self) -> &'static [JobStatus] {
        match self {
            JobStatus::Pending => &[],
            JobStatus::Delayed => &[JobStatus::Pending],
            JobStatus::Running => &[JobStatus::Pending, JobStatus::Delayed],
            JobStatus::Completed => &[JobStatus::Running],
            JobStatus::Failed => &[JobStatus::Running],
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A submitted unit of containerized work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Unique identifier, assigned at creation.
    pub id: Uuid,
    /// Submitter key (free-form; no auth semantics attached here).
    pub user_id: String,
    /// Container image reference to execute.
    pub docker_image: String,
    /// Optional argument vector passed to the container.
    pub command: Option<Vec<String>>,
    pub status: JobStatus,
    /// Start instant chosen by the scheduler.
    pub scheduled_time: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    /// Set when the job enters `Running`.
    pub started_at: Option<DateTime<Utc>>,
    /// Set when the job enters a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
    /// Hard completion deadline; must be after `created_at`.
    pub deadline: DateTime<Utc>,
    /// Estimated runtime in seconds.
    pub estimated_duration: Option<i64>,
    /// Target grid region.
    pub region: Option<String>,
    /// Opaque metadata bag, stored as a JSON document.
    pub metadata: String,
}

impl Job {
    /// Builds a new pending job with server-assigned id and timestamps.
    pub fn new(user_id: impl Into<String>, docker_image: impl Into<String>, deadline: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            docker_image: docker_image.into(),
            command: None,
            status: JobStatus::Pending,
            scheduled_time: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            deadline,
            estimated_duration: None,
            region: None,
            metadata: "{}".to_string(),
        }
    }

    /// Estimated runtime, falling back to the system default.
    pub fn estimated_duration_secs(&self) -> i64 {
        self.estimated_duration
            .filter(|d| *d > 0)
            .unwrap_or(DEFAULT_ESTIMATED_DURATION_SECS)
    }
}

/// Record of a single terminated container execution. Written once by the
/// worker after the container finishes; never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: Uuid,
    pub job_id: Uuid,
    /// Combined captured stdout/stderr.
    pub output: Option<String>,
    pub error_output: Option<String>,
    pub exit_code: Option<i32>,
    /// Total runtime in seconds.
    pub duration: Option<i64>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Identity of the worker process that ran the container.
    pub worker_node_id: Option<String>,
}

impl ExecutionRecord {
    /// Starts a record for a job picked up by the given worker.
    pub fn begin(job_id: Uuid, worker_node_id: impl Into<String>, started_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_id,
            output: None,
            error_output: None,
            exit_code: None,
            duration: None,
            started_at,
            completed_at: None,
            worker_node_id: Some(worker_node_id.into()),
        }
    }
}
