//! Carbon-aware scheduling via sliding-window minimization.
//!
//! Given a job's estimated duration and deadline, the scheduler fetches an
//! intensity forecast for the feasible window, slides a window of
//! duration-many slots across it, and picks the window with the lowest mean
//! intensity. The result is either an *immediate* decision or a future
//! *scheduled* start, with the expected carbon savings quantified against
//! running right now.
//!
//! Ties between windows with the same mean resolve to the earlier start, so
//! the choice is deterministic for a given forecast.

use crate::carbon::{CarbonFetcher, IntensitySample};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Default sliding-window horizon.
pub const DEFAULT_WINDOW_SIZE: Duration = Duration::from_secs(24 * 60 * 60);

/// Default forecast slot granularity.
pub const DEFAULT_SLOT_SIZE: Duration = Duration::from_secs(60 * 60);

/// Default intensity threshold below which running now is always fine.
pub const DEFAULT_THRESHOLD: f64 = 400.0;

/// Savings percentage below which delaying is not worth it.
const MIN_SAVINGS_PERCENT: f64 = 10.0;

/// Mean-intensity distance within which a window counts as an alternative.
const ALTERNATIVE_TOLERANCE: f64 = 10.0;

/// Maximum number of alternative windows reported.
const MAX_ALTERNATIVES: usize = 3;

/// How close the optimal start must be to now to collapse into "run now",
/// in minutes.
const IMMEDIATE_START_SLACK_MINS: i64 = 5;

/// Capability the scheduler needs from the carbon subsystem.
///
/// Both methods always produce data: provider failure has already been
/// absorbed into fallback samples upstream.
#[async_trait]
pub trait ForecastSource: Send + Sync {
    async fn forecast(&self, region: &str, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<IntensitySample>;
    async fn current(&self, region: &str) -> IntensitySample;
}

#[async_trait]
impl ForecastSource for CarbonFetcher {
    async fn forecast(&self, region: &str, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<IntensitySample> {
        CarbonFetcher::forecast(self, region, start, end).await
    }

    async fn current(&self, region: &str) -> IntensitySample {
        CarbonFetcher::current(self, region).await
    }
}

/// Errors rejecting a scheduling request before any forecast is fetched.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("region is required")]
    EmptyRegion,
    #[error("duration must be positive")]
    NonPositiveDuration,
    #[error("deadline must be in the future")]
    DeadlineInPast,
    #[error("not enough time between earliest start and deadline")]
    InsufficientTime,
}

/// A job scheduling request.
#[derive(Debug, Clone)]
pub struct ScheduleRequest {
    /// Geographic region for carbon intensity.
    pub region: String,
    /// Expected job execution duration.
    pub duration: Duration,
    /// Latest instant the job must complete by.
    pub deadline: DateTime<Utc>,
    /// Horizon to consider (default 24 hours).
    pub window_size: Option<Duration>,
    /// Earliest instant the job can start (default now).
    pub earliest_start: Option<DateTime<Utc>>,
}

/// A candidate execution window.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// Arithmetic mean intensity across the window's slots.
    pub avg_intensity: f64,
    /// Mean intensity weighted by the job duration in hours.
    pub carbon_cost: f64,
}

/// The scheduling decision.
#[derive(Debug, Clone)]
pub struct ScheduleResult {
    /// When the job should start.
    pub scheduled_time: DateTime<Utc>,
    /// Expected mean intensity over the chosen window.
    pub expected_intensity: f64,
    /// True when the job should run without delay.
    pub immediate: bool,
    /// Expected savings versus starting now, in gCO2eq/kWh.
    pub carbon_savings: f64,
    /// Near-optimal windows, at most three.
    pub alternatives: Vec<TimeWindow>,
}

/// Sliding-window carbon scheduler.
pub struct CarbonScheduler {
    source: Arc<dyn ForecastSource>,
    slot_size: Duration,
    threshold: f64,
}

impl CarbonScheduler {
    pub fn new(source: Arc<dyn ForecastSource>) -> Self {
        Self {
            source,
            slot_size: DEFAULT_SLOT_SIZE,
            threshold: DEFAULT_THRESHOLD,
        }
    }

    /// Overrides the forecast slot granularity.
    pub fn with_slot_size(mut self, slot_size: Duration) -> Self {
        self.slot_size = slot_size;
        self
    }

    /// Overrides the immediate-execution intensity threshold.
    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    /// Finds the optimal execution time for a job.
    pub async fn schedule(&self, req: &ScheduleRequest) -> Result<ScheduleResult, SchedulerError> {
        let now = Utc::now();
        self.validate(req, now)?;

        let window_size = req.window_size.unwrap_or(DEFAULT_WINDOW_SIZE);
        let earliest_start = req.earliest_start.unwrap_or(now);

        let mut end_time = earliest_start
            + ChronoDuration::from_std(window_size).unwrap_or(ChronoDuration::hours(24));
        if end_time > req.deadline {
            end_time = req.deadline;
        }

        let forecast = self.source.forecast(&req.region, earliest_start, end_time).await;

        // Constrain to the feasible interval; providers may hand back
        // bucket-aligned points just outside it.
        let slots: Vec<&IntensitySample> = forecast
            .iter()
            .filter(|s| s.instant >= earliest_start && s.instant <= req.deadline)
            .collect();

        let candidate = if slots.is_empty() {
            None
        } else {
            self.find_optimal_window(&slots, req.duration, req.deadline)
        };

        let Some((optimal, alternatives)) = candidate else {
            // No forecast data, or no window that still meets the deadline:
            // run now against the current reading.
            let current = self.source.current(&req.region).await;
            debug!(region = %req.region, "no usable forecast window, deciding immediate");
            return Ok(ScheduleResult {
                scheduled_time: now,
                expected_intensity: current.intensity,
                immediate: true,
                carbon_savings: 0.0,
                alternatives: Vec::new(),
            });
        };

        let current_intensity = forecast[0].intensity;
        let carbon_savings = current_intensity - optimal.avg_intensity;
        let savings_percent = if current_intensity > 0.0 {
            (carbon_savings / current_intensity) * 100.0
        } else {
            0.0
        };

        // Run now when the optimal window is already here, the savings are
        // negligible, or the grid is clean enough anyway.
        let immediate = (optimal.start - now).abs() < ChronoDuration::minutes(IMMEDIATE_START_SLACK_MINS)
            || savings_percent < MIN_SAVINGS_PERCENT
            || current_intensity < self.threshold;

        let scheduled_time = if immediate { now } else { optimal.start };

        debug!(
            region = %req.region,
            immediate = immediate,
            scheduled_time = %scheduled_time,
            expected_intensity = optimal.avg_intensity,
            savings = carbon_savings,
            "scheduling decision"
        );

        Ok(ScheduleResult {
            scheduled_time,
            expected_intensity: optimal.avg_intensity,
            immediate,
            carbon_savings,
            alternatives,
        })
    }

    /// Slides a window of duration-many slots over the forecast and picks
    /// the minimum-mean position. Earlier windows win exact ties. Windows
    /// whose start cannot fit the duration before the deadline are not
    /// candidates; `None` means no window fits at all.
    fn find_optimal_window(
        &self,
        slots: &[&IntensitySample],
        duration: Duration,
        deadline: DateTime<Utc>,
    ) -> Option<(TimeWindow, Vec<TimeWindow>)> {
        let slot_size = ChronoDuration::from_std(self.slot_size).unwrap_or(ChronoDuration::hours(1));
        let duration_chrono = ChronoDuration::from_std(duration).unwrap_or(ChronoDuration::zero());
        let duration_hours = duration.as_secs_f64() / 3600.0;

        let window_slots =
            (duration.as_secs_f64() / self.slot_size.as_secs_f64()).ceil().max(1.0) as usize;

        if window_slots > slots.len() {
            // Duration exceeds the forecast range: the whole range is the
            // only candidate, and it is subject to the same deadline guard
            // as every sliding position. Providers return bucket-aligned
            // instants, so the first slot may sit later than the earliest
            // start and push the finish past the deadline.
            if slots[0].instant + duration_chrono > deadline {
                return None;
            }
            let avg = Self::mean(slots);
            let window = TimeWindow {
                start: slots[0].instant,
                end: slots[slots.len() - 1].instant + slot_size,
                avg_intensity: avg,
                carbon_cost: avg * duration_hours,
            };
            return Some((window, Vec::new()));
        }

        let mut optimal: Option<TimeWindow> = None;
        let mut alternatives: Vec<TimeWindow> = Vec::new();
        let mut min_intensity = f64::MAX;

        for i in 0..=(slots.len() - window_slots) {
            let slice = &slots[i..i + window_slots];

            if slice[0].instant + duration_chrono > deadline {
                // Starting here would blow the deadline; later starts only
                // get worse.
                break;
            }

            let avg = Self::mean(slice);
            let window = TimeWindow {
                start: slice[0].instant,
                end: slice[slice.len() - 1].instant + slot_size,
                avg_intensity: avg,
                carbon_cost: avg * duration_hours,
            };

            if avg < min_intensity {
                min_intensity = avg;
                optimal = Some(window);
                alternatives.clear();
            } else if (avg - min_intensity).abs() < ALTERNATIVE_TOLERANCE {
                alternatives.push(window);
            }
        }

        alternatives.truncate(MAX_ALTERNATIVES);
        optimal.map(|window| (window, alternatives))
    }

    fn mean(slots: &[&IntensitySample]) -> f64 {
        if slots.is_empty() {
            return 0.0;
        }
        slots.iter().map(|s| s.intensity).sum::<f64>() / slots.len() as f64
    }

    fn validate(&self, req: &ScheduleRequest, now: DateTime<Utc>) -> Result<(), SchedulerError> {
        if req.region.is_empty() {
            return Err(SchedulerError::EmptyRegion);
        }
        if req.duration.is_zero() {
            return Err(SchedulerError::NonPositiveDuration);
        }
        if req.deadline <= now {
            return Err(SchedulerError::DeadlineInPast);
        }
        let earliest = req.earliest_start.unwrap_or(now);
        let duration = ChronoDuration::from_std(req.duration).unwrap_or(ChronoDuration::zero());
        if earliest + duration > req.deadline {
            return Err(SchedulerError::InsufficientTime);
        }
        Ok(())
    }
}
