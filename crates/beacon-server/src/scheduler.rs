//! Interval-based background tasks.
//!
//! The hub polls [`Scheduler::due`] after every wake-up. A task fires when
//! at least its interval has elapsed since it last fired, and is stamped with
//! the polling time. Timestamps are `Instant`s, so wall-clock jumps do not
//! affect the schedule.

use std::time::{Duration, Instant};

use beacon_router::{ANALYTICS_CHANNEL, METRICS_CHANNEL, MODELS_CHANNEL};

use crate::config::ScheduleConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    /// Publish the compliance report.
    ComplianceSnapshot,
    /// Publish dispatch counts and connected clients.
    BroadcastTick,
    /// Announce a model version bump.
    ModelRefresh,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ComplianceSnapshot => "compliance_snapshot",
            Self::BroadcastTick => "broadcast_tick",
            Self::ModelRefresh => "model_refresh",
        }
    }

    /// Channel the task publishes to.
    pub fn channel(&self) -> &'static str {
        match self {
            Self::ComplianceSnapshot => METRICS_CHANNEL,
            Self::BroadcastTick => ANALYTICS_CHANNEL,
            Self::ModelRefresh => MODELS_CHANNEL,
        }
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct ScheduledTask {
    pub kind: TaskKind,
    pub interval: Duration,
    pub last_fired: Instant,
}

impl ScheduledTask {
    fn is_due(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_fired) >= self.interval
    }
}

#[derive(Debug, Clone, Default)]
pub struct Scheduler {
    tasks: Vec<ScheduledTask>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the standard task set. Tasks with a zero interval are left out.
    pub fn from_config(config: &ScheduleConfig, now: Instant) -> Self {
        let mut scheduler = Self::new();
        let intervals = [
            (TaskKind::ComplianceSnapshot, config.compliance_interval_secs),
            (TaskKind::BroadcastTick, config.broadcast_interval_secs),
            (TaskKind::ModelRefresh, config.model_refresh_interval_secs),
        ];
        for (kind, secs) in intervals {
            scheduler.add(kind, Duration::from_secs(secs), now);
        }
        scheduler
    }

    /// Register a task. The first run is one interval after `now`.
    pub fn add(&mut self, kind: TaskKind, interval: Duration, now: Instant) {
        if interval.is_zero() {
            return;
        }
        self.tasks.push(ScheduledTask {
            kind,
            interval,
            last_fired: now,
        });
    }

    /// Tasks due at `now`, stamped as fired.
    pub fn due(&mut self, now: Instant) -> Vec<TaskKind> {
        let mut due = Vec::new();
        for task in &mut self.tasks {
            if task.is_due(now) {
                task.last_fired = task.last_fired.max(now);
                due.push(task.kind);
            }
        }
        due
    }

    pub fn tasks(&self) -> &[ScheduledTask] {
        &self.tasks
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}
