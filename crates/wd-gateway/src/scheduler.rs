// scheduler.rs — Supervised / autonomous operating windows.
//
// The autonomous window is a pair of local wall-clock times at a fixed UTC
// offset. A window whose start is after its end wraps midnight. Equal start
// and end means the gateway is never autonomous.
//
// The compiled schedule is packed into one AtomicU64 and the manual
// override is an AtomicBool, so `current` never takes a lock.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use chrono::{DateTime, Duration, NaiveTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use wd_policy::AutonomyWindow;

use crate::error::GatewayError;

const MINUTES_PER_DAY: u32 = 24 * 60;

/// Largest accepted offset magnitude: UTC-14:00 .. UTC+14:00.
const MAX_OFFSET_MINUTES: i32 = 14 * 60;

fn midnight() -> String {
    "00:00".to_string()
}

/// The `[scheduler]` config section. Times are `HH:MM`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScheduleConfig {
    #[serde(default = "midnight")]
    pub autonomous_start: String,
    #[serde(default = "midnight")]
    pub autonomous_end: String,
    #[serde(default)]
    pub utc_offset_minutes: i32,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            autonomous_start: midnight(),
            autonomous_end: midnight(),
            utc_offset_minutes: 0,
        }
    }
}

impl ScheduleConfig {
    pub fn compile(&self) -> Result<Schedule, GatewayError> {
        if self.utc_offset_minutes.abs() > MAX_OFFSET_MINUTES {
            return Err(GatewayError::Config(format!(
                "scheduler.utc_offset_minutes {} is out of range",
                self.utc_offset_minutes
            )));
        }
        Ok(Schedule {
            start_minute: parse_hhmm(&self.autonomous_start)?,
            end_minute: parse_hhmm(&self.autonomous_end)?,
            utc_offset_minutes: self.utc_offset_minutes,
        })
    }
}

fn parse_hhmm(s: &str) -> Result<u32, GatewayError> {
    let t = NaiveTime::parse_from_str(s, "%H:%M").map_err(|e| {
        GatewayError::Config(format!("scheduler time '{}' is not HH:MM: {}", s, e))
    })?;
    Ok(t.hour() * 60 + t.minute())
}

/// A validated schedule, in minutes since local midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schedule {
    start_minute: u32,
    end_minute: u32,
    utc_offset_minutes: i32,
}

impl Schedule {
    /// The window at `now`. Pure: depends only on the schedule and `now`.
    pub fn window_at(&self, now: DateTime<Utc>) -> AutonomyWindow {
        if self.start_minute == self.end_minute {
            return AutonomyWindow::Supervised;
        }
        let local = now + Duration::minutes(self.utc_offset_minutes as i64);
        let minute = local.hour() * 60 + local.minute();
        let autonomous = if self.start_minute < self.end_minute {
            minute >= self.start_minute && minute < self.end_minute
        } else {
            minute >= self.start_minute || minute < self.end_minute
        };
        if autonomous {
            AutonomyWindow::Autonomous
        } else {
            AutonomyWindow::Supervised
        }
    }

    pub fn to_config(&self) -> ScheduleConfig {
        let fmt = |m: u32| format!("{:02}:{:02}", m / 60, m % 60);
        ScheduleConfig {
            autonomous_start: fmt(self.start_minute),
            autonomous_end: fmt(self.end_minute),
            utc_offset_minutes: self.utc_offset_minutes,
        }
    }

    fn pack(&self) -> u64 {
        let offset = (self.utc_offset_minutes + MAX_OFFSET_MINUTES) as u64;
        (self.start_minute as u64) << 32 | (self.end_minute as u64) << 16 | offset
    }

    fn unpack(packed: u64) -> Self {
        Self {
            start_minute: ((packed >> 32) & 0xffff) as u32 % MINUTES_PER_DAY,
            end_minute: ((packed >> 16) & 0xffff) as u32 % MINUTES_PER_DAY,
            utc_offset_minutes: (packed & 0xffff) as i32 - MAX_OFFSET_MINUTES,
        }
    }
}

/// What `wd_schedule_status` reports.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScheduleStatus {
    pub window: AutonomyWindow,
    pub forced_supervised: bool,
    pub config: ScheduleConfig,
}

pub struct Scheduler {
    schedule: AtomicU64,
    force_supervised: AtomicBool,
}

impl Scheduler {
    pub fn new(schedule: Schedule) -> Self {
        Self {
            schedule: AtomicU64::new(schedule.pack()),
            force_supervised: AtomicBool::new(false),
        }
    }

    pub fn schedule(&self) -> Schedule {
        Schedule::unpack(self.schedule.load(Ordering::Acquire))
    }

    /// The window in force at `now`. A manual override wins.
    pub fn current(&self, now: DateTime<Utc>) -> AutonomyWindow {
        if self.force_supervised.load(Ordering::Acquire) {
            return AutonomyWindow::Supervised;
        }
        self.schedule().window_at(now)
    }

    /// Set or clear the manual override. Returns the previous value.
    pub fn set_force_supervised(&self, force: bool) -> bool {
        self.force_supervised.swap(force, Ordering::AcqRel)
    }

    pub fn is_forced(&self) -> bool {
        self.force_supervised.load(Ordering::Acquire)
    }

    pub fn replace(&self, schedule: Schedule) {
        self.schedule.store(schedule.pack(), Ordering::Release);
    }

    pub fn status(&self, now: DateTime<Utc>) -> ScheduleStatus {
        ScheduleStatus {
            window: self.current(now),
            forced_supervised: self.is_forced(),
            config: self.schedule().to_config(),
        }
    }
}
