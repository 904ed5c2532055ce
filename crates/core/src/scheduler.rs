//! Cron / interval / one-shot schedule triggers (spec §4.2).

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use chrono_tz::Tz;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::OrchestratorError;
use crate::job::JobPriority;

pub type ScheduleId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleFrequency {
    Once,
    Hourly,
    Daily,
    Weekly,
    Monthly,
    Cron,
}

#[derive(Debug, Clone)]
pub struct Schedule {
    pub id: ScheduleId,
    pub name: String,
    pub workflow_id: String,
    pub frequency: ScheduleFrequency,
    pub cron_expression: Option<String>,
    pub timezone: String,
    pub enabled: bool,
    pub priority: JobPriority,
    pub next_run: Option<DateTime<Utc>>,
    pub last_run: Option<DateTime<Utc>>,
    pub run_count: u64,
    pub success_count: u64,
}

impl Schedule {
    pub fn new(name: impl Into<String>, workflow_id: impl Into<String>, frequency: ScheduleFrequency) -> Self {
        Schedule {
            id: Uuid::new_v4(),
            name: name.into(),
            workflow_id: workflow_id.into(),
            frequency,
            cron_expression: None,
            timezone: "UTC".to_string(),
            enabled: true,
            priority: JobPriority::Normal,
            next_run: None,
            last_run: None,
            run_count: 0,
            success_count: 0,
        }
    }
}

/// Pure next-run calculation (spec §4.2: "side-effect-free"). `from_time` is
/// the baseline instant; `ONCE` schedules carry their single fire time in
/// `schedule.next_run` itself and this function simply echoes it back.
pub fn next_run_after(
    frequency: ScheduleFrequency,
    cron_expression: Option<&str>,
    timezone: &str,
    carried_next_run: Option<DateTime<Utc>>,
    from_time: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, OrchestratorError> {
    match frequency {
        ScheduleFrequency::Once => Ok(carried_next_run.filter(|t| *t > from_time)),
        ScheduleFrequency::Hourly => Ok(Some(from_time + ChronoDuration::hours(1))),
        ScheduleFrequency::Daily => Ok(Some(from_time + ChronoDuration::days(1))),
        ScheduleFrequency::Weekly => Ok(Some(from_time + ChronoDuration::weeks(1))),
        ScheduleFrequency::Monthly => Ok(Some(from_time + ChronoDuration::days(30))),
        ScheduleFrequency::Cron => {
            let expr = cron_expression.ok_or_else(|| {
                OrchestratorError::InvalidSchedule("CRON schedule has no cron expression".to_string())
            })?;
            let six_field = to_six_field(expr)?;
            let schedule = cron::Schedule::from_str(&six_field)
                .map_err(|e| OrchestratorError::InvalidSchedule(format!("invalid cron expression: {e}")))?;

            let tz: Tz = timezone
                .parse()
                .map_err(|_| OrchestratorError::InvalidSchedule(format!("invalid timezone: {timezone}")))?;
            let from_tz = from_time.with_timezone(&tz);
            Ok(schedule.after(&from_tz).next().map(|dt| dt.with_timezone(&Utc)))
        }
    }
}

/// Accepts standard 5-field (`minute hour day month weekday`) or extended
/// 6-field (`second minute hour day month weekday`) cron, per spec §4.2.
/// Any other arity is a configuration error.
fn to_six_field(expr: &str) -> Result<String, OrchestratorError> {
    let parts: Vec<&str> = expr.split_whitespace().collect();
    match parts.len() {
        5 => Ok(format!("0 {}", parts.join(" "))),
        6 => Ok(expr.to_string()),
        n => Err(OrchestratorError::InvalidSchedule(format!(
            "cron expression must have 5 or 6 fields, got {n}: {expr}"
        ))),
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Max one instance per schedule concurrently (spec §4.2 misfire policy).
    pub max_instances: u32,
    /// Missed runs coalesce into a single catch-up run within this grace.
    pub misfire_grace: ChronoDuration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            max_instances: 1,
            misfire_grace: ChronoDuration::seconds(60),
        }
    }
}

type TriggerCallback = dyn Fn(Schedule) -> Result<(), OrchestratorError> + Send + Sync;

/// Holds schedules and fires the registered callback on tick (spec §4.2).
/// The actual tick loop lives in the engine; this type is the pure
/// bookkeeping/state half so it can be unit tested without a timer.
pub struct Scheduler {
    config: SchedulerConfig,
    schedules: Mutex<HashMap<ScheduleId, Schedule>>,
    /// Schedules currently mid-fire (max_instances enforcement).
    in_flight: Mutex<HashMap<ScheduleId, ()>>,
    on_trigger: Option<Arc<TriggerCallback>>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Scheduler {
            config,
            schedules: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
            on_trigger: None,
        }
    }

    pub fn set_on_trigger<F>(&mut self, callback: F)
    where
        F: Fn(Schedule) -> Result<(), OrchestratorError> + Send + Sync + 'static,
    {
        self.on_trigger = Some(Arc::new(callback));
    }

    pub async fn add(&self, mut schedule: Schedule, now: DateTime<Utc>) -> Result<Schedule, OrchestratorError> {
        schedule.next_run = next_run_after(
            schedule.frequency,
            schedule.cron_expression.as_deref(),
            &schedule.timezone,
            schedule.next_run,
            now,
        )?;
        let id = schedule.id;
        self.schedules.lock().await.insert(id, schedule.clone());
        Ok(schedule)
    }

    pub async fn remove(&self, id: ScheduleId) -> Option<Schedule> {
        self.schedules.lock().await.remove(&id)
    }

    pub async fn update(&self, schedule: Schedule, now: DateTime<Utc>) -> Result<Schedule, OrchestratorError> {
        self.add(schedule, now).await
    }

    pub async fn set_enabled(&self, id: ScheduleId, enabled: bool) -> Result<(), OrchestratorError> {
        let mut schedules = self.schedules.lock().await;
        let schedule = schedules.get_mut(&id).ok_or_else(|| OrchestratorError::NotFound {
            kind: "schedule",
            id: id.to_string(),
        })?;
        schedule.enabled = enabled;
        Ok(())
    }

    pub async fn get(&self, id: ScheduleId) -> Option<Schedule> {
        self.schedules.lock().await.get(&id).cloned()
    }

    pub async fn get_next_runs(&self, limit: usize) -> Vec<Schedule> {
        let schedules = self.schedules.lock().await;
        let mut upcoming: Vec<Schedule> = schedules
            .values()
            .filter(|s| s.enabled && s.next_run.is_some())
            .cloned()
            .collect();
        upcoming.sort_by_key(|s| s.next_run);
        upcoming.truncate(limit);
        upcoming
    }

    /// Advance every enabled, due schedule by one tick: fire the callback
    /// (success only increments `success_count`), coalesce misfires into a
    /// single catch-up run, and skip schedules already mid-fire.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<Vec<ScheduleId>, OrchestratorError> {
        let due: Vec<Schedule> = {
            let schedules = self.schedules.lock().await;
            schedules
                .values()
                .filter(|s| s.enabled)
                .filter(|s| s.next_run.map(|t| t <= now).unwrap_or(false))
                .cloned()
                .collect()
        };

        let mut fired = Vec::new();
        for schedule in due {
            {
                let mut in_flight = self.in_flight.lock().await;
                if in_flight.contains_key(&schedule.id) {
                    continue; // max_instances = 1
                }
                in_flight.insert(schedule.id, ());
            }

            let late_by = schedule.next_run.map(|t| now - t).unwrap_or_default();
            if late_by > self.config.misfire_grace {
                tracing::warn!(
                    schedule_id = %schedule.id,
                    late_by_secs = late_by.num_seconds(),
                    "schedule missed its misfire grace, coalescing into a single catch-up fire"
                );
            }
            self.fire_one(schedule.id, now).await?;
            fired.push(schedule.id);

            self.in_flight.lock().await.remove(&schedule.id);
        }
        Ok(fired)
    }

    async fn fire_one(&self, id: ScheduleId, now: DateTime<Utc>) -> Result<(), OrchestratorError> {
        let schedule = {
            let mut schedules = self.schedules.lock().await;
            let s = schedules.get_mut(&id).ok_or_else(|| OrchestratorError::NotFound {
                kind: "schedule",
                id: id.to_string(),
            })?;
            s.last_run = Some(now);
            s.run_count += 1;
            s.clone()
        };

        let mut succeeded = true;
        if let Some(cb) = &self.on_trigger {
            if let Err(e) = cb(schedule.clone()) {
                tracing::error!(schedule_id = %id, error = %e, "schedule trigger callback failed");
                succeeded = false;
            }
        }

        let mut schedules = self.schedules.lock().await;
        if let Some(s) = schedules.get_mut(&id) {
            if succeeded {
                s.success_count += 1;
            }
            s.next_run = next_run_after(s.frequency, s.cron_expression.as_deref(), &s.timezone, s.next_run, now)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn five_field_cron_prepends_zero_seconds() {
        assert_eq!(to_six_field("*/1 * * * *").unwrap(), "0 */1 * * * *");
    }

    #[test]
    fn six_field_cron_passes_through() {
        assert_eq!(to_six_field("30 */1 * * * *").unwrap(), "30 */1 * * * *");
    }

    #[test]
    fn bad_arity_is_configuration_error() {
        assert!(to_six_field("* * *").is_err());
        assert!(to_six_field("* * * * * * *").is_err());
    }

    #[test]
    fn next_run_is_side_effect_free_and_repeatable() {
        let from = Utc::now();
        let a = next_run_after(ScheduleFrequency::Cron, Some("*/1 * * * *"), "UTC", None, from).unwrap();
        let b = next_run_after(ScheduleFrequency::Cron, Some("*/1 * * * *"), "UTC", None, from).unwrap();
        assert_eq!(a, b);
        assert!(a.unwrap() > from);
    }

    #[test]
    fn interval_frequencies_advance_by_fixed_delta() {
        let from = Utc::now();
        let hourly = next_run_after(ScheduleFrequency::Hourly, None, "UTC", None, from).unwrap();
        assert_eq!(hourly.unwrap() - from, ChronoDuration::hours(1));
        let daily = next_run_after(ScheduleFrequency::Daily, None, "UTC", None, from).unwrap();
        assert_eq!(daily.unwrap() - from, ChronoDuration::days(1));
    }

    #[tokio::test]
    async fn tick_fires_due_schedule_and_advances_next_run() {
        let mut scheduler = Scheduler::new(SchedulerConfig::default());
        let fired = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let fired_clone = fired.clone();
        scheduler.set_on_trigger(move |_s| {
            fired_clone.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        });

        let now = Utc::now();
        let mut schedule = Schedule::new("every-minute", "wf", ScheduleFrequency::Cron);
        schedule.cron_expression = Some("*/1 * * * *".to_string());
        schedule.next_run = Some(now); // force due immediately
        scheduler.schedules.lock().await.insert(schedule.id, schedule.clone());

        let firing = scheduler.tick(now).await.unwrap();
        assert_eq!(firing, vec![schedule.id]);
        assert_eq!(fired.load(std::sync::atomic::Ordering::SeqCst), 1);

        let updated = scheduler.get(schedule.id).await.unwrap();
        assert_eq!(updated.run_count, 1);
        assert_eq!(updated.success_count, 1);
        assert!(updated.next_run.unwrap() > now);
    }
}
