use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conductor_core::{
    ConductorError, ConductorResult, Execution, ExecutionState, ExecutionTrigger, Workflow,
};
use cron::Schedule;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info, warn};

/// Callback the scheduler invokes for every due occurrence.
#[async_trait]
pub trait WorkflowLauncher: Send + Sync {
    /// Start one run of the workflow and wait for it.
    async fn launch(
        &self,
        workflow_id: &str,
        trigger: ExecutionTrigger,
    ) -> ConductorResult<Execution>;
}

/// Scheduler tuning.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Immediate re-runs of a failed scheduled occurrence. `0` means the
    /// workflow only runs again at its next natural occurrence.
    #[serde(default)]
    pub retry_failed_runs: u32,
}

/// A parsed trigger expression.
///
/// Standard cron fires when *either* day field matches if both day-of-month
/// and day-of-week are restricted. Such expressions hold one schedule per day
/// field and fire at the earlier of the two.
#[derive(Debug, Clone)]
pub struct TriggerSchedule {
    schedules: Vec<Schedule>,
}

impl TriggerSchedule {
    /// First occurrence strictly after `after`.
    pub fn next_after(&self, after: &DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedules
            .iter()
            .filter_map(|schedule| schedule.after(after).next())
            .min()
    }
}

struct ActiveTrigger {
    expression: String,
    schedule: TriggerSchedule,
    handle: JoinHandle<()>,
}

/// Wall clock of one trigger loop, advanced by the tokio monotonic clock from
/// the moment the trigger was installed.
#[derive(Debug, Clone, Copy)]
struct TriggerClock {
    wall: DateTime<Utc>,
    mono: Instant,
}

impl TriggerClock {
    fn system() -> Self {
        Self::anchored(Utc::now())
    }

    fn anchored(wall: DateTime<Utc>) -> Self {
        Self {
            wall,
            mono: Instant::now(),
        }
    }

    fn now(&self) -> DateTime<Utc> {
        let elapsed = chrono::Duration::from_std(self.mono.elapsed())
            .unwrap_or_else(|_| chrono::Duration::zero());
        self.wall + elapsed
    }

    async fn sleep_until(&self, at: DateTime<Utc>) {
        let wait = (at - self.now()).to_std().unwrap_or_default();
        tokio::time::sleep(wait).await;
    }
}

/// Holds at most one recurring trigger per workflow and fires the launcher
/// at each due time, evaluated in UTC.
///
/// Each occurrence is launched on its own task so a slow or failing run never
/// delays the timer. Missed occurrences are not caught up.
pub struct Scheduler {
    triggers: Mutex<HashMap<String, ActiveTrigger>>,
    launcher: Arc<dyn WorkflowLauncher>,
    config: SchedulerConfig,
}

impl Scheduler {
    /// Create a scheduler that fires `launcher` for every due occurrence.
    pub fn new(launcher: Arc<dyn WorkflowLauncher>, config: SchedulerConfig) -> Self {
        Self {
            triggers: Mutex::new(HashMap::new()),
            launcher,
            config,
        }
    }

    /// Translate a trigger expression into the 6/7-field forms the `cron`
    /// crate parses.
    ///
    /// Standard five-field expressions (`minute hour day month weekday`) get a
    /// zero seconds field and numeric weekdays (`0`-`7`, Sunday = 0 or 7) are
    /// expanded to day names. When both day fields are restricted the result
    /// holds two expressions, one per day field. Six and seven field
    /// expressions pass through unchanged.
    pub fn normalize_expression(expression: &str) -> ConductorResult<Vec<String>> {
        let fields: Vec<&str> = expression.split_whitespace().collect();
        match fields.len() {
            5 => {
                let invalid = |reason: String| ConductorError::InvalidScheduleExpression {
                    expression: expression.to_string(),
                    reason,
                };
                let (minute, hour, dom, month) = (fields[0], fields[1], fields[2], fields[3]);
                let dow = weekday_names(fields[4]).map_err(invalid)?;
                if is_restricted(dom) && is_restricted(fields[4]) {
                    Ok(vec![
                        format!("0 {minute} {hour} {dom} {month} *"),
                        format!("0 {minute} {hour} * {month} {dow}"),
                    ])
                } else {
                    Ok(vec![format!("0 {minute} {hour} {dom} {month} {dow}")])
                }
            }
            6 | 7 => Ok(vec![fields.join(" ")]),
            n => Err(ConductorError::InvalidScheduleExpression {
                expression: expression.to_string(),
                reason: format!("expected 5 fields, found {n}"),
            }),
        }
    }

    /// Parse a trigger expression into a [`TriggerSchedule`].
    pub fn parse(expression: &str) -> ConductorResult<TriggerSchedule> {
        let schedules = Self::normalize_expression(expression)?
            .iter()
            .map(|normalized| {
                Schedule::from_str(normalized).map_err(|e| {
                    ConductorError::InvalidScheduleExpression {
                        expression: expression.to_string(),
                        reason: e.to_string(),
                    }
                })
            })
            .collect::<ConductorResult<Vec<_>>>()?;
        Ok(TriggerSchedule { schedules })
    }

    /// First occurrence of `expression` strictly after `after`.
    pub fn next_fire_time(
        expression: &str,
        after: DateTime<Utc>,
    ) -> ConductorResult<DateTime<Utc>> {
        Self::parse(expression)?
            .next_after(&after)
            .ok_or_else(|| ConductorError::InvalidScheduleExpression {
                expression: expression.to_string(),
                reason: "no upcoming fire times".to_string(),
            })
    }

    /// Install the workflow's trigger, replacing any existing one.
    ///
    /// An unparseable expression leaves the current trigger in place.
    pub fn schedule(&self, workflow: &Workflow) -> ConductorResult<()> {
        let expression = workflow
            .trigger
            .as_deref()
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| ConductorError::InvalidScheduleExpression {
                expression: String::new(),
                reason: format!("workflow '{}' has no trigger", workflow.id),
            })?;
        let schedule = Self::parse(expression)?;

        let handle = tokio::spawn(run_trigger(
            workflow.id.clone(),
            schedule.clone(),
            TriggerClock::system(),
            self.launcher.clone(),
            self.config.retry_failed_runs,
        ));

        let previous = self.triggers.lock().insert(
            workflow.id.clone(),
            ActiveTrigger {
                expression: expression.to_string(),
                schedule,
                handle,
            },
        );
        if let Some(previous) = previous {
            previous.handle.abort();
            info!(workflow_id = %workflow.id, "Scheduler: replaced existing trigger");
        }
        info!(workflow_id = %workflow.id, expression, "Scheduler: trigger installed");
        Ok(())
    }

    /// Stop and remove a workflow's trigger. Returns false if there was none.
    pub fn unschedule(&self, workflow_id: &str) -> bool {
        match self.triggers.lock().remove(workflow_id) {
            Some(trigger) => {
                trigger.handle.abort();
                info!(workflow_id, "Scheduler: trigger removed");
                true
            }
            None => false,
        }
    }

    /// True while a trigger is installed for the workflow.
    pub fn is_scheduled(&self, workflow_id: &str) -> bool {
        self.triggers.lock().contains_key(workflow_id)
    }

    /// Expression of the live trigger for a workflow.
    pub fn scheduled_expression(&self, workflow_id: &str) -> Option<String> {
        self.triggers
            .lock()
            .get(workflow_id)
            .map(|t| t.expression.clone())
    }

    /// Ids of every scheduled workflow, sorted.
    pub fn scheduled_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.triggers.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Number of installed triggers.
    pub fn trigger_count(&self) -> usize {
        self.triggers.lock().len()
    }

    /// Next due time of a workflow's live trigger.
    pub fn next_fire(&self, workflow_id: &str) -> Option<DateTime<Utc>> {
        self.triggers
            .lock()
            .get(workflow_id)
            .and_then(|t| t.schedule.next_after(&Utc::now()))
    }

    /// Abort every trigger.
    pub fn shutdown(&self) {
        for (_, trigger) in self.triggers.lock().drain() {
            trigger.handle.abort();
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Timer loop for one workflow.
async fn run_trigger(
    workflow_id: String,
    schedule: TriggerSchedule,
    clock: TriggerClock,
    launcher: Arc<dyn WorkflowLauncher>,
    retries: u32,
) {
    let mut last_fired: Option<DateTime<Utc>> = None;
    loop {
        // Never compute from before the last fire time, so an early wake-up
        // cannot fire the same occurrence twice.
        let now = clock.now();
        let from = match last_fired {
            Some(last) if last > now => last,
            _ => now,
        };
        let Some(next) = schedule.next_after(&from) else {
            warn!(workflow_id = %workflow_id, "Scheduler: no upcoming fire times, trigger stopped");
            return;
        };

        clock.sleep_until(next).await;
        last_fired = Some(next);

        info!(workflow_id = %workflow_id, fire_time = %next, "Scheduler: firing workflow");
        tokio::spawn(launch_with_retries(
            workflow_id.clone(),
            launcher.clone(),
            retries,
        ));
    }
}

async fn launch_with_retries(workflow_id: String, launcher: Arc<dyn WorkflowLauncher>, retries: u32) {
    for attempt in 0..=retries {
        match launcher
            .launch(&workflow_id, ExecutionTrigger::Scheduled)
            .await
        {
            Ok(execution) if execution.state == ExecutionState::Completed => return,
            Ok(execution) => {
                warn!(
                    workflow_id = %workflow_id,
                    execution_id = %execution.id,
                    attempt,
                    "Scheduler: scheduled run failed"
                );
            }
            Err(e) => {
                error!(
                    workflow_id = %workflow_id,
                    attempt,
                    error = %e,
                    "Scheduler: failed to launch workflow"
                );
            }
        }
    }
}

/// A day field other than `*` or `?` restricts the days a trigger fires on.
fn is_restricted(field: &str) -> bool {
    !(field.starts_with('*') || field == "?")
}

/// Expand a numeric day-of-week field (`0`-`7`, ranges, lists, steps) to the
/// day names the `cron` crate accepts. Named items pass through.
fn weekday_names(field: &str) -> Result<String, String> {
    const NAMES: [&str; 7] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];
    if field == "*" || field == "?" {
        return Ok(field.to_string());
    }

    let mut days = [false; 7];
    let mut named = Vec::new();
    for item in field.split(',') {
        if item.chars().any(|c| c.is_ascii_alphabetic()) {
            named.push(item.to_string());
            continue;
        }
        let (range, step) = match item.split_once('/') {
            Some((range, step)) => {
                let step = step
                    .parse::<usize>()
                    .ok()
                    .filter(|s| *s > 0)
                    .ok_or_else(|| format!("invalid weekday step in '{item}'"))?;
                (range, Some(step))
            }
            None => (item, None),
        };
        let weekday = |value: &str| {
            value
                .parse::<usize>()
                .ok()
                .filter(|d| *d <= 7)
                .ok_or_else(|| format!("invalid weekday '{value}'"))
        };
        let (low, high) = match range {
            "*" => (0, 6),
            _ => match range.split_once('-') {
                Some((low, high)) => (weekday(low)?, weekday(high)?),
                None if step.is_some() => (weekday(range)?, 7),
                None => {
                    let day = weekday(range)?;
                    (day, day)
                }
            },
        };
        if low > high {
            return Err(format!("weekday range '{range}' is reversed"));
        }
        for day in (low..=high).step_by(step.unwrap_or(1)) {
            days[day % 7] = true;
        }
    }

    let mut out: Vec<String> = NAMES
        .iter()
        .zip(days)
        .filter(|(_, set)| *set)
        .map(|(name, _)| (*name).to_string())
        .collect();
    out.extend(named);
    Ok(out.join(","))
}
