use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Datelike, Timelike, Utc};
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use varflow_core::config::SchedulerConfig;
use varflow_core::event::EventBus;
use varflow_core::types::{EngineEvent, Frequency, ScheduleEntry};

use super::book::ScheduleBook;
use crate::orchestrator::Orchestrator;

/// Evaluates the schedule book on a fixed tick and fires due entries.
pub struct Scheduler {
    book: ScheduleBook,
    orchestrator: Arc<Mutex<Orchestrator>>,
    event_bus: Arc<EventBus>,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(
        book: ScheduleBook,
        orchestrator: Arc<Mutex<Orchestrator>>,
        event_bus: Arc<EventBus>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            book,
            orchestrator,
            event_bus,
            config,
        }
    }

    pub fn book(&self) -> &ScheduleBook {
        &self.book
    }

    /// Run the tick loop. Blocks until cancelled.
    pub async fn run(&mut self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(Duration::from_secs(self.config.tick_secs.max(1)));
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            entries = self.book.entries().count(),
            tick_secs = self.config.tick_secs,
            "Scheduler started"
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick(Utc::now()).await;
                }
                _ = cancel.cancelled() => {
                    info!("Scheduler shutting down");
                    break;
                }
            }
        }
    }

    /// One evaluation pass at `now`. Returns the scripts that fired.
    ///
    /// An entry that comes due while the orchestrator is busy is skipped for
    /// this pass. The book is saved at the end of every pass.
    pub async fn tick(&mut self, now: DateTime<Utc>) -> Vec<String> {
        let offset = self.config.utc_offset_hours;
        let mut fired = Vec::new();

        for entry in self.book.entries_mut() {
            let Some(reason) = due_reason(entry, now, offset) else {
                continue;
            };
            let Ok(mut orchestrator) = self.orchestrator.try_lock() else {
                debug!(script = %entry.script, "Orchestrator busy, skipping entry this tick");
                continue;
            };

            info!(script = %entry.script, reason, "Schedule entry fired");
            self.event_bus.publish(EngineEvent::ScheduleFired {
                script: entry.script.clone(),
                reason: reason.to_string(),
            });

            let result = orchestrator
                .resolve_and_run(&entry.script, false, self.config.force_runs)
                .await;
            drop(orchestrator);

            entry.last_run = Some(now);
            match result {
                Ok(state) if state.is_done() => entry.last_success = Some(now),
                Ok(state) => {
                    warn!(script = %entry.script, state = %state, "Scheduled run did not finish");
                }
                Err(e) => {
                    warn!(script = %entry.script, error = %e, "Scheduled run failed");
                }
            }
            fired.push(entry.script.clone());
        }

        if let Err(e) = self.book.save() {
            warn!(error = %e, "Failed to save schedule");
            self.event_bus.publish(EngineEvent::PersistenceFailed {
                message: e.to_string(),
            });
        }
        fired
    }
}

/// Why `entry` should fire at `now`, if it should.
///
/// Time of day and weekday are matched in UTC shifted by `utc_offset_hours`.
pub fn due_reason(
    entry: &ScheduleEntry,
    now: DateTime<Utc>,
    utc_offset_hours: i32,
) -> Option<&'static str> {
    let local = now.naive_utc() + chrono::Duration::hours(i64::from(utc_offset_hours));
    let same_minute_as_last = entry
        .last_run
        .is_some_and(|last| last.timestamp().div_euclid(60) == now.timestamp().div_euclid(60));
    let at_time = entry.time_of_day.is_some_and(|t| {
        t.hour() == local.hour() && t.minute() == local.minute()
    });

    let primary = match entry.frequency {
        Frequency::Daily => at_time && !same_minute_as_last,
        Frequency::Weekly => {
            at_time && !same_minute_as_last && entry.days_of_week.contains(&local.weekday())
        }
        Frequency::EveryNHours => match (entry.last_run, entry.interval_hours) {
            (None, _) => true,
            (Some(last), Some(hours)) => now - last >= chrono::Duration::hours(i64::from(hours)),
            (Some(_), None) => false,
        },
    };
    if primary {
        return Some("schedule");
    }

    if entry.retry_interval_minutes > 0 && entry.last_run_failed() {
        if let Some(last) = entry.last_run {
            let retry = chrono::Duration::minutes(i64::from(entry.retry_interval_minutes));
            if now - last >= retry {
                return Some("retry");
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveTime, TimeZone, Weekday};
    use varflow_core::types::ScriptState;
    use varflow_store::VariableStore;
    use varflow_test_utils::{descriptor, registry, MockExecutor};

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        // 2026-10-19 is a Monday.
        Utc.with_ymd_and_hms(2026, 10, 19, h, m, 0).unwrap()
    }

    fn time(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn scheduler(mock: &MockExecutor, book: ScheduleBook) -> Scheduler {
        let bus = Arc::new(EventBus::default());
        let mut orch = Orchestrator::new(Arc::new(mock.clone()), VariableStore::new(), bus.clone());
        orch.set_registry(registry(vec![
            descriptor("etl.py", &["rows"], &[]),
            descriptor("report.py", &["summary"], &["rows"]),
        ]));
        Scheduler::new(
            book,
            Arc::new(Mutex::new(orch)),
            bus,
            SchedulerConfig::default(),
        )
    }

    #[test]
    fn test_daily_matches_minute_once() {
        let mut entry = ScheduleEntry::daily("a.py", time(7, 30));
        assert_eq!(due_reason(&entry, at(7, 30), 0), Some("schedule"));
        assert_eq!(due_reason(&entry, at(7, 31), 0), None);

        entry.last_run = Some(at(7, 30));
        entry.last_success = Some(at(7, 30));
        let later_same_minute = at(7, 30) + chrono::Duration::seconds(20);
        assert_eq!(due_reason(&entry, later_same_minute, 0), None);
    }

    #[test]
    fn test_daily_with_utc_offset() {
        let entry = ScheduleEntry::daily("a.py", time(9, 0));
        assert_eq!(due_reason(&entry, at(7, 0), 2), Some("schedule"));
        assert_eq!(due_reason(&entry, at(9, 0), 2), None);
    }

    #[test]
    fn test_weekly_gated_on_weekday() {
        let entry = ScheduleEntry::weekly("a.py", time(8, 0), vec![Weekday::Mon]);
        assert_eq!(due_reason(&entry, at(8, 0), 0), Some("schedule"));
        let tuesday = at(8, 0) + chrono::Duration::days(1);
        assert_eq!(due_reason(&entry, tuesday, 0), None);
    }

    #[test]
    fn test_interval_trigger() {
        let mut entry = ScheduleEntry::every_n_hours("a.py", 4);
        let t0 = at(10, 0);
        assert_eq!(due_reason(&entry, t0, 0), Some("schedule"));

        entry.last_run = Some(t0);
        entry.last_success = Some(t0);
        assert_eq!(due_reason(&entry, t0 + chrono::Duration::minutes(9), 0), None);
        assert_eq!(
            due_reason(&entry, t0 + chrono::Duration::minutes(241), 0),
            Some("schedule")
        );
    }

    #[test]
    fn test_retry_after_failure() {
        let mut entry = ScheduleEntry::daily("a.py", time(6, 0)).with_retry(15);
        entry.last_run = Some(at(6, 0));
        assert_eq!(due_reason(&entry, at(6, 10), 0), None);
        assert_eq!(due_reason(&entry, at(6, 15), 0), Some("retry"));

        entry.last_success = Some(at(6, 0));
        assert_eq!(due_reason(&entry, at(6, 15), 0), None);
    }

    #[tokio::test]
    async fn test_tick_runs_and_records() {
        let mock = MockExecutor::new();
        let mut book = ScheduleBook::in_memory();
        book.add(ScheduleEntry::every_n_hours("report.py", 4)).unwrap();
        let mut sched = scheduler(&mock, book);

        let t0 = at(10, 0);
        assert_eq!(sched.tick(t0).await, vec!["report.py"]);
        assert_eq!(mock.executed(), vec!["etl.py", "report.py"]);

        let entry = sched.book().entries().next().unwrap().clone();
        assert_eq!(entry.last_run, Some(t0));
        assert_eq!(entry.last_success, Some(t0));

        assert!(sched.tick(t0 + chrono::Duration::minutes(9)).await.is_empty());
        assert_eq!(
            sched.tick(t0 + chrono::Duration::minutes(241)).await,
            vec!["report.py"]
        );
    }

    #[tokio::test]
    async fn test_tick_persists_book() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("schedule.json");
        let mock = MockExecutor::new();
        mock.inject_failure("etl.py", "db down");

        let mut book = ScheduleBook::load(&path).unwrap();
        book.add(ScheduleEntry::every_n_hours("report.py", 4)).unwrap();
        let mut sched = scheduler(&mock, book);
        sched.tick(at(10, 0)).await;

        let reloaded = ScheduleBook::load(&path).unwrap();
        let entry = reloaded.entries().next().unwrap();
        assert_eq!(entry.last_run, Some(at(10, 0)));
        assert_eq!(entry.last_success, None);

        mock.clear_failures();
        sched.orchestrator.lock().await.reset();
        sched.tick(at(14, 0)).await;

        let reloaded = ScheduleBook::load(&path).unwrap();
        let entry = reloaded.entries().next().unwrap();
        assert_eq!(entry.last_run, Some(at(14, 0)));
        assert_eq!(entry.last_success, Some(at(14, 0)));
    }

    #[tokio::test]
    async fn test_failed_run_leaves_success_unset() {
        let mock = MockExecutor::new();
        mock.inject_failure("etl.py", "db down");
        let mut book = ScheduleBook::in_memory();
        book.add(ScheduleEntry::every_n_hours("etl.py", 1).with_retry(5))
            .unwrap();
        let mut sched = scheduler(&mock, book);

        sched.tick(at(10, 0)).await;
        let entry = sched.book().entries().next().unwrap().clone();
        assert_eq!(entry.last_run, Some(at(10, 0)));
        assert_eq!(entry.last_success, None);
        assert!(entry.last_run_failed());

        let state = sched.orchestrator.lock().await.state("etl.py");
        assert_eq!(state, ScriptState::Error);
    }

    #[tokio::test]
    async fn test_busy_orchestrator_skips_entry() {
        let mock = MockExecutor::new();
        let mut book = ScheduleBook::in_memory();
        book.add(ScheduleEntry::every_n_hours("etl.py", 1)).unwrap();
        let mut sched = scheduler(&mock, book);

        let orchestrator = Arc::clone(&sched.orchestrator);
        let guard = orchestrator.lock().await;
        assert!(sched.tick(at(10, 0)).await.is_empty());
        drop(guard);

        assert_eq!(sched.book().entries().next().unwrap().last_run, None);
        assert_eq!(sched.tick(at(10, 1)).await, vec!["etl.py"]);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let mock = MockExecutor::new();
        let mut sched = scheduler(&mock, ScheduleBook::in_memory());
        let cancel = CancellationToken::new();
        cancel.cancel();
        sched.run(cancel).await;
    }
}
