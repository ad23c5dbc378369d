//! Schedules — recurring cron triggers and self-rescheduling solar
//! (astro) events, run as cancellable tasks.

use std::time::Duration;

use chrono::{DateTime, Days, Local, NaiveDate, TimeZone, Utc};
use tokio::task::AbortHandle;
use tracing::{debug, error, warn};

use rulehub_domain::astro::{self, AstroEvent};
use rulehub_domain::cron;
use rulehub_domain::error::{ConfigError, RuleHubError, ScheduleError};
use rulehub_domain::id::{RuleId, ScheduleId};

use crate::engine::{Engine, lock};
use crate::ports::StateStore;

/// Settle delay between an astro firing and the recomputation of the
/// next occurrence, so the just-passed time is not matched again.
const ASTRO_SETTLE: Duration = Duration::from_secs(2);

/// What kind of schedule an entry runs.
#[derive(Debug, Clone)]
pub enum ScheduleKind {
    Cron(String),
    Astro { event: AstroEvent, shift_minutes: i64 },
}

/// One live schedule and its cancellation handle.
pub(crate) struct ScheduleEntry {
    pub id: ScheduleId,
    pub owner: RuleId,
    pub kind: ScheduleKind,
    pub abort: AbortHandle,
}

/// Where the next astro arming point lies.
enum AstroArm {
    /// Sleep to this time and fire.
    Fire(DateTime<Local>),
    /// Today's occurrence already passed; sleep to shortly after
    /// midnight and recompute without firing.
    Restart(DateTime<Local>),
}

impl<S: StateStore> Engine<S> {
    /// Register a recurring cron schedule for a rule.
    ///
    /// Five- or six-field expressions (optional leading seconds);
    /// weekday `7` is normalized to `0` before parsing. The callback
    /// runs on every firing; its errors are reported and never cancel
    /// the schedule.
    ///
    /// # Errors
    ///
    /// [`ScheduleError::InvalidCron`] for unparsable expressions.
    pub fn schedule_cron<F>(
        &self,
        owner: &RuleId,
        expression: &str,
        mut callback: F,
    ) -> Result<ScheduleId, RuleHubError>
    where
        F: FnMut() -> Result<(), RuleHubError> + Send + 'static,
    {
        let schedule = cron::parse(expression)?;
        let id = ScheduleId::new();
        let task = tokio::spawn(async move {
            loop {
                let now = Local::now();
                let next = match schedule.find_next_occurrence(&now, false) {
                    Ok(next) => next,
                    Err(err) => {
                        warn!(schedule = %id, error = %err, "no further cron occurrence");
                        break;
                    }
                };
                sleep_until(next).await;
                if let Err(err) = callback() {
                    error!(schedule = %id, error = %err, "error in cron callback");
                }
            }
        });
        debug!(schedule = %id, owner = %owner, expression, "cron schedule armed");
        lock(&self.schedules).push(ScheduleEntry {
            id,
            owner: owner.clone(),
            kind: ScheduleKind::Cron(expression.to_string()),
            abort: task.abort_handle(),
        });
        Ok(id)
    }

    /// Register a self-rescheduling astro schedule for a rule.
    ///
    /// Fires at the event's computed time each day, substituting the
    /// end-of-day fallback on days without an occurrence, and skips to
    /// the next day when today's time already passed. Runs until
    /// [`Engine::clear_schedule`] or rule teardown.
    ///
    /// # Errors
    ///
    /// [`ConfigError::MissingCoordinates`] when latitude/longitude are
    /// unset — the schedule is not created.
    pub fn schedule_astro<F>(
        &self,
        owner: &RuleId,
        event: AstroEvent,
        shift_minutes: i64,
        mut callback: F,
    ) -> Result<ScheduleId, RuleHubError>
    where
        F: FnMut() -> Result<(), RuleHubError> + Send + 'static,
    {
        let Some((latitude, longitude)) = self.config.coordinates() else {
            error!("latitude or longitude is not configured, cannot use astro");
            return Err(ConfigError::MissingCoordinates.into());
        };
        let id = ScheduleId::new();
        let task = tokio::spawn(async move {
            loop {
                match next_astro_arm(event, shift_minutes, latitude, longitude, Local::now()) {
                    AstroArm::Fire(at) => {
                        sleep_until(at).await;
                        if let Err(err) = callback() {
                            error!(schedule = %id, error = %err, "error in astro callback");
                        }
                        tokio::time::sleep(ASTRO_SETTLE).await;
                    }
                    AstroArm::Restart(at) => sleep_until(at).await,
                }
            }
        });
        debug!(schedule = %id, owner = %owner, %event, shift_minutes, "astro schedule armed");
        lock(&self.schedules).push(ScheduleEntry {
            id,
            owner: owner.clone(),
            kind: ScheduleKind::Astro {
                event,
                shift_minutes,
            },
            abort: task.abort_handle(),
        });
        Ok(id)
    }

    /// Cancel a schedule by its handle. A firing already in flight
    /// completes; no further firing occurs. Returns whether the handle
    /// was known.
    pub fn clear_schedule(&self, handle: ScheduleId) -> bool {
        let mut schedules = lock(&self.schedules);
        match schedules.iter().position(|entry| entry.id == handle) {
            Some(pos) => {
                let entry = schedules.remove(pos);
                entry.abort.abort();
                debug!(schedule = %handle, "schedule cleared");
                true
            }
            None => {
                warn!(schedule = %handle, "clear_schedule: unknown handle");
                false
            }
        }
    }

    /// Number of live schedules owned by a rule.
    #[must_use]
    pub fn schedule_count(&self, owner: &RuleId) -> usize {
        self.schedules_of(owner).len()
    }

    /// Live schedules owned by a rule, for introspection.
    #[must_use]
    pub fn schedules_of(&self, owner: &RuleId) -> Vec<(ScheduleId, ScheduleKind)> {
        lock(&self.schedules)
            .iter()
            .filter(|entry| entry.owner == *owner)
            .map(|entry| (entry.id, entry.kind.clone()))
            .collect()
    }

    /// Compute the (optionally offset) time of an astro event.
    ///
    /// Event names are matched case-insensitively against the fixed
    /// vocabulary; `date` defaults to now.
    ///
    /// # Errors
    ///
    /// [`ScheduleError::UnknownAstroEvent`] for names outside the
    /// vocabulary, [`ConfigError::MissingCoordinates`] without
    /// configured coordinates, and [`ScheduleError::NoOccurrence`] when
    /// the event does not happen on that date.
    pub fn get_astro_date(
        &self,
        name: &str,
        date: Option<DateTime<Local>>,
        offset_minutes: Option<i64>,
    ) -> Result<DateTime<Local>, RuleHubError> {
        let event: AstroEvent = name.parse()?;
        let Some((latitude, longitude)) = self.config.coordinates() else {
            error!("latitude or longitude is not configured, cannot use astro");
            return Err(ConfigError::MissingCoordinates.into());
        };
        let date = date.unwrap_or_else(Local::now);
        let computed = times_for_local_date(date, latitude, longitude)
            .get(event)
            .ok_or(ScheduleError::NoOccurrence(event))?;
        let mut result = computed.with_timezone(&Local);
        if let Some(offset) = offset_minutes {
            result += chrono::Duration::minutes(offset);
        }
        Ok(result)
    }

    /// Whether the current time lies within `[sunrise, sunset)`.
    ///
    /// # Errors
    ///
    /// Same conditions as [`Engine::get_astro_date`].
    pub fn is_astro_day(&self) -> Result<bool, RuleHubError> {
        let now = Local::now();
        let sunrise = self.get_astro_date("sunrise", Some(now), None)?;
        let sunset = self.get_astro_date("sunset", Some(now), None)?;
        Ok(now >= sunrise && now < sunset)
    }

    /// Tear down everything a rule owns: schedules are aborted and
    /// subscriptions removed (releasing their store-level patterns).
    /// Delayed writes are keyed by target id, not owner, and stay.
    pub async fn stop_rule(&self, owner: &RuleId) {
        let schedules: Vec<ScheduleEntry> = {
            let mut table = lock(&self.schedules);
            let mut kept = Vec::with_capacity(table.len());
            let mut removed = Vec::new();
            for entry in table.drain(..) {
                if entry.owner == *owner {
                    removed.push(entry);
                } else {
                    kept.push(entry);
                }
            }
            *table = kept;
            removed
        };
        let schedule_count = schedules.len();
        for entry in &schedules {
            entry.abort.abort();
        }

        let mut subscription_count = 0;
        loop {
            let handle = lock(&self.registry)
                .entries
                .iter()
                .find(|entry| entry.owner == *owner)
                .map(|entry| entry.id);
            match handle {
                Some(handle) => {
                    self.unsubscribe(handle).await;
                    subscription_count += 1;
                }
                None => break,
            }
        }
        debug!(
            rule = %owner,
            schedules = schedule_count,
            subscriptions = subscription_count,
            "rule torn down"
        );
    }
}

/// Solar event times for the calendar day of `date`, anchored to its
/// local noon so the result never drifts into the neighboring day.
fn times_for_local_date(date: DateTime<Local>, latitude: f64, longitude: f64) -> astro::SunTimes {
    let noon = date
        .date_naive()
        .and_hms_opt(12, 0, 0)
        .and_then(|naive| Local.from_local_datetime(&naive).earliest())
        .unwrap_or(date);
    astro::sun_times(noon.with_timezone(&Utc), latitude, longitude)
}

/// Compute the next arming point for an astro request.
fn next_astro_arm(
    event: AstroEvent,
    shift_minutes: i64,
    latitude: f64,
    longitude: f64,
    now: DateTime<Local>,
) -> AstroArm {
    let computed = times_for_local_date(now, latitude, longitude).get(event);
    let at = match computed {
        Some(time) => time.with_timezone(&Local),
        None => {
            warn!(%event, latitude, longitude, "cannot calculate astro event, using end-of-day fallback");
            fallback_time(event, now.date_naive(), now)
        }
    };
    // The offset applies after fallback substitution.
    let at = at + chrono::Duration::minutes(shift_minutes);
    if at <= now {
        AstroArm::Restart(next_day_restart(now))
    } else {
        AstroArm::Fire(at)
    }
}

/// 23:59:59 local for end-of-day events, 23:59:58 for the rest, so the
/// "end" events keep their relative order on fallback days.
fn fallback_time(event: AstroEvent, date: NaiveDate, default: DateTime<Local>) -> DateTime<Local> {
    let second = if event.is_end_of_day() { 59 } else { 58 };
    date.and_hms_opt(23, 59, second)
        .and_then(|naive| Local.from_local_datetime(&naive).earliest())
        .unwrap_or(default)
}

/// 00:01 local the next day — not midnight exactly, to stay clear of
/// day-boundary ambiguity.
fn next_day_restart(now: DateTime<Local>) -> DateTime<Local> {
    let tomorrow = now.date_naive() + Days::new(1);
    tomorrow
        .and_hms_opt(0, 1, 0)
        .and_then(|naive| Local.from_local_datetime(&naive).earliest())
        .unwrap_or(now + chrono::Duration::days(1))
}

async fn sleep_until(at: DateTime<Local>) {
    let wait = (at - Local::now()).to_std().unwrap_or(Duration::ZERO);
    tokio::time::sleep(wait).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{counter_fn, engine_with, engine_without_coordinates};
    use chrono::Timelike;

    #[tokio::test]
    async fn should_reject_astro_schedule_without_coordinates() {
        let engine = engine_without_coordinates();
        let result =
            engine.schedule_astro(&"rule.test".into(), AstroEvent::Sunrise, 0, || Ok(()));
        assert!(matches!(
            result,
            Err(RuleHubError::Config(ConfigError::MissingCoordinates))
        ));
        // No schedule entry was created.
        assert_eq!(engine.schedule_count(&"rule.test".into()), 0);
    }

    #[tokio::test]
    async fn should_reject_invalid_cron_expression() {
        let engine = engine_with(vec![], vec![]);
        let result = engine.schedule_cron(&"rule.test".into(), "61 * * * *", || Ok(()));
        assert!(matches!(
            result,
            Err(RuleHubError::Schedule(ScheduleError::InvalidCron(_)))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn should_fire_cron_schedule_and_survive_callback_errors() {
        let engine = engine_with(vec![], vec![]);
        let (count, calls) = counter_fn();
        engine
            .schedule_cron(&"rule.test".into(), "* * * * * *", move || {
                calls();
                Err(ConfigError::NotCached.into())
            })
            .unwrap();

        tokio::time::sleep(Duration::from_millis(3500)).await;
        // Fires every second; errors do not cancel the schedule.
        assert!(count() >= 2, "fired {} times", count());
    }

    #[tokio::test(start_paused = true)]
    async fn should_stop_firing_after_clear_schedule() {
        let engine = engine_with(vec![], vec![]);
        let (count, calls) = counter_fn();
        let handle = engine
            .schedule_cron(&"rule.test".into(), "* * * * * *", move || {
                calls();
                Ok(())
            })
            .unwrap();

        tokio::time::sleep(Duration::from_millis(1500)).await;
        let fired = count();
        assert!(fired >= 1);

        assert!(engine.clear_schedule(handle));
        assert!(!engine.clear_schedule(handle));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(count(), fired);
    }

    #[tokio::test]
    async fn should_list_schedules_by_owner() {
        let engine = engine_with(vec![], vec![]);
        let owner: RuleId = "rule.test".into();
        engine.schedule_cron(&owner, "0 9 * * *", || Ok(())).unwrap();
        engine
            .schedule_astro(&owner, AstroEvent::Sunset, -10, || Ok(()))
            .unwrap();

        let schedules = engine.schedules_of(&owner);
        assert_eq!(schedules.len(), 2);
        assert!(matches!(schedules[0].1, ScheduleKind::Cron(ref expr) if expr == "0 9 * * *"));
        assert!(matches!(
            schedules[1].1,
            ScheduleKind::Astro {
                event: AstroEvent::Sunset,
                shift_minutes: -10
            }
        ));
    }

    #[tokio::test]
    async fn should_tear_down_everything_a_rule_owns() {
        let engine = engine_with(vec![], vec![]);
        let owner: RuleId = "rule.test".into();
        engine.schedule_cron(&owner, "0 9 * * *", || Ok(())).unwrap();
        engine.schedule_cron(&owner, "0 21 * * *", || Ok(())).unwrap();
        engine.subscribe("hm.0.light", &owner, |_| Ok(())).await.unwrap();

        engine.stop_rule(&owner).await;
        assert_eq!(engine.schedule_count(&owner), 0);
        assert!(engine.subscriptions().is_empty());
    }

    #[test]
    fn should_compute_offset_astro_dates() {
        let engine = engine_with(vec![], vec![]);
        let date = Local.with_ymd_and_hms(2026, 6, 21, 12, 0, 0).unwrap();
        let sunrise = engine.get_astro_date("sunrise", Some(date), None).unwrap();
        let shifted = engine.get_astro_date("SunRise", Some(date), Some(30)).unwrap();
        assert_eq!(shifted - sunrise, chrono::Duration::minutes(30));
    }

    #[test]
    fn should_answer_is_astro_day_with_coordinates() {
        let engine = engine_with(vec![], vec![]);
        // Berlin always has a sunrise and a sunset, so the window
        // comparison itself must succeed whatever the current time.
        assert!(engine.is_astro_day().is_ok());
    }

    #[test]
    fn should_reject_unknown_astro_event_names() {
        let engine = engine_with(vec![], vec![]);
        let result = engine.get_astro_date("blueHour", None, None);
        assert!(matches!(
            result,
            Err(RuleHubError::Schedule(ScheduleError::UnknownAstroEvent(_)))
        ));
    }

    #[test]
    fn should_reject_astro_date_without_coordinates() {
        let engine = engine_without_coordinates();
        let result = engine.get_astro_date("sunrise", None, None);
        assert!(matches!(
            result,
            Err(RuleHubError::Config(ConfigError::MissingCoordinates))
        ));
    }

    #[test]
    fn should_restart_tomorrow_when_todays_event_passed() {
        // 23:30 local is after every computed sunset at Berlin
        // coordinates, whatever the date.
        let now = Local.with_ymd_and_hms(2026, 6, 21, 23, 30, 0).unwrap();
        let arm = next_astro_arm(AstroEvent::Sunset, 0, 52.52, 13.405, now);
        match arm {
            AstroArm::Restart(at) => {
                assert_eq!(at.date_naive(), now.date_naive() + Days::new(1));
                assert_eq!((at.hour(), at.minute()), (0, 1));
            }
            AstroArm::Fire(at) => panic!("expected restart, got fire at {at}"),
        }
    }

    #[test]
    fn should_arm_fire_when_todays_event_is_ahead() {
        let now = Local.with_ymd_and_hms(2026, 6, 21, 3, 0, 0).unwrap();
        let arm = next_astro_arm(AstroEvent::Sunset, 0, 52.52, 13.405, now);
        match arm {
            AstroArm::Fire(at) => assert!(at > now),
            AstroArm::Restart(at) => panic!("expected fire, got restart at {at}"),
        }
    }

    #[test]
    fn should_order_fallback_times_with_end_events_last() {
        let date = NaiveDate::from_ymd_opt(2026, 6, 21).unwrap();
        let default = Local.with_ymd_and_hms(2026, 6, 21, 12, 0, 0).unwrap();
        let end = fallback_time(AstroEvent::Sunset, date, default);
        let generic = fallback_time(AstroEvent::Sunrise, date, default);
        assert_eq!(end - generic, chrono::Duration::seconds(1));
        assert_eq!((end.hour(), end.minute(), end.second()), (23, 59, 59));
    }
}
