//! Calendar schedules — cron expression normalization and parsing.
//!
//! Expressions may carry five fields (minute-resolution) or six (with a
//! leading seconds field). Some crontab dialects write Sunday as `7`;
//! the evaluator wants `0`, so the weekday field is normalized before
//! parsing.

use croner::Cron;

use crate::error::ScheduleError;

/// Rewrite every weekday element equal to `7` into `0` (both mean
/// Sunday). Other elements, ranges, and steps pass through untouched.
#[must_use]
pub fn normalize_weekdays(expression: &str) -> String {
    let fields: Vec<&str> = expression.split_whitespace().collect();
    if fields.len() < 5 || fields.len() > 6 {
        return fields.join(" ");
    }
    let mut fields: Vec<String> = fields.into_iter().map(str::to_string).collect();
    let dow = fields.len() - 1;
    fields[dow] = fields[dow]
        .split(',')
        .map(|element| if element == "7" { "0" } else { element })
        .collect::<Vec<_>>()
        .join(",");
    fields.join(" ")
}

/// Normalize and parse a cron expression.
///
/// # Errors
///
/// Returns [`ScheduleError::InvalidCron`] when the expression does not
/// parse.
pub fn parse(expression: &str) -> Result<Cron, ScheduleError> {
    let normalized = normalize_weekdays(expression);
    Ok(Cron::new(&normalized).with_seconds_optional().parse()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn should_rewrite_weekday_seven_to_sunday() {
        assert_eq!(normalize_weekdays("0 0 * * 7"), "0 0 * * 0");
        assert_eq!(normalize_weekdays("30 4 0 0 * * 7"), "30 4 0 0 * * 7");
        assert_eq!(normalize_weekdays("0 0 0 * * 7"), "0 0 0 * * 0");
    }

    #[test]
    fn should_rewrite_seven_inside_weekday_lists() {
        assert_eq!(normalize_weekdays("0 0 * * 1,7"), "0 0 * * 1,0");
        assert_eq!(normalize_weekdays("0 0 * * 1-5"), "0 0 * * 1-5");
    }

    #[test]
    fn should_not_touch_other_fields() {
        assert_eq!(normalize_weekdays("7 7 * * 1"), "7 7 * * 1");
    }

    #[test]
    fn should_collapse_repeated_whitespace() {
        assert_eq!(normalize_weekdays("0  0 *  * 7"), "0 0 * * 0");
    }

    #[test]
    fn should_schedule_weekday_seven_like_sunday() {
        let seven = parse("0 9 * * 7").unwrap();
        let zero = parse("0 9 * * 0").unwrap();
        // A Wednesday; the next match must be the following Sunday.
        let base = Utc.with_ymd_and_hms(2026, 8, 5, 12, 0, 0).unwrap();
        let next_seven = seven.find_next_occurrence(&base, false).unwrap();
        let next_zero = zero.find_next_occurrence(&base, false).unwrap();
        assert_eq!(next_seven, next_zero);
        assert_eq!(
            next_seven,
            Utc.with_ymd_and_hms(2026, 8, 9, 9, 0, 0).unwrap()
        );
    }

    #[test]
    fn should_accept_six_field_expressions_with_seconds() {
        let cron = parse("30 0 9 * * *").unwrap();
        let base = Utc.with_ymd_and_hms(2026, 8, 5, 12, 0, 0).unwrap();
        let next = cron.find_next_occurrence(&base, false).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 8, 6, 9, 0, 30).unwrap());
    }

    #[test]
    fn should_reject_malformed_expressions() {
        assert!(matches!(parse("not a cron"), Err(ScheduleError::InvalidCron(_))));
        assert!(matches!(parse("0 25 * * *"), Err(ScheduleError::InvalidCron(_))));
    }
}
