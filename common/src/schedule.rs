// Recurrence parsing and next occurrence calculation
//
// Jobs carry standard five-field cron expressions (minute precision) or the
// six/seven-field form with seconds. Expressions are evaluated in the job's
// timezone and the result is converted back to UTC.

use crate::errors::ScheduleError;
use crate::models::Recurrence;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule as CronSchedule;
use std::str::FromStr;

impl Recurrence {
    /// Check that the expression parses; the timezone is already typed
    pub fn validate(&self) -> Result<(), ScheduleError> {
        parse_cron_expression(&self.expression).map(|_| ())
    }

    /// Next occurrence strictly after `after`
    pub fn next_after(&self, after: DateTime<Utc>) -> Result<DateTime<Utc>, ScheduleError> {
        next_occurrence(self, after)
    }
}

/// Parse and validate a cron expression
pub fn parse_cron_expression(expression: &str) -> Result<CronSchedule, ScheduleError> {
    let normalized = normalize_expression(expression)?;
    CronSchedule::from_str(&normalized).map_err(|e| ScheduleError::InvalidCronExpression {
        expression: expression.to_string(),
        reason: e.to_string(),
    })
}

/// Parse a timezone name such as `Europe/Berlin`
pub fn parse_timezone(name: &str) -> Result<Tz, ScheduleError> {
    Tz::from_str(name).map_err(|_| ScheduleError::InvalidTimezone(name.to_string()))
}

/// Prefix a seconds field onto five-field expressions and renumber their
/// day-of-week field (0-7, Sunday = 0 or 7) to the 1-7, Sunday = 1 form the
/// parser expects
fn normalize_expression(expression: &str) -> Result<String, ScheduleError> {
    let fields: Vec<&str> = expression.split_whitespace().collect();
    match fields.len() {
        5 => {
            let day_of_week = normalize_day_of_week(fields[4]).map_err(|reason| {
                ScheduleError::InvalidCronExpression {
                    expression: expression.to_string(),
                    reason,
                }
            })?;
            Ok(format!("0 {} {}", fields[..4].join(" "), day_of_week))
        }
        6 | 7 => Ok(fields.join(" ")),
        n => Err(ScheduleError::InvalidCronExpression {
            expression: expression.to_string(),
            reason: format!("expected 5, 6 or 7 fields, found {n}"),
        }),
    }
}

/// Expand a five-field day-of-week into an explicit list of weekdays.
/// Wildcards and day names keep their meaning and pass through unchanged.
fn normalize_day_of_week(field: &str) -> Result<String, String> {
    if field == "*" || field == "?" || field.chars().any(|c| c.is_ascii_alphabetic()) {
        return Ok(field.to_string());
    }

    let mut days = [false; 7];
    for item in field.split(',') {
        let (range, step) = match item.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| format!("invalid day-of-week step '{step}'"))?;
                if step == 0 {
                    return Err("day-of-week step must be greater than 0".to_string());
                }
                (range, Some(step))
            }
            None => (item, None),
        };

        let (start, end) = match range {
            "*" => (0, 6),
            _ => match range.split_once('-') {
                Some((start, end)) => (parse_weekday(start)?, parse_weekday(end)?),
                // `n/step` runs from n to the end of the week
                None if step.is_some() => (parse_weekday(range)?, 6),
                None => {
                    let day = parse_weekday(range)?;
                    (day, day)
                }
            },
        };
        if start > end {
            return Err(format!("invalid day-of-week range '{range}'"));
        }

        for day in (start..=end).step_by(step.unwrap_or(1) as usize) {
            days[(day % 7) as usize] = true;
        }
    }

    let list: Vec<String> = days
        .iter()
        .enumerate()
        .filter(|(_, set)| **set)
        .map(|(day, _)| (day + 1).to_string())
        .collect();
    Ok(list.join(","))
}

fn parse_weekday(value: &str) -> Result<u32, String> {
    match value.parse::<u32>() {
        Ok(day) if day <= 7 => Ok(day),
        _ => Err(format!("invalid day of week '{value}'")),
    }
}

/// Calculate the next occurrence of `recurrence` after `after`
pub fn next_occurrence(
    recurrence: &Recurrence,
    after: DateTime<Utc>,
) -> Result<DateTime<Utc>, ScheduleError> {
    let schedule = parse_cron_expression(&recurrence.expression)?;

    // Evaluate in the job's timezone so DST shifts follow local wall time
    let reference_in_tz = after.with_timezone(&recurrence.timezone);

    let next_in_tz =
        schedule
            .after(&reference_in_tz)
            .next()
            .ok_or_else(|| ScheduleError::NoNextExecution {
                expression: recurrence.expression.clone(),
            })?;

    Ok(next_in_tz.with_timezone(&Utc))
}

/// Default timezone for jobs created without one
pub fn default_timezone() -> Tz {
    chrono_tz::UTC
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, TimeZone, Timelike, Weekday};

    #[test]
    fn test_parse_five_field_expression() {
        assert!(parse_cron_expression("0 * * * *").is_ok());
    }

    #[test]
    fn test_parse_seconds_expression() {
        assert!(parse_cron_expression("0 0 12 * * *").is_ok());
        assert!(parse_cron_expression("0 0 12 * * * *").is_ok());
    }

    #[test]
    fn test_parse_invalid_cron_expression() {
        assert!(parse_cron_expression("invalid").is_err());
        assert!(parse_cron_expression("99 * * * *").is_err());
        assert!(parse_cron_expression("").is_err());
    }

    #[test]
    fn test_parse_timezone() {
        assert_eq!(parse_timezone("Europe/Berlin").unwrap().name(), "Europe/Berlin");
        assert!(matches!(
            parse_timezone("Mars/Olympus"),
            Err(ScheduleError::InvalidTimezone(_))
        ));
    }

    #[test]
    fn test_default_timezone() {
        assert_eq!(default_timezone().name(), "UTC");
    }

    #[test]
    fn test_hourly_next_occurrence() {
        let recurrence = Recurrence::new("0 * * * *", chrono_tz::UTC);
        let from = Utc.with_ymd_and_hms(2024, 3, 1, 10, 15, 30).unwrap();
        let next = next_occurrence(&recurrence, from).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 3, 1, 11, 0, 0).unwrap());
    }

    #[test]
    fn test_next_occurrence_is_strictly_after() {
        let recurrence = Recurrence::new("0 * * * *", chrono_tz::UTC);
        let from = Utc.with_ymd_and_hms(2024, 3, 1, 11, 0, 0).unwrap();
        let next = next_occurrence(&recurrence, from).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap());
    }

    #[test]
    fn test_next_occurrence_evaluates_in_timezone() {
        // 02:00 in Ho Chi Minh City (UTC+7) is 19:00 UTC the previous day
        let recurrence = Recurrence::new("0 2 * * *", chrono_tz::Asia::Ho_Chi_Minh);
        let from = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let next = next_occurrence(&recurrence, from).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 3, 1, 19, 0, 0).unwrap());
        assert_eq!(next.hour(), 19);
    }

    #[test]
    fn test_day_of_week_uses_sunday_zero() {
        assert_eq!(normalize_day_of_week("0").unwrap(), "1");
        assert_eq!(normalize_day_of_week("7").unwrap(), "1");
        assert_eq!(normalize_day_of_week("1-5").unwrap(), "2,3,4,5,6");
        assert_eq!(normalize_day_of_week("5-7").unwrap(), "1,6,7");
        assert_eq!(normalize_day_of_week("0,6").unwrap(), "1,7");
        assert_eq!(normalize_day_of_week("*/2").unwrap(), "1,3,5,7");
        assert_eq!(normalize_day_of_week("1/3").unwrap(), "2,5");
        assert_eq!(normalize_day_of_week("MON-FRI").unwrap(), "MON-FRI");
        assert_eq!(normalize_day_of_week("*").unwrap(), "*");
    }

    #[test]
    fn test_day_of_week_rejects_out_of_range() {
        assert!(normalize_day_of_week("8").is_err());
        assert!(normalize_day_of_week("5-2").is_err());
        assert!(normalize_day_of_week("*/0").is_err());
        assert!(parse_cron_expression("0 0 * * 9").is_err());
    }

    #[test]
    fn test_weekday_placement() {
        // 2026-01-07 is a Wednesday
        let from = Utc.with_ymd_and_hms(2026, 1, 7, 12, 0, 0).unwrap();

        let monday = Recurrence::new("0 9 * * 1", chrono_tz::UTC);
        let next = monday.next_after(from).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 1, 12, 9, 0, 0).unwrap());
        assert_eq!(next.weekday(), Weekday::Mon);

        for sunday in ["0 0 * * 0", "0 0 * * 7"] {
            let recurrence = Recurrence::new(sunday, chrono_tz::UTC);
            assert!(recurrence.validate().is_ok());
            let next = recurrence.next_after(from).unwrap();
            assert_eq!(next, Utc.with_ymd_and_hms(2026, 1, 11, 0, 0, 0).unwrap());
        }

        // Friday noon: weekdays skip to Monday
        let friday = Utc.with_ymd_and_hms(2026, 1, 9, 12, 0, 0).unwrap();
        let weekdays = Recurrence::new("0 9 * * 1-5", chrono_tz::UTC);
        assert_eq!(weekdays.next_after(friday).unwrap().weekday(), Weekday::Mon);
    }

    #[test]
    fn test_recurrence_validate() {
        assert!(Recurrence::new("*/15 * * * *", chrono_tz::UTC).validate().is_ok());
        assert!(Recurrence::new("every monday", chrono_tz::UTC).validate().is_err());
    }
}
