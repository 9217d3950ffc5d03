//! Trigger definitions and next-run computation.
//!
//! The engine never schedules itself; these helpers turn a job's trigger into
//! the cron expression handed to the external trigger subsystem and into the
//! `next_run_at` timestamp recorded after each invocation.

use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use cron::Schedule;
use serde::{Deserialize, Serialize};

use crate::error::{ArchiveError, Result};

/// Minutes in a day; intervals at or beyond this map to a daily cron.
const MINUTES_PER_DAY: u32 = 1440;

/// When a job fires: a fixed interval, a cron expression, or both (cron wins).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Trigger {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_minutes: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron_expression: Option<String>,
}

impl Trigger {
    pub fn interval(minutes: u32) -> Self {
        Self {
            interval_minutes: Some(minutes),
            cron_expression: None,
        }
    }

    pub fn cron(expression: impl Into<String>) -> Self {
        Self {
            interval_minutes: None,
            cron_expression: Some(expression.into()),
        }
    }

    /// Exactly one trigger kind must be usable; both present is accepted.
    ///
    /// A cron expression must also fire at least once after now.
    pub fn validate(&self) -> Result<()> {
        self.validate_syntax()?;
        if let Some(expr) = self.cron_expr() {
            if parse_cron(expr)?.upcoming(Utc).next().is_none() {
                return Err(no_future_occurrence(expr));
            }
        }
        Ok(())
    }

    /// Structural checks only; used when reloading persisted jobs whose
    /// cron may have expired since they were stored.
    pub fn validate_syntax(&self) -> Result<()> {
        let cron = self
            .cron_expression
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty());

        match (self.interval_minutes, cron) {
            (None, None) => Err(ArchiveError::Config(
                "either interval_minutes or cron_expression is required".into(),
            )),
            (Some(0), _) => Err(ArchiveError::Config(
                "interval_minutes must be at least 1".into(),
            )),
            (_, Some(expr)) => parse_cron(expr).map(|_| ()),
            (Some(_), None) => Ok(()),
        }
    }

    fn cron_expr(&self) -> Option<&str> {
        self.cron_expression
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
    }

    /// The cron expression the external trigger subsystem should register.
    pub fn effective_cron(&self) -> Result<String> {
        if let Some(expr) = self.cron_expr() {
            return Ok(expr.to_string());
        }
        match self.interval_minutes {
            Some(minutes) if minutes > 0 => Ok(interval_to_cron(minutes)),
            _ => Err(ArchiveError::Config("job has no usable trigger".into())),
        }
    }

    /// Next firing strictly after `now`.
    pub fn next_after(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
        if let Some(expr) = self.cron_expr() {
            let schedule = parse_cron(expr)?;
            return schedule
                .after(&now)
                .next()
                .ok_or_else(|| no_future_occurrence(expr));
        }
        match self.interval_minutes {
            Some(minutes) if minutes > 0 => Ok(now + Duration::minutes(i64::from(minutes))),
            _ => Err(ArchiveError::Config("job has no usable trigger".into())),
        }
    }
}

fn no_future_occurrence(expression: &str) -> ArchiveError {
    ArchiveError::Cron {
        expression: expression.to_string(),
        message: "expression has no future occurrence".into(),
    }
}

/// Map an interval to the 5-field cron used when no expression is configured.
///
/// 1 → every minute; below 60 → every N minutes; 60 → hourly; below a day →
/// every N/60 hours; anything longer → daily at midnight.
pub fn interval_to_cron(minutes: u32) -> String {
    match minutes {
        0 | 1 => "* * * * *".to_string(),
        m if m < 60 => format!("*/{} * * * *", m),
        60 => "0 * * * *".to_string(),
        m if m < MINUTES_PER_DAY => format!("0 */{} * * *", m / 60),
        _ => "0 0 * * *".to_string(),
    }
}

/// Parse a 5-field (minute-resolution) or 6/7-field (seconds) cron expression.
pub fn parse_cron(expression: &str) -> Result<Schedule> {
    let normalized = normalize_cron(expression);
    Schedule::from_str(&normalized).map_err(|e| ArchiveError::Cron {
        expression: expression.to_string(),
        message: e.to_string(),
    })
}

/// The `cron` crate expects a seconds field and numbers weekdays 1-7 from
/// Sunday. Classic 5-field expressions get a seconds field and their
/// numeric weekdays (0-7, both 0 and 7 meaning Sunday) rewritten as names.
fn normalize_cron(expression: &str) -> String {
    let fields: Vec<&str> = expression.split_whitespace().collect();
    if fields.len() == 5 {
        format!(
            "0 {} {} {} {} {}",
            fields[0],
            fields[1],
            fields[2],
            fields[3],
            classic_weekdays(fields[4])
        )
    } else {
        fields.join(" ")
    }
}

const WEEKDAYS: [&str; 8] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT", "SUN"];

/// Rewrite numeric weekdays in lists, ranges and steps; names pass through.
fn classic_weekdays(field: &str) -> String {
    field
        .split(',')
        .map(|part| {
            let (range, step) = match part.split_once('/') {
                Some((range, step)) => (range, Some(step)),
                None => (part, None),
            };
            let range = match range.split_once('-') {
                // a range ending on 7 ends on Sunday, which starts the week here
                Some((from, "7")) if step.is_none() && from != "0" && from != "7" => {
                    format!("{}-SAT,SUN", weekday_name(from))
                }
                Some((from, "7")) if from == "0" => "SUN-SAT".to_string(),
                Some((from, to)) => format!("{}-{}", weekday_name(from), weekday_name(to)),
                None => weekday_name(range).to_string(),
            };
            match step {
                Some(step) => format!("{}/{}", range, step),
                None => range,
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}

fn weekday_name(value: &str) -> &str {
    match value.parse::<usize>() {
        Ok(n) if n < WEEKDAYS.len() => WEEKDAYS[n],
        _ => value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Timelike};

    #[test]
    fn test_interval_to_cron_mapping() {
        assert_eq!(interval_to_cron(1), "* * * * *");
        assert_eq!(interval_to_cron(15), "*/15 * * * *");
        assert_eq!(interval_to_cron(60), "0 * * * *");
        assert_eq!(interval_to_cron(180), "0 */3 * * *");
        assert_eq!(interval_to_cron(1440), "0 0 * * *");
        assert_eq!(interval_to_cron(10_000), "0 0 * * *");
    }

    #[test]
    fn test_trigger_requires_one_kind() {
        assert!(Trigger::default().validate().is_err());
        assert!(Trigger::interval(0).validate().is_err());
        assert!(Trigger::interval(5).validate().is_ok());
        assert!(Trigger::cron("*/5 * * * *").validate().is_ok());
        assert!(Trigger::cron("not a cron").validate().is_err());

        let both = Trigger {
            interval_minutes: Some(10),
            cron_expression: Some("0 3 * * *".into()),
        };
        assert!(both.validate().is_ok());
    }

    #[test]
    fn test_blank_cron_counts_as_missing() {
        let trigger = Trigger {
            interval_minutes: None,
            cron_expression: Some("   ".into()),
        };
        assert!(trigger.validate().is_err());
    }

    #[test]
    fn test_next_after_interval() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let next = Trigger::interval(30).next_after(now).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap());
    }

    #[test]
    fn test_cron_takes_precedence() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 7, 0).unwrap();
        let trigger = Trigger {
            interval_minutes: Some(600),
            cron_expression: Some("0 3 * * *".into()),
        };
        let next = trigger.next_after(now).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 5, 2, 3, 0, 0).unwrap());
        assert_eq!(trigger.effective_cron().unwrap(), "0 3 * * *");
    }

    #[test]
    fn test_six_field_cron_accepted() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 10).unwrap();
        let next = Trigger::cron("30 * * * * *").next_after(now).unwrap();
        assert_eq!(next.second(), 30);
        assert_eq!(next.minute(), 0);
    }

    #[test]
    fn test_effective_cron_from_interval() {
        assert_eq!(Trigger::interval(60).effective_cron().unwrap(), "0 * * * *");
    }

    #[test]
    fn test_classic_weekday_numbers() {
        // Saturday
        let now = Utc.with_ymd_and_hms(2024, 5, 4, 12, 0, 0).unwrap();
        let monday = Trigger::cron("0 2 * * 1").next_after(now).unwrap();
        assert_eq!(monday, Utc.with_ymd_and_hms(2024, 5, 6, 2, 0, 0).unwrap());

        let sunday = Trigger::cron("0 2 * * 0").next_after(now).unwrap();
        assert_eq!(sunday, Utc.with_ymd_and_hms(2024, 5, 5, 2, 0, 0).unwrap());
        assert_eq!(Trigger::cron("0 2 * * 7").next_after(now).unwrap(), sunday);

        let weekdays = Trigger::cron("30 6 * * 1-5").next_after(now).unwrap();
        assert_eq!(weekdays, Utc.with_ymd_and_hms(2024, 5, 6, 6, 30, 0).unwrap());
        let weekend = Trigger::cron("0 2 * * 6,0").next_after(now).unwrap();
        assert_eq!(weekend, Utc.with_ymd_and_hms(2024, 5, 5, 2, 0, 0).unwrap());
    }

    #[test]
    fn test_weekday_range_ending_on_seven() {
        // Thursday
        let now = Utc.with_ymd_and_hms(2024, 5, 2, 12, 0, 0).unwrap();
        let trigger = Trigger::cron("0 2 * * 5-7");
        let friday = trigger.next_after(now).unwrap();
        assert_eq!(friday, Utc.with_ymd_and_hms(2024, 5, 3, 2, 0, 0).unwrap());
        let sunday = trigger
            .next_after(Utc.with_ymd_and_hms(2024, 5, 4, 12, 0, 0).unwrap())
            .unwrap();
        assert_eq!(sunday, Utc.with_ymd_and_hms(2024, 5, 5, 2, 0, 0).unwrap());
        assert_eq!(normalize_cron("0 2 * * 5-7"), "0 0 2 * * FRI-SAT,SUN");
        assert_eq!(normalize_cron("0 2 * * MON"), "0 0 2 * * MON");
    }

    #[test]
    fn test_expired_cron_rejected() {
        let expired = Trigger::cron("0 0 0 1 1 * 2020");
        let err = expired.validate().unwrap_err();
        assert!(err.to_string().contains("no future occurrence"));
        assert!(expired.validate_syntax().is_ok());
    }
}
