//! Cron expression handling for recurring jobs.
//!
//! Accepts the classic 5-field crontab form (minute resolution) as well as the
//! 6/7-field forms with seconds and year understood by the `cron` crate. The
//! two disagree on day-of-week numbers: crontab counts 0-6 from Sunday (7 is
//! Sunday too), the `cron` crate counts 1-7 from Sunday. A 5-field day-of-week
//! is therefore rewritten to day names before parsing.

use std::str::FromStr;

use chrono::{DateTime, Utc};

use crate::error::{ConfidantError, Result};

const DAY_NAMES: [&str; 7] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];

pub fn parse(expression: &str) -> Result<cron::Schedule> {
    let fields: Vec<&str> = expression.split_whitespace().collect();
    let normalized = match fields.len() {
        5 => format!(
            "0 {} {} {} {} {}",
            fields[0],
            fields[1],
            fields[2],
            fields[3],
            crontab_weekdays(expression, fields[4])?
        ),
        6 | 7 => fields.join(" "),
        n => {
            return Err(ConfidantError::validation(format!(
                "cron expression '{}' has {} fields, expected 5, 6 or 7",
                expression, n
            )));
        }
    };

    cron::Schedule::from_str(&normalized).map_err(|e| {
        ConfidantError::validation(format!("invalid cron expression '{}': {}", expression, e))
    })
}

/// Rewrite a crontab day-of-week field (numbers 0-7, names, lists, ranges,
/// steps) as a list of day names.
fn crontab_weekdays(expression: &str, field: &str) -> Result<String> {
    if field == "*" || field == "?" {
        return Ok(field.to_string());
    }
    let invalid = || {
        ConfidantError::validation(format!(
            "invalid cron expression '{}': bad day-of-week '{}'",
            expression, field
        ))
    };

    let mut days = [false; 7];
    for item in field.split(',') {
        let (range, step) = match item.split_once('/') {
            Some((range, step)) => (range, Some(step.parse::<usize>().map_err(|_| invalid())?)),
            None => (item, None),
        };
        let (start, end) = if range == "*" {
            (0, 6)
        } else if let Some((start, end)) = range.split_once('-') {
            (weekday(start).ok_or_else(invalid)?, weekday(end).ok_or_else(invalid)?)
        } else {
            let day = weekday(range).ok_or_else(invalid)?;
            // "n/step" runs from n to the end of the week
            match step {
                Some(_) => (day, 6),
                None => (day, day),
            }
        };
        let step = step.unwrap_or(1);
        if step == 0 || start > end {
            return Err(invalid());
        }
        for day in (start..=end).step_by(step) {
            days[day % 7] = true;
        }
    }

    if days.iter().all(|&set| set) {
        return Ok("*".to_string());
    }
    let names: Vec<&str> = DAY_NAMES
        .iter()
        .zip(days)
        .filter_map(|(name, set)| set.then_some(*name))
        .collect();
    Ok(names.join(","))
}

/// Crontab day number (0-7) or three-letter English day name.
fn weekday(token: &str) -> Option<usize> {
    if let Ok(n) = token.parse::<usize>() {
        return (n <= 7).then_some(n);
    }
    DAY_NAMES
        .iter()
        .position(|name| name.eq_ignore_ascii_case(token))
}

/// First run strictly after `after`.
pub fn next_after(expression: &str, after: DateTime<Utc>) -> Result<DateTime<Utc>> {
    parse(expression)?.after(&after).next().ok_or_else(|| {
        ConfidantError::validation(format!("cron expression '{}' never fires again", expression))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, TimeZone, Weekday};

    #[test]
    fn five_field_expressions_run_on_the_minute() {
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 10, 2, 30).unwrap();
        let next = next_after("*/5 * * * *", now).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 1, 1, 10, 5, 0).unwrap());
    }

    #[test]
    fn six_field_expressions_keep_seconds() {
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 10, 0, 0).unwrap();
        let next = next_after("*/10 * * * * *", now).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 1, 1, 10, 0, 10).unwrap());
    }

    #[test]
    fn five_field_weekdays_use_crontab_numbering() {
        // Thursday
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap();

        let monday = next_after("0 3 * * 1", now).unwrap();
        assert_eq!(monday, Utc.with_ymd_and_hms(2026, 1, 5, 3, 0, 0).unwrap());
        assert_eq!(monday.weekday(), Weekday::Mon);

        let sunday = next_after("0 3 * * 0", now).unwrap();
        assert_eq!(sunday.weekday(), Weekday::Sun);
        assert_eq!(next_after("0 3 * * 7", now).unwrap(), sunday);
        assert_eq!(next_after("0 3 * * sun", now).unwrap(), sunday);

        // Friday 2026-01-02 is inside Mon-Fri
        let weekday = next_after("0 3 * * 1-5", now).unwrap();
        assert_eq!(weekday, Utc.with_ymd_and_hms(2026, 1, 2, 3, 0, 0).unwrap());

        let weekend = next_after("0 3 * * 6-7", now).unwrap();
        assert_eq!(weekend.weekday(), Weekday::Sat);
    }

    #[test]
    fn weekday_fields_become_day_names() {
        assert_eq!(crontab_weekdays("", "1-5").unwrap(), "Mon,Tue,Wed,Thu,Fri");
        assert_eq!(crontab_weekdays("", "*/2").unwrap(), "Sun,Tue,Thu,Sat");
        assert_eq!(crontab_weekdays("", "0,7").unwrap(), "Sun");
        assert_eq!(crontab_weekdays("", "0-6").unwrap(), "*");
        assert!(crontab_weekdays("", "8").is_err());
        assert!(crontab_weekdays("", "5-1").is_err());
        assert!(crontab_weekdays("", "*/0").is_err());
    }

    #[test]
    fn malformed_expressions_are_rejected() {
        assert!(parse("* * *").is_err());
        assert!(parse("61 * * * *").is_err());
        assert!(parse("").is_err());
    }
}
