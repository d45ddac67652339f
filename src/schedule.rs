//! # Schedule — Jenkins Cron Validation
//!
//! Task schedules end up in a Jenkins `TimerTrigger`, so they follow Jenkins'
//! cron dialect: five whitespace-separated fields (minute, hour, day of month,
//! month, day of week), each a comma list of terms. A term is `*`, `H`,
//! `H(a-b)`, a number or `a-b` range, optionally followed by `/step`. Month
//! and weekday names (`jan`, `mon`, ...) are accepted, as are the `@hourly`
//! family of aliases. A spec may span several lines; blank lines, `#`
//! comments and a `TZ=` line are skipped.
//!
//! Validation runs before any Jenkins call so a bad expression never reaches
//! the CI server.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScheduleError {
    #[error("schedule is empty")]
    Empty,
    #[error("line {line}: expected 5 fields, found {found}")]
    FieldCount { line: usize, found: usize },
    #[error("line {line}: invalid {field} term {term:?}")]
    BadTerm {
        line: usize,
        field: &'static str,
        term: String,
    },
}

struct Field {
    name: &'static str,
    min: u32,
    max: u32,
    names: &'static [&'static str],
}

const MONTHS: &[&str] = &[
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];
const WEEKDAYS: &[&str] = &["sun", "mon", "tue", "wed", "thu", "fri", "sat"];

const FIELDS: [Field; 5] = [
    Field {
        name: "minute",
        min: 0,
        max: 59,
        names: &[],
    },
    Field {
        name: "hour",
        min: 0,
        max: 23,
        names: &[],
    },
    Field {
        name: "day-of-month",
        min: 1,
        max: 31,
        names: &[],
    },
    Field {
        name: "month",
        min: 1,
        max: 12,
        names: MONTHS,
    },
    Field {
        name: "day-of-week",
        min: 0,
        max: 7,
        names: WEEKDAYS,
    },
];

const ALIASES: &[&str] = &[
    "@yearly", "@annually", "@monthly", "@weekly", "@daily", "@midnight", "@hourly",
];

impl Field {
    fn value(&self, token: &str) -> Option<u32> {
        let v = match token.parse::<u32>() {
            Ok(v) => v,
            Err(_) => {
                let lower = token.to_ascii_lowercase();
                let idx = self.names.iter().position(|n| *n == lower)?;
                // Month names are 1-based, weekday names 0-based.
                idx as u32 + self.min
            }
        };
        (self.min..=self.max).contains(&v).then_some(v)
    }

    fn range(&self, token: &str) -> Option<(u32, u32)> {
        match token.split_once('-') {
            Some((a, b)) => {
                let (a, b) = (self.value(a)?, self.value(b)?);
                (a <= b).then_some((a, b))
            }
            None => self.value(token).map(|v| (v, v)),
        }
    }

    fn term_ok(&self, term: &str) -> bool {
        let (base, step) = match term.split_once('/') {
            Some((base, step)) => (base, Some(step)),
            None => (term, None),
        };
        if let Some(step) = step {
            match step.parse::<u32>() {
                Ok(s) if (1..=self.max.max(1)).contains(&s) => {}
                _ => return false,
            }
        }

        if base == "*" || base == "H" {
            return true;
        }
        if let Some(inner) = base.strip_prefix("H(").and_then(|r| r.strip_suffix(')')) {
            return self.range(inner).is_some();
        }
        // `5/15` means "from 5, every 15".
        self.range(base).is_some()
    }
}

fn validate_line(line_no: usize, line: &str) -> Result<(), ScheduleError> {
    if ALIASES.contains(&line) {
        return Ok(());
    }
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() != FIELDS.len() {
        return Err(ScheduleError::FieldCount {
            line: line_no,
            found: parts.len(),
        });
    }
    for (field, part) in FIELDS.iter().zip(parts) {
        for term in part.split(',') {
            if term.is_empty() || !field.term_ok(term) {
                return Err(ScheduleError::BadTerm {
                    line: line_no,
                    field: field.name,
                    term: term.to_string(),
                });
            }
        }
    }
    Ok(())
}

/// Validate a (possibly multi-line) Jenkins cron spec.
pub fn validate(spec: &str) -> Result<(), ScheduleError> {
    let mut lines = 0;
    for (idx, raw) in spec.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with("TZ=") {
            continue;
        }
        validate_line(idx + 1, line)?;
        lines += 1;
    }
    if lines == 0 {
        return Err(ScheduleError::Empty);
    }
    Ok(())
}
