//! Task cadence: cron expressions, fixed intervals and one-shot triggers.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use cron::Schedule;

/// When a task's logical timestamps fall.
///
/// Fire times are computed against an anchor (the task's `start_date`); no
/// logical timestamp earlier than the anchor is ever produced.
#[derive(Debug, Clone)]
pub enum Trigger {
    Cron { expr: String, schedule: Schedule },
    /// Every `Duration`, starting at the anchor.
    Interval(Duration),
    /// Exactly once, at the anchor.
    Once,
}

impl Trigger {
    pub fn cron(expr: &str) -> Result<Self, cron::error::Error> {
        Ok(Self::Cron {
            expr: expr.trim().to_string(),
            schedule: parse_cron(expr)?,
        })
    }

    /// Fixed interval trigger. `None` for a non-positive interval.
    pub fn every(interval: Duration) -> Option<Self> {
        (interval > Duration::zero()).then_some(Self::Interval(interval))
    }

    /// Fire times `t` with `anchor <= t <= until` and `t > after`, ascending.
    pub fn fire_times<'a>(
        &'a self,
        anchor: DateTime<Utc>,
        after: Option<DateTime<Utc>>,
        until: DateTime<Utc>,
    ) -> Box<dyn Iterator<Item = DateTime<Utc>> + 'a> {
        match self {
            Self::Cron { schedule, .. } => {
                let floor = anchor - Duration::seconds(1);
                let from = after.map_or(floor, |a| a.max(floor));
                Box::new(
                    schedule
                        .after(&from)
                        .filter(move |t| *t >= anchor && after.map_or(true, |a| *t > a))
                        .take_while(move |t| *t <= until),
                )
            }
            Self::Interval(step) => {
                let step_ms = step.num_milliseconds().max(1);
                let first = match after {
                    Some(a) if a >= anchor => (a - anchor).num_milliseconds() / step_ms + 1,
                    _ => 0,
                };
                Box::new(
                    (first..)
                        .map(move |k| anchor + Duration::milliseconds(k.saturating_mul(step_ms)))
                        .take_while(move |t| *t <= until),
                )
            }
            Self::Once => {
                let due = after.is_none() && anchor <= until;
                Box::new(due.then_some(anchor).into_iter())
            }
        }
    }

    /// Latest fire time in the same range as [`Trigger::fire_times`].
    pub fn latest_fire(
        &self,
        anchor: DateTime<Utc>,
        after: Option<DateTime<Utc>>,
        until: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        match self {
            Self::Interval(step) => {
                let step_ms = step.num_milliseconds().max(1);
                if until < anchor {
                    return None;
                }
                let k = (until - anchor).num_milliseconds() / step_ms;
                let latest = anchor + Duration::milliseconds(k.saturating_mul(step_ms));
                after.map_or(true, |a| latest > a).then_some(latest)
            }
            Self::Cron { schedule, .. } => {
                // Walk back from just past `until`; sub-second `until` may sit
                // before the first step back.
                let latest = schedule
                    .after(&(until + Duration::seconds(1)))
                    .rev()
                    .find(|t| *t <= until)?;
                (latest >= anchor && after.map_or(true, |a| latest > a)).then_some(latest)
            }
            Self::Once => self.fire_times(anchor, after, until).next(),
        }
    }

    /// Start of the fetch window ending at `logical_ts` when no earlier run
    /// is known: one nominal period before it.
    ///
    /// One-shot triggers cover everything before the anchor, or `lookback`
    /// of it when given.
    pub fn window_start(
        &self,
        anchor: DateTime<Utc>,
        logical_ts: DateTime<Utc>,
        lookback: Option<Duration>,
    ) -> DateTime<Utc> {
        match self {
            Self::Once => lookback.map_or(DateTime::<Utc>::UNIX_EPOCH, |l| anchor - l),
            _ => logical_ts - self.nominal_period(logical_ts).unwrap_or_else(|| Duration::hours(1)),
        }
    }

    /// Spacing between consecutive fires around `at`. `None` for one-shot.
    pub fn nominal_period(&self, at: DateTime<Utc>) -> Option<Duration> {
        match self {
            Self::Interval(step) => Some(*step),
            Self::Cron { schedule, .. } => {
                let mut upcoming = schedule.after(&at);
                match (upcoming.next(), upcoming.next()) {
                    (Some(a), Some(b)) => Some(b - a),
                    _ => None,
                }
            }
            Self::Once => None,
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cron { expr, .. } => write!(f, "cron({expr})"),
            Self::Interval(step) => write!(f, "every({}s)", step.num_seconds()),
            Self::Once => f.write_str("once"),
        }
    }
}

/// Parse a cron expression, auto-prepending "0 " for 5-field expressions.
///
/// The `cron` crate requires 6 fields (sec min hr dom mon dow), but pipeline
/// files usually carry 5-field cron (min hr dom mon dow).
pub(crate) fn parse_cron(expr: &str) -> Result<Schedule, cron::error::Error> {
    let parts: Vec<&str> = expr.split_whitespace().collect();
    if parts.len() == 5 {
        Schedule::from_str(&format!("0 {}", expr.trim()))
    } else {
        Schedule::from_str(expr.trim())
    }
}

// ── Tests ────────────────────────────────────────────────────────────
