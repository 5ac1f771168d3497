//! Group capacity rules and the group-name grammar.
//!
//! A [`GroupRule`] decides whether one more unit of work may enter a named
//! group. Count rules carry a capacity that the [`GroupLimiter`] tracks;
//! time and date rules are stateless predicates over the wall clock. Certain
//! group-name spellings encode a rule directly, so that configuration can
//! express "only before 18:00" as the group name `time<18:00:00` without any
//! extra plumbing; [`GroupRule::from_group_name`] recognizes those spellings.
//!
//! [`GroupLimiter`]: crate::GroupLimiter

use chrono::{NaiveDateTime, NaiveTime};
use std::fmt;

const TIME_FORMAT: &str = "%H:%M:%S";
const DATE_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// How a group decides whether an increment is permitted.
///
/// `Unlimited` groups are never materialized by the limiter; they admit
/// everything and track nothing. `Count(0)` permanently denies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupRule {
    /// No limit applies; the group is ignored entirely
    Unlimited,
    /// At most this many concurrent holders
    Count(u32),
    /// Permitted strictly before this time of day
    TimeBefore(NaiveTime),
    /// Permitted strictly after this time of day
    TimeAfter(NaiveTime),
    /// Permitted strictly between these times of day
    TimeBetween(NaiveTime, NaiveTime),
    /// Permitted strictly before this date-time
    DateBefore(NaiveDateTime),
    /// Permitted strictly after this date-time
    DateAfter(NaiveDateTime),
    /// Permitted strictly between these date-times
    DateBetween(NaiveDateTime, NaiveDateTime),
}

impl GroupRule {
    /// Parse the rule encoded in a group name.
    ///
    /// Recognized forms (24-hour times, space-separated date-times):
    ///
    /// - `time<HH:MM:SS`, `HH:MM:SS<time`, `HH:MM:SS<time<HH:MM:SS`
    /// - `datetime<YYYY-MM-DD HH:MM:SS`, `YYYY-MM-DD HH:MM:SS<datetime`,
    ///   `YYYY-MM-DD HH:MM:SS<datetime<YYYY-MM-DD HH:MM:SS`
    ///
    /// Anything else yields [`GroupRule::Unlimited`]: unparseable names are
    /// not reserved, they stay available as plain count group names whose
    /// capacity comes from the resolution callback.
    pub fn from_group_name(name: &str) -> GroupRule {
        if let Some((lo, hi)) = name.split_once("<datetime<") {
            if let (Ok(lo), Ok(hi)) = (parse_date_time(lo), parse_date_time(hi)) {
                return GroupRule::DateBetween(lo, hi);
            }
        }
        if let Some(rest) = name.strip_prefix("datetime<") {
            if let Ok(dt) = parse_date_time(rest) {
                return GroupRule::DateBefore(dt);
            }
        }
        if let Some(rest) = name.strip_suffix("<datetime") {
            if let Ok(dt) = parse_date_time(rest) {
                return GroupRule::DateAfter(dt);
            }
        }
        if let Some((lo, hi)) = name.split_once("<time<") {
            if let (Ok(lo), Ok(hi)) = (parse_time(lo), parse_time(hi)) {
                return GroupRule::TimeBetween(lo, hi);
            }
        }
        if let Some(rest) = name.strip_prefix("time<") {
            if let Ok(t) = parse_time(rest) {
                return GroupRule::TimeBefore(t);
            }
        }
        if let Some(rest) = name.strip_suffix("<time") {
            if let Ok(t) = parse_time(rest) {
                return GroupRule::TimeAfter(t);
            }
        }
        GroupRule::Unlimited
    }

    /// Evaluate the rule's predicate at the given wall-clock instant.
    ///
    /// Count admission is the limiter's job (the rule carries no counter), so
    /// `Count` and `Unlimited` are always admissible here. All comparisons
    /// are strict.
    pub fn admissible_at(&self, now: NaiveDateTime) -> bool {
        match self {
            GroupRule::Unlimited | GroupRule::Count(_) => true,
            GroupRule::TimeBefore(t) => now.time() < *t,
            GroupRule::TimeAfter(t) => now.time() > *t,
            GroupRule::TimeBetween(lo, hi) => *lo < now.time() && now.time() < *hi,
            GroupRule::DateBefore(dt) => now < *dt,
            GroupRule::DateAfter(dt) => now > *dt,
            GroupRule::DateBetween(lo, hi) => *lo < now && now < *hi,
        }
    }

    /// Check if this is a count rule
    pub fn is_count(&self) -> bool {
        matches!(self, GroupRule::Count(_))
    }

    /// Check if this rule imposes no limit at all
    pub fn is_unlimited(&self) -> bool {
        matches!(self, GroupRule::Unlimited)
    }

    /// The capacity of a count rule, if this is one
    pub fn count_limit(&self) -> Option<u32> {
        match self {
            GroupRule::Count(limit) => Some(*limit),
            _ => None,
        }
    }
}

fn parse_time(s: &str) -> Result<NaiveTime, chrono::ParseError> {
    NaiveTime::parse_from_str(s, TIME_FORMAT)
}

fn parse_date_time(s: &str) -> Result<NaiveDateTime, chrono::ParseError> {
    NaiveDateTime::parse_from_str(s, DATE_TIME_FORMAT)
}

impl fmt::Display for GroupRule {
    /// Renders time and date rules back into the group-name grammar.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GroupRule::Unlimited => write!(f, "unlimited"),
            GroupRule::Count(limit) => write!(f, "{}", limit),
            GroupRule::TimeBefore(t) => write!(f, "time<{}", t.format(TIME_FORMAT)),
            GroupRule::TimeAfter(t) => write!(f, "{}<time", t.format(TIME_FORMAT)),
            GroupRule::TimeBetween(lo, hi) => {
                write!(f, "{}<time<{}", lo.format(TIME_FORMAT), hi.format(TIME_FORMAT))
            }
            GroupRule::DateBefore(dt) => write!(f, "datetime<{}", dt.format(DATE_TIME_FORMAT)),
            GroupRule::DateAfter(dt) => write!(f, "{}<datetime", dt.format(DATE_TIME_FORMAT)),
            GroupRule::DateBetween(lo, hi) => {
                write!(f, "{}<datetime<{}", lo.format(DATE_TIME_FORMAT), hi.format(DATE_TIME_FORMAT))
            }
        }
    }
}
