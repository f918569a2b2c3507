use async_trait::async_trait;
use chrono::{DateTime, Datelike, TimeZone, Timelike, Utc};

use crate::error::Result;
use crate::mail::flags::Flag;
use crate::mail::message::{body_octets, ImapUid, Message, UidRange};

use std::collections::BTreeSet;

/// A search request: the criteria are an implicit conjunction, each of them
/// possibly a nested boolean tree.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SearchQuery {
    pub criteria: Vec<SearchCriterion>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SearchCriterion {
    All,
    Uid(Vec<UidRange>),
    Flag(Flag, bool),
    InternalDate(DateComparison, DateTime<Utc>, DateResolution),
    Header(String, HeaderOperator),
    Size(SizeOperator, u64),
    Text(TextScope, String),
    Conjunction(ConjunctionOperator, Vec<SearchCriterion>),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DateComparison {
    Before,
    On,
    After,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DateResolution {
    Year,
    Month,
    Day,
    Hour,
    Minute,
    Second,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HeaderOperator {
    Exists,
    Contains(String),
    Date(DateComparison, DateTime<Utc>, DateResolution),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SizeOperator {
    Smaller,
    Equal,
    Larger,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TextScope {
    Body,
    Full,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConjunctionOperator {
    And,
    Or,
    Nor,
}

impl SearchQuery {
    pub fn new(criteria: Vec<SearchCriterion>) -> Self {
        Self { criteria }
    }

    pub fn all() -> Self {
        Self {
            criteria: vec![SearchCriterion::All],
        }
    }

    /// When the query is nothing but one UID criterion, return its ranges:
    /// such a query is answered by ranged find calls without evaluating
    /// messages at all.
    pub fn as_uid_only(&self) -> Option<&[UidRange]> {
        match self.criteria.as_slice() {
            [SearchCriterion::Uid(ranges)] => Some(ranges),
            _ => None,
        }
    }

    /// Whether evaluation must look at header fields.
    pub fn needs_headers(&self) -> bool {
        self.criteria.iter().any(criterion_needs_headers)
    }

    /// Whether evaluation must look at the message content.
    pub fn needs_body(&self) -> bool {
        self.criteria.iter().any(criterion_needs_body)
    }

    /// True when `message` satisfies every criterion. Recent is not a
    /// persisted property of the message here: it is resolved against the
    /// calling session's recent set.
    pub fn matches(&self, message: &Message, recent: &BTreeSet<ImapUid>) -> bool {
        self.criteria
            .iter()
            .all(|criterion| evaluate(criterion, message, recent))
    }
}

fn criterion_needs_headers(criterion: &SearchCriterion) -> bool {
    match criterion {
        SearchCriterion::Header(..) => true,
        SearchCriterion::Text(TextScope::Full, _) => true,
        SearchCriterion::Conjunction(_, children) => children.iter().any(criterion_needs_headers),
        _ => false,
    }
}

fn criterion_needs_body(criterion: &SearchCriterion) -> bool {
    match criterion {
        SearchCriterion::Text(..) => true,
        SearchCriterion::Conjunction(_, children) => children.iter().any(criterion_needs_body),
        _ => false,
    }
}

/// The search predicate. Pure: no backend access, no mutation.
pub fn evaluate(
    criterion: &SearchCriterion,
    message: &Message,
    recent: &BTreeSet<ImapUid>,
) -> bool {
    match criterion {
        SearchCriterion::All => true,
        SearchCriterion::Uid(ranges) => ranges.iter().any(|r| r.contains(message.uid())),
        SearchCriterion::Flag(Flag::Recent, expected) => {
            recent.contains(&message.uid()) == *expected
        }
        SearchCriterion::Flag(flag, expected) => {
            message.metadata.flags.contains(flag) == *expected
        }
        SearchCriterion::InternalDate(cmp, date, resolution) => {
            compare_dates(*cmp, message.metadata.internal_date, *date, *resolution)
        }
        SearchCriterion::Header(name, operator) => {
            let mut values = message.headers_named(name).map(|h| h.value.as_str());
            match operator {
                HeaderOperator::Exists => values.next().is_some(),
                HeaderOperator::Contains(needle) => {
                    let needle = needle.to_uppercase();
                    values.any(|v| v.to_uppercase().contains(&needle))
                }
                HeaderOperator::Date(cmp, date, resolution) => values.any(|v| {
                    match DateTime::parse_from_rfc2822(v.trim()) {
                        Ok(parsed) => compare_dates(
                            *cmp,
                            parsed.with_timezone(&Utc),
                            *date,
                            *resolution,
                        ),
                        // An unparsable date header never matches
                        Err(_) => false,
                    }
                }),
            }
        }
        SearchCriterion::Size(op, value) => match op {
            SizeOperator::Smaller => message.metadata.size < *value,
            SizeOperator::Equal => message.metadata.size == *value,
            SizeOperator::Larger => message.metadata.size > *value,
        },
        SearchCriterion::Text(scope, needle) => {
            let needle = needle.to_uppercase();
            let content = message.body.as_deref().unwrap_or(&[]);
            let haystack = match scope {
                TextScope::Body => String::from_utf8_lossy(body_octets(content)),
                TextScope::Full => String::from_utf8_lossy(content),
            };
            haystack.to_uppercase().contains(&needle)
        }
        SearchCriterion::Conjunction(op, children) => match op {
            ConjunctionOperator::And => {
                children.iter().all(|c| evaluate(c, message, recent))
            }
            ConjunctionOperator::Or => {
                children.iter().any(|c| evaluate(c, message, recent))
            }
            ConjunctionOperator::Nor => {
                !children.iter().any(|c| evaluate(c, message, recent))
            }
        },
    }
}

fn compare_dates(
    cmp: DateComparison,
    lhs: DateTime<Utc>,
    rhs: DateTime<Utc>,
    resolution: DateResolution,
) -> bool {
    let lhs = truncate(lhs, resolution);
    let rhs = truncate(rhs, resolution);
    match cmp {
        DateComparison::Before => lhs < rhs,
        DateComparison::On => lhs == rhs,
        DateComparison::After => lhs > rhs,
    }
}

/// Truncate to the requested resolution in UTC; both operands of a
/// comparison go through this.
fn truncate(dt: DateTime<Utc>, resolution: DateResolution) -> DateTime<Utc> {
    use DateResolution::*;
    let (year, mut month, mut day) = (dt.year(), dt.month(), dt.day());
    let (mut hour, mut minute, mut second) = (dt.hour(), dt.minute(), dt.second());
    match resolution {
        Year => {
            month = 1;
            day = 1;
            hour = 0;
            minute = 0;
            second = 0;
        }
        Month => {
            day = 1;
            hour = 0;
            minute = 0;
            second = 0;
        }
        Day => {
            hour = 0;
            minute = 0;
            second = 0;
        }
        Hour => {
            minute = 0;
            second = 0;
        }
        Minute => {
            second = 0;
        }
        Second => (),
    }
    Utc.with_ymd_and_hms(year, month, day, hour, minute, second)
        .single()
        .unwrap_or(dt)
}

/// Capability contract of an optional external full-text index. When one is
/// configured the message mapper delegates whole queries to it; the index
/// may refuse a query shape it does not support with `UnsupportedSearch`.
#[async_trait]
pub trait SearchIndex<Id>: Send + Sync {
    async fn search(&self, mailbox: &Id, query: &SearchQuery) -> Result<Vec<ImapUid>>;
}
