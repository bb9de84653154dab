use chrono::{DateTime, Duration, Utc};

use crate::flow::FlowAggregate;
use crate::index::FlowIndex;
use crate::l7::L7LogEntry;

pub const DEFAULT_TOLERANCE_MS: u64 = 5000;

/// Why an entry ended up without a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchOutcome<'a> {
    Matched(&'a FlowAggregate),
    /// Timestamp or client endpoint unusable; no lookup attempted
    Unmatchable,
    NoCandidate,
}

impl<'a> MatchOutcome<'a> {
    pub fn flow(&self) -> Option<&'a FlowAggregate> {
        match self {
            MatchOutcome::Matched(flow) => Some(flow),
            _ => None,
        }
    }
}

/// Pairs request log entries with the flow that carried them.
///
/// A flow is eligible when the request time lies within
/// `[start_time - tolerance, end_time + tolerance]`; the eligible flow whose
/// start is closest to the request wins, earlier index entries winning ties.
#[derive(Debug, Clone, Copy)]
pub struct Matcher {
    tolerance: Duration,
}

impl Default for Matcher {
    fn default() -> Self {
        Matcher::new(DEFAULT_TOLERANCE_MS)
    }
}

impl Matcher {
    pub fn new(tolerance_ms: u64) -> Self {
        Matcher {
            tolerance: Duration::milliseconds(tolerance_ms.min(i64::MAX as u64) as i64),
        }
    }

    pub fn is_eligible(&self, at: DateTime<Utc>, flow: &FlowAggregate) -> bool {
        let after_start = flow
            .start_time
            .checked_sub_signed(self.tolerance)
            .is_none_or(|lower| lower <= at);
        let before_end = flow
            .end_time
            .checked_add_signed(self.tolerance)
            .is_none_or(|upper| at <= upper);
        after_start && before_end
    }

    pub fn find<'a>(&self, entry: &L7LogEntry, index: &'a FlowIndex) -> MatchOutcome<'a> {
        let (Some(at), Some(client)) = (entry.parsed_timestamp(), entry.client_endpoint()) else {
            return MatchOutcome::Unmatchable;
        };
        let mut best: Option<(Duration, &'a FlowAggregate)> = None;
        for flow in index.candidates(&client) {
            if !self.is_eligible(at, flow) {
                continue;
            }
            let diff = (at - flow.start_time).abs();
            if best.is_none_or(|(min, _)| diff < min) {
                best = Some((diff, flow));
            }
        }
        match best {
            Some((_, flow)) => MatchOutcome::Matched(flow),
            None => MatchOutcome::NoCandidate,
        }
    }
}
