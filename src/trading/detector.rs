//! Snapshot diffing: turns successive master position sets into events.

use std::collections::HashMap;

use rust_decimal::Decimal;

use crate::models::PositionSnapshot;

/// A position whose volume shrank between two polls.
#[derive(Debug, Clone, PartialEq)]
pub struct PartialClose {
    pub position: PositionSnapshot,
    pub previous_volume: Decimal,
}

impl PartialClose {
    pub fn closed_volume(&self) -> Decimal {
        self.previous_volume - self.position.volume
    }
}

/// A position whose volume grew between two polls.
#[derive(Debug, Clone, PartialEq)]
pub struct VolumeIncrease {
    pub position: PositionSnapshot,
    pub previous_volume: Decimal,
}

/// Events derived from one poll.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeSet {
    pub opened: Vec<PositionSnapshot>,
    /// Last known state of positions that disappeared
    pub closed: Vec<PositionSnapshot>,
    pub modified: Vec<PositionSnapshot>,
    pub partial_closed: Vec<PartialClose>,
    pub volume_increased: Vec<VolumeIncrease>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.opened.is_empty()
            && self.closed.is_empty()
            && self.modified.is_empty()
            && self.partial_closed.is_empty()
            && self.volume_increased.is_empty()
    }

    pub fn event_count(&self) -> usize {
        self.opened.len()
            + self.closed.len()
            + self.modified.len()
            + self.partial_closed.len()
            + self.volume_increased.len()
    }

    /// Diff two position sets keyed by ticket. Output is sorted by ticket.
    pub fn compute(
        previous: &HashMap<i64, PositionSnapshot>,
        current: &HashMap<i64, PositionSnapshot>,
    ) -> Self {
        let mut changes = ChangeSet::default();

        for (ticket, now) in current {
            let Some(before) = previous.get(ticket) else {
                changes.opened.push(now.clone());
                continue;
            };

            if now.volume < before.volume {
                changes.partial_closed.push(PartialClose {
                    position: now.clone(),
                    previous_volume: before.volume,
                });
            } else if now.volume > before.volume {
                changes.volume_increased.push(VolumeIncrease {
                    position: now.clone(),
                    previous_volume: before.volume,
                });
            }

            if now.stops_differ(before) {
                changes.modified.push(now.clone());
            }
        }

        for (ticket, before) in previous {
            if !current.contains_key(ticket) {
                changes.closed.push(before.clone());
            }
        }

        changes.opened.sort_by_key(|p| p.ticket);
        changes.closed.sort_by_key(|p| p.ticket);
        changes.modified.sort_by_key(|p| p.ticket);
        changes.partial_closed.sort_by_key(|p| p.position.ticket);
        changes.volume_increased.sort_by_key(|p| p.position.ticket);
        changes
    }
}

/// Keeps the last master snapshot between polls.
#[derive(Debug, Default)]
pub struct ChangeDetector {
    previous: Option<HashMap<i64, PositionSnapshot>>,
}

impl ChangeDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// True until the first snapshot has been observed.
    pub fn is_baseline(&self) -> bool {
        self.previous.is_none()
    }

    /// Diff `positions` against the retained snapshot and retain them.
    ///
    /// The first call only seeds the snapshot and reports nothing, unless
    /// `report_existing` is set, in which case every position is opened.
    pub fn observe(&mut self, positions: &[PositionSnapshot], report_existing: bool) -> ChangeSet {
        let current: HashMap<i64, PositionSnapshot> =
            positions.iter().map(|p| (p.ticket, p.clone())).collect();

        let changes = match &self.previous {
            Some(previous) => ChangeSet::compute(previous, &current),
            None if report_existing => ChangeSet::compute(&HashMap::new(), &current),
            None => ChangeSet::default(),
        };

        self.previous = Some(current);
        changes
    }
}
