//! Per-target queue state of an upload job

use fleet_shared::TargetId;
use std::collections::{HashMap, VecDeque};

/// The five disjoint queues a target can be in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    WaitingToStart,
    Queued,
    InProgress,
    Finished,
    Failed,
}

impl QueueKind {
    pub const ALL: [QueueKind; 5] = [
        QueueKind::WaitingToStart,
        QueueKind::Queued,
        QueueKind::InProgress,
        QueueKind::Finished,
        QueueKind::Failed,
    ];
}

/// Queue sizes, published for progress display
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueCounts {
    pub waiting_to_start: usize,
    pub queued: usize,
    pub in_progress: usize,
    pub finished: usize,
    pub failed: usize,
}

impl QueueCounts {
    pub fn total(&self) -> usize {
        self.waiting_to_start + self.queued + self.in_progress + self.finished + self.failed
    }

    /// Items handed to the worker pool and not yet done
    pub fn in_flight(&self) -> usize {
        self.queued + self.in_progress
    }
}

/// Target queues plus the last error message of each failed target
///
/// A target is in at most one queue at any time. Every transition names its
/// source queue and is a no-op when the target is not there.
#[derive(Debug, Clone, Default)]
pub struct TargetQueues {
    waiting_to_start: VecDeque<TargetId>,
    queued: VecDeque<TargetId>,
    in_progress: VecDeque<TargetId>,
    finished: VecDeque<TargetId>,
    failed: VecDeque<TargetId>,
    errors: HashMap<TargetId, String>,
    auto_retries: HashMap<TargetId, u32>,
}

impl TargetQueues {
    /// Fresh queues with `targets` waiting to start, duplicates dropped
    pub fn seeded<I>(targets: I) -> Self
    where
        I: IntoIterator<Item = TargetId>,
    {
        let mut queues = Self::default();
        queues.enqueue(targets);
        queues
    }

    fn slot(&self, kind: QueueKind) -> &VecDeque<TargetId> {
        match kind {
            QueueKind::WaitingToStart => &self.waiting_to_start,
            QueueKind::Queued => &self.queued,
            QueueKind::InProgress => &self.in_progress,
            QueueKind::Finished => &self.finished,
            QueueKind::Failed => &self.failed,
        }
    }

    fn slot_mut(&mut self, kind: QueueKind) -> &mut VecDeque<TargetId> {
        match kind {
            QueueKind::WaitingToStart => &mut self.waiting_to_start,
            QueueKind::Queued => &mut self.queued,
            QueueKind::InProgress => &mut self.in_progress,
            QueueKind::Finished => &mut self.finished,
            QueueKind::Failed => &mut self.failed,
        }
    }

    /// Which queue `target` is in, if any
    pub fn locate(&self, target: &TargetId) -> Option<QueueKind> {
        QueueKind::ALL
            .into_iter()
            .find(|kind| self.slot(*kind).contains(target))
    }

    /// Move `target` from `from` to the back of `to`
    ///
    /// Returns false, touching nothing, if `target` is not in `from`.
    pub fn move_item(&mut self, target: &TargetId, from: QueueKind, to: QueueKind) -> bool {
        let source = self.slot_mut(from);
        let Some(position) = source.iter().position(|t| t == target) else {
            return false;
        };
        let Some(target) = source.remove(position) else {
            return false;
        };

        if to == QueueKind::WaitingToStart {
            self.errors.remove(&target);
        }
        self.slot_mut(to).push_back(target);
        true
    }

    /// Add targets to `waitingToStart`
    ///
    /// Unknown targets are appended; finished or failed ones are moved back.
    /// Targets already waiting or in flight are left alone. Returns how many
    /// targets entered `waitingToStart`.
    pub fn enqueue<I>(&mut self, targets: I) -> usize
    where
        I: IntoIterator<Item = TargetId>,
    {
        let mut added = 0;
        for target in targets {
            let moved = match self.locate(&target) {
                None => {
                    self.waiting_to_start.push_back(target);
                    true
                }
                Some(from @ (QueueKind::Finished | QueueKind::Failed)) => {
                    self.auto_retries.remove(&target);
                    self.move_item(&target, from, QueueKind::WaitingToStart)
                }
                Some(_) => false,
            };
            if moved {
                added += 1;
            }
        }
        added
    }

    /// Take the next waiting target and mark it as queued
    pub fn pop_waiting(&mut self) -> Option<TargetId> {
        let target = self.waiting_to_start.pop_front()?;
        self.queued.push_back(target.clone());
        Some(target)
    }

    /// `inProgress → finished`
    pub fn mark_finished(&mut self, target: &TargetId) -> bool {
        self.move_item(target, QueueKind::InProgress, QueueKind::Finished)
    }

    /// `inProgress → failedItems`, remembering why
    pub fn mark_failed(&mut self, target: &TargetId, message: impl Into<String>) -> bool {
        if !self.move_item(target, QueueKind::InProgress, QueueKind::Failed) {
            return false;
        }
        self.errors.insert(target.clone(), message.into());
        true
    }

    /// Move every failed target back to `waitingToStart`
    pub fn retry_failed(&mut self) -> usize {
        self.move_all(QueueKind::Failed, QueueKind::WaitingToStart)
    }

    /// Move every finished target back to `waitingToStart`
    pub fn restart_finished(&mut self) -> usize {
        self.move_all(QueueKind::Finished, QueueKind::WaitingToStart)
    }

    /// Retry failed targets that have not used up `max_retries` automatic retries
    pub fn auto_retry(&mut self, max_retries: u32) -> usize {
        let eligible: Vec<TargetId> = self
            .failed
            .iter()
            .filter(|t| self.auto_retries.get(*t).copied().unwrap_or(0) < max_retries)
            .cloned()
            .collect();

        for target in &eligible {
            *self.auto_retries.entry(target.clone()).or_default() += 1;
            self.move_item(target, QueueKind::Failed, QueueKind::WaitingToStart);
        }
        eligible.len()
    }

    /// Give every target a fresh automatic retry budget
    pub fn reset_auto_retries(&mut self) {
        self.auto_retries.clear();
    }

    /// Whether any failed target can still be retried automatically
    pub fn has_auto_retry_candidates(&self, max_retries: u32) -> bool {
        self.failed
            .iter()
            .any(|t| self.auto_retries.get(t).copied().unwrap_or(0) < max_retries)
    }

    /// Put everything queued or in progress back at the front of `waitingToStart`
    pub fn requeue_in_flight(&mut self) -> usize {
        let mut returned: Vec<TargetId> = self.queued.drain(..).collect();
        returned.extend(self.in_progress.drain(..));

        for target in returned.iter().rev() {
            self.errors.remove(target);
            self.waiting_to_start.push_front(target.clone());
        }
        returned.len()
    }

    /// Manual bulk move; moved targets get a fresh automatic retry budget
    fn move_all(&mut self, from: QueueKind, to: QueueKind) -> usize {
        let items: Vec<TargetId> = self.slot(from).iter().cloned().collect();
        let mut moved = 0;
        for target in &items {
            if self.move_item(target, from, to) {
                self.auto_retries.remove(target);
                moved += 1;
            }
        }
        moved
    }

    pub fn counts(&self) -> QueueCounts {
        QueueCounts {
            waiting_to_start: self.waiting_to_start.len(),
            queued: self.queued.len(),
            in_progress: self.in_progress.len(),
            finished: self.finished.len(),
            failed: self.failed.len(),
        }
    }

    /// Snapshot of one queue, in order
    pub fn items(&self, kind: QueueKind) -> Vec<TargetId> {
        self.slot(kind).iter().cloned().collect()
    }

    /// Error message recorded for a failed target
    pub fn error_for(&self, target: &TargetId) -> Option<&str> {
        self.errors.get(target).map(String::as_str)
    }
}
