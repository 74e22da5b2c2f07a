//! Rename correlation
//!
//! Platforms report a rename as two notifications, the old name and the new
//! name. Halves are paired within a bounded window: by tracker id when both
//! carry one, otherwise first-in first-out. A half that finds no partner
//! before the window closes is passed on alone.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use super::{RawAction, RawChange, WatchRecord};

/// Pairs rename halves from a single watcher
#[derive(Debug)]
pub struct RenameCorrelator {
    window: Duration,
    olds: VecDeque<RawChange>,
    news: VecDeque<RawChange>,
}

fn compatible(a: &RawChange, b: &RawChange) -> bool {
    match (a.tracker, b.tracker) {
        (Some(x), Some(y)) => x == y,
        _ => true,
    }
}

impl RenameCorrelator {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            olds: VecDeque::new(),
            news: VecDeque::new(),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Number of halves waiting for a partner
    pub fn pending(&self) -> usize {
        self.olds.len() + self.news.len()
    }

    /// When the oldest pending half expires
    pub fn next_deadline(&self) -> Option<Instant> {
        let oldest = match (self.olds.front(), self.news.front()) {
            (Some(a), Some(b)) => a.observed_at.min(b.observed_at),
            (Some(a), None) => a.observed_at,
            (None, Some(b)) => b.observed_at,
            (None, None) => return None,
        };
        Some(oldest + self.window)
    }

    /// Feed one change; returns the records ready to forward, in order
    pub fn push(&mut self, change: RawChange, now: Instant) -> Vec<WatchRecord> {
        let mut ready = self.expire(now);

        match change.action {
            RawAction::RenamedOld => match take_partner(&mut self.news, &change) {
                Some(to) => ready.push(WatchRecord::Rename { from: change, to }),
                None => self.olds.push_back(change),
            },
            RawAction::RenamedNew => match take_partner(&mut self.olds, &change) {
                Some(from) => ready.push(WatchRecord::Rename { from, to: change }),
                None => self.news.push_back(change),
            },
            _ => {
                // A later change on a pending path must not overtake it
                ready.extend(self.flush_path(&change));
                ready.push(WatchRecord::Change(change));
            }
        }

        ready
    }

    /// Release halves whose window has closed, oldest first
    pub fn expire(&mut self, now: Instant) -> Vec<WatchRecord> {
        let window = self.window;
        let is_expired = |c: &RawChange| now.saturating_duration_since(c.observed_at) >= window;

        let mut expired: Vec<RawChange> = Vec::new();
        while self.olds.front().map_or(false, is_expired) {
            expired.extend(self.olds.pop_front());
        }
        while self.news.front().map_or(false, is_expired) {
            expired.extend(self.news.pop_front());
        }
        expired.sort_by_key(|c| c.observed_at);
        expired.into_iter().map(WatchRecord::Change).collect()
    }

    /// Release every pending half regardless of age
    pub fn drain(&mut self) -> Vec<WatchRecord> {
        let mut all: Vec<RawChange> = self.olds.drain(..).chain(self.news.drain(..)).collect();
        all.sort_by_key(|c| c.observed_at);
        all.into_iter().map(WatchRecord::Change).collect()
    }

    fn flush_path(&mut self, change: &RawChange) -> Vec<WatchRecord> {
        let mut flushed = Vec::new();
        for queue in [&mut self.olds, &mut self.news] {
            let mut i = 0;
            while i < queue.len() {
                if queue[i].path == change.path {
                    flushed.extend(queue.remove(i));
                } else {
                    i += 1;
                }
            }
        }
        flushed.sort_by_key(|c| c.observed_at);
        flushed.into_iter().map(WatchRecord::Change).collect()
    }
}

fn take_partner(queue: &mut VecDeque<RawChange>, half: &RawChange) -> Option<RawChange> {
    let position = queue.iter().position(|candidate| compatible(candidate, half))?;
    queue.remove(position)
}
