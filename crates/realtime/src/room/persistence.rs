// Save scheduling for a room: debounce after the last edit, a ceiling after
// the first unsaved edit, one save in flight, exponential retry on failure.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;

pub const DEFAULT_SAVE_DEBOUNCE: Duration = Duration::from_secs(2);
pub const DEFAULT_SAVE_MAX_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_RETRY_BASE: Duration = Duration::from_secs(1);
pub const DEFAULT_RETRY_MAX: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PersistencePolicy {
    pub debounce: Duration,
    pub max_interval: Duration,
    pub retry_base: Duration,
    pub retry_max: Duration,
}

impl Default for PersistencePolicy {
    fn default() -> Self {
        Self {
            debounce: DEFAULT_SAVE_DEBOUNCE,
            max_interval: DEFAULT_SAVE_MAX_INTERVAL,
            retry_base: DEFAULT_RETRY_BASE,
            retry_max: DEFAULT_RETRY_MAX,
        }
    }
}

impl PersistencePolicy {
    pub fn flush_deadline(&self, last_edit_at: Instant, first_unsaved_at: Instant) -> Instant {
        (last_edit_at + self.debounce).min(first_unsaved_at + self.max_interval)
    }

    /// Delay before retry number `attempt` (1-based): base doubled per attempt, capped.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.retry_base.saturating_mul(1u32 << exponent).min(self.retry_max)
    }
}

/// Dirty-generation bookkeeping owned by a room actor.
///
/// Every content-changing update bumps `generation`; a save captures the
/// generation it encoded and the room is clean only once a save for the
/// current generation has succeeded.
#[derive(Debug, Default)]
pub struct SaveTracker {
    generation: u64,
    saved_generation: u64,
    first_unsaved_at: Option<Instant>,
    last_edit_at: Option<Instant>,
    in_flight: Option<InFlightSave>,
    failed_attempts: u32,
    retry_at: Option<Instant>,
    last_saved_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy)]
struct InFlightSave {
    generation: u64,
    first_unsaved_at: Option<Instant>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Saved { still_dirty: bool },
    Failed { attempt: u32, retry_in: Duration },
}

impl SaveTracker {
    pub fn mark_dirty(&mut self, now: Instant) {
        self.generation += 1;
        self.last_edit_at = Some(now);
        self.first_unsaved_at.get_or_insert(now);
    }

    pub fn is_dirty(&self) -> bool {
        self.generation != self.saved_generation
    }

    pub fn save_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn failed_attempts(&self) -> u32 {
        self.failed_attempts
    }

    pub fn last_saved_at(&self) -> Option<DateTime<Utc>> {
        self.last_saved_at
    }

    /// Seeds the last-save time from the snapshot the room was loaded from.
    pub fn set_last_saved_at(&mut self, at: DateTime<Utc>) {
        self.last_saved_at = Some(at);
    }

    /// When the next save should start, if one is needed and none is running.
    pub fn due_at(&self, policy: &PersistencePolicy) -> Option<Instant> {
        if self.in_flight.is_some() || !self.is_dirty() {
            return None;
        }
        if let Some(retry_at) = self.retry_at {
            return Some(retry_at);
        }
        match (self.last_edit_at, self.first_unsaved_at) {
            (Some(last_edit), Some(first_unsaved)) => {
                Some(policy.flush_deadline(last_edit, first_unsaved))
            }
            // Dirty without an edit timestamp only happens after a degraded
            // load; flush right away.
            _ => Some(Instant::now()),
        }
    }

    /// Records that a save of the current generation started and returns it.
    pub fn begin_save(&mut self) -> u64 {
        self.in_flight = Some(InFlightSave {
            generation: self.generation,
            first_unsaved_at: self.first_unsaved_at.take(),
        });
        self.generation
    }

    pub fn finish_save(
        &mut self,
        generation: u64,
        ok: bool,
        now: Instant,
        policy: &PersistencePolicy,
    ) -> SaveOutcome {
        let in_flight = self.in_flight.take();
        if ok {
            self.saved_generation = self.saved_generation.max(generation);
            self.failed_attempts = 0;
            self.retry_at = None;
            self.last_saved_at = Some(Utc::now());
            if !self.is_dirty() {
                self.first_unsaved_at = None;
                self.last_edit_at = None;
            }
            return SaveOutcome::Saved { still_dirty: self.is_dirty() };
        }

        if let Some(InFlightSave { first_unsaved_at: Some(earlier), .. }) = in_flight {
            self.first_unsaved_at =
                Some(self.first_unsaved_at.map_or(earlier, |current| current.min(earlier)));
        }
        self.failed_attempts += 1;
        let retry_in = policy.retry_delay(self.failed_attempts);
        self.retry_at = Some(now + retry_in);
        SaveOutcome::Failed { attempt: self.failed_attempts, retry_in }
    }

    /// Forces the tracker dirty without an edit, so the next save runs even
    /// though no client changed anything.
    pub fn force_dirty(&mut self) {
        self.generation += 1;
    }
}
