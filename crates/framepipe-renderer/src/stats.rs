use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Snapshot of renderer counters, as reported by `get_info`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub batches: u64,
    pub commands_applied: u64,
    /// Malformed or unsupported operations skipped inside batches.
    pub commands_skipped: u64,
    pub frames_published: u64,
    /// Frames dropped because their geometry disagreed with the channel.
    pub frames_discarded: u64,
    pub callback_failures: u64,
    pub channel_replacements: u64,
    pub init_failures: u64,
    pub fatal_faults: u64,
    /// Channel teardown problems swallowed during cleanup.
    pub cleanup_errors: u64,
}

/// Cumulative counters for one renderer instance.
///
/// Updated on the writer thread, readable from any thread without locking.
/// Counters survive `cleanup` and re-initialization.
#[derive(Debug, Default)]
pub struct RendererStats {
    batches: AtomicU64,
    commands_applied: AtomicU64,
    commands_skipped: AtomicU64,
    frames_published: AtomicU64,
    frames_discarded: AtomicU64,
    callback_failures: AtomicU64,
    channel_replacements: AtomicU64,
    init_failures: AtomicU64,
    fatal_faults: AtomicU64,
    cleanup_errors: AtomicU64,
}

impl RendererStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_batches(&self) {
        self.batches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_commands_applied(&self, count: u64) {
        self.commands_applied.fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_commands_skipped(&self, count: u64) {
        self.commands_skipped.fetch_add(count, Ordering::Relaxed);
    }

    pub fn inc_frames_published(&self) {
        self.frames_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_frames_discarded(&self) {
        self.frames_discarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_callback_failures(&self, count: u64) {
        self.callback_failures.fetch_add(count, Ordering::Relaxed);
    }

    pub fn inc_channel_replacements(&self) {
        self.channel_replacements.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_init_failures(&self) {
        self.init_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_fatal_faults(&self) {
        self.fatal_faults.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_cleanup_errors(&self) {
        self.cleanup_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            batches: self.batches.load(Ordering::Relaxed),
            commands_applied: self.commands_applied.load(Ordering::Relaxed),
            commands_skipped: self.commands_skipped.load(Ordering::Relaxed),
            frames_published: self.frames_published.load(Ordering::Relaxed),
            frames_discarded: self.frames_discarded.load(Ordering::Relaxed),
            callback_failures: self.callback_failures.load(Ordering::Relaxed),
            channel_replacements: self.channel_replacements.load(Ordering::Relaxed),
            init_failures: self.init_failures.load(Ordering::Relaxed),
            fatal_faults: self.fatal_faults.load(Ordering::Relaxed),
            cleanup_errors: self.cleanup_errors.load(Ordering::Relaxed),
        }
    }
}
