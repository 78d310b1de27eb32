// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Range-server configuration, built once at boot and shared by `Arc`
//! across every long-lived service (spec §9 "Global mutable state").
//!
//! Grounded on the teacher's `Config` builder (`src/config.rs`): a flat
//! struct of typed, defaulted fields rather than a dynamic property bag.

use std::time::Duration;

/// Process-wide configuration, constructed once and shared by `Arc` with
/// every range server, scheduler, update pipeline, and RSML writer.
#[derive(Clone, Debug)]
pub struct Context {
    /// A range over this size and not already splitting is eligible for
    /// SPLIT (spec §4.14).
    pub range_split_size: u64,
    /// A range whose cache memory exceeds this is eligible for a minor
    /// COMPACT (spec §4.14).
    pub access_group_max_mem: u64,
    /// Idle scanners are reaped after this long (spec §4.10, §5).
    pub scanner_ttl: Duration,
    /// Per-table `update` calls are coalesced for up to this long, rounded
    /// up to a multiple of the scheduler tick (spec §4.9 "Group commit").
    pub group_commit_interval: Duration,
    /// Accumulated commit bytes above which `submit` blocks (spec §4.9
    /// "Back-pressure").
    pub update_pipeline_high_water: u64,
    /// Commit-log fragment roll threshold in bytes (spec §4.2 "Rolling").
    pub commit_log_roll_limit: u64,
    /// Whether a commit-log fragment may be purged only once no range
    /// still references it. Read per-log; this is the process default
    /// (spec §9 Open Question: "differs between system and user tables").
    pub range_reference_required: bool,
    /// Cap on the locator's error queue (spec §4.11 "Invalidation").
    pub max_error_queue_length: usize,
    /// Global scheduler tick used to round `group_commit_interval` and to
    /// drive `crontab`-based maintenance triggers (spec §4.9, §6.5).
    pub scheduler_tick: Duration,
    /// Bound on the maintenance worker pool (spec §4.14, §5).
    pub maintenance_pool_size: usize,
    /// Query-cache memory budget in bytes (spec §4.12).
    pub query_cache_memory: u64,
}

impl Default for Context {
    fn default() -> Self {
        Self {
            range_split_size: 200 << 20,
            access_group_max_mem: 50 << 20,
            scanner_ttl: Duration::from_secs(120),
            group_commit_interval: Duration::from_millis(50),
            update_pipeline_high_water: 64 << 20,
            commit_log_roll_limit: 100 << 20,
            range_reference_required: true,
            max_error_queue_length: 50,
            scheduler_tick: Duration::from_millis(10),
            maintenance_pool_size: 4,
            query_cache_memory: 32 << 20,
        }
    }
}

impl Context {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn defaults_are_internally_consistent() {
        let ctx = Context::new();
        assert!(ctx.access_group_max_mem < ctx.range_split_size);
        assert!(ctx.scheduler_tick < ctx.group_commit_interval);
    }
}
