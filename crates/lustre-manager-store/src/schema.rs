//! Database schema definitions and column families.

/// Column family names for the `RocksDB` database.
pub mod cf {
    /// Entity records, keyed by `class_tag || entity_id`.
    pub const ENTITIES: &str = "entities";

    /// Command records, keyed by `command_id`.
    pub const COMMANDS: &str = "commands";

    /// Index: commands that are not yet complete, keyed by `command_id`.
    pub const COMMANDS_INCOMPLETE: &str = "commands_incomplete";

    /// Job records, keyed by `job_id`.
    pub const JOBS: &str = "jobs";

    /// Index: jobs that are not yet complete, keyed by `job_id`.
    pub const JOBS_INCOMPLETE: &str = "jobs_incomplete";

    /// Step results, keyed by `job_id || step_result_id`.
    pub const STEP_RESULTS: &str = "step_results";

    /// Alert records, keyed by `alert_id`.
    pub const ALERTS: &str = "alerts";

    /// Index: active alerts, keyed by `variant || subject`, value `alert_id`.
    pub const ALERTS_ACTIVE: &str = "alerts_active";

    /// Monotonic id counters, keyed by id space name.
    pub const COUNTERS: &str = "counters";
}

/// Returns all column family names for database initialization.
#[must_use]
pub fn all_column_families() -> Vec<&'static str> {
    vec![
        cf::ENTITIES,
        cf::COMMANDS,
        cf::COMMANDS_INCOMPLETE,
        cf::JOBS,
        cf::JOBS_INCOMPLETE,
        cf::STEP_RESULTS,
        cf::ALERTS,
        cf::ALERTS_ACTIVE,
        cf::COUNTERS,
    ]
}
