//! # System Constants
//!
//! Event names, feature flag names and default limits shared by the three
//! engine components.

/// Lifecycle event names published through the [`crate::events::EventPublisher`]
pub mod events {
    // Execution lifecycle events
    pub const EXECUTION_STARTED: &str = "execution.started";
    pub const EXECUTION_SUSPENDED: &str = "execution.suspended";
    pub const EXECUTION_RESUMED: &str = "execution.resumed";
    pub const EXECUTION_COMPLETED: &str = "execution.completed";

    // Resource constraint events
    pub const RESTRAINT_CONSUMER_UNBLOCKED: &str = "restraint.consumer_unblocked";
    pub const RESTRAINT_CONSUMER_FINISHED: &str = "restraint.consumer_finished";

    // Verification events
    pub const VERIFICATION_STATE_TRANSITION: &str = "verification.state_transition";
}

/// Feature flags consulted through [`crate::config::FeatureFlags`]
pub mod flags {
    /// Enables the max-queue-length gate on resource constraint registration
    pub const RESOURCE_CONSTRAINT_MAX_QUEUE: &str = "RESOURCE_CONSTRAINT_MAX_QUEUE";
}

pub mod system {
    /// Capacity of a resource unit with no explicit override
    pub const DEFAULT_RESOURCE_CAPACITY: i32 = 1;

    /// Callback timeout used when an executable does not supply one
    pub const DEFAULT_CALLBACK_TIMEOUT_MS: u64 = 10 * 60 * 1000;

    /// How long the waiter keeps unclaimed responses and completed ids
    pub const DEFAULT_RESPONSE_RETENTION_SECS: u64 = 60 * 60;

    /// Queue length past which consumers are rejected when the gate is enabled
    pub const DEFAULT_MAX_QUEUE_LENGTH: usize = 20;

    pub const DEFAULT_MAX_RETRY: u32 = 3;
}
