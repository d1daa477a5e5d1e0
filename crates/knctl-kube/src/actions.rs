//! Options for service lifecycle operations

use std::time::Duration;

use crate::wait::WaitConfig;

/// Attempts of the force-replace update loop
pub const REPLACE_ATTEMPTS: u32 = 3;

/// Default attempts of the update loop
pub const DEFAULT_UPDATE_ATTEMPTS: u32 = 3;

/// Pause between attempts after a conflict
pub const CONFLICT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Options for create
#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    /// Replace an existing service of the same name
    pub force: bool,

    /// Wait for readiness
    pub wait: Option<WaitConfig>,
}

impl CreateOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace on name collision
    pub fn with_force(mut self) -> Self {
        self.force = true;
        self
    }

    /// Wait for the service to become ready
    pub fn with_wait(mut self, config: WaitConfig) -> Self {
        self.wait = Some(config);
        self
    }
}

/// Options for update
#[derive(Debug, Clone)]
pub struct UpdateOptions {
    /// Attempts before a persistent conflict is reported
    pub max_attempts: u32,

    /// Wait for readiness
    pub wait: Option<WaitConfig>,
}

impl Default for UpdateOptions {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_UPDATE_ATTEMPTS,
            wait: None,
        }
    }
}

impl UpdateOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_wait(mut self, config: WaitConfig) -> Self {
        self.wait = Some(config);
        self
    }
}

/// Options for apply
#[derive(Debug, Clone, Default)]
pub struct ApplyOptions {
    pub wait: Option<WaitConfig>,
}

impl ApplyOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_wait(mut self, config: WaitConfig) -> Self {
        self.wait = Some(config);
        self
    }
}

/// Options for delete
#[derive(Debug, Clone, Default)]
pub struct DeleteOptions {
    /// Wait for the `Deleted` event for at most this long; `None` deletes in
    /// the background and returns at once
    pub wait: Option<Duration>,
}

impl DeleteOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_wait(mut self, timeout: Duration) -> Self {
        self.wait = Some(timeout);
        self
    }
}

/// Options for import
#[derive(Debug, Clone, Default)]
pub struct ImportOptions {
    pub wait: Option<WaitConfig>,
}

impl ImportOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_wait(mut self, config: WaitConfig) -> Self {
        self.wait = Some(config);
        self
    }
}

/// Options for migrate
#[derive(Debug, Clone)]
pub struct MigrateOptions {
    /// Replace services already present at the destination
    pub force: bool,

    /// Delete each source service once copied
    pub delete_source: bool,

    /// Timeout for deletions at the destination during a forced migration
    pub delete_timeout: Duration,

    /// Wait for each migrated service to become ready
    pub wait: Option<WaitConfig>,
}

impl Default for MigrateOptions {
    fn default() -> Self {
        Self {
            force: false,
            delete_source: false,
            delete_timeout: crate::wait::DEFAULT_WAIT_TIMEOUT,
            wait: None,
        }
    }
}

impl MigrateOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_force(mut self) -> Self {
        self.force = true;
        self
    }

    pub fn with_delete_source(mut self) -> Self {
        self.delete_source = true;
        self
    }

    pub fn with_wait(mut self, config: WaitConfig) -> Self {
        self.wait = Some(config);
        self
    }
}
