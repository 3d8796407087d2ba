//! Table configuration.
//!
//! The index itself has no tunables that affect correctness. What can be
//! tuned is how eagerly retired memory is handed back and how long a writer
//! spins on a contended node lock before yielding its time slice.
//!
//! ```rust
//! use masstable::config::TableConfig;
//!
//! let config = TableConfig::default()
//!     .with_reclaim_batch_size(128)
//!     .validate()
//!     .expect("valid config");
//! assert_eq!(config.reclaim_batch_size(), 128);
//! ```

use std::env;
use std::fmt as StdFmt;

use crate::tracing_helpers::warn_log;

/// Environment variable overriding [`TableConfig::reclaim_batch_size`].
pub const ENV_RECLAIM_BATCH: &str = "MASSTABLE_RECLAIM_BATCH";

/// Environment variable overriding [`TableConfig::lock_spins_before_yield`].
pub const ENV_LOCK_SPINS: &str = "MASSTABLE_LOCK_SPINS";

const DEFAULT_RECLAIM_BATCH: usize = 64;
const DEFAULT_LOCK_SPINS: u32 = 128;

// ============================================================================
//  ConfigError
// ============================================================================

/// A configuration value was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Reclamation batches must hold at least one object.
    ZeroReclaimBatch,

    /// A writer must spin at least once before yielding.
    ZeroLockSpins,

    /// An environment variable did not parse as a positive integer.
    InvalidEnv {
        /// Variable name.
        var: &'static str,
        /// The offending value.
        value: String,
    },
}

impl StdFmt::Display for ConfigError {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        match self {
            Self::ZeroReclaimBatch => write!(f, "reclaim batch size must be non-zero"),
            Self::ZeroLockSpins => write!(f, "lock spin count must be non-zero"),
            Self::InvalidEnv { var, value } => {
                write!(f, "{var}={value:?} is not a positive integer")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

// ============================================================================
//  TableConfig
// ============================================================================

/// Tunables for a [`crate::Table`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableConfig {
    reclaim_batch_size: usize,
    lock_spins_before_yield: u32,
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            reclaim_batch_size: DEFAULT_RECLAIM_BATCH,
            lock_spins_before_yield: DEFAULT_LOCK_SPINS,
        }
    }
}

impl TableConfig {
    /// Number of retired objects a thread accumulates before it tries to
    /// reclaim them.
    #[must_use]
    pub const fn reclaim_batch_size(&self) -> usize {
        self.reclaim_batch_size
    }

    /// Busy-wait iterations on a locked node before `yield_now`.
    #[must_use]
    pub const fn lock_spins_before_yield(&self) -> u32 {
        self.lock_spins_before_yield
    }

    /// Set the reclamation batch size.
    #[must_use]
    pub const fn with_reclaim_batch_size(mut self, size: usize) -> Self {
        self.reclaim_batch_size = size;
        self
    }

    /// Set the lock spin count.
    #[must_use]
    pub const fn with_lock_spins_before_yield(mut self, spins: u32) -> Self {
        self.lock_spins_before_yield = spins;
        self
    }

    /// Reject values the table cannot run with.
    ///
    /// # Errors
    /// [`ConfigError::ZeroReclaimBatch`] or [`ConfigError::ZeroLockSpins`].
    pub fn validate(self) -> Result<Self, ConfigError> {
        if self.reclaim_batch_size == 0 {
            return Err(ConfigError::ZeroReclaimBatch);
        }
        if self.lock_spins_before_yield == 0 {
            return Err(ConfigError::ZeroLockSpins);
        }
        Ok(self)
    }

    /// Defaults overridden by [`ENV_RECLAIM_BATCH`] and [`ENV_LOCK_SPINS`].
    ///
    /// # Errors
    /// [`ConfigError::InvalidEnv`] if a variable is set but unparsable, or any
    /// error from [`validate`](Self::validate).
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(batch) = parse_env::<usize>(ENV_RECLAIM_BATCH)? {
            config.reclaim_batch_size = batch;
        }
        if let Some(spins) = parse_env::<u32>(ENV_LOCK_SPINS)? {
            config.lock_spins_before_yield = spins;
        }

        config.validate()
    }
}

fn parse_env<T: std::str::FromStr>(var: &'static str) -> Result<Option<T>, ConfigError> {
    match env::var(var) {
        Ok(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| {
                warn_log!(var, value = %value, "rejecting unparsable configuration variable");
                ConfigError::InvalidEnv { var, value }
            }),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config: TableConfig = TableConfig::default();
        assert_eq!(config.validate(), Ok(config));
    }

    #[test]
    fn test_zero_values_rejected() {
        let zero_batch = TableConfig::default().with_reclaim_batch_size(0);
        assert_eq!(zero_batch.validate(), Err(ConfigError::ZeroReclaimBatch));

        let zero_spins = TableConfig::default().with_lock_spins_before_yield(0);
        assert_eq!(zero_spins.validate(), Err(ConfigError::ZeroLockSpins));
    }

    #[test]
    fn test_error_display() {
        let err = ConfigError::InvalidEnv {
            var: ENV_LOCK_SPINS,
            value: "lots".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "MASSTABLE_LOCK_SPINS=\"lots\" is not a positive integer"
        );
    }

    #[test]
    fn test_parse_env_rejects_garbage() {
        const VAR: &str = "MASSTABLE_TEST_GARBAGE_VALUE";
        // SAFETY: no other test reads or writes this variable.
        unsafe { env::set_var(VAR, "lots") };
        let parsed: Result<Option<u32>, ConfigError> = parse_env(VAR);
        assert_eq!(
            parsed,
            Err(ConfigError::InvalidEnv {
                var: VAR,
                value: "lots".to_string(),
            })
        );
    }

    #[test]
    fn test_parse_env_missing_is_none() {
        let parsed: Result<Option<usize>, ConfigError> =
            parse_env("MASSTABLE_TEST_SURELY_UNSET_VARIABLE");
        assert_eq!(parsed, Ok(None));
    }
}
