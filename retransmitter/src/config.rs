//! Sizing constants and per-instance configuration.
//!
//! The table sizes are fixed when an instance is built; nothing resizes at
//! runtime.  [`RetransmitterConfig::default`] uses the constants below, tests
//! build smaller instances to reach exhaustion quickly.

use std::time::Duration;

use thiserror::Error;

/// Number of tracking slots shared by all connections of one instance.
pub const META_TABLE_SIZE: usize = 2000;

/// Number of connections (pointer table entries) per instance.
pub const MAX_QPS: usize = 500;

/// Depth of the table request/response and recycle FIFOs.
pub const INTERNAL_FIFO_DEPTH: usize = 2;

/// Depth of the request input FIFOs and the event output FIFO.
pub const IO_FIFO_DEPTH: usize = 32;

/// Slot ids are 16 bits wide.
const MAX_SLOT_IDS: usize = u16::MAX as usize + 1;

/// QPNs are 16 bits wide.
const MAX_QPNS: usize = u16::MAX as usize + 1;

/// A configuration the tables cannot be built with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("capacity {0} must be in 1..=65536")]
    Capacity(usize),
    #[error("max_qps {0} must be in 1..=65536")]
    MaxQps(usize),
    #[error("{0} must be at least 1")]
    ZeroDepth(&'static str),
}

/// Per-instance parameters.
#[derive(Debug, Clone)]
pub struct RetransmitterConfig {
    /// Tracking-table slots (CAPACITY).  At most `u16::MAX + 1`.
    pub capacity: usize,
    /// Pointer-table entries; valid QPNs are `0..max_qps`.
    pub max_qps: usize,
    /// Depth of the internal table FIFOs.
    pub fifo_depth: usize,
    /// Depth of each request input FIFO and of the event output FIFO.
    pub io_depth: usize,
    /// Tag used in log lines to tell sharded instances apart.
    pub instance_id: u32,
    /// How long a spawned process sleeps after a step with no work.
    pub idle_poll: Duration,
}

impl Default for RetransmitterConfig {
    fn default() -> Self {
        Self {
            capacity: META_TABLE_SIZE,
            max_qps: MAX_QPS,
            fifo_depth: INTERNAL_FIFO_DEPTH,
            io_depth: IO_FIFO_DEPTH,
            instance_id: 0,
            idle_poll: Duration::from_micros(50),
        }
    }
}

impl RetransmitterConfig {
    /// Default sizing with a different slot capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            ..Self::default()
        }
    }

    /// Check every size against the widths the tables use.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.capacity == 0 || self.capacity > MAX_SLOT_IDS {
            return Err(ConfigError::Capacity(self.capacity));
        }
        if self.max_qps == 0 || self.max_qps > MAX_QPNS {
            return Err(ConfigError::MaxQps(self.max_qps));
        }
        if self.fifo_depth == 0 {
            return Err(ConfigError::ZeroDepth("fifo_depth"));
        }
        if self.io_depth == 0 {
            return Err(ConfigError::ZeroDepth("io_depth"));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        let config = RetransmitterConfig::default();
        assert_eq!(config.capacity, META_TABLE_SIZE);
        assert_eq!(config.max_qps, MAX_QPS);
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn capacity_must_fit_slot_ids() {
        assert_eq!(
            RetransmitterConfig::with_capacity(0).validate(),
            Err(ConfigError::Capacity(0))
        );
        assert_eq!(RetransmitterConfig::with_capacity(MAX_SLOT_IDS).validate(), Ok(()));
        assert_eq!(
            RetransmitterConfig::with_capacity(MAX_SLOT_IDS + 1).validate(),
            Err(ConfigError::Capacity(MAX_SLOT_IDS + 1))
        );
    }

    #[test]
    fn rejects_zero_qps_and_depths() {
        let base = RetransmitterConfig::default();
        let no_qps = RetransmitterConfig { max_qps: 0, ..base.clone() };
        assert_eq!(no_qps.validate(), Err(ConfigError::MaxQps(0)));

        let no_fifo = RetransmitterConfig { fifo_depth: 0, ..base.clone() };
        assert_eq!(no_fifo.validate(), Err(ConfigError::ZeroDepth("fifo_depth")));

        let no_io = RetransmitterConfig { io_depth: 0, ..base };
        assert_eq!(no_io.validate(), Err(ConfigError::ZeroDepth("io_depth")));
    }
}
