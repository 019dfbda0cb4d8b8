//! Configuration for the bridging core.
//!
//! Plain struct plus defaults so library embedders construct it directly;
//! the demo daemon layers a clap parser on top of these same fields.

use std::time::Duration;

// ---------------------------------------------------------------------------
// Defaults — kept here so tests and embedders can import them directly.
// ---------------------------------------------------------------------------

/// Default upper bound on the idle queue. The idle-filler pauses promotion
/// of newly registered URLs while the idle count sits above this.
pub const DEFAULT_MAX_IDLE_CONNECTIONS: i64 = 5;

/// Default per-backend error threshold. A backend whose cumulative error
/// count reaches this is dropped from the fleet permanently.
pub const DEFAULT_MAX_ALLOWED_ERROR_COUNT: u64 = 100;

/// Default per-pipe ceiling for client→backend bytes staged in memory while
/// the backend slot is vacant.
pub const DEFAULT_INTERRUPT_MEMORY_LIMIT_PER_CONN_IN_BYTES: usize = 5 * 1024 * 1024; // 5 MiB

// ---------------------------------------------------------------------------
// ProxyConfig
// ---------------------------------------------------------------------------

/// Knobs for one pool/manager pair.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    // ---
    /// Upper bound on the idle queue; the filler pauses above this.
    pub max_idle_connections: i64,

    /// Per-backend error threshold above which a URL is permanently dropped.
    pub max_allowed_error_count: u64,

    /// Per-pipe staging buffer ceiling in bytes.
    pub interrupt_memory_limit_per_conn_in_bytes: usize,

    /// Cap on the total time one `get_conn` call may spend backing off on an
    /// empty idle queue. `None` (the default) blocks indefinitely; callers
    /// wanting a bound set this and handle `NoBackendAvailable`.
    pub max_acquire_wait: Option<Duration>,
}

// ---

impl Default for ProxyConfig {
    // ---
    fn default() -> Self {
        Self {
            max_idle_connections: DEFAULT_MAX_IDLE_CONNECTIONS,
            max_allowed_error_count: DEFAULT_MAX_ALLOWED_ERROR_COUNT,
            interrupt_memory_limit_per_conn_in_bytes:
                DEFAULT_INTERRUPT_MEMORY_LIMIT_PER_CONN_IN_BYTES,
            max_acquire_wait: None,
        }
    }
}

// ---

impl ProxyConfig {
    // ---

    /// Validate fields whose constraints the type system cannot express.
    pub fn validate(&self) -> anyhow::Result<()> {
        // ---
        if self.max_idle_connections < 1 {
            anyhow::bail!(
                "max_idle_connections must be >= 1, got {}",
                self.max_idle_connections
            );
        }
        if self.max_allowed_error_count == 0 {
            anyhow::bail!("max_allowed_error_count must be > 0");
        }
        if self.interrupt_memory_limit_per_conn_in_bytes == 0 {
            anyhow::bail!("interrupt_memory_limit_per_conn_in_bytes must be > 0");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
