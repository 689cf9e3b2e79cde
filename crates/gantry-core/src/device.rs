//! Device snapshots and the capability set back ends advertise.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

static NEXT_DEVICE_ID: AtomicU64 = AtomicU64::new(1);

/// Policy a back end applies to USM prefetch/advise hints its native
/// graph API cannot express.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HintPolicy {
    /// The native API has a real command for the hint.
    Native,
    /// The hint is meaningless on this back end; accepted silently.
    Inert,
    /// Replaced with an inert pass-through node so dependency edges
    /// survive; a warning is emitted.
    DegradeWarn,
    /// Rejected as an unsupported feature.
    HardFail,
}

impl fmt::Display for HintPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Native => write!(f, "native"),
            Self::Inert => write!(f, "inert"),
            Self::DegradeWarn => write!(f, "degrade-with-warning"),
            Self::HardFail => write!(f, "hard-fail"),
        }
    }
}

/// Capability set a device reports for the command-graph layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceCaps {
    /// Recorded kernel commands can be mutated after finalize.
    pub kernel_update: bool,
    /// Recorded commands bind per-node wait/signal events that can be
    /// rebound after finalize.
    pub event_rebind: bool,
    /// USM memcpy/fill/prefetch/advise operations are recordable.
    pub usm_ops: bool,
    /// Host-to-buffer read/write operations are recordable.
    pub host_transfer: bool,
    /// Element widths the native fill primitive accepts directly; wider
    /// power-of-two patterns are decomposed.
    pub native_fill_widths: Vec<usize>,
    /// Largest fill pattern width accepted at all.
    pub max_fill_pattern_width: usize,
    /// Treatment of prefetch/advise hints.
    pub hint_policy: HintPolicy,
}

impl DeviceCaps {
    /// True when `width` can be emitted as a single native fill node.
    pub fn fill_width_is_native(&self, width: usize) -> bool {
        self.native_fill_widths.contains(&width)
    }
}

/// Snapshot of one device as the command-graph layer sees it.
#[derive(Debug)]
pub struct Device {
    id: u64,
    name: String,
    caps: DeviceCaps,
}

impl Device {
    pub fn new(name: impl Into<String>, caps: DeviceCaps) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_DEVICE_ID.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
            caps,
        })
    }

    pub const fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub const fn caps(&self) -> &DeviceCaps {
        &self.caps
    }

    /// Capability query used by updatable command-buffer creation.
    pub fn supports_kernel_update(&self) -> bool {
        self.caps.kernel_update
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Device(id={}, '{}')", self.id, self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps() -> DeviceCaps {
        DeviceCaps {
            kernel_update: true,
            event_rebind: false,
            usm_ops: true,
            host_transfer: true,
            native_fill_widths: vec![1, 2, 4],
            max_fill_pattern_width: 128,
            hint_policy: HintPolicy::DegradeWarn,
        }
    }

    #[test]
    fn ids_are_unique() {
        let a = Device::new("a", caps());
        let b = Device::new("b", caps());
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn native_fill_width_lookup() {
        let c = caps();
        assert!(c.fill_width_is_native(4));
        assert!(!c.fill_width_is_native(8));
    }

    #[test]
    fn update_capability_query() {
        let dev = Device::new("updatable", caps());
        assert!(dev.supports_kernel_update());
    }

    #[test]
    fn hint_policy_serde_roundtrip() {
        let json = serde_json::to_string(&HintPolicy::DegradeWarn).unwrap();
        let back: HintPolicy = serde_json::from_str(&json).unwrap();
        assert_eq!(back, HintPolicy::DegradeWarn);
    }
}
