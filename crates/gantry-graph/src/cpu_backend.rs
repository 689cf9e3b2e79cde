//! CPU fallback mapper.
//!
//! Always available: the node arena is executed directly on host
//! memory in dependency order. Any power-of-two fill width up to the
//! device maximum is native, prefetch/advise hints are inert successes,
//! and no update path exists.

use std::sync::Arc;

use gantry_core::{Context, Device, DeviceCaps, HintPolicy, Result};

use crate::backend::{GraphBackend, GraphBuilder};
use crate::command_buffer::CommandBufferDesc;
use crate::node::NodeGraphBuilder;

pub struct CpuGraphBackend;

impl CpuGraphBackend {
    pub const fn new() -> Self {
        Self
    }
}

impl Default for CpuGraphBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl GraphBackend for CpuGraphBackend {
    fn name(&self) -> &'static str {
        "cpu"
    }

    fn device_caps(&self) -> DeviceCaps {
        DeviceCaps {
            kernel_update: false,
            event_rebind: false,
            usm_ops: true,
            host_transfer: true,
            native_fill_widths: vec![1, 2, 4, 8, 16, 32, 64, 128],
            max_fill_pattern_width: 128,
            hint_policy: HintPolicy::Inert,
        }
    }

    fn create_builder(
        &self,
        _context: &Arc<Context>,
        _device: &Arc<Device>,
        _desc: &CommandBufferDesc,
    ) -> Result<Box<dyn GraphBuilder>> {
        Ok(Box::new(NodeGraphBuilder::new(self.name(), self.device_caps(), false)))
    }
}
