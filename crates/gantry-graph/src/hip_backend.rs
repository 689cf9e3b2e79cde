//! HIP graph mapper.
//!
//! Same node-graph shape as the CUDA mapper — the memset primitive is
//! likewise capped at 4-byte elements and wide fills decompose into
//! strided chains — but the driver model exposes no mutable-dispatch
//! path, so devices report no kernel-update support and updatable
//! buffer creation fails here.

use std::sync::Arc;

use gantry_core::{Context, Device, DeviceCaps, HintPolicy, Result};

use crate::backend::{GraphBackend, GraphBuilder};
use crate::command_buffer::CommandBufferDesc;
use crate::node::NodeGraphBuilder;

pub struct HipGraphBackend;

impl HipGraphBackend {
    pub const fn new() -> Self {
        Self
    }
}

impl Default for HipGraphBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl GraphBackend for HipGraphBackend {
    fn name(&self) -> &'static str {
        "hip"
    }

    fn device_caps(&self) -> DeviceCaps {
        DeviceCaps {
            kernel_update: false,
            event_rebind: false,
            usm_ops: true,
            host_transfer: true,
            native_fill_widths: vec![1, 2, 4],
            max_fill_pattern_width: 128,
            hint_policy: HintPolicy::DegradeWarn,
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
