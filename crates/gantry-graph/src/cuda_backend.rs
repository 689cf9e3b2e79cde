//! CUDA graph mapper.
//!
//! Models a node-graph driver: kernel, memset, memcpy and empty nodes
//! with predecessor edges, instantiated into an executable graph whose
//! kernel nodes can be mutated in place (the exec-node parameter-update
//! capability). The memset primitive writes at most 4-byte elements, so
//! wider fill patterns are decomposed into strided node chains.
//! Prefetch and advise hints degrade to empty pass-through nodes with a
//! warning.

use std::sync::Arc;

use gantry_core::{Context, Device, DeviceCaps, HintPolicy, Result};

use crate::backend::{GraphBackend, GraphBuilder};
use crate::command_buffer::CommandBufferDesc;
use crate::node::NodeGraphBuilder;

/// Largest element width a single memset node carries.
const MAX_MEMSET_ELEM_WIDTH: usize = 4;

pub struct CudaGraphBackend;

impl CudaGraphBackend {
    pub const fn new() -> Self {
        Self
    }
}

impl Default for CudaGraphBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl GraphBackend for CudaGraphBackend {
    fn name(&self) -> &'static str {
        "cuda"
    }

    fn device_caps(&self) -> DeviceCaps {
        DeviceCaps {
            kernel_update: true,
            event_rebind: false,
            usm_ops: true,
            host_transfer: true,
            native_fill_widths: vec![1, 2, MAX_MEMSET_ELEM_WIDTH],
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
        Ok(Box::new(NodeGraphBuilder::new(self.name(), self.device_caps(), true)))
    }
}
