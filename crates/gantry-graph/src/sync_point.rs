//! Sync points: opaque tokens naming one recorded command's completion.

use gantry_core::{Error, Result};

use crate::backend::NodeId;

/// Opaque dependency token minted by an append call.
///
/// Valid only within the command buffer that minted it; tokens carry
/// their owner so cross-buffer use is caught as `InvalidValue`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SyncPoint {
    owner: u64,
    index: u32,
}

impl SyncPoint {
    /// Raw token value, strictly increasing within the owning buffer.
    pub const fn raw(&self) -> u32 {
        self.index
    }
}

/// Append-only map from sync point to native node. One per command
/// buffer.
#[derive(Debug)]
pub(crate) struct SyncPointRegistry {
    owner: u64,
    nodes: Vec<NodeId>,
}

impl SyncPointRegistry {
    pub fn new(owner: u64) -> Self {
        Self { owner, nodes: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Mint the next token, binding it to `node`.
    pub fn mint(&mut self, node: NodeId) -> SyncPoint {
        let index = u32::try_from(self.nodes.len()).expect("sync point space exhausted");
        self.nodes.push(node);
        SyncPoint { owner: self.owner, index }
    }

    /// Resolve a wait list to native node ids.
    pub fn resolve(&self, waits: &[SyncPoint]) -> Result<Vec<NodeId>> {
        let mut nodes = Vec::with_capacity(waits.len());
        for sp in waits {
            if sp.owner != self.owner {
                return Err(Error::InvalidValue(format!(
                    "sync point {} was minted by another command buffer",
                    sp.index,
                )));
            }
            let node = self.nodes.get(sp.index as usize).ok_or_else(|| {
                Error::InvalidValue(format!("unknown sync point {}", sp.index))
            })?;
            nodes.push(*node);
        }
        Ok(nodes)
    }
}
