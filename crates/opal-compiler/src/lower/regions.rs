//! Region Tree
//!
//! Nests the flat region metadata recorded by the front end into a tree
//! by block-set containment, maps every block to its innermost region,
//! and annotates each region with the suspension points it contains.
//! Because an ancestor's block set is a superset of its descendants',
//! a node's suspension list is transitive by construction.

use crate::error::{LowerError, LowerResult};
use crate::ir::{BasicBlockId, IrFunction, RegionId, RegionKind, SuspendId};
use rustc_hash::{FxHashMap, FxHashSet};

/// One node of the region tree
#[derive(Debug)]
pub struct RegionNode {
    /// Region identifier (index into `IrFunction::regions` is `info_index`)
    pub region: RegionId,
    pub info_index: usize,
    pub parent: Option<usize>,
    pub children: Vec<usize>,
    /// All blocks of the region, including handlers and cleanup blocks
    pub blocks: FxHashSet<BasicBlockId>,
    /// Blocks belonging to the region's finally clause, if any
    pub finally_blocks: FxHashSet<BasicBlockId>,
    /// Suspension points whose block lies inside this region
    pub suspends: Vec<SuspendId>,
    /// Whether the region has cleanup to run when it exits
    pub has_cleanup: bool,
}

/// Region tree over a function body
#[derive(Debug, Default)]
pub struct RegionTree {
    pub nodes: Vec<RegionNode>,
    innermost: FxHashMap<BasicBlockId, usize>,
}

impl RegionTree {
    /// Build the tree from a function's region metadata
    pub fn build(func: &IrFunction) -> LowerResult<RegionTree> {
        let mut nodes: Vec<RegionNode> = func
            .regions
            .iter()
            .enumerate()
            .map(|(info_index, info)| {
                let blocks: FxHashSet<BasicBlockId> = info.all_blocks().into_iter().collect();
                let finally_blocks = match &info.kind {
                    RegionKind::Try {
                        finally: Some(finally),
                        ..
                    } => finally.blocks.iter().copied().collect(),
                    _ => FxHashSet::default(),
                };
                RegionNode {
                    region: info.id,
                    info_index,
                    parent: None,
                    children: Vec::new(),
                    blocks,
                    finally_blocks,
                    suspends: Vec::new(),
                    has_cleanup: info.has_cleanup(),
                }
            })
            .collect();

        // Parent: the smallest strict superset. Region metadata produced by
        // the builder is properly nested; anything else is rejected.
        for i in 0..nodes.len() {
            let mut parent: Option<usize> = None;
            for j in 0..nodes.len() {
                if i == j {
                    continue;
                }
                let disjoint = nodes[i].blocks.is_disjoint(&nodes[j].blocks);
                let contained = nodes[i].blocks.is_subset(&nodes[j].blocks);
                if disjoint {
                    continue;
                }
                if !contained && !nodes[j].blocks.is_subset(&nodes[i].blocks) {
                    return Err(LowerError::MalformedRegion {
                        function: func.name.clone(),
                        region: nodes[i].region.as_u32(),
                    });
                }
                if contained && nodes[i].blocks.len() < nodes[j].blocks.len() {
                    match parent {
                        Some(p) if nodes[p].blocks.len() <= nodes[j].blocks.len() => {}
                        _ => parent = Some(j),
                    }
                }
            }
            nodes[i].parent = parent;
        }
        for i in 0..nodes.len() {
            if let Some(p) = nodes[i].parent {
                nodes[p].children.push(i);
            }
        }

        // Innermost region per block: the smallest containing set.
        let mut innermost: FxHashMap<BasicBlockId, usize> = FxHashMap::default();
        for (idx, node) in nodes.iter().enumerate() {
            for &block in &node.blocks {
                match innermost.get(&block) {
                    Some(&prev) if nodes[prev].blocks.len() <= node.blocks.len() => {}
                    _ => {
                        innermost.insert(block, idx);
                    }
                }
            }
        }

        // Suspension annotation.
        for point in func.suspend_points() {
            for node in nodes.iter_mut() {
                if node.blocks.contains(&point.block) {
                    node.suspends.push(point.point);
                }
            }
        }

        Ok(RegionTree { nodes, innermost })
    }

    /// The innermost region node containing a block, if any
    pub fn node_of_block(&self, block: BasicBlockId) -> Option<usize> {
        self.innermost.get(&block).copied()
    }

    /// Enclosing region nodes of a block, innermost first
    pub fn chain(&self, block: BasicBlockId) -> Vec<usize> {
        let mut out = Vec::new();
        let mut cursor = self.node_of_block(block);
        while let Some(idx) = cursor {
            out.push(idx);
            cursor = self.nodes[idx].parent;
        }
        out
    }

    /// Whether `block` lies inside the finally clause of any region
    pub fn in_cleanup(&self, block: BasicBlockId) -> bool {
        self.nodes.iter().any(|n| n.finally_blocks.contains(&block))
    }
}
