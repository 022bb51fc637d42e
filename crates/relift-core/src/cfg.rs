//! Control flow graph representation.
//!
//! The graph owns its blocks in an arena; every other component refers to
//! them by [`BlockId`]. Two orderings coexist over the same block set:
//! creation order (iteration) and the reverse-postorder array computed once
//! per analysis cycle and reused by every traversal.

use indexmap::IndexMap;

use crate::{BasicBlock, BlockId, Edge, EdgeKind, Error};

/// A control flow graph for one procedure.
#[derive(Debug, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Cfg {
    /// Entry block.
    pub entry: BlockId,
    /// All blocks, in creation order; `BlockId` indexes this arena.
    blocks: Vec<BasicBlock>,
    /// Blocks in reverse postorder; entry first. Recomputed by
    /// [`Cfg::compute_rpo`].
    rpo: Vec<BlockId>,
    /// Owning block of each instruction position.
    owner: IndexMap<usize, BlockId>,
}

impl Cfg {
    /// Creates an empty graph. The entry defaults to the first block added.
    pub fn new() -> Self {
        Self {
            entry: BlockId::ENTRY,
            blocks: Vec::new(),
            rpo: Vec::new(),
            owner: IndexMap::new(),
        }
    }

    /// Appends a block, registering its instruction range. The block's `id`
    /// field is assigned here.
    pub fn add_block(&mut self, mut block: BasicBlock) -> BlockId {
        let id = BlockId::new(self.blocks.len() as u32);
        block.id = id;
        for pos in block.range() {
            self.owner.insert(pos, id);
        }
        self.blocks.push(block);
        id
    }

    /// Adds a typed edge, maintaining both edge lists.
    pub fn add_edge(&mut self, from: BlockId, kind: EdgeKind, to: BlockId) {
        self.blocks[from.index()].out_edges.push(Edge { kind, to });
        self.blocks[to.index()].in_edges.push(from);
    }

    /// Returns a block by ID.
    pub fn block(&self, id: BlockId) -> Option<&BasicBlock> {
        self.blocks.get(id.index())
    }

    /// Returns a mutable block by ID.
    pub fn block_mut(&mut self, id: BlockId) -> Option<&mut BasicBlock> {
        self.blocks.get_mut(id.index())
    }

    /// Iterates blocks in creation order.
    pub fn blocks(&self) -> impl Iterator<Item = &BasicBlock> {
        self.blocks.iter()
    }

    /// Iterates blocks mutably in creation order.
    pub fn blocks_mut(&mut self) -> impl Iterator<Item = &mut BasicBlock> {
        self.blocks.iter_mut()
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// The block owning the given instruction position.
    pub fn block_at(&self, pos: usize) -> Result<BlockId, Error> {
        self.owner
            .get(&pos)
            .copied()
            .ok_or(Error::PositionNotFound(pos))
    }

    /// Blocks in reverse postorder, entry first.
    pub fn rpo(&self) -> &[BlockId] {
        &self.rpo
    }

    /// Computes the reverse-postorder array and per-block depth-first
    /// numbers. Unreachable blocks are appended after the reachable ones so
    /// the array always covers the whole arena.
    pub fn compute_rpo(&mut self) {
        let n = self.blocks.len();
        if n == 0 {
            self.rpo.clear();
            return;
        }

        let mut visited = vec![false; n];
        let mut first = vec![0u32; n];
        let mut post_order: Vec<BlockId> = Vec::with_capacity(n);
        let mut next_first = 0u32;

        fn dfs(
            blocks: &[BasicBlock],
            id: BlockId,
            visited: &mut [bool],
            first: &mut [u32],
            next_first: &mut u32,
            post_order: &mut Vec<BlockId>,
        ) {
            if std::mem::replace(&mut visited[id.index()], true) {
                return;
            }
            first[id.index()] = *next_first;
            *next_first += 1;
            for edge in &blocks[id.index()].out_edges {
                dfs(blocks, edge.to, visited, first, next_first, post_order);
            }
            post_order.push(id);
        }

        dfs(
            &self.blocks,
            self.entry,
            &mut visited,
            &mut first,
            &mut next_first,
            &mut post_order,
        );
        post_order.reverse();
        let mut rpo = post_order;

        // Unreachable blocks go after the reachable ones, so the entry is
        // always rpo[0].
        let mut rest = Vec::new();
        for i in 0..n {
            let id = BlockId::new(i as u32);
            if !visited[i] {
                dfs(
                    &self.blocks,
                    id,
                    &mut visited,
                    &mut first,
                    &mut next_first,
                    &mut rest,
                );
            }
        }
        rest.reverse();
        rpo.extend(rest);

        for (order, &id) in rpo.iter().enumerate() {
            self.blocks[id.index()].dfs_first = first[id.index()];
            self.blocks[id.index()].dfs_last = order as u32;
        }
        self.rpo = rpo;
    }

    /// Irreducible-graph repair by node splitting. Declared for the
    /// structuring stage but intentionally unimplemented; fails visibly
    /// rather than producing an incorrect graph.
    pub fn node_splitting(&mut self) -> Result<(), Error> {
        log::error!("attempt to perform node splitting: not implemented");
        Err(Error::NodeSplitting)
    }
}

impl std::ops::Index<BlockId> for Cfg {
    type Output = BasicBlock;

    fn index(&self, id: BlockId) -> &BasicBlock {
        &self.blocks[id.index()]
    }
}

impl std::ops::IndexMut<BlockId> for Cfg {
    fn index_mut(&mut self, id: BlockId) -> &mut BasicBlock {
        &mut self.blocks[id.index()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BlockKind;

    fn block(start: usize, len: usize, kind: BlockKind) -> BasicBlock {
        BasicBlock::new(BlockId::ENTRY, start, len, kind)
    }

    /// bb0 -> bb1 -> bb3, bb0 -> bb2 -> bb3
    fn diamond() -> Cfg {
        let mut cfg = Cfg::new();
        let b0 = cfg.add_block(block(0, 1, BlockKind::TwoWay));
        let b1 = cfg.add_block(block(1, 1, BlockKind::Fall));
        let b2 = cfg.add_block(block(2, 1, BlockKind::Fall));
        let b3 = cfg.add_block(block(3, 1, BlockKind::Return));
        cfg.add_edge(b0, EdgeKind::Then, b1);
        cfg.add_edge(b0, EdgeKind::Else, b2);
        cfg.add_edge(b1, EdgeKind::Fall, b3);
        cfg.add_edge(b2, EdgeKind::Fall, b3);
        cfg.compute_rpo();
        cfg
    }

    #[test]
    fn test_add_block_assigns_ids() {
        let cfg = diamond();
        assert_eq!(cfg.num_blocks(), 4);
        for (i, bb) in cfg.blocks().enumerate() {
            assert_eq!(bb.id, BlockId::new(i as u32));
        }
    }

    #[test]
    fn test_edges_symmetric() {
        let cfg = diamond();
        for bb in cfg.blocks() {
            for edge in &bb.out_edges {
                assert!(cfg[edge.to].in_edges.contains(&bb.id));
            }
        }
    }

    #[test]
    fn test_block_at() {
        let cfg = diamond();
        assert_eq!(cfg.block_at(0).unwrap(), BlockId::new(0));
        assert_eq!(cfg.block_at(3).unwrap(), BlockId::new(3));
        assert!(cfg.block_at(17).is_err());
    }

    #[test]
    fn test_rpo_entry_first_join_last() {
        let cfg = diamond();
        let rpo = cfg.rpo();
        assert_eq!(rpo.len(), 4);
        assert_eq!(rpo[0], BlockId::new(0));
        assert_eq!(rpo[3], BlockId::new(3));
        // dfs_last mirrors the RPO position.
        for (i, &id) in rpo.iter().enumerate() {
            assert_eq!(cfg[id].dfs_last as usize, i);
        }
    }

    #[test]
    fn test_rpo_covers_unreachable() {
        let mut cfg = Cfg::new();
        cfg.add_block(block(0, 1, BlockKind::Return));
        cfg.add_block(block(1, 1, BlockKind::Return)); // unreachable
        cfg.compute_rpo();
        assert_eq!(cfg.rpo().len(), 2);
        assert_eq!(cfg.rpo()[0], BlockId::new(0));
    }

    #[test]
    fn test_node_splitting_fails_visibly() {
        let mut cfg = diamond();
        assert!(matches!(cfg.node_splitting(), Err(Error::NodeSplitting)));
    }
}
