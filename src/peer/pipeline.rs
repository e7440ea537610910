use sha1::{Digest, Sha1};
use thiserror::Error;

use crate::messages::payloads::{PieceBlock, PieceBlockInfo};

/// Largest block we ever request.
pub const BLOCK_MAX: u32 = 1 << 14;

/// A piece handed to the connection by the scheduler: the blocks that still have to be requested
/// and how many blocks make up the piece.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PieceDownloadInfo {
    pub index: u32,
    pub blocks_left: Vec<PieceBlockInfo>,
    pub blocks_count: u32,
}

impl PieceDownloadInfo {
    pub fn new(index: u32, blocks: Vec<PieceBlockInfo>) -> Self {
        Self {
            index,
            blocks_count: blocks.len() as u32,
            blocks_left: blocks,
        }
    }

    /// Splits a piece of `piece_size` bytes into blocks of at most `BLOCK_MAX` bytes.
    pub fn for_piece(index: u32, piece_size: u32) -> Self {
        let n_blocks = piece_size.div_ceil(BLOCK_MAX);
        let blocks = (0..n_blocks)
            .map(|block_i| {
                PieceBlockInfo::new(
                    index,
                    block_i * BLOCK_MAX,
                    get_block_len(n_blocks, piece_size, block_i),
                )
            })
            .collect();
        Self::new(index, blocks)
    }

    fn piece_size(&self) -> usize {
        self.blocks_left
            .iter()
            .map(PieceBlockInfo::end)
            .max()
            .unwrap_or(0)
    }
}

fn get_block_len(n_blocks: u32, piece_size: u32, block_i: u32) -> u32 {
    if block_i == n_blocks - 1 && piece_size % BLOCK_MAX != 0 {
        piece_size % BLOCK_MAX
    } else {
        BLOCK_MAX
    }
}

/// The bytes of a piece while (and after) it is downloaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadedPiece {
    pub index: u32,
    pub data: Vec<u8>,
    pub data_size: usize,
    pub received_blocks: u32,
}

impl DownloadedPiece {
    fn new(index: u32, size: usize) -> Self {
        Self {
            index,
            data: vec![0; size],
            data_size: 0,
            received_blocks: 0,
        }
    }

    fn add_block(&mut self, block: &PieceBlock) -> bool {
        let begin = block.info.begin as usize;
        let Some(dst) = self.data.get_mut(begin..begin + block.data.len()) else {
            return false;
        };
        dst.copy_from_slice(&block.data);
        self.data_size += block.data.len();
        self.received_blocks += 1;
        true
    }

    /// Compares the SHA-1 of the piece with `hash`.
    pub fn is_valid(&self, hash: &[u8; 20]) -> bool {
        let mut hasher = Sha1::new();
        hasher.update(&self.data);
        let digest: [u8; 20] = hasher.finalize().into();
        &digest == hash
    }
}

/// Reported to the listener when a scheduled piece won't be finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("The download of piece {index} was aborted.")]
pub struct PieceAborted {
    pub index: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockOutcome {
    /// Nothing is scheduled, the block is dropped.
    Unrequested,
    /// The block didn't match the request; the piece is given up.
    Aborted(u32),
    Finished(DownloadedPiece),
    /// The block was stored, this one has to be requested next.
    Next(PieceBlockInfo),
}

#[derive(Debug)]
struct ActivePiece {
    info: PieceDownloadInfo,
    piece: DownloadedPiece,
    outstanding: PieceBlockInfo,
}

/// At most one piece in flight with one outstanding block request.
#[derive(Debug, Default)]
pub struct BlockPipeline {
    active: Option<ActivePiece>,
}

impl BlockPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    pub fn active_piece(&self) -> Option<u32> {
        self.active.as_ref().map(|active| active.piece.index)
    }

    /// Takes over `info` and returns the first block to request. Returns `None` (and schedules
    /// nothing) if a piece is already in flight or `info` has no blocks.
    pub fn schedule(&mut self, mut info: PieceDownloadInfo) -> Option<PieceBlockInfo> {
        if self.active.is_some() {
            return None;
        }
        let piece = DownloadedPiece::new(info.index, info.piece_size());
        // requests go out from the back of the list
        let first = info.blocks_left.pop()?;
        self.active = Some(ActivePiece {
            info,
            piece,
            outstanding: first,
        });
        Some(first)
    }

    pub fn on_block_received(&mut self, block: &PieceBlock) -> BlockOutcome {
        let Some(active) = self.active.as_mut() else {
            tracing::debug!(
                index = block.info.index,
                begin = block.info.begin,
                "dropping unrequested block"
            );
            return BlockOutcome::Unrequested;
        };

        let expected = active.outstanding;
        if block.info.index != expected.index
            || block.info.begin != expected.begin
            || block.data.len() != expected.length as usize
        {
            tracing::warn!(?expected, received = ?block.info, "block doesn't match request");
            return BlockOutcome::Aborted(self.abort_active());
        }
        if !active.piece.add_block(block) {
            tracing::warn!(received = ?block.info, "block exceeds the piece");
            return BlockOutcome::Aborted(self.abort_active());
        }

        if active.piece.received_blocks >= active.info.blocks_count {
            let Some(done) = self.active.take() else {
                return BlockOutcome::Unrequested;
            };
            return BlockOutcome::Finished(done.piece);
        }
        match active.info.blocks_left.pop() {
            Some(next) => {
                active.outstanding = next;
                BlockOutcome::Next(next)
            }
            // fewer distinct blocks than announced, nothing left to ask for
            None => BlockOutcome::Aborted(self.abort_active()),
        }
    }

    /// Drops the piece in flight and returns its index.
    pub fn abort(&mut self) -> Option<u32> {
        self.active.take().map(|active| active.piece.index)
    }

    fn abort_active(&mut self) -> u32 {
        self.abort().unwrap_or_default()
    }
}
