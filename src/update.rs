//! In-place update planning.
//!
//! Given the blocks an updated tree wants to write — some *fixed* (their
//! bytes already sit in the file at a known offset and nothing layout-
//! affecting changed) and some *free* (new, moved, or re-compressed) — the
//! planner decides where everything lands, or gives up and asks for a
//! serial rewrite.
//!
//! The algorithm is deliberately naive and deterministic:
//!
//! 1. Fixed blocks are sorted by their current offset.  Blocks overlapping
//!    the new header prefix have already been demoted by the caller.
//! 2. No fixed blocks left → serial rewrite.
//! 3. Free blocks are placed first-fit into the gaps between fixed blocks,
//!    starting at the header prefix.  A placed block's allocation is grown
//!    to consume its entire gap, so the block run stays contiguous.
//! 4. Free blocks that fit nowhere are appended after the last block,
//!    padded to a block-size multiple.
//! 5. A streamed block always lands last.
//!
//! A plan is only returned when the resulting file is hole-free and the
//! blocks' offset order matches their write order (the tree's `source`
//! indices were assigned in write order and must keep meaning the same
//! blocks).  Anything else is a serial rewrite — correctness first, write
//! volume second.

use crate::block::{calculate_padding, BLOCK_BOILERPLATE_SIZE, BLOCK_HEADER_SIZE};

/// Full boilerplate preceding a block payload: magic, size field, header.
pub(crate) const BLOCK_OVERHEAD: u64 = BLOCK_BOILERPLATE_SIZE + BLOCK_HEADER_SIZE as u64;

/// A write block that can keep its current location.
#[derive(Debug, Clone)]
pub(crate) struct FixedBlock {
    pub write_index: usize,
    /// Current offset of the block magic.
    pub offset: u64,
    /// Magic + header + allocation, as currently on disk.
    pub disk_size: u64,
}

/// A write block that must be (re)written.
#[derive(Debug, Clone)]
pub(crate) struct FreeBlock {
    pub write_index: usize,
    /// On-disk payload size (post-compression).
    pub used: u64,
}

/// A free block's assigned slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PlannedWrite {
    pub write_index: usize,
    /// Offset of the block magic.
    pub offset: u64,
    /// Allocation to record in the rewritten header.
    pub allocated: u64,
}

#[derive(Debug, Clone)]
pub(crate) struct InPlacePlan {
    /// Free blocks to write, in write order.
    pub writes: Vec<PlannedWrite>,
    /// `(write_index, magic offset)` of every internal block, in offset
    /// order — the new block index document.
    pub offsets: Vec<(usize, u64)>,
    /// Where the streamed block starts, when present.
    pub streamed_offset: Option<u64>,
    /// End of the block run; the file is truncated here before the index
    /// is appended.
    pub end: u64,
}

#[derive(Debug, Clone)]
pub(crate) enum LayoutPlan {
    InPlace(InPlacePlan),
    Serial,
}

/// Compute the layout for an update.  `header_size` is the byte length of
/// the serialized YAML prefix that must fit before the first block.
pub(crate) fn calculate_updated_layout(
    fixed: &[FixedBlock],
    free: &[FreeBlock],
    header_size: u64,
    pad_factor: f64,
    block_size: u64,
    streamed: bool,
) -> LayoutPlan {
    if fixed.is_empty() {
        return LayoutPlan::Serial;
    }

    #[derive(Debug, Clone)]
    struct Entry {
        start: u64,
        end: u64,
        write_index: usize,
        planned: Option<PlannedWrite>,
    }

    let mut entries: Vec<Entry> = fixed
        .iter()
        .map(|f| Entry {
            start: f.offset,
            end: f.offset + f.disk_size,
            write_index: f.write_index,
            planned: None,
        })
        .collect();
    entries.sort_by_key(|e| e.start);
    if entries[0].start < header_size {
        // The caller demotes header-overlapping blocks before planning.
        return LayoutPlan::Serial;
    }

    for blk in free {
        let needed = BLOCK_OVERHEAD + blk.used;
        let mut last_end = header_size;
        let mut slot: Option<(usize, u64, u64)> = None;
        for (pos, entry) in entries.iter().enumerate() {
            let gap = entry.start.saturating_sub(last_end);
            if gap >= needed {
                // Consume the whole gap so no hole is left behind.
                slot = Some((pos, last_end, gap - BLOCK_OVERHEAD));
                break;
            }
            last_end = entry.end;
        }
        let entry = match slot {
            Some((pos, offset, allocated)) => {
                let entry = Entry {
                    start: offset,
                    end: offset + BLOCK_OVERHEAD + allocated,
                    write_index: blk.write_index,
                    planned: Some(PlannedWrite {
                        write_index: blk.write_index,
                        offset,
                        allocated,
                    }),
                };
                entries.insert(pos, entry);
                continue;
            }
            None => {
                // Append past the last block, padded to a block-size
                // multiple.
                let allocated = blk.used + calculate_padding(blk.used, pad_factor, block_size);
                Entry {
                    start: last_end,
                    end: last_end + BLOCK_OVERHEAD + allocated,
                    write_index: blk.write_index,
                    planned: Some(PlannedWrite {
                        write_index: blk.write_index,
                        offset: last_end,
                        allocated,
                    }),
                }
            }
        };
        entries.push(entry);
    }

    // The run must be hole-free (a hole would leave stale block bytes that
    // a serial scan could stumble into) and in write order (the tree's
    // source indices were assigned in write order).
    let mut last_end = None;
    for (pos, entry) in entries.iter().enumerate() {
        if entry.write_index != pos {
            return LayoutPlan::Serial;
        }
        if let Some(last_end) = last_end {
            if entry.start != last_end {
                return LayoutPlan::Serial;
            }
        }
        last_end = Some(entry.end);
    }

    // The streamed block (when present) starts right at the end of the
    // internal run and extends to end of file.
    let end = last_end.unwrap_or(header_size);
    let streamed_offset = streamed.then_some(end);

    let writes = entries
        .iter()
        .filter_map(|e| e.planned.clone())
        .collect::<Vec<_>>();
    let offsets = entries
        .iter()
        .map(|e| (e.write_index, e.start))
        .collect::<Vec<_>>();

    LayoutPlan::InPlace(InPlacePlan {
        writes,
        offsets,
        streamed_offset,
        end,
    })
}
