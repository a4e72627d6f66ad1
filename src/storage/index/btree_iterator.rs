use std::cmp::Ordering;
use std::ops::{Bound, RangeBounds};
use std::sync::Arc;

use crate::buffer::{ReadPageGuard, INVALID_PAGE_ID};
use crate::error::PetraResult;
use crate::storage::codec::BPlusTreeLeafPageCodec;
use crate::storage::page::RecordId;

use super::btree_index::BPlusTreeIndex;

/// Range scan over the leaf chain in ascending key order.
///
/// The iterator keeps a shared latch on the current leaf between calls and
/// moves to the next leaf hand-over-hand: the next leaf's latch is acquired
/// before the current one is released. The scan ends past the last slot of
/// a leaf with no successor, or at the range's end bound.
#[derive(Debug)]
pub struct TreeIndexIterator {
    index: Arc<BPlusTreeIndex>,
    start_bound: Bound<Vec<u8>>,
    end_bound: Bound<Vec<u8>>,
    current_guard: Option<ReadPageGuard>,
    cursor: usize,
    started: bool,
}

impl TreeIndexIterator {
    pub fn new<R: RangeBounds<Vec<u8>>>(index: Arc<BPlusTreeIndex>, range: R) -> Self {
        Self {
            index,
            start_bound: range.start_bound().cloned(),
            end_bound: range.end_bound().cloned(),
            current_guard: None,
            cursor: 0,
            started: false,
        }
    }

    pub fn next(&mut self) -> PetraResult<Option<(Vec<u8>, RecordId)>> {
        if !self.started {
            self.started = true;
            match self.start_bound.clone() {
                Bound::Included(key) | Bound::Excluded(key) => {
                    let Some(guard) = self.index.find_leaf_page(&key)? else {
                        return Ok(None);
                    };
                    let (leaf, _) =
                        BPlusTreeLeafPageCodec::decode(guard.data(), self.index.comparator)?;
                    let included = matches!(self.start_bound, Bound::Included(_));
                    self.cursor = leaf
                        .next_closest(&key, included)
                        .unwrap_or(leaf.header.current_size as usize);
                    self.current_guard = Some(guard);
                }
                Bound::Unbounded => {
                    let Some(guard) = self.index.find_leftmost_leaf()? else {
                        return Ok(None);
                    };
                    self.cursor = 0;
                    self.current_guard = Some(guard);
                }
            }
        }

        loop {
            let Some(guard) = self.current_guard.as_ref() else {
                return Ok(None);
            };
            let (leaf, _) = BPlusTreeLeafPageCodec::decode(guard.data(), self.index.comparator)?;

            if self.cursor >= leaf.header.current_size as usize {
                if leaf.header.next_page_id == INVALID_PAGE_ID {
                    self.current_guard = None;
                    return Ok(None);
                }
                // latch the successor before releasing the current leaf
                let next_guard = self
                    .index
                    .buffer_pool
                    .fetch_page_read(leaf.header.next_page_id)?;
                self.current_guard = Some(next_guard);
                self.cursor = 0;
                continue;
            }

            let (key, rid) = leaf.kv_at(self.cursor).clone();
            let in_range = match &self.end_bound {
                Bound::Included(end) => (self.index.comparator)(&key, end) != Ordering::Greater,
                Bound::Excluded(end) => (self.index.comparator)(&key, end) == Ordering::Less,
                Bound::Unbounded => true,
            };
            if !in_range {
                self.current_guard = None;
                return Ok(None);
            }
            self.cursor += 1;
            return Ok(Some((key, rid)));
        }
    }
}

impl BPlusTreeIndex {
    /// Iterator positioned at the leftmost entry.
    pub fn begin(self: &Arc<Self>) -> TreeIndexIterator {
        TreeIndexIterator::new(Arc::clone(self), ..)
    }

    /// Iterator positioned at the first entry with key >= `key`.
    pub fn begin_from(self: &Arc<Self>, key: &[u8]) -> TreeIndexIterator {
        TreeIndexIterator::new(Arc::clone(self), key.to_vec()..)
    }

    /// Iterator over an arbitrary key range.
    pub fn iter<R: RangeBounds<Vec<u8>>>(self: &Arc<Self>, range: R) -> TreeIndexIterator {
        TreeIndexIterator::new(Arc::clone(self), range)
    }
}
