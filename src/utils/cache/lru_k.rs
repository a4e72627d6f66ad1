use super::Replacer;
use crate::buffer::FrameId;
use crate::error::{PetraError, PetraResult};
use std::collections::{HashMap, VecDeque};

#[derive(Debug)]
struct LRUKNode {
    hit_count: u64,
    is_evictable: bool,
}

/// LRU-K replacement policy over frame ids.
///
/// Frames with fewer than `k` recorded accesses live in `history_list`;
/// frames with at least `k` accesses live in `cache_list`. Both lists keep
/// insertion order, and eviction always prefers the oldest evictable entry
/// of `history_list` over anything in `cache_list`, so cold frames leave
/// the pool first.
#[derive(Debug)]
pub struct LRUKReplacer {
    // evictable frame count
    current_size: usize,
    // total frames the replacer may track
    replacer_size: usize,
    k: u64,
    node_store: HashMap<FrameId, LRUKNode>,
    history_list: VecDeque<FrameId>,
    cache_list: VecDeque<FrameId>,
}

impl Replacer for LRUKReplacer {
    fn new(capacity: usize) -> Self {
        const DEFAULT_K: u64 = 2;
        Self::with_k(capacity, DEFAULT_K as usize)
    }

    fn evict(&mut self) -> Option<FrameId> {
        let in_history = self
            .history_list
            .iter()
            .position(|frame_id| self.node_store[frame_id].is_evictable);
        if let Some(pos) = in_history {
            let frame_id = self.history_list.remove(pos).unwrap();
            self.node_store.remove(&frame_id);
            self.current_size -= 1;
            return Some(frame_id);
        }
        let in_cache = self
            .cache_list
            .iter()
            .position(|frame_id| self.node_store[frame_id].is_evictable);
        if let Some(pos) = in_cache {
            let frame_id = self.cache_list.remove(pos).unwrap();
            self.node_store.remove(&frame_id);
            self.current_size -= 1;
            return Some(frame_id);
        }
        None
    }

    fn record_access(&mut self, frame_id: FrameId) -> PetraResult<()> {
        if frame_id >= self.replacer_size {
            return Err(PetraError::Internal(format!(
                "frame id {} exceeds replacer capacity {}",
                frame_id, self.replacer_size
            )));
        }
        if let Some(node) = self.node_store.get_mut(&frame_id) {
            node.hit_count += 1;
            if node.hit_count == self.k {
                // graduates from the history list
                let pos = self
                    .history_list
                    .iter()
                    .position(|id| *id == frame_id)
                    .expect("frame below k accesses must be in history_list");
                self.history_list.remove(pos);
                self.cache_list.push_back(frame_id);
            } else if node.hit_count > self.k {
                let pos = self
                    .cache_list
                    .iter()
                    .position(|id| *id == frame_id)
                    .expect("frame at k accesses must be in cache_list");
                self.cache_list.remove(pos);
                self.cache_list.push_back(frame_id);
            }
            return Ok(());
        }
        if self.node_store.len() >= self.replacer_size {
            // no room to track another frame
            return Ok(());
        }
        self.node_store.insert(
            frame_id,
            LRUKNode {
                hit_count: 1,
                is_evictable: false,
            },
        );
        if self.k == 1 {
            self.cache_list.push_back(frame_id);
        } else {
            self.history_list.push_back(frame_id);
        }
        Ok(())
    }

    fn set_evictable(&mut self, frame_id: FrameId, set_evictable: bool) -> PetraResult<()> {
        if let Some(node) = self.node_store.get_mut(&frame_id) {
            let evictable = node.is_evictable;
            node.is_evictable = set_evictable;
            if set_evictable && !evictable {
                self.current_size += 1;
            } else if !set_evictable && evictable {
                self.current_size -= 1;
            }
            Ok(())
        } else {
            Err(PetraError::Internal(format!(
                "frame {} not tracked by replacer",
                frame_id
            )))
        }
    }

    fn remove(&mut self, frame_id: FrameId) -> PetraResult<()> {
        let Some(node) = self.node_store.get(&frame_id) else {
            return Ok(());
        };
        if !node.is_evictable {
            return Err(PetraError::Internal(format!(
                "cannot remove non-evictable frame {}",
                frame_id
            )));
        }
        self.node_store.remove(&frame_id);
        if let Some(pos) = self.history_list.iter().position(|id| *id == frame_id) {
            self.history_list.remove(pos);
        } else if let Some(pos) = self.cache_list.iter().position(|id| *id == frame_id) {
            self.cache_list.remove(pos);
        }
        self.current_size -= 1;
        Ok(())
    }

    fn size(&self) -> usize {
        self.current_size
    }
}

impl LRUKReplacer {
    pub fn with_k(num_frames: usize, k: usize) -> Self {
        assert!(k >= 1, "LRU-K requires k >= 1");
        Self {
            current_size: 0,
            replacer_size: num_frames,
            k: k as u64,
            node_store: HashMap::with_capacity(num_frames),
            history_list: VecDeque::new(),
            cache_list: VecDeque::new(),
        }
    }
}
