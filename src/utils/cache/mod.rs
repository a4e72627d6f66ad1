use crate::buffer::FrameId;
use crate::error::PetraResult;

pub mod lru_k;

pub trait Replacer {
    fn new(capacity: usize) -> Self
    where
        Self: Sized;

    fn record_access(&mut self, frame_id: FrameId) -> PetraResult<()>;

    fn evict(&mut self) -> Option<FrameId>;

    fn set_evictable(&mut self, frame_id: FrameId, set_evictable: bool) -> PetraResult<()>;

    fn remove(&mut self, frame_id: FrameId) -> PetraResult<()>;

    fn size(&self) -> usize;
}
