use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard, RwLock};
use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::sync::Arc;

use crate::buffer::page::{FrameId, PageId, INVALID_PAGE_ID, PAGE_SIZE};
use crate::error::{PetraError, PetraResult};
use crate::storage::disk_scheduler::DiskScheduler;

#[derive(Debug, Clone)]
pub struct FrameMeta {
    pub page_id: PageId,
    pub pin_count: u32,
    pub is_dirty: bool,
}

impl Default for FrameMeta {
    fn default() -> Self {
        FrameMeta {
            page_id: INVALID_PAGE_ID,
            pin_count: 0,
            is_dirty: false,
        }
    }
}

/// One buffer frame: metadata, the content latch, and the page image.
///
/// The page bytes are only touched while holding `latch` (shared for reads,
/// exclusive for writes) or while the frame is unmapped and unpinned, which
/// is why the raw slice accessors are unsafe.
struct FrameSlot {
    meta: Mutex<FrameMeta>,
    latch: RwLock<()>,
    data: UnsafeCell<Box<[u8; PAGE_SIZE]>>,
}

unsafe impl Send for FrameSlot {}
unsafe impl Sync for FrameSlot {}

impl FrameSlot {
    fn new() -> Self {
        FrameSlot {
            meta: Mutex::new(FrameMeta::default()),
            latch: RwLock::new(()),
            data: UnsafeCell::new(Box::new([0; PAGE_SIZE])),
        }
    }
}

impl std::fmt::Debug for FrameSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameSlot").field("meta", &self.meta).finish()
    }
}

/// Flat frame storage shared between the manager and the page guards:
/// the frame array, the page table, and the free list. All bookkeeping
/// mutation goes through [`crate::buffer::BufferPoolManager`].
#[derive(Debug)]
pub struct BufferPool {
    frames: Vec<FrameSlot>,
    page_table: DashMap<PageId, FrameId>,
    free_list: Mutex<VecDeque<FrameId>>,
    disk_scheduler: Arc<DiskScheduler>,
}

impl BufferPool {
    pub fn new(capacity: usize, disk_scheduler: Arc<DiskScheduler>) -> Self {
        let mut frames = Vec::with_capacity(capacity);
        let mut free_list = VecDeque::with_capacity(capacity);
        for i in 0..capacity {
            frames.push(FrameSlot::new());
            free_list.push_back(i);
        }
        BufferPool {
            frames,
            page_table: DashMap::new(),
            free_list: Mutex::new(free_list),
            disk_scheduler,
        }
    }

    pub fn capacity(&self) -> usize {
        self.frames.len()
    }

    pub fn disk_scheduler(&self) -> &Arc<DiskScheduler> {
        &self.disk_scheduler
    }

    pub fn has_free_frame(&self) -> bool {
        !self.free_list.lock().is_empty()
    }

    pub fn free_frame_count(&self) -> usize {
        self.free_list.lock().len()
    }

    pub fn pop_free_frame(&self) -> Option<FrameId> {
        self.free_list.lock().pop_front()
    }

    pub fn push_free_frame(&self, frame_id: FrameId) {
        self.free_list.lock().push_back(frame_id);
    }

    pub fn lookup_frame(&self, page_id: PageId) -> Option<FrameId> {
        self.page_table.get(&page_id).map(|entry| *entry)
    }

    pub fn resident_page_ids(&self) -> Vec<PageId> {
        self.page_table.iter().map(|entry| *entry.key()).collect()
    }

    pub fn resident_count(&self) -> usize {
        self.page_table.len()
    }

    pub fn insert_mapping(&self, page_id: PageId, frame_id: FrameId) {
        self.page_table.insert(page_id, frame_id);
    }

    pub fn remove_mapping(&self, page_id: PageId) {
        self.page_table.remove(&page_id);
    }

    pub fn frame_meta(&self, frame_id: FrameId) -> MutexGuard<'_, FrameMeta> {
        self.frames[frame_id].meta.lock()
    }

    pub fn frame_lock(&self, frame_id: FrameId) -> &RwLock<()> {
        &self.frames[frame_id].latch
    }

    /// # Safety
    /// The caller must hold the frame latch (shared or exclusive), or know
    /// the frame is unmapped and unpinned.
    pub unsafe fn frame_slice(&self, frame_id: FrameId) -> &[u8] {
        &(&*self.frames[frame_id].data.get())[..]
    }

    /// # Safety
    /// The caller must hold the frame latch exclusively, or know the frame
    /// is unmapped and unpinned.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn frame_slice_mut(&self, frame_id: FrameId) -> &mut [u8] {
        &mut (&mut *self.frames[frame_id].data.get())[..]
    }

    pub fn reset_frame(&self, frame_id: FrameId) {
        let slice = unsafe { self.frame_slice_mut(frame_id) };
        slice.fill(0);
    }

    pub fn clear_frame_meta(&self, frame_id: FrameId) {
        *self.frame_meta(frame_id) = FrameMeta::default();
    }

    pub fn load_page_into_frame(&self, page_id: PageId, frame_id: FrameId) -> PetraResult<()> {
        let rx = self.disk_scheduler.schedule_read(page_id)?;
        let data = rx
            .recv()
            .map_err(|e| PetraError::Internal(format!("disk read channel closed: {}", e)))??;
        if data.len() != PAGE_SIZE {
            return Err(PetraError::Storage(format!(
                "disk read returned {} bytes instead of {}",
                data.len(),
                PAGE_SIZE
            )));
        }
        let slice = unsafe { self.frame_slice_mut(frame_id) };
        slice.copy_from_slice(&data);
        Ok(())
    }

    pub fn write_page_to_disk(&self, page_id: PageId, data: Bytes) -> PetraResult<()> {
        let rx = self.disk_scheduler.schedule_write(page_id, data)?;
        rx.recv()
            .map_err(|e| PetraError::Internal(format!("disk write channel closed: {}", e)))?
    }

    pub fn allocate_page_id(&self) -> PetraResult<PageId> {
        let rx = self.disk_scheduler.schedule_allocate()?;
        rx.recv()
            .map_err(|e| PetraError::Internal(format!("disk allocate channel closed: {}", e)))?
    }

    pub fn deallocate_page_id(&self, page_id: PageId) -> PetraResult<()> {
        let rx = self.disk_scheduler.schedule_deallocate(page_id)?;
        rx.recv()
            .map_err(|e| PetraError::Internal(format!("disk deallocate channel closed: {}", e)))?
    }
}
