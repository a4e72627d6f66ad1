use parking_lot::{RwLockReadGuard, RwLockWriteGuard};
use std::mem::{self, ManuallyDrop};
use std::sync::Arc;

use crate::buffer::buffer_manager::BufferPoolManager;
use crate::buffer::buffer_pool::{BufferPool, FrameMeta};

pub type PageId = i32;
pub type FrameId = usize;

pub const INVALID_PAGE_ID: PageId = -1;
pub const HEADER_PAGE_ID: PageId = 0;
pub const PAGE_SIZE: usize = 4096;

/// Shared latch + pin on one resident page. Dropping the guard releases the
/// latch and unpins the frame.
#[derive(Debug)]
pub struct ReadPageGuard {
    bpm: Arc<BufferPoolManager>,
    pool: Arc<BufferPool>,
    frame_id: FrameId,
    guard: ManuallyDrop<RwLockReadGuard<'static, ()>>,
}

impl ReadPageGuard {
    pub fn data(&self) -> &[u8] {
        unsafe { self.pool.frame_slice(self.frame_id) }
    }

    pub fn page_id(&self) -> PageId {
        self.meta_snapshot().page_id
    }

    pub fn pin_count(&self) -> u32 {
        self.meta_snapshot().pin_count
    }

    pub fn frame_id(&self) -> FrameId {
        self.frame_id
    }

    pub fn meta_snapshot(&self) -> FrameMeta {
        self.pool.frame_meta(self.frame_id).clone()
    }
}

impl Drop for ReadPageGuard {
    fn drop(&mut self) {
        let page_id = self.meta_snapshot().page_id;
        unsafe {
            ManuallyDrop::drop(&mut self.guard);
        }
        self.bpm.unpin_page(page_id, false);
    }
}

/// Exclusive latch + pin on one resident page.
#[derive(Debug)]
pub struct WritePageGuard {
    bpm: Arc<BufferPoolManager>,
    pool: Arc<BufferPool>,
    frame_id: FrameId,
    guard: ManuallyDrop<RwLockWriteGuard<'static, ()>>,
    dirtied: bool,
}

impl WritePageGuard {
    pub fn data(&self) -> &[u8] {
        unsafe { self.pool.frame_slice(self.frame_id) }
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        unsafe { self.pool.frame_slice_mut(self.frame_id) }
    }

    pub fn page_id(&self) -> PageId {
        self.meta_snapshot().page_id
    }

    pub fn pin_count(&self) -> u32 {
        self.meta_snapshot().pin_count
    }

    pub fn is_dirty(&self) -> bool {
        self.meta_snapshot().is_dirty
    }

    pub fn frame_id(&self) -> FrameId {
        self.frame_id
    }

    pub fn mark_dirty(&mut self) {
        self.dirtied = true;
        self.pool.frame_meta(self.frame_id).is_dirty = true;
    }

    /// Replace the whole page image and mark the frame dirty.
    pub fn overwrite(&mut self, data: &[u8]) {
        debug_assert_eq!(data.len(), PAGE_SIZE);
        let slice = unsafe { self.pool.frame_slice_mut(self.frame_id) };
        slice.copy_from_slice(data);
        self.mark_dirty();
    }

    pub fn meta_snapshot(&self) -> FrameMeta {
        self.pool.frame_meta(self.frame_id).clone()
    }
}

impl Drop for WritePageGuard {
    fn drop(&mut self) {
        let page_id = self.meta_snapshot().page_id;
        unsafe {
            ManuallyDrop::drop(&mut self.guard);
        }
        self.bpm.unpin_page(page_id, self.dirtied);
    }
}

pub(crate) fn new_read_guard(bpm: Arc<BufferPoolManager>, frame_id: FrameId) -> ReadPageGuard {
    let pool = bpm.buffer_pool();
    let lock = pool.frame_lock(frame_id);
    let guard = lock.read();
    // The guard borrows from the pool, which the returned struct keeps alive
    // through its own Arc, so widening the lifetime is sound.
    let guard_static: RwLockReadGuard<'static, ()> =
        unsafe { mem::transmute::<RwLockReadGuard<'_, ()>, RwLockReadGuard<'static, ()>>(guard) };
    ReadPageGuard {
        bpm,
        pool,
        frame_id,
        guard: ManuallyDrop::new(guard_static),
    }
}

pub(crate) fn new_write_guard(bpm: Arc<BufferPoolManager>, frame_id: FrameId) -> WritePageGuard {
    let pool = bpm.buffer_pool();
    let lock = pool.frame_lock(frame_id);
    let guard = lock.write();
    let guard_static: RwLockWriteGuard<'static, ()> =
        unsafe { mem::transmute::<RwLockWriteGuard<'_, ()>, RwLockWriteGuard<'static, ()>>(guard) };
    WritePageGuard {
        bpm,
        pool,
        frame_id,
        guard: ManuallyDrop::new(guard_static),
        dirtied: false,
    }
}

#[cfg(test)]
mod tests {
    use crate::buffer::BufferPoolManager;
    use crate::storage::disk_manager::DiskManager;
    use crate::storage::disk_scheduler::DiskScheduler;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn setup(num_pages: usize) -> (TempDir, Arc<BufferPoolManager>) {
        let temp_dir = TempDir::new().unwrap();
        let disk_manager =
            Arc::new(DiskManager::try_new(temp_dir.path().join("test.db")).unwrap());
        let disk_scheduler = Arc::new(DiskScheduler::new(disk_manager));
        (temp_dir, Arc::new(BufferPoolManager::new(num_pages, disk_scheduler)))
    }

    #[test]
    fn read_guard_pins_and_unpins() {
        let (_tmp, bpm) = setup(4);
        let page_id = {
            let guard = bpm.new_page().unwrap();
            guard.page_id()
        };

        let read_guard = bpm.fetch_page_read(page_id).unwrap();
        assert_eq!(read_guard.pin_count(), 1);
        let frame_id = read_guard.frame_id();
        drop(read_guard);

        assert_eq!(bpm.buffer_pool().frame_meta(frame_id).pin_count, 0);
    }

    #[test]
    fn write_guard_marks_dirty() {
        let (_tmp, bpm) = setup(4);
        let page_id = {
            let guard = bpm.new_page().unwrap();
            guard.page_id()
        };

        let mut guard = bpm.fetch_page_write(page_id).unwrap();
        guard.data_mut()[0] = 9;
        guard.mark_dirty();
        assert!(guard.is_dirty());
        drop(guard);

        let guard = bpm.fetch_page_read(page_id).unwrap();
        assert_eq!(guard.data()[0], 9);
    }
}
