use bytes::Bytes;
use log::{error, warn};
use parking_lot::Mutex;
use std::sync::Arc;

use crate::buffer::buffer_pool::{BufferPool, FrameMeta};
use crate::buffer::page::{self, FrameId, PageId, ReadPageGuard, WritePageGuard, INVALID_PAGE_ID};
use crate::config::BufferPoolConfig;
use crate::error::{PetraError, PetraResult};
use crate::storage::disk_scheduler::DiskScheduler;
use crate::utils::cache::lru_k::LRUKReplacer;
use crate::utils::cache::Replacer;

/// Bounded page cache with pin-based lifetime.
///
/// A single operation mutex serializes every public operation's bookkeeping
/// (page table, free list, replacer), so the residency invariants hold
/// without per-structure ordering rules. Page *contents* are protected by
/// the per-frame latches, which callers acquire through the returned guards
/// after the bookkeeping is done. Disk I/O during victim write-back happens
/// with the operation mutex held; it is the one sanctioned serialization
/// point.
#[derive(Debug)]
pub struct BufferPoolManager {
    pool: Arc<BufferPool>,
    replacer: Mutex<LRUKReplacer>,
    op_latch: Mutex<()>,
}

impl BufferPoolManager {
    pub fn new(num_pages: usize, disk_scheduler: Arc<DiskScheduler>) -> Self {
        Self::new_with_config(
            BufferPoolConfig {
                buffer_pool_size: num_pages,
                ..Default::default()
            },
            disk_scheduler,
        )
    }

    pub fn new_with_config(config: BufferPoolConfig, disk_scheduler: Arc<DiskScheduler>) -> Self {
        let pool = Arc::new(BufferPool::new(config.buffer_pool_size, disk_scheduler));
        let replacer = Mutex::new(LRUKReplacer::with_k(config.buffer_pool_size, config.lru_k_k));
        Self {
            pool,
            replacer,
            op_latch: Mutex::new(()),
        }
    }

    pub fn buffer_pool(&self) -> Arc<BufferPool> {
        self.pool.clone()
    }

    /// Allocate a fresh page id, claim a frame for it, and hand back an
    /// exclusively latched, pinned, zeroed page.
    pub fn new_page(self: &Arc<Self>) -> PetraResult<WritePageGuard> {
        let frame_id = {
            let _op = self.op_latch.lock();
            if !self.pool.has_free_frame() && self.replacer.lock().size() == 0 {
                return Err(PetraError::Storage(
                    "Cannot create page: buffer pool is full and every frame is pinned"
                        .to_string(),
                ));
            }

            let frame_id = self.allocate_frame()?;
            let page_id = match self.pool.allocate_page_id() {
                Ok(page_id) => page_id,
                Err(e) => {
                    self.pool.push_free_frame(frame_id);
                    return Err(e);
                }
            };
            self.pool.insert_mapping(page_id, frame_id);
            {
                let mut meta = self.pool.frame_meta(frame_id);
                *meta = FrameMeta {
                    page_id,
                    pin_count: 1,
                    is_dirty: false,
                };
            }
            self.pool.reset_frame(frame_id);

            let mut replacer = self.replacer.lock();
            let _ = replacer.record_access(frame_id);
            let _ = replacer.set_evictable(frame_id, false);
            frame_id
        };
        Ok(page::new_write_guard(Arc::clone(self), frame_id))
    }

    pub fn fetch_page_read(self: &Arc<Self>, page_id: PageId) -> PetraResult<ReadPageGuard> {
        let frame_id = self.pin_frame(page_id, "fetch_page_read")?;
        Ok(page::new_read_guard(Arc::clone(self), frame_id))
    }

    pub fn fetch_page_write(self: &Arc<Self>, page_id: PageId) -> PetraResult<WritePageGuard> {
        let frame_id = self.pin_frame(page_id, "fetch_page_write")?;
        Ok(page::new_write_guard(Arc::clone(self), frame_id))
    }

    /// Bookkeeping half of a fetch: resolve the page to a frame (reading it
    /// from disk if needed), bump the pin count, and mark it non-evictable.
    fn pin_frame(&self, page_id: PageId, caller: &str) -> PetraResult<FrameId> {
        if page_id == INVALID_PAGE_ID {
            return Err(PetraError::Storage(format!(
                "{}: invalid page id",
                caller
            )));
        }
        let _op = self.op_latch.lock();
        let frame_id = self.ensure_frame(page_id)?;
        self.pool.frame_meta(frame_id).pin_count += 1;
        let mut replacer = self.replacer.lock();
        let _ = replacer.record_access(frame_id);
        let _ = replacer.set_evictable(frame_id, false);
        Ok(frame_id)
    }

    fn ensure_frame(&self, page_id: PageId) -> PetraResult<FrameId> {
        if let Some(frame_id) = self.pool.lookup_frame(page_id) {
            return Ok(frame_id);
        }
        let frame_id = self.allocate_frame()?;
        if let Err(e) = self.pool.load_page_into_frame(page_id, frame_id) {
            self.pool.push_free_frame(frame_id);
            return Err(e);
        }
        self.pool.insert_mapping(page_id, frame_id);
        {
            let mut meta = self.pool.frame_meta(frame_id);
            *meta = FrameMeta {
                page_id,
                pin_count: 0,
                is_dirty: false,
            };
        }
        Ok(frame_id)
    }

    /// Decrement the pin count, OR-merging the caller's dirty claim.
    /// Returns false when the page is not resident or was not pinned; an
    /// unpin of an unpinned frame is a caller bug and is reported, never
    /// silently clamped.
    pub fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> bool {
        let _op = self.op_latch.lock();
        let Some(frame_id) = self.pool.lookup_frame(page_id) else {
            warn!("unpin_page: page {} is not resident", page_id);
            return false;
        };
        let mut meta = self.pool.frame_meta(frame_id);
        if meta.pin_count == 0 {
            error!(
                "unpin_page: page {} (frame {}) already has pin_count 0",
                page_id, frame_id
            );
            return false;
        }
        meta.pin_count -= 1;
        if is_dirty {
            meta.is_dirty = true;
        }
        let now_unpinned = meta.pin_count == 0;
        drop(meta);
        if now_unpinned {
            let _ = self.replacer.lock().set_evictable(frame_id, true);
        }
        true
    }

    /// Write a resident dirty page back to disk and clear its dirty bit.
    /// Returns false when the page is not resident.
    pub fn flush_page(&self, page_id: PageId) -> PetraResult<bool> {
        let _op = self.op_latch.lock();
        self.flush_page_inner(page_id)
    }

    fn flush_page_inner(&self, page_id: PageId) -> PetraResult<bool> {
        let Some(frame_id) = self.pool.lookup_frame(page_id) else {
            return Ok(false);
        };
        let is_dirty = self.pool.frame_meta(frame_id).is_dirty;
        if !is_dirty {
            return Ok(true);
        }
        let bytes = Bytes::copy_from_slice(unsafe { self.pool.frame_slice(frame_id) });
        self.pool.write_page_to_disk(page_id, bytes)?;
        self.pool.frame_meta(frame_id).is_dirty = false;
        Ok(true)
    }

    pub fn flush_all_pages(&self) -> PetraResult<()> {
        let _op = self.op_latch.lock();
        for page_id in self.pool.resident_page_ids() {
            self.flush_page_inner(page_id)?;
        }
        Ok(())
    }

    /// Drop a page from the pool and deallocate it on disk. Refuses pinned
    /// pages; deleting a non-resident page is a no-op that succeeds.
    pub fn delete_page(&self, page_id: PageId) -> PetraResult<bool> {
        let _op = self.op_latch.lock();
        let Some(frame_id) = self.pool.lookup_frame(page_id) else {
            return Ok(true);
        };
        if self.pool.frame_meta(frame_id).pin_count > 0 {
            return Ok(false);
        }
        self.pool.remove_mapping(page_id);
        {
            let mut replacer = self.replacer.lock();
            let _ = replacer.set_evictable(frame_id, true);
            let _ = replacer.remove(frame_id);
        }
        self.pool.clear_frame_meta(frame_id);
        self.pool.reset_frame(frame_id);
        self.pool.push_free_frame(frame_id);
        self.pool.deallocate_page_id(page_id)?;
        Ok(true)
    }

    /// Victim selection: free list first, then the replacer. A dirty victim
    /// is written back before its frame is recycled.
    fn allocate_frame(&self) -> PetraResult<FrameId> {
        if let Some(frame_id) = self.pool.pop_free_frame() {
            return Ok(frame_id);
        }

        let victim = {
            let mut replacer = self.replacer.lock();
            replacer.evict().ok_or_else(|| {
                PetraError::Storage(
                    "Cannot allocate frame: buffer pool is full and no frame is evictable"
                        .to_string(),
                )
            })?
        };

        let (page_id, is_dirty) = {
            let meta = self.pool.frame_meta(victim);
            debug_assert_eq!(meta.pin_count, 0, "evictable frame must be unpinned");
            (meta.page_id, meta.is_dirty)
        };

        if page_id != INVALID_PAGE_ID {
            if is_dirty {
                // an unpinned frame has no latch holders, so the image is stable
                let bytes = Bytes::copy_from_slice(unsafe { self.pool.frame_slice(victim) });
                self.pool.write_page_to_disk(page_id, bytes)?;
            }
            self.pool.remove_mapping(page_id);
        }
        self.pool.clear_frame_meta(victim);
        self.pool.reset_frame(victim);
        Ok(victim)
    }

    pub fn replacer_size(&self) -> usize {
        self.replacer.lock().size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::PAGE_SIZE;
    use crate::storage::disk_manager::DiskManager;
    use std::sync::{Arc, Barrier};
    use std::thread;
    use tempfile::TempDir;

    fn setup_manager(num_pages: usize) -> (TempDir, Arc<BufferPoolManager>) {
        let temp_dir = TempDir::new().unwrap();
        let db_file = temp_dir.path().join("test.db");
        let disk_manager = Arc::new(DiskManager::try_new(db_file).unwrap());
        let disk_scheduler = Arc::new(DiskScheduler::new(disk_manager));
        let manager = Arc::new(BufferPoolManager::new(num_pages, disk_scheduler));
        (temp_dir, manager)
    }

    #[test]
    fn new_page_fills_pool_then_fails() {
        let (_tmp, bpm) = setup_manager(2);

        let page1 = bpm.new_page().unwrap();
        assert!(page1.data().iter().all(|b| *b == 0));
        let page2 = bpm.new_page().unwrap();

        // both frames pinned
        assert!(bpm.new_page().is_err());

        let page1_id = page1.page_id();
        drop(page1);

        // frame A is reused for a fresh page
        let page3 = bpm.new_page().unwrap();
        assert_ne!(page3.page_id(), page1_id);
        drop(page2);
        drop(page3);

        // evicted page 1 comes back from disk
        let page1_again = bpm.fetch_page_read(page1_id).unwrap();
        assert_eq!(page1_again.page_id(), page1_id);
    }

    #[test]
    fn eviction_persists_dirty_page() {
        let (_tmp, bpm) = setup_manager(2);

        let (first_id, second_id) = {
            let mut p1 = bpm.new_page().unwrap();
            p1.data_mut()[0] = 11;
            p1.mark_dirty();
            let mut p2 = bpm.new_page().unwrap();
            p2.data_mut()[0] = 22;
            p2.mark_dirty();
            (p1.page_id(), p2.page_id())
        };

        // force both out of the pool
        let _p3 = bpm.new_page().unwrap();
        let _p4 = bpm.new_page().unwrap();

        drop(_p3);
        drop(_p4);

        let p1 = bpm.fetch_page_read(first_id).unwrap();
        assert_eq!(p1.data()[0], 11);
        drop(p1);
        let p2 = bpm.fetch_page_read(second_id).unwrap();
        assert_eq!(p2.data()[0], 22);
    }

    #[test]
    fn unpin_page_reports_underflow() {
        let (_tmp, bpm) = setup_manager(2);
        let page_id = {
            let guard = bpm.new_page().unwrap();
            guard.page_id()
        };
        // guard drop already unpinned
        assert!(!bpm.unpin_page(page_id, false));
        assert!(!bpm.unpin_page(999, false));
    }

    #[test]
    fn pool_accounting_stays_balanced() {
        let (_tmp, bpm) = setup_manager(3);
        let pool = bpm.buffer_pool();

        let p1 = bpm.new_page().unwrap();
        let p2 = bpm.new_page().unwrap();
        assert_eq!(pool.resident_count() + pool.free_frame_count(), 3);
        drop(p1);
        drop(p2);
        assert_eq!(pool.resident_count() + pool.free_frame_count(), 3);
        assert_eq!(bpm.replacer_size(), 2);
    }

    #[test]
    fn flush_page_clears_dirty_bit() {
        let (_tmp, bpm) = setup_manager(2);
        let page_id = {
            let mut guard = bpm.new_page().unwrap();
            guard.data_mut()[7] = 42;
            guard.mark_dirty();
            guard.page_id()
        };

        assert!(bpm.flush_page(page_id).unwrap());
        let frame_id = bpm.buffer_pool().lookup_frame(page_id).unwrap();
        assert!(!bpm.buffer_pool().frame_meta(frame_id).is_dirty);

        // not resident -> false
        assert!(!bpm.flush_page(12345).unwrap());
    }

    #[test]
    fn delete_page_frees_frame_and_refuses_pinned() {
        let (_tmp, bpm) = setup_manager(2);
        let guard = bpm.new_page().unwrap();
        let page_id = guard.page_id();

        // pinned -> refused
        assert!(!bpm.delete_page(page_id).unwrap());
        drop(guard);

        assert!(bpm.delete_page(page_id).unwrap());
        assert!(bpm.buffer_pool().lookup_frame(page_id).is_none());
        assert!(bpm.buffer_pool().has_free_frame());

        // non-resident delete succeeds
        assert!(bpm.delete_page(page_id).unwrap());
    }

    #[test]
    fn fetch_prefers_free_frames_over_eviction() {
        let (_tmp, bpm) = setup_manager(3);
        let p1 = bpm.new_page().unwrap();
        let p1_id = p1.page_id();
        drop(p1);

        // one resident evictable page, two free frames; fetching a second
        // page must not evict page 1
        let p2 = bpm.new_page().unwrap();
        drop(p2);
        assert!(bpm.buffer_pool().lookup_frame(p1_id).is_some());
    }

    #[test]
    fn concurrent_fetches_do_not_leak_pins() {
        const THREADS: usize = 8;
        let (_tmp, bpm) = setup_manager(4);
        let (page_id, frame_id) = {
            let mut guard = bpm.new_page().unwrap();
            guard.data_mut()[0] = 42;
            guard.mark_dirty();
            (guard.page_id(), guard.frame_id())
        };

        let barrier = Arc::new(Barrier::new(THREADS));
        let mut handles = Vec::with_capacity(THREADS);
        for _ in 0..THREADS {
            let bpm = bpm.clone();
            let barrier = barrier.clone();
            handles.push(thread::spawn(move || {
                barrier.wait();
                for _ in 0..50 {
                    let guard = bpm.fetch_page_read(page_id).expect("read page");
                    assert_eq!(guard.data()[0], 42);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let meta = bpm.buffer_pool().frame_meta(frame_id).clone();
        assert_eq!(meta.pin_count, 0);
        assert_eq!(meta.page_id, page_id);
    }

    #[test]
    fn flush_all_pages_round_trips_through_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let db_file = temp_dir.path().join("test.db");
        let page_id;
        {
            let disk_manager = Arc::new(DiskManager::try_new(&db_file).unwrap());
            let disk_scheduler = Arc::new(DiskScheduler::new(disk_manager));
            let bpm = Arc::new(BufferPoolManager::new(2, disk_scheduler));
            let mut guard = bpm.new_page().unwrap();
            page_id = guard.page_id();
            guard.data_mut()[..4].copy_from_slice(&[1, 2, 3, 4]);
            guard.mark_dirty();
            drop(guard);
            bpm.flush_all_pages().unwrap();
        }
        let disk_manager = Arc::new(DiskManager::try_new(&db_file).unwrap());
        let data = disk_manager.read_page(page_id).unwrap();
        assert_eq!(&data[..4], &[1, 2, 3, 4]);
        assert_eq!(data.len(), PAGE_SIZE);
    }
}
