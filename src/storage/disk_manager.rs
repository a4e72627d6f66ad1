use log::debug;
use std::collections::BTreeSet;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Mutex;

use crate::buffer::{PageId, HEADER_PAGE_ID, INVALID_PAGE_ID, PAGE_SIZE};
use crate::error::{PetraError, PetraResult};

/// File-backed page store.
///
/// Page ids are allocated monotonically starting at 1; page 0 is reserved for
/// the index-roots header page and is materialized when the file is created.
/// Deallocated ids are kept in an in-memory free set and handed out again
/// before the high-water mark advances.
#[derive(Debug)]
pub struct DiskManager {
    next_page_id: AtomicI32,
    db_file: Mutex<File>,
    freed_pages: Mutex<BTreeSet<PageId>>,
}

impl DiskManager {
    pub fn try_new(db_path: impl AsRef<Path>) -> PetraResult<Self> {
        let db_path = db_path.as_ref();
        let is_new_file = !db_path.exists();
        let mut db_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(db_path)?;

        if is_new_file {
            // reserve the header page so that data pages start at id 1
            db_file.seek(SeekFrom::Start(0))?;
            db_file.write_all(&[0u8; PAGE_SIZE])?;
            db_file.sync_data()?;
        }

        let db_file_len = db_file.metadata()?.len();
        if db_file_len % PAGE_SIZE as u64 != 0 {
            return Err(PetraError::Storage(format!(
                "db file size {} is not a multiple of page size {}",
                db_file_len, PAGE_SIZE
            )));
        }
        let next_page_id = (db_file_len / PAGE_SIZE as u64).max(1) as PageId;
        debug!("disk_manager initialized, next_page_id: {}", next_page_id);

        Ok(Self {
            next_page_id: AtomicI32::new(next_page_id),
            // Only one thread may touch the file handle at a time.
            db_file: Mutex::new(db_file),
            freed_pages: Mutex::new(BTreeSet::new()),
        })
    }

    pub fn read_page(&self, page_id: PageId) -> PetraResult<[u8; PAGE_SIZE]> {
        if page_id == INVALID_PAGE_ID || page_id < HEADER_PAGE_ID {
            return Err(PetraError::Storage(format!(
                "read_page: invalid page id {}",
                page_id
            )));
        }
        let mut file = self
            .db_file
            .lock()
            .map_err(|e| PetraError::Internal(format!("db file lock poisoned: {}", e)))?;
        let mut buf = [0u8; PAGE_SIZE];
        let offset = page_id as u64 * PAGE_SIZE as u64;
        if offset >= file.metadata()?.len() {
            // reading an allocated-but-never-written page yields zeroes
            return Ok(buf);
        }
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    pub fn write_page(&self, page_id: PageId, data: &[u8]) -> PetraResult<()> {
        if page_id == INVALID_PAGE_ID || page_id < HEADER_PAGE_ID {
            return Err(PetraError::Storage(format!(
                "write_page: invalid page id {}",
                page_id
            )));
        }
        if data.len() != PAGE_SIZE {
            return Err(PetraError::Storage(format!(
                "write_page: buffer is {} bytes instead of {}",
                data.len(),
                PAGE_SIZE
            )));
        }
        let mut file = self
            .db_file
            .lock()
            .map_err(|e| PetraError::Internal(format!("db file lock poisoned: {}", e)))?;
        file.seek(SeekFrom::Start(page_id as u64 * PAGE_SIZE as u64))?;
        file.write_all(data)?;
        file.sync_data()?;
        Ok(())
    }

    pub fn allocate_page(&self) -> PetraResult<PageId> {
        let mut freed = self
            .freed_pages
            .lock()
            .map_err(|e| PetraError::Internal(format!("freed pages lock poisoned: {}", e)))?;
        if let Some(&page_id) = freed.iter().next() {
            freed.remove(&page_id);
            return Ok(page_id);
        }
        Ok(self.next_page_id.fetch_add(1, Ordering::SeqCst))
    }

    pub fn deallocate_page(&self, page_id: PageId) -> PetraResult<()> {
        if page_id <= HEADER_PAGE_ID {
            return Err(PetraError::Storage(format!(
                "deallocate_page: invalid page id {}",
                page_id
            )));
        }
        let mut freed = self
            .freed_pages
            .lock()
            .map_err(|e| PetraError::Internal(format!("freed pages lock poisoned: {}", e)))?;
        freed.insert(page_id);
        Ok(())
    }
}
