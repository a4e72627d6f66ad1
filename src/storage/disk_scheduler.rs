use bytes::{Bytes, BytesMut};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread;

use super::disk_manager::DiskManager;
use crate::buffer::PageId;
use crate::config::IOSchedulerConfig;
use crate::error::{PetraError, PetraResult};

pub type DiskCommandResultSender<T> = Sender<PetraResult<T>>;
pub type DiskCommandResultReceiver<T> = Receiver<PetraResult<T>>;

// Commands sent from the buffer pool to the scheduler workers.
#[derive(Debug)]
pub enum DiskRequest {
    ReadPage {
        page_id: PageId,
        result_sender: DiskCommandResultSender<BytesMut>,
    },
    WritePage {
        page_id: PageId,
        data: Bytes,
        result_sender: DiskCommandResultSender<()>,
    },
    AllocatePage {
        result_sender: DiskCommandResultSender<PageId>,
    },
    DeallocatePage {
        page_id: PageId,
        result_sender: DiskCommandResultSender<()>,
    },
    Shutdown,
}

/// Channel-based I/O front end: a dispatcher thread forwards requests
/// round-robin to a small pool of workers that drive the [`DiskManager`].
/// Each `schedule_*` call returns the receiving half of a oneshot-style
/// channel carrying the result.
#[derive(Debug)]
pub struct DiskScheduler {
    request_sender: Sender<DiskRequest>,
    dispatcher_thread: Option<thread::JoinHandle<()>>,
    worker_threads: Vec<thread::JoinHandle<()>>,
}

impl DiskScheduler {
    pub fn new(disk_manager: Arc<DiskManager>) -> Self {
        Self::new_with_config(disk_manager, IOSchedulerConfig::default())
    }

    pub fn new_with_config(disk_manager: Arc<DiskManager>, config: IOSchedulerConfig) -> Self {
        let worker_count = config.workers.max(1);
        let (request_sender, request_receiver) = mpsc::channel::<DiskRequest>();

        let mut worker_senders = Vec::with_capacity(worker_count);
        let mut worker_threads = Vec::with_capacity(worker_count);
        for i in 0..worker_count {
            let (tx, rx) = mpsc::channel::<DiskRequest>();
            worker_senders.push(tx);
            let dm = disk_manager.clone();
            let handle = thread::Builder::new()
                .name(format!("disk-scheduler-worker-{}", i))
                .spawn(move || {
                    Self::io_worker_loop(rx, dm);
                })
                .expect("Failed to spawn DiskScheduler worker thread");
            worker_threads.push(handle);
        }

        let dispatcher_thread = thread::Builder::new()
            .name("disk-scheduler-dispatcher".to_string())
            .spawn(move || {
                Self::dispatcher_loop(request_receiver, worker_senders);
            })
            .expect("Failed to spawn DiskScheduler dispatcher thread");

        DiskScheduler {
            request_sender,
            dispatcher_thread: Some(dispatcher_thread),
            worker_threads,
        }
    }

    fn dispatcher_loop(receiver: Receiver<DiskRequest>, worker_senders: Vec<Sender<DiskRequest>>) {
        log::debug!("DiskScheduler dispatcher thread started.");
        let mut rr_idx: usize = 0;
        while let Ok(request) = receiver.recv() {
            match request {
                DiskRequest::Shutdown => {
                    for tx in &worker_senders {
                        let _ = tx.send(DiskRequest::Shutdown);
                    }
                    break;
                }
                other => {
                    let idx = rr_idx % worker_senders.len();
                    rr_idx = rr_idx.wrapping_add(1);
                    if worker_senders[idx].send(other).is_err() {
                        log::error!("disk scheduler worker {} hung up; dropping request", idx);
                        break;
                    }
                }
            }
        }
        log::debug!("DiskScheduler dispatcher thread finished.");
    }

    fn io_worker_loop(receiver: Receiver<DiskRequest>, disk_manager: Arc<DiskManager>) {
        while let Ok(request) = receiver.recv() {
            match request {
                DiskRequest::ReadPage {
                    page_id,
                    result_sender,
                } => {
                    let result = disk_manager
                        .read_page(page_id)
                        .map(|data| BytesMut::from(&data[..]));
                    let _ = result_sender.send(result);
                }
                DiskRequest::WritePage {
                    page_id,
                    data,
                    result_sender,
                } => {
                    let _ = result_sender.send(disk_manager.write_page(page_id, &data));
                }
                DiskRequest::AllocatePage { result_sender } => {
                    let _ = result_sender.send(disk_manager.allocate_page());
                }
                DiskRequest::DeallocatePage {
                    page_id,
                    result_sender,
                } => {
                    let _ = result_sender.send(disk_manager.deallocate_page(page_id));
                }
                DiskRequest::Shutdown => break,
            }
        }
    }

    pub fn schedule_read(&self, page_id: PageId) -> PetraResult<DiskCommandResultReceiver<BytesMut>> {
        let (tx, rx) = mpsc::channel();
        self.send(DiskRequest::ReadPage {
            page_id,
            result_sender: tx,
        })?;
        Ok(rx)
    }

    pub fn schedule_write(
        &self,
        page_id: PageId,
        data: Bytes,
    ) -> PetraResult<DiskCommandResultReceiver<()>> {
        let (tx, rx) = mpsc::channel();
        self.send(DiskRequest::WritePage {
            page_id,
            data,
            result_sender: tx,
        })?;
        Ok(rx)
    }

    pub fn schedule_allocate(&self) -> PetraResult<DiskCommandResultReceiver<PageId>> {
        let (tx, rx) = mpsc::channel();
        self.send(DiskRequest::AllocatePage { result_sender: tx })?;
        Ok(rx)
    }

    pub fn schedule_deallocate(&self, page_id: PageId) -> PetraResult<DiskCommandResultReceiver<()>> {
        let (tx, rx) = mpsc::channel();
        self.send(DiskRequest::DeallocatePage {
            page_id,
            result_sender: tx,
        })?;
        Ok(rx)
    }

    fn send(&self, request: DiskRequest) -> PetraResult<()> {
        self.request_sender
            .send(request)
            .map_err(|e| PetraError::Internal(format!("disk scheduler channel closed: {}", e)))
    }
}

impl Drop for DiskScheduler {
    fn drop(&mut self) {
        let _ = self.request_sender.send(DiskRequest::Shutdown);
        if let Some(handle) = self.dispatcher_thread.take() {
            let _ = handle.join();
        }
        for handle in self.worker_threads.drain(..) {
            let _ = handle.join();
        }
    }
}
