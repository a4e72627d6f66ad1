use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct BufferPoolConfig {
    pub buffer_pool_size: usize,
    pub lru_k_k: usize,
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        BufferPoolConfig {
            buffer_pool_size: 1000,
            lru_k_k: 2,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct IOSchedulerConfig {
    /// Number of I/O worker threads.
    pub workers: usize,
}

impl Default for IOSchedulerConfig {
    fn default() -> Self {
        IOSchedulerConfig { workers: 2 }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LockManagerConfig {
    /// How often the background detector rebuilds the wait-for graph.
    pub cycle_detection_interval: Duration,
}

impl Default for LockManagerConfig {
    fn default() -> Self {
        LockManagerConfig {
            cycle_detection_interval: Duration::from_millis(50),
        }
    }
}
