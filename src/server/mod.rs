use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use itertools::Itertools;
use tokio::time::Instant;

use crate::types::job::ClientId;
use crate::types::tube::{JobIndex, TubeHandle};
use crate::wire::protocol::{CmdUsage, Command, ServerStats};

pub mod conn;
pub mod reserve;

/// The tube every connection starts out using and watching. It exists from
/// startup and is never removed.
pub const DEFAULT_TUBE: &str = "default";

pub const DEFAULT_MAX_JOB_SIZE: u32 = 65535;

const VERSION: &str = concat!("rustalk ", env!("CARGO_PKG_VERSION"));

/// Process-global state: the tube registry, the job id -> tube index, the
/// id allocator, and the counters behind the `stats` command.
///
/// Tubes and jobs are created from connection tasks, so the two maps sit
/// behind mutexes; everything per-job lives inside the owning tube's loop
/// and is never touched from here.
pub struct Server {
    index: Arc<JobIndex>,
    tubes: Mutex<HashMap<String, TubeHandle>>,
    next_id: AtomicU64,
    started: Instant,
    max_job_size: u32,
    draining: AtomicBool,

    usage: Mutex<CmdUsage>,
    current_connections: AtomicU64,
    total_connections: AtomicU64,
    current_producers: AtomicU64,
    current_workers: AtomicU64,
    current_waiting: AtomicU64,
}

impl Server {
    pub fn new(max_job_size: u32) -> Arc<Self> {
        let srv = Arc::new(Self {
            index: Arc::new(JobIndex::default()),
            tubes: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            started: Instant::now(),
            max_job_size,
            draining: AtomicBool::new(false),
            usage: Mutex::new(CmdUsage::default()),
            current_connections: AtomicU64::new(0),
            total_connections: AtomicU64::new(0),
            current_producers: AtomicU64::new(0),
            current_workers: AtomicU64::new(0),
            current_waiting: AtomicU64::new(0),
        });

        srv.tube(DEFAULT_TUBE);

        srv
    }

    pub fn max_job_size(&self) -> u32 {
        self.max_job_size
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Relaxed)
    }

    pub fn index(&self) -> &Arc<JobIndex> {
        &self.index
    }

    /// Ids are handed out strictly once, starting from zero.
    pub fn next_job_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// The tube with this name, started on first reference.
    pub fn tube(&self, name: &str) -> TubeHandle {
        let mut tubes = self.tubes.lock().unwrap();
        match tubes.get(name) {
            Some(tube) => tube.clone(),
            None => {
                let tube = TubeHandle::spawn(name, self.index.clone());
                tubes.insert(name.to_owned(), tube.clone());
                tube
            },
        }
    }

    /// As [Self::tube], but commands like `stats-tube` and `pause-tube`
    /// must not conjure tubes into existence.
    pub fn tube_if_exists(&self, name: &str) -> Option<TubeHandle> {
        self.tubes.lock().unwrap().get(name).cloned()
    }

    pub fn tube_names(&self) -> Vec<String> {
        self.tubes.lock().unwrap().keys().cloned().sorted().collect()
    }

    fn tube_handles(&self) -> Vec<TubeHandle> {
        self.tubes.lock().unwrap().values().cloned().collect()
    }

    pub fn find_job(&self, id: u64) -> Option<TubeHandle> {
        self.index.find(id)
    }

    pub fn record_usage(&self, cmd: &Command) {
        self.usage.lock().unwrap().bump(cmd);
    }

    pub(crate) fn connection_opened(&self) -> ClientId {
        self.current_connections.fetch_add(1, Ordering::Relaxed);
        let serial = self.total_connections.fetch_add(1, Ordering::Relaxed);
        ClientId(serial)
    }

    pub(crate) fn connection_closed(&self, producer: bool, worker: bool) {
        self.current_connections.fetch_sub(1, Ordering::Relaxed);
        if producer {
            self.current_producers.fetch_sub(1, Ordering::Relaxed);
        }
        if worker {
            self.current_workers.fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// First `put` on a connection.
    pub(crate) fn producer_latched(&self) {
        self.current_producers.fetch_add(1, Ordering::Relaxed);
    }

    /// First `reserve` on a connection.
    pub(crate) fn worker_latched(&self) {
        self.current_workers.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn reserve_started(&self) {
        self.current_waiting.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn reserve_finished(&self) {
        self.current_waiting.fetch_sub(1, Ordering::Relaxed);
    }

    /// Assembles the `stats` response by asking every tube for its counts.
    /// Each tube answers from its own loop, so the totals are a consistent
    /// per-tube snapshot rather than a frozen global one.
    pub async fn stats(&self) -> ServerStats {
        let mut stats = ServerStats {
            current_jobs_urgent: 0,
            current_jobs_ready: 0,
            current_jobs_reserved: 0,
            current_jobs_delayed: 0,
            current_jobs_buried: 0,
            cmds: self.usage.lock().unwrap().clone(),
            job_timeouts: self.index.job_timeouts.load(Ordering::Relaxed),
            total_jobs: self.next_id.load(Ordering::Relaxed),
            max_job_size: self.max_job_size.into(),
            current_tubes: 0,
            current_connections: self
                .current_connections
                .load(Ordering::Relaxed),
            current_producers: self.current_producers.load(Ordering::Relaxed),
            current_workers: self.current_workers.load(Ordering::Relaxed),
            current_waiting: self.current_waiting.load(Ordering::Relaxed),
            total_connections: self.total_connections.load(Ordering::Relaxed),
            pid: std::process::id(),
            version: VERSION,
            uptime: self.started.elapsed().as_secs_f64(),
            draining: self.is_draining(),
        };

        let tubes = self.tube_handles();
        stats.current_tubes = tubes.len() as u64;

        for tube in tubes {
            let Some(ts) = tube.stats().await else {
                continue;
            };
            stats.current_jobs_urgent += ts.current_jobs_urgent;
            stats.current_jobs_ready += ts.current_jobs_ready;
            stats.current_jobs_reserved += ts.current_jobs_reserved;
            stats.current_jobs_delayed += ts.current_jobs_delayed;
            stats.current_jobs_buried += ts.current_jobs_buried;
        }

        stats
    }
}
