use std::collections::{HashMap, VecDeque};
use std::future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::job::{ClientId, Job, JobStats, Pri};
use super::queues::{BuriedList, DeadlineQueue, JobTable, ReadyQueue};
use super::states::JobState;

// A tube is a task, not a struct behind a lock: its control loop is the
// only writer to the four job collections, so every mutation is totally
// ordered by arrival at the request endpoint. Timers re-enter through the
// same endpoint, keeping the loop free of any other synchronisation.

/// Stats reported for `stats-tube`, and aggregated across tubes for the
/// server-wide `stats` response.
#[derive(Debug, Default, PartialEq, Serialize)]
pub struct TubeStats {
    /// tube name
    pub name: String,
    /// number of jobs in ready state with priority < 1024
    #[serde(rename = "current-jobs-urgent")]
    pub current_jobs_urgent: u64,
    /// number of jobs in ready state
    #[serde(rename = "current-jobs-ready")]
    pub current_jobs_ready: u64,
    /// number of jobs reserved by clients
    #[serde(rename = "current-jobs-reserved")]
    pub current_jobs_reserved: u64,
    /// number of jobs in delayed state
    #[serde(rename = "current-jobs-delayed")]
    pub current_jobs_delayed: u64,
    /// number of jobs in buried state
    #[serde(rename = "current-jobs-buried")]
    pub current_jobs_buried: u64,
    /// total jobs created in this tube
    #[serde(rename = "total-jobs")]
    pub total_jobs: u64,
    /// number of clients that have `use`d this tube
    #[serde(rename = "current-using")]
    pub current_using: u64,
    /// number of clients blocked in a reservation on this tube
    #[serde(rename = "current-waiting")]
    pub current_waiting: u64,
    /// number of clients that have `watch`ed this tube
    #[serde(rename = "current-watching")]
    pub current_watching: u64,
    /// seconds since the current pause began, 0 if not paused
    pub pause: u64,
    /// seconds remaining until the tube is un-paused
    #[serde(rename = "pause-time-left")]
    pub pause_time_left: u64,
    /// number of `delete` commands executed against this tube
    #[serde(rename = "cmd-delete")]
    pub cmd_delete: u64,
    /// number of `pause-tube` commands executed against this tube
    #[serde(rename = "cmd-pause-tube")]
    pub cmd_pause_tube: u64,
}

/// Client counts a tube can't see from inside its loop: sessions bump these
/// as they change their used tube and watch set.
#[derive(Debug, Default)]
pub struct TubeGauges {
    pub using: AtomicU64,
    pub watching: AtomicU64,
}

/// Process-wide job id -> owning tube lookup, shared between the command
/// handlers (which resolve ids to tubes) and the tube loops (which unlink
/// ids when jobs are deleted, so map and holder release together).
#[derive(Debug, Default)]
pub struct JobIndex {
    map: Mutex<HashMap<u64, TubeHandle>>,
    /// cumulative count of TTR expiries, for the server `stats` response
    pub job_timeouts: AtomicU64,
}

impl JobIndex {
    pub fn insert(&self, id: u64, tube: TubeHandle) {
        self.map.lock().unwrap().insert(id, tube);
    }

    pub fn remove(&self, id: u64) {
        self.map.lock().unwrap().remove(&id);
    }

    pub fn find(&self, id: u64) -> Option<TubeHandle> {
        self.map.lock().unwrap().get(&id).cloned()
    }
}

/// A job handed to a worker. Carries the owning tube so a coordinator that
/// collected more commitments than it can deliver can hand the extras back.
#[derive(Debug)]
pub struct Reservation {
    pub id: u64,
    pub data: Bytes,
    pub tube: TubeHandle,
}

/// One arm of a reservation fan-out. `reply` is shared across every watched
/// tube (capacity one, so at most one commitment is deliverable) and
/// `cancel` is the fan-out-wide withdrawal signal. The tube checks `cancel`
/// under its loop before committing; a commitment that loses the send race
/// leaves the job in ready.
#[derive(Debug)]
pub struct Demand {
    pub client: ClientId,
    pub reply: mpsc::Sender<Reservation>,
    pub cancel: CancellationToken,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PeekKind {
    Ready,
    Delayed,
    Buried,
}

/// Requests a tube's control loop serves. Everything except `Demand` is
/// always selectable; demands queue until the tube has a ready job and is
/// not paused.
#[derive(Debug)]
pub enum TubeRequest {
    Supply {
        job: Job,
    },
    Demand(Demand),
    Delete {
        id: u64,
        client: ClientId,
        reply: oneshot::Sender<bool>,
    },
    Release {
        id: u64,
        pri: Pri,
        delay: Duration,
        client: ClientId,
        reply: oneshot::Sender<bool>,
    },
    Bury {
        id: u64,
        pri: Pri,
        client: ClientId,
        reply: oneshot::Sender<bool>,
    },
    Touch {
        id: u64,
        client: ClientId,
        reply: oneshot::Sender<bool>,
    },
    Kick {
        bound: u64,
        reply: oneshot::Sender<u64>,
    },
    KickJob {
        id: u64,
        reply: oneshot::Sender<bool>,
    },
    ReserveById {
        id: u64,
        client: ClientId,
        reply: oneshot::Sender<Option<Reservation>>,
    },
    Peek {
        kind: PeekKind,
        reply: oneshot::Sender<Option<(u64, Bytes)>>,
    },
    PeekJob {
        id: u64,
        reply: oneshot::Sender<Option<(u64, Bytes)>>,
    },
    Pause {
        dur: Duration,
        reply: oneshot::Sender<()>,
    },
    Stats {
        reply: oneshot::Sender<TubeStats>,
    },
    StatsJob {
        id: u64,
        reply: oneshot::Sender<Option<JobStats>>,
    },
    /// Hands back a committed reservation the coordinator could not
    /// deliver; the job reverts to ready as if never reserved.
    Surrender {
        id: u64,
        client: ClientId,
    },
    /// Returns every job reserved by a now-disconnected client to ready.
    ReleaseAll {
        client: ClientId,
    },
    /// Round-trip barrier: replied to only after every earlier request has
    /// been handled and its dispatch pass has run.
    Sync {
        reply: oneshot::Sender<()>,
    },
    /// Posted by a delayed job's one-shot timer.
    DelayFired {
        id: u64,
    },
}

/// Cheaply cloneable endpoint for one tube's control loop.
///
/// ```
/// use std::sync::Arc;
/// use rustalk::types::tube::{JobIndex, TubeHandle};
/// use tokio_test::block_on;
///
/// block_on(async {
///     let tube = TubeHandle::spawn("default", Arc::new(JobIndex::default()));
///     assert_eq!(tube.name(), "default");
///     assert_eq!(tube.kick(10).await, 0);
/// });
/// ```
#[derive(Clone, Debug)]
pub struct TubeHandle {
    name: Arc<str>,
    tx: mpsc::UnboundedSender<TubeRequest>,
    gauges: Arc<TubeGauges>,
}

impl TubeHandle {
    /// Starts a new tube's control loop and returns its endpoint.
    pub fn spawn(name: &str, index: Arc<JobIndex>) -> TubeHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let gauges = Arc::new(TubeGauges::default());
        let handle = TubeHandle {
            name: name.into(),
            tx,
            gauges: gauges.clone(),
        };

        let state = TubeState {
            name: handle.name.clone(),
            rx,
            handle: handle.clone(),
            index,
            gauges,
            jobs: JobTable::new(),
            ready: ReadyQueue::new(),
            reserved: DeadlineQueue::new(),
            delayed: DeadlineQueue::new(),
            buried: BuriedList::new(),
            waiting: VecDeque::new(),
            pause_until: None,
            pause_started: None,
            total_jobs: 0,
            cmd_delete: 0,
            cmd_pause_tube: 0,
        };
        tokio::spawn(state.run());

        handle
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn gauges(&self) -> &TubeGauges {
        &self.gauges
    }

    fn send(&self, req: TubeRequest) {
        // A dead loop means the process is shutting down; callers see the
        // same thing as a NOT_FOUND-style default from ask().
        let _ = self.tx.send(req);
    }

    async fn ask<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> TubeRequest,
    ) -> Option<T> {
        let (reply, rx) = oneshot::channel();
        self.send(make(reply));
        rx.await.ok()
    }

    pub fn supply(&self, job: Job) {
        self.send(TubeRequest::Supply { job });
    }

    pub fn demand(&self, demand: Demand) {
        self.send(TubeRequest::Demand(demand));
    }

    pub fn surrender(&self, id: u64, client: ClientId) {
        self.send(TubeRequest::Surrender { id, client });
    }

    pub fn release_all(&self, client: ClientId) {
        self.send(TubeRequest::ReleaseAll { client });
    }

    pub fn delay_fired(&self, id: u64) {
        self.send(TubeRequest::DelayFired { id });
    }

    pub async fn sync(&self) {
        self.ask(|reply| TubeRequest::Sync { reply }).await;
    }

    pub async fn delete(&self, id: u64, client: ClientId) -> bool {
        self.ask(|reply| TubeRequest::Delete { id, client, reply })
            .await
            .unwrap_or(false)
    }

    pub async fn release(
        &self,
        id: u64,
        pri: Pri,
        delay: Duration,
        client: ClientId,
    ) -> bool {
        self.ask(|reply| TubeRequest::Release {
            id,
            pri,
            delay,
            client,
            reply,
        })
        .await
        .unwrap_or(false)
    }

    pub async fn bury(&self, id: u64, pri: Pri, client: ClientId) -> bool {
        self.ask(|reply| TubeRequest::Bury {
            id,
            pri,
            client,
            reply,
        })
        .await
        .unwrap_or(false)
    }

    pub async fn touch(&self, id: u64, client: ClientId) -> bool {
        self.ask(|reply| TubeRequest::Touch { id, client, reply })
            .await
            .unwrap_or(false)
    }

    pub async fn kick(&self, bound: u64) -> u64 {
        self.ask(|reply| TubeRequest::Kick { bound, reply })
            .await
            .unwrap_or(0)
    }

    pub async fn kick_job(&self, id: u64) -> bool {
        self.ask(|reply| TubeRequest::KickJob { id, reply })
            .await
            .unwrap_or(false)
    }

    pub async fn reserve_by_id(
        &self,
        id: u64,
        client: ClientId,
    ) -> Option<Reservation> {
        self.ask(|reply| TubeRequest::ReserveById { id, client, reply })
            .await
            .flatten()
    }

    pub async fn peek(&self, kind: PeekKind) -> Option<(u64, Bytes)> {
        self.ask(|reply| TubeRequest::Peek { kind, reply })
            .await
            .flatten()
    }

    pub async fn peek_job(&self, id: u64) -> Option<(u64, Bytes)> {
        self.ask(|reply| TubeRequest::PeekJob { id, reply })
            .await
            .flatten()
    }

    pub async fn pause(&self, dur: Duration) {
        self.ask(|reply| TubeRequest::Pause { dur, reply }).await;
    }

    pub async fn stats(&self) -> Option<TubeStats> {
        self.ask(|reply| TubeRequest::Stats { reply }).await
    }

    pub async fn stats_job(&self, id: u64) -> Option<JobStats> {
        self.ask(|reply| TubeRequest::StatsJob { id, reply })
            .await
            .flatten()
    }
}

struct TubeState {
    name: Arc<str>,
    rx: mpsc::UnboundedReceiver<TubeRequest>,
    /// Clone of our own endpoint, for delay timers and reservations.
    handle: TubeHandle,
    index: Arc<JobIndex>,
    gauges: Arc<TubeGauges>,

    jobs: JobTable,
    ready: ReadyQueue,
    reserved: DeadlineQueue,
    delayed: DeadlineQueue,
    buried: BuriedList,

    /// Reservation arms parked here until the dispatch rule lets them run.
    waiting: VecDeque<Demand>,

    pause_until: Option<Instant>,
    pause_started: Option<Instant>,

    total_jobs: u64,
    cmd_delete: u64,
    cmd_pause_tube: u64,
}

pub(crate) async fn sleep_until_opt(at: Option<Instant>) {
    match at {
        Some(at) => time::sleep_until(at).await,
        None => future::pending().await,
    }
}

impl TubeState {
    async fn run(mut self) {
        loop {
            self.dispatch();

            let ttr_at = self.reserved.peek_key().map(|(at, _)| at);
            let pause_at = self.pause_until;

            // biased: deadline work strictly precedes new requests, so a
            // barrier request observes every timer that was already due.
            tokio::select! {
                biased;
                _ = sleep_until_opt(ttr_at), if ttr_at.is_some() => {
                    self.expire_reservations();
                },
                _ = sleep_until_opt(pause_at), if pause_at.is_some() => {
                    self.resume();
                },
                req = self.rx.recv() => match req {
                    Some(req) => self.handle_request(req),
                    None => return,
                },
            }
        }
    }

    fn handle_request(&mut self, req: TubeRequest) {
        use TubeRequest::*;

        match req {
            Supply { job } => self.supply(job),
            Demand(demand) => self.waiting.push_back(demand),
            Delete { id, client, reply } => {
                let _ = reply.send(self.delete(id, client));
            },
            Release {
                id,
                pri,
                delay,
                client,
                reply,
            } => {
                let _ = reply.send(self.release(id, pri, delay, client));
            },
            Bury {
                id,
                pri,
                client,
                reply,
            } => {
                let _ = reply.send(self.bury(id, pri, client));
            },
            Touch { id, client, reply } => {
                let _ = reply.send(self.touch(id, client));
            },
            Kick { bound, reply } => {
                let _ = reply.send(self.kick(bound));
            },
            KickJob { id, reply } => {
                let _ = reply.send(self.kick_job(id));
            },
            ReserveById { id, client, reply } => {
                let _ = reply.send(self.reserve_by_id(id, client));
            },
            Peek { kind, reply } => {
                let _ = reply.send(self.peek(kind));
            },
            PeekJob { id, reply } => {
                let _ = reply.send(
                    self.jobs.get(&id).map(|job| (id, job.data.clone())),
                );
            },
            Pause { dur, reply } => {
                self.pause(dur);
                let _ = reply.send(());
            },
            Stats { reply } => {
                let _ = reply.send(self.stats());
            },
            StatsJob { id, reply } => {
                let now = Instant::now();
                let _ = reply.send(
                    self.jobs.get(&id).map(|job| job.stats(&self.name, now)),
                );
            },
            Surrender { id, client } => self.surrender(id, client),
            ReleaseAll { client } => self.release_all(client),
            Sync { reply } => {
                let _ = reply.send(());
            },
            DelayFired { id } => self.delay_fired(id),
        }
    }

    fn paused(&self) -> bool {
        self.pause_until.is_some()
    }

    /// The dispatch rule: while the tube has ready jobs and is not paused,
    /// serve parked demands oldest-first. The offer is sent before the job
    /// leaves the ready queue, so a demand that was cancelled or already
    /// satisfied elsewhere costs nothing.
    fn dispatch(&mut self) {
        while !self.paused() && !self.ready.is_empty() {
            let Some(demand) = self.waiting.pop_front() else {
                break;
            };

            if demand.cancel.is_cancelled() || demand.reply.is_closed() {
                continue;
            }

            let Some(id) = self.ready.peek() else {
                self.waiting.push_front(demand);
                break;
            };
            let Some(data) =
                self.jobs.get(&id).map(|job| job.data.clone())
            else {
                // A ready entry without a job is an invariant breach; drop
                // the entry rather than the whole tube.
                warn!(tube = %self.name, id, "ready entry for unknown job");
                self.ready.pop(&mut self.jobs);
                self.waiting.push_front(demand);
                continue;
            };

            let offer = Reservation {
                id,
                data,
                tube: self.handle.clone(),
            };
            match demand.reply.try_send(offer) {
                Ok(()) => {
                    self.ready.pop(&mut self.jobs);
                    self.commit_reserved(id, demand.client);
                },
                // Lost the race against cancellation (or another tube got
                // there first): the job never left ready.
                Err(_) => continue,
            }
        }
    }

    fn supply(&mut self, mut job: Job) {
        self.total_jobs += 1;

        let id = job.id;
        let pri = job.pri;
        let delay = job.delay;

        if delay > Duration::ZERO {
            let until = Instant::now() + delay;
            let timer = self.arm_delay(id, until);
            job.state = JobState::Delayed { until, timer };
            self.jobs.insert(id, job);
            self.delayed.push(&mut self.jobs, (until, id), id);
        } else {
            job.state = JobState::Ready;
            self.jobs.insert(id, job);
            self.ready.push(&mut self.jobs, (pri, id), id);
        }
    }

    fn arm_delay(&self, id: u64, until: Instant) -> AbortHandle {
        let tube = self.handle.clone();
        tokio::spawn(async move {
            time::sleep_until(until).await;
            tube.delay_fired(id);
        })
        .abort_handle()
    }

    /// A delayed job's timer went off. Stale firings (the job was deleted,
    /// kicked, or buried first) are ignored.
    fn delay_fired(&mut self, id: u64) {
        let is_delayed = matches!(
            self.jobs.get(&id).map(|job| &job.state),
            Some(JobState::Delayed { .. }),
        );

        if is_delayed {
            self.delayed.remove(&mut self.jobs, id);
            self.push_ready(id);
        }
    }

    fn push_ready(&mut self, id: u64) {
        let key = match self.jobs.get_mut(&id) {
            Some(job) => {
                job.state = JobState::Ready;
                (job.pri, job.id)
            },
            None => return,
        };
        self.ready.push(&mut self.jobs, key, id);
    }

    fn commit_reserved(&mut self, id: u64, client: ClientId) {
        let deadline = match self.jobs.get_mut(&id) {
            Some(job) => {
                let deadline = Instant::now() + job.ttr;
                job.state = JobState::Reserved {
                    deadline,
                    by: client,
                };
                job.reserves += 1;
                deadline
            },
            None => return,
        };
        self.reserved.push(&mut self.jobs, (deadline, id), id);
    }

    /// Detaches a job from whichever collection holds it, stopping its
    /// delay timer if any. The job stays in the table.
    fn unhold(&mut self, id: u64) {
        enum Holder {
            Ready,
            Delayed(AbortHandle),
            Reserved,
            Buried,
        }

        let holder = match self.jobs.get(&id).map(|job| &job.state) {
            Some(JobState::Ready) => Holder::Ready,
            Some(JobState::Delayed { timer, .. }) => {
                Holder::Delayed(timer.clone())
            },
            Some(JobState::Reserved { .. }) => Holder::Reserved,
            Some(JobState::Buried) => Holder::Buried,
            None => return,
        };

        match holder {
            Holder::Ready => {
                self.ready.remove(&mut self.jobs, id);
            },
            Holder::Delayed(timer) => {
                timer.abort();
                self.delayed.remove(&mut self.jobs, id);
            },
            Holder::Reserved => {
                self.reserved.remove(&mut self.jobs, id);
            },
            Holder::Buried => {
                self.buried.remove(id);
            },
        }
    }

    /// True if `client` may delete/release/bury/touch this job: reserved
    /// jobs answer only to their reserver.
    fn owned_or_free(&self, id: u64, client: ClientId) -> bool {
        match self.jobs.get(&id) {
            Some(job) => match job.state {
                JobState::Reserved { by, .. } => by == client,
                _ => true,
            },
            None => false,
        }
    }

    fn reserved_by(&self, id: u64, client: ClientId) -> bool {
        matches!(
            self.jobs.get(&id).map(|job| &job.state),
            Some(&JobState::Reserved { by, .. }) if by == client
        )
    }

    fn delete(&mut self, id: u64, client: ClientId) -> bool {
        if !self.owned_or_free(id, client) {
            return false;
        }

        self.unhold(id);
        self.jobs.remove(&id);
        self.index.remove(id);
        self.cmd_delete += 1;

        true
    }

    fn release(
        &mut self,
        id: u64,
        pri: Pri,
        delay: Duration,
        client: ClientId,
    ) -> bool {
        if !self.reserved_by(id, client) {
            return false;
        }

        self.reserved.remove(&mut self.jobs, id);

        if delay > Duration::ZERO {
            let until = Instant::now() + delay;
            let timer = self.arm_delay(id, until);
            if let Some(job) = self.jobs.get_mut(&id) {
                job.pri = pri;
                job.delay = delay;
                job.releases += 1;
                job.state = JobState::Delayed { until, timer };
            }
            self.delayed.push(&mut self.jobs, (until, id), id);
        } else {
            if let Some(job) = self.jobs.get_mut(&id) {
                job.pri = pri;
                job.delay = Duration::ZERO;
                job.releases += 1;
            }
            self.push_ready(id);
        }

        true
    }

    fn bury(&mut self, id: u64, pri: Pri, client: ClientId) -> bool {
        if !self.reserved_by(id, client) {
            return false;
        }

        self.reserved.remove(&mut self.jobs, id);
        if let Some(job) = self.jobs.get_mut(&id) {
            job.pri = pri;
            job.buries += 1;
            job.state = JobState::Buried;
        }
        self.buried.push(id);

        true
    }

    fn touch(&mut self, id: u64, client: ClientId) -> bool {
        if !self.reserved_by(id, client) {
            return false;
        }

        let deadline = match self.jobs.get_mut(&id) {
            Some(job) => {
                let deadline = Instant::now() + job.ttr;
                job.state = JobState::Reserved {
                    deadline,
                    by: client,
                };
                deadline
            },
            None => return false,
        };
        self.reserved.rekey(&mut self.jobs, id, (deadline, id))
    }

    /// Buried jobs are kicked first; delayed jobs only get kicked by a
    /// call that finds nothing buried.
    fn kick(&mut self, bound: u64) -> u64 {
        let mut moved = 0;

        if !self.buried.is_empty() {
            while moved < bound {
                let Some(id) = self.buried.take() else {
                    break;
                };
                self.note_kicked(id);
                moved += 1;
            }
        } else {
            while moved < bound && !self.delayed.is_empty() {
                let Some(id) = self.delayed.peek() else {
                    break;
                };
                self.unhold(id);
                self.note_kicked(id);
                moved += 1;
            }
        }

        moved
    }

    fn kick_job(&mut self, id: u64) -> bool {
        let kickable = matches!(
            self.jobs.get(&id).map(|job| &job.state),
            Some(JobState::Buried | JobState::Delayed { .. }),
        );

        if !kickable {
            return false;
        }

        self.unhold(id);
        self.note_kicked(id);
        true
    }

    fn note_kicked(&mut self, id: u64) {
        if let Some(job) = self.jobs.get_mut(&id) {
            job.kicks += 1;
        }
        self.push_ready(id);
    }

    fn reserve_by_id(
        &mut self,
        id: u64,
        client: ClientId,
    ) -> Option<Reservation> {
        let job = self.jobs.get(&id)?;
        if matches!(job.state, JobState::Reserved { .. }) {
            return None;
        }
        let data = job.data.clone();

        self.unhold(id);
        self.commit_reserved(id, client);

        Some(Reservation {
            id,
            data,
            tube: self.handle.clone(),
        })
    }

    fn peek(&self, kind: PeekKind) -> Option<(u64, Bytes)> {
        let id = match kind {
            PeekKind::Ready => self.ready.peek(),
            PeekKind::Delayed => self.delayed.peek(),
            PeekKind::Buried => self.buried.peek(),
        }?;
        self.jobs.get(&id).map(|job| (id, job.data.clone()))
    }

    fn pause(&mut self, dur: Duration) {
        let now = Instant::now();
        self.pause_until = Some(now + dur);
        self.pause_started = Some(now);
        self.cmd_pause_tube += 1;
    }

    fn resume(&mut self) {
        self.pause_until = None;
        self.pause_started = None;
    }

    /// The coordinator could not deliver a commitment (it was cancelled or
    /// already satisfied): put the job back as if the reservation never
    /// happened, including the reserve count.
    fn surrender(&mut self, id: u64, client: ClientId) {
        if !self.reserved_by(id, client) {
            return;
        }

        self.reserved.remove(&mut self.jobs, id);
        if let Some(job) = self.jobs.get_mut(&id) {
            job.reserves = job.reserves.saturating_sub(1);
        }
        self.push_ready(id);
    }

    /// Client went away: its reservations return to ready. Not a timeout,
    /// not a release; no counters move.
    fn release_all(&mut self, client: ClientId) {
        let held: Vec<u64> = self
            .reserved
            .ids()
            .filter(|id| self.reserved_by(*id, client))
            .collect();

        for id in held {
            self.reserved.remove(&mut self.jobs, id);
            self.push_ready(id);
        }
    }

    fn expire_reservations(&mut self) {
        let now = Instant::now();

        while let Some((deadline, _)) = self.reserved.peek_key() {
            if deadline > now {
                break;
            }
            let Some(id) = self.reserved.pop(&mut self.jobs) else {
                break;
            };
            if let Some(job) = self.jobs.get_mut(&id) {
                job.timeouts += 1;
            }
            self.index.job_timeouts.fetch_add(1, Ordering::Relaxed);
            self.push_ready(id);
        }
    }

    fn stats(&self) -> TubeStats {
        let now = Instant::now();
        let urgent = self
            .ready
            .ids()
            .filter(|id| {
                self.jobs.get(id).is_some_and(|job| job.pri.is_urgent())
            })
            .count() as u64;
        let waiting = self
            .waiting
            .iter()
            .filter(|d| !d.cancel.is_cancelled() && !d.reply.is_closed())
            .count() as u64;

        TubeStats {
            name: self.name.to_string(),
            current_jobs_urgent: urgent,
            current_jobs_ready: self.ready.len() as u64,
            current_jobs_reserved: self.reserved.len() as u64,
            current_jobs_delayed: self.delayed.len() as u64,
            current_jobs_buried: self.buried.len() as u64,
            total_jobs: self.total_jobs,
            current_using: self.gauges.using.load(Ordering::Relaxed),
            current_waiting: waiting,
            current_watching: self.gauges.watching.load(Ordering::Relaxed),
            pause: self
                .pause_started
                .map(|at| now.saturating_duration_since(at).as_secs())
                .unwrap_or(0),
            pause_time_left: self
                .pause_until
                .map(|at| at.saturating_duration_since(now).as_secs())
                .unwrap_or(0),
            cmd_delete: self.cmd_delete,
            cmd_pause_tube: self.cmd_pause_tube,
        }
    }
}
