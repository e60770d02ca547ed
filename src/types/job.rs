use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use tokio::time::Instant;

use super::states::JobState;

/// Priorities are compared smallest-first: 0 is the most urgent job on a
/// tube, [u32::MAX] the least.
#[derive(Clone, Copy, Debug, Eq, PartialEq, PartialOrd, Ord)]
pub struct Pri(pub u32);

impl Pri {
    /// Jobs below this priority count towards `current-jobs-urgent`.
    pub const URGENT_BELOW: u32 = 1024;

    pub fn is_urgent(self) -> bool {
        self.0 < Self::URGENT_BELOW
    }
}

/// Identifies one client connection for the lifetime of the process. Used to
/// enforce the only-the-reserver rules on delete, release, bury, and touch.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct ClientId(pub u64);

#[derive(Debug)]
pub struct Job {
    pub id: u64,
    pub pri: Pri,
    pub data: Bytes,
    /// Delay requested by the last put or release, kept for stats-job.
    pub delay: Duration,
    pub ttr: Duration,
    pub created: Instant,
    pub state: JobState,
    /// Slot in whichever heap currently holds this job. Maintained by the
    /// heap on every swap; meaningless for buried jobs.
    pub heap_index: usize,
    pub reserves: u64,
    pub timeouts: u64,
    pub releases: u64,
    pub buries: u64,
    pub kicks: u64,
}

impl Job {
    pub fn new(
        id: u64,
        pri: Pri,
        delay: Duration,
        ttr: Duration,
        data: Bytes,
    ) -> Self {
        Self {
            id,
            pri,
            data,
            delay,
            // A zero TTR is not representable in the protocol's deadline
            // model, so it quietly becomes one second.
            ttr: ttr.max(Duration::from_secs(1)),
            created: Instant::now(),
            state: JobState::Ready,
            heap_index: 0,
            reserves: 0,
            timeouts: 0,
            releases: 0,
            buries: 0,
            kicks: 0,
        }
    }

    /// Snapshot for a `stats-job` response.
    pub fn stats(&self, tube: &str, now: Instant) -> JobStats {
        let time_left = match self.state {
            JobState::Reserved { deadline, .. } => {
                deadline.saturating_duration_since(now).as_secs_f64()
            },
            JobState::Delayed { until, .. } => {
                until.saturating_duration_since(now).as_secs_f64()
            },
            _ => 0.0,
        };

        JobStats {
            id: self.id,
            tube: tube.to_owned(),
            state: self.state.clone(),
            pri: self.pri.0,
            age: now.saturating_duration_since(self.created).as_secs_f64(),
            delay: self.delay.as_secs_f64(),
            ttr: self.ttr.as_secs(),
            time_left,
            file: 0,
            reserves: self.reserves,
            timeouts: self.timeouts,
            releases: self.releases,
            buries: self.buries,
            kicks: self.kicks,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct JobStats {
    /// job ID
    pub id: u64,
    /// tube containing job
    pub tube: String,
    /// job state
    pub state: JobState,
    /// priority set by last put/release/bury
    pub pri: u32,
    /// time in seconds since creation
    pub age: f64,
    /// delay applied by the last put/release
    pub delay: f64,
    /// allowed processing time in seconds
    pub ttr: u64,
    /// seconds until the job returns to the ready queue (reserved) or
    /// becomes ready (delayed)
    #[serde(rename = "time-left")]
    pub time_left: f64,
    /// earliest binlog file containing job; always 0 as there is no binlog
    pub file: u32,
    /// number of times job reserved
    pub reserves: u64,
    /// number of times job timed out
    pub timeouts: u64,
    /// number of times job released
    pub releases: u64,
    /// number of times job buried
    pub buries: u64,
    /// number of times job kicked
    pub kicks: u64,
}
