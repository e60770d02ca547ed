use tokio::task::AbortHandle;
use tokio::time::Instant;

use serde::Serialize;

use super::job::ClientId;

/// The collection a job currently sits in, plus the data only that state
/// needs. The variant tag is the single source of truth for which of a
/// tube's four collections holds the job.
#[derive(Clone, Debug)]
pub enum JobState {
    Ready,
    Delayed {
        until: Instant,
        /// One-shot task that posts delay expiry back to the owning tube.
        /// Aborted when the job leaves the delayed state early.
        timer: AbortHandle,
    },
    Reserved {
        deadline: Instant,
        by: ClientId,
    },
    Buried,
}

impl JobState {
    pub fn name(&self) -> &'static str {
        use JobState::*;

        match self {
            Ready => "ready",
            Delayed { .. } => "delayed",
            Reserved { .. } => "reserved",
            Buried => "buried",
        }
    }
}

// This impl is used to allow JobStats to be serialised to YAML.
impl Serialize for JobState {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.name())
    }
}
