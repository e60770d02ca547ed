use bytes::Bytes;
use serde::Serialize;

use crate::types::job::JobStats;
use crate::types::tube::TubeStats;

/// A command sent by the client to the server.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Command {
    /// Places a job onto the currently `use`d tube. The job body follows
    /// the command line as a separate CRLF-terminated frame.
    ///
    /// On the wire: `put <pri> <delay> <ttr> <bytes>`
    Put {
        pri: u32,
        delay: u32,
        ttr: u32,
        n_bytes: u32,
    },
    /// On the wire: `use <tube>`
    Use { tube: String },
    /// Awaits a job from the `watch`ed tubes, blocking until one appears.
    ///
    /// On the wire: `reserve`
    Reserve,
    /// As `reserve`, but replies `TIMED_OUT` after `timeout` seconds. A
    /// zero timeout is a non-blocking poll.
    ///
    /// On the wire: `reserve-with-timeout <seconds>`
    ReserveWithTimeout { timeout: u32 },
    /// Reserves the job with this exact ID if it exists and is not already
    /// reserved, otherwise `NOT_FOUND`.
    ///
    /// On the wire: `reserve-job <id>`
    ReserveJob { id: u64 },
    /// Deletes a ready, delayed, or buried job, or a job reserved by the
    /// same client. Returns `DELETED` or `NOT_FOUND`.
    ///
    /// On the wire: `delete <id>`
    Delete { id: u64 },
    /// Returns a job reserved by the same client to the ready queue, or to
    /// delayed if `delay` is non-zero.
    ///
    /// On the wire: `release <id> <pri> <delay>`
    Release { id: u64, pri: u32, delay: u32 },
    /// Buries a job reserved by the same client. Returns `BURIED` or
    /// `NOT_FOUND`.
    ///
    /// On the wire: `bury <id> <pri>`
    Bury { id: u64, pri: u32 },
    /// Refreshes the TTR of a job reserved by the same client.
    ///
    /// On the wire: `touch <id>`
    Touch { id: u64 },
    /// Adds a tube to this client's watchlist. Always replies
    /// `WATCHING <count>`.
    ///
    /// On the wire: `watch <tube>`
    Watch { tube: String },
    /// Reverses `watch`. Replies `NOT_IGNORED` rather than leaving the
    /// watchlist empty.
    ///
    /// On the wire: `ignore <tube>`
    Ignore { tube: String },
    /// Returns the data for this job regardless of state. Replies
    /// `FOUND <id> <bytes>` or `NOT_FOUND`, like the rest of the `peek`
    /// family.
    ///
    /// On the wire: `peek <id>`
    Peek { id: u64 },
    /// On the wire: `peek-ready`
    PeekReady,
    /// Next delayed job to become ready on the used tube.
    ///
    /// On the wire: `peek-delayed`
    PeekDelayed,
    /// Oldest buried job on the used tube.
    ///
    /// On the wire: `peek-buried`
    PeekBuried,
    /// Promotes up to `bound` jobs on the used tube to ready, from buried
    /// if any are buried, otherwise from delayed. Replies with the number
    /// actually moved.
    ///
    /// On the wire: `kick <bound>`
    Kick { bound: u64 },
    /// Promotes one buried or delayed job to ready by ID. Replies `KICKED`
    /// or `NOT_FOUND`.
    ///
    /// On the wire: `kick-job <id>`
    KickJob { id: u64 },
    /// Job details as a YAML mapping, like all `stats` family commands.
    ///
    /// On the wire: `stats-job <id>`
    StatsJob { id: u64 },
    /// On the wire: `stats-tube <tube>`
    StatsTube { tube: String },
    /// Server-wide counters and gauges.
    ///
    /// On the wire: `stats`
    Stats,
    /// Names of all tubes that currently exist, as a YAML sequence.
    ///
    /// On the wire: `list-tubes`
    ListTubes,
    /// On the wire: `list-tube-used`
    ListTubeUsed,
    /// On the wire: `list-tubes-watched`
    ListTubesWatched,
    /// Prevents reservations from this tube for `delay` seconds.
    ///
    /// On the wire: `pause-tube <tube> <delay>`
    PauseTube { tube: String, delay: u32 },
    /// Asks the server to close this connection.
    ///
    /// On the wire: `quit`
    Quit,
}

/// Everything the server can say back.
#[derive(Debug)]
pub enum Response {
    /// A malformed request: an overlong line, a bad tube name, or a
    /// non-number where a number belongs.
    ///
    /// On the wire: `BAD_FORMAT`.
    BadFormat,
    /// An unrecognised command verb.
    ///
    /// On the wire: `UNKNOWN_COMMAND`.
    UnknownCommand,
    /// A server bug surfaced to the client instead of a crash.
    ///
    /// On the wire: `INTERNAL_ERROR`.
    InternalError,
    /// A `put` body was not terminated by CRLF.
    ///
    /// On the wire: `EXPECTED_CRLF`.
    ExpectedCrlf,
    /// A `put` body exceeded the configured maximum job size.
    ///
    /// On the wire: `JOB_TOO_BIG`.
    JobTooBig,
    /// The server is not accepting new jobs.
    ///
    /// On the wire: `DRAINING`.
    Draining,
    /// A `put` created this job.
    ///
    /// On the wire: `INSERTED <id>`.
    Inserted { id: u64 },
    /// In response to `use` or `list-tube-used`.
    ///
    /// On the wire: `USING <tube>`.
    Using { tube: String },
    /// A reservation succeeded; the job data follows the header.
    ///
    /// On the wire: `RESERVED <id> <bytes>` + data.
    Reserved { id: u64, data: Bytes },
    /// A `reserve-with-timeout` expired with no job available.
    ///
    /// On the wire: `TIMED_OUT`.
    TimedOut,
    /// The job in question doesn't exist, or doesn't satisfy the
    /// command's precondition (wrong state, or reserved by someone else).
    ///
    /// On the wire: `NOT_FOUND`.
    NotFound,
    /// On the wire: `DELETED`.
    Deleted,
    /// On the wire: `RELEASED`.
    Released,
    /// A `bury` succeeded.
    ///
    /// On the wire: `BURIED`.
    Buried,
    /// On the wire: `TOUCHED`.
    Touched,
    /// In response to `watch` or `ignore`: the size of the watchlist.
    ///
    /// On the wire: `WATCHING <count>`.
    Watching { count: u32 },
    /// An `ignore` would have emptied the watchlist.
    ///
    /// On the wire: `NOT_IGNORED`.
    NotIgnored,
    /// A `kick-job` succeeded.
    ///
    /// On the wire: `KICKED`.
    Kicked,
    /// A `kick` moved this many jobs.
    ///
    /// On the wire: `KICKED <count>`.
    KickedCount { count: u64 },
    /// A `peek` family command found its job.
    ///
    /// On the wire: `FOUND <id> <bytes>` + data.
    Found { id: u64, data: Bytes },
    /// On the wire: `OK <bytes>` + YAML mapping.
    OkStatsJob { data: JobStats },
    /// On the wire: `OK <bytes>` + YAML mapping.
    OkStatsTube { data: TubeStats },
    /// On the wire: `OK <bytes>` + YAML mapping.
    OkStats { data: Box<ServerStats> },
    /// In response to `list-tubes` or `list-tubes-watched`.
    ///
    /// On the wire: `OK <bytes>` + YAML sequence.
    OkTubeList { tubes: Vec<String> },
    /// On the wire: `PAUSED`.
    Paused,
}

/// Per-command execution counts for the server `stats` response.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct CmdUsage {
    #[serde(rename = "cmd-put")]
    pub put: u64,
    #[serde(rename = "cmd-peek")]
    pub peek: u64,
    #[serde(rename = "cmd-peek-ready")]
    pub peek_ready: u64,
    #[serde(rename = "cmd-peek-delayed")]
    pub peek_delayed: u64,
    #[serde(rename = "cmd-peek-buried")]
    pub peek_buried: u64,
    #[serde(rename = "cmd-reserve")]
    pub reserve: u64,
    #[serde(rename = "cmd-reserve-with-timeout")]
    pub reserve_with_timeout: u64,
    #[serde(rename = "cmd-touch")]
    pub touch: u64,
    #[serde(rename = "cmd-use")]
    pub use_: u64,
    #[serde(rename = "cmd-watch")]
    pub watch: u64,
    #[serde(rename = "cmd-ignore")]
    pub ignore: u64,
    #[serde(rename = "cmd-delete")]
    pub delete: u64,
    #[serde(rename = "cmd-release")]
    pub release: u64,
    #[serde(rename = "cmd-bury")]
    pub bury: u64,
    #[serde(rename = "cmd-kick")]
    pub kick: u64,
    #[serde(rename = "cmd-stats")]
    pub stats: u64,
    #[serde(rename = "cmd-stats-job")]
    pub stats_job: u64,
    #[serde(rename = "cmd-stats-tube")]
    pub stats_tube: u64,
    #[serde(rename = "cmd-list-tubes")]
    pub list_tubes: u64,
    #[serde(rename = "cmd-list-tube-used")]
    pub list_tube_used: u64,
    #[serde(rename = "cmd-list-tubes-watched")]
    pub list_tubes_watched: u64,
    #[serde(rename = "cmd-pause-tube")]
    pub pause_tube: u64,
}

impl CmdUsage {
    pub fn bump(&mut self, cmd: &Command) {
        use Command::*;

        match cmd {
            Put { .. } => self.put += 1,
            Peek { .. } => self.peek += 1,
            PeekReady => self.peek_ready += 1,
            PeekDelayed => self.peek_delayed += 1,
            PeekBuried => self.peek_buried += 1,
            Reserve => self.reserve += 1,
            ReserveWithTimeout { .. } => self.reserve_with_timeout += 1,
            Touch { .. } => self.touch += 1,
            Use { .. } => self.use_ += 1,
            Watch { .. } => self.watch += 1,
            Ignore { .. } => self.ignore += 1,
            Delete { .. } => self.delete += 1,
            Release { .. } => self.release += 1,
            Bury { .. } => self.bury += 1,
            Kick { .. } => self.kick += 1,
            Stats => self.stats += 1,
            StatsJob { .. } => self.stats_job += 1,
            StatsTube { .. } => self.stats_tube += 1,
            ListTubes => self.list_tubes += 1,
            ListTubeUsed => self.list_tube_used += 1,
            ListTubesWatched => self.list_tubes_watched += 1,
            PauseTube { .. } => self.pause_tube += 1,
            // reserve-job and kick-job have no counter in the stats
            // response; quit never replies.
            ReserveJob { .. } | KickJob { .. } | Quit => {},
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ServerStats {
    /// number of ready jobs with priority < 1024
    #[serde(rename = "current-jobs-urgent")]
    pub current_jobs_urgent: u64,
    /// number of jobs in the ready queue
    #[serde(rename = "current-jobs-ready")]
    pub current_jobs_ready: u64,
    /// number of jobs reserved by all clients
    #[serde(rename = "current-jobs-reserved")]
    pub current_jobs_reserved: u64,
    /// number of delayed jobs
    #[serde(rename = "current-jobs-delayed")]
    pub current_jobs_delayed: u64,
    /// number of buried jobs
    #[serde(rename = "current-jobs-buried")]
    pub current_jobs_buried: u64,

    #[serde(flatten)]
    pub cmds: CmdUsage,

    /// cumulative count of times a job has timed out
    #[serde(rename = "job-timeouts")]
    pub job_timeouts: u64,
    /// cumulative count of jobs created
    #[serde(rename = "total-jobs")]
    pub total_jobs: u64,
    /// maximum number of bytes in a job
    #[serde(rename = "max-job-size")]
    pub max_job_size: u64,
    /// number of currently-existing tubes
    #[serde(rename = "current-tubes")]
    pub current_tubes: u64,
    /// number of currently open connections
    #[serde(rename = "current-connections")]
    pub current_connections: u64,
    /// open connections that have issued at least one put
    #[serde(rename = "current-producers")]
    pub current_producers: u64,
    /// open connections that have issued at least one reserve
    #[serde(rename = "current-workers")]
    pub current_workers: u64,
    /// open connections currently blocked in a reservation
    #[serde(rename = "current-waiting")]
    pub current_waiting: u64,
    /// cumulative count of connections
    #[serde(rename = "total-connections")]
    pub total_connections: u64,
    /// process id of the server
    pub pid: u32,
    /// version string of the server
    pub version: &'static str,
    /// seconds since this server process started
    pub uptime: f64,
    /// whether the server is refusing new jobs
    pub draining: bool,
}
