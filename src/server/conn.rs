use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use futures::SinkExt;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tokio_stream::StreamExt;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::reserve::Rendezvous;
use super::{Server, DEFAULT_TUBE};
use crate::types::job::{ClientId, Job, Pri};
use crate::types::tube::{
    sleep_until_opt, PeekKind, Reservation, TubeHandle,
};
use crate::wire::decoder::Frame;
use crate::wire::protocol::{Command, Response};
use crate::wire::{self, decoder, Codec};

/// Runs one client connection to completion: read frames, drive tubes,
/// write replies. Returns once the peer disconnects, `quit` arrives, or
/// `cancel` fires; protocol errors are reported to the client and the
/// connection carries on.
pub async fn serve<T>(
    srv: Arc<Server>,
    io: T,
    cancel: CancellationToken,
) -> Result<()>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let client = srv.connection_opened();
    debug!(client = client.0, "accepted connection");

    let used = srv.tube(DEFAULT_TUBE);
    used.gauges().using.fetch_add(1, Ordering::Relaxed);
    used.gauges().watching.fetch_add(1, Ordering::Relaxed);
    let mut watched = BTreeMap::new();
    watched.insert(DEFAULT_TUBE.to_owned(), used.clone());

    let framed = wire::framed(io, srv.max_job_size() as usize);

    let conn = Conn {
        srv,
        client,
        cancel,
        framed,
        backlog: VecDeque::new(),
        resuming: false,
        used,
        watched,
        reserved_from: BTreeMap::new(),
        producer: false,
        worker: false,
    };

    conn.run().await
}

/// What to do after handling one frame.
enum Flow {
    Continue,
    Closed,
}

/// One step of input, after protocol-error handling.
enum Input {
    Event(Frame),
    /// The decoder hit a client error; the error reply has been sent and
    /// the stream will resynchronise.
    Broke,
    /// Peer disconnected, or the server is shutting down.
    Gone,
}

struct Conn<T> {
    srv: Arc<Server>,
    client: ClientId,
    cancel: CancellationToken,
    framed: Framed<T, Codec>,
    /// Frames received while blocked in a reserve, replayed afterwards.
    backlog: VecDeque<Result<Frame, decoder::Error>>,
    /// The codec yields one None after a decode error before resuming;
    /// this flag keeps that from reading as a disconnect.
    resuming: bool,

    used: TubeHandle,
    watched: BTreeMap<String, TubeHandle>,
    /// Tubes this client has reserved from, told to release its
    /// reservations when the connection ends.
    reserved_from: BTreeMap<String, TubeHandle>,
    producer: bool,
    worker: bool,
}

impl<T> Conn<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    async fn run(mut self) -> Result<()> {
        let result = self.serve_commands().await;

        for tube in self.reserved_from.values() {
            tube.release_all(self.client);
        }
        self.used.gauges().using.fetch_sub(1, Ordering::Relaxed);
        for tube in self.watched.values() {
            tube.gauges().watching.fetch_sub(1, Ordering::Relaxed);
        }
        self.srv.connection_closed(self.producer, self.worker);
        debug!(client = self.client.0, "connection closed");

        self.framed
            .into_inner()
            .shutdown()
            .await
            .context("during shutdown")?;

        result
    }

    async fn serve_commands(&mut self) -> Result<()> {
        loop {
            let cmd = match self.next_input().await? {
                Input::Gone => return Ok(()),
                Input::Broke => continue,
                Input::Event(Frame::Skipped) => continue,
                Input::Event(Frame::Command(cmd)) => cmd,
                Input::Event(evt) => {
                    // Job data with no put in flight: the decoder and this
                    // loop disagree about state. Isolate the connection.
                    bail!("unexpected frame outside a put: {evt:?}");
                },
            };

            self.srv.record_usage(&cmd);

            let flow = match cmd {
                Command::Quit => Flow::Closed,
                Command::Put {
                    pri, delay, ttr, ..
                } => self.put(pri, delay, ttr).await?,
                Command::Reserve => self.reserve(None).await?,
                Command::ReserveWithTimeout { timeout } => {
                    self.reserve(Some(timeout)).await?
                },
                cmd => {
                    let resp = self.execute(cmd).await;
                    self.framed.send(resp).await?;
                    Flow::Continue
                },
            };

            if matches!(flow, Flow::Closed) {
                return Ok(());
            }
        }
    }

    /// The next frame from the backlog or the wire, with decode errors
    /// already reported to the client.
    async fn next_input(&mut self) -> Result<Input> {
        let cancel = self.cancel.clone();

        loop {
            if let Some(item) = self.backlog.pop_front() {
                return self.digest(item).await;
            }

            let item = tokio::select! {
                item = self.framed.next() => item,
                _ = cancel.cancelled() => return Ok(Input::Gone),
            };

            match item {
                None if self.resuming => self.resuming = false,
                None => return Ok(Input::Gone),
                Some(item) => {
                    if item.is_err() {
                        self.resuming = true;
                    }
                    return self.digest(item).await;
                },
            }
        }
    }

    async fn digest(
        &mut self,
        item: Result<Frame, decoder::Error>,
    ) -> Result<Input> {
        match item {
            Ok(evt) => Ok(Input::Event(evt)),
            Err(decoder::Error::Io(err)) => Err(err.into()),
            Err(decoder::Error::Client(resp)) => {
                self.framed.send(resp).await?;
                Ok(Input::Broke)
            },
        }
    }

    /// A `put` whose command line has arrived: take the body frame, then
    /// create the job. The decoder has already bounded the body against
    /// the size cap.
    async fn put(&mut self, pri: u32, delay: u32, ttr: u32) -> Result<Flow> {
        let body = match self.next_input().await? {
            Input::Gone => return Ok(Flow::Closed),
            // The decoder already told the client what broke; this job
            // never happened.
            Input::Broke => return Ok(Flow::Continue),
            Input::Event(Frame::Body(body)) => Some(body),
            Input::Event(Frame::OversizeBody) => None,
            Input::Event(evt) => {
                bail!("expected a put body, got {evt:?}");
            },
        };

        let resp = match body {
            None => Response::JobTooBig,
            Some(_) if self.srv.is_draining() => Response::Draining,
            Some(body) => {
                if !self.producer {
                    self.producer = true;
                    self.srv.producer_latched();
                }

                let id = self.srv.next_job_id();
                let job = Job::new(
                    id,
                    Pri(pri),
                    Duration::from_secs(delay.into()),
                    Duration::from_secs(ttr.into()),
                    body,
                );

                // Index first: a job must be findable by id from the
                // moment its INSERTED reply can reach the client.
                self.srv.index().insert(id, self.used.clone());
                self.used.supply(job);

                Response::Inserted { id }
            },
        };

        self.framed.send(resp).await?;
        Ok(Flow::Continue)
    }

    /// `reserve` and `reserve-with-timeout`: fan a demand out to every
    /// watched tube and wait for the first commitment, the deadline, or
    /// the peer going away. The socket stays watched throughout so a
    /// disconnect withdraws the demand promptly; frames that arrive while
    /// blocked are queued for afterwards.
    async fn reserve(&mut self, timeout: Option<u32>) -> Result<Flow> {
        if !self.worker {
            self.worker = true;
            self.srv.worker_latched();
        }

        if timeout == Some(0) {
            let rv = Rendezvous::begin(
                &self.srv,
                self.client,
                self.watched.values(),
            );
            let resp = match rv.poll().await {
                Some(res) => self.accept(res),
                None => Response::TimedOut,
            };
            self.framed.send(resp).await?;
            return Ok(Flow::Continue);
        }

        let deadline = timeout
            .map(|secs| Instant::now() + Duration::from_secs(secs.into()));
        let cancel = self.cancel.clone();
        let mut rv =
            Rendezvous::begin(&self.srv, self.client, self.watched.values());

        let resp = loop {
            tokio::select! {
                biased;
                got = rv.recv() => match got {
                    Some(res) => break self.accept(res),
                    // Every arm dropped without committing; nothing can
                    // arrive any more.
                    None => break Response::TimedOut,
                },
                _ = sleep_until_opt(deadline), if deadline.is_some() => {
                    break Response::TimedOut;
                },
                _ = cancel.cancelled() => return Ok(Flow::Closed),
                item = self.framed.next() => match item {
                    None if self.resuming => self.resuming = false,
                    None => return Ok(Flow::Closed),
                    Some(item) => {
                        // Pipelined commands run after the reserve ends.
                        if item.is_err() {
                            self.resuming = true;
                        }
                        self.backlog.push_back(item);
                    },
                },
            }
        };

        drop(rv);
        self.framed.send(resp).await?;
        Ok(Flow::Continue)
    }

    fn accept(&mut self, res: Reservation) -> Response {
        self.reserved_from
            .insert(res.tube.name().to_owned(), res.tube.clone());
        Response::Reserved {
            id: res.id,
            data: res.data,
        }
    }

    /// Every command that is a plain request/reply exchange.
    async fn execute(&mut self, cmd: Command) -> Response {
        use Command::*;

        match cmd {
            Use { tube } => {
                let t = self.srv.tube(&tube);
                self.used.gauges().using.fetch_sub(1, Ordering::Relaxed);
                t.gauges().using.fetch_add(1, Ordering::Relaxed);
                self.used = t;
                Response::Using { tube }
            },
            Watch { tube } => {
                let t = self.srv.tube(&tube);
                if self.watched.insert(tube, t.clone()).is_none() {
                    t.gauges().watching.fetch_add(1, Ordering::Relaxed);
                }
                Response::Watching {
                    count: self.watched.len() as u32,
                }
            },
            Ignore { tube } => {
                if self.watched.len() == 1 && self.watched.contains_key(&tube)
                {
                    return Response::NotIgnored;
                }
                if let Some(t) = self.watched.remove(&tube) {
                    t.gauges().watching.fetch_sub(1, Ordering::Relaxed);
                }
                Response::Watching {
                    count: self.watched.len() as u32,
                }
            },
            ReserveJob { id } => {
                if !self.worker {
                    self.worker = true;
                    self.srv.worker_latched();
                }
                match self.srv.find_job(id) {
                    Some(t) => {
                        match t.reserve_by_id(id, self.client).await {
                            Some(res) => self.accept(res),
                            None => Response::NotFound,
                        }
                    },
                    None => Response::NotFound,
                }
            },
            Delete { id } => match self.srv.find_job(id) {
                Some(t) => {
                    if t.delete(id, self.client).await {
                        Response::Deleted
                    } else {
                        Response::NotFound
                    }
                },
                None => Response::NotFound,
            },
            Release { id, pri, delay } => match self.srv.find_job(id) {
                Some(t) => {
                    let delay = Duration::from_secs(delay.into());
                    if t.release(id, Pri(pri), delay, self.client).await {
                        Response::Released
                    } else {
                        Response::NotFound
                    }
                },
                None => Response::NotFound,
            },
            Bury { id, pri } => match self.srv.find_job(id) {
                Some(t) => {
                    if t.bury(id, Pri(pri), self.client).await {
                        Response::Buried
                    } else {
                        Response::NotFound
                    }
                },
                None => Response::NotFound,
            },
            Touch { id } => match self.srv.find_job(id) {
                Some(t) => {
                    if t.touch(id, self.client).await {
                        Response::Touched
                    } else {
                        Response::NotFound
                    }
                },
                None => Response::NotFound,
            },
            Peek { id } => match self.srv.find_job(id) {
                Some(t) => match t.peek_job(id).await {
                    Some((id, data)) => Response::Found { id, data },
                    None => Response::NotFound,
                },
                None => Response::NotFound,
            },
            PeekReady => self.peek(PeekKind::Ready).await,
            PeekDelayed => self.peek(PeekKind::Delayed).await,
            PeekBuried => self.peek(PeekKind::Buried).await,
            Kick { bound } => Response::KickedCount {
                count: self.used.kick(bound).await,
            },
            KickJob { id } => match self.srv.find_job(id) {
                Some(t) => {
                    if t.kick_job(id).await {
                        Response::Kicked
                    } else {
                        Response::NotFound
                    }
                },
                None => Response::NotFound,
            },
            StatsJob { id } => match self.srv.find_job(id) {
                Some(t) => match t.stats_job(id).await {
                    Some(data) => Response::OkStatsJob { data },
                    None => Response::NotFound,
                },
                None => Response::NotFound,
            },
            StatsTube { tube } => match self.srv.tube_if_exists(&tube) {
                Some(t) => match t.stats().await {
                    Some(data) => Response::OkStatsTube { data },
                    None => Response::InternalError,
                },
                None => Response::NotFound,
            },
            Stats => Response::OkStats {
                data: Box::new(self.srv.stats().await),
            },
            ListTubes => Response::OkTubeList {
                tubes: self.srv.tube_names(),
            },
            ListTubeUsed => Response::Using {
                tube: self.used.name().to_owned(),
            },
            ListTubesWatched => Response::OkTubeList {
                tubes: self.watched.keys().cloned().collect(),
            },
            PauseTube { tube, delay } => {
                match self.srv.tube_if_exists(&tube) {
                    Some(t) => {
                        t.pause(Duration::from_secs(delay.into())).await;
                        Response::Paused
                    },
                    None => Response::NotFound,
                }
            },
            // Handled by serve_commands before dispatching here.
            Put { .. } | Reserve | ReserveWithTimeout { .. } | Quit => {
                Response::InternalError
            },
        }
    }

    async fn peek(&mut self, kind: PeekKind) -> Response {
        match self.used.peek(kind).await {
            Some((id, data)) => Response::Found { id, data },
            None => Response::NotFound,
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{
        duplex, AsyncReadExt, AsyncWriteExt, DuplexStream,
    };
    use tokio::time::{self, Duration};

    use super::*;
    use crate::server::DEFAULT_MAX_JOB_SIZE;

    fn server() -> Arc<Server> {
        Server::new(DEFAULT_MAX_JOB_SIZE)
    }

    async fn connect(srv: &Arc<Server>) -> DuplexStream {
        let (client, io) = duplex(1 << 16);
        let srv = srv.clone();
        tokio::spawn(async move {
            let _ = serve(srv, io, CancellationToken::new()).await;
        });
        client
    }

    async fn send(io: &mut DuplexStream, data: &str) {
        io.write_all(data.as_bytes()).await.unwrap();
    }

    async fn expect(io: &mut DuplexStream, want: &str) {
        let mut buf = vec![0u8; want.len()];
        io.read_exact(&mut buf).await.unwrap();
        assert_eq!(String::from_utf8_lossy(&buf), want);
    }

    async fn read_line(io: &mut DuplexStream) -> String {
        let mut line = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            io.read_exact(&mut byte).await.unwrap();
            line.push(byte[0]);
            if byte[0] == b'\n' {
                break;
            }
        }
        assert!(line.ends_with(b"\r\n"));
        line.truncate(line.len() - 2);
        String::from_utf8(line).unwrap()
    }

    /// Reads an `OK <len>` reply and returns its YAML body.
    async fn read_ok(io: &mut DuplexStream) -> String {
        let header = read_line(io).await;
        let len: usize = header
            .strip_prefix("OK ")
            .unwrap_or_else(|| panic!("expected OK header, got {header:?}"))
            .parse()
            .unwrap();
        let mut body = vec![0u8; len + 2];
        io.read_exact(&mut body).await.unwrap();
        assert!(body.ends_with(b"\r\n"));
        body.truncate(len);
        String::from_utf8(body).unwrap()
    }

    #[tokio::test]
    async fn put_reserve_delete_round_trip() {
        let srv = server();
        let mut a = connect(&srv).await;
        let mut b = connect(&srv).await;

        send(&mut a, "use test\r\n").await;
        expect(&mut a, "USING test\r\n").await;
        send(&mut a, "put 0 0 10 2\r\nhi\r\n").await;
        expect(&mut a, "INSERTED 0\r\n").await;

        send(&mut b, "watch test\r\n").await;
        expect(&mut b, "WATCHING 2\r\n").await;
        send(&mut b, "reserve\r\n").await;
        expect(&mut b, "RESERVED 0 2\r\nhi\r\n").await;
        send(&mut b, "delete 0\r\n").await;
        expect(&mut b, "DELETED\r\n").await;
        send(&mut b, "delete 0\r\n").await;
        expect(&mut b, "NOT_FOUND\r\n").await;
    }

    #[tokio::test]
    async fn reservations_follow_priority_order() {
        let srv = server();
        let mut c = connect(&srv).await;

        send(&mut c, "put 20 0 1 1\r\nB\r\n").await;
        expect(&mut c, "INSERTED 0\r\n").await;
        send(&mut c, "put 10 0 1 1\r\nA\r\n").await;
        expect(&mut c, "INSERTED 1\r\n").await;
        send(&mut c, "put 15 0 1 1\r\nC\r\n").await;
        expect(&mut c, "INSERTED 2\r\n").await;

        for want in ["RESERVED 1 1\r\nA\r\n", "RESERVED 2 1\r\nC\r\n",
            "RESERVED 0 1\r\nB\r\n"]
        {
            send(&mut c, "reserve\r\n").await;
            expect(&mut c, want).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn reserve_with_timeout_times_out_then_delivers() {
        let srv = server();
        let mut w = connect(&srv).await;

        send(&mut w, "reserve-with-timeout 1\r\n").await;
        expect(&mut w, "TIMED_OUT\r\n").await;

        send(&mut w, "reserve-with-timeout 2\r\n").await;

        let mut p = connect(&srv).await;
        send(&mut p, "put 0 0 5 3\r\nlol\r\n").await;
        expect(&mut p, "INSERTED 0\r\n").await;

        expect(&mut w, "RESERVED 0 3\r\nlol\r\n").await;
    }

    #[tokio::test]
    async fn bury_then_kick_resurrects() {
        let srv = server();
        let mut c = connect(&srv).await;

        send(&mut c, "put 0 0 10 1\r\nx\r\n").await;
        expect(&mut c, "INSERTED 0\r\n").await;
        send(&mut c, "reserve\r\n").await;
        expect(&mut c, "RESERVED 0 1\r\nx\r\n").await;
        send(&mut c, "bury 0 0\r\n").await;
        expect(&mut c, "BURIED\r\n").await;

        send(&mut c, "stats-job 0\r\n").await;
        let stats = read_ok(&mut c).await;
        assert!(stats.contains("state: buried"), "{stats}");
        assert!(stats.contains("buries: 1"), "{stats}");

        send(&mut c, "peek-buried\r\n").await;
        expect(&mut c, "FOUND 0 1\r\nx\r\n").await;

        send(&mut c, "kick 10\r\n").await;
        expect(&mut c, "KICKED 1\r\n").await;

        send(&mut c, "stats-job 0\r\n").await;
        let stats = read_ok(&mut c).await;
        assert!(stats.contains("state: ready"), "{stats}");
        assert!(stats.contains("kicks: 1"), "{stats}");
    }

    #[tokio::test(start_paused = true)]
    async fn touch_rewinds_the_ttr_clock() {
        let srv = server();
        let mut c = connect(&srv).await;

        send(&mut c, "put 0 0 10 2\r\nhi\r\n").await;
        expect(&mut c, "INSERTED 0\r\n").await;
        send(&mut c, "reserve\r\n").await;
        expect(&mut c, "RESERVED 0 2\r\nhi\r\n").await;

        time::advance(Duration::from_millis(100)).await;

        send(&mut c, "stats-job 0\r\n").await;
        let stats = read_ok(&mut c).await;
        assert!(stats.contains("time-left: 9.9"), "{stats}");

        send(&mut c, "touch 0\r\n").await;
        expect(&mut c, "TOUCHED\r\n").await;

        send(&mut c, "stats-job 0\r\n").await;
        let stats = read_ok(&mut c).await;
        assert!(stats.contains("time-left: 10.0"), "{stats}");
    }

    #[tokio::test]
    async fn ignoring_the_last_tube_is_refused() {
        let srv = server();
        let mut c = connect(&srv).await;

        send(&mut c, "ignore default\r\n").await;
        expect(&mut c, "NOT_IGNORED\r\n").await;

        send(&mut c, "list-tubes-watched\r\n").await;
        assert_eq!(read_ok(&mut c).await, "- default\n");

        send(&mut c, "watch other\r\n").await;
        expect(&mut c, "WATCHING 2\r\n").await;
        send(&mut c, "ignore default\r\n").await;
        expect(&mut c, "WATCHING 1\r\n").await;
        send(&mut c, "ignore other\r\n").await;
        expect(&mut c, "NOT_IGNORED\r\n").await;
    }

    #[tokio::test(start_paused = true)]
    async fn ttr_expiry_requeues_the_job() {
        let srv = server();
        let mut c = connect(&srv).await;

        send(&mut c, "put 0 0 1 1\r\nx\r\n").await;
        expect(&mut c, "INSERTED 0\r\n").await;
        send(&mut c, "reserve\r\n").await;
        expect(&mut c, "RESERVED 0 1\r\nx\r\n").await;

        time::advance(Duration::from_millis(1500)).await;

        // Reservable again, by anyone.
        send(&mut c, "reserve\r\n").await;
        expect(&mut c, "RESERVED 0 1\r\nx\r\n").await;

        send(&mut c, "stats-job 0\r\n").await;
        let stats = read_ok(&mut c).await;
        assert!(stats.contains("timeouts: 1"), "{stats}");
        assert!(stats.contains("reserves: 2"), "{stats}");
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_jobs_wait_their_turn() {
        let srv = server();
        let mut c = connect(&srv).await;

        send(&mut c, "put 0 2 5 1\r\nd\r\n").await;
        expect(&mut c, "INSERTED 0\r\n").await;

        send(&mut c, "peek-ready\r\n").await;
        expect(&mut c, "NOT_FOUND\r\n").await;
        send(&mut c, "peek-delayed\r\n").await;
        expect(&mut c, "FOUND 0 1\r\nd\r\n").await;
        send(&mut c, "reserve-with-timeout 0\r\n").await;
        expect(&mut c, "TIMED_OUT\r\n").await;

        time::advance(Duration::from_secs(3)).await;

        send(&mut c, "reserve\r\n").await;
        expect(&mut c, "RESERVED 0 1\r\nd\r\n").await;
    }

    #[tokio::test]
    async fn release_returns_the_job_with_new_priority() {
        let srv = server();
        let mut c = connect(&srv).await;

        send(&mut c, "release 0 0 0\r\n").await;
        expect(&mut c, "NOT_FOUND\r\n").await;

        send(&mut c, "put 0 0 10 1\r\nx\r\n").await;
        expect(&mut c, "INSERTED 0\r\n").await;
        send(&mut c, "reserve\r\n").await;
        expect(&mut c, "RESERVED 0 1\r\nx\r\n").await;
        send(&mut c, "release 0 100 0\r\n").await;
        expect(&mut c, "RELEASED\r\n").await;

        send(&mut c, "stats-job 0\r\n").await;
        let stats = read_ok(&mut c).await;
        assert!(stats.contains("state: ready"), "{stats}");
        assert!(stats.contains("releases: 1"), "{stats}");
        assert!(stats.contains("pri: 100"), "{stats}");
    }

    #[tokio::test(start_paused = true)]
    async fn release_with_delay_goes_through_delayed() {
        let srv = server();
        let mut c = connect(&srv).await;

        send(&mut c, "put 0 0 10 1\r\nx\r\n").await;
        expect(&mut c, "INSERTED 0\r\n").await;
        send(&mut c, "reserve\r\n").await;
        expect(&mut c, "RESERVED 0 1\r\nx\r\n").await;
        send(&mut c, "release 0 0 3\r\n").await;
        expect(&mut c, "RELEASED\r\n").await;

        send(&mut c, "stats-job 0\r\n").await;
        let stats = read_ok(&mut c).await;
        assert!(stats.contains("state: delayed"), "{stats}");

        time::advance(Duration::from_secs(4)).await;

        send(&mut c, "stats-job 0\r\n").await;
        let stats = read_ok(&mut c).await;
        assert!(stats.contains("state: ready"), "{stats}");
    }

    #[tokio::test]
    async fn reserved_jobs_answer_only_to_their_reserver() {
        let srv = server();
        let mut a = connect(&srv).await;
        let mut b = connect(&srv).await;

        send(&mut a, "put 0 0 10 1\r\nx\r\n").await;
        expect(&mut a, "INSERTED 0\r\n").await;
        send(&mut a, "reserve\r\n").await;
        expect(&mut a, "RESERVED 0 1\r\nx\r\n").await;

        for cmd in ["delete 0", "touch 0", "bury 0 0", "release 0 0 0"] {
            send(&mut b, &format!("{cmd}\r\n")).await;
            expect(&mut b, "NOT_FOUND\r\n").await;
        }

        send(&mut a, "delete 0\r\n").await;
        expect(&mut a, "DELETED\r\n").await;
    }

    #[tokio::test]
    async fn kick_falls_back_to_delayed_jobs() {
        let srv = server();
        let mut c = connect(&srv).await;

        send(&mut c, "put 0 100 1 1\r\nd\r\n").await;
        expect(&mut c, "INSERTED 0\r\n").await;

        send(&mut c, "kick 5\r\n").await;
        expect(&mut c, "KICKED 1\r\n").await;
        send(&mut c, "peek-ready\r\n").await;
        expect(&mut c, "FOUND 0 1\r\nd\r\n").await;
    }

    #[tokio::test(start_paused = true)]
    async fn paused_tubes_withhold_jobs() {
        let srv = server();
        let mut c = connect(&srv).await;

        send(&mut c, "pause-tube default 3\r\n").await;
        expect(&mut c, "PAUSED\r\n").await;
        send(&mut c, "pause-tube missing 3\r\n").await;
        expect(&mut c, "NOT_FOUND\r\n").await;

        send(&mut c, "put 0 0 5 1\r\nx\r\n").await;
        expect(&mut c, "INSERTED 0\r\n").await;

        send(&mut c, "reserve-with-timeout 1\r\n").await;
        expect(&mut c, "TIMED_OUT\r\n").await;

        // The pause lapses two seconds later and the job comes through.
        send(&mut c, "reserve-with-timeout 5\r\n").await;
        expect(&mut c, "RESERVED 0 1\r\nx\r\n").await;
    }

    #[tokio::test]
    async fn reserve_job_and_kick_job_address_by_id() {
        let srv = server();
        let mut c = connect(&srv).await;

        // Delayed jobs can be reserved directly by id.
        send(&mut c, "put 0 100 10 1\r\nx\r\n").await;
        expect(&mut c, "INSERTED 0\r\n").await;
        send(&mut c, "reserve-job 0\r\n").await;
        expect(&mut c, "RESERVED 0 1\r\nx\r\n").await;
        send(&mut c, "reserve-job 0\r\n").await;
        expect(&mut c, "NOT_FOUND\r\n").await;

        send(&mut c, "bury 0 0\r\n").await;
        expect(&mut c, "BURIED\r\n").await;
        send(&mut c, "kick-job 0\r\n").await;
        expect(&mut c, "KICKED\r\n").await;
        send(&mut c, "kick-job 0\r\n").await;
        expect(&mut c, "NOT_FOUND\r\n").await;

        send(&mut c, "stats-job 0\r\n").await;
        let stats = read_ok(&mut c).await;
        assert!(stats.contains("state: ready"), "{stats}");
        assert!(stats.contains("kicks: 1"), "{stats}");
    }

    #[tokio::test]
    async fn concurrent_reserves_get_distinct_jobs() {
        let srv = server();
        let mut w1 = connect(&srv).await;
        let mut w2 = connect(&srv).await;
        let mut p = connect(&srv).await;

        send(&mut w1, "reserve\r\n").await;
        send(&mut w2, "reserve\r\n").await;

        send(&mut p, "put 0 0 10 1\r\na\r\n").await;
        expect(&mut p, "INSERTED 0\r\n").await;
        send(&mut p, "put 0 0 10 1\r\nb\r\n").await;
        expect(&mut p, "INSERTED 1\r\n").await;

        let mut got = Vec::new();
        for w in [&mut w1, &mut w2] {
            let header = read_line(w).await;
            let id: u64 = header
                .strip_prefix("RESERVED ")
                .unwrap()
                .split(' ')
                .next()
                .unwrap()
                .parse()
                .unwrap();
            let mut body = [0u8; 3];
            w.read_exact(&mut body).await.unwrap();
            got.push(id);
        }
        got.sort();
        assert_eq!(got, vec![0, 1]);
    }

    #[tokio::test]
    async fn disconnect_releases_reservations() {
        let srv = server();
        let mut a = connect(&srv).await;
        let mut b = connect(&srv).await;

        send(&mut a, "put 0 0 100 1\r\nx\r\n").await;
        expect(&mut a, "INSERTED 0\r\n").await;

        send(&mut b, "reserve\r\n").await;
        expect(&mut b, "RESERVED 0 1\r\nx\r\n").await;
        drop(b);

        // The released job reaches the next worker without waiting for
        // the TTR.
        send(&mut a, "reserve\r\n").await;
        expect(&mut a, "RESERVED 0 1\r\nx\r\n").await;
    }

    #[tokio::test]
    async fn oversized_jobs_are_rejected_and_skipped() {
        let srv = Server::new(4);
        let mut c = connect(&srv).await;

        send(&mut c, "put 0 0 1 5\r\nhello\r\n").await;
        expect(&mut c, "JOB_TOO_BIG\r\n").await;

        // The connection is still usable and the body wasn't enqueued.
        send(&mut c, "put 0 0 1 2\r\nok\r\n").await;
        expect(&mut c, "INSERTED 0\r\n").await;
        send(&mut c, "peek-ready\r\n").await;
        expect(&mut c, "FOUND 0 2\r\nok\r\n").await;
    }

    #[tokio::test]
    async fn protocol_errors_keep_the_connection_alive() {
        let srv = server();
        let mut c = connect(&srv).await;

        send(&mut c, "frobnicate\r\n").await;
        expect(&mut c, "UNKNOWN_COMMAND\r\n").await;

        send(&mut c, "put 1 2 3\r\n").await;
        expect(&mut c, "BAD_FORMAT\r\n").await;

        send(&mut c, "use -bad\r\n").await;
        expect(&mut c, "BAD_FORMAT\r\n").await;

        // Missing body CRLF: error, resync, carry on.
        send(&mut c, "put 0 0 1 2\r\nhi!\r\n").await;
        expect(&mut c, "EXPECTED_CRLF\r\n").await;

        send(&mut c, "list-tubes\r\n").await;
        assert_eq!(read_ok(&mut c).await, "- default\n");
    }

    #[tokio::test]
    async fn quit_closes_the_connection() {
        let srv = server();
        let mut c = connect(&srv).await;

        send(&mut c, "quit\r\n").await;

        let mut buf = [0u8; 1];
        assert_eq!(c.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn use_and_list_commands_agree() {
        let srv = server();
        let mut c = connect(&srv).await;

        send(&mut c, "list-tube-used\r\n").await;
        expect(&mut c, "USING default\r\n").await;

        send(&mut c, "use jobs.high\r\n").await;
        expect(&mut c, "USING jobs.high\r\n").await;
        send(&mut c, "list-tube-used\r\n").await;
        expect(&mut c, "USING jobs.high\r\n").await;

        send(&mut c, "list-tubes\r\n").await;
        assert_eq!(read_ok(&mut c).await, "- default\n- jobs.high\n");
    }

    #[tokio::test]
    async fn server_stats_count_the_obvious_things() {
        let srv = server();
        let mut c = connect(&srv).await;

        send(&mut c, "put 1000 0 10 1\r\nx\r\n").await;
        expect(&mut c, "INSERTED 0\r\n").await;

        send(&mut c, "stats\r\n").await;
        let stats = read_ok(&mut c).await;
        for want in [
            "current-jobs-ready: 1",
            "current-jobs-urgent: 1",
            "cmd-put: 1",
            "total-jobs: 1",
            "current-connections: 1",
            "current-producers: 1",
            "current-workers: 0",
            "current-tubes: 1",
            "max-job-size: 65535",
            "draining: false",
        ] {
            assert!(stats.contains(want), "missing {want:?} in {stats}");
        }
    }

    #[tokio::test]
    async fn tube_stats_track_watchers_and_pauses() {
        let srv = server();
        let mut c = connect(&srv).await;

        send(&mut c, "put 0 0 10 1\r\nx\r\n").await;
        expect(&mut c, "INSERTED 0\r\n").await;

        send(&mut c, "stats-tube default\r\n").await;
        let stats = read_ok(&mut c).await;
        for want in [
            "name: default",
            "current-jobs-ready: 1",
            "current-using: 1",
            "current-watching: 1",
            "total-jobs: 1",
        ] {
            assert!(stats.contains(want), "missing {want:?} in {stats}");
        }

        send(&mut c, "stats-tube missing\r\n").await;
        expect(&mut c, "NOT_FOUND\r\n").await;
    }
}
