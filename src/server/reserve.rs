use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::Server;
use crate::types::job::ClientId;
use crate::types::tube::{Demand, Reservation, TubeHandle};

// One reservation fans out to every watched tube as a demand sharing a
// single capacity-one reply channel and one cancellation token. The
// channel capacity is what makes "exactly one job per successful call"
// hold: a second tube's commitment either fails its send (and the job
// never leaves ready) or lands in the buffer, where settle() finds it and
// hands it back.

/// A single in-flight `reserve`: the receiving end of the fan-out.
///
/// Dropping a Rendezvous settles it: the fan-out is cancelled, and any
/// commitment nobody received is surrendered to its tube. Callers that got
/// a job keep it; everything else is rolled back.
pub struct Rendezvous {
    client: ClientId,
    tubes: Vec<TubeHandle>,
    rx: mpsc::Receiver<Reservation>,
    cancel: CancellationToken,
    srv: Arc<Server>,
    settled: bool,
}

impl Rendezvous {
    /// Delivers one demand to every tube in the watch set.
    pub fn begin<'a>(
        srv: &Arc<Server>,
        client: ClientId,
        watched: impl IntoIterator<Item = &'a TubeHandle>,
    ) -> Self {
        let (reply, rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();

        let tubes: Vec<TubeHandle> = watched.into_iter().cloned().collect();
        for tube in &tubes {
            tube.demand(Demand {
                client,
                reply: reply.clone(),
                cancel: cancel.clone(),
            });
        }

        srv.reserve_started();

        Self {
            client,
            tubes,
            rx,
            cancel,
            srv: srv.clone(),
            settled: false,
        }
    }

    /// The first commitment from any tube. Cancellation of the rest is the
    /// caller's business, via settle() or drop.
    pub async fn recv(&mut self) -> Option<Reservation> {
        self.rx.recv().await
    }

    /// Non-blocking variant for `reserve-with-timeout 0`: barrier every
    /// tube so queued demands have had their dispatch pass, then take
    /// whatever committed.
    pub async fn poll(mut self) -> Option<Reservation> {
        for tube in self.tubes.clone() {
            tube.sync().await;
        }
        self.rx.try_recv().ok()
    }

    /// Withdraws the fan-out: signal cancel, refuse further commitments,
    /// and give back any commitment already buffered. Idempotent.
    pub fn settle(&mut self) {
        if self.settled {
            return;
        }
        self.settled = true;

        self.cancel.cancel();
        self.rx.close();
        while let Ok(extra) = self.rx.try_recv() {
            extra.tube.surrender(extra.id, self.client);
        }

        self.srv.reserve_finished();
    }
}

impl Drop for Rendezvous {
    fn drop(&mut self) {
        self.settle();
    }
}
