mod args;

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::{select, signal};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument, Level};

use crate::args::Args;
use rustalk::server::{conn, Server};

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Logging
    if args.debug {
        tracing_subscriber::fmt()
            .with_max_level(Level::TRACE)
            .init();
    } else {
        tracing_subscriber::fmt().json().init();
    }

    // Cancellation flows from ctrl-c to the accept loop to every
    // connection task; the mpsc pair holds main open until they finish.
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(error) = signal::ctrl_c().await {
                warn!(%error, "something strange with ctrl-c handling!");
            };
            cancel.cancel();
        });
    }

    let listener = match TcpListener::bind((args.listen, args.port)).await {
        Ok(l) => l,
        Err(error) => {
            error!(%error, "failed to listen for connections");
            return ExitCode::from(111);
        },
    };

    let server = Server::new(args.max_job_size);

    let (shutdown_hold, mut shutdown_wait) = mpsc::channel::<()>(1);

    let exit_code =
        match accept_loop(cancel, shutdown_hold, listener, server).await {
            Ok(()) => ExitCode::SUCCESS,
            Err(error) => {
                error!(%error, "encountered runtime error");
                ExitCode::FAILURE
            },
        };

    shutdown_wait.recv().await;

    exit_code
}

async fn accept_loop(
    cancel: CancellationToken,
    shutdown_hold: mpsc::Sender<()>,
    listener: TcpListener,
    server: Arc<Server>,
) -> Result<()> {
    info!(addr = %listener.local_addr()?, "listening");

    // Accept incoming connections until an exit signal is sent, and handle
    // each connection as its own task.
    loop {
        match select! {
            accept = listener.accept() => accept,
            _ = cancel.cancelled() => return Ok(()),
        } {
            Ok((stream, peer)) => {
                let server = server.clone();
                let cancel = cancel.clone();
                let shutdown_hold = shutdown_hold.clone();

                let span = info_span!("client_loop", %peer);
                tokio::spawn(
                    async move {
                        let _hold = shutdown_hold;

                        if let Err(error) = stream.set_nodelay(true) {
                            warn!(%error, "failed to set NODELAY");
                        }

                        match conn::serve(server, stream, cancel).await {
                            Ok(()) => debug!("connection finished"),
                            Err(error) => {
                                warn!(%error, "connection failed")
                            },
                        }
                    }
                    .instrument(span),
                );
            },
            Err(error) => {
                warn!(%error, "failed to accept connection");
                continue;
            },
        };
    }
}
