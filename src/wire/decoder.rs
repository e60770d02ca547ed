use std::{error, fmt, io};

use bytes::{Buf, Bytes};

use super::protocol::{Command, Response};

/// Longest accepted command line, terminator included. Enough for any verb
/// plus a maximum-length tube name and arguments.
const MAX_LINE: usize = 224;

/// One frame of client input. A `put` arrives as two frames: the command,
/// then its body in one piece, already checked against the size cap.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Frame {
    /// A parsed command line.
    Command(Command),
    /// The complete body of the preceding `put`.
    Body(Bytes),
    /// The preceding `put` declared a body over the size cap; its bytes
    /// were consumed and dropped to keep the stream framed.
    OversizeBody,
    /// Input dropped while recovering from a framing error.
    Skipped,
}

#[derive(Debug)]
enum State {
    /// Hunting for the next newline-terminated command.
    Line,
    /// Collecting a put body of `want` bytes plus its closing CRLF.
    Body { want: usize },
    /// Discarding an oversized body, `left` bytes still owed.
    Drain { left: usize },
    /// Throwing input away until a newline, after a framing error.
    Junk,
}

/// The per-connection decode state machine.
///
/// Bodies within the size cap are handed up whole, so memory per
/// connection is bounded by `max_body` no matter what length a client
/// declares: anything larger is drained off the wire instead of buffered.
///
/// After a framing error the decoder resynchronises at the next newline
/// and carries on. A client whose job data happens to contain newlines
/// mid-desync may see further errors until its next clean command
/// boundary.
#[derive(Debug)]
pub struct Decoder {
    state: State,
    max_body: usize,
}

impl Decoder {
    pub fn new(max_body: usize) -> Self {
        Self {
            state: State::Line,
            max_body,
        }
    }

    /// One step of decoding. `Ok(None)` always means more input is
    /// needed; any other outcome makes progress, so the caller can loop
    /// safely.
    pub fn decode(
        &mut self,
        src: &mut bytes::BytesMut,
    ) -> Result<Option<Frame>, Error> {
        match self.state {
            State::Line => {
                let Some(nl) = src.iter().position(|&b| b == b'\n') else {
                    if src.len() >= MAX_LINE {
                        self.state = State::Junk;
                        return Err(Response::BadFormat.into());
                    }
                    return Ok(None);
                };

                if nl + 1 > MAX_LINE {
                    // Overlong, but the terminator is in sight: drop the
                    // whole line and stay in command framing.
                    src.advance(nl + 1);
                    return Err(Response::BadFormat.into());
                }

                if nl == 0 || src[nl - 1] != b'\r' {
                    // A bare newline is not a line terminator here.
                    src.advance(nl + 1);
                    return Err(Response::BadFormat.into());
                }

                let line = src.split_to(nl - 1);
                src.advance(2);

                let cmd = Command::try_from(line.as_ref())?;

                if let Command::Put { n_bytes, .. } = cmd {
                    let want = n_bytes as usize;
                    self.state = if want > self.max_body {
                        State::Drain { left: want }
                    } else {
                        State::Body { want }
                    };
                }

                Ok(Some(Frame::Command(cmd)))
            },
            State::Body { want } => {
                // Wait for the body and its terminator in full.
                if src.len() < want + 2 {
                    src.reserve(want + 2 - src.len());
                    return Ok(None);
                }

                let body = src.split_to(want).freeze();

                if src.starts_with(b"\r\n") {
                    src.advance(2);
                    self.state = State::Line;
                    Ok(Some(Frame::Body(body)))
                } else {
                    self.state = State::Junk;
                    Err(Response::ExpectedCrlf.into())
                }
            },
            State::Drain { left } => {
                let take = left.min(src.len());
                src.advance(take);
                let left = left - take;
                self.state = State::Drain { left };

                if left > 0 || src.len() < 2 {
                    return Ok(None);
                }

                if src.starts_with(b"\r\n") {
                    src.advance(2);
                    self.state = State::Line;
                    Ok(Some(Frame::OversizeBody))
                } else {
                    self.state = State::Junk;
                    Err(Response::ExpectedCrlf.into())
                }
            },
            State::Junk => {
                if src.is_empty() {
                    return Ok(None);
                }

                match src.iter().position(|&b| b == b'\n') {
                    Some(nl) => {
                        src.advance(nl + 1);
                        self.state = State::Line;
                    },
                    None => src.clear(),
                }

                // Progress was made even if no newline turned up yet, and
                // Ok(None) here would read as end-of-stream.
                Ok(Some(Frame::Skipped))
            },
        }
    }
}

#[derive(Debug)]
pub enum Error {
    /// The client broke framing; this response tells it how.
    Client(Response),
    Io(io::Error),
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::Client(_) => None,
            Error::Io(err) => Some(err),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Client(resp) => write!(f, "client broke framing: {resp:?}"),
            Error::Io(err) => write!(f, "io error: {err}"),
        }
    }
}

impl From<Response> for Error {
    fn from(value: Response) -> Self {
        Self::Client(value)
    }
}

impl From<io::Error> for Error {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;

    use super::*;

    fn decoder() -> Decoder {
        Decoder::new(65535)
    }

    /// Appends `bytes` to the buffer and turns the crank until the
    /// decoder wants more input, collecting everything it produced.
    fn feed(
        dec: &mut Decoder,
        buf: &mut BytesMut,
        bytes: &[u8],
    ) -> Vec<Result<Frame, Error>> {
        buf.extend_from_slice(bytes);

        let mut out = Vec::new();
        loop {
            match dec.decode(buf) {
                Ok(Some(frame)) => out.push(Ok(frame)),
                Ok(None) => break,
                Err(err) => out.push(Err(err)),
            }
        }
        out
    }

    fn frame(r: &Result<Frame, Error>) -> &Frame {
        r.as_ref().expect("expected a frame, got an error")
    }

    #[test]
    fn commands_and_bodies_arrive_as_whole_frames() {
        let mut dec = decoder();
        let mut buf = BytesMut::new();

        // The second body contains a CRLF of its own.
        let out = feed(
            &mut dec,
            &mut buf,
            b"use jobs\r\n\
              put 1 5 30 2\r\nok\r\n\
              put 2 0 30 6\r\nab\r\ncd\r\n\
              stats\r\n",
        );

        assert_eq!(out.len(), 6);
        assert_eq!(
            frame(&out[0]),
            &Frame::Command(Command::Use {
                tube: "jobs".into()
            }),
        );
        assert_eq!(
            frame(&out[1]),
            &Frame::Command(Command::Put {
                pri: 1,
                delay: 5,
                ttr: 30,
                n_bytes: 2,
            }),
        );
        assert_eq!(frame(&out[2]), &Frame::Body(Bytes::from_static(b"ok")));
        assert_eq!(
            frame(&out[4]),
            &Frame::Body(Bytes::from_static(b"ab\r\ncd")),
        );
        assert_eq!(frame(&out[5]), &Frame::Command(Command::Stats));
    }

    // Nothing comes out until a full line or body is in; partial input is
    // buffered across reads.
    #[test]
    fn split_input_is_reassembled() {
        let mut dec = decoder();
        let mut buf = BytesMut::new();

        assert!(feed(&mut dec, &mut buf, b"put 0 0 9").is_empty());

        let out = feed(&mut dec, &mut buf, b"0 4\r\nwx");
        assert_eq!(out.len(), 1);
        assert_eq!(
            frame(&out[0]),
            &Frame::Command(Command::Put {
                pri: 0,
                delay: 0,
                ttr: 90,
                n_bytes: 4,
            }),
        );

        assert!(feed(&mut dec, &mut buf, b"yz").is_empty());

        let out = feed(&mut dec, &mut buf, b"\r\n");
        assert_eq!(out.len(), 1);
        assert_eq!(frame(&out[0]), &Frame::Body(Bytes::from_static(b"wxyz")));
    }

    #[test]
    fn empty_bodies_are_valid() {
        let mut dec = decoder();
        let mut buf = BytesMut::new();

        let out = feed(&mut dec, &mut buf, b"put 0 0 1 0\r\n\r\n");
        assert_eq!(out.len(), 2);
        assert_eq!(frame(&out[1]), &Frame::Body(Bytes::new()));
    }

    // A body over the cap is consumed off the wire but never buffered,
    // and decoding picks up cleanly behind it.
    #[test]
    fn oversize_bodies_are_drained_not_buffered() {
        let mut dec = Decoder::new(4);
        let mut buf = BytesMut::new();

        let out = feed(&mut dec, &mut buf, b"put 0 0 1 10\r\n");
        assert_eq!(out.len(), 1);

        // Deliver the body in pieces; nothing accumulates.
        assert!(feed(&mut dec, &mut buf, b"01234").is_empty());
        assert_eq!(buf.len(), 0);

        let out = feed(&mut dec, &mut buf, b"56789\r\nquit\r\n");
        assert_eq!(out.len(), 2);
        assert_eq!(frame(&out[0]), &Frame::OversizeBody);
        assert_eq!(frame(&out[1]), &Frame::Command(Command::Quit));
    }

    #[test]
    fn missing_body_crlf_resyncs_at_the_next_line() {
        let mut dec = decoder();
        let mut buf = BytesMut::new();

        let out =
            feed(&mut dec, &mut buf, b"put 0 0 1 2\r\nhi!!\r\nstats\r\n");

        assert_eq!(out.len(), 4);
        assert!(matches!(
            &out[1],
            Err(Error::Client(Response::ExpectedCrlf)),
        ));
        assert_eq!(frame(&out[2]), &Frame::Skipped);
        assert_eq!(frame(&out[3]), &Frame::Command(Command::Stats));
    }

    #[test]
    fn overlong_lines_are_rejected() {
        // Terminator in sight: the line is dropped in one go and command
        // framing holds.
        let mut dec = decoder();
        let mut buf = BytesMut::new();
        let mut input = vec![b'x'; 300];
        input.extend_from_slice(b"\r\nquit\r\n");

        let out = feed(&mut dec, &mut buf, &input);
        assert_eq!(out.len(), 2);
        assert!(matches!(&out[0], Err(Error::Client(Response::BadFormat))));
        assert_eq!(frame(&out[1]), &Frame::Command(Command::Quit));

        // No terminator at all: give up at the cap and resync.
        let mut dec = decoder();
        let mut buf = BytesMut::new();

        let out = feed(&mut dec, &mut buf, &[b'y'; 400]);
        assert!(matches!(&out[0], Err(Error::Client(Response::BadFormat))));

        let out = feed(&mut dec, &mut buf, b"yy\r\nstats\r\n");
        assert_eq!(frame(out.last().unwrap()), &Frame::Command(Command::Stats));
    }

    // A '\n' without its '\r' is rejected, not spliced into a line.
    #[test]
    fn bare_newlines_are_rejected() {
        let mut dec = decoder();
        let mut buf = BytesMut::new();

        let out = feed(&mut dec, &mut buf, b"stats\nstats\r\n");
        assert_eq!(out.len(), 2);
        assert!(matches!(&out[0], Err(Error::Client(Response::BadFormat))));
        assert_eq!(frame(&out[1]), &Frame::Command(Command::Stats));
    }

    // Parse failures consume their line, so the stream stays framed.
    #[test]
    fn bad_commands_do_not_derail_the_stream() {
        let mut dec = decoder();
        let mut buf = BytesMut::new();

        let out = feed(&mut dec, &mut buf, b"frob 1\r\nuse ok\r\n");
        assert_eq!(out.len(), 2);
        assert!(matches!(
            &out[0],
            Err(Error::Client(Response::UnknownCommand)),
        ));
        assert_eq!(
            frame(&out[1]),
            &Frame::Command(Command::Use { tube: "ok".into() }),
        );
    }
}
