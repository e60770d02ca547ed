use std::{error, fmt, io};

use bytes::{BufMut, BytesMut};
use serde::Serialize;

use super::protocol::Response;

// A reply is a pure function of the Response value, so there is no encoder
// state to carry: the codec calls straight into encode().

/// Writes one reply into `dst`, including the YAML body for the stats and
/// list families.
pub fn encode(item: Response, dst: &mut BytesMut) -> Result<(), Error> {
    use Response::*;

    match item {
        BadFormat => put_line(dst, format_args!("BAD_FORMAT")),
        Buried => put_line(dst, format_args!("BURIED")),
        Deleted => put_line(dst, format_args!("DELETED")),
        Draining => put_line(dst, format_args!("DRAINING")),
        ExpectedCrlf => put_line(dst, format_args!("EXPECTED_CRLF")),
        InternalError => put_line(dst, format_args!("INTERNAL_ERROR")),
        JobTooBig => put_line(dst, format_args!("JOB_TOO_BIG")),
        Kicked => put_line(dst, format_args!("KICKED")),
        NotFound => put_line(dst, format_args!("NOT_FOUND")),
        NotIgnored => put_line(dst, format_args!("NOT_IGNORED")),
        Paused => put_line(dst, format_args!("PAUSED")),
        Released => put_line(dst, format_args!("RELEASED")),
        TimedOut => put_line(dst, format_args!("TIMED_OUT")),
        Touched => put_line(dst, format_args!("TOUCHED")),
        UnknownCommand => put_line(dst, format_args!("UNKNOWN_COMMAND")),

        Inserted { id } => put_line(dst, format_args!("INSERTED {id}")),
        KickedCount { count } => {
            put_line(dst, format_args!("KICKED {count}"))
        },
        Watching { count } => put_line(dst, format_args!("WATCHING {count}")),
        Using { tube } => put_line(dst, format_args!("USING {tube}")),

        Reserved { id, data } => put_payload(dst, "RESERVED", id, &data),
        Found { id, data } => put_payload(dst, "FOUND", id, &data),

        OkStatsJob { data } => return put_yaml(dst, data),
        OkStatsTube { data } => return put_yaml(dst, data),
        OkStats { data } => return put_yaml(dst, data),
        OkTubeList { tubes } => return put_yaml(dst, tubes),
    }

    Ok(())
}

fn put_line(dst: &mut BytesMut, line: fmt::Arguments<'_>) {
    use fmt::Write;

    // Writing into a BytesMut cannot fail.
    let _ = dst.write_fmt(line);
    dst.put_slice(b"\r\n");
}

/// `"{verb} {id} {len}\r\n"` followed by the raw job bytes and a CRLF.
fn put_payload(dst: &mut BytesMut, verb: &str, id: u64, data: &[u8]) {
    put_line(dst, format_args!("{verb} {id} {}", data.len()));
    dst.put_slice(data);
    dst.put_slice(b"\r\n");
}

/// `"OK {len}\r\n{yaml}\r\n"`. The advertised length covers the YAML,
/// its own trailing newline included, but not the closing CRLF. A body
/// that fails to serialise turns into INTERNAL_ERROR on the wire and an
/// error for the caller.
fn put_yaml(dst: &mut BytesMut, body: impl Serialize) -> Result<(), Error> {
    let yaml = match serde_yaml::to_string(&body) {
        Ok(yaml) => yaml,
        Err(err) => {
            put_line(dst, format_args!("INTERNAL_ERROR"));
            return Err(err.into());
        },
    };

    put_line(dst, format_args!("OK {}", yaml.len()));
    dst.put_slice(yaml.as_bytes());
    dst.put_slice(b"\r\n");

    Ok(())
}

#[derive(Debug)]
pub enum Error {
    Io(io::Error),
    Serde(serde_yaml::Error),
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            Error::Serde(err) => Some(err),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(err) => write!(f, "io error: {err}"),
            Error::Serde(err) => {
                write!(f, "yaml serialisation failed: {err}")
            },
        }
    }
}

impl From<io::Error> for Error {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(value: serde_yaml::Error) -> Self {
        Self::Serde(value)
    }
}
