use super::protocol::{Command, Response};

// Tube names: one character from the start class, then up to 200 more that
// may also include '-'.
const MAX_NAME_LEN: usize = 201;

fn is_name_start(b: u8) -> bool {
    b.is_ascii_alphanumeric()
        || matches!(b, b'(' | b')' | b'_' | b'$' | b'.' | b';' | b'/' | b'+')
}

fn is_name_char(b: u8) -> bool {
    is_name_start(b) || b == b'-'
}

pub fn valid_name(name: &str) -> bool {
    let bytes = name.as_bytes();

    match bytes.split_first() {
        Some((first, rest)) => {
            bytes.len() <= MAX_NAME_LEN
                && is_name_start(*first)
                && rest.iter().all(|&b| is_name_char(b))
        },
        None => false,
    }
}

fn next_field<'a>(
    fields: &mut impl Iterator<Item = &'a str>,
) -> Result<&'a str, Response> {
    fields.next().ok_or(Response::BadFormat)
}

fn name<'a>(
    fields: &mut impl Iterator<Item = &'a str>,
) -> Result<String, Response> {
    let field = next_field(fields)?;
    if valid_name(field) {
        Ok(field.to_owned())
    } else {
        Err(Response::BadFormat)
    }
}

fn u32_field<'a>(
    fields: &mut impl Iterator<Item = &'a str>,
) -> Result<u32, Response> {
    next_field(fields)?.parse().map_err(|_| Response::BadFormat)
}

fn u64_field<'a>(
    fields: &mut impl Iterator<Item = &'a str>,
) -> Result<u64, Response> {
    next_field(fields)?.parse().map_err(|_| Response::BadFormat)
}

/// Priorities accept the whole u32 range, and numeric values outside it
/// clamp to the nearest endpoint rather than erroring.
fn pri_field<'a>(
    fields: &mut impl Iterator<Item = &'a str>,
) -> Result<u32, Response> {
    let field = next_field(fields)?;

    let (negative, digits) = match field.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, field),
    };

    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(Response::BadFormat);
    }

    if negative {
        return Ok(0);
    }

    match digits.parse::<u64>() {
        Ok(n) => Ok(n.min(u32::MAX as u64) as u32),
        // All digits but too large even for u64.
        Err(_) => Ok(u32::MAX),
    }
}

impl TryFrom<&[u8]> for Command {
    type Error = Response;

    fn try_from(line: &[u8]) -> Result<Self, Self::Error> {
        let line =
            std::str::from_utf8(line).map_err(|_| Response::BadFormat)?;

        let mut fields = line.split_ascii_whitespace();
        let verb = fields.next().ok_or(Response::UnknownCommand)?;

        let cmd = match verb {
            "put" => Command::Put {
                pri: pri_field(&mut fields)?,
                delay: u32_field(&mut fields)?,
                ttr: u32_field(&mut fields)?,
                n_bytes: u32_field(&mut fields)?,
            },
            "use" => Command::Use {
                tube: name(&mut fields)?,
            },
            "reserve" => Command::Reserve,
            "reserve-with-timeout" => Command::ReserveWithTimeout {
                timeout: u32_field(&mut fields)?,
            },
            "reserve-job" => Command::ReserveJob {
                id: u64_field(&mut fields)?,
            },
            "delete" => Command::Delete {
                id: u64_field(&mut fields)?,
            },
            "release" => Command::Release {
                id: u64_field(&mut fields)?,
                pri: pri_field(&mut fields)?,
                delay: u32_field(&mut fields)?,
            },
            "bury" => Command::Bury {
                id: u64_field(&mut fields)?,
                pri: pri_field(&mut fields)?,
            },
            "touch" => Command::Touch {
                id: u64_field(&mut fields)?,
            },
            "watch" => Command::Watch {
                tube: name(&mut fields)?,
            },
            "ignore" => Command::Ignore {
                tube: name(&mut fields)?,
            },
            "peek" => Command::Peek {
                id: u64_field(&mut fields)?,
            },
            "peek-ready" => Command::PeekReady,
            "peek-delayed" => Command::PeekDelayed,
            "peek-buried" => Command::PeekBuried,
            "kick" => Command::Kick {
                bound: u64_field(&mut fields)?,
            },
            "kick-job" => Command::KickJob {
                id: u64_field(&mut fields)?,
            },
            "stats-job" => Command::StatsJob {
                id: u64_field(&mut fields)?,
            },
            "stats-tube" => Command::StatsTube {
                tube: name(&mut fields)?,
            },
            "stats" => Command::Stats,
            "list-tubes" => Command::ListTubes,
            "list-tube-used" => Command::ListTubeUsed,
            "list-tubes-watched" => Command::ListTubesWatched,
            "pause-tube" => Command::PauseTube {
                tube: name(&mut fields)?,
                delay: u32_field(&mut fields)?,
            },
            "quit" => Command::Quit,
            _ => return Err(Response::UnknownCommand),
        };

        // Anything left over after the expected arguments is an error, not
        // something to silently drop.
        if fields.next().is_some() {
            return Err(Response::BadFormat);
        }

        Ok(cmd)
    }
}
