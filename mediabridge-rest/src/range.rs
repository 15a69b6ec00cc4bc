//! `Range` header parsing.
//!
//! Only the single-range `bytes=` forms are served: `a-b`, `a-` and
//! `-b`. Multi-range requests and other units are rejected outright.

/// An inclusive, validated byte interval within an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestedRange {
    pub start: u64,
    pub end: u64,
}

#[derive(Debug, PartialEq, Eq)]
pub enum RangeError {
    /// Not a range this server understands; answered with 400.
    Malformed,
    /// Understood, but no byte of it exists; answered with 416.
    Unsatisfiable,
}

#[derive(Debug, Clone, Copy)]
enum State {
    /// Nothing consumed yet.
    Start,
    /// Reading the first position.
    First,
    /// Consumed the dash.
    Dash,
    /// Reading the last position.
    Last,
}

/// Parse and validate a `Range` header value against an object of
/// `size` bytes.
///
/// A spec with a last byte beyond the end is clamped; a spec starting
/// past the end, a zero-length suffix or an empty object is
/// unsatisfiable.
///
/// # Errors
///
/// [`RangeError::Malformed`] for anything that isn't exactly one
/// `bytes=` range (including backwards ranges), [`RangeError::Unsatisfiable`]
/// when the requested interval shares no bytes with the object.
pub fn parse_range(header: &str, size: u64) -> Result<RequestedRange, RangeError> {
    let spec = header.strip_prefix("bytes=").ok_or(RangeError::Malformed)?;

    let mut state = State::Start;
    let mut first: u64 = 0;
    let mut last: u64 = 0;
    let mut has_first = false;
    let mut has_last = false;

    for byte in spec.bytes() {
        match (state, byte) {
            (State::Start | State::First, b'0'..=b'9') => {
                first = shift(first, byte)?;
                has_first = true;
                state = State::First;
            }
            (State::Start | State::First, b'-') => state = State::Dash,
            (State::Dash | State::Last, b'0'..=b'9') => {
                last = shift(last, byte)?;
                has_last = true;
                state = State::Last;
            }
            _ => return Err(RangeError::Malformed),
        }
    }

    if !matches!(state, State::Dash | State::Last) {
        // No dash was ever consumed.
        return Err(RangeError::Malformed);
    }

    match (has_first, has_last) {
        // bytes=a-b
        (true, true) => {
            if first > last {
                return Err(RangeError::Malformed);
            }
            if first >= size {
                return Err(RangeError::Unsatisfiable);
            }
            Ok(RequestedRange {
                start: first,
                end: last.min(size - 1),
            })
        }
        // bytes=a-
        (true, false) => {
            if first >= size {
                return Err(RangeError::Unsatisfiable);
            }
            Ok(RequestedRange {
                start: first,
                end: size - 1,
            })
        }
        // bytes=-b
        (false, true) => {
            if last == 0 || size == 0 {
                return Err(RangeError::Unsatisfiable);
            }
            Ok(RequestedRange {
                start: size.saturating_sub(last),
                end: size - 1,
            })
        }
        // bytes=-
        (false, false) => Err(RangeError::Malformed),
    }
}

fn shift(acc: u64, digit: u8) -> Result<u64, RangeError> {
    acc.checked_mul(10)
        .and_then(|acc| acc.checked_add(u64::from(digit - b'0')))
        .ok_or(RangeError::Malformed)
}
