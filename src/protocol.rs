//! Wire protocol: request parsing and tagged response serialization.
//!
//! A request frame is a `u32` total length followed by the body:
//!
//! ```text
//! +------+-----+------+-----+------+-----+-----+------+
//! | nstr | len | str1 | len | str2 | ... | len | strn |
//! +------+-----+------+-----+------+-----+-----+------+
//! ```
//!
//! A response frame is a `u32` payload length followed by one tagged value.
//! All integers are little-endian.

use thiserror::Error;

use crate::buffer::Buffer;

/// Maximum frame size, request or response.
pub const K_MAX_MSG: usize = 32 << 20;
/// Maximum number of strings in one request.
pub const K_MAX_ARGS: usize = 200 * 1000;

/// Response value tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Tag {
    Nil = 0,
    Err = 1,
    Str = 2,
    Int = 3,
    Dbl = 4,
    Arr = 5,
}

/// Error codes carried by `Tag::Err` responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ErrCode {
    Unknown = 1,
    TooBig = 2,
    BadType = 3,
    BadArg = 4,
}

/// A malformed request body. Any of these closes the connection.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("request truncated inside the argument list")]
    Truncated,
    #[error("too many arguments: {0}")]
    TooManyArgs(u32),
    #[error("trailing garbage after the last argument")]
    TrailingGarbage,
}

fn read_u32(data: &[u8], pos: &mut usize) -> Option<u32> {
    let bytes = data.get(*pos..*pos + 4)?;
    *pos += 4;
    Some(u32::from_le_bytes(bytes.try_into().unwrap()))
}

/// Parse a request body (the bytes after the length prefix) into argv.
pub fn parse_request(body: &[u8]) -> Result<Vec<Vec<u8>>, ProtocolError> {
    let mut pos = 0;
    let nstr = read_u32(body, &mut pos).ok_or(ProtocolError::Truncated)?;
    if nstr as usize > K_MAX_ARGS {
        return Err(ProtocolError::TooManyArgs(nstr));
    }
    let mut out = Vec::with_capacity(nstr as usize);
    while out.len() < nstr as usize {
        let len = read_u32(body, &mut pos).ok_or(ProtocolError::Truncated)? as usize;
        let arg = body.get(pos..pos + len).ok_or(ProtocolError::Truncated)?;
        pos += len;
        out.push(arg.to_vec());
    }
    if pos != body.len() {
        return Err(ProtocolError::TrailingGarbage);
    }
    Ok(out)
}

/// Encode argv as a complete wire frame, length prefix included. The AOF
/// rewrite uses this to emit frames that replay through `parse_request`.
pub fn encode_request(argv: &[&[u8]], out: &mut Vec<u8>) {
    let body_len = 4 + argv.iter().map(|a| 4 + a.len()).sum::<usize>();
    out.reserve(4 + body_len);
    out.extend_from_slice(&(body_len as u32).to_le_bytes());
    out.extend_from_slice(&(argv.len() as u32).to_le_bytes());
    for arg in argv {
        out.extend_from_slice(&(arg.len() as u32).to_le_bytes());
        out.extend_from_slice(arg);
    }
}

// Serialization of tagged values into the outgoing buffer.

pub fn out_nil(out: &mut Buffer) {
    out.append_u8(Tag::Nil as u8);
}

pub fn out_str(out: &mut Buffer, s: &[u8]) {
    out.append_u8(Tag::Str as u8);
    out.append_u32(s.len() as u32);
    out.append(s);
}

pub fn out_int(out: &mut Buffer, v: i64) {
    out.append_u8(Tag::Int as u8);
    out.append_i64(v);
}

pub fn out_dbl(out: &mut Buffer, v: f64) {
    out.append_u8(Tag::Dbl as u8);
    out.append_f64(v);
}

pub fn out_err(out: &mut Buffer, code: ErrCode, msg: &str) {
    out.append_u8(Tag::Err as u8);
    out.append_u32(code as u32);
    out.append_u32(msg.len() as u32);
    out.append(msg.as_bytes());
}

/// Emit an array header with a known element count.
pub fn out_arr(out: &mut Buffer, n: u32) {
    out.append_u8(Tag::Arr as u8);
    out.append_u32(n);
}

/// Emit an array header with a placeholder count; returns the position to
/// pass to [`out_end_arr`] once the element count is known.
pub fn out_begin_arr(out: &mut Buffer) -> usize {
    out.append_u8(Tag::Arr as u8);
    let ctx = out.len();
    out.append_u32(0);
    ctx
}

pub fn out_end_arr(out: &mut Buffer, ctx: usize, n: u32) {
    out.insert_at(ctx, &n.to_le_bytes());
}

// Response framing: the header is reserved up front and patched when the
// payload is complete.

pub fn response_begin(out: &mut Buffer) -> usize {
    let header = out.len();
    out.append_u32(0);
    header
}

pub fn response_end(out: &mut Buffer, header: usize) {
    let mut payload = out.len() - header - 4;
    if payload > K_MAX_MSG {
        out.truncate(header + 4);
        out_err(out, ErrCode::TooBig, "response is too big.");
        payload = out.len() - header - 4;
    }
    out.insert_at(header, &(payload as u32).to_le_bytes());
}
