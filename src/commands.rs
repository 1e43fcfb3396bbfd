//! Command table and dispatch.
//!
//! Commands are matched on `(name, argc)` exactly; anything else is an
//! unknown command. Mutating commands are staged to the AOF before they
//! execute and the staging buffer is flushed after (see `aof`).

use tracing::warn;

use crate::buffer::Buffer;
use crate::clock;
use crate::protocol::{
    out_arr, out_begin_arr, out_dbl, out_end_arr, out_err, out_int, out_nil, out_str, ErrCode,
};
use crate::server::Shared;
use crate::store::{Ttl, Value};
use crate::zset::ZSet;

/// Whether this exact command form mutates the database and therefore
/// belongs in the AOF. `bgrewriteaof` is excluded: its effect is the
/// rewrite itself, not a replayable mutation.
pub fn is_mutation(cmd: &[Vec<u8>]) -> bool {
    match cmd.first().map(|c| c.as_slice()) {
        Some(b"set") => cmd.len() == 3,
        Some(b"del") => cmd.len() == 2,
        Some(b"pexpire") => cmd.len() == 3,
        Some(b"zadd") => cmd.len() == 4,
        Some(b"zrem") => cmd.len() == 3,
        _ => false,
    }
}

/// Execute one parsed request, appending a single tagged value to `out`.
///
/// `raw_frame` is the request exactly as it arrived on the wire (length
/// prefix included); mutations stage it to the AOF before executing.
pub fn do_request(shared: &mut Shared, cmd: &[Vec<u8>], raw_frame: &[u8], out: &mut Buffer) {
    let mutation = is_mutation(cmd);
    if mutation && shared.aof.is_enabled() {
        shared.aof.stage_frame(raw_frame);
    }
    dispatch(shared, cmd, out);
    if mutation && shared.aof.is_enabled() {
        shared.aof.flush_and_sync(clock::monotonic_ms());
    }
}

fn dispatch(shared: &mut Shared, cmd: &[Vec<u8>], out: &mut Buffer) {
    let name = cmd.first().map(|c| c.as_slice()).unwrap_or(b"");
    match (name, cmd.len()) {
        (b"get", 2) => do_get(shared, cmd, out),
        (b"set", 3) => do_set(shared, cmd, out),
        (b"del", 2) => do_del(shared, cmd, out),
        (b"pexpire", 3) => do_expire(shared, cmd, out),
        (b"pttl", 2) => do_ttl(shared, cmd, out),
        (b"keys", 1) => do_keys(shared, out),
        (b"zadd", 4) => do_zadd(shared, cmd, out),
        (b"zrem", 3) => do_zrem(shared, cmd, out),
        (b"zscore", 3) => do_zscore(shared, cmd, out),
        (b"zquery", 6) => do_zquery(shared, cmd, out),
        (b"bgrewriteaof", 1) => do_bgrewriteaof(shared, out),
        _ => out_err(out, ErrCode::Unknown, "unknown command."),
    }
}

fn parse_i64(bytes: &[u8]) -> Option<i64> {
    std::str::from_utf8(bytes).ok()?.parse().ok()
}

fn parse_f64(bytes: &[u8]) -> Option<f64> {
    let v: f64 = std::str::from_utf8(bytes).ok()?.parse().ok()?;
    (!v.is_nan()).then_some(v)
}

fn do_get(shared: &mut Shared, cmd: &[Vec<u8>], out: &mut Buffer) {
    match shared.store.get(&cmd[1]) {
        None => out_nil(out),
        Some(entry) => match &entry.value {
            Value::Str(v) => out_str(out, v),
            Value::ZSet(_) => out_err(out, ErrCode::BadType, "not a string value"),
        },
    }
}

fn do_set(shared: &mut Shared, cmd: &[Vec<u8>], out: &mut Buffer) {
    let entry = shared
        .store
        .get_or_insert_with(&cmd[1], || Value::Str(Vec::new()));
    match &mut entry.value {
        Value::Str(v) => {
            *v = cmd[2].clone();
            out_nil(out)
        }
        Value::ZSet(_) => out_err(out, ErrCode::BadType, "a non-string value exists"),
    }
}

fn do_del(shared: &mut Shared, cmd: &[Vec<u8>], out: &mut Buffer) {
    match shared.store.remove(&cmd[1]) {
        Some(entry) => {
            shared.dispose(entry);
            out_int(out, 1)
        }
        None => out_int(out, 0),
    }
}

fn do_expire(shared: &mut Shared, cmd: &[Vec<u8>], out: &mut Buffer) {
    let Some(ttl_ms) = parse_i64(&cmd[2]) else {
        return out_err(out, ErrCode::BadArg, "expect int64");
    };
    let found = shared
        .store
        .set_ttl(&cmd[1], ttl_ms, clock::monotonic_ms());
    out_int(out, found as i64)
}

fn do_ttl(shared: &mut Shared, cmd: &[Vec<u8>], out: &mut Buffer) {
    match shared.store.ttl(&cmd[1], clock::monotonic_ms()) {
        None => out_int(out, -2),
        Some(Ttl::None) => out_int(out, -1),
        Some(Ttl::ExpiresIn(ms)) => out_int(out, ms as i64),
    }
}

fn do_keys(shared: &mut Shared, out: &mut Buffer) {
    out_arr(out, shared.store.len() as u32);
    for entry in shared.store.iter() {
        out_str(out, &entry.key);
    }
}

fn do_zadd(shared: &mut Shared, cmd: &[Vec<u8>], out: &mut Buffer) {
    let score = match parse_f64(&cmd[2]) {
        Some(s) if s.is_finite() => s,
        _ => return out_err(out, ErrCode::BadArg, "expect float"),
    };
    let entry = shared
        .store
        .get_or_insert_with(&cmd[1], || Value::ZSet(ZSet::new()));
    match &mut entry.value {
        Value::ZSet(zset) => {
            let added = zset.insert(&cmd[3], score);
            out_int(out, added as i64)
        }
        Value::Str(_) => out_err(out, ErrCode::BadType, "expect zset"),
    }
}

fn do_zrem(shared: &mut Shared, cmd: &[Vec<u8>], out: &mut Buffer) {
    match shared.store.get_mut(&cmd[1]) {
        None => out_int(out, 0), // missing key acts as an empty zset
        Some(entry) => match &mut entry.value {
            Value::ZSet(zset) => {
                let removed = zset.remove(&cmd[2]);
                out_int(out, removed as i64)
            }
            Value::Str(_) => out_err(out, ErrCode::BadType, "expect zset"),
        },
    }
}

fn do_zscore(shared: &mut Shared, cmd: &[Vec<u8>], out: &mut Buffer) {
    match shared.store.get(&cmd[1]) {
        None => out_nil(out),
        Some(entry) => match &entry.value {
            Value::ZSet(zset) => match zset.score(&cmd[2]) {
                Some(score) => out_dbl(out, score),
                None => out_nil(out),
            },
            Value::Str(_) => out_err(out, ErrCode::BadType, "expect zset"),
        },
    }
}

fn do_zquery(shared: &mut Shared, cmd: &[Vec<u8>], out: &mut Buffer) {
    let Some(score) = parse_f64(&cmd[2]) else {
        return out_err(out, ErrCode::BadArg, "expect fp number");
    };
    let name = &cmd[3];
    let (Some(offset), Some(limit)) = (parse_i64(&cmd[4]), parse_i64(&cmd[5])) else {
        return out_err(out, ErrCode::BadArg, "expect int");
    };
    let zset = match shared.store.get(&cmd[1]) {
        None => None, // a missing key is an empty zset
        Some(entry) => match &entry.value {
            Value::ZSet(zset) => Some(zset),
            Value::Str(_) => return out_err(out, ErrCode::BadType, "expect zset"),
        },
    };
    if limit <= 0 {
        return out_arr(out, 0);
    }
    let pairs = match zset {
        Some(zset) => zset.range_query(score, name, offset, limit),
        None => Vec::new(),
    };
    let ctx = out_begin_arr(out);
    for (member, member_score) in &pairs {
        out_str(out, member);
        out_dbl(out, *member_score);
    }
    out_end_arr(out, ctx, (pairs.len() * 2) as u32);
}

fn do_bgrewriteaof(shared: &mut Shared, out: &mut Buffer) {
    if !shared.aof.is_enabled() {
        return out_err(out, ErrCode::BadArg, "AOF is not enabled");
    }
    if shared.aof.is_rewriting() {
        return out_err(out, ErrCode::BadArg, "AOF rewrite already in progress");
    }
    let Shared { store, aof, .. } = shared;
    match aof.rewrite(store, clock::monotonic_ms()) {
        Ok(()) => out_int(out, 1),
        Err(e) => {
            warn!("AOF rewrite failed: {e}");
            out_err(out, ErrCode::Unknown, "AOF rewrite failed")
        }
    }
}
