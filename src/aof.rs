//! Append-only file: persistence log, startup replay, compacting rewrite.
//!
//! The file is a concatenation of request frames in the wire format,
//! length prefix included, so replay and the rewrite output both go
//! through the regular request codec. Mutations are staged into a ring
//! buffer before they execute and the buffer is drained to disk after,
//! with an fsync at most once per second.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use tracing::{error, info, warn};

use crate::buffer::Buffer;
use crate::commands;
use crate::protocol;
use crate::server::Shared;
use crate::store::{Store, Ttl, Value};

/// How long written-but-unsynced data may sit before an fsync.
const K_FSYNC_INTERVAL_MS: u64 = 1000;

pub struct Aof {
    enabled: bool,
    file: Option<File>,
    staging: Buffer,
    last_fsync_ms: u64,
    path: PathBuf,
    rewriting: bool,
}

impl Aof {
    /// Open (or create) the log in append mode. An open failure disables
    /// persistence for the run; the server still serves from memory.
    pub fn open(path: PathBuf) -> Self {
        let file = match OpenOptions::new().create(true).append(true).open(&path) {
            Ok(f) => {
                info!("AOF enabled at {}", path.display());
                Some(f)
            }
            Err(e) => {
                error!("cannot open AOF {}: {e}; AOF disabled", path.display());
                None
            }
        };
        Self {
            enabled: file.is_some(),
            file,
            staging: Buffer::new(),
            last_fsync_ms: 0,
            path,
            rewriting: false,
        }
    }

    /// A no-op log, for running without persistence.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            file: None,
            staging: Buffer::new(),
            last_fsync_ms: 0,
            path: PathBuf::new(),
            rewriting: false,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn is_rewriting(&self) -> bool {
        self.rewriting
    }

    /// Stage a raw wire frame. Called before the mutation executes.
    pub fn stage_frame(&mut self, frame: &[u8]) {
        self.staging.append(frame);
    }

    /// One write of the largest contiguous staged slice, then an fsync if
    /// one is due. Called after each mutation executes.
    pub fn flush_and_sync(&mut self, now_ms: u64) {
        if !self.enabled || self.staging.is_empty() {
            return;
        }
        let Some(file) = self.file.as_mut() else {
            return;
        };
        let written = {
            let chunk = self.staging.continuous(0);
            match file.write(chunk) {
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    error!("AOF write error: {e}");
                    return;
                }
            }
        };
        self.staging.consume(written);

        if now_ms.saturating_sub(self.last_fsync_ms) > K_FSYNC_INTERVAL_MS {
            if let Err(e) = file.sync_all() {
                error!("AOF fsync error: {e}");
            }
            self.last_fsync_ms = now_ms;
        }
    }

    /// Write out everything still staged, wrapped halves included.
    fn drain_staging(&mut self) {
        let Some(file) = self.file.as_mut() else {
            return;
        };
        while !self.staging.is_empty() {
            let written = {
                let chunk = self.staging.continuous(0);
                match file.write(chunk) {
                    Ok(n) => n,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                    Err(e) => {
                        error!("AOF write error: {e}");
                        return;
                    }
                }
            };
            self.staging.consume(written);
        }
    }

    /// Compact the log into the minimal equivalent command stream.
    ///
    /// The live dataset is snapshotted to `<path>.temp` (one `set` per
    /// string, one `zadd` per member with the members of a set contiguous,
    /// plus `pexpire` for a pending TTL), fsynced, and atomically renamed
    /// over the old file. The iteration runs on the loop thread and only
    /// reads entries.
    pub fn rewrite(&mut self, store: &Store, now_ms: u64) -> io::Result<()> {
        debug_assert!(self.enabled && !self.rewriting);
        self.rewriting = true;
        info!("AOF rewrite started");
        let result = self.rewrite_inner(store, now_ms);
        self.rewriting = false;
        if result.is_ok() {
            info!("AOF rewrite complete");
        }
        result
    }

    fn rewrite_inner(&mut self, store: &Store, now_ms: u64) -> io::Result<()> {
        let temp = temp_path(&self.path);
        let temp_file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&temp)?;
        let mut writer = BufWriter::new(temp_file);

        let mut frame = Vec::new();
        for entry in store.iter() {
            frame.clear();
            match &entry.value {
                Value::Str(v) => {
                    protocol::encode_request(&[b"set", &entry.key, v], &mut frame);
                }
                Value::ZSet(zset) => {
                    for (name, score) in zset.iter() {
                        let score = format!("{score}");
                        protocol::encode_request(
                            &[b"zadd", &entry.key, score.as_bytes(), name],
                            &mut frame,
                        );
                    }
                }
            }
            if let Some(Ttl::ExpiresIn(remaining)) = store.ttl(&entry.key, now_ms) {
                if remaining > 0 {
                    let remaining = remaining.to_string();
                    protocol::encode_request(
                        &[b"pexpire", &entry.key, remaining.as_bytes()],
                        &mut frame,
                    );
                }
            }
            writer.write_all(&frame)?;
        }

        let temp_file = writer.into_inner().map_err(|e| e.into_error())?;
        temp_file.sync_all()?;
        drop(temp_file);

        // no staged mutation may be lost across the swap
        self.drain_staging();

        if let Err(e) = fs::rename(&temp, &self.path) {
            warn!("rename failed during AOF rewrite: {e}");
            let _ = fs::remove_file(&temp);
            return Err(e);
        }

        // swap to the new file; the old fd closes here
        self.file = None;
        match OpenOptions::new().create(true).append(true).open(&self.path) {
            Ok(f) => self.file = Some(f),
            Err(e) => {
                error!("cannot reopen AOF after rewrite: {e}; AOF disabled");
                self.enabled = false;
            }
        }
        Ok(())
    }

    /// Best-effort flush on graceful exit; persistence is only guaranteed
    /// up to the last fsync.
    pub fn shutdown(&mut self) {
        if !self.enabled {
            return;
        }
        self.drain_staging();
        if let Some(file) = self.file.take() {
            if let Err(e) = file.sync_all() {
                error!("AOF fsync error on shutdown: {e}");
            }
            info!("AOF file closed");
        }
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(".temp");
    PathBuf::from(os)
}

/// Read one full wire frame (prefix included). `Ok(None)` is a clean end
/// of file; an error is a truncated or corrupt tail.
fn read_frame(r: &mut impl Read) -> io::Result<Option<Vec<u8>>> {
    let mut header = [0u8; 4];
    let mut filled = 0;
    while filled < header.len() {
        let n = r.read(&mut header[filled..])?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        filled += n;
    }
    let len = u32::from_le_bytes(header) as usize;
    if len > protocol::K_MAX_MSG {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "oversize frame"));
    }
    let mut frame = vec![0u8; 4 + len];
    frame[..4].copy_from_slice(&header);
    r.read_exact(&mut frame[4..])?;
    Ok(Some(frame))
}

/// Replay the log into an empty database. Runs with staging disabled so
/// replayed mutations are not re-appended. A truncated or malformed tail
/// stops replay; the server continues with whatever was loaded.
pub fn replay(shared: &mut Shared) {
    if !shared.aof.enabled {
        return;
    }
    let path = shared.aof.path.clone();
    let file = match File::open(&path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return,
        Err(e) => {
            warn!("cannot read AOF {}: {e}", path.display());
            return;
        }
    };
    shared.aof.enabled = false;
    let mut reader = BufReader::new(file);
    let mut scratch = Buffer::new();
    let mut frames = 0u64;
    loop {
        let frame = match read_frame(&mut reader) {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(e) => {
                warn!("AOF tail unreadable after {frames} frames: {e}");
                break;
            }
        };
        match protocol::parse_request(&frame[4..]) {
            Ok(cmd) => commands::do_request(shared, &cmd, &frame, &mut scratch),
            Err(e) => {
                warn!("AOF tail malformed after {frames} frames: {e}");
                break;
            }
        }
        let used = scratch.len();
        scratch.consume(used);
        frames += 1;
    }
    shared.aof.enabled = true;
    info!(frames, keys = shared.store.len(), "AOF replay complete");
}
