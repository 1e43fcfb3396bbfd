//! Per-connection I/O state machine.
//!
//! A connection advertises its intent to the event loop through the
//! `want_read`/`want_write`/`want_close` flags. Reads append into
//! `incoming`, complete frames are peeled off one at a time (pipelining),
//! and responses accumulate in `outgoing` until written.

use std::io::{self, Read, Write};
use std::os::unix::io::RawFd;
use std::sync::Arc;

use intrusive_collections::{intrusive_adapter, LinkedListLink};
use nix::poll::PollFlags;
use socket2::Socket;
use tracing::{debug, warn};

use crate::buffer::Buffer;
use crate::commands;
use crate::protocol::{self, K_MAX_MSG};
use crate::server::Shared;

/// Intrusive node placing a connection in the idle (LRU) list.
pub struct IdleNode {
    pub link: LinkedListLink,
    pub fd: RawFd,
}

intrusive_adapter!(pub IdleAdapter = Arc<IdleNode>: IdleNode { link: LinkedListLink });

pub struct Conn {
    socket: Socket,
    // application intent, for the event loop
    pub want_read: bool,
    pub want_write: bool,
    pub want_close: bool,
    // buffered input and output
    pub incoming: Buffer,
    pub outgoing: Buffer,
    // idle timer
    pub last_active_ms: u64,
    pub idle_node: Arc<IdleNode>,
}

impl Conn {
    pub fn new(socket: Socket, fd: RawFd, now_ms: u64) -> Self {
        Self {
            socket,
            want_read: true,
            want_write: false,
            want_close: false,
            incoming: Buffer::new(),
            outgoing: Buffer::new(),
            last_active_ms: now_ms,
            idle_node: Arc::new(IdleNode {
                link: LinkedListLink::new(),
                fd,
            }),
        }
    }

    pub fn socket(&self) -> &Socket {
        &self.socket
    }

    /// Poll interest derived from the intent flags; errors are always of
    /// interest.
    pub fn interest(&self) -> PollFlags {
        let mut events = PollFlags::POLLERR;
        if self.want_read {
            events |= PollFlags::POLLIN;
        }
        if self.want_write {
            events |= PollFlags::POLLOUT;
        }
        events
    }
}

/// Peel one complete request off `incoming`, dispatch it, and frame the
/// response. Returns false when more bytes are needed or the connection is
/// marked for close.
fn try_one_request(conn: &mut Conn, shared: &mut Shared) -> bool {
    if conn.incoming.len() < 4 {
        return false; // want read
    }
    let len = conn.incoming.peek_u32(0) as usize;
    if len > K_MAX_MSG {
        warn!("request frame too long: {len}");
        conn.want_close = true;
        return false;
    }
    if 4 + len > conn.incoming.len() {
        return false; // want read
    }
    let mut frame = vec![0u8; 4 + len];
    conn.incoming.peek_into(0, &mut frame);

    match protocol::parse_request(&frame[4..]) {
        Ok(cmd) => {
            let header = protocol::response_begin(&mut conn.outgoing);
            commands::do_request(shared, &cmd, &frame, &mut conn.outgoing);
            protocol::response_end(&mut conn.outgoing, header);
        }
        Err(e) => {
            warn!("bad request: {e}");
            conn.want_close = true;
            return false;
        }
    }

    // keep the rest of the buffer: later frames of a pipelined batch
    conn.incoming.consume(4 + len);
    true
}

pub fn handle_read(conn: &mut Conn, shared: &mut Shared) {
    let mut buf = [0u8; 64 * 1024];
    match conn.socket.read(&mut buf) {
        Ok(0) => {
            if conn.incoming.is_empty() {
                debug!("client closed");
            } else {
                warn!("unexpected EOF mid-frame");
            }
            conn.want_close = true;
            return;
        }
        Ok(n) => conn.incoming.append(&buf[..n]),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
        Err(e) => {
            warn!("read error: {e}");
            conn.want_close = true;
            return;
        }
    }

    while try_one_request(conn, shared) {}

    if !conn.outgoing.is_empty() {
        conn.want_read = false;
        conn.want_write = true;
        // the peer just spoke, so its socket is usually writable:
        // try without waiting for the next loop iteration
        handle_write(conn);
    } // else: keep reading
}

pub fn handle_write(conn: &mut Conn) {
    debug_assert!(!conn.outgoing.is_empty());
    let written = {
        let chunk = conn.outgoing.continuous(0);
        conn.socket.write(chunk)
    };
    match written {
        Ok(0) => {
            conn.want_close = true;
        }
        Ok(n) => {
            conn.outgoing.consume(n);
            if conn.outgoing.is_empty() {
                conn.want_read = true;
                conn.want_write = false;
            } // else: want write
        }
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
        Err(e) => {
            warn!("write error: {e}");
            conn.want_close = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aof::Aof;
    use crate::protocol::testutil::{decode_frames, Resp};
    use crate::protocol::encode_request;
    use socket2::{Domain, Type};
    use std::os::unix::io::AsRawFd;

    /// A connection wired to an in-process peer socket.
    fn conn_pair() -> (Conn, Socket) {
        let (server_side, client_side) = Socket::pair(Domain::UNIX, Type::STREAM, None).unwrap();
        server_side.set_nonblocking(true).unwrap();
        client_side.set_nonblocking(true).unwrap();
        let fd = server_side.as_raw_fd();
        (Conn::new(server_side, fd, 0), client_side)
    }

    fn send(client: &Socket, argv_list: &[&[&[u8]]]) -> Vec<u8> {
        let mut bytes = Vec::new();
        for argv in argv_list {
            encode_request(argv, &mut bytes);
        }
        (&*client).write_all(&bytes).unwrap();
        bytes
    }

    fn recv_all(client: &Socket) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            match (&*client).read(&mut buf) {
                Ok(0) => break,
                Ok(n) => out.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => panic!("peer read: {e}"),
            }
        }
        out
    }

    #[test]
    fn one_request_one_response() {
        let mut shared = Shared::new(Aof::disabled());
        let (mut conn, client) = conn_pair();
        send(&client, &[&[b"set", b"k", b"v"]]);

        handle_read(&mut conn, &mut shared);
        assert_eq!(decode_frames(&recv_all(&client)), vec![Resp::Nil]);
        // the optimistic write drained everything, so reading resumes
        assert!(conn.want_read);
        assert!(!conn.want_write);
        assert!(!conn.want_close);
    }

    #[test]
    fn pipelined_frames_answered_in_order() {
        let mut shared = Shared::new(Aof::disabled());
        let (mut conn, client) = conn_pair();
        send(
            &client,
            &[
                &[b"set", b"a", b"1"],
                &[b"set", b"b", b"2"],
                &[b"set", b"c", b"3"],
                &[b"get", b"b"],
            ],
        );

        handle_read(&mut conn, &mut shared);
        assert_eq!(
            decode_frames(&recv_all(&client)),
            vec![Resp::Nil, Resp::Nil, Resp::Nil, Resp::Str(b"2".to_vec())]
        );
    }

    #[test]
    fn partial_frame_waits_for_more_bytes() {
        let mut shared = Shared::new(Aof::disabled());
        let (mut conn, client) = conn_pair();

        let mut frame = Vec::new();
        encode_request(&[b"get", b"key"], &mut frame);
        let (first, rest) = frame.split_at(6);

        (&client).write_all(first).unwrap();
        handle_read(&mut conn, &mut shared);
        assert!(recv_all(&client).is_empty());
        assert!(conn.want_read);

        (&client).write_all(rest).unwrap();
        handle_read(&mut conn, &mut shared);
        assert_eq!(decode_frames(&recv_all(&client)), vec![Resp::Nil]);
    }

    #[test]
    fn oversize_header_marks_close() {
        let mut shared = Shared::new(Aof::disabled());
        let (mut conn, client) = conn_pair();
        (&client)
            .write_all(&((K_MAX_MSG as u32) + 1).to_le_bytes())
            .unwrap();
        handle_read(&mut conn, &mut shared);
        assert!(conn.want_close);
    }

    #[test]
    fn malformed_body_marks_close() {
        let mut shared = Shared::new(Aof::disabled());
        let (mut conn, client) = conn_pair();
        // header says 4 bytes, body claims two args but has none
        (&client).write_all(&4u32.to_le_bytes()).unwrap();
        (&client).write_all(&2u32.to_le_bytes()).unwrap();
        handle_read(&mut conn, &mut shared);
        assert!(conn.want_close);
    }

    #[test]
    fn eof_marks_close() {
        let mut shared = Shared::new(Aof::disabled());
        let (mut conn, client) = conn_pair();
        drop(client);
        handle_read(&mut conn, &mut shared);
        assert!(conn.want_close);
    }
}
