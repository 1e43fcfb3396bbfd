//! Event loop: readiness polling, accept, connection servicing, timers.
//!
//! A single thread owns every data structure. Each tick polls the listener
//! and every live connection with a timeout derived from the nearest timer
//! deadline, services whatever became ready, then collects expired idle
//! connections and TTLs.

use std::collections::HashMap;
use std::io;
use std::os::unix::io::{AsFd, AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};

use intrusive_collections::LinkedList;
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags};
use socket2::Socket;
use tracing::{debug, info, warn};

use crate::aof::Aof;
use crate::clock;
use crate::conn::{self, Conn, IdleAdapter, IdleNode};
use crate::pool::ThreadPool;
use crate::store::{Entry, Store};

pub const K_IDLE_TIMEOUT_MS: u64 = 5 * 1000;
/// TTL evictions per tick; the rest rolls over so expiry cannot stall the
/// loop.
pub const K_MAX_TTL_WORKS: usize = 2000;
const K_NUM_WORKERS: usize = 4;

/// State shared between the dispatcher and the loop: the database, the
/// persistence log, and the worker pool. Owned by the loop thread; workers
/// only ever receive fully detached entries.
pub struct Shared {
    pub store: Store,
    pub aof: Aof,
    pub pool: ThreadPool,
}

impl Shared {
    pub fn new(aof: Aof) -> Self {
        Self {
            store: Store::new(),
            aof,
            pool: ThreadPool::new(K_NUM_WORKERS),
        }
    }

    /// Free a detached entry: inline when small, on the pool when large
    /// enough that the destructor would stall the loop.
    pub fn dispose(&self, entry: Entry) {
        if entry.is_large() {
            debug!(
                key = %String::from_utf8_lossy(&entry.key),
                "dropping large entry on the worker pool"
            );
            self.pool.submit(move || drop(entry));
        }
    }
}

pub struct Server {
    listener: Socket,
    shared: Shared,
    fd2conn: HashMap<RawFd, Conn>,
    idle_list: LinkedList<IdleAdapter>,
}

fn idle_detach(idle_list: &mut LinkedList<IdleAdapter>, node: &IdleNode) {
    if node.link.is_linked() {
        // the node is linked into this list and into no other
        let mut cursor = unsafe { idle_list.cursor_mut_from_ptr(node) };
        cursor.remove();
    }
}

fn conn_destroy(
    fd2conn: &mut HashMap<RawFd, Conn>,
    idle_list: &mut LinkedList<IdleAdapter>,
    fd: RawFd,
) {
    if let Some(conn) = fd2conn.remove(&fd) {
        idle_detach(idle_list, &conn.idle_node);
        debug!(fd, "connection closed");
        // the socket closes when conn drops
    }
}

impl Server {
    pub fn new(listener: Socket, shared: Shared) -> Self {
        Self {
            listener,
            shared,
            fd2conn: HashMap::new(),
            idle_list: LinkedList::new(IdleAdapter::new()),
        }
    }

    /// Run ticks until the shutdown flag is raised by a signal handler.
    pub fn run(&mut self, shutdown: &AtomicBool) -> io::Result<()> {
        while !shutdown.load(Ordering::Relaxed) {
            self.tick()?;
        }
        info!("shutting down");
        Ok(())
    }

    /// Flush and close the persistence log and join the workers.
    pub fn shutdown(self) {
        let Server { shared, .. } = self;
        let Shared { mut aof, pool, .. } = shared;
        aof.shutdown();
        pool.shutdown();
    }

    /// One pass of the event loop: poll, accept, service, expire.
    pub fn tick(&mut self) -> io::Result<()> {
        let timeout_ms = self.next_timer_ms(clock::monotonic_ms());

        let ready: Vec<(RawFd, PollFlags)> = {
            let mut poll_fds = Vec::with_capacity(1 + self.fd2conn.len());
            poll_fds.push(PollFd::new(&self.listener, PollFlags::POLLIN));
            for conn in self.fd2conn.values() {
                poll_fds.push(PollFd::new(conn.socket(), conn.interest()));
            }
            match poll(&mut poll_fds, timeout_ms) {
                Ok(_) => {}
                Err(Errno::EINTR) => return Ok(()), // signal; the caller re-checks
                Err(e) => return Err(e.into()),
            }
            poll_fds
                .iter()
                .map(|p| {
                    (
                        p.as_fd().as_raw_fd(),
                        p.revents().unwrap_or(PollFlags::empty()),
                    )
                })
                .collect()
        };

        if !ready[0].1.is_empty() {
            self.handle_accept();
        }

        let now_ms = clock::monotonic_ms();
        let Self {
            shared,
            fd2conn,
            idle_list,
            ..
        } = self;
        for &(fd, revents) in &ready[1..] {
            if revents.is_empty() {
                continue;
            }
            let Some(conn) = fd2conn.get_mut(&fd) else {
                continue;
            };

            // any activity refreshes the idle timer: move to the tail
            conn.last_active_ms = now_ms;
            idle_detach(idle_list, &conn.idle_node);
            idle_list.push_back(conn.idle_node.clone());

            if revents.contains(PollFlags::POLLIN) {
                debug_assert!(conn.want_read);
                conn::handle_read(conn, shared);
            }
            if revents.contains(PollFlags::POLLOUT) && conn.want_write && !conn.outgoing.is_empty()
            {
                conn::handle_write(conn);
            }

            if revents.contains(PollFlags::POLLERR) || conn.want_close {
                conn_destroy(fd2conn, idle_list, fd);
            }
        }

        self.process_timers(clock::monotonic_ms());
        Ok(())
    }

    /// Accept one pending connection, if any.
    fn handle_accept(&mut self) {
        match self.listener.accept() {
            Ok((socket, addr)) => {
                if let Err(e) = socket.set_nonblocking(true) {
                    warn!("cannot set accepted socket non-blocking: {e}");
                    return;
                }
                let fd = socket.as_raw_fd();
                debug!(fd, addr = ?addr.as_socket(), "new client");
                let conn = Conn::new(socket, fd, clock::monotonic_ms());
                self.idle_list.push_back(conn.idle_node.clone());
                self.fd2conn.insert(fd, conn);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => warn!("accept error: {e}"),
        }
    }

    /// Poll timeout until the nearest deadline: idle-list head or TTL heap
    /// root, whichever is sooner. -1 blocks indefinitely.
    fn next_timer_ms(&self, now_ms: u64) -> i32 {
        let mut next: Option<u64> = None;
        if let Some(node) = self.idle_list.front().get() {
            if let Some(conn) = self.fd2conn.get(&node.fd) {
                next = Some(conn.last_active_ms + K_IDLE_TIMEOUT_MS);
            }
        }
        if let Some(deadline) = self.shared.store.next_deadline() {
            next = Some(next.map_or(deadline, |n| n.min(deadline)));
        }
        match next {
            None => -1,
            Some(t) if t <= now_ms => 0,
            Some(t) => (t - now_ms).min(i32::MAX as u64) as i32,
        }
    }

    /// Expire idle connections (the list is ordered, so a head-walk
    /// suffices) and due TTLs.
    fn process_timers(&mut self, now_ms: u64) {
        loop {
            let Some(fd) = self.idle_list.front().get().map(|n| n.fd) else {
                break;
            };
            let Some(conn) = self.fd2conn.get(&fd) else {
                debug_assert!(false, "idle node without a connection");
                break;
            };
            if conn.last_active_ms + K_IDLE_TIMEOUT_MS >= now_ms {
                break; // head not expired: nothing behind it is either
            }
            debug!(fd, "closing idle connection");
            let Self {
                fd2conn, idle_list, ..
            } = self;
            conn_destroy(fd2conn, idle_list, fd);
        }

        let expired = self.shared.store.expire_due(now_ms, K_MAX_TTL_WORKS);
        for entry in expired {
            debug!(key = %String::from_utf8_lossy(&entry.key), "key expired");
            self.shared.dispose(entry);
        }
    }
}
