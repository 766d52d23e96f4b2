//! Networking and client related operations: the per-connection state
//! machine, the two-tier reply buffers and the pre-poll flush of pending
//! writers.

use std::collections::LinkedList;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use libc::{c_void, EAGAIN};

use crate::ae::{EventLoop, FileProc, Mask};
use crate::anet;
use crate::cmd;
use crate::log::{log, LogLevel};
use crate::server::Server;
use crate::util::{error, strerror};

pub const PROTO_BUFFER_BYTES: usize = 16 * 1024;

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

pub struct ClientFlags(u8);

impl ClientFlags {
    /// The client has output queued and sits in the server's pending-write
    /// list, waiting for the pre-poll flush.
    fn pending_write() -> ClientFlags {
        ClientFlags(1)
    }

    pub fn is_pending_write(&self) -> bool {
        (self.0 & Self::pending_write().0) != 0
    }

    fn set_pending_write(&mut self) {
        self.0 |= Self::pending_write().0;
    }

    fn clear_pending_write(&mut self) {
        self.0 &= !Self::pending_write().0;
    }
}

/// With multiplexing we need to take per-client state.
pub struct Client {
    pub id: u64,
    pub fd: i32,
    pub argv: Vec<Vec<u8>>,
    reply: LinkedList<Vec<u8>>,     // overflow queue of reply chunks
    reply_bytes: usize,             // sum of chunk lengths in `reply`
    sentlen: usize,                 // bytes of the current buffer/chunk already sent
    bufpos: usize,
    buf: [u8; PROTO_BUFFER_BYTES],  // inline reply buffer, used before any chunk is queued
    pub ctime: u64,
    pub last_interaction: u64,      // time of the last interaction, used for timeout (seconds)
    pub flags: ClientFlags,
    pub list_node: Option<usize>,   // our node in the server's client list, for O(1) unlink
}

/// Create a client around an accepted connection. `fd == -1` builds a
/// detached client for internal use: no descriptor, no event registration,
/// not linked into the server's client list.
pub fn create_client(el: &mut EventLoop<Server>, srv: &mut Server, fd: i32)
    -> Result<Arc<RwLock<Client>>, String> {
    if fd != -1 {
        anet::nonblock(fd)?;
        anet::tcp_no_delay(fd)?;
        if srv.tcpkeepalive > 0 {
            anet::tcp_keep_alive(fd)?;
        }
    }

    let id = NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed);
    let c = Arc::new(RwLock::new(Client {
        id,
        fd,
        argv: Vec::new(),
        reply: LinkedList::new(),
        reply_bytes: 0,
        sentlen: 0,
        bufpos: 0,
        buf: [0; PROTO_BUFFER_BYTES],
        ctime: srv.unixtime,
        last_interaction: srv.unixtime,
        flags: ClientFlags(0),
        list_node: None,
    }));

    if fd != -1 {
        let c2 = c.clone();
        let read_proc: FileProc<Server> = Arc::new(move |el, srv, fd, mask| {
            read_message_from_client(el, srv, &c2, fd, mask);
        });
        if let Err(e) = el.create_file_event(fd, Mask::Readable, read_proc) {
            unsafe {
                libc::close(fd);
            }
            return Err(e);
        }
        // Remember the list node so removing the client later is a constant
        // time operation, not a linear scan.
        let idx = srv.clients.add_node_tail(c.clone());
        c.write().unwrap().list_node = Some(idx);
    }
    Ok(c)
}

/// Detach the client from the server: remove it from the client list,
/// unregister its I/O handlers and close the socket. A client already
/// detached (fd == -1) is left alone.
pub fn unlink_client(el: &mut EventLoop<Server>, srv: &mut Server, c: &Arc<RwLock<Client>>) {
    let fd = c.read().unwrap().fd;
    if fd == -1 {
        return;
    }

    if let Some(idx) = c.write().unwrap().list_node.take() {
        srv.clients.del_node(idx);
    }

    el.delete_file_event(fd, Mask::Readable);
    el.delete_file_event(fd, Mask::Writable);
    unsafe {
        libc::close(fd);
    }

    let mut cl = c.write().unwrap();
    cl.fd = -1;
    cl.flags.clear_pending_write();
}

pub fn free_client(el: &mut EventLoop<Server>, srv: &mut Server, c: &Arc<RwLock<Client>>) {
    unlink_client(el, srv, c);
    // The pending-write list may still hold a handle on us; drop the bulky
    // state now instead of waiting for the last reference to go.
    let mut cl = c.write().unwrap();
    cl.argv.clear();
    cl.reply.clear();
    cl.reply_bytes = 0;
    cl.bufpos = 0;
    cl.sentlen = 0;
}

/// True if the client has reply bytes staged in either tier.
pub fn client_has_pending_replies(c: &Client) -> bool {
    c.bufpos > 0 || !c.reply.is_empty()
}

/// Called every time new data is about to be transmitted to the client.
/// Returns Err if no data should be appended (the client is going away).
///
/// Instead of installing the write handler right away, the client is only
/// flagged and parked in a list of clients with something to write. Before
/// re-entering the event loop we try to write to the sockets directly,
/// avoiding a registration syscall; the handler is installed only if that
/// synchronous pass cannot drain the whole reply.
pub fn prepare_client_to_write(srv: &mut Server, c: &Arc<RwLock<Client>>) -> Result<(), String> {
    let mut cl = c.write().unwrap();
    if cl.fd <= 0 {
        return Err("client is going to be closed".to_string());
    }

    if !client_has_pending_replies(&cl) && !cl.flags.is_pending_write() {
        cl.flags.set_pending_write();
        drop(cl);
        srv.clients_pending_write.push_front(c.clone());
    }
    Ok(())
}

/// Tier 1: copy into the inline buffer. Refused when the chunk does not
/// fit, or when chunks already sit in the overflow queue (appending to the
/// buffer then would reorder the reply stream).
fn add_reply_to_buffer(c: &mut Client, s: &[u8]) -> Result<(), ()> {
    if !c.reply.is_empty() {
        return Err(());
    }
    let available = PROTO_BUFFER_BYTES - c.bufpos;
    if s.len() > available {
        return Err(());
    }
    c.buf[c.bufpos..c.bufpos + s.len()].copy_from_slice(s);
    c.bufpos += s.len();
    Ok(())
}

/// Tier 2: queue an owned chunk on the reply list.
fn add_reply_bytes_to_list(c: &mut Client, s: Vec<u8>) {
    c.reply_bytes += s.len();
    c.reply.push_back(s);
}

pub fn add_reply_string(srv: &mut Server, c: &Arc<RwLock<Client>>, s: &[u8]) {
    if prepare_client_to_write(srv, c).is_err() {
        return;
    }
    let mut cl = c.write().unwrap();
    if add_reply_to_buffer(&mut cl, s).is_err() {
        add_reply_bytes_to_list(&mut cl, s.to_vec());
    }
}

/// Owned variant of `add_reply_string`: when the inline buffer cannot take
/// the bytes, the vector moves into the overflow queue without a copy.
pub fn add_reply_bytes(srv: &mut Server, c: &Arc<RwLock<Client>>, s: Vec<u8>) {
    if prepare_client_to_write(srv, c).is_err() {
        return;
    }
    let mut cl = c.write().unwrap();
    if add_reply_to_buffer(&mut cl, &s).is_err() {
        add_reply_bytes_to_list(&mut cl, s);
    }
}

pub fn add_reply_long_long(srv: &mut Server, c: &Arc<RwLock<Client>>, ll: i64) {
    add_reply_string(srv, c, format!(":{}\r\n", ll).as_bytes());
}

pub fn add_reply_error(srv: &mut Server, c: &Arc<RwLock<Client>>, err: &str) {
    add_reply_string(srv, c, err.as_bytes());
}

pub fn add_reply_error_format(srv: &mut Server, c: &Arc<RwLock<Client>>, args: fmt::Arguments) {
    add_reply_error(srv, c, &fmt::format(args));
}

/// Write as much staged reply data as the socket accepts: first the inline
/// buffer, then the overflow chunks. EAGAIN stops the drain without an
/// error; any other write failure frees the client. When everything is out
/// and a write handler was installed, it is removed.
pub fn write_to_client(el: &mut EventLoop<Server>, srv: &mut Server, c: &Arc<RwLock<Client>>,
    handler_installed: bool) -> Result<(), ()> {
    let fd;
    let failed;
    let mut totwritten: usize = 0;
    {
        let mut cl = c.write().unwrap();
        fd = cl.fd;
        if fd == -1 {
            return Err(());
        }

        let mut nwritten: isize = 0;
        while client_has_pending_replies(&cl) {
            if cl.bufpos > 0 {
                let sentlen = cl.sentlen;
                let bufpos = cl.bufpos;
                nwritten = unsafe {
                    libc::write(fd, cl.buf[sentlen..].as_ptr() as *const c_void, bufpos - sentlen)
                };
                if nwritten <= 0 {
                    break;
                }
                cl.sentlen += nwritten as usize;
                totwritten += nwritten as usize;

                // If the buffer was sent, reset it to continue with the
                // remainder of the reply.
                if cl.sentlen == cl.bufpos {
                    cl.bufpos = 0;
                    cl.sentlen = 0;
                }
            } else {
                let objlen = cl.reply.front().map_or(0, |o| o.len());
                if objlen == 0 {
                    cl.reply.pop_front();
                    continue;
                }

                let sentlen = cl.sentlen;
                let o = cl.reply.front().unwrap();
                nwritten = unsafe {
                    libc::write(fd, o[sentlen..].as_ptr() as *const c_void, objlen - sentlen)
                };
                if nwritten <= 0 {
                    break;
                }
                cl.sentlen += nwritten as usize;
                totwritten += nwritten as usize;

                // If we fully sent the chunk on head go to the next one
                if cl.sentlen == objlen {
                    cl.reply.pop_front();
                    cl.sentlen = 0;
                    cl.reply_bytes -= objlen;
                    // With no chunks left the byte count must be exactly
                    // zero, or the bookkeeping is corrupted.
                    if cl.reply.is_empty() {
                        assert!(cl.reply_bytes == 0);
                    }
                }
            }
        }

        failed = nwritten == -1 && error() != EAGAIN;
        if totwritten > 0 {
            cl.last_interaction = srv.unixtime;
        }
        if !failed && !client_has_pending_replies(&cl) {
            cl.sentlen = 0;
        }
    }

    if failed {
        log(LogLevel::Verbose, &format!("Error writing to client: {}", strerror()));
        free_client(el, srv, c);
        return Err(());
    }
    if handler_installed && !client_has_pending_replies(&c.read().unwrap()) {
        el.delete_file_event(fd, Mask::Writable);
    }
    Ok(())
}

/// The handler behind the writable registration: keep draining whenever the
/// socket reports room.
pub fn send_reply_to_client(c: Arc<RwLock<Client>>) -> FileProc<Server> {
    Arc::new(move |el, srv, _fd, _mask| {
        let _ = write_to_client(el, srv, &c, true);
    })
}

/// Called just before entering the event loop, in the hope the replies fit
/// the socket buffers right away and no writable event handler needs to be
/// installed, called and so forth.
pub fn handle_clients_with_pending_writes(el: &mut EventLoop<Server>, srv: &mut Server) -> usize {
    let processed = srv.clients_pending_write.len();

    while let Some(c) = srv.clients_pending_write.pop_front() {
        c.write().unwrap().flags.clear_pending_write();

        // Freed while parked in the list: nothing to flush.
        let fd = c.read().unwrap().fd;
        if fd == -1 {
            continue;
        }

        // Try to write buffers to the client socket.
        if write_to_client(el, srv, &c, false).is_err() {
            continue;
        }

        // If after the synchronous writes above there is still data to
        // output to the client, install the writable handler.
        if client_has_pending_replies(&c.read().unwrap()) {
            let proc = send_reply_to_client(c.clone());
            if el.create_file_event(fd, Mask::Writable, proc).is_err() {
                // Nothing to do, the next flush attempt retries.
            }
        }
    }
    processed
}

/// The readable handler: one non-blocking read, split into an argv on ASCII
/// spaces, dispatch through the command table.
pub fn read_message_from_client(el: &mut EventLoop<Server>, srv: &mut Server,
    c: &Arc<RwLock<Client>>, fd: i32, _mask: Mask) {
    let mut buf = [0u8; PROTO_BUFFER_BYTES];

    let nread = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut c_void, PROTO_BUFFER_BYTES) };
    if nread == -1 {
        if error() == EAGAIN {
            return;
        }
        log(LogLevel::Verbose, &format!("Reading from client: {}", strerror()));
        free_client(el, srv, c);
        return;
    }
    if nread == 0 {
        log(LogLevel::Verbose, "Client closed connection");
        free_client(el, srv, c);
        return;
    }

    let msg = &buf[..nread as usize];
    {
        let mut cl = c.write().unwrap();
        cl.last_interaction = srv.unixtime;

        let mut end = msg.len();
        while end > 0 && (msg[end - 1] == b'\r' || msg[end - 1] == b'\n') {
            end -= 1;
        }
        cl.argv = msg[..end]
            .split(|b| *b == b' ')
            .filter(|t| !t.is_empty())
            .map(|t| t.to_vec())
            .collect();
    }
    if c.read().unwrap().argv.is_empty() {
        return;
    }
    cmd::dispatch_command(el, srv, c);
}
