//! Server state and the glue around the reactor: configuration defaults,
//! startup, signal handling, the cron time event and the bridge that hands
//! worker-thread results back to the reactor.

use std::collections::{HashMap, VecDeque};
use std::mem::zeroed;
use std::net::Ipv4Addr;
use std::process;
use std::ptr::null_mut;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use libc::{c_int, c_void, SIGBUS, SIGFPE, SIGHUP, SIGILL, SIGINT, SIGPIPE, SIGSEGV, SIGTERM,
    SIG_IGN};

use crate::adlist::List;
use crate::ae::{EventLoop, Mask, TimeProc};
use crate::anet;
use crate::cmd::{self, Command};
use crate::log::{log, log_from_handler, LogLevel};
use crate::networking::{create_client, free_client, Client};
use crate::thread_pool::ThreadPool;
use crate::util::{get_time_ms, timestamp};
use crate::zmalloc;

pub const CONFIG_DEFAULT_HZ: i32 = 10;                  // cron calls per second
pub const CONFIG_DEFAULT_SERVER_PORT: u16 = 9528;
pub const CONFIG_DEFAULT_CLIENT_TIMEOUT: u64 = 30;      // seconds of idleness tolerated
pub const CONFIG_DEFAULT_TCP_KEEPALIVE: i32 = 300;
pub const CONFIG_DEFAULT_MAX_CLIENTS: usize = 10_000;
pub const CONFIG_MIN_RESERVED_FDS: usize = 32;

/// When configuring the event loop we set it up to handle
/// `maxclients + CONFIG_FDSET_INCR` descriptors: the reserved ones plus a
/// few more to stay safe, 128 in total.
pub const CONFIG_FDSET_INCR: usize = CONFIG_MIN_RESERVED_FDS + 96;

pub const CONFIG_DEFAULT_POOL_THREADS: usize = 10;
pub const CONFIG_DEFAULT_POOL_MAX_TASKS: usize = 100;

const CLIENTS_CRON_MIN_ITERATIONS: usize = 5;

static SHUTDOWN_ASAP: AtomicBool = AtomicBool::new(false);

/// Work finished on a worker thread hands one of these back; it runs on the
/// reactor thread with full access to the loop and the server.
pub type TaskCompletion = Box<dyn FnOnce(&mut EventLoop<Server>, &mut Server) + Send>;

/// The worker-to-reactor bridge: completions queue up behind a mutex and a
/// byte written to a self-pipe wakes the poll, whose read handler drains
/// the queue.
pub struct CompletionPipe {
    rfd: i32,
    wfd: i32,
    pending: Arc<Mutex<Vec<TaskCompletion>>>,
}

impl CompletionPipe {
    pub fn create() -> Result<CompletionPipe, String> {
        let mut fds = [0i32; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } == -1 {
            return Err(format!("pipe: {}", crate::util::strerror()));
        }
        anet::nonblock(fds[0])?;
        anet::nonblock(fds[1])?;
        Ok(CompletionPipe { rfd: fds[0], wfd: fds[1], pending: Arc::new(Mutex::new(Vec::new())) })
    }

    pub fn read_fd(&self) -> i32 {
        self.rfd
    }

    pub fn notifier(&self) -> CompletionNotifier {
        CompletionNotifier { wfd: self.wfd, pending: self.pending.clone() }
    }

    /// Swallow whatever bytes accumulated on the pipe and take the queued
    /// completions.
    pub fn drain(&self) -> Vec<TaskCompletion> {
        let mut buf = [0u8; 512];
        loop {
            let n = unsafe { libc::read(self.rfd, buf.as_mut_ptr() as *mut c_void, buf.len()) };
            if n <= 0 {
                break;
            }
        }
        std::mem::take(&mut *self.pending.lock().unwrap())
    }
}

impl Drop for CompletionPipe {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.rfd);
            libc::close(self.wfd);
        }
    }
}

#[derive(Clone)]
pub struct CompletionNotifier {
    wfd: i32,
    pending: Arc<Mutex<Vec<TaskCompletion>>>,
}

impl CompletionNotifier {
    pub fn notify(&self, done: TaskCompletion) {
        self.pending.lock().unwrap().push(done);
        // Best effort wake-up; with the pipe full the poll wakes anyway.
        unsafe {
            libc::write(self.wfd, b"x".as_ptr() as *const c_void, 1);
        }
    }
}

pub struct Server {
    pub pid: u32,
    pub port: u16,
    pub bindaddr: String,
    pub ipfd: Vec<i32>,             // TCP listening socket file descriptors
    pub hz: i32,                    // cron calls frequency in hertz
    pub cronloops: i64,             // number of times the cron function ran
    pub unixtime: u64,              // cached wall clock, seconds
    pub mstime: u64,                // cached wall clock, milliseconds
    pub maxidletime: u64,
    pub tcpkeepalive: i32,
    pub maxclients: usize,
    pub clients: List<Arc<RwLock<Client>>>,
    pub clients_pending_write: VecDeque<Arc<RwLock<Client>>>,
    pub commands: HashMap<&'static str, Command>,
    pub stat_starttime: u64,
    pub stat_numconnections: u64,
    pub stat_numcommands: u64,
    pub pool: Option<ThreadPool>,
    pub completions: Option<CompletionPipe>,
}

impl Server {
    pub fn new() -> Server {
        let now = timestamp().as_secs();
        Server {
            pid: process::id(),
            port: CONFIG_DEFAULT_SERVER_PORT,
            bindaddr: String::new(),
            ipfd: Vec::new(),
            hz: CONFIG_DEFAULT_HZ,
            cronloops: 0,
            unixtime: now,
            mstime: get_time_ms(),
            maxidletime: CONFIG_DEFAULT_CLIENT_TIMEOUT,
            tcpkeepalive: CONFIG_DEFAULT_TCP_KEEPALIVE,
            maxclients: CONFIG_DEFAULT_MAX_CLIENTS,
            clients: List::new(),
            clients_pending_write: VecDeque::new(),
            commands: cmd::command_table(),
            stat_starttime: now,
            stat_numconnections: 0,
            stat_numcommands: 0,
            pool: None,
            completions: None,
        }
    }

    /// We take a cached value of the unix time in the global state because
    /// accuracy is not needed for the uses it has, and reading a field is a
    /// lot faster than calling time(2) everywhere.
    pub fn update_cached_time(&mut self) {
        self.unixtime = timestamp().as_secs();
        self.mstime = get_time_ms();
    }

    /// `true` on the cron iterations where a task with the given period (in
    /// milliseconds) should run. The actual resolution depends on `hz`.
    pub fn cron_should_run(&self, period_ms: i64) -> bool {
        let tick = 1000 / self.hz as i64;
        period_ms <= tick || self.cronloops % (period_ms / tick) == 0
    }

    pub fn init_server(&mut self, el: &mut EventLoop<Server>) -> Result<(), String> {
        unsafe {
            libc::signal(SIGHUP, SIG_IGN);
            libc::signal(SIGPIPE, SIG_IGN);
        }
        setup_signal_handlers();

        self.update_cached_time();

        // Open the TCP listening socket for the user commands.
        let lfd = anet::tcp_server(self.port, &self.bindaddr)?;
        self.ipfd.push(lfd);

        // The timer callback is our way to process background operations
        // incrementally, like client timeouts.
        let cron: TimeProc<Server> = Arc::new(server_cron);
        el.create_time_event(1, cron, None);

        for fd in self.ipfd.clone() {
            el.create_file_event(fd, Mask::Readable, Arc::new(accept_tcp_handler))
                .map_err(|e| format!("Unrecoverable error creating listener file event: {e}"))?;
        }

        self.pool = Some(ThreadPool::create("default",
            CONFIG_DEFAULT_POOL_THREADS, CONFIG_DEFAULT_POOL_MAX_TASKS));

        let pipe = CompletionPipe::create()?;
        el.create_file_event(pipe.read_fd(), Mask::Readable, Arc::new(task_completion_handler))?;
        self.completions = Some(pipe);

        Ok(())
    }

    /// Run `work` on the pool; the completion it returns is executed back
    /// on the reactor thread.
    pub fn offload(&mut self, work: impl FnOnce() -> TaskCompletion + Send + 'static)
        -> Result<u64, String> {
        let notifier = match &self.completions {
            Some(pipe) => pipe.notifier(),
            None => return Err("completion pipe not initialized".to_string()),
        };
        match &self.pool {
            Some(pool) => pool.task_post(move || {
                let done = work();
                notifier.notify(done);
            }),
            None => Err("thread pool not initialized".to_string()),
        }
    }

    pub fn shutdown(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.destroy();
        }
        for fd in self.ipfd.drain(..) {
            unsafe {
                libc::close(fd);
            }
        }
        self.completions = None;
    }
}

/// File event handler: drain the completion pipe and run every queued
/// completion on the reactor thread.
fn task_completion_handler(el: &mut EventLoop<Server>, srv: &mut Server, _fd: i32, _mask: Mask) {
    let done = match &srv.completions {
        Some(pipe) => pipe.drain(),
        None => Vec::new(),
    };
    for f in done {
        f(el, srv);
    }
}

/// File event handler: accept a connection request.
pub fn accept_tcp_handler(el: &mut EventLoop<Server>, srv: &mut Server, fd: i32, _mask: Mask) {
    let (cfd, c_ip, c_port) = match anet::accept(fd) {
        Ok(conn) => conn,
        Err(e) => {
            log(LogLevel::Warning, &format!("Accepting client connection: {}", e));
            return;
        }
    };
    log(LogLevel::Verbose, &format!("Accepted {}:{}", Ipv4Addr::from(c_ip), c_port));

    match create_client(el, srv, cfd) {
        Ok(c) => {
            // The client is created before the limit check on purpose: with
            // the socket already non-blocking the error reply below is sent
            // for free by the kernel I/O.
            if srv.maxclients > 0 && srv.clients.len() > srv.maxclients {
                let err = "-ERR max number of clients reached\r\n";
                // That's a best effort error message, don't check write errors
                unsafe {
                    libc::write(cfd, err.as_ptr() as *const c_void, err.len());
                }
                free_client(el, srv, &c);
                return;
            }
            srv.stat_numconnections += 1;
        }
        Err(e) => {
            log(LogLevel::Warning, &format!("Error allocating resources for the client: {}", e));
            unsafe {
                libc::close(cfd);   // May be already closed, just ignore errors
            }
        }
    }
}

/// Check one client for timeout. Returns true if the client was freed.
fn clients_cron_handle_timeout(el: &mut EventLoop<Server>, srv: &mut Server,
    c: &Arc<RwLock<Client>>, now_ms: u64) -> bool {
    let now = now_ms / 1000;
    let idle = {
        let cl = c.read().unwrap();
        srv.maxidletime > 0 && cl.last_interaction + srv.maxidletime < now
    };
    if idle {
        log(LogLevel::Verbose, "Closing idle client");
        free_client(el, srv, c);
        return true;
    }
    false
}

/// Process a slice of the client list per call. Since this runs `hz` times
/// per second, in the worst case every client gets visited within one
/// second.
fn clients_cron(el: &mut EventLoop<Server>, srv: &mut Server) {
    let numclients = srv.clients.len();
    let mut iterations = numclients / srv.hz.max(1) as usize;
    if iterations < CLIENTS_CRON_MIN_ITERATIONS {
        iterations = numclients.min(CLIENTS_CRON_MIN_ITERATIONS);
    }
    let now_ms = srv.mstime;

    while srv.clients.len() > 0 && iterations > 0 {
        iterations -= 1;
        // Rotate the list and take the current head: a client that must go
        // away is then the first element, removed without a scan.
        srv.clients.rotate();
        let c = srv.clients.first().unwrap().clone();
        if clients_cron_handle_timeout(el, srv, &c, now_ms) {
            continue;
        }
    }
}

/// Time event handler: the timer interrupt, called `hz` times per second.
pub fn server_cron(el: &mut EventLoop<Server>, srv: &mut Server, _id: i64) -> i32 {
    srv.update_cached_time();

    if SHUTDOWN_ASAP.swap(false, Ordering::SeqCst) {
        log(LogLevel::Warning, "User requested shutdown, stopping the event loop");
        el.stop();
    }

    if srv.cron_should_run(5000) {
        log(LogLevel::Verbose, &format!("{} clients connected, {} bytes in use",
            srv.clients.len(), zmalloc::used_memory()));
    }

    clients_cron(el, srv);

    srv.cronloops += 1;
    1000 / srv.hz
}

extern "C" fn sig_shutdown_handler(sig: c_int) {
    let msg = match sig {
        SIGINT => "Received SIGINT scheduling shutdown...",
        SIGTERM => "Received SIGTERM scheduling shutdown...",
        _ => "Received shutdown signal, scheduling shutdown...",
    };
    log_from_handler(LogLevel::Warning, msg);
    SHUTDOWN_ASAP.store(true, Ordering::SeqCst);
}

extern "C" fn sig_fatal_handler(sig: c_int) {
    let msg = match sig {
        SIGSEGV => "Crashed by SIGSEGV",
        SIGBUS => "Crashed by SIGBUS",
        SIGFPE => "Crashed by SIGFPE",
        SIGILL => "Crashed by SIGILL",
        _ => "Crashed by fatal signal",
    };
    log_from_handler(LogLevel::Warning, msg);
    // SA_RESETHAND restored the default action; re-raising terminates the
    // process with the proper status.
    unsafe {
        libc::raise(sig);
    }
}

pub fn setup_signal_handlers() {
    unsafe {
        let mut act: libc::sigaction = zeroed();
        libc::sigemptyset(&mut act.sa_mask);
        act.sa_flags = 0;
        act.sa_sigaction = sig_shutdown_handler as usize;
        libc::sigaction(SIGTERM, &act, null_mut());
        libc::sigaction(SIGINT, &act, null_mut());

        let mut act: libc::sigaction = zeroed();
        libc::sigemptyset(&mut act.sa_mask);
        act.sa_flags = libc::SA_NODEFER | libc::SA_RESETHAND;
        act.sa_sigaction = sig_fatal_handler as usize;
        libc::sigaction(SIGSEGV, &act, null_mut());
        libc::sigaction(SIGBUS, &act, null_mut());
        libc::sigaction(SIGFPE, &act, null_mut());
        libc::sigaction(SIGILL, &act, null_mut());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ae::EventFlag;
    use crate::networking::{client_has_pending_replies, handle_clients_with_pending_writes};
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::time::Duration;

    #[test]
    fn cron_period_arithmetic() {
        let mut srv = Server::new();
        assert!(srv.cron_should_run(100));  // faster than a tick: every time
        assert!(srv.cron_should_run(5000)); // cronloops == 0
        srv.cronloops = 3;
        assert!(!srv.cron_should_run(5000));
        srv.cronloops = 50;
        assert!(srv.cron_should_run(5000));
    }

    #[test]
    fn cached_time_advances() {
        let mut srv = Server::new();
        let before = srv.mstime;
        std::thread::sleep(Duration::from_millis(5));
        srv.update_cached_time();
        assert!(srv.mstime > before);
        assert!(srv.unixtime >= srv.stat_starttime);
    }

    #[test]
    fn idle_clients_are_reaped_by_cron() {
        let mut el: EventLoop<Server> = EventLoop::create(256).unwrap();
        let mut srv = Server::new();
        let mut fds = [0i32; 2];
        assert_eq!(unsafe {
            libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr())
        }, 0);
        let c = create_client(&mut el, &mut srv, fds[0]).unwrap();
        srv.update_cached_time();

        // Fresh client survives the sweep.
        clients_cron(&mut el, &mut srv);
        assert_eq!(srv.clients.len(), 1);

        // An ancient last interaction gets it closed.
        c.write().unwrap().last_interaction = 0;
        clients_cron(&mut el, &mut srv);
        assert_eq!(srv.clients.len(), 0);
        assert_eq!(c.read().unwrap().fd, -1);

        unsafe {
            libc::close(fds[1]);
        }
    }

    #[test]
    fn completions_run_on_the_reactor() {
        let mut el: EventLoop<Server> = EventLoop::create(256).unwrap();
        let mut srv = Server::new();
        srv.pool = Some(ThreadPool::create("test", 2, 16));
        let pipe = CompletionPipe::create().unwrap();
        el.create_file_event(pipe.read_fd(), Mask::Readable, Arc::new(task_completion_handler))
            .unwrap();
        srv.completions = Some(pipe);

        srv.offload(|| {
            let answer = 2 + 2;
            Box::new(move |_el, srv: &mut Server| {
                srv.stat_numcommands = answer;
            })
        }).unwrap();

        for _ in 0..1000 {
            el.process_events(&mut srv, EventFlag::file_events() | EventFlag::dont_wait());
            if srv.stat_numcommands == 4 {
                break;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(srv.stat_numcommands, 4);
        srv.shutdown();
    }

    #[test]
    fn accept_and_ping_round_trip() {
        let mut el: EventLoop<Server> = EventLoop::create(256).unwrap();
        let mut srv = Server::new();

        let lfd = anet::tcp_server(0, "127.0.0.1").unwrap();
        let (_ip, port) = anet::sock_name(lfd).unwrap();
        srv.ipfd.push(lfd);
        el.create_file_event(lfd, Mask::Readable, Arc::new(accept_tcp_handler)).unwrap();

        let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
        let file_flags = EventFlag::file_events() | EventFlag::dont_wait();
        for _ in 0..100 {
            el.process_events(&mut srv, file_flags);
            if srv.clients.len() == 1 {
                break;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(srv.clients.len(), 1);
        assert_eq!(srv.stat_numconnections, 1);

        stream.write_all(b"PING\n").unwrap();
        let c = srv.clients.first().unwrap().clone();
        for _ in 0..100 {
            el.process_events(&mut srv, file_flags);
            if client_has_pending_replies(&c.read().unwrap()) {
                break;
            }
            std::thread::sleep(Duration::from_millis(1));
        }

        // The pre-poll flush takes the whole reply; no writable handler.
        handle_clients_with_pending_writes(&mut el, &mut srv);
        let cfd = c.read().unwrap().fd;
        assert!(!el.get_file_events(cfd).is_writable());

        stream.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let mut got = [0u8; 7];
        stream.read_exact(&mut got).unwrap();
        assert_eq!(&got, b"+PONG\r\n");

        free_client(&mut el, &mut srv, &c);
        srv.shutdown();
    }

    #[test]
    fn shutdown_flag_stops_the_loop_from_cron() {
        let mut el: EventLoop<Server> = EventLoop::create(64).unwrap();
        let mut srv = Server::new();
        el.create_time_event(1, Arc::new(server_cron), None);

        sig_shutdown_handler(SIGTERM);
        // main() exits once the cron observes the flag.
        el.main(&mut srv);
        assert!(!SHUTDOWN_ASAP.load(Ordering::SeqCst));
    }
}
