//! A simple event-driven programming library: a single-threaded reactor
//! multiplexing file events (per-fd read/write handlers) and time events
//! over one readiness backend.
//!
//! The loop is generic over an application context `C`. Handlers receive
//! `&mut EventLoop<C>` and `&mut C` explicitly; state they need beyond that
//! travels inside the handler closure itself.

use std::mem::zeroed;
use std::ops::{BitAnd, BitOr};
use std::sync::Arc;

use libc::{pollfd, POLLERR, POLLHUP, POLLIN, POLLOUT};

use crate::util::{add_ms_to_now, get_time_ms, strerror, timestamp};

mod io_event;

use io_event::io_api::ApiState;

pub const AE_NOMORE: i32 = -1;
const DELETED_EVENT_ID: i64 = -1;

pub type FileProc<C> = Arc<dyn Fn(&mut EventLoop<C>, &mut C, i32, Mask)>;
pub type TimeProc<C> = Arc<dyn Fn(&mut EventLoop<C>, &mut C, i64) -> i32>;
pub type EventFinalizerProc<C> = Arc<dyn Fn(&mut EventLoop<C>, &mut C)>;
pub type BeforeSleepProc<C> = Arc<dyn Fn(&mut EventLoop<C>, &mut C)>;

#[derive(Clone, Copy, PartialEq)]
pub struct EventFlag(u8);

impl EventFlag {
    pub fn none() -> Self {
        EventFlag(0)
    }

    pub fn file_events() -> Self {
        EventFlag(1)
    }

    pub fn time_events() -> Self {
        EventFlag(2)
    }

    pub fn all_events() -> Self {
        EventFlag(3)
    }

    pub fn dont_wait() -> Self {
        EventFlag(4)
    }

    pub fn call_after_sleep() -> Self {
        EventFlag(8)
    }

    pub fn contains_file_events(&self) -> bool {
        (self.0 & Self::file_events().0) != 0
    }

    pub fn contains_time_events(&self) -> bool {
        (self.0 & Self::time_events().0) != 0
    }

    pub fn is_waiting(&self) -> bool {
        (self.0 & Self::dont_wait().0) == 0
    }

    pub fn calls_after_sleep(&self) -> bool {
        (self.0 & Self::call_after_sleep().0) != 0
    }
}

impl BitAnd for EventFlag {
    type Output = EventFlag;

    fn bitand(self, rhs: Self) -> Self::Output {
        EventFlag(self.0 & rhs.0)
    }
}

impl BitOr for EventFlag {
    type Output = EventFlag;

    fn bitor(self, rhs: Self) -> Self::Output {
        EventFlag(self.0 | rhs.0)
    }
}

#[derive(Clone, Copy, PartialEq, Debug)]
pub enum Mask {
    None,
    Readable,
    Writable,
    ReadWritable,
}

impl Mask {
    pub fn is_readable(&self) -> bool {
        *self == Self::Readable || *self == Self::ReadWritable
    }

    pub fn is_writable(&self) -> bool {
        *self == Self::Writable || *self == Self::ReadWritable
    }

    pub fn disable(&mut self, mask: Self) {
        match (*self, mask) {
            (_, Self::None) => {}
            (Self::None, _) => {}
            (_, Self::ReadWritable) => { *self = Self::None; }
            (Self::Readable, Self::Readable) => { *self = Self::None; }
            (Self::ReadWritable, Self::Readable) => { *self = Self::Writable; }
            (Self::Writable, Self::Writable) => { *self = Self::None; }
            (Self::ReadWritable, Self::Writable) => { *self = Self::Readable; }
            (_, _) => {}
        }
    }
}

impl BitOr for Mask {
    type Output = Mask;

    fn bitor(self, rhs: Self) -> Self::Output {
        match (self, rhs) {
            (Self::None, r) => r,
            (l, Self::None) => l,
            (Self::ReadWritable, _) | (_, Self::ReadWritable) => Self::ReadWritable,
            (Self::Readable, Self::Writable) | (Self::Writable, Self::Readable) => Self::ReadWritable,
            (l, _) => l,
        }
    }
}

pub struct FileEvent<C> {
    mask: Mask,
    r_file_proc: Option<FileProc<C>>,
    w_file_proc: Option<FileProc<C>>,
}

impl<C> FileEvent<C> {
    fn empty() -> FileEvent<C> {
        FileEvent { mask: Mask::None, r_file_proc: None, w_file_proc: None }
    }
}

struct TimeEvent<C> {
    id: i64,
    when_ms: u64,
    time_proc: TimeProc<C>,
    finalizer_proc: Option<EventFinalizerProc<C>>,
}

pub struct FiredEvent {
    pub fd: i32,
    pub mask: Mask,
}

/// State of an event based program.
pub struct EventLoop<C> {
    setsize: usize,
    max_fd: i32,
    time_event_next_id: i64,
    last_time: u64,         // Used to detect system clock skew (seconds)
    events: Vec<FileEvent<C>>,      // Registered events
    fired: Vec<FiredEvent>,         // Fired events
    time_events: Vec<TimeEvent<C>>, // Unsorted, newest first
    stop: bool,
    api_data: ApiState,     // This is used for polling API specific data
    before_sleep: Option<BeforeSleepProc<C>>,
    after_sleep: Option<BeforeSleepProc<C>>,
}

impl<C> EventLoop<C> {
    pub fn create(setsize: usize) -> Result<EventLoop<C>, String> {
        let api_data = ApiState::create(setsize)?;
        let mut event_loop = EventLoop {
            setsize,
            max_fd: -1,
            time_event_next_id: 0,
            last_time: timestamp().as_secs(),
            events: Vec::with_capacity(setsize),
            fired: Vec::with_capacity(setsize),
            time_events: Vec::new(),
            stop: false,
            api_data,
            before_sleep: None,
            after_sleep: None,
        };
        for _ in 0..setsize {
            event_loop.events.push(FileEvent::empty());
            event_loop.fired.push(FiredEvent { fd: -1, mask: Mask::None });
        }
        Ok(event_loop)
    }

    pub fn stop(&mut self) {
        self.stop = true;
    }

    pub fn get_set_size(&self) -> usize {
        self.setsize
    }

    /// Grow the tracked fd range. Fails if a registered fd does not fit the
    /// new size; otherwise no state is lost.
    pub fn resize_set_size(&mut self, setsize: usize) -> Result<(), String> {
        if setsize == self.setsize {
            return Ok(());
        }
        if self.max_fd >= setsize as i32 {
            return Err(format!("a registered fd ({}) does not fit in {}", self.max_fd, setsize));
        }
        self.api_data.resize(setsize);
        while self.events.len() < setsize {
            self.events.push(FileEvent::empty());
            self.fired.push(FiredEvent { fd: -1, mask: Mask::None });
        }
        self.events.truncate(setsize);
        self.fired.truncate(setsize);
        self.setsize = setsize;
        Ok(())
    }

    pub fn create_file_event(&mut self, fd: i32, mask: Mask, proc: FileProc<C>) -> Result<(), String> {
        if fd as usize >= self.setsize {
            return Err(format!("fd should be less than {}", self.setsize));
        }
        // Register with the backend first so a failure leaves no state
        // change behind.
        let old = self.events[fd as usize].mask;
        self.api_data.add_event(fd, old, mask)?;
        let fe = &mut self.events[fd as usize];
        fe.mask = fe.mask | mask;
        if mask.is_readable() {
            fe.r_file_proc = Some(proc.clone());
        }
        if mask.is_writable() {
            fe.w_file_proc = Some(proc);
        }
        if fd > self.max_fd {
            self.max_fd = fd;
        }
        Ok(())
    }

    pub fn delete_file_event(&mut self, fd: i32, mask: Mask) {
        if fd as usize >= self.setsize {
            return;
        }
        let old = self.events[fd as usize].mask;
        if old == Mask::None {
            return;
        }
        let fe = &mut self.events[fd as usize];
        fe.mask.disable(mask);
        if !fe.mask.is_readable() {
            fe.r_file_proc = None;
        }
        if !fe.mask.is_writable() {
            fe.w_file_proc = None;
        }

        if fd == self.max_fd && self.events[fd as usize].mask == Mask::None {
            let mut j = self.max_fd - 1;
            while j >= 0 {
                if self.events[j as usize].mask != Mask::None {
                    break;
                }
                j -= 1;
            }
            self.max_fd = j;
        }

        if let Err(err) = self.api_data.del_event(fd, old, mask) {
            crate::log::log(crate::log::LogLevel::Warning, &err);
        }
    }

    pub fn get_file_events(&self, fd: i32) -> Mask {
        if fd as usize >= self.setsize {
            return Mask::None;
        }
        self.events[fd as usize].mask
    }

    pub fn create_time_event(&mut self, milliseconds: u64, proc: TimeProc<C>,
        finalizer_proc: Option<EventFinalizerProc<C>>) -> i64 {
        let id = self.time_event_next_id;
        self.time_event_next_id += 1;
        // New events go to the head of the list.
        self.time_events.insert(0, TimeEvent {
            id,
            when_ms: add_ms_to_now(milliseconds),
            time_proc: proc,
            finalizer_proc,
        });
        id
    }

    /// Mark a time event as deleted. The node is unlinked (and its
    /// finalizer runs) lazily during the next sweep, since the caller may
    /// well be a time event handler running inside that very sweep.
    pub fn delete_time_event(&mut self, id: i64) -> Result<(), String> {
        for te in self.time_events.iter_mut() {
            if te.id == id {
                te.id = DELETED_EVENT_ID;
                return Ok(());
            }
        }
        Err(format!("no event with the specified ID ({id}) found"))
    }

    /// Search the first timer to fire.
    /// This operation is useful to know how many time the poll can be
    /// put in sleep without to delay any event.
    ///
    /// Note that's O(N) since time events are unsorted.
    fn search_nearest_timer(&self) -> Option<u64> {
        self.time_events
            .iter()
            .filter(|te| te.id != DELETED_EVENT_ID)
            .map(|te| te.when_ms)
            .min()
    }

    fn process_time_events(&mut self, ctx: &mut C) -> u32 {
        let mut processed = 0u32;

        // If the system clock is moved to the future, and then set back to
        // the right value, time events may be delayed in a random way. Here
        // we detect the skew and force every event to fire ASAP: processing
        // events earlier is less dangerous than delaying them indefinitely.
        let now_sec = timestamp().as_secs();
        if now_sec < self.last_time {
            for te in self.time_events.iter_mut() {
                te.when_ms = 0;
            }
        }
        self.last_time = now_sec;

        // Unlink events scheduled for deletion, firing their finalizer.
        let mut j = 0;
        while j < self.time_events.len() {
            if self.time_events[j].id == DELETED_EVENT_ID {
                let te = self.time_events.remove(j);
                if let Some(f) = te.finalizer_proc {
                    f(self, ctx);
                }
            } else {
                j += 1;
            }
        }

        // Collect what is due right now, in traversal order (newest first).
        // Events registered by handlers during this sweep carry a larger id
        // and are left for the next iteration of the loop.
        let max_id = self.time_event_next_id - 1;
        let now = get_time_ms();
        let due: Vec<i64> = self.time_events
            .iter()
            .filter(|te| te.id != DELETED_EVENT_ID && te.id <= max_id && te.when_ms <= now)
            .map(|te| te.id)
            .collect();

        for id in due {
            // The handler before us may have deleted this one; resolve by
            // id again instead of trusting positions.
            let proc = match self.time_events.iter().find(|te| te.id == id) {
                Some(te) => te.time_proc.clone(),
                None => continue,
            };
            let ret_val = proc(self, ctx, id);
            processed += 1;
            if let Some(te) = self.time_events.iter_mut().find(|te| te.id == id) {
                if ret_val == AE_NOMORE {
                    te.id = DELETED_EVENT_ID;
                } else {
                    te.when_ms = add_ms_to_now(ret_val as u64);
                }
            }
        }
        processed
    }

    /// Process every pending file event, then every pending time event.
    /// Without special flags the function sleeps until some file event
    /// fires, or until the next time event occurs (if any).
    ///
    /// If flags has FILE_EVENTS set, file events are processed.
    /// If flags has TIME_EVENTS set, time events are processed.
    /// If flags has DONT_WAIT set the function returns ASAP once every event
    /// that can be processed without waiting is processed.
    /// If flags has CALL_AFTER_SLEEP set, the after-sleep hook runs right
    /// after the poll returns.
    ///
    /// Returns the number of events processed.
    pub fn process_events(&mut self, ctx: &mut C, flags: EventFlag) -> u32 {
        let mut processed = 0u32;

        // Nothing to do? return ASAP
        if !flags.contains_file_events() && !flags.contains_time_events() {
            return processed;
        }

        // Note that we want to call the poll even if there are no file
        // events to process as long as we want to process time events, in
        // order to sleep until the next time event is ready to fire.
        if self.max_fd != -1 || (flags.contains_time_events() && flags.is_waiting()) {
            let mut shortest: Option<u64> = None;
            if flags.contains_time_events() && flags.is_waiting() {
                shortest = self.search_nearest_timer();
            }
            let timeout_ms: Option<u64> = match shortest {
                // Time left for the nearest timer to fire.
                Some(when_ms) => Some(when_ms.saturating_sub(get_time_ms())),
                None => {
                    if !flags.is_waiting() {
                        Some(0)
                    } else {
                        None    // wait forever
                    }
                }
            };

            let num_events = self.api_data.poll(&mut self.fired, timeout_ms);

            if flags.calls_after_sleep() {
                if let Some(f) = self.after_sleep.clone() {
                    f(self, ctx);
                }
            }

            for j in 0..num_events as usize {
                let fd = self.fired[j].fd;
                let mask = self.fired[j].mask;

                // An already processed event may have removed an element
                // that fired and was not processed yet, so the slot mask is
                // checked against the fired mask before every call.
                let mut rfired: Option<FileProc<C>> = None;
                {
                    let fe = &self.events[fd as usize];
                    if fe.mask.is_readable() && mask.is_readable() {
                        rfired = fe.r_file_proc.clone();
                    }
                }
                if let Some(ref f) = rfired {
                    f(self, ctx, fd, mask);
                }

                // Re-read the slot: the read handler is free to mutate the
                // event table, including its own registration.
                let wproc = {
                    let fe = &self.events[fd as usize];
                    if fe.mask.is_writable() && mask.is_writable() {
                        fe.w_file_proc.clone()
                    } else {
                        None
                    }
                };
                if let Some(f) = wproc {
                    let same = rfired.as_ref().map_or(false, |r| Arc::ptr_eq(r, &f));
                    if !same {
                        f(self, ctx, fd, mask);
                    }
                }
                processed += 1;
            }
        }
        // Check time events
        if flags.contains_time_events() {
            processed += self.process_time_events(ctx);
        }

        processed
    }

    pub fn main(&mut self, ctx: &mut C) {
        self.stop = false;
        while !self.stop {
            if let Some(f) = self.before_sleep.clone() {
                f(self, ctx);
            }
            self.process_events(ctx, EventFlag::all_events() | EventFlag::call_after_sleep());
        }
    }

    pub fn set_before_sleep_proc(&mut self, before_sleep: Option<BeforeSleepProc<C>>) {
        self.before_sleep = before_sleep;
    }

    pub fn set_after_sleep_proc(&mut self, after_sleep: Option<BeforeSleepProc<C>>) {
        self.after_sleep = after_sleep;
    }

    pub fn get_api_name(&self) -> &'static str {
        ApiState::name()
    }

    /// Wait up to `milliseconds` until the given file descriptor becomes
    /// readable/writable. Error and hangup count as writability, like in
    /// the poll loop itself. Returns `Mask::None` on timeout.
    pub fn wait(fd: i32, mask: Mask, milliseconds: u64) -> Result<Mask, String> {
        let mut pfd: pollfd = unsafe { zeroed() };
        pfd.fd = fd;
        if mask.is_readable() {
            pfd.events |= POLLIN;
        }
        if mask.is_writable() {
            pfd.events |= POLLOUT;
        }

        let ret_val = unsafe { libc::poll(&mut pfd, 1, milliseconds.min(i32::MAX as u64) as i32) };
        if ret_val == -1 {
            return Err(format!("poll: {}", strerror()));
        }
        let mut ret_mask = Mask::None;
        if ret_val > 0 {
            if (pfd.revents & POLLIN) != 0 {
                ret_mask = ret_mask | Mask::Readable;
            }
            if (pfd.revents & POLLOUT) != 0 {
                ret_mask = ret_mask | Mask::Writable;
            }
            if (pfd.revents & POLLERR) != 0 {
                ret_mask = ret_mask | Mask::Writable;
            }
            if (pfd.revents & POLLHUP) != 0 {
                ret_mask = ret_mask | Mask::Writable;
            }
        }
        Ok(ret_mask)
    }

    #[cfg(test)]
    fn set_last_time(&mut self, secs: u64) {
        self.last_time = secs;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Default)]
    struct Trace {
        calls: Vec<String>,
    }

    fn pipe() -> (i32, i32) {
        let mut fds = [0i32; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        (fds[0], fds[1])
    }

    fn close(fd: i32) {
        unsafe {
            libc::close(fd);
        }
    }

    #[test]
    fn test_mask_disable() {
        let mut mask = Mask::ReadWritable;
        mask.disable(Mask::Readable);
        assert!(mask == Mask::Writable);

        mask.disable(Mask::None);
        assert!(mask == Mask::Writable);

        mask.disable(Mask::Writable);
        assert!(mask == Mask::None);
    }

    #[test]
    fn test_event_flags() {
        let flags = EventFlag::all_events() | EventFlag::call_after_sleep();
        assert!(flags.contains_file_events());
        assert!(flags.contains_time_events());
        assert!(flags.calls_after_sleep());
        assert!(flags.is_waiting());
        assert!((flags & EventFlag::dont_wait()) == EventFlag::none());

        let flags = EventFlag::file_events() | EventFlag::dont_wait();
        assert!(!flags.is_waiting());
        assert!(!flags.contains_time_events());
    }

    #[test]
    fn file_event_out_of_range() {
        let mut el: EventLoop<Trace> = EventLoop::create(16).unwrap();
        let proc: FileProc<Trace> = Arc::new(|_, _, _, _| {});
        assert!(el.create_file_event(16, Mask::Readable, proc).is_err());
    }

    #[test]
    fn file_event_round_trip_restores_state() {
        let mut el: EventLoop<Trace> = EventLoop::create(1024).unwrap();
        let (r, w) = pipe();
        let proc: FileProc<Trace> = Arc::new(|_, _, _, _| {});

        assert_eq!(el.max_fd, -1);
        el.create_file_event(r, Mask::Readable, proc.clone()).unwrap();
        assert!(el.get_file_events(r).is_readable());
        assert_eq!(el.max_fd, r);

        el.create_file_event(w, Mask::Writable, proc).unwrap();
        assert_eq!(el.max_fd, r.max(w));

        el.delete_file_event(w, Mask::Writable);
        el.delete_file_event(r, Mask::Readable);
        assert_eq!(el.get_file_events(r), Mask::None);
        assert_eq!(el.max_fd, -1);
        close(r);
        close(w);
    }

    #[test]
    fn readable_pipe_dispatches() {
        let mut el: EventLoop<Trace> = EventLoop::create(1024).unwrap();
        let mut trace = Trace::default();
        let (r, w) = pipe();

        el.create_file_event(r, Mask::Readable, Arc::new(|_el, ctx: &mut Trace, fd, _mask| {
            let mut buf = [0u8; 8];
            unsafe {
                libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len());
            }
            ctx.calls.push("read".to_string());
        })).unwrap();

        // Nothing ready yet
        let n = el.process_events(&mut trace, EventFlag::file_events() | EventFlag::dont_wait());
        assert_eq!(n, 0);

        unsafe {
            libc::write(w, b"x".as_ptr() as *const libc::c_void, 1);
        }
        let n = el.process_events(&mut trace, EventFlag::file_events() | EventFlag::dont_wait());
        assert_eq!(n, 1);
        assert_eq!(trace.calls, vec!["read"]);
        close(r);
        close(w);
    }

    #[test]
    fn read_runs_before_write_and_slot_is_reread() {
        let mut el: EventLoop<Trace> = EventLoop::create(1024).unwrap();
        let mut trace = Trace::default();

        let mut fds = [0i32; 2];
        assert_eq!(unsafe {
            libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr())
        }, 0);
        let (a, b) = (fds[0], fds[1]);
        unsafe {
            libc::write(b, b"x".as_ptr() as *const libc::c_void, 1);
        }

        // The read handler deletes the write registration of its own fd;
        // the dispatcher must notice and not call it.
        el.create_file_event(a, Mask::Readable, Arc::new(|el, ctx: &mut Trace, fd, _| {
            let mut buf = [0u8; 8];
            unsafe {
                libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len());
            }
            ctx.calls.push("read".to_string());
            el.delete_file_event(fd, Mask::Writable);
        })).unwrap();
        el.create_file_event(a, Mask::Writable, Arc::new(|_, ctx: &mut Trace, _, _| {
            ctx.calls.push("write".to_string());
        })).unwrap();

        el.process_events(&mut trace, EventFlag::file_events() | EventFlag::dont_wait());
        assert_eq!(trace.calls, vec!["read"]);
        assert_eq!(el.get_file_events(a), Mask::Readable);
        close(a);
        close(b);
    }

    #[test]
    fn time_event_fires_and_reschedules() {
        let mut el: EventLoop<Rc<RefCell<u32>>> = EventLoop::create(16).unwrap();
        let mut hits = Rc::new(RefCell::new(0u32));

        el.create_time_event(0, Arc::new(|_el, ctx: &mut Rc<RefCell<u32>>, _id| {
            *ctx.borrow_mut() += 1;
            if *ctx.borrow() < 2 { 0 } else { AE_NOMORE }
        }), None);

        let flags = EventFlag::time_events() | EventFlag::dont_wait();
        assert_eq!(el.process_events(&mut hits, flags), 1);
        assert_eq!(*hits.borrow(), 1);
        // Rescheduled with 0 ms delay: due again immediately.
        assert_eq!(el.process_events(&mut hits, flags), 1);
        assert_eq!(*hits.borrow(), 2);
        // Returned NOMORE: tombstoned, swept, never fired again.
        assert_eq!(el.process_events(&mut hits, flags), 0);
        assert!(el.time_events.is_empty());
    }

    #[test]
    fn deleted_time_event_runs_finalizer_once_and_never_fires() {
        let mut el: EventLoop<Trace> = EventLoop::create(16).unwrap();
        let mut trace = Trace::default();

        let id = el.create_time_event(0, Arc::new(|_, ctx: &mut Trace, _| {
            ctx.calls.push("fired".to_string());
            AE_NOMORE
        }), Some(Arc::new(|_, ctx: &mut Trace| {
            ctx.calls.push("finalized".to_string());
        })));

        el.delete_time_event(id).unwrap();
        assert!(el.delete_time_event(id).is_err());

        let flags = EventFlag::time_events() | EventFlag::dont_wait();
        el.process_events(&mut trace, flags);
        el.process_events(&mut trace, flags);
        assert_eq!(trace.calls, vec!["finalized"]);
    }

    #[test]
    fn time_event_ids_are_monotonic() {
        let mut el: EventLoop<Trace> = EventLoop::create(16).unwrap();
        let noop: TimeProc<Trace> = Arc::new(|_, _, _| AE_NOMORE);
        let a = el.create_time_event(1000, noop.clone(), None);
        let b = el.create_time_event(1000, noop.clone(), None);
        el.delete_time_event(a).unwrap();
        let c = el.create_time_event(1000, noop, None);
        assert!(a < b && b < c);
    }

    #[test]
    fn clock_skew_forces_all_timers_to_fire() {
        let mut el: EventLoop<Rc<RefCell<u32>>> = EventLoop::create(16).unwrap();
        let mut hits = Rc::new(RefCell::new(0u32));

        for _ in 0..2 {
            el.create_time_event(60_000, Arc::new(|_, ctx: &mut Rc<RefCell<u32>>, _| {
                *ctx.borrow_mut() += 1;
                AE_NOMORE
            }), None);
        }

        let flags = EventFlag::time_events() | EventFlag::dont_wait();
        assert_eq!(el.process_events(&mut hits, flags), 0);

        // Pretend the last observed wall clock was far in the future: the
        // sweep must treat the regression as skew and fire everything.
        el.set_last_time(timestamp().as_secs() + 3600);
        assert_eq!(el.process_events(&mut hits, flags), 2);
        assert_eq!(*hits.borrow(), 2);
    }

    #[test]
    fn resize_respects_registered_fds() {
        let mut el: EventLoop<Trace> = EventLoop::create(1024).unwrap();
        let (r, w) = pipe();
        let proc: FileProc<Trace> = Arc::new(|_, _, _, _| {});
        el.create_file_event(r, Mask::Readable, proc).unwrap();

        assert!(el.resize_set_size(r as usize).is_err());
        assert!(el.resize_set_size(2048).is_ok());
        assert_eq!(el.get_set_size(), 2048);
        assert!(el.get_file_events(r).is_readable());
        close(r);
        close(w);
    }

    #[test]
    fn wait_reports_readability() {
        let (r, w) = pipe();
        assert_eq!(EventLoop::<Trace>::wait(r, Mask::Readable, 0).unwrap(), Mask::None);
        unsafe {
            libc::write(w, b"x".as_ptr() as *const libc::c_void, 1);
        }
        let mask = EventLoop::<Trace>::wait(r, Mask::Readable, 100).unwrap();
        assert!(mask.is_readable());
        close(r);
        close(w);
    }

    #[test]
    fn api_name_is_reported() {
        let el: EventLoop<Trace> = EventLoop::create(16).unwrap();
        assert!(["epoll", "kqueue"].contains(&el.get_api_name()));
    }
}
