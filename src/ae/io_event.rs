//!
//! I/O Multiplexing of the event loop.
//!
//! One readiness backend is compiled in per target: epoll on Linux, kqueue
//! on macOS. Both expose the same narrow surface to `EventLoop`:
//! create/add/del/poll/resize/name.

#[cfg(target_os = "linux")]
pub mod io_api {
    use std::mem::zeroed;

    use libc::{
        close, epoll_create1, epoll_ctl, epoll_event, epoll_wait, EPOLLERR, EPOLLHUP, EPOLLIN,
        EPOLLOUT, EPOLL_CTL_ADD, EPOLL_CTL_DEL, EPOLL_CTL_MOD,
    };

    use crate::ae::{FiredEvent, Mask};
    use crate::util::strerror;

    pub struct ApiState {
        epfd: i32,
        events: Vec<epoll_event>,
    }

    impl ApiState {
        pub fn create(setsize: usize) -> Result<ApiState, String> {
            let epfd = unsafe { epoll_create1(0) };
            if epfd == -1 {
                return Err(format!("epoll_create1: {}", strerror()));
            }
            Ok(ApiState { epfd, events: vec![unsafe { zeroed() }; setsize] })
        }

        pub fn resize(&mut self, setsize: usize) {
            self.events.resize(setsize, unsafe { zeroed() });
        }

        pub fn add_event(&self, fd: i32, old: Mask, mask: Mask) -> Result<(), String> {
            // If the fd was already monitored for some event, we need a MOD
            // operation. Otherwise we need an ADD operation.
            let op = match old {
                Mask::None => EPOLL_CTL_ADD,
                _ => EPOLL_CTL_MOD,
            };

            let merged = old | mask;
            let mut ee: epoll_event = unsafe { zeroed() };
            if merged.is_readable() {
                ee.events |= EPOLLIN as u32;
            }
            if merged.is_writable() {
                ee.events |= EPOLLOUT as u32;
            }
            ee.u64 = fd as u64;
            unsafe {
                if epoll_ctl(self.epfd, op, fd, &mut ee) == -1 {
                    return Err(format!("ApiState.add_event: {}", strerror()));
                }
            }
            Ok(())
        }

        pub fn del_event(&self, fd: i32, old: Mask, delmask: Mask) -> Result<(), String> {
            let mut remaining = old;
            remaining.disable(delmask);

            let mut ee: epoll_event = unsafe { zeroed() };
            if remaining.is_readable() {
                ee.events |= EPOLLIN as u32;
            }
            if remaining.is_writable() {
                ee.events |= EPOLLOUT as u32;
            }
            ee.u64 = fd as u64;
            let ret = unsafe {
                match remaining {
                    // Note, Kernel < 2.6.9 requires a non null event pointer
                    // even for EPOLL_CTL_DEL.
                    Mask::None => epoll_ctl(self.epfd, EPOLL_CTL_DEL, fd, &mut ee),
                    _ => epoll_ctl(self.epfd, EPOLL_CTL_MOD, fd, &mut ee),
                }
            };
            if ret == -1 {
                return Err(format!("ApiState.del_event: {}", strerror()));
            }
            Ok(())
        }

        pub fn poll(&mut self, fired: &mut [FiredEvent], timeout_ms: Option<u64>) -> i32 {
            let timeout = match timeout_ms {
                Some(ms) => ms.min(i32::MAX as u64) as i32,
                None => -1,
            };
            let ret = unsafe {
                epoll_wait(self.epfd, self.events.as_mut_ptr(), self.events.len() as i32, timeout)
            };
            if ret <= 0 {
                return 0;
            }

            for j in 0..ret as usize {
                let e = &self.events[j];
                let mut mask = Mask::None;
                if (e.events & EPOLLIN as u32) != 0 {
                    mask = mask | Mask::Readable;
                }
                if (e.events & EPOLLOUT as u32) != 0 {
                    mask = mask | Mask::Writable;
                }
                // Error and hangup surface as writability so the write
                // handler observes the failure and closes the connection.
                if (e.events & EPOLLERR as u32) != 0 {
                    mask = mask | Mask::Writable;
                }
                if (e.events & EPOLLHUP as u32) != 0 {
                    mask = mask | Mask::Writable;
                }
                fired[j].fd = e.u64 as i32;
                fired[j].mask = mask;
            }
            ret
        }

        pub fn name() -> &'static str {
            "epoll"
        }
    }

    impl Drop for ApiState {
        fn drop(&mut self) {
            unsafe {
                close(self.epfd);
            }
        }
    }
}

#[cfg(target_os = "macos")]
pub mod io_api {
    use std::mem::zeroed;
    use std::ptr::{null, null_mut};

    use libc::{close, kevent, kqueue, timespec, EVFILT_READ, EVFILT_WRITE, EV_ADD, EV_DELETE};

    use crate::ae::{FiredEvent, Mask};
    use crate::util::strerror;

    pub struct ApiState {
        kqfd: i32,
        events: Vec<kevent>,
    }

    impl ApiState {
        pub fn create(setsize: usize) -> Result<ApiState, String> {
            let kqfd = unsafe { kqueue() };
            if kqfd == -1 {
                return Err(format!("kqueue: {}", strerror()));
            }
            Ok(ApiState { kqfd, events: vec![unsafe { zeroed() }; setsize] })
        }

        pub fn resize(&mut self, setsize: usize) {
            self.events.resize(setsize, unsafe { zeroed() });
        }

        fn change(&self, fd: i32, filter: i16, flags: u16) -> Result<(), String> {
            let ke = kevent {
                ident: fd as usize,
                filter,
                flags,
                fflags: 0,
                data: 0,
                udata: null_mut(),
            };
            unsafe {
                if kevent(self.kqfd, &ke, 1, null_mut(), 0, null()) == -1 {
                    return Err(format!("kevent: {}", strerror()));
                }
            }
            Ok(())
        }

        pub fn add_event(&self, fd: i32, _old: Mask, mask: Mask) -> Result<(), String> {
            // kqueue keeps one registration per filter, so each mask bit is
            // registered on its own.
            if mask.is_readable() {
                self.change(fd, EVFILT_READ, EV_ADD)?;
            }
            if mask.is_writable() {
                self.change(fd, EVFILT_WRITE, EV_ADD)?;
            }
            Ok(())
        }

        pub fn del_event(&self, fd: i32, _old: Mask, delmask: Mask) -> Result<(), String> {
            if delmask.is_readable() {
                self.change(fd, EVFILT_READ, EV_DELETE)?;
            }
            if delmask.is_writable() {
                self.change(fd, EVFILT_WRITE, EV_DELETE)?;
            }
            Ok(())
        }

        pub fn poll(&mut self, fired: &mut [FiredEvent], timeout_ms: Option<u64>) -> i32 {
            let ret = match timeout_ms {
                Some(ms) => {
                    let timeout = timespec {
                        tv_sec: (ms / 1000) as i64,
                        tv_nsec: ((ms % 1000) * 1_000_000) as i64,
                    };
                    unsafe {
                        kevent(self.kqfd, null(), 0, self.events.as_mut_ptr(),
                               self.events.len() as i32, &timeout)
                    }
                }
                None => unsafe {
                    kevent(self.kqfd, null(), 0, self.events.as_mut_ptr(),
                           self.events.len() as i32, null())
                },
            };
            if ret <= 0 {
                return 0;
            }

            for j in 0..ret as usize {
                let e = &self.events[j];
                let mut mask = Mask::None;
                if e.filter == EVFILT_READ {
                    mask = mask | Mask::Readable;
                }
                if e.filter == EVFILT_WRITE {
                    mask = mask | Mask::Writable;
                }
                fired[j].fd = e.ident as i32;
                fired[j].mask = mask;
            }
            ret
        }

        pub fn name() -> &'static str {
            "kqueue"
        }
    }

    impl Drop for ApiState {
        fn drop(&mut self) {
            unsafe {
                close(self.kqfd);
            }
        }
    }
}
