//! A fixed-size pool of detached worker threads draining a bounded FIFO of
//! tasks, scheduled with a mutex + condition variable.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use crate::log::{log, LogLevel};

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(0);

struct ThreadTask {
    id: u64,
    handler: Box<dyn FnOnce() + Send>,
}

enum Job {
    Task(ThreadTask),
    Exit(Arc<AtomicUsize>),
}

struct PoolShared {
    mtx: Mutex<VecDeque<Job>>,
    cond: Condvar,
}

pub struct ThreadPool {
    name: String,
    thread_count: usize,
    maxtasks: usize,
    shared: Arc<PoolShared>,
}

impl ThreadPool {
    pub fn create(name: &str, thread_count: usize, maxtasks: usize) -> ThreadPool {
        let tp = ThreadPool {
            name: name.to_string(),
            thread_count,
            maxtasks,
            shared: Arc::new(PoolShared { mtx: Mutex::new(VecDeque::new()), cond: Condvar::new() }),
        };
        for _ in 0..thread_count {
            let shared = tp.shared.clone();
            let pool_name = tp.name.clone();
            // Workers are detached: the JoinHandle is dropped and teardown
            // is coordinated through exit jobs instead.
            thread::spawn(move || thread_pool_cycle(&pool_name, &shared));
        }
        tp
    }

    /// Queue a task for the workers. Fails without blocking when the queue
    /// already holds `maxtasks` tasks.
    pub fn task_post(&self, handler: impl FnOnce() + Send + 'static) -> Result<u64, String> {
        let mut tasks = self.shared.mtx.lock().unwrap();
        let queued = tasks.iter().filter(|j| matches!(j, Job::Task(_))).count();
        if queued >= self.maxtasks {
            drop(tasks);
            log(LogLevel::Warning, &format!("thread pool \"{}\" queue overflow", self.name));
            return Err(format!("thread pool \"{}\" queue overflow", self.name));
        }

        let id = NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed);
        self.shared.cond.notify_one();
        tasks.push_back(Job::Task(ThreadTask { id, handler: Box::new(handler) }));
        drop(tasks);

        log(LogLevel::Debug, &format!("task #{} added to thread pool \"{}\"", id, self.name));
        Ok(id)
    }

    /// Stop the pool: one exit job per worker, then wait until the last
    /// worker has acknowledged. Tasks already queued ahead of the exit jobs
    /// still run to completion.
    pub fn destroy(self) {
        let remaining = Arc::new(AtomicUsize::new(self.thread_count));
        {
            let mut tasks = self.shared.mtx.lock().unwrap();
            for _ in 0..self.thread_count {
                tasks.push_back(Job::Exit(remaining.clone()));
            }
            self.shared.cond.notify_all();
        }
        while remaining.load(Ordering::Acquire) > 0 {
            thread::yield_now();
        }
    }
}

fn thread_pool_cycle(name: &str, shared: &PoolShared) {
    log(LogLevel::Debug, &format!("thread in pool \"{}\" started", name));

    // Block every asynchronous signal in the workers. The hardware-fault
    // signals stay unblocked so they are delivered to the offending thread.
    unsafe {
        let mut set: libc::sigset_t = std::mem::zeroed();
        libc::sigfillset(&mut set);
        libc::sigdelset(&mut set, libc::SIGILL);
        libc::sigdelset(&mut set, libc::SIGFPE);
        libc::sigdelset(&mut set, libc::SIGSEGV);
        libc::sigdelset(&mut set, libc::SIGBUS);
        if libc::pthread_sigmask(libc::SIG_BLOCK, &set, std::ptr::null_mut()) != 0 {
            log(LogLevel::Warning, "pthread_sigmask() failed");
            return;
        }
    }

    loop {
        let job = {
            let mut tasks = shared.mtx.lock().unwrap();
            while tasks.is_empty() {
                tasks = shared.cond.wait(tasks).unwrap();
            }
            tasks.pop_front().unwrap()
        };

        match job {
            Job::Task(task) => {
                log(LogLevel::Debug, &format!("run task #{} in thread pool \"{}\"", task.id, name));
                (task.handler)();
                log(LogLevel::Debug, &format!("complete task #{} in thread pool \"{}\"", task.id, name));
            }
            Job::Exit(remaining) => {
                remaining.fetch_sub(1, Ordering::Release);
                return;
            }
        }
    }
}
