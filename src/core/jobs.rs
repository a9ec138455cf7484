//! Background read jobs
//!
//! A fixed pool of worker threads pulls jobs from a `crossbeam` channel.
//! Every job carries a [`JobTicket`]:
//!
//! ```text
//! Queued ──start──▶ Running ──finish──▶ Done
//!    └────cancel──▶ Cancelled
//! ```
//!
//! [`JobTicket::cancel`] is synchronous: once it returns the job either will
//! never run or has already finished.

use crate::core::error::Result;
use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Queued,
    Running,
    Done,
    Cancelled,
}

/// Shared state of one submitted job
#[derive(Debug)]
pub struct JobTicket {
    id: u64,
    state: Mutex<JobState>,
    changed: Condvar,
}

impl JobTicket {
    fn new(id: u64, state: JobState) -> Self {
        JobTicket {
            id,
            state: Mutex::new(state),
            changed: Condvar::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> JobState {
        *self.state.lock()
    }

    /// Prevent the job from running, waiting for it if it already started
    ///
    /// Returns `true` if the job never ran.
    pub fn cancel(&self) -> bool {
        let mut state = self.state.lock();
        loop {
            match *state {
                JobState::Queued => {
                    *state = JobState::Cancelled;
                    self.changed.notify_all();
                    return true;
                }
                JobState::Running => self.changed.wait(&mut state),
                JobState::Done => return false,
                JobState::Cancelled => return true,
            }
        }
    }

    /// Block until the job is done or cancelled
    pub fn wait(&self) -> JobState {
        let mut state = self.state.lock();
        while matches!(*state, JobState::Queued | JobState::Running) {
            self.changed.wait(&mut state);
        }
        *state
    }

    fn try_start(&self) -> bool {
        let mut state = self.state.lock();
        if *state == JobState::Queued {
            *state = JobState::Running;
            true
        } else {
            false
        }
    }

    fn finish(&self) {
        *self.state.lock() = JobState::Done;
        self.changed.notify_all();
    }
}

type Work = Box<dyn FnOnce() + Send + 'static>;

struct QueuedJob {
    ticket: Arc<JobTicket>,
    work: Work,
}

/// Fixed-size worker pool for read jobs
pub struct ReadJobPool {
    sender: Mutex<Option<Sender<QueuedJob>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    next_id: AtomicU64,
}

impl ReadJobPool {
    pub fn new(threads: usize) -> Result<Self> {
        let (sender, receiver) = unbounded::<QueuedJob>();
        let mut workers = Vec::with_capacity(threads);
        for i in 0..threads.max(1) {
            let receiver = receiver.clone();
            let handle = thread::Builder::new()
                .name(format!("pakfs-read-{}", i))
                .spawn(move || worker_loop(receiver))?;
            workers.push(handle);
        }
        debug!("Started {} read workers", workers.len());

        Ok(ReadJobPool {
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
            next_id: AtomicU64::new(1),
        })
    }

    /// Queue `work`; after shutdown the ticket comes back already cancelled
    pub fn submit<F>(&self, work: F) -> Arc<JobTicket>
    where
        F: FnOnce() + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let ticket = Arc::new(JobTicket::new(id, JobState::Queued));
        let job = QueuedJob {
            ticket: Arc::clone(&ticket),
            work: Box::new(work),
        };

        let sent = match self.sender.lock().as_ref() {
            Some(sender) => sender.send(job).is_ok(),
            None => false,
        };
        if !sent {
            ticket.cancel();
        }
        ticket
    }

    /// Stop accepting jobs, drain the queue and join the workers
    pub fn shutdown(&self) {
        self.sender.lock().take();
        let workers = std::mem::take(&mut *self.workers.lock());
        let current = thread::current().id();
        for handle in workers {
            // A job can hold the last owner of the pool
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                warn!("Read worker exited with a panic");
            }
        }
    }
}

impl Drop for ReadJobPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(receiver: Receiver<QueuedJob>) {
    for job in receiver.iter() {
        if !job.ticket.try_start() {
            continue;
        }
        if catch_unwind(AssertUnwindSafe(job.work)).is_err() {
            warn!("Read job {} panicked", job.ticket.id());
        }
        job.ticket.finish();
    }
}
