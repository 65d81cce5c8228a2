// CLASSIFICATION: COMMUNITY
// Filename: workqueue.rs v0.1
// Author: Lukas Bower
// Date Modified: 2027-09-02

//! Fixed-size worker pool used for parallel segment loads.

use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use log::{debug, error};

type Job = Box<dyn FnOnce() + Send + 'static>;

pub struct WorkQueue {
    name: String,
    tx: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

/// Handle to one queued item.
pub struct Work<T> {
    rx: Receiver<T>,
}

impl<T> Work<T> {
    /// Wait for the item to finish. `None` if it panicked.
    pub fn flush(self) -> Option<T> {
        self.rx.recv().ok()
    }
}

impl WorkQueue {
    pub fn new(name: &str, threads: usize) -> io::Result<Self> {
        if threads == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "no worker threads"));
        }
        let (tx, rx) = unbounded::<Job>();
        let mut workers = Vec::with_capacity(threads);
        for i in 0..threads {
            let rx = rx.clone();
            let worker = thread::Builder::new()
                .name(format!("{name}/{i}"))
                .spawn(move || {
                    for job in rx.iter() {
                        if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                            error!("work item panicked");
                        }
                    }
                })?;
            workers.push(worker);
        }
        debug!("{name}: {threads} workers started");
        Ok(Self {
            name: name.into(),
            tx: Some(tx),
            workers,
        })
    }

    pub fn threads(&self) -> usize {
        self.workers.len()
    }

    /// Queue `f`. If the queue is shut down it runs on the caller's thread.
    pub fn queue<T, F>(&self, f: F) -> Work<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (done_tx, done_rx) = bounded(1);
        let job: Job = Box::new(move || {
            let _ = done_tx.send(f());
        });
        if let Some(tx) = &self.tx {
            if let Err(returned) = tx.send(job) {
                (returned.into_inner())();
            }
        } else {
            job();
        }
        Work { rx: done_rx }
    }
}

impl Drop for WorkQueue {
    fn drop(&mut self) {
        self.tx.take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
        debug!("{}: workers stopped", self.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn runs_all_items() {
        let wq = WorkQueue::new("pil_test", 3).unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let pending: Vec<_> = (0..10)
            .map(|i| {
                let hits = hits.clone();
                wq.queue(move || {
                    hits.fetch_add(1, Ordering::SeqCst);
                    i * 2
                })
            })
            .collect();
        let results: Vec<_> = pending.into_iter().map(|w| w.flush().unwrap()).collect();
        assert_eq!(results, (0..10).map(|i| i * 2).collect::<Vec<_>>());
        assert_eq!(hits.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn panicking_item_reports_none() {
        let wq = WorkQueue::new("pil_test", 1).unwrap();
        let bad = wq.queue(|| -> u32 { panic!("boom") });
        let good = wq.queue(|| 7u32);
        assert!(bad.flush().is_none());
        assert_eq!(good.flush(), Some(7));
    }

    #[test]
    fn zero_threads_rejected() {
        assert!(WorkQueue::new("pil_test", 0).is_err());
    }
}
