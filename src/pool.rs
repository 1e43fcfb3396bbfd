//! Bounded worker pool.
//!
//! The event loop owns every data structure; workers exist only to run
//! destructors of large detached values off the hot path. Jobs must not
//! touch the database, timers, or AOF state.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use tracing::debug;

type Job = Box<dyn FnOnce() + Send + 'static>;

struct Queue {
    jobs: VecDeque<Job>,
    shutdown: bool,
}

pub struct ThreadPool {
    workers: Vec<thread::JoinHandle<()>>,
    queue: Arc<(Mutex<Queue>, Condvar)>,
}

impl ThreadPool {
    pub fn new(num_threads: usize) -> Self {
        let queue = Arc::new((
            Mutex::new(Queue {
                jobs: VecDeque::new(),
                shutdown: false,
            }),
            Condvar::new(),
        ));
        let workers = (0..num_threads)
            .map(|i| {
                let queue = queue.clone();
                thread::Builder::new()
                    .name(format!("worker-{i}"))
                    .spawn(move || worker_loop(&queue))
                    .expect("spawn worker thread")
            })
            .collect();
        Self { workers, queue }
    }

    pub fn submit<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let (lock, cvar) = &*self.queue;
        let mut q = lock.lock().unwrap();
        q.jobs.push_back(Box::new(job));
        cvar.notify_one();
    }

    /// Signal the workers and join them. Queued jobs are drained first.
    pub fn shutdown(self) {
        {
            let (lock, cvar) = &*self.queue;
            lock.lock().unwrap().shutdown = true;
            cvar.notify_all();
        }
        for handle in self.workers {
            let _ = handle.join();
        }
        debug!("worker pool stopped");
    }
}

fn worker_loop(queue: &(Mutex<Queue>, Condvar)) {
    let (lock, cvar) = queue;
    loop {
        let job = {
            let mut q = lock.lock().unwrap();
            loop {
                if let Some(job) = q.jobs.pop_front() {
                    break job;
                }
                if q.shutdown {
                    return;
                }
                q = cvar.wait(q).unwrap();
            }
        };
        job();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn runs_submitted_jobs() {
        let pool = ThreadPool::new(4);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..64 {
            let counter = counter.clone();
            pool.submit(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        pool.shutdown();
        assert_eq!(counter.load(Ordering::SeqCst), 64);
    }

    #[test]
    fn shutdown_with_empty_queue_returns() {
        let pool = ThreadPool::new(2);
        pool.shutdown();
    }
}
