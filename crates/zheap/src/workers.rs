//! GC Workers - Parallel Task Execution
//!
//! Runs one task on a fixed number of named worker threads and waits for
//! all of them. Tasks split their work with shared atomic cursors, see
//! [`WorkCursor`].

use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

/// Fixed-size pool of scoped worker threads
#[derive(Debug, Clone, Copy)]
pub struct Workers {
    nworkers: usize,
}

impl Workers {
    pub fn new(nworkers: usize) -> Self {
        Self {
            nworkers: nworkers.max(1),
        }
    }

    pub fn nworkers(&self) -> usize {
        self.nworkers
    }

    /// Run `task(worker_id)` on every worker and wait for completion.
    ///
    /// If a thread cannot be spawned its share runs on the calling thread.
    pub fn run<F>(&self, name: &str, task: F)
    where
        F: Fn(usize) + Sync,
    {
        log::debug!("Running {} on {} workers", name, self.nworkers);
        let task = &task;

        thread::scope(|scope| {
            for id in 0..self.nworkers {
                let spawned = thread::Builder::new()
                    .name(format!("zheap-worker-{}", id))
                    .spawn_scoped(scope, move || task(id));

                if let Err(e) = spawned {
                    log::warn!("Failed to spawn worker {}: {}", id, e);
                    task(id);
                }
            }
        });
    }
}

/// Claims indices `0..len` one at a time across threads.
#[derive(Debug)]
pub struct WorkCursor {
    next: AtomicUsize,
    len: usize,
}

impl WorkCursor {
    pub fn new(len: usize) -> Self {
        Self {
            next: AtomicUsize::new(0),
            len,
        }
    }

    pub fn claim(&self) -> Option<usize> {
        let index = self.next.fetch_add(1, Ordering::Relaxed);
        (index < self.len).then_some(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn test_every_index_claimed_once() {
        let workers = Workers::new(4);
        let cursor = WorkCursor::new(1000);
        let claimed = Mutex::new(Vec::new());

        workers.run("test", |_| {
            while let Some(index) = cursor.claim() {
                claimed.lock().push(index);
            }
        });

        let mut claimed = claimed.into_inner();
        claimed.sort_unstable();
        assert_eq!(claimed, (0..1000).collect::<Vec<_>>());
    }

    #[test]
    fn test_worker_thread_names() {
        let names = Mutex::new(Vec::new());
        Workers::new(2).run("names", |_| {
            let name = thread::current().name().map(str::to_string);
            names.lock().push(name);
        });

        let mut names = names.into_inner();
        names.sort();
        assert_eq!(
            names,
            vec![
                Some("zheap-worker-0".to_string()),
                Some("zheap-worker-1".to_string())
            ]
        );
    }
}
