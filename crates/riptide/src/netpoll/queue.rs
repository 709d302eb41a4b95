//! Spinlock-protected queue of jobs submitted from foreign threads

use hive::spinlock::SpinLock;

pub(crate) struct AsyncJobQueue<J> {
    jobs: SpinLock<Vec<J>>,
}

impl<J> AsyncJobQueue<J> {
    pub(crate) fn new() -> Self {
        AsyncJobQueue {
            jobs: SpinLock::new(Vec::new()),
        }
    }

    /// Enqueue a job and return the new queue length. A return of 1 means
    /// the caller must fire the poller wakeup; later pushes coalesce.
    pub(crate) fn push(&self, job: J) -> usize {
        let mut jobs = self.jobs.lock();
        jobs.push(job);
        jobs.len()
    }

    /// Take the whole queue, leaving it empty.
    pub(crate) fn drain(&self) -> Vec<J> {
        std::mem::take(&mut *self.jobs.lock())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_reports_length() {
        let q = AsyncJobQueue::new();
        assert_eq!(q.push(1), 1);
        assert_eq!(q.push(2), 2);
        assert_eq!(q.drain(), vec![1, 2]);
        assert_eq!(q.push(3), 1);
    }
}
