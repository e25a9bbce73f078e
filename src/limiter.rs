use std::sync::Mutex;
use std::thread;

pub type Task<'a, E> = Box<dyn FnOnce() -> Result<(), E> + Send + 'a>;

/// Runs a list of fallible tasks with at most `limit` running at once.
/// The first error stops the remaining queue and is returned.
#[derive(Debug, Clone, Copy)]
pub struct ConcurrencyLimiter {
    limit: usize,
}

impl ConcurrencyLimiter {
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
        }
    }

    pub fn run<E: Send>(&self, tasks: Vec<Task<'_, E>>) -> Result<(), E> {
        if tasks.is_empty() {
            return Ok(());
        }

        let workers = self.limit.min(tasks.len());
        let queue = Mutex::new(tasks.into_iter());
        let failure: Mutex<Option<E>> = Mutex::new(None);

        thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| {
                    loop {
                        let task = {
                            let mut queue = queue.lock().unwrap_or_else(|e| e.into_inner());
                            queue.next()
                        };
                        let Some(task) = task else {
                            break;
                        };
                        {
                            let failed = failure.lock().unwrap_or_else(|e| e.into_inner());
                            if failed.is_some() {
                                break;
                            }
                        }
                        if let Err(err) = task() {
                            let mut failed = failure.lock().unwrap_or_else(|e| e.into_inner());
                            failed.get_or_insert(err);
                            break;
                        }
                    }
                });
            }
        });

        match failure.into_inner().unwrap_or_else(|e| e.into_inner()) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
