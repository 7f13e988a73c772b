use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Default)]
struct LogBuffer {
    pending: Vec<String>,
    flushed: Vec<String>,
}

/// A diagnostic logger owned by one task.
///
/// Lines are buffered while the session runs and only reach `tracing` when
/// the log is flushed, so the output of a task stays together. Clones share
/// the same buffer, which lets transforms built by the task keep logging
/// after construction is over.
#[derive(Debug, Clone)]
pub struct TaskLog {
    task: &'static str,
    inner: Arc<Mutex<LogBuffer>>,
}

impl TaskLog {
    pub fn new(task: &'static str) -> Self {
        Self {
            task,
            inner: Arc::default(),
        }
    }

    pub fn task(&self) -> &'static str {
        self.task
    }

    pub fn line(&self, line: impl Into<String>) {
        self.lock().pending.push(line.into());
    }

    /// Emits every buffered line as an event and returns how many there were.
    pub fn flush(&self) -> usize {
        let mut buffer = self.lock();
        let pending = std::mem::take(&mut buffer.pending);

        for line in &pending {
            tracing::info!(task = self.task, "{line}");
        }

        let count = pending.len();
        buffer.flushed.extend(pending);
        count
    }

    /// Every line flushed so far.
    pub fn lines(&self) -> Vec<String> {
        self.lock().flushed.clone()
    }

    // A panicking transform must not take the log down with it.
    fn lock(&self) -> MutexGuard<'_, LogBuffer> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}
