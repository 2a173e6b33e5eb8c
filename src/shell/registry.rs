//! In-memory table of live process handles.
//!
//! The registry is the sole owner of handles. It is constructed once per
//! server instance and shared by reference, so tests get a fresh table
//! and nothing reaches for global state. A handle stays in the table
//! after the process exits naturally (status and captured output remain
//! queryable) and is removed only by an explicit, successful kill.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::process::ChildStdin;
use tokio::sync::{Notify, watch};

/// One captured output stream, capped at a byte budget.
///
/// The reader keeps draining the pipe past the cap (a full pipe would
/// block the child) but stops storing; `total_bytes` keeps counting so
/// truncation can be reported with the real size.
#[derive(Debug)]
pub struct StreamBuffer {
    data: Vec<u8>,
    cap: usize,
    total_bytes: u64,
}

impl StreamBuffer {
    fn new(cap: usize) -> Self {
        Self {
            data: Vec::new(),
            cap,
            total_bytes: 0,
        }
    }

    pub fn extend(&mut self, chunk: &[u8]) {
        self.total_bytes += chunk.len() as u64;
        let room = self.cap.saturating_sub(self.data.len());
        if room > 0 {
            let take = room.min(chunk.len());
            self.data.extend_from_slice(&chunk[..take]);
        }
    }

    pub fn is_truncated(&self) -> bool {
        self.total_bytes > self.data.len() as u64
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    /// Lossy string view of the stored bytes, with a marker when the
    /// stream was longer than the cap.
    pub fn to_display_string(&self) -> String {
        let mut out = String::from_utf8_lossy(&self.data).into_owned();
        if self.is_truncated() {
            out.push_str(&format!(
                "\n[output truncated, {} bytes total]",
                self.total_bytes
            ));
        }
        out
    }
}

/// Captured stdout and stderr of one child process.
#[derive(Debug)]
pub struct CapturedOutput {
    pub stdout: StreamBuffer,
    pub stderr: StreamBuffer,
}

/// The registry's record of a spawned child process.
///
/// The child itself is owned by the `execute` future that spawned it; the
/// handle carries the pieces other callers may touch concurrently: the
/// stdin pipe, the capped output buffers, the exit code, and the kill
/// signal relayed to the supervising future.
pub struct ProcessHandle {
    pub id: String,
    pub pid: Option<u32>,
    /// Write side of the child's stdin. Taken (set to `None`) once the
    /// process exits or the pipe breaks.
    pub stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    /// Capped stdout/stderr buffers, filled by the capture tasks.
    pub output: Mutex<CapturedOutput>,
    exit: watch::Sender<Option<i32>>,
    kill: Notify,
}

impl ProcessHandle {
    pub fn new(id: String, pid: Option<u32>, stdin: Option<ChildStdin>, output_cap: usize) -> Arc<Self> {
        let (exit, _) = watch::channel(None);
        Arc::new(Self {
            id,
            pid,
            stdin: tokio::sync::Mutex::new(stdin),
            output: Mutex::new(CapturedOutput {
                stdout: StreamBuffer::new(output_cap),
                stderr: StreamBuffer::new(output_cap),
            }),
            exit,
            kill: Notify::new(),
        })
    }

    /// Exit code, `None` while the process is still running.
    pub fn exit_code(&self) -> Option<i32> {
        *self.exit.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.exit_code().is_none()
    }

    /// Record the exit code and wake everyone waiting on it.
    pub(crate) fn set_exit(&self, code: i32) {
        let _ = self.exit.send(Some(code));
    }

    /// Ask the supervising future to terminate the child.
    pub fn request_kill(&self) {
        self.kill.notify_one();
    }

    /// Resolves when a kill has been requested.
    pub(crate) async fn kill_requested(&self) {
        self.kill.notified().await;
    }

    /// Wait until the process has exited. Returns immediately if it
    /// already has.
    pub async fn wait_exit(&self) -> i32 {
        let mut rx = self.exit.subscribe();
        // The sender lives inside the handle, so the channel cannot close
        // while we hold `&self`.
        match rx.wait_for(|code| code.is_some()).await {
            Ok(code) => (*code).unwrap_or(-1),
            Err(_) => -1,
        }
    }
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("id", &self.id)
            .field("pid", &self.pid)
            .field("exit_code", &self.exit_code())
            .finish()
    }
}

/// Concurrency-safe map from process id to handle.
///
/// All mutations go through a single lock, held only for the map
/// operation itself, so a remove racing a lookup never yields a handle in
/// a half-torn-down state.
#[derive(Clone, Default)]
pub struct ProcessRegistry {
    inner: Arc<Mutex<HashMap<String, Arc<ProcessHandle>>>>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, handle: Arc<ProcessHandle>) {
        let mut table = self.inner.lock().expect("process registry lock poisoned");
        table.insert(handle.id.clone(), handle);
    }

    /// Look up a handle. Unknown ids return `None`, never a fault.
    pub fn get(&self, id: &str) -> Option<Arc<ProcessHandle>> {
        let table = self.inner.lock().expect("process registry lock poisoned");
        table.get(id).cloned()
    }

    pub fn remove(&self, id: &str) -> Option<Arc<ProcessHandle>> {
        let mut table = self.inner.lock().expect("process registry lock poisoned");
        table.remove(id)
    }

    pub fn ids(&self) -> Vec<String> {
        let table = self.inner.lock().expect("process registry lock poisoned");
        table.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .expect("process registry lock poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
