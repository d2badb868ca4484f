//! Session management
//!
//! Owns the single subprocess-under-PTY, its bounded output buffer, and the
//! typed event stream every other component consumes. At most one session
//! exists at a time; starting while one runs is an error, not a queue.

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::source::{LaunchSpec, SourceControl, TermSource};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};

/// Bounded byte buffer holding the most recent subprocess output. Oldest
/// bytes are dropped once capacity is exceeded.
pub struct OutputBuffer {
    data: VecDeque<u8>,
    capacity: usize,
}

impl OutputBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            data: VecDeque::with_capacity(capacity.min(64 * 1024)),
            capacity,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.data.extend(chunk);
        if self.data.len() > self.capacity {
            let excess = self.data.len() - self.capacity;
            self.data.drain(..excess);
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    pub fn snapshot(&self) -> Vec<u8> {
        let (a, b) = self.data.as_slices();
        let mut out = Vec::with_capacity(self.data.len());
        out.extend_from_slice(a);
        out.extend_from_slice(b);
        out
    }
}

/// Typed session events, replacing ad-hoc string event names with a fixed
/// enum so ordering guarantees are explicit.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Started {
        command: String,
        args: Vec<String>,
        working_dir: Option<String>,
    },
    /// One output chunk, already appended to the buffer before publication.
    /// `seq` is assigned under the session lock, so a snapshot's `last_seq`
    /// tells exactly which chunks its buffer already contains.
    Data { seq: u64, chunk: Vec<u8> },
    Exited {
        exit_code: Option<i32>,
        signal: Option<i32>,
    },
}

/// Point-in-time view for late joiners.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub running: bool,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub buffer: Vec<u8>,
    /// Sequence number of the newest chunk included in `buffer`.
    pub last_seq: u64,
    pub cols: u16,
    pub rows: u16,
}

struct Inner {
    running: bool,
    exit_code: Option<i32>,
    signal: Option<i32>,
    cols: u16,
    rows: u16,
    buffer: OutputBuffer,
    control: Option<Box<dyn SourceControl>>,
    /// Bumped on every start so stale pump tasks cannot touch a new
    /// session's buffer.
    epoch: u64,
    /// Chunk counter, monotonic across restarts.
    seq: u64,
}

pub struct SessionManager {
    inner: Mutex<Inner>,
    events: broadcast::Sender<SessionEvent>,
    kill_grace: Duration,
}

impl SessionManager {
    pub fn new(config: &EngineConfig) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            inner: Mutex::new(Inner {
                running: false,
                exit_code: None,
                signal: None,
                cols: config.cols,
                rows: config.rows,
                buffer: OutputBuffer::new(config.buffer_capacity),
                control: None,
                epoch: 0,
                seq: 0,
            }),
            events,
            kill_grace: Duration::from_secs(config.kill_grace_secs),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub async fn is_running(&self) -> bool {
        self.inner.lock().await.running
    }

    pub async fn snapshot(&self) -> SessionSnapshot {
        let inner = self.inner.lock().await;
        SessionSnapshot {
            running: inner.running,
            exit_code: inner.exit_code,
            signal: inner.signal,
            buffer: inner.buffer.snapshot(),
            last_seq: inner.seq,
            cols: inner.cols,
            rows: inner.rows,
        }
    }

    /// Start a new session. Fails with `AlreadyRunning` while one is active;
    /// on spawn failure the session stays inactive.
    pub async fn start(
        self: &Arc<Self>,
        source: &dyn TermSource,
        spec: LaunchSpec,
    ) -> Result<(), EngineError> {
        let mut inner = self.inner.lock().await;
        if inner.running {
            return Err(EngineError::AlreadyRunning);
        }

        let spawned = source.spawn(&spec, inner.cols, inner.rows)?;

        inner.buffer.clear();
        inner.exit_code = None;
        inner.signal = None;
        inner.running = true;
        inner.control = Some(spawned.control);
        inner.epoch += 1;
        let epoch = inner.epoch;
        drop(inner);

        tracing::info!(command = %spec.command, "Session started");
        let _ = self.events.send(SessionEvent::Started {
            command: spec.command.clone(),
            args: spec.args.clone(),
            working_dir: spec.working_dir.as_ref().map(|p| p.display().to_string()),
        });

        // Pump: buffer first, then publish, so a snapshot taken between the
        // two is never missing a chunk that consumers later receive.
        let manager = Arc::clone(self);
        let mut output_rx = spawned.output_rx;
        tokio::spawn(async move {
            while let Some(chunk) = output_rx.recv().await {
                let seq = {
                    let mut inner = manager.inner.lock().await;
                    if inner.epoch != epoch {
                        break;
                    }
                    inner.buffer.push(&chunk);
                    inner.seq += 1;
                    inner.seq
                };
                let _ = manager.events.send(SessionEvent::Data { seq, chunk });
            }
        });

        // Exit watcher: the running flag flips here, on the subprocess's own
        // exit notification, never on the kill request.
        let manager = Arc::clone(self);
        let exit_rx = spawned.exit_rx;
        tokio::spawn(async move {
            let exit = exit_rx.await.ok();
            let (exit_code, signal) = exit
                .map(|e| (e.exit_code, e.signal))
                .unwrap_or((None, None));

            {
                let mut inner = manager.inner.lock().await;
                if inner.epoch != epoch {
                    return;
                }
                inner.running = false;
                inner.exit_code = exit_code;
                inner.signal = signal;
                inner.control = None;
            }

            tracing::info!(?exit_code, ?signal, "Session exited");
            let _ = manager
                .events
                .send(SessionEvent::Exited { exit_code, signal });
        });

        Ok(())
    }

    /// Forward bytes to the subprocess input. No backpressure here; the
    /// PTY's flow control governs pacing.
    pub async fn write(&self, bytes: &[u8]) -> Result<(), EngineError> {
        let mut inner = self.inner.lock().await;
        if !inner.running {
            return Err(EngineError::NotRunning);
        }
        match inner.control.as_mut() {
            Some(control) => {
                control.write(bytes)?;
                Ok(())
            }
            None => Err(EngineError::NotRunning),
        }
    }

    /// Update geometry. Propagates to the PTY when running; otherwise only
    /// the stored defaults for the next start change.
    pub async fn resize(&self, cols: u16, rows: u16) -> Result<(), EngineError> {
        let mut inner = self.inner.lock().await;
        inner.cols = cols;
        inner.rows = rows;
        if inner.running {
            if let Some(control) = inner.control.as_mut() {
                control.resize(cols, rows)?;
            }
        }
        Ok(())
    }

    /// Request termination. Idempotent when not running. If the subprocess
    /// ignores the signal past the grace period, it is killed forcibly.
    pub async fn kill(self: &Arc<Self>) -> Result<(), EngineError> {
        let epoch = {
            let mut inner = self.inner.lock().await;
            if !inner.running {
                return Ok(());
            }
            if let Some(control) = inner.control.as_mut() {
                control.terminate()?;
            }
            inner.epoch
        };

        let manager = Arc::clone(self);
        let grace = self.kill_grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let mut inner = manager.inner.lock().await;
            if inner.running && inner.epoch == epoch {
                tracing::warn!("Session ignored terminate; killing forcibly");
                if let Some(control) = inner.control.as_mut() {
                    let _ = control.force_kill();
                }
            }
        });

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{ScriptSource, ScriptStep};

    fn spec() -> LaunchSpec {
        LaunchSpec {
            command: "mock".to_string(),
            args: vec![],
            working_dir: None,
            env: vec![],
        }
    }

    fn manager() -> Arc<SessionManager> {
        Arc::new(SessionManager::new(&EngineConfig::default()))
    }

    #[test]
    fn test_buffer_exact_below_capacity() {
        let mut buf = OutputBuffer::new(16);
        buf.push(b"hello ");
        buf.push(b"world");
        assert_eq!(buf.snapshot(), b"hello world");
    }

    #[test]
    fn test_buffer_keeps_suffix_over_capacity() {
        let mut buf = OutputBuffer::new(8);
        buf.push(b"0123456789");
        assert_eq!(buf.snapshot(), b"23456789");
        buf.push(b"ab");
        assert_eq!(buf.snapshot(), b"456789ab");
        assert_eq!(buf.len(), 8);
    }

    #[test]
    fn test_buffer_single_oversized_chunk() {
        let mut buf = OutputBuffer::new(4);
        buf.push(b"abcdefgh");
        assert_eq!(buf.snapshot(), b"efgh");
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let manager = manager();
        let source = ScriptSource::new(vec![ScriptStep::WaitForInput {
            prompt: b"? ".to_vec(),
        }]);
        manager.start(&source, spec()).await.unwrap();
        let err = manager.start(&source, spec()).await.unwrap_err();
        assert!(matches!(err, EngineError::AlreadyRunning));
    }

    #[tokio::test]
    async fn test_write_without_session_fails() {
        let manager = manager();
        let err = manager.write(b"y\r").await.unwrap_err();
        assert!(matches!(err, EngineError::NotRunning));
    }

    #[tokio::test]
    async fn test_output_lands_in_buffer_before_event() {
        let manager = manager();
        let source = ScriptSource::new(vec![
            ScriptStep::Emit {
                delay: Duration::from_millis(10),
                bytes: b"chunk-one".to_vec(),
            },
            ScriptStep::WaitForInput {
                prompt: b"? ".to_vec(),
            },
        ]);

        let mut events = manager.subscribe();
        manager.start(&source, spec()).await.unwrap();

        loop {
            match events.recv().await.unwrap() {
                SessionEvent::Data { seq, chunk } => {
                    let snap = manager.snapshot().await;
                    let text = String::from_utf8_lossy(&snap.buffer).to_string();
                    assert!(text.contains("chunk-one"));
                    assert_eq!(chunk, b"chunk-one");
                    assert!(snap.last_seq >= seq);
                    break;
                }
                SessionEvent::Started { .. } => continue,
                other => panic!("unexpected event: {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_snapshot_seq_identifies_buffered_chunks() {
        let manager = manager();
        let source = ScriptSource::new(vec![
            ScriptStep::Emit {
                delay: Duration::from_millis(5),
                bytes: b"one".to_vec(),
            },
            ScriptStep::Emit {
                delay: Duration::from_millis(5),
                bytes: b"two".to_vec(),
            },
            ScriptStep::Emit {
                delay: Duration::from_millis(5),
                bytes: b"three".to_vec(),
            },
        ]);

        let mut events = manager.subscribe();
        manager.start(&source, spec()).await.unwrap();

        // Take a snapshot mid-stream, then collect every chunk. The snapshot
        // buffer must equal exactly the chunks with seq <= last_seq, so a
        // consumer resuming from last_seq never duplicates or loses a chunk.
        let mut snap = None;
        let mut chunks = Vec::new();
        loop {
            match events.recv().await.unwrap() {
                SessionEvent::Data { seq, chunk } => {
                    chunks.push((seq, chunk));
                    if chunks.len() == 2 && snap.is_none() {
                        snap = Some(manager.snapshot().await);
                    }
                }
                SessionEvent::Exited { .. } => break,
                SessionEvent::Started { .. } => continue,
            }
        }

        let snap = snap.unwrap();
        let expected: Vec<u8> = chunks
            .iter()
            .filter(|(seq, _)| *seq <= snap.last_seq)
            .flat_map(|(_, chunk)| chunk.clone())
            .collect();
        assert_eq!(snap.buffer, expected);
    }

    #[tokio::test]
    async fn test_exit_recorded_and_restart_allowed() {
        let manager = manager();
        let source = ScriptSource::new(vec![ScriptStep::Emit {
            delay: Duration::from_millis(5),
            bytes: b"bye".to_vec(),
        }]);

        let mut events = manager.subscribe();
        manager.start(&source, spec()).await.unwrap();

        loop {
            if let SessionEvent::Exited { exit_code, .. } = events.recv().await.unwrap() {
                assert_eq!(exit_code, Some(0));
                break;
            }
        }

        let snap = manager.snapshot().await;
        assert!(!snap.running);
        assert_eq!(snap.exit_code, Some(0));

        // A new session may start after exit
        manager.start(&source, spec()).await.unwrap();
    }

    #[tokio::test]
    async fn test_kill_is_idempotent_when_not_running() {
        let manager = manager();
        manager.kill().await.unwrap();
        manager.kill().await.unwrap();
    }

    #[tokio::test]
    async fn test_resize_when_idle_updates_defaults() {
        let manager = manager();
        manager.resize(100, 40).await.unwrap();
        let snap = manager.snapshot().await;
        assert_eq!((snap.cols, snap.rows), (100, 40));
    }
}
