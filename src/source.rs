//! Terminal data sources
//!
//! The session manager drives a subprocess through the `TermSource` trait so
//! the real PTY backend and the scripted mock backend are interchangeable.

use crate::error::EngineError;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// What to launch and where.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub command: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

/// How a source's subprocess ended.
#[derive(Debug, Clone, Copy)]
pub struct SourceExit {
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
}

/// Control half of a spawned source.
pub trait SourceControl: Send {
    /// Forward bytes to the subprocess's input side. No backpressure: the
    /// PTY's own flow control governs pacing.
    fn write(&mut self, bytes: &[u8]) -> std::io::Result<()>;
    fn resize(&mut self, cols: u16, rows: u16) -> std::io::Result<()>;
    /// Request termination (SIGTERM on Unix). The session is only considered
    /// dead once the exit notification fires.
    fn terminate(&mut self) -> std::io::Result<()>;
    /// Forced kill, used when `terminate` is ignored past the grace period.
    fn force_kill(&mut self) -> std::io::Result<()>;
}

/// A spawned source: its output stream, control half, and exit notification.
pub struct SpawnedSource {
    pub output_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    pub control: Box<dyn SourceControl>,
    pub exit_rx: oneshot::Receiver<SourceExit>,
}

pub trait TermSource: Send + Sync {
    fn spawn(&self, spec: &LaunchSpec, cols: u16, rows: u16)
        -> Result<SpawnedSource, EngineError>;
}

// ---------- Real PTY source ----------

/// Spawns the command under a pseudo-terminal via portable-pty.
pub struct PtySource;

/// Resolve a command to its full path: absolute paths pass through, anything
/// else goes through PATH lookup.
fn resolve_command(cmd: &str) -> Option<String> {
    if std::path::Path::new(cmd).is_absolute() && std::path::Path::new(cmd).exists() {
        return Some(cmd.to_string());
    }
    which::which(cmd)
        .ok()
        .map(|p| p.to_string_lossy().to_string())
}

impl TermSource for PtySource {
    fn spawn(
        &self,
        spec: &LaunchSpec,
        cols: u16,
        rows: u16,
    ) -> Result<SpawnedSource, EngineError> {
        use portable_pty::{native_pty_system, CommandBuilder, PtySize};

        let cmd_path = resolve_command(&spec.command)
            .ok_or_else(|| EngineError::Spawn(format!("command not found: {}", spec.command)))?;

        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| EngineError::Spawn(e.to_string()))?;

        let mut cmd = CommandBuilder::new(&cmd_path);
        cmd.args(&spec.args);
        if let Some(ref dir) = spec.working_dir {
            cmd.cwd(dir);
        }
        // CommandBuilder starts from an empty environment
        for (key, value) in std::env::vars() {
            cmd.env(key, value);
        }
        cmd.env("TERM", "xterm-256color");
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }

        let mut child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| EngineError::Spawn(e.to_string()))?;
        drop(pair.slave);

        let pid = child.process_id();
        let killer = child.clone_killer();

        let master = pair.master;
        let mut reader = master
            .try_clone_reader()
            .map_err(|e| EngineError::Spawn(e.to_string()))?;
        let mut writer = master
            .take_writer()
            .map_err(|e| EngineError::Spawn(e.to_string()))?;

        // Blocking reader thread; ends on EOF when the child exits.
        let (output_tx, output_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        std::thread::spawn(move || {
            let mut buf = [0u8; 4096];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if output_tx.send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        if e.kind() != std::io::ErrorKind::Interrupted {
                            break;
                        }
                    }
                }
            }
        });

        // Blocking writer thread. PTY writes can stall when the subprocess
        // stops reading; the channel keeps `write` callers from ever waiting
        // on the PTY buffer. Ends when the control half is dropped.
        let (input_tx, input_rx) = std::sync::mpsc::channel::<Vec<u8>>();
        std::thread::spawn(move || {
            while let Ok(bytes) = input_rx.recv() {
                if writer.write_all(&bytes).is_err() {
                    break;
                }
                let _ = writer.flush();
            }
        });

        // Wait for the child off the async runtime.
        let (exit_tx, exit_rx) = oneshot::channel();
        tokio::task::spawn_blocking(move || {
            let exit = match child.wait() {
                Ok(status) => classify_exit(status.exit_code() as i32),
                Err(_) => SourceExit {
                    exit_code: None,
                    signal: None,
                },
            };
            let _ = exit_tx.send(exit);
        });

        Ok(SpawnedSource {
            output_rx,
            control: Box::new(PtyControl {
                input_tx,
                master,
                killer,
                pid,
            }),
            exit_rx,
        })
    }
}

/// portable-pty folds signal deaths into the exit code as 128+N (the shell
/// convention); unfold so clients see a signal, not a fake exit code.
fn classify_exit(code: i32) -> SourceExit {
    #[cfg(unix)]
    {
        if (129..160).contains(&code) {
            return SourceExit {
                exit_code: None,
                signal: Some(code - 128),
            };
        }
    }
    SourceExit {
        exit_code: Some(code),
        signal: None,
    }
}

struct PtyControl {
    input_tx: std::sync::mpsc::Sender<Vec<u8>>,
    master: Box<dyn portable_pty::MasterPty + Send>,
    killer: Box<dyn portable_pty::ChildKiller + Send + Sync>,
    pid: Option<u32>,
}

impl SourceControl for PtyControl {
    fn write(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.input_tx.send(bytes.to_vec()).map_err(|_| {
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "session input closed")
        })
    }

    fn resize(&mut self, cols: u16, rows: u16) -> std::io::Result<()> {
        self.master
            .resize(portable_pty::PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
    }

    #[cfg(unix)]
    fn terminate(&mut self) -> std::io::Result<()> {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        if let Some(pid) = self.pid {
            kill(Pid::from_raw(pid as i32), Signal::SIGTERM)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
        } else {
            self.killer.kill()
        }
    }

    #[cfg(not(unix))]
    fn terminate(&mut self) -> std::io::Result<()> {
        self.killer.kill()
    }

    fn force_kill(&mut self) -> std::io::Result<()> {
        self.killer.kill()
    }
}

// ---------- Scripted mock source ----------

/// One step of a scripted session.
#[derive(Debug, Clone)]
pub enum ScriptStep {
    /// Emit bytes after a delay.
    Emit { delay: Duration, bytes: Vec<u8> },
    /// Emit a prompt, then block until input containing `\r` arrives.
    WaitForInput { prompt: Vec<u8> },
}

/// Linear, time-delayed canned session behind the same `TermSource`
/// interface as the real PTY. Used by `serve --mock` and the tests.
pub struct ScriptSource {
    steps: Vec<ScriptStep>,
}

impl ScriptSource {
    pub fn new(steps: Vec<ScriptStep>) -> Self {
        Self { steps }
    }

    /// A short demo session: banner, work, one yes/no decision, done.
    pub fn demo() -> Self {
        Self::new(vec![
            ScriptStep::Emit {
                delay: Duration::from_millis(100),
                bytes: b"termlink mock agent\r\n".to_vec(),
            },
            ScriptStep::Emit {
                delay: Duration::from_millis(300),
                bytes: b"Analyzing project...\r\n".to_vec(),
            },
            ScriptStep::WaitForInput {
                prompt: b"Apply suggested changes? (y/n) ".to_vec(),
            },
            ScriptStep::Emit {
                delay: Duration::from_millis(200),
                bytes: b"\r\nDone.\r\n".to_vec(),
            },
        ])
    }
}

enum ScriptMsg {
    Input(Vec<u8>),
    Terminate,
}

impl TermSource for ScriptSource {
    fn spawn(
        &self,
        _spec: &LaunchSpec,
        _cols: u16,
        _rows: u16,
    ) -> Result<SpawnedSource, EngineError> {
        let (output_tx, output_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let (input_tx, mut input_rx) = mpsc::unbounded_channel::<ScriptMsg>();
        let (exit_tx, exit_rx) = oneshot::channel();

        let steps = self.steps.clone();
        tokio::spawn(async move {
            let mut exit = SourceExit {
                exit_code: Some(0),
                signal: None,
            };

            'script: for step in steps {
                match step {
                    ScriptStep::Emit { delay, bytes } => {
                        tokio::time::sleep(delay).await;
                        if output_tx.send(bytes).is_err() {
                            break 'script;
                        }
                    }
                    ScriptStep::WaitForInput { prompt } => {
                        if output_tx.send(prompt).is_err() {
                            break 'script;
                        }
                        loop {
                            match input_rx.recv().await {
                                Some(ScriptMsg::Input(bytes)) => {
                                    // Echo like a terminal would and move on
                                    // once the operator submits a line.
                                    let _ = output_tx.send(bytes.clone());
                                    if bytes.contains(&b'\r') || bytes.contains(&b'\n') {
                                        break;
                                    }
                                }
                                Some(ScriptMsg::Terminate) | None => {
                                    exit = SourceExit {
                                        exit_code: None,
                                        signal: Some(15),
                                    };
                                    break 'script;
                                }
                            }
                        }
                    }
                }

                // Honor termination requests between steps as well.
                if let Ok(msg) = input_rx.try_recv() {
                    if matches!(msg, ScriptMsg::Terminate) {
                        exit = SourceExit {
                            exit_code: None,
                            signal: Some(15),
                        };
                        break 'script;
                    }
                }
            }

            let _ = exit_tx.send(exit);
        });

        Ok(SpawnedSource {
            output_rx,
            control: Box::new(ScriptControl { input_tx }),
            exit_rx,
        })
    }
}

struct ScriptControl {
    input_tx: mpsc::UnboundedSender<ScriptMsg>,
}

impl SourceControl for ScriptControl {
    fn write(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.input_tx
            .send(ScriptMsg::Input(bytes.to_vec()))
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::Other, "script ended"))
    }

    fn resize(&mut self, _cols: u16, _rows: u16) -> std::io::Result<()> {
        Ok(())
    }

    fn terminate(&mut self) -> std::io::Result<()> {
        let _ = self.input_tx.send(ScriptMsg::Terminate);
        Ok(())
    }

    fn force_kill(&mut self) -> std::io::Result<()> {
        let _ = self.input_tx.send(ScriptMsg::Terminate);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_exit_keeps_code() {
        let exit = classify_exit(0);
        assert_eq!(exit.exit_code, Some(0));
        assert_eq!(exit.signal, None);

        let exit = classify_exit(2);
        assert_eq!(exit.exit_code, Some(2));
        assert_eq!(exit.signal, None);
    }

    #[cfg(unix)]
    #[test]
    fn test_signal_death_reported_as_signal() {
        // 128 + SIGTERM
        let exit = classify_exit(143);
        assert_eq!(exit.exit_code, None);
        assert_eq!(exit.signal, Some(15));

        // 128 + SIGKILL
        let exit = classify_exit(137);
        assert_eq!(exit.signal, Some(9));
    }

    #[cfg(unix)]
    #[test]
    fn test_plain_failure_code_not_mistaken_for_signal() {
        let exit = classify_exit(1);
        assert_eq!(exit.exit_code, Some(1));
        assert_eq!(exit.signal, None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_pty_write_returns_while_subprocess_ignores_input() {
        let spec = LaunchSpec {
            command: "sleep".to_string(),
            args: vec!["5".to_string()],
            working_dir: None,
            env: vec![],
        };
        let mut spawned = PtySource.spawn(&spec, 80, 24).unwrap();

        // sleep never reads stdin, so the PTY input buffer fills; writes must
        // still return promptly instead of stalling the caller.
        let started = std::time::Instant::now();
        let chunk = vec![b'x'; 4 * 1024];
        for _ in 0..64 {
            spawned.control.write(&chunk).unwrap();
        }
        assert!(started.elapsed() < Duration::from_secs(2));

        let _ = spawned.control.force_kill();
    }
}
