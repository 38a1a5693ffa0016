//! Pseudo-terminal spawning.
//!
//! The bridge talks to the pty through the small [`PtySpawner`],
//! [`PtyMaster`] and [`PtyChild`] traits so that session lifecycles can be
//! exercised without a real shell. [`NativePtySpawner`] is the production
//! implementation backed by `portable-pty`.

use std::io::{self, Read, Write};
use std::path::PathBuf;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use protocol::WindowSize;
use thiserror::Error;

/// Errors that can occur while running a terminal session.
#[derive(Error, Debug)]
pub enum TerminalError {
    /// Failed to spawn the PTY or the shell.
    #[error("failed to spawn PTY: {0}")]
    SpawnFailed(String),

    /// Failed to resize the PTY.
    #[error("failed to resize PTY: {0}")]
    ResizeFailed(String),

    /// The WebSocket connection failed.
    #[error("connection error: {0}")]
    Connection(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// How the shell process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    /// Exit code as reported by the pty layer.
    pub code: u32,
}

/// The program to run inside a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellCommand {
    /// Executable path or name.
    pub program: String,
    /// Arguments after the program name.
    pub args: Vec<String>,
    /// Extra environment variables, applied on top of the daemon's own.
    pub env: Vec<(String, String)>,
    /// Working directory. `None` inherits the daemon's.
    pub cwd: Option<PathBuf>,
}

impl ShellCommand {
    /// Creates a command with no arguments.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            cwd: None,
        }
    }

    /// Adds an argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Adds an environment variable.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Sets the working directory.
    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }
}

/// Controlling side of the pty. Dropping it closes the pty.
pub trait PtyMaster: Send {
    /// Applies a new window size.
    fn resize(&self, size: WindowSize) -> Result<(), TerminalError>;
}

/// The process attached to the pty.
pub trait PtyChild: Send {
    /// OS process id, if known.
    fn pid(&self) -> Option<u32>;

    /// Asks the process to terminate.
    fn terminate(&mut self) -> io::Result<()>;

    /// Blocks until the process has exited and reaps it.
    fn wait(&mut self) -> io::Result<ExitInfo>;
}

/// Everything produced by a successful spawn.
pub struct SpawnedPty {
    /// Blocking reader for pty output.
    pub reader: Box<dyn Read + Send>,
    /// Blocking writer for pty input.
    pub writer: Box<dyn Write + Send>,
    /// Resize/close handle.
    pub master: Box<dyn PtyMaster>,
    /// The spawned process.
    pub child: Box<dyn PtyChild>,
}

/// Capability to start a process under a new pty.
pub trait PtySpawner: Send + Sync {
    /// Spawns `command` attached to a pty of the given size.
    fn spawn(&self, command: &ShellCommand, size: WindowSize) -> Result<SpawnedPty, TerminalError>;
}

/// [`PtySpawner`] using the platform's native pty.
#[derive(Debug, Clone, Copy, Default)]
pub struct NativePtySpawner;

impl PtySpawner for NativePtySpawner {
    fn spawn(&self, command: &ShellCommand, size: WindowSize) -> Result<SpawnedPty, TerminalError> {
        let pair = native_pty_system()
            .openpty(pty_size(size))
            .map_err(|e| TerminalError::SpawnFailed(e.to_string()))?;

        let mut cmd = CommandBuilder::new(&command.program);
        cmd.args(&command.args);
        if let Some(ref dir) = command.cwd {
            cmd.cwd(dir);
        }
        for (key, value) in &command.env {
            cmd.env(key, value);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| TerminalError::SpawnFailed(e.to_string()))?;
        // Only the child may hold the slave side, otherwise reads on the
        // master never see EOF after the child exits.
        drop(pair.slave);

        let mut child = NativeChild { child };
        match open_io(pair.master.as_ref()) {
            Ok((reader, writer)) => Ok(SpawnedPty {
                reader,
                writer,
                master: Box::new(NativeMaster {
                    master: pair.master,
                }),
                child: Box::new(child),
            }),
            Err(e) => {
                let _ = child.terminate();
                let _ = child.wait();
                Err(TerminalError::SpawnFailed(e.to_string()))
            }
        }
    }
}

struct NativeMaster {
    master: Box<dyn MasterPty + Send>,
}

impl PtyMaster for NativeMaster {
    fn resize(&self, size: WindowSize) -> Result<(), TerminalError> {
        self.master
            .resize(pty_size(size))
            .map_err(|e| TerminalError::ResizeFailed(e.to_string()))
    }
}

struct NativeChild {
    child: Box<dyn Child + Send + Sync>,
}

impl PtyChild for NativeChild {
    fn pid(&self) -> Option<u32> {
        self.child.process_id()
    }

    fn terminate(&mut self) -> io::Result<()> {
        // Interactive shells ignore SIGTERM, so this is a hard kill.
        match self.child.process_id() {
            Some(pid) => kill(Pid::from_raw(pid as i32), Signal::SIGKILL).map_err(io::Error::from),
            None => self.child.kill(),
        }
    }

    fn wait(&mut self) -> io::Result<ExitInfo> {
        let status = self.child.wait()?;
        Ok(ExitInfo {
            code: status.exit_code(),
        })
    }
}

type PtyIo = (Box<dyn Read + Send>, Box<dyn Write + Send>);

fn open_io(master: &(dyn MasterPty + Send)) -> anyhow::Result<PtyIo> {
    let reader = master.try_clone_reader()?;
    let writer = master.take_writer()?;
    Ok((reader, writer))
}

fn pty_size(size: WindowSize) -> PtySize {
    PtySize {
        rows: size.rows,
        cols: size.cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_command_builder() {
        let cmd = ShellCommand::new("/bin/sh")
            .arg("-l")
            .env("TERM", "xterm-256color")
            .cwd("/tmp");

        assert_eq!(cmd.program, "/bin/sh");
        assert_eq!(cmd.args, vec!["-l".to_string()]);
        assert_eq!(
            cmd.env,
            vec![("TERM".to_string(), "xterm-256color".to_string())]
        );
        assert_eq!(cmd.cwd, Some(PathBuf::from("/tmp")));
    }

    #[test]
    fn test_pty_size_conversion() {
        let size = pty_size(WindowSize::new(120, 30));
        assert_eq!(size.cols, 120);
        assert_eq!(size.rows, 30);
        assert_eq!(size.pixel_width, 0);
    }

    #[test]
    fn test_native_spawn_kill_and_reap() {
        let spawned = NativePtySpawner
            .spawn(&ShellCommand::new("/bin/sh"), WindowSize::new(80, 24))
            .expect("failed to spawn /bin/sh");
        let mut child = spawned.child;
        let pid = child.pid().expect("native child has a pid");

        spawned
            .master
            .resize(WindowSize::new(100, 40))
            .expect("resize should succeed");

        child.terminate().unwrap();
        child.wait().unwrap();

        // Reaped: the pid no longer exists.
        assert!(kill(Pid::from_raw(pid as i32), None).is_err());
    }

    #[test]
    fn test_native_spawn_missing_program() {
        let result = NativePtySpawner.spawn(
            &ShellCommand::new("/nonexistent/shell-binary"),
            WindowSize::default(),
        );
        assert!(matches!(result, Err(TerminalError::SpawnFailed(_))));
    }
}
