//! Lifecycle of the instrumented child: shared label table, event pipe and
//! process handoff.
//!
//! The child finds the label table through `TAINT_SHM_ID` and the event pipe
//! write end on fd 200 (advertised via `TAINT_PIPE_FD`). The hand-back is
//! event-stream EOF: the driver reads the table only after the child
//! terminated for the run.

use nix::sys::signal::{kill, Signal::SIGKILL};
use nix::unistd::Pid;
use os_pipe::PipeReader;
use shared_memory::{Shmem, ShmemConf, ShmemError};
use std::fs::File;
use std::os::unix::io::AsRawFd;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use thiserror::Error;

/// Fd number the event pipe write end is placed on in the child.
pub const EVENT_PIPE_FD: i32 = 200;

pub const SHM_ID_ENV: &str = "TAINT_SHM_ID";
pub const PIPE_FD_ENV: &str = "TAINT_PIPE_FD";

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("shared memory: {0}")]
    Shmem(String),
    #[error("no input configured, call set_input first")]
    NoInput,
    #[error("no argv configured, call set_args first")]
    NoArgs,
    #[error("a run is already in flight")]
    Busy,
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub enum InputSpec {
    Stdin,
    File(PathBuf),
}

/// Owns the shared segment and the child of the current run.
///
/// Exactly one run may be in flight at a time; `destroy` is idempotent.
pub struct Launcher {
    program: PathBuf,
    shm: Shmem,
    input: Option<InputSpec>,
    args: Vec<String>,
    debug: bool,
    bounds_check: bool,
    solve_ub: bool,
    child: Option<Child>,
}

impl Launcher {
    /// Allocate the shared label table and bind it to `program`.
    pub fn init(program: impl Into<PathBuf>, table_size: usize) -> Result<Self, LaunchError> {
        static NEXT_SEGMENT: std::sync::atomic::AtomicU32 = std::sync::atomic::AtomicU32::new(0);
        let seq = NEXT_SEGMENT.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let shm_id = format!("ctwm-union-{}-{}", std::process::id(), seq);
        let shm = create_shm(&shm_id, table_size)?;
        Ok(Self {
            program: program.into(),
            shm,
            input: None,
            args: Vec::new(),
            debug: false,
            bounds_check: true,
            solve_ub: false,
            child: None,
        })
    }

    pub fn table_ptr(&self) -> *const u8 {
        self.shm.as_ptr() as *const u8
    }

    pub fn table_len(&self) -> usize {
        self.shm.len()
    }

    pub fn set_input(&mut self, input: InputSpec) {
        self.input = Some(input);
    }

    /// Full argv of the child, program name included.
    pub fn set_args(&mut self, args: Vec<String>) {
        self.args = args;
    }

    pub fn set_debug(&mut self, debug: bool) {
        self.debug = debug;
    }

    pub fn set_bounds_check(&mut self, enable: bool) {
        self.bounds_check = enable;
    }

    pub fn set_solve_ub(&mut self, enable: bool) {
        self.solve_ub = enable;
    }

    /// Spawn the child for one run and hand back the event pipe read end.
    ///
    /// `input_file` backs the child's stdin when the input spec is `Stdin`.
    pub fn run(&mut self, input_file: Option<File>) -> Result<PipeReader, LaunchError> {
        if self.child.is_some() {
            return Err(LaunchError::Busy);
        }
        let input = self.input.as_ref().ok_or(LaunchError::NoInput)?;
        if self.args.is_empty() {
            return Err(LaunchError::NoArgs);
        }

        let (reader, writer) = os_pipe::pipe()?;
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args[1..]);
        cmd.env(SHM_ID_ENV, self.shm.get_os_id());
        cmd.env(PIPE_FD_ENV, EVENT_PIPE_FD.to_string());
        cmd.env("TAINT_DEBUG", if self.debug { "1" } else { "0" });
        cmd.env(
            "TAINT_BOUNDS_CHECK",
            if self.bounds_check { "1" } else { "0" },
        );
        cmd.env("TAINT_SOLVE_UB", if self.solve_ub { "1" } else { "0" });

        match (input, input_file) {
            (InputSpec::Stdin, Some(f)) => {
                cmd.stdin(Stdio::from(f));
            }
            (InputSpec::Stdin, None) => return Err(LaunchError::NoInput),
            (InputSpec::File(_), _) => {
                cmd.stdin(Stdio::null());
            }
        }
        if !self.debug {
            cmd.stdout(Stdio::null());
            cmd.stderr(Stdio::null());
        }

        // move the pipe write end onto the agreed fd, dup2 clears CLOEXEC
        let raw_writer = writer.as_raw_fd();
        unsafe {
            cmd.pre_exec(move || {
                if nix::libc::dup2(raw_writer, EVENT_PIPE_FD) == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let child = cmd.spawn()?;
        drop(writer); // child holds the only write end now
        self.child = Some(child);
        Ok(reader)
    }

    /// Reap the child of the current run. Returns its exit code when it
    /// terminated normally.
    pub fn reap(&mut self) -> Option<i32> {
        let mut child = self.child.take()?;
        match child.wait() {
            Ok(status) => status.code(),
            Err(e) => {
                log::warn!("failed to reap child: {}", e);
                None
            }
        }
    }

    /// Tear down the run state. Safe to call repeatedly.
    pub fn destroy(&mut self) {
        if let Some(child) = self.child.as_mut() {
            let pid = Pid::from_raw(child.id() as i32);
            let _ = kill(pid, SIGKILL);
        }
        self.reap();
    }
}

impl Drop for Launcher {
    fn drop(&mut self) {
        self.destroy();
    }
}

fn create_shm(id: &str, size: usize) -> Result<Shmem, LaunchError> {
    let shm = match ShmemConf::new().os_id(id).size(size).create() {
        Ok(mut shm) => {
            shm.set_owner(true);
            shm
        }
        Err(ShmemError::MappingIdExists) => {
            let mut shm = ShmemConf::new()
                .os_id(id)
                .size(size)
                .open()
                .map_err(|e| LaunchError::Shmem(e.to_string()))?;
            shm.set_owner(true);
            shm
        }
        Err(e) => return Err(LaunchError::Shmem(e.to_string())),
    };
    Ok(shm)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn run_requires_setup() {
        let mut launcher = Launcher::init("true", 4096).unwrap();
        assert!(matches!(launcher.run(None), Err(LaunchError::NoInput)));
        launcher.set_input(InputSpec::File(PathBuf::from("/dev/null")));
        assert!(matches!(launcher.run(None), Err(LaunchError::NoArgs)));
    }

    #[test]
    fn child_eof_and_reap() {
        let mut launcher = Launcher::init("true", 4096).unwrap();
        launcher.set_input(InputSpec::File(PathBuf::from("/dev/null")));
        launcher.set_args(vec!["true".to_string()]);

        let mut reader = launcher.run(None).unwrap();
        // `true` writes nothing, the pipe must report clean EOF
        let mut buf = [0u8; 16];
        assert_eq!(reader.read(&mut buf).unwrap(), 0);
        assert_eq!(launcher.reap(), Some(0));

        // destroy is idempotent
        launcher.destroy();
        launcher.destroy();
    }

    #[test]
    fn one_run_in_flight() {
        let mut launcher = Launcher::init("true", 4096).unwrap();
        launcher.set_input(InputSpec::File(PathBuf::from("/dev/null")));
        launcher.set_args(vec!["true".to_string()]);
        let _reader = launcher.run(None).unwrap();
        assert!(matches!(launcher.run(None), Err(LaunchError::Busy)));
        launcher.reap();
    }
}
