//! Subprocess orchestrator: pipe, fork, redirect, wait, classify.
//!
//! Two primitives over a `program + arguments` token vector:
//!
//! - [`run_capture`] pipes the child's stderr back into memory. The compile
//!   step is built on this: a compiler that exits non-zero hands back its
//!   diagnostics.
//! - [`run_redirected`] pipes stdout and stderr into timestamped capture
//!   files under an output directory, optionally feeding stdin from a file.
//!   The execute step uses this so program output survives on disk.
//!
//! Every descriptor lives in an [`FdGuard`]; no path, success or error, can
//! leak one. Between `fork` and `exec` the child performs only
//! async-signal-safe calls.

use std::ffi::CString;
use std::fs::File;
use std::io::Write;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{ForgewireError, Result};
use crate::fd::FdGuard;

/// How a child process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Normal exit with the given code.
    Exited(i32),
    /// Killed by the given signal.
    Signaled(i32),
    /// Neither exited nor signaled (stopped/unknown wait status).
    Aborted,
}

impl Outcome {
    #[inline]
    pub fn success(&self) -> bool {
        matches!(self, Outcome::Exited(0))
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outcome::Exited(code) => write!(f, "exit code {code}"),
            Outcome::Signaled(sig) => write!(f, "terminated by signal {sig}"),
            Outcome::Aborted => write!(f, "abnormal termination"),
        }
    }
}

/// Result of [`run_capture`].
#[derive(Debug)]
pub struct CaptureReport {
    pub outcome: Outcome,
    /// Everything the child wrote to stderr. For a signaled child a
    /// "terminated by signal N" notice is appended.
    pub stderr: Vec<u8>,
}

/// Result of [`run_redirected`].
#[derive(Debug)]
pub struct ExecutionReport {
    pub outcome: Outcome,
    pub stdout_path: PathBuf,
    pub stderr_path: PathBuf,
}

/// Create a pipe with close-on-exec set atomically at creation.
///
/// Falls back to `pipe` + `fcntl(FD_CLOEXEC)` when the kernel reports
/// `pipe2` unsupported.
pub fn pipe_cloexec() -> Result<(FdGuard, FdGuard)> {
    let mut fds = [0 as RawFd; 2];
    if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } == 0 {
        return Ok((FdGuard::new(fds[0]), FdGuard::new(fds[1])));
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() != Some(libc::ENOSYS) {
        return Err(err.into());
    }

    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    let read_end = FdGuard::new(fds[0]);
    let write_end = FdGuard::new(fds[1]);
    for fd in [read_end.raw(), write_end.raw()] {
        if unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) } == -1 {
            return Err(std::io::Error::last_os_error().into());
        }
    }
    Ok((read_end, write_end))
}

/// Run `argv`, capturing the child's stderr until EOF, then classify the
/// wait status.
pub fn run_capture(argv: &[String]) -> Result<CaptureReport> {
    let argv_c = to_cstrings(argv)?;
    let (read_end, write_end) = pipe_cloexec()?;

    let pid = spawn(&argv_c, &ChildRedirect {
        stdin: None,
        stdout: None,
        stderr: Some(write_end.raw()),
    })?;
    drop(write_end); // parent's copy; EOF on the read end needs it gone

    let mut stderr = Vec::new();
    drain_fd(read_end.raw(), &mut stderr)?;
    let outcome = wait_child(pid)?;

    if let Outcome::Signaled(sig) = outcome {
        stderr.extend_from_slice(format!("\nterminated by signal {sig}\n").as_bytes());
    }
    tracing::debug!(command = %argv[0], %outcome, stderr_len = stderr.len(), "capture run finished");
    Ok(CaptureReport { outcome, stderr })
}

/// Run `argv` with stdout and stderr drained into `<ts>.output` and
/// `<ts>.err` under `out_dir`, optionally redirecting stdin from a file.
pub fn run_redirected(
    argv: &[String],
    stdin_file: Option<&Path>,
    out_dir: &Path,
) -> Result<ExecutionReport> {
    let argv_c = to_cstrings(argv)?;
    let (out_read, out_write) = pipe_cloexec()?;
    let (err_read, err_write) = pipe_cloexec()?;
    let stdin_guard = match stdin_file {
        Some(path) => Some(open_read_cloexec(path)?),
        None => None,
    };

    let pid = spawn(&argv_c, &ChildRedirect {
        stdin: stdin_guard.as_ref().map(FdGuard::raw),
        stdout: Some(out_write.raw()),
        stderr: Some(err_write.raw()),
    })?;
    drop(out_write);
    drop(err_write);
    drop(stdin_guard);

    let stamp = epoch_millis();
    let stdout_path = fresh_path(out_dir, &format!("{stamp}.output"));
    let stderr_path = fresh_path(out_dir, &format!("{stamp}.err"));

    // Drain the two pipes concurrently; draining them one after the other
    // deadlocks when the child fills the second pipe first. A dedicated
    // thread (not the worker pool — this code already runs on a worker)
    // keeps the stderr side moving.
    let (stdout_result, stderr_result) = std::thread::scope(|scope| {
        let stderr_thread = scope.spawn(|| drain_to_file(err_read, &stderr_path));
        (drain_to_file(out_read, &stdout_path), stderr_thread.join())
    });
    stdout_result?;
    match stderr_result {
        Ok(result) => result?,
        Err(_) => {
            return Err(ForgewireError::Process("stderr drain panicked".to_string()));
        }
    }

    let outcome = wait_child(pid)?;
    tracing::debug!(command = %argv[0], %outcome, "redirected run finished");
    Ok(ExecutionReport {
        outcome,
        stdout_path,
        stderr_path,
    })
}

struct ChildRedirect {
    stdin: Option<RawFd>,
    stdout: Option<RawFd>,
    stderr: Option<RawFd>,
}

/// Fork and exec. In the child only `dup2`/`execvp`/`_exit` run; exec
/// failure exits 127, redirection failure 126.
fn spawn(argv: &[CString], redirect: &ChildRedirect) -> Result<libc::pid_t> {
    if argv.is_empty() {
        return Err(ForgewireError::Process("empty command line".to_string()));
    }
    let mut argv_ptrs: Vec<*const libc::c_char> = argv.iter().map(|a| a.as_ptr()).collect();
    argv_ptrs.push(std::ptr::null());

    let pid = unsafe { libc::fork() };
    if pid < 0 {
        return Err(ForgewireError::Process(format!(
            "fork failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    if pid == 0 {
        unsafe {
            let pairs = [
                (redirect.stdin, libc::STDIN_FILENO),
                (redirect.stdout, libc::STDOUT_FILENO),
                (redirect.stderr, libc::STDERR_FILENO),
            ];
            for (fd, target) in pairs {
                if let Some(fd) = fd {
                    if libc::dup2(fd, target) < 0 {
                        libc::_exit(126);
                    }
                }
            }
            // Originals carry O_CLOEXEC, so only the dup2'ed targets
            // survive the exec.
            libc::execvp(argv_ptrs[0], argv_ptrs.as_ptr());
            libc::_exit(127);
        }
    }
    Ok(pid)
}

fn wait_child(pid: libc::pid_t) -> Result<Outcome> {
    let mut status: libc::c_int = 0;
    loop {
        if unsafe { libc::waitpid(pid, &mut status, 0) } >= 0 {
            break;
        }
        let err = std::io::Error::last_os_error();
        if err.kind() != std::io::ErrorKind::Interrupted {
            return Err(err.into());
        }
    }

    if libc::WIFEXITED(status) {
        Ok(Outcome::Exited(libc::WEXITSTATUS(status)))
    } else if libc::WIFSIGNALED(status) {
        Ok(Outcome::Signaled(libc::WTERMSIG(status)))
    } else {
        Ok(Outcome::Aborted)
    }
}

fn drain_fd(fd: RawFd, sink: &mut Vec<u8>) -> Result<()> {
    let mut chunk = [0u8; 4096];
    loop {
        let n = unsafe { libc::read(fd, chunk.as_mut_ptr() as *mut libc::c_void, chunk.len()) };
        if n < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err.into());
        }
        if n == 0 {
            return Ok(());
        }
        sink.extend_from_slice(&chunk[..n as usize]);
    }
}

fn drain_to_file(fd: FdGuard, path: &Path) -> Result<()> {
    let mut file = File::create(path)?;
    let mut chunk = [0u8; 4096];
    loop {
        let n = unsafe { libc::read(fd.raw(), chunk.as_mut_ptr() as *mut libc::c_void, chunk.len()) };
        if n < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err.into());
        }
        if n == 0 {
            file.flush()?;
            return Ok(());
        }
        file.write_all(&chunk[..n as usize])?;
    }
}

fn open_read_cloexec(path: &Path) -> Result<FdGuard> {
    let c_path = CString::new(path.as_os_str().as_encoded_bytes())
        .map_err(|_| ForgewireError::Process(format!("path contains NUL: {}", path.display())))?;
    let fd = unsafe { libc::open(c_path.as_ptr(), libc::O_RDONLY | libc::O_CLOEXEC) };
    if fd < 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(FdGuard::new(fd))
}

fn to_cstrings(argv: &[String]) -> Result<Vec<CString>> {
    if argv.is_empty() {
        return Err(ForgewireError::Process("empty command line".to_string()));
    }
    argv.iter()
        .map(|arg| {
            CString::new(arg.as_bytes())
                .map_err(|_| ForgewireError::Process(format!("argument contains NUL: {arg:?}")))
        })
        .collect()
}

/// Milliseconds since the Unix epoch, for capture and artifact naming.
pub fn epoch_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}

/// `dir/name`, deduplicated with a numeric suffix when two runs land on the
/// same millisecond.
pub(crate) fn fresh_path(dir: &Path, name: &str) -> PathBuf {
    let candidate = dir.join(name);
    if !candidate.exists() {
        return candidate;
    }
    for n in 1.. {
        let candidate = dir.join(format!("{name}.{n}"));
        if !candidate.exists() {
            return candidate;
        }
    }
    unreachable!()
}
