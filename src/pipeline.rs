//! Process orchestration: one forked process per stage, pipes in between.
//!
//! A chain `[H, T...]` runs as follows. A single stage is run directly (for
//! `exit` and `cd`, inside the interpreter itself). Otherwise a pipe is
//! created, `H` is forked with its stdout on the write end, and a second child
//! takes the read end as stdin and recurses on `T...`, reproducing the same
//! shape one stage further down. Whoever creates a pipe closes both of its
//! ends right after forking, so every reader sees end-of-file once its writer
//! is done.

use crate::builtin::Builtins;
use crate::command::{CommandChain, EXIT_NOT_FOUND, ExitCode, Redirects, Stage};
use crate::env::Environment;
use crate::error::{ShellError, report};
use crate::external::exec_replace;
use nix::errno::Errno;
use nix::libc::{STDIN_FILENO, STDOUT_FILENO};
use nix::sys::signal::{SigHandler, Signal, signal};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::{ForkResult, Pid, close, dup2, fork, pipe};
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::path::Path;

/// What the interpreter loop should do once a line has run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

/// Runs command chains and remembers the background processes it started.
pub struct Orchestrator {
    builtins: Builtins,
    background: Vec<Pid>,
}

impl Orchestrator {
    pub fn new(builtins: Builtins) -> Self {
        Self {
            builtins,
            background: Vec::new(),
        }
    }

    /// Background processes that haven't been reaped yet.
    pub fn background(&self) -> &[Pid] {
        &self.background
    }

    /// Executes `chain`, waiting for it unless it was sent to the background.
    ///
    /// Exit statuses of the programs are not reported back; only `exit`
    /// changes the returned [`Flow`]. An error means no process of this
    /// chain is left running.
    pub fn execute(
        &mut self,
        chain: &CommandChain,
        env: &mut Environment,
    ) -> Result<Flow, ShellError> {
        match chain.stages.as_slice() {
            [] => Ok(Flow::Continue),
            [stage] => self.run_terminal(stage, chain.is_background(), env),
            stages => self.run_pipeline(stages, chain.is_background(), env),
        }
    }

    fn run_terminal(
        &mut self,
        stage: &Stage,
        background: bool,
        env: &mut Environment,
    ) -> Result<Flow, ShellError> {
        match stage.name.as_str() {
            "" => return Ok(Flow::Continue),
            "exit" => return Ok(Flow::Stop),
            "cd" => {
                if let Err(e) = env.change_dir(stage.first_arg()) {
                    report("cd", e);
                }
                return Ok(Flow::Continue);
            }
            _ => {}
        }

        let builtins = &self.builtins;
        let child = spawn(|| run_stage(stage, builtins, env))?;
        if background {
            self.detach(&[child]);
        } else {
            let status = wait_for(child);
            tracing::debug!(target: "commands", name = %stage.name, ?status, "stage finished");
        }
        Ok(Flow::Continue)
    }

    fn run_pipeline(
        &mut self,
        stages: &[Stage],
        background: bool,
        env: &mut Environment,
    ) -> Result<Flow, ShellError> {
        let (producer, consumer) = spawn_pipe_pair(stages, &self.builtins, env)?;
        if background {
            self.detach(&[producer, consumer]);
        } else {
            let statuses = (wait_for(producer), wait_for(consumer));
            tracing::debug!(target: "commands", ?statuses, "pipeline finished");
        }
        Ok(Flow::Continue)
    }

    fn detach(&mut self, pids: &[Pid]) {
        let mut stdout = io::stdout().lock();
        for pid in pids {
            let _ = writeln!(stdout, "[{pid}] started in background");
            tracing::debug!(target: "jobs", %pid, "detached");
        }
        let _ = stdout.flush();
        self.background.extend_from_slice(pids);
    }

    /// Collects background processes that have finished since the last call.
    pub fn reap_background(&mut self) -> Vec<(Pid, ExitCode)> {
        let mut finished = Vec::new();
        self.background.retain(|&pid| {
            match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
                Ok(status) => match exit_code(status) {
                    Some(code) => {
                        finished.push((pid, code));
                        false
                    }
                    None => true,
                },
                Err(errno) => {
                    tracing::warn!(target: "jobs", %pid, %errno, "lost track of background process");
                    false
                }
            }
        });
        finished
    }
}

/// Shell-style exit code of a finished process, `None` if it's still around.
fn exit_code(status: WaitStatus) -> Option<ExitCode> {
    match status {
        WaitStatus::Exited(_, code) => Some(code),
        WaitStatus::Signaled(_, signal, _) => Some(128 + signal as ExitCode),
        _ => None,
    }
}

/// Blocks until `pid` terminates.
fn wait_for(pid: Pid) -> Option<ExitCode> {
    loop {
        match waitpid(pid, None) {
            Ok(status) => {
                if let Some(code) = exit_code(status) {
                    return Some(code);
                }
            }
            Err(Errno::EINTR) => {}
            Err(errno) => {
                tracing::warn!(target: "jobs", %pid, %errno, "waitpid failed");
                return None;
            }
        }
    }
}

/// Forks, runs `child_main` in the child and exits with its result.
///
/// The child never returns from here, so nothing owned by the caller's stack
/// frames is dropped in the child.
fn spawn(child_main: impl FnOnce() -> ExitCode) -> Result<Pid, ShellError> {
    // Unflushed output would otherwise be written once by each process.
    let _ = io::stdout().flush();
    let _ = io::stderr().flush();

    // SAFETY: the interpreter is single threaded; the child only sets up
    // descriptors, runs a builtin or execs, and then exits.
    match unsafe { fork() } {
        Ok(ForkResult::Parent { child }) => Ok(child),
        Ok(ForkResult::Child) => {
            reset_child_signals();
            let code = child_main();
            let _ = io::stdout().flush();
            // SAFETY: ends the child without running the parent's exit handlers.
            unsafe { nix::libc::_exit(code) }
        }
        Err(e) => Err(ShellError::process("fork", e)),
    }
}

/// The Rust runtime ignores SIGPIPE, and an ignored disposition survives
/// `execve`. Stages get the default back so a writer dies with its reader.
fn reset_child_signals() {
    // SAFETY: installs the default disposition, no handler code runs.
    if let Err(errno) = unsafe { signal(Signal::SIGPIPE, SigHandler::SigDfl) } {
        tracing::warn!(target: "commands", %errno, "failed to restore SIGPIPE");
    }
}

/// Creates the pipe between `stages[0]` and the rest and forks both sides.
///
/// Returns the producer's and the consumer's pid. Both pipe ends are closed
/// in the calling process before returning, whatever the outcome.
fn spawn_pipe_pair(
    stages: &[Stage],
    builtins: &Builtins,
    env: &mut Environment,
) -> Result<(Pid, Pid), ShellError> {
    let Some((head, tail)) = stages.split_first() else {
        return Err(ShellError::process("start pipeline", Errno::EINVAL));
    };
    let (read_end, write_end) = pipe().map_err(|e| ShellError::process("create pipe", e))?;

    let producer = spawn(|| match rebind(&write_end, STDOUT_FILENO, &read_end) {
        Ok(()) => run_stage(head, builtins, env),
        Err(e) => {
            report(&head.name, e);
            1
        }
    })?;

    let consumer = spawn(|| match rebind(&read_end, STDIN_FILENO, &write_end) {
        Ok(()) => run_chain(tail, builtins, env),
        Err(e) => {
            report(tail.first().map_or("pipe", |s| s.name.as_str()), e);
            1
        }
    });

    drop(read_end);
    drop(write_end);
    match consumer {
        Ok(consumer) => Ok((producer, consumer)),
        Err(e) => {
            wait_for(producer);
            Err(e)
        }
    }
}

/// In a freshly forked child: puts `keep` on `target` and closes both of the
/// pipe's original descriptors.
///
/// The descriptors are closed by number because the `OwnedFd`s belong to the
/// parent's stack frame, which the child never unwinds.
fn rebind(keep: &OwnedFd, target: RawFd, other: &OwnedFd) -> Result<(), ShellError> {
    let wire = |e| ShellError::process("connect pipe", e);
    dup2(keep.as_raw_fd(), target).map_err(wire)?;
    close(keep.as_raw_fd()).map_err(wire)?;
    close(other.as_raw_fd()).map_err(wire)
}

/// Runs the stages reading from this process's stdin, from inside a child.
fn run_chain(stages: &[Stage], builtins: &Builtins, env: &mut Environment) -> ExitCode {
    match stages {
        [] => 0,
        [stage] => run_stage(stage, builtins, env),
        stages => match spawn_pipe_pair(stages, builtins, env) {
            Ok((producer, consumer)) => {
                wait_for(producer);
                wait_for(consumer).unwrap_or(1)
            }
            Err(e) => {
                report(&stages[0].name, e);
                1
            }
        },
    }
}

/// Runs one stage inside a child process and returns its exit code.
///
/// Redirections come first, so builtins and programs alike see them.
fn run_stage(stage: &Stage, builtins: &Builtins, env: &mut Environment) -> ExitCode {
    if let Err(e) = apply_redirects(&stage.redirects) {
        report(&stage.name, e);
        return 1;
    }

    match stage.name.as_str() {
        "" | "exit" => return 0,
        "cd" => {
            return match env.change_dir(stage.first_arg()) {
                Ok(()) => 0,
                Err(e) => {
                    report("cd", e);
                    1
                }
            };
        }
        _ => {}
    }

    let args: Vec<&str> = stage.words().skip(1).collect();
    let mut stdin = io::stdin();
    let mut stdout = io::stdout();
    if let Some(code) = builtins.execute_builtin(&stage.name, &args, &mut stdin, &mut stdout, env) {
        return code;
    }

    match exec_replace(stage, env) {
        Ok(never) => match never {},
        Err(e) => {
            report(&stage.name, e);
            EXIT_NOT_FOUND
        }
    }
}

fn open_redirect(path: &Path, options: &OpenOptions) -> Result<File, ShellError> {
    options
        .open(path)
        .map_err(|source| ShellError::RedirectOpenFailure {
            target: path.to_path_buf(),
            source,
        })
}

fn redirect_onto(path: &Path, options: &OpenOptions, fd: RawFd) -> Result<(), ShellError> {
    let file = open_redirect(path, options)?;
    dup2(file.as_raw_fd(), fd).map_err(|e| ShellError::RedirectOpenFailure {
        target: path.to_path_buf(),
        source: io::Error::from(e),
    })?;
    Ok(())
}

/// Points stdin and stdout of this process at the stage's redirect targets.
///
/// When both `>` and `>>` are given, `>>` wins; the `>` target is still
/// created and truncated.
fn apply_redirects(redirects: &Redirects) -> Result<(), ShellError> {
    if let Some(input) = &redirects.input {
        redirect_onto(input, OpenOptions::new().read(true), STDIN_FILENO)?;
    }

    let mut truncate = OpenOptions::new();
    truncate.write(true).create(true).truncate(true);
    let mut append = OpenOptions::new();
    append.append(true).create(true);

    match (&redirects.truncate, &redirects.append) {
        (Some(shadowed), Some(target)) => {
            open_redirect(shadowed, &truncate)?;
            redirect_onto(target, &append, STDOUT_FILENO)
        }
        (Some(target), None) => redirect_onto(target, &truncate, STDOUT_FILENO),
        (None, Some(target)) => redirect_onto(target, &append, STDOUT_FILENO),
        (None, None) => Ok(()),
    }
}
