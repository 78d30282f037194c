use crate::command::ExitCode;
use crate::env::Environment;
use crate::error::report;
use anyhow::{Context, Result, bail};
use argh::{EarlyExit, FromArgs};
use nix::sys::stat::Mode;
use nix::unistd::{ForkResult, fork, mkfifo};
use std::fs;
use std::io::{BufRead, BufReader, Read, Write};
use std::os::unix::fs::{DirBuilderExt, FileTypeExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Object-safe handle to a builtin that is ready to run.
pub trait ExecutableCommand {
    /// Runs the command against the stage's (already redirected) streams.
    fn execute(
        self: Box<Self>,
        stdin: &mut dyn Read,
        stdout: &mut dyn Write,
        env: &mut Environment,
    ) -> ExitCode;
}

/// Factory that tries to create a command from a name and its arguments.
///
/// Returns `None` when the factory doesn't recognize the `name`.
pub trait CommandFactory {
    /// The exact name this factory answers to.
    fn name(&self) -> &'static str;

    fn try_create(&self, name: &str, args: &[&str]) -> Option<Box<dyn ExecutableCommand>>;
}

/// Built-in commands known to the shell at compile time.
///
/// Builtins are parsed using the [`argh`] crate (`FromArgs`) and run inside
/// the stage's process instead of replacing it with an external program.
pub(crate) trait BuiltinCommand: Sized + FromArgs {
    /// Canonical name of the command, e.g. "cut".
    fn name() -> &'static str;

    /// Rewrites arguments before argh sees them.
    fn normalize_args(args: &[&str]) -> Vec<String> {
        args.iter().map(|a| a.to_string()).collect()
    }

    /// Executes the command using provided IO streams and environment.
    ///
    /// Return value should follow shell conventions: 0 for success, non-zero for error.
    fn execute(
        self,
        stdin: &mut dyn Read,
        stdout: &mut dyn Write,
        env: &mut Environment,
    ) -> Result<ExitCode>;
}

impl<T: BuiltinCommand> ExecutableCommand for T {
    fn execute(
        self: Box<Self>,
        stdin: &mut dyn Read,
        stdout: &mut dyn Write,
        env: &mut Environment,
    ) -> ExitCode {
        let result = <T as BuiltinCommand>::execute(*self, stdin, stdout, env);
        let _ = stdout.flush();
        result.unwrap_or_else(|e| {
            report(T::name(), format!("{e:#}"));
            1
        })
    }
}

/// Outcome of argh refusing the arguments, or of `--help`.
struct InvalidArgs {
    name: &'static str,
    output: String,
    is_error: bool,
}

impl ExecutableCommand for InvalidArgs {
    fn execute(
        self: Box<Self>,
        _stdin: &mut dyn Read,
        stdout: &mut dyn Write,
        _env: &mut Environment,
    ) -> ExitCode {
        if self.is_error {
            report(self.name, self.output.trim_end());
            1
        } else {
            let _ = writeln!(stdout, "{}", self.output.trim_end());
            let _ = stdout.flush();
            0
        }
    }
}

/// Creates `T` when asked for its exact name.
pub(crate) struct Factory<T> {
    _phantom: std::marker::PhantomData<T>,
}

impl<T> Default for Factory<T> {
    fn default() -> Self {
        Self {
            _phantom: std::marker::PhantomData,
        }
    }
}

impl<T: BuiltinCommand + 'static> CommandFactory for Factory<T> {
    fn name(&self) -> &'static str {
        T::name()
    }

    fn try_create(&self, name: &str, args: &[&str]) -> Option<Box<dyn ExecutableCommand>> {
        if name != T::name() {
            return None;
        }
        let owned = T::normalize_args(args);
        let args: Vec<&str> = owned.iter().map(String::as_str).collect();
        Some(match T::from_args(&[name], &args) {
            Ok(cmd) => Box::new(cmd),
            Err(EarlyExit { output, status }) => Box::new(InvalidArgs {
                name: T::name(),
                output,
                is_error: status.is_err(),
            }),
        })
    }
}

/// Registry of builtins, matched by exact name.
pub struct Builtins {
    factories: Vec<Box<dyn CommandFactory>>,
}

impl Builtins {
    pub fn new(factories: Vec<Box<dyn CommandFactory>>) -> Self {
        Self { factories }
    }

    /// Whether `name` is handled here rather than by an external program.
    pub fn contains(&self, name: &str) -> bool {
        self.factories.iter().any(|f| f.name() == name)
    }

    /// Runs builtin `name` with `args` (not including the name itself).
    ///
    /// Returns `None` when no builtin is called `name`.
    pub fn execute_builtin(
        &self,
        name: &str,
        args: &[&str],
        stdin: &mut dyn Read,
        stdout: &mut dyn Write,
        env: &mut Environment,
    ) -> Option<ExitCode> {
        let cmd = self.factories.iter().find_map(|f| f.try_create(name, args))?;
        tracing::debug!(target: "commands", name, ?args, "running builtin");
        Some(cmd.execute(stdin, stdout, env))
    }
}

impl Default for Builtins {
    /// The builtins shipped with the shell: `cut`, `remind` and `chatroom`.
    fn default() -> Self {
        Self::new(vec![
            Box::new(Factory::<Cut>::default()),
            Box::new(Factory::<Remind>::default()),
            Box::new(Factory::<Chatroom>::default()),
        ])
    }
}

/// Splits glued short options such as `-d:` or `-f1,3` into two arguments.
fn split_glued(args: &[&str], options: &[&str]) -> Vec<String> {
    let mut out = Vec::with_capacity(args.len());
    for arg in args {
        match options.iter().find(|o| arg.len() > o.len() && arg.starts_with(**o)) {
            Some(option) => {
                out.push(option.to_string());
                out.push(arg[option.len()..].to_string());
            }
            None => out.push(arg.to_string()),
        }
    }
    out
}

#[derive(FromArgs)]
/// print selected fields of every line read from standard input.
pub struct Cut {
    #[argh(option, short = 'd', default = "'\\t'")]
    /// field delimiter, a single character (default: tab).
    pub delimiter: char,

    #[argh(option, short = 'f')]
    /// comma separated list of 1-based field numbers to print, in order.
    pub fields: String,
}

impl Cut {
    fn field_list(&self) -> Result<Vec<usize>> {
        self.fields
            .split(',')
            .filter(|f| !f.is_empty())
            .map(|f| {
                f.trim()
                    .parse::<usize>()
                    .with_context(|| format!("invalid field value '{f}'"))
            })
            .collect()
    }
}

impl BuiltinCommand for Cut {
    fn name() -> &'static str {
        "cut"
    }

    fn normalize_args(args: &[&str]) -> Vec<String> {
        split_glued(args, &["-d", "-f"])
    }

    fn execute(
        self,
        stdin: &mut dyn Read,
        stdout: &mut dyn Write,
        _env: &mut Environment,
    ) -> Result<ExitCode> {
        let fields = self.field_list()?;
        if fields.is_empty() {
            bail!("no fields specified");
        }

        let delimiter = self.delimiter.to_string();
        for line in BufReader::new(stdin).lines() {
            let line = line.context("read error")?;
            let parts: Vec<&str> = line.split(self.delimiter).collect();
            let selected: Vec<&str> = fields
                .iter()
                .filter(|&&f| f >= 1 && f <= parts.len())
                .map(|&f| parts[f - 1])
                .collect();
            writeln!(stdout, "{}", selected.join(&delimiter))?;
        }
        Ok(0)
    }
}

#[derive(FromArgs)]
/// print a message after a delay without holding up the shell.
pub struct Remind {
    #[argh(positional)]
    /// how many seconds to wait.
    pub seconds: u64,

    #[argh(positional, greedy)]
    /// the reminder text.
    pub message: Vec<String>,
}

impl BuiltinCommand for Remind {
    fn name() -> &'static str {
        "remind"
    }

    fn execute(
        self,
        _stdin: &mut dyn Read,
        stdout: &mut dyn Write,
        _env: &mut Environment,
    ) -> Result<ExitCode> {
        if self.seconds == 0 {
            bail!("seconds should be positive");
        }
        if self.message.is_empty() {
            bail!("usage: remind <seconds> <message...>");
        }
        let message = self.message.join(" ");

        stdout.flush()?;
        // SAFETY: the child only sleeps, writes and exits.
        match unsafe { fork() }.context("fork failed")? {
            ForkResult::Child => {
                std::thread::sleep(Duration::from_secs(self.seconds));
                let _ = write!(stdout, "\n\r\x07[REMINDER] {message}\n");
                let _ = stdout.flush();
                // SAFETY: leaves the timer process without running exit handlers.
                unsafe { nix::libc::_exit(0) }
            }
            ForkResult::Parent { child } => {
                tracing::debug!(target: "jobs", pid = %child, "reminder scheduled");
                writeln!(
                    stdout,
                    "[Reminder set for {} seconds from now (PID: {child})]",
                    self.seconds
                )?;
                Ok(0)
            }
        }
    }
}

#[derive(FromArgs)]
/// chat with other shells through named pipes under /tmp.
pub struct Chatroom {
    #[argh(positional)]
    /// name of the room to join.
    pub room: String,

    #[argh(positional)]
    /// your name in the room.
    pub user: String,
}

const QUIT_COMMAND: &str = "\\quit";

impl Chatroom {
    fn room_dir(&self) -> PathBuf {
        PathBuf::from(format!("/tmp/chatroom-{}", self.room))
    }

    fn prompt(&self) -> String {
        format!("[{}] {} > ", self.room, self.user)
    }

    /// Prints everything written to our pipe, until the process goes away.
    fn spawn_listener(&self, pipe: &Path) -> Result<()> {
        // Opened read-write so the read side never sees EOF when writers leave.
        let mut incoming = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(pipe)
            .with_context(|| format!("can't open {}", pipe.display()))?;
        let room = self.room.clone();
        let prompt = self.prompt();

        std::thread::spawn(move || {
            let mut buf = [0u8; 1024];
            while let Ok(n) = incoming.read(&mut buf) {
                if n == 0 {
                    break;
                }
                let text = String::from_utf8_lossy(&buf[..n]);
                let mut out = std::io::stdout().lock();
                let _ = write!(out, "\r\x1b[2K[{room}] {text}\n{prompt}");
                let _ = out.flush();
            }
        });
        Ok(())
    }
}

/// Writes `message` to every other participant's pipe in `dir`.
///
/// Pipes are opened non-blocking, so a participant that has gone away without
/// cleaning up is skipped instead of hanging the sender.
fn broadcast(dir: &Path, sender: &str, message: &str) -> Result<()> {
    for entry in fs::read_dir(dir).with_context(|| format!("can't list {}", dir.display()))? {
        let entry = entry?;
        if entry.file_name() == sender || !entry.file_type()?.is_fifo() {
            continue;
        }
        let target = fs::OpenOptions::new()
            .write(true)
            .custom_flags(nix::libc::O_NONBLOCK)
            .open(entry.path());
        if let Ok(mut target) = target {
            let _ = target.write_all(message.as_bytes());
        }
    }
    Ok(())
}

impl BuiltinCommand for Chatroom {
    fn name() -> &'static str {
        "chatroom"
    }

    fn execute(
        self,
        stdin: &mut dyn Read,
        stdout: &mut dyn Write,
        _env: &mut Environment,
    ) -> Result<ExitCode> {
        let dir = self.room_dir();
        fs::DirBuilder::new()
            .recursive(true)
            .mode(0o777)
            .create(&dir)
            .with_context(|| format!("can't create {}", dir.display()))?;

        let pipe = dir.join(&self.user);
        match mkfifo(&pipe, Mode::from_bits_truncate(0o666)) {
            Ok(()) | Err(nix::errno::Errno::EEXIST) => {}
            Err(e) => return Err(e).with_context(|| format!("can't create {}", pipe.display())),
        }

        writeln!(stdout, "entered room {}", self.room)?;
        self.spawn_listener(&pipe)?;

        let mut lines = BufReader::new(stdin).lines();
        loop {
            write!(stdout, "{}", self.prompt())?;
            stdout.flush()?;
            let Some(line) = lines.next() else { break };
            let line = line.context("read error")?;
            let line = line.trim_end();
            if line == QUIT_COMMAND {
                break;
            }
            if line.is_empty() {
                continue;
            }
            broadcast(&dir, &self.user, &format!("{}: {line}", self.user))?;
        }

        fs::remove_file(&pipe).with_context(|| format!("can't remove {}", pipe.display()))?;
        Ok(0)
    }
}
