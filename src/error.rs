use std::path::PathBuf;

/// Name the interpreter uses when it reports a problem.
pub const SHELL_NAME: &str = "shellish";

/// Errors raised by the interpreter core.
///
/// Failures confined to a spawned stage (a redirect that can't be opened, a
/// command that can't be found) only ever terminate that stage. The remaining
/// kinds abort the current input cycle at most.
#[derive(thiserror::Error, Debug)]
pub enum ShellError {
    #[error("input line is {len} bytes long, the limit is {max}")]
    ParseOverflow { len: usize, max: usize },

    #[error("{}: {source}", target.display())]
    RedirectOpenFailure {
        target: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("command not found")]
    CommandNotFound(String),

    #[error("failed to {action}: {source}")]
    ProcessCreateFailure {
        action: &'static str,
        #[source]
        source: nix::Error,
    },

    #[error("{}: {source}", target.display())]
    ChangeDirectoryFailure {
        target: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ShellError {
    pub(crate) fn process(action: &'static str, source: nix::Error) -> Self {
        Self::ProcessCreateFailure { action, source }
    }
}

/// Writes `shellish: <command>: <message>` to standard error.
///
/// Goes through the raw stderr handle rather than `eprintln!` so the message
/// still reaches descriptor 2 from inside a forked stage.
pub fn report(command: &str, message: impl std::fmt::Display) {
    use std::io::Write;
    let mut stderr = std::io::stderr().lock();
    let _ = if command.is_empty() {
        writeln!(stderr, "{SHELL_NAME}: {message}")
    } else {
        writeln!(stderr, "{SHELL_NAME}: {command}: {message}")
    };
}
