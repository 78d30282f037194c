//! A small line-oriented command interpreter.
//!
//! Each input line is parsed into a [`CommandChain`] of stages joined by `|`,
//! with optional `<`, `>` and `>>` redirections per stage and a trailing `&`
//! for background execution. Every stage runs in its own forked process;
//! external programs are looked up on `PATH` and started with `execve`, while
//! a handful of builtins run inside the forked process itself.
//!
//! The main entry point is [`Interpreter`]. The public modules [`command`] and
//! [`env`] expose the parsed command model and the environment context.

mod builtin;
pub mod command;
pub mod env;
mod error;
mod external;
mod interpreter;
mod parser;
mod pipeline;

pub use builtin::{Builtins, CommandFactory, ExecutableCommand};
pub use command::{CommandChain, ExitCode, Stage};
pub use error::ShellError;
pub use external::find_command_path;
pub use interpreter::Interpreter;
pub use parser::{MAX_LINE_LEN, parse_line};
pub use pipeline::{Flow, Orchestrator};
