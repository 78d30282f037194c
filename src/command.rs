use std::path::PathBuf;

/// Conventional process exit code type used by this crate.
///
/// A value of 0 indicates success; any non-zero value indicates failure.
/// This mirrors the convention used by POSIX shells and many command-line tools.
pub type ExitCode = i32;

/// Exit code of a stage whose program could not be found or executed.
pub const EXIT_NOT_FOUND: ExitCode = 127;

/// Where a stage's standard streams are redirected to.
///
/// Each target is the file name exactly as written after the marker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Redirects {
    /// `<file`: replaces standard input.
    pub input: Option<PathBuf>,
    /// `>file`: replaces standard output, truncating the file first.
    pub truncate: Option<PathBuf>,
    /// `>>file`: replaces standard output, appending to the file.
    pub append: Option<PathBuf>,
}

impl Redirects {
    pub fn is_empty(&self) -> bool {
        self.input.is_none() && self.truncate.is_none() && self.append.is_none()
    }
}

/// One unit of a pipeline.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Stage {
    /// Program or builtin name. Empty for a blank line.
    pub name: String,
    /// `argv` as handed to `execve`: the name, every positional word, and a
    /// terminating `None`. Empty when `name` is empty.
    pub arguments: Vec<Option<String>>,
    pub background: bool,
    /// Set when the line ended in `?`. Carried along, never acted upon here.
    pub auto_complete: bool,
    pub redirects: Redirects,
}

impl Stage {
    /// Builds a stage from its positional words, the first one being the name.
    pub fn new(words: Vec<String>) -> Self {
        let name = words.first().cloned().unwrap_or_default();
        let arguments = if words.is_empty() {
            Vec::new()
        } else {
            words.into_iter().map(Some).chain(std::iter::once(None)).collect()
        };
        Self {
            name,
            arguments,
            ..Self::default()
        }
    }

    /// The positional words without the sentinel, name first.
    pub fn words(&self) -> impl Iterator<Item = &str> {
        self.arguments.iter().flatten().map(String::as_str)
    }

    /// First argument after the name, if any.
    pub fn first_arg(&self) -> Option<&str> {
        self.words().nth(1)
    }

    pub fn is_empty(&self) -> bool {
        self.name.is_empty()
    }
}

/// The stages parsed out of one input line, left to right.
///
/// Stage `i` writes into stage `i + 1`; the last stage is the terminal one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandChain {
    pub stages: Vec<Stage>,
}

impl CommandChain {
    pub fn is_background(&self) -> bool {
        self.stages.first().is_some_and(|s| s.background)
    }

    pub fn wants_completion(&self) -> bool {
        self.stages.first().is_some_and(|s| s.auto_complete)
    }

    /// True for a chain that has nothing to run: a blank line.
    pub fn is_noop(&self) -> bool {
        self.stages.len() <= 1 && self.stages.iter().all(Stage::is_empty)
    }
}
