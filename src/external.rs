use crate::command::Stage;
use crate::env::Environment;
use crate::error::ShellError;
use nix::unistd::{AccessFlags, access, execve};
use std::borrow::Cow;
use std::convert::Infallible;
use std::ffi::{CString, OsStr};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

/// Resolve a command name the way a typical shell would.
///
/// Behavior:
/// - A name containing `/` (absolute or relative path) is returned as-is,
///   without checking that it exists.
/// - Otherwise each directory of `search_paths` is tried in order and the
///   first `directory/name` that is executable by us wins.
/// - With no `search_paths`, or no match, the name comes back unchanged and
///   the failure surfaces when the program is executed.
pub fn find_command_path<'a>(search_paths: Option<&OsStr>, name: &'a str) -> Cow<'a, Path> {
    if name.contains('/') {
        return Cow::Borrowed(Path::new(name));
    }
    search_paths
        .and_then(|paths| find_in_path(paths, name))
        .map_or(Cow::Borrowed(Path::new(name)), Cow::Owned)
}

fn find_in_path(search_paths: &OsStr, name: &str) -> Option<PathBuf> {
    std::env::split_paths(search_paths)
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    access(path, AccessFlags::X_OK).is_ok()
}

/// Replaces the calling process with the stage's program.
///
/// Does not return on success: the program image takes over this process and
/// keeps every open descriptor, so redirections wired up beforehand stay in
/// effect. Any error means the program could not be started.
pub fn exec_replace(stage: &Stage, env: &Environment) -> Result<Infallible, ShellError> {
    let not_found = || ShellError::CommandNotFound(stage.name.clone());

    let search_paths = env.search_path();
    let program = find_command_path(search_paths.as_deref(), &stage.name);
    let path = CString::new(program.as_os_str().as_bytes()).map_err(|_| not_found())?;
    let argv = stage
        .words()
        .map(CString::new)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| not_found())?;

    execve(&path, &argv, &env.envp()).map_err(|errno| {
        tracing::debug!(target: "commands", program = %program.display(), %errno, "exec failed");
        not_found()
    })
}
