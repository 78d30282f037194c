use crate::error::ShellError;
use std::collections::BTreeMap;
use std::env as stdenv;
use std::ffi::{CString, OsString};
use std::path::{Path, PathBuf};

/// The interpreter's view of its process environment.
///
/// The environment contains:
/// - `vars`: variables handed to every spawned stage (e.g. PATH, HOME).
/// - `current_dir`: the working directory, kept in step with the OS one.
///
/// Only `cd` mutates it, and only in the interpreter process itself.
#[derive(Debug, Clone)]
pub struct Environment {
    /// Key-value store of environment variables.
    pub vars: BTreeMap<String, String>,
    /// The current working directory for command execution.
    pub current_dir: PathBuf,
}

impl Environment {
    /// Capture the current process state into a new `Environment` instance.
    pub fn new() -> Self {
        let vars = stdenv::vars().collect();
        let current_dir = stdenv::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        Self { vars, current_dir }
    }

    /// Get the value of a variable.
    pub fn get_var(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    /// Set or override a variable.
    pub fn set_var(&mut self, key: impl Into<String>, val: impl Into<String>) {
        self.vars.insert(key.into(), val.into());
    }

    /// The raw `PATH` value used for command lookup.
    pub fn search_path(&self) -> Option<OsString> {
        self.get_var("PATH").map(OsString::from)
    }

    /// `KEY=value` strings for `execve`. Pairs containing a NUL byte can't be
    /// passed to a program and are skipped.
    pub fn envp(&self) -> Vec<CString> {
        self.vars
            .iter()
            .filter_map(|(k, v)| CString::new(format!("{k}={v}")).ok())
            .collect()
    }

    /// Changes the working directory of this process.
    ///
    /// With no target, goes to `$HOME`. On success `PWD` and `OLDPWD` follow
    /// along; on failure nothing changes.
    pub fn change_dir(&mut self, target: Option<&str>) -> Result<(), ShellError> {
        let target = match target {
            Some(t) if !t.is_empty() => PathBuf::from(t),
            _ => PathBuf::from(self.get_var("HOME").unwrap_or("/")),
        };

        let failure = |source| ShellError::ChangeDirectoryFailure {
            target: target.clone(),
            source,
        };
        stdenv::set_current_dir(&target).map_err(failure)?;
        let new_dir = stdenv::current_dir().map_err(failure)?;

        let old_dir = std::mem::replace(&mut self.current_dir, new_dir);
        self.set_var("OLDPWD", display(&old_dir));
        self.set_var("PWD", display(&self.current_dir));
        tracing::debug!(target: "commands", dir = %self.current_dir.display(), "changed directory");
        Ok(())
    }
}

impl Default for Environment {
    fn default() -> Self {
        Self::new()
    }
}

fn display(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::{Mutex, MutexGuard, OnceLock};

    /// Serializes tests that touch the process working directory.
    pub(crate) fn lock_current_dir() -> MutexGuard<'static, ()> {
        static MUTEX: OnceLock<Mutex<()>> = OnceLock::new();
        MUTEX
            .get_or_init(|| Mutex::new(()))
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    #[test]
    fn test_env_set_and_get_var() {
        let mut env = Environment {
            vars: BTreeMap::new(),
            current_dir: stdenv::current_dir().unwrap(),
        };

        assert_eq!(env.get_var("SOME_RANDOM_ENV_VAR_12345"), None);
        env.set_var("KEY", "VALUE");
        assert_eq!(env.get_var("KEY"), Some("VALUE"));
        assert_eq!(env.envp(), vec![CString::new("KEY=VALUE").unwrap()]);
    }

    #[test]
    fn test_env_reads_from_process_env() {
        let env = Environment::new();
        assert!(env.search_path().is_some());
    }

    #[test]
    fn test_change_dir_updates_pwd() {
        let _lock = lock_current_dir();
        let orig = stdenv::current_dir().unwrap();
        let temp = tempfile::tempdir().unwrap();
        let canonical = temp.path().canonicalize().unwrap();

        let mut env = Environment::new();
        env.change_dir(Some(canonical.to_str().unwrap())).unwrap();

        assert_eq!(stdenv::current_dir().unwrap(), canonical);
        assert_eq!(env.current_dir, canonical);
        assert_eq!(env.get_var("PWD"), canonical.to_str());
        assert_eq!(env.get_var("OLDPWD"), orig.to_str());

        stdenv::set_current_dir(orig).unwrap();
    }

    #[test]
    fn test_change_dir_defaults_to_home() {
        let _lock = lock_current_dir();
        let orig = stdenv::current_dir().unwrap();
        let temp = tempfile::tempdir().unwrap();
        let canonical = temp.path().canonicalize().unwrap();

        let mut env = Environment::new();
        env.set_var("HOME", canonical.to_str().unwrap());
        env.change_dir(None).unwrap();
        assert_eq!(stdenv::current_dir().unwrap(), canonical);

        stdenv::set_current_dir(orig).unwrap();
    }

    #[test]
    fn test_change_dir_failure_leaves_state_alone() {
        let _lock = lock_current_dir();
        let orig = stdenv::current_dir().unwrap();

        let mut env = Environment::new();
        let before = env.current_dir.clone();
        let err = env.change_dir(Some("/nonexistent/dir/for/shellish")).unwrap_err();

        assert!(matches!(err, ShellError::ChangeDirectoryFailure { .. }));
        assert_eq!(stdenv::current_dir().unwrap(), orig);
        assert_eq!(env.current_dir, before);
    }
}
