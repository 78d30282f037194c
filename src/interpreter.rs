use crate::builtin::Builtins;
use crate::env::Environment;
use crate::error::{SHELL_NAME, report};
use crate::parser::parse_line;
use crate::pipeline::{Flow, Orchestrator};
use anyhow::Context;
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use std::io::{BufRead, Write};

/// The read-parse-execute loop around an [`Orchestrator`].
///
/// Owns the [`Environment`] that `cd` mutates, and the background processes
/// started from earlier lines.
///
/// Example
/// ```no_run
/// use shellish::{Flow, Interpreter};
/// let mut sh = Interpreter::default();
/// assert_eq!(sh.execute_line("ls -l | wc -l"), Flow::Continue);
/// ```
pub struct Interpreter {
    env: Environment,
    orchestrator: Orchestrator,
}

impl Interpreter {
    /// Create an interpreter dispatching to the given builtins.
    pub fn new(builtins: Builtins) -> Self {
        Self {
            env: Environment::new(),
            orchestrator: Orchestrator::new(builtins),
        }
    }

    pub fn env(&self) -> &Environment {
        &self.env
    }

    /// One cycle: report finished background work, then parse and run `line`.
    ///
    /// Errors are reported on stderr and never end the loop; only `exit`
    /// yields [`Flow::Stop`].
    pub fn execute_line(&mut self, line: &str) -> Flow {
        self.report_finished_jobs();

        let chain = match parse_line(line) {
            Ok(chain) => chain,
            Err(e) => {
                report("parse", e);
                return Flow::Continue;
            }
        };
        if chain.wants_completion() {
            tracing::debug!(target: "parse", prefix = %chain.stages[0].name, "completion requested");
        }

        match self.orchestrator.execute(&chain, &mut self.env) {
            Ok(flow) => flow,
            Err(e) => {
                let name = chain.stages.first().map_or("", |s| s.name.as_str());
                report(name, e);
                Flow::Continue
            }
        }
    }

    /// Runs a single line, as given to `-c`.
    pub fn run_command(&mut self, line: &str) -> Flow {
        let flow = self.execute_line(line);
        self.report_finished_jobs();
        flow
    }

    /// Runs every line of `input` until it ends or a line says `exit`.
    ///
    /// Bytes that aren't valid UTF-8 are replaced rather than rejected.
    pub fn run_script(&mut self, mut input: impl BufRead) -> anyhow::Result<()> {
        let mut buf = Vec::new();
        loop {
            buf.clear();
            let read = input
                .read_until(b'\n', &mut buf)
                .context("failed to read input")?;
            if read == 0 {
                return Ok(());
            }
            let line = String::from_utf8_lossy(&buf);
            if self.execute_line(&line) == Flow::Stop {
                return Ok(());
            }
        }
    }

    /// Interactive loop with line editing and history.
    ///
    /// Ctrl-C drops the current line, Ctrl-D leaves.
    pub fn repl(&mut self) -> rustyline::Result<()> {
        let mut rl = DefaultEditor::new()?;

        loop {
            match rl.readline(&self.prompt()) {
                Ok(line) => {
                    if !line.trim().is_empty() {
                        rl.add_history_entry(line.as_str())?;
                    }
                    if self.execute_line(&line) == Flow::Stop {
                        break;
                    }
                }
                Err(ReadlineError::Interrupted) => continue,
                Err(ReadlineError::Eof) => break,
                Err(err) => {
                    tracing::warn!(%err, "failed to read a line");
                    return Err(err);
                }
            }
        }

        Ok(())
    }

    /// `USER@HOST:CWD shellish$ `
    fn prompt(&self) -> String {
        let user = self.env.get_var("USER").unwrap_or("?");
        let host = nix::unistd::gethostname()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "localhost".to_string());
        format!(
            "{user}@{host}:{} {SHELL_NAME}$ ",
            self.env.current_dir.display()
        )
    }

    fn report_finished_jobs(&mut self) {
        let finished = self.orchestrator.reap_background();
        if finished.is_empty() {
            return;
        }
        let mut stdout = std::io::stdout().lock();
        for (pid, status) in finished {
            tracing::debug!(target: "jobs", %pid, status, "background process finished");
            let _ = writeln!(stdout, "[{pid}] done");
        }
        let _ = stdout.flush();
    }
}

impl Default for Interpreter {
    /// An interpreter with the builtins `cut`, `remind` and `chatroom`.
    fn default() -> Self {
        Self::new(Builtins::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::tests::lock_current_dir;
    use std::fs;

    #[test]
    fn test_errors_do_not_stop_the_loop() {
        let mut sh = Interpreter::default();
        assert_eq!(sh.execute_line("nosuchprogram123"), Flow::Continue);
        assert_eq!(sh.execute_line(&"x".repeat(5000)), Flow::Continue);
        assert_eq!(sh.execute_line(""), Flow::Continue);
        assert_eq!(sh.execute_line("  exit  "), Flow::Stop);
    }

    #[test]
    fn test_script_stops_at_exit() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.txt");
        let script = format!(
            "printf a >>{0}\nnosuchprogram123\nexit\nprintf b >>{0}\n",
            out.display()
        );

        let mut sh = Interpreter::default();
        sh.run_script(script.as_bytes()).unwrap();
        assert_eq!(fs::read_to_string(&out).unwrap(), "a");
    }

    #[test]
    fn test_script_runs_to_end_of_input() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.txt");
        let script = format!("printf a >>{0}\nprintf b >>{0}", out.display());

        let mut sh = Interpreter::default();
        sh.run_script(script.as_bytes()).unwrap();
        assert_eq!(fs::read_to_string(&out).unwrap(), "ab");
    }

    #[test]
    fn test_script_survives_invalid_utf8() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.txt");
        let mut script = format!("printf a >>{}\n", out.display()).into_bytes();
        script.extend_from_slice(b"echo \xff\xfe bad\n");
        script.extend_from_slice(format!("printf b >>{}\n", out.display()).as_bytes());

        let mut sh = Interpreter::default();
        sh.run_script(script.as_slice()).unwrap();
        assert_eq!(fs::read_to_string(&out).unwrap(), "ab");
    }

    #[test]
    fn test_cd_persists_across_lines() {
        let _lock = lock_current_dir();
        let orig = std::env::current_dir().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let canonical = dir.path().canonicalize().unwrap();

        let mut sh = Interpreter::default();
        sh.execute_line(&format!("cd {}", canonical.display()));
        sh.execute_line("printf hi >here.txt");

        assert_eq!(sh.env().current_dir, canonical);
        assert_eq!(fs::read_to_string(canonical.join("here.txt")).unwrap(), "hi");
        std::env::set_current_dir(orig).unwrap();
    }

    #[test]
    fn test_prompt_shows_user_and_directory() {
        let mut sh = Interpreter::default();
        sh.env.set_var("USER", "alice");
        let prompt = sh.prompt();
        assert!(prompt.starts_with("alice@"));
        assert!(prompt.ends_with(" shellish$ "));
        assert!(prompt.contains(&sh.env.current_dir.display().to_string()));
    }
}
