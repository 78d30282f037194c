use anyhow::Context;
use argh::FromArgs;
use shellish::Interpreter;
use std::io::{self, BufReader, IsTerminal};
use tracing_subscriber::filter::{LevelFilter, Targets};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;

#[derive(FromArgs)]
/// A small command interpreter with pipelines and redirections.
struct ShellArgs {
    /// run this line and exit
    #[argh(option, short = 'c')]
    command: Option<String>,

    /// print debug traces of parsing, commands and jobs to stderr
    #[argh(switch)]
    debug: bool,
}

fn init_tracing(debug: bool) {
    let level = if debug {
        LevelFilter::DEBUG
    } else {
        LevelFilter::WARN
    };
    let layer = tracing_subscriber::fmt::layer()
        .with_writer(io::stderr)
        .without_time()
        .with_target(debug)
        .with_filter(Targets::new().with_default(level));

    if tracing_subscriber::registry().with(layer).try_init().is_err() {
        eprintln!("warning: failed to initialize tracing.");
    }
}

fn main() -> anyhow::Result<()> {
    let args: ShellArgs = argh::from_env();
    init_tracing(args.debug);

    let mut sh = Interpreter::default();
    if let Some(line) = args.command {
        sh.run_command(&line);
    } else if io::stdin().is_terminal() {
        sh.repl().context("interactive session failed")?;
    } else {
        sh.run_script(BufReader::new(io::stdin()))?;
    }
    Ok(())
}
