//! Interactive stdin commands

use anyhow::{Result, bail};

use logstream_core::{FilterSpec, LevelFilter, StreamSession};

use crate::output;

pub const HELP: &str = "commands: pause | resume | clear | retry | stats | sources | \
filter <text> | level <LEVEL|ALL> | source <name|*> | help | quit";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    Pause,
    Resume,
    Clear,
    Retry,
    Stats,
    Sources,
    /// Empty text clears the text term
    Filter(String),
    Level(LevelFilter),
    /// `None` matches every source
    Source(Option<String>),
    Help,
    Quit,
}

impl Command {
    /// Parse one input line; blank lines yield `None`
    pub fn parse(line: &str) -> Result<Option<Self>> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }

        let (verb, arg) = match line.split_once(char::is_whitespace) {
            Some((verb, arg)) => (verb, arg.trim()),
            None => (line, ""),
        };

        let command = match verb.to_ascii_lowercase().as_str() {
            "pause" | "p" => Self::Pause,
            "resume" | "r" => Self::Resume,
            "clear" => Self::Clear,
            "retry" => Self::Retry,
            "stats" => Self::Stats,
            "sources" => Self::Sources,
            "filter" | "/" => Self::Filter(arg.to_string()),
            "level" => {
                if arg.is_empty() {
                    bail!("usage: level <LEVEL|ALL>");
                }
                Self::Level(arg.parse()?)
            }
            "source" => match arg {
                "" => bail!("usage: source <name|*>"),
                "*" => Self::Source(None),
                name => Self::Source(Some(name.to_string())),
            },
            "help" | "?" => Self::Help,
            "quit" | "q" | "exit" => Self::Quit,
            other => bail!("unknown command '{other}' (try 'help')"),
        };
        Ok(Some(command))
    }

    /// Run against `session`; `Quit` is handled by the caller
    pub fn apply(self, session: &StreamSession) -> Result<()> {
        match self {
            Self::Pause => {
                session.pause();
                eprintln!("paused");
            }
            Self::Resume => {
                session.resume();
                eprintln!("resumed");
            }
            Self::Clear => {
                session.clear();
                eprintln!("buffer cleared");
            }
            Self::Retry => {
                if !session.retry_now() {
                    eprintln!("nothing to retry ({})", session.state());
                }
            }
            Self::Stats => eprintln!("{}", output::format_stats(&session.state(), &session.stats())),
            Self::Sources => {
                let view = session.filtered();
                if view.sources.is_empty() {
                    eprintln!("no sources buffered yet");
                } else {
                    eprintln!("sources: {}", view.sources.join(", "));
                }
            }
            Self::Filter(text) => update_filter(session, |spec| {
                spec.text = Some(text).filter(|t| !t.is_empty());
            })?,
            Self::Level(level) => update_filter(session, |spec| spec.level = level)?,
            Self::Source(source) => update_filter(session, |spec| spec.source = source)?,
            Self::Help => eprintln!("{HELP}"),
            Self::Quit => {}
        }
        Ok(())
    }
}

fn update_filter(session: &StreamSession, change: impl FnOnce(&mut FilterSpec)) -> Result<()> {
    let mut spec = session.filter();
    change(&mut spec);
    session.set_filter(spec)?;

    let view = session.filtered();
    eprintln!(
        "filter {}: {} of {} buffered entries match",
        output::describe_filter(&session.filter()),
        view.entries.len(),
        view.total
    );
    Ok(())
}
