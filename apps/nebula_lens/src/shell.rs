//! Line-oriented interactive session. Commands and session events are handled
//! on one task so panel output never interleaves with a half-typed explanation.

use std::io::{self, Write};

use anyhow::{Context, Result};
use client_core::{Session, SessionEvent, SubmitError};
use shared::domain::{ClassLabel, Feature};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::broadcast::error::RecvError,
};
use tracing::{debug, warn};

use crate::{render, reveal::RevealCursor};

const HELP: &str = "\
commands:
  set <field> <value>   field is one of u, g, r, i, z, redshift
  clear <field>
  preset <star|galaxy|qso>
  form                  show the parameter form
  predict               submit the form
  show                  show the current result
  log                   prediction history, newest first
  help
  quit
";

#[derive(Debug, Clone, Copy, PartialEq)]
enum ShellCommand {
    Set(Feature, f64),
    Clear(Feature),
    Preset(ClassLabel),
    Form,
    Predict,
    Show,
    Log,
    Help,
    Quit,
}

fn parse_command(line: &str) -> Result<ShellCommand, String> {
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        return Err("empty command".into());
    };
    let command = match verb.to_ascii_lowercase().as_str() {
        "set" => {
            let feature = parse_feature(words.next())?;
            let raw = words.next().ok_or("usage: set <field> <value>")?;
            let value = raw
                .parse::<f64>()
                .map_err(|err| format!("invalid value '{raw}': {err}"))?;
            ShellCommand::Set(feature, value)
        }
        "clear" => ShellCommand::Clear(parse_feature(words.next())?),
        "preset" => {
            let raw = words.next().ok_or("usage: preset <star|galaxy|qso>")?;
            match raw.parse::<ClassLabel>() {
                Ok(class) if !class.is_error() => ShellCommand::Preset(class),
                _ => return Err(format!("no example object for '{raw}'")),
            }
        }
        "form" => ShellCommand::Form,
        "predict" | "submit" => ShellCommand::Predict,
        "show" => ShellCommand::Show,
        "log" | "history" => ShellCommand::Log,
        "help" | "?" => ShellCommand::Help,
        "quit" | "exit" => ShellCommand::Quit,
        other => return Err(format!("unknown command '{other}', try 'help'")),
    };
    if words.next().is_some() {
        return Err(format!("too many arguments for '{verb}'"));
    }
    Ok(command)
}

fn parse_feature(raw: Option<&str>) -> Result<Feature, String> {
    let raw = raw.ok_or("missing field name")?;
    raw.parse().map_err(|err: shared::domain::UnknownFeature| err.to_string())
}

fn prompt() -> Result<()> {
    let mut stdout = io::stdout();
    write!(stdout, "nebula> ")?;
    stdout.flush()?;
    Ok(())
}

pub async fn run(session: Session) -> Result<()> {
    let mut events = session.subscribe();
    let mut cursor = RevealCursor::default();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    print!("{}", render::placeholder());
    print!("{HELP}");
    prompt()?;

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("failed to read stdin")? else {
                    break;
                };
                if line.trim().is_empty() {
                    prompt()?;
                    continue;
                }
                match parse_command(&line) {
                    Ok(ShellCommand::Quit) => break,
                    Ok(command) => execute(&session, command).await,
                    Err(message) => println!("{message}"),
                }
                prompt()?;
            }
            event = events.recv() => match event {
                Ok(event) => on_event(&session, &mut cursor, event).await?,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "shell fell behind session events");
                    let snapshot = session.snapshot().await;
                    let missing =
                        cursor.resync(snapshot.explanation_generation, &snapshot.explanation);
                    print!("{missing}");
                    io::stdout().flush()?;
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    session.teardown().await;
    Ok(())
}

async fn execute(session: &Session, command: ShellCommand) {
    match command {
        ShellCommand::Set(feature, value) => session.set_field(feature, value).await,
        ShellCommand::Clear(feature) => session.clear_field(feature).await,
        ShellCommand::Preset(class) => {
            session.load_preset(class).await;
            print!("{}", render::form(&session.form().await));
        }
        ShellCommand::Form => print!("{}", render::form(&session.form().await)),
        ShellCommand::Predict => match session.submit_form().await {
            Ok(seq) => debug!(seq = seq.0, "submitted"),
            Err(SubmitError::Incomplete(missing)) => println!("{missing}"),
            Err(err) => println!("{err}"),
        },
        ShellCommand::Show => {
            let snapshot = session.snapshot().await;
            print!("{}", render::result_panels(&snapshot.result));
            if snapshot.explanations_enabled {
                print!("{}", render::explanation_panel(&snapshot.explanation));
            }
        }
        ShellCommand::Log => print!("{}", render::prediction_log(&session.snapshot().await.log)),
        ShellCommand::Help => print!("{HELP}"),
        ShellCommand::Quit => {}
    }
}

async fn on_event(
    session: &Session,
    cursor: &mut RevealCursor,
    event: SessionEvent,
) -> Result<()> {
    let mut stdout = io::stdout();
    match event {
        SessionEvent::PredictionStarted { .. } => {
            write!(stdout, "\n{}", render::loading())?;
        }
        SessionEvent::PredictionReady { .. } | SessionEvent::PredictionFailed { .. } => {
            let snapshot = session.snapshot().await;
            write!(stdout, "{}", render::result_panels(&snapshot.result))?;
            prompt()?;
        }
        SessionEvent::ExplanationFetching { .. } => {
            write!(stdout, "{}{}", render::EXPLANATION_HEADER, render::ANALYZING)?;
        }
        SessionEvent::ExplanationAppended {
            generation,
            index,
            ch,
        } => {
            if let Some(ch) = cursor.append(generation, index, ch) {
                write!(stdout, "{ch}")?;
            }
        }
        SessionEvent::ExplanationComplete { .. } => {
            writeln!(stdout)?;
            prompt()?;
        }
        SessionEvent::ExplanationFailed { error, .. } => {
            writeln!(stdout, "Error: {}", error.message)?;
            prompt()?;
        }
        SessionEvent::ExplanationShown { .. }
        | SessionEvent::StalePredictionDiscarded { .. }
        | SessionEvent::StaleExplanationDiscarded { .. }
        | SessionEvent::TornDown => {}
    }
    stdout.flush()?;
    Ok(())
}
