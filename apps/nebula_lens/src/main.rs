mod render;
mod reveal;
mod shell;

use std::{
    io::{self, Write},
    path::PathBuf,
    sync::Arc,
};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use client_core::{
    load_settings, ExplanationState, HttpInferenceApi, InferenceApi, ResultState, Session,
    SessionEvent, SessionSettings, SubmitError,
};
use shared::domain::{ClassLabel, Feature, RequestSeq};
use tokio::sync::broadcast::{error::RecvError, Receiver};
use tracing_subscriber::EnvFilter;

use crate::reveal::RevealCursor;

#[derive(Parser, Debug)]
#[command(name = "nebula_lens", about = "Classify SDSS objects with a model ensemble")]
struct Cli {
    /// TOML settings file; defaults to ./nebula_lens.toml when present.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, global = true)]
    api_url: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Submit one set of parameters and print the result panels.
    Predict(PredictArgs),
    /// Interactive session with a shared prediction log.
    Shell,
    /// Feature importance reported by the service.
    Features,
    /// Pre-computed test-set metrics of each model.
    Metrics,
    Health,
}

#[derive(Args, Debug)]
struct PredictArgs {
    /// Start from an example object; individual flags override its values.
    #[arg(long, value_enum)]
    preset: Option<Preset>,
    #[arg(long, allow_hyphen_values = true)]
    u: Option<f64>,
    #[arg(long, allow_hyphen_values = true)]
    g: Option<f64>,
    #[arg(long, allow_hyphen_values = true)]
    r: Option<f64>,
    #[arg(long, allow_hyphen_values = true)]
    i: Option<f64>,
    #[arg(long, allow_hyphen_values = true)]
    z: Option<f64>,
    #[arg(long, allow_hyphen_values = true)]
    redshift: Option<f64>,
    /// Print the log entry as JSON instead of the panels.
    #[arg(long)]
    json: bool,
}

impl PredictArgs {
    fn values(&self) -> [(Feature, Option<f64>); 6] {
        [
            (Feature::U, self.u),
            (Feature::G, self.g),
            (Feature::R, self.r),
            (Feature::I, self.i),
            (Feature::Z, self.z),
            (Feature::Redshift, self.redshift),
        ]
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Preset {
    Star,
    Galaxy,
    Qso,
}

impl From<Preset> for ClassLabel {
    fn from(value: Preset) -> Self {
        match value {
            Preset::Star => ClassLabel::Star,
            Preset::Galaxy => ClassLabel::Galaxy,
            Preset::Qso => ClassLabel::Qso,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(io::stderr)
        .init();
    let cli = Cli::parse();

    let mut settings = load_settings(cli.config.as_deref())?;
    if let Some(api_url) = cli.api_url {
        settings.api_base_url = api_url;
    }
    let api: Arc<dyn InferenceApi> = Arc::new(HttpInferenceApi::new(&settings)?);

    match cli.command {
        Command::Predict(args) => predict(api, settings.session(), args).await,
        Command::Shell => shell::run(Session::new(api, settings.session())).await,
        Command::Features => {
            let weights = api
                .feature_importance()
                .await
                .context("failed to fetch feature importance")?;
            print!("{}", render::feature_importance(&weights));
            Ok(())
        }
        Command::Metrics => {
            print!("{}", render::model_metrics());
            Ok(())
        }
        Command::Health => {
            let health = api.health().await.context("health check failed")?;
            println!("status={}", health.status);
            Ok(())
        }
    }
}

async fn predict(
    api: Arc<dyn InferenceApi>,
    settings: SessionSettings,
    args: PredictArgs,
) -> Result<()> {
    let session = Session::new(api, settings);
    if let Some(preset) = args.preset {
        session.load_preset(preset.into()).await;
    }
    for (feature, value) in args.values() {
        if let Some(value) = value {
            session.set_field(feature, value).await;
        }
    }

    let mut events = session.subscribe();
    let seq = match session.submit_form().await {
        Ok(seq) => seq,
        Err(SubmitError::Incomplete(missing)) => {
            bail!("{missing}; pass --preset or the missing flags")
        }
        Err(err) => return Err(err.into()),
    };
    if !args.json {
        print!("{}", render::loading());
    }
    wait_for_outcome(&mut events, seq).await?;

    let snapshot = session.snapshot().await;
    if args.json {
        if let Some(entry) = snapshot.log.first() {
            println!("{}", serde_json::to_string_pretty(entry)?);
        }
    } else {
        print!("{}", render::result_panels(&snapshot.result));
    }

    let explain =
        matches!(&snapshot.result, ResultState::Ready(ready) if !ready.consensus.is_unknown());
    if explain && snapshot.explanations_enabled && !args.json {
        stream_explanation(&session, &mut events).await?;
    }

    let failed = matches!(snapshot.result, ResultState::Failed(_));
    session.teardown().await;
    if failed {
        bail!("prediction failed");
    }
    Ok(())
}

async fn wait_for_outcome(events: &mut Receiver<SessionEvent>, seq: RequestSeq) -> Result<()> {
    loop {
        match events.recv().await {
            Ok(SessionEvent::PredictionReady { seq: done, .. })
            | Ok(SessionEvent::PredictionFailed { seq: done, .. })
                if done == seq =>
            {
                return Ok(())
            }
            Ok(_) | Err(RecvError::Lagged(_)) => {}
            Err(RecvError::Closed) => bail!("session closed before the prediction finished"),
        }
    }
}

async fn stream_explanation(
    session: &Session,
    events: &mut Receiver<SessionEvent>,
) -> Result<()> {
    let mut stdout = io::stdout();
    let mut cursor = RevealCursor::default();
    write!(stdout, "{}", render::EXPLANATION_HEADER)?;
    loop {
        match events.recv().await {
            Ok(SessionEvent::ExplanationFetching { .. }) => {
                write!(stdout, "{}", render::ANALYZING)?;
                stdout.flush()?;
            }
            Ok(SessionEvent::ExplanationAppended {
                generation,
                index,
                ch,
            }) => {
                if let Some(ch) = cursor.append(generation, index, ch) {
                    write!(stdout, "{ch}")?;
                    stdout.flush()?;
                }
            }
            Ok(SessionEvent::ExplanationComplete { .. }) => {
                writeln!(stdout)?;
                return Ok(());
            }
            Ok(SessionEvent::ExplanationFailed { error, .. }) => {
                writeln!(stdout, "Error: {}", error.message)?;
                return Ok(());
            }
            Err(RecvError::Lagged(_)) => {
                let snapshot = session.snapshot().await;
                let missing =
                    cursor.resync(snapshot.explanation_generation, &snapshot.explanation);
                write!(stdout, "{missing}")?;
                stdout.flush()?;
                // The terminal event may have been among the dropped ones.
                match &snapshot.explanation {
                    ExplanationState::Shown(reveal) if reveal.is_complete() => {
                        writeln!(stdout)?;
                        return Ok(());
                    }
                    ExplanationState::Failed(error) => {
                        writeln!(stdout, "Error: {}", error.message)?;
                        return Ok(());
                    }
                    _ => {}
                }
            }
            Ok(_) => {}
            Err(RecvError::Closed) => return Ok(()),
        }
    }
}
