use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use futures::StreamExt;
use futures::stream::BoxStream;
use tokio::io::AsyncBufReadExt;
use tokio_stream::wrappers::LinesStream;

use wavecraft_control::ControlPlaneClient;
use wavecraft_core::config::{Config, LoggingConfig};
use wavecraft_media::{AudioSink, NullSink, PcmWriter, TurnRunner, WsConnector};

#[derive(Parser)]
#[command(
    name = "wavecraft",
    about = "Stream text to a speech synthesis service and play the audio as it arrives",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Speak one turn. Text comes from --text, or from stdin one fragment per line.
    Speak {
        /// Text fragment to send (repeatable)
        #[arg(short, long)]
        text: Vec<String>,

        /// Intent sent to the control plane (defaults to the text)
        #[arg(long)]
        intent: Option<String>,

        /// Where to play the audio
        #[arg(long, value_enum, default_value_t = Output::None)]
        output: Output,

        /// Save the turn's audio as WAV in this directory
        #[arg(long)]
        record_dir: Option<PathBuf>,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration
    Show,
    /// Validate the configuration
    Check,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Output {
    /// Discard audio
    None,
    /// Raw PCM on stdout, for piping into a player
    Stdout,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load config
    let config_path = cli
        .config
        .map(PathBuf::from)
        .unwrap_or_else(Config::config_path);
    let config = Config::load(&config_path)?;

    // Audio on stdout must not be interleaved with log lines.
    let pcm_on_stdout = matches!(
        cli.command,
        Commands::Speak {
            output: Output::Stdout,
            ..
        }
    );
    init_logging(
        &config.logging.clone().unwrap_or_default(),
        cli.verbose,
        pcm_on_stdout,
    );

    match cli.command {
        Commands::Speak {
            text,
            intent,
            output,
            record_dir,
        } => {
            let intent = intent.unwrap_or_else(|| {
                if text.is_empty() {
                    "stream".to_string()
                } else {
                    text.concat()
                }
            });

            let source: BoxStream<'static, anyhow::Result<String>> = if text.is_empty() {
                let lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
                LinesStream::new(lines)
                    .map(|line| line.map_err(anyhow::Error::from))
                    .boxed()
            } else {
                futures::stream::iter(text.into_iter().map(Ok)).boxed()
            };

            let sink: Box<dyn AudioSink> = match output {
                Output::None => Box::new(NullSink),
                Output::Stdout => Box::new(PcmWriter::new(tokio::io::stdout())),
            };

            let client = Arc::new(ControlPlaneClient::new(config.control_plane()));
            let mut runner = TurnRunner::new(client.clone(), Arc::new(WsConnector), config.session())
                .with_settlement(client);
            if let Some(dir) = record_dir.or_else(|| config.audio().record_dir()) {
                runner = runner.with_recording(dir, config.audio());
            }

            let report = runner.run_turn(&intent, source, sink).await?;
            let json = serde_json::to_string_pretty(&report)?;
            if pcm_on_stdout {
                eprintln!("{json}");
            } else {
                println!("{json}");
            }
        }
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                let mut shown = config.clone();
                if let Some(cp) = shown.control_plane.as_mut() {
                    if cp.auth_token.is_some() {
                        cp.auth_token = Some("********".into());
                    }
                }
                let json = serde_json::to_string_pretty(&shown)?;
                println!("{json}");
            }
            ConfigAction::Check => {
                println!("Config: {}", config_path.display());
                let (warnings, errors) = config.validate();
                for w in &warnings {
                    println!("  warning: {w}");
                }
                for e in &errors {
                    println!("  error: {e}");
                }
                if !errors.is_empty() {
                    anyhow::bail!("{} configuration error(s)", errors.len());
                }
                println!("OK");
            }
        },
    }

    Ok(())
}

fn init_logging(logging: &LoggingConfig, verbose: bool, force_stderr: bool) {
    use tracing_subscriber::EnvFilter;

    let mut directives = if verbose {
        "debug".to_string()
    } else {
        logging.level.clone().unwrap_or_else(|| "info".into())
    };
    for filter in &logging.filters {
        directives.push(',');
        directives.push_str(filter);
    }

    let filter = if verbose {
        EnvFilter::new(directives)
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directives))
    };

    let json = logging.format == "json";
    let stdout = logging.output == "stdout" && !force_stderr;
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match (json, stdout) {
        (true, true) => builder.json().with_writer(std::io::stdout).init(),
        (true, false) => builder.json().with_writer(std::io::stderr).init(),
        (false, true) => builder.with_writer(std::io::stdout).init(),
        (false, false) => builder.with_writer(std::io::stderr).init(),
    }
}
