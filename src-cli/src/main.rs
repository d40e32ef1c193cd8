//! camrec Command-Line Interface
//!
//! Records a camera to a video file for a fixed duration, and exposes the
//! capture settings, a single-frame snapshot and the configuration file for
//! scripting.

mod colors;
mod commands;
mod exit_codes;
mod logging;

use clap::{Parser, Subcommand};
use exit_codes::ExitCode;

/// camrec - Camera Recording CLI
#[derive(Parser, Debug)]
#[command(name = "camrec")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output in JSON format for scripting
    #[arg(long, global = true)]
    json: bool,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Use the built-in test pattern instead of a camera
    #[arg(long, global = true)]
    synthetic: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Record the camera for a fixed duration
    Record {
        #[command(flatten)]
        options: RecordOptions,
    },
    /// Open the camera and print the settings it accepted
    Probe {
        #[command(flatten)]
        capture: CaptureArgs,
    },
    /// Save a single frame as PNG
    Snapshot {
        /// Output PNG path
        #[arg(short, long)]
        output: String,

        #[command(flatten)]
        capture: CaptureArgs,
    },
    /// Inspect or create the configuration file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Show version information
    Version,
}

#[derive(Subcommand, Debug, Clone)]
pub enum ConfigAction {
    /// Print the effective configuration
    Show,
    /// Print the configuration file path
    Path,
    /// Write a configuration file with default values
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

/// Camera settings that override the configuration file.
#[derive(Parser, Debug, Clone, Default)]
pub struct CaptureArgs {
    /// Camera device index
    #[arg(long)]
    device: Option<u32>,

    /// Requested frame rate
    #[arg(long)]
    fps: Option<f64>,

    /// Gamma correction
    #[arg(long)]
    gamma: Option<f64>,

    /// Brightness offset
    #[arg(long, allow_hyphen_values = true)]
    brightness: Option<f64>,

    /// Frame width in pixels
    #[arg(long, requires = "height")]
    width: Option<u32>,

    /// Frame height in pixels
    #[arg(long, requires = "width")]
    height: Option<u32>,
}

#[derive(Parser, Debug, Clone)]
pub struct RecordOptions {
    /// Output file path (.mp4 or .avi; overrides configured output directory)
    #[arg(short, long)]
    output: Option<String>,

    /// Recording duration in seconds (defaults to the configured duration)
    #[arg(short, long)]
    duration: Option<f64>,

    #[command(flatten)]
    capture: CaptureArgs,
}

fn main() {
    let cli = Cli::parse();
    let log_guard = logging::init_logging(cli.verbose, cli.quiet);

    let exit_code = run(cli);

    // process::exit skips destructors; flush the log file first.
    drop(log_guard);
    std::process::exit(exit_code.as_i32());
}

fn run(cli: Cli) -> ExitCode {
    match cli.command {
        Commands::Record { options } => {
            commands::record(options, cli.json, cli.quiet, cli.synthetic)
        }
        Commands::Probe { capture } => commands::probe(&capture, cli.json, cli.quiet, cli.synthetic),
        Commands::Snapshot { output, capture } => {
            commands::snapshot(&output, &capture, cli.json, cli.quiet, cli.synthetic)
        }
        Commands::Config { action } => commands::config(action, cli.json, cli.quiet),
        Commands::Version => {
            commands::version(cli.json);
            ExitCode::Success
        }
    }
}
