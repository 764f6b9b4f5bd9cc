//! Command-line interface for lines-recorder
//!
//! Handles argument parsing and logging configuration.

use clap::Parser;
use log::LevelFilter;
use std::path::PathBuf;

/// lines-recorder - record a voice take for each line of a text file
#[derive(Parser, Debug)]
#[command(name = "lines-recorder")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Lines file to record (defaults to the last session's file)
    #[arg(short, long)]
    pub script: Option<PathBuf>,

    /// Input device index, as printed by --list-devices
    #[arg(short, long)]
    pub device: Option<usize>,

    /// Print the available input devices and exit
    #[arg(long)]
    pub list_devices: bool,

    /// Increase logging verbosity
    /// -v = info, -vv = debug, -vvv = trace, -vvvv = audio backend too
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long)]
    pub quiet: bool,
}

impl Args {
    /// Get the log level filter based on verbosity flags
    pub fn log_level(&self) -> LevelFilter {
        if self.quiet {
            LevelFilter::Error
        } else {
            match self.verbose {
                0 => LevelFilter::Warn,
                1 => LevelFilter::Info,
                2 => LevelFilter::Debug,
                _ => LevelFilter::Trace,
            }
        }
    }

    /// Audio backend chatter only at -vvvv
    pub fn backend_verbose(&self) -> bool {
        self.verbose >= 4
    }
}

/// Initialize the logging system based on CLI arguments
pub fn init_logging(args: &Args) {
    let mut builder = env_logger::Builder::new();

    // Base level for all modules - keep at warn to suppress noisy deps
    builder.filter_level(LevelFilter::Warn);

    builder.filter_module("lines_recorder", args.log_level());

    if args.backend_verbose() {
        builder.filter_module("cpal", args.log_level());
        builder.filter_module("alsa", args.log_level());
    }

    builder.format_timestamp_millis().init();
}
