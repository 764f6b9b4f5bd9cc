//! lines-recorder - record one voice take per line of a text file
//!
//! This is the main entry point for the console recorder.

mod app;
mod audio;
mod cli;
mod settings;
mod state;

use anyhow::Result;
use app::App;
use audio::CaptureSource;
use clap::Parser;
use log::info;

fn main() -> Result<()> {
    // Parse command-line arguments and initialize logging
    let args = cli::Args::parse();
    cli::init_logging(&args);

    if args.list_devices {
        let devices = CaptureSource::enumerate_devices();
        if devices.is_empty() {
            println!("No input devices found.");
        }
        for device in devices {
            println!("{}: {}", device.index, device.name);
        }
        return Ok(());
    }

    info!("Starting lines-recorder");
    let mut app = App::new(&args)?;
    app.run()
}
