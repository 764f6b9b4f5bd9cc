//! Interactive console shell
//!
//! Shows the current line, takes single-letter commands on stdin and
//! renders engine notifications on a background thread.

use anyhow::{Context, Result};
use crossbeam_channel::Receiver;
use std::io::{self, BufRead, Write};
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use crate::audio::{
    duration_seconds, take_duration, AudioEngine, CaptureSource, EngineEvent, EngineState,
    SAMPLE_RATE,
};
use crate::cli::Args;
use crate::settings;
use crate::state::{LineScript, Session, SessionStore};

/// Minimum time between two meter redraws
const METER_INTERVAL: Duration = Duration::from_millis(50);
const METER_WIDTH: usize = 30;

const HELP: &str = "\
commands:
  r        start/stop recording
  p        start/stop playback of the last take
  n / b    next / previous line
  g <n>    go to line n
  d        list input devices
  d <i>    use input device i
  s        status
  h        this help
  q        quit";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    Record,
    Play,
    Next,
    Prev,
    GoTo(usize),
    Devices,
    Device(usize),
    Status,
    Help,
    Quit,
    Unknown(String),
}

fn parse_command(input: &str) -> Command {
    let mut parts = input.split_whitespace();
    let Some(head) = parts.next() else {
        return Command::Unknown(String::new());
    };
    let arg = parts.next().map(str::parse::<usize>);

    match (head, arg) {
        ("r", None) => Command::Record,
        ("p", None) => Command::Play,
        ("n", None) => Command::Next,
        ("b", None) => Command::Prev,
        ("g", Some(Ok(line))) if line > 0 => Command::GoTo(line - 1),
        ("d", None) => Command::Devices,
        ("d", Some(Ok(index))) => Command::Device(index),
        ("s", None) => Command::Status,
        ("h" | "?", None) => Command::Help,
        ("q", None) => Command::Quit,
        _ => Command::Unknown(input.trim().to_string()),
    }
}

/// Text meter for a level in [0.0, 1.0]
fn meter(level: f32, width: usize) -> String {
    let filled = ((level.clamp(0.0, 1.0) * width as f32).round() as usize).min(width);
    format!(
        "[{}{}] {:3}%",
        "#".repeat(filled),
        "-".repeat(width - filled),
        (level.clamp(0.0, 1.0) * 100.0) as u32
    )
}

pub struct App {
    engine: AudioEngine,
    script: Option<LineScript>,
    sessions: SessionStore,
}

impl App {
    pub fn new(args: &Args) -> Result<Self> {
        let sessions = SessionStore::new();
        let device = args.device.or_else(saved_device_index);
        let engine = AudioEngine::new(device)?;

        let mut script = None;
        if let Some(path) = &args.script {
            script = Some(LineScript::load(path)?);
        } else {
            match sessions.load() {
                Ok(Some(session)) => match LineScript::load(&session.script) {
                    Ok(mut resumed) => {
                        resumed.go_to(session.line as isize);
                        script = Some(resumed);
                    }
                    Err(e) => log::warn!("Not resuming last session: {:#}", e),
                },
                Ok(None) => {}
                Err(e) => log::warn!("Ignoring session file: {:#}", e),
            }
        }

        let app = Self {
            engine,
            script,
            sessions,
        };
        app.retarget()?;
        Ok(app)
    }

    /// Run the command loop until `q` or end of input
    pub fn run(&mut self) -> Result<()> {
        let events = self.engine.subscribe();
        thread::Builder::new()
            .name("notifications".to_string())
            .spawn(move || render_events(events))
            .context("Failed to spawn notification thread")?;

        if !self.engine.has_capture() {
            println!("No microphone available; recording is disabled.");
        }
        println!("{}", HELP);
        self.show_line();

        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            let line = line.context("Failed to read command")?;
            match parse_command(&line) {
                Command::Quit => break,
                command => {
                    if let Err(e) = self.execute(command) {
                        println!("error: {:#}", e);
                    }
                }
            }
        }

        self.save_session();
        Ok(())
    }

    fn execute(&mut self, command: Command) -> Result<()> {
        match command {
            Command::Record => self.toggle_recording()?,
            Command::Play => {
                if self.engine.state() == EngineState::Playing {
                    self.engine.stop_play();
                } else {
                    self.engine.play()?;
                }
            }
            Command::Next => self.navigate(LineScript::next)?,
            Command::Prev => self.navigate(LineScript::prev)?,
            Command::GoTo(line) => self.navigate(|s| s.go_to(line as isize))?,
            Command::Devices => {
                let current = self.engine.current_device().map(|d| d.index);
                let devices = self.engine.devices();
                if devices.is_empty() {
                    println!("No input devices.");
                }
                for device in devices {
                    let marker = if Some(device.index) == current { "*" } else { " " };
                    println!("{} {}: {}", marker, device.index, device.name);
                }
            }
            Command::Device(index) => {
                let name = self
                    .engine
                    .devices()
                    .into_iter()
                    .find(|d| d.index == index)
                    .map(|d| d.name);
                self.engine.select_device(index)?;
                if let Some(name) = name {
                    settings::set_input_device(&name);
                    println!("Switching to {}", name);
                }
            }
            Command::Status => self.show_status(),
            Command::Help => println!("{}", HELP),
            Command::Unknown(input) => {
                if !input.is_empty() {
                    println!("unknown command '{}' (h for help)", input);
                }
            }
            Command::Quit => {}
        }
        Ok(())
    }

    fn navigate(&mut self, step: impl FnOnce(&mut LineScript)) -> Result<()> {
        let Some(script) = self.script.as_mut() else {
            println!("No lines file loaded; start with --script <file>");
            return Ok(());
        };
        step(script);
        self.retarget()?;
        self.save_session();
        self.show_line();
        Ok(())
    }

    fn toggle_recording(&mut self) -> Result<()> {
        if self.engine.state() == EngineState::Recording {
            if let Some(path) = self.engine.stop_recording()? {
                report_take(&path);
            }
            return Ok(());
        }

        // An aborted take was already shown when it stopped; clear it
        if let Err(e) = self.engine.stop_recording() {
            log::debug!("Clearing failure of previous take: {}", e);
        }
        if self.script.is_none() {
            println!("No lines file loaded; start with --script <file>");
            return Ok(());
        }
        self.retarget()?;
        self.engine.start_recording()?;
        Ok(())
    }

    /// Point the engine at the current line's take directory
    fn retarget(&self) -> Result<()> {
        if let Some(script) = &self.script {
            let dir = script.ensure_take_dir()?;
            self.engine.set_target_dir(dir);
        }
        Ok(())
    }

    fn show_line(&self) {
        match &self.script {
            Some(script) => println!(
                "\n{} / {}  {}",
                script.index() + 1,
                script.len(),
                script.current()
            ),
            None => println!("\nPlease load a lines file"),
        }
    }

    fn show_status(&self) {
        let device = self
            .engine
            .current_device()
            .map(|d| d.name)
            .unwrap_or_else(|| "none".to_string());
        println!("state:  {:?}", self.engine.state());
        println!("input:  {}", device);
        println!("level:  {}", meter(self.engine.level(), METER_WIDTH));
        println!(
            "last take: {:.2} s in memory",
            duration_seconds(self.engine.buffered_samples(), SAMPLE_RATE)
        );
    }

    fn save_session(&self) {
        let Some(script) = &self.script else { return };
        let session = Session {
            script: script.path().to_path_buf(),
            line: script.index(),
        };
        if let Err(e) = self.sessions.save(&session) {
            log::warn!("Failed to save session: {:#}", e);
        }
    }
}

/// Resolve the remembered input device name to its current index
fn saved_device_index() -> Option<usize> {
    let name = settings::get_input_device()?;
    let index = CaptureSource::enumerate_devices()
        .into_iter()
        .find(|d| d.name == name)
        .map(|d| d.index);
    if index.is_none() {
        log::info!("Saved input device '{}' is not present", name);
    }
    index
}

fn report_take(path: &Path) {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    match take_duration(path) {
        Ok(seconds) => println!("\rSaved {} ({:.2} s)", name, seconds),
        Err(e) => println!("\rSaved {} (unreadable: {})", name, e),
    }
}

/// Draw the level meter and state changes until the engine goes away.
///
/// Redraws are throttled; every level still passes through here, only the
/// drawing is skipped.
fn render_events(events: Receiver<EngineEvent>) {
    let mut last_draw: Option<Instant> = None;
    let mut stderr = io::stderr();

    for event in events.iter() {
        match event {
            EngineEvent::Level(level) => {
                if last_draw.map_or(true, |t| t.elapsed() >= METER_INTERVAL) {
                    let _ = write!(stderr, "\r{}", meter(level, METER_WIDTH));
                    let _ = stderr.flush();
                    last_draw = Some(Instant::now());
                }
            }
            other => {
                if let Some(text) = describe_event(&other) {
                    println!("\r{}", text);
                }
            }
        }
    }
}

/// Console line for a state change; levels go to the meter instead
fn describe_event(event: &EngineEvent) -> Option<String> {
    let text = match event {
        EngineEvent::Level(_) => return None,
        EngineEvent::RecordingStarted { path } => format!("Recording {}", path.display()),
        EngineEvent::RecordingStopped { error: None, .. } => "Recording stopped".to_string(),
        EngineEvent::RecordingStopped {
            path,
            error: Some(e),
        } => format!("Recording {} aborted: {}", path.display(), e),
        EngineEvent::PlaybackStarted => "Playing".to_string(),
        EngineEvent::PlaybackStopped => "Playback stopped".to_string(),
    };
    Some(text)
}
