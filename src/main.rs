use std::io::BufRead;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use colored::Colorize;
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};

use volume_relay_lib::commands::{parse_line, ConsoleInput, HELP};
use volume_relay_lib::log::{init_tracing, set_device_debug};
use volume_relay_lib::platform;
use volume_relay_lib::{
    AudioHardware, EngineCommand, EngineConfig, EngineHandle, EngineUpdate, GainState,
    OutputChoice, PreferenceStore, Preferences, RoutingEngine, RoutingState, SimulatedDevice,
    SimulatedHardware,
};

const USAGE: &str = "usage: volume-relay [--simulate] [--device-debug]";

#[derive(Debug, Default)]
struct Options {
    simulate: bool,
    device_debug: bool,
}

fn parse_args() -> Result<Option<Options>> {
    let mut options = Options::default();
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--simulate" => options.simulate = true,
            "--device-debug" => options.device_debug = true,
            "-h" | "--help" => {
                println!("{}\n\n{}", USAGE, HELP);
                return Ok(None);
            }
            other => bail!("unknown argument '{}'\n{}", other, USAGE),
        }
    }
    Ok(Some(options))
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("{} {:#}", "volume-relay:".bright_red(), e);
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<()> {
    let Some(options) = parse_args()? else {
        return Ok(());
    };
    if options.device_debug {
        set_device_debug(true);
    }

    let config = EngineConfig::load().context("loading configuration")?;
    let store = PreferenceStore::new(
        PreferenceStore::default_path()
            .unwrap_or_else(|| std::env::temp_dir().join("volume-relay-preferences.json")),
    );
    let preferences = store.load();
    info!(
        "Preferences: output={:?} volume={:.2} muted={}",
        preferences.output_uid, preferences.volume, preferences.muted
    );

    let hardware = select_backend(&options, &config)?;
    let gain = Arc::new(GainState::new(preferences.volume, preferences.muted));
    let (mut engine, events) = RoutingEngine::new(hardware, config, gain);
    let handle = engine.handle();
    let updates = engine.subscribe();

    let _wake = if options.simulate {
        None
    } else {
        platform::watch_wake(handle.sender())
    };

    engine
        .startup(preferences.output_uid.as_deref())
        .await
        .context("starting audio routing")?;

    // Seed the console with what startup produced
    let outputs = engine.outputs();
    let active = engine.output_uid().map(str::to_string);
    print_outputs(&outputs, active.as_deref());

    tokio::spawn(forward_termination(handle.clone()));
    tokio::spawn(console(handle, updates, store, preferences, outputs, active));

    // Returning drops the runtime; the console task is cancelled and the
    // stdin thread ends with the process
    engine.run(events).await;
    info!("Routing stopped, defaults restored");
    Ok(())
}

fn select_backend(options: &Options, config: &EngineConfig) -> Result<Arc<dyn AudioHardware>> {
    if options.simulate {
        info!("{} Using simulated audio hardware", "BACKEND".bright_magenta());
        let hw = SimulatedHardware::new();
        hw.plug(
            SimulatedDevice::output("MacBook Pro Speakers", "BuiltInSpeakerDevice", 2)
                .with_volume_control(0),
        );
        hw.plug(SimulatedDevice::output("DELL U2723QE", "AppleUSBAudioEngine:Dell:1", 2));
        hw.plug(SimulatedDevice::virtual_capture(
            &config.capture_device_name,
            "BlackHole16ch_UID",
            16,
        ));
        return Ok(Arc::new(hw));
    }

    #[cfg(target_os = "macos")]
    {
        Ok(Arc::new(volume_relay_lib::CoreAudioHardware::new()))
    }

    #[cfg(not(target_os = "macos"))]
    {
        bail!("CoreAudio is only available on macOS; run with --simulate")
    }
}

/// SIGINT / SIGTERM become a Quit command so shutdown always restores defaults
async fn forward_termination(handle: EngineHandle) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(e) => {
                warn!("SIGTERM handler unavailable: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    info!("Termination requested");
    handle.command(EngineCommand::Quit);
}

/// Read stdin on a plain thread so a pending read never blocks runtime shutdown
fn spawn_stdin_reader() -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    let spawned = std::thread::Builder::new()
        .name("console-stdin".to_string())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                match line {
                    Ok(line) => {
                        if tx.send(line).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("stdin closed: {}", e);
                        break;
                    }
                }
            }
        });
    if let Err(e) = spawned {
        warn!("Console input unavailable: {}", e);
    }
    rx
}

/// Reads stdin commands and follows engine updates, persisting preferences.
/// Returns once Quit has been sent or the engine reports it is idle.
async fn console(
    handle: EngineHandle,
    mut updates: broadcast::Receiver<EngineUpdate>,
    store: PreferenceStore,
    mut preferences: Preferences,
    mut outputs: Vec<OutputChoice>,
    mut active: Option<String>,
) {
    let mut lines = spawn_stdin_reader();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            line = lines.recv(), if stdin_open => match line {
                Some(line) => match parse_line(&line) {
                    Ok(Some(input)) if input.is_quit() => {
                        handle.command(EngineCommand::Quit);
                        break;
                    }
                    Ok(Some(ConsoleInput::Engine(event))) => {
                        if !handle.send(event) {
                            break;
                        }
                    }
                    Ok(Some(ConsoleInput::List)) => print_outputs(&outputs, active.as_deref()),
                    Ok(Some(ConsoleInput::Help)) => println!("{}", HELP),
                    Ok(None) => {}
                    Err(message) => println!("{}", message),
                },
                None => stdin_open = false,
            },
            update = updates.recv() => match update {
                Ok(update) => {
                    report(&update);
                    if let EngineUpdate::Outputs { devices, active: current } = &update {
                        outputs = devices.clone();
                        active = current.clone();
                    }
                    if preferences.apply(&update) {
                        if let Err(e) = store.save(&preferences) {
                            warn!("Could not save preferences: {}", e);
                        }
                    }
                    if update == EngineUpdate::State(RoutingState::Idle) {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Console fell behind, skipped {} updates", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}

fn report(update: &EngineUpdate) {
    match update {
        EngineUpdate::Gain(snapshot) => println!(
            "volume {:>3}%{}",
            (snapshot.volume * 100.0).round() as u32,
            if snapshot.muted { " (muted)" } else { "" }
        ),
        EngineUpdate::OutputSelected(uid) => println!("output -> {}", uid),
        EngineUpdate::State(state) => println!("state: {}", state),
        EngineUpdate::Fatal(message) => println!("fatal: {}", message),
        EngineUpdate::Outputs { .. } => {}
    }
}

fn print_outputs(outputs: &[OutputChoice], active: Option<&str>) {
    if outputs.is_empty() {
        println!("no fixed-volume outputs available");
        return;
    }
    for output in outputs {
        let marker = if Some(output.uid.as_str()) == active { "*" } else { " " };
        println!("{} {}  [{}]", marker, output.name, output.uid);
    }
}
