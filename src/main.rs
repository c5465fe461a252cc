use crate::config::{Config, app_name, app_version};
use crate::encoder::{Player, Transcoder};
use crate::pipeline::sink::StdoutSink;
use crate::utils::net::sdm::{DeviceApi, resolve_device};
use crate::utils::net::{PubSubListener, SdmClient};
use crate::utils::path::{default_config_path, short_device_name};
use crate::utils::sos::SignalOfStop;
use crate::workers::{CaptureMode, CaptureOrchestrator, CapturePolicy, DeviceCapture, JobOutcome, Recorder};
use anyhow::{Context, Result, anyhow};
use clap::{Arg, ArgAction, ArgMatches, Command, value_parser};
use log::{error, info, warn};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::{panic, process};
use tracing_subscriber::EnvFilter;

pub mod config;
pub mod decoder;
pub mod encoder;
pub mod events;
pub mod pipeline;
pub mod utils;
pub mod workers;

fn device_arg() -> Arg {
    Arg::new("device")
        .short('d')
        .long("device")
        .value_name("DEVICE")
        .help("Device id or full resource name (defaults to the configured or first camera).")
}

fn output_arg(default: &'static str) -> Arg {
    Arg::new("output")
        .short('o')
        .long("output")
        .value_name("FILE")
        .help("Output file; the extension selects the format (.jpg, .mp4, .webm, .h264).")
        .value_parser(value_parser!(PathBuf))
        .default_value(default)
}

fn cli() -> Command {
    Command::new(app_name())
        .version(app_version())
        .author(env!("CARGO_PKG_AUTHORS"))
        .about(env!("CARGO_PKG_DESCRIPTION"))
        .subcommand_required(true)
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("PATH")
                .help("Config file (defaults to ~/.config/nestcast/config.toml).")
                .value_parser(value_parser!(PathBuf))
                .global(true),
        )
        .subcommand(
            Command::new("stream")
                .about("Write the raw H.264 stream to stdout until interrupted.")
                .arg(device_arg()),
        )
        .subcommand(
            Command::new("live")
                .about("Watch the camera in a player window.")
                .arg(device_arg()),
        )
        .subcommand(
            Command::new("record")
                .about("Record a clip of fixed length.")
                .arg(device_arg())
                .arg(output_arg("recording.mp4"))
                .arg(
                    Arg::new("duration")
                        .short('t')
                        .long("duration")
                        .value_name("SECONDS")
                        .help("Recording length once video arrives.")
                        .value_parser(value_parser!(u64)),
                ),
        )
        .subcommand(
            Command::new("snapshot")
                .about("Grab a single frame from the live stream.")
                .arg(device_arg())
                .arg(output_arg("snapshot.jpg")),
        )
        .subcommand(
            Command::new("events")
                .about("Capture snapshots and clips when the camera reports motion or people.")
                .arg(
                    Arg::new("subscription")
                        .short('s')
                        .long("subscription")
                        .value_name("SUBSCRIPTION")
                        .help("Pub/Sub subscription, projects/<p>/subscriptions/<s>."),
                )
                .arg(
                    Arg::new("output-dir")
                        .long("output-dir")
                        .value_name("DIR")
                        .value_parser(value_parser!(PathBuf)),
                )
                .arg(
                    Arg::new("clip")
                        .long("clip")
                        .help("Also record a clip for each event.")
                        .action(ArgAction::SetTrue),
                )
                .arg(
                    Arg::new("no-snapshot")
                        .long("no-snapshot")
                        .help("Do not fetch event images.")
                        .action(ArgAction::SetTrue),
                )
                .arg(
                    Arg::new("clip-secs")
                        .long("clip-secs")
                        .value_name("SECONDS")
                        .value_parser(value_parser!(u64)),
                ),
        )
        .subcommand(
            Command::new("devices")
                .about("List the cameras in the project, or show one device.")
                .arg(device_arg()),
        )
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let matches = cli().get_matches();

    // kill the main thread as soon as a secondary thread panics
    let orig_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        orig_hook(panic_info);
        process::exit(105);
    }));

    // first interrupt stops captures gracefully, the second one exits
    let sos = SignalOfStop::new();
    let interrupted = AtomicBool::new(false);
    let root = sos.clone();
    ctrlc::set_handler(move || {
        if interrupted.swap(true, Ordering::SeqCst) {
            process::exit(130);
        }
        info!("Interrupted, finishing up (press Ctrl-C again to quit)");
        root.cancel();
    })
    .expect("Error setting Ctrl-C handler");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("Failed to start the async runtime");

    if let Err(e) = runtime.block_on(run(matches, sos)) {
        error!("{:#}", e);
        process::exit(1);
    }
}

async fn run(matches: ArgMatches, sos: SignalOfStop) -> Result<()> {
    let config_path = matches
        .get_one::<PathBuf>("config")
        .cloned()
        .unwrap_or_else(default_config_path);
    let mut config = Config::load(&config_path)?;
    config.validate()?;

    let client = Arc::new(SdmClient::new(
        &config.api_base_url,
        &config.project_id,
        &config.access_token,
    ));

    match matches.subcommand() {
        Some(("devices", args)) => match args.get_one::<String>("device") {
            Some(id) => show_device(&client, &config.device_resource(id)).await,
            None => list_devices(&client).await,
        },
        Some(("events", args)) => {
            if let Some(dir) = args.get_one::<PathBuf>("output-dir") {
                config.capture.output_dir = dir.clone();
            }
            if args.get_flag("clip") {
                config.capture.clip = true;
            }
            if args.get_flag("no-snapshot") {
                config.capture.snapshot = false;
            }
            if let Some(secs) = args.get_one::<u64>("clip-secs") {
                config.capture.clip_secs = *secs;
            }
            if let Some(subscription) = args.get_one::<String>("subscription") {
                config.pubsub_subscription = Some(subscription.clone());
            }
            watch_events(&config, client, sos).await
        }
        Some((mode, args)) => {
            let device = resolve_device(
                &client,
                args.get_one::<String>("device").map(String::as_str),
                config.device_id.as_deref(),
                |id| config.device_resource(id),
            )
            .await
            .context("resolving device")?;
            info!("Using device {}", short_device_name(&device));

            let recorder = Recorder::new(client, &device, &config.webrtc, &config.capture);
            match mode {
                "stream" => {
                    let summary = recorder
                        .capture(Box::new(StdoutSink::stdout()), CaptureMode::UntilStopped, sos)
                        .await?;
                    info!("Stream ended: {}", summary);
                    Ok(())
                }
                "live" => watch_live(&recorder, &config, &device, sos).await,
                "record" => {
                    let duration = args
                        .get_one::<u64>("duration")
                        .copied()
                        .unwrap_or(config.capture.clip_secs);
                    let mode = CaptureMode::For(std::time::Duration::from_secs(duration));
                    save(&recorder, &config, output_of(args)?, mode, sos).await
                }
                "snapshot" => save(&recorder, &config, output_of(args)?, CaptureMode::snapshot(), sos).await,
                other => Err(anyhow!("unknown command {}", other)),
            }
        }
        None => Err(anyhow!("no command given")),
    }
}

fn output_of(args: &ArgMatches) -> Result<&Path> {
    args.get_one::<PathBuf>("output")
        .map(PathBuf::as_path)
        .ok_or_else(|| anyhow!("missing --output"))
}

async fn save(recorder: &Recorder, config: &Config, output: &Path, mode: CaptureMode, sos: SignalOfStop) -> Result<()> {
    let transcoder = Transcoder::new(&config.capture.ffmpeg);
    match recorder.record_to_file(&transcoder, output, mode, sos).await? {
        JobOutcome::Complete(path) => info!("Saved {}", path.display()),
        JobOutcome::Partial { kept, reason } => {
            warn!("{}", reason);
            warn!("Raw stream kept at {}", kept.display());
        }
    }
    Ok(())
}

async fn watch_live(recorder: &Recorder, config: &Config, device: &str, sos: SignalOfStop) -> Result<()> {
    let (mut player, sink) = Player::spawn(&config.capture.ffplay, short_device_name(device))?;
    let live = sos.child();

    let closed = live.clone();
    let watcher = tokio::spawn(async move {
        if let Ok(status) = player.exited().await {
            info!("Player exited ({})", status);
        }
        closed.cancel();
    });

    let result = recorder.capture(Box::new(sink), CaptureMode::UntilStopped, live.clone()).await;
    let player_closed = watcher.is_finished();
    // dropping the player kills it if it is still open
    watcher.abort();

    match result {
        Ok(summary) => {
            info!("Live view ended: {}", summary);
            Ok(())
        }
        // a closed window breaks the pipe mid-write
        Err(_) if player_closed => Ok(()),
        Err(e) => Err(e),
    }
}

async fn watch_events(config: &Config, client: Arc<SdmClient>, sos: SignalOfStop) -> Result<()> {
    let subscription = config
        .pubsub_subscription
        .as_deref()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| anyhow!("pubsub_subscription not configured (set it in the config file or pass --subscription)"))?;

    if config.capture.clip {
        let probe = Path::new("probe.mp4");
        if let Err(e) = Transcoder::new(&config.capture.ffmpeg).check(probe).await {
            warn!("{}; clips will be kept as raw H.264", e);
        }
    }

    let listener = PubSubListener::new(&config.pubsub_base_url, subscription, &config.access_token)?;
    let (tx, rx) = tokio::sync::mpsc::channel(64);
    let listening = {
        let sos = sos.clone();
        tokio::spawn(async move { listener.listen(tx, sos).await })
    };

    let api: Arc<dyn DeviceApi> = client;
    let runner = Arc::new(DeviceCapture::new(api, config));
    let orchestrator = CaptureOrchestrator::new(runner, CapturePolicy::from(&config.capture), sos);
    orchestrator.run(rx).await?;

    let _ = listening.await;
    Ok(())
}

async fn list_devices(client: &SdmClient) -> Result<()> {
    let devices = client.list_devices().await.context("listing devices")?;
    let cameras: Vec<_> = devices.iter().filter(|d| d.is_camera()).collect();
    if cameras.is_empty() {
        warn!("No cameras found in project");
    }
    for device in cameras {
        println!(
            "{}\t{}\t{}",
            short_device_name(&device.name),
            device.device_type,
            device.display_name()
        );
    }
    Ok(())
}

async fn show_device(client: &SdmClient, name: &str) -> Result<()> {
    let device = client
        .get_device(name)
        .await
        .with_context(|| format!("fetching {}", name))?;
    println!("name:    {}", device.name);
    println!("type:    {}", device.device_type);
    println!("label:   {}", device.display_name());
    let mut traits: Vec<_> = device.traits.keys().collect();
    traits.sort();
    for name in traits {
        println!("trait:   {}", name);
    }
    Ok(())
}
