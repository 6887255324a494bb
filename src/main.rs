use std::{
    io::Write,
    path::{Path, PathBuf},
    process,
    sync::Arc,
    time::Duration,
};

use clap::{command, Parser, ValueHint};
use log::{debug, error, info, warn, LevelFilter};
use tokio::{
    sync::mpsc,
    time::{self, MissedTickBehavior},
};

use qrbox::{
    arbiter::Arbiter,
    config::{self, Config, DeviceSelection, Pins},
    device::DeviceTarget,
    error::{Error, Result},
    gpio::GpioLeds,
    http::Client as HttpClient,
    input::{Buttons, InputPoller, InputSource, Keyboard},
    jukebox::Jukebox,
    remote::{Account, WebApi},
    retry::RetryScheduler,
    scan::Scanner,
    signal,
    status::{Indicator, Leds, LogLeds, Reporter},
    token::TokenProvider,
    transport::TransportController,
};

/// Profile to display when not built in release mode.
#[cfg(debug_assertions)]
const BUILD_PROFILE: &str = "debug";
/// Profile to display when not built release mode.
#[cfg(not(debug_assertions))]
const BUILD_PROFILE: &str = "release";

/// Group name for mutually exclusive logging options.
const ARGS_GROUP_LOGGING: &str = "logging";

/// Command line arguments as parsed by `clap`.
#[derive(Clone, Debug, Default, Hash, PartialEq, Eq, PartialOrd, Ord, Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Secrets file
    ///
    /// TOML file with one `[[account]]` table per account, in order of
    /// preference. Keep this file private: it grants access to the accounts.
    #[arg(short, long, value_name = "FILE", value_hint = ValueHint::FilePath, default_value_t = String::from("secrets.toml"), env = "QRBOX_SECRETS_FILE")]
    secrets_file: String,

    /// Read accounts from the environment instead
    ///
    /// Comma separated labels in order of preference. For label `ben` the
    /// variables `SPOTIFY_CLIENT_ID_BEN`, `SPOTIFY_CLIENT_SECRET_BEN` and
    /// `SPOTIFY_REFRESH_TOKEN_BEN` are read.
    #[arg(short, long, value_name = "LABELS", value_delimiter = ',', env = "QRBOX_ACCOUNTS")]
    accounts: Vec<String>,

    /// Output device id
    ///
    /// Skips looking up the device by name.
    #[arg(long, value_name = "ID", env = "QRBOX_DEVICE_ID")]
    device_id: Option<String>,

    /// Output device name
    ///
    /// Specify more than once to give names in order of preference.
    #[arg(short, long = "device", value_name = "NAME", env = "QRBOX_DEVICE", value_delimiter = ',')]
    devices: Vec<String>,

    /// Device priority file
    ///
    /// JSON file like `{"priority": ["Kitchen", "Web Player (Chrome)"]}`.
    /// Names from the command line come first.
    #[arg(long, value_name = "FILE", value_hint = ValueHint::FilePath, env = "QRBOX_PRIORITY_FILE")]
    priority_file: Option<String>,

    /// Scanner to read codes from
    ///
    /// A device, FIFO or file with one code per line; `-` for standard input.
    #[arg(long, value_name = "FILE", value_hint = ValueHint::FilePath, default_value_t = String::from("-"), env = "QRBOX_SCANNER")]
    scanner: String,

    /// Write what could not be played to this file
    ///
    /// When every account is busy, the scanned content is described in
    /// this JSON file for another player to pick up.
    #[arg(long, value_name = "FILE", value_hint = ValueHint::FilePath, env = "QRBOX_HANDOFF_FILE")]
    handoff_file: Option<PathBuf>,

    /// Use GPIO buttons and LEDs
    #[arg(long, default_value_t = false, env = "QRBOX_GPIO")]
    gpio: bool,

    /// GPIO lines as red,green,up,down,next,previous,play
    #[arg(long, value_name = "PINS", value_delimiter = ',')]
    pins: Vec<u32>,

    /// Control playback with the keyboard
    ///
    /// Needs a scanner other than standard input.
    #[arg(short, long, default_value_t = false)]
    keyboard: bool,

    /// Double press window of the previous button in milliseconds
    #[arg(long, value_name = "MS", default_value_t = 500)]
    double_press: u64,

    /// Volume change per press in percent
    #[arg(long, value_name = "PERCENT", default_value_t = 10, value_parser = clap::value_parser!(u8).range(1..=100))]
    volume_step: u8,

    /// Seconds between playback start attempts
    #[arg(long, value_name = "SECS", default_value_t = 5)]
    retry_backoff: u64,

    /// Suppresses all output except warnings and errors.
    #[arg(short, long, default_value_t = false, group = ARGS_GROUP_LOGGING)]
    quiet: bool,

    /// Enable verbose logging
    ///
    /// Specify twice for trace logging.
    #[arg(short, long, action = clap::ArgAction::Count, group = ARGS_GROUP_LOGGING)]
    verbose: u8,
}

/// Initializes the logger facade.
///
/// The logging level is determined as follows, in order of precedence from
/// highest to lowest:
/// 1. Command line arguments
/// 2. `RUST_LOG` environment variable
/// 3. Hard coded default
///
/// # Panics
///
/// Panics when a logger facade is already initialized.
fn init_logger(config: &Args) {
    let mut logger = env_logger::Builder::from_env(
        // Note: if you change the default logging level here, then you should
        // probably also change the verbosity levels below.
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
    );

    if config.quiet || config.verbose > 0 {
        let level = match config.verbose {
            0 => {
                // Quiet and verbose are mutually exclusive, and `verbose` is 0
                // by default. So this arm means: quiet mode.
                LevelFilter::Warn
            }
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        };

        // Filter log messages of external crates.
        logger.filter_module(module_path!(), level);
        logger.filter_module("qrbox", level);
    }

    if config.keyboard {
        // The terminal is in raw mode: no carriage return on newline.
        logger.format(|buf, record| {
            writeln!(
                buf,
                "[{} {:5} {}] {}\r",
                buf.timestamp(),
                record.level(),
                record.target(),
                record.args()
            )
        });
    }

    logger.init();
}

/// Builds the configuration from the command line and the secrets.
fn configure(args: &Args) -> Result<Config> {
    let credentials = if args.accounts.is_empty() {
        config::accounts_from_file(&args.secrets_file).inspect_err(|e| {
            if e.kind == qrbox::error::ErrorKind::NotFound {
                info!("see secrets.toml.example on how to configure accounts");
            }
        })?
    } else {
        config::accounts_from_env(&args.accounts)?
    };

    let mut config = Config::with_accounts(credentials)?;

    let mut names = args.devices.clone();
    if let Some(ref path) = args.priority_file {
        names.extend(config::device_priority(path)?);
    }
    config.device = DeviceSelection {
        id: args.device_id.clone(),
        names,
    };
    config.device.validate()?;

    if args.gpio {
        config.pins = Some(match args.pins[..] {
            [] => Pins::default(),
            [led_red, led_green, volume_up, volume_down, next, previous, play_pause] => Pins {
                led_red,
                led_green,
                volume_up,
                volume_down,
                next,
                previous,
                play_pause,
            },
            _ => return Err(Error::invalid_argument("expected seven gpio lines")),
        });
    }
    config.keyboard = args.keyboard;

    config.timing.double_press = Duration::from_millis(args.double_press);
    config.timing.volume_step = args.volume_step;
    config.timing.retry_backoff = Duration::from_secs(args.retry_backoff);

    Ok(config)
}

/// Sets up one remote per configured account.
fn connect(config: &Config, http: &Arc<HttpClient>) -> Result<Vec<Account>> {
    config
        .accounts
        .iter()
        .map(|credentials| {
            let tokens = TokenProvider::new(
                credentials,
                Arc::clone(http),
                config.token_url.clone(),
                config.timing.token_margin,
            )?;
            let remote = WebApi::new(config.api_url.clone(), Arc::clone(http), tokens);
            Ok(Account::new(&credentials.name, Arc::new(remote)))
        })
        .collect()
}

fn input_sources(config: &Config, scanner_is_stdin: bool) -> Vec<Box<dyn InputSource>> {
    let mut sources: Vec<Box<dyn InputSource>> = Vec::new();

    if let Some(ref pins) = config.pins {
        match Buttons::open(pins) {
            Ok(buttons) => sources.push(Box::new(buttons)),
            Err(e) => warn!("buttons disabled: {e}"),
        }
    }

    if config.keyboard {
        if scanner_is_stdin {
            warn!("keyboard disabled: standard input is used by the scanner");
        } else {
            match Keyboard::open() {
                Ok(keyboard) => sources.push(Box::new(keyboard)),
                Err(e) => warn!("keyboard disabled: {e}"),
            }
        }
    }

    sources
}

/// Main application loop.
///
/// # Errors
///
/// Returns error on startup failures: configuration, missing credentials or
/// an unreadable scanner. Remote failures do not end the loop.
async fn run(args: Args) -> Result<()> {
    let config = configure(&args)?;
    let timing = config.timing;

    let scanner_is_stdin = args.scanner == "-";
    let mut scanner = Scanner::open(Some(Path::new(&args.scanner)), timing.rescan_cooldown).await?;
    let mut signals = signal::Handler::new()?;

    let http = Arc::new(HttpClient::new(&config)?);
    let accounts = connect(&config, &http)?;
    let names: Vec<_> = accounts.iter().map(Account::name).collect();
    info!("accounts in order of preference: {}", names.join(", "));

    let (reporter, statuses) = Reporter::channel();
    let leds: Box<dyn Leds> = match config.pins.as_ref().map(GpioLeds::open) {
        Some(Ok(leds)) => Box::new(leds),
        Some(Err(e)) => {
            warn!("status leds disabled: {e}");
            Box::new(LogLeds::default())
        }
        None => Box::new(LogLeds::default()),
    };
    let indicator = Indicator::spawn(leds, statuses, timing.blink);

    let device = DeviceTarget::new(&config.device);
    if device.resolve(&accounts).await.is_none() {
        warn!("output device not available yet");
    }

    let retries = RetryScheduler::new(
        device.clone(),
        accounts.clone(),
        reporter.clone(),
        timing.retry_backoff,
    );
    let arbiter = Arbiter::new(accounts.clone(), device.clone());
    let mut jukebox =
        Jukebox::new(http, arbiter, retries, reporter.clone()).with_handoff(args.handoff_file);

    let (events, event_rx) = mpsc::unbounded_channel();
    let controller =
        TransportController::new(accounts, jukebox.subscribe(), device, reporter, &timing);
    let controller = tokio::spawn(controller.run(event_rx));
    let input = InputPoller::spawn(input_sources(&config, scanner_is_stdin), events, &timing)?;

    let mut now_playing = time::interval(timing.now_playing_poll);
    now_playing.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut scanning = true;

    info!("ready to scan");

    loop {
        tokio::select! {
            // Prioritize shutdown signals.
            biased;

            signal = signals.recv() => {
                if signal.is_shutdown() {
                    info!("received {signal}, shutting down gracefully");
                    break;
                }
                info!("received {signal}, looking up the output device");
                jukebox.reload_device().await;
            }

            () = input.quit_requested() => {
                info!("shutting down gracefully");
                break;
            }

            scan = scanner.next_scan(), if scanning => match scan {
                Ok(Some(payload)) => {
                    jukebox.handle_scan(&payload).await;
                }
                Ok(None) => {
                    warn!("scanner closed, only transport controls remain");
                    scanning = false;
                }
                Err(e) => {
                    error!("cannot read scanner: {e}");
                    scanning = false;
                }
            },

            _ = now_playing.tick() => jukebox.poll_now_playing().await,
        }
    }

    // Stop the input thread first; its hang-up ends the controller.
    if let Err(e) = tokio::task::spawn_blocking(move || input.stop()).await {
        error!("cannot stop input: {e}");
    }
    if let Err(e) = controller.await {
        error!("transport controller failed: {e}");
    }

    jukebox.shutdown().await;
    drop(scanner);

    indicator.stop().await;
    Ok(())
}

/// Main entry point of the application.
///
/// This function initializes the logger facade, parses the command line
/// arguments, and starts the main application loop.
#[tokio::main]
async fn main() {
    // `clap` handles our command line arguments and help text.
    let args = Args::parse();
    init_logger(&args);

    // Dump command line arguments before we do anything more.
    // This aids in debugging of whatever comes next.
    debug!("Command {:#?}", args);

    let cmd = command!();
    let name = cmd.get_name().to_string();
    let version = cmd.get_version().unwrap_or("UNKNOWN").to_string();

    info!("starting {name}/{version}; {BUILD_PROFILE}");

    if let Err(e) = run(args).await {
        error!("{e}");
        process::exit(1);
    }
}
