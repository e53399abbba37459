use anyhow::{Context, Result, anyhow, bail};
use clap::{Args, Parser, Subcommand, ValueEnum};
use console::style;
use diskgate_core::arbitration::DiskOperation;
use diskgate_core::client::HelperClient;
use diskgate_core::config::HelperConfig;
use diskgate_core::device::{DeviceDescriptor, DeviceKind};
use diskgate_core::executor::OperationResult;
use diskgate_core::transport::client::ClientConfig;
use diskgate_core::transport::{DEFAULT_RUNTIME_DIR, Endpoint, SERVICE_NAME};
use dialoguer::{Confirm, Select, theme::ColorfulTheme};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Configuration file `serve` reads when `--config` is not given and it exists.
const DEFAULT_CONFIG: &str = "/etc/diskgate/helper.toml";

#[derive(Parser)]
#[command(name = "diskgate")]
#[command(about = "A guarded helper for unmounting and ejecting removable disks", version)]
struct Cli {
    /// Log at debug level (overrides RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the privileged helper (must be started as root)
    Serve {
        /// Helper configuration file
        #[arg(short, long, env = "DISKGATE_CONFIG")]
        config: Option<PathBuf>,
    },
    /// List removable devices
    List,
    /// Check that the helper is running and accepts this client
    Ping(HelperArgs),
    /// Unmount every volume of a disk
    Unmount(DiskArgs),
    /// Unmount a disk and detach it from the system
    Eject(DiskArgs),
}

#[derive(Args)]
struct HelperArgs {
    /// Directory holding the helper's socket
    #[arg(long, env = "DISKGATE_RUNTIME_DIR", default_value = DEFAULT_RUNTIME_DIR)]
    runtime_dir: PathBuf,

    /// Seconds to wait for the helper's reply
    #[arg(long, value_name = "SECS")]
    timeout: Option<u64>,
}

#[derive(Args)]
struct DiskArgs {
    /// Disk to operate on (e.g. sdb); asks interactively when omitted
    disk: Option<String>,

    /// Kind of device, as the front end sees it
    #[arg(short, long, value_enum)]
    kind: Option<KindArg>,

    /// Skip the confirmation prompt
    #[arg(short = 'y', long)]
    yes: bool,

    #[command(flatten)]
    helper: HelperArgs,
}

#[derive(Clone, Copy, ValueEnum)]
enum KindArg {
    Usb,
    Sd,
    Internal,
    Other,
}

impl From<KindArg> for DeviceKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Usb => DeviceKind::Usb,
            KindArg::Sd => DeviceKind::Sd,
            KindArg::Internal => DeviceKind::Internal,
            KindArg::Other => DeviceKind::Other,
        }
    }
}

impl HelperArgs {
    fn client_config(&self) -> ClientConfig {
        let mut config = ClientConfig {
            endpoint: Endpoint::for_service(SERVICE_NAME, &self.runtime_dir),
            ..ClientConfig::default()
        };
        if let Some(secs) = self.timeout {
            config.reply_timeout = Duration::from_secs(secs);
        }
        config
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Picks the disk to hand to the helper when none was named on the command
/// line. Only devices discovery reports as removable are offered.
fn pick_disk(devices: Vec<DeviceDescriptor>, operation: DiskOperation) -> Result<DeviceDescriptor> {
    if devices.is_empty() {
        bail!("No removable disk to {operation}.");
    }

    let rows: Vec<String> = devices.iter().map(DeviceDescriptor::to_string).collect();
    let chosen = Select::with_theme(&ColorfulTheme::default())
        .with_prompt(format!("Select the disk to {operation}"))
        .items(&rows)
        .default(0)
        .interact()?;

    devices
        .into_iter()
        .nth(chosen)
        .ok_or_else(|| anyhow!("No disk at menu position {chosen}."))
}

/// Asks before unmounting or ejecting. Defaults to no, so a stray Enter
/// leaves the disk alone.
fn confirm_disk_operation(operation: DiskOperation, bsd_name: &str) -> Result<bool> {
    Ok(Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(format!("{operation} {bsd_name} now?"))
        .default(false)
        .interact()?)
}

fn enumerate() -> Result<Vec<DeviceDescriptor>> {
    #[cfg(target_os = "linux")]
    {
        diskgate_core::platform::enumerate_devices()
    }
    #[cfg(not(target_os = "linux"))]
    {
        Err(anyhow!("Device discovery is only supported on Linux."))
    }
}

#[cfg(target_os = "linux")]
fn serve(config_path: Option<PathBuf>) -> Result<()> {
    use diskgate_core::auth::{Authenticator, SigningManifest};
    use diskgate_core::executor::Executor;
    use diskgate_core::platform::{LinuxArbiter, ProcCodeIdentitySource};
    use diskgate_core::safety::SafetyGuard;
    use diskgate_core::service::HelperService;
    use diskgate_core::transport::server::Server;

    if !nix::unistd::geteuid().is_root() {
        bail!("The helper must be started as root.");
    }

    let config = match config_path {
        Some(path) => HelperConfig::load(&path)?,
        None if Path::new(DEFAULT_CONFIG).exists() => HelperConfig::load(Path::new(DEFAULT_CONFIG))?,
        None => HelperConfig::default(),
    };
    let manifest = SigningManifest::load(&config.signing_manifest)
        .context("A signing manifest is required to authenticate callers")?;
    tracing::info!(
        signers = manifest.signers.len(),
        sd_policy = ?config.internal_sd_policy,
        "helper configuration loaded"
    );

    let authenticator = Authenticator::new(
        ProcCodeIdentitySource::new(manifest),
        config.signing_requirement(),
    );
    let executor = Executor::new(
        LinuxArbiter::new(),
        SafetyGuard::new(config.internal_sd_policy),
        config.callback_timeout(),
    );
    let server = Server::bind(
        &config.endpoint(),
        HelperService::new(authenticator, executor),
    )?
    .with_idle_timeout(config.peer_idle_timeout())
    .with_max_peers(config.max_peers);
    server.run()?;
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn serve(_config_path: Option<PathBuf>) -> Result<()> {
    bail!("The helper is only supported on Linux.")
}

fn ping(args: &HelperArgs) -> Result<()> {
    let config = args.client_config();
    let endpoint = config.endpoint.clone();
    let mut helper = HelperClient::connect(config, false)?;
    helper.ping()?;
    println!(
        "Helper at {} is up and accepts this client.",
        style(endpoint).cyan()
    );
    Ok(())
}

fn run_disk_operation(operation: DiskOperation, args: DiskArgs) -> Result<bool> {
    // Only look devices up when something is left to decide.
    let (bsd_name, kind) = match (args.disk, args.kind) {
        (Some(disk), Some(kind)) => (disk, DeviceKind::from(kind)),
        (Some(disk), None) => {
            let kind = enumerate()
                .ok()
                .and_then(|devices| devices.into_iter().find(|d| d.bsd_name == disk))
                .map_or(DeviceKind::Other, |d| d.device_kind);
            (disk, kind)
        }
        (None, kind) => {
            let device = pick_disk(enumerate()?, operation)?;
            let kind = kind.map_or(device.device_kind, DeviceKind::from);
            (device.bsd_name, kind)
        }
    };

    if !args.yes {
        println!(
            "{} This will {} '{}' ({}). Open files on it may lose data.",
            style("WARNING:").red().bold(),
            operation,
            bsd_name,
            kind,
        );
        println!();
        if !confirm_disk_operation(operation, &bsd_name)? {
            println!("Operation cancelled.");
            return Ok(true);
        }
        println!();
    }

    let mut helper = HelperClient::connect(args.helper.client_config(), true)?;

    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.blue} [{elapsed_precise}] {msg}")?,
    );
    spinner.set_message(format!("Waiting for the helper to {operation} {bsd_name}..."));
    spinner.enable_steady_tick(Duration::from_millis(100));

    let result = helper.request_destructive_op(operation, &bsd_name, kind);
    spinner.finish_and_clear();

    report(operation, &bsd_name, &result);
    Ok(result.success)
}

fn report(operation: DiskOperation, bsd_name: &str, result: &OperationResult) {
    if result.success {
        println!(
            "✨ Finished: {} {}.",
            operation,
            style(bsd_name).cyan()
        );
        return;
    }

    let kind = result
        .error_kind
        .map_or("unknown failure", |kind| kind.describe());
    println!(
        "❌ Could not {} {}: {}",
        operation,
        style(bsd_name).cyan(),
        style(kind).red().bold()
    );
    if let Some(status) = result.status_code {
        println!("  Status:  {status}");
    }
    if let Some(message) = &result.message {
        println!("  Details: {message}");
    }
    if result.error_kind.is_some_and(|kind| kind.is_final()) {
        println!("  Retrying will not help.");
    }
}

fn list() -> Result<()> {
    let devices = enumerate()?;
    if devices.is_empty() {
        println!("No removable devices found.");
        return Ok(());
    }

    println!("Found {} removable devices:", devices.len());
    println!(
        "\n  {:<12} {:<25} {:<10} {}",
        "DEVICE", "NAME", "SIZE", "KIND"
    );
    println!("  {:-<12} {:-<25} {:-<10} {:-<8}", "", "", "", "");
    for device in devices {
        println!(
            "  {:<12} {:<25} {:>8.1} GB  {}",
            device.bsd_name,
            device.display_name,
            device.size_gb(),
            device.device_kind
        );
    }
    Ok(())
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let succeeded = match cli.command {
        Commands::Serve { config } => serve(config).map(|()| true)?,
        Commands::List => list().map(|()| true)?,
        Commands::Ping(args) => ping(&args).map(|()| true)?,
        Commands::Unmount(args) => run_disk_operation(DiskOperation::Unmount, args)?,
        Commands::Eject(args) => run_disk_operation(DiskOperation::Eject, args)?,
    };

    Ok(if succeeded {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
