mod config;
mod error;
mod lock;
mod orphan;
mod registry;
mod template_builder;

use std::fmt;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;

use clap::{Parser, Subcommand};
use sandbox::VmmKind;
use tracing_subscriber::fmt::time::FormatTime;
use vmrt::network::{HostsWriter, NetworkManager};
use vmrt::template::Template;

use template_builder::{BuildRequest, DockerRuntime, TemplateBuilder};

struct Elapsed(Instant);

impl FormatTime for Elapsed {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> fmt::Result {
        let d = self.0.elapsed();
        let total_secs = d.as_secs();
        let mins = total_secs / 60;
        let secs = total_secs % 60;
        let millis = d.subsec_millis();
        write!(w, "[{mins:02}:{secs:02}:{millis:03}]")
    }
}

#[derive(Parser)]
#[command(name = "sandboxd", version)]
struct Cli {
    #[command(flatten)]
    config: config::Cli,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Verify host prerequisites (KVM, network tooling, sudo, kernels) and exit
    Setup,
    /// Build a template from a container image
    Build(Box<BuildArgs>),
    /// Run the server: load templates, recover orphans, serve RPCs
    Start,
}

#[derive(clap::Args)]
struct BuildArgs {
    /// Template id to create or replace
    #[arg(long)]
    template_id: String,
    /// Container image to build the rootfs from
    #[arg(long)]
    base_image: String,
    #[arg(long, value_enum, default_value = "firecracker")]
    vmm_type: VmmKindArg,
    #[arg(long, default_value_t = 1)]
    vcpu: u32,
    #[arg(long, default_value_t = 512)]
    memory_mb: u32,
    #[arg(long, default_value_t = 2048)]
    disk_mb: u32,
    #[arg(long)]
    kernel_version: String,
    #[arg(long)]
    start_command: Option<String>,
    #[arg(long, default_value_t = false)]
    overlay: bool,
    #[arg(long, default_value_t = false)]
    huge_pages: bool,
    #[arg(long, default_value_t = false)]
    no_pull: bool,
    #[arg(long)]
    env_file: Option<PathBuf>,
    /// Path to the guest-agent binary copied into the rootfs
    #[arg(long, env = "SANDBOXD_GUEST_AGENT_PATH")]
    guest_agent_path: PathBuf,
    /// Path to the overlay-init script, required when `--overlay` is set
    #[arg(long, env = "SANDBOXD_OVERLAY_INIT_PATH", default_value = "/dev/null")]
    overlay_init_path: PathBuf,
}

#[derive(Clone, clap::ValueEnum)]
enum VmmKindArg {
    Firecracker,
    CloudHypervisor,
}

impl From<VmmKindArg> for VmmKind {
    fn from(v: VmmKindArg) -> Self {
        match v {
            VmmKindArg::Firecracker => VmmKind::Firecracker,
            VmmKindArg::CloudHypervisor => VmmKind::CloudHypervisor,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = cli
        .config
        .log_level
        .as_deref()
        .map(tracing_subscriber::EnvFilter::new)
        .unwrap_or_else(|| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_timer(Elapsed(Instant::now()))
        .with_env_filter(filter)
        .init();

    if nix::unistd::getuid().is_root() {
        eprintln!("error: sandboxd must not be run as root (it calls sudo internally as needed)");
        return ExitCode::FAILURE;
    }

    let config = Arc::new(cli.config.into_config());

    let result = match cli.command {
        Command::Setup => run_setup(&config).await,
        Command::Build(args) => run_build(&config, *args).await,
        Command::Start => run_start(config).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn known_templates(config: &vmrt::Config) -> error::ServerResult<Vec<Template>> {
    let templates_dir = config.data_root.join("templates");
    let mut out = Vec::new();
    let mut entries = match tokio::fs::read_dir(&templates_dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
        Err(e) => return Err(error::ServerError::Io(e)),
    };
    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_dir() {
            continue;
        }
        let id = entry.file_name().to_string_lossy().to_string();
        out.push(Template::load(&config.data_root, &id).await?);
    }
    Ok(out)
}

/// Discover the interface the host's default route goes out, the way
/// `ip route show default` reports it, for `NetworkManager`'s NAT rules.
async fn detect_gateway_iface() -> error::ServerResult<String> {
    let out = vmrt::command::exec("ip", &["route", "show", "default"], vmrt::command::Privilege::User)
        .await
        .map_err(|e| error::ServerError::Internal(format!("detect default route: {e}")))?;
    out.split_whitespace()
        .skip_while(|t| *t != "dev")
        .nth(1)
        .map(str::to_string)
        .ok_or_else(|| error::ServerError::Internal("no default route found on host".into()))
}

async fn build_network_manager(config: &vmrt::Config) -> error::ServerResult<Arc<tokio::sync::Mutex<NetworkManager>>> {
    let gateway_iface = detect_gateway_iface().await?;
    let hosts = Arc::new(HostsWriter::new(PathBuf::from("/etc/hosts")));
    Ok(Arc::new(tokio::sync::Mutex::new(NetworkManager::new(
        config.max_network_number,
        config.recycle_network,
        gateway_iface,
        hosts,
    ))))
}

async fn run_setup(config: &vmrt::Config) -> error::ServerResult<()> {
    let templates = known_templates(config).await?;
    vmrt::prerequisites::check_prerequisites(config, &templates)
        .await
        .map_err(error::ServerError::from)?;
    tracing::info!(count = templates.len(), "prerequisites satisfied");
    Ok(())
}

async fn run_build(config: &Arc<vmrt::Config>, args: BuildArgs) -> error::ServerResult<()> {
    let network = build_network_manager(config).await?;
    let runtime = Arc::new(DockerRuntime);
    let builder = TemplateBuilder::new(
        config.clone(),
        network,
        runtime,
        args.guest_agent_path,
        args.overlay_init_path,
    );

    let req = BuildRequest {
        template_id: args.template_id,
        base_image: args.base_image,
        vmm_type: args.vmm_type.into(),
        vcpu: args.vcpu,
        memory_mb: args.memory_mb,
        disk_mb: args.disk_mb,
        kernel_version: args.kernel_version,
        start_command: args.start_command,
        overlay: args.overlay,
        huge_pages: args.huge_pages,
        no_pull: args.no_pull,
        working_dir: None,
        env_file: args.env_file,
        cpu_limit: None,
        memory_limit_mb: None,
        pids_limit: None,
        security_opts: Vec::new(),
        cap_drop: Vec::new(),
    };

    let template = builder.build(req).await?;
    tracing::info!(template_id = %template.id, "template built");
    Ok(())
}

async fn run_start(config: Arc<vmrt::Config>) -> error::ServerResult<()> {
    let templates = known_templates(&config).await?;
    vmrt::prerequisites::check_prerequisites(&config, &templates)
        .await
        .map_err(error::ServerError::from)?;

    let network = build_network_manager(&config).await?;
    let registry = Arc::new(registry::Registry::new(config, network));

    let orphans = registry.list(true).await?;
    if !orphans.is_empty() {
        tracing::warn!(count = orphans.len(), "orphaned sandboxes recovered at startup");
    }

    tracing::info!("sandboxd ready");
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| error::ServerError::Internal(format!("ctrl_c: {e}")))?;

    tracing::info!("shutting down");
    registry.shutdown().await
}
