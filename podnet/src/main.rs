//! podnet: pod network setup for virtual machines.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use podnet::dhcp::{DhcpLauncher, DhcpServers};
use podnet::domain::DomainSpec;
use podnet::hotplug::{desired_domain_interfaces, sync_network_interfaces, with_placeholder_interfaces};
use podnet::nat::NatEngine;
use podnet::netdriver::RtNetlinkHandler;
use podnet::vmi::VirtualMachineInstance;
use podnet::{CacheStore, NetConfig, NetContext, NetworkConfigurator, VirshDomain, VmNetworkConfigurator};
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Pod network setup for virtual machines
#[derive(Parser, Debug)]
#[command(name = "podnet", version, about)]
struct Args {
    /// Configuration file (JSON)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the VM-hosting process's private directory
    #[arg(long, global = true)]
    launcher_private_dir: Option<PathBuf>,

    /// Override the per-VMI cache directory
    #[arg(long, global = true)]
    handler_cache_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Prepare the pod network namespace and record the results
    Phase1 {
        /// VMI resource (JSON)
        #[arg(long)]
        vmi: PathBuf,

        /// Pid of the VM-hosting process
        #[arg(long)]
        pid: Option<u32>,
    },

    /// Decorate the domain from phase 1 records and serve DHCP
    Phase2 {
        /// VMI resource (JSON)
        #[arg(long)]
        vmi: PathBuf,

        /// Domain spec to decorate (JSON)
        #[arg(long)]
        domain: PathBuf,

        /// Where to write the decorated domain (defaults to stdout)
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Reconcile the interfaces of a running domain with the VMI
    Sync {
        /// VMI resource (JSON)
        #[arg(long)]
        vmi: PathBuf,

        /// Interfaces of the live domain (JSON domain spec)
        #[arg(long)]
        current: PathBuf,

        /// Libvirt domain name
        #[arg(long)]
        domain: String,

        /// Libvirt connection URI
        #[arg(long)]
        connect: Option<String>,
    },
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("parsing {}", path.display()))
}

fn load_config(args: &Args) -> Result<NetConfig> {
    let mut config = match &args.config {
        Some(path) => NetConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => NetConfig::default(),
    };
    if let Some(dir) = &args.launcher_private_dir {
        config.launcher_private_dir = dir.clone();
    }
    if let Some(dir) = &args.handler_cache_dir {
        config.handler_cache_dir = dir.clone();
    }
    Ok(config)
}

fn context(config: NetConfig, dhcp: Arc<DhcpServers>) -> Result<NetContext> {
    let handler = RtNetlinkHandler::new().context("opening netlink connection")?;
    Ok(NetContext {
        cache: CacheStore::new(&config),
        config: Arc::new(config),
        handler: Arc::new(handler),
        nat: NatEngine::system(),
        dhcp,
    })
}

async fn wait_for_shutdown() -> Result<()> {
    let mut sigint = signal(SignalKind::interrupt()).context("registering SIGINT handler")?;
    let mut sigterm = signal(SignalKind::terminate()).context("registering SIGTERM handler")?;
    tokio::select! {
        _ = sigint.recv() => { info!("Received SIGINT"); }
        _ = sigterm.recv() => { info!("Received SIGTERM"); }
    }
    Ok(())
}

async fn run(args: Args) -> Result<()> {
    let config = load_config(&args)?;
    let dhcp = Arc::new(DhcpServers::new());

    match args.command {
        Command::Phase1 { vmi, pid } => {
            let vmi: VirtualMachineInstance = read_json(&vmi)?;
            let ctx = context(config, Arc::clone(&dhcp))?;
            let networks = vmi.networks().to_vec();
            let configurator = VmNetworkConfigurator::new(vmi, ctx, pid);
            configurator.setup_pod_network_phase1(&networks).await?;
        }

        Command::Phase2 {
            vmi,
            domain,
            output,
        } => {
            let vmi: VirtualMachineInstance = read_json(&vmi)?;
            let mut spec: DomainSpec = read_json(&domain)?;
            let placeholders = config.placeholder_count;
            let ctx = context(config, Arc::clone(&dhcp))?;
            let networks = vmi.networks().to_vec();
            let configurator = VmNetworkConfigurator::new(vmi, ctx, None);
            configurator
                .setup_pod_network_phase2(&mut spec, &networks)
                .await?;

            let rendered = with_placeholder_interfaces(&spec, placeholders, |reserved| async move {
                serde_json::to_string_pretty(&reserved)
            })
            .await?;
            match output {
                Some(path) => std::fs::write(&path, rendered)
                    .with_context(|| format!("writing {}", path.display()))?,
                None => println!("{rendered}"),
            }

            info!("Domain decorated, serving DHCP until shutdown");
            wait_for_shutdown().await?;
        }

        Command::Sync {
            vmi,
            current,
            domain,
            connect,
        } => {
            let vmi: VirtualMachineInstance = read_json(&vmi)?;
            let current: DomainSpec = read_json(&current)?;
            let desired = desired_domain_interfaces(&vmi);

            let mut virsh = VirshDomain::new(domain);
            if let Some(uri) = connect {
                virsh = virsh.with_connect_uri(uri);
            }

            let ctx = context(config, Arc::clone(&dhcp))?;
            let configurator = VmNetworkConfigurator::new(vmi.clone(), ctx, None);
            let synced = sync_network_interfaces(
                &vmi,
                current.interfaces(),
                &desired,
                &configurator,
                &virsh,
            )
            .await;
            if let Err(e) = &synced {
                warn!(error = %e, "Network interface sync incomplete");
            }

            // Hotplugged bridges are served from this process.
            if dhcp.has_running() {
                info!("Serving DHCP for hotplugged interfaces until shutdown");
                wait_for_shutdown().await?;
            }
            synced?;
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse();
    if let Err(e) = run(args).await {
        if let Some(err) = e.downcast_ref::<podnet::Error>()
            && err.is_critical()
        {
            error!(error = %format!("{e:#}"), "Critical network error, pod must be rescheduled");
        } else {
            error!(error = %format!("{e:#}"), "podnet failed");
        }
        std::process::exit(1);
    }
}
