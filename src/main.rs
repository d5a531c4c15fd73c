#![cfg(feature = "cli")]
use std::path::PathBuf;

use anyhow::Context;
use clap::{ArgAction, Parser, Subcommand};
use tracing::{info, warn, Level};

use rsdrm::config::DrmConfig;
use rsdrm::helper::DrmHelperEngine;
use rsdrm::hls::drm_helper_from_ext_x_key;
use rsdrm::key::key_id_display;
use rsdrm::pssh::{Pssh, SystemId};

#[derive(Parser)]
#[command(name = "rsdrm", version, about = "rsdrm CLI")]
struct Cli {
    #[arg(short = 'd', long = "debug", action = ArgAction::SetTrue)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

/// CLI subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Resolve the DRM helper and PSSH of an HLS EXT-X-KEY attribute list.
    HlsKey {
        attributes: String,
        /// Mark the content as requiring HDCP 2.2.
        #[arg(long = "hdcp22", action = ArgAction::SetTrue)]
        hdcp22: bool,
    },
    /// Print the system id and key ids of a base64 PSSH.
    Pssh { pssh: String },
    /// Validate a configuration file and print the effective settings.
    Config { path: PathBuf },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = if cli.debug { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::fmt().with_max_level(level).init();

    match cli.command {
        Commands::HlsKey { attributes, hdcp22 } => run_hls_key(&attributes, hdcp22),
        Commands::Pssh { pssh } => run_pssh(&pssh),
        Commands::Config { path } => run_config(&path),
    }
}

fn run_hls_key(attributes: &str, hdcp22: bool) -> anyhow::Result<()> {
    let engine = DrmHelperEngine::default();
    let helper = drm_helper_from_ext_x_key(&engine, attributes, hdcp22)
        .context("No usable DRM helper in EXT-X-KEY attributes")?;

    info!("[+] {} ({})", helper.friendly_name(), helper.ocdm_system_id());
    info!("    hdcp 2.2 required: {}", helper.is_hdcp22_required());
    if let Some(url) = helper.license_server_url() {
        info!("    license server: {}", url);
    }
    if helper.key_ids().is_empty() {
        info!("    key ids: <none>");
    }
    for kid in helper.key_ids() {
        info!("    kid: {}", kid);
    }
    Ok(())
}

fn run_pssh(pssh_b64: &str) -> anyhow::Result<()> {
    let pssh = Pssh::from_base64(pssh_b64)?;
    let system = SystemId::from_uuid(pssh.system_id)
        .map(|id| id.key_system())
        .unwrap_or("unknown");

    info!("version: {}", pssh.version);
    info!("flags: {}", pssh.flags);
    info!("system_id: {} ({})", pssh.system_id, system);

    match pssh.key_ids() {
        Ok(key_ids) if key_ids.is_empty() => info!("key_ids: <none>"),
        Ok(key_ids) => {
            for kid in key_ids {
                info!("kid: {}", key_id_display(kid.as_bytes()));
            }
        }
        Err(e) => warn!("key_ids unavailable: {}", e),
    }
    Ok(())
}

fn run_config(path: &std::path::Path) -> anyhow::Result<()> {
    let config = DrmConfig::from_path(path)
        .with_context(|| format!("Failed to load {}", path.display()))?;
    println!("{}", config.to_yaml()?);
    Ok(())
}
