use anyhow::{Context, Result};
use std::env;
use std::io::{self, Read};

use crate::config::{load_conf, SriovConfig};
use crate::ipam::ExecDelegate;
use crate::link::IpLink;
use crate::plugin::SriovPlugin;
use crate::types::CmdArgs;

/// CNI versions this plugin can produce results for
pub const SUPPORTED_VERSIONS: &[&str] = &["0.1.0", "0.2.0", "0.3.0", "0.3.1", "0.4.0", "1.0.0"];

/// Parse command arguments from environment
pub fn parse_args() -> Result<CmdArgs> {
    // Get required environment variables
    let container_id = env::var("CNI_CONTAINERID")
        .context("CNI_CONTAINERID not found in environment")?;

    // DEL may legitimately arrive without a namespace
    let netns = env::var("CNI_NETNS").unwrap_or_default();

    let ifname = env::var("CNI_IFNAME")
        .context("CNI_IFNAME not found in environment")?;

    let path = env::var("CNI_PATH")
        .context("CNI_PATH not found in environment")?;

    let args = env::var("CNI_ARGS").unwrap_or_default();

    // Read stdin data
    let mut stdin_data = Vec::new();
    io::stdin().read_to_end(&mut stdin_data)
        .context("Failed to read from stdin")?;

    Ok(CmdArgs {
        container_id,
        netns,
        ifname,
        args,
        path,
        stdin_data,
    })
}

fn plugin(args: CmdArgs) -> Result<SriovPlugin<IpLink, ExecDelegate>> {
    let conf = load_conf(&args.stdin_data, &args.args)?;
    let links = IpLink::new().context("Failed to open host network namespace")?;
    Ok(SriovPlugin::new(conf, args, SriovConfig::from_env(), links, ExecDelegate))
}

/// Execute the add command
pub fn cmd_add() -> Result<()> {
    let args = parse_args()?;
    if args.netns.is_empty() {
        anyhow::bail!("CNI_NETNS not found in environment");
    }

    let result = plugin(args)?.add_network()?;

    // Output result as JSON
    result.print()?;

    Ok(())
}

/// Execute the delete command
pub fn cmd_del() -> Result<()> {
    let args = parse_args()?;
    plugin(args)?.del_network()?;
    Ok(())
}

/// Execute the check command
pub fn cmd_check() -> Result<()> {
    let args = parse_args()?;
    plugin(args)?.check_network()?;
    Ok(())
}

/// Supported versions document printed for VERSION
pub fn version_info() -> serde_json::Value {
    serde_json::json!({
        "cniVersion": "1.0.0",
        "supportedVersions": SUPPORTED_VERSIONS,
    })
}

/// Main entry point for the CNI plugin
pub fn run_cni() -> Result<()> {
    // Get command from environment
    let cmd = env::var("CNI_COMMAND")
        .context("CNI_COMMAND not found in environment")?;

    // Execute the appropriate command
    match cmd.as_str() {
        "ADD" => cmd_add(),
        "DEL" => cmd_del(),
        "CHECK" => cmd_check(),
        "VERSION" => {
            println!("{}", version_info());
            Ok(())
        },
        _ => anyhow::bail!("Unknown CNI command: {}", cmd),
    }
}
