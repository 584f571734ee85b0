use anyhow::{bail, Context};
use nodeflow::device::DeviceDriver;
use nodeflow::{PermissionGate, RelayConfig, RelayServer, SyntheticDriver, SystemDriver};
use std::env;
use std::sync::Arc;

const USAGE: &str = "Usage: nodeflow <command> [args]

Commands:
  serve [--config <file>] [--host <addr>] [--port <n>] [--synthetic] [--no-bridge]
  grant <webcam|microphone|speaker> [--hours <n>] [--config <file>]
  revoke <webcam|microphone|speaker> [--config <file>]
  permissions [--json] [--config <file>]
  list-audio-sinks [--json]";

fn main() -> anyhow::Result<()> {
    nodeflow::init_logging();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        eprintln!("{}", USAGE);
        std::process::exit(1);
    }

    let command = &args[1];
    match command.as_str() {
        "serve" => cmd_serve(&args),
        "grant" => cmd_grant(&args),
        "revoke" => cmd_revoke(&args),
        "permissions" => cmd_permissions(&args),
        "list-audio-sinks" => cmd_list_audio_sinks(&args),
        "--help" | "-h" | "help" => {
            println!("{}", USAGE);
            Ok(())
        }
        _ => {
            eprintln!("Unknown command: {}\n\n{}", command, USAGE);
            std::process::exit(1);
        }
    }
}

/// Value following `flag`, if present.
fn flag_value<'a>(args: &'a [String], flag: &str) -> anyhow::Result<Option<&'a str>> {
    match args.iter().position(|a| a == flag) {
        Some(i) => match args.get(i + 1) {
            Some(value) => Ok(Some(value.as_str())),
            None => bail!("{} requires a value", flag),
        },
        None => Ok(None),
    }
}

fn has_flag(args: &[String], flag: &str) -> bool {
    args.iter().any(|a| a == flag)
}

fn load_config(args: &[String]) -> anyhow::Result<RelayConfig> {
    match flag_value(args, "--config")? {
        Some(path) => RelayConfig::load_from_file(path).with_context(|| format!("loading {}", path)),
        None => Ok(RelayConfig::load_or_default()),
    }
}

fn open_gate(config: &RelayConfig) -> PermissionGate {
    PermissionGate::open(config.permissions.file.as_deref())
}

fn cmd_serve(args: &[String]) -> anyhow::Result<()> {
    let mut config = load_config(args)?;
    if let Some(host) = flag_value(args, "--host")? {
        config.network.host = host.to_string();
    }
    if let Some(port) = flag_value(args, "--port")? {
        config.network.port = port.parse().context("--port must be a number")?;
    }
    if has_flag(args, "--synthetic") {
        config.devices.synthetic = true;
    }
    if has_flag(args, "--no-bridge") {
        config.bridge.enabled = false;
    }

    let driver: Arc<dyn DeviceDriver> = if config.devices.synthetic {
        Arc::new(SyntheticDriver::new())
    } else {
        Arc::new(SystemDriver::new())
    };

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    runtime.block_on(async move {
        let server = RelayServer::new(config, driver)?;
        let listener = server.bind().await?;
        server
            .run(listener, async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    log::error!("Failed to listen for shutdown signal: {}", e);
                }
            })
            .await?;
        Ok::<(), anyhow::Error>(())
    })
}

fn parse_device(args: &[String], usage: &str) -> anyhow::Result<nodeflow::DeviceType> {
    let Some(device) = args.get(2).filter(|a| !a.starts_with("--")) else {
        bail!("Usage: {}", usage);
    };
    Ok(device.parse()?)
}

fn cmd_grant(args: &[String]) -> anyhow::Result<()> {
    let device = parse_device(args, "nodeflow grant <device> [--hours <n>]")?;
    let config = load_config(args)?;
    let hours = match flag_value(args, "--hours")? {
        Some(h) => h.parse::<f64>().context("--hours must be a number")?,
        None => config.permissions.default_grant_hours,
    };

    let gate = open_gate(&config);
    let grant = gate.grant(device, hours);
    println!("Granted {} until {}", device, grant.expires_at.to_rfc3339());
    Ok(())
}

fn cmd_revoke(args: &[String]) -> anyhow::Result<()> {
    let device = parse_device(args, "nodeflow revoke <device>")?;
    let config = load_config(args)?;
    if open_gate(&config).revoke(device) {
        println!("Revoked {}", device);
    } else {
        println!("No grant for {}", device);
    }
    Ok(())
}

fn cmd_permissions(args: &[String]) -> anyhow::Result<()> {
    let config = load_config(args)?;
    let gate = open_gate(&config);
    let grants = gate.grants();
    if has_flag(args, "--json") {
        println!("{}", serde_json::to_string_pretty(&grants)?);
        return Ok(());
    }

    match gate.path() {
        Some(path) => println!("Permission file: {}", path.display()),
        None => println!("Permission file: (in memory)"),
    }
    for status in grants {
        println!(
            "{:<12} {:<8} expires {} ({}s left)",
            status.device,
            if status.active { "granted" } else { "inactive" },
            status.expires_at.to_rfc3339(),
            status.remaining_secs
        );
    }
    Ok(())
}

#[cfg(feature = "audio")]
fn cmd_list_audio_sinks(args: &[String]) -> anyhow::Result<()> {
    use nodeflow::audio::{list_audio_devices, AudioDirection};
    use nodeflow::bridge::find_virtual_cable;

    let devices = list_audio_devices(AudioDirection::Output)?;
    if has_flag(args, "--json") {
        println!("{}", serde_json::to_string_pretty(&devices)?);
        return Ok(());
    }

    for d in &devices {
        println!(
            "{}: {} ({} Hz, {} ch){}",
            d.id,
            d.name,
            d.sample_rate,
            d.channels,
            if d.is_default { " [default]" } else { "" }
        );
    }
    match find_virtual_cable(devices.iter().map(|d| d.name.as_str())) {
        Some(name) => println!("Virtual cable: {}", name),
        None => println!("No virtual audio cable found"),
    }
    Ok(())
}

#[cfg(not(feature = "audio"))]
fn cmd_list_audio_sinks(_args: &[String]) -> anyhow::Result<()> {
    bail!("nodeflow was built without audio support; rebuild with --features audio")
}
