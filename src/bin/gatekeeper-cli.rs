use std::net::IpAddr;

use clap::{Parser, Subcommand};
use ipnet::IpNet;

use gatekeeper::config::{RuleSet, RuleStore};

#[derive(Parser)]
#[command(name = "gatekeeper-cli")]
#[command(about = "Edit the gatekeeper rules file", long_about = None)]
struct Cli {
    /// Rules file shared with the running gatekeeper
    #[arg(
        short,
        long,
        env = "RULES_FILE",
        default_value = "/var/log/shared/firewall/rules.json"
    )]
    rules: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the effective rules
    List,
    /// Block an IP address or CIDR range
    BlockIp { ip: String },
    /// Lift a block, including an automatic one
    UnblockIp { ip: String },
    /// Allow connections that ask for this port
    AddPort { port: u16 },
    /// Stop allowing this port
    RemovePort { port: u16 },
    /// Set the per-minute attempt limit
    SetMaxAttempts { limit: i64 },
    /// Exempt an IP address or CIDR range from every check
    Whitelist { ip: String },
    /// Remove a whitelist entry
    Unwhitelist { ip: String },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let store = RuleStore::open(&cli.rules);

    let changed = match cli.command {
        Commands::List => {
            let snapshot = store.snapshot();
            println!("{}", serde_json::to_string_pretty(&snapshot.rules)?);
            for entry in &snapshot.parsed.invalid {
                eprintln!("warning: ignoring invalid entry {:?}", entry);
            }
            return Ok(());
        }
        Commands::BlockIp { ip } => {
            let ip = parse_target(&ip)?;
            // An operator block replaces any automatic one and never expires.
            store.update(|rules| {
                let took_over = rules.auto_block_expiry.remove(&ip).is_some();
                rules.block(&ip) || took_over
            })?
        }
        Commands::UnblockIp { ip } => {
            let ip = parse_target(&ip)?;
            store.update(|rules| rules.unblock(&ip))?
        }
        Commands::AddPort { port } => {
            if port == 0 {
                return Err("port must be between 1 and 65535".into());
            }
            store.update(|rules| add_port(rules, port))?
        }
        Commands::RemovePort { port } => store.update(|rules| {
            let before = rules.allowed_ports.len();
            rules.allowed_ports.retain(|&p| p != i64::from(port));
            before != rules.allowed_ports.len()
        })?,
        Commands::SetMaxAttempts { limit } => {
            if limit <= 0 {
                return Err("max attempts must be greater than 0".into());
            }
            store.update(|rules| {
                let changed = rules.max_attempts_per_minute != limit;
                rules.max_attempts_per_minute = limit;
                changed
            })?
        }
        Commands::Whitelist { ip } => {
            let ip = parse_target(&ip)?;
            store.update(|rules| {
                if rules.whitelist.contains(&ip) {
                    return false;
                }
                rules.whitelist.push(ip.clone());
                true
            })?
        }
        Commands::Unwhitelist { ip } => {
            let ip = parse_target(&ip)?;
            store.update(|rules| {
                let before = rules.whitelist.len();
                rules.whitelist.retain(|w| w != &ip);
                before != rules.whitelist.len()
            })?
        }
    };

    if changed {
        println!("Updated {}", store.path().display());
    } else {
        println!("No change");
    }
    Ok(())
}

/// Accept a single address or a CIDR range, in canonical text form.
fn parse_target(raw: &str) -> Result<String, Box<dyn std::error::Error>> {
    let raw = raw.trim();
    if let Ok(ip) = raw.parse::<IpAddr>() {
        return Ok(ip.to_canonical().to_string());
    }
    match raw.parse::<IpNet>() {
        Ok(net) => Ok(net.trunc().to_string()),
        Err(_) => Err(format!("{:?} is not an IP address or CIDR range", raw).into()),
    }
}

fn add_port(rules: &mut RuleSet, port: u16) -> bool {
    let port = i64::from(port);
    if rules.allowed_ports.contains(&port) {
        return false;
    }
    rules.allowed_ports.push(port);
    rules.allowed_ports.sort_unstable();
    true
}
