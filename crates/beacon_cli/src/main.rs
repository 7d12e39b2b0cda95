mod logging;

use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::{error, info};

use beacon_discovery::{Announcement, Discovery, DiscoveryConfig, DiscoveryError};

/// Announce and discover services over UDP multicast.
#[derive(Debug, Parser)]
#[command(name = "beacon", version)]
struct Cli {
    /// JSON config file; missing files fall back to defaults.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Multicast group, e.g. 226.226.226.226:2266.
    #[arg(long, global = true)]
    group: Option<SocketAddrV4>,

    /// Local interface used to join the group.
    #[arg(long, global = true)]
    interface: Option<Ipv4Addr>,

    /// Also write logs to daily-rotated files in this directory.
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Announce a service endpoint until interrupted.
    Announce {
        /// Service name to announce.
        #[arg(long)]
        service: String,
        /// Endpoint URI at which the service can be reached.
        #[arg(long)]
        endpoint: String,
    },
    /// Print the live endpoints of a service, one per line.
    Lookup {
        /// Service name to resolve.
        #[arg(long)]
        service: String,
        /// Seconds to wait for a first endpoint.
        #[arg(long, default_value_t = 5)]
        wait: u64,
    },
    /// Periodically print every live service until interrupted.
    Watch {
        /// Refresh interval in milliseconds.
        #[arg(long, default_value_t = 1000, value_parser = clap::value_parser!(u64).range(1..))]
        interval: u64,
    },
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Merge the config file (if any) with command-line overrides.
fn build_config(cli: &Cli) -> Result<DiscoveryConfig> {
    let mut config = match &cli.config {
        Some(path) => DiscoveryConfig::load_or_default(path),
        None => DiscoveryConfig::default(),
    };
    if let Some(group) = cli.group {
        config.group = group;
    }
    if let Some(interface) = cli.interface {
        config.interface = interface;
    }
    if let Command::Announce { service, endpoint } = &cli.command {
        config.announcement = Some(
            Announcement::new(service.clone(), endpoint.clone())
                .context("Invalid announcement")?,
        );
    }
    config.validate().context("Invalid discovery configuration")?;
    Ok(config)
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

async fn announce(config: DiscoveryConfig) -> Result<()> {
    let mut discovery = Discovery::new(config);
    discovery
        .start(true)
        .await
        .context("Failed to start discovery")?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Interrupted, shutting down");

    discovery.stop().await?;
    Ok(())
}

async fn lookup(config: DiscoveryConfig, service: &str, wait: Duration) -> Result<()> {
    let mut discovery = Discovery::new(config);
    discovery
        .start(false)
        .await
        .context("Failed to start discovery")?;

    let result = discovery.wait_for(service, wait).await;
    discovery.stop().await?;

    match result {
        Ok(endpoints) => {
            for endpoint in endpoints {
                println!("{endpoint}");
            }
            Ok(())
        }
        Err(DiscoveryError::Timeout(_)) => {
            bail!("No endpoint for '{service}' within {wait:?}")
        }
        Err(e) => Err(e.into()),
    }
}

async fn watch(config: DiscoveryConfig, interval: Duration) -> Result<()> {
    let mut discovery = Discovery::new(config);
    discovery
        .start(false)
        .await
        .context("Failed to start discovery")?;

    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let mut services = discovery.services()?;
                services.sort();
                println!("--- {} service(s)", services.len());
                for service in services {
                    let mut endpoints = discovery.lookup(&service)?;
                    endpoints.sort();
                    println!("{service}: {}", endpoints.join(", "));
                }
            }
            result = tokio::signal::ctrl_c() => {
                result.context("Failed to listen for Ctrl-C")?;
                info!("Interrupted, shutting down");
                break;
            }
        }
    }

    discovery.stop().await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _log_guard = logging::init_logging(cli.log_dir.as_deref())?;

    let config = build_config(&cli)?;
    let result = match &cli.command {
        Command::Announce { .. } => announce(config).await,
        Command::Lookup { service, wait } => {
            lookup(config, service, Duration::from_secs(*wait)).await
        }
        Command::Watch { interval } => watch(config, Duration::from_millis(*interval)).await,
    };

    if let Err(e) = &result {
        error!("{e:#}");
    }
    result
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("beacon").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_lookup_uses_defaults() {
        let cli = parse(&["lookup", "--service", "UsersService"]);
        let config = build_config(&cli).unwrap();
        assert_eq!(config, DiscoveryConfig::default());
        match cli.command {
            Command::Lookup { service, wait } => {
                assert_eq!(service, "UsersService");
                assert_eq!(wait, 5);
            }
            other => panic!("Expected Lookup, got {other:?}"),
        }
    }

    #[test]
    fn test_announce_sets_announcement() {
        let cli = parse(&[
            "announce",
            "--service",
            "UsersService",
            "--endpoint",
            "http://10.0.0.1:8080/rest",
        ]);
        let config = build_config(&cli).unwrap();
        let announcement = config.announcement.unwrap();
        assert_eq!(announcement.service_name, "UsersService");
        assert_eq!(announcement.endpoint_uri, "http://10.0.0.1:8080/rest");
    }

    #[test]
    fn test_flags_override_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("beacon.json");
        std::fs::write(&path, r#"{"group": "239.1.2.3:4000", "expiry_timeout": 9000}"#).unwrap();

        let path_arg = path.to_string_lossy().to_string();
        let cli = parse(&[
            "--config",
            &path_arg,
            "--group",
            "239.9.9.9:5000",
            "watch",
        ]);
        let config = build_config(&cli).unwrap();
        assert_eq!(config.group.to_string(), "239.9.9.9:5000");
        assert_eq!(config.expiry_timeout, Duration::from_secs(9));
    }

    #[test]
    fn test_unicast_group_is_rejected() {
        let cli = parse(&["--group", "10.0.0.1:2266", "watch"]);
        assert!(build_config(&cli).is_err());
    }

    #[test]
    fn test_announce_rejects_delimiter_in_endpoint() {
        let cli = parse(&["announce", "--service", "Svc", "--endpoint", "http://a\tb"]);
        assert!(build_config(&cli).is_err());
    }

    #[test]
    fn test_watch_rejects_zero_interval() {
        let result = Cli::try_parse_from(["beacon", "watch", "--interval", "0"]);
        assert!(result.is_err());

        match parse(&["watch", "--interval", "250"]).command {
            Command::Watch { interval } => assert_eq!(interval, 250),
            other => panic!("Expected Watch, got {other:?}"),
        }
    }
}
