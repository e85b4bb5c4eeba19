use std::time::Duration;

use bluer::Address;
use clap::Parser;


/// Relay NTRIP correction data to a GNSS receiver connected via Bluetooth
#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Receiver to use (search known devices by name if unspecified)
    #[arg(short, long)]
    pub device: Option<Address>,

    /// Name of the receiver to search for
    #[arg(short, long, required_unless_present = "device")]
    pub name: Option<String>,

    /// Host name of the NTRIP caster
    #[arg(long, env = "NTRIP_HOST")]
    pub host: String,

    /// Port of the NTRIP caster
    #[arg(long, env = "NTRIP_PORT", default_value_t = ntrip::caster::DEFAULT_PORT)]
    pub port: u16,

    /// Mountpoint providing the correction stream
    #[arg(short, long, env = "NTRIP_MOUNTPOINT")]
    pub mountpoint: String,

    /// User name for the caster
    #[arg(short, long, env = "NTRIP_USER")]
    pub user: String,

    /// Password for the caster
    #[arg(long, env = "NTRIP_PASSWORD", hide_env_values = true)]
    pub password: String,

    /// User agent sent to the caster
    #[arg(long)]
    pub user_agent: Option<String>,

    /// Delay between receiver connect and caster connect, in seconds
    #[arg(long, default_value = "15", value_parser = parse_secs)]
    pub handshake_delay: Duration,

    /// Time the caster has to accept the request, in seconds
    #[arg(long, default_value = "10", value_parser = parse_secs)]
    pub handshake_timeout: Duration,

    /// Pause after each forwarded correction chunk, in milliseconds
    #[arg(long, default_value = "1000", value_parser = parse_millis)]
    pub correction_interval: Duration,

    /// Number of consecutive caster reconnect attempts (0 disables reconnecting)
    #[arg(long, default_value_t = 3)]
    pub reconnect_attempts: u32,

    /// Pause before reconnecting to the caster, in seconds
    #[arg(long, default_value = "5", value_parser = parse_secs)]
    pub reconnect_delay: Duration,

    /// Show all received sentences and correction data
    #[arg(short, long)]
    pub verbose: bool,
}

fn parse_secs(value: &str) -> Result<Duration, std::num::ParseIntError> {
    value.parse().map(Duration::from_secs)
}

fn parse_millis(value: &str) -> Result<Duration, std::num::ParseIntError> {
    value.parse().map(Duration::from_millis)
}
