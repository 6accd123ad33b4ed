//! Command-line arguments for the simulated host.
//!
//! This module defines the CLI interface using `clap`. See `main` for end-to-end usage.
use clap::Parser;

/// Parsed command-line arguments.
#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Path to a JSON file holding an array of connection profiles.
    #[clap(long)]
    pub profiles: String,

    /// Name of the profile every simulated instance attaches to.
    #[clap(long, default_value = "default")]
    pub profile: String,

    /// Number of algorithm instances (handles 1..=N).
    #[clap(long, default_value_t = 4, value_parser = clap::value_parser!(u16).range(1..))]
    pub instances: u16,

    /// Symbol the instances quote.
    #[clap(long, default_value = "EURUSD")]
    pub symbol: String,

    /// Tick interval of every instance, in milliseconds.
    #[clap(long, default_value_t = 250)]
    pub tick_ms: u64,

    /// Number of remote commands to issue before exiting; 0 runs until Ctrl+C.
    #[clap(long, default_value_t = 20)]
    pub commands: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(instances: &str) -> Result<Args, clap::Error> {
        Args::try_parse_from(["mt_host", "--profiles", "p.json", "--instances", instances])
    }

    #[test]
    fn instance_count_must_fit_a_handle() {
        assert_eq!(parse("65535").unwrap().instances, u16::MAX);
        assert!(parse("0").is_err());
        assert!(parse("65536").is_err());
        assert!(parse("4294967295").is_err());
    }

    #[test]
    fn defaults_apply() {
        let args = Args::try_parse_from(["mt_host", "--profiles", "p.json"]).unwrap();
        assert_eq!(args.instances, 4);
        assert_eq!(args.profile, "default");
    }
}
