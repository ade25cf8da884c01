use std::time::Duration;

use clap::{ArgAction, Parser};

/// Command-line options for the Antigravity quota watcher.
#[derive(Debug, Clone, Parser)]
#[command(author, version, about = "Antigravity model quota watcher", long_about = None)]
pub struct CliArgs {
    /// Automatic refresh period in seconds (watch mode).
    #[arg(
        long = "interval",
        env = "AGQUOTA_INTERVAL",
        default_value_t = 120,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    interval_secs: u64,

    /// Keep running and refresh on a timer instead of probing once.
    #[arg(long = "watch", action = ArgAction::SetTrue)]
    pub watch: bool,

    /// Model label to mark as selected in the report.
    #[arg(long = "model", value_name = "LABEL")]
    pub model: Option<String>,

    /// Enable debug-level logging.
    #[arg(long = "verbose", short = 'v', action = ArgAction::SetTrue)]
    pub verbose: bool,
}

impl CliArgs {
    /// Returns the configured refresh period.
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_two_minutes() {
        let args = CliArgs::parse_from(["agquota"]);
        assert_eq!(args.refresh_interval(), Duration::from_secs(120));
        assert!(!args.watch);
        assert_eq!(args.model, None);
    }

    #[test]
    fn rejects_zero_interval() {
        assert!(CliArgs::try_parse_from(["agquota", "--interval", "0"]).is_err());
    }

    #[test]
    fn parses_watch_flags() {
        let args =
            CliArgs::parse_from(["agquota", "--watch", "--interval", "30", "--model", "gpt-x"]);
        assert!(args.watch);
        assert_eq!(args.refresh_interval(), Duration::from_secs(30));
        assert_eq!(args.model.as_deref(), Some("gpt-x"));
    }
}
