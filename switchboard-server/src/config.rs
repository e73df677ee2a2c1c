//! Relay configuration: flags first, `SPS_*` environment as fallback.

use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "switchboard-server",
    version,
    about = "Standalone Switchboard peering relay (SPS)"
)]
pub struct ServerConfig {
    /// Interface to bind.
    #[arg(long, default_value = "0.0.0.0", env = "SPS_HOST")]
    pub host: String,

    /// Port to listen on.
    #[arg(long, default_value_t = 8080, env = "SPS_PORT")]
    pub port: u16,

    /// Require this passcode in every client intro.
    #[arg(long, env = "SPS_PASS")]
    pub pass: Option<String>,

    /// Suppress per-connection logging.
    #[arg(long, default_value_t = false, env = "SPS_QUIET")]
    pub quiet: bool,

    /// Seconds between stats snapshots; 0 disables them.
    #[arg(long = "stats", default_value_t = 60, env = "SPS_STAT_FREQ")]
    pub stat_freq: u64,

    /// Keepalive as text "ping" frames (true) or WebSocket pings (false).
    #[arg(
        long = "ping_text",
        default_value_t = true,
        env = "SPS_PING_TEXT",
        action = clap::ArgAction::Set
    )]
    pub ping_text: bool,

    /// Seconds between keepalive pings.
    #[arg(long = "ping", default_value_t = 30, env = "SPS_PING_FREQ")]
    pub ping_freq: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            pass: None,
            quiet: false,
            stat_freq: 60,
            ping_text: true,
            ping_freq: 30,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_surface() {
        let cfg = ServerConfig::parse_from(["switchboard-server"]);
        assert_eq!(cfg.host, "0.0.0.0");
        assert_eq!(cfg.port, 8080);
        assert!(cfg.pass.is_none());
        assert!(!cfg.quiet);
        assert_eq!(cfg.stat_freq, 60);
        assert!(cfg.ping_text);
        assert_eq!(cfg.ping_freq, 30);
    }

    #[test]
    fn flags_override_defaults() {
        let cfg = ServerConfig::parse_from([
            "switchboard-server",
            "--host",
            "127.0.0.1",
            "--port",
            "9000",
            "--pass",
            "hunter2",
            "--quiet",
            "--stats",
            "5",
            "--ping_text",
            "false",
            "--ping",
            "10",
        ]);
        assert_eq!(cfg.host, "127.0.0.1");
        assert_eq!(cfg.port, 9000);
        assert_eq!(cfg.pass.as_deref(), Some("hunter2"));
        assert!(cfg.quiet);
        assert_eq!(cfg.stat_freq, 5);
        assert!(!cfg.ping_text);
        assert_eq!(cfg.ping_freq, 10);
    }
}
