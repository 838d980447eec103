use clap::{Parser, ValueEnum};
use smtp_client::EnvelopeAddress;

#[derive(Debug, Clone, Copy, ValueEnum)]
#[clap(rename_all = "kebab_case")]
pub enum DiagnosticFormat {
    Pretty,
    Full,
    Compact,
    Json,
}

#[derive(Debug, Parser)]
#[command(about = "smtp relay daemon", disable_version_flag = true)]
pub struct Opt {
    /// Enable debug logging. Also read from the DEBUG environment
    /// variable.
    #[arg(long)]
    pub debug: bool,

    /// Port for the metrics and health check listener.
    /// Overrides the METRICS_PORT environment variable.
    #[arg(long)]
    pub metrics_port: Option<u16>,

    /// Port for the inbound SMTP listener.
    /// Overrides the SMTP_PORT environment variable.
    #[arg(long)]
    pub server_port: Option<u16>,

    /// Print the version, git commit and build time, then exit.
    #[arg(long)]
    pub version: bool,

    /// How diagnostic logs render. full, compact and pretty are intended
    /// for human consumption. json outputs machine readable records.
    #[arg(long, default_value = "full")]
    pub diag_format: DiagnosticFormat,
}

/// Process-wide settings, populated once at startup from environment
/// variables and command-line flags, and passed by Arc to each component
/// thereafter. Nothing mutates this after load.
#[derive(Debug, Clone)]
pub struct Config {
    pub debug: bool,
    pub metrics_port: u16,
    pub smtp_port: u16,
    pub email_server_host: String,
    pub email_server_port: u16,
    pub email_server_user: String,
    pub email_server_pass: String,
    /// Substituted for whatever sender the inbound client declared.
    pub from_address: EnvelopeAddress,
}

impl Config {
    pub fn load(opts: &Opt) -> Self {
        let from_address = env_or_default("FROM_ADDRESS", "");
        let from_address = match EnvelopeAddress::parse(&from_address) {
            Ok(addr) => addr,
            Err(err) => {
                tracing::warn!(
                    "FROM_ADDRESS {from_address:?} is not a valid address: {err:#}. \
                     Using the null sender"
                );
                EnvelopeAddress::null_sender()
            }
        };

        Self {
            debug: opts.debug || parse_env_bool("DEBUG", false),
            metrics_port: opts
                .metrics_port
                .unwrap_or_else(|| parse_env_port("METRICS_PORT", 2112)),
            smtp_port: opts
                .server_port
                .unwrap_or_else(|| parse_env_port("SMTP_PORT", 25)),
            email_server_host: env_or_default("EMAIL_SERVER_HOST", ""),
            email_server_port: parse_env_port("EMAIL_SERVER_PORT", 587),
            email_server_user: env_or_default("EMAIL_SERVER_USER", ""),
            email_server_pass: env_or_default("EMAIL_SERVER_PASS", ""),
            from_address,
        }
    }

    pub fn upstream_addr(&self) -> String {
        format!("{}:{}", self.email_server_host, self.email_server_port)
    }
}

fn env_or_default(key: &str, default: &str) -> String {
    match std::env::var(key) {
        Ok(value) => value,
        Err(_) => default.to_string(),
    }
}

pub(crate) fn parse_env_port(key: &str, default: u16) -> u16 {
    match std::env::var(key) {
        Ok(value) => parse_port_value(key, &value, default),
        Err(_) => default,
    }
}

fn parse_port_value(key: &str, value: &str, default: u16) -> u16 {
    match value.trim().parse::<u16>() {
        Ok(port) => port,
        Err(err) => {
            tracing::warn!("Error parsing {key}={value:?} as a port: {err}. Using default value: {default}");
            default
        }
    }
}

pub fn parse_env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(value) => parse_bool_value(key, &value, default),
        Err(_) => default,
    }
}

fn parse_bool_value(key: &str, value: &str, default: bool) -> bool {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "t" | "1" | "yes" | "y" => true,
        "false" | "f" | "0" | "no" | "n" => false,
        _ => {
            tracing::warn!(
                "Error parsing {key}={value:?} as a bool. Using default value: {default}"
            );
            default
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use k9::assert_equal;

    #[test]
    fn port_parsing() {
        assert_equal!(parse_port_value("X", "2525", 25), 2525);
        assert_equal!(parse_port_value("X", " 2525 ", 25), 2525);
        assert_equal!(parse_port_value("X", "notanumber", 587), 587);
        assert_equal!(parse_port_value("X", "-1", 587), 587);
        assert_equal!(parse_port_value("X", "65536", 587), 587);
        assert_equal!(parse_port_value("X", "", 587), 587);
    }

    #[test]
    fn bool_parsing() {
        for value in ["true", "t", "1", "yes", "y", "TRUE", "Yes"] {
            assert_equal!(parse_bool_value("X", value, false), true);
        }
        for value in ["false", "f", "0", "no", "n", "FALSE", "No"] {
            assert_equal!(parse_bool_value("X", value, true), false);
        }
        assert_equal!(parse_bool_value("X", "maybe", false), false);
        assert_equal!(parse_bool_value("X", "maybe", true), true);
    }

    #[test]
    fn bad_email_server_port_falls_back_to_default() {
        std::env::set_var("EMAIL_SERVER_PORT", "notanumber");
        assert_equal!(parse_env_port("EMAIL_SERVER_PORT", 587), 587);
        std::env::remove_var("EMAIL_SERVER_PORT");
    }
}
