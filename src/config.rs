use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::dispatch::ReminderSettings;

const PREFIX: &str = "STUDYSLOT_";

#[derive(Debug)]
pub enum ConfigError {
    Invalid { key: String, value: String },
    /// One half of a pair that must be set together.
    Incomplete(&'static str),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Invalid { key, value } => write!(f, "invalid value for {key}: {value:?}"),
            ConfigError::Incomplete(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Outbound mail API. Absent when no key is configured.
#[derive(Debug, Clone)]
pub struct MailConfig {
    pub api_url: String,
    pub api_key: String,
    pub from: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub metrics_port: Option<u16>,
    pub reminder_interval: Duration,
    pub reminders: ReminderSettings,
    pub mail: Option<MailConfig>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any `STUDYSLOT_*` lookup; unset or empty values take defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |name: &str| {
            lookup(&format!("{PREFIX}{name}")).filter(|v| !v.trim().is_empty())
        };
        let parse = |name: &str| -> Result<Option<u64>, ConfigError> {
            get(name)
                .map(|v| {
                    v.trim().parse::<u64>().map_err(|_| ConfigError::Invalid {
                        key: format!("{PREFIX}{name}"),
                        value: v.clone(),
                    })
                })
                .transpose()
        };
        let port_of = |name: &str| -> Result<Option<u16>, ConfigError> {
            parse(name)?
                .map(|p| {
                    u16::try_from(p).map_err(|_| ConfigError::Invalid {
                        key: format!("{PREFIX}{name}"),
                        value: p.to_string(),
                    })
                })
                .transpose()
        };

        let tls_cert = get("TLS_CERT");
        let tls_key = get("TLS_KEY");
        if tls_cert.is_some() != tls_key.is_some() {
            return Err(ConfigError::Incomplete(
                "both STUDYSLOT_TLS_CERT and STUDYSLOT_TLS_KEY must be set, or neither",
            ));
        }

        let mail = match get("MAIL_API_KEY") {
            None => None,
            Some(api_key) => Some(MailConfig {
                api_url: get("MAIL_API_URL")
                    .unwrap_or_else(|| "https://api.resend.com/emails".into()),
                api_key,
                from: get("MAIL_FROM").ok_or(ConfigError::Incomplete(
                    "STUDYSLOT_MAIL_FROM is required when STUDYSLOT_MAIL_API_KEY is set",
                ))?,
            }),
        };

        let lookahead_hours = parse("REMINDER_LOOKAHEAD_HOURS")?.unwrap_or(24);
        let interval_secs = parse("REMINDER_INTERVAL_SECS")?.unwrap_or(300).max(1);
        let send_timeout_secs = parse("MAIL_SEND_TIMEOUT_SECS")?.unwrap_or(10).max(1);

        Ok(Self {
            port: port_of("PORT")?.unwrap_or(5433),
            bind: get("BIND").unwrap_or_else(|| "0.0.0.0".into()),
            data_dir: PathBuf::from(get("DATA_DIR").unwrap_or_else(|| "./data".into())),
            password: get("PASSWORD").unwrap_or_else(|| "studyslot".into()),
            max_connections: parse("MAX_CONNECTIONS")?.unwrap_or(256) as usize,
            compact_threshold: parse("COMPACT_THRESHOLD")?.unwrap_or(1000),
            tls_cert,
            tls_key,
            metrics_port: port_of("METRICS_PORT")?,
            reminder_interval: Duration::from_secs(interval_secs),
            reminders: ReminderSettings {
                window: Duration::from_secs(lookahead_hours * 60 * 60),
                send_timeout: Duration::from_secs(send_timeout_secs),
                app_base_url: get("APP_BASE_URL").map(|u| u.trim_end_matches('/').to_string()),
            },
            mail,
        })
    }
}
