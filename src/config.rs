//! Server settings read once from `INNKEEP_*` environment variables.
//!
//! Unset or unparsable values fall back to their defaults.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::limits::DEFAULT_STORAGE_TIMEOUT;
use crate::notify::DispatcherConfig;
use crate::workflow::MailSettings;

const PREFIX: &str = "INNKEEP_";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MailTransportKind {
    Smtp,
    /// JSON lines appended to a file.
    Outbox,
    Log,
}

impl FromStr for MailTransportKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "smtp" => Ok(Self::Smtp),
            "outbox" => Ok(Self::Outbox),
            "log" => Ok(Self::Log),
            other => Err(format!("unknown mail transport: {other}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub max_connections: usize,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,

    pub data_dir: PathBuf,
    pub compact_threshold: u64,
    pub storage_timeout: Duration,
    pub seed_rooms: bool,

    pub password: String,
    pub admin_user: String,
    pub admin_password: String,

    pub metrics_port: Option<u16>,

    pub mail_transport: MailTransportKind,
    pub smtp_host: String,
    pub smtp_port: u16,
    pub mail_outbox: PathBuf,
    pub mail_from: String,
    pub owner_email: String,
    pub mail_templates: PathBuf,
    pub mail_queue_capacity: usize,
    pub mail_max_attempts: u32,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. `lookup` receives the full variable name.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |name: &str| lookup(&format!("{PREFIX}{name}")).filter(|v| !v.is_empty());
        fn parsed<T: FromStr>(raw: Option<String>, default: T) -> T {
            raw.and_then(|s| s.trim().parse().ok()).unwrap_or(default)
        }
        let mail = MailSettings::default();
        let dispatcher = DispatcherConfig::default();

        Self {
            port: parsed(get("PORT"), 5433),
            bind: get("BIND").unwrap_or_else(|| "0.0.0.0".into()),
            max_connections: parsed(get("MAX_CONNECTIONS"), 256),
            tls_cert: get("TLS_CERT"),
            tls_key: get("TLS_KEY"),

            data_dir: PathBuf::from(get("DATA_DIR").unwrap_or_else(|| "./data".into())),
            compact_threshold: parsed(get("COMPACT_THRESHOLD"), 1000),
            storage_timeout: get("STORAGE_TIMEOUT_MS")
                .and_then(|s| s.trim().parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_STORAGE_TIMEOUT),
            seed_rooms: parsed(get("SEED_ROOMS"), true),

            password: get("PASSWORD").unwrap_or_else(|| "innkeep".into()),
            admin_user: get("ADMIN_USER").unwrap_or_else(|| "admin".into()),
            admin_password: get("ADMIN_PASSWORD").unwrap_or_else(|| "admin".into()),

            metrics_port: get("METRICS_PORT").and_then(|s| s.trim().parse().ok()),

            mail_transport: parsed(get("MAIL_TRANSPORT"), MailTransportKind::Log),
            smtp_host: get("SMTP_HOST").unwrap_or_else(|| "localhost".into()),
            smtp_port: parsed(get("SMTP_PORT"), 1025),
            mail_outbox: PathBuf::from(get("MAIL_OUTBOX").unwrap_or_else(|| "./data/outbox.jsonl".into())),
            mail_from: get("MAIL_FROM").unwrap_or(mail.from),
            owner_email: get("OWNER_EMAIL").unwrap_or(mail.owner),
            mail_templates: get("MAIL_TEMPLATES")
                .map(PathBuf::from)
                .unwrap_or(dispatcher.template_dir),
            mail_queue_capacity: parsed(get("MAIL_QUEUE_CAPACITY"), dispatcher.capacity),
            mail_max_attempts: parsed(get("MAIL_MAX_ATTEMPTS"), dispatcher.max_attempts),
        }
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("innkeep.wal")
    }

    pub fn dispatcher(&self) -> DispatcherConfig {
        DispatcherConfig {
            capacity: self.mail_queue_capacity,
            max_attempts: self.mail_max_attempts,
            template_dir: self.mail_templates.clone(),
            ..DispatcherConfig::default()
        }
    }

    pub fn mail_settings(&self) -> MailSettings {
        MailSettings {
            from: self.mail_from.clone(),
            owner: self.owner_email.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(pairs: &[(&str, &str)]) -> Config {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| env.get(key).cloned())
    }

    #[test]
    fn defaults() {
        let c = config(&[]);
        assert_eq!(c.port, 5433);
        assert_eq!(c.bind, "0.0.0.0");
        assert_eq!(c.storage_timeout, Duration::from_secs(3));
        assert!(c.seed_rooms);
        assert_eq!(c.mail_transport, MailTransportKind::Log);
        assert_eq!((c.smtp_host.as_str(), c.smtp_port), ("localhost", 1025));
        assert_eq!(c.mail_from, "bnbbooking@gmail.com");
        assert_eq!(c.metrics_port, None);
        assert_eq!(c.wal_path(), PathBuf::from("./data/innkeep.wal"));
    }

    #[test]
    fn overrides() {
        let c = config(&[
            ("INNKEEP_PORT", "6000"),
            ("INNKEEP_STORAGE_TIMEOUT_MS", "250"),
            ("INNKEEP_SEED_ROOMS", "false"),
            ("INNKEEP_MAIL_TRANSPORT", "SMTP"),
            ("INNKEEP_MAIL_QUEUE_CAPACITY", "8"),
            ("INNKEEP_ADMIN_USER", "owner"),
            ("INNKEEP_METRICS_PORT", "9100"),
        ]);
        assert_eq!(c.port, 6000);
        assert_eq!(c.storage_timeout, Duration::from_millis(250));
        assert!(!c.seed_rooms);
        assert_eq!(c.mail_transport, MailTransportKind::Smtp);
        assert_eq!(c.dispatcher().capacity, 8);
        assert_eq!(c.admin_user, "owner");
        assert_eq!(c.metrics_port, Some(9100));
    }

    #[test]
    fn bad_values_fall_back() {
        let c = config(&[
            ("INNKEEP_PORT", "not-a-port"),
            ("INNKEEP_MAIL_TRANSPORT", "pigeon"),
            ("INNKEEP_BIND", ""),
        ]);
        assert_eq!(c.port, 5433);
        assert_eq!(c.mail_transport, MailTransportKind::Log);
        assert_eq!(c.bind, "0.0.0.0");
    }
}
