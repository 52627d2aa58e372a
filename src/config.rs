use std::{collections::HashMap, env, fmt::Display, path::PathBuf, str::FromStr, time::Duration};

use thiserror::Error;
use tracing::{info, warn};

/// Raised when an environment variable is present but cannot be parsed
#[derive(Debug, Error)]
#[error("invalid value for {key}: {message}")]
pub struct ConfigError {
    pub key: &'static str,
    pub message: String,
}

/// How the SMTP connection is secured
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmtpTls {
    /// Implicit TLS, usually port 465
    Wrapper,
    /// Plain connection upgraded with STARTTLS, usually port 587
    StartTls,
    /// No encryption (local relays and test servers only)
    None,
}

impl FromStr for SmtpTls {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "wrapper" | "tls" | "ssl" => Ok(SmtpTls::Wrapper),
            "starttls" => Ok(SmtpTls::StartTls),
            "none" | "plain" => Ok(SmtpTls::None),
            other => Err(format!("unknown TLS mode {other:?}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub tls: SmtpTls,
}

/// Placement of the overlays on a badge, in millimetres from the top-left corner
#[derive(Debug, Clone)]
pub struct IdCardConfig {
    pub template: Option<PathBuf>,
    pub dpi: f32,
    pub name_x_mm: f32,
    pub name_y_mm: f32,
    pub font_pt: f32,
    pub qr_x_mm: f32,
    pub qr_y_mm: f32,
    pub qr_mm: f32,
}

impl Default for IdCardConfig {
    fn default() -> Self {
        Self {
            template: None,
            dpi: 300.0,
            name_x_mm: 6.0,
            name_y_mm: 52.0,
            font_pt: 14.0,
            qr_x_mm: 12.0,
            qr_y_mm: 58.0,
            qr_mm: 24.0,
        }
    }
}

/// Runtime settings, read once at startup
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub event_name: String,

    pub session_secret: String,
    pub session_ttl: Duration,
    pub cookie_secure: bool,
    pub cron_secret: Option<String>,
    pub admin_username: Option<String>,
    pub admin_password: Option<String>,

    pub smtp: Option<SmtpConfig>,
    pub mail_from: String,
    pub report_recipients: Vec<String>,

    pub storage_url: Option<String>,
    pub storage_token: Option<String>,
    pub backup_dir: PathBuf,
    pub backup_prefix: String,
    pub backup_interval: Option<Duration>,
    pub backup_gzip: bool,

    pub bot_offline_after: Duration,
    pub idcard: IdCardConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            data_dir: PathBuf::from("database"),
            event_name: "Hackathon".to_string(),
            session_secret: String::new(),
            session_ttl: Duration::from_secs(24 * 60 * 60),
            cookie_secure: false,
            cron_secret: None,
            admin_username: None,
            admin_password: None,
            smtp: None,
            mail_from: "Hackathon Ops <ops@localhost>".to_string(),
            report_recipients: Vec::new(),
            storage_url: None,
            storage_token: None,
            backup_dir: PathBuf::from("backups"),
            backup_prefix: "backups".to_string(),
            backup_interval: Some(Duration::from_secs(60 * 60)),
            backup_gzip: false,
            bot_offline_after: Duration::from_secs(300),
            idcard: IdCardConfig::default(),
        }
    }
}

impl Config {
    /// Load the configuration from the process environment (and `.env`, if present)
    pub fn load() -> Result<Self, ConfigError> {
        #[cfg(feature = "web")]
        {
            if let Ok(path) = dotenvy::dotenv() {
                info!("Loaded environment from {}", path.display());
            }
        }

        Self::from_vars(&env::vars().collect())
    }

    /// Build the configuration from an explicit variable map
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let env = Env(vars);
        let defaults = Config::default();
        let idcard_defaults = IdCardConfig::default();

        let session_secret = env.optional("SESSION_SECRET").unwrap_or_else(|| {
            warn!("SESSION_SECRET not set, sessions will not survive a restart");
            random_secret()
        });

        let smtp = match env.optional("SMTP_HOST") {
            Some(host) => Some(SmtpConfig {
                host,
                port: env.parse("SMTP_PORT", 465)?,
                username: env.optional("SMTP_USERNAME"),
                password: env.optional("SMTP_PASSWORD"),
                tls: env.parse("SMTP_TLS", SmtpTls::Wrapper)?,
            }),
            None => {
                info!("SMTP_HOST not set, outgoing mail will only be logged");
                None
            }
        };

        let backup_interval = env.duration("BACKUP_INTERVAL_MINS", 60, 60)?;

        Ok(Self {
            host: env.parse("HOST", defaults.host)?,
            port: env.parse("PORT", defaults.port)?,
            data_dir: env.parse("DATA_DIR", defaults.data_dir)?,
            event_name: env.parse("EVENT_NAME", defaults.event_name)?,
            session_secret,
            session_ttl: env.duration("SESSION_TTL_HOURS", 24, 60 * 60)?,
            cookie_secure: env.parse("COOKIE_SECURE", defaults.cookie_secure)?,
            cron_secret: env.optional("CRON_SECRET"),
            admin_username: env.optional("ADMIN_USERNAME"),
            admin_password: env.optional("ADMIN_PASSWORD"),
            smtp,
            mail_from: env.parse("MAIL_FROM", defaults.mail_from)?,
            report_recipients: env
                .optional("REPORT_RECIPIENTS")
                .map(|list| split_list(&list))
                .unwrap_or_default(),
            storage_url: env.optional("STORAGE_URL"),
            storage_token: env.optional("STORAGE_TOKEN"),
            backup_dir: env.parse("BACKUP_DIR", defaults.backup_dir)?,
            backup_prefix: env.parse("BACKUP_PREFIX", defaults.backup_prefix)?,
            backup_interval: (!backup_interval.is_zero()).then_some(backup_interval),
            backup_gzip: env.parse("BACKUP_GZIP", defaults.backup_gzip)?,
            bot_offline_after: Duration::from_secs(env.parse("BOT_OFFLINE_AFTER_SECS", 300)?),
            idcard: IdCardConfig {
                template: env.optional("IDCARD_TEMPLATE").map(PathBuf::from),
                dpi: env.positive("IDCARD_DPI", idcard_defaults.dpi)?,
                name_x_mm: env.offset("IDCARD_NAME_X_MM", idcard_defaults.name_x_mm)?,
                name_y_mm: env.offset("IDCARD_NAME_Y_MM", idcard_defaults.name_y_mm)?,
                font_pt: env.positive("IDCARD_FONT_PT", idcard_defaults.font_pt)?,
                qr_x_mm: env.offset("IDCARD_QR_X_MM", idcard_defaults.qr_x_mm)?,
                qr_y_mm: env.offset("IDCARD_QR_Y_MM", idcard_defaults.qr_y_mm)?,
                qr_mm: env.positive("IDCARD_QR_MM", idcard_defaults.qr_mm)?,
            },
        })
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

struct Env<'a>(&'a HashMap<String, String>);

impl Env<'_> {
    fn optional(&self, key: &str) -> Option<String> {
        self.0
            .get(key)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    fn parse<T>(&self, key: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: Display,
    {
        match self.optional(key) {
            Some(raw) => raw.parse().map_err(|e: T::Err| {
                warn!("Invalid {key} value: {e}");
                ConfigError {
                    key,
                    message: e.to_string(),
                }
            }),
            None => {
                info!("{key} not set, using default");
                Ok(default)
            }
        }
    }

    /// A count of `unit_secs` second units; zero is allowed
    fn duration(
        &self,
        key: &'static str,
        default: u64,
        unit_secs: u64,
    ) -> Result<Duration, ConfigError> {
        let count: u64 = self.parse(key, default)?;
        count
            .checked_mul(unit_secs)
            .map(Duration::from_secs)
            .ok_or_else(|| invalid(key, format!("{count} is too large")))
    }

    /// A finite, strictly positive float
    fn positive(&self, key: &'static str, default: f32) -> Result<f32, ConfigError> {
        let value: f32 = self.parse(key, default)?;
        if value.is_finite() && value > 0.0 {
            Ok(value)
        } else {
            Err(invalid(key, format!("{value} must be a positive number")))
        }
    }

    /// A finite float that may be zero but not negative
    fn offset(&self, key: &'static str, default: f32) -> Result<f32, ConfigError> {
        let value: f32 = self.parse(key, default)?;
        if value.is_finite() && value >= 0.0 {
            Ok(value)
        } else {
            Err(invalid(key, format!("{value} must not be negative")))
        }
    }
}

fn invalid(key: &'static str, message: String) -> ConfigError {
    warn!("Invalid {key} value: {message}");
    ConfigError { key, message }
}

fn split_list(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(feature = "web")]
fn random_secret() -> String {
    use rand::{Rng, distributions::Alphanumeric};

    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(48)
        .map(char::from)
        .collect()
}

#[cfg(not(feature = "web"))]
fn random_secret() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let config = Config::from_vars(&HashMap::new()).unwrap();
        assert_eq!(config.port, 3000);
        assert!(config.smtp.is_none());
        assert_eq!(config.backup_interval, Some(Duration::from_secs(3600)));
        assert!(!config.session_secret.is_empty());
    }

    #[test]
    fn parses_lists_and_smtp_settings() {
        let config = Config::from_vars(&vars(&[
            ("SMTP_HOST", "smtp.example.org"),
            ("SMTP_PORT", "587"),
            ("SMTP_TLS", "starttls"),
            ("REPORT_RECIPIENTS", "a@example.org, b@example.org,,"),
            ("BACKUP_INTERVAL_MINS", "0"),
        ]))
        .unwrap();

        let smtp = config.smtp.unwrap();
        assert_eq!(smtp.port, 587);
        assert_eq!(smtp.tls, SmtpTls::StartTls);
        assert_eq!(config.report_recipients, vec!["a@example.org", "b@example.org"]);
        assert_eq!(config.backup_interval, None);
    }

    #[test]
    fn rejects_unparseable_values() {
        let err = Config::from_vars(&vars(&[("PORT", "eighty")])).unwrap_err();
        assert_eq!(err.key, "PORT");
    }

    #[test]
    fn badge_sizes_must_be_positive() {
        for key in ["IDCARD_DPI", "IDCARD_FONT_PT", "IDCARD_QR_MM"] {
            for raw in ["0", "-3", "NaN", "inf"] {
                let err = Config::from_vars(&vars(&[(key, raw)])).unwrap_err();
                assert_eq!(err.key, key, "{key}={raw}");
            }
        }

        let config = Config::from_vars(&vars(&[("IDCARD_DPI", "150"), ("IDCARD_QR_X_MM", "0")]))
            .unwrap();
        assert_eq!(config.idcard.dpi, 150.0);
        assert_eq!(config.idcard.qr_x_mm, 0.0);
    }

    #[test]
    fn badge_offsets_must_not_be_negative() {
        let err = Config::from_vars(&vars(&[("IDCARD_NAME_Y_MM", "-1")])).unwrap_err();
        assert_eq!(err.key, "IDCARD_NAME_Y_MM");
    }

    #[test]
    fn overflowing_durations_are_rejected() {
        let huge = u64::MAX.to_string();
        let huge = huge.as_str();

        let err = Config::from_vars(&vars(&[("SESSION_TTL_HOURS", huge)])).unwrap_err();
        assert_eq!(err.key, "SESSION_TTL_HOURS");

        let err = Config::from_vars(&vars(&[("BACKUP_INTERVAL_MINS", huge)])).unwrap_err();
        assert_eq!(err.key, "BACKUP_INTERVAL_MINS");
    }
}
