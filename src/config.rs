//! Client configuration.
//!
//! [`Config`] is a snapshot of tunables shared by consumers and producers.
//! It is validated once, when a [`Consumer`](crate::Consumer) or
//! [`Producer`](crate::Producer) is constructed, and is immutable afterwards.
//!
//! Options can be set directly on the struct or by name through
//! [`Config::set`], which accepts both `camelCase` and `snake_case` names:
//!
//! ```
//! use nsq_client::Config;
//!
//! let mut config = Config::default();
//! config.set("maxInFlight", "32").unwrap();
//! config.set("lookupd_poll_interval", "15s").unwrap();
//! assert!(config.validate().is_ok());
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::backoff::{BackoffStrategy, ExponentialStrategy, FullJitterStrategy};
use crate::error::{NsqError, Result};

/// Default maximum messages in flight across all connections of a consumer.
pub const DEFAULT_MAX_IN_FLIGHT: u32 = 1;

/// Default maximum delivery attempts before a message is given up on.
pub const DEFAULT_MAX_ATTEMPTS: u16 = 5;

/// Default heartbeat interval requested in IDENTIFY.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Upper bound for `max_in_flight`.
pub const MAX_IN_FLIGHT_LIMIT: u32 = 1_000_000;

const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(3600);

/// Which [`BackoffStrategy`] to use for consumer backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackoffKind {
    /// Doubling delay.
    #[default]
    Exponential,
    /// Random delay up to the doubling delay.
    FullJitter,
}

impl BackoffKind {
    /// Build the strategy starting at `multiplier` and capped at `max`.
    pub fn strategy(self, multiplier: Duration, max: Duration) -> Arc<dyn BackoffStrategy> {
        match self {
            Self::Exponential => Arc::new(ExponentialStrategy::new(multiplier, max)),
            Self::FullJitter => Arc::new(FullJitterStrategy::new(multiplier, max)),
        }
    }
}

/// Minimum TLS protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TlsVersion {
    /// TLS 1.2 and above.
    #[default]
    Tls12,
    /// TLS 1.3 only.
    Tls13,
}

/// TLS options used when upgrading a connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsConfig {
    /// Minimum accepted protocol version.
    pub min_version: TlsVersion,
    /// Accept any server certificate.
    pub insecure_skip_verify: bool,
    /// PEM file with extra trusted roots (in addition to the webpki roots).
    pub root_ca_file: Option<PathBuf>,
    /// PEM certificate chain presented to the server.
    pub cert_file: Option<PathBuf>,
    /// PEM private key matching `cert_file`.
    pub key_file: Option<PathBuf>,
    /// Override the server name used for verification (defaults to the host).
    pub server_name: Option<String>,
}

/// Tunables for connections, consumers and producers.
#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum messages in flight across all connections.
    pub max_in_flight: u32,
    /// Deliveries after which a message is finished as failed (0 = unlimited).
    pub max_attempts: u16,
    /// Heartbeat interval requested from the server (`None` disables).
    pub heartbeat_interval: Option<Duration>,
    /// TCP connect timeout.
    pub dial_timeout: Duration,
    /// Read deadline when heartbeats are disabled; also bounds reply waits.
    pub read_timeout: Duration,
    /// Deadline for writing one batch of commands.
    pub write_timeout: Duration,
    /// Interval between lookupd queries.
    pub lookupd_poll_interval: Duration,
    /// Fraction of the poll interval used as initial random delay.
    pub lookupd_poll_jitter: f64,
    /// Lower bound applied to requeue delays.
    pub min_requeue_delay: Duration,
    /// Upper bound applied to requeue delays.
    pub max_requeue_delay: Duration,
    /// Base delay for requeues without an explicit delay.
    pub default_requeue_delay: Duration,
    /// Strategy used for consumer backoff.
    pub backoff_strategy: BackoffKind,
    /// Base unit of the backoff strategy.
    pub backoff_multiplier: Duration,
    /// Ceiling for a single backoff period (zero disables backoff).
    pub max_backoff_duration: Duration,
    /// Idle time after which a connection's RDY credit may be moved.
    pub low_rdy_idle_timeout: Duration,
    /// How often RDY credit is re-balanced.
    pub rdy_redistribute_interval: Duration,
    /// How long a stopping consumer waits for in-flight messages.
    pub close_wait_timeout: Duration,
    /// Client identifier sent in IDENTIFY.
    pub client_id: String,
    /// Hostname sent in IDENTIFY.
    pub hostname: String,
    /// User agent sent in IDENTIFY.
    pub user_agent: String,
    /// Percentage of messages the server should deliver (0 = all).
    pub sample_rate: u8,
    /// Request deflate stream compression.
    pub deflate: bool,
    /// Deflate level (1-9).
    pub deflate_level: u32,
    /// Server-side output buffer size (`None` = server default).
    pub output_buffer_size: Option<i64>,
    /// Server-side output buffer flush timeout (`None` = server default).
    pub output_buffer_timeout: Option<Duration>,
    /// Per-message server timeout (`None` = server default).
    pub msg_timeout: Option<Duration>,
    /// Secret sent with AUTH when the server requires it.
    pub auth_secret: Option<String>,
    /// TLS options; `None` keeps the connection in plaintext.
    pub tls: Option<TlsConfig>,
}

impl Default for Config {
    fn default() -> Self {
        let hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".to_string());
        let client_id = hostname.split('.').next().unwrap_or("unknown").to_string();

        Self {
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            heartbeat_interval: Some(DEFAULT_HEARTBEAT_INTERVAL),
            dial_timeout: Duration::from_secs(1),
            read_timeout: Duration::from_secs(60),
            write_timeout: Duration::from_secs(1),
            lookupd_poll_interval: Duration::from_secs(60),
            lookupd_poll_jitter: 0.3,
            min_requeue_delay: Duration::ZERO,
            max_requeue_delay: 15 * MINUTE,
            default_requeue_delay: Duration::from_secs(90),
            backoff_strategy: BackoffKind::Exponential,
            backoff_multiplier: Duration::from_secs(1),
            max_backoff_duration: 2 * MINUTE,
            low_rdy_idle_timeout: Duration::from_secs(10),
            rdy_redistribute_interval: Duration::from_secs(5),
            close_wait_timeout: Duration::from_secs(30),
            client_id,
            hostname,
            user_agent: format!("nsq-client/{}", env!("CARGO_PKG_VERSION")),
            sample_rate: 0,
            deflate: false,
            deflate_level: 6,
            output_buffer_size: None,
            output_buffer_timeout: None,
            msg_timeout: None,
            auth_secret: None,
            tls: None,
        }
    }
}

impl Config {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Check every bound. Called once by consumer/producer constructors.
    pub fn validate(&self) -> Result<()> {
        if self.max_in_flight > MAX_IN_FLIGHT_LIMIT {
            return Err(NsqError::Config(format!(
                "max_in_flight {} exceeds {}",
                self.max_in_flight, MAX_IN_FLIGHT_LIMIT
            )));
        }
        if self.dial_timeout.is_zero() {
            return Err(NsqError::Config("dial_timeout must be positive".to_string()));
        }
        check_range("read_timeout", self.read_timeout, Duration::from_millis(100), 5 * MINUTE)?;
        check_range("write_timeout", self.write_timeout, Duration::from_millis(100), 5 * MINUTE)?;
        if let Some(heartbeat) = self.heartbeat_interval {
            check_range("heartbeat_interval", heartbeat, Duration::from_secs(1), 5 * MINUTE)?;
            if heartbeat >= self.read_timeout {
                return Err(NsqError::Config(format!(
                    "heartbeat_interval {:?} must be less than read_timeout {:?}",
                    heartbeat, self.read_timeout
                )));
            }
        }
        check_range(
            "lookupd_poll_interval",
            self.lookupd_poll_interval,
            Duration::from_millis(10),
            5 * MINUTE,
        )?;
        if !(0.0..=1.0).contains(&self.lookupd_poll_jitter) {
            return Err(NsqError::Config(format!(
                "lookupd_poll_jitter {} outside [0, 1]",
                self.lookupd_poll_jitter
            )));
        }
        check_range("min_requeue_delay", self.min_requeue_delay, Duration::ZERO, HOUR)?;
        check_range("max_requeue_delay", self.max_requeue_delay, Duration::ZERO, HOUR)?;
        check_range("default_requeue_delay", self.default_requeue_delay, Duration::ZERO, HOUR)?;
        if self.min_requeue_delay > self.max_requeue_delay {
            return Err(NsqError::Config(format!(
                "min_requeue_delay {:?} exceeds max_requeue_delay {:?}",
                self.min_requeue_delay, self.max_requeue_delay
            )));
        }
        check_range("backoff_multiplier", self.backoff_multiplier, Duration::ZERO, HOUR)?;
        check_range("max_backoff_duration", self.max_backoff_duration, Duration::ZERO, HOUR)?;
        check_range(
            "low_rdy_idle_timeout",
            self.low_rdy_idle_timeout,
            Duration::from_secs(1),
            5 * MINUTE,
        )?;
        check_range(
            "rdy_redistribute_interval",
            self.rdy_redistribute_interval,
            Duration::from_millis(1),
            Duration::from_secs(5),
        )?;
        if self.close_wait_timeout.is_zero() {
            return Err(NsqError::Config(
                "close_wait_timeout must be positive".to_string(),
            ));
        }
        if self.sample_rate > 99 {
            return Err(NsqError::Config(format!(
                "sample_rate {} outside [0, 99]",
                self.sample_rate
            )));
        }
        if !(1..=9).contains(&self.deflate_level) {
            return Err(NsqError::Config(format!(
                "deflate_level {} outside [1, 9]",
                self.deflate_level
            )));
        }
        if let Some(tls) = &self.tls {
            if tls.cert_file.is_some() != tls.key_file.is_some() {
                return Err(NsqError::Config(
                    "tls cert_file and key_file must be set together".to_string(),
                ));
            }
            crate::conn::tls::client_config(tls)?;
        }
        Ok(())
    }

    /// Backoff strategy used by the consumer's failure state machine.
    pub fn backoff(&self) -> Arc<dyn BackoffStrategy> {
        self.backoff_strategy
            .strategy(self.backoff_multiplier, self.max_backoff_duration)
    }

    /// Delay used by a requeue without an explicit delay.
    ///
    /// The configured `backoff_strategy`, seeded with `default_requeue_delay`,
    /// applied to the attempt count and clamped to
    /// `[min_requeue_delay, max_requeue_delay]`.
    pub fn requeue_delay(&self, attempts: u16) -> Duration {
        self.backoff_strategy
            .strategy(self.default_requeue_delay, self.max_requeue_delay)
            .calculate(u32::from(attempts.max(1)))
            .clamp(self.min_requeue_delay, self.max_requeue_delay)
    }

    /// Set an option by name.
    ///
    /// Durations are written as `<number><unit>` with unit one of `ns`,
    /// `us`, `ms`, `s`, `m`, `h`; a bare number is milliseconds.
    pub fn set(&mut self, option: &str, value: &str) -> Result<()> {
        let key: String = option
            .chars()
            .filter(|c| *c != '_' && *c != '-')
            .flat_map(char::to_lowercase)
            .collect();
        let value = value.trim();

        match key.as_str() {
            "maxinflight" => self.max_in_flight = parse_number(option, value)?,
            "maxattempts" => self.max_attempts = parse_number(option, value)?,
            "heartbeatinterval" => {
                self.heartbeat_interval = match value {
                    "-1" | "off" | "disabled" => None,
                    _ => Some(parse_duration(value)?),
                }
            }
            "dialtimeout" => self.dial_timeout = parse_duration(value)?,
            "readtimeout" => self.read_timeout = parse_duration(value)?,
            "writetimeout" => self.write_timeout = parse_duration(value)?,
            "lookupdpollinterval" => self.lookupd_poll_interval = parse_duration(value)?,
            "lookupdpolljitter" => self.lookupd_poll_jitter = parse_number(option, value)?,
            "minrequeuedelay" => self.min_requeue_delay = parse_duration(value)?,
            "maxrequeuedelay" => self.max_requeue_delay = parse_duration(value)?,
            "defaultrequeuedelay" => self.default_requeue_delay = parse_duration(value)?,
            "backoffstrategy" => {
                self.backoff_strategy = match value.to_ascii_lowercase().as_str() {
                    "exponential" => BackoffKind::Exponential,
                    "full_jitter" | "fulljitter" | "full-jitter" => BackoffKind::FullJitter,
                    other => {
                        return Err(NsqError::Config(format!(
                            "unknown backoff strategy {:?}",
                            other
                        )))
                    }
                }
            }
            "backoffmultiplier" => self.backoff_multiplier = parse_duration(value)?,
            "maxbackoffduration" => self.max_backoff_duration = parse_duration(value)?,
            "lowrdyidletimeout" => self.low_rdy_idle_timeout = parse_duration(value)?,
            "rdyredistributeinterval" => self.rdy_redistribute_interval = parse_duration(value)?,
            "closewaittimeout" => self.close_wait_timeout = parse_duration(value)?,
            "clientid" => self.client_id = value.to_string(),
            "hostname" => self.hostname = value.to_string(),
            "useragent" => self.user_agent = value.to_string(),
            "samplerate" => self.sample_rate = parse_number(option, value)?,
            "deflate" => self.deflate = parse_number(option, value)?,
            "deflatelevel" => self.deflate_level = parse_number(option, value)?,
            "outputbuffersize" => self.output_buffer_size = Some(parse_number(option, value)?),
            "outputbuffertimeout" => self.output_buffer_timeout = Some(parse_duration(value)?),
            "msgtimeout" => self.msg_timeout = Some(parse_duration(value)?),
            "authsecret" => self.auth_secret = Some(value.to_string()),
            "tls" | "tlsv1" => {
                let enabled: bool = parse_number(option, value)?;
                self.tls = if enabled {
                    Some(self.tls.take().unwrap_or_default())
                } else {
                    None
                };
            }
            "tlsminversion" => {
                self.tls_mut().min_version = match value.to_ascii_lowercase().as_str() {
                    "tls1.2" | "1.2" => TlsVersion::Tls12,
                    "tls1.3" | "1.3" => TlsVersion::Tls13,
                    other => {
                        return Err(NsqError::Config(format!("unknown TLS version {:?}", other)))
                    }
                }
            }
            "tlsinsecureskipverify" => {
                self.tls_mut().insecure_skip_verify = parse_number(option, value)?
            }
            "tlsrootcafile" => self.tls_mut().root_ca_file = Some(PathBuf::from(value)),
            "tlscertfile" => self.tls_mut().cert_file = Some(PathBuf::from(value)),
            "tlskeyfile" => self.tls_mut().key_file = Some(PathBuf::from(value)),
            "tlsservername" => self.tls_mut().server_name = Some(value.to_string()),
            _ => return Err(NsqError::Config(format!("unknown option {:?}", option))),
        }
        Ok(())
    }

    fn tls_mut(&mut self) -> &mut TlsConfig {
        self.tls.get_or_insert_with(TlsConfig::default)
    }
}

fn check_range(name: &str, value: Duration, min: Duration, max: Duration) -> Result<()> {
    if value < min || value > max {
        return Err(NsqError::Config(format!(
            "{} {:?} outside [{:?}, {:?}]",
            name, value, min, max
        )));
    }
    Ok(())
}

fn parse_number<T: std::str::FromStr>(option: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| NsqError::Config(format!("invalid value {:?} for {}", value, option)))
}

/// Parse a duration such as `250ms`, `1.5s`, `2m` or `1h`.
pub fn parse_duration(value: &str) -> Result<Duration> {
    let value = value.trim();
    let split = value
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(value.len());
    let (number, unit) = value.split_at(split);
    let number: f64 = number
        .parse()
        .map_err(|_| NsqError::Config(format!("invalid duration {:?}", value)))?;

    let seconds_per_unit = match unit.trim() {
        "ns" => 1e-9,
        "us" | "µs" => 1e-6,
        "" | "ms" => 1e-3,
        "s" => 1.0,
        "m" => 60.0,
        "h" => 3600.0,
        other => {
            return Err(NsqError::Config(format!(
                "unknown duration unit {:?} in {:?}",
                other, value
            )))
        }
    };

    Duration::try_from_secs_f64(number * seconds_per_unit)
        .map_err(|_| NsqError::Config(format!("invalid duration {:?}", value)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_in_flight, 1);
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.heartbeat_interval, Some(Duration::from_secs(30)));
        assert!(config.user_agent.starts_with("nsq-client/"));
    }

    #[test]
    fn test_inverted_requeue_bounds_rejected() {
        let config = Config {
            min_requeue_delay: Duration::from_secs(10),
            max_requeue_delay: Duration::from_secs(5),
            ..Config::default()
        };
        let err = config.validate().unwrap_err();
        assert!(matches!(err, NsqError::Config(_)));
        assert!(err.to_string().contains("min_requeue_delay"));
    }

    #[test]
    fn test_heartbeat_must_be_below_read_timeout() {
        let config = Config {
            heartbeat_interval: Some(Duration::from_secs(60)),
            read_timeout: Duration::from_secs(30),
            ..Config::default()
        };
        assert!(config.validate().is_err());

        let disabled = Config {
            heartbeat_interval: None,
            read_timeout: Duration::from_secs(30),
            ..Config::default()
        };
        assert!(disabled.validate().is_ok());
    }

    #[test]
    fn test_out_of_range_values_rejected() {
        let too_fast = Config {
            read_timeout: Duration::from_millis(10),
            ..Config::default()
        };
        assert!(too_fast.validate().is_err());

        let jitter = Config {
            lookupd_poll_jitter: 1.5,
            ..Config::default()
        };
        assert!(jitter.validate().is_err());

        let sample = Config {
            sample_rate: 100,
            ..Config::default()
        };
        assert!(sample.validate().is_err());

        let in_flight = Config {
            max_in_flight: MAX_IN_FLIGHT_LIMIT + 1,
            ..Config::default()
        };
        assert!(in_flight.validate().is_err());
    }

    #[test]
    fn test_set_accepts_both_spellings() {
        let mut config = Config::default();
        config.set("maxInFlight", "100").unwrap();
        config.set("max_attempts", "10").unwrap();
        config.set("heartbeatInterval", "10s").unwrap();
        config.set("lookupd_poll_interval", "500ms").unwrap();
        config.set("backoffStrategy", "full_jitter").unwrap();
        config.set("maxBackoffDuration", "1m").unwrap();

        assert_eq!(config.max_in_flight, 100);
        assert_eq!(config.max_attempts, 10);
        assert_eq!(config.heartbeat_interval, Some(Duration::from_secs(10)));
        assert_eq!(config.lookupd_poll_interval, Duration::from_millis(500));
        assert_eq!(config.backoff_strategy, BackoffKind::FullJitter);
        assert_eq!(config.max_backoff_duration, Duration::from_secs(60));
    }

    #[test]
    fn test_set_tls_options() {
        let mut config = Config::default();
        config.set("tls_v1", "true").unwrap();
        config.set("tlsMinVersion", "tls1.3").unwrap();
        config.set("tls_insecure_skip_verify", "true").unwrap();

        let tls = config.tls.as_ref().unwrap();
        assert_eq!(tls.min_version, TlsVersion::Tls13);
        assert!(tls.insecure_skip_verify);

        config.set("tls_v1", "false").unwrap();
        assert!(config.tls.is_none());
    }

    #[test]
    fn test_set_unknown_option() {
        let mut config = Config::default();
        let err = config.set("frobnicate", "1").unwrap_err();
        assert!(err.to_string().contains("unknown option"));
        assert!(config.set("maxInFlight", "lots").is_err());
    }

    #[test]
    fn test_heartbeat_can_be_disabled() {
        let mut config = Config::default();
        config.set("heartbeat_interval", "-1").unwrap();
        assert_eq!(config.heartbeat_interval, None);
    }

    #[test]
    fn test_parse_duration_units() {
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("1.5s").unwrap(), Duration::from_millis(1500));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("750").unwrap(), Duration::from_millis(750));
        assert_eq!(parse_duration("10us").unwrap(), Duration::from_micros(10));
        assert!(parse_duration("10 parsecs").is_err());
        assert!(parse_duration("s").is_err());
    }

    #[test]
    fn test_requeue_delay_clamped() {
        let config = Config {
            default_requeue_delay: Duration::from_secs(10),
            min_requeue_delay: Duration::from_secs(15),
            max_requeue_delay: Duration::from_secs(60),
            ..Config::default()
        };
        assert_eq!(config.requeue_delay(1), Duration::from_secs(15));
        assert_eq!(config.requeue_delay(2), Duration::from_secs(20));
        assert_eq!(config.requeue_delay(3), Duration::from_secs(40));
        assert_eq!(config.requeue_delay(10), Duration::from_secs(60));
    }

    #[test]
    fn test_requeue_delay_follows_backoff_strategy() {
        let config = Config {
            default_requeue_delay: Duration::from_secs(10),
            min_requeue_delay: Duration::from_secs(1),
            max_requeue_delay: Duration::from_secs(60),
            backoff_strategy: BackoffKind::FullJitter,
            ..Config::default()
        };
        let mut seen = std::collections::HashSet::new();
        for _ in 0..50 {
            let delay = config.requeue_delay(3);
            assert!(delay >= Duration::from_secs(1));
            assert!(delay <= Duration::from_secs(40));
            seen.insert(delay);
        }
        assert!(seen.len() > 1);
    }

    #[test]
    fn test_tls_key_without_cert_rejected() {
        let config = Config {
            tls: Some(TlsConfig {
                key_file: Some(PathBuf::from("/tmp/key.pem")),
                ..TlsConfig::default()
            }),
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }
}
