use std::env;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

/// Distinguishes runtime behavior for different stages of the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppEnvironment {
    Development,
    Test,
    Production,
}

impl AppEnvironment {
    fn from_str(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "prod" | "production" => Self::Production,
            "test" | "ci" => Self::Test,
            _ => Self::Development,
        }
    }
}

/// Top-level configuration for the application.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub environment: AppEnvironment,
    pub server: ServerConfig,
    pub telemetry: TelemetryConfig,
    pub risk: RiskConfig,
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let environment = AppEnvironment::from_str(
            &env::var("APP_ENV").unwrap_or_else(|_| "development".to_string()),
        );

        let host = env::var("APP_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port = env::var("APP_PORT")
            .unwrap_or_else(|_| "9000".to_string())
            .parse::<u16>()
            .map_err(|_| ConfigError::InvalidPort)?;

        let log_level = env::var("APP_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let fhir_endpoint = env::var("RISK_FHIR_ENDPOINT")
            .unwrap_or_else(|_| "http://localhost:3001".to_string());
        let basis_pie_url = env::var("RISK_BASIS_PIE_URL")
            .unwrap_or_else(|_| format!("http://{host}:{port}/pies"));
        let debounce = millis("RISK_DEBOUNCE_MS", 3000)?;
        let shutdown_grace = millis("RISK_SHUTDOWN_GRACE_MS", 5000)?;

        Ok(Self {
            environment,
            server: ServerConfig { host, port },
            telemetry: TelemetryConfig { log_level },
            risk: RiskConfig {
                fhir_endpoint,
                basis_pie_url,
                debounce,
                shutdown_grace,
            },
        })
    }
}

fn millis(var: &'static str, default: u64) -> Result<Duration, ConfigError> {
    match env::var(var) {
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Duration::from_millis)
            .map_err(|_| ConfigError::InvalidDuration { var }),
        Err(_) => Ok(Duration::from_millis(default)),
    }
}

/// Settings controlling the HTTP server binding.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        if self.host.eq_ignore_ascii_case("localhost") {
            return Ok(SocketAddr::new(IpAddr::from([127, 0, 0, 1]), self.port));
        }

        let ip: IpAddr = self
            .host
            .parse()
            .map_err(|source| ConfigError::InvalidHost { source })?;

        Ok(SocketAddr::new(ip, self.port))
    }
}

/// Tracing and metrics controls.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub log_level: String,
}

/// Upstream FHIR server, published pie links, and recalculation timing.
#[derive(Debug, Clone)]
pub struct RiskConfig {
    pub fhir_endpoint: String,
    /// Prefix for the `basis` links on published assessments.
    pub basis_pie_url: String,
    pub debounce: Duration,
    pub shutdown_grace: Duration,
}

#[derive(Debug)]
pub enum ConfigError {
    InvalidPort,
    InvalidHost { source: std::net::AddrParseError },
    InvalidDuration { var: &'static str },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InvalidPort => write!(f, "APP_PORT must be a valid u16"),
            ConfigError::InvalidHost { .. } => {
                write!(f, "APP_HOST must parse to an IPv4 or IPv6 address")
            }
            ConfigError::InvalidDuration { var } => {
                write!(f, "{var} must be a whole number of milliseconds")
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::InvalidPort | ConfigError::InvalidDuration { .. } => None,
            ConfigError::InvalidHost { source } => Some(source),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::{Mutex, OnceLock};

    fn env_guard() -> &'static Mutex<()> {
        static GUARD: OnceLock<Mutex<()>> = OnceLock::new();
        GUARD.get_or_init(|| Mutex::new(()))
    }

    fn reset_env() {
        for var in [
            "APP_ENV",
            "APP_HOST",
            "APP_PORT",
            "APP_LOG_LEVEL",
            "RISK_FHIR_ENDPOINT",
            "RISK_BASIS_PIE_URL",
            "RISK_DEBOUNCE_MS",
            "RISK_SHUTDOWN_GRACE_MS",
        ] {
            env::remove_var(var);
        }
    }

    #[test]
    fn load_uses_defaults_when_env_missing() {
        let _lock = env_guard().lock().expect("env mutex poisoned");
        reset_env();
        let config = AppConfig::load().expect("config loads with defaults");
        assert_eq!(config.environment, AppEnvironment::Development);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.telemetry.log_level, "info");
        assert_eq!(config.risk.fhir_endpoint, "http://localhost:3001");
        assert_eq!(config.risk.basis_pie_url, "http://127.0.0.1:9000/pies");
        assert_eq!(config.risk.debounce, Duration::from_secs(3));
        assert_eq!(config.risk.shutdown_grace, Duration::from_secs(5));
    }

    #[test]
    fn accepts_localhost_host() {
        let _lock = env_guard().lock().expect("env mutex poisoned");
        reset_env();
        env::set_var("APP_HOST", "localhost");
        let config = AppConfig::load().expect("config loads");
        let addr = config.server.socket_addr().expect("localhost resolves");
        assert_eq!(addr, SocketAddr::new(IpAddr::from([127, 0, 0, 1]), 9000));
        assert_eq!(config.risk.basis_pie_url, "http://localhost:9000/pies");
    }

    #[test]
    fn risk_settings_come_from_env() {
        let _lock = env_guard().lock().expect("env mutex poisoned");
        reset_env();
        env::set_var("APP_ENV", "prod");
        env::set_var("RISK_FHIR_ENDPOINT", "http://fhir.internal:8080");
        env::set_var("RISK_BASIS_PIE_URL", "https://risk.example.org/pies");
        env::set_var("RISK_DEBOUNCE_MS", "250");
        let config = AppConfig::load().expect("config loads");
        reset_env();

        assert_eq!(config.environment, AppEnvironment::Production);
        assert_eq!(config.risk.fhir_endpoint, "http://fhir.internal:8080");
        assert_eq!(config.risk.basis_pie_url, "https://risk.example.org/pies");
        assert_eq!(config.risk.debounce, Duration::from_millis(250));
    }

    #[test]
    fn rejects_non_numeric_durations() {
        let _lock = env_guard().lock().expect("env mutex poisoned");
        reset_env();
        env::set_var("RISK_SHUTDOWN_GRACE_MS", "soon");
        let err = AppConfig::load().expect_err("grace must be numeric");
        reset_env();

        assert!(matches!(
            err,
            ConfigError::InvalidDuration {
                var: "RISK_SHUTDOWN_GRACE_MS"
            }
        ));
        assert_eq!(
            err.to_string(),
            "RISK_SHUTDOWN_GRACE_MS must be a whole number of milliseconds"
        );
    }
}
