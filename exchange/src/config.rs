use std::time::Duration;

/// Node configuration, read once from the environment with code defaults.
#[derive(Debug, Clone)]
pub struct Config {
    pub db_url: String,
    /// Expected number of distinct granting patients; sizes the filter.
    pub filter_capacity: usize,
    /// Target false-positive rate for the permission filter.
    pub filter_error_rate: f64,
    /// Upper bound on a single bulk-channel fetch attempt.
    pub fetch_timeout: Duration,
    /// Retries after the first failed fetch attempt.
    pub fetch_retries: u32,
    /// Paillier modulus size for hospital onboarding.
    pub paillier_bits: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_url: "sqlite:data/exchange.sqlite".to_string(),
            filter_capacity: 1000,
            filter_error_rate: 0.01,
            fetch_timeout: Duration::from_secs(3),
            fetch_retries: 3,
            paillier_bits: 2048,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            db_url: std::env::var("EXCHANGE_DB_URL").unwrap_or(defaults.db_url),
            filter_capacity: env_parse("EXCHANGE_FILTER_CAPACITY", defaults.filter_capacity),
            filter_error_rate: env_parse("EXCHANGE_FILTER_ERROR_RATE", defaults.filter_error_rate),
            fetch_timeout: Duration::from_millis(env_parse(
                "EXCHANGE_FETCH_TIMEOUT_MS",
                defaults.fetch_timeout.as_millis() as u64,
            )),
            fetch_retries: env_parse("EXCHANGE_FETCH_RETRIES", defaults.fetch_retries),
            paillier_bits: env_parse("EXCHANGE_PAILLIER_BITS", defaults.paillier_bits),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
