use rust_decimal::Decimal;
use std::str::FromStr;

/// Application configuration, environment-driven
#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,
    pub port: u16,
    /// Transition watcher poll interval, seconds
    pub poll_interval_secs: u64,
    /// Suppress transition events below this surprise magnitude
    pub min_surprise_pct: Option<Decimal>,
    /// Authority assigned to derived observations; must stay below every
    /// primary source so derived facts never outrank them
    pub derived_authority: u8,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let database_path =
            std::env::var("DATABASE_PATH").unwrap_or_else(|_| "./obspine.db".to_string());

        let port = std::env::var("PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse()
            .unwrap_or(8080);

        let poll_interval_secs = std::env::var("WATCH_POLL_INTERVAL")
            .ok()
            .and_then(|v| v.parse().ok())
            .filter(|&v| v > 0)
            .unwrap_or(60);

        let min_surprise_pct = std::env::var("MIN_SURPRISE_PCT")
            .ok()
            .and_then(|v| Decimal::from_str(&v).ok());

        let derived_authority = std::env::var("DERIVED_AUTHORITY")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(10);

        Ok(Self {
            database_path,
            port,
            poll_interval_secs,
            min_surprise_pct,
            derived_authority,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_env() {
        let config = Config::from_env().unwrap();
        assert_eq!(config.poll_interval_secs, 60);
        assert_eq!(config.derived_authority, 10);
    }
}
