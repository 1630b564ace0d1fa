//! Runtime configuration: built-in defaults, then an optional TOML file, then
//! `EXPENSE_*` environment variables, validated once at the end.
use super::currency::{CurrencyTable, StaticRateConverter};
use super::expense::CurrencyCode;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

pub const DEFAULT_CONFIG_FILE: &str = "expense-approval.toml";

#[derive(Clone, Debug, PartialEq)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub currency: CurrencyConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug, PartialEq)]
pub struct DatabaseConfig {
    pub path: PathBuf,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CurrencyConfig {
    /// Currency the rate table is quoted against.
    pub base: String,
    /// Used for countries missing from `countries`.
    pub fallback: String,
    pub countries: HashMap<String, String>,
    /// Units of each currency per one unit of `base`.
    pub rates: HashMap<String, Decimal>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

// countries the admin sign-up flow knows how to map to a currency
const COUNTRY_CURRENCIES: [(&str, &str); 20] = [
    ("United States", "USD"),
    ("India", "INR"),
    ("United Kingdom", "GBP"),
    ("Canada", "CAD"),
    ("Australia", "AUD"),
    ("Germany", "EUR"),
    ("France", "EUR"),
    ("Japan", "JPY"),
    ("China", "CNY"),
    ("Brazil", "BRL"),
    ("Mexico", "MXN"),
    ("Singapore", "SGD"),
    ("Switzerland", "CHF"),
    ("Sweden", "SEK"),
    ("Norway", "NOK"),
    ("Denmark", "DKK"),
    ("South Africa", "ZAR"),
    ("New Zealand", "NZD"),
    ("South Korea", "KRW"),
    ("Russia", "RUB"),
];

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                path: PathBuf::from("expense-approval.db"),
            },
            currency: CurrencyConfig {
                base: "USD".to_string(),
                fallback: "USD".to_string(),
                countries: COUNTRY_CURRENCIES
                    .iter()
                    .map(|(country, code)| (country.to_string(), code.to_string()))
                    .collect(),
                rates: HashMap::new(),
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                format: LogFormat::Compact,
            },
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl AppConfig {
    /// Loads from `explicit_path` if given (it must exist), otherwise from
    /// `expense-approval.toml` in the working directory when present.
    pub fn load(explicit_path: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_with_env(explicit_path, read_env)
    }

    /// Same as [`AppConfig::load`] with environment lookups going through `env`.
    pub fn load_with_env(
        explicit_path: Option<&Path>,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        match explicit_path {
            Some(path) if !path.exists() => {
                return Err(ConfigError::MissingConfigFile(path.to_path_buf()));
            }
            Some(path) => config.apply_patch(read_patch(path)?),
            None => {
                let path = Path::new(DEFAULT_CONFIG_FILE);
                if path.exists() {
                    config.apply_patch(read_patch(path)?);
                }
            }
        }

        config.apply_env_overrides(env)?;
        config.validate()?;
        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(database) = patch.database {
            if let Some(path) = database.path {
                self.database.path = path;
            }
        }

        if let Some(currency) = patch.currency {
            if let Some(base) = currency.base {
                self.currency.base = base;
            }
            if let Some(fallback) = currency.fallback {
                self.currency.fallback = fallback;
            }
            if let Some(countries) = currency.countries {
                self.currency.countries.extend(countries);
            }
            if let Some(rates) = currency.rates {
                self.currency.rates.extend(rates);
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }
    }

    fn apply_env_overrides(
        &mut self,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(value) = env("EXPENSE_DATABASE_PATH") {
            self.database.path = PathBuf::from(value);
        }
        if let Some(value) = env("EXPENSE_LOG_LEVEL") {
            self.logging.level = value;
        }
        if let Some(value) = env("EXPENSE_LOG_FORMAT") {
            self.logging.format = value.parse().map_err(|_| ConfigError::InvalidEnvOverride {
                key: "EXPENSE_LOG_FORMAT".to_string(),
                value,
            })?;
        }
        if let Some(value) = env("EXPENSE_BASE_CURRENCY") {
            self.currency.base = value;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database.path.as_os_str().is_empty() {
            return Err(ConfigError::Validation(
                "database.path must not be empty".to_string(),
            ));
        }
        validate_currency(&self.currency)?;
        validate_logging(&self.logging)
    }

    /// Country lookup for users without a preferred currency.
    pub fn currency_table(&self) -> Result<CurrencyTable, ConfigError> {
        let countries = self
            .currency
            .countries
            .iter()
            .map(|(country, code)| Ok((country.clone(), currency_code("currency.countries", code)?)))
            .collect::<Result<HashMap<_, _>, ConfigError>>()?;

        Ok(CurrencyTable::new(
            countries,
            currency_code("currency.fallback", &self.currency.fallback)?,
        ))
    }

    pub fn converter(&self) -> Result<StaticRateConverter, ConfigError> {
        let rates = self
            .currency
            .rates
            .iter()
            .map(|(code, rate)| Ok((currency_code("currency.rates", code)?, *rate)))
            .collect::<Result<HashMap<_, _>, ConfigError>>()?;

        Ok(StaticRateConverter::new(
            currency_code("currency.base", &self.currency.base)?,
            rates,
        ))
    }
}

fn currency_code(field: &str, code: &str) -> Result<CurrencyCode, ConfigError> {
    CurrencyCode::parse(code).map_err(|err| ConfigError::Validation(format!("{field}: {err}")))
}

fn validate_currency(currency: &CurrencyConfig) -> Result<(), ConfigError> {
    currency_code("currency.base", &currency.base)?;
    currency_code("currency.fallback", &currency.fallback)?;
    for code in currency.countries.values() {
        currency_code("currency.countries", code)?;
    }
    for (code, rate) in &currency.rates {
        currency_code("currency.rates", code)?;
        if *rate <= Decimal::ZERO {
            return Err(ConfigError::Validation(format!(
                "currency.rates.{code} must be positive"
            )));
        }
    }
    Ok(())
}

// `level` is a full filter directive such as `info` or `info,expense_approval=debug`
fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    if logging.level.trim().is_empty() {
        return Err(ConfigError::Validation(
            "logging.level must not be empty".to_string(),
        ));
    }
    EnvFilter::try_new(logging.level.trim()).map(|_| ()).map_err(|err| {
        ConfigError::Validation(format!(
            "logging.level `{}` is not a valid filter directive: {err}",
            logging.level
        ))
    })
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source,
    })?;

    toml::from_str::<ConfigPatch>(&raw).map_err(|source| ConfigError::ParseFile {
        path: path.to_path_buf(),
        source,
    })
}

fn read_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    currency: Option<CurrencyPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    path: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
struct CurrencyPatch {
    base: Option<String>,
    fallback: Option<String>,
    countries: Option<HashMap<String, String>>,
    rates: Option<HashMap<String, Decimal>>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());

        let table = config.currency_table().unwrap();
        assert_eq!(table.currency_for("India").as_str(), "INR");
        assert_eq!(table.currency_for("Atlantis").as_str(), "USD");
    }

    #[test]
    fn precedence_defaults_file_env() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("expense-approval.toml");
        fs::write(
            &path,
            r#"
[database]
path = "/var/lib/expenses/data.db"

[currency]
base = "EUR"
rates = { USD = "1.08", GBP = "0.86" }
countries = { "Portugal" = "EUR" }

[logging]
level = "debug"
format = "json"
"#,
        )?;

        let config = AppConfig::load_with_env(Some(&path), |key| {
            (key == "EXPENSE_LOG_LEVEL").then(|| "warn".to_string())
        })?;

        assert_eq!(config.database.path, PathBuf::from("/var/lib/expenses/data.db"));
        assert_eq!(config.currency.base, "EUR");
        assert_eq!(config.currency.rates["USD"], Decimal::new(108, 2));
        assert_eq!(config.logging.format, LogFormat::Json);
        // env beats the file
        assert_eq!(config.logging.level, "warn");

        let table = config.currency_table()?;
        assert_eq!(table.currency_for("portugal").as_str(), "EUR");
        assert_eq!(table.currency_for("Japan").as_str(), "JPY");
        Ok(())
    }

    #[test]
    fn log_level_accepts_filter_directives() {
        let mut config = AppConfig::default();
        for level in ["debug", "info,expense_approval=debug", "warn,sled=error"] {
            config.logging.level = level.to_string();
            assert!(config.validate().is_ok(), "{level} should be accepted");
        }

        config.logging.level = "  ".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn explicit_path_must_exist() {
        let err = AppConfig::load_with_env(Some(Path::new("/nonexistent/expense.toml")), no_env)
            .unwrap_err();
        assert!(matches!(err, ConfigError::MissingConfigFile(_)));
    }

    #[test]
    fn validation_fails_fast() {
        let mut config = AppConfig::default();
        config.currency.rates.insert("EURO".to_string(), Decimal::ONE);
        assert!(matches!(config.validate(), Err(ConfigError::Validation(_))));

        let mut config = AppConfig::default();
        config.logging.level = "expense_approval=loud".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::Validation(_))));

        let err = AppConfig::load_with_env(None, |key| {
            (key == "EXPENSE_LOG_FORMAT").then(|| "xml".to_string())
        })
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnvOverride { .. }));
    }
}
