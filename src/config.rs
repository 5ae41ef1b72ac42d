use std::path::PathBuf;
use std::str::FromStr;

use chrono::NaiveTime;
use log::LevelFilter;
use sqlx::postgres::PgConnectOptions;

use crate::error::{Error, Result};

/// Channels scraped when TELEGRAM_CHANNELS is not set.
const DEFAULT_CHANNELS: &str = "chemedapp,lobelia4cosmetics,tikvahpharma";
/// Default vision model used for object detection (can be overridden via OLLAMA_VISION_MODEL).
const DEFAULT_VISION_MODEL: &str = "qwen2.5vl:7b";

/// Database connection parameters.
#[derive(Debug, Clone)]
pub struct DbSettings {
    pub host: String,
    pub port: u16,
    pub name: String,
    pub user: String,
    pub password: String,
    /// Schema holding the dbt-built warehouse models.
    pub warehouse_schema: String,
}

impl DbSettings {
    pub fn connect_options(&self) -> PgConnectOptions {
        PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .database(&self.name)
            .username(&self.user)
            .password(&self.password)
    }
}

/// Telegram API credentials and scrape targets.
#[derive(Debug, Clone)]
pub struct TelegramSettings {
    pub api_id: Option<i32>,
    pub api_hash: Option<String>,
    pub session_file: PathBuf,
    pub channels: Vec<String>,
    pub scrape_limit: usize,
}

#[derive(Debug, Clone)]
pub struct ModelSettings {
    pub host: String,
    pub port: u16,
    pub vision_model: String,
    pub min_confidence: f64,
}

#[derive(Debug, Clone)]
pub struct ScheduleSettings {
    pub at: NaiveTime,
    pub utc_offset_hours: i32,
}

/// Everything a pipeline run or the API server needs, read once from the environment.
#[derive(Debug, Clone)]
pub struct Settings {
    pub db: DbSettings,
    pub telegram: TelegramSettings,
    pub model: ModelSettings,
    pub schedule: ScheduleSettings,
    pub data_dir: PathBuf,
    pub dbt_bin: String,
    pub dbt_project_dir: PathBuf,
    pub api_bind: String,
    pub api_max_connections: u32,
    pub log_level: LevelFilter,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from an arbitrary key lookup (the process environment in production).
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let warehouse_schema = get("WAREHOUSE_SCHEMA", "tg_data_warehouse");
        if !is_identifier(&warehouse_schema) {
            return Err(Error::Config(format!(
                "WAREHOUSE_SCHEMA must be a plain SQL identifier, got {:?}",
                warehouse_schema
            )));
        }

        let db = DbSettings {
            host: get("DB_HOST", "localhost"),
            port: parse_var(&lookup, "DB_PORT", 5432)?,
            name: get("DB_NAME", "mydatabase"),
            user: get("DB_USER", "user"),
            password: get("DB_PASSWORD", "password"),
            warehouse_schema,
        };

        let api_id = match lookup("TELEGRAM_APP_ID") {
            Some(raw) => Some(raw.trim().parse::<i32>().map_err(|_| {
                Error::Config(format!("TELEGRAM_APP_ID must be an integer, got {:?}", raw))
            })?),
            None => None,
        };
        let channels = get("TELEGRAM_CHANNELS", DEFAULT_CHANNELS)
            .split(',')
            .map(|c| c.trim().trim_start_matches('@').to_string())
            .filter(|c| !c.is_empty())
            .collect();
        let telegram = TelegramSettings {
            api_id,
            api_hash: lookup("TELEGRAM_APP_HASH"),
            session_file: PathBuf::from(get("TELEGRAM_SESSION", "telegram_scraper_session")),
            channels,
            scrape_limit: parse_var(&lookup, "SCRAPE_LIMIT", 200)?,
        };

        let min_confidence: f64 = parse_var(&lookup, "DETECTION_MIN_CONFIDENCE", 0.25)?;
        if !(0.0..=1.0).contains(&min_confidence) {
            return Err(Error::Config(
                "DETECTION_MIN_CONFIDENCE must be between 0 and 1".into(),
            ));
        }
        let model = ModelSettings {
            host: get("OLLAMA_HOST", "http://localhost"),
            port: parse_var(&lookup, "OLLAMA_PORT", 11434)?,
            vision_model: get("OLLAMA_VISION_MODEL", DEFAULT_VISION_MODEL),
            min_confidence,
        };

        let at_raw = get("SCHEDULE_AT", "05:00");
        let at = NaiveTime::parse_from_str(&at_raw, "%H:%M").map_err(|_| {
            Error::Config(format!("SCHEDULE_AT must look like HH:MM, got {:?}", at_raw))
        })?;
        let utc_offset_hours: i32 = parse_var(&lookup, "SCHEDULE_UTC_OFFSET_HOURS", 3)?;
        if !(-23..=23).contains(&utc_offset_hours) {
            return Err(Error::Config(
                "SCHEDULE_UTC_OFFSET_HOURS must be between -23 and 23".into(),
            ));
        }

        let log_raw = get("LOG_LEVEL", "info");
        let log_level = LevelFilter::from_str(&log_raw)
            .map_err(|_| Error::Config(format!("unknown LOG_LEVEL {:?}", log_raw)))?;

        Ok(Settings {
            db,
            telegram,
            model,
            schedule: ScheduleSettings {
                at,
                utc_offset_hours,
            },
            data_dir: PathBuf::from(get("DATA_DIR", "data/raw")),
            dbt_bin: get("DBT_BIN", "dbt"),
            dbt_project_dir: PathBuf::from(get("DBT_PROJECT_DIR", "my_telegram_analytics")),
            api_bind: get("API_BIND", "127.0.0.1:8000"),
            api_max_connections: parse_var(&lookup, "API_DB_MAX_CONNECTIONS", 5)?,
            log_level,
        })
    }

    pub fn messages_dir(&self) -> PathBuf {
        self.data_dir.join("telegram_messages")
    }

    pub fn images_dir(&self) -> PathBuf {
        self.data_dir.join("images")
    }
}

fn parse_var<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| Error::Config(format!("{} has an invalid value: {:?}", key, raw))),
        None => Ok(default),
    }
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
