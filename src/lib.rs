use anyhow::{Context, Result};
use log::LevelFilter;
use std::borrow::Cow;
use std::env;
use std::error::Error;
use std::fmt;

pub mod api;
pub mod flatten;
pub mod jobs;
pub mod model;
pub mod notify;
pub mod warehouse;

pub static APP_NAME: &str = "fpl_pipeline";

pub static DB_URI_VAR: &str = "DB_URI";
pub static JOB_VAR: &str = "FPL_JOB";
pub static API_URL_VAR: &str = "FPL_API_URL";
pub static LEAGUE_ID_VAR: &str = "FPL_LEAGUE_ID";
pub static OPERATOR_EMAIL_VAR: &str = "FPL_OPERATOR_EMAIL";
pub static SENDER_EMAIL_VAR: &str = "FPL_SENDER_EMAIL";

pub static DEFAULT_API_URL: &str = "https://fantasy.premierleague.com/api";
pub const DEFAULT_LEAGUE_ID: u64 = 885844;

/// Settings shared by every job, read from flags or the environment.
#[derive(Clone)]
pub struct Config {
    pub db_uri: Option<String>,
    pub api_url: String,
    pub league_id: u64,
    pub operator_email: Option<String>,
    pub sender_email: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_uri: None,
            api_url: DEFAULT_API_URL.to_string(),
            league_id: DEFAULT_LEAGUE_ID,
            operator_email: None,
            sender_email: None,
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("db_uri", &self.db_uri.as_ref().map(|_| "<hidden>"))
            .field("api_url", &self.api_url)
            .field("league_id", &self.league_id)
            .field("operator_email", &self.operator_email)
            .field("sender_email", &self.sender_email)
            .finish()
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let config = Self::from_env_with_default_league();
        match non_empty_var(LEAGUE_ID_VAR) {
            Some(id) => Ok(Self {
                league_id: parse_league_id(&id)?,
                ..config
            }),
            None => Ok(config),
        }
    }

    /// Every setting but the league, which is the only one that can fail to parse. Enough to
    /// tell the operator that the league was not.
    pub fn from_env_with_default_league() -> Self {
        Self {
            db_uri: non_empty_var(DB_URI_VAR),
            api_url: non_empty_var(API_URL_VAR).unwrap_or_else(|| DEFAULT_API_URL.to_string()),
            league_id: DEFAULT_LEAGUE_ID,
            operator_email: non_empty_var(OPERATOR_EMAIL_VAR),
            sender_email: non_empty_var(SENDER_EMAIL_VAR),
        }
    }
}

fn non_empty_var(var: &str) -> Option<String> {
    env::var(var).ok().filter(|v| !v.trim().is_empty())
}

fn parse_league_id(id: &str) -> Result<u64> {
    id.trim()
        .parse()
        .with_context(|| format!("{} is not a league ID: {:?}", LEAGUE_ID_VAR, id))
}

/// Failures a job reports without any underlying I/O error to wrap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineError {
    ConfigMissing(&'static str),
    DataUnavailable(String),
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineError::ConfigMissing(var) => write!(f, "{} not found", var),
            PipelineError::DataUnavailable(what) => write!(f, "data unavailable: {}", what),
        }
    }
}

impl Error for PipelineError {}

pub fn set_up_logger<T>(calling_module: T, verbose: bool) -> Result<()>
where
    T: Into<Cow<'static, str>>,
{
    let level = if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    let _ = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{} [{}] [{}] {}",
                chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ"),
                record.target(),
                record.level(),
                message
            ))
        })
        .level(LevelFilter::Warn)
        .level_for(APP_NAME, level)
        .level_for(calling_module, level)
        .level_for("hyper", LevelFilter::Off)
        .level_for("rustls", LevelFilter::Off)
        .level_for("reqwest", LevelFilter::Warn)
        .level_for("sqlx", LevelFilter::Warn)
        .level_for("aws_config", LevelFilter::Warn)
        .level_for("aws_smithy_runtime", LevelFilter::Warn)
        .chain(std::io::stdout())
        .apply();

    Ok(())
}
