use std::{env, net::SocketAddr, path::PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use chrono::Duration;

const DEFAULT_PORT: u16 = 8080;
const DEFAULT_POSTS_PATH: &str = "posts.csv";
const DEFAULT_WORKBOOK_PATH: &str = "ratings.xlsx";
const DEFAULT_SPREADSHEET_TITLE: &str = "TopK_Ratings";
const DEFAULT_SESSION_IDLE_HOURS: i64 = 12;

/// How an untouched rating control is treated at submit time.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum RatingPolicy {
    /// The first option is pre-selected and submitted when the participant never changes it.
    #[default]
    DefaultToFirst,
    /// Controls start unselected and every post must be rated before submission.
    RequireExplicit,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum CredentialsSource {
    File(PathBuf),
    Inline(String),
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SpreadsheetRef {
    Id(String),
    Title(String),
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SheetsSettings {
    pub credentials: CredentialsSource,
    pub spreadsheet: SpreadsheetRef,
    pub worksheet: Option<String>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum StoreSettings {
    GoogleSheets(SheetsSettings),
    Workbook { path: PathBuf },
}

#[derive(Clone, Debug)]
pub struct SurveyConfig {
    pub bind_addr: SocketAddr,
    pub posts_path: PathBuf,
    pub store: StoreSettings,
    pub rating_policy: RatingPolicy,
    pub session_idle: Duration,
}

impl SurveyConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup so tests do not touch the process env.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let port = match read("PORT") {
            Some(raw) => raw
                .parse::<u16>()
                .with_context(|| format!("PORT must be a valid port number, got {raw:?}"))?,
            None => DEFAULT_PORT,
        };

        let posts_path = read("SURVEY_POSTS_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_POSTS_PATH));

        let store = match read("SURVEY_STORE").as_deref() {
            None | Some("sheets") => StoreSettings::GoogleSheets(sheets_settings(&read)?),
            Some("workbook") => StoreSettings::Workbook {
                path: read("SURVEY_WORKBOOK_PATH")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_WORKBOOK_PATH)),
            },
            Some(other) => bail!("SURVEY_STORE must be `sheets` or `workbook`, got {other:?}"),
        };

        let require_explicit = match read("SURVEY_REQUIRE_EXPLICIT_RATING") {
            Some(raw) => parse_flag(&raw).context("invalid SURVEY_REQUIRE_EXPLICIT_RATING")?,
            None => false,
        };
        let rating_policy = if require_explicit {
            RatingPolicy::RequireExplicit
        } else {
            RatingPolicy::DefaultToFirst
        };

        let session_idle = match read("SURVEY_SESSION_IDLE_HOURS") {
            Some(raw) => raw
                .parse::<i64>()
                .ok()
                .filter(|hours| *hours > 0)
                .and_then(Duration::try_hours)
                .ok_or_else(|| {
                    anyhow!("SURVEY_SESSION_IDLE_HOURS must be a positive number of hours, got {raw:?}")
                })?,
            None => Duration::hours(DEFAULT_SESSION_IDLE_HOURS),
        };

        Ok(Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], port)),
            posts_path,
            store,
            rating_policy,
            session_idle,
        })
    }
}

fn sheets_settings<R>(read: &R) -> Result<SheetsSettings>
where
    R: Fn(&str) -> Option<String>,
{
    let credentials = match (
        read("GOOGLE_SERVICE_ACCOUNT_FILE"),
        read("GOOGLE_SERVICE_ACCOUNT_JSON"),
    ) {
        (Some(path), _) => CredentialsSource::File(PathBuf::from(path)),
        (None, Some(json)) => CredentialsSource::Inline(json),
        (None, None) => bail!(
            "GOOGLE_SERVICE_ACCOUNT_FILE or GOOGLE_SERVICE_ACCOUNT_JSON is required for the sheets store"
        ),
    };

    let spreadsheet = match read("SHEETS_SPREADSHEET_ID") {
        Some(id) => SpreadsheetRef::Id(id),
        None => SpreadsheetRef::Title(
            read("SHEETS_SPREADSHEET_TITLE").unwrap_or_else(|| DEFAULT_SPREADSHEET_TITLE.into()),
        ),
    };

    Ok(SheetsSettings {
        credentials,
        spreadsheet,
        worksheet: read("SHEETS_WORKSHEET"),
    })
}

fn parse_flag(raw: &str) -> Result<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => bail!("expected a boolean flag, got {other:?}"),
    }
}
