use std::fs;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
use reqwest::{Client, StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info};

use crate::{
    config::{CredentialsSource, SheetsSettings, SpreadsheetRef},
    store::{CellValue, RatingStore, SheetRow, StoreError},
};

const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const SHEETS_API: &str = "https://sheets.googleapis.com/v4/spreadsheets";
const DRIVE_FILES_API: &str = "https://www.googleapis.com/drive/v3/files";
const SCOPES: [&str; 2] = [
    "https://www.googleapis.com/auth/spreadsheets",
    "https://www.googleapis.com/auth/drive",
];
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const ASSERTION_LIFETIME_SECS: i64 = 3600;
const TOKEN_REFRESH_MARGIN_SECS: i64 = 60;
const SPREADSHEET_MIME_TYPE: &str = "application/vnd.google-apps.spreadsheet";
/// Rows are appended below the header row.
const APPEND_START_CELL: &str = "A2";

/// The subset of a Google service-account key file that token minting needs.
#[derive(Clone, Debug, Deserialize)]
pub struct ServiceAccountKey {
    pub client_email: String,
    pub private_key: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

impl ServiceAccountKey {
    pub fn load(source: &CredentialsSource) -> Result<Self> {
        let raw = match source {
            CredentialsSource::File(path) => fs::read_to_string(path).with_context(|| {
                format!("failed to read service account key {}", path.display())
            })?,
            CredentialsSource::Inline(json) => json.clone(),
        };
        serde_json::from_str(&raw).context("service account key is not valid JSON")
    }
}

#[derive(Serialize)]
struct AssertionClaims<'a> {
    iss: &'a str,
    scope: String,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
}

#[derive(Deserialize)]
struct DriveFileList {
    #[serde(default)]
    files: Vec<DriveFile>,
}

#[derive(Deserialize)]
struct DriveFile {
    id: String,
}

struct AccessToken {
    value: String,
    expires_at: DateTime<Utc>,
}

/// Base URLs of the Google APIs, overridable for tests.
#[derive(Clone, Debug)]
pub struct SheetsEndpoints {
    pub sheets_api: String,
    pub drive_files_api: String,
}

impl Default for SheetsEndpoints {
    fn default() -> Self {
        Self {
            sheets_api: SHEETS_API.to_string(),
            drive_files_api: DRIVE_FILES_API.to_string(),
        }
    }
}

/// Appends rating rows to a Google spreadsheet using a service account.
///
/// The access token and the resolved spreadsheet id are kept for the lifetime
/// of the store, so one instance should be shared by every request.
pub struct SheetsStore {
    http: Client,
    key: ServiceAccountKey,
    encoding_key: EncodingKey,
    spreadsheet: SpreadsheetRef,
    worksheet: Option<String>,
    endpoints: SheetsEndpoints,
    spreadsheet_id: OnceCell<String>,
    token: Mutex<Option<AccessToken>>,
}

impl SheetsStore {
    pub fn from_settings(settings: &SheetsSettings) -> Result<Self> {
        let key = ServiceAccountKey::load(&settings.credentials)?;
        Self::new(
            key,
            settings.spreadsheet.clone(),
            settings.worksheet.clone(),
            SheetsEndpoints::default(),
        )
    }

    pub fn new(
        key: ServiceAccountKey,
        spreadsheet: SpreadsheetRef,
        worksheet: Option<String>,
        endpoints: SheetsEndpoints,
    ) -> Result<Self> {
        let encoding_key = EncodingKey::from_rsa_pem(key.private_key.as_bytes())
            .context("service account private_key is not a valid RSA PEM key")?;

        Ok(Self {
            http: Client::new(),
            key,
            encoding_key,
            spreadsheet,
            worksheet,
            endpoints,
            spreadsheet_id: OnceCell::new(),
            token: Mutex::new(None),
        })
    }

    fn signed_assertion(&self, now: DateTime<Utc>) -> Result<String, StoreError> {
        let claims = AssertionClaims {
            iss: &self.key.client_email,
            scope: SCOPES.join(" "),
            aud: &self.key.token_uri,
            iat: now.timestamp(),
            exp: now.timestamp() + ASSERTION_LIFETIME_SECS,
        };
        encode(&Header::new(Algorithm::RS256), &claims, &self.encoding_key)
            .map_err(|err| StoreError::Auth(format!("failed to sign assertion: {err}")))
    }

    async fn access_token(&self) -> Result<String, StoreError> {
        let mut guard = self.token.lock().await;
        let now = Utc::now();
        if let Some(token) = guard.as_ref() {
            if token.expires_at - Duration::seconds(TOKEN_REFRESH_MARGIN_SECS) > now {
                return Ok(token.value.clone());
            }
        }

        let assertion = self.signed_assertion(now)?;
        let response = self
            .http
            .post(&self.key.token_uri)
            .form(&[
                ("grant_type", JWT_BEARER_GRANT),
                ("assertion", assertion.as_str()),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StoreError::Auth(format!("token endpoint returned {status}: {body}")));
        }

        let payload: TokenResponse = response.json().await?;
        debug!(expires_in = payload.expires_in, "minted sheets access token");
        let value = payload.access_token.clone();
        *guard = Some(AccessToken {
            value: payload.access_token,
            expires_at: now + Duration::seconds(payload.expires_in),
        });

        Ok(value)
    }

    async fn spreadsheet_id(&self) -> Result<&str, StoreError> {
        self.spreadsheet_id
            .get_or_try_init(|| async {
                match &self.spreadsheet {
                    SpreadsheetRef::Id(id) => Ok(id.clone()),
                    SpreadsheetRef::Title(title) => self.find_spreadsheet(title).await,
                }
            })
            .await
            .map(String::as_str)
    }

    async fn find_spreadsheet(&self, title: &str) -> Result<String, StoreError> {
        let token = self.access_token().await?;
        let escaped = title.replace('\\', "\\\\").replace('\'', "\\'");
        let query = format!(
            "name = '{escaped}' and mimeType = '{SPREADSHEET_MIME_TYPE}' and trashed = false"
        );

        let response = self
            .http
            .get(&self.endpoints.drive_files_api)
            .bearer_auth(token)
            .query(&[("q", query.as_str()), ("fields", "files(id,name)")])
            .send()
            .await?;
        let response = ensure_success(response).await?;
        let listing: DriveFileList = response.json().await?;

        let file = listing
            .files
            .into_iter()
            .next()
            .ok_or_else(|| StoreError::SpreadsheetNotFound(title.to_string()))?;
        info!(title, spreadsheet_id = %file.id, "resolved ratings spreadsheet");
        Ok(file.id)
    }

    fn append_range(&self) -> String {
        match &self.worksheet {
            Some(name) => format!("'{}'!{APPEND_START_CELL}", name.replace('\'', "''")),
            None => APPEND_START_CELL.to_string(),
        }
    }

    fn append_url(&self, spreadsheet_id: &str) -> Result<Url, StoreError> {
        let mut url = Url::parse(&self.endpoints.sheets_api)
            .map_err(|err| StoreError::Config(format!("invalid sheets endpoint: {err}")))?;
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| StoreError::Config("sheets endpoint cannot hold a path".into()))?;
            segments
                .push(spreadsheet_id)
                .push("values")
                .push(&format!("{}:append", self.append_range()));
        }
        url.query_pairs_mut()
            .append_pair("valueInputOption", "RAW")
            .append_pair("insertDataOption", "INSERT_ROWS");
        Ok(url)
    }
}

#[async_trait]
impl RatingStore for SheetsStore {
    fn describe(&self) -> String {
        match &self.spreadsheet {
            SpreadsheetRef::Id(id) => format!("google sheet {id}"),
            SpreadsheetRef::Title(title) => format!("google sheet \"{title}\""),
        }
    }

    async fn append_rows(&self, rows: &[SheetRow]) -> Result<(), StoreError> {
        let spreadsheet_id = self.spreadsheet_id().await?;
        let url = self.append_url(spreadsheet_id)?;
        let token = self.access_token().await?;

        let values: Vec<Vec<_>> = rows
            .iter()
            .map(|row| row.iter().map(CellValue::to_json).collect())
            .collect();
        let body = json!({
            "range": self.append_range(),
            "majorDimension": "ROWS",
            "values": values,
        });

        let response = self
            .http
            .post(url)
            .bearer_auth(token)
            .json(&body)
            .send()
            .await?;
        ensure_success(response).await?;

        debug!(spreadsheet_id, rows = rows.len(), "appended rows to sheet");
        Ok(())
    }
}

async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, StoreError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let message = response.text().await.unwrap_or_default();
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            Err(StoreError::Auth(format!("{status}: {message}")))
        }
        _ => Err(StoreError::Rejected { status, message }),
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        net::SocketAddr,
        sync::{
            Arc, Mutex as StdMutex,
            atomic::{AtomicUsize, Ordering},
        },
    };

    use axum::{
        Form, Json, Router,
        extract::{Path, Query, State},
        http::{HeaderMap, StatusCode as HttpStatus},
        routing::{get, post},
    };
    use jsonwebtoken::{DecodingKey, Validation, decode};
    use serde_json::Value;
    use tokio::net::TcpListener;

    use super::*;

    const PRIVATE_KEY: &str = include_str!("testdata/service_account_key.pem");
    const PUBLIC_KEY: &str = include_str!("testdata/service_account_pub.pem");

    fn key(token_uri: &str) -> ServiceAccountKey {
        ServiceAccountKey {
            client_email: "survey@project.iam.gserviceaccount.com".into(),
            private_key: PRIVATE_KEY.into(),
            token_uri: token_uri.into(),
        }
    }

    fn store(spreadsheet: SpreadsheetRef, worksheet: Option<&str>) -> SheetsStore {
        SheetsStore::new(
            key(DEFAULT_TOKEN_URI),
            spreadsheet,
            worksheet.map(str::to_string),
            SheetsEndpoints::default(),
        )
        .unwrap()
    }

    #[test]
    fn loads_inline_key_with_default_token_uri() {
        let json = serde_json::json!({
            "type": "service_account",
            "client_email": "a@b.iam.gserviceaccount.com",
            "private_key": PRIVATE_KEY,
        })
        .to_string();

        let key = ServiceAccountKey::load(&CredentialsSource::Inline(json)).unwrap();
        assert_eq!(key.token_uri, DEFAULT_TOKEN_URI);
        assert_eq!(key.client_email, "a@b.iam.gserviceaccount.com");
    }

    #[test]
    fn rejects_non_rsa_private_key() {
        let mut bad = key(DEFAULT_TOKEN_URI);
        bad.private_key = "not a key".into();
        assert!(
            SheetsStore::new(
                bad,
                SpreadsheetRef::Id("x".into()),
                None,
                SheetsEndpoints::default()
            )
            .is_err()
        );
    }

    #[test]
    fn assertion_is_signed_for_token_endpoint() {
        let store = store(SpreadsheetRef::Id("sheet".into()), None);
        let now = Utc::now();
        let assertion = store.signed_assertion(now).unwrap();

        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_audience(&[DEFAULT_TOKEN_URI]);
        let decoded = decode::<Value>(
            &assertion,
            &DecodingKey::from_rsa_pem(PUBLIC_KEY.as_bytes()).unwrap(),
            &validation,
        )
        .unwrap();

        let claims = decoded.claims;
        assert_eq!(claims["iss"], "survey@project.iam.gserviceaccount.com");
        assert_eq!(claims["scope"], SCOPES.join(" "));
        assert_eq!(claims["exp"].as_i64().unwrap() - claims["iat"].as_i64().unwrap(), 3600);
    }

    #[test]
    fn append_url_targets_row_after_header() {
        let plain = store(SpreadsheetRef::Id("abc".into()), None);
        assert_eq!(
            plain.append_url("abc").unwrap().as_str(),
            "https://sheets.googleapis.com/v4/spreadsheets/abc/values/A2:append?valueInputOption=RAW&insertDataOption=INSERT_ROWS"
        );

        let named = store(SpreadsheetRef::Id("abc".into()), Some("Bob's Sheet"));
        assert_eq!(named.append_range(), "'Bob''s Sheet'!A2");
        assert!(
            named
                .append_url("abc")
                .unwrap()
                .path()
                .ends_with("/values/'Bob''s%20Sheet'!A2:append")
        );
    }

    #[derive(Clone, Default)]
    struct FakeGoogle {
        token_calls: Arc<AtomicUsize>,
        drive_queries: Arc<StdMutex<Vec<String>>>,
        appends: Arc<StdMutex<Vec<(String, String, Value)>>>,
        append_queries: Arc<StdMutex<Vec<HashMap<String, String>>>>,
    }

    async fn token(
        State(fake): State<FakeGoogle>,
        Form(form): Form<HashMap<String, String>>,
    ) -> Json<Value> {
        assert_eq!(form.get("grant_type").map(String::as_str), Some(JWT_BEARER_GRANT));
        assert!(form.contains_key("assertion"));
        fake.token_calls.fetch_add(1, Ordering::SeqCst);
        Json(serde_json::json!({ "access_token": "tok-1", "expires_in": 3600, "token_type": "Bearer" }))
    }

    async fn drive_files(
        State(fake): State<FakeGoogle>,
        Query(query): Query<HashMap<String, String>>,
    ) -> Json<Value> {
        fake.drive_queries
            .lock()
            .unwrap()
            .push(query.get("q").cloned().unwrap_or_default());
        Json(serde_json::json!({ "files": [{ "id": "sheet-123", "name": "TopK_Ratings" }] }))
    }

    async fn append(
        State(fake): State<FakeGoogle>,
        Path((id, range)): Path<(String, String)>,
        Query(query): Query<HashMap<String, String>>,
        headers: HeaderMap,
        Json(body): Json<Value>,
    ) -> Result<Json<Value>, HttpStatus> {
        if headers.get("authorization").and_then(|v| v.to_str().ok()) != Some("Bearer tok-1") {
            return Err(HttpStatus::UNAUTHORIZED);
        }
        fake.append_queries.lock().unwrap().push(query);
        fake.appends.lock().unwrap().push((id, range, body));
        Ok(Json(serde_json::json!({ "updates": { "updatedRows": 1 } })))
    }

    async fn spawn_fake() -> (SocketAddr, FakeGoogle) {
        let fake = FakeGoogle::default();
        let app = Router::new()
            .route("/token", post(token))
            .route("/drive/files", get(drive_files))
            .route(
                "/drive/empty",
                get(|| async { Json(serde_json::json!({ "files": [] })) }),
            )
            .route("/sheets/:id/values/:range", post(append))
            .with_state(fake.clone());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (addr, fake)
    }

    fn fake_store(addr: SocketAddr, spreadsheet: SpreadsheetRef) -> SheetsStore {
        SheetsStore::new(
            key(&format!("http://{addr}/token")),
            spreadsheet,
            None,
            SheetsEndpoints {
                sheets_api: format!("http://{addr}/sheets"),
                drive_files_api: format!("http://{addr}/drive/files"),
            },
        )
        .unwrap()
    }

    #[tokio::test]
    async fn appends_rows_resolving_title_once_and_reusing_token() {
        let (addr, fake) = spawn_fake().await;
        let store = fake_store(addr, SpreadsheetRef::Title("TopK_Ratings".into()));

        let row = vec![
            CellValue::Text("2024-05-01T10:00:00.000000".into()),
            CellValue::Integer(1),
            CellValue::Bool(true),
        ];
        store.append_rows(&[row.clone()]).await.unwrap();
        store.append_rows(&[row.clone(), row]).await.unwrap();

        assert_eq!(fake.token_calls.load(Ordering::SeqCst), 1);
        let queries = fake.drive_queries.lock().unwrap().clone();
        assert_eq!(queries.len(), 1);
        assert!(queries[0].contains("name = 'TopK_Ratings'"));

        let appends = fake.appends.lock().unwrap().clone();
        assert_eq!(appends.len(), 2);
        let (id, range, body) = &appends[1];
        assert_eq!(id, "sheet-123");
        assert_eq!(range, "A2:append");
        assert_eq!(body["majorDimension"], "ROWS");
        assert_eq!(body["values"].as_array().unwrap().len(), 2);
        assert_eq!(
            body["values"][0],
            serde_json::json!(["2024-05-01T10:00:00.000000", 1, true])
        );
    }

    #[tokio::test]
    async fn free_text_is_sent_as_raw_values() {
        let (addr, fake) = spawn_fake().await;
        let store = fake_store(addr, SpreadsheetRef::Id("sheet-123".into()));

        let row = vec![
            CellValue::Text("007".into()),
            CellValue::Text("=HYPERLINK(\"x\")".into()),
            CellValue::Integer(3),
        ];
        store.append_rows(&[row]).await.unwrap();

        let queries = fake.append_queries.lock().unwrap().clone();
        assert_eq!(queries[0].get("valueInputOption").map(String::as_str), Some("RAW"));
        assert_eq!(queries[0].get("insertDataOption").map(String::as_str), Some("INSERT_ROWS"));
        let appends = fake.appends.lock().unwrap().clone();
        let (_, _, body) = &appends[0];
        assert_eq!(body["values"][0], serde_json::json!(["007", "=HYPERLINK(\"x\")", 3]));
    }

    #[tokio::test]
    async fn missing_spreadsheet_is_reported() {
        let (addr, fake) = spawn_fake().await;
        let mut store = fake_store(addr, SpreadsheetRef::Title("Nope".into()));
        store.endpoints.drive_files_api = format!("http://{addr}/drive/empty");

        let err = store
            .append_rows(&[vec![CellValue::Empty]])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::SpreadsheetNotFound(title) if title == "Nope"));
        assert!(fake.appends.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn rejected_token_surfaces_as_auth_error() {
        let (addr, _fake) = spawn_fake().await;
        let mut store = fake_store(addr, SpreadsheetRef::Id("sheet-123".into()));
        store.key.token_uri = format!("http://{addr}/no-such-endpoint");

        let err = store
            .append_rows(&[vec![CellValue::Empty]])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Auth(_)));
    }
}
