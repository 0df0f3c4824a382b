use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::auth::OAuthClient;
use crate::config::SheetLocator;
use crate::error::DataSourceError;

const SHEETS_API_BASE: &str = "https://sheets.googleapis.com/v4/spreadsheets/";

/// Anything that can hand back a rectangular range of rows for a locator.
#[async_trait]
pub trait RowSource: Send + Sync {
    async fn fetch(&self, locator: &SheetLocator) -> Result<Vec<Vec<String>>, DataSourceError>;
}

#[derive(Debug, Deserialize)]
struct ValueRange {
    #[serde(default)]
    values: Vec<Vec<Value>>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

fn cell_to_string(value: Value) -> String {
    match value {
        Value::String(text) => text,
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn rows_from_body(body: &str) -> Result<Vec<Vec<String>>, serde_json::Error> {
    let range: ValueRange = serde_json::from_str(body)?;
    Ok(range
        .values
        .into_iter()
        .map(|row| row.into_iter().map(cell_to_string).collect())
        .collect())
}

/// Reads the provider's message out of an error body, falling back to the raw text.
fn api_error_message(body: &str) -> String {
    serde_json::from_str::<ApiErrorBody>(body)
        .map(|parsed| parsed.error.message)
        .unwrap_or_else(|_| body.trim().to_string())
}

pub struct SheetsClient {
    client: Client,
    auth: Arc<OAuthClient>,
    base: String,
}

impl SheetsClient {
    pub fn new(auth: Arc<OAuthClient>) -> Self {
        Self {
            client: Client::new(),
            auth,
            base: SHEETS_API_BASE.to_string(),
        }
    }

    fn values_url(&self, locator: &SheetLocator) -> Result<Url, DataSourceError> {
        let mut url = Url::parse(&self.base).map_err(|err| DataSourceError::Api {
            status: 0,
            message: format!("invalid sheets endpoint: {err}"),
        })?;
        url.path_segments_mut()
            .map_err(|_| DataSourceError::Api {
                status: 0,
                message: "sheets endpoint cannot be a base".to_string(),
            })?
            .pop_if_empty()
            .push(&locator.spreadsheet_id)
            .push("values")
            .push(&locator.range);
        Ok(url)
    }
}

#[async_trait]
impl RowSource for SheetsClient {
    async fn fetch(&self, locator: &SheetLocator) -> Result<Vec<Vec<String>>, DataSourceError> {
        let url = self.values_url(locator)?;
        let token = self.auth.access_token().await?;
        debug!("fetching {}", url);

        let response = self.client.get(url).bearer_auth(token).send().await?;
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            return Err(DataSourceError::Api {
                status: status.as_u16(),
                message: api_error_message(&body),
            });
        }

        rows_from_body(&body).map_err(|err| DataSourceError::Api {
            status: status.as_u16(),
            message: format!("unexpected response shape: {err}"),
        })
    }
}

/// Rows from a local CSV export of the sheet. The file is read without a header
/// row and ragged rows are kept as-is; the locator is ignored.
pub struct CsvSource {
    path: PathBuf,
}

impl CsvSource {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    fn read_rows(&self) -> Result<Vec<Vec<String>>, DataSourceError> {
        let to_error = |source: csv::Error| DataSourceError::Csv {
            path: self.path.clone(),
            source,
        };
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_path(&self.path)
            .map_err(to_error)?;

        let mut rows = Vec::new();
        for result in reader.records() {
            let record = result.map_err(to_error)?;
            rows.push(record.iter().map(str::to_string).collect());
        }
        Ok(rows)
    }
}

#[async_trait]
impl RowSource for CsvSource {
    async fn fetch(&self, _locator: &SheetLocator) -> Result<Vec<Vec<String>>, DataSourceError> {
        self.read_rows()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::ClientSecret;
    use tempfile::tempdir;

    fn locator() -> SheetLocator {
        SheetLocator {
            spreadsheet_id: "1AbC".to_string(),
            range: "A1!A2:M60".to_string(),
        }
    }

    #[test]
    fn stringifies_typed_cells() {
        let rows = rows_from_body(
            r#"{"range":"A1!A2:M60","majorDimension":"ROWS","values":[["Jane","Doe",1001,true,null]]}"#,
        )
        .unwrap();
        assert_eq!(rows, vec![vec!["Jane", "Doe", "1001", "true", ""]]);
    }

    #[test]
    fn missing_values_means_no_rows() {
        let rows = rows_from_body(r#"{"range":"A1!A2:M60","majorDimension":"ROWS"}"#).unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn error_message_comes_from_provider() {
        let body = r#"{"error":{"code":400,"message":"Unable to parse range: Nope","status":"INVALID_ARGUMENT"}}"#;
        assert_eq!(api_error_message(body), "Unable to parse range: Nope");
        assert_eq!(api_error_message("Bad Gateway\n"), "Bad Gateway");
    }

    #[test]
    fn range_is_escaped_into_a_single_segment() {
        let dir = tempdir().unwrap();
        let secret = ClientSecret {
            client_id: "id".to_string(),
            client_secret: "secret".to_string(),
            redirect_uris: Vec::new(),
            auth_uri: "https://accounts.google.com/o/oauth2/auth".to_string(),
            token_uri: "https://oauth2.googleapis.com/token".to_string(),
        };
        let auth = Arc::new(OAuthClient::new(secret, dir.path().join("token.json")));
        let client = SheetsClient::new(auth);
        let mut locator = locator();
        locator.range = "Overall Marks!A2:M60".to_string();
        let url = client.values_url(&locator).unwrap();
        assert_eq!(
            url.as_str(),
            "https://sheets.googleapis.com/v4/spreadsheets/1AbC/values/Overall%20Marks!A2:M60"
        );
    }

    #[tokio::test]
    async fn csv_source_keeps_ragged_rows() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("export.csv");
        std::fs::write(
            &path,
            "Jane,Doe,1001,jane@example.com,80,80%,A-,8,9\nSam,Lee,1002,sam@example.com\n",
        )
        .unwrap();
        let rows = CsvSource::new(path).fetch(&locator()).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].len(), 9);
        assert_eq!(rows[1], vec!["Sam", "Lee", "1002", "sam@example.com"]);
    }

    #[tokio::test]
    async fn missing_csv_is_a_data_source_error() {
        let dir = tempdir().unwrap();
        let result = CsvSource::new(dir.path().join("absent.csv"))
            .fetch(&locator())
            .await;
        assert!(matches!(result, Err(DataSourceError::Csv { .. })));
    }
}
