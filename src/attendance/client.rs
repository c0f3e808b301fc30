use chrono::NaiveDate;
use color_eyre::{eyre::eyre, Result};
use futures::future::{BoxFuture, FutureExt};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde::de::DeserializeOwned;
use url::Url;

use crate::attendance::api_types::{ApiAttendance, ApiCreateAttendance};
use crate::attendance::remote::RemoteSource;
use crate::attendance::types::AttendanceRecord;
use crate::config::Config;
use crate::error::RemoteError;

/// Attendance REST API client
#[derive(Clone)]
pub struct HttpRemoteSource {
  client: reqwest::Client,
  endpoint: Url,
}

impl HttpRemoteSource {
  pub fn new(config: &Config) -> Result<Self> {
    let mut headers = HeaderMap::new();
    if let Some(token) = Config::get_api_token() {
      let value = HeaderValue::from_str(&format!("Bearer {}", token))
        .map_err(|e| eyre!("Invalid API token: {}", e))?;
      headers.insert(AUTHORIZATION, value);
    }

    let client = reqwest::Client::builder()
      .timeout(config.remote.timeout())
      .default_headers(headers)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    let endpoint = attendance_endpoint(&config.remote.url)?;

    Ok(Self { client, endpoint })
  }

  async fn list(&self, start: NaiveDate, end: NaiveDate) -> Result<Vec<AttendanceRecord>, RemoteError> {
    let response = self
      .client
      .get(self.endpoint.clone())
      .query(&[
        ("startDate", start.to_string()),
        ("endDate", end.to_string()),
      ])
      .send()
      .await?;

    let records: Vec<ApiAttendance> = decode(response).await?;

    Ok(records.into_iter().map(ApiAttendance::into_record).collect())
  }

  async fn post(&self, record: &AttendanceRecord) -> Result<AttendanceRecord, RemoteError> {
    let response = self
      .client
      .post(self.endpoint.clone())
      .json(&ApiCreateAttendance::from(record))
      .send()
      .await?;

    let created: ApiAttendance = decode(response).await?;
    Ok(created.into_record())
  }
}

/// Map non-2xx statuses to `RemoteError` and parse the body as JSON.
async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, RemoteError> {
  let status = response.status();
  let text = response.text().await?;
  if !status.is_success() {
    return Err(RemoteError::from_status(status, &text));
  }

  serde_json::from_str(&text).map_err(|e| {
    let snippet: String = text.chars().take(200).collect();
    RemoteError::InvalidResponse(format!("{} (body: {})", e, snippet))
  })
}

impl RemoteSource for HttpRemoteSource {
  fn fetch(
    &self,
    start: NaiveDate,
    end: NaiveDate,
  ) -> BoxFuture<'_, Result<Vec<AttendanceRecord>, RemoteError>> {
    self.list(start, end).boxed()
  }

  fn create<'a>(
    &'a self,
    record: &'a AttendanceRecord,
  ) -> BoxFuture<'a, Result<AttendanceRecord, RemoteError>> {
    self.post(record).boxed()
  }
}

/// Resolve `<base>/attendance`, treating the base as a directory even
/// without a trailing slash.
fn attendance_endpoint(base: &Url) -> Result<Url> {
  let mut base = base.clone();
  if !base.path().ends_with('/') {
    let path = format!("{}/", base.path());
    base.set_path(&path);
  }
  base
    .join("attendance")
    .map_err(|e| eyre!("Invalid API url {}: {}", base, e))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_endpoint_keeps_base_path() {
    let with_slash = Url::parse("https://school.example.org/api/").unwrap();
    let without_slash = Url::parse("https://school.example.org/api").unwrap();

    assert_eq!(
      attendance_endpoint(&with_slash).unwrap().as_str(),
      "https://school.example.org/api/attendance"
    );
    assert_eq!(
      attendance_endpoint(&without_slash).unwrap().as_str(),
      "https://school.example.org/api/attendance"
    );
  }
}
