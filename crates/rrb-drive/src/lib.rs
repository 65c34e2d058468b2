//! Google Drive adapter: one folder as the corpus source.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use rrb_core::{
    config::SyncConfig,
    errors::Error,
    ports::{SourceDocument, SourceFolder},
    Result,
};

const LIST_FIELDS: &str = "nextPageToken,files(id,name,mimeType)";
const PAGE_SIZE: u32 = 100;

#[derive(Clone, Debug)]
pub struct DriveFolder {
    api_base: String,
    access_token: String,
    folder_id: String,
    http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileList {
    #[serde(default)]
    files: Vec<DriveFile>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveFile {
    id: String,
    name: String,
    mime_type: String,
}

impl DriveFolder {
    /// `None` when no folder or access token is configured.
    pub fn from_config(cfg: &SyncConfig) -> Result<Option<Self>> {
        let (Some(folder), Some(token)) = (&cfg.source_folder_id, &cfg.drive_access_token) else {
            return Ok(None);
        };
        Self::new(&cfg.drive_api_base, token, folder).map(Some)
    }

    pub fn new(
        api_base: &str,
        access_token: impl Into<String>,
        folder_id: impl Into<String>,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| Error::Config(format!("drive http client: {e}")))?;
        Ok(Self {
            api_base: api_base.trim_end_matches('/').to_string(),
            access_token: access_token.into(),
            folder_id: folder_id.into(),
            http,
        })
    }

    fn files_url(&self) -> String {
        format!("{}/drive/v3/files", self.api_base)
    }

    fn folder_query(&self) -> String {
        let id = self.folder_id.replace('\\', "\\\\").replace('\'', "\\'");
        format!("'{id}' in parents and trashed=false")
    }

    async fn fetch_bytes(&self, req: reqwest::RequestBuilder) -> Result<Vec<u8>> {
        let resp = req
            .bearer_auth(&self.access_token)
            .send()
            .await
            .map_err(send_error)?;
        let resp = check_status(resp).await?;
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| Error::External(format!("drive read error: {e}")))?;
        Ok(bytes.to_vec())
    }
}

#[async_trait]
impl SourceFolder for DriveFolder {
    async fn list_documents(&self) -> Result<Vec<SourceDocument>> {
        let mut out = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let mut query = vec![
                ("q", self.folder_query()),
                ("fields", LIST_FIELDS.to_string()),
                ("pageSize", PAGE_SIZE.to_string()),
            ];
            if let Some(t) = &token {
                query.push(("pageToken", t.clone()));
            }
            let resp = self
                .http
                .get(self.files_url())
                .bearer_auth(&self.access_token)
                .query(&query)
                .send()
                .await
                .map_err(send_error)?;
            let resp = check_status(resp).await?;
            let body = resp
                .text()
                .await
                .map_err(|e| Error::External(format!("drive read error: {e}")))?;

            let (docs, next) = parse_file_list(&body)?;
            debug!(count = docs.len(), "Drive page");
            out.extend(docs);
            match next {
                Some(t) => token = Some(t),
                None => break,
            }
        }
        Ok(out)
    }

    async fn download(&self, source_id: &str) -> Result<Vec<u8>> {
        let req = self
            .http
            .get(format!("{}/{source_id}", self.files_url()))
            .query(&[("alt", "media")]);
        self.fetch_bytes(req).await
    }

    async fn export(&self, source_id: &str, mime_type: &str) -> Result<Vec<u8>> {
        let req = self
            .http
            .get(format!("{}/{source_id}/export", self.files_url()))
            .query(&[("mimeType", mime_type)]);
        self.fetch_bytes(req).await
    }
}

fn parse_file_list(body: &str) -> Result<(Vec<SourceDocument>, Option<String>)> {
    let list: FileList = serde_json::from_str(body)?;
    let docs = list
        .files
        .into_iter()
        .map(|f| SourceDocument {
            source_id: f.id,
            raw_name: f.name,
            mime_type: f.mime_type,
        })
        .collect();
    Ok((docs, list.next_page_token.filter(|t| !t.is_empty())))
}

fn send_error(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Timeout
    } else {
        Error::External(format!("drive request error: {e}"))
    }
}

/// Turn a non-success response into `Error::Upstream`, keeping the API's own message.
async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(Error::Upstream {
        status: status.as_u16(),
        message: error_message(&body),
    })
}

fn error_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            v.pointer("/error/message")
                .and_then(|m| m.as_str())
                .map(str::to_string)
        })
        .unwrap_or_else(|| body.chars().take(200).collect())
}
