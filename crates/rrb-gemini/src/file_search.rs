use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use rrb_core::{
    config::ModelConfig,
    errors::Error,
    multipart,
    ports::{DocumentPage, DocumentStore, RemoteDocument, RemoteFileRef},
    Result,
};

use crate::{check_status, http_client, read_json, send_error, API_VERSION};

const PAGE_SIZE: u32 = 20;
const IMPORT_POLL_ATTEMPTS: u32 = 10;
const IMPORT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Document API of one file-search store (`fileSearchStores/...`).
#[derive(Clone, Debug)]
pub struct FileSearchStore {
    api_base: String,
    api_key: String,
    store: String,
    http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListDocumentsResponse {
    #[serde(default)]
    documents: Vec<DocumentResource>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DocumentResource {
    name: String,
    #[serde(default)]
    display_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Operation {
    name: String,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<serde_json::Value>,
    #[serde(default)]
    response: Option<serde_json::Value>,
}

impl FileSearchStore {
    pub fn new(
        cfg: &ModelConfig,
        api_key: impl Into<String>,
        store: impl Into<String>,
    ) -> Result<Self> {
        Ok(Self {
            api_base: cfg.api_base.trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            store: store.into(),
            http: http_client(cfg.request_timeout)?,
        })
    }

    pub fn store_name(&self) -> &str {
        &self.store
    }

    fn url(&self, resource: &str) -> String {
        format!("{}/{API_VERSION}/{resource}", self.api_base)
    }

    fn upload_url(&self) -> String {
        format!(
            "{}/upload/{API_VERSION}/files?uploadType=multipart",
            self.api_base
        )
    }

    async fn get_operation(&self, name: &str) -> Result<Operation> {
        let resp = self
            .http
            .get(self.url(name))
            .header("x-goog-api-key", &self.api_key)
            .send()
            .await
            .map_err(send_error)?;
        Ok(serde_json::from_value(read_json(resp).await?)?)
    }
}

#[async_trait]
impl DocumentStore for FileSearchStore {
    async fn list_documents(&self, page_token: Option<&str>) -> Result<DocumentPage> {
        let mut query = vec![("pageSize", PAGE_SIZE.to_string())];
        if let Some(t) = page_token {
            query.push(("pageToken", t.to_string()));
        }
        let resp = self
            .http
            .get(self.url(&format!("{}/documents", self.store)))
            .header("x-goog-api-key", &self.api_key)
            .query(&query)
            .send()
            .await
            .map_err(send_error)?;

        parse_document_page(read_json(resp).await?)
    }

    async fn upload_blob(
        &self,
        bytes: Vec<u8>,
        mime_type: &str,
        display_name: &str,
    ) -> Result<RemoteFileRef> {
        let metadata = json!({"file": {"displayName": display_name, "mimeType": mime_type}});
        let body = multipart::encode_related(&metadata, mime_type, &bytes);

        let resp = self
            .http
            .post(self.upload_url())
            .header("x-goog-api-key", &self.api_key)
            .header("X-Goog-Upload-Protocol", "multipart")
            .header(reqwest::header::CONTENT_TYPE, body.content_type)
            .body(body.bytes)
            .send()
            .await
            .map_err(send_error)?;

        let v = read_json(resp).await?;
        v.pointer("/file/name")
            .and_then(|n| n.as_str())
            .map(|n| RemoteFileRef(n.to_string()))
            .ok_or_else(|| Error::External("gemini upload returned no file name".to_string()))
    }

    async fn import_file(&self, file: &RemoteFileRef) -> Result<String> {
        let resp = self
            .http
            .post(self.url(&format!("{}:importFile", self.store)))
            .header("x-goog-api-key", &self.api_key)
            .json(&json!({"fileName": file.0}))
            .send()
            .await
            .map_err(send_error)?;
        let mut op: Operation = serde_json::from_value(read_json(resp).await?)?;

        for attempt in 0..IMPORT_POLL_ATTEMPTS {
            if op.done {
                return operation_document(&op);
            }
            debug!(operation = %op.name, attempt, "Import pending");
            tokio::time::sleep(IMPORT_POLL_INTERVAL).await;
            op = self.get_operation(&op.name).await?;
        }
        if op.done {
            return operation_document(&op);
        }
        Err(Error::External(format!(
            "import of {} did not finish after {IMPORT_POLL_ATTEMPTS} polls",
            file.0
        )))
    }

    async fn rename_document(&self, document_id: &str, new_name: &str) -> Result<()> {
        let resp = self
            .http
            .patch(self.url(document_id))
            .header("x-goog-api-key", &self.api_key)
            .query(&[("updateMask", "displayName")])
            .json(&json!({"displayName": new_name}))
            .send()
            .await
            .map_err(send_error)?;
        check_status(resp).await?;
        Ok(())
    }

    async fn delete_document(&self, document_id: &str, force: bool) -> Result<()> {
        let resp = self
            .http
            .delete(self.url(document_id))
            .header("x-goog-api-key", &self.api_key)
            .query(&[("force", force)])
            .send()
            .await
            .map_err(send_error)?;
        check_status(resp).await?;
        Ok(())
    }
}

fn parse_document_page(v: serde_json::Value) -> Result<DocumentPage> {
    let page: ListDocumentsResponse = serde_json::from_value(v)?;
    Ok(DocumentPage {
        documents: page
            .documents
            .into_iter()
            .map(|d| RemoteDocument {
                display_name: d.display_name.unwrap_or_else(|| d.name.clone()),
                id: d.name,
            })
            .collect(),
        next_page_token: page.next_page_token.filter(|t| !t.is_empty()),
    })
}

fn operation_document(op: &Operation) -> Result<String> {
    if let Some(err) = &op.error {
        let msg = err
            .get("message")
            .and_then(|m| m.as_str())
            .unwrap_or("unknown error");
        return Err(Error::External(format!("import failed: {msg}")));
    }
    op.response
        .as_ref()
        .and_then(|r| r.get("documentName").or_else(|| r.get("name")))
        .and_then(|n| n.as_str())
        .map(str::to_string)
        .ok_or_else(|| Error::External(format!("operation {} has no document", op.name)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urls_follow_api_layout() {
        let s =
            FileSearchStore::new(&ModelConfig::default(), "k", "fileSearchStores/cards").unwrap();
        assert_eq!(
            s.url("fileSearchStores/cards:importFile"),
            "https://generativelanguage.googleapis.com/v1beta/fileSearchStores/cards:importFile"
        );
        assert_eq!(
            s.upload_url(),
            "https://generativelanguage.googleapis.com/upload/v1beta/files?uploadType=multipart"
        );
    }

    #[test]
    fn page_falls_back_to_resource_name() {
        let page = parse_document_page(json!({
            "documents": [
                {"name": "fileSearchStores/cards/documents/a1", "displayName": "cube.pdf"},
                {"name": "fileSearchStores/cards/documents/b2"}
            ],
            "nextPageToken": "tok"
        }))
        .unwrap();
        assert_eq!(page.documents[0].display_name, "cube.pdf");
        assert_eq!(page.documents[1].display_name, "fileSearchStores/cards/documents/b2");
        assert_eq!(page.next_page_token.as_deref(), Some("tok"));

        let last = parse_document_page(json!({"nextPageToken": ""})).unwrap();
        assert!(last.documents.is_empty());
        assert!(last.next_page_token.is_none());
    }

    #[test]
    fn finished_operation_yields_document_name() {
        let op: Operation = serde_json::from_value(json!({
            "name": "fileSearchStores/cards/operations/op1",
            "done": true,
            "response": {"documentName": "fileSearchStores/cards/documents/d9"}
        }))
        .unwrap();
        assert_eq!(
            operation_document(&op).unwrap(),
            "fileSearchStores/cards/documents/d9"
        );
    }

    #[test]
    fn failed_operation_is_an_error() {
        let op: Operation = serde_json::from_value(json!({
            "name": "op",
            "done": true,
            "error": {"code": 3, "message": "unsupported file"}
        }))
        .unwrap();
        assert!(operation_document(&op)
            .unwrap_err()
            .to_string()
            .contains("unsupported file"));
    }
}
