//! Hexagonal ports.
//!
//! Everything the core talks to (model API, document store, source folder,
//! key-value stores, logging sink) lives behind these traits so the
//! pipeline and the synchronizer can be driven by fakes in tests.

use std::{collections::BTreeMap, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{
    domain::{KeySource, SenderId},
    rate_limit::RateWindow,
    Result,
};

// ============== Generative model ==============

/// A single generation call, provider-neutral.
#[derive(Clone, Debug, PartialEq)]
pub struct ModelRequest {
    pub model: String,
    pub system_instruction: Option<String>,
    pub prompt: String,
    /// Retrieval store the model may search, if retrieval is attached.
    pub retrieval_store: Option<String>,
    pub temperature: Option<f32>,
    pub json_output: bool,
    pub max_output_tokens: Option<u32>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ModelResponse {
    pub text: String,
    /// Titles of retrieved documents cited by the answer, in the order returned.
    pub citations: Vec<String>,
}

/// Generative model endpoint. The API key is chosen per call by the failover transport.
#[async_trait]
pub trait ModelEndpoint: Send + Sync {
    async fn generate(&self, api_key: &str, req: &ModelRequest) -> Result<ModelResponse>;
}

// ============== Remote document store ==============

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteDocument {
    pub id: String,
    pub display_name: String,
}

#[derive(Clone, Debug, Default)]
pub struct DocumentPage {
    pub documents: Vec<RemoteDocument>,
    pub next_page_token: Option<String>,
}

/// Handle of an uploaded blob, before it is imported into the store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteFileRef(pub String);

/// Searchable document store bound to one store reference.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn list_documents(&self, page_token: Option<&str>) -> Result<DocumentPage>;

    async fn upload_blob(
        &self,
        bytes: Vec<u8>,
        mime_type: &str,
        display_name: &str,
    ) -> Result<RemoteFileRef>;

    /// Import an uploaded blob into the store, returning the remote document id.
    async fn import_file(&self, file: &RemoteFileRef) -> Result<String>;

    async fn rename_document(&self, document_id: &str, new_name: &str) -> Result<()>;

    async fn delete_document(&self, document_id: &str, force: bool) -> Result<()>;
}

// ============== Source folder ==============

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceDocument {
    pub source_id: String,
    pub raw_name: String,
    pub mime_type: String,
}

/// Read-only corpus folder the synchronizer ingests from.
#[async_trait]
pub trait SourceFolder: Send + Sync {
    async fn list_documents(&self) -> Result<Vec<SourceDocument>>;

    /// Raw bytes of a document stored in a natively supported format.
    async fn download(&self, source_id: &str) -> Result<Vec<u8>>;

    /// Bytes of a convertible document exported to `mime_type`.
    async fn export(&self, source_id: &str, mime_type: &str) -> Result<Vec<u8>>;
}

// ============== Key-value stores ==============

/// Key-value cache with per-entry TTL, used for rate windows.
#[async_trait]
pub trait WindowCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<RateWindow>>;
    async fn put(&self, key: &str, window: RateWindow, ttl: Duration) -> Result<()>;
}

/// Durable string property store.
#[async_trait]
pub trait PropertyStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> Result<()>;
    async fn remove(&self, key: &str) -> Result<()>;
}

// ============== Profiles ==============

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardDescriptor {
    pub bank: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    #[serde(default)]
    pub wallet: Vec<CardDescriptor>,
    /// Payment method -> card name it is bound to.
    #[serde(default)]
    pub payment_bindings: BTreeMap<String, String>,
}

/// User-profile / preferences store. An absent profile is a normal "new user".
#[async_trait]
pub trait ProfileStore: Send + Sync {
    async fn lookup(&self, sender: &SenderId) -> Result<Option<UserProfile>>;
}

// ============== Conversation log ==============

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationEntry {
    pub timestamp: String,
    pub sender: SenderId,
    pub display_name: String,
    pub user_message: String,
    pub bot_response: String,
    pub response_type: String,
    pub filter_result: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_source: Option<KeySource>,
    pub latency_ms: u64,
    pub user_context_snapshot: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recommendations: Option<serde_json::Value>,
}

/// Fire-and-forget conversation sink. Failures never reach the reply path.
#[async_trait]
pub trait ConversationLogger: Send + Sync {
    async fn record(&self, entry: ConversationEntry) -> Result<()>;
}

// ============== Recommendation cards ==============

/// Structured outbound card (platform-specific rendering happens outside the core).
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Card {
    pub alt_text: String,
    pub body: serde_json::Value,
}

pub trait CardBuilder: Send + Sync {
    /// Build a card from the model's `recommendations` payload. `None` means
    /// the payload could not be rendered and the reply falls back to text.
    fn build(&self, recommendations: &serde_json::Value, question: &str) -> Option<Card>;
}
