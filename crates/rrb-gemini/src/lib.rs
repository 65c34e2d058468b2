//! Gemini adapter: `generateContent` with the file-search tool, and the
//! file-search store document API.

mod file_search;
mod generate;

use std::time::Duration;

use rrb_core::{errors::Error, Result};

pub use file_search::FileSearchStore;
pub use generate::GeminiClient;

const API_VERSION: &str = "v1beta";

fn http_client(timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| Error::Config(format!("gemini http client: {e}")))
}

fn send_error(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Timeout
    } else {
        Error::External(format!("gemini request error: {e}"))
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

async fn read_json(resp: reqwest::Response) -> Result<serde_json::Value> {
    let resp = check_status(resp).await?;
    resp.json()
        .await
        .map_err(|e| Error::External(format!("gemini json error: {e}")))
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_message_prefers_api_message() {
        let body = r#"{"error":{"code":429,"message":"Resource has been exhausted","status":"RESOURCE_EXHAUSTED"}}"#;
        assert_eq!(error_message(body), "Resource has been exhausted");
        assert_eq!(error_message("Bad Gateway"), "Bad Gateway");
        assert_eq!(error_message(&"x".repeat(500)).len(), 200);
    }
}
