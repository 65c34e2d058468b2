use async_trait::async_trait;
use serde_json::{json, Value};

use rrb_core::{
    config::ModelConfig,
    errors::Error,
    ports::{ModelEndpoint, ModelRequest, ModelResponse},
    Result,
};

use crate::{http_client, read_json, send_error, API_VERSION};

/// `models/{model}:generateContent` client. The API key comes with each call.
#[derive(Clone, Debug)]
pub struct GeminiClient {
    api_base: String,
    http: reqwest::Client,
}

impl GeminiClient {
    pub fn new(cfg: &ModelConfig) -> Result<Self> {
        Ok(Self {
            api_base: cfg.api_base.trim_end_matches('/').to_string(),
            http: http_client(cfg.request_timeout)?,
        })
    }

    fn endpoint(&self, model: &str) -> String {
        let model = model.strip_prefix("models/").unwrap_or(model);
        format!(
            "{}/{API_VERSION}/models/{model}:generateContent",
            self.api_base
        )
    }
}

#[async_trait]
impl ModelEndpoint for GeminiClient {
    async fn generate(&self, api_key: &str, req: &ModelRequest) -> Result<ModelResponse> {
        let resp = self
            .http
            .post(self.endpoint(&req.model))
            .header("x-goog-api-key", api_key)
            .json(&request_body(req))
            .send()
            .await
            .map_err(send_error)?;

        parse_response(&read_json(resp).await?)
    }
}

pub(crate) fn request_body(req: &ModelRequest) -> Value {
    let mut body = json!({
        "contents": [{"role": "user", "parts": [{"text": req.prompt}]}],
    });

    if let Some(sys) = &req.system_instruction {
        body["systemInstruction"] = json!({"parts": [{"text": sys}]});
    }
    if let Some(store) = &req.retrieval_store {
        body["tools"] = json!([{"fileSearch": {"fileSearchStoreNames": [store]}}]);
    }

    let mut gen = serde_json::Map::new();
    if let Some(t) = req.temperature {
        gen.insert("temperature".to_string(), json!(t));
    }
    if let Some(n) = req.max_output_tokens {
        gen.insert("maxOutputTokens".to_string(), json!(n));
    }
    // JSON mode cannot be combined with tools; with retrieval the prompt carries the format.
    if req.json_output && req.retrieval_store.is_none() {
        gen.insert("responseMimeType".to_string(), json!("application/json"));
    }
    if !gen.is_empty() {
        body["generationConfig"] = Value::Object(gen);
    }
    body
}

pub(crate) fn parse_response(v: &Value) -> Result<ModelResponse> {
    let Some(candidate) = v.pointer("/candidates/0") else {
        let reason = v
            .pointer("/promptFeedback/blockReason")
            .and_then(Value::as_str)
            .unwrap_or("no candidates");
        return Err(Error::External(format!("gemini returned no answer: {reason}")));
    };

    let text = candidate
        .pointer("/content/parts")
        .and_then(Value::as_array)
        .map(|parts| {
            parts
                .iter()
                .filter_map(|p| p.get("text").and_then(Value::as_str))
                .collect::<String>()
        })
        .unwrap_or_default();

    let citations = candidate
        .pointer("/groundingMetadata/groundingChunks")
        .and_then(Value::as_array)
        .map(|chunks| {
            chunks
                .iter()
                .filter_map(|c| c.pointer("/retrievedContext/title").and_then(Value::as_str))
                .filter(|t| !t.trim().is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    Ok(ModelResponse { text, citations })
}
