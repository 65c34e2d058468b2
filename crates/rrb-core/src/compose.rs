//! Pure shaping of gateway output into outbound messages. No I/O here.

use std::sync::Arc;

use serde::Serialize;
use serde_json::{json, Value};

use crate::{
    domain::{KeySource, ModerationVerdict},
    gateway::{GatewayError, GatewayResult, ReplyKind},
    ports::{Card, CardBuilder},
    rate_limit::RateDecision,
};

pub const ABUSE_REPLY: &str = "請保持友善的對話喔，我很樂意協助你查詢信用卡回饋 🙏";
pub const SPAM_REPLY: &str = "不太確定你的意思，可以再描述一次你想查詢的消費情境嗎？";
pub const SERVICE_UNAVAILABLE_REPLY: &str = "抱歉，服務暫時無法使用，請稍後再試。";
pub const UNKNOWN_REPLY: &str = "抱歉，我沒有理解你的問題，可以換個方式問問看嗎？";

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OutboundMessage {
    Text { text: String },
    Card(Card),
}

impl OutboundMessage {
    pub fn text(s: impl Into<String>) -> Self {
        OutboundMessage::Text { text: s.into() }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            OutboundMessage::Text { text } => Some(text),
            OutboundMessage::Card(_) => None,
        }
    }
}

/// Canned reply for a filter verdict that stops the pipeline.
pub fn verdict_reply(verdict: ModerationVerdict) -> &'static str {
    match verdict {
        ModerationVerdict::Abuse => ABUSE_REPLY,
        ModerationVerdict::Spam => SPAM_REPLY,
        ModerationVerdict::RateLimited | ModerationVerdict::Safe => SERVICE_UNAVAILABLE_REPLY,
    }
}

pub fn rate_limited_reply(d: &RateDecision) -> String {
    format!(
        "本時段的提問次數已用完（上限 {} 次），請約 {} 分鐘後再試 ⏳",
        d.limit, d.reset_in_minutes
    )
}

pub fn quota_reply(d: &RateDecision) -> String {
    let tier = match d.tier {
        crate::domain::Tier::Vip => "VIP",
        crate::domain::Tier::Normal => "一般",
    };
    format!(
        "你目前是{tier}會員，本時段還可以提問 {}/{} 次，約 {} 分鐘後重置。",
        d.remaining, d.limit, d.reset_in_minutes
    )
}

fn key_marker(source: KeySource) -> &'static str {
    match source {
        KeySource::Free => "",
        KeySource::Paid => " ⚡",
    }
}

pub struct ResponseComposer {
    cards: Option<Arc<dyn CardBuilder>>,
}

impl ResponseComposer {
    pub fn new(cards: Option<Arc<dyn CardBuilder>>) -> Self {
        Self { cards }
    }

    pub fn compose(&self, result: &GatewayResult, question: &str) -> Vec<OutboundMessage> {
        let body = match result.kind {
            ReplyKind::Abuse if result.reply_text.trim().is_empty() => ABUSE_REPLY.to_string(),
            ReplyKind::Unknown if result.reply_text.trim().is_empty() => UNKNOWN_REPLY.to_string(),
            _ => result.reply_text.clone(),
        };
        let text = OutboundMessage::text(format!("{body}{}", key_marker(result.key_source)));

        if result.kind != ReplyKind::Query {
            return vec![text];
        }

        let card = match (&self.cards, &result.recommendations) {
            (Some(builder), Some(recs)) => builder.build(recs, question),
            _ => None,
        };
        match card {
            Some(card) => vec![text, OutboundMessage::Card(card)],
            None => vec![text],
        }
    }

    pub fn compose_failure(&self, _err: &GatewayError) -> Vec<OutboundMessage> {
        vec![OutboundMessage::text(SERVICE_UNAVAILABLE_REPLY)]
    }
}

/// Default card renderer: one row per recommended card plus a search link
/// carrying the original question.
#[derive(Clone, Debug)]
pub struct SimpleCardBuilder {
    search_base: String,
    max_rows: usize,
}

impl Default for SimpleCardBuilder {
    fn default() -> Self {
        Self {
            search_base: "https://www.google.com/search?q=".to_string(),
            max_rows: 5,
        }
    }
}

impl SimpleCardBuilder {
    fn search_link(&self, card: &str, question: &str) -> String {
        let q = format!("{card} {question} 回饋");
        format!("{}{}", self.search_base, urlencoding::encode(&q))
    }
}

impl CardBuilder for SimpleCardBuilder {
    fn build(&self, recommendations: &Value, question: &str) -> Option<Card> {
        let items = recommendations.as_array()?;
        let rows: Vec<Value> = items
            .iter()
            .filter_map(|item| {
                let card = item.get("card").and_then(Value::as_str)?.trim();
                if card.is_empty() {
                    return None;
                }
                let field = |k: &str| item.get(k).and_then(Value::as_str).unwrap_or("").to_string();
                Some(json!({
                    "card": card,
                    "bank": field("bank"),
                    "reward": field("reward"),
                    "reason": field("reason"),
                    "link": self.search_link(card, question),
                }))
            })
            .take(self.max_rows)
            .collect();

        if rows.is_empty() {
            return None;
        }

        let first = rows[0]["card"].as_str().unwrap_or_default().to_string();
        Some(Card {
            alt_text: format!("推薦卡片：{first}"),
            body: json!({
                "title": "推薦卡片",
                "question": question,
                "rows": rows,
            }),
        })
    }
}
