//! Per-message pipeline: quota query, rate limit, moderation, profile
//! context, gateway, composition, conversation log.
//!
//! `handle` never fails. Every collaborator error is turned into a reply
//! (or swallowed, for the conversation log).

use std::{sync::Arc, time::Instant};

use tracing::{debug, info, warn};

use crate::{
    compose::{
        quota_reply, rate_limited_reply, verdict_reply, OutboundMessage, ResponseComposer,
        SERVICE_UNAVAILABLE_REPLY,
    },
    domain::{KeySource, ModerationVerdict, SenderId},
    filter::ContentFilterChain,
    gateway::AiGateway,
    ports::{ConversationEntry, ConversationLogger, ProfileStore, UserProfile},
    profile::build_user_context,
    rate_limit::RateLimiter,
    utils::iso_timestamp_utc,
};

#[derive(Clone, Debug)]
pub struct InboundMessage {
    pub sender: SenderId,
    pub display_name: String,
    pub text: String,
}

impl InboundMessage {
    pub fn new(sender: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            sender: SenderId::new(sender),
            display_name: String::new(),
            text: text.into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct PipelineReply {
    pub messages: Vec<OutboundMessage>,
    pub verdict: ModerationVerdict,
    /// `quota`, `rate_limited`, `abuse`, `spam`, `error`, or the gateway reply kind.
    pub response_type: String,
}

impl PipelineReply {
    fn text(text: impl Into<String>, verdict: ModerationVerdict, response_type: &str) -> Self {
        Self {
            messages: vec![OutboundMessage::text(text)],
            verdict,
            response_type: response_type.to_string(),
        }
    }

    /// Concatenated text parts, for plain-text surfaces.
    pub fn plain_text(&self) -> String {
        self.messages
            .iter()
            .filter_map(OutboundMessage::as_text)
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

#[derive(Default)]
struct Trace {
    model_name: Option<String>,
    key_source: Option<KeySource>,
    user_context: String,
    recommendations: Option<serde_json::Value>,
}

pub struct ChatPipeline {
    limiter: RateLimiter,
    filter: ContentFilterChain,
    gateway: AiGateway,
    composer: ResponseComposer,
    profiles: Option<Arc<dyn ProfileStore>>,
    logger: Option<Arc<dyn ConversationLogger>>,
    quota_keywords: Vec<String>,
    retrieval: bool,
}

impl ChatPipeline {
    pub fn new(
        limiter: RateLimiter,
        filter: ContentFilterChain,
        gateway: AiGateway,
        composer: ResponseComposer,
    ) -> Self {
        Self {
            limiter,
            filter,
            gateway,
            composer,
            profiles: None,
            logger: None,
            quota_keywords: Vec::new(),
            retrieval: true,
        }
    }

    pub fn with_profiles(mut self, profiles: Arc<dyn ProfileStore>) -> Self {
        self.profiles = Some(profiles);
        self
    }

    pub fn with_logger(mut self, logger: Arc<dyn ConversationLogger>) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn with_quota_keywords(mut self, keywords: Vec<String>) -> Self {
        self.quota_keywords = keywords;
        self
    }

    pub fn with_retrieval(mut self, enabled: bool) -> Self {
        self.retrieval = enabled;
        self
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    fn is_quota_query(&self, text: &str) -> bool {
        let t = text.trim();
        self.quota_keywords.iter().any(|k| k.eq_ignore_ascii_case(t))
    }

    pub async fn handle(&self, msg: &InboundMessage) -> PipelineReply {
        let started = Instant::now();
        let mut trace = Trace::default();
        let reply = self.run(msg, &mut trace).await;
        self.record(msg, &reply, trace, started).await;
        reply
    }

    async fn run(&self, msg: &InboundMessage, trace: &mut Trace) -> PipelineReply {
        if self.is_quota_query(&msg.text) {
            return match self.limiter.status(&msg.sender).await {
                Ok(d) => PipelineReply::text(quota_reply(&d), ModerationVerdict::Safe, "quota"),
                Err(e) => {
                    warn!(sender = %msg.sender, "quota lookup failed: {e}");
                    PipelineReply::text(SERVICE_UNAVAILABLE_REPLY, ModerationVerdict::Safe, "error")
                }
            };
        }

        match self.limiter.check(&msg.sender).await {
            Ok(d) if !d.allowed => {
                info!(sender = %msg.sender, tier = d.tier.as_str(), "rate limited");
                return PipelineReply::text(
                    rate_limited_reply(&d),
                    ModerationVerdict::RateLimited,
                    ModerationVerdict::RateLimited.as_str(),
                );
            }
            Ok(d) => debug!(sender = %msg.sender, remaining = d.remaining, "rate check passed"),
            Err(e) if self.limiter.fail_open() => {
                warn!(sender = %msg.sender, "rate limit store unavailable, allowing: {e}");
            }
            Err(e) => {
                warn!(sender = %msg.sender, "rate limit store unavailable, refusing: {e}");
                return PipelineReply::text(
                    SERVICE_UNAVAILABLE_REPLY,
                    ModerationVerdict::RateLimited,
                    "error",
                );
            }
        }

        let outcome = self.filter.evaluate(&msg.text).await;
        if outcome.verdict != ModerationVerdict::Safe {
            return PipelineReply::text(
                verdict_reply(outcome.verdict),
                outcome.verdict,
                outcome.verdict.as_str(),
            );
        }

        let profile = self.lookup_profile(&msg.sender).await;
        trace.user_context = build_user_context(profile.as_ref());
        trace.model_name = Some(self.gateway.model_name().to_string());

        match self
            .gateway
            .generate(&msg.text, &trace.user_context, self.retrieval)
            .await
        {
            Ok(result) => {
                trace.key_source = Some(result.key_source);
                trace.recommendations = result.recommendations.clone();
                PipelineReply {
                    messages: self.composer.compose(&result, &msg.text),
                    verdict: ModerationVerdict::Safe,
                    response_type: result.kind.as_str().to_string(),
                }
            }
            Err(e) => {
                warn!(sender = %msg.sender, "gateway failed: {e}");
                PipelineReply {
                    messages: self.composer.compose_failure(&e),
                    verdict: ModerationVerdict::Safe,
                    response_type: "error".to_string(),
                }
            }
        }
    }

    async fn lookup_profile(&self, sender: &SenderId) -> Option<UserProfile> {
        let store = self.profiles.as_ref()?;
        match store.lookup(sender).await {
            Ok(p) => p,
            Err(e) => {
                warn!(sender = %sender, "profile lookup failed: {e}");
                None
            }
        }
    }

    async fn record(
        &self,
        msg: &InboundMessage,
        reply: &PipelineReply,
        trace: Trace,
        started: Instant,
    ) {
        let Some(logger) = &self.logger else {
            return;
        };
        let entry = ConversationEntry {
            timestamp: iso_timestamp_utc(),
            sender: msg.sender.clone(),
            display_name: msg.display_name.clone(),
            user_message: msg.text.clone(),
            bot_response: reply.plain_text(),
            response_type: reply.response_type.clone(),
            filter_result: reply.verdict.as_str().to_string(),
            model_name: trace.model_name,
            key_source: trace.key_source,
            latency_ms: started.elapsed().as_millis() as u64,
            user_context_snapshot: trace.user_context,
            recommendations: trace.recommendations,
        };
        if let Err(e) = logger.record(entry).await {
            warn!("conversation log failed: {e}");
        }
    }
}
