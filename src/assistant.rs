//! Conversational assistant boundary: questions about one analyzed dump, answered from
//! its persisted image summary, features and warnings.

use crate::classify::Verdict;
use crate::config::AssistantConfig;
use crate::features::FeatureVector;
use crate::normalize::{AnomalyFlag, CanonicalImage, OsProfile};
use crate::parser::ToolVersion;
use crate::warning::Warning;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

/// Warnings quoted verbatim in the context; the rest are only counted.
const QUOTED_WARNINGS: usize = 20;

#[derive(Debug, Error)]
pub enum AssistantError {
    #[error("assistant endpoint not configured")]
    NotConfigured,

    #[error("assistant request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("assistant returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("assistant returned an empty reply")]
    EmptyReply,

    #[error("cannot encode context: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    fn new(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ImageSummary {
    pub dump_id: String,
    pub os_profile: Option<OsProfile>,
    pub tool_version: Option<ToolVersion>,
    pub processes: usize,
    pub plugins_without_output: Vec<String>,
    pub flagged_processes: BTreeMap<AnomalyFlag, usize>,
}

impl ImageSummary {
    pub fn of(image: &CanonicalImage) -> Self {
        let mut flagged_processes = BTreeMap::new();
        for flag in image.processes.values().flat_map(|p| p.flags.iter()) {
            *flagged_processes.entry(*flag).or_insert(0) += 1;
        }
        Self {
            dump_id: image.dump_id.clone(),
            os_profile: image.os_profile.clone(),
            tool_version: image.tool_version,
            processes: image.processes.len(),
            plugins_without_output: image
                .plugins
                .keys()
                .filter(|p| !image.has_plugin(p))
                .cloned()
                .collect(),
            flagged_processes,
        }
    }
}

/// Everything the assistant may know about the dump, plus the conversation so far.
#[derive(Debug, Clone, Serialize)]
pub struct ConversationContext {
    pub summary: ImageSummary,
    pub image_features: FeatureVector,
    pub process_features: Vec<FeatureVector>,
    pub warning_counts: BTreeMap<String, usize>,
    pub warnings: Vec<Warning>,
    pub verdict: Option<Verdict>,
    #[serde(skip)]
    history: Vec<ChatMessage>,
}

impl ConversationContext {
    pub fn new(
        image: &CanonicalImage,
        image_features: &FeatureVector,
        process_features: &[FeatureVector],
        verdict: Option<Verdict>,
        max_processes: usize,
    ) -> Self {
        let mut warning_counts = BTreeMap::new();
        for w in &image.extraction_warnings {
            *warning_counts.entry(w.kind().to_string()).or_insert(0) += 1;
        }
        Self {
            summary: ImageSummary::of(image),
            image_features: image_features.clone(),
            process_features: process_features.iter().take(max_processes).cloned().collect(),
            warning_counts,
            warnings: image.extraction_warnings.iter().take(QUOTED_WARNINGS).cloned().collect(),
            verdict,
            history: Vec::new(),
        }
    }

    pub fn system_prompt(&self) -> Result<String, AssistantError> {
        let data = serde_json::to_string_pretty(self)?;
        Ok(format!(
            "You are a memory forensics assistant analyzing ONE specific Windows memory dump.\n\
             The structured data below was extracted from this dump: an image summary, \
             image-level features, features of the first {} processes, extraction warnings \
             and, when available, a classifier verdict. A feature value of -1 means the \
             plugin it is computed from produced no output.\n\n{data}\n\n\
             Answer about this dump only, using the data above. If the data is not enough \
             to be certain, say so and suggest what an analyst should check next.",
            self.process_features.len()
        ))
    }

    pub fn history(&self) -> &[ChatMessage] {
        &self.history
    }

    pub fn record(&mut self, question: &str, answer: &str) {
        self.history.push(ChatMessage::new("user", question));
        self.history.push(ChatMessage::new("assistant", answer));
    }

    /// System prompt, prior turns, then the new question.
    pub fn messages(&self, question: &str) -> Result<Vec<ChatMessage>, AssistantError> {
        let mut messages = Vec::with_capacity(self.history.len() + 2);
        messages.push(ChatMessage::new("system", self.system_prompt()?));
        messages.extend(self.history.iter().cloned());
        messages.push(ChatMessage::new("user", question));
        Ok(messages)
    }
}

pub trait Assistant {
    fn respond(&self, context: &ConversationContext, question: &str) -> Result<String, AssistantError>;
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    stream: bool,
}

#[derive(Deserialize)]
struct ChatResponse {
    message: Option<ChatMessage>,
}

/// Ollama-compatible `/api/chat` client.
pub struct OllamaAssistant {
    client: reqwest::blocking::Client,
    base_url: String,
    model: String,
}

impl OllamaAssistant {
    pub fn new(config: &AssistantConfig) -> Result<Self, AssistantError> {
        let endpoint = config.endpoint.as_deref().ok_or(AssistantError::NotConfigured)?;
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .connect_timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self {
            client,
            base_url: endpoint.trim_end_matches('/').to_string(),
            model: config.model.clone(),
        })
    }

    pub fn chat_url(&self) -> String {
        format!("{}/api/chat", self.base_url)
    }
}

impl Assistant for OllamaAssistant {
    fn respond(&self, context: &ConversationContext, question: &str) -> Result<String, AssistantError> {
        let body = ChatRequest {
            model: &self.model,
            messages: context.messages(question)?,
            stream: false,
        };
        debug!(url = %self.chat_url(), messages = body.messages.len(), "assistant request");
        let res = self.client.post(self.chat_url()).json(&body).send()?;
        let status = res.status();
        if !status.is_success() {
            let body = res.text().unwrap_or_default();
            return Err(AssistantError::Status {
                status: status.as_u16(),
                body,
            });
        }
        let reply: ChatResponse = res.json()?;
        let answer = reply
            .message
            .map(|m| m.content.trim().to_string())
            .filter(|c| !c.is_empty())
            .ok_or(AssistantError::EmptyReply)?;
        info!(model = %self.model, chars = answer.len(), "assistant answered");
        Ok(answer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::FeatureExtractor;
    use crate::normalize::Normalizer;
    use crate::parser::registry::{HANDLES, PSLIST};
    use crate::parser::{ParsedTables, Row};

    fn context() -> ConversationContext {
        let mut t = ParsedTables::default();
        t.insert(
            PSLIST,
            vec![Row::from_pairs(PSLIST, 3, &[("PID", "4"), ("PPID", "0"), ("ImageFileName", "System")])],
        );
        let image = Normalizer::new([PSLIST, HANDLES]).normalize("feedbeef", &t);
        let x = FeatureExtractor::new(2).unwrap();
        ConversationContext::new(&image, &x.image(&image), &x.processes(&image), None, 15)
    }

    #[test]
    fn prompt_carries_dump_data() {
        let ctx = context();
        let prompt = ctx.system_prompt().unwrap();
        assert!(prompt.contains("feedbeef"));
        assert!(prompt.contains("pslist.nproc"));
        assert!(prompt.contains("missing_plugin"));
        assert_eq!(ctx.summary.plugins_without_output, vec![HANDLES.to_string()]);
    }

    #[test]
    fn messages_keep_turn_order() {
        let mut ctx = context();
        ctx.record("is it infected?", "no injections were found");
        let msgs = ctx.messages("what about handles?").unwrap();
        let roles: Vec<_> = msgs.iter().map(|m| m.role.as_str()).collect();
        assert_eq!(roles, vec!["system", "user", "assistant", "user"]);
        assert_eq!(msgs[3].content, "what about handles?");
    }

    #[test]
    fn ollama_needs_an_endpoint() {
        let mut config = AssistantConfig::default();
        assert!(matches!(OllamaAssistant::new(&config), Err(AssistantError::NotConfigured)));
        config.endpoint = Some("http://localhost:11434/".into());
        let a = OllamaAssistant::new(&config).unwrap();
        assert_eq!(a.chat_url(), "http://localhost:11434/api/chat");
    }
}
