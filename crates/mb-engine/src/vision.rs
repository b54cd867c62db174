use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::json;

use mb_core::{MbError, MbResult, VisionAnalysis};

use crate::config::VisionConfig;
use crate::extract::extract_analysis;
use crate::inspect::VisionFrame;

/// What the model is asked to do with the frames.
#[derive(Debug, Clone, Copy)]
pub enum VisionPrompt<'a> {
    /// Full enrichment: name, category, tags, description.
    Enrich { known_categories: &'a [String] },
    /// Pre-ingest gate: classify against the accepted type labels.
    TypeFilter { accepted_types: &'a [String] },
}

/// Opaque vision capability. `Ok(None)` means the model answered but no
/// structured result could be extracted; transport and HTTP failures are
/// `Err`. Both count as a task failure for retry purposes.
#[async_trait]
pub trait VisionClient: Send + Sync {
    async fn analyze(
        &self,
        frames: &[VisionFrame],
        prompt: VisionPrompt<'_>,
    ) -> MbResult<Option<VisionAnalysis>>;

    /// Provider name for logging.
    fn name(&self) -> &str;
}

fn _assert_vision_client_object_safe(_: &dyn VisionClient) {}

// ---------------------------------------------------------------------------
// OpenAI-compatible implementation
// ---------------------------------------------------------------------------

/// Works against any OpenAI-compatible chat-completions endpoint with vision
/// support (Ollama, vLLM, OpenAI, DashScope, ...). Frames travel as base64
/// data URLs in the message content.
pub struct OpenAiVision {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    max_tokens: u32,
    temperature: f32,
}

impl OpenAiVision {
    pub fn from_config(config: &VisionConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
        }
    }

    fn system_prompt(prompt: &VisionPrompt<'_>) -> String {
        match prompt {
            VisionPrompt::Enrich { known_categories } => format!(
                "你是表情包管理助手。请观察图片（多张图片是同一动图的抽帧），\
                 输出 JSON：{{\"name\": 简短名称, \"category\": 分类, \
                 \"tags\": [标签数组], \"description\": 一句话描述, \
                 \"newCategory\": 可选的新分类}}。\
                 已有分类：{}。优先从已有分类中选择；都不合适时在 newCategory \
                 中给出新分类名。只输出 JSON，不要其他内容。",
                known_categories.join("、")
            ),
            VisionPrompt::TypeFilter { accepted_types } => format!(
                "判断图片属于哪种类型，候选：{}。输出 JSON：\
                 {{\"category\": 匹配的类型}}；都不匹配时输出 \
                 {{\"category\": \"其他\"}}。只输出 JSON。",
                accepted_types.join("、")
            ),
        }
    }
}

#[derive(Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<serde_json::Value>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

#[async_trait]
impl VisionClient for OpenAiVision {
    async fn analyze(
        &self,
        frames: &[VisionFrame],
        prompt: VisionPrompt<'_>,
    ) -> MbResult<Option<VisionAnalysis>> {
        if frames.is_empty() {
            return Err(MbError::Model("no frames to analyze".into()));
        }

        let mut content = vec![json!({"type": "text", "text": "请分析这张图片。"})];
        for frame in frames {
            let data_url = format!("data:{};base64,{}", frame.mime, BASE64.encode(&frame.bytes));
            content.push(json!({"type": "image_url", "image_url": {"url": data_url}}));
        }

        let request = ChatCompletionRequest {
            model: self.model.clone(),
            messages: vec![
                json!({"role": "system", "content": Self::system_prompt(&prompt)}),
                json!({"role": "user", "content": content}),
            ],
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        };

        let url = format!("{}/chat/completions", self.base_url);
        let mut builder = self.client.post(&url).json(&request);
        if let Some(ref key) = self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                MbError::Model("vision request timed out".into())
            } else {
                MbError::Model(format!("vision request failed: {e}"))
            }
        })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(MbError::Model(format!("vision HTTP {status}: {body}")));
        }

        let parsed: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| MbError::Model(format!("vision response parse: {e}")))?;

        let Some(content) = parsed
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
        else {
            return Ok(None);
        };

        Ok(extract_analysis(&content))
    }

    fn name(&self) -> &str {
        "openai-compatible"
    }
}
