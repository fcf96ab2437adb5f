//! Client for the vision-language backend.
//!
//! One synchronous round trip per request against an OpenAI-compatible
//! `/chat/completions` endpoint: a system instruction, the image as a JPEG
//! data URL, and one user turn. No conversation history is threaded into
//! later calls; a follow-up is answered fresh against the same stored image.
//! No retries here either; the caller decides what a failure means.

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info};

use crate::error::ApiError;

/// User turn sent when the client did not supply a question.
pub const DEFAULT_QUESTION: &str = "请为我描述周围的环境";

// Primary description instruction: near-to-far, left-to-right narration with
// traffic signals, crosswalks, transit buildings, signage and tactile paving
// called out explicitly.
const DESCRIBE_SYSTEM_PROMPT: &str = r#"你是一个导盲助手, 这是一张来自盲人举起手机拍摄的正前方的照片.照片的左侧是拍摄者的左手方向 , 右侧是拍摄者的右手方向.
你需要为他描述周围的环境. 请注意,他的眼睛是看不到的.
使用中文进行回复.避免使用列表、加粗等格式符号,只保留文字

请按照 从近到远,从左向右的顺序进行描述.
请简明准确语言的描述环境, 描述主要物品的位置.
如果出现文字,请正确描述文字内容, 不要忽略.

- 你可以使用以下格式描述物体和位置关系:
    "在...的前面"、"在...的后面"、"在...的左边"、"在...的右边"、"在...的上面"、"在...的下面"

- 如果有如下物品请注意描述不要忽略:
    1. 交通信号灯, 如 ”现在是红灯“
    2. 人行横道线, 如 ”人行横道线在正前面“
    3. 交通站点建筑, 如 ”公交车站在左边“ “前方是地下通道入口”
    4. 地名/位置 指示牌, 如 ”1号出口在右边“ “这里是地铁10号线的入口”
    5. 盲道, 如 ”盲道在右边“

- 如果照片中道路被堵塞, 请你描述道路的情况和周围的环境。帮助用户离开堵塞的地方.
    例如: "前面有一辆车挡住了路, 你可以向左转, 继续前行." "前方有一个大坑, 请小心行走." "前面有一个人挡住了路, 请向右转." "前面有一个台阶, 请小心上下." "前方有一个栏杆,请向右转绕开."
"#;

// Follow-up instruction: conversational register, no structured enumeration.
const FOLLOW_UP_SYSTEM_PROMPT: &str = r#"你是一个导盲助手. 这是一张来自盲人举起手机拍摄的正前方的照片, 照片的左侧是拍摄者的左手方向 , 右侧是拍摄者的右手方向.
你需要根据他提供的图片来回答他的问题,请注意,他的眼睛是看不到的.
使用中文的口语的风格进行回复.避免使用列表、加粗等格式符号, 只保留文字。
"#;

/// Uniform contract over whichever vision backend is configured.
#[async_trait]
pub trait Describer: Send + Sync {
    /// Primary scene description for a freshly uploaded image.
    async fn describe(&self, jpeg: &[u8]) -> Result<String, ApiError>;

    /// Answer a free-form question about an already-stored image.
    async fn follow_up(&self, jpeg: &[u8], question: &str) -> Result<String, ApiError>;
}

/// OpenAI-compatible chat-completions backend, selected entirely by
/// configuration (base URL, API key, model name).
pub struct OpenAiDescriber {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl OpenAiDescriber {
    pub fn new(
        base_url: String,
        api_key: String,
        model: String,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url,
            api_key,
            model,
        })
    }

    async fn chat(
        &self,
        system_prompt: &str,
        jpeg: &[u8],
        user_text: &str,
    ) -> Result<String, ApiError> {
        let payload = chat_payload(&self.model, system_prompt, jpeg, user_text);
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));

        info!("requesting scene description from {}", self.model);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await
            .map_err(|e| ApiError::Upstream(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ApiError::Upstream(e.to_string()))?;
        if !status.is_success() {
            return Err(ApiError::Upstream(format!("status {status}: {body}")));
        }

        let parsed: Value = serde_json::from_str(&body)
            .map_err(|e| ApiError::Upstream(format!("malformed response: {e}")))?;
        let answer = parsed["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| ApiError::Upstream("no answer in response".to_string()))?;

        debug!("response content: {answer}");
        Ok(answer.to_string())
    }
}

#[async_trait]
impl Describer for OpenAiDescriber {
    async fn describe(&self, jpeg: &[u8]) -> Result<String, ApiError> {
        self.chat(DESCRIBE_SYSTEM_PROMPT, jpeg, DEFAULT_QUESTION).await
    }

    async fn follow_up(&self, jpeg: &[u8], question: &str) -> Result<String, ApiError> {
        info!("follow-up question: {question}");
        self.chat(FOLLOW_UP_SYSTEM_PROMPT, jpeg, question).await
    }
}

fn chat_payload(model: &str, system_prompt: &str, jpeg: &[u8], user_text: &str) -> Value {
    let image_url = format!(
        "data:image/jpeg;base64,{}",
        general_purpose::STANDARD.encode(jpeg)
    );
    json!({
        "model": model,
        "messages": [
            {
                "role": "system",
                "content": [
                    { "type": "text", "text": system_prompt }
                ]
            },
            {
                "role": "user",
                "content": [
                    {
                        "type": "image_url",
                        "image_url": { "url": image_url }
                    },
                    { "type": "text", "text": user_text }
                ]
            }
        ]
    })
}
