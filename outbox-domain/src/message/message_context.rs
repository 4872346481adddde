use bon::Builder;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// 消息上下文：链路追踪、触发主体与自定义头
#[derive(Builder, Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageContext {
    /// 关联ID
    correlation_id: Option<String>,
    /// 因果ID
    causation_id: Option<String>,
    /// 触发消息的主体类型（如用户、系统等）
    actor_type: Option<String>,
    /// 触发消息的主体ID
    actor_id: Option<String>,

    #[builder(default)]
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    headers: BTreeMap<String, String>,
}

impl MessageContext {
    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    pub fn causation_id(&self) -> Option<&str> {
        self.causation_id.as_deref()
    }

    pub fn actor_type(&self) -> Option<&str> {
        self.actor_type.as_deref()
    }

    pub fn actor_id(&self) -> Option<&str> {
        self.actor_id.as_deref()
    }

    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }
}
