//! 消息信封（MessageEnvelope）
//!
//! 以 JSON 承载任意 `Message` 载荷，并以 `message_type` 字符串记录具体类型，
//! 便于存储层保持不透明、投递层按类型路由与还原。
//!
use super::{Message, MessageContext};
use crate::error::{DomainError, DomainResult};
use bon::Builder;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// 内容指纹的 UUIDv5 命名空间
const CONTENT_NAMESPACE: Uuid = Uuid::from_u128(0x6f7d_1c2a_9b4e_4d0b_8a3f_52c1_e0d9_7b16);

#[derive(Debug, Clone, PartialEq, Builder, Serialize, Deserialize)]
pub struct MessageEnvelope {
    /// 消息唯一标识（入站消息通常取自 broker 的消息 ID）
    message_id: Uuid,
    /// 载荷类型判别名
    message_type: String,
    /// 载荷 JSON
    payload: Value,
    /// 链路上下文
    #[builder(default)]
    #[serde(default)]
    context: MessageContext,
    /// 信封创建时间
    #[builder(default = Utc::now())]
    created_at: DateTime<Utc>,
}

impl MessageEnvelope {
    /// 以新生成的消息 ID 包装载荷
    pub fn new<M: Message>(message: &M, context: MessageContext) -> DomainResult<Self> {
        Self::with_id(Uuid::new_v4(), message, context)
    }

    /// 以指定的消息 ID 包装载荷（如 broker 投递的消息标识）
    pub fn with_id<M: Message>(
        message_id: Uuid,
        message: &M,
        context: MessageContext,
    ) -> DomainResult<Self> {
        Ok(Self {
            message_id,
            message_type: M::MESSAGE_TYPE.to_string(),
            payload: serde_json::to_value(message)?,
            context,
            created_at: Utc::now(),
        })
    }

    /// 还原为具体载荷类型，类型判别名不一致时返回 `TypeMismatch`
    pub fn decode<M: Message>(&self) -> DomainResult<M> {
        if self.message_type != M::MESSAGE_TYPE {
            return Err(DomainError::TypeMismatch {
                expected: M::MESSAGE_TYPE.to_string(),
                found: self.message_type.clone(),
            });
        }

        Ok(serde_json::from_value(self.payload.clone())?)
    }

    pub fn message_id(&self) -> Uuid {
        self.message_id
    }

    pub fn message_type(&self) -> &str {
        &self.message_type
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn context(&self) -> &MessageContext {
        &self.context
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// 内容指纹：类型判别名 + 规范化载荷 JSON 的 UUIDv5，与消息 ID 无关
    pub fn content_id(&self) -> Uuid {
        // serde_json 的 Map 默认按键排序，序列化结果稳定
        let mut name = Vec::with_capacity(self.message_type.len() + 64);
        name.extend_from_slice(self.message_type.as_bytes());
        name.push(0);
        name.extend_from_slice(self.payload.to_string().as_bytes());
        Uuid::new_v5(&CONTENT_NAMESPACE, &name)
    }
}
