use serde::Serialize;
use serde::de::DeserializeOwned;

/// 可写入 Outbox/Inbox 的消息载荷需要满足的能力边界
///
/// `MESSAGE_TYPE` 作为落库的 `data_type` 判别名，用于反序列化与投递路由；
/// 应保持稳定，避免依赖 `type_name::<T>()`。
pub trait Message: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// 消息类型（形如 `orders.order_placed`）
    const MESSAGE_TYPE: &'static str;
}
