use outbox_domain::message::Message;

/// 进程内命令（Internal Command）
///
/// 表达“意图”的写操作请求，先随业务事务落库，再由处理流程分发给唯一的处理器。
/// - 类型判别名取 `Message::MESSAGE_TYPE`，用于日志、路由与落库，避免依赖 `type_name::<T>()`；
/// - 建议保持语义化的“动宾结构”命名，如 `ReserveStock`、`CloseOrder`。
pub trait InternalCommand: Message {}
