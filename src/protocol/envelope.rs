//! 消息信封协议定义
//!
//! 总线上的每条消息都是 `{app, action, ...payload}`：`app` 区分同一广播总线上的其它流量，
//! `action` 决定载荷形状。字段名沿用页面侧约定（camelCase）。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ProtocolError;

/// 默认应用标签（与客户端页面约定一致）
pub const DEFAULT_APP_TAG: &str = "GooglePhotosDeduper";

/// 待删除的媒体项：ID + 用于定位删除页面的 URL
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetItem {
    pub id: String,
    #[serde(rename = "productUrl")]
    pub product_url: String,
}

impl TargetItem {
    pub fn new(id: impl Into<String>, product_url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            product_url: product_url.into(),
        }
    }
}

/// 单个媒体项的删除结果（deletePhoto.result 的载荷）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemResult {
    pub media_item_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// 删除完成时间
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
    /// 删除时页面所在的用户 URL（供客户端回写元数据）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_url: Option<String>,
}

impl ItemResult {
    pub fn deleted(media_item_id: impl Into<String>, user_url: Option<String>) -> Self {
        Self {
            media_item_id: media_item_id.into(),
            success: true,
            error: None,
            deleted_at: Some(Utc::now()),
            user_url,
        }
    }

    pub fn failed(media_item_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            media_item_id: media_item_id.into(),
            success: false,
            error: Some(error.into()),
            deleted_at: None,
            user_url: None,
        }
    }
}

/// 整个删除任务的最终结果（startDeletionTask.result 的载荷）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TaskResult {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
        }
    }
}

/// 消息类型（按 action 区分）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action")]
pub enum Message {
    /// 客户端探测编排器是否在线
    #[serde(rename = "healthCheck")]
    HealthCheck,

    #[serde(rename = "healthCheck.result")]
    HealthCheckResult { success: bool, version: String },

    /// 启动删除任务
    #[serde(rename = "startDeletionTask")]
    StartDeletionTask {
        #[serde(rename = "mediaItems")]
        media_items: Vec<TargetItem>,
    },

    /// 任务最终结果，每个任务恰好一条
    #[serde(rename = "startDeletionTask.result")]
    StartDeletionTaskResult(TaskResult),

    /// 取消当前任务
    #[serde(rename = "stopDeletionTask")]
    StopDeletionTask,

    /// 编排器 -> 页内代理：删除当前页面上的媒体项
    #[serde(rename = "deletePhoto")]
    DeletePhoto {
        #[serde(rename = "mediaItemId")]
        media_item_id: String,
    },

    /// 页内代理 -> 编排器 -> 客户端
    #[serde(rename = "deletePhoto.result")]
    DeletePhotoResult(ItemResult),
}

/// action 判别值
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    HealthCheck,
    HealthCheckResult,
    StartDeletionTask,
    StartDeletionTaskResult,
    StopDeletionTask,
    DeletePhoto,
    DeletePhotoResult,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::HealthCheck => "healthCheck",
            Action::HealthCheckResult => "healthCheck.result",
            Action::StartDeletionTask => "startDeletionTask",
            Action::StartDeletionTaskResult => "startDeletionTask.result",
            Action::StopDeletionTask => "stopDeletionTask",
            Action::DeletePhoto => "deletePhoto",
            Action::DeletePhotoResult => "deletePhoto.result",
        }
    }

    /// 客户端可以发起的请求
    pub fn is_client_request(&self) -> bool {
        matches!(
            self,
            Action::HealthCheck | Action::StartDeletionTask | Action::StopDeletionTask
        )
    }

    /// 发往客户端的结果
    pub fn is_client_bound(&self) -> bool {
        matches!(
            self,
            Action::HealthCheckResult | Action::StartDeletionTaskResult | Action::DeletePhotoResult
        )
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Message {
    pub fn action(&self) -> Action {
        match self {
            Message::HealthCheck => Action::HealthCheck,
            Message::HealthCheckResult { .. } => Action::HealthCheckResult,
            Message::StartDeletionTask { .. } => Action::StartDeletionTask,
            Message::StartDeletionTaskResult(_) => Action::StartDeletionTaskResult,
            Message::StopDeletionTask => Action::StopDeletionTask,
            Message::DeletePhoto { .. } => Action::DeletePhoto,
            Message::DeletePhotoResult(_) => Action::DeletePhotoResult,
        }
    }
}

/// 总线信封：应用标签 + 消息
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Envelope {
    pub app: String,
    #[serde(flatten)]
    pub message: Message,
}

impl Envelope {
    pub fn new(app: impl Into<String>, message: Message) -> Self {
        Self {
            app: app.into(),
            message,
        }
    }

    pub fn action(&self) -> Action {
        self.message.action()
    }

    pub fn is_for(&self, app: &str) -> bool {
        self.app == app
    }

    /// 解析一条原始 JSON；`app` 不匹配时返回 `Ok(None)`（静默忽略的外部流量）
    pub fn decode(raw: &str, app: &str) -> Result<Option<Self>, ProtocolError> {
        let value: serde_json::Value = serde_json::from_str(raw)?;
        match value.get("app").and_then(|v| v.as_str()) {
            Some(tag) if tag == app => {}
            _ => return Ok(None),
        }
        let message: Message = serde_json::from_value(value)?;
        Ok(Some(Self::new(app, message)))
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_uses_wire_names() {
        let env = Envelope::new(
            DEFAULT_APP_TAG,
            Message::DeletePhoto {
                media_item_id: "m1".to_string(),
            },
        );
        let json: serde_json::Value = serde_json::from_str(&env.encode().unwrap()).unwrap();
        assert_eq!(json["app"], "GooglePhotosDeduper");
        assert_eq!(json["action"], "deletePhoto");
        assert_eq!(json["mediaItemId"], "m1");
    }

    #[test]
    fn test_decode_start_task() {
        let raw = r#"{"app":"GooglePhotosDeduper","action":"startDeletionTask",
            "mediaItems":[{"id":"a","productUrl":"https://photos.example/a"}]}"#;
        let env = Envelope::decode(raw, DEFAULT_APP_TAG).unwrap().unwrap();
        assert_eq!(
            env.message,
            Message::StartDeletionTask {
                media_items: vec![TargetItem::new("a", "https://photos.example/a")],
            }
        );
    }

    #[test]
    fn test_decode_ignores_foreign_app() {
        let raw = r#"{"app":"SomethingElse","action":"stopDeletionTask"}"#;
        assert!(Envelope::decode(raw, DEFAULT_APP_TAG).unwrap().is_none());

        let raw = r#"{"action":"stopDeletionTask"}"#;
        assert!(Envelope::decode(raw, DEFAULT_APP_TAG).unwrap().is_none());
    }

    #[test]
    fn test_decode_tolerates_extra_fields() {
        // 页内代理会回带 originalMessage
        let raw = r#"{"app":"GooglePhotosDeduper","action":"deletePhoto.result",
            "mediaItemId":"m1","success":false,"error":"no trash button",
            "originalMessage":{"action":"deletePhoto","mediaItemId":"m1"}}"#;
        let env = Envelope::decode(raw, DEFAULT_APP_TAG).unwrap().unwrap();
        match env.message {
            Message::DeletePhotoResult(result) => {
                assert_eq!(result.media_item_id, "m1");
                assert!(!result.success);
                assert_eq!(result.error.as_deref(), Some("no trash button"));
            }
            other => panic!("unexpected message: {:?}", other),
        }

        let raw = r#"{"app":"GooglePhotosDeduper","action":"healthCheck","nonce":7}"#;
        let env = Envelope::decode(raw, DEFAULT_APP_TAG).unwrap().unwrap();
        assert_eq!(env.message, Message::HealthCheck);
    }

    #[test]
    fn test_decode_unknown_action_is_error() {
        let raw = r#"{"app":"GooglePhotosDeduper","action":"response"}"#;
        assert!(Envelope::decode(raw, DEFAULT_APP_TAG).is_err());
        assert!(Envelope::decode("not json", DEFAULT_APP_TAG).is_err());
    }

    #[test]
    fn test_failed_result_omits_optional_fields() {
        let env = Envelope::new(
            DEFAULT_APP_TAG,
            Message::DeletePhotoResult(ItemResult::failed("b", "timeout")),
        );
        let json: serde_json::Value = serde_json::from_str(&env.encode().unwrap()).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["error"], "timeout");
        assert!(json.get("deletedAt").is_none());
        assert!(json.get("userUrl").is_none());
    }

    #[test]
    fn test_action_classes() {
        assert!(Action::StartDeletionTask.is_client_request());
        assert!(!Action::DeletePhoto.is_client_request());
        assert!(Action::DeletePhotoResult.is_client_bound());
        assert!(!Action::DeletePhoto.is_client_bound());
        assert_eq!(Action::HealthCheckResult.to_string(), "healthCheck.result");
    }
}
