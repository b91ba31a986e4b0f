//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `DEDUPER__*` 覆盖（双下划线表示嵌套，如 `DEDUPER__ORCHESTRATOR__SEND_ATTEMPTS=5`）。

use std::path::PathBuf;

use serde::Deserialize;

use crate::protocol::DEFAULT_APP_TAG;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    #[serde(default)]
    pub app: AppSection,
    #[serde(default)]
    pub orchestrator: OrchestratorSection,
    #[serde(default)]
    pub agent: AgentSection,
    #[serde(default)]
    pub browser: BrowserSection,
    #[serde(default)]
    pub bus: BusSection,
}

/// [app] 段：应用标签、关闭超时
#[derive(Debug, Clone, Deserialize)]
pub struct AppSection {
    /// 信封中的 app 字段，其它标签的消息一律忽略
    #[serde(default = "default_app_tag")]
    pub app_tag: String,
    /// 退出时等待当前任务收尾的时间（秒）
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
}

fn default_app_tag() -> String {
    DEFAULT_APP_TAG.to_string()
}

fn default_shutdown_timeout_secs() -> u64 {
    15
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            app_tag: default_app_tag(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
        }
    }
}

/// [orchestrator] 段：重试、超时、取消与结果策略
#[derive(Debug, Clone, Deserialize)]
pub struct OrchestratorSection {
    /// deletePhoto 投递最多尝试次数（含首次）
    #[serde(default = "default_send_attempts")]
    pub send_attempts: u32,
    /// 两次投递之间的间隔（毫秒）
    #[serde(default = "default_send_backoff_ms")]
    pub send_backoff_ms: u64,
    /// 等待 deletePhoto.result 的超时（毫秒）
    #[serde(default = "default_result_timeout_ms")]
    pub result_timeout_ms: u64,
    /// 等待页面加载完成的超时（毫秒）；不设置则只受任务中止约束
    #[serde(default)]
    pub page_ready_timeout_ms: Option<u64>,
    /// Stop 是否打断正在进行的单项等待；false 时只在两项之间检查
    #[serde(default = "default_interrupt_in_flight")]
    pub interrupt_in_flight: bool,
    /// 有任一项失败时任务整体是否判为失败
    #[serde(default)]
    pub fail_task_on_item_failure: bool,
}

fn default_send_attempts() -> u32 {
    3
}

fn default_send_backoff_ms() -> u64 {
    1_000
}

fn default_result_timeout_ms() -> u64 {
    10_000
}

fn default_interrupt_in_flight() -> bool {
    true
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            send_attempts: default_send_attempts(),
            send_backoff_ms: default_send_backoff_ms(),
            result_timeout_ms: default_result_timeout_ms(),
            page_ready_timeout_ms: None,
            interrupt_in_flight: default_interrupt_in_flight(),
            fail_task_on_item_failure: false,
        }
    }
}

/// [agent] 段：页内删除步骤的选择器与单步超时
#[derive(Debug, Clone, Deserialize)]
pub struct AgentSection {
    #[serde(default = "default_step_timeout_ms")]
    pub step_timeout_ms: u64,
    #[serde(default = "default_trash_selector")]
    pub trash_selector: String,
    #[serde(default = "default_confirm_selector")]
    pub confirm_selector: String,
    #[serde(default = "default_toast_selector")]
    pub toast_selector: String,
    /// 只定位删除按钮，不点击；每项都回复失败（调试用）
    #[serde(default)]
    pub dry_run: bool,
}

fn default_step_timeout_ms() -> u64 {
    10_000
}

fn default_trash_selector() -> String {
    "[data-delete-origin] button".to_string()
}

fn default_confirm_selector() -> String {
    "[jsshadow] [autofocus]".to_string()
}

fn default_toast_selector() -> String {
    r#"[role="status"][aria-live="polite"]"#.to_string()
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            step_timeout_ms: default_step_timeout_ms(),
            trash_selector: default_trash_selector(),
            confirm_selector: default_confirm_selector(),
            toast_selector: default_toast_selector(),
            dry_run: false,
        }
    }
}

/// [browser] 段：Chrome 窗口参数（需 feature "browser"）
#[derive(Debug, Clone, Deserialize)]
pub struct BrowserSection {
    #[serde(default)]
    pub headless: bool,
    #[serde(default = "default_window_width")]
    pub window_width: u32,
    #[serde(default = "default_window_height")]
    pub window_height: u32,
    /// 检测窗口被关闭的轮询间隔（毫秒）
    #[serde(default = "default_close_poll_ms")]
    pub close_poll_ms: u64,
}

fn default_window_width() -> u32 {
    500
}

fn default_window_height() -> u32 {
    200
}

fn default_close_poll_ms() -> u64 {
    500
}

impl Default for BrowserSection {
    fn default() -> Self {
        Self {
            headless: false,
            window_width: default_window_width(),
            window_height: default_window_height(),
            close_poll_ms: default_close_poll_ms(),
        }
    }
}

/// [bus] 段
#[derive(Debug, Clone, Deserialize)]
pub struct BusSection {
    #[serde(default = "default_bus_capacity")]
    pub capacity: usize,
}

fn default_bus_capacity() -> usize {
    64
}

impl Default for BusSection {
    fn default() -> Self {
        Self {
            capacity: default_bus_capacity(),
        }
    }
}

/// 从 config 目录加载配置，环境变量 DEDUPER__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 DEDUPER__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("DEDUPER")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_match_protocol_constants() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.app.app_tag, "GooglePhotosDeduper");
        assert_eq!(cfg.orchestrator.send_attempts, 3);
        assert_eq!(cfg.orchestrator.send_backoff_ms, 1_000);
        assert_eq!(cfg.orchestrator.result_timeout_ms, 10_000);
        assert_eq!(cfg.orchestrator.page_ready_timeout_ms, None);
        assert!(cfg.orchestrator.interrupt_in_flight);
        assert!(!cfg.orchestrator.fail_task_on_item_failure);
        assert_eq!(cfg.agent.step_timeout_ms, 10_000);
        assert_eq!(cfg.browser.window_width, 500);
        assert_eq!(cfg.browser.window_height, 200);
    }

    #[test]
    fn test_load_from_file_overrides_some_keys() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("deduper.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "[orchestrator]\nresult_timeout_ms = 2500\nfail_task_on_item_failure = true\n\n[agent]\ndry_run = true"
        )
        .unwrap();

        let cfg = load_config(Some(path)).unwrap();
        assert_eq!(cfg.orchestrator.result_timeout_ms, 2_500);
        assert!(cfg.orchestrator.fail_task_on_item_failure);
        // 未出现的键保持默认值
        assert_eq!(cfg.orchestrator.send_attempts, 3);
        assert!(cfg.agent.dry_run);
        assert_eq!(cfg.agent.trash_selector, "[data-delete-origin] button");
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let cfg = load_config(Some(PathBuf::from("/nonexistent/deduper.toml"))).unwrap();
        assert_eq!(cfg.bus.capacity, 64);
    }
}
