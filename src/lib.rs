//! deduper - 重复照片删除任务编排器
//!
//! 模块划分：
//! - **agent**: 页内代理（在浏览上下文中执行删除交互）
//! - **bridge**: 客户端 JSON Lines 桥接（stdin / stdout）
//! - **browser**: 浏览上下文抽象与后端（模拟宿主 / Headless Chrome）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 任务编排、状态、中止监管、优雅关闭
//! - **observability**: 日志初始化
//! - **protocol**: 消息信封、广播总线、回复关联表
//! - **service**: 后台消息路由

pub mod agent;
pub mod bridge;
pub mod browser;
pub mod config;
pub mod core;
pub mod observability;
pub mod protocol;
pub mod service;
