//! # 通知ユースケース
//!
//! エンジンが発行した通知リクエストの描画・送信・ログ記録と、失敗した配信の再送を統合する。
//!
//! ## モジュール構成
//!
//! - [`template_renderer`] - tera テンプレートエンジンによる件名・本文の生成
//! - [`service`] - テンプレートレンダリング + 送信 + ログ記録 + 再送の統合サービス

pub mod service;
pub mod template_renderer;

pub use service::{NotificationService, RetryReport};
pub use template_renderer::{RenderedMessage, TemplateRenderer};
