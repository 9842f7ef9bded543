//! # RepairFlow インフラ層
//!
//! 外部システムとの接続・通信を担当するインフラストラクチャ層。
//!
//! ## 設計方針
//!
//! このクレートはワークフロー・承認エンジンが使う協調者（永続化、文書ストア、
//! 通知送信）のインターフェースと具体的な実装を提供する。外部システムの詳細を
//! カプセル化し、ドメイン層をインフラの変更から保護する。
//!
//! ## 責務
//!
//! - **データベース接続**: PostgreSQL への接続プール管理とマイグレーション
//! - **リポジトリ実装**: 定義・構成・インスタンス・文書・通知ログの永続化
//! - **通知送信**: メール（SMTP / SES）、SMS、Webhook、アプリ内通知
//!
//! ## 依存関係
//!
//! ```text
//! core-service → infra → domain → shared
//! ```
//!
//! ドメイン層はインフラ層に依存しない（依存性逆転の原則）。
//!
//! ## モジュール構成
//!
//! - [`db`] - PostgreSQL データベース接続管理
//! - [`error`] - インフラ層エラー定義
//! - [`notification`] - 通知送信
//! - [`repository`] - リポジトリ実装
//!
//! ## 使用例
//!
//! ```rust,ignore
//! use repairflow_infra::{db, repository::PostgresWorkflowInstanceRepository};
//!
//! async fn setup() -> Result<(), Box<dyn std::error::Error>> {
//!     let pool = db::create_pool("postgres://localhost/repairflow").await?;
//!     db::run_migrations(&pool).await?;
//!     let instances = PostgresWorkflowInstanceRepository::new(pool);
//!     Ok(())
//! }
//! ```

pub mod db;
pub mod error;
#[cfg(any(test, feature = "test-utils"))]
pub mod mock;
pub mod notification;
pub mod repository;

pub use error::InfraError;
