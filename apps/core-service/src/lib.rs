//! # Core Service ライブラリ
//!
//! 修理案件ワークフローと文書承認のユースケースを公開する。
//! 統合テストとバイナリの両方から使う。

pub mod config;
pub mod error;
pub mod usecase;
