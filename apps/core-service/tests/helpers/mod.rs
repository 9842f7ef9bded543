//! 統合テスト用ヘルパー

mod repair_flow_builder;

pub use repair_flow_builder::{RepairFlowSystem, RepairFlowTestBuilder};
