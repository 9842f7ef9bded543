//! # テンプレートレンダラー
//!
//! tera テンプレートエンジンで通知リクエストから件名と本文を生成する。
//!
//! ## 設計方針
//!
//! - **`include_str!` によるコンパイル時埋め込み**: テンプレートはバイナリに埋め込まれる
//! - **テンプレート 1 つにつき 2 ファイル**: `{name}.subject`（件名）と `{name}.txt`（本文）
//! - **フォールバック**: 未登録のテンプレート名（定義 JSON のステップアクションで任意に指定される）は
//!   `generic` で描画する
//! - **コンテキスト**: リクエストのペイロードに `template` と `base_url` を加えたもの

use repairflow_domain::notification::{NotificationError, NotificationRequest};
use serde_json::Value as JsonValue;
use tera::{Context, Tera};

/// 未登録のテンプレート名に使うテンプレート
pub const FALLBACK_TEMPLATE: &str = "generic";

/// 描画済みの件名と本文
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedMessage {
    pub subject: String,
    pub body:    String,
}

/// テンプレートレンダラー
pub struct TemplateRenderer {
    engine: Tera,
}

macro_rules! notification_templates {
    ($($name:literal),* $(,)?) => {
        vec![
            $(
                (
                    concat!($name, ".subject"),
                    include_str!(concat!("../../../templates/notifications/", $name, ".subject")),
                ),
                (
                    concat!($name, ".txt"),
                    include_str!(concat!("../../../templates/notifications/", $name, ".txt")),
                ),
            )*
        ]
    };
}

impl TemplateRenderer {
    /// 新しいレンダラーインスタンスを作成
    ///
    /// `include_str!` で埋め込んだテンプレートを tera に登録する。
    pub fn new() -> Result<Self, NotificationError> {
        let mut engine = Tera::default();

        engine
            .add_raw_templates(notification_templates![
                "approval_request",
                "approval_approved",
                "approval_completed",
                "approval_rejected",
                "approval_escalated",
                "approval_delegated",
                "step_timeout",
                "step_escalation",
                "generic",
            ])
            .map_err(|e| NotificationError::TemplateFailed(e.to_string()))?;

        Ok(Self { engine })
    }

    /// テンプレートが登録されているか
    pub fn has_template(&self, name: &str) -> bool {
        self.engine
            .get_template_names()
            .any(|registered| registered == format!("{name}.txt"))
    }

    /// 通知リクエストから件名と本文を生成する
    ///
    /// # 引数
    ///
    /// - `request`: エンジンが発行した通知リクエスト
    /// - `base_url`: アプリケーションのベース URL（例: `http://localhost:5173`）
    pub fn render(
        &self,
        request: &NotificationRequest,
        base_url: &str,
    ) -> Result<RenderedMessage, NotificationError> {
        let name = if self.has_template(&request.template) {
            request.template.as_str()
        } else {
            FALLBACK_TEMPLATE
        };
        let context = build_context(request, base_url)?;

        let subject = self
            .engine
            .render(&format!("{name}.subject"), &context)
            .map_err(|e| NotificationError::TemplateFailed(e.to_string()))?;

        let body = self
            .engine
            .render(&format!("{name}.txt"), &context)
            .map_err(|e| NotificationError::TemplateFailed(e.to_string()))?;

        Ok(RenderedMessage {
            subject: subject.trim().to_string(),
            body,
        })
    }
}

/// ペイロードをテンプレートコンテキストに変換する
fn build_context(request: &NotificationRequest, base_url: &str) -> Result<Context, NotificationError> {
    let mut context = match &request.payload {
        JsonValue::Object(_) => Context::from_value(request.payload.clone())
            .map_err(|e| NotificationError::TemplateFailed(e.to_string()))?,
        _ => Context::new(),
    };
    context.insert("template", &request.template);
    context.insert("base_url", base_url);
    Ok(context)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use repairflow_domain::notification::{NotificationChannel, Recipient};
    use rstest::{fixture, rstest};
    use serde_json::json;

    use super::*;

    #[fixture]
    fn renderer() -> TemplateRenderer {
        TemplateRenderer::new().unwrap()
    }

    fn request(template: &str, payload: JsonValue) -> NotificationRequest {
        NotificationRequest {
            recipients: vec![Recipient::role("store_manager")],
            channel: NotificationChannel::Email,
            template: template.to_string(),
            payload,
        }
    }

    fn approval_payload() -> JsonValue {
        json!({
            "event": "approval_request",
            "approval_instance_id": "0190a0b0-0000-7000-8000-000000000001",
            "document_id": "0190a0b0-0000-7000-8000-000000000002",
            "document_type_id": "quotation",
            "case_id": "0190a0b0-0000-7000-8000-000000000003",
            "workflow_name": "見積承認",
            "submitted_by": "reception-1",
            "current_level": 1,
            "level": 1,
            "level_name": "店長承認",
        })
    }

    #[rstest]
    fn test_承認依頼の件名と本文を生成できる(renderer: TemplateRenderer) {
        let result = renderer
            .render(
                &request("approval_request", approval_payload()),
                "http://localhost:5173",
            )
            .unwrap();

        assert_eq!(
            result.subject,
            "[RepairFlow] 承認依頼: 見積承認（レベル 1 店長承認）"
        );
        assert!(result.body.contains("申請者: reception-1"));
        assert!(result.body.contains(
            "http://localhost:5173/approvals/0190a0b0-0000-7000-8000-000000000001"
        ));
    }

    #[rstest]
    fn test_期限超過通知を生成できる(renderer: TemplateRenderer) {
        let payload = json!({
            "case_id": "case-1",
            "instance_id": "instance-1",
            "step_id": "repair",
            "step_name": "修理",
            "timeout_hours": 48,
            "overdue_hours": 3,
            "escalation_level": null,
        });

        let result = renderer
            .render(&request("step_timeout", payload), "https://repair.example.com")
            .unwrap();

        assert_eq!(result.subject, "[RepairFlow] 期限超過: 修理");
        assert!(result.body.contains("48 時間"));
        assert!(result.body.contains("https://repair.example.com/cases/case-1"));
    }

    #[rstest]
    fn test_未登録のテンプレートは汎用テンプレートで描画する(renderer: TemplateRenderer) {
        let payload = json!({"case_id": "case-9", "step_name": "完了"});

        let result = renderer
            .render(&request("repair_completed", payload), "http://localhost:5173")
            .unwrap();

        assert_eq!(result.subject, "[RepairFlow] repair_completed");
        assert!(result.body.contains("ステップ: 完了"));
    }

    #[rstest]
    fn test_テンプレートの登録状況を判定できる(renderer: TemplateRenderer) {
        assert!(renderer.has_template("approval_escalated"));
        assert!(!renderer.has_template("repair_completed"));
    }

    #[rstest]
    fn test_必須の変数が欠けている場合はエラー(renderer: TemplateRenderer) {
        let result = renderer.render(&request("approval_request", json!({})), "http://x");

        assert!(matches!(result, Err(NotificationError::TemplateFailed(_))));
    }
}
