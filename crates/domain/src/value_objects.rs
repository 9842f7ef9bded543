//! # 値オブジェクト
//!
//! ドメイン全体で共有される値オブジェクトを定義する。
//!
//! | 型 | 内部表現 | 用途 |
//! |---|---------|------|
//! | [`Version`] | `u32` | エンティティのバージョン番号（楽観的ロック・定義バージョン） |
//! | [`WorkflowName`] | `String` | ワークフロー定義名 |
//! | [`StepId`] | `String` | ワークフロー定義内のステップ識別子 |
//! | [`CaseId`] | `Uuid` | 修理案件 ID（案件自体は CRUD 層が管理する） |

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::DomainError;

// =========================================================================
// Version（バージョン番号）
// =========================================================================

/// バージョン番号（値オブジェクト）
///
/// ワークフロー定義のバージョン管理と、インスタンスの楽観的ロックに使用する。
/// 1 から始まり、更新のたびにインクリメントされる。
///
/// # 不変条件
///
/// - バージョン番号は 1 以上
///
/// # 使用例
///
/// ```rust
/// use repairflow_domain::value_objects::Version;
///
/// let v1 = Version::initial();
/// assert_eq!(v1.as_u32(), 1);
///
/// let v2 = v1.next();
/// assert_eq!(v2.as_u32(), 2);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Version(u32);

impl Version {
    /// 初期バージョン（1）を作成する
    pub fn initial() -> Self {
        Self(1)
    }

    /// 指定した値からバージョンを作成する
    ///
    /// # エラー
    ///
    /// 0 を指定した場合は `DomainError::Validation` を返す。
    pub fn new(value: u32) -> Result<Self, DomainError> {
        if value == 0 {
            return Err(DomainError::Validation(
                "バージョン番号は 1 以上である必要があります".to_string(),
            ));
        }
        Ok(Self(value))
    }

    /// 次のバージョンを返す
    ///
    /// # パニック
    ///
    /// u32 の最大値を超える場合はパニックする。
    /// 実運用では到達しない想定。
    pub fn next(&self) -> Self {
        Self(
            self.0
                .checked_add(1)
                .expect("バージョン番号がオーバーフローしました"),
        )
    }

    /// 内部の u32 値を取得する
    pub fn as_u32(&self) -> u32 {
        self.0
    }

    /// i64 に変換する（DB 互換用）
    pub fn as_i64(&self) -> i64 {
        i64::from(self.0)
    }
}

impl TryFrom<i64> for Version {
    type Error = DomainError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        let value = u32::try_from(value).map_err(|_| {
            DomainError::Validation(format!("バージョン番号が範囲外です: {value}"))
        })?;
        Self::new(value)
    }
}

impl Default for Version {
    fn default() -> Self {
        Self::initial()
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

// =========================================================================
// WorkflowName（ワークフロー名）
// =========================================================================

define_validated_string! {
    /// ワークフロー名（値オブジェクト）
    ///
    /// ワークフロー定義の名前。名前 + バージョンで定義を一意に特定する。
    ///
    /// # バリデーション
    ///
    /// - 空文字列ではない
    /// - 最大 200 文字
    pub struct WorkflowName {
        label: "ワークフロー名",
        max_length: 200,
    }
}

// =========================================================================
// StepId（ステップ識別子）
// =========================================================================

/// ステップ識別子
///
/// 定義 JSON 内で作成者が付与する文字列 ID（例: `"registration"`）。
/// UUID ではなく、定義のスナップショット内でのみ一意であればよい。
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepId(String);

impl StepId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StepId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl PartialEq<str> for StepId {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for StepId {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

// =========================================================================
// CaseId（修理案件 ID）
// =========================================================================

define_uuid_id! {
    /// 修理案件 ID
    ///
    /// 案件の作成・更新は本クレートの範囲外。ワークフローインスタンス・文書・
    /// 承認インスタンスを案件単位で関連付けるためにのみ使用する。
    pub struct CaseId;
}
