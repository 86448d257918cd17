//! IdGenerator port - ID 生成の抽象化
//!
//! 受付（admission）ごとの AttemptId と購読ごとの SubscriptionId を生成します。
//! TaskId は入力パスそのものなので、ここでは生成しません。
//!
//! # 実装
//! - **UlidGenerator**: ULID ベース（本番用）

use crate::domain::ids::{AttemptId, SubscriptionId};
use crate::ports::Clock;
use ulid::Ulid;

/// IdGenerator は ULID ベースの ID を生成
///
/// # ULID の特性
/// - 時刻でソート可能
/// - 128-bit、衝突しない前提で扱える
///
/// # テスト容易性
/// - Clock を差し替えると時刻部分が固定される
///
/// # Thread Safety
/// - `Send + Sync` を要求（registry と bus が `Arc` で共有）
pub trait IdGenerator: Send + Sync {
    fn generate_attempt_id(&self) -> AttemptId;

    fn generate_subscription_id(&self) -> SubscriptionId;
}

/// ULID generator taking its timestamp from a `Clock`.
///
/// With a `FixedClock` the timestamp part is deterministic; the random part
/// still keeps ids unique.
pub struct UlidGenerator<C> {
    clock: C,
}

impl<C: Clock> UlidGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self { clock }
    }

    fn next_ulid(&self) -> Ulid {
        let timestamp_ms = self.clock.now().timestamp_millis() as u64;
        Ulid::from_parts(timestamp_ms, rand::random())
    }
}

impl<C: Clock> IdGenerator for UlidGenerator<C> {
    fn generate_attempt_id(&self) -> AttemptId {
        AttemptId::from(self.next_ulid())
    }

    fn generate_subscription_id(&self) -> SubscriptionId {
        SubscriptionId::from(self.next_ulid())
    }
}
