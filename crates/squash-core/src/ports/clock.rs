//! Clock port - 時刻の抽象化
//!
//! # 実装
//! - **SystemClock**: 本番用
//! - **FixedClock**: テスト用（時刻を固定）

use std::sync::Arc;

use chrono::{DateTime, Utc};

/// Clock は現在時刻を提供
///
/// アーカイブ名のタイムスタンプと ID の時刻部分はここから取る。
///
/// # テスト容易性
/// - trait により時刻を差し替え可能
/// - テストでは FixedClock を使用し、アーカイブ名を決定的にする
///
/// # Thread Safety
/// - `Send + Sync` を要求（ワーカーと export から共有される）
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

impl<C: Clock + ?Sized> Clock for Arc<C> {
    fn now(&self) -> DateTime<Utc> {
        (**self).now()
    }
}

/// Real time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Always returns the same instant.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock {
    at: DateTime<Utc>,
}

impl FixedClock {
    pub fn new(at: DateTime<Utc>) -> Self {
        Self { at }
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.at
    }
}
