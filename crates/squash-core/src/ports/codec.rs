//! Codec port - 圧縮ルーチンの抽象化
//!
//! エンジンは codec の中身を見ない。codec は入力を読み、エンコード済みの
//! バイト列を返すだけで、ファイルは書かない。出力ファイル
//! （[`output_path_for`]）を書くのはワーカーで、成功かつ期限内の場合に限る。
//!
//! # 実装
//! - **ImageCodec**: `image` クレートによる再エンコード（`impls`）

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::domain::CodecError;

/// Bytes produced by [`Codec::encode`], not yet written anywhere.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Encoded {
    pub bytes: Vec<u8>,
    /// Upper-case format name, e.g. `PNG`.
    pub format: String,
}

impl Encoded {
    pub fn new(bytes: Vec<u8>, format: impl Into<String>) -> Self {
        Self {
            bytes,
            format: format.into(),
        }
    }
}

/// Codec は 1 枚の画像を圧縮する
///
/// # 契約
/// - `probe` は進捗表示の前に呼ばれる。読めない入力はここで即失敗させる
/// - `encode` は副作用を持たない（出力ファイルを書かない）
/// - panic してもエンジンは落ちない。そのタスクが Failed になるだけ
///
/// # テスト容易性
/// - trait により codec を差し替え可能
/// - テストでは画像をデコードしない偽の codec を使う
///
/// # Thread Safety
/// - `Send + Sync` を要求（全ワーカーが `Arc` で共有）
#[async_trait]
pub trait Codec: Send + Sync {
    /// Cheap check that `input` can be opened as an image.
    ///
    /// Returns the detected format name.
    async fn probe(&self, input: &Path) -> Result<String, CodecError>;

    /// Re-encode `input` in memory.
    async fn encode(&self, input: &Path) -> Result<Encoded, CodecError>;
}

/// `<dir>/<name>_compressed<ext>`.
///
/// Deterministic: repeated runs (or two inputs with the same base name in the
/// same directory) overwrite the same output.
pub fn output_path_for(input: &Path) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match input.extension() {
        Some(ext) => format!("{stem}_compressed.{}", ext.to_string_lossy()),
        None => format!("{stem}_compressed"),
    };
    input.with_file_name(name)
}
