//! Impls: concrete adapters for the ports.
//!
//! - **ImageCodec**: `Codec` backed by the `image` crate

pub mod image_codec;

pub use self::image_codec::{ImageCodec, format_name};
