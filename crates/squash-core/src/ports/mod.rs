//! Ports: seams for the collaborators the engine does not own.
//!
//! - **Codec**: the compression routine (default: `impls::ImageCodec`)
//! - **Clock**: wall-clock time (archive names, id timestamps)
//! - **IdGenerator**: ULID ids for attempts and subscriptions

pub mod clock;
pub mod codec;
pub mod id_generator;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::codec::{Codec, Encoded, output_path_for};
pub use self::id_generator::{IdGenerator, UlidGenerator};
