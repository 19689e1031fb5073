//! A 32-bit ELF (`ET_REL`, `EM_386`) object-file emitter.
//!
//! [`Emitter`](emitter::Emitter) collects sections, symbols, and
//! relocations across one or more assembler passes and writes a
//! complete `.o` via [`Emitter::cleanup`](emitter::Emitter::cleanup).

#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic, missing_docs)]

pub mod base;
pub mod debug;
pub mod emitter;
pub mod error;
pub mod raa;
pub mod reloc;
pub mod saa;
pub mod section;
pub mod strtab;
pub mod symbol;
pub mod writer;

pub use emitter::{Binding, Emitter, EmitterConfig, OutData, SpecialSegments};
pub use error::{Error, Result};
