//! VitteLight core: the tagged value model, interned strings, and the hash
//! map shared by globals, natives, and the constant-string pool.
//!
//! This crate knows nothing about bytecode or opcodes — that lives in
//! `vlvm`, which depends on it.

pub mod map;
pub mod value;
pub mod vlstr;

pub use map::{Oom, VlMap};
pub use value::{NativeHandle, Value};
pub use vlstr::{fnv1a, VlStr};
