//! Extracts a single dynamically-linked image from Apple's dyld shared cache
//! and emits it as a standalone Mach-O file.
//!
//! A shared cache merges hundreds of system libraries into one file: pointers
//! are pre-slid into a packed slide-info encoding, import stubs branch
//! directly into sibling images, local symbols are stripped to a side table,
//! and Objective-C metadata is interned into a cache-wide pool. The pipeline
//! in this crate reverses each of those optimizations so that loaders and
//! disassemblers accept the output as an ordinary dylib.
//!
//! The top-level entry point is [`extract::Extraction`]; the `dyldex` binary
//! is a thin front-end over it.

pub mod accelerator;
pub mod bind_info;
pub mod cache;
pub mod encoder;
pub mod errors;
pub mod extract;
pub mod image;
pub mod layout;
pub mod linkedit;
pub mod objc;
pub mod offsets;
pub mod slide;
pub mod stubs;
pub mod symbols;

mod leb;
