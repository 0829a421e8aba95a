//! Runtime stubs and deferred patching for the compiled tier.
//!
//! The pieces of compiled-code support that sit between generated method
//! code and the execution engine:
//! - Shared slow-path stubs (allocation, monitors, throws, subtype checks)
//! - The exception dispatch and unwind stubs
//! - Deferred constant patching for fields, classes, and mirrors
//! - GC call-site descriptors covering the stub save areas
#![deny(unsafe_op_in_unsafe_fn)]
pub mod emitter;
pub mod machine;
pub mod patching;
pub mod regs;
pub mod stubs;
