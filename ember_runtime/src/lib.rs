//! Engine-side collaborators for the compiled tier's runtime stubs.
//!
//! This crate holds the pieces of the execution engine that the generated
//! stubs in `ember_jit` call into or read from: the object and class-layout
//! model, the shared heap and thread-local allocation buffers, the per-thread
//! context record that carries pending exceptions and call-out results across
//! the compiled/engine boundary, the compiled-method registry consumed by the
//! patch controller, and the slow-path service surface itself.
//!
//! Everything here is transient, in-memory, per-process state.

pub mod code;
pub mod engine;
pub mod heap;
pub mod klass;
pub mod layout;
pub mod object;
pub mod services;
pub mod thread;
pub mod tlab;

pub use code::{
    CodePtr, CompiledFrame, CompiledMethod, CompiledRegistry, MethodId, PatchSite, PatchSiteId,
    PatchSiteState, RelocKind,
};
pub use engine::EngineServices;
pub use heap::Heap;
pub use klass::{InitState, KlassDesc, KlassTable};
pub use layout::{ArrayTag, LayoutDescriptor, OBJECT_ALIGNMENT};
pub use object::{KlassId, ObjRef};
pub use services::{PatchKind, ResolvedConstant, RuntimeServices};
pub use thread::ThreadContext;
pub use tlab::{AllocPolicy, Tlab};
