#![cfg_attr(not(test), no_std)]

//! Allocation of small executable trampolines.
//!
//! A trampoline is a few instructions of machine code that load a *static
//! chain* value into a fixed register and jump to a target function, letting
//! a plain code pointer carry bound data. The code cannot be generated at run
//! time on systems that forbid writable executable memory, so instead a
//! page-sized template of identical trampolines is compiled into this crate
//! and mapped again, executable, from the program's own image whenever more
//! are needed. Every code page is paired with a writable data page right after
//! it, where each trampoline finds its target and chain value.
//!
//! Two allocators share that machinery:
//!
//! - the heap allocator ([`heap_alloc`], [`heap_free`], [`TrampHeap`]) hands
//!   out trampolines that live until freed, from any thread;
//! - the stack allocator ([`StackContext`]) hands out trampolines that are
//!   reclaimed automatically once the frame that asked for them returns.
//!
//! Supported targets are Linux on `x86_64` (static chain in `r10`) and
//! `aarch64` (static chain in `x18`).

extern crate alloc;

pub mod bitmap;
pub mod geometry;
pub mod heap;
pub mod image;
pub mod os;
pub mod pages;
pub mod signals;
pub mod stack;
pub mod template;

pub use geometry::{PAGE_SIZE, STATIC_CHAIN_REGISTER, TRAMP_COUNT};
pub use heap::{heap_alloc, heap_free, HeapStats, RawHeap, TrampHeap, Validity, HEAP};
pub use os::MapError;
pub use pages::{CodePtr, PagePair, PageSource, ToyPages};
pub use stack::StackContext;
pub use template::TemplatePages;
