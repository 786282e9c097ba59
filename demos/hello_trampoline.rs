//! A minimal program that allocates a heap trampoline, calls through it, and
//! frees it again.

use core::ffi::{c_char, CStr};
use core::mem;

use trampoline_allocator::pages::binding_of;
use trampoline_allocator::{heap_alloc, heap_free, STATIC_CHAIN_REGISTER};

// `greet` moves the static chain into the first argument register and
// tail-calls `print_greeting`.
#[cfg(target_arch = "x86_64")]
core::arch::global_asm!(
    ".text",
    ".globl hello_trampoline_greet",
    "hello_trampoline_greet:",
    "mov rdi, r10",
    "jmp {print}",
    print = sym print_greeting,
);

#[cfg(target_arch = "aarch64")]
core::arch::global_asm!(
    ".text",
    ".globl hello_trampoline_greet",
    ".p2align 2",
    "hello_trampoline_greet:",
    "mov x0, x18",
    "b {print}",
    print = sym print_greeting,
);

extern "C" {
    fn hello_trampoline_greet();
}

extern "C" fn print_greeting(name: *const c_char) {
    let name = unsafe { CStr::from_ptr(name) };
    println!("Hello, {}!", name.to_string_lossy());
}

fn main() {
    let name: &'static CStr = c"World";
    let code = heap_alloc(
        hello_trampoline_greet as unsafe extern "C" fn() as usize,
        name.as_ptr() as usize,
    );

    let (target, chain) = unsafe { binding_of(code) };
    println!(
        "Trampoline at {:?} jumps to {:#x} with {:#x} in {}",
        code, target, chain, STATIC_CHAIN_REGISTER
    );

    // To the caller it is just a function with no arguments.
    let greet: extern "C" fn() = unsafe { mem::transmute(code.as_ptr()) };
    greet();

    unsafe { heap_free(code) };
}
