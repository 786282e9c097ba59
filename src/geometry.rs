//! Per-architecture trampoline geometry and the template page itself.
//!
//! The template is a page of identical code slots. Slot `i` loads the two
//! data words stored exactly one page above it, puts the chain value in the
//! static-chain register and jumps to the function address. Every page pair
//! handed out by a [`PageSource`](crate::pages::PageSource) maps this same
//! page as its code half.
//!
//! | constant         | meaning                                                |
//! |------------------|--------------------------------------------------------|
//! | `PAGE_SIZE`      | size of the code page and of the data page             |
//! | `SLOT_SIZE`      | stride of one trampoline within the code page          |
//! | `RESERVED_SLOTS` | leading slots used by shared template code             |
//! | `FUNCADDR_FIRST` | whether data word 0 is the function address            |

use static_assertions::const_assert;

#[cfg(target_arch = "x86_64")]
mod arch {
    pub const PAGE_SIZE: usize = 4096;
    pub const SLOT_SIZE: usize = 16;
    pub const RESERVED_SLOTS: usize = 0;
    pub const FUNCADDR_FIRST: bool = true;

    /// The register the template loads the chain value into.
    pub const STATIC_CHAIN_REGISTER: &str = "r10";

    core::arch::global_asm!(
        ".pushsection .text.trampoline_template,\"ax\",@progbits",
        ".balign 4096",
        ".globl __trampoline_allocator_template",
        ".hidden __trampoline_allocator_template",
        ".type __trampoline_allocator_template, @function",
        "__trampoline_allocator_template:",
        ".rept 256",
        ".balign 16",
        "2: movq 2b+4096+8(%rip), %r10",
        "jmpq *2b+4096(%rip)",
        ".endr",
        ".balign 4096",
        ".size __trampoline_allocator_template, 4096",
        ".popsection",
        options(att_syntax)
    );
}

#[cfg(target_arch = "aarch64")]
mod arch {
    pub const PAGE_SIZE: usize = 65536;
    pub const SLOT_SIZE: usize = 16;
    pub const RESERVED_SLOTS: usize = 0;
    pub const FUNCADDR_FIRST: bool = true;

    /// The register the template loads the chain value into.
    pub const STATIC_CHAIN_REGISTER: &str = "x18";

    core::arch::global_asm!(
        ".pushsection .text.trampoline_template,\"ax\",%progbits",
        ".balign 65536",
        ".globl __trampoline_allocator_template",
        ".hidden __trampoline_allocator_template",
        ".type __trampoline_allocator_template, %function",
        "__trampoline_allocator_template:",
        ".rept 4096",
        ".balign 16",
        "2: ldr x17, 2b+0x10000",
        "ldr x18, 2b+0x10008",
        "br x17",
        ".endr",
        ".balign 65536",
        ".size __trampoline_allocator_template, 65536",
        ".popsection",
    );
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
compile_error!("trampoline templates exist only for x86_64 and aarch64");

pub use arch::{FUNCADDR_FIRST, PAGE_SIZE, RESERVED_SLOTS, SLOT_SIZE, STATIC_CHAIN_REGISTER};

/// Number of `SLOT_SIZE` strides in one page, reserved slots included.
pub const SLOTS_PER_PAGE: usize = PAGE_SIZE / SLOT_SIZE;

/// Number of usable trampolines in one page pair.
pub const TRAMP_COUNT: usize = SLOTS_PER_PAGE - RESERVED_SLOTS;

/// Number of 32-bit words in a heap page's occupancy bitmap.
pub const BITMAP_WORDS: usize = (TRAMP_COUNT + 31) / 32;

/// Number of two-word entries in one stack allocator log page.
pub const LOG_ENTRIES: usize = PAGE_SIZE / (2 * core::mem::size_of::<usize>());

const_assert!(PAGE_SIZE.is_power_of_two());
const_assert!(PAGE_SIZE % SLOT_SIZE == 0);
// The two data words of a slot must not spill into the next slot's data.
const_assert!(SLOT_SIZE >= 2 * core::mem::size_of::<usize>());
const_assert!(RESERVED_SLOTS < SLOTS_PER_PAGE);
const_assert!(TRAMP_COUNT > 1);

extern "C" {
    static __trampoline_allocator_template: u8;
}

/// Address of the template page inside the running image.
pub fn template_page() -> usize {
    core::ptr::addr_of!(__trampoline_allocator_template) as usize
}

/// Index of the function address within a slot's data words.
pub const fn funcaddr_word() -> usize {
    if FUNCADDR_FIRST {
        0
    } else {
        1
    }
}

/// Index of the chain value within a slot's data words.
pub const fn chain_word() -> usize {
    1 - funcaddr_word()
}
