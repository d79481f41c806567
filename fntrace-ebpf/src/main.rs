//! Function entry/exit probes.
//!
//! Two programs are exported for attachment to a user-space function:
//! - `trace_enter` (uprobe) records the entry timestamp
//! - `trace_exit` (uretprobe) records the return timestamp
//!
//! Both write one `FunctionEvent` per hit into the `EVENTS` ring buffer.
//! Neither ever fails the traced function: a full buffer drops the record.

#![no_std]
#![no_main]

mod probes;

pub use probes::{trace_enter, trace_exit};

/// GPL is required for `bpf_get_current_comm` and the ring buffer helpers.
#[unsafe(link_section = "license")]
#[unsafe(no_mangle)]
static LICENSE: [u8; 4] = *b"GPL\0";

#[cfg(not(test))]
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    unsafe { core::hint::unreachable_unchecked() }
}
