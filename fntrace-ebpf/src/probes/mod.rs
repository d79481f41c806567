//! Probe programs attached by the loader through `fntrace_common::PROBES`.

use aya_ebpf::{
    macros::{uprobe, uretprobe},
    programs::{ProbeContext, RetProbeContext},
};
use aya_log_ebpf::debug;
use fntrace_common::ProbeKind;

mod helpers;
pub mod maps;

use helpers::{capture, emit};

/// Entry probe. Arguments of the traced function are not read.
#[uprobe]
pub fn trace_enter(ctx: ProbeContext) -> u32 {
    let event = capture(ProbeKind::Entry);
    debug!(&ctx, "trace_enter pid={}", event.pid);
    let _ = emit(&event);
    0
}

/// Exit probe. The return value of the traced function is not read.
#[uretprobe]
pub fn trace_exit(ctx: RetProbeContext) -> u32 {
    let event = capture(ProbeKind::Exit);
    debug!(&ctx, "trace_exit pid={}", event.pid);
    let _ = emit(&event);
    0
}
