use core::{mem, ptr};

use aya_ebpf::helpers::{bpf_get_current_comm, bpf_get_current_pid_tgid, bpf_ktime_get_ns};
use fntrace_common::{COMM_LEN, FunctionEvent, ProbeKind};

use crate::probes::maps::EVENTS;

/// Snapshot time and identity of the current task.
///
/// Order matters: the timestamp is taken first so it is as close as
/// possible to the probed instruction.
#[inline(always)]
pub fn capture(kind: ProbeKind) -> FunctionEvent {
    let timestamp = unsafe { bpf_ktime_get_ns() };
    let pid_tgid = bpf_get_current_pid_tgid();
    let comm = bpf_get_current_comm().unwrap_or([0; COMM_LEN]);

    match kind {
        ProbeKind::Entry => FunctionEvent::entry(timestamp, pid_tgid, comm),
        ProbeKind::Exit => FunctionEvent::exit(timestamp, pid_tgid, comm),
    }
}

/// Best-effort send into `EVENTS`.
///
/// Returns `false` when the ring buffer has no room; nothing is written in
/// that case. On success the record becomes visible to the reader in one
/// commit. The reserved slot is cleared first, so the trailing padding
/// never carries old ring buffer contents to user space.
#[inline(always)]
pub fn emit(event: &FunctionEvent) -> bool {
    match EVENTS.reserve::<FunctionEvent>(0) {
        Some(mut slot) => {
            let dst = slot.as_mut_ptr();
            unsafe {
                ptr::write_bytes(dst as *mut u8, 0, mem::size_of::<FunctionEvent>());
                ptr::addr_of_mut!((*dst).timestamp_start).write(event.timestamp_start);
                ptr::addr_of_mut!((*dst).timestamp_end).write(event.timestamp_end);
                ptr::addr_of_mut!((*dst).pid).write(event.pid);
                ptr::addr_of_mut!((*dst).comm).write(event.comm);
            }
            slot.submit(0);
            true
        }
        None => false,
    }
}
