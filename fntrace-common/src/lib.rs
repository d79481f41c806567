#![cfg_attr(not(test), no_std)]

//! Types shared between the fntrace eBPF probes and the user-space loader.
//!
//! Everything here must keep a stable `#[repr(C)]` layout: the kernel writes
//! [`FunctionEvent`] records into the `EVENTS` ring buffer and user space
//! decodes them byte for byte.

use core::mem;

/// Length of the kernel's short task name (`TASK_COMM_LEN`).
pub const COMM_LEN: usize = 16;

/// Name of the ring buffer map both probes write through.
pub const EVENTS_MAP: &str = "EVENTS";

/// Ring buffer capacity compiled into the eBPF object. The loader may
/// override it at load time.
pub const DEFAULT_RINGBUF_BYTES: u32 = 4096;

/// Every ring buffer record carries an 8-byte header in front of its payload.
pub const RINGBUF_RECORD_HEADER: usize = 8;

/// Number of meaningful bytes in a [`FunctionEvent`] record. Anything past
/// this offset is alignment padding.
pub const EVENT_PAYLOAD_LEN: usize = 36;

const OFFSET_START: usize = 0;
const OFFSET_END: usize = 8;
const OFFSET_PID: usize = 16;
const OFFSET_COMM: usize = 20;

/// One entry or exit observation.
///
/// Exactly one of `timestamp_start` / `timestamp_end` is non-zero. The probes
/// never merge the two halves; pairing is left to the consumer, keyed on
/// `pid` and delivery order only.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FunctionEvent {
    /// Monotonic ns at function entry, 0 for exit records.
    pub timestamp_start: u64,
    /// Monotonic ns at function return, 0 for entry records.
    pub timestamp_end: u64,
    /// Process id (tgid) of the calling task.
    pub pid: u32,
    /// Task name, NUL padded.
    pub comm: [u8; COMM_LEN],
}

const _: () = {
    assert!(mem::offset_of!(FunctionEvent, timestamp_start) == OFFSET_START);
    assert!(mem::offset_of!(FunctionEvent, timestamp_end) == OFFSET_END);
    assert!(mem::offset_of!(FunctionEvent, pid) == OFFSET_PID);
    assert!(mem::offset_of!(FunctionEvent, comm) == OFFSET_COMM);
    assert!(mem::size_of::<FunctionEvent>() >= EVENT_PAYLOAD_LEN);
    assert!(mem::size_of::<FunctionEvent>() % mem::align_of::<FunctionEvent>() == 0);
};

impl FunctionEvent {
    /// Builds the record emitted by the entry probe.
    ///
    /// `pid_tgid` is the raw word returned by `bpf_get_current_pid_tgid`;
    /// the process id lives in its upper 32 bits.
    #[inline(always)]
    pub fn entry(timestamp: u64, pid_tgid: u64, comm: [u8; COMM_LEN]) -> Self {
        Self {
            timestamp_start: timestamp,
            timestamp_end: 0,
            pid: pid_from_tgid(pid_tgid),
            comm,
        }
    }

    /// Builds the record emitted by the exit probe.
    #[inline(always)]
    pub fn exit(timestamp: u64, pid_tgid: u64, comm: [u8; COMM_LEN]) -> Self {
        Self {
            timestamp_start: 0,
            timestamp_end: timestamp,
            pid: pid_from_tgid(pid_tgid),
            comm,
        }
    }

    /// Which probe produced this record, or `None` when the record breaks the
    /// one-timestamp rule (both or neither set).
    pub fn kind(&self) -> Option<ProbeKind> {
        match (self.timestamp_start, self.timestamp_end) {
            (0, 0) => None,
            (_, 0) => Some(ProbeKind::Entry),
            (0, _) => Some(ProbeKind::Exit),
            _ => None,
        }
    }

    /// The timestamp carried by this record, whichever half it is.
    pub fn timestamp(&self) -> u64 {
        self.timestamp_start | self.timestamp_end
    }

    /// Decodes a record from ring buffer bytes in host byte order.
    ///
    /// Returns `None` when fewer than [`EVENT_PAYLOAD_LEN`] bytes are
    /// available. Trailing padding is ignored.
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < EVENT_PAYLOAD_LEN {
            return None;
        }

        let mut comm = [0u8; COMM_LEN];
        comm.copy_from_slice(&data[OFFSET_COMM..OFFSET_COMM + COMM_LEN]);

        Some(Self {
            timestamp_start: u64::from_ne_bytes(read_array(data, OFFSET_START)),
            timestamp_end: u64::from_ne_bytes(read_array(data, OFFSET_END)),
            pid: u32::from_ne_bytes(read_array(data, OFFSET_PID)),
            comm,
        })
    }

    /// The task name up to the first NUL. Invalid UTF-8 yields `None`.
    pub fn comm_str(&self) -> Option<&str> {
        let len = self
            .comm
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(COMM_LEN);
        core::str::from_utf8(&self.comm[..len]).ok()
    }
}

#[inline(always)]
fn pid_from_tgid(pid_tgid: u64) -> u32 {
    (pid_tgid >> 32) as u32
}

fn read_array<const N: usize>(data: &[u8], offset: usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&data[offset..offset + N]);
    out
}

/// Bytes one event occupies in the ring buffer: header plus the payload
/// rounded up to 8.
pub const fn ringbuf_record_size() -> usize {
    let payload = mem::size_of::<FunctionEvent>();
    RINGBUF_RECORD_HEADER + (payload + 7) / 8 * 8
}

/// Where in the target function a probe fires.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ProbeKind {
    /// First instruction of the function (uprobe).
    Entry = 0,
    /// Return from the function (uretprobe).
    Exit = 1,
}

impl ProbeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProbeKind::Entry => "entry",
            ProbeKind::Exit => "exit",
        }
    }
}

/// Describes one program in the eBPF object so a loader can attach it
/// without knowing anything else about the object.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProbeRegistration {
    pub kind: ProbeKind,
    /// Program name inside the object file.
    pub program: &'static str,
}

/// Program name of the entry probe.
pub const ENTRY_PROGRAM: &str = "trace_enter";

/// Program name of the exit probe.
pub const EXIT_PROGRAM: &str = "trace_exit";

/// All probes the eBPF object exports, in attach order.
pub const PROBES: [ProbeRegistration; 2] = [
    ProbeRegistration {
        kind: ProbeKind::Entry,
        program: ENTRY_PROGRAM,
    },
    ProbeRegistration {
        kind: ProbeKind::Exit,
        program: EXIT_PROGRAM,
    },
];

#[cfg(feature = "user")]
unsafe impl aya::Pod for FunctionEvent {}
