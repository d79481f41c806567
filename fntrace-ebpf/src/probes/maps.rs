use aya_ebpf::{macros::map, maps::RingBuf};
use fntrace_common::DEFAULT_RINGBUF_BYTES;

/// Transport shared with user space. Resized by the loader before load when
/// a different capacity is configured.
#[map]
pub static EVENTS: RingBuf = RingBuf::with_byte_size(DEFAULT_RINGBUF_BYTES, 0);
