//! End-to-end checks against a live kernel. They need root (or
//! CAP_BPF + CAP_PERFMON) and the embedded eBPF object, so they are ignored
//! by default: `sudo -E cargo test -p fntrace --test uprobe -- --ignored`.

use aya::{Ebpf, maps::RingBuf};
use fntrace::{
    load_ebpf,
    probes::{
        Probe,
        discovery::{FunctionTarget, resolve_symbol},
        function::FunctionProbe,
    },
};
use fntrace_common::{
    DEFAULT_RINGBUF_BYTES, EVENT_PAYLOAD_LEN, EVENTS_MAP, FunctionEvent, ProbeKind,
    ringbuf_record_size,
};
use serial_test::serial;

const BYTECODE: &[u8] = aya::include_bytes_aligned!(concat!(env!("OUT_DIR"), "/fntrace"));

#[unsafe(no_mangle)]
#[inline(never)]
pub extern "C" fn fntrace_it_target(x: u64) -> u64 {
    std::hint::black_box(x.wrapping_mul(31).wrapping_add(7))
}

fn own_target() -> FunctionTarget {
    let binary = std::env::current_exe().expect("current exe");
    let symbol = resolve_symbol(&binary, "fntrace_it_target").expect("test symbol present");
    FunctionTarget {
        binary,
        symbol,
        pid: Some(std::process::id() as i32),
    }
}

fn load(ringbuf_bytes: u32) -> Ebpf {
    load_ebpf(BYTECODE, ringbuf_bytes).expect("eBPF object loads")
}

fn drain(bpf: &mut Ebpf) -> Vec<FunctionEvent> {
    let mut ring_buf =
        RingBuf::try_from(bpf.take_map(EVENTS_MAP).expect("EVENTS map")).expect("ring buffer");
    let mut events = Vec::new();
    while let Some(item) = ring_buf.next() {
        assert!(item.len() >= std::mem::size_of::<FunctionEvent>(), "torn record");
        events.push(FunctionEvent::from_bytes(&item).expect("decodable record"));
    }
    events
}

fn ours(events: Vec<FunctionEvent>) -> Vec<FunctionEvent> {
    let pid = std::process::id();
    events.into_iter().filter(|e| e.pid == pid).collect()
}

#[test]
#[ignore = "requires root and a BPF-capable kernel"]
#[serial]
fn single_call_emits_entry_then_exit() {
    let mut bpf = load(DEFAULT_RINGBUF_BYTES);
    let mut probe = FunctionProbe::new(own_target());
    probe.attach(&mut bpf).expect("attach");

    assert_eq!(fntrace_it_target(1), 38);

    probe.detach(&mut bpf).expect("detach");
    let events = ours(drain(&mut bpf));

    assert_eq!(events.len(), 2, "{:?}", events);
    assert_eq!(events[0].kind(), Some(ProbeKind::Entry));
    assert_eq!(events[1].kind(), Some(ProbeKind::Exit));
    assert!(events[1].timestamp_end >= events[0].timestamp_start);

    let comm = std::fs::read_to_string("/proc/thread-self/comm").unwrap_or_default();
    let comm = comm.trim_end();
    let expected: String = comm.chars().take(15).collect();
    assert_eq!(events[0].comm_str(), Some(expected.as_str()));
}

#[test]
#[ignore = "requires root and a BPF-capable kernel"]
#[serial]
fn missing_symbol_fails_before_any_probe_fires() {
    let binary = std::env::current_exe().unwrap();
    assert!(resolve_symbol(&binary, "fntrace_it_missing").is_err());

    let mut bpf = load(DEFAULT_RINGBUF_BYTES);
    let mut target = own_target();
    target.symbol.mangled = "fntrace_it_missing".to_string();
    let mut probe = FunctionProbe::new(target);

    assert!(probe.attach(&mut bpf).is_err());
    assert!(!probe.is_attached());

    fntrace_it_target(2);
    assert!(drain(&mut bpf).is_empty());
}

#[test]
#[ignore = "requires root and a BPF-capable kernel"]
#[serial]
fn attach_detach_cycles_without_calls_emit_nothing() {
    let mut bpf = load(DEFAULT_RINGBUF_BYTES);
    let mut probe = FunctionProbe::new(own_target());

    for _ in 0..3 {
        probe.attach(&mut bpf).expect("attach");
        assert!(probe.is_attached());
        probe.detach(&mut bpf).expect("detach");
        assert!(!probe.is_attached());
    }
    probe.detach(&mut bpf).expect("second detach is a no-op");

    assert!(drain(&mut bpf).is_empty());
}

#[test]
#[ignore = "requires root and a BPF-capable kernel"]
#[serial]
fn burst_beyond_capacity_drops_tail_without_tearing() {
    const CALLS: usize = 200;

    let capacity = DEFAULT_RINGBUF_BYTES;
    let mut bpf = load(capacity);
    let mut probe = FunctionProbe::new(own_target());
    probe.attach(&mut bpf).expect("attach");

    for i in 0..CALLS {
        fntrace_it_target(i as u64);
    }

    probe.detach(&mut bpf).expect("detach");
    let events = ours(drain(&mut bpf));

    let fits = capacity as usize / ringbuf_record_size();
    assert!(events.len() <= 2 * CALLS);
    assert!(events.len() <= fits, "{} records exceed capacity {}", events.len(), fits);
    assert!(events.len() >= fits.min(2 * CALLS), "only {} records", events.len());

    // Single thread, so records alternate and time never goes backwards.
    for (i, event) in events.iter().enumerate() {
        let expected = if i % 2 == 0 { ProbeKind::Entry } else { ProbeKind::Exit };
        assert_eq!(event.kind(), Some(expected));
    }
    for pair in events.windows(2) {
        assert!(pair[1].timestamp() >= pair[0].timestamp());
    }
}

#[test]
#[ignore = "requires root and a BPF-capable kernel"]
#[serial]
fn records_carry_no_stale_kernel_bytes() {
    let mut bpf = load(DEFAULT_RINGBUF_BYTES);
    let mut probe = FunctionProbe::new(own_target());
    probe.attach(&mut bpf).expect("attach");

    fntrace_it_target(3);

    probe.detach(&mut bpf).expect("detach");
    let mut ring_buf =
        RingBuf::try_from(bpf.take_map(EVENTS_MAP).expect("EVENTS map")).expect("ring buffer");
    let mut seen = 0;
    while let Some(item) = ring_buf.next() {
        let record = &item[..std::mem::size_of::<FunctionEvent>()];
        assert!(
            record[EVENT_PAYLOAD_LEN..].iter().all(|b| *b == 0),
            "trailing padding not cleared: {:?}",
            &record[EVENT_PAYLOAD_LEN..]
        );
        seen += 1;
    }
    assert_eq!(seen, 2);
}

#[test]
#[ignore = "requires root and a BPF-capable kernel"]
#[serial]
fn larger_ring_buffer_holds_whole_burst() {
    const CALLS: usize = 200;

    let mut bpf = load(64 * 1024);
    let mut probe = FunctionProbe::new(own_target());
    probe.attach(&mut bpf).expect("attach");

    for i in 0..CALLS {
        fntrace_it_target(i as u64);
    }

    probe.detach(&mut bpf).expect("detach");
    assert_eq!(ours(drain(&mut bpf)).len(), 2 * CALLS);
}
