pub mod correlator;
pub mod probes;
pub mod settings;
pub mod telemetry;

use std::time::Duration;

use anyhow::{Context, Result};
use aya::{Ebpf, EbpfLoader};
use aya_log::EbpfLogger;
use fntrace_common::{EVENTS_MAP, FunctionEvent};
use log::{debug, info, warn};
use tokio::{signal, sync::mpsc};

use crate::correlator::{Correlation, Correlator, CorrelatorStats, format_duration};
use crate::probes::{
    Probe, discovery, function::FunctionProbe, request_shutdown, spawn_event_reader,
};
use crate::settings::Settings;

/// How often pending entries are checked against the retention window.
const EVICTION_INTERVAL: Duration = Duration::from_secs(10);

pub struct FnTraceEngine {
    pub settings: Settings,
    bpf: Ebpf,
}

impl FnTraceEngine {
    pub fn new(settings: Settings, bytecode: &[u8]) -> Result<Self> {
        bump_memlock_rlimit()?;
        let mut bpf = load_ebpf(bytecode, settings.ringbuf_bytes())?;
        if let Err(e) = EbpfLogger::init(&mut bpf) {
            warn!("Failed to initialize eBPF logger: {}", e);
        }
        Ok(Self { settings, bpf })
    }

    /// Attaches the probes, reports calls until Ctrl-C, then tears down in
    /// order: event reader, probes, ring buffer.
    pub async fn run(mut self) -> Result<CorrelatorStats> {
        let target = discovery::resolve_target(&self.settings.target)?;
        let function = target.symbol.demangled.clone();

        let mut probe = FunctionProbe::new(target);
        probe.attach(&mut self.bpf)?;

        let (tx, rx) = mpsc::channel(self.settings.channel_capacity());
        let reader = match spawn_event_reader(
            &mut self.bpf,
            self.settings.poll_interval(),
            move |event| {
                if tx.blocking_send(event).is_err() {
                    debug!("Correlator gone; dropping event");
                }
            },
        ) {
            Ok(reader) => reader,
            Err(e) => {
                if let Err(detach_err) = probe.detach(&mut self.bpf) {
                    warn!("{:#}", detach_err);
                }
                return Err(e);
            }
        };
        let correlation = tokio::spawn(correlate(rx, function.clone(), self.settings.retention()));

        info!("Monitoring active. Press Ctrl-C to exit.");
        let interrupted = signal::ctrl_c().await;
        info!("Exiting...");

        request_shutdown();
        reader.await.context("Event reader task failed")?;
        let detached = probe.detach(&mut self.bpf);
        let stats = correlation.await.context("Correlation task failed")?;
        drop(self.bpf);

        interrupted.context("Failed to listen for Ctrl-C")?;
        detached?;

        log_summary(&function, &stats);
        telemetry::shutdown_metrics();
        Ok(stats)
    }
}

/// Loads the eBPF object, sizing the `EVENTS` ring buffer to `ringbuf_bytes`.
pub fn load_ebpf(bytecode: &[u8], ringbuf_bytes: u32) -> Result<Ebpf> {
    EbpfLoader::new()
        .set_max_entries(EVENTS_MAP, ringbuf_bytes)
        .load(bytecode)
        .context("Failed to load eBPF object")
}

async fn correlate(
    mut rx: mpsc::Receiver<FunctionEvent>,
    function: String,
    retention: Duration,
) -> CorrelatorStats {
    let mut correlator = Correlator::new(retention);
    let mut sweep = tokio::time::interval_at(
        tokio::time::Instant::now() + EVICTION_INTERVAL,
        EVICTION_INTERVAL,
    );

    loop {
        tokio::select! {
            event = rx.recv() => {
                let Some(event) = event else { break };
                if let Some(kind) = event.kind() {
                    telemetry::record_function_event(&function, kind.as_str());
                }

                let outcome = correlator.handle(event);
                if let Some(reason) = outcome.unpaired_reason() {
                    debug!("Unpaired record pid={} reason={}", event.pid, reason);
                    telemetry::record_unpaired_event(&function, reason, 1);
                }
                if let Correlation::Call(call) = outcome {
                    info!(
                        "CALL pid={} comm={} fn={} latency={}",
                        call.pid,
                        call.comm,
                        function,
                        format_duration(call.duration_ns)
                    );
                    telemetry::record_function_call(&function, &call.comm, call.duration_ns);
                }
            }
            _ = sweep.tick() => {
                let evicted = correlator.evict_stale(monotonic_now_ns());
                if evicted > 0 {
                    debug!("Evicted {} stale pending entries", evicted);
                    telemetry::record_unpaired_event(&function, "orphaned_entry", evicted as u64);
                }
            }
        }
    }

    correlator.stats()
}

fn log_summary(function: &str, stats: &CorrelatorStats) {
    info!(
        "Summary for {}: calls={} entries={} exits={} orphaned_entries={} unmatched_exits={} invalid={}",
        function,
        stats.calls,
        stats.entries,
        stats.exits,
        stats.orphaned_entries,
        stats.unmatched_exits,
        stats.invalid
    );
}

/// Current CLOCK_MONOTONIC time, the clock `bpf_ktime_get_ns` reads.
fn monotonic_now_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    let ret = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    if ret != 0 {
        return 0;
    }
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

fn bump_memlock_rlimit() -> Result<()> {
    let rlim = libc::rlimit {
        rlim_cur: libc::RLIM_INFINITY,
        rlim_max: libc::RLIM_INFINITY,
    };
    let ret = unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlim) };
    if ret != 0 {
        warn!("Failed to increase rlimit");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use fntrace_common::COMM_LEN;

    fn event(entry: bool, pid: u32, ts: u64) -> FunctionEvent {
        let pid_tgid = (pid as u64) << 32;
        if entry {
            FunctionEvent::entry(ts, pid_tgid, [b'a'; COMM_LEN])
        } else {
            FunctionEvent::exit(ts, pid_tgid, [b'a'; COMM_LEN])
        }
    }

    #[test]
    fn test_monotonic_clock_advances() {
        let a = monotonic_now_ns();
        let b = monotonic_now_ns();
        assert!(a > 0);
        assert!(b >= a);
    }

    #[tokio::test]
    async fn test_correlate_drains_channel_until_closed() {
        let (tx, rx) = mpsc::channel(8);
        let task = tokio::spawn(correlate(rx, "work".to_string(), Duration::from_secs(300)));

        tx.send(event(true, 1, 100)).await.unwrap();
        tx.send(event(false, 1, 250)).await.unwrap();
        tx.send(event(false, 2, 300)).await.unwrap();
        tx.send(event(true, 3, 400)).await.unwrap();
        drop(tx);

        let stats = task.await.unwrap();
        assert_eq!(stats.entries, 2);
        assert_eq!(stats.exits, 2);
        assert_eq!(stats.calls, 1);
        assert_eq!(stats.unmatched_exits, 1);
    }
}
