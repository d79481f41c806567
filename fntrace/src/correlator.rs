//! Pairs entry and exit records into function calls.
//!
//! Records carry no call id, so pairing is keyed on pid and delivery order:
//! at most one entry waits per process. Recursive or concurrent calls inside
//! one process can therefore be mis-paired.

use std::{collections::HashMap, time::Duration};

use fntrace_common::{FunctionEvent, ProbeKind};

/// One completed invocation of the traced function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionCall {
    pub pid: u32,
    pub comm: String,
    pub start_ns: u64,
    pub end_ns: u64,
    pub duration_ns: u64,
}

/// What happened to a single record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Correlation {
    /// Entry stored, waiting for its exit.
    Pending,
    /// Entry stored, displacing an older entry of the same pid.
    Replaced,
    Call(FunctionCall),
    UnmatchedExit,
    Invalid,
}

impl Correlation {
    /// Label used for the `unpaired_events` metric, if any.
    pub fn unpaired_reason(&self) -> Option<&'static str> {
        match self {
            Correlation::Replaced => Some("orphaned_entry"),
            Correlation::UnmatchedExit => Some("unmatched_exit"),
            Correlation::Invalid => Some("invalid"),
            Correlation::Pending | Correlation::Call(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CorrelatorStats {
    pub entries: u64,
    pub exits: u64,
    pub calls: u64,
    pub orphaned_entries: u64,
    pub unmatched_exits: u64,
    pub invalid: u64,
}

pub struct Correlator {
    pending: HashMap<u32, FunctionEvent>,
    retention_ns: u64,
    stats: CorrelatorStats,
}

impl Correlator {
    pub fn new(retention: Duration) -> Self {
        Self {
            pending: HashMap::new(),
            retention_ns: retention.as_nanos().min(u64::MAX as u128) as u64,
            stats: CorrelatorStats::default(),
        }
    }

    pub fn handle(&mut self, event: FunctionEvent) -> Correlation {
        match event.kind() {
            None => {
                self.stats.invalid += 1;
                Correlation::Invalid
            }
            Some(ProbeKind::Entry) => {
                self.stats.entries += 1;
                if self.pending.insert(event.pid, event).is_some() {
                    self.stats.orphaned_entries += 1;
                    Correlation::Replaced
                } else {
                    Correlation::Pending
                }
            }
            Some(ProbeKind::Exit) => {
                self.stats.exits += 1;
                // An entry newer than this exit belongs to a call still in flight.
                let entry = match self.pending.get(&event.pid) {
                    Some(entry) if entry.timestamp_start <= event.timestamp_end => *entry,
                    _ => {
                        self.stats.unmatched_exits += 1;
                        return Correlation::UnmatchedExit;
                    }
                };
                self.pending.remove(&event.pid);
                self.stats.calls += 1;
                Correlation::Call(FunctionCall {
                    pid: event.pid,
                    comm: comm_string(&entry),
                    start_ns: entry.timestamp_start,
                    end_ns: event.timestamp_end,
                    duration_ns: event.timestamp_end - entry.timestamp_start,
                })
            }
        }
    }

    /// Drops pending entries older than the retention window relative to
    /// `now_ns` on the event clock. Returns how many were dropped.
    pub fn evict_stale(&mut self, now_ns: u64) -> usize {
        let retention_ns = self.retention_ns;
        let before = self.pending.len();
        self.pending
            .retain(|_, entry| now_ns.saturating_sub(entry.timestamp_start) <= retention_ns);
        let evicted = before - self.pending.len();
        self.stats.orphaned_entries += evicted as u64;
        evicted
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn stats(&self) -> CorrelatorStats {
        self.stats
    }
}

fn comm_string(event: &FunctionEvent) -> String {
    event.comm_str().unwrap_or("<invalid>").to_string()
}

pub fn format_duration(ns: u64) -> String {
    if ns >= 1_000_000_000 {
        format!("{:.2}s", ns as f64 / 1_000_000_000.0)
    } else if ns >= 1_000_000 {
        format!("{:.2}ms", ns as f64 / 1_000_000.0)
    } else if ns >= 1_000 {
        format!("{:.2}µs", ns as f64 / 1_000.0)
    } else {
        format!("{}ns", ns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fntrace_common::COMM_LEN;

    fn comm(name: &[u8]) -> [u8; COMM_LEN] {
        let mut out = [0u8; COMM_LEN];
        out[..name.len()].copy_from_slice(name);
        out
    }

    fn entry(pid: u32, ts: u64) -> FunctionEvent {
        FunctionEvent::entry(ts, (pid as u64) << 32, comm(b"app"))
    }

    fn exit(pid: u32, ts: u64) -> FunctionEvent {
        FunctionEvent::exit(ts, (pid as u64) << 32, comm(b"app"))
    }

    fn correlator() -> Correlator {
        Correlator::new(Duration::from_secs(300))
    }

    #[test]
    fn test_entry_then_exit_yields_call() {
        let mut c = correlator();
        assert_eq!(c.handle(entry(10, 1_000)), Correlation::Pending);

        let Correlation::Call(call) = c.handle(exit(10, 4_500)) else {
            panic!("expected a call");
        };
        assert_eq!(call.pid, 10);
        assert_eq!(call.comm, "app");
        assert_eq!(call.start_ns, 1_000);
        assert_eq!(call.end_ns, 4_500);
        assert_eq!(call.duration_ns, 3_500);
        assert_eq!(c.pending(), 0);

        let stats = c.stats();
        assert_eq!((stats.entries, stats.exits, stats.calls), (1, 1, 1));
    }

    #[test]
    fn test_pids_are_paired_independently() {
        let mut c = correlator();
        c.handle(entry(1, 100));
        c.handle(entry(2, 150));

        let Correlation::Call(second) = c.handle(exit(2, 400)) else {
            panic!("expected a call for pid 2");
        };
        assert_eq!(second.duration_ns, 250);

        let Correlation::Call(first) = c.handle(exit(1, 500)) else {
            panic!("expected a call for pid 1");
        };
        assert_eq!(first.duration_ns, 400);
    }

    #[test]
    fn test_second_entry_replaces_first() {
        let mut c = correlator();
        c.handle(entry(7, 100));
        assert_eq!(c.handle(entry(7, 200)), Correlation::Replaced);

        let Correlation::Call(call) = c.handle(exit(7, 260)) else {
            panic!("expected a call");
        };
        assert_eq!(call.start_ns, 200);
        assert_eq!(c.stats().orphaned_entries, 1);
    }

    #[test]
    fn test_exit_without_entry_is_unmatched() {
        let mut c = correlator();
        assert_eq!(c.handle(exit(3, 100)), Correlation::UnmatchedExit);
        assert_eq!(c.stats().unmatched_exits, 1);
        assert_eq!(c.stats().calls, 0);
    }

    #[test]
    fn test_exit_older_than_entry_is_not_paired() {
        let mut c = correlator();
        c.handle(entry(3, 500));
        assert_eq!(c.handle(exit(3, 400)), Correlation::UnmatchedExit);
        assert_eq!(c.pending(), 1);

        assert!(matches!(c.handle(exit(3, 600)), Correlation::Call(_)));
    }

    #[test]
    fn test_invalid_records_are_counted_and_skipped() {
        let mut c = correlator();
        let mut merged = entry(5, 100);
        merged.timestamp_end = 200;

        assert_eq!(c.handle(merged), Correlation::Invalid);
        assert_eq!(Correlation::Invalid.unpaired_reason(), Some("invalid"));
        assert_eq!(c.stats().invalid, 1);
        assert_eq!(c.stats().entries, 0);
        assert_eq!(c.pending(), 0);
    }

    #[test]
    fn test_evict_stale_entries() {
        let mut c = Correlator::new(Duration::from_nanos(1_000));
        c.handle(entry(1, 100));
        c.handle(entry(2, 900));

        assert_eq!(c.evict_stale(1_500), 1);
        assert_eq!(c.pending(), 1);
        assert_eq!(c.stats().orphaned_entries, 1);

        assert!(matches!(c.handle(exit(2, 1_600)), Correlation::Call(_)));
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(999), "999ns");
        assert_eq!(format_duration(1_500), "1.50µs");
        assert_eq!(format_duration(2_000_000), "2.00ms");
        assert_eq!(format_duration(3_250_000_000), "3.25s");
    }
}
