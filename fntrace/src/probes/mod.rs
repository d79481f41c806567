use std::{
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use anyhow::{Context, Result};
use aya::{
    Ebpf,
    maps::RingBuf,
    programs::{UProbe, uprobe::UProbeLinkId},
};
use fntrace_common::{EVENTS_MAP, FunctionEvent};
use log::{debug, info, warn};
use tokio::task::JoinHandle;

static SHUTDOWN: once_cell::sync::Lazy<Arc<AtomicBool>> =
    once_cell::sync::Lazy::new(|| Arc::new(AtomicBool::new(false)));

pub fn shutdown_flag() -> Arc<AtomicBool> {
    SHUTDOWN.clone()
}

pub fn request_shutdown() {
    SHUTDOWN.store(true, Ordering::Relaxed);
}

pub mod discovery;
pub mod function;

pub trait Probe {
    fn attach(&mut self, bpf: &mut Ebpf) -> Result<()>;
    fn detach(&mut self, bpf: &mut Ebpf) -> Result<()>;
}

pub const POLL_INTERVAL_MS: u64 = 10;

/// Attach a uprobe or uretprobe to a function
pub fn attach_uprobe(
    bpf: &mut Ebpf,
    program_name: &str,
    target: &Path,
    symbol: &str,
    pid: Option<i32>,
) -> Result<UProbeLinkId> {
    let program: &mut UProbe = bpf
        .program_mut(program_name)
        .with_context(|| format!("Failed to find program: {}", program_name))?
        .try_into()
        .with_context(|| format!("Program {} is not a UProbe", program_name))?;

    // Programs stay loaded across detach/attach cycles.
    if program.fd().is_err() {
        info!("Loading program {}", program_name);
        program
            .load()
            .with_context(|| format!("Failed to load program {}", program_name))?;
    }

    program
        .attach(Some(symbol), 0, target, pid)
        .with_context(|| {
            format!(
                "Failed to attach {} to {}:{}",
                program_name,
                target.display(),
                symbol
            )
        })
}

pub fn detach_uprobe(bpf: &mut Ebpf, program_name: &str, link_id: UProbeLinkId) -> Result<()> {
    let program: &mut UProbe = bpf
        .program_mut(program_name)
        .with_context(|| format!("Failed to find program: {}", program_name))?
        .try_into()
        .with_context(|| format!("Program {} is not a UProbe", program_name))?;

    program
        .detach(link_id)
        .with_context(|| format!("Failed to detach {}", program_name))
}

/// Drains the `EVENTS` ring buffer on a blocking thread until shutdown is
/// requested, handing every decoded record to `handler`. Whatever is still
/// queued when the flag flips is drained before the task returns.
pub fn spawn_event_reader<F>(
    bpf: &mut Ebpf,
    poll_interval: Duration,
    mut handler: F,
) -> Result<JoinHandle<()>>
where
    F: FnMut(FunctionEvent) + Send + 'static,
{
    let mut ring_buf = RingBuf::try_from(
        bpf.take_map(EVENTS_MAP)
            .with_context(|| format!("Failed to get {} map", EVENTS_MAP))?,
    )?;
    let shutdown = shutdown_flag();

    let handle = tokio::task::spawn_blocking(move || {
        loop {
            let stopping = shutdown.load(Ordering::Relaxed);
            let mut has_work = false;
            while let Some(item) = ring_buf.next() {
                has_work = true;
                match FunctionEvent::from_bytes(&item) {
                    Some(event) => handler(event),
                    None => warn!("Skipping malformed ring buffer item ({} bytes)", item.len()),
                }
            }
            if stopping {
                debug!("Event reader stopped");
                break;
            }
            if !has_work {
                std::thread::sleep(poll_interval);
            }
        }
    });
    Ok(handle)
}
