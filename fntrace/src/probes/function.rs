//! Entry/exit probe pair on a single user-space function.

use anyhow::Result;
use aya::{Ebpf, programs::uprobe::UProbeLinkId};
use fntrace_common::{PROBES, ProbeRegistration};
use log::{info, warn};

use crate::probes::{Probe, attach_uprobe, detach_uprobe, discovery::FunctionTarget};
use crate::telemetry;

pub struct FunctionProbe {
    target: FunctionTarget,
    links: Vec<(ProbeRegistration, UProbeLinkId)>,
}

impl FunctionProbe {
    pub fn new(target: FunctionTarget) -> Self {
        Self {
            target,
            links: Vec::with_capacity(PROBES.len()),
        }
    }

    pub fn is_attached(&self) -> bool {
        !self.links.is_empty()
    }

    fn attach_all(&mut self, bpf: &mut Ebpf) -> Result<()> {
        for registration in PROBES {
            let link = attach_uprobe(
                bpf,
                registration.program,
                &self.target.binary,
                &self.target.symbol.mangled,
                self.target.pid,
            )?;
            info!(
                "  Attached {} probe {} to {}",
                registration.kind.as_str(),
                registration.program,
                self.target.symbol.demangled
            );
            self.links.push((registration, link));
        }
        Ok(())
    }
}

impl Probe for FunctionProbe {
    fn attach(&mut self, bpf: &mut Ebpf) -> Result<()> {
        if self.is_attached() {
            return Ok(());
        }

        info!(
            "Attaching function probes to {} in {}",
            self.target.symbol.demangled,
            self.target.binary.display()
        );

        // An entry probe without its exit half would only produce orphans.
        if let Err(e) = self.attach_all(bpf) {
            if let Err(detach_err) = self.detach(bpf) {
                warn!("Failed to roll back partial attach: {:#}", detach_err);
            }
            return Err(e);
        }

        telemetry::record_active_probe(&self.target.symbol.demangled, self.links.len() as u64);
        Ok(())
    }

    fn detach(&mut self, bpf: &mut Ebpf) -> Result<()> {
        if self.links.is_empty() {
            return Ok(());
        }

        let mut first_err = None;
        for (registration, link) in self.links.drain(..) {
            match detach_uprobe(bpf, registration.program, link) {
                Ok(()) => info!("  Detached {} probe {}", registration.kind.as_str(), registration.program),
                Err(e) => {
                    warn!("{:#}", e);
                    first_err.get_or_insert(e);
                }
            }
        }

        telemetry::record_active_probe(&self.target.symbol.demangled, 0);
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
