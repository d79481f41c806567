use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use goblin::elf::{Elf, Sym};
use log::debug;

use crate::settings::TargetSettings;

/// Resolves a path from a process's namespace to the host filesystem.
/// Handles containerized processes by looking through /proc/<PID>/root.
pub fn resolve_host_path(pid: i32, container_path: &Path) -> PathBuf {
    if container_path.starts_with("/proc") {
        return container_path.to_path_buf();
    }

    // /proc/<PID>/root/<CONTAINER_PATH>
    let mut root_path = PathBuf::from(format!("/proc/{}/root", pid));
    let relative_path = container_path.strip_prefix("/").unwrap_or(container_path);
    root_path.push(relative_path);

    root_path
}

/// Host path of the executable a running process was started from.
pub fn binary_for_pid(pid: u32) -> Result<PathBuf> {
    let process = procfs::process::Process::new(pid as i32)
        .with_context(|| format!("Process {} not found", pid))?;
    let exe = process
        .exe()
        .with_context(|| format!("Failed to read executable of process {}", pid))?;

    let host_path = resolve_host_path(process.pid, &exe);
    if host_path.exists() {
        Ok(host_path)
    } else {
        Ok(exe)
    }
}

/// A function symbol located in an ELF file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSymbol {
    /// Human readable name, hash suffix stripped for Rust symbols.
    pub demangled: String,
    /// Name as stored in the symbol table. Used for attaching.
    pub mangled: String,
    pub address: u64,
}

/// Everything the loader needs to place both probes.
#[derive(Debug, Clone)]
pub struct FunctionTarget {
    pub binary: PathBuf,
    pub symbol: ResolvedSymbol,
    pub pid: Option<i32>,
}

/// Turns target settings into a concrete binary and symbol.
pub fn resolve_target(target: &TargetSettings) -> Result<FunctionTarget> {
    let function = target
        .function
        .as_deref()
        .context("No target function configured")?;

    let binary = match (&target.binary, target.pid) {
        (Some(binary), _) => PathBuf::from(binary),
        (None, Some(pid)) => binary_for_pid(pid)?,
        (None, None) => bail!("Either a target binary or a process id is required"),
    };

    let symbol = resolve_symbol(&binary, function)?;
    debug!(
        "Resolved {} to {} at {:#x} in {}",
        function,
        symbol.mangled,
        symbol.address,
        binary.display()
    );

    Ok(FunctionTarget {
        binary,
        symbol,
        pid: target.pid.map(|p| p as i32),
    })
}

/// Rust symbols lose their `::h<hash>` suffix and crate disambiguators;
/// anything else comes back unchanged.
pub fn demangled_name(raw: &str) -> String {
    format!("{:#}", rustc_demangle::demangle(raw))
}

pub fn resolve_symbol(binary: &Path, function: &str) -> Result<ResolvedSymbol> {
    let data = std::fs::read(binary)
        .with_context(|| format!("Failed to read {}", binary.display()))?;
    let elf = Elf::parse(&data)
        .with_context(|| format!("Failed to parse ELF file {}", binary.display()))?;

    find_symbol(&elf, function).with_context(|| {
        format!(
            "Function '{}' not found in {}",
            function,
            binary.display()
        )
    })
}

fn find_symbol(elf: &Elf, function: &str) -> Option<ResolvedSymbol> {
    let symtab = elf
        .syms
        .iter()
        .filter_map(|sym| elf.strtab.get_at(sym.st_name).map(|name| (sym, name)));
    let dynsym = elf
        .dynsyms
        .iter()
        .filter_map(|sym| elf.dynstrtab.get_at(sym.st_name).map(|name| (sym, name)));

    let candidates: Vec<(Sym, &str)> = symtab
        .chain(dynsym)
        .filter(|(sym, name)| is_defined_function(sym) && !name.is_empty())
        .collect();

    // Exact symbol names win over demangled matches.
    if let Some((sym, name)) = candidates.iter().find(|(_, name)| *name == function) {
        return Some(ResolvedSymbol {
            demangled: demangled_name(name),
            mangled: name.to_string(),
            address: sym.st_value,
        });
    }

    candidates.iter().find_map(|(sym, name)| {
        let demangled = demangled_name(name);
        (demangled == function).then(|| ResolvedSymbol {
            demangled,
            mangled: name.to_string(),
            address: sym.st_value,
        })
    })
}

fn is_defined_function(sym: &Sym) -> bool {
    sym.is_function() && sym.st_value != 0
}
