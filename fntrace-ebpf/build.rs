use which::which;

/// Rebuild the eBPF object whenever the linker changes underneath us.
fn main() {
    let bpf_linker = which("bpf-linker").expect("bpf-linker not found in PATH");
    println!("cargo:rerun-if-changed={}", bpf_linker.display());
}
