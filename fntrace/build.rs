use std::{
    env, fs,
    path::{Path, PathBuf},
    process::{Command, Stdio},
};

use anyhow::{Context, Result, bail};

/// Name of the eBPF binary in `fntrace-ebpf`, also the file name under `OUT_DIR`.
const EBPF_BIN: &str = "fntrace";

fn main() -> Result<()> {
    let out_dir = PathBuf::from(env::var_os("OUT_DIR").context("OUT_DIR is not set")?);
    let manifest_dir = PathBuf::from(
        env::var_os("CARGO_MANIFEST_DIR").context("CARGO_MANIFEST_DIR is not set")?,
    );
    let out_file = out_dir.join(EBPF_BIN);

    println!("cargo:rerun-if-env-changed=FNTRACE_EBPF_OBJECT");
    if let Some(prebuilt) = env::var_os("FNTRACE_EBPF_OBJECT") {
        let prebuilt = PathBuf::from(prebuilt);
        println!("cargo:rerun-if-changed={}", prebuilt.display());
        fs::copy(&prebuilt, &out_file)
            .with_context(|| format!("Failed to copy prebuilt object {}", prebuilt.display()))?;
        return Ok(());
    }

    let workspace_dir = manifest_dir
        .parent()
        .context("fntrace crate has no parent directory")?;
    let ebpf_dir = workspace_dir.join("fntrace-ebpf");
    for watched in [
        ebpf_dir.join("src"),
        ebpf_dir.join("Cargo.toml"),
        workspace_dir.join("fntrace-common/src"),
    ] {
        println!("cargo:rerun-if-changed={}", watched.display());
    }

    let bpf_target = bpf_target()?;
    // Own target dir so the nested cargo does not wait on the outer build lock.
    let ebpf_target_dir = out_dir.join("ebpf-target");

    build_ebpf(&ebpf_dir, bpf_target, &ebpf_target_dir)?;

    let object = ebpf_target_dir
        .join(bpf_target)
        .join("release")
        .join(EBPF_BIN);
    fs::copy(&object, &out_file)
        .with_context(|| format!("Failed to copy eBPF object {}", object.display()))?;

    Ok(())
}

/// BPF byte order follows the host we are compiling for.
fn bpf_target() -> Result<&'static str> {
    let endian = env::var("CARGO_CFG_TARGET_ENDIAN").context("CARGO_CFG_TARGET_ENDIAN is not set")?;
    match endian.as_str() {
        "little" => Ok("bpfel-unknown-none"),
        "big" => Ok("bpfeb-unknown-none"),
        other => bail!("Unsupported target endianness '{}'", other),
    }
}

fn build_ebpf(ebpf_dir: &Path, bpf_target: &str, target_dir: &Path) -> Result<()> {
    let cargo = env::var_os("CARGO").unwrap_or_else(|| "cargo".into());

    let status = Command::new(cargo)
        .current_dir(ebpf_dir)
        .env("RUSTUP_TOOLCHAIN", "nightly")
        .env_remove("RUSTC")
        .env_remove("RUSTC_WORKSPACE_WRAPPER")
        .env_remove("CARGO_ENCODED_RUSTFLAGS")
        .args(["build", "--release", "-Z", "build-std=core", "--bin", EBPF_BIN])
        .arg("--target")
        .arg(bpf_target)
        .arg("--target-dir")
        .arg(target_dir)
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .status()
        .context("Failed to run cargo for the eBPF crate")?;

    if !status.success() {
        bail!("eBPF build for {} failed with {}", bpf_target, status);
    }
    Ok(())
}
