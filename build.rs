//! Passes `linker.ld` to the linker. Mirrors the teacher's
//! `crates/kernel/build.rs`, which does the same for its own
//! per-architecture linker script; this crate only ever targets one
//! architecture, so there is a single script instead of one per
//! `CARGO_CFG_TARGET_ARCH`.
//!
//! Only applied when actually targeting the freestanding kernel
//! (`i686-kernel.json`, `target_os = "none"`): `cargo test`/`cargo
//! check` without an explicit `--target` build against the host
//! instead, and linking a normal host test binary against a kernel's
//! higher-half linker script would fail outright.

fn main() {
    println!("cargo:rerun-if-changed=linker.ld");
    if std::env::var("CARGO_CFG_TARGET_OS").as_deref() == Ok("none") {
        println!("cargo:rustc-link-arg=-Tlinker.ld");
    }
}
