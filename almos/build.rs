//! Build script for the kernel executable.
//!
//! Responsible for setting the linker script and emitting the `VERGEN_*` build-identity
//! variables `logging` reports at boot.

fn main() {
    println!("cargo:rustc-link-arg=-T./link.ld");

    vergen::Emitter::default()
        .add_instructions(&vergen::BuildBuilder::all_build().unwrap())
        .unwrap()
        .add_instructions(&vergen_git2::Git2Builder::all_git().unwrap())
        .unwrap()
        .emit()
        .unwrap();
}
