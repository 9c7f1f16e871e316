use std::env;
use std::fs;
use std::path::PathBuf;

fn main() {
    let out_dir = PathBuf::from(env::var("OUT_DIR").expect("No out dir"));
    println!("cargo:rerun-if-changed=build.rs");

    // host builds are only used for testing and link like any other program
    if env::var("CARGO_CFG_TARGET_OS").as_deref() != Ok("none") {
        return;
    }

    // Put the linker scripts somewhere the linker can find them
    println!("cargo:rustc-link-search={}", out_dir.display());
    for entry in fs::read_dir("link").expect("No link directory") {
        let entry = entry.expect("Could not read link directory");
        println!("cargo:rerun-if-changed={}", entry.path().display());
        fs::copy(entry.path(), out_dir.join(entry.file_name())).expect("Could not copy linker script");
    }

    // set "-C link-arg=-Tlink.ld" argument when linking to use the custom linker script
    println!("cargo:rustc-link-arg-bins=-Tlink.ld");
}
