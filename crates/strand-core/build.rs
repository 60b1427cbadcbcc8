//! Build script for strand-core
//!
//! This script checks system requirements before compilation:
//! - Minimum Rust version (Edition 2021 = Rust 1.56.0+)
//! - Target platform (only Linux ships a transport)
//!
//! ## Requirements
//!
//! - **Rust**: Edition 2021 (Rust 1.56.0 or newer)
//! - **Linux**: ptrace with `PTRACE_O_TRACECLONE` and `/proc/<pid>/mem`

fn main()
{
    println!("cargo:rerun-if-changed=build.rs");

    // Check minimum Rust version
    // Edition 2021 requires Rust 1.56.0
    match (rustc_version::version(), rustc_version::Version::parse("1.56.0")) {
        (Ok(found), Ok(minimum)) if found < minimum => {
            panic!("strand-core requires Rust {minimum} or newer (Edition 2021), found {found}");
        }
        (Ok(_), Ok(_)) => {}
        // If we can't get version (e.g., in some build environments), just warn
        _ => println!("cargo:warning=could not verify Rust version"),
    }

    // Platform-specific checks
    let target_os = std::env::var("CARGO_CFG_TARGET_OS").unwrap_or_default();
    if target_os != "linux" {
        println!(
            "cargo:warning=strand-core has no native transport for `{target_os}`; sessions need a custom InferiorTransport"
        );
    }
}
