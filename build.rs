use std::env;
use std::process::Command;

// Records the version of the compiler building this crate for the Client-Lang-Version header.
fn main() {
    println!("cargo:rerun-if-env-changed=RUSTC");
    let rustc = env::var("RUSTC").unwrap_or_else(|_| "rustc".to_string());
    let version = Command::new(rustc)
        .arg("--version")
        .output()
        .ok()
        .and_then(|output| String::from_utf8(output.stdout).ok())
        .map(|v| v.trim().trim_start_matches("rustc ").to_string())
        .filter(|v| !v.is_empty());
    if let Some(version) = version {
        println!("cargo:rustc-env=FLAGSYNC_RUSTC_VERSION={}", version);
    }
}
