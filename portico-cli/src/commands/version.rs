//! Version subcommand implementation

use portico::protocol::constants::PROTOCOL_VERSION;

pub fn run() {
    println!("portico {}", env!("CARGO_PKG_VERSION"));
    println!("protocol version {PROTOCOL_VERSION}");

    #[cfg(target_os = "linux")]
    println!("target: linux");
    #[cfg(target_os = "macos")]
    println!("target: macos");
    #[cfg(target_os = "windows")]
    println!("target: windows");
    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
    println!("target: unknown");
}
