//! Loopback bridge: serves one client and reports every requested layout
//! straight back as changed.
//!
//! Run with:
//!   cargo run --example loopback-bridge
//!
//! In another terminal:
//!   cargo run --features cli -- send --runtime-dir <printed dir> \
//!     change-layout 0x1000 7 0x0409 --wait
//!   cargo run --features cli -- send --runtime-dir <printed dir> exit

use std::fs;

use layoutbridge::{Bridge, BridgeConfig, LoopbackHook, Shutdown};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let runtime_dir = std::env::temp_dir().join(format!("layoutbridge-{}", std::process::id()));
    fs::create_dir_all(&runtime_dir)?;

    let config = BridgeConfig {
        runtime_dir: runtime_dir.clone(),
        ..BridgeConfig::default()
    };
    eprintln!("Runtime dir: {}", runtime_dir.display());
    eprintln!("Listening on {}", config.channel_address().display());

    let shutdown = Bridge::builder(config)
        .hook(Box::new(LoopbackHook::new()))
        .run()?;

    match shutdown {
        Shutdown::ExitRequested => eprintln!("Exit requested"),
        Shutdown::ClientLost => eprintln!("Client disconnected without exit"),
        Shutdown::ChannelFailed { code } => eprintln!("Channel failed: {code:#x}"),
    }

    let _ = fs::remove_dir_all(&runtime_dir);
    Ok(())
}
