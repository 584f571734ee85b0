//! NodeFlow: phone-to-desktop media relay
//!
//! A phone connects over WebSocket and streams camera frames and microphone
//! audio to the desktop. The desktop relays every media message to the other
//! connected peers, can start and stop its own webcam, microphone and
//! speaker on request (gated by per-device time-limited grants), and can
//! republish the phone's media as a virtual camera and virtual microphone.
//!
//! # Features
//! - `audio`: microphone capture, speaker playback and virtual cable output via cpal
//! - `webcam`: local webcam capture via nokhwa
//! - `hardware`: both of the above
//!
//! Without hardware features the relay still runs; local devices can be
//! served by [`device::SyntheticDriver`].
//!
//! # Usage
//! ```rust,no_run
//! use nodeflow::{RelayConfig, RelayServer, SystemDriver};
//! use std::sync::Arc;
//!
//! # async fn run() -> nodeflow::RelayResult<()> {
//! let config = RelayConfig::load_or_default();
//! let server = RelayServer::new(config, Arc::new(SystemDriver::default()))?;
//! let listener = server.bind().await?;
//! server
//!     .run(listener, async {
//!         let _ = tokio::signal::ctrl_c().await;
//!     })
//!     .await
//! # }
//! ```
pub mod bridge;
pub mod buffer;
pub mod config;
pub mod device;
pub mod errors;
pub mod media;
pub mod permissions;
pub mod relay;
pub mod server;

#[cfg(feature = "audio")]
pub mod audio;

// Re-exports for convenience
pub use buffer::BoundedBuffer;
pub use config::RelayConfig;
pub use device::{DeviceCommand, DeviceManager, DeviceStatus, DeviceType, SyntheticDriver, SystemDriver};
pub use errors::{RelayError, RelayResult};
pub use media::{MediaFrame, RawFrame};
pub use permissions::PermissionGate;
pub use relay::RelayHub;
pub use server::{AppState, RelayServer};

/// Initialize logging for the relay
pub fn init_logging() {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "nodeflow=info");
    }
    let _ = env_logger::try_init();
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
pub const DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");

/// Get crate information
pub fn get_info() -> CrateInfo {
    CrateInfo {
        name: NAME.to_string(),
        version: VERSION.to_string(),
        description: DESCRIPTION.to_string(),
        audio: cfg!(feature = "audio"),
        webcam: cfg!(feature = "webcam"),
    }
}

/// Crate information structure
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CrateInfo {
    pub name: String,
    pub version: String,
    pub description: String,
    pub audio: bool,
    pub webcam: bool,
}
