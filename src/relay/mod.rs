//! Connection registry, broadcast hub and message dispatch
//!
//! Submodules:
//! - `protocol`: wire message types
//! - `connection`: one peer and its outbound queue
//! - `registry`: the active set, fan-out and media taps
//! - `forward`: threads moving media between local devices and the hub

mod connection;
mod forward;
pub mod protocol;
mod registry;

pub use connection::{Connection, ConnectionInfo, Delivery};
pub use forward::Forwarders;
pub use registry::{BroadcastReport, MediaTap, Registry, RelayStats};

use std::sync::Arc;

use crate::device::{DeviceCommand, DeviceManager, DeviceType};
use crate::errors::{RelayError, RelayResult};
use crate::permissions::PermissionGate;
use protocol::{DeviceReply, InboundMessage, READY_REPLY, TEST_REPLY};

/// Everything a connection handler needs, shared behind one `Arc`.
pub struct RelayHub {
    pub registry: Arc<Registry>,
    pub gate: Arc<PermissionGate>,
    pub devices: Arc<DeviceManager>,
}

impl RelayHub {
    pub fn new(registry: Arc<Registry>, gate: Arc<PermissionGate>, devices: Arc<DeviceManager>) -> Self {
        Self {
            registry,
            gate,
            devices,
        }
    }

    /// Handle one text frame from `conn`.
    ///
    /// Errors are local to this message; the caller logs them and keeps
    /// reading.
    pub async fn dispatch_inbound(&self, conn: &Arc<Connection>, text: &str) -> RelayResult<()> {
        conn.touch();
        let message = InboundMessage::parse(text)?;

        match message {
            InboundMessage::Hello { client } => {
                log::info!(
                    "Hello from {} ({})",
                    conn.remote(),
                    client.as_deref().unwrap_or("unnamed")
                );
                conn.set_client(client);
                conn.send(READY_REPLY)
            }
            InboundMessage::Test => conn.send(TEST_REPLY),
            InboundMessage::Video | InboundMessage::Audio => {
                let report = self.registry.publish_media(Arc::from(text), Some(conn.remote()));
                log::trace!(
                    "Relayed {} bytes from {} to {} peer(s)",
                    text.len(),
                    conn.remote(),
                    report.delivered
                );
                Ok(())
            }
            InboundMessage::Device { command, device } => {
                let reply = match self.device_command(&command, &device).await {
                    Ok(message) => DeviceReply::success(message),
                    Err(e) => {
                        log::warn!("Device command {} {} failed: {}", command, device, e);
                        DeviceReply::from_error(&e)
                    }
                };
                conn.send(reply.to_wire()?)
            }
        }
    }

    /// Authorize and run a device command off the event loop.
    ///
    /// Returns the success message. Bad input is `MalformedMessage`,
    /// a missing grant is `PermissionDenied`, a hardware failure is
    /// `DeviceStart`/`DeviceStop`.
    pub async fn device_command(&self, command: &str, device: &str) -> RelayResult<String> {
        let (command, device) = self.gate.authorize(command, device)?;
        let devices = self.devices.clone();
        tokio::task::spawn_blocking(move || run_device_command(&devices, command, device))
            .await
            .map_err(|e| RelayError::DeviceStart(format!("device task failed: {}", e)))?
    }
}

fn run_device_command(devices: &DeviceManager, command: DeviceCommand, device: DeviceType) -> RelayResult<String> {
    match command {
        DeviceCommand::Start => {
            devices.start(device)?;
            Ok(format!("{} started", device))
        }
        DeviceCommand::Stop => {
            devices.stop(device)?;
            Ok(format!("{} stopped", device))
        }
    }
}
