//! Socket listener the switch hands answered calls to

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rdial_switch_control::{OutboundConfig, OutboundListener, PendingLeg};
use tokio::sync::watch;
use tracing::{error, info, warn};

use super::Fronter;
use crate::error::Result;

/// Accepts one connection per answered call and runs the flow on each in
/// its own task
pub struct FronterServer {
    listener: OutboundListener,
    fronter: Arc<Fronter>,
}

impl FronterServer {
    pub async fn bind(address: &str, config: OutboundConfig, fronter: Arc<Fronter>) -> Result<Self> {
        let listener = OutboundListener::bind(address, config).await?;
        info!("🎧 Fronter listening on {}", listener.local_addr()?);
        Ok(Self { listener, fronter })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept legs until `stop` flips to true. Legs already running finish
    /// on their own.
    pub async fn run(self, mut stop: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok(pending) => self.spawn_leg(pending),
                    Err(e) => {
                        warn!("Accept failed: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
                _ = stop.changed() => break,
            }
        }
        info!("🛑 Fronter listener stopped");
    }

    fn spawn_leg(&self, pending: PendingLeg) {
        let fronter = self.fronter.clone();
        let peer = pending.peer();
        tokio::spawn(async move {
            match pending.establish().await {
                Ok(mut session) => {
                    fronter.handle(&mut session).await;
                }
                Err(e) => error!("Could not take control of leg from {}: {}", peer, e),
            }
        });
    }
}
