//! # Link with Async Pump
//!
//! Connects a [`ChannelRegistry`] to a [`Transport`]. A writer task drains the
//! registry's outbound envelopes onto the transport in publish order, and a pump
//! task decodes inbound frames and delivers them to the matching channel.
//!
//! Both ends of a boundary run one link each; nothing else touches the transport.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::envelope::Envelope;
use crate::registry::ChannelRegistry;
use crate::transport::Transport;

/// Running pump and writer tasks. Dropping the link stops both.
pub struct Link {
    name: String,
    pump: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Link {
    /// Links `registry` to `transport` and spawns the background tasks.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(
        name: impl Into<String>,
        transport: Arc<dyn Transport>,
        registry: ChannelRegistry,
    ) -> Self {
        let name = name.into();
        let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();
        registry.link(tx);

        let writer_transport = transport.clone();
        let writer_name = name.clone();
        let writer = tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                let bytes = match envelope.encode() {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        tracing::warn!(link = %writer_name, error = %e, "dropping unencodable envelope");
                        continue;
                    }
                };
                if let Err(e) = writer_transport.send(&bytes).await {
                    tracing::warn!(link = %writer_name, error = %e, "transport send failed");
                    break;
                }
            }
        });

        let pump_name = name.clone();
        let pump = tokio::spawn(async move {
            loop {
                match transport.recv().await {
                    Ok(Some(bytes)) => match Envelope::decode(&bytes) {
                        Ok(envelope) => {
                            tracing::trace!(link = %pump_name, channel = %envelope.channel, event = %envelope.event, "inbound");
                            registry.deliver(&envelope);
                        }
                        Err(e) => {
                            tracing::warn!(link = %pump_name, error = %e, "dropping undecodable frame");
                        }
                    },
                    Ok(None) => {
                        tracing::debug!(link = %pump_name, "stream closed");
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(link = %pump_name, error = %e, "transport error in pump");
                        break;
                    }
                }
            }
            registry.unlink();
        });

        Self { name, pump, writer }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.pump.is_finished() && self.writer.is_finished()
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        self.pump.abort();
        self.writer.abort();
    }
}
