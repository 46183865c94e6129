//! Message-bus subscriber shim.
//!
//! Devices publish state updates through an external bus; this crate
//! decodes the envelope just enough to know whether the payload is sane,
//! then hands the device id to the VM. Everything transport-specific stays
//! behind the [`BusSubscriber`] trait.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use rulevm_engine::Vm;

/// Attributes carried alongside every bus message.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EnvelopeAttributes {
    /// Fleet-wide device identifier; the only attribute the VM consumes.
    #[serde(rename = "deviceId", default)]
    pub device_id: String,
    /// Numeric registry id, unused here but preserved for logging.
    #[serde(rename = "deviceNumId", default)]
    pub device_num_id: String,
}

/// One message off the bus: opaque JSON payload plus routing attributes.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub data: Vec<u8>,
    pub attributes: EnvelopeAttributes,
}

impl Envelope {
    pub fn new(data: impl Into<Vec<u8>>, device_id: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            attributes: EnvelopeAttributes {
                device_id: device_id.into(),
                device_num_id: String::new(),
            },
        }
    }
}

/// What the transport should do with the message after dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Dispatched; acknowledge the message.
    Ack,
    /// Undecodable payload; leave it unacknowledged.
    Nack,
}

/// Decode an envelope and trigger the rules that depend on its device.
///
/// The payload is only parsed to catch malformed messages; its contents are
/// not consumed. Rules read the freshest state from the store instead.
/// Suspends while the VM's ready queue is full, which backpressures the
/// transport.
pub async fn dispatch(vm: &Vm, envelope: &Envelope) -> Disposition {
    let device_id = envelope.attributes.device_id.as_str();

    let raw = match std::str::from_utf8(&envelope.data) {
        Ok(raw) => raw,
        Err(e) => {
            tracing::error!(device_id, "Bus message is not UTF-8: {}", e);
            return Disposition::Nack;
        }
    };
    tracing::debug!(device_id, raw, "Raw message from device");

    if let Err(e) = serde_json::from_str::<serde_json::Value>(raw) {
        tracing::error!(device_id, "Unable to decode JSON message: {}", e);
        return Disposition::Nack;
    }

    vm.execute_all_dependent_rules(device_id).await;
    Disposition::Ack
}

/// Transport seam: an implementation pulls messages off the real bus and
/// feeds them through [`dispatch`], honoring the returned disposition.
#[async_trait]
pub trait BusSubscriber: Send + Sync {
    /// Block on the subscription, dispatching into `vm` until the
    /// transport shuts down.
    async fn run(&self, vm: Arc<Vm>) -> anyhow::Result<()>;
}
