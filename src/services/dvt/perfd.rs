//! Perfd: fan-out performance sampling over Instruments (component G).
//!
//! Three sub-adapters share one DTX tunnel, each its own channel: `sysmontap` (CPU/memory/disk),
//! `networking` (per-connection traffic), and `graphics.opengl` (GPU/FPS). Each streams records
//! independently and without a fixed cadence relative to the others, so the merge here reads
//! whichever channel has a message ready rather than polling them in a fixed order.

use std::borrow::Cow;

use plist::Value;
use tracing::warn;

use crate::{obf, Idevice, IdeviceError, IdeviceService, ReadWrite};

use super::message::AuxValue;
use super::remote_server::RemoteServerClient;

type DtxSocket = Box<dyn ReadWrite>;

/// Which sub-adapter a [`PerfdRecord`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PerfdSource {
    Sysmontap,
    Networking,
    GraphicsOpengl,
}

/// One sample from any of the three sub-adapters, decoded from its keyed-archive payload into
/// plain JSON for callers that don't want to depend on `plist::Value` directly.
#[derive(Debug, Clone)]
pub struct PerfdRecord {
    pub source: PerfdSource,
    pub value: serde_json::Value,
}

/// Client for the merged sysmontap/networking/graphics.opengl sampling stream.
pub struct PerfdClient {
    client: RemoteServerClient<DtxSocket>,
    sysmontap: u32,
    networking: u32,
    graphics: u32,
}

impl IdeviceService for PerfdClient {
    fn service_name() -> Cow<'static, str> {
        obf!("com.apple.instruments.remoteserver.DVTSecureSocketProxy")
    }

    async fn from_stream(idevice: Idevice) -> Result<Self, IdeviceError> {
        let socket = idevice
            .get_socket()
            .ok_or(IdeviceError::NoEstablishedConnection)?;
        let mut client = RemoteServerClient::new(socket);

        let sysmontap = client
            .make_channel(obf!("com.apple.instruments.server.services.sysmontap"))
            .await?
            .code();
        let networking = client
            .make_channel(obf!("com.apple.instruments.server.services.networking"))
            .await?
            .code();
        let graphics = client
            .make_channel(obf!("com.apple.instruments.server.services.graphics.opengl"))
            .await?
            .code();

        Ok(Self {
            client,
            sysmontap,
            networking,
            graphics,
        })
    }
}

impl PerfdClient {
    /// Starts sampling on all three sub-adapters.
    pub async fn start(&mut self) -> Result<(), IdeviceError> {
        let config = crate::plist!(dict {
            "ur": 1000i64,
            "bm": 0i64,
            "cpuUsage": true,
            "sampleInterval": 1_000_000_000i64,
        });
        self.client
            .call_method(
                self.sysmontap,
                Some(Value::String("setConfig:".to_string())),
                Some(vec![AuxValue::archived_value(config)]),
                false,
            )
            .await?;
        self.client
            .call_method(
                self.sysmontap,
                Some(Value::String("start".to_string())),
                None,
                false,
            )
            .await?;

        self.client
            .call_method(
                self.networking,
                Some(Value::String("startMonitoring".to_string())),
                None,
                false,
            )
            .await?;

        self.client
            .call_method(
                self.graphics,
                Some(Value::String("startSamplingAtTimeInterval:".to_string())),
                Some(vec![AuxValue::U32(0)]),
                false,
            )
            .await?;

        Ok(())
    }

    /// Returns the next record from whichever sub-adapter has one ready.
    pub async fn next_record(&mut self) -> Result<PerfdRecord, IdeviceError> {
        let channels = [self.sysmontap, self.networking, self.graphics];
        let msg = self.client.read_message_from_any(&channels).await?;

        let source = if msg.message_header.channel == self.sysmontap {
            PerfdSource::Sysmontap
        } else if msg.message_header.channel == self.networking {
            PerfdSource::Networking
        } else {
            PerfdSource::GraphicsOpengl
        };

        let value = msg.data.map(plist_to_json).unwrap_or(serde_json::Value::Null);
        Ok(PerfdRecord { source, value })
    }

    /// Stops all three sub-adapters. Errors from individual stop calls are logged rather than
    /// propagated, since a peer that already tore down the tunnel has nothing left to confirm to.
    pub async fn stop(mut self) -> Result<(), IdeviceError> {
        for (channel, selector) in [
            (self.sysmontap, "stop"),
            (self.networking, "stopMonitoring"),
            (self.graphics, "stopSampling"),
        ] {
            if let Err(e) = self
                .client
                .call_method(channel, Some(Value::String(selector.to_string())), None, false)
                .await
            {
                warn!("failed to stop perfd sub-adapter on channel {channel}: {e}");
            }
        }
        Ok(())
    }
}

fn plist_to_json(value: Value) -> serde_json::Value {
    match value {
        Value::String(s) => serde_json::Value::String(s),
        Value::Integer(i) => i
            .as_signed()
            .map(serde_json::Value::from)
            .or_else(|| i.as_unsigned().map(serde_json::Value::from))
            .unwrap_or(serde_json::Value::Null),
        Value::Real(r) => serde_json::Number::from_f64(r)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        Value::Boolean(b) => serde_json::Value::Bool(b),
        Value::Data(d) => {
            let hex: String = d.iter().map(|b| format!("{b:02x}")).collect();
            serde_json::Value::String(hex)
        }
        Value::Array(a) => serde_json::Value::Array(a.into_iter().map(plist_to_json).collect()),
        Value::Dictionary(d) => serde_json::Value::Object(
            d.into_iter().map(|(k, v)| (k, plist_to_json(v))).collect(),
        ),
        Value::Date(d) => serde_json::Value::String(format!("{d:?}")),
        _ => serde_json::Value::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converts_nested_dictionary_to_json() {
        let mut inner = plist::Dictionary::new();
        inner.insert("cpu".into(), Value::Real(12.5));
        inner.insert("pid".into(), Value::Integer(123.into()));
        let value = Value::Dictionary(inner);

        let json = plist_to_json(value);
        assert_eq!(json["cpu"], serde_json::json!(12.5));
        assert_eq!(json["pid"], serde_json::json!(123));
    }
}
