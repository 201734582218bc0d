//! iOS WebInspector service client.
//!
//! WebInspector exposes the same Web Inspector Remote (WIR) protocol Safari's inspector windows
//! speak to a page's JavaScript context. Messages are plain plist dictionaries with a
//! `__selector`/`__argument` shape; on older devices and the Simulator a single logical message
//! is additionally split across several packets, each wrapped in a `WIRPartialMessageKey` or
//! `WIRFinalMessageKey` envelope, because the device-side XML parser choked on giant single
//! packets. `MaxPlistLen` (7586) is the split threshold libimobiledevice settled on; its exact
//! provenance is lost to history (see REDESIGN FLAGS).

use std::borrow::Cow;
use std::time::Duration;

use plist::{Dictionary, Value};
use tracing::{debug, warn};

use crate::{obf, Idevice, IdeviceError, IdeviceService};

/// Plist key carrying a non-final chunk of a split message.
pub const WIR_PARTIAL_MESSAGE_KEY: &str = "WIRPartialMessageKey";
/// Plist key carrying the last chunk of a split message (or the whole message, if unsplit).
pub const WIR_FINAL_MESSAGE_KEY: &str = "WIRFinalMessageKey";

/// How long a single partial-frame read may take before giving up. Chosen to match real device
/// behavior: a stalled WebInspector stream should fail fast rather than hang the caller.
const PARTIAL_READ_TIMEOUT: Duration = Duration::from_secs(1);

/// Client for the `com.apple.webinspector` service.
pub struct WebInspectorClient {
    pub idevice: Idevice,
    max_plist_len: usize,
    /// Whether this peer speaks the split-message dialect. Defaults to true, matching the
    /// Simulator and real devices before iOS 11, which is the common case; callers targeting a
    /// peer that sends whole messages in one packet opt out via
    /// [`set_partials_supported`](Self::set_partials_supported).
    partials_supported: bool,
    msg_buffer: Vec<String>,
}

impl IdeviceService for WebInspectorClient {
    fn service_name() -> Cow<'static, str> {
        obf!("com.apple.webinspector")
    }

    async fn from_stream(idevice: Idevice) -> Result<Self, IdeviceError> {
        Ok(Self::new(idevice))
    }
}

impl WebInspectorClient {
    pub fn new(idevice: Idevice) -> Self {
        Self {
            idevice,
            max_plist_len: 7586,
            partials_supported: true,
            msg_buffer: Vec::new(),
        }
    }

    /// Enables the split-message dialect. Callers should set this based on the device's reported
    /// OS version (real devices, iOS < 11) or target type (Simulator), since there's no way to
    /// detect it from the wire.
    pub fn set_partials_supported(&mut self, supported: bool) {
        self.partials_supported = supported;
    }

    /// Overrides the split threshold. Defaults to 7586, the value used throughout
    /// libimobiledevice-derived clients.
    pub fn set_max_plist_len(&mut self, max_plist_len: usize) {
        self.max_plist_len = max_plist_len;
    }

    /// Sends a `__selector`/`__argument` WebKit Remote message, splitting it across several
    /// partial packets if the peer requires it.
    pub async fn send_message(
        &mut self,
        selector: impl Into<String>,
        argument: Value,
    ) -> Result<(), IdeviceError> {
        let mut req = Dictionary::new();
        req.insert("__selector".into(), Value::String(selector.into()));
        req.insert("__argument".into(), argument);
        let message = Value::Dictionary(req);

        if !self.partials_supported {
            self.idevice.send_plist(message).await?;
            return Ok(());
        }

        let raw = crate::util::plist_to_bytes(
            message
                .as_dictionary()
                .expect("message was just constructed as a dictionary"),
        );

        let mut offset = 0;
        while offset < raw.len() {
            let end = (offset + self.max_plist_len).min(raw.len());
            let is_partial = end < raw.len();
            let chunk = String::from_utf8_lossy(&raw[offset..end]).into_owned();

            let mut wrapper = Dictionary::new();
            if is_partial {
                wrapper.insert(WIR_PARTIAL_MESSAGE_KEY.into(), Value::String(chunk));
            } else {
                wrapper.insert(WIR_FINAL_MESSAGE_KEY.into(), Value::String(chunk));
            }
            self.idevice.send_plist(Value::Dictionary(wrapper)).await?;

            offset = end;
        }

        Ok(())
    }

    /// Reads the next complete message, reassembling split partials as needed.
    pub async fn receive_message(&mut self) -> Result<Value, IdeviceError> {
        if !self.partials_supported {
            return self.idevice.read_plist_value().await;
        }

        loop {
            let reply = tokio::time::timeout(PARTIAL_READ_TIMEOUT, self.idevice.read_plist_value())
                .await
                .map_err(|_| IdeviceError::UnexpectedResponse)??;

            let dict = reply
                .as_dictionary()
                .ok_or(IdeviceError::UnexpectedResponse)?;

            if let Some(Value::String(final_chunk)) = dict.get(WIR_FINAL_MESSAGE_KEY) {
                if final_chunk.is_empty() && self.msg_buffer.is_empty() {
                    debug!("empty WebInspector final chunk with nothing buffered");
                }
                let mut joined = self.msg_buffer.join("");
                joined.push_str(final_chunk);
                self.msg_buffer.clear();

                return plist::from_bytes(joined.as_bytes()).map_err(IdeviceError::Plist);
            }

            if let Some(Value::String(partial)) = dict.get(WIR_PARTIAL_MESSAGE_KEY) {
                self.msg_buffer.push(partial.clone());
                continue;
            }

            warn!("WebInspector packet had neither partial nor final key");
            return Err(IdeviceError::UnexpectedResponse);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    async fn read_framed_plist(stream: &mut DuplexStream) -> Value {
        let mut len_buf = [0u8; 4];
        stream.read_exact(&mut len_buf).await.unwrap();
        let len = u32::from_be_bytes(len_buf) as usize;
        let mut buf = vec![0u8; len];
        stream.read_exact(&mut buf).await.unwrap();
        plist::from_bytes(&buf).unwrap()
    }

    async fn write_framed_plist(stream: &mut DuplexStream, dict: Dictionary) {
        let bytes = crate::util::plist_to_bytes(&dict);
        stream
            .write_all(&(bytes.len() as u32).to_be_bytes())
            .await
            .unwrap();
        stream.write_all(&bytes).await.unwrap();
    }

    #[test]
    fn new_client_defaults_to_partials_supported() {
        let (a, _b) = tokio::io::duplex(64);
        let idevice = Idevice::new(Box::new(a), "test");
        let client = WebInspectorClient::new(idevice);
        assert!(
            client.partials_supported,
            "real devices and the Simulator expect split messages by default"
        );
    }

    #[tokio::test]
    async fn send_message_splits_long_payload_into_partial_and_final_packets() {
        let (client_side, mut server_side) = tokio::io::duplex(64 * 1024);
        let idevice = Idevice::new(Box::new(client_side), "test");
        let mut client = WebInspectorClient::new(idevice);

        let argument = Value::String("x".repeat(16_000 - 40));
        let send = tokio::spawn(async move {
            client
                .send_message("forwardGetListing:", argument)
                .await
                .unwrap();
        });

        let packets = [
            read_framed_plist(&mut server_side).await,
            read_framed_plist(&mut server_side).await,
            read_framed_plist(&mut server_side).await,
        ];
        send.await.unwrap();

        assert!(packets[0]
            .as_dictionary()
            .unwrap()
            .contains_key(WIR_PARTIAL_MESSAGE_KEY));
        assert!(packets[1]
            .as_dictionary()
            .unwrap()
            .contains_key(WIR_PARTIAL_MESSAGE_KEY));
        assert!(packets[2]
            .as_dictionary()
            .unwrap()
            .contains_key(WIR_FINAL_MESSAGE_KEY));
    }

    #[tokio::test]
    async fn send_message_sends_one_packet_when_partials_not_supported() {
        let (client_side, mut server_side) = tokio::io::duplex(64 * 1024);
        let idevice = Idevice::new(Box::new(client_side), "test");
        let mut client = WebInspectorClient::new(idevice);
        client.set_partials_supported(false);

        let send = tokio::spawn(async move {
            client
                .send_message("forwardGetListing:", Value::String("hi".into()))
                .await
                .unwrap();
        });

        let packet = read_framed_plist(&mut server_side).await;
        send.await.unwrap();

        let d = packet.as_dictionary().unwrap();
        assert!(!d.contains_key(WIR_PARTIAL_MESSAGE_KEY));
        assert!(!d.contains_key(WIR_FINAL_MESSAGE_KEY));
        assert_eq!(
            d.get("__selector").and_then(|v| v.as_string()),
            Some("forwardGetListing:")
        );
    }

    #[tokio::test]
    async fn receive_message_reassembles_partial_chunks() {
        let (mut client_side, server_side) = tokio::io::duplex(64 * 1024);
        let idevice = Idevice::new(Box::new(server_side), "test");
        let mut client = WebInspectorClient::new(idevice);

        let mut inner = Dictionary::new();
        inner.insert(
            "__selector".into(),
            Value::String("forwardGetListing:".into()),
        );
        inner.insert(
            "__argument".into(),
            Value::String("hello webinspector".into()),
        );
        let raw = crate::util::plist_to_bytes(&inner);
        let mid = raw.len() / 2;

        let mut partial = Dictionary::new();
        partial.insert(
            WIR_PARTIAL_MESSAGE_KEY.into(),
            Value::String(String::from_utf8_lossy(&raw[..mid]).into_owned()),
        );
        let mut fin = Dictionary::new();
        fin.insert(
            WIR_FINAL_MESSAGE_KEY.into(),
            Value::String(String::from_utf8_lossy(&raw[mid..]).into_owned()),
        );

        write_framed_plist(&mut client_side, partial).await;
        write_framed_plist(&mut client_side, fin).await;

        let received = client.receive_message().await.unwrap();
        let d = received.as_dictionary().unwrap();
        assert_eq!(
            d.get("__argument").and_then(|v| v.as_string()),
            Some("hello webinspector")
        );
    }
}
