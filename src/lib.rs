#![doc = include_str!("../README.md")]
#![warn(missing_debug_implementations)]
#![warn(missing_copy_implementations)]
// Jackson Coxson

#[cfg(feature = "pair")]
mod ca;
pub mod archive;
pub mod config;
pub mod cursor;
pub mod logging;
mod obfuscation;
pub mod pair_store;
pub mod pairing_file;
pub mod provider;
pub mod usbmuxd;

pub mod services;
pub use services::*;

use plist_macro::{plist, pretty_print_dictionary, pretty_print_plist};
use provider::IdeviceProvider;
use std::io::{self, BufWriter};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

use crate::services::lockdown::LockdownClient;

/// A trait combining all required characteristics for a device communication socket.
///
/// Tokio's `TcpStream` and `UnixStream`, as well as `tokio_openssl::SslStream`, all implement
/// this trait.
pub trait ReadWrite: AsyncRead + AsyncWrite + Unpin + Send + Sync + std::fmt::Debug {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + Sync + std::fmt::Debug> ReadWrite for T {}

/// Interface for services that can be connected to on an iOS device.
///
/// Implementing this trait wires a fresh tunnel through lockdownd's `StartService` dance
/// (optionally upgrading to TLS) and hands the caller a ready-to-use client.
pub trait IdeviceService: Sized {
    /// Returns the service name as advertised by lockdownd.
    fn service_name() -> std::borrow::Cow<'static, str>;

    #[allow(async_fn_in_trait)]
    async fn connect(provider: &dyn IdeviceProvider) -> Result<Self, IdeviceError> {
        let mut lockdown = LockdownClient::connect(provider).await?;

        let legacy = lockdown
            .get_value(Some("ProductVersion"), None)
            .await
            .ok()
            .as_ref()
            .and_then(|x| x.as_string())
            .and_then(|x| x.split('.').next())
            .and_then(|x| x.parse::<u8>().ok())
            .map(|x| x < 5)
            .unwrap_or(false);

        lockdown
            .start_session(&provider.get_pairing_file().await?, legacy)
            .await?;

        let udid_value = match lockdown.get_value(Some("UniqueDeviceID"), None).await {
            Ok(v) => v.as_string().map(|s| s.to_string()),
            Err(_) => None,
        };

        let (port, ssl) = lockdown.start_service(Self::service_name()).await?;

        let mut idevice = provider.connect(port).await?;
        if ssl {
            idevice
                .upgrade_to_tls(&provider.get_pairing_file().await?, legacy)
                .await?;
        }

        if let Some(udid) = udid_value {
            idevice.set_udid(udid);
        }

        Self::from_stream(idevice).await
    }

    #[allow(async_fn_in_trait)]
    async fn from_stream(idevice: Idevice) -> Result<Self, IdeviceError>;
}

/// Type alias for boxed device connection sockets.
pub type IdeviceSocket = Box<dyn ReadWrite>;

/// Main handle for communicating with an iOS device over one tunnel.
///
/// Owns the connection socket and provides the two framing dialects a tunnel may speak: the
/// bare 4-byte-big-endian-length plist dialog used by lockdownd and most services, and raw byte
/// passthrough for services (AFC, DTX) that frame their own way atop this socket.
#[derive(Debug)]
pub struct Idevice {
    socket: Option<Box<dyn ReadWrite>>,
    label: String,
    udid: Option<String>,
}

impl Idevice {
    /// Creates a new device connection handle.
    pub fn new(socket: Box<dyn ReadWrite>, label: impl Into<String>) -> Self {
        Self {
            socket: Some(socket),
            label: label.into(),
            udid: None,
        }
    }

    pub fn get_socket(self) -> Option<Box<dyn ReadWrite>> {
        self.socket
    }

    /// Borrows the underlying socket, for callers that just need to check whether one exists.
    pub fn get_socket_ref(&self) -> Option<&dyn ReadWrite> {
        self.socket.as_deref()
    }

    pub fn set_udid(&mut self, udid: impl Into<String>) {
        self.udid = Some(udid.into());
    }

    pub fn udid(&self) -> Option<&str> {
        self.udid.as_deref()
    }

    /// The label this handle identifies itself with in plist requests (`Label` field).
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Sends a `QueryType` request and returns the device's reported type string.
    pub async fn get_type(&mut self) -> Result<String, IdeviceError> {
        let req = plist!({
            "Label": self.label.clone(),
            "Request": "QueryType",
        });
        self.send_plist(req).await?;

        let message = self.read_plist().await?;
        match message.get("Type") {
            Some(m) => Ok(plist::from_value(m)?),
            None => Err(IdeviceError::UnexpectedResponse),
        }
    }

    /// Sends a plist-formatted message to the device (XML encoding).
    pub(crate) async fn send_plist(&mut self, message: plist::Value) -> Result<(), IdeviceError> {
        if let Some(socket) = &mut self.socket {
            debug!("Sending plist: {}", pretty_print_plist(&message));

            let buf = Vec::new();
            let mut writer = BufWriter::new(buf);
            message.to_writer_xml(&mut writer)?;
            let message = writer.into_inner().unwrap();
            let message = String::from_utf8(message)?;
            let len = message.len() as u32;
            socket.write_all(&len.to_be_bytes()).await?;
            socket.write_all(message.as_bytes()).await?;
            socket.flush().await?;
            Ok(())
        } else {
            Err(IdeviceError::NoEstablishedConnection)
        }
    }

    /// Sends a binary-plist-formatted message to the device.
    pub(crate) async fn send_bplist(&mut self, message: plist::Value) -> Result<(), IdeviceError> {
        if let Some(socket) = &mut self.socket {
            debug!("Sending plist: {}", pretty_print_plist(&message));

            let buf = Vec::new();
            let mut writer = BufWriter::new(buf);
            message.to_writer_binary(&mut writer)?;
            let message = writer.into_inner().unwrap();
            let len = message.len() as u32;
            socket.write_all(&len.to_be_bytes()).await?;
            socket.write_all(&message).await?;
            socket.flush().await?;
            Ok(())
        } else {
            Err(IdeviceError::NoEstablishedConnection)
        }
    }

    /// Sends raw binary data to the device.
    pub async fn send_raw(&mut self, message: &[u8]) -> Result<(), IdeviceError> {
        self.send_raw_with_progress(message, |_| async {}, ()).await
    }

    /// Sends raw binary data with a progress callback, invoked after every 64 KiB chunk.
    pub async fn send_raw_with_progress<Fut, S>(
        &mut self,
        message: &[u8],
        callback: impl Fn(((usize, usize), S)) -> Fut,
        state: S,
    ) -> Result<(), IdeviceError>
    where
        Fut: std::future::Future<Output = ()>,
        S: Clone,
    {
        if let Some(socket) = &mut self.socket {
            let message_parts = message.chunks(1024 * 64);
            let part_len = message_parts.len().saturating_sub(1);

            for (i, part) in message_parts.enumerate() {
                trace!("Writing {i}/{part_len}");
                socket.write_all(part).await?;
                callback(((i, part_len), state.clone())).await;
            }
            socket.flush().await?;
            Ok(())
        } else {
            Err(IdeviceError::NoEstablishedConnection)
        }
    }

    /// Reads exactly `len` bytes from the device.
    pub async fn read_raw(&mut self, len: usize) -> Result<Vec<u8>, IdeviceError> {
        if let Some(socket) = &mut self.socket {
            let mut buf = vec![0; len];
            socket.read_exact(&mut buf).await?;
            Ok(buf)
        } else {
            Err(IdeviceError::NoEstablishedConnection)
        }
    }

    /// Reads up to `max_size` bytes from the device.
    pub async fn read_any(&mut self, max_size: u32) -> Result<Vec<u8>, IdeviceError> {
        if let Some(socket) = &mut self.socket {
            let mut buf = vec![0; max_size as usize];
            let len = socket.read(&mut buf).await?;
            Ok(buf[..len].to_vec())
        } else {
            Err(IdeviceError::NoEstablishedConnection)
        }
    }

    /// Reads a 4-byte-big-endian-length-prefixed plist dialog reply and raises any `Error` field
    /// as a typed `IdeviceError`.
    pub(crate) async fn read_plist(&mut self) -> Result<plist::Dictionary, IdeviceError> {
        let res = self.read_plist_value().await?;
        let res: plist::Dictionary = plist::from_value(&res)?;
        debug!("Received plist: {}", pretty_print_dictionary(&res));

        if let Some(e) = res.get("Error") {
            let e = match e {
                plist::Value::String(e) => e.to_string(),
                plist::Value::Integer(e) => {
                    if let Some(error_string) = res.get("ErrorString").and_then(|x| x.as_string())
                    {
                        error_string.to_string()
                    } else {
                        e.to_string()
                    }
                }
                _ => {
                    tracing::error!("Error is not a string or integer from read_plist: {e:?}");
                    return Err(IdeviceError::UnexpectedResponse);
                }
            };
            if let Some(e) = IdeviceError::from_device_error_type(e.as_str(), &res) {
                return Err(e);
            } else {
                let msg =
                    if let Some(desc) = res.get("ErrorDescription").and_then(|x| x.as_string()) {
                        format!("{} ({})", e, desc)
                    } else {
                        e
                    };
                return Err(IdeviceError::UnknownErrorType(msg));
            }
        }
        Ok(res)
    }

    pub(crate) async fn read_plist_value(&mut self) -> Result<plist::Value, IdeviceError> {
        if let Some(socket) = &mut self.socket {
            let mut buf = [0u8; 4];
            socket.read_exact(&mut buf).await?;
            let len = u32::from_be_bytes(buf);
            let mut buf = vec![0; len as usize];
            socket.read_exact(&mut buf).await?;
            let res: plist::Value = plist::from_bytes(&buf)?;
            Ok(res)
        } else {
            Err(IdeviceError::NoEstablishedConnection)
        }
    }

    /// Reads until `delimiter` is found, returning everything before it (and consuming the
    /// delimiter). Used by the syslog relay's NUL-delimited line protocol.
    pub(crate) async fn read_until_delim(
        &mut self,
        delimiter: &[u8],
    ) -> Result<Option<bytes::BytesMut>, IdeviceError> {
        if let Some(socket) = &mut self.socket {
            let mut buffer = bytes::BytesMut::with_capacity(1024);
            let mut temp = [0u8; 1024];

            loop {
                let n = socket.read(&mut temp).await?;
                if n == 0 {
                    if buffer.is_empty() {
                        return Ok(None);
                    } else {
                        return Ok(Some(buffer));
                    }
                }

                buffer.extend_from_slice(&temp[..n]);

                if let Some(pos) = buffer.windows(delimiter.len()).position(|w| w == delimiter) {
                    let mut line = buffer.split_to(pos + delimiter.len());
                    line.truncate(line.len() - delimiter.len());
                    return Ok(Some(line));
                }
            }
        } else {
            Err(IdeviceError::NoEstablishedConnection)
        }
    }

    /// Upgrades the connection to TLS using the pair record's host identity, pinning the device
    /// certificate by DER equality rather than trusting a chain (component D).
    pub async fn upgrade_to_tls(
        &mut self,
        pairing_file: &pairing_file::PairingFile,
        legacy: bool,
    ) -> Result<(), IdeviceError> {
        let mut connector = openssl::ssl::SslConnector::builder(openssl::ssl::SslMethod::tls())?;
        if legacy {
            connector.set_min_proto_version(Some(openssl::ssl::SslVersion::SSL3))?;
            connector.set_max_proto_version(Some(openssl::ssl::SslVersion::TLS1))?;
            connector.set_cipher_list("ALL:!aNULL:!eNULL:@SECLEVEL=0")?;
            connector.set_options(openssl::ssl::SslOptions::ALLOW_UNSAFE_LEGACY_RENEGOTIATION);
        }

        let expected_der = pairing_file.device_certificate.to_der()?;
        connector.set_verify_callback(openssl::ssl::SslVerifyMode::PEER, move |_preverify, ctx| {
            match ctx.current_cert().and_then(|c| c.to_der().ok()) {
                Some(der) => der == expected_der,
                None => false,
            }
        });

        let connector = connector.build().configure()?.into_ssl("device")?;

        let mut connector = connector;
        connector.set_certificate(&pairing_file.host_certificate)?;
        connector.set_private_key(&pairing_file.host_private_key)?;

        let socket = self.socket.take().ok_or(IdeviceError::NoEstablishedConnection)?;
        let mut ssl_stream = tokio_openssl::SslStream::new(connector, socket)?;
        std::pin::Pin::new(&mut ssl_stream)
            .connect()
            .await
            .map_err(|e| IdeviceError::TlsHandshakeFailed(e.to_string()))?;
        self.socket = Some(Box::new(ssl_stream));

        Ok(())
    }
}

/// Comprehensive error type for all device communication failures.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum IdeviceError {
    #[error("device socket io failed")]
    Socket(#[from] io::Error),
    #[error("TLS error")]
    Tls(#[from] openssl::ssl::Error),
    #[error("TLS setup failed")]
    TlsSetupFailed(#[from] openssl::error::ErrorStack),
    #[error("TLS handshake failed: {0}")]
    TlsHandshakeFailed(String),

    #[error("io on plist")]
    Plist(#[from] plist::Error),
    #[error("can't convert bytes to utf8")]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error("unexpected response from device")]
    UnexpectedResponse,
    #[error("this request was prohibited")]
    GetProhibited,
    #[error("no SSL session is active")]
    SessionInactive,
    #[error("device does not have pairing file")]
    InvalidHostID,
    #[error("no established connection")]
    NoEstablishedConnection,
    #[error("not found")]
    NotFound,
    #[error("service not found")]
    ServiceNotFound,
    #[error("Proclaimed packet size does not match actual size")]
    PacketSizeMismatch,

    #[error("device not found")]
    DeviceNotFound,
    #[error("device is locked")]
    DeviceLocked,
    #[error("usbmux pair record missing for this device")]
    PairRecordMissing,
    #[error("usbmux daemon returned protocol error {0}")]
    UsbmuxProtocolError(i64),

    #[error("bad build manifest")]
    BadBuildManifest,
    #[error("image not mounted")]
    ImageNotMounted,

    #[error("pairing trust dialog pending")]
    PairingDialogResponsePending,
    #[error("user denied pairing trust")]
    UserDeniedPairing,
    #[error("pairing was refused: {0}")]
    PairingRefused(String),
    #[error("device is passcode locked")]
    PasswordProtected,
    #[error("device is not paired")]
    NotPaired,

    #[error("installation proxy operation failed: {0}")]
    InstallationProxyOperationFailed(String),

    #[error("afc error: {0}")]
    Afc(#[from] afc::errors::AfcError),
    #[error("unknown afc opcode")]
    UnknownAfcOpcode,
    #[error("invalid afc magic")]
    InvalidAfcMagic,
    #[error("missing file attribute")]
    AfcMissingAttribute,

    #[error("internal error: {0}")]
    InternalError(String),

    #[error("keyed archive decode error: {0}")]
    ArchiveDecodeError(String),
    #[error("unknown aux value type {0}")]
    UnknownAuxValueType(u32),
    #[error("dtx channel not registered")]
    ChannelNotRegistered,
    #[error("unknown dtx channel {0}")]
    UnknownChannel(u32),
    #[error("dtx peer reported an error: {0}")]
    DtxPeerError(String),
    #[error("disable memory limit failed")]
    DisableMemoryLimitFailed,

    #[error("cannot parse string as IpAddr")]
    AddrParseError(#[from] std::net::AddrParseError),

    #[error("not enough bytes, expected {1}, got {0}")]
    NotEnoughBytes(usize, usize),
    #[error("failed to parse bytes as valid utf8")]
    Utf8Error,
    #[error("invalid argument passed")]
    InvalidArgument,
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
    #[error("tunnel closed")]
    TunnelClosed,
    #[error("operation was cancelled")]
    Cancelled,
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("unknown error `{0}` returned from device")]
    UnknownErrorType(String),

    #[error("integer overflow")]
    IntegerOverflow,
    #[error("canceled by user")]
    CanceledByUser,

    #[error("Developer mode is not enabled")]
    DeveloperModeNotEnabled,

    #[error("Application verification failed: {0}")]
    ApplicationVerificationFailed(String),

    #[error("test runner reported a fatal error: {0}")]
    XCTestRunnerFailed(String),
    #[error("unsupported ProductVersion for XCTest orchestration: {0}")]
    UnsupportedXCTestVersion(String),
}

impl IdeviceError {
    /// Converts a device-reported `Error` string to a typed error.
    fn from_device_error_type(e: &str, context: &plist::Dictionary) -> Option<Self> {
        if e.contains("NSDebugDescription=Canceled by user.") {
            return Some(Self::CanceledByUser);
        } else if e.contains("Developer mode is not enabled.") {
            return Some(Self::DeveloperModeNotEnabled);
        }
        match e {
            "GetProhibited" => Some(Self::GetProhibited),
            "InvalidHostID" => Some(Self::InvalidHostID),
            "SessionInactive" => Some(Self::SessionInactive),
            "DeviceLocked" => Some(Self::DeviceLocked),
            "PairingDialogResponsePending" => Some(Self::PairingDialogResponsePending),
            "UserDeniedPairing" => Some(Self::UserDeniedPairing),
            "PasswordProtected" => Some(Self::PasswordProtected),
            "MalformedCommand" => Some(Self::UnexpectedResponse),
            "InternalError" => {
                let detailed_error = context
                    .get("DetailedError")
                    .and_then(|d| d.as_string())
                    .unwrap_or("No context")
                    .to_string();

                if detailed_error.contains("There is no matching entry in the device map for") {
                    Some(Self::ImageNotMounted)
                } else {
                    Some(Self::InternalError(detailed_error))
                }
            }
            "ApplicationVerificationFailed" => {
                let msg = context
                    .get("ErrorDescription")
                    .and_then(|x| x.as_string())
                    .unwrap_or("No context")
                    .to_string();
                Some(Self::ApplicationVerificationFailed(msg))
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_error_maps_known_strings() {
        let ctx = plist::Dictionary::new();
        assert!(matches!(
            IdeviceError::from_device_error_type("DeviceLocked", &ctx),
            Some(IdeviceError::DeviceLocked)
        ));
        assert!(IdeviceError::from_device_error_type("SomeUnknownThing", &ctx).is_none());
    }
}
