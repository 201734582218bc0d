//! iOS Lockdown Service Client
//!
//! Provides functionality for interacting with the lockdown service on iOS devices,
//! which is the primary service for device management and service discovery.

use plist::Value;
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::config::{PairingBackoff, PairingOptions, StartServiceOptions};
use crate::{obf, pairing_file, Idevice, IdeviceError, IdeviceService};

/// Client for interacting with the iOS lockdown service
///
/// This is the primary service for device management and provides:
/// - Access to device information and settings
/// - Service discovery and port allocation
/// - Session management and security
#[derive(Debug)]
pub struct LockdownClient {
    /// The underlying device connection with established lockdown service
    pub idevice: crate::Idevice,
}

impl IdeviceService for LockdownClient {
    /// Returns the lockdown service name as registered with the device
    fn service_name() -> std::borrow::Cow<'static, str> {
        obf!("com.apple.mobile.lockdown")
    }

    /// Establishes a connection to the lockdown service
    ///
    /// # Arguments
    /// * `provider` - Device connection provider
    ///
    /// # Returns
    /// A connected `LockdownClient` instance
    ///
    /// # Errors
    /// Returns `IdeviceError` if connection fails
    async fn connect(
        provider: &dyn crate::provider::IdeviceProvider,
    ) -> Result<Self, IdeviceError> {
        let idevice = provider.connect(Self::LOCKDOWND_PORT).await?;
        Ok(Self::new(idevice))
    }

    async fn from_stream(idevice: Idevice) -> Result<Self, crate::IdeviceError> {
        Ok(Self::new(idevice))
    }
}

/// Internal structure for lockdown protocol requests
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct LockdownRequest {
    label: String,
    key: Option<String>,
    request: String,
}

impl LockdownClient {
    /// The default TCP port for the lockdown service
    pub const LOCKDOWND_PORT: u16 = 62078;

    /// Creates a new lockdown client from an existing device connection
    ///
    /// # Arguments
    /// * `idevice` - Pre-established device connection
    pub fn new(idevice: Idevice) -> Self {
        Self { idevice }
    }

    /// Retrieves a specific value from the device
    ///
    /// # Arguments
    /// * `value` - The name of the value to retrieve (e.g., "DeviceName")
    ///
    /// # Returns
    /// The requested value as a plist Value
    ///
    /// # Errors
    /// Returns `IdeviceError` if:
    /// - Communication fails
    /// - The requested value doesn't exist
    /// - The response is malformed
    pub async fn get_value(
        &mut self,
        key: Option<&str>,
        domain: Option<&str>,
    ) -> Result<Value, IdeviceError> {
        let request = crate::plist!({
            "Label": self.idevice.label().to_string(),
            "Request": "GetValue",
            "Key":? key,
            "Domain":? domain
        });
        self.idevice.send_plist(request).await?;
        let message: plist::Dictionary = self.idevice.read_plist().await?;
        match message.get("Value") {
            Some(m) => Ok(m.to_owned()),
            None => Err(IdeviceError::UnexpectedResponse),
        }
    }

    /// Sets a value on the device
    ///
    /// # Arguments
    /// * `key` - The key to set
    /// * `value` - The plist value to set
    /// * `domain` - An optional domain to set by
    ///
    /// # Errors
    /// Returns `IdeviceError` if:
    /// - Communication fails
    /// - The response is malformed
    pub async fn set_value(
        &mut self,
        key: impl Into<String>,
        value: Value,
        domain: Option<&str>,
    ) -> Result<(), IdeviceError> {
        let key = key.into();

        let req = crate::plist!({
            "Label": self.idevice.label().to_string(),
            "Request": "SetValue",
            "Key": key,
            "Value": value,
            "Domain":? domain
        });

        self.idevice.send_plist(req).await?;
        self.idevice.read_plist().await?;

        Ok(())
    }

    /// Starts a secure TLS session with the device
    ///
    /// # Arguments
    /// * `pairing_file` - Contains the device's identity and certificates
    /// * `legacy` - Whether the device predates TLS 1.0 (pre-iOS 5), requiring SSLv3 negotiation
    ///
    /// # Returns
    /// `Ok(())` on successful session establishment
    ///
    /// # Errors
    /// Returns `IdeviceError` if:
    /// - No connection is established
    /// - The session request is denied
    /// - TLS handshake fails
    pub async fn start_session(
        &mut self,
        pairing_file: &pairing_file::PairingFile,
        legacy: bool,
    ) -> Result<(), IdeviceError> {
        if self.idevice.get_socket_ref().is_none() {
            return Err(IdeviceError::NoEstablishedConnection);
        }

        let request = crate::plist!({
            "Label": self.idevice.label().to_string(),
            "Request": "StartSession",
            "HostID": pairing_file.host_id.clone(),
            "SystemBUID": pairing_file.system_buid.clone()
        });
        self.idevice.send_plist(request).await?;

        let response = self.idevice.read_plist().await?;
        match response.get("EnableSessionSSL") {
            Some(plist::Value::Boolean(enable)) => {
                if *enable {
                    self.idevice.upgrade_to_tls(pairing_file, legacy).await?;
                }
            }
            _ => {
                return Err(IdeviceError::UnexpectedResponse);
            }
        }

        Ok(())
    }

    /// Requests to start a service on the device
    ///
    /// # Arguments
    /// * `identifier` - The service identifier (e.g., "com.apple.debugserver")
    ///
    /// # Returns
    /// A tuple containing:
    /// - The port number where the service is available
    /// - A boolean indicating whether SSL should be used
    ///
    /// # Errors
    /// Returns `IdeviceError` if:
    /// - The service cannot be started
    /// - The response is malformed
    /// - The requested service doesn't exist
    pub async fn start_service(
        &mut self,
        identifier: impl Into<String>,
    ) -> Result<(u16, bool), IdeviceError> {
        self.start_service_with_options(identifier, &StartServiceOptions::default())
            .await
    }

    /// Like [`Self::start_service`], but allows passing an escrow bag for services that require
    /// re-proving pairing trust before they'll start (e.g. `com.apple.mobile.house_arrest` on a
    /// supervised device).
    pub async fn start_service_with_options(
        &mut self,
        identifier: impl Into<String>,
        options: &StartServiceOptions,
    ) -> Result<(u16, bool), IdeviceError> {
        let identifier = identifier.into();
        let escrow_bag = options.escrow_bag.clone();
        let req = crate::plist!({
            "Label": self.idevice.label().to_string(),
            "Request": "StartService",
            "Service": identifier,
            "EscrowBag":? escrow_bag,
        });
        self.idevice.send_plist(req).await?;
        let response = self.idevice.read_plist().await?;

        let ssl = match response.get("EnableServiceSSL") {
            Some(plist::Value::Boolean(ssl)) => ssl.to_owned(),
            _ => false, // over USB, this option won't exist
        };

        match response.get("Port") {
            Some(plist::Value::Integer(port)) => {
                if let Some(port) = port.as_unsigned() {
                    Ok((port as u16, ssl))
                } else {
                    error!("Port isn't an unsigned integer!");
                    Err(IdeviceError::UnexpectedResponse)
                }
            }
            _ => {
                error!("Response didn't contain an integer port");
                Err(IdeviceError::UnexpectedResponse)
            }
        }
    }

    /// Tells the device to enter recovery mode.
    pub async fn enter_recovery(&mut self) -> Result<(), IdeviceError> {
        let req = crate::plist!({
            "Label": self.idevice.label().to_string(),
            "Request": "EnterRecovery",
        });
        self.idevice.send_plist(req).await?;
        self.idevice.read_plist().await?;
        Ok(())
    }

    /// Tears down the current SSL session, returning the connection to cleartext lockdown
    /// requests. Most callers will simply drop the client instead.
    pub async fn stop_session(&mut self) -> Result<(), IdeviceError> {
        let req = crate::plist!({
            "Label": self.idevice.label().to_string(),
            "Request": "StopSession",
        });
        self.idevice.send_plist(req).await?;
        self.idevice.read_plist().await?;
        Ok(())
    }

    /// Removes this host's pairing record from the device.
    pub async fn unpair(&mut self, host_id: impl Into<String>) -> Result<(), IdeviceError> {
        let req = crate::plist!({
            "Label": self.idevice.label().to_string(),
            "Request": "Unpair",
            "PairRecord": {
                "HostID": host_id.into(),
            },
        });
        self.idevice.send_plist(req).await?;
        self.idevice.read_plist().await?;
        Ok(())
    }

    /// Generates a pairing file and sends it to the device for trusting.
    ///
    /// Note that this does NOT save the file to usbmuxd's cache. That's a responsibility of the
    /// caller.
    ///
    /// If the device reports `PairingDialogResponsePending` (the user hasn't yet tapped "Trust"),
    /// this polls using `backoff`'s schedule rather than retrying forever; once `max_attempts` is
    /// exhausted, the last pending error is returned.
    ///
    /// # Arguments
    /// * `host_id` - The host ID, in the form of a UUID. Typically generated from the host name
    /// * `system_buid` - UUID fetched from usbmuxd. Doesn't appear to affect function.
    ///
    /// # Returns
    /// The newly generated pairing record
    #[cfg(feature = "pair")]
    pub async fn pair(
        &mut self,
        host_id: impl Into<String>,
        system_buid: impl Into<String>,
        backoff: &PairingBackoff,
    ) -> Result<crate::pairing_file::PairingFile, IdeviceError> {
        let host_id = host_id.into();
        let system_buid = system_buid.into();

        let pub_key = self.get_value(Some("DevicePublicKey"), None).await?;
        let pub_key = match pub_key.as_data().map(|x| x.to_vec()) {
            Some(p) => p,
            None => {
                warn!("Did not get public key data response");
                return Err(IdeviceError::UnexpectedResponse);
            }
        };

        let wifi_mac = self.get_value(Some("WiFiAddress"), None).await?;
        let wifi_mac = match wifi_mac.as_string().map(|s| s.to_string()) {
            Some(w) => w,
            None => {
                warn!("Did not get WiFiAddress string");
                return Err(IdeviceError::UnexpectedResponse);
            }
        };

        let identity = crate::ca::generate_host_identity()?;
        let identity = crate::ca::complete_with_device_key(identity, &pub_key)?;

        let pairing_options = PairingOptions::new();
        let req = crate::plist!({
            "Label": self.idevice.label().to_string(),
            "Request": "Pair",
            "PairRecord": {
                "DevicePublicKey": pub_key.clone(),
                "DeviceCertificate": identity.device_certificate.to_pem()?,
                "HostCertificate": identity.host_certificate.to_pem()?,
                "HostID": host_id.clone(),
                "RootCertificate": identity.root_certificate.to_pem()?,
                "SystemBUID": system_buid.clone(),
            },
            "ProtocolVersion": "2",
            "PairingOptions": {
                "ExtendedPairingErrors": pairing_options.extended_pairing_errors,
            },
        });

        let mut attempt = 0;
        loop {
            self.idevice.send_plist(req.clone()).await?;
            match self.idevice.read_plist().await {
                Ok(response) => {
                    let escrow_bag = response
                        .get("EscrowBag")
                        .and_then(|x| x.as_data())
                        .map(|d| d.to_vec())
                        .unwrap_or_default();

                    return Ok(pairing_file::PairingFile {
                        device_certificate: identity.device_certificate,
                        host_private_key: identity.host_private_key,
                        host_certificate: identity.host_certificate,
                        root_private_key: identity.root_private_key,
                        root_certificate: identity.root_certificate,
                        system_buid,
                        host_id,
                        escrow_bag,
                        wifi_mac_address: wifi_mac,
                        udid: self.idevice.udid().map(|s| s.to_string()),
                    });
                }
                Err(IdeviceError::PairingDialogResponsePending) => {
                    if attempt >= backoff.max_attempts {
                        return Err(IdeviceError::PairingRefused(format!(
                            "trust dialog still pending after {} attempts",
                            backoff.max_attempts
                        )));
                    }
                    tokio::time::sleep(backoff.delay_for(attempt)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl From<Idevice> for LockdownClient {
    /// Converts an existing device connection into a lockdown client
    fn from(value: Idevice) -> Self {
        Self::new(value)
    }
}
