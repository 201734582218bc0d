// Jackson Coxson
//
// DTX channel multiplexer (component F): Instruments' "remote server" protocol, reached over a
// plain lockdown-started service (no RemoteXPC/RSD tunnel involved).

use crate::provider::IdeviceProvider;
use crate::services::lockdown::LockdownClient;
use crate::{obf, Idevice, IdeviceError};

pub mod location_simulation;
pub mod message;
pub mod notifications;
#[cfg(feature = "perfd")]
pub mod perfd;
pub mod process_control;
pub mod remote_server;
pub mod screenshot;

// iOS version support notes:
// - com.apple.instruments.remoteserver is the name used pre-iOS 14.
// - com.apple.instruments.remoteserver.DVTSecureSocketProxy replaces it from iOS 14 on.
// Both speak the same DTX wire protocol, so this tries the modern name first and falls back.
impl crate::IdeviceService for remote_server::RemoteServerClient<Box<dyn crate::ReadWrite>> {
    fn service_name() -> std::borrow::Cow<'static, str> {
        obf!("com.apple.instruments.remoteserver.DVTSecureSocketProxy")
    }

    #[allow(async_fn_in_trait)]
    async fn connect(provider: &dyn IdeviceProvider) -> Result<Self, IdeviceError> {
        let mut lockdown = LockdownClient::connect(provider).await?;
        lockdown
            .start_session(&provider.get_pairing_file().await?, false)
            .await?;

        let try_names = [
            obf!("com.apple.instruments.remoteserver.DVTSecureSocketProxy"),
            obf!("com.apple.instruments.remoteserver"),
        ];

        let mut last_err: Option<IdeviceError> = None;
        for name in try_names {
            match lockdown.start_service(name).await {
                Ok((port, ssl)) => {
                    let mut idevice = provider.connect(port).await?;
                    if ssl {
                        idevice
                            .upgrade_to_tls(&provider.get_pairing_file().await?, false)
                            .await?;
                    }
                    let socket = idevice
                        .get_socket()
                        .ok_or(IdeviceError::NoEstablishedConnection)?;
                    return Ok(remote_server::RemoteServerClient::new(socket));
                }
                Err(e) => last_err = Some(e),
            }
        }

        Err(last_err.unwrap_or(IdeviceError::ServiceNotFound))
    }

    #[allow(async_fn_in_trait)]
    async fn from_stream(idevice: Idevice) -> Result<Self, IdeviceError> {
        let socket = idevice
            .get_socket()
            .ok_or(IdeviceError::NoEstablishedConnection)?;
        Ok(remote_server::RemoteServerClient::new(socket))
    }
}
