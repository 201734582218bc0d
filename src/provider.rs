// Jackson Coxson

use std::net::{IpAddr, SocketAddr};

use tokio::net::TcpStream;

use crate::config::ConnectionConfig;
use crate::{pairing_file::PairingFile, usbmuxd::UsbmuxdConnection, Idevice, IdeviceError};

/// Dials a device's services and fetches its pairing file. Implemented once each for a plain
/// TCP-reachable device and for one reached through usbmuxd.
pub trait IdeviceProvider: Unpin + Send + Sync + std::fmt::Debug {
    // https://blog.rust-lang.org/2023/12/21/async-fn-rpit-in-traits.html#is-it-okay-to-use-async-fn-in-traits-what-are-the-limitations
    fn connect(
        &self,
        port: u16,
    ) -> impl std::future::Future<Output = Result<Idevice, IdeviceError>> + Send;
    fn label(&self) -> &str;
    fn get_pairing_file(
        &self,
    ) -> impl std::future::Future<Output = Result<PairingFile, IdeviceError>> + Send;
}

/// A device reached directly over TCP, e.g. over Wi-Fi or a manual SSH/usbfluxd tunnel.
#[derive(Debug)]
pub struct TcpProvider {
    pub addr: IpAddr,
    pub pairing_file: PairingFile,
    pub label: String,
}

impl IdeviceProvider for TcpProvider {
    async fn connect(&self, port: u16) -> Result<Idevice, IdeviceError> {
        let socket_addr = SocketAddr::new(self.addr, port);
        let stream = TcpStream::connect(socket_addr).await?;
        Ok(Idevice::new(Box::new(stream), self.label.to_owned()))
    }
    fn label(&self) -> &str {
        self.label.as_str()
    }

    async fn get_pairing_file(&self) -> Result<PairingFile, IdeviceError> {
        Ok(self.pairing_file.clone())
    }
}

/// A device reached through the usbmux daemon (local UNIX socket or the remote-SIB TCP proxy).
#[derive(Debug)]
pub struct UsbmuxdProvider {
    pub config: ConnectionConfig,
    pub udid: String,
    pub device_id: u32,
    pub label: String,
}

impl IdeviceProvider for UsbmuxdProvider {
    async fn connect(&self, port: u16) -> Result<Idevice, IdeviceError> {
        let usbmuxd = UsbmuxdConnection::connect(&self.config).await?;
        let socket = usbmuxd.connect_to_device(self.device_id, port).await?;
        Ok(Idevice::new(socket, self.label.to_owned()))
    }

    fn label(&self) -> &str {
        self.label.as_str()
    }

    async fn get_pairing_file(&self) -> Result<PairingFile, IdeviceError> {
        let mut usbmuxd = UsbmuxdConnection::connect(&self.config).await?;
        usbmuxd.get_pair_record(&self.udid).await
    }
}
