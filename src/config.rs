//! Orientation glue: connection configuration and option builders (component I).
//!
//! Nothing here reads the environment or touches global state — callers construct these from
//! whatever configuration source they prefer and hand them to the rest of the crate.

use std::time::Duration;

/// Non-secret orientation data needed to dial a device and run the pairing dance.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Address of the usbmux daemon: a UNIX socket path, or a `host:port` for the remote-SIB
    /// proxy.
    pub usbmux_address: UsbmuxAddress,
    /// Timeout for establishing the initial usbmux/lockdown tunnel.
    pub connect_timeout: Duration,
    /// Ceiling on a single framed-packet body, past which `MalformedFrame` is raised.
    pub frame_size_ceiling: u32,
    /// Backoff policy for polling a pending pairing dialog.
    pub pairing_backoff: PairingBackoff,
}

/// Where to find the usbmux daemon.
#[derive(Debug, Clone)]
pub enum UsbmuxAddress {
    /// A UNIX domain socket path (the default on macOS/Linux).
    Unix(String),
    /// A TCP address speaking the remote-SIB proxy handshake.
    Tcp(String),
}

impl Default for UsbmuxAddress {
    fn default() -> Self {
        #[cfg(unix)]
        {
            Self::Unix("/var/run/usbmuxd".to_string())
        }
        #[cfg(not(unix))]
        {
            Self::Tcp("127.0.0.1:27015".to_string())
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            usbmux_address: UsbmuxAddress::default(),
            connect_timeout: Duration::from_secs(5),
            frame_size_ceiling: 64 * 1024 * 1024,
            pairing_backoff: PairingBackoff::default(),
        }
    }
}

/// Exponential backoff for polling `PairingDialogResponsePending`.
#[derive(Debug, Clone, Copy)]
pub struct PairingBackoff {
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub max_attempts: u32,
}

impl Default for PairingBackoff {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            multiplier: 1.5,
            max_attempts: 12,
        }
    }
}

impl PairingBackoff {
    /// Delay to wait before the `attempt`'th retry (0-indexed).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt as i32);
        self.initial_delay.mul_f64(factor)
    }
}

/// Options sent alongside a `Pair` request.
#[derive(Debug, Clone, Copy, Default)]
pub struct PairingOptions {
    pub extended_pairing_errors: bool,
}

impl PairingOptions {
    pub fn new() -> Self {
        Self {
            extended_pairing_errors: true,
        }
    }
}

/// Options sent alongside a `StartService` request.
#[derive(Debug, Clone, Default)]
pub struct StartServiceOptions {
    pub escrow_bag: Option<Vec<u8>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_exponentially() {
        let b = PairingBackoff {
            initial_delay: Duration::from_millis(100),
            multiplier: 2.0,
            max_attempts: 5,
        };
        assert_eq!(b.delay_for(0), Duration::from_millis(100));
        assert_eq!(b.delay_for(1), Duration::from_millis(200));
        assert_eq!(b.delay_for(2), Duration::from_millis(400));
    }
}
