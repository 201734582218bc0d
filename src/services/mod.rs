// Jackson Coxson

#[cfg(feature = "afc")]
pub mod afc;
#[cfg(feature = "amfi")]
pub mod amfi;
#[cfg(feature = "diagnostics_relay")]
pub mod diagnostics_relay;
#[cfg(feature = "dvt")]
pub mod dvt;
#[cfg(feature = "house_arrest")]
pub mod house_arrest;
#[cfg(feature = "installation_proxy")]
pub mod installation_proxy;
pub mod lockdown;
#[cfg(feature = "mobile_image_mounter")]
pub mod mobile_image_mounter;
#[cfg(feature = "pcapd")]
pub mod pcapd;
#[cfg(feature = "screenshotr")]
pub mod screenshotr;
#[cfg(feature = "syslog_relay")]
pub mod syslog_relay;
#[cfg(feature = "webinspector")]
pub mod webinspector;
#[cfg(feature = "xctest")]
pub mod xctest;

pub use lockdown::LockdownClient;

#[cfg(feature = "afc")]
pub use afc::AfcClient;
#[cfg(feature = "amfi")]
pub use amfi::AmfiClient;
#[cfg(feature = "diagnostics_relay")]
pub use diagnostics_relay::DiagnosticsRelayClient;
#[cfg(feature = "house_arrest")]
pub use house_arrest::HouseArrestClient;
#[cfg(feature = "installation_proxy")]
pub use installation_proxy::InstallationProxyClient;
#[cfg(feature = "mobile_image_mounter")]
pub use mobile_image_mounter::ImageMounter;
#[cfg(feature = "pcapd")]
pub use pcapd::PcapdClient;
#[cfg(feature = "screenshotr")]
pub use screenshotr::ScreenshotService;
#[cfg(feature = "syslog_relay")]
pub use syslog_relay::SyslogRelayClient;
#[cfg(feature = "webinspector")]
pub use webinspector::WebInspectorClient;
#[cfg(feature = "xctest")]
pub use xctest::{XCTestConfiguration, XCTestSession};
