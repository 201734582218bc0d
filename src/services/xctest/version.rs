// Jackson Coxson
//
// The testmanagerd control-session handshake changed shape four times across iOS releases; which
// selector to invoke depends entirely on the device's ProductVersion, so that's parsed into a
// small comparable triple rather than threaded through as a raw string everywhere.

use crate::IdeviceError;

/// A parsed `ProductVersion` string, e.g. `"12.4.1"` -> `DeviceVersion { major: 12, minor: 4, patch: 1 }`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct DeviceVersion {
    pub major: u8,
    pub minor: u8,
    pub patch: u8,
}

impl DeviceVersion {
    pub fn new(major: u8, minor: u8, patch: u8) -> Self {
        Self { major, minor, patch }
    }

    pub fn parse(version: &str) -> Result<Self, IdeviceError> {
        let mut parts = version.trim().split('.');
        let major = parts
            .next()
            .and_then(|p| p.parse().ok())
            .ok_or_else(|| IdeviceError::UnsupportedXCTestVersion(version.to_string()))?;
        let minor = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
        let patch = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
        Ok(Self { major, minor, patch })
    }
}

/// Which control-session selector to invoke on the testmanagerd control channel, selected by
/// `ProductVersion`. The four branches correspond to four generations of the XCTest daemon
/// protocol; each supersedes the last rather than extending it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSessionCall {
    /// iOS < 9: `initiateControlSessionForTestProcessID:`
    InitiateControlSessionForTestProcessId,
    /// iOS 9-10: `initiateControlSessionForTestProcessID:protocolVersion:`
    InitiateControlSessionForTestProcessIdProtocolVersion,
    /// iOS 11: `initiateSessionWithIdentifier:forClient:`
    InitiateSessionWithIdentifierForClient,
    /// iOS >= 12: `authorizeTestSession:`
    AuthorizeTestSession,
}

impl ControlSessionCall {
    pub fn selector(self) -> &'static str {
        match self {
            Self::InitiateControlSessionForTestProcessId => {
                "initiateControlSessionForTestProcessID:"
            }
            Self::InitiateControlSessionForTestProcessIdProtocolVersion => {
                "initiateControlSessionForTestProcessID:protocolVersion:"
            }
            Self::InitiateSessionWithIdentifierForClient => {
                "initiateSessionWithIdentifier:forClient:"
            }
            Self::AuthorizeTestSession => "authorizeTestSession:",
        }
    }
}

/// Selects the control-session call for a device's `ProductVersion`.
pub fn control_session_call_for(version: DeviceVersion) -> ControlSessionCall {
    if version.major < 9 {
        ControlSessionCall::InitiateControlSessionForTestProcessId
    } else if version.major < 11 {
        ControlSessionCall::InitiateControlSessionForTestProcessIdProtocolVersion
    } else if version.major == 11 {
        ControlSessionCall::InitiateSessionWithIdentifierForClient
    } else {
        ControlSessionCall::AuthorizeTestSession
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_three_component_version() {
        let v = DeviceVersion::parse("12.4.1").unwrap();
        assert_eq!(v, DeviceVersion::new(12, 4, 1));
    }

    #[test]
    fn parses_two_component_version() {
        let v = DeviceVersion::parse("11.0").unwrap();
        assert_eq!(v, DeviceVersion::new(11, 0, 0));
    }

    #[test]
    fn ios_12_4_selects_authorize_test_session() {
        let call = control_session_call_for(DeviceVersion::new(12, 4, 0));
        assert_eq!(call, ControlSessionCall::AuthorizeTestSession);
        assert_eq!(call.selector(), "authorizeTestSession:");
    }

    #[test]
    fn ios_11_selects_initiate_session_with_identifier() {
        let call = control_session_call_for(DeviceVersion::new(11, 0, 0));
        assert_eq!(call, ControlSessionCall::InitiateSessionWithIdentifierForClient);
    }

    #[test]
    fn ios_9_selects_protocol_version_variant() {
        let call = control_session_call_for(DeviceVersion::new(9, 3, 0));
        assert_eq!(
            call,
            ControlSessionCall::InitiateControlSessionForTestProcessIdProtocolVersion
        );
    }

    #[test]
    fn ios_8_selects_legacy_variant() {
        let call = control_session_call_for(DeviceVersion::new(8, 4, 0));
        assert_eq!(call, ControlSessionCall::InitiateControlSessionForTestProcessId);
    }
}
