// Jackson Coxson
//
// The usbmux control envelope (component A, usbmux dialect): a 16-byte little-endian header
// (length, version, message type, tag) followed by the plist body. Distinct from the bare
// 4-byte-big-endian-length dialect lockdownd and service adapters speak.

pub struct RawPacket {
    version: u32,
    message_type: u32,
    tag: u32,
    body: plist::Dictionary,
}

impl RawPacket {
    pub fn new(body: plist::Dictionary, version: u32, message_type: u32, tag: u32) -> Self {
        Self {
            version,
            message_type,
            tag,
            body,
        }
    }
}

impl From<RawPacket> for Vec<u8> {
    fn from(value: RawPacket) -> Self {
        let mut xml = Vec::new();
        plist::Value::Dictionary(value.body)
            .to_writer_xml(&mut xml)
            .expect("writing to a Vec can't fail");

        let total_len = (xml.len() + 16) as u32;

        let mut out = Vec::with_capacity(xml.len() + 16);
        out.extend_from_slice(&total_len.to_le_bytes());
        out.extend_from_slice(&value.version.to_le_bytes());
        out.extend_from_slice(&value.message_type.to_le_bytes());
        out.extend_from_slice(&value.tag.to_le_bytes());
        out.extend_from_slice(&xml);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_length_field_matches_body_plus_sixteen() {
        let mut dict = plist::Dictionary::new();
        dict.insert("MessageType".into(), "ListDevices".into());
        let packet = RawPacket::new(dict, 1, 8, 3);
        let bytes: Vec<u8> = packet.into();

        let len = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
        assert_eq!(len as usize, bytes.len());
        assert_eq!(u32::from_le_bytes(bytes[4..8].try_into().unwrap()), 1);
        assert_eq!(u32::from_le_bytes(bytes[8..12].try_into().unwrap()), 8);
        assert_eq!(u32::from_le_bytes(bytes[12..16].try_into().unwrap()), 3);
    }
}
