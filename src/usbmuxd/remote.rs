// Remote-SIB usbmux proxy handshake (component B, §6 "Usbmux socket").
//
// Dialing usbmuxd over TCP (rather than the local UNIX socket) requires a bespoke magic exchange
// before any usbmux request/reply traffic: both sides trade an 11-byte magic string
// "aOG2woSEEs/", split across two little-endian-length-prefixed writes, then a single plist
// packet describing the device and its remote lockdown port.
//
// The source this is grounded on panics on a magic mismatch during this handshake; the rewrite
// here always returns a typed error instead (see the "Panics on connection init" redesign note).

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::{IdeviceError, ReadWrite};

const MAGIC: &[u8] = b"aOG2woSEEs/";
const MAGIC_PREFIX_LEN: usize = 6;
const MAGIC_SUFFIX_LEN: usize = 5;

/// Device attributes carried alongside the remote lockdown port in the proxy handshake.
#[derive(Debug, Clone)]
pub struct RemoteDeviceProperties {
    pub serial_number: String,
    pub connection_speed: Option<u32>,
    pub location_id: Option<u32>,
    pub product_id: Option<u32>,
}

/// Performs the client side of the remote-SIB handshake on a freshly-accepted/connected socket,
/// returning the device's properties and the remote lockdown port to dial next.
pub async fn perform_handshake(
    socket: &mut Box<dyn ReadWrite>,
) -> Result<(RemoteDeviceProperties, u16), IdeviceError> {
    write_magic_chunk(socket, &MAGIC[..MAGIC_PREFIX_LEN]).await?;
    write_magic_chunk(socket, &MAGIC[MAGIC_PREFIX_LEN..]).await?;

    let prefix = read_magic_chunk(socket, MAGIC_PREFIX_LEN).await?;
    let suffix = read_magic_chunk(socket, MAGIC_SUFFIX_LEN).await?;
    if prefix != MAGIC[..MAGIC_PREFIX_LEN] || suffix != MAGIC[MAGIC_PREFIX_LEN..] {
        return Err(IdeviceError::UsbmuxProtocolError(-1));
    }

    let mut len_buf = [0u8; 4];
    socket.read_exact(&mut len_buf).await?;
    let len = u32::from_le_bytes(len_buf);
    let mut body = vec![0u8; len as usize];
    socket.read_exact(&mut body).await?;
    let value: plist::Dictionary = plist::from_bytes(&body)?;

    let properties = RemoteDeviceProperties {
        serial_number: value
            .get("SerialNumber")
            .and_then(|v| v.as_string())
            .ok_or(IdeviceError::UnexpectedResponse)?
            .to_string(),
        connection_speed: value
            .get("ConnectionSpeed")
            .and_then(|v| v.as_unsigned_integer())
            .map(|v| v as u32),
        location_id: value
            .get("LocationID")
            .and_then(|v| v.as_unsigned_integer())
            .map(|v| v as u32),
        product_id: value
            .get("ProductID")
            .and_then(|v| v.as_unsigned_integer())
            .map(|v| v as u32),
    };

    let mut port_buf = [0u8; 4];
    socket.read_exact(&mut port_buf).await?;
    let port = u32::from_le_bytes(port_buf) as u16;

    Ok((properties, port))
}

async fn write_magic_chunk(socket: &mut Box<dyn ReadWrite>, chunk: &[u8]) -> Result<(), IdeviceError> {
    socket.write_all(&(chunk.len() as u32).to_le_bytes()).await?;
    socket.write_all(chunk).await?;
    socket.flush().await?;
    Ok(())
}

async fn read_magic_chunk(
    socket: &mut Box<dyn ReadWrite>,
    expected_len: usize,
) -> Result<Vec<u8>, IdeviceError> {
    let mut len_buf = [0u8; 4];
    socket.read_exact(&mut len_buf).await?;
    let len = u32::from_le_bytes(len_buf) as usize;
    if len != expected_len {
        return Err(IdeviceError::MalformedFrame(format!(
            "remote usbmux handshake chunk length {len}, expected {expected_len}"
        )));
    }
    let mut buf = vec![0u8; len];
    socket.read_exact(&mut buf).await?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn handshake_rejects_bad_magic() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let server_task = tokio::spawn(async move {
            use tokio::io::{AsyncReadExt, AsyncWriteExt};
            let mut len_buf = [0u8; 4];
            server.read_exact(&mut len_buf).await.unwrap();
            let len = u32::from_le_bytes(len_buf) as usize;
            let mut buf = vec![0u8; len];
            server.read_exact(&mut buf).await.unwrap();

            server.read_exact(&mut len_buf).await.unwrap();
            let len = u32::from_le_bytes(len_buf) as usize;
            let mut buf = vec![0u8; len];
            server.read_exact(&mut buf).await.unwrap();

            // Respond with garbage instead of the real magic.
            server.write_all(&6u32.to_le_bytes()).await.unwrap();
            server.write_all(b"XXXXXX").await.unwrap();
            server.write_all(&5u32.to_le_bytes()).await.unwrap();
            server.write_all(b"YYYYY").await.unwrap();
        });

        let mut boxed: Box<dyn ReadWrite> = Box::new(client);
        let result = perform_handshake(&mut boxed).await;
        assert!(result.is_err());
        server_task.await.unwrap();
        let _ = &mut client; // silence unused warning path on some configs
    }
}
