use super::types::*;
use crate::utils::error::{AratagaError, Result};
use smallvec::SmallVec;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

/// Parse client greeting (method selection) for SOCKS5, starting from the
/// version byte.
pub async fn parse_socks5_client_greeting<S>(stream: &mut S) -> Result<ClientGreeting>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let version = stream.read_u8().await?;

    if version != SOCKS_VERSION {
        return Err(AratagaError::Protocol(format!(
            "Unsupported SOCKS version: 0x{:02x}",
            version
        )));
    }

    let nmethods = stream.read_u8().await?;

    if nmethods == 0 {
        return Err(AratagaError::Protocol(
            "No authentication methods provided".to_string(),
        ));
    }

    // Read methods - use SmallVec for stack allocation (clients typically offer 1-3 methods)
    let mut methods_buf = SmallVec::<[u8; 8]>::from_elem(0, nmethods as usize);
    stream.read_exact(&mut methods_buf).await?;

    let methods: Vec<AuthMethod> = methods_buf.into_iter().map(AuthMethod::from).collect();

    trace!("Parsed client greeting: {} methods", methods.len());

    Ok(ClientGreeting { methods })
}

/// Send server choice
#[inline(always)]
pub async fn send_server_choice<S>(stream: &mut S, method: AuthMethod) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let buf = [SOCKS_VERSION, method as u8];
    stream.write_all(&buf).await?;
    stream.flush().await?;

    trace!("Sent server choice: {:?}", method);

    Ok(())
}

/// Parse username/password authentication (RFC 1929)
pub async fn parse_userpass_auth<S>(stream: &mut S) -> Result<(String, String)>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let version = stream.read_u8().await?;

    if version != USERPASS_VERSION {
        return Err(AratagaError::Protocol(format!(
            "Unsupported userpass version: 0x{:02x}",
            version
        )));
    }

    // Read username - use SmallVec for stack allocation (most usernames < 64 bytes)
    let username_len = stream.read_u8().await? as usize;
    let mut username_buf = SmallVec::<[u8; 64]>::from_elem(0, username_len);
    stream.read_exact(&mut username_buf).await?;
    let username = String::from_utf8(username_buf.to_vec())
        .map_err(|_| AratagaError::Protocol("Invalid username encoding".to_string()))?;

    // Read password - use SmallVec for stack allocation (most passwords < 64 bytes)
    let password_len = stream.read_u8().await? as usize;
    let mut password_buf = SmallVec::<[u8; 64]>::from_elem(0, password_len);
    stream.read_exact(&mut password_buf).await?;
    let password = String::from_utf8(password_buf.to_vec())
        .map_err(|_| AratagaError::Protocol("Invalid password encoding".to_string()))?;

    trace!("Parsed userpass auth for user: {}", username);

    Ok((username, password))
}

/// Send authentication response (RFC 1929: 0x00 = success, 0x01 = failure)
#[inline(always)]
pub async fn send_auth_response<S>(stream: &mut S, success: bool) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let status = if success { 0x00 } else { 0x01 };
    let buf = [USERPASS_VERSION, status];
    stream.write_all(&buf).await?;
    stream.flush().await?;

    trace!(
        "Sent auth response: {}",
        if success { "success" } else { "failure" }
    );

    Ok(())
}

/// Parse SOCKS5 command PDU
pub async fn parse_socks5_request<S>(stream: &mut S) -> Result<Socks5Request>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    // Read fixed part: version, command, reserved, address type
    let mut buf = [0u8; 4];
    stream.read_exact(&mut buf).await?;

    let version = buf[0];
    let command = buf[1];
    let reserved = buf[2];
    let address_type = buf[3];

    if version != SOCKS_VERSION {
        return Err(AratagaError::Protocol(format!(
            "Unsupported SOCKS version: 0x{:02x}",
            version
        )));
    }

    // RFC 1928: Reserved field MUST be 0x00
    if reserved != 0x00 {
        trace!(
            "Non-zero reserved field in SOCKS5 request: 0x{:02x} (expected 0x00)",
            reserved
        );
    }

    let command = Command::try_from(command)?;

    let address = match address_type {
        0x01 => {
            // IPv4
            let mut addr = [0u8; 4];
            stream.read_exact(&mut addr).await?;
            Address::IPv4(addr)
        }
        0x03 => {
            // Domain name - use SmallVec for stack allocation (most domains < 128 bytes)
            let domain_len = stream.read_u8().await? as usize;
            if domain_len == 0 {
                return Err(AratagaError::Protocol(
                    "Empty domain name in SOCKS5 request".to_string(),
                ));
            }
            let mut domain_buf = SmallVec::<[u8; 128]>::from_elem(0, domain_len);
            stream.read_exact(&mut domain_buf).await?;
            let domain = String::from_utf8(domain_buf.to_vec())
                .map_err(|_| AratagaError::Protocol("Invalid domain encoding".to_string()))?;
            Address::Domain(domain)
        }
        0x04 => {
            // IPv6
            let mut addr = [0u8; 16];
            stream.read_exact(&mut addr).await?;
            Address::IPv6(addr)
        }
        _ => {
            return Err(AratagaError::UnsupportedAddressType(address_type));
        }
    };

    // Read port (big-endian)
    let port = stream.read_u16().await?;

    debug!(
        "Parsed SOCKS5 request: command={:?}, address={}, port={}",
        command, address, port
    );

    Ok(Socks5Request {
        command,
        address,
        port,
    })
}

/// Send SOCKS5 reply PDU
#[inline(always)]
pub async fn send_socks5_response<S>(
    stream: &mut S,
    reply: ReplyCode,
    bind_addr: Address,
    bind_port: u16,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    // Write version, reply, reserved - use SmallVec for stack allocation (response < 256 bytes)
    let mut buf = SmallVec::<[u8; 256]>::new();
    buf.push(SOCKS_VERSION);
    buf.push(reply as u8);
    buf.push(0x00);

    match &bind_addr {
        Address::IPv4(octets) => {
            buf.push(0x01);
            buf.extend_from_slice(octets);
        }
        Address::IPv6(octets) => {
            buf.push(0x04);
            buf.extend_from_slice(octets);
        }
        Address::Domain(domain) => {
            // RFC 1928: Domain name length is u8 (max 255 octets)
            if domain.len() > 255 {
                return Err(AratagaError::Protocol(format!(
                    "Domain name too long: {} octets (max 255)",
                    domain.len()
                )));
            }
            buf.push(0x03);
            buf.push(domain.len() as u8);
            buf.extend_from_slice(domain.as_bytes());
        }
    }

    // Write port (big-endian)
    buf.extend_from_slice(&bind_port.to_be_bytes());

    stream.write_all(&buf).await?;
    stream.flush().await?;

    debug!(
        "Sent SOCKS5 response: reply={:?}, bind_addr={}, bind_port={}",
        reply, bind_addr, bind_port
    );

    Ok(())
}
