//! Minimal SOCKS5 server handshake: no authentication, CONNECT only.

use crate::error::ErrorCode;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const SOCKS_VERSION: u8 = 0x05;
const AUTH_NO_AUTH: u8 = 0x00;
const CMD_CONNECT: u8 = 0x01;
const ADDR_IPV4: u8 = 0x01;
const ADDR_DOMAIN: u8 = 0x03;
const ADDR_IPV6: u8 = 0x04;

pub const REPLY_GENERAL_FAILURE: u8 = 0x01;
pub const REPLY_CMD_NOT_SUPPORTED: u8 = 0x07;
pub const REPLY_ADDR_NOT_SUPPORTED: u8 = 0x08;

/// Success with the bound address elided (IPv4 0.0.0.0:0).
pub const SUCCESS_REPLY: [u8; 10] = [SOCKS_VERSION, 0x00, 0x00, ADDR_IPV4, 0, 0, 0, 0, 0, 0];

#[derive(Debug, Error)]
pub enum SocksError {
    #[error("unsupported SOCKS version {0:#04x}")]
    BadVersion(u8),
    #[error("unsupported SOCKS command {0:#04x}")]
    UnsupportedCommand(u8),
    #[error("unsupported address type {0:#04x}")]
    UnsupportedAddressType(u8),
    #[error("domain name is not valid UTF-8")]
    InvalidDomain,
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl SocksError {
    /// The two-byte error reply owed to the client, if any. A wrong version
    /// gets no reply; the socket is just closed.
    pub fn reply_code(&self) -> Option<u8> {
        match self {
            SocksError::UnsupportedCommand(_) => Some(REPLY_CMD_NOT_SUPPORTED),
            SocksError::UnsupportedAddressType(_) => Some(REPLY_ADDR_NOT_SUPPORTED),
            SocksError::BadVersion(_) | SocksError::InvalidDomain | SocksError::Io(_) => None,
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            SocksError::Io(_) => ErrorCode::IoError,
            _ => ErrorCode::ProtocolViolation,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocksTarget {
    pub host: String,
    pub port: u16,
}

/// Run the greeting and read the CONNECT request. Error replies are written
/// here; the caller sends the final success or failure reply once it knows
/// whether the forwarded channel opened.
pub async fn accept_request<S>(stream: &mut S) -> Result<SocksTarget, SocksError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let version = stream.read_u8().await?;
    if version != SOCKS_VERSION {
        return Err(SocksError::BadVersion(version));
    }
    let method_count = stream.read_u8().await? as usize;
    let mut methods = vec![0u8; method_count];
    stream.read_exact(&mut methods).await?;
    stream.write_all(&[SOCKS_VERSION, AUTH_NO_AUTH]).await?;

    let result = read_connect(stream).await;
    if let Err(err) = &result
        && let Some(code) = err.reply_code()
    {
        send_reply(stream, code).await?;
    }
    result
}

async fn read_connect<S>(stream: &mut S) -> Result<SocksTarget, SocksError>
where
    S: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    let [version, command, _reserved, address_type] = header;
    if version != SOCKS_VERSION {
        return Err(SocksError::BadVersion(version));
    }
    if command != CMD_CONNECT {
        return Err(SocksError::UnsupportedCommand(command));
    }

    let host = match address_type {
        ADDR_IPV4 => {
            let mut octets = [0u8; 4];
            stream.read_exact(&mut octets).await?;
            Ipv4Addr::from(octets).to_string()
        }
        ADDR_DOMAIN => {
            let len = stream.read_u8().await? as usize;
            let mut name = vec![0u8; len];
            stream.read_exact(&mut name).await?;
            String::from_utf8(name).map_err(|_| SocksError::InvalidDomain)?
        }
        ADDR_IPV6 => {
            let mut octets = [0u8; 16];
            stream.read_exact(&mut octets).await?;
            Ipv6Addr::from(octets).to_string()
        }
        other => return Err(SocksError::UnsupportedAddressType(other)),
    };
    let port = stream.read_u16().await?;
    Ok(SocksTarget { host, port })
}

pub async fn send_reply<S>(stream: &mut S, code: u8) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(&[SOCKS_VERSION, code]).await?;
    stream.flush().await
}
