//! Byte-level reader and writer shared by every packet codec.

use std::net::{IpAddr, Ipv6Addr, SocketAddr};

use super::error::{DecodeError, EncodeError};
use super::MAX_PACKET_SIZE;
use crate::crypto::EcdhPublicKey;
use crate::identity::{RegistrationId, RegistrationSignature};
use crate::neighbor::NeighborToken;

/// Size of an encoded endpoint: IPv6 (IPv4-mapped when needed) + port.
pub const ENDPOINT_SIZE: usize = 18;

/// Encode an endpoint as 16 address bytes followed by a LE port.
pub fn encode_endpoint(addr: &SocketAddr) -> [u8; ENDPOINT_SIZE] {
    let ip = match addr.ip() {
        IpAddr::V4(v4) => v4.to_ipv6_mapped(),
        IpAddr::V6(v6) => v6,
    };
    let mut out = [0u8; ENDPOINT_SIZE];
    out[..16].copy_from_slice(&ip.octets());
    out[16..].copy_from_slice(&addr.port().to_le_bytes());
    out
}

/// Decode an endpoint. Unspecified addresses and port zero are invalid.
pub fn decode_endpoint(bytes: &[u8; ENDPOINT_SIZE]) -> Option<SocketAddr> {
    let mut octets = [0u8; 16];
    octets.copy_from_slice(&bytes[..16]);
    let v6 = Ipv6Addr::from(octets);
    let port = u16::from_le_bytes([bytes[16], bytes[17]]);
    if port == 0 || v6.is_unspecified() {
        return None;
    }
    let ip = match v6.to_ipv4_mapped() {
        Some(v4) => IpAddr::V4(v4),
        None => IpAddr::V6(v6),
    };
    Some(SocketAddr::new(ip, port))
}

/// Encode a bare IP address as 16 bytes.
pub fn encode_ip(ip: &IpAddr) -> [u8; 16] {
    match ip {
        IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
        IpAddr::V6(v6) => v6.octets(),
    }
}

/// Decode a 16-byte address, unmapping IPv4.
pub fn decode_ip(bytes: [u8; 16]) -> IpAddr {
    let v6 = Ipv6Addr::from(bytes);
    match v6.to_ipv4_mapped() {
        Some(v4) => IpAddr::V4(v4),
        None => IpAddr::V6(v6),
    }
}

// ============================================================================
// Writer
// ============================================================================

/// Append-only packet builder.
#[derive(Debug, Default)]
pub(crate) struct PacketWriter {
    buf: Vec<u8>,
}

impl PacketWriter {
    pub(crate) fn new() -> Self {
        Self {
            buf: Vec::with_capacity(128),
        }
    }

    pub(crate) fn u8(&mut self, v: u8) -> &mut Self {
        self.buf.push(v);
        self
    }

    pub(crate) fn u16(&mut self, v: u16) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub(crate) fn u32(&mut self, v: u32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub(crate) fn bytes(&mut self, v: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(v);
        self
    }

    pub(crate) fn token(&mut self, t: NeighborToken) -> &mut Self {
        self.bytes(&t.to_le_bytes())
    }

    pub(crate) fn endpoint(&mut self, addr: &SocketAddr) -> &mut Self {
        self.bytes(&encode_endpoint(addr))
    }

    pub(crate) fn id(&mut self, id: &RegistrationId) -> &mut Self {
        self.bytes(id.as_bytes())
    }

    pub(crate) fn signature(&mut self, sig: &RegistrationSignature) -> &mut Self {
        self.bytes(sig.as_bytes())
    }

    pub(crate) fn ecdh(&mut self, key: &EcdhPublicKey) -> &mut Self {
        self.bytes(key.as_bytes())
    }

    /// Length-prefixed (u16) variable field with an upper bound.
    pub(crate) fn var_bytes(
        &mut self,
        field: &'static str,
        v: &[u8],
        max: usize,
    ) -> Result<&mut Self, EncodeError> {
        if v.len() > max {
            return Err(EncodeError::FieldTooLong {
                field,
                max,
                got: v.len(),
            });
        }
        self.u16(v.len() as u16);
        Ok(self.bytes(v))
    }

    pub(crate) fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    /// Finish the packet, rejecting anything that would fragment.
    pub(crate) fn finish(self) -> Result<Vec<u8>, EncodeError> {
        if self.buf.len() > MAX_PACKET_SIZE {
            return Err(EncodeError::Oversized {
                max: MAX_PACKET_SIZE,
                got: self.buf.len(),
            });
        }
        Ok(self.buf)
    }
}

// ============================================================================
// Reader
// ============================================================================

/// Strict cursor over a received packet body.
#[derive(Debug)]
pub(crate) struct PacketReader<'a> {
    data: &'a [u8],
    pos: usize,
    /// Offset of `data` inside the full datagram, for error reporting.
    base: usize,
}

impl<'a> PacketReader<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self::with_base(data, 0)
    }

    pub(crate) fn with_base(data: &'a [u8], base: usize) -> Self {
        Self { data, pos: 0, base }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        let end = self.pos + n;
        if end > self.data.len() {
            return Err(DecodeError::Truncated {
                needed: self.base + end,
                len: self.base + self.data.len(),
            });
        }
        let out = &self.data[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    pub(crate) fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    pub(crate) fn u16(&mut self) -> Result<u16, DecodeError> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    pub(crate) fn u32(&mut self) -> Result<u32, DecodeError> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    pub(crate) fn array<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub(crate) fn token(&mut self) -> Result<NeighborToken, DecodeError> {
        Ok(NeighborToken::from_le_bytes(self.array()?))
    }

    pub(crate) fn endpoint(&mut self) -> Result<SocketAddr, DecodeError> {
        decode_endpoint(&self.array()?).ok_or(DecodeError::InvalidEndpoint)
    }

    pub(crate) fn id(&mut self) -> Result<RegistrationId, DecodeError> {
        Ok(RegistrationId::from_bytes(self.array()?))
    }

    pub(crate) fn signature(&mut self) -> Result<RegistrationSignature, DecodeError> {
        Ok(RegistrationSignature::from_bytes(self.array()?))
    }

    pub(crate) fn ecdh(&mut self) -> Result<EcdhPublicKey, DecodeError> {
        Ok(EcdhPublicKey::from_bytes(self.array()?))
    }

    /// Length-prefixed (u16) variable field with an upper bound.
    pub(crate) fn var_bytes(
        &mut self,
        field: &'static str,
        max: usize,
    ) -> Result<Vec<u8>, DecodeError> {
        let len = self.u16()?;
        if len as usize > max {
            return Err(DecodeError::InvalidValue {
                field,
                value: len as u32,
            });
        }
        Ok(self.take(len as usize)?.to_vec())
    }

    /// Require that the whole body was consumed.
    pub(crate) fn finish(&self) -> Result<(), DecodeError> {
        let rest = self.data.len() - self.pos;
        if rest != 0 {
            return Err(DecodeError::TrailingBytes(rest));
        }
        Ok(())
    }
}
