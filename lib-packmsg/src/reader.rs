//! Packmsg decoder

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

use anyhow::{anyhow, bail, Result};

use crate::{EXT_SOCKADDR_IN, EXT_SOCKADDR_IN6, SOCKADDR_IN6_LEN, SOCKADDR_IN_LEN};

/// Consumes packmsg elements from a byte slice in order.
pub struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    /// True when every byte of the input has been consumed.
    pub fn done(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.buf.len() < n {
            bail!("packmsg input truncated");
        }

        let (head, rest) = self.buf.split_at(n);
        self.buf = rest;
        Ok(head)
    }

    fn peek_hdr(&self) -> Result<u8> {
        self.buf
            .first()
            .copied()
            .ok_or_else(|| anyhow!("packmsg input exhausted"))
    }

    fn read_hdr(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn read_le<const N: usize>(&mut self) -> Result<[u8; N]> {
        Ok(self.take(N)?.try_into().expect("sized take"))
    }

    pub fn get_nil(&mut self) -> Result<()> {
        match self.read_hdr()? {
            0xc0 => Ok(()),
            hdr => bail!("expected nil, got header {:#04x}", hdr),
        }
    }

    pub fn get_bool(&mut self) -> Result<bool> {
        match self.read_hdr()? {
            0xc2 => Ok(false),
            0xc3 => Ok(true),
            hdr => bail!("expected bool, got header {:#04x}", hdr),
        }
    }

    /// Read any integer element as a signed 64-bit value.
    fn get_int_any(&mut self) -> Result<i64> {
        let hdr = self.read_hdr()?;

        match hdr {
            0x00..=0x7f => Ok(i64::from(hdr)),
            0xe0..=0xff => Ok(i64::from(hdr as i8)),
            0xcc => Ok(i64::from(self.read_le::<1>()?[0])),
            0xcd => Ok(i64::from(u16::from_le_bytes(self.read_le()?))),
            0xce => Ok(i64::from(u32::from_le_bytes(self.read_le()?))),
            0xcf => {
                let v = u64::from_le_bytes(self.read_le()?);
                i64::try_from(v).map_err(|_| anyhow!("u64 value out of i64 range"))
            }
            0xd0 => Ok(i64::from(self.read_le::<1>()?[0] as i8)),
            0xd1 => Ok(i64::from(i16::from_le_bytes(self.read_le()?))),
            0xd2 => Ok(i64::from(i32::from_le_bytes(self.read_le()?))),
            0xd3 => Ok(i64::from_le_bytes(self.read_le()?)),
            _ => bail!("expected integer, got header {:#04x}", hdr),
        }
    }

    pub fn get_u8(&mut self) -> Result<u8> {
        u8::try_from(self.get_int_any()?).map_err(|_| anyhow!("integer out of u8 range"))
    }

    pub fn get_u16(&mut self) -> Result<u16> {
        u16::try_from(self.get_int_any()?).map_err(|_| anyhow!("integer out of u16 range"))
    }

    pub fn get_u32(&mut self) -> Result<u32> {
        u32::try_from(self.get_int_any()?).map_err(|_| anyhow!("integer out of u32 range"))
    }

    pub fn get_u64(&mut self) -> Result<u64> {
        u64::try_from(self.get_int_any()?).map_err(|_| anyhow!("integer out of u64 range"))
    }

    pub fn get_i32(&mut self) -> Result<i32> {
        i32::try_from(self.get_int_any()?).map_err(|_| anyhow!("integer out of i32 range"))
    }

    pub fn get_i64(&mut self) -> Result<i64> {
        self.get_int_any()
    }

    pub fn get_str(&mut self) -> Result<&'a str> {
        let hdr = self.read_hdr()?;

        let len = match hdr {
            0xa0..=0xbf => usize::from(hdr & 0x1f),
            0xd9 => usize::from(self.read_le::<1>()?[0]),
            0xda => usize::from(u16::from_le_bytes(self.read_le()?)),
            0xdb => u32::from_le_bytes(self.read_le()?) as usize,
            _ => bail!("expected string, got header {:#04x}", hdr),
        };

        std::str::from_utf8(self.take(len)?).map_err(|_| anyhow!("string is not valid UTF-8"))
    }

    pub fn get_bin(&mut self) -> Result<&'a [u8]> {
        let hdr = self.read_hdr()?;

        let len = match hdr {
            0xc4 => usize::from(self.read_le::<1>()?[0]),
            0xc5 => usize::from(u16::from_le_bytes(self.read_le()?)),
            0xc6 => u32::from_le_bytes(self.read_le()?) as usize,
            _ => bail!("expected binary, got header {:#04x}", hdr),
        };

        self.take(len)
    }

    pub fn get_ext(&mut self) -> Result<(i8, &'a [u8])> {
        let hdr = self.read_hdr()?;

        let len = match hdr {
            0xd4 => 1,
            0xd5 => 2,
            0xd6 => 4,
            0xd7 => 8,
            0xd8 => 16,
            0xc7 => usize::from(self.read_le::<1>()?[0]),
            0xc8 => usize::from(u16::from_le_bytes(self.read_le()?)),
            0xc9 => u32::from_le_bytes(self.read_le()?) as usize,
            _ => bail!("expected extension, got header {:#04x}", hdr),
        };

        let ext_type = self.read_hdr()? as i8;
        Ok((ext_type, self.take(len)?))
    }

    pub fn get_array(&mut self) -> Result<u32> {
        let hdr = self.read_hdr()?;

        match hdr {
            0x90..=0x9f => Ok(u32::from(hdr & 0x0f)),
            0xdc => Ok(u32::from(u16::from_le_bytes(self.read_le()?))),
            0xdd => Ok(u32::from_le_bytes(self.read_le()?)),
            _ => bail!("expected array, got header {:#04x}", hdr),
        }
    }

    /// Read a socket address extension element.
    pub fn get_sockaddr(&mut self) -> Result<SocketAddr> {
        let (ext_type, data) = self.get_ext()?;

        match ext_type {
            EXT_SOCKADDR_IN => {
                if data.len() != SOCKADDR_IN_LEN {
                    bail!("IPv4 sockaddr extension has wrong length {}", data.len());
                }

                let port = u16::from_be_bytes([data[0], data[1]]);
                let ip = Ipv4Addr::new(data[2], data[3], data[4], data[5]);
                Ok(SocketAddr::from((ip, port)))
            }
            EXT_SOCKADDR_IN6 => {
                if data.len() != SOCKADDR_IN6_LEN {
                    bail!("IPv6 sockaddr extension has wrong length {}", data.len());
                }

                let port = u16::from_be_bytes([data[0], data[1]]);
                let octets: [u8; 16] = data[6..22].try_into().expect("sized slice");
                Ok(SocketAddr::from((Ipv6Addr::from(octets), port)))
            }
            other => bail!("unknown sockaddr extension type {}", other),
        }
    }

    /// Skip one element of any type, including nested arrays.
    pub fn skip_element(&mut self) -> Result<()> {
        let hdr = self.peek_hdr()?;

        match hdr {
            0x90..=0x9f | 0xdc | 0xdd => {
                let count = self.get_array()?;

                for _ in 0..count {
                    self.skip_element()?;
                }

                Ok(())
            }
            0xa0..=0xbf | 0xd9 | 0xda | 0xdb => self.get_str().map(|_| ()),
            0xc4..=0xc6 => self.get_bin().map(|_| ()),
            0xc7..=0xc9 | 0xd4..=0xd8 => self.get_ext().map(|_| ()),
            0xc0 => self.get_nil(),
            0xc2 | 0xc3 => self.get_bool().map(|_| ()),
            _ => self.get_int_any().map(|_| ()),
        }
    }
}
