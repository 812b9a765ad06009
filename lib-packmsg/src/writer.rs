//! Packmsg encoder

use std::net::SocketAddr;

use crate::{EXT_SOCKADDR_IN, EXT_SOCKADDR_IN6, SOCKADDR_IN6_LEN, SOCKADDR_IN_LEN};

/// Appends packmsg elements to a growable buffer.
///
/// The encoder always emits the most compact representation of a value, so
/// encoding a decoded stream reproduces it byte for byte.
#[derive(Default)]
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(cap: usize) -> Self {
        Self {
            buf: Vec::with_capacity(cap),
        }
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn add_nil(&mut self) {
        self.buf.push(0xc0);
    }

    pub fn add_bool(&mut self, val: bool) {
        self.buf.push(if val { 0xc3 } else { 0xc2 });
    }

    pub fn add_u8(&mut self, val: u8) {
        if val < 0x80 {
            self.buf.push(val);
        } else {
            self.buf.push(0xcc);
            self.buf.push(val);
        }
    }

    pub fn add_u16(&mut self, val: u16) {
        if val > 0xff {
            self.buf.push(0xcd);
            self.buf.extend_from_slice(&val.to_le_bytes());
        } else {
            self.add_u8(val as u8);
        }
    }

    pub fn add_u32(&mut self, val: u32) {
        if val > 0xffff {
            self.buf.push(0xce);
            self.buf.extend_from_slice(&val.to_le_bytes());
        } else {
            self.add_u16(val as u16);
        }
    }

    pub fn add_u64(&mut self, val: u64) {
        if val > 0xffff_ffff {
            self.buf.push(0xcf);
            self.buf.extend_from_slice(&val.to_le_bytes());
        } else {
            self.add_u32(val as u32);
        }
    }

    pub fn add_i8(&mut self, val: i8) {
        if val >= -32 {
            // Positive and negative fixint share the raw two's complement byte.
            self.buf.push(val as u8);
        } else {
            self.buf.push(0xd0);
            self.buf.push(val as u8);
        }
    }

    pub fn add_i16(&mut self, val: i16) {
        if i16::from(val as i8) != val {
            self.buf.push(0xd1);
            self.buf.extend_from_slice(&val.to_le_bytes());
        } else {
            self.add_i8(val as i8);
        }
    }

    pub fn add_i32(&mut self, val: i32) {
        if i32::from(val as i16) != val {
            self.buf.push(0xd2);
            self.buf.extend_from_slice(&val.to_le_bytes());
        } else {
            self.add_i16(val as i16);
        }
    }

    pub fn add_i64(&mut self, val: i64) {
        if i64::from(val as i32) != val {
            self.buf.push(0xd3);
            self.buf.extend_from_slice(&val.to_le_bytes());
        } else {
            self.add_i32(val as i32);
        }
    }

    pub fn add_str(&mut self, s: &str) {
        let len = s.len() as u32;

        if len < 32 {
            self.buf.push(0xa0 | len as u8);
        } else if len <= 0xff {
            self.buf.push(0xd9);
            self.buf.push(len as u8);
        } else if len <= 0xffff {
            self.buf.push(0xda);
            self.buf.extend_from_slice(&(len as u16).to_le_bytes());
        } else {
            self.buf.push(0xdb);
            self.buf.extend_from_slice(&len.to_le_bytes());
        }

        self.buf.extend_from_slice(s.as_bytes());
    }

    pub fn add_bin(&mut self, data: &[u8]) {
        let len = data.len() as u32;

        if len <= 0xff {
            self.buf.push(0xc4);
            self.buf.push(len as u8);
        } else if len <= 0xffff {
            self.buf.push(0xc5);
            self.buf.extend_from_slice(&(len as u16).to_le_bytes());
        } else {
            self.buf.push(0xc6);
            self.buf.extend_from_slice(&len.to_le_bytes());
        }

        self.buf.extend_from_slice(data);
    }

    pub fn add_ext(&mut self, ext_type: i8, data: &[u8]) {
        let len = data.len() as u32;

        match len {
            1 => self.buf.push(0xd4),
            2 => self.buf.push(0xd5),
            4 => self.buf.push(0xd6),
            8 => self.buf.push(0xd7),
            16 => self.buf.push(0xd8),
            _ if len <= 0xff => {
                self.buf.push(0xc7);
                self.buf.push(len as u8);
            }
            _ if len <= 0xffff => {
                self.buf.push(0xc8);
                self.buf.extend_from_slice(&(len as u16).to_le_bytes());
            }
            _ => {
                self.buf.push(0xc9);
                self.buf.extend_from_slice(&len.to_le_bytes());
            }
        }

        self.buf.push(ext_type as u8);
        self.buf.extend_from_slice(data);
    }

    pub fn add_array(&mut self, count: u32) {
        if count <= 0xf {
            self.buf.push(0x90 | count as u8);
        } else if count <= 0xffff {
            self.buf.push(0xdc);
            self.buf.extend_from_slice(&(count as u16).to_le_bytes());
        } else {
            self.buf.push(0xdd);
            self.buf.extend_from_slice(&count.to_le_bytes());
        }
    }

    /// Add a socket address as an extension element.
    pub fn add_sockaddr(&mut self, sa: &SocketAddr) {
        match sa {
            SocketAddr::V4(v4) => {
                let mut data = [0u8; SOCKADDR_IN_LEN];
                data[..2].copy_from_slice(&v4.port().to_be_bytes());
                data[2..6].copy_from_slice(&v4.ip().octets());
                self.add_ext(EXT_SOCKADDR_IN, &data);
            }
            SocketAddr::V6(v6) => {
                let mut data = [0u8; SOCKADDR_IN6_LEN];
                data[..2].copy_from_slice(&v6.port().to_be_bytes());
                // Bytes 2..6 are flow label padding, left zero.
                data[6..22].copy_from_slice(&v6.ip().octets());
                self.add_ext(EXT_SOCKADDR_IN6, &data);
            }
        }
    }
}
