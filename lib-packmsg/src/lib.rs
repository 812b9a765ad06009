//! Packmsg - little-endian MessagePack-like serialization
//!
//! The on-disk and bootstrap wire format for config blobs, invitation files
//! and export bundles. The element grammar is MessagePack's (fixint, str,
//! bin, ext, array, nil, bool, sized ints), but all multi-byte lengths and
//! integer payloads are little-endian.
//!
//! Socket addresses are carried as extension elements: type 4 holds a
//! 14-byte IPv4 tail (port, address, zero padding), type 6 a 22-byte IPv6
//! tail (port, flow label padding, address). Ports are in network byte
//! order inside the extension payload.
//!
//! [`Writer`] appends elements to a growable buffer; [`Reader`] consumes
//! them in order and fails fast on any type mismatch or truncation.

mod reader;
mod writer;

pub use reader::Reader;
pub use writer::Writer;

/// Extension type tag for IPv4 socket addresses.
pub const EXT_SOCKADDR_IN: i8 = 4;
/// Extension type tag for IPv6 socket addresses.
pub const EXT_SOCKADDR_IN6: i8 = 6;

/// Payload size of an IPv4 sockaddr extension.
pub const SOCKADDR_IN_LEN: usize = 14;
/// Payload size of an IPv6 sockaddr extension.
pub const SOCKADDR_IN6_LEN: usize = 22;

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    #[test]
    fn test_scalar_roundtrip() {
        let mut w = Writer::new();
        w.add_u32(7);
        w.add_u32(70000);
        w.add_i32(-5);
        w.add_i64(-4_000_000_000);
        w.add_u16(8080);
        w.add_bool(true);
        w.add_bool(false);
        w.add_nil();

        let buf = w.into_vec();
        let mut r = Reader::new(&buf);
        assert_eq!(r.get_u32().unwrap(), 7);
        assert_eq!(r.get_u32().unwrap(), 70000);
        assert_eq!(r.get_i32().unwrap(), -5);
        assert_eq!(r.get_i64().unwrap(), -4_000_000_000);
        assert_eq!(r.get_u16().unwrap(), 8080);
        assert!(r.get_bool().unwrap());
        assert!(!r.get_bool().unwrap());
        r.get_nil().unwrap();
        assert!(r.done());
    }

    #[test]
    fn test_str_bin_array_roundtrip() {
        let mut w = Writer::new();
        w.add_array(2);
        w.add_str("node_a");
        w.add_str(&"x".repeat(300));
        w.add_bin(&[1, 2, 3]);
        w.add_bin(&[]);

        let buf = w.into_vec();
        let mut r = Reader::new(&buf);
        assert_eq!(r.get_array().unwrap(), 2);
        assert_eq!(r.get_str().unwrap(), "node_a");
        assert_eq!(r.get_str().unwrap().len(), 300);
        assert_eq!(r.get_bin().unwrap(), &[1, 2, 3]);
        assert_eq!(r.get_bin().unwrap(), &[] as &[u8]);
        assert!(r.done());
    }

    #[test]
    fn test_sockaddr_roundtrip() {
        let v4: SocketAddr = "203.0.113.5:4000".parse().unwrap();
        let v6: SocketAddr = "[2001:db8::1]:655".parse().unwrap();

        let mut w = Writer::new();
        w.add_sockaddr(&v4);
        w.add_sockaddr(&v6);

        let buf = w.into_vec();
        let mut r = Reader::new(&buf);
        assert_eq!(r.get_sockaddr().unwrap(), v4);
        assert_eq!(r.get_sockaddr().unwrap(), v6);
        assert!(r.done());
    }

    #[test]
    fn test_skip_element() {
        let mut w = Writer::new();
        w.add_str("skipped");
        w.add_array(2);
        w.add_u32(1);
        w.add_bin(&[9; 40]);
        w.add_u32(42);

        let buf = w.into_vec();
        let mut r = Reader::new(&buf);
        r.skip_element().unwrap(); // string
        r.skip_element().unwrap(); // array incl. both elements
        assert_eq!(r.get_u32().unwrap(), 42);
        assert!(r.done());
    }

    #[test]
    fn test_type_mismatch_fails() {
        let mut w = Writer::new();
        w.add_str("text");
        let buf = w.into_vec();

        let mut r = Reader::new(&buf);
        assert!(r.get_u32().is_err());
    }

    #[test]
    fn test_truncated_input_fails() {
        let mut w = Writer::new();
        w.add_bin(&[0u8; 64]);
        let buf = w.into_vec();

        let mut r = Reader::new(&buf[..10]);
        assert!(r.get_bin().is_err());
    }

    #[test]
    fn test_encode_decode_encode_identical() {
        let mut w = Writer::new();
        w.add_u32(12);
        w.add_str("name");
        w.add_bin(&[7; 32]);
        w.add_i64(1234567890123);
        let buf = w.into_vec();

        let mut r = Reader::new(&buf);
        let mut w2 = Writer::new();
        w2.add_u32(r.get_u32().unwrap());
        w2.add_str(r.get_str().unwrap());
        w2.add_bin(r.get_bin().unwrap());
        w2.add_i64(r.get_i64().unwrap());
        assert_eq!(buf, w2.into_vec());
    }
}
