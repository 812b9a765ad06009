//! Minimal mDNS message codec
//!
//! Builds and parses exactly the messages local discovery needs: a PTR
//! question for `_<app>._tcp.local`, and a response carrying a TXT record
//! (name and fingerprint), a PTR record, and an SRV record with the
//! announcing node's port. Anything that deviates from this shape is
//! rejected rather than interpreted.

struct BufWriter {
    buf: Vec<u8>,
}

impl BufWriter {
    fn new() -> Self {
        Self { buf: Vec::with_capacity(512) }
    }

    fn add(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    fn add_u8(&mut self, val: u8) {
        self.buf.push(val);
    }

    fn add_u16(&mut self, val: u16) {
        self.add(&val.to_be_bytes());
    }

    fn add_u32(&mut self, val: u32) {
        self.add(&val.to_be_bytes());
    }

    /// A DNS label: length byte plus contents.
    fn add_label(&mut self, s: &str) -> bool {
        if s.len() >= 256 {
            return false;
        }

        self.add_u8(s.len() as u8);
        self.add(s.as_bytes());
        true
    }

    /// An underscore-prefixed service label.
    fn add_ulabel(&mut self, s: &str) -> bool {
        if s.len() + 1 >= 256 {
            return false;
        }

        self.add_u8(s.len() as u8 + 1);
        self.add_u8(b'_');
        self.add(s.as_bytes());
        true
    }

    /// A TXT key=value pair.
    fn add_kvp(&mut self, key: &str, val: &str) -> bool {
        let len = key.len() + val.len() + 1;

        if len >= 256 {
            return false;
        }

        self.add_u8(len as u8);
        self.add(key.as_bytes());
        self.add_u8(b'=');
        self.add(val.as_bytes());
        true
    }

    /// Reserve a 2-byte RDATA length slot; fill it with `end_len`.
    fn start_len(&mut self) -> usize {
        let pos = self.buf.len();
        self.add_u16(0);
        pos
    }

    fn end_len(&mut self, pos: usize) {
        let len = (self.buf.len() - pos - 2) as u16;
        self.buf[pos..pos + 2].copy_from_slice(&len.to_be_bytes());
    }
}

struct BufReader<'a> {
    buf: &'a [u8],
    pos: usize,
    ok: bool,
}

impl<'a> BufReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0, ok: true }
    }

    fn take(&mut self, n: usize) -> &'a [u8] {
        if !self.ok || self.buf.len() - self.pos < n {
            self.ok = false;
            return &[];
        }

        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        out
    }

    fn check(&mut self, expected: &[u8]) {
        let got = self.take(expected.len());

        if got != expected {
            self.ok = false;
        }
    }

    fn check_u8(&mut self, val: u8) {
        self.check(&[val]);
    }

    fn check_u16(&mut self, val: u16) {
        self.check(&val.to_be_bytes());
    }

    fn check_u32(&mut self, val: u32) {
        self.check(&val.to_be_bytes());
    }

    fn get_u16(&mut self) -> u16 {
        let bytes = self.take(2);
        if bytes.len() == 2 {
            u16::from_be_bytes([bytes[0], bytes[1]])
        } else {
            0
        }
    }

    fn check_label(&mut self, s: &str) {
        self.check_u8(s.len() as u8);
        self.check(s.as_bytes());
    }

    fn check_ulabel(&mut self, s: &str) {
        self.check_u8(s.len() as u8 + 1);
        self.check_u8(b'_');
        self.check(s.as_bytes());
    }

    fn get_label(&mut self) -> String {
        let len = usize::from(self.take(1).first().copied().unwrap_or(0));
        String::from_utf8_lossy(self.take(len)).into_owned()
    }

    fn get_kvp(&mut self, key: &str) -> Option<String> {
        let label = self.get_label();

        if !self.ok {
            return None;
        }

        let (k, v) = label.split_once('=')?;

        if k != key {
            self.ok = false;
            return None;
        }

        Some(v.to_string())
    }

    /// Read the RDATA length slot and remember where it started.
    fn check_len_start(&mut self) -> (usize, u16) {
        let len = self.get_u16();
        (self.pos, len)
    }

    fn check_len_end(&mut self, start: (usize, u16)) {
        if self.ok && (self.pos - start.0) as u16 != start.1 {
            self.ok = false;
        }
    }
}

/// Build a PTR question for `_<protocol>._<transport>.local`.
pub fn prepare_request(protocol: &str, transport: &str) -> Option<Vec<u8>> {
    let mut w = BufWriter::new();

    // Header: zero TX ID and flags, one question.
    w.add_u16(0);
    w.add_u16(0);
    w.add_u16(1);
    w.add_u16(0);
    w.add_u16(0);
    w.add_u16(0);

    if !w.add_ulabel(protocol) || !w.add_ulabel(transport) || !w.add_label("local") {
        return None;
    }

    w.add_u8(0);
    w.add_u16(0xc); // PTR
    w.add_u16(0x1); // IN

    Some(w.buf)
}

/// Check whether a message is a PTR question for our service.
pub fn parse_request(data: &[u8], protocol: &str, transport: &str) -> bool {
    let mut r = BufReader::new(data);

    r.get_u16(); // TX ID
    r.check_u16(0); // flags
    r.check_u16(1); // questions
    r.get_u16();
    r.get_u16();
    r.get_u16();

    r.check_ulabel(protocol);
    r.check_ulabel(transport);
    r.check_label("local");
    r.check_u8(0);
    r.check_u16(0xc);
    r.check_u16(0x1);

    r.ok
}

/// Build an announcement: TXT + PTR + SRV for
/// `<name>._<protocol>._<transport>.local`.
pub fn prepare_response(
    name: &str,
    protocol: &str,
    transport: &str,
    port: u16,
    keys: &[(&str, &str)],
) -> Option<Vec<u8>> {
    let mut w = BufWriter::new();

    // Header: authoritative response with three answer records.
    w.add_u16(0);
    w.add_u16(0x8400);
    w.add_u16(0);
    w.add_u16(3);
    w.add_u16(0);
    w.add_u16(0);

    // TXT record; remember name offsets for compression pointers.
    let full_name = w.buf.len() as u16;

    if !w.add_label(name) {
        return None;
    }

    let protocol_offset = w.buf.len() as u16;

    if !w.add_ulabel(protocol) || !w.add_ulabel(transport) {
        return None;
    }

    let local_offset = w.buf.len() as u16;

    if !w.add_label("local") {
        return None;
    }

    w.add_u8(0);
    w.add_u16(0x10); // TXT
    w.add_u16(0x1); // IN
    w.add_u32(3600);

    let len_pos = w.start_len();

    for (key, val) in keys {
        if !w.add_kvp(key, val) {
            return None;
        }
    }

    w.end_len(len_pos);

    // PTR record pointing at the full instance name.
    w.add_u16(0xc000 | protocol_offset);
    w.add_u16(0xc); // PTR
    w.add_u16(0x8001); // IN, cache flush
    w.add_u32(3600);
    let len_pos = w.start_len();
    w.add_u16(0xc000 | full_name);
    w.end_len(len_pos);

    // SRV record with the listening port.
    w.add_u16(0xc000 | full_name);
    w.add_u16(0x21); // SRV
    w.add_u16(0x8001);
    w.add_u32(120);
    let len_pos = w.start_len();
    w.add_u16(0); // priority
    w.add_u16(0); // weight
    w.add_u16(port);

    if !w.add_label(name) {
        return None;
    }

    w.add_u16(0xc000 | local_offset);
    w.end_len(len_pos);

    Some(w.buf)
}

/// Parse an announcement built by [`prepare_response`]. Returns the
/// instance name, port, and the requested TXT values in key order.
pub fn parse_response(
    data: &[u8],
    protocol: &str,
    transport: &str,
    keys: &[&str],
) -> Option<(String, u16, Vec<String>)> {
    let mut r = BufReader::new(data);

    r.check_u16(0);
    r.check_u16(0x8400);
    r.check_u16(0);
    r.check_u16(3);
    r.check_u16(0);
    r.check_u16(0);

    if !r.ok {
        return None;
    }

    // TXT record.
    let full_name = r.pos as u16;
    let name = r.get_label();
    let protocol_offset = r.pos as u16;
    r.check_ulabel(protocol);
    r.check_ulabel(transport);
    let local_offset = r.pos as u16;
    r.check_label("local");
    r.check_u8(0);
    r.check_u16(0x10);
    r.check_u16(0x1);
    r.check_u32(3600);

    let len_start = r.check_len_start();
    let mut values = Vec::with_capacity(keys.len());

    for key in keys {
        values.push(r.get_kvp(key)?);
    }

    r.check_len_end(len_start);

    if !r.ok {
        return None;
    }

    // PTR record.
    r.check_u16(0xc000 | protocol_offset);
    r.check_u16(0xc);
    r.check_u16(0x8001);
    r.check_u32(3600);
    let len_start = r.check_len_start();
    r.check_u16(0xc000 | full_name);
    r.check_len_end(len_start);

    if !r.ok {
        return None;
    }

    // SRV record.
    r.check_u16(0xc000 | full_name);
    r.check_u16(0x21);
    r.check_u16(0x8001);
    r.check_u32(120);
    let len_start = r.check_len_start();
    r.check_u16(0);
    r.check_u16(0);
    let port = r.get_u16();
    r.check_label(&name);
    r.check_u16(0xc000 | local_offset);
    r.check_len_end(len_start);

    if r.ok && r.pos == r.buf.len() {
        Some((name, port, values))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_roundtrip() {
        let msg = prepare_request("chat", "tcp").unwrap();
        assert!(parse_request(&msg, "chat", "tcp"));
        assert!(!parse_request(&msg, "other", "tcp"));
    }

    #[test]
    fn test_response_roundtrip() {
        let msg = prepare_response(
            "node_a",
            "chat",
            "tcp",
            655,
            &[("name", "node_a"), ("fingerprint", "abc123")],
        )
        .unwrap();

        let (name, port, values) =
            parse_response(&msg, "chat", "tcp", &["name", "fingerprint"]).unwrap();
        assert_eq!(name, "node_a");
        assert_eq!(port, 655);
        assert_eq!(values, vec!["node_a".to_string(), "abc123".to_string()]);
    }

    #[test]
    fn test_response_for_other_service_rejected() {
        let msg = prepare_response("node_a", "chat", "tcp", 655, &[("name", "node_a")]).unwrap();
        assert!(parse_response(&msg, "game", "tcp", &["name"]).is_none());
    }

    #[test]
    fn test_truncated_response_rejected() {
        let msg = prepare_response("node_a", "chat", "tcp", 655, &[("name", "node_a")]).unwrap();
        assert!(parse_response(&msg[..msg.len() - 3], "chat", "tcp", &["name"]).is_none());
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(!parse_request(b"not dns at all", "chat", "tcp"));
        assert!(parse_response(&[0u8; 12], "chat", "tcp", &["name"]).is_none());
    }
}
