//! Minimal HPACK header compression.
//!
//! The encoder emits every field as a literal without indexing with a
//! literal name and no Huffman coding, which every decoder must accept.
//!
//! The decoder handles indexed fields (static and dynamic table), all
//! three literal forms, dynamic table size updates, and Huffman-coded
//! strings. A string that cannot be decoded fails the whole block.

use super::huffman;
use crate::config::TransportConfig;
use crate::error::{Result, TetherError};
use std::collections::VecDeque;

const STATIC_TABLE: [(&str, &str); 61] = [
    (":authority", ""),
    (":method", "GET"),
    (":method", "POST"),
    (":path", "/"),
    (":path", "/index.html"),
    (":scheme", "http"),
    (":scheme", "https"),
    (":status", "200"),
    (":status", "204"),
    (":status", "206"),
    (":status", "304"),
    (":status", "400"),
    (":status", "404"),
    (":status", "500"),
    ("accept-charset", ""),
    ("accept-encoding", "gzip, deflate"),
    ("accept-language", ""),
    ("accept-ranges", ""),
    ("accept", ""),
    ("access-control-allow-origin", ""),
    ("age", ""),
    ("allow", ""),
    ("authorization", ""),
    ("cache-control", ""),
    ("content-disposition", ""),
    ("content-encoding", ""),
    ("content-language", ""),
    ("content-length", ""),
    ("content-location", ""),
    ("content-range", ""),
    ("content-type", ""),
    ("cookie", ""),
    ("date", ""),
    ("etag", ""),
    ("expect", ""),
    ("expires", ""),
    ("from", ""),
    ("host", ""),
    ("if-match", ""),
    ("if-modified-since", ""),
    ("if-none-match", ""),
    ("if-range", ""),
    ("if-unmodified-since", ""),
    ("last-modified", ""),
    ("link", ""),
    ("location", ""),
    ("max-forwards", ""),
    ("proxy-authenticate", ""),
    ("proxy-authorization", ""),
    ("range", ""),
    ("referer", ""),
    ("refresh", ""),
    ("retry-after", ""),
    ("server", ""),
    ("set-cookie", ""),
    ("strict-transport-security", ""),
    ("transfer-encoding", ""),
    ("user-agent", ""),
    ("vary", ""),
    ("via", ""),
    ("www-authenticate", ""),
];

/// Per-entry overhead used in dynamic table size accounting.
const ENTRY_OVERHEAD: usize = 32;

/// Encode a header list as a header block fragment.
pub fn encode_headers<'a, I>(headers: I) -> Vec<u8>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut out = Vec::new();
    for (name, value) in headers {
        // Literal Header Field without Indexing, New Name
        out.push(0x00);
        encode_string(&mut out, name.to_ascii_lowercase().as_bytes());
        encode_string(&mut out, value.as_bytes());
    }
    out
}

fn encode_string(out: &mut Vec<u8>, bytes: &[u8]) {
    encode_integer(out, bytes.len(), 7, 0x00);
    out.extend_from_slice(bytes);
}

/// Encode `value` with an N-bit prefix; `first` carries the pattern bits.
pub fn encode_integer(out: &mut Vec<u8>, value: usize, prefix_bits: u8, first: u8) {
    let max_prefix = (1usize << prefix_bits) - 1;
    if value < max_prefix {
        out.push(first | value as u8);
        return;
    }
    out.push(first | max_prefix as u8);
    let mut rest = value - max_prefix;
    while rest >= 128 {
        out.push((rest % 128) as u8 | 0x80);
        rest /= 128;
    }
    out.push(rest as u8);
}

/// Decode an N-bit prefix integer starting at `buf[*pos]`.
pub fn decode_integer(buf: &[u8], pos: &mut usize, prefix_bits: u8) -> Result<usize> {
    let max_prefix = (1usize << prefix_bits) - 1;
    let first = *buf
        .get(*pos)
        .ok_or_else(|| TetherError::protocol("HPACK integer truncated"))?;
    *pos += 1;
    let mut value = (first as usize) & max_prefix;
    if value < max_prefix {
        return Ok(value);
    }
    let mut shift = 0u32;
    loop {
        let byte = *buf
            .get(*pos)
            .ok_or_else(|| TetherError::protocol("HPACK integer truncated"))?;
        *pos += 1;
        if shift > 28 {
            return Err(TetherError::protocol("HPACK integer overflow"));
        }
        value += ((byte & 0x7f) as usize) << shift;
        shift += 7;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
}

fn decode_string(buf: &[u8], pos: &mut usize) -> Result<String> {
    let huffman = buf
        .get(*pos)
        .map(|b| b & 0x80 != 0)
        .ok_or_else(|| TetherError::protocol("HPACK string truncated"))?;
    let len = decode_integer(buf, pos, 7)?;
    let bytes = buf
        .get(*pos..*pos + len)
        .ok_or_else(|| TetherError::protocol("HPACK string length exceeds block"))?;
    *pos += len;
    let bytes = if huffman {
        huffman::decode(bytes)?
    } else {
        bytes.to_vec()
    };
    String::from_utf8(bytes).map_err(|_| TetherError::protocol("HPACK string is not valid UTF-8"))
}

#[derive(Debug, Clone)]
struct DynamicEntry {
    name: String,
    value: String,
}

impl DynamicEntry {
    fn size(&self) -> usize {
        self.name.len() + self.value.len() + ENTRY_OVERHEAD
    }
}

/// Stateful decoder; one per connection.
#[derive(Debug)]
pub struct HpackDecoder {
    table: VecDeque<DynamicEntry>,
    size: usize,
    max_size: usize,
}

impl Default for HpackDecoder {
    fn default() -> Self {
        Self::new(TransportConfig::HPACK_DEFAULT_TABLE_SIZE)
    }
}

impl HpackDecoder {
    pub fn new(max_size: usize) -> Self {
        Self {
            table: VecDeque::new(),
            size: 0,
            max_size,
        }
    }

    /// Decode one complete header block.
    pub fn decode(&mut self, block: &[u8]) -> Result<Vec<(String, String)>> {
        let mut headers = Vec::new();
        let mut pos = 0;
        while pos < block.len() {
            let b = block[pos];
            if b & 0x80 != 0 {
                // Indexed Header Field
                let index = decode_integer(block, &mut pos, 7)?;
                headers.push(self.lookup(index)?);
            } else if b & 0xc0 == 0x40 {
                // Literal with Incremental Indexing
                let (name, value) = self.decode_literal(block, &mut pos, 6)?;
                self.insert(DynamicEntry {
                    name: name.clone(),
                    value: value.clone(),
                });
                headers.push((name, value));
            } else if b & 0xe0 == 0x20 {
                // Dynamic Table Size Update
                let new_size = decode_integer(block, &mut pos, 5)?;
                if new_size > TransportConfig::HPACK_DEFAULT_TABLE_SIZE {
                    return Err(TetherError::protocol(format!(
                        "HPACK table size update {} exceeds advertised limit",
                        new_size
                    )));
                }
                self.max_size = new_size;
                self.evict();
            } else {
                // Literal without Indexing / Never Indexed
                headers.push(self.decode_literal(block, &mut pos, 4)?);
            }
        }
        Ok(headers)
    }

    fn decode_literal(
        &self,
        block: &[u8],
        pos: &mut usize,
        prefix_bits: u8,
    ) -> Result<(String, String)> {
        let index = decode_integer(block, pos, prefix_bits)?;
        let name = if index == 0 {
            decode_string(block, pos)?
        } else {
            self.lookup(index)?.0
        };
        let value = decode_string(block, pos)?;
        Ok((name, value))
    }

    fn lookup(&self, index: usize) -> Result<(String, String)> {
        if index == 0 {
            return Err(TetherError::protocol("HPACK index 0 is invalid"));
        }
        if index <= STATIC_TABLE.len() {
            let (n, v) = STATIC_TABLE[index - 1];
            return Ok((n.to_string(), v.to_string()));
        }
        let entry = self
            .table
            .get(index - STATIC_TABLE.len() - 1)
            .ok_or_else(|| TetherError::protocol(format!("HPACK index {} out of range", index)))?;
        Ok((entry.name.clone(), entry.value.clone()))
    }

    fn insert(&mut self, entry: DynamicEntry) {
        let size = entry.size();
        if size > self.max_size {
            // An oversized entry empties the table and is not stored
            self.table.clear();
            self.size = 0;
            return;
        }
        self.size += size;
        self.table.push_front(entry);
        self.evict();
    }

    fn evict(&mut self) {
        while self.size > self.max_size {
            match self.table.pop_back() {
                Some(old) => self.size -= old.size(),
                None => break,
            }
        }
    }

    pub fn table_len(&self) -> usize {
        self.table.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_prefix_examples() {
        // RFC 7541 C.1.1 and C.1.2
        let mut out = Vec::new();
        encode_integer(&mut out, 10, 5, 0);
        assert_eq!(out, vec![10]);

        let mut out = Vec::new();
        encode_integer(&mut out, 1337, 5, 0);
        assert_eq!(out, vec![31, 154, 10]);

        let mut pos = 0;
        assert_eq!(decode_integer(&out, &mut pos, 5).unwrap(), 1337);
        assert_eq!(pos, 3);
    }

    #[test]
    fn test_encoded_block_decodes() {
        let block = encode_headers([(":method", "POST"), ("Content-Type", "application/grpc")]);
        let mut decoder = HpackDecoder::default();
        let headers = decoder.decode(&block).unwrap();
        assert_eq!(
            headers,
            vec![
                (":method".to_string(), "POST".to_string()),
                ("content-type".to_string(), "application/grpc".to_string()),
            ]
        );
        assert_eq!(decoder.table_len(), 0);
    }

    #[test]
    fn test_static_index_and_incremental_indexing() {
        // RFC 7541 C.3.1 request without Huffman
        let block: Vec<u8> = vec![
            0x82, 0x86, 0x84, 0x41, 0x0f, b'w', b'w', b'w', b'.', b'e', b'x', b'a', b'm', b'p',
            b'l', b'e', b'.', b'c', b'o', b'm',
        ];
        let mut decoder = HpackDecoder::default();
        let headers = decoder.decode(&block).unwrap();
        assert_eq!(headers[0], (":method".into(), "GET".into()));
        assert_eq!(headers[1], (":scheme".into(), "http".into()));
        assert_eq!(headers[2], (":path".into(), "/".into()));
        assert_eq!(headers[3], (":authority".into(), "www.example.com".into()));
        assert_eq!(decoder.table_len(), 1);

        // Index 62 now refers to the dynamic entry
        let again = decoder.decode(&[0xbe]).unwrap();
        assert_eq!(again, vec![(":authority".into(), "www.example.com".into())]);
    }

    #[test]
    fn test_huffman_request_with_dynamic_table() {
        // RFC 7541 C.4.1 and C.4.2
        let mut decoder = HpackDecoder::default();
        let first: Vec<u8> = vec![
            0x82, 0x86, 0x84, 0x41, 0x8c, 0xf1, 0xe3, 0xc2, 0xe5, 0xf2, 0x3a, 0x6b, 0xa0, 0xab,
            0x90, 0xf4, 0xff,
        ];
        let headers = decoder.decode(&first).unwrap();
        assert_eq!(headers[3], (":authority".into(), "www.example.com".into()));

        let second: Vec<u8> = vec![
            0x82, 0x86, 0x84, 0xbe, 0x58, 0x86, 0xa8, 0xeb, 0x10, 0x64, 0x9c, 0xbf,
        ];
        let headers = decoder.decode(&second).unwrap();
        assert_eq!(headers[3], (":authority".into(), "www.example.com".into()));
        assert_eq!(headers[4], ("cache-control".into(), "no-cache".into()));
        assert_eq!(decoder.table_len(), 2);
    }

    #[test]
    fn test_huffman_literal_name() {
        let mut block = vec![0x00];
        let name = huffman::encode(b"grpc-status");
        encode_integer(&mut block, name.len(), 7, 0x80);
        block.extend_from_slice(&name);
        block.extend_from_slice(&[0x02, b'1', b'4']);

        let headers = HpackDecoder::default().decode(&block).unwrap();
        assert_eq!(headers, vec![("grpc-status".into(), "14".into())]);
    }

    #[test]
    fn test_undecodable_huffman_string_fails_block() {
        // literal without indexing, indexed name 31 (content-type), huffman value
        // 0x18: a valid 'a' followed by zero padding
        let block = vec![0x0f, 0x10, 0x81, 0x18, 0x88];
        assert!(HpackDecoder::default().decode(&block).is_err());
    }

    #[test]
    fn test_truncated_and_invalid_blocks() {
        let mut decoder = HpackDecoder::default();
        assert!(decoder.decode(&[0x80]).is_err()); // index 0
        assert!(decoder.decode(&[0xff, 0x80]).is_err()); // truncated integer
        assert!(decoder.decode(&[0x00, 0x05, b'a']).is_err()); // short string
        assert!(decoder.decode(&[0xc0]).is_err()); // dynamic index out of range
    }
}
