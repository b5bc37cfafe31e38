//! HPACK header compression (RFC 7541)
//!
//! [`Encoder`] turns a [`HeaderList`] into a header block for the peer,
//! [`Decoder`] turns a received block back into an ordered list. Each keeps
//! its own [`DynamicTable`]; the two never share entries.
//!
//! Strings are sent raw. Huffman-coded strings from the peer are decoded
//! with the `hpack` crate's Appendix B decoder.

use super::error::{Error, Result};
use super::headers::{HeaderField, HeaderList};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::VecDeque;

/// Initial dynamic table size for both directions
pub const DEFAULT_TABLE_SIZE: usize = 4096;

/// Static table entries (RFC 7541 Appendix A)
static STATIC_TABLE: [(&str, &str); 61] = [
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

/// Names whose values rarely repeat; indexing them only churns the table
const UNINDEXED_NAMES: [&str; 8] = [
    ":path",
    "content-length",
    "date",
    "etag",
    "if-modified-since",
    "if-none-match",
    "last-modified",
    "location",
];

/// Upper bound on decoded integers; anything larger is a malformed block
const MAX_INTEGER: usize = u32::MAX as usize;

fn static_find(name: &[u8], value: &[u8]) -> Option<usize> {
    STATIC_TABLE
        .iter()
        .position(|(n, v)| n.as_bytes() == name && v.as_bytes() == value)
        .map(|i| i + 1)
}

fn static_find_name(name: &[u8]) -> Option<usize> {
    STATIC_TABLE
        .iter()
        .position(|(n, _)| n.as_bytes() == name)
        .map(|i| i + 1)
}

/// Dynamic table: newest entry first, evicted from the back
#[derive(Debug, Clone)]
pub struct DynamicTable {
    entries: VecDeque<HeaderField>,
    size: usize,
    max_size: usize,
}

impl DynamicTable {
    /// Create an empty table with the given byte budget
    pub fn new(max_size: usize) -> Self {
        DynamicTable {
            entries: VecDeque::new(),
            size: 0,
            max_size,
        }
    }

    /// Current size (sum of entry sizes)
    pub fn size(&self) -> usize {
        self.size
    }

    /// Byte budget
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the table is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Change the budget, evicting oldest entries until it is met
    pub fn set_max_size(&mut self, max_size: usize) {
        self.max_size = max_size;
        self.evict_to(max_size);
    }

    /// Insert a new entry, evicting oldest entries to make room.
    ///
    /// An entry larger than the whole budget empties the table and is not
    /// stored (RFC 7541 Section 4.4).
    pub fn insert(&mut self, field: HeaderField) {
        let entry_size = field.size();
        if entry_size > self.max_size {
            self.entries.clear();
            self.size = 0;
            return;
        }
        self.evict_to(self.max_size - entry_size);
        self.size += entry_size;
        self.entries.push_front(field);
    }

    /// Entry by dynamic index (1 = newest)
    pub fn get(&self, index: usize) -> Option<&HeaderField> {
        index.checked_sub(1).and_then(|i| self.entries.get(i))
    }

    /// Iterate from newest to oldest
    pub fn iter(&self) -> impl Iterator<Item = &HeaderField> {
        self.entries.iter()
    }

    /// Absolute index (static + dynamic) of an exact name/value match
    pub fn find(&self, name: &[u8], value: &[u8]) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| &e.name[..] == name && &e.value[..] == value)
            .map(|i| STATIC_TABLE.len() + i + 1)
    }

    /// Absolute index of a name match
    pub fn find_name(&self, name: &[u8]) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| &e.name[..] == name)
            .map(|i| STATIC_TABLE.len() + i + 1)
    }

    fn evict_to(&mut self, budget: usize) {
        while self.size > budget {
            match self.entries.pop_back() {
                Some(evicted) => self.size -= evicted.size(),
                None => break,
            }
        }
    }
}

impl Default for DynamicTable {
    fn default() -> Self {
        DynamicTable::new(DEFAULT_TABLE_SIZE)
    }
}

/// Header block encoder for one connection direction
#[derive(Debug, Clone, Default)]
pub struct Encoder {
    table: DynamicTable,
    /// Smallest and latest table size since the last block
    pending_size_update: Option<(usize, usize)>,
}

impl Encoder {
    /// Create an encoder with the default table size
    pub fn new() -> Self {
        Encoder::default()
    }

    /// Get the encoder's dynamic table
    pub fn table(&self) -> &DynamicTable {
        &self.table
    }

    /// Apply the peer's SETTINGS_HEADER_TABLE_SIZE.
    ///
    /// The change is signalled at the start of the next header block.
    pub fn set_max_table_size(&mut self, size: usize) {
        let current = self.table.max_size();
        self.pending_size_update = match self.pending_size_update {
            Some((min, _)) => Some((min.min(size), size)),
            None if size != current => Some((size.min(current), size)),
            None => None,
        };
    }

    /// Encode a header list into one header block
    pub fn encode(&mut self, headers: &HeaderList) -> Bytes {
        let mut dst = BytesMut::with_capacity(headers.list_size());

        if let Some((min, latest)) = self.pending_size_update.take() {
            if min < latest {
                encode_integer(&mut dst, min, 5, 0x20);
            }
            encode_integer(&mut dst, latest, 5, 0x20);
            self.table.set_max_size(latest);
            tracing::debug!(size = latest, "HPACK encoder table size update");
        }

        for field in headers.wire_order() {
            self.encode_field(field, &mut dst);
        }

        dst.freeze()
    }

    fn encode_field(&mut self, field: &HeaderField, dst: &mut BytesMut) {
        let name = &field.name[..];
        let value = &field.value[..];

        if field.sensitive {
            let name_index = static_find_name(name).or_else(|| self.table.find_name(name));
            encode_literal(dst, name_index, field, 4, 0x10);
            return;
        }

        if let Some(index) = static_find(name, value).or_else(|| self.table.find(name, value)) {
            encode_integer(dst, index, 7, 0x80);
            return;
        }

        let name_index = static_find_name(name).or_else(|| self.table.find_name(name));
        let one_off = UNINDEXED_NAMES.iter().any(|n| n.as_bytes() == name);
        if one_off || field.size() > self.table.max_size() / 2 {
            encode_literal(dst, name_index, field, 4, 0x00);
        } else {
            encode_literal(dst, name_index, field, 6, 0x40);
            self.table.insert(HeaderField::from_wire(
                field.name.clone(),
                field.value.clone(),
                false,
            ));
        }
    }
}

fn encode_literal(
    dst: &mut BytesMut,
    name_index: Option<usize>,
    field: &HeaderField,
    prefix_bits: u8,
    prefix: u8,
) {
    match name_index {
        Some(index) => encode_integer(dst, index, prefix_bits, prefix),
        None => {
            dst.put_u8(prefix);
            encode_string(dst, &field.name);
        }
    }
    encode_string(dst, &field.value);
}

/// Header block decoder for one connection direction
#[derive(Debug, Clone)]
pub struct Decoder {
    table: DynamicTable,
    /// Largest table size the peer may select (our SETTINGS_HEADER_TABLE_SIZE)
    allowed_table_size: usize,
    /// Our SETTINGS_MAX_HEADER_LIST_SIZE, if any
    max_header_list_size: Option<usize>,
}

impl Decoder {
    /// Create a decoder with the default table size and no list limit
    pub fn new() -> Self {
        Decoder {
            table: DynamicTable::default(),
            allowed_table_size: DEFAULT_TABLE_SIZE,
            max_header_list_size: None,
        }
    }

    /// Get the decoder's dynamic table
    pub fn table(&self) -> &DynamicTable {
        &self.table
    }

    /// Set the largest table size a size update may select
    pub fn set_allowed_table_size(&mut self, size: usize) {
        self.allowed_table_size = size;
        if self.table.max_size() > size {
            self.table.set_max_size(size);
        }
    }

    /// Limit the decoded header list size
    pub fn set_max_header_list_size(&mut self, size: Option<usize>) {
        self.max_header_list_size = size;
    }

    /// Decode one complete header block
    pub fn decode(&mut self, block: &[u8]) -> Result<HeaderList> {
        let mut src = Bytes::copy_from_slice(block);
        let mut fields = Vec::new();
        let mut list_size = 0usize;
        let mut at_start = true;

        while src.has_remaining() {
            let first = src[0];

            if first & 0x80 != 0 {
                // Indexed header field
                let index = decode_integer(&mut src, 7)?;
                let (name, value) = self.lookup(index)?;
                fields.push(HeaderField::from_wire(name, value, false));
            } else if first & 0x40 != 0 {
                // Literal with incremental indexing
                let field = self.decode_literal(&mut src, 6, false)?;
                self.table.insert(field.clone());
                fields.push(field);
            } else if first & 0x20 != 0 {
                // Dynamic table size update
                if !at_start {
                    return Err(Error::Compression(
                        "dynamic table size update after first header field".to_string(),
                    ));
                }
                let size = decode_integer(&mut src, 5)?;
                if size > self.allowed_table_size {
                    return Err(Error::Compression(format!(
                        "dynamic table size update to {} exceeds limit {}",
                        size, self.allowed_table_size
                    )));
                }
                self.table.set_max_size(size);
                tracing::debug!(size, "HPACK decoder table size update");
                continue;
            } else {
                // Literal without indexing (0x00) or never indexed (0x10)
                let never_indexed = first & 0x10 != 0;
                fields.push(self.decode_literal(&mut src, 4, never_indexed)?);
            }

            at_start = false;

            if let (Some(limit), Some(field)) = (self.max_header_list_size, fields.last()) {
                list_size += field.size();
                if list_size > limit {
                    return Err(Error::Compression(format!(
                        "header list size exceeds {} bytes",
                        limit
                    )));
                }
            }
        }

        Ok(HeaderList::from(fields))
    }

    fn decode_literal(
        &self,
        src: &mut Bytes,
        prefix_bits: u8,
        never_indexed: bool,
    ) -> Result<HeaderField> {
        let index = decode_integer(src, prefix_bits)?;
        let name = if index == 0 {
            decode_string(src)?
        } else {
            self.lookup(index)?.0
        };
        let value = decode_string(src)?;
        Ok(HeaderField::from_wire(name, value, never_indexed))
    }

    fn lookup(&self, index: usize) -> Result<(Bytes, Bytes)> {
        if index == 0 {
            return Err(Error::Compression("header index 0".to_string()));
        }
        if let Some((name, value)) = STATIC_TABLE.get(index - 1) {
            return Ok((Bytes::from_static(name.as_bytes()), Bytes::from_static(value.as_bytes())));
        }
        self.table
            .get(index - STATIC_TABLE.len())
            .map(|e| (e.name.clone(), e.value.clone()))
            .ok_or_else(|| {
                Error::Compression(format!(
                    "header index {} out of range (dynamic table has {} entries)",
                    index,
                    self.table.len()
                ))
            })
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Encode an integer with an N-bit prefix (RFC 7541 Section 5.1)
pub fn encode_integer(dst: &mut BytesMut, value: usize, prefix_bits: u8, prefix: u8) {
    let max_first = (1usize << prefix_bits) - 1;

    if value < max_first {
        dst.put_u8(prefix | value as u8);
        return;
    }

    dst.put_u8(prefix | max_first as u8);
    let mut remaining = value - max_first;
    while remaining >= 128 {
        dst.put_u8((remaining & 0x7f) as u8 | 0x80);
        remaining >>= 7;
    }
    dst.put_u8(remaining as u8);
}

/// Decode an integer with an N-bit prefix
pub fn decode_integer(src: &mut Bytes, prefix_bits: u8) -> Result<usize> {
    if !src.has_remaining() {
        return Err(Error::Compression("unexpected end of integer".to_string()));
    }

    let max_first = (1usize << prefix_bits) - 1;
    let first = src.get_u8() as usize & max_first;
    if first < max_first {
        return Ok(first);
    }

    let mut value = max_first;
    let mut shift = 0u32;
    loop {
        if !src.has_remaining() {
            return Err(Error::Compression("unexpected end of integer".to_string()));
        }
        let byte = src.get_u8();
        value += ((byte & 0x7f) as usize) << shift;
        if value > MAX_INTEGER {
            return Err(Error::Compression("integer overflow".to_string()));
        }
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
        if shift > 28 {
            return Err(Error::Compression("integer encoding too long".to_string()));
        }
    }
}

fn encode_string(dst: &mut BytesMut, value: &[u8]) {
    encode_integer(dst, value.len(), 7, 0x00);
    dst.put_slice(value);
}

fn decode_string(src: &mut Bytes) -> Result<Bytes> {
    if !src.has_remaining() {
        return Err(Error::Compression("unexpected end of string".to_string()));
    }

    let huffman = src[0] & 0x80 != 0;
    let length = decode_integer(src, 7)?;
    if src.len() < length {
        return Err(Error::Compression(format!(
            "string length {} exceeds remaining {} bytes",
            length,
            src.len()
        )));
    }

    let data = src.split_to(length);
    if !huffman {
        return Ok(data);
    }

    hpack::huffman::HuffmanDecoder::new()
        .decode(&data)
        .map(Bytes::from)
        .map_err(|e| Error::Compression(format!("invalid Huffman string: {:?}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names_values(list: &HeaderList) -> Vec<(String, String)> {
        list.iter()
            .map(|f| {
                (
                    f.name_str().unwrap().to_string(),
                    f.value_str().unwrap().to_string(),
                )
            })
            .collect()
    }

    #[test]
    fn test_integer_encoding() {
        // RFC 7541 C.1.1 / C.1.2 / C.1.3
        let mut buf = BytesMut::new();
        encode_integer(&mut buf, 10, 5, 0);
        assert_eq!(&buf[..], &[0x0a]);

        let mut buf = BytesMut::new();
        encode_integer(&mut buf, 1337, 5, 0);
        assert_eq!(&buf[..], &[0x1f, 0x9a, 0x0a]);
        assert_eq!(decode_integer(&mut buf.freeze(), 5).unwrap(), 1337);

        let mut buf = BytesMut::new();
        encode_integer(&mut buf, 42, 8, 0);
        assert_eq!(&buf[..], &[0x2a]);
    }

    #[test]
    fn test_integer_decode_malformed() {
        assert!(decode_integer(&mut Bytes::from_static(&[0x1f, 0x80]), 5).is_err());
        assert!(decode_integer(&mut Bytes::from_static(&[0x1f, 0xff, 0xff, 0xff, 0xff, 0xff, 0x01]), 5).is_err());
    }

    #[test]
    fn test_dynamic_table_fifo_eviction() {
        // Each entry is 1 + 1 + 32 = 34 bytes; three fit in 110
        let mut table = DynamicTable::new(110);
        table.insert(HeaderField::new("a", "1"));
        table.insert(HeaderField::new("b", "2"));
        table.insert(HeaderField::new("c", "3"));
        assert_eq!(table.len(), 3);
        assert_eq!(table.size(), 102);

        table.insert(HeaderField::new("d", "4"));
        assert_eq!(table.len(), 3);
        assert!(table.size() <= table.max_size());
        assert_eq!(&table.get(1).unwrap().name[..], b"d");
        assert_eq!(&table.get(3).unwrap().name[..], b"b");

        table.set_max_size(40);
        assert_eq!(table.len(), 1);
        assert_eq!(&table.get(1).unwrap().name[..], b"d");

        table.insert(HeaderField::new("too-long-for-forty", "x"));
        assert!(table.is_empty());
        assert_eq!(table.size(), 0);
    }

    #[test]
    fn test_rfc7541_c3_requests_without_huffman() {
        let mut decoder = Decoder::new();

        let block = [
            0x82, 0x86, 0x84, 0x41, 0x0f, 0x77, 0x77, 0x77, 0x2e, 0x65, 0x78, 0x61, 0x6d, 0x70,
            0x6c, 0x65, 0x2e, 0x63, 0x6f, 0x6d,
        ];
        let list = decoder.decode(&block).unwrap();
        assert_eq!(
            names_values(&list),
            vec![
                (":method".into(), "GET".into()),
                (":scheme".into(), "http".into()),
                (":path".into(), "/".into()),
                (":authority".into(), "www.example.com".into()),
            ]
        );
        assert_eq!(decoder.table().size(), 57);

        let block = [0x82, 0x86, 0x84, 0xbe, 0x58, 0x08, 0x6e, 0x6f, 0x2d, 0x63, 0x61, 0x63, 0x68, 0x65];
        let list = decoder.decode(&block).unwrap();
        assert_eq!(list.get_str(":authority"), Some("www.example.com"));
        assert_eq!(list.get_str("cache-control"), Some("no-cache"));
        assert_eq!(decoder.table().size(), 110);
    }

    #[test]
    fn test_rfc7541_c4_request_with_huffman() {
        let block = [
            0x82, 0x86, 0x84, 0x41, 0x8c, 0xf1, 0xe3, 0xc2, 0xe5, 0xf2, 0x3a, 0x6b, 0xa0, 0xab,
            0x90, 0xf4, 0xff,
        ];
        let list = Decoder::new().decode(&block).unwrap();
        assert_eq!(list.get_str(":authority"), Some("www.example.com"));
        assert_eq!(list.get_str(":path"), Some("/"));
    }

    #[test]
    fn test_decode_errors() {
        // Index 62 with an empty dynamic table
        assert!(matches!(Decoder::new().decode(&[0xbe]), Err(Error::Compression(_))));
        // Index 0
        assert!(matches!(Decoder::new().decode(&[0x80]), Err(Error::Compression(_))));
        // Size update after a field
        assert!(matches!(Decoder::new().decode(&[0x82, 0x20]), Err(Error::Compression(_))));
        // Size update to 4097 > 4096
        assert!(matches!(Decoder::new().decode(&[0x3f, 0xe2, 0x1f]), Err(Error::Compression(_))));
        // String longer than the block
        assert!(matches!(Decoder::new().decode(&[0x40, 0x05, b'a']), Err(Error::Compression(_))));
    }

    #[test]
    fn test_header_list_size_limit() {
        let mut encoder = Encoder::new();
        let block = encoder.encode(&HeaderList::new().with("x-big", "0123456789"));

        let mut decoder = Decoder::new();
        decoder.set_max_header_list_size(Some(40));
        assert!(matches!(decoder.decode(&block), Err(Error::Compression(_))));
    }

    #[test]
    fn test_encoder_reuses_dynamic_entries() {
        let mut encoder = Encoder::new();
        let headers = HeaderList::new().with("custom-key", "custom-value");

        let first = encoder.encode(&headers);
        assert_eq!(first[0], 0x40);
        assert_eq!(encoder.table().len(), 1);

        let second = encoder.encode(&headers);
        assert_eq!(&second[..], &[0xbe]);
    }

    #[test]
    fn test_encoder_never_indexes_sensitive() {
        let mut encoder = Encoder::new();
        let block = encoder.encode(&HeaderList::new().with("authorization", "secret"));
        // Never indexed, name index 23 with 4-bit prefix
        assert_eq!(&block[..2], &[0x1f, 0x08]);
        assert!(encoder.table().is_empty());

        let list = Decoder::new().decode(&block).unwrap();
        assert!(list.iter().next().unwrap().sensitive);
    }

    #[test]
    fn test_encoder_emits_pending_size_update() {
        let mut encoder = Encoder::new();
        encoder.set_max_table_size(0);
        encoder.set_max_table_size(4096);
        let block = encoder.encode(&HeaderList::new().with(":method", "GET"));
        assert_eq!(&block[..], &[0x20, 0x3f, 0xe1, 0x1f, 0x82]);

        let block = encoder.encode(&HeaderList::new().with(":method", "GET"));
        assert_eq!(&block[..], &[0x82]);
    }

    #[test]
    fn test_roundtrip_with_independent_decoder() {
        let mut encoder = Encoder::new();
        let request = HeaderList::request("POST", "https", "localhost:8443", "/upload")
            .with("content-type", "text/plain")
            .with("x-trace", "abc");

        let mut peer = hpack::Decoder::new();
        for _ in 0..2 {
            let block = encoder.encode(&request);
            let decoded = peer.decode(&block).unwrap();
            assert_eq!(decoded.len(), 6);
            assert_eq!(decoded[3], (b":path".to_vec(), b"/upload".to_vec()));
        }
    }

    #[test]
    fn test_symmetric_tables() {
        let mut encoder = Encoder::new();
        let mut decoder = Decoder::new();

        for i in 0..20 {
            let request = HeaderList::request("GET", "https", "example.com", &format!("/item/{}", i))
                .with("x-request-id", format!("{}", i))
                .with("accept", "*/*");
            let decoded = decoder.decode(&encoder.encode(&request)).unwrap();
            assert_eq!(decoded, request);
            assert!(decoder.table().size() <= DEFAULT_TABLE_SIZE);
        }
    }
}
