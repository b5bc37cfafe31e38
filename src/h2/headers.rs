//! HTTP/2 header fields
//!
//! Header names and values are octet sequences. Names are compared
//! case-insensitively and lowercased when a field is built for sending.
//! Pseudo-headers live in the same ordered list as regular fields.

use bytes::Bytes;
use std::fmt;

/// Per-entry overhead used for HPACK table accounting (RFC 7541 Section 4.1)
pub const HEADER_ENTRY_OVERHEAD: usize = 32;

/// Request pseudo-headers in the order they are put on the wire
pub const REQUEST_PSEUDO_ORDER: [&str; 4] = [":method", ":scheme", ":authority", ":path"];

/// Names whose values are never added to a compression table
const SENSITIVE_NAMES: [&str; 3] = ["authorization", "proxy-authorization", "cookie"];

/// A single header field
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderField {
    /// Field name
    pub name: Bytes,
    /// Field value
    pub value: Bytes,
    /// Encode as "never indexed"
    pub sensitive: bool,
}

impl HeaderField {
    /// Create a field to send; the name is lowercased
    pub fn new(name: impl AsRef<[u8]>, value: impl AsRef<[u8]>) -> Self {
        let name = Bytes::from(name.as_ref().to_ascii_lowercase());
        let sensitive = SENSITIVE_NAMES.iter().any(|s| s.as_bytes() == &name[..]);
        HeaderField {
            name,
            value: Bytes::copy_from_slice(value.as_ref()),
            sensitive,
        }
    }

    /// Create a field exactly as it was decoded
    pub fn from_wire(name: Bytes, value: Bytes, sensitive: bool) -> Self {
        HeaderField {
            name,
            value,
            sensitive,
        }
    }

    /// Mark (or unmark) the field as sensitive
    pub fn sensitive(mut self, sensitive: bool) -> Self {
        self.sensitive = sensitive;
        self
    }

    /// Check if this is a pseudo-header
    pub fn is_pseudo(&self) -> bool {
        self.name.first() == Some(&b':')
    }

    /// Case-insensitive name comparison
    pub fn name_eq(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name.as_bytes())
    }

    /// Get the name as UTF-8, if it is
    pub fn name_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.name).ok()
    }

    /// Get the value as UTF-8, if it is
    pub fn value_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.value).ok()
    }

    /// Size of this field for table and header-list accounting
    pub fn size(&self) -> usize {
        self.name.len() + self.value.len() + HEADER_ENTRY_OVERHEAD
    }
}

impl fmt::Display for HeaderField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {}",
            String::from_utf8_lossy(&self.name),
            String::from_utf8_lossy(&self.value)
        )
    }
}

/// Ordered header field list
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderList {
    fields: Vec<HeaderField>,
}

impl HeaderList {
    /// Create a new empty list
    pub fn new() -> Self {
        HeaderList { fields: Vec::new() }
    }

    /// Request header list carrying the four request pseudo-headers
    pub fn request(method: &str, scheme: &str, authority: &str, path: &str) -> Self {
        HeaderList::new()
            .with(":method", method)
            .with(":scheme", scheme)
            .with(":authority", authority)
            .with(":path", path)
    }

    /// Append a field and return the list (builder style)
    pub fn with(mut self, name: impl AsRef<[u8]>, value: impl AsRef<[u8]>) -> Self {
        self.add(name, value);
        self
    }

    /// Append a field built from name and value
    pub fn add(&mut self, name: impl AsRef<[u8]>, value: impl AsRef<[u8]>) {
        self.fields.push(HeaderField::new(name, value));
    }

    /// Append a field as is
    pub fn push(&mut self, field: HeaderField) {
        self.fields.push(field);
    }

    /// Get the first value for a name (case-insensitive)
    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.fields
            .iter()
            .find(|f| f.name_eq(name))
            .map(|f| &f.value[..])
    }

    /// Get the first value for a name as UTF-8
    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(|v| std::str::from_utf8(v).ok())
    }

    /// Get all values for a name (case-insensitive)
    pub fn get_all(&self, name: &str) -> Vec<&[u8]> {
        self.fields
            .iter()
            .filter(|f| f.name_eq(name))
            .map(|f| &f.value[..])
            .collect()
    }

    /// Check if a field exists
    pub fn contains(&self, name: &str) -> bool {
        self.fields.iter().any(|f| f.name_eq(name))
    }

    /// Parsed `:status`, if present and numeric
    pub fn status(&self) -> Option<u16> {
        self.get_str(":status")?.parse().ok()
    }

    /// Get the number of fields
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Check if there are no fields
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Iterate over fields in order
    pub fn iter(&self) -> std::slice::Iter<'_, HeaderField> {
        self.fields.iter()
    }

    /// Borrow the fields
    pub fn fields(&self) -> &[HeaderField] {
        &self.fields
    }

    /// Sum of field sizes (SETTINGS_MAX_HEADER_LIST_SIZE accounting)
    pub fn list_size(&self) -> usize {
        self.fields.iter().map(HeaderField::size).sum()
    }

    /// Fields in wire order: request pseudo-headers in fixed order, then any
    /// other pseudo-headers, then regular fields. Relative order is otherwise
    /// kept.
    pub fn wire_order(&self) -> Vec<&HeaderField> {
        let mut out: Vec<&HeaderField> = Vec::with_capacity(self.fields.len());
        for name in REQUEST_PSEUDO_ORDER {
            out.extend(self.fields.iter().filter(|f| f.name_eq(name)));
        }
        out.extend(
            self.fields
                .iter()
                .filter(|f| f.is_pseudo() && !REQUEST_PSEUDO_ORDER.iter().any(|n| f.name_eq(n))),
        );
        out.extend(self.fields.iter().filter(|f| !f.is_pseudo()));
        out
    }
}

impl From<Vec<HeaderField>> for HeaderList {
    fn from(fields: Vec<HeaderField>) -> Self {
        HeaderList { fields }
    }
}

impl<N: AsRef<[u8]>, V: AsRef<[u8]>> FromIterator<(N, V)> for HeaderList {
    fn from_iter<I: IntoIterator<Item = (N, V)>>(iter: I) -> Self {
        let mut list = HeaderList::new();
        for (name, value) in iter {
            list.add(name, value);
        }
        list
    }
}

impl IntoIterator for HeaderList {
    type Item = HeaderField;
    type IntoIter = std::vec::IntoIter<HeaderField>;

    fn into_iter(self) -> Self::IntoIter {
        self.fields.into_iter()
    }
}

impl<'a> IntoIterator for &'a HeaderList {
    type Item = &'a HeaderField;
    type IntoIter = std::slice::Iter<'a, HeaderField>;

    fn into_iter(self) -> Self::IntoIter {
        self.fields.iter()
    }
}

impl fmt::Display for HeaderList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for field in &self.fields {
            writeln!(f, "{}", field)?;
        }
        Ok(())
    }
}
