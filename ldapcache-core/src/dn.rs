//! Minimal distinguished-name helpers.
//!
//! Only what the projection needs: splitting off the leading RDN with LDAP
//! escaping honoured, and a normalised form for case-insensitive comparison.

use crate::error::MappingError;

/// The first attribute/value assertion of a DN.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rdn {
    /// Attribute type, as written.
    pub attribute: String,
    /// Unescaped attribute value.
    pub value: String,
}

impl Rdn {
    /// Whether the RDN attribute is `name` (case-insensitive).
    pub fn is(&self, name: &str) -> bool {
        self.attribute.eq_ignore_ascii_case(name)
    }
}

/// Parse the leading RDN of `dn`.
///
/// For multi-valued RDNs (`uid=a+cn=b,...`) only the first assertion is
/// returned.
pub fn leading_rdn(dn: &str) -> Result<Rdn, MappingError> {
    let malformed = |reason: &str| MappingError::MalformedDn {
        dn: dn.to_string(),
        reason: reason.to_string(),
    };

    let trimmed = dn.trim();
    if trimmed.is_empty() {
        return Err(malformed("empty DN"));
    }

    let raw = first_component(trimmed);
    let (attribute, value) = raw
        .split_once('=')
        .ok_or_else(|| malformed("leading RDN has no '='"))?;
    let attribute = attribute.trim();
    if attribute.is_empty() {
        return Err(malformed("leading RDN has no attribute type"));
    }

    Ok(Rdn {
        attribute: attribute.to_string(),
        value: unescape(value.trim()),
    })
}

/// Normalised DN for comparisons: lowercase, no whitespace around separators.
pub fn normalize_dn(dn: &str) -> String {
    let mut out = String::with_capacity(dn.len());
    let mut escaped = false;
    let mut pending_space = false;
    for ch in dn.trim().chars() {
        if escaped {
            out.extend(ch.to_lowercase());
            escaped = false;
            continue;
        }
        match ch {
            '\\' => {
                flush_space(&mut out, &mut pending_space);
                out.push('\\');
                escaped = true;
            }
            ',' | '=' | '+' => {
                pending_space = false;
                out.push(ch);
            }
            ' ' => {
                if !matches!(out.chars().last(), Some(',' | '=' | '+') | None) {
                    pending_space = true;
                }
            }
            _ => {
                flush_space(&mut out, &mut pending_space);
                out.extend(ch.to_lowercase());
            }
        }
    }
    out
}

/// Case-insensitive DN equality.
pub fn dn_eq(a: &str, b: &str) -> bool {
    normalize_dn(a) == normalize_dn(b)
}

fn flush_space(out: &mut String, pending: &mut bool) {
    if *pending {
        out.push(' ');
        *pending = false;
    }
}

/// Slice of `dn` up to the first unescaped `,` or `+`.
fn first_component(dn: &str) -> &str {
    let mut escaped = false;
    for (idx, ch) in dn.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' => escaped = true,
            ',' | '+' => return &dn[..idx],
            _ => {}
        }
    }
    dn
}

/// Resolve `\XX` hex pairs and `\c` character escapes.
fn unescape(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 1 < bytes.len() {
            if i + 2 < bytes.len() {
                if let (Some(hi), Some(lo)) = (hex_val(bytes[i + 1]), hex_val(bytes[i + 2])) {
                    out.push((hi << 4) | lo);
                    i += 3;
                    continue;
                }
            }
            out.push(bytes[i + 1]);
            i += 2;
            continue;
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_val(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}
