//! Distinguished-name model.
//!
//! A `Dn` is an ordered sequence of RDN components, most-specific first
//! (`uid=bob,ou=people,dc=example`). Equality and ancestry are defined over
//! a normalized form (lowercase, whitespace-collapsed); the original casing
//! is preserved for display. Instances are immutable once built.
//!
//! `hierarchical_key()` produces an order-preserving byte encoding, root
//! component first with a `0x00` terminator after each component, so that a
//! subtree is exactly the contiguous key range prefixed by its root's key.
//! This is the key contract the containment index and the persistence
//! backend's range scans rely on.

use std::fmt;
use std::hash::{Hash, Hasher};

use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::ParseError;

/// A single attribute=value assertion inside an RDN.
#[derive(Debug, Clone)]
pub struct Ava {
    attr: String,
    value: String,
    norm: String,
}

impl Ava {
    pub fn new(attr: impl Into<String>, value: impl Into<String>) -> Self {
        let attr = attr.into();
        let value = value.into();
        let norm = format!("{}={}", normalize(&attr), normalize(&value));
        Self { attr, value, norm }
    }

    pub fn attr(&self) -> &str {
        &self.attr
    }

    pub fn value(&self) -> &str {
        &self.value
    }
}

/// One RDN component. Multi-valued RDNs (`cn=a+sn=b`) hold several AVAs;
/// comparison is order-insensitive across the AVA set.
#[derive(Debug, Clone)]
pub struct Rdn {
    avas: Vec<Ava>,
    norm: String,
}

impl Rdn {
    pub fn new(attr: impl Into<String>, value: impl Into<String>) -> Self {
        Self::from_avas(vec![Ava::new(attr, value)])
    }

    pub fn from_avas(avas: Vec<Ava>) -> Self {
        debug_assert!(!avas.is_empty());
        let mut norms: Vec<&str> = avas.iter().map(|a| a.norm.as_str()).collect();
        norms.sort_unstable();
        let norm = norms.join("+");
        Self { avas, norm }
    }

    pub fn avas(&self) -> &[Ava] {
        &self.avas
    }

    /// Normalized comparison form (`attr=value`, lowercased, AVAs sorted).
    pub fn normalized(&self) -> &str {
        &self.norm
    }
}

impl PartialEq for Rdn {
    fn eq(&self, other: &Self) -> bool {
        self.norm == other.norm
    }
}
impl Eq for Rdn {}

impl fmt::Display for Rdn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, ava) in self.avas.iter().enumerate() {
            if i > 0 {
                write!(f, "+")?;
            }
            write!(f, "{}={}", ava.attr, escape_value(&ava.value))?;
        }
        Ok(())
    }
}

/// An immutable distinguished name. The empty sequence is the root.
#[derive(Debug, Clone)]
pub struct Dn {
    /// Most-specific first.
    rdns: Vec<Rdn>,
}

impl Dn {
    /// The root DN (empty sequence). Ancestor of every DN including itself.
    pub fn root() -> Self {
        Self { rdns: Vec::new() }
    }

    pub fn from_rdns(rdns: Vec<Rdn>) -> Self {
        Self { rdns }
    }

    /// Parse DN text. The empty string parses to the root DN.
    /// Backslash escapes the following character (`\,`, `\+`, `\\`, `\=`).
    pub fn parse(text: &str) -> Result<Self, ParseError> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Ok(Self::root());
        }
        let mut rdns = Vec::new();
        for component in split_unescaped(trimmed, ',') {
            let component = component.trim();
            if component.is_empty() {
                return Err(malformed_dn(text, "empty RDN component"));
            }
            let mut avas = Vec::new();
            for ava_text in split_unescaped(component, '+') {
                let ava_text = ava_text.trim();
                let eq = find_unescaped(ava_text, '=').ok_or_else(|| {
                    malformed_dn(text, "RDN component is missing '='")
                })?;
                let attr = ava_text[..eq].trim();
                let value = unescape(ava_text[eq + 1..].trim());
                if attr.is_empty() {
                    return Err(malformed_dn(text, "empty attribute type in RDN"));
                }
                if value.is_empty() {
                    return Err(malformed_dn(text, "empty attribute value in RDN"));
                }
                if !attr.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.') {
                    return Err(malformed_dn(text, "invalid character in attribute type"));
                }
                avas.push(Ava::new(attr, value));
            }
            rdns.push(Rdn::from_avas(avas));
        }
        Ok(Self { rdns })
    }

    pub fn is_root(&self) -> bool {
        self.rdns.is_empty()
    }

    /// Number of RDN components. Root has depth 0.
    pub fn depth(&self) -> usize {
        self.rdns.len()
    }

    /// The most-specific component, if any.
    pub fn rdn(&self) -> Option<&Rdn> {
        self.rdns.first()
    }

    pub fn rdns(&self) -> &[Rdn] {
        &self.rdns
    }

    /// All but the most-specific component. `None` for the root.
    pub fn parent(&self) -> Option<Self> {
        if self.rdns.is_empty() {
            None
        } else {
            Some(Self {
                rdns: self.rdns[1..].to_vec(),
            })
        }
    }

    /// Child of `self` with `rdn` prepended.
    pub fn child(&self, rdn: Rdn) -> Self {
        let mut rdns = Vec::with_capacity(self.rdns.len() + 1);
        rdns.push(rdn);
        rdns.extend_from_slice(&self.rdns);
        Self { rdns }
    }

    /// True iff `other` lies within the subtree rooted at `self`
    /// (reflexive: every DN is an ancestor of itself; the root is an
    /// ancestor of everything). Short-circuits on depth before comparing
    /// components, so the cost is O(self.depth()).
    pub fn is_ancestor_of(&self, other: &Self) -> bool {
        let ours = self.rdns.len();
        let theirs = other.rdns.len();
        if ours > theirs {
            return false;
        }
        let skip = theirs - ours;
        self.rdns
            .iter()
            .zip(other.rdns[skip..].iter())
            .all(|(a, b)| a == b)
    }

    /// Non-reflexive ancestry.
    pub fn is_strict_ancestor_of(&self, other: &Self) -> bool {
        self.rdns.len() < other.rdns.len() && self.is_ancestor_of(other)
    }

    /// Order-preserving byte key: components root-first, each followed by a
    /// `0x00` terminator. A descendant's key is strictly prefixed by every
    /// ancestor's key, and `0xFF` never occurs in UTF-8, so the subtree of
    /// `dn` is the half-open byte range `[key, key ++ 0xFF)`.
    pub fn hierarchical_key(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.rdns.iter().map(|r| r.norm.len() + 1).sum());
        for rdn in self.rdns.iter().rev() {
            buf.extend_from_slice(rdn.norm.as_bytes());
            buf.push(0x00);
        }
        buf
    }

    /// Exclusive upper bound of the subtree key range rooted at `self`.
    pub fn subtree_key_end(&self) -> Vec<u8> {
        let mut end = self.hierarchical_key();
        end.push(0xFF);
        end
    }
}

impl PartialEq for Dn {
    fn eq(&self, other: &Self) -> bool {
        self.rdns == other.rdns
    }
}
impl Eq for Dn {}

impl Hash for Dn {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for rdn in &self.rdns {
            rdn.norm.hash(state);
        }
    }
}

impl fmt::Display for Dn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, rdn) in self.rdns.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}", rdn)?;
        }
        Ok(())
    }
}

impl Serialize for Dn {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Dn {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Self::parse(&text).map_err(D::Error::custom)
    }
}

fn malformed_dn(text: &str, reason: &str) -> ParseError {
    ParseError::MalformedDn {
        text: text.to_string(),
        reason: reason.to_string(),
    }
}

/// Lowercase and collapse internal whitespace runs to a single space.
fn normalize(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut pending_space = false;
    for c in s.trim().chars() {
        if c.is_whitespace() {
            pending_space = true;
            continue;
        }
        if pending_space && !out.is_empty() {
            out.push(' ');
        }
        pending_space = false;
        for lc in c.to_lowercase() {
            out.push(lc);
        }
    }
    out
}

/// Split on `sep`, honoring backslash escapes.
fn split_unescaped(s: &str, sep: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut escaped = false;
    for (i, c) in s.char_indices() {
        if escaped {
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == sep {
            parts.push(&s[start..i]);
            start = i + c.len_utf8();
        }
    }
    parts.push(&s[start..]);
    parts
}

fn find_unescaped(s: &str, target: char) -> Option<usize> {
    let mut escaped = false;
    for (i, c) in s.char_indices() {
        if escaped {
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == target {
            return Some(i);
        }
    }
    None
}

fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut escaped = false;
    for c in s.chars() {
        if escaped {
            out.push(c);
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else {
            out.push(c);
        }
    }
    out
}

fn escape_value(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, ',' | '+' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}
