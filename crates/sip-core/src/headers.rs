// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::slice::Iter;

use smol_str::SmolStr;

use crate::{method::Method, via::ViaHeader};

/// Represents a single SIP header field as a name/value pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub name: SmolStr,
    pub value: SmolStr,
}

/// Collection of SIP headers preserving insertion order.
///
/// Values are opaque strings; only the fields transactions depend on (Via,
/// CSeq, Call-ID, the To/From tags and Retry-After) get typed accessors.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<Header>);

/// Parsed `CSeq` header value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CSeq {
    pub number: u32,
    pub method: Method,
}

impl Headers {
    /// Creates an empty header collection.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a header to the collection.
    pub fn push(&mut self, name: impl Into<SmolStr>, value: impl Into<SmolStr>) {
        self.0.push(Header {
            name: name.into(),
            value: value.into(),
        });
    }

    /// Replaces the first header with this name, or appends one.
    pub fn set(&mut self, name: &str, value: impl Into<SmolStr>) {
        let value = value.into();
        match self.get_mut(name) {
            Some(existing) => *existing = value,
            None => self.push(SmolStr::new(name), value),
        }
    }

    /// Removes every header with this name.
    pub fn remove(&mut self, name: &str) {
        self.0.retain(|h| !h.name.eq_ignore_ascii_case(name));
    }

    /// Returns an iterator over the stored headers.
    pub fn iter(&self) -> Iter<'_, Header> {
        self.0.iter()
    }

    /// Returns the number of headers present.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` when the collection does not contain any headers.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Finds the first header whose name matches ignoring ASCII case.
    pub fn get(&self, name: &str) -> Option<&SmolStr> {
        self.0
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| &h.value)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut SmolStr> {
        self.0
            .iter_mut()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| &mut h.value)
    }

    /// Returns all headers with the given name, preserving original order.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a SmolStr> + 'a {
        self.0
            .iter()
            .filter(move |h| h.name.eq_ignore_ascii_case(name))
            .map(|h| &h.value)
    }

    /// Copies every header named `name` from `other`, keeping their order.
    pub fn copy_from(&mut self, other: &Headers, name: &str) {
        for value in other.get_all(name) {
            self.push(SmolStr::new(name), value.clone());
        }
    }

    /// Returns the top-most Via, parsed.
    pub fn top_via(&self) -> Option<ViaHeader> {
        self.get("Via").and_then(|v| ViaHeader::parse(v))
    }

    pub fn call_id(&self) -> Option<&str> {
        self.get("Call-ID").map(|v| v.trim())
    }

    /// Parses the `CSeq` header as `<number> <method>`.
    pub fn cseq(&self) -> Option<CSeq> {
        let raw = self.get("CSeq")?;
        let mut parts = raw.split_whitespace();
        let number = parts.next()?.parse().ok()?;
        let method = Method::from_token(parts.next()?);
        Some(CSeq { number, method })
    }

    /// Returns the `tag` parameter of the From header.
    pub fn from_tag(&self) -> Option<&str> {
        self.get("From").and_then(|v| tag_param(v))
    }

    /// Returns the `tag` parameter of the To header.
    pub fn to_tag(&self) -> Option<&str> {
        self.get("To").and_then(|v| tag_param(v))
    }

    /// Returns the delta-seconds of `Retry-After`, ignoring any comment or params.
    pub fn retry_after(&self) -> Option<u32> {
        let raw = self.get("Retry-After")?;
        let token = raw.split(|c: char| c == ';' || c == '(' || c.is_whitespace()).next()?;
        token.parse().ok()
    }
}

/// Extracts the `tag` parameter from a name-addr header value.
///
/// Parameters inside `<...>` belong to the URI and are skipped.
pub fn tag_param(value: &str) -> Option<&str> {
    let params = match value.rfind('>') {
        Some(end) => &value[end + 1..],
        None => value,
    };
    params.split(';').skip(1).find_map(|part| {
        let (name, val) = part.split_once('=')?;
        if name.trim().eq_ignore_ascii_case("tag") {
            Some(val.trim())
        } else {
            None
        }
    })
}

impl IntoIterator for Headers {
    type Item = Header;
    type IntoIter = std::vec::IntoIter<Header>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a Headers {
    type Item = &'a Header;
    type IntoIter = Iter<'a, Header>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
