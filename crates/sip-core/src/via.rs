// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::collections::BTreeMap;

use smol_str::SmolStr;

/// Parsed representation of a Via header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViaHeader {
    pub transport: SmolStr,
    pub sent_by: SmolStr,
    pub params: BTreeMap<SmolStr, Option<SmolStr>>,
}

impl ViaHeader {
    /// Parses a single Via value such as
    /// `SIP/2.0/UDP host:5060;branch=z9hG4bK776;rport`.
    ///
    /// Parameter names are lowercased; values are kept as received.
    pub fn parse(value: &str) -> Option<Self> {
        let mut segments = value.split(';');
        let head = segments.next()?.trim();
        let (protocol, sent_by) = head.split_once(char::is_whitespace)?;
        let transport = protocol.rsplit('/').next()?.trim();
        if transport.is_empty() {
            return None;
        }
        let sent_by = sent_by.trim();
        if sent_by.is_empty() {
            return None;
        }

        let mut params = BTreeMap::new();
        for segment in segments {
            let segment = segment.trim();
            if segment.is_empty() {
                continue;
            }
            let (name, val) = match segment.split_once('=') {
                Some((name, val)) => (name.trim(), Some(SmolStr::new(val.trim()))),
                None => (segment, None),
            };
            params.insert(SmolStr::new(name.to_ascii_lowercase()), val);
        }

        Some(Self {
            transport: SmolStr::new(transport.to_ascii_uppercase()),
            sent_by: SmolStr::new(sent_by),
            params,
        })
    }

    /// Returns the transport token (e.g. UDP/TCP/TLS) associated with this Via.
    pub fn transport(&self) -> &str {
        self.transport.as_str()
    }

    /// Looks up the provided parameter ignoring ASCII case.
    pub fn param(&self, name: &str) -> Option<&Option<SmolStr>> {
        self.params.get(&SmolStr::new(name.to_ascii_lowercase()))
    }

    pub fn branch(&self) -> Option<&str> {
        self.param("branch").and_then(|v| v.as_deref())
    }

    /// True when the sender asked for symmetric response routing (RFC 3581).
    pub fn has_rport(&self) -> bool {
        self.param("rport").is_some()
    }

    /// Host part of sent-by, without brackets for IPv6 references.
    pub fn host(&self) -> &str {
        let sent_by = self.sent_by.as_str();
        if let Some(rest) = sent_by.strip_prefix('[') {
            return rest.split(']').next().unwrap_or(rest);
        }
        sent_by.split(':').next().unwrap_or(sent_by)
    }

    /// Port part of sent-by, if one was given.
    pub fn port(&self) -> Option<u16> {
        let sent_by = self.sent_by.as_str();
        let after_host = match sent_by.rfind(']') {
            Some(end) => &sent_by[end + 1..],
            None => sent_by,
        };
        after_host.rsplit_once(':')?.1.parse().ok()
    }
}
