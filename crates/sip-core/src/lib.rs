// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! SIP message model for the transaction layer.
//!
//! - **Messages**: [`Request`], [`Response`], [`SipMessage`]
//! - **Headers**: [`Headers`] with typed accessors for the fields transactions
//!   depend on ([`CSeq`], [`ViaHeader`], tags, Retry-After)
//! - **Methods**: [`Method`]
//! - **Helpers**: forging responses, CANCELs and failure ACKs
//!
//! Header values stay opaque [`SmolStr`](smol_str::SmolStr)s; wire parsing and
//! serialization live outside this crate.
//!
//! # Examples
//!
//! ```
//! use bytes::Bytes;
//! use sip_core::{helpers, Headers, Method, Request, RequestLine};
//!
//! let mut headers = Headers::new();
//! headers.push("Via", "SIP/2.0/UDP host.example.com;branch=z9hG4bK1");
//! headers.push("CSeq", "1 OPTIONS");
//! let req = Request::new(
//!     RequestLine::new(Method::Options, "sip:bob@example.com"),
//!     headers,
//!     Bytes::new(),
//! )
//! .unwrap();
//!
//! let res = helpers::make_response(&req, 200, None);
//! assert_eq!(res.code(), 200);
//! assert_eq!(res.headers().top_via().unwrap().branch(), Some("z9hG4bK1"));
//! ```

pub mod headers;
pub mod helpers;
pub mod method;
pub mod msg;
pub mod via;

pub use headers::{tag_param, CSeq, Header, Headers};
pub use method::Method;
pub use msg::{MessageError, Request, RequestLine, Response, SipMessage, StatusLine};
pub use via::ViaHeader;
