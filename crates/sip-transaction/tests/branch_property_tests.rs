// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use proptest::prelude::*;
use sip_core::{Method, SipMessage};
use sip_testkit::{build_cancel, build_invite, build_request, build_request_over, build_response};
use sip_transaction::{TransactionId, MAGIC_COOKIE};

fn id_of(message: impl Into<SipMessage>) -> TransactionId {
    TransactionId::for_message(&message.into()).expect("transaction id")
}

proptest! {
    /// RFC 3261 branches are the transaction id, compared case-insensitively.
    #[test]
    fn rfc3261_id_ignores_case(suffix in "[a-zA-Z0-9]{4,16}") {
        let lower = format!("{}{}", MAGIC_COOKIE, suffix.to_ascii_lowercase());
        let upper = format!("{}{}", MAGIC_COOKIE, suffix.to_ascii_uppercase());
        prop_assert_eq!(
            id_of(build_request(Method::Options, &lower)),
            id_of(build_request(Method::Options, &upper))
        );
    }

    /// The id does not depend on the method for RFC 3261 branches; the
    /// engine keys CANCEL separately.
    #[test]
    fn rfc3261_id_shared_by_invite_cancel_and_ack(suffix in "[a-z0-9]{4,16}") {
        let branch = format!("{}{}", MAGIC_COOKIE, suffix);
        let invite = id_of(build_request(Method::Invite, &branch));
        prop_assert_eq!(&invite, &id_of(build_request(Method::Cancel, &branch)));
        prop_assert_eq!(&invite, &id_of(build_request(Method::Ack, &branch)));
        prop_assert_ne!(invite.cancel_id(), invite);
    }

    /// RFC 2543 ids fold ACK onto INVITE and keep other methods apart.
    #[test]
    fn rfc2543_ack_finds_its_invite(branch in "[a-z]{1,8}") {
        prop_assume!(!branch.starts_with("z9hg4bk"));
        let invite = id_of(build_request(Method::Invite, &branch));
        prop_assert!(invite.as_str().starts_with("2543-"));
        prop_assert_eq!(&invite, &id_of(build_request(Method::Ack, &branch)));
        prop_assert_ne!(&invite, &id_of(build_request(Method::Bye, &branch)));
    }

    /// A CANCEL from an RFC 2543 peer hashes like the INVITE it cancels.
    #[test]
    fn rfc2543_cancel_finds_its_invite(branch in "[a-z]{1,8}") {
        prop_assume!(!branch.starts_with("z9hg4bk"));
        let invite = build_invite(&branch);
        let cancel = build_cancel(&invite);
        prop_assert_eq!(id_of(invite), id_of(cancel));
    }

    /// Responses hash like the requests they answer.
    #[test]
    fn rfc2543_response_matches_its_request(branch in "[a-z]{1,8}", code in 100u16..700) {
        prop_assume!(!branch.starts_with("z9hg4bk"));
        let request = build_request(Method::Options, &branch);
        prop_assert_eq!(id_of(build_response(&request, code)), id_of(request));
    }

    /// The Via transport token never changes an RFC 3261 id.
    #[test]
    fn transport_does_not_affect_id(suffix in "[a-z0-9]{4,16}", tcp in any::<bool>()) {
        let branch = format!("{}{}", MAGIC_COOKIE, suffix);
        let transport = if tcp { "TCP" } else { "UDP" };
        prop_assert_eq!(
            id_of(build_request_over(Method::Register, &branch, transport)),
            id_of(build_request(Method::Register, &branch))
        );
    }
}

#[test]
fn bare_magic_cookie_falls_back_to_rfc2543() {
    let id = id_of(build_request(Method::Options, MAGIC_COOKIE));
    assert!(id.as_str().starts_with("2543-"));
}

#[test]
fn rfc2543_ids_differ_by_cseq_method() {
    let options = id_of(build_request(Method::Options, "oldstyle"));
    let register = id_of(build_request(Method::Register, "oldstyle"));
    assert_ne!(options, register);
}
