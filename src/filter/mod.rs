//! DNS query filtering.
//!
//! Decides whether an incoming query gets a synthesized sinkhole response
//! or is forwarded upstream. Only A and AAAA queries are ever blocked; all
//! other types pass through so mail, TXT verification, and the like keep
//! working even for listed domains.

mod blocklist;

pub use blocklist::{is_valid_domain, Blocklist, BlocklistError, BlocklistHandle};

use crate::dns::{DnsQuery, QTYPE_A, QTYPE_AAAA};

/// Check a query against the blocklist.
///
/// Returns `Some(response)` with the sinkhole bytes if the query should be
/// answered locally, `None` if it should be forwarded upstream.
pub fn filter_query(blocklist: &Blocklist, query: &DnsQuery, packet: &[u8]) -> Option<Vec<u8>> {
    if query.qtype != QTYPE_A && query.qtype != QTYPE_AAAA {
        return None;
    }
    if blocklist.is_blocked(&query.domain) {
        Some(query.sinkhole_response(packet))
    } else {
        None
    }
}
