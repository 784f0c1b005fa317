//! Endpoint address helpers.
//!
//! A client that connects to a server identifies itself by appending its own
//! DID to the server's advertised endpoint as a `did` query parameter. The
//! server reads it back from the request address to find the caller.

use url::Url;

use crate::traits::{TransportError, TransportKind};

const DID_QUERY_KEY: &str = "did";

fn parse(address: &str) -> Result<Url, TransportError> {
    Url::parse(address).map_err(|e| TransportError::InvalidAddress(format!("{address}: {e}")))
}

/// Append `?did=<caller_did>` to an endpoint address, replacing any existing
/// `did` parameter.
pub fn with_caller_did(address: &str, caller_did: &str) -> Result<String, TransportError> {
    let mut url = parse(address)?;
    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| k != DID_QUERY_KEY)
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    {
        let mut pairs = url.query_pairs_mut();
        pairs.clear();
        for (k, v) in &kept {
            pairs.append_pair(k, v);
        }
        pairs.append_pair(DID_QUERY_KEY, caller_did);
    }
    Ok(url.to_string())
}

/// The caller DID carried in an address, if any.
pub fn caller_did(address: &str) -> Option<String> {
    let url = Url::parse(address).ok()?;
    let did = url
        .query_pairs()
        .find(|(k, _)| k == DID_QUERY_KEY)
        .map(|(_, v)| v.into_owned());
    did
}

/// The address without query or fragment. Used as the listener key.
pub fn strip_query(address: &str) -> Result<String, TransportError> {
    let mut url = parse(address)?;
    url.set_query(None);
    url.set_fragment(None);
    Ok(url.to_string())
}

/// The transport kind implied by the address scheme.
pub fn scheme_kind(address: &str) -> Result<Option<TransportKind>, TransportError> {
    let url = parse(address)?;
    Ok(TransportKind::from_scheme(url.scheme()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const DID: &str = "did:web:did.teaspoon.world:endpoint:tmcp-client";

    #[test]
    fn test_caller_did_round_trip() {
        let addr = with_caller_did("wss://tmcp.example.org/ws", DID).unwrap();
        assert!(addr.starts_with("wss://tmcp.example.org/ws?did="));
        assert_eq!(caller_did(&addr).as_deref(), Some(DID));
        assert_eq!(strip_query(&addr).unwrap(), "wss://tmcp.example.org/ws");
    }

    #[test]
    fn test_existing_did_is_replaced() {
        let addr = with_caller_did("sse://h/sse?x=1&did=old", DID).unwrap();
        assert_eq!(caller_did(&addr).as_deref(), Some(DID));
        assert!(addr.contains("x=1"));
        assert!(!addr.contains("old"));
    }

    #[test]
    fn test_scheme_kind() {
        assert_eq!(
            scheme_kind("mem+socket://server").unwrap(),
            Some(TransportKind::BidirectionalSocket)
        );
        assert_eq!(scheme_kind("tmcpclient://").unwrap(), None);
        assert!(scheme_kind("not a url").is_err());
    }
}
