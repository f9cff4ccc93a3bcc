//! Extension negotiation for `Sec-WebSocket-Extensions`
//!
//! Parses offer headers, negotiates permessage-deflate parameters for both
//! roles and checks that active extensions claim disjoint reserved bits.

use crate::error::{Error, Result};
use crate::frame::{Frame, RSV1, RSV2, RSV3};

/// Extension token for RFC 7692
pub const PERMESSAGE_DEFLATE: &str = "permessage-deflate";

/// Smallest negotiable LZ77 window (256 bytes)
pub const MIN_WINDOW_BITS: u8 = 8;
/// Largest negotiable LZ77 window (32 KiB)
pub const MAX_WINDOW_BITS: u8 = 15;
/// Window size used when a side leaves the parameter unset
pub const DEFAULT_WINDOW_BITS: u8 = 15;

/// Default cap on the bytes produced while inflating one message (16 MiB)
pub const DEFAULT_MAX_DECOMPRESSION_SIZE: usize = 16 * 1024 * 1024;

/// Default zlib memory level
pub const DEFAULT_MEMORY_LEVEL: u8 = 8;

/// A frame transformation negotiated during the handshake.
///
/// Controllers hold extensions in negotiation order and run `encode` forward
/// on the send path and `decode` in reverse on the receive path. Control
/// frames never reach an extension.
pub trait Extension: Send {
    /// The extension token used during negotiation
    fn name(&self) -> &'static str;
    /// Reserved bits this extension claims, packed as in the header byte
    fn rsv_bits(&self) -> u8;
    /// Transform an outbound data frame
    fn encode(&mut self, frame: Frame) -> Result<Frame>;
    /// Transform an inbound data frame
    fn decode(&mut self, frame: Frame) -> Result<Frame>;
}

/// Union of the reserved bits claimed by `extensions`.
///
/// Extensions must claim disjoint bits; a clash means the peer could not
/// attribute a set bit to a single extension.
pub fn compose_rsv_bits(extensions: &[Box<dyn Extension>]) -> Result<u8> {
    let mut bits = 0u8;
    for ext in extensions {
        let claimed = ext.rsv_bits() & (RSV1 | RSV2 | RSV3);
        if bits & claimed != 0 {
            return Err(Error::IncompatibleExtensions);
        }
        bits |= claimed;
    }
    Ok(bits)
}

/// Locally configured permessage-deflate parameters.
///
/// `server_*` parameters constrain the server side of the connection and
/// `client_*` the client side, independent of which role this endpoint
/// plays. Window bits left as `None` mean the side runs at the protocol
/// default of 15.
#[derive(Debug, Clone)]
pub struct DeflateOptions {
    /// Require the server to reset its compression context per message
    pub server_no_context_takeover: bool,
    /// Require the client to reset its compression context per message
    pub client_no_context_takeover: bool,
    /// Bound on the server's LZ77 window, in [8, 15]
    pub server_max_window_bits: Option<u8>,
    /// Bound on the client's LZ77 window, in [8, 15]
    pub client_max_window_bits: Option<u8>,
    /// Cap on the bytes produced while inflating one message
    pub max_decompression_size: usize,
    /// zlib memory level, in [1, 9]
    pub memory_level: u8,
}

impl Default for DeflateOptions {
    fn default() -> Self {
        Self {
            server_no_context_takeover: false,
            client_no_context_takeover: false,
            server_max_window_bits: None,
            client_max_window_bits: None,
            max_decompression_size: DEFAULT_MAX_DECOMPRESSION_SIZE,
            memory_level: DEFAULT_MEMORY_LEVEL,
        }
    }
}

impl DeflateOptions {
    /// Validate bounds. Called when an endpoint is built.
    pub fn validate(&self) -> Result<()> {
        for bits in [self.server_max_window_bits, self.client_max_window_bits]
            .into_iter()
            .flatten()
        {
            if !(MIN_WINDOW_BITS..=MAX_WINDOW_BITS).contains(&bits) {
                return Err(Error::Config("max_window_bits must be in 8..=15"));
            }
        }
        if !(1..=9).contains(&self.memory_level) {
            return Err(Error::Config("memory_level must be in 1..=9"));
        }
        if self.max_decompression_size == 0 {
            return Err(Error::Config("max_decompression_size must be nonzero"));
        }
        Ok(())
    }

    /// Serialise the client offer header value.
    pub fn offer_header(&self) -> String {
        let mut value = String::from(PERMESSAGE_DEFLATE);
        if self.server_no_context_takeover {
            value.push_str("; server_no_context_takeover");
        }
        if let Some(bits) = self.server_max_window_bits {
            value.push_str(&format!("; server_max_window_bits={}", bits));
        }
        if self.client_no_context_takeover {
            value.push_str("; client_no_context_takeover");
        }
        if let Some(bits) = self.client_max_window_bits {
            value.push_str(&format!("; client_max_window_bits={}", bits));
        }
        value
    }
}

/// One offer from a `Sec-WebSocket-Extensions` header.
#[derive(Debug, Clone)]
pub struct ExtensionOffer {
    /// Extension token
    pub name: String,
    /// Parameters in offer order
    pub params: Vec<(String, Option<String>)>,
}

/// Parse a `Sec-WebSocket-Extensions` header value into an ordered offer
/// list. Offers are separated by `,`, parameters by `;`; values may be
/// quoted with `"` or `'`.
pub fn parse_extensions_header(value: &str) -> Vec<ExtensionOffer> {
    let mut offers = Vec::new();

    for offer in value.split(',') {
        let mut parts = offer.split(';');
        let name = match parts.next() {
            Some(n) if !n.trim().is_empty() => n.trim().to_string(),
            _ => continue,
        };

        let params = parts
            .filter_map(|part| {
                let part = part.trim();
                if part.is_empty() {
                    return None;
                }
                match part.split_once('=') {
                    Some((name, value)) => {
                        let value = value.trim();
                        let value = value
                            .strip_prefix('"')
                            .and_then(|v| v.strip_suffix('"'))
                            .or_else(|| {
                                value.strip_prefix('\'').and_then(|v| v.strip_suffix('\''))
                            })
                            .unwrap_or(value);
                        Some((name.trim().to_string(), Some(value.to_string())))
                    }
                    None => Some((part.to_string(), None)),
                }
            })
            .collect();

        offers.push(ExtensionOffer { name, params });
    }

    offers
}

/// permessage-deflate parameters as they appeared in a single offer or
/// response.
#[derive(Debug, Default, Clone, Copy)]
struct DeflateParams {
    server_no_context_takeover: bool,
    client_no_context_takeover: bool,
    server_max_window_bits: Option<u8>,
    /// Outer option: parameter present; inner: explicit value (the client
    /// may send it valueless to advertise support)
    client_max_window_bits: Option<Option<u8>>,
}

fn parse_window_bits(name: &str, value: &str) -> Result<u8> {
    let bits: u8 = value
        .parse()
        .map_err(|_| Error::InvalidParameterValue(format!("{}={}", name, value)))?;
    if !(MIN_WINDOW_BITS..=MAX_WINDOW_BITS).contains(&bits) {
        return Err(Error::InvalidParameterValue(format!("{}={}", name, value)));
    }
    Ok(bits)
}

fn interpret_deflate_params(offer: &ExtensionOffer) -> Result<DeflateParams> {
    let mut params = DeflateParams::default();
    let mut seen: Vec<&str> = Vec::new();

    for (name, value) in &offer.params {
        if seen.contains(&name.as_str()) {
            return Err(Error::DuplicateParameter(name.clone()));
        }

        match name.as_str() {
            "server_no_context_takeover" => {
                if value.is_some() {
                    return Err(Error::InvalidParameterValue(name.clone()));
                }
                params.server_no_context_takeover = true;
            }
            "client_no_context_takeover" => {
                if value.is_some() {
                    return Err(Error::InvalidParameterValue(name.clone()));
                }
                params.client_no_context_takeover = true;
            }
            "server_max_window_bits" => {
                let value = value
                    .as_deref()
                    .ok_or_else(|| Error::InvalidParameterValue(name.clone()))?;
                params.server_max_window_bits = Some(parse_window_bits(name, value)?);
            }
            "client_max_window_bits" => {
                params.client_max_window_bits = match value.as_deref() {
                    Some(v) => Some(Some(parse_window_bits(name, v)?)),
                    None => Some(None),
                };
            }
            _ => return Err(Error::UnknownExtensionParameter(name.clone())),
        }

        seen.push(name.as_str());
    }

    Ok(params)
}

/// The parameter set both sides committed to.
#[derive(Debug, Clone)]
pub struct NegotiatedDeflate {
    /// Server resets its compressor at end of message
    pub server_no_context_takeover: bool,
    /// Client resets its compressor at end of message
    pub client_no_context_takeover: bool,
    /// Window bits the server compresses with
    pub server_max_window_bits: u8,
    /// Window bits the client compresses with
    pub client_max_window_bits: u8,
    /// Cap on the bytes produced while inflating one message
    pub max_decompression_size: usize,
    /// zlib memory level from the local configuration
    pub memory_level: u8,
    /// Response must restate server_max_window_bits
    echo_server_bits: bool,
    /// Response must restate client_max_window_bits
    echo_client_bits: bool,
}

impl NegotiatedDeflate {
    /// Serialise the server response header value.
    pub fn response_header(&self) -> String {
        let mut value = String::from(PERMESSAGE_DEFLATE);
        if self.server_no_context_takeover {
            value.push_str("; server_no_context_takeover");
        }
        if self.echo_server_bits {
            value.push_str(&format!(
                "; server_max_window_bits={}",
                self.server_max_window_bits
            ));
        }
        if self.client_no_context_takeover {
            value.push_str("; client_no_context_takeover");
        }
        if self.echo_client_bits {
            value.push_str(&format!(
                "; client_max_window_bits={}",
                self.client_max_window_bits
            ));
        }
        value
    }
}

/// Server-side negotiation: take the first offer that can be accepted.
///
/// `header_values` are the `Sec-WebSocket-Extensions` values from the
/// upgrade request in order. Returns `Ok(None)` when every offer was
/// declined (the extension stays inactive); parameter-level violations in
/// any inspected offer fail the handshake.
pub fn negotiate_server(
    local: &DeflateOptions,
    header_values: &[&str],
) -> Result<Option<NegotiatedDeflate>> {
    for value in header_values {
        for offer in parse_extensions_header(value) {
            if offer.name != PERMESSAGE_DEFLATE {
                continue;
            }
            let params = interpret_deflate_params(&offer)?;
            if let Some(negotiated) = accept_offer(local, &params) {
                return Ok(Some(negotiated));
            }
        }
    }
    Ok(None)
}

/// Resolve one offer against the local option, or decline it.
fn accept_offer(local: &DeflateOptions, offer: &DeflateParams) -> Option<NegotiatedDeflate> {
    let server_no_context_takeover =
        local.server_no_context_takeover || offer.server_no_context_takeover;
    let client_no_context_takeover =
        local.client_no_context_takeover || offer.client_no_context_takeover;

    let (server_max_window_bits, echo_server_bits) =
        match (local.server_max_window_bits, offer.server_max_window_bits) {
            (None, None) => (DEFAULT_WINDOW_BITS, false),
            // Not configured to compress below the default window
            (None, Some(_)) => return None,
            (Some(a), None) => (a, a < DEFAULT_WINDOW_BITS),
            (Some(a), Some(b)) => (a.min(b), true),
        };

    let (client_max_window_bits, echo_client_bits) =
        match (local.client_max_window_bits, offer.client_max_window_bits) {
            (None, None) => (DEFAULT_WINDOW_BITS, false),
            (None, Some(None)) => (DEFAULT_WINDOW_BITS, false),
            (None, Some(Some(b))) => (b, true),
            // The client did not advertise support for the parameter
            (Some(_), None) => return None,
            (Some(a), Some(None)) => (a, true),
            (Some(a), Some(Some(b))) => (a.min(b), true),
        };

    Some(NegotiatedDeflate {
        server_no_context_takeover,
        client_no_context_takeover,
        server_max_window_bits,
        client_max_window_bits,
        max_decompression_size: local.max_decompression_size,
        memory_level: local.memory_level,
        echo_server_bits,
        echo_client_bits,
    })
}

/// Client-side acceptance of the server's single response.
///
/// `header_value` is the `Sec-WebSocket-Extensions` value from the 101
/// response, if any. A missing header means the extension is not active.
pub fn accept_client(
    requested: &DeflateOptions,
    header_value: Option<&str>,
) -> Result<Option<NegotiatedDeflate>> {
    let value = match header_value {
        Some(v) if !v.trim().is_empty() => v,
        _ => return Ok(None),
    };

    let offers = parse_extensions_header(value);
    if offers.len() != 1 || offers[0].name != PERMESSAGE_DEFLATE {
        return Err(Error::InvalidServerResponse);
    }
    let response = interpret_deflate_params(&offers[0])?;

    // The server may demand a behaviour we did not request, but must honour
    // every bound we did request.
    if requested.server_no_context_takeover && !response.server_no_context_takeover {
        return Err(Error::InvalidServerResponse);
    }
    let server_no_context_takeover = response.server_no_context_takeover;
    let client_no_context_takeover =
        requested.client_no_context_takeover || response.client_no_context_takeover;

    let server_max_window_bits = match (requested.server_max_window_bits, response.server_max_window_bits)
    {
        (None, None) => DEFAULT_WINDOW_BITS,
        (None, Some(b)) => b,
        // An explicit echo is required once the client asked for a bound
        (Some(_), None) => return Err(Error::InvalidServerResponse),
        (Some(a), Some(b)) => {
            if b > a {
                return Err(Error::InvalidServerResponse);
            }
            b
        }
    };

    let client_max_window_bits = match (requested.client_max_window_bits, response.client_max_window_bits)
    {
        (None, None) => DEFAULT_WINDOW_BITS,
        (None, Some(Some(b))) => b,
        (Some(_), None) => return Err(Error::InvalidServerResponse),
        (Some(a), Some(Some(b))) => {
            if b > a {
                return Err(Error::InvalidServerResponse);
            }
            b
        }
        // The response must pin a concrete value
        (_, Some(None)) => return Err(Error::InvalidServerResponse),
    };

    Ok(Some(NegotiatedDeflate {
        server_no_context_takeover,
        client_no_context_takeover,
        server_max_window_bits,
        client_max_window_bits,
        max_decompression_size: requested.max_decompression_size,
        memory_level: requested.memory_level,
        echo_server_bits: false,
        echo_client_bits: false,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_offer() {
        let offers = parse_extensions_header("permessage-deflate");
        assert_eq!(offers.len(), 1);
        assert_eq!(offers[0].name, "permessage-deflate");
        assert!(offers[0].params.is_empty());
    }

    #[test]
    fn test_parse_params_and_quotes() {
        let offers = parse_extensions_header(
            "permessage-deflate; server_no_context_takeover; server_max_window_bits=\"10\", \
             permessage-deflate; client_max_window_bits='12'",
        );
        assert_eq!(offers.len(), 2);
        assert_eq!(
            offers[0].params,
            vec![
                ("server_no_context_takeover".to_string(), None),
                ("server_max_window_bits".to_string(), Some("10".to_string())),
            ]
        );
        assert_eq!(
            offers[1].params,
            vec![("client_max_window_bits".to_string(), Some("12".to_string()))]
        );
    }

    #[test]
    fn test_duplicate_parameter_rejected() {
        let offers = parse_extensions_header(
            "permessage-deflate; server_no_context_takeover; server_no_context_takeover",
        );
        assert!(matches!(
            interpret_deflate_params(&offers[0]),
            Err(Error::DuplicateParameter(_))
        ));
    }

    #[test]
    fn test_unknown_parameter_rejected() {
        let offers = parse_extensions_header("permessage-deflate; sliding_window=2");
        assert!(matches!(
            interpret_deflate_params(&offers[0]),
            Err(Error::UnknownExtensionParameter(_))
        ));
    }

    #[test]
    fn test_invalid_values_rejected() {
        for header in [
            "permessage-deflate; server_max_window_bits",
            "permessage-deflate; server_max_window_bits=7",
            "permessage-deflate; server_max_window_bits=16",
            "permessage-deflate; client_max_window_bits=abc",
            "permessage-deflate; server_no_context_takeover=1",
        ] {
            let offers = parse_extensions_header(header);
            assert!(
                matches!(
                    interpret_deflate_params(&offers[0]),
                    Err(Error::InvalidParameterValue(_))
                ),
                "expected invalid value for {:?}",
                header
            );
        }
    }

    #[test]
    fn test_server_defaults() {
        let local = DeflateOptions::default();
        let negotiated = negotiate_server(&local, &["permessage-deflate"])
            .unwrap()
            .unwrap();
        assert!(!negotiated.server_no_context_takeover);
        assert!(!negotiated.client_no_context_takeover);
        assert_eq!(negotiated.server_max_window_bits, 15);
        assert_eq!(negotiated.client_max_window_bits, 15);
        assert_eq!(negotiated.response_header(), "permessage-deflate");
    }

    #[test]
    fn test_server_no_context_takeover_rows() {
        // Offered but not configured: honoured and echoed
        let negotiated = negotiate_server(
            &DeflateOptions::default(),
            &["permessage-deflate; server_no_context_takeover"],
        )
        .unwrap()
        .unwrap();
        assert!(negotiated.server_no_context_takeover);
        assert!(negotiated
            .response_header()
            .contains("server_no_context_takeover"));

        // Configured but not offered: still applied
        let local = DeflateOptions {
            server_no_context_takeover: true,
            ..Default::default()
        };
        let negotiated = negotiate_server(&local, &["permessage-deflate"])
            .unwrap()
            .unwrap();
        assert!(negotiated.server_no_context_takeover);
    }

    #[test]
    fn test_client_no_context_takeover_rows() {
        let negotiated = negotiate_server(
            &DeflateOptions::default(),
            &["permessage-deflate; client_no_context_takeover"],
        )
        .unwrap()
        .unwrap();
        assert!(negotiated.client_no_context_takeover);

        let local = DeflateOptions {
            client_no_context_takeover: true,
            ..Default::default()
        };
        let negotiated = negotiate_server(&local, &["permessage-deflate"])
            .unwrap()
            .unwrap();
        assert!(negotiated.client_no_context_takeover);
        assert!(negotiated
            .response_header()
            .contains("client_no_context_takeover"));
    }

    #[test]
    fn test_server_window_bits_rows() {
        // Local unset, offer set: that offer is declined
        let declined = negotiate_server(
            &DeflateOptions::default(),
            &["permessage-deflate; server_max_window_bits=10"],
        )
        .unwrap();
        assert!(declined.is_none());

        // Local set, offer unset: local bound applies
        let local = DeflateOptions {
            server_max_window_bits: Some(12),
            ..Default::default()
        };
        let negotiated = negotiate_server(&local, &["permessage-deflate"])
            .unwrap()
            .unwrap();
        assert_eq!(negotiated.server_max_window_bits, 12);
        assert!(negotiated
            .response_header()
            .contains("server_max_window_bits=12"));

        // Both set: minimum wins
        let negotiated =
            negotiate_server(&local, &["permessage-deflate; server_max_window_bits=10"])
                .unwrap()
                .unwrap();
        assert_eq!(negotiated.server_max_window_bits, 10);
    }

    #[test]
    fn test_client_window_bits_rows() {
        // Offer with value, local unset
        let negotiated = negotiate_server(
            &DeflateOptions::default(),
            &["permessage-deflate; client_max_window_bits=11"],
        )
        .unwrap()
        .unwrap();
        assert_eq!(negotiated.client_max_window_bits, 11);
        assert!(negotiated
            .response_header()
            .contains("client_max_window_bits=11"));

        // Offer valueless, local unset: default window, nothing echoed
        let negotiated = negotiate_server(
            &DeflateOptions::default(),
            &["permessage-deflate; client_max_window_bits"],
        )
        .unwrap()
        .unwrap();
        assert_eq!(negotiated.client_max_window_bits, 15);
        assert!(!negotiated
            .response_header()
            .contains("client_max_window_bits"));

        // Local set, offer silent: declined
        let local = DeflateOptions {
            client_max_window_bits: Some(10),
            ..Default::default()
        };
        assert!(negotiate_server(&local, &["permessage-deflate"])
            .unwrap()
            .is_none());

        // Local set, offer valueless: local bound applies and is echoed
        let negotiated =
            negotiate_server(&local, &["permessage-deflate; client_max_window_bits"])
                .unwrap()
                .unwrap();
        assert_eq!(negotiated.client_max_window_bits, 10);
        assert!(negotiated
            .response_header()
            .contains("client_max_window_bits=10"));

        // Both set: minimum wins
        let negotiated =
            negotiate_server(&local, &["permessage-deflate; client_max_window_bits=9"])
                .unwrap()
                .unwrap();
        assert_eq!(negotiated.client_max_window_bits, 9);
    }

    #[test]
    fn test_first_acceptable_offer_wins() {
        // First offer is declined (server bits without local config), second
        // is accepted.
        let negotiated = negotiate_server(
            &DeflateOptions::default(),
            &["permessage-deflate; server_max_window_bits=10, permessage-deflate"],
        )
        .unwrap()
        .unwrap();
        assert_eq!(negotiated.server_max_window_bits, 15);
    }

    #[test]
    fn test_foreign_extension_ignored() {
        let negotiated = negotiate_server(
            &DeflateOptions::default(),
            &["x-webkit-deflate-frame, permessage-deflate"],
        )
        .unwrap()
        .unwrap();
        assert_eq!(negotiated.server_max_window_bits, 15);

        assert!(negotiate_server(&DeflateOptions::default(), &["x-webkit-deflate-frame"])
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_client_accepts_missing_header_as_inactive() {
        assert!(accept_client(&DeflateOptions::default(), None)
            .unwrap()
            .is_none());
        assert!(accept_client(&DeflateOptions::default(), Some("  "))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_client_accepts_unrequested_server_flag() {
        let negotiated = accept_client(
            &DeflateOptions::default(),
            Some("permessage-deflate; server_no_context_takeover"),
        )
        .unwrap()
        .unwrap();
        assert!(negotiated.server_no_context_takeover);
    }

    #[test]
    fn test_client_requires_requested_server_flag() {
        let requested = DeflateOptions {
            server_no_context_takeover: true,
            ..Default::default()
        };
        assert!(matches!(
            accept_client(&requested, Some("permessage-deflate")),
            Err(Error::InvalidServerResponse)
        ));
    }

    #[test]
    fn test_client_window_bits_must_not_exceed_request() {
        let requested = DeflateOptions {
            server_max_window_bits: Some(10),
            ..Default::default()
        };
        // Within bound
        let negotiated = accept_client(
            &requested,
            Some("permessage-deflate; server_max_window_bits=9"),
        )
        .unwrap()
        .unwrap();
        assert_eq!(negotiated.server_max_window_bits, 9);

        // Exceeds bound
        assert!(matches!(
            accept_client(
                &requested,
                Some("permessage-deflate; server_max_window_bits=12"),
            ),
            Err(Error::InvalidServerResponse)
        ));

        // Requested bound must be echoed
        assert!(matches!(
            accept_client(&requested, Some("permessage-deflate")),
            Err(Error::InvalidServerResponse)
        ));
    }

    #[test]
    fn test_client_rejects_valueless_bits_in_response() {
        let requested = DeflateOptions {
            client_max_window_bits: Some(12),
            ..Default::default()
        };
        assert!(matches!(
            accept_client(&requested, Some("permessage-deflate; client_max_window_bits")),
            Err(Error::InvalidServerResponse)
        ));
    }

    #[test]
    fn test_client_rejects_foreign_response() {
        assert!(matches!(
            accept_client(&DeflateOptions::default(), Some("x-snappy")),
            Err(Error::InvalidServerResponse)
        ));
        assert!(matches!(
            accept_client(
                &DeflateOptions::default(),
                Some("permessage-deflate, permessage-deflate"),
            ),
            Err(Error::InvalidServerResponse)
        ));
    }

    #[test]
    fn test_offer_header_serialisation() {
        let options = DeflateOptions {
            server_no_context_takeover: true,
            client_no_context_takeover: true,
            server_max_window_bits: Some(12),
            client_max_window_bits: Some(11),
            ..Default::default()
        };
        assert_eq!(
            options.offer_header(),
            "permessage-deflate; server_no_context_takeover; server_max_window_bits=12; \
             client_no_context_takeover; client_max_window_bits=11"
        );
    }

    #[test]
    fn test_options_validation() {
        let bad = DeflateOptions {
            server_max_window_bits: Some(7),
            ..Default::default()
        };
        assert!(bad.validate().is_err());

        let bad = DeflateOptions {
            memory_level: 0,
            ..Default::default()
        };
        assert!(bad.validate().is_err());

        assert!(DeflateOptions::default().validate().is_ok());
    }

    struct FakeExt(u8);

    impl Extension for FakeExt {
        fn name(&self) -> &'static str {
            "fake"
        }
        fn rsv_bits(&self) -> u8 {
            self.0
        }
        fn encode(&mut self, frame: Frame) -> Result<Frame> {
            Ok(frame)
        }
        fn decode(&mut self, frame: Frame) -> Result<Frame> {
            Ok(frame)
        }
    }

    #[test]
    fn test_rsv_composition() {
        let exts: Vec<Box<dyn Extension>> = vec![Box::new(FakeExt(RSV1)), Box::new(FakeExt(RSV2))];
        assert_eq!(compose_rsv_bits(&exts).unwrap(), RSV1 | RSV2);

        let clash: Vec<Box<dyn Extension>> = vec![Box::new(FakeExt(RSV1)), Box::new(FakeExt(RSV1))];
        assert!(matches!(
            compose_rsv_bits(&clash),
            Err(Error::IncompatibleExtensions)
        ));
    }
}
