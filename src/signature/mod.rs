//! Signature & Identity State (§4.5): keyed-MAC multi-factor fingerprint
//! derivation and fuzzy cross-session matching. Signatures are the only
//! identity keys that leave the request boundary — raw IP and raw UA must
//! not.

pub mod cache;
pub mod visitor;

use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::net::Ipv4Addr;

type HmacSha256 = Hmac<Sha256>;

/// How many hex characters of the MAC output are kept as the storable
/// signature (§4.5: "Take a fixed hex prefix (e.g. 16 chars)").
const SIGNATURE_HEX_LEN: usize = 16;

/// The process-wide keyed-MAC secret. Immutable after startup (§5).
#[derive(Clone)]
pub struct MacKey(Vec<u8>);

impl MacKey {
    pub fn from_base64(encoded: &str) -> crate::error::Result<Self> {
        use base64::Engine;
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| crate::error::Error::config(format!("invalid signatureHashKey: {e}")))?;
        if bytes.len() < 16 {
            return Err(crate::error::Error::config("signatureHashKey must decode to at least 16 bytes"));
        }
        Ok(Self(bytes))
    }

    /// Dev-only fallback: a key derived from process start time, never
    /// used in production (§6: "required in prod").
    pub fn dev_random() -> Self {
        let seed = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let mut bytes = seed.to_le_bytes().to_vec();
        bytes.extend_from_slice(b"botshield-dev-only-key");
        Self(bytes)
    }

    fn mac_hex(&self, input: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(&self.0).expect("HMAC accepts any key length");
        mac.update(input);
        let bytes = mac.finalize().into_bytes();
        let hex = hex::encode(bytes);
        hex[..SIGNATURE_HEX_LEN.min(hex.len())].to_string()
    }
}

/// One request's multi-factor identity fingerprint set (§3 "Signature
/// set"). `clientSide`/`plugin` are only present when the client posted
/// the corresponding fingerprint payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureSet {
    pub primary: String,
    pub ip: String,
    pub ua: String,
    pub ip_subnet: String,
    pub client_side: Option<String>,
    pub plugin: Option<String>,
}

/// Optional client-side fingerprint postback (§4.5).
#[derive(Debug, Clone, Default)]
pub struct ClientSideFingerprint {
    pub canvas: String,
    pub webgl: String,
    pub audio: String,
}

/// Optional plugin/font/extension fingerprint postback (§4.5).
#[derive(Debug, Clone, Default)]
pub struct PluginFingerprint {
    pub plugins: String,
    pub fonts: String,
    pub extensions: String,
}

/// Truncate an IPv4 address to its `/24` subnet string; non-IPv4 inputs
/// (IPv6, malformed) pass through unchanged so they still hash to a
/// stable (if coarser) bucket.
fn ip_subnet_24(ip: &str) -> String {
    match ip.parse::<Ipv4Addr>() {
        Ok(addr) => {
            let octets = addr.octets();
            format!("{}.{}.{}.0/24", octets[0], octets[1], octets[2])
        }
        Err(_) => ip.to_string(),
    }
}

/// Derive the full signature set for one request (§4.5).
pub fn derive_signatures(
    key: &MacKey,
    ip: &str,
    user_agent: &str,
    client_side: Option<&ClientSideFingerprint>,
    plugin: Option<&PluginFingerprint>,
) -> SignatureSet {
    let mut primary_input = Vec::with_capacity(ip.len() + 1 + user_agent.len());
    primary_input.extend_from_slice(ip.as_bytes());
    primary_input.push(0x00);
    primary_input.extend_from_slice(user_agent.as_bytes());

    SignatureSet {
        primary: key.mac_hex(&primary_input),
        ip: key.mac_hex(ip.as_bytes()),
        ua: key.mac_hex(user_agent.as_bytes()),
        ip_subnet: key.mac_hex(ip_subnet_24(ip).as_bytes()),
        client_side: client_side.map(|c| key.mac_hex(format!("{}\x00{}\x00{}", c.canvas, c.webgl, c.audio).as_bytes())),
        plugin: plugin.map(|p| key.mac_hex(format!("{}\x00{}\x00{}", p.plugins, p.fonts, p.extensions).as_bytes())),
    }
}

/// Per-factor weights for fuzzy cross-session matching (§4.5).
pub struct FactorWeights;

impl FactorWeights {
    pub const PRIMARY: u32 = 100;
    pub const IP: u32 = 50;
    pub const UA: u32 = 50;
    pub const IP_SUBNET: u32 = 30;
    pub const CLIENT_SIDE: u32 = 80;
    pub const PLUGIN: u32 = 60;
}

pub const DEFAULT_MIN_WEIGHT_FOR_MATCH: u32 = 100;
pub const DEFAULT_MIN_WEIGHT_FOR_WEAK_MATCH: u32 = 80;
pub const DEFAULT_MIN_FACTORS_FOR_WEAK_MATCH: u32 = 2;

/// Combined weight and distinct-matching-factor count across every factor
/// two signature sets share (§4.5 "Fuzzy match").
pub fn fuzzy_match_weight(a: &SignatureSet, b: &SignatureSet) -> (u32, u32) {
    let mut weight = 0;
    let mut factors = 0;

    let mut check = |matches: bool, w: u32| {
        if matches {
            weight += w;
            factors += 1;
        }
    };

    check(a.primary == b.primary, FactorWeights::PRIMARY);
    check(a.ip == b.ip, FactorWeights::IP);
    check(a.ua == b.ua, FactorWeights::UA);
    check(a.ip_subnet == b.ip_subnet, FactorWeights::IP_SUBNET);
    check(
        a.client_side.is_some() && a.client_side == b.client_side,
        FactorWeights::CLIENT_SIDE,
    );
    check(a.plugin.is_some() && a.plugin == b.plugin, FactorWeights::PLUGIN);

    (weight, factors)
}

/// Whether two signature sets count as the same visitor, per the weighted
/// voting rule in §4.5: combined weight >= `min_weight_for_match`, OR
/// (weight >= `min_weight_for_weak_match` AND distinct factors >=
/// `min_factors_for_weak_match`).
pub fn is_match(
    combined_weight: u32,
    matching_factors: u32,
    min_weight_for_match: u32,
    min_weight_for_weak_match: u32,
    min_factors_for_weak_match: u32,
) -> bool {
    combined_weight >= min_weight_for_match
        || (combined_weight >= min_weight_for_weak_match && matching_factors >= min_factors_for_weak_match)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> MacKey {
        MacKey::from_base64("c3VwZXItc2VjcmV0LXNpZ25pbmcta2V5LWZvci10ZXN0cw==").unwrap()
    }

    #[test]
    fn same_inputs_produce_same_signatures() {
        let k = key();
        let a = derive_signatures(&k, "203.0.113.10", "Mozilla/5.0", None, None);
        let b = derive_signatures(&k, "203.0.113.10", "Mozilla/5.0", None, None);
        assert_eq!(a, b);
    }

    #[test]
    fn different_ip_changes_primary_and_ip_but_not_ua() {
        let k = key();
        let a = derive_signatures(&k, "203.0.113.10", "Mozilla/5.0", None, None);
        let b = derive_signatures(&k, "198.51.100.4", "Mozilla/5.0", None, None);
        assert_ne!(a.primary, b.primary);
        assert_ne!(a.ip, b.ip);
        assert_eq!(a.ua, b.ua);
    }

    #[test]
    fn signature_is_truncated_to_sixteen_hex_chars() {
        let k = key();
        let sig = derive_signatures(&k, "203.0.113.10", "Mozilla/5.0", None, None);
        assert_eq!(sig.primary.len(), 16);
    }

    #[test]
    fn raw_ip_and_ua_are_not_recoverable_from_signature() {
        let k = key();
        let sig = derive_signatures(&k, "203.0.113.10", "Mozilla/5.0", None, None);
        assert!(!sig.primary.contains("203.0.113.10"));
        assert!(!sig.ip.contains("203"));
    }

    #[test]
    fn ip_subnet_truncates_to_slash_24() {
        assert_eq!(ip_subnet_24("203.0.113.200"), "203.0.113.0/24");
        assert_eq!(ip_subnet_24("not-an-ip"), "not-an-ip");
    }

    #[test]
    fn fuzzy_match_exact_primary_hit_exceeds_min_weight_for_match() {
        let k = key();
        let a = derive_signatures(&k, "203.0.113.10", "Mozilla/5.0", None, None);
        let (weight, factors) = fuzzy_match_weight(&a, &a);
        assert!(is_match(weight, factors, DEFAULT_MIN_WEIGHT_FOR_MATCH, DEFAULT_MIN_WEIGHT_FOR_WEAK_MATCH, DEFAULT_MIN_FACTORS_FOR_WEAK_MATCH));
    }

    #[test]
    fn weak_match_requires_both_weight_and_factor_count() {
        // ip (50) + ip_subnet (30) = 80 weight, 2 factors: weak match.
        let weight = FactorWeights::IP + FactorWeights::IP_SUBNET;
        assert!(is_match(weight, 2, DEFAULT_MIN_WEIGHT_FOR_MATCH, DEFAULT_MIN_WEIGHT_FOR_WEAK_MATCH, DEFAULT_MIN_FACTORS_FOR_WEAK_MATCH));
        // Same weight, only 1 factor: not a weak match.
        assert!(!is_match(weight, 1, DEFAULT_MIN_WEIGHT_FOR_MATCH, DEFAULT_MIN_WEIGHT_FOR_WEAK_MATCH, DEFAULT_MIN_FACTORS_FOR_WEAK_MATCH));
    }

    #[test]
    fn below_both_thresholds_is_not_a_match() {
        assert!(!is_match(FactorWeights::UA, 1, DEFAULT_MIN_WEIGHT_FOR_MATCH, DEFAULT_MIN_WEIGHT_FOR_WEAK_MATCH, DEFAULT_MIN_FACTORS_FOR_WEAK_MATCH));
    }
}
