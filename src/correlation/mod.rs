//! # Correlation Header Codec
//!
//! Parses and serializes the `X-Fw-Header` bag (`K1=V1;K2=V2`) and manages
//! the reserved keys: `TCID` (34-char transaction id), `TCIDSRNO` (hop
//! sequence number), `BizSrvcCd`, and `BizSrvcIp`.
//!
//! A TCID is `date8 || hostPrefix8 || time8 || rand8`: the calendar date,
//! the first eight characters of the hostname (right-padded with `'0'`),
//! `HHMMSS` plus a literal `"00"` pad, and eight random `[a-z0-9]` chars.

use once_cell::sync::Lazy;
use rand::Rng;
use regex::Regex;
use std::collections::HashMap;

/// Header name carrying the correlation bag.
pub const FW_HEADER: &str = "X-Fw-Header";

/// Session id header used by the session routes.
pub const FW_SESSION_HEADER: &str = "X-Fw-Session-Id";

pub const KEY_TCID: &str = "TCID";
pub const KEY_TCID_SRNO: &str = "TCIDSRNO";
pub const KEY_BIZ_SRVC_CD: &str = "BizSrvcCd";
pub const KEY_BIZ_SRVC_IP: &str = "BizSrvcIp";

/// Initial hop sequence number.
pub const INITIAL_SRNO: &str = "0001";

static SRNO_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(TCIDSRNO=)(\d+)").expect("srno regex"));

/// An ordered bag of `K=V` pairs from `X-Fw-Header`.
///
/// Key order on output is unspecified; comparisons must be order-insensitive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FwHeaderBag {
    entries: HashMap<String, String>,
}

impl FwHeaderBag {
    /// Parse `"K=V;K2=V2"`. Whitespace around keys and values is trimmed,
    /// empty segments and empty keys are dropped. Values may be empty.
    pub fn parse(raw: &str) -> Self {
        let mut entries = HashMap::new();
        for part in raw.split(';') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let (key, value) = match part.split_once('=') {
                Some((k, v)) => (k.trim(), v.trim()),
                None => (part, ""),
            };
            if !key.is_empty() {
                entries.insert(key.to_string(), value.to_string());
            }
        }
        Self { entries }
    }

    /// Serialize back to `"K=V;K2=V2"`, dropping pairs with empty values.
    pub fn serialize(&self) -> String {
        let parts: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, v)| !v.is_empty())
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        parts.join(";")
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        self.entries.insert(key.to_string(), value.into());
    }

    pub fn tcid(&self) -> &str {
        self.get(KEY_TCID).unwrap_or("")
    }

    pub fn tcid_srno(&self) -> &str {
        self.get(KEY_TCID_SRNO).unwrap_or("")
    }

    pub fn biz_srvc_cd(&self) -> &str {
        self.get(KEY_BIZ_SRVC_CD).unwrap_or("")
    }

    pub fn biz_srvc_ip(&self) -> &str {
        self.get(KEY_BIZ_SRVC_IP).unwrap_or("")
    }

    /// Overwrite the server-owned fields: fresh `TCID`, `TCIDSRNO` reset to
    /// `"0001"`, caller identity fields set from `biz_code` and the request
    /// host. Used when this gateway originates a new correlation.
    pub fn apply_server_side(&mut self, biz_code: &str, host: &str) {
        self.set(KEY_TCID, generate_tcid(host));
        self.set(KEY_TCID_SRNO, INITIAL_SRNO);
        self.set(KEY_BIZ_SRVC_CD, biz_code);
        self.set(KEY_BIZ_SRVC_IP, host_ip(host));
    }
}

/// Fill in missing correlation fields while preserving an existing `TCID`
/// across hops. Always refreshes `BizSrvcCd` and `BizSrvcIp`.
pub fn ensure_for_request(raw: &str, biz_code: &str, host: &str) -> String {
    let mut bag = FwHeaderBag::parse(raw);
    if bag.tcid().is_empty() {
        bag.set(KEY_TCID, generate_tcid(host));
    }
    if bag.tcid_srno().is_empty() {
        bag.set(KEY_TCID_SRNO, INITIAL_SRNO);
    }
    bag.set(KEY_BIZ_SRVC_CD, biz_code);
    bag.set(KEY_BIZ_SRVC_IP, host_ip(host));
    bag.serialize()
}

/// Increment the `TCIDSRNO=<digits>` portion of a raw header value,
/// preserving the digit width it finds (`"00007"` becomes `"00008"`).
/// Input without a well-formed serial number is returned unchanged.
pub fn bump_srno(raw: &str) -> String {
    if raw.is_empty() {
        return String::new();
    }
    SRNO_RE
        .replace_all(raw, |caps: &regex::Captures<'_>| {
            let prefix = &caps[1];
            let digits = &caps[2];
            match digits.parse::<u64>() {
                Ok(n) => format!("{prefix}{:0width$}", n + 1, width = digits.len()),
                Err(_) => caps[0].to_string(),
            }
        })
        .into_owned()
}

/// Generate a 34-character TCID from the request host and the clock.
pub fn generate_tcid(host: &str) -> String {
    let now = chrono::Local::now();
    format!(
        "{}{}{}00{}",
        now.format("%Y%m%d"),
        short_host(host),
        now.format("%H%M%S"),
        random8()
    )
}

/// First eight characters of the hostname, right-padded with `'0'` so a
/// TCID never contains spaces.
fn short_host(host: &str) -> String {
    let name = host_ip(host);
    let mut prefix: String = name.chars().take(8).collect();
    while prefix.len() < 8 {
        prefix.push('0');
    }
    prefix
}

/// Hostname portion of a `host[:port]` value.
pub fn host_ip(host: &str) -> &str {
    match host.find(':') {
        Some(idx) if idx > 0 => &host[..idx],
        _ => host,
    }
}

const TCID_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

fn random8() -> String {
    let mut rng = rand::thread_rng();
    (0..8)
        .map(|_| TCID_CHARSET[rng.gen_range(0..TCID_CHARSET.len())] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_trims_and_drops_empty_segments() {
        let bag = FwHeaderBag::parse(" TCID = T1 ;; BizSrvcCd=SMP ; =oops ;X");
        assert_eq!(bag.tcid(), "T1");
        assert_eq!(bag.biz_srvc_cd(), "SMP");
        assert_eq!(bag.get("X"), Some(""));
        assert_eq!(bag.get(""), None);
    }

    #[test]
    fn test_serialize_drops_empty_values() {
        let mut bag = FwHeaderBag::default();
        bag.set("TCID", "T1");
        bag.set("Empty", "");
        let raw = bag.serialize();
        assert_eq!(raw, "TCID=T1");
    }

    #[test]
    fn test_parse_serialize_round_trip() {
        let raw = "TCID=T1;TCIDSRNO=0007;BizSrvcCd=SMP;BizSrvcIp=example.com";
        let round = FwHeaderBag::parse(&FwHeaderBag::parse(raw).serialize());
        assert_eq!(round, FwHeaderBag::parse(raw));
    }

    #[test]
    fn test_ensure_preserves_existing_tcid() {
        let out = ensure_for_request("TCID=KEEP;TCIDSRNO=0007", "SMP", "example.com:8080");
        let bag = FwHeaderBag::parse(&out);
        assert_eq!(bag.tcid(), "KEEP");
        assert_eq!(bag.tcid_srno(), "0007");
        assert_eq!(bag.biz_srvc_cd(), "SMP");
        assert_eq!(bag.biz_srvc_ip(), "example.com");
    }

    #[test]
    fn test_ensure_generates_missing_fields() {
        let out = ensure_for_request("", "SMP", "gw.internal:9000");
        let bag = FwHeaderBag::parse(&out);
        assert_eq!(bag.tcid().len(), 34);
        assert_eq!(bag.tcid_srno(), INITIAL_SRNO);
        assert_eq!(bag.biz_srvc_ip(), "gw.internal");
    }

    #[test]
    fn test_apply_server_side_resets_srno() {
        let mut bag = FwHeaderBag::parse("TCID=OLD;TCIDSRNO=0042");
        bag.apply_server_side("SMP", "gw.internal");
        assert_ne!(bag.tcid(), "OLD");
        assert_eq!(bag.tcid_srno(), INITIAL_SRNO);
    }

    #[test]
    fn test_bump_srno_increments_and_preserves_width() {
        assert_eq!(bump_srno("TCID=T1;TCIDSRNO=0007"), "TCID=T1;TCIDSRNO=0008");
        assert_eq!(bump_srno("TCIDSRNO=00007"), "TCIDSRNO=00008");
        assert_eq!(bump_srno("TCIDSRNO=0999"), "TCIDSRNO=1000");
        assert_eq!(bump_srno("TCIDSRNO=9999"), "TCIDSRNO=10000");
    }

    #[test]
    fn test_bump_srno_case_insensitive() {
        assert_eq!(bump_srno("tcidsrno=0001"), "tcidsrno=0002");
    }

    #[test]
    fn test_bump_srno_leaves_malformed_input_alone() {
        assert_eq!(bump_srno(""), "");
        assert_eq!(bump_srno("TCID=T1"), "TCID=T1");
        assert_eq!(bump_srno("TCIDSRNO=abc"), "TCIDSRNO=abc");
    }

    #[test]
    fn test_generated_tcid_shape() {
        let tcid = generate_tcid("example.com:8080");
        assert_eq!(tcid.len(), 34);
        assert!(tcid.starts_with(&chrono::Local::now().format("%Y%m%d").to_string()));
        assert_eq!(&tcid[8..16], "example.");
        // time8 ends with the literal "00" pad
        assert_eq!(&tcid[22..24], "00");
    }

    #[test]
    fn test_short_host_pads_with_zeroes() {
        let tcid = generate_tcid("gw:80");
        assert_eq!(&tcid[8..16], "gw000000");
        assert!(!tcid.contains(' '));
    }

    #[test]
    fn test_host_ip_strips_port() {
        assert_eq!(host_ip("example.com:8080"), "example.com");
        assert_eq!(host_ip("example.com"), "example.com");
        assert_eq!(host_ip(":8080"), ":8080");
    }
}
