//! # Audit Trail
//!
//! Per-phase audit events for gateway traffic, shipped over an asynchronous
//! message bus keyed by TCID. The `Publisher` trait is the seam between
//! request handling and the transport: `publish` never blocks the request
//! path, and delivery is best-effort.

pub mod kafka;

use crate::correlation::FwHeaderBag;
use async_trait::async_trait;
use serde::Serialize;

/// Maximum audit body size: 4 KiB.
pub const MAX_AUDIT_BODY: usize = 4 * 1024;

/// Audit event phase, serialized as `rasTyp`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    InboundRequest,
    InboundResponse,
    OutboundRequest,
    OutboundResponse,
}

impl Phase {
    pub fn ras_typ(self) -> &'static str {
        match self {
            Phase::InboundRequest => "11",
            Phase::InboundResponse => "12",
            Phase::OutboundRequest => "21",
            Phase::OutboundResponse => "22",
        }
    }
}

/// One audit record on the wire.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AuditEvent {
    /// `YYYYMMDDHHMMSSmmm`.
    #[serde(rename = "timeStamp")]
    pub ts: String,
    #[serde(rename = "tcId")]
    pub tcid: String,
    #[serde(rename = "tcIdSrno")]
    pub tcid_srno: String,
    #[serde(rename = "tcIdCreMabd")]
    pub tcid_cre_mabd: String,
    #[serde(rename = "bizSrvcCd")]
    pub biz_srvc_cd: String,
    #[serde(rename = "bizSrvcIp")]
    pub biz_srvc_ip: String,
    #[serde(rename = "rasTyp")]
    pub ras_typ: String,
    /// `Y` for a normal event, `N` for a failure.
    #[serde(rename = "nmlYn")]
    pub nml_yn: String,
    #[serde(rename = "apiPath")]
    pub api_path: String,
    #[serde(rename = "apiGroupCd")]
    pub api_group_cd: String,
    #[serde(rename = "apiCd")]
    pub api_cd: String,
    /// UTF-8 body, truncated to [`MAX_AUDIT_BODY`]; omitted when empty.
    #[serde(rename = "data", skip_serializing_if = "String::is_empty")]
    pub body: String,
}

impl AuditEvent {
    /// Build an event from the correlation bag for one phase.
    pub fn from_bag(
        bag: &FwHeaderBag,
        phase: Phase,
        normal: bool,
        api_path: &str,
        group_code: &str,
        body: &[u8],
    ) -> Self {
        Self {
            ts: now_audit_ts(),
            tcid: bag.tcid().to_string(),
            tcid_srno: bag.tcid_srno().to_string(),
            tcid_cre_mabd: "00".to_string(),
            biz_srvc_cd: bag.biz_srvc_cd().to_string(),
            biz_srvc_ip: bag.biz_srvc_ip().to_string(),
            ras_typ: phase.ras_typ().to_string(),
            nml_yn: if normal { "Y" } else { "N" }.to_string(),
            api_path: api_path.to_string(),
            api_group_cd: group_code.to_string(),
            api_cd: "00001".to_string(),
            body: truncate_body(body),
        }
    }
}

/// Current timestamp in the audit format `YYYYMMDDHHMMSSmmm`.
pub fn now_audit_ts() -> String {
    chrono::Local::now().format("%Y%m%d%H%M%S%3f").to_string()
}

/// Truncate a body to [`MAX_AUDIT_BODY`] bytes and render it lossily as UTF-8.
pub fn truncate_body(body: &[u8]) -> String {
    let slice = if body.len() > MAX_AUDIT_BODY {
        &body[..MAX_AUDIT_BODY]
    } else {
        body
    };
    String::from_utf8_lossy(slice).into_owned()
}

/// Best-effort audit emission. `publish` must not block request handling;
/// `close` drains whatever was accepted.
#[async_trait]
pub trait Publisher: Send + Sync {
    fn publish(&self, key: &[u8], value: &[u8]);
    async fn close(&self);
}

/// Satisfies the interface when publishing is disabled.
pub struct NoopPublisher;

#[async_trait]
impl Publisher for NoopPublisher {
    fn publish(&self, _key: &[u8], _value: &[u8]) {}
    async fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_codes() {
        assert_eq!(Phase::InboundRequest.ras_typ(), "11");
        assert_eq!(Phase::InboundResponse.ras_typ(), "12");
        assert_eq!(Phase::OutboundRequest.ras_typ(), "21");
        assert_eq!(Phase::OutboundResponse.ras_typ(), "22");
    }

    #[test]
    fn test_truncate_body_caps_at_4k() {
        let big = vec![b'a'; MAX_AUDIT_BODY + 100];
        assert_eq!(truncate_body(&big).len(), MAX_AUDIT_BODY);
        assert_eq!(truncate_body(b"small"), "small");
    }

    #[test]
    fn test_audit_ts_shape() {
        let ts = now_audit_ts();
        assert_eq!(ts.len(), 17);
        assert!(ts.chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn test_event_from_bag_serializes_wire_names() {
        let bag = FwHeaderBag::parse("TCID=T1;TCIDSRNO=0001;BizSrvcCd=SMP;BizSrvcIp=gw");
        let event = AuditEvent::from_bag(&bag, Phase::InboundRequest, true, "/gateway", "G01", b"hi");
        let json: serde_json::Value = serde_json::to_value(&event).unwrap();
        assert_eq!(json["tcId"], "T1");
        assert_eq!(json["tcIdSrno"], "0001");
        assert_eq!(json["tcIdCreMabd"], "00");
        assert_eq!(json["rasTyp"], "11");
        assert_eq!(json["nmlYn"], "Y");
        assert_eq!(json["apiGroupCd"], "G01");
        assert_eq!(json["apiCd"], "00001");
        assert_eq!(json["data"], "hi");
    }

    #[test]
    fn test_event_omits_empty_body() {
        let bag = FwHeaderBag::default();
        let event = AuditEvent::from_bag(&bag, Phase::InboundResponse, false, "/x", "G01", b"");
        let json = serde_json::to_string(&event).unwrap();
        assert!(!json.contains("\"data\""));
        assert!(json.contains("\"nmlYn\":\"N\""));
    }
}
