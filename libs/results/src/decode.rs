//! Case-insensitive decoding of delivery-result bodies.
//!
//! Producers do not agree on field casing (`referenceId`, `REFERENCEID`,
//! `CodSysFilaEnvioMensagens`, ...), so the body is walked key by key instead
//! of relying on derived field names. Unknown keys are skipped and the last
//! occurrence of a repeated key wins.

use std::fmt;

use serde::de::{Deserialize, Deserializer, IgnoredAny, MapAccess, Visitor};

use crate::model::OutboundResult;

/// Accepted names for the send-queue key, compared ignoring ASCII case.
const REFERENCE_ID_KEYS: [&str; 2] = ["referenceId", "CodSysFilaEnvioMensagens"];
const STATUS_KEY: &str = "status";
const RESPONSE_CONTENT_KEY: &str = "responseContent";

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("invalid result body: {0}")]
    Json(#[from] serde_json::Error),
    #[error("result body has no usable referenceId")]
    MissingReferenceId,
}

/// Parses a raw message body into an [`OutboundResult`].
///
/// `status` defaults to 0 and `responseContent` to none when absent. A
/// missing or zero `referenceId` is rejected since it can never match a
/// send-queue entry.
pub fn decode_result(body: &[u8]) -> Result<OutboundResult, DecodeError> {
    let raw: RawResult = serde_json::from_slice(body)?;
    match raw.reference_id {
        Some(reference_id) if reference_id != 0 => Ok(OutboundResult::new(
            reference_id,
            raw.status.unwrap_or_default(),
            raw.response_content,
        )),
        _ => Err(DecodeError::MissingReferenceId),
    }
}

#[derive(Debug, Default)]
struct RawResult {
    reference_id: Option<i64>,
    status: Option<i32>,
    response_content: Option<String>,
}

enum Field {
    ReferenceId,
    Status,
    ResponseContent,
}

impl Field {
    fn from_key(key: &str) -> Option<Self> {
        if REFERENCE_ID_KEYS
            .iter()
            .any(|name| name.eq_ignore_ascii_case(key))
        {
            Some(Field::ReferenceId)
        } else if STATUS_KEY.eq_ignore_ascii_case(key) {
            Some(Field::Status)
        } else if RESPONSE_CONTENT_KEY.eq_ignore_ascii_case(key) {
            Some(Field::ResponseContent)
        } else {
            None
        }
    }
}

impl<'de> Deserialize<'de> for RawResult {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_map(RawResultVisitor)
    }
}

struct RawResultVisitor;

impl<'de> Visitor<'de> for RawResultVisitor {
    type Value = RawResult;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a delivery result object")
    }

    fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
    where
        A: MapAccess<'de>,
    {
        let mut raw = RawResult::default();
        while let Some(key) = map.next_key::<String>()? {
            match Field::from_key(&key) {
                Some(Field::ReferenceId) => raw.reference_id = Some(map.next_value()?),
                Some(Field::Status) => raw.status = Some(map.next_value()?),
                Some(Field::ResponseContent) => raw.response_content = map.next_value()?,
                None => {
                    map.next_value::<IgnoredAny>()?;
                }
            }
        }
        Ok(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(body: &str) -> Result<OutboundResult, DecodeError> {
        decode_result(body.as_bytes())
    }

    #[test]
    fn decodes_canonical_body() {
        let result =
            decode(r#"{"referenceId": 101, "status": 200, "responseContent": "ok"}"#).unwrap();
        assert_eq!(result, OutboundResult::new(101, 200, Some("ok".into())));
    }

    #[test]
    fn field_names_ignore_case() {
        let lower = decode(
            r#"{"codsysfilaenviomensagens": 7, "status": 400, "responsecontent": "bad"}"#,
        )
        .unwrap();
        let pascal = decode(
            r#"{"CodSysFilaEnvioMensagens": 7, "Status": 400, "ResponseContent": "bad"}"#,
        )
        .unwrap();
        let shouty = decode(r#"{"REFERENCEID": 7, "STATUS": 400, "RESPONSECONTENT": "bad"}"#)
            .unwrap();
        assert_eq!(lower, pascal);
        assert_eq!(lower, shouty);
        assert_eq!(lower.reference_id(), 7);
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let result = decode(
            r#"{"referenceId": 5, "status": 201, "provider": "whatsapp", "meta": {"a": [1, 2]}}"#,
        )
        .unwrap();
        assert_eq!(result.reference_id(), 5);
        assert_eq!(result.status(), 201);
        assert_eq!(result.response_content(), None);
    }

    #[test]
    fn missing_status_defaults_to_zero() {
        let result = decode(r#"{"referenceId": 9}"#).unwrap();
        assert_eq!(result.status(), 0);
    }

    #[test]
    fn null_response_content_is_absent() {
        let result = decode(r#"{"referenceId": 9, "responseContent": null}"#).unwrap();
        assert_eq!(result.response_content(), None);
    }

    #[test]
    fn last_duplicate_key_wins() {
        let result = decode(r#"{"referenceId": 1, "status": 500, "STATUS": 200}"#).unwrap();
        assert_eq!(result.status(), 200);
    }

    #[test]
    fn missing_or_zero_reference_is_rejected() {
        assert!(matches!(
            decode(r#"{"status": 200}"#),
            Err(DecodeError::MissingReferenceId)
        ));
        assert!(matches!(
            decode(r#"{"referenceId": 0, "status": 200}"#),
            Err(DecodeError::MissingReferenceId)
        ));
    }

    #[test]
    fn malformed_bodies_fail() {
        for body in [
            "{not json",
            "null",
            "[1, 2, 3]",
            "42",
            r#""text""#,
            r#"{"referenceId": "101"}"#,
            r#"{"referenceId": 1.5}"#,
            r#"{"referenceId": null}"#,
            r#"{"referenceId": 1, "status": null}"#,
            r#"{"referenceId": 1, "status": 3000000000}"#,
            r#"{"referenceId": 1, "responseContent": 12}"#,
            r#"{"referenceId": 1} trailing"#,
        ] {
            assert!(
                matches!(decode(body), Err(DecodeError::Json(_))),
                "expected json error for {body}"
            );
        }
    }

    #[test]
    fn invalid_utf8_fails() {
        let body = b"{\"referenceId\": 1, \"responseContent\": \"\xff\"}";
        assert!(matches!(decode_result(body), Err(DecodeError::Json(_))));
    }
}
