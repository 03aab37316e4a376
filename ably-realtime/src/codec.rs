//! Message payload encoding and decoding.
//!
//! An encoding string lists transforms in the order they were applied, e.g.
//! `json/utf-8/cipher+aes-256-cbc/base64`. Decoding walks it right to left.

use std::sync::Arc;

use base64::Engine as _;

use crate::crypto::ChannelCipher;
use crate::error::{BoxError, ErrorInfo, error_code};
use crate::options::ChannelOptions;
use crate::protocol::{Format, WireData, WireMessage};
use crate::types::Data;

/// Reconstructs a payload from a delta against the previous payload.
pub trait DeltaDecoder: Send + Sync {
    fn decode(&self, delta: &[u8], base: &[u8]) -> Result<Vec<u8>, BoxError>;
}

/// A payload that could not be fully decoded.
///
/// `data` holds the result of the transforms that did succeed, and
/// `encoding` the transforms still outstanding (including the failed one).
#[derive(Debug, Clone, PartialEq)]
pub struct DecodeError {
    pub error: ErrorInfo,
    pub data: Data,
    pub encoding: Option<String>,
}

impl DecodeError {
    pub fn code(&self) -> i32 {
        self.error.code
    }
}

fn bytes_of(data: &Data) -> Option<Vec<u8>> {
    match data {
        Data::None => None,
        Data::String(s) => Some(s.as_bytes().to_vec()),
        Data::Binary(b) => Some(b.clone()),
        Data::Json(v) => Some(v.to_string().into_bytes()),
    }
}

impl From<WireData> for Data {
    fn from(w: WireData) -> Self {
        match w {
            WireData::Null => Data::None,
            WireData::String(s) => Data::String(s),
            WireData::Binary(b) => Data::Binary(b),
            WireData::Json(v) => Data::Json(v),
        }
    }
}

fn push(encoding: &mut Option<String>, xform: &str) {
    *encoding = Some(match encoding.take() {
        Some(e) => format!("{e}/{xform}"),
        None => xform.to_string(),
    });
}

/// Per-channel encoder/decoder holding cipher and delta state.
pub(crate) struct ChannelCodec {
    cipher: Option<Box<dyn ChannelCipher>>,
    delta: Option<Arc<dyn DeltaDecoder>>,
    format: Format,
    base_payload: Option<Vec<u8>>,
    last_message_id: Option<String>,
}

impl ChannelCodec {
    pub(crate) fn new(options: &ChannelOptions, format: Format) -> Self {
        Self {
            cipher: options.cipher.as_ref().map(|c| c.cipher()),
            delta: options.delta.clone(),
            format,
            base_payload: None,
            last_message_id: None,
        }
    }

    // ---- encode ----

    /// Encodes `data` for publishing, encrypting when the channel has a cipher.
    pub(crate) fn encode(&mut self, data: &Data) -> Result<(WireData, Option<String>), ErrorInfo> {
        let (payload, mut encoding) = Self::encode_plain(data);
        let payload = match (&mut self.cipher, payload) {
            (Some(cipher), WireData::String(s)) => {
                push(&mut encoding, "utf-8");
                let ct = cipher.encrypt(s.as_bytes())?;
                push(&mut encoding, &format!("cipher+{}", cipher.algorithm()));
                WireData::Binary(ct)
            }
            (Some(cipher), WireData::Binary(b)) => {
                let ct = cipher.encrypt(&b)?;
                push(&mut encoding, &format!("cipher+{}", cipher.algorithm()));
                WireData::Binary(ct)
            }
            (_, other) => other,
        };
        Ok(self.for_wire(payload, encoding))
    }

    /// Encodes without encryption (annotations are summarised server-side).
    pub(crate) fn encode_unencrypted(&self, data: &Data) -> (WireData, Option<String>) {
        let (payload, encoding) = Self::encode_plain(data);
        self.for_wire(payload, encoding)
    }

    fn encode_plain(data: &Data) -> (WireData, Option<String>) {
        match data {
            Data::None => (WireData::Null, None),
            Data::String(s) => (WireData::String(s.clone()), None),
            Data::Binary(b) => (WireData::Binary(b.clone()), None),
            Data::Json(v) => (WireData::String(v.to_string()), Some("json".to_string())),
        }
    }

    /// JSON frames cannot carry binary, so it travels as base64.
    fn for_wire(&self, payload: WireData, mut encoding: Option<String>) -> (WireData, Option<String>) {
        match (self.format, payload) {
            (Format::Json, WireData::Binary(b)) => {
                push(&mut encoding, "base64");
                (
                    WireData::String(base64::engine::general_purpose::STANDARD.encode(b)),
                    encoding,
                )
            }
            (_, payload) => (payload, encoding),
        }
    }

    // ---- decode ----

    /// Decodes a channel message payload and records it as the next delta base.
    pub(crate) fn decode(
        &mut self,
        data: WireData,
        encoding: Option<String>,
    ) -> Result<Data, DecodeError> {
        let (decoded, base) = self.decode_inner(data, encoding, true)?;
        if self.delta.is_some() {
            self.base_payload = base;
        }
        Ok(decoded)
    }

    /// Decodes a presence payload; does not touch delta state.
    pub(crate) fn decode_detached(
        &self,
        data: WireData,
        encoding: Option<String>,
    ) -> Result<Data, DecodeError> {
        self.decode_inner(data, encoding, false).map(|(d, _)| d)
    }

    fn decode_inner(
        &self,
        data: WireData,
        encoding: Option<String>,
        track_base: bool,
    ) -> Result<(Data, Option<Vec<u8>>), DecodeError> {
        let track_base = track_base && self.delta.is_some();
        let mut current = Data::from(data);
        let mut last_payload = if track_base { bytes_of(&current) } else { None };

        let Some(encoding) = encoding.filter(|e| !e.is_empty()) else {
            return Ok((current, last_payload));
        };
        let xforms: Vec<&str> = encoding.split('/').collect();
        let mut remaining = xforms.len();

        while let Some(xform) = remaining.checked_sub(1).and_then(|i| xforms.get(i)) {
            let (name, param) = match xform.split_once('+') {
                Some((n, p)) => (n, Some(p)),
                None => (*xform, None),
            };
            let outermost = remaining == xforms.len();
            match self.apply(name, param, current) {
                Ok((next, produced_base)) => {
                    current = next;
                    if produced_base || (name == "base64" && outermost) {
                        last_payload = if track_base { bytes_of(&current) } else { None };
                    }
                    remaining -= 1;
                }
                Err((err, data)) => {
                    let rest = xforms.get(..remaining).map(|x| x.join("/"));
                    tracing::warn!(xform = name, code = err.code, "failed to decode message payload");
                    return Err(DecodeError {
                        error: ErrorInfo::new(
                            err.code,
                            400,
                            format!(
                                "Error processing the {name} encoding, decoder returned '{}'",
                                err.message
                            ),
                        ),
                        data,
                        encoding: rest,
                    });
                }
            }
        }
        Ok((current, last_payload))
    }

    /// Applies one transform. The bool reports whether the output is a new delta base.
    fn apply(
        &self,
        name: &str,
        param: Option<&str>,
        data: Data,
    ) -> Result<(Data, bool), (ErrorInfo, Data)> {
        let fail = |message: &str, data: Data| {
            Err((
                ErrorInfo::new(error_code::UNSUPPORTED_ENCODING, 400, message),
                data,
            ))
        };
        match name {
            "base64" => {
                let decoded = match &data {
                    Data::String(s) => Some(base64::engine::general_purpose::STANDARD.decode(s)),
                    Data::Binary(b) => Some(base64::engine::general_purpose::STANDARD.decode(b)),
                    _ => None,
                };
                match decoded {
                    Some(Ok(bytes)) => Ok((Data::Binary(bytes), false)),
                    Some(Err(e)) => fail(&e.to_string(), data),
                    None => fail("base64 data must be a string", data),
                }
            }
            "utf-8" => match data {
                Data::Binary(bytes) => match String::from_utf8(bytes) {
                    Ok(s) => Ok((Data::String(s), false)),
                    Err(e) => {
                        let msg = e.to_string();
                        fail(&msg, Data::Binary(e.into_bytes()))
                    }
                },
                other => Ok((other, false)),
            },
            "json" => {
                let parsed = match &data {
                    Data::String(s) => Some(serde_json::from_str::<serde_json::Value>(s)),
                    Data::Binary(b) => Some(serde_json::from_slice::<serde_json::Value>(b)),
                    _ => None,
                };
                match parsed {
                    Some(Ok(v)) => Ok((Data::Json(v), false)),
                    Some(Err(e)) => fail(&e.to_string(), data),
                    None => fail("json data must be a string", data),
                }
            }
            "cipher" => {
                let Some(cipher) = &self.cipher else {
                    return fail("Unable to decrypt message; not an encrypted channel", data);
                };
                if param != Some(cipher.algorithm()) {
                    return fail(
                        "Unable to decrypt message with given cipher; incompatible cipher params",
                        data,
                    );
                }
                match data {
                    Data::Binary(ct) => match cipher.decrypt(&ct) {
                        Ok(plain) => Ok((Data::Binary(plain), false)),
                        Err(e) => Err((e, Data::Binary(ct))),
                    },
                    other => fail("encrypted data must be binary", other),
                }
            }
            "vcdiff" => {
                let Some(decoder) = &self.delta else {
                    return Err((
                        ErrorInfo::new(error_code::DELTA_DECODER_MISSING, 400, "Missing vcdiff decoder"),
                        data,
                    ));
                };
                let delta_failed = |message: String, data: Data| {
                    Err((ErrorInfo::new(error_code::DELTA_DECODE_FAILED, 400, message), data))
                };
                let (Some(base), Some(delta)) = (&self.base_payload, bytes_of(&data)) else {
                    return delta_failed("No base payload for delta".to_string(), data);
                };
                match decoder.decode(&delta, base) {
                    Ok(out) => Ok((Data::Binary(out), true)),
                    Err(e) => delta_failed(format!("Vcdiff delta decode failed with {e}"), data),
                }
            }
            other => fail(&format!("Unknown encoding {other}"), data),
        }
    }

    // ---- delta continuity ----

    /// 40018 when a delta refers to a message other than the last one decoded.
    pub(crate) fn check_delta_reference(&self, first: &WireMessage) -> Result<(), ErrorInfo> {
        let from = first
            .extras
            .as_ref()
            .and_then(|e| e.get("delta"))
            .and_then(|d| d.get("from"))
            .and_then(|f| f.as_str());
        match from {
            Some(from) if self.last_message_id.as_deref() != Some(from) => Err(ErrorInfo::new(
                error_code::DELTA_DECODE_FAILED,
                400,
                format!(
                    "Delta message decode failure - previous message not available for message {:?}",
                    first.id
                ),
            )),
            _ => Ok(()),
        }
    }

    pub(crate) fn set_last_message_id(&mut self, id: Option<String>) {
        self.last_message_id = id;
    }

    /// Forgets the delta base after a decode failure.
    pub(crate) fn reset_delta(&mut self) {
        self.base_payload = None;
        self.last_message_id = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::CipherParams;

    struct Append;

    /// Test delta format: the delta is appended to the base.
    impl DeltaDecoder for Append {
        fn decode(&self, delta: &[u8], base: &[u8]) -> Result<Vec<u8>, BoxError> {
            if delta.first() == Some(&0xff) {
                return Err("corrupt delta".into());
            }
            Ok([base, delta].concat())
        }
    }

    fn codec(format: Format) -> ChannelCodec {
        ChannelCodec::new(&ChannelOptions::default(), format)
    }

    fn encrypted(format: Format) -> ChannelCodec {
        let params = CipherParams::from_key(&[9u8; 32]).unwrap();
        ChannelCodec::new(&ChannelOptions::with_cipher(params), format)
    }

    fn with_delta() -> ChannelCodec {
        let options = ChannelOptions {
            delta: Some(Arc::new(Append)),
            ..Default::default()
        };
        ChannelCodec::new(&options, Format::MsgPack)
    }

    #[test]
    fn json_data_is_stringified() {
        let mut c = codec(Format::MsgPack);
        let (data, enc) = c.encode(&Data::Json(serde_json::json!({"a": 1}))).unwrap();
        assert_eq!(data, WireData::String(r#"{"a":1}"#.to_string()));
        assert_eq!(enc.as_deref(), Some("json"));
        assert_eq!(
            c.decode(data, enc).unwrap(),
            Data::Json(serde_json::json!({"a": 1}))
        );
    }

    #[test]
    fn binary_on_json_wire_is_base64() {
        let mut c = codec(Format::Json);
        let (data, enc) = c.encode(&Data::Binary(vec![1, 2, 3])).unwrap();
        assert_eq!(data, WireData::String("AQID".to_string()));
        assert_eq!(enc.as_deref(), Some("base64"));
        assert_eq!(c.decode(data, enc).unwrap(), Data::Binary(vec![1, 2, 3]));
    }

    #[test]
    fn encrypted_string_round_trip() {
        let mut c = encrypted(Format::MsgPack);
        let (data, enc) = c.encode(&Data::from("secret")).unwrap();
        assert_eq!(enc.as_deref(), Some("utf-8/cipher+aes-256-cbc"));
        assert!(matches!(data, WireData::Binary(_)));
        assert_eq!(c.decode(data, enc).unwrap(), Data::from("secret"));
    }

    #[test]
    fn encrypted_json_on_json_wire() {
        let mut c = encrypted(Format::Json);
        let (data, enc) = c.encode(&Data::Json(serde_json::json!([1, 2]))).unwrap();
        assert_eq!(enc.as_deref(), Some("json/utf-8/cipher+aes-256-cbc/base64"));
        assert_eq!(c.decode(data, enc).unwrap(), Data::Json(serde_json::json!([1, 2])));
    }

    #[test]
    fn cipher_without_key_keeps_partial_result() {
        let mut sender = encrypted(Format::Json);
        let (data, enc) = sender.encode(&Data::from("x")).unwrap();
        let mut receiver = codec(Format::Json);
        let err = receiver.decode(data, enc).unwrap_err();
        assert_eq!(err.code(), 40013);
        assert_eq!(err.encoding.as_deref(), Some("utf-8/cipher+aes-256-cbc"));
        assert!(matches!(err.data, Data::Binary(_)));
    }

    #[test]
    fn mismatched_algorithm_is_rejected() {
        let mut sender = ChannelCodec::new(
            &ChannelOptions::with_cipher(CipherParams::from_key(&[1u8; 16]).unwrap()),
            Format::MsgPack,
        );
        let (data, enc) = sender.encode(&Data::from("x")).unwrap();
        let err = encrypted(Format::MsgPack).decode(data, enc).unwrap_err();
        assert!(err.error.message.contains("incompatible"));
    }

    #[test]
    fn unknown_encoding_fails_with_40013() {
        let err = codec(Format::MsgPack)
            .decode(WireData::String("x".into()), Some("rot13".into()))
            .unwrap_err();
        assert_eq!(err.code(), 40013);
        assert_eq!(err.encoding.as_deref(), Some("rot13"));
        assert_eq!(err.data, Data::from("x"));
    }

    #[test]
    fn vcdiff_without_decoder_is_40019() {
        let err = codec(Format::MsgPack)
            .decode(WireData::Binary(vec![1]), Some("vcdiff".into()))
            .unwrap_err();
        assert_eq!(err.code(), 40019);
    }

    #[test]
    fn vcdiff_applies_against_previous_payload() {
        let mut c = with_delta();
        assert_eq!(
            c.decode(WireData::Binary(b"abc".to_vec()), None).unwrap(),
            Data::Binary(b"abc".to_vec())
        );
        let out = c
            .decode(WireData::Binary(b"def".to_vec()), Some("vcdiff".into()))
            .unwrap();
        assert_eq!(out, Data::Binary(b"abcdef".to_vec()));
        // the reconstructed payload becomes the next base
        let out = c
            .decode(
                WireData::String(base64::engine::general_purpose::STANDARD.encode(b"!")),
                Some("utf-8/vcdiff/base64".into()),
            )
            .unwrap();
        assert_eq!(out, Data::from("abcdef!"));
    }

    #[test]
    fn vcdiff_failure_is_40018() {
        let mut c = with_delta();
        c.decode(WireData::Binary(b"abc".to_vec()), None).unwrap();
        let err = c
            .decode(WireData::Binary(vec![0xff]), Some("vcdiff".into()))
            .unwrap_err();
        assert_eq!(err.code(), 40018);
        c.reset_delta();
        let err = c
            .decode(WireData::Binary(b"x".to_vec()), Some("vcdiff".into()))
            .unwrap_err();
        assert_eq!(err.code(), 40018);
    }

    #[test]
    fn delta_reference_must_match_last_message() {
        let mut c = with_delta();
        let msg = WireMessage {
            id: Some("m2".into()),
            extras: Some(serde_json::json!({"delta": {"from": "m1", "format": "vcdiff"}})),
            ..Default::default()
        };
        assert_eq!(c.check_delta_reference(&msg).unwrap_err().code, 40018);
        c.set_last_message_id(Some("m1".into()));
        assert!(c.check_delta_reference(&msg).is_ok());
        assert!(c.check_delta_reference(&WireMessage::default()).is_ok());
    }

    #[test]
    fn presence_decode_leaves_delta_state_alone() {
        let mut c = with_delta();
        c.decode(WireData::Binary(b"base".to_vec()), None).unwrap();
        c.decode_detached(WireData::String("p".into()), None).unwrap();
        let out = c
            .decode(WireData::Binary(b"+".to_vec()), Some("vcdiff".into()))
            .unwrap();
        assert_eq!(out, Data::Binary(b"base+".to_vec()));
    }
}
