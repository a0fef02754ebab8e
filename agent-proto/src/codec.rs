//! Codec for the custom binary control protocol (registration,
//! authentication, session refresh, API-key traffic).
//!
//! Every message is a single byte string beginning with a one-byte type;
//! there is no outer frame length. Integers are little-endian; strings and
//! variable blobs are prefixed by a `u16` length. `try_parse` peeks the type
//! byte and then consumes exactly the fixed+variable fields that type
//! defines, returning `Ok(None)` when the buffer doesn't yet hold a full
//! message (mirroring a streaming TCP decoder's partial/complete/error
//! contract) rather than treating the whole stream as length-prefixed.

use thiserror::Error;

/// Errors from parsing or building a control message.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum CodecError {
    #[error("truncated frame: need at least {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },
    #[error("invalid message type byte: 0x{0:02x}")]
    InvalidType(u8),
    #[error("field length {0} exceeds remaining buffer")]
    InvalidLength(usize),
}

/// Result byte: `0x00` success, `0x01` failure.
pub const RESULT_SUCCESS: u8 = 0x00;
pub const RESULT_FAILURE: u8 = 0x01;

/// Router-reported error codes (registration/auth failure reasons).
pub mod error_code {
    pub const INVALID_HMAC: u8 = 0x00;
    pub const TIMESTAMP_SKEW: u8 = 0x01;
    pub const UNKNOWN_DRONE: u8 = 0x02;
    pub const RATE_LIMITED: u8 = 0x03;
    pub const SESSION_EXPIRED: u8 = 0x06;
    pub const INVALID_TOKEN: u8 = 0x07;
}

/// One-byte wire type codes.
pub mod msg_type {
    pub const AUTH_INIT: u8 = 0x01;
    pub const AUTH_CHALLENGE: u8 = 0x02;
    pub const AUTH_RESPONSE: u8 = 0x03;
    pub const AUTH_ACK: u8 = 0x04;
    pub const SESSION_NEW: u8 = 0x10;
    pub const SESSION_ACK: u8 = 0x11;
    pub const SESSION_REFRESH: u8 = 0x12;
    pub const SESSION_REFRESH_ACK: u8 = 0x13;
    pub const API_KEY_REQUEST: u8 = 0x20;
    pub const API_KEY_RESPONSE: u8 = 0x21;
    pub const API_KEY_REVOKE: u8 = 0x22;
    pub const API_KEY_REVOKE_ACK: u8 = 0x23;
    pub const API_KEY_STATUS: u8 = 0x24;
    pub const API_KEY_STATUS_ACK: u8 = 0x25;
    pub const API_KEY_DELETE: u8 = 0x26;
    pub const API_KEY_DELETE_ACK: u8 = 0x27;
    pub const REGISTER_INIT: u8 = 0xA0;
    pub const REGISTER_CHALLENGE: u8 = 0xA1;
    pub const REGISTER_RESPONSE: u8 = 0xA2;
    pub const REGISTER_ACK: u8 = 0xA3;
}

/// Outcome of an operation that can succeed or fail with a router error code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<T> {
    Success(T),
    Failure { error_code: u8, wait_sec: Option<u16> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthAckOk {
    pub token: Vec<u8>,
    pub expires_at: u64,
    pub interval: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshAckOk {
    pub expires_at: u64,
    pub interval: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterAckOk {
    pub secret_key: Vec<u8>,
    pub token: Vec<u8>,
    pub expires_at: u64,
    pub interval: u16,
}

/// One parsed/buildable control message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    AuthInit { uuid: String },
    AuthChallenge { nonce: Vec<u8>, timeout_sec: u16 },
    AuthResponse { uuid: String, hmac: [u8; 32], timestamp: u64, ip: String },
    AuthAck(Outcome<AuthAckOk>),
    SessionNew { token: Vec<u8>, uuid: String },
    SessionAck(Outcome<AuthAckOk>),
    SessionRefresh { token: Vec<u8>, uuid: String },
    SessionRefreshAck(Outcome<RefreshAckOk>),
    ApiKeyRequest { expiration_hours: u16 },
    ApiKeyResponse(Outcome<Vec<u8>>),
    ApiKeyRevoke,
    ApiKeyRevokeAck(Outcome<()>),
    ApiKeyStatus,
    ApiKeyStatusAck(Outcome<Vec<u8>>),
    ApiKeyDelete,
    ApiKeyDeleteAck(Outcome<()>),
    RegisterInit { uuid: String },
    RegisterChallenge { nonce: Vec<u8>, timeout_sec: u16 },
    RegisterResponse { uuid: String, hmac: [u8; 32], timestamp: u64, ip: String },
    RegisterAck(Outcome<RegisterAckOk>),
}

// --- primitive readers/writers -------------------------------------------

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn need(&self, n: usize) -> Result<(), CodecError> {
        if self.pos + n > self.buf.len() {
            Err(CodecError::Truncated { needed: self.pos + n, available: self.buf.len() })
        } else {
            Ok(())
        }
    }

    fn u8(&mut self) -> Result<u8, CodecError> {
        self.need(1)?;
        let v = self.buf[self.pos];
        self.pos += 1;
        Ok(v)
    }

    fn u16(&mut self) -> Result<u16, CodecError> {
        self.need(2)?;
        let v = u16::from_le_bytes([self.buf[self.pos], self.buf[self.pos + 1]]);
        self.pos += 2;
        Ok(v)
    }

    fn u64(&mut self) -> Result<u64, CodecError> {
        self.need(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(&self.buf[self.pos..self.pos + 8]);
        self.pos += 8;
        Ok(u64::from_le_bytes(arr))
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        self.need(n)?;
        let v = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(v)
    }

    fn blob(&mut self) -> Result<Vec<u8>, CodecError> {
        let len = self.u16()? as usize;
        Ok(self.bytes(len)?.to_vec())
    }

    fn string(&mut self) -> Result<String, CodecError> {
        let bytes = self.blob()?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn array32(&mut self) -> Result<[u8; 32], CodecError> {
        let bytes = self.bytes(32)?;
        let mut arr = [0u8; 32];
        arr.copy_from_slice(bytes);
        Ok(arr)
    }
}

fn put_u16(buf: &mut Vec<u8>, v: u16) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn put_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn put_blob(buf: &mut Vec<u8>, data: &[u8]) {
    put_u16(buf, data.len() as u16);
    buf.extend_from_slice(data);
}

fn put_string(buf: &mut Vec<u8>, s: &str) {
    put_blob(buf, s.as_bytes());
}

/// Parse a `result` byte followed by either the success payload (built by
/// `ok`) or `[error_code:1][wait_sec:2?]`. `wait_sec` only accompanies
/// rate-limit style failures; we read it opportunistically when the
/// remaining bytes allow it.
fn read_outcome<T>(
    r: &mut Reader,
    ok: impl FnOnce(&mut Reader) -> Result<T, CodecError>,
) -> Result<Outcome<T>, CodecError> {
    let result = r.u8()?;
    if result == RESULT_SUCCESS {
        Ok(Outcome::Success(ok(r)?))
    } else {
        let error_code = r.u8()?;
        let wait_sec = r.u16().ok();
        Ok(Outcome::Failure { error_code, wait_sec })
    }
}

fn write_outcome<T>(buf: &mut Vec<u8>, outcome: &Outcome<T>, write_ok: impl FnOnce(&mut Vec<u8>, &T)) {
    match outcome {
        Outcome::Success(v) => {
            buf.push(RESULT_SUCCESS);
            write_ok(buf, v);
        }
        Outcome::Failure { error_code, wait_sec } => {
            buf.push(RESULT_FAILURE);
            buf.push(*error_code);
            if let Some(w) = wait_sec {
                put_u16(buf, *w);
            }
        }
    }
}

impl ControlMessage {
    /// Serialize this message to its wire form.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            ControlMessage::AuthInit { uuid } => {
                buf.push(msg_type::AUTH_INIT);
                put_string(&mut buf, uuid);
            }
            ControlMessage::AuthChallenge { nonce, timeout_sec } => {
                buf.push(msg_type::AUTH_CHALLENGE);
                put_blob(&mut buf, nonce);
                put_u16(&mut buf, *timeout_sec);
            }
            ControlMessage::AuthResponse { uuid, hmac, timestamp, ip } => {
                buf.push(msg_type::AUTH_RESPONSE);
                put_string(&mut buf, uuid);
                put_blob(&mut buf, hmac);
                put_u64(&mut buf, *timestamp);
                put_string(&mut buf, ip);
            }
            ControlMessage::AuthAck(outcome) => {
                buf.push(msg_type::AUTH_ACK);
                write_outcome(&mut buf, outcome, write_auth_ack_ok);
            }
            ControlMessage::SessionNew { token, uuid } => {
                buf.push(msg_type::SESSION_NEW);
                put_blob(&mut buf, token);
                put_string(&mut buf, uuid);
            }
            ControlMessage::SessionAck(outcome) => {
                buf.push(msg_type::SESSION_ACK);
                write_outcome(&mut buf, outcome, write_auth_ack_ok);
            }
            ControlMessage::SessionRefresh { token, uuid } => {
                buf.push(msg_type::SESSION_REFRESH);
                put_blob(&mut buf, token);
                put_string(&mut buf, uuid);
            }
            ControlMessage::SessionRefreshAck(outcome) => {
                buf.push(msg_type::SESSION_REFRESH_ACK);
                write_outcome(&mut buf, outcome, |buf, ok: &RefreshAckOk| {
                    put_u64(buf, ok.expires_at);
                    put_u16(buf, ok.interval);
                });
            }
            ControlMessage::ApiKeyRequest { expiration_hours } => {
                buf.push(msg_type::API_KEY_REQUEST);
                put_u16(&mut buf, *expiration_hours);
            }
            ControlMessage::ApiKeyResponse(outcome) => {
                buf.push(msg_type::API_KEY_RESPONSE);
                write_outcome(&mut buf, outcome, |buf, key: &Vec<u8>| put_blob(buf, key));
            }
            ControlMessage::ApiKeyRevoke => buf.push(msg_type::API_KEY_REVOKE),
            ControlMessage::ApiKeyRevokeAck(outcome) => {
                buf.push(msg_type::API_KEY_REVOKE_ACK);
                write_outcome(&mut buf, outcome, |_, _| {});
            }
            ControlMessage::ApiKeyStatus => buf.push(msg_type::API_KEY_STATUS),
            ControlMessage::ApiKeyStatusAck(outcome) => {
                buf.push(msg_type::API_KEY_STATUS_ACK);
                write_outcome(&mut buf, outcome, |buf, status: &Vec<u8>| put_blob(buf, status));
            }
            ControlMessage::ApiKeyDelete => buf.push(msg_type::API_KEY_DELETE),
            ControlMessage::ApiKeyDeleteAck(outcome) => {
                buf.push(msg_type::API_KEY_DELETE_ACK);
                write_outcome(&mut buf, outcome, |_, _| {});
            }
            ControlMessage::RegisterInit { uuid } => {
                buf.push(msg_type::REGISTER_INIT);
                put_string(&mut buf, uuid);
            }
            ControlMessage::RegisterChallenge { nonce, timeout_sec } => {
                buf.push(msg_type::REGISTER_CHALLENGE);
                put_blob(&mut buf, nonce);
                put_u16(&mut buf, *timeout_sec);
            }
            ControlMessage::RegisterResponse { uuid, hmac, timestamp, ip } => {
                buf.push(msg_type::REGISTER_RESPONSE);
                put_string(&mut buf, uuid);
                put_blob(&mut buf, hmac);
                put_u64(&mut buf, *timestamp);
                put_string(&mut buf, ip);
            }
            ControlMessage::RegisterAck(outcome) => {
                buf.push(msg_type::REGISTER_ACK);
                write_outcome(&mut buf, outcome, |buf, ok: &RegisterAckOk| {
                    put_blob(buf, &ok.secret_key);
                    put_blob(buf, &ok.token);
                    put_u64(buf, ok.expires_at);
                    put_u16(buf, ok.interval);
                });
            }
        }
        buf
    }

    /// Try to parse one message from the front of `buf`. Returns
    /// `Ok(None)` if `buf` doesn't yet hold a complete message, `Ok(Some((msg,
    /// consumed)))` on success, `Err` for a malformed type byte or a field
    /// whose advertised length exceeds what's actually available.
    ///
    /// Also tolerates the legacy length-prefixed `API_KEY_RESPONSE` variant
    /// (a `u16` length at offset 0 followed by the normal message) by
    /// sniffing the type byte at offset 2. The codec never emits this
    /// variant itself, only accepts it on input.
    pub fn try_parse(buf: &[u8]) -> Result<Option<(ControlMessage, usize)>, CodecError> {
        if buf.is_empty() {
            return Ok(None);
        }

        if buf.len() >= 3 && buf[2] == msg_type::API_KEY_RESPONSE {
            let declared = u16::from_le_bytes([buf[0], buf[1]]) as usize;
            if buf.len() < 2 + declared {
                return Ok(None);
            }
            return match Self::try_parse(&buf[2..2 + declared])? {
                Some((msg, consumed)) => Ok(Some((msg, 2 + consumed))),
                None => Ok(None),
            };
        }

        match Self::try_parse_canonical(buf) {
            Ok(v) => Ok(v),
            Err(CodecError::Truncated { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn try_parse_canonical(buf: &[u8]) -> Result<Option<(ControlMessage, usize)>, CodecError> {
        let ty = buf[0];
        let mut r = Reader::new(&buf[1..]);

        let msg = match ty {
            msg_type::AUTH_INIT => ControlMessage::AuthInit { uuid: r.string()? },
            msg_type::AUTH_CHALLENGE => {
                let nonce = r.blob()?;
                let timeout_sec = r.u16()?;
                ControlMessage::AuthChallenge { nonce, timeout_sec }
            }
            msg_type::AUTH_RESPONSE => {
                let uuid = r.string()?;
                let hmac = read_hmac(&mut r)?;
                let timestamp = r.u64()?;
                let ip = r.string()?;
                ControlMessage::AuthResponse { uuid, hmac, timestamp, ip }
            }
            msg_type::AUTH_ACK => ControlMessage::AuthAck(read_outcome(&mut r, read_auth_ack_ok)?),
            msg_type::SESSION_NEW => {
                let token = r.blob()?;
                let uuid = r.string()?;
                ControlMessage::SessionNew { token, uuid }
            }
            msg_type::SESSION_ACK => ControlMessage::SessionAck(read_outcome(&mut r, read_auth_ack_ok)?),
            msg_type::SESSION_REFRESH => {
                let token = r.blob()?;
                let uuid = r.string()?;
                ControlMessage::SessionRefresh { token, uuid }
            }
            msg_type::SESSION_REFRESH_ACK => ControlMessage::SessionRefreshAck(read_outcome(&mut r, |r| {
                Ok(RefreshAckOk { expires_at: r.u64()?, interval: r.u16()? })
            })?),
            msg_type::API_KEY_REQUEST => {
                ControlMessage::ApiKeyRequest { expiration_hours: r.u16()? }
            }
            msg_type::API_KEY_RESPONSE => {
                ControlMessage::ApiKeyResponse(read_outcome(&mut r, |r| r.blob())?)
            }
            msg_type::API_KEY_REVOKE => ControlMessage::ApiKeyRevoke,
            msg_type::API_KEY_REVOKE_ACK => {
                ControlMessage::ApiKeyRevokeAck(read_outcome(&mut r, |_| Ok(()))?)
            }
            msg_type::API_KEY_STATUS => ControlMessage::ApiKeyStatus,
            msg_type::API_KEY_STATUS_ACK => {
                ControlMessage::ApiKeyStatusAck(read_outcome(&mut r, |r| r.blob())?)
            }
            msg_type::API_KEY_DELETE => ControlMessage::ApiKeyDelete,
            msg_type::API_KEY_DELETE_ACK => {
                ControlMessage::ApiKeyDeleteAck(read_outcome(&mut r, |_| Ok(()))?)
            }
            msg_type::REGISTER_INIT => ControlMessage::RegisterInit { uuid: r.string()? },
            msg_type::REGISTER_CHALLENGE => {
                let nonce = r.blob()?;
                let timeout_sec = r.u16()?;
                ControlMessage::RegisterChallenge { nonce, timeout_sec }
            }
            msg_type::REGISTER_RESPONSE => {
                let uuid = r.string()?;
                let hmac = read_hmac(&mut r)?;
                let timestamp = r.u64()?;
                let ip = r.string()?;
                ControlMessage::RegisterResponse { uuid, hmac, timestamp, ip }
            }
            msg_type::REGISTER_ACK => ControlMessage::RegisterAck(read_outcome(&mut r, |r| {
                Ok(RegisterAckOk {
                    secret_key: r.blob()?,
                    token: r.blob()?,
                    expires_at: r.u64()?,
                    interval: r.u16()?,
                })
            })?),
            other => return Err(CodecError::InvalidType(other)),
        };

        Ok(Some((msg, 1 + r.pos)))
    }
}

fn read_hmac(r: &mut Reader) -> Result<[u8; 32], CodecError> {
    let len = r.u16()? as usize;
    if len != 32 {
        return Err(CodecError::InvalidLength(len));
    }
    r.array32()
}

fn read_auth_ack_ok(r: &mut Reader) -> Result<AuthAckOk, CodecError> {
    Ok(AuthAckOk { token: r.blob()?, expires_at: r.u64()?, interval: r.u16()? })
}

fn write_auth_ack_ok(buf: &mut Vec<u8>, ok: &AuthAckOk) {
    put_blob(buf, &ok.token);
    put_u64(buf, ok.expires_at);
    put_u16(buf, ok.interval);
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn roundtrip(msg: ControlMessage) {
        let encoded = msg.encode();
        let (parsed, consumed) = ControlMessage::try_parse(&encoded)
            .expect("parse should not error")
            .expect("full message should parse");
        assert_eq!(consumed, encoded.len());
        assert_eq!(parsed, msg);
    }

    #[test]
    fn roundtrip_every_message_type() {
        let uuid = "00000001-0000-0000-0000-000000000001".to_string();
        let hmac = [7u8; 32];

        roundtrip(ControlMessage::AuthInit { uuid: uuid.clone() });
        roundtrip(ControlMessage::AuthChallenge { nonce: vec![1, 2, 3, 4], timeout_sec: 30 });
        roundtrip(ControlMessage::AuthResponse {
            uuid: uuid.clone(),
            hmac,
            timestamp: 1_700_000_000,
            ip: "10.0.0.5".into(),
        });
        roundtrip(ControlMessage::AuthAck(Outcome::Success(AuthAckOk {
            token: b"deadbeef".to_vec(),
            expires_at: 1_700_003_600,
            interval: 30,
        })));
        roundtrip(ControlMessage::AuthAck(Outcome::Failure {
            error_code: error_code::INVALID_TOKEN,
            wait_sec: None,
        }));
        roundtrip(ControlMessage::AuthAck(Outcome::Failure {
            error_code: error_code::RATE_LIMITED,
            wait_sec: Some(5),
        }));
        roundtrip(ControlMessage::SessionNew { token: b"tok".to_vec(), uuid: uuid.clone() });
        roundtrip(ControlMessage::SessionRefresh { token: b"tok".to_vec(), uuid: uuid.clone() });
        roundtrip(ControlMessage::SessionRefreshAck(Outcome::Success(RefreshAckOk {
            expires_at: 1_700_007_200,
            interval: 30,
        })));
        roundtrip(ControlMessage::ApiKeyRequest { expiration_hours: 720 });
        roundtrip(ControlMessage::ApiKeyResponse(Outcome::Success(b"api-key".to_vec())));
        roundtrip(ControlMessage::ApiKeyRevoke);
        roundtrip(ControlMessage::ApiKeyRevokeAck(Outcome::Success(())));
        roundtrip(ControlMessage::ApiKeyStatus);
        roundtrip(ControlMessage::ApiKeyStatusAck(Outcome::Success(b"active".to_vec())));
        roundtrip(ControlMessage::ApiKeyDelete);
        roundtrip(ControlMessage::ApiKeyDeleteAck(Outcome::Success(())));
        roundtrip(ControlMessage::RegisterInit { uuid: uuid.clone() });
        roundtrip(ControlMessage::RegisterChallenge { nonce: vec![9, 9, 9], timeout_sec: 10 });
        roundtrip(ControlMessage::RegisterResponse {
            uuid: uuid.clone(),
            hmac,
            timestamp: 1_700_000_000,
            ip: "10.0.0.5".into(),
        });
        roundtrip(ControlMessage::RegisterAck(Outcome::Success(RegisterAckOk {
            secret_key: vec![1u8; 32],
            token: b"token".to_vec(),
            expires_at: 1_700_003_600,
            interval: 30,
        })));
    }

    #[test]
    fn random_length_strings_roundtrip() {
        let mut rng = rand::thread_rng();
        for _ in 0..20 {
            let len = rng.gen_range(0..200);
            let uuid: String = (0..len).map(|_| rng.gen_range(b'a'..=b'z') as char).collect();
            roundtrip(ControlMessage::AuthInit { uuid });
        }
    }

    #[test]
    fn truncated_frame_returns_none_not_error() {
        let full = ControlMessage::AuthInit { uuid: "abc".into() }.encode();
        for cut in 0..full.len() {
            let result = ControlMessage::try_parse(&full[..cut]).expect("no hard error on partial data");
            assert!(result.is_none(), "cut at {cut} should be incomplete");
        }
    }

    #[test]
    fn invalid_type_byte_is_an_error() {
        let buf = [0xFFu8, 0x00, 0x00];
        assert_eq!(ControlMessage::try_parse(&buf), Err(CodecError::InvalidType(0xFF)));
    }

    #[test]
    fn legacy_length_prefixed_api_key_response_is_tolerated() {
        let canonical = ControlMessage::ApiKeyResponse(Outcome::Success(b"legacy-key".to_vec())).encode();
        let mut legacy = Vec::new();
        legacy.extend_from_slice(&(canonical.len() as u16).to_le_bytes());
        legacy.extend_from_slice(&canonical);

        let (parsed, consumed) = ControlMessage::try_parse(&legacy)
            .expect("legacy variant should parse")
            .expect("complete frame");
        assert_eq!(consumed, legacy.len());
        assert_eq!(parsed, ControlMessage::ApiKeyResponse(Outcome::Success(b"legacy-key".to_vec())));
    }

    #[test]
    fn streaming_decode_accumulates_partial_bytes() {
        let msg = ControlMessage::SessionRefresh { token: b"tok".to_vec(), uuid: "u".into() };
        let encoded = msg.encode();

        let mut buf = Vec::new();
        for (i, byte) in encoded.iter().enumerate() {
            buf.push(*byte);
            let result = ControlMessage::try_parse(&buf).unwrap();
            if i + 1 < encoded.len() {
                assert!(result.is_none());
            } else {
                assert_eq!(result, Some((msg.clone(), encoded.len())));
            }
        }
    }
}
