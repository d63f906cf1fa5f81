//! Exec channel framing (`v4.channel.k8s.io`): first byte channel id, rest payload.

use bytes::{BufMut, Bytes, BytesMut};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Status;

use crate::{ClientError, ClientResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Stdin,
    Stdout,
    Stderr,
    /// Terminal structured status of the remote process.
    Status,
    Resize,
}

impl Channel {
    pub fn id(self) -> u8 {
        match self {
            Channel::Stdin => 0,
            Channel::Stdout => 1,
            Channel::Stderr => 2,
            Channel::Status => 3,
            Channel::Resize => 4,
        }
    }

    pub fn from_id(id: u8) -> ClientResult<Self> {
        match id {
            0 => Ok(Channel::Stdin),
            1 => Ok(Channel::Stdout),
            2 => Ok(Channel::Stderr),
            3 => Ok(Channel::Status),
            4 => Ok(Channel::Resize),
            other => Err(ClientError::Protocol(format!("unrecognized exec channel id {}", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecFrame {
    pub channel: Channel,
    pub payload: Bytes,
}

impl ExecFrame {
    pub fn new(channel: Channel, payload: impl Into<Bytes>) -> Self {
        Self { channel, payload: payload.into() }
    }

    pub fn stdin(payload: impl Into<Bytes>) -> Self { Self::new(Channel::Stdin, payload) }

    /// Resize message as understood by the kubelet (`{"Width":..,"Height":..}`).
    pub fn resize(width: u16, height: u16) -> Self {
        let body = format!("{{\"Width\":{},\"Height\":{}}}", width, height);
        Self::new(Channel::Resize, body.into_bytes())
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(1 + self.payload.len());
        buf.put_u8(self.channel.id());
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }

    /// `Ok(None)` for a zero-length message.
    pub fn decode(raw: Bytes) -> ClientResult<Option<Self>> {
        if raw.is_empty() { return Ok(None); }
        let channel = Channel::from_id(raw[0])?;
        Ok(Some(Self { channel, payload: raw.slice(1..) }))
    }
}

/// Outcome reported by the remote side on the status channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecStatus {
    pub success: bool,
    pub message: Option<String>,
    pub reason: Option<String>,
    pub exit_code: Option<i32>,
}

impl ExecStatus {
    pub fn from_payload(payload: &[u8]) -> ClientResult<Self> {
        let status: Status = serde_json::from_slice(payload)
            .map_err(|e| ClientError::Protocol(format!("malformed exec status: {}", e)))?;
        let success = status.status.as_deref() == Some("Success");
        let exit_code = if success {
            Some(0)
        } else {
            status
                .details
                .as_ref()
                .and_then(|d| d.causes.as_ref())
                .and_then(|causes| causes.iter().find(|c| c.reason.as_deref() == Some("ExitCode")))
                .and_then(|c| c.message.as_deref())
                .and_then(|m| m.trim().parse::<i32>().ok())
        };
        Ok(Self { success, message: status.message, reason: status.reason, exit_code })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stdin_frame_prefixes_channel_zero() {
        let f = ExecFrame::stdin(&b"ls\n"[..]);
        assert_eq!(f.encode().as_ref(), &[0u8, 108, 115, 10]);
    }

    #[test]
    fn decode_splits_channel_and_payload() {
        let f = ExecFrame::decode(Bytes::from_static(b"\x02oops")).expect("ok").expect("frame");
        assert_eq!(f.channel, Channel::Stderr);
        assert_eq!(f.payload.as_ref(), b"oops");
        assert!(ExecFrame::decode(Bytes::new()).expect("ok").is_none());
        assert!(matches!(ExecFrame::decode(Bytes::from_static(b"\x09x")), Err(ClientError::Protocol(_))));
    }

    #[test]
    fn resize_payload_shape() {
        let f = ExecFrame::resize(120, 40);
        assert_eq!(f.encode().as_ref(), b"\x04{\"Width\":120,\"Height\":40}");
    }

    #[test]
    fn status_success_and_exit_code() {
        let ok = ExecStatus::from_payload(br#"{"metadata":{},"status":"Success"}"#).expect("ok");
        assert!(ok.success);
        assert_eq!(ok.exit_code, Some(0));

        let failed = ExecStatus::from_payload(br#"{
            "metadata":{},"status":"Failure",
            "message":"command terminated with non-zero exit code: error executing command [sh -c exit 3], exit code 3",
            "reason":"NonZeroExitCode",
            "details":{"causes":[{"reason":"ExitCode","message":"3"}]}
        }"#).expect("ok");
        assert!(!failed.success);
        assert_eq!(failed.exit_code, Some(3));
        assert_eq!(failed.reason.as_deref(), Some("NonZeroExitCode"));

        assert!(matches!(ExecStatus::from_payload(b"not json"), Err(ClientError::Protocol(_))));
    }
}
