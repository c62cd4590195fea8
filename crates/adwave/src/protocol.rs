//! Wire protocol for the ad-generation WebSocket.
//!
//! Two frame kinds share one connection:
//! - **Control messages**: plain JSON text frames, discriminated by a `type` field.
//! - **Audio frames**: binary frames carrying a 4-byte little-endian length,
//!   that many bytes of UTF-8 JSON header, then raw audio to the end of the frame.
//!
//! The receiver discriminates by transport frame kind (text vs binary), never
//! by sniffing content.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::bytes::{BufMut, Bytes, BytesMut};

use crate::pipeline::Step;

/// Control messages sent to the client as JSON text frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Batch request accepted; preamble may follow.
    Received,

    /// Insight details extracted during transcript generation.
    Insight {
        index: usize,
        insights: Vec<serde_json::Value>,
    },

    /// One job finished its stage sequence.
    Done {
        index: usize,
    },

    /// Step-scoped (with `step`) or job-scoped (without) failure.
    Error {
        index: usize,
        #[serde(skip_serializing_if = "Option::is_none")]
        step: Option<Step>,
        message: String,
    },

    /// Batch-level failure before any job started. The connection closes after this.
    FatalError {
        message: String,
    },

    /// All jobs in the batch resolved, successfully or not.
    Complete,

    /// Per-step outcome report for one job.
    Summary {
        index: usize,
        location: String,
        steps: serde_json::Value,
        overall_success: bool,
    },
}

/// Control messages received from the client during the preamble.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Preamble over - begin processing.
    Finished,
}

/// JSON header of a binary audio frame. Always carries `type` and the job `index`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AudioHeader {
    Speech {
        index: usize,
        transcript: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        translations: Option<Vec<String>>,
        #[serde(skip_serializing_if = "Option::is_none")]
        alignments: Option<serde_json::Value>,
    },
    Merged {
        index: usize,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame truncated: {0}")]
    Truncated(&'static str),
    #[error("invalid frame header: {0}")]
    Header(#[from] serde_json::Error),
}

/// Encode an audio frame: 4-byte LE header length, JSON header, raw audio bytes.
pub fn encode_audio_frame(header: &AudioHeader, audio: &[u8]) -> Result<Bytes, FrameError> {
    let json = serde_json::to_vec(header)?;
    let mut buf = BytesMut::with_capacity(4 + json.len() + audio.len());
    buf.put_u32_le(json.len() as u32);
    buf.extend_from_slice(&json);
    buf.extend_from_slice(audio);
    Ok(buf.freeze())
}

/// Decode an audio frame, returning the header and the raw audio suffix.
///
/// The returned slice starts exactly at `4 + header_len`, so re-framing the
/// pair reproduces the original bytes.
pub fn decode_audio_frame(frame: &[u8]) -> Result<(AudioHeader, &[u8]), FrameError> {
    if frame.len() < 4 {
        return Err(FrameError::Truncated("missing length prefix"));
    }
    let header_len = u32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
    let audio_start = 4 + header_len;
    if frame.len() < audio_start {
        return Err(FrameError::Truncated("header runs past frame end"));
    }
    let header = serde_json::from_slice(&frame[4..audio_start])?;
    Ok((header, &frame[audio_start..]))
}

/// One frame queued for the connection writer task.
#[derive(Debug)]
pub enum OutboundFrame {
    Control(ServerMessage),
    Audio(Bytes),
}

/// Cloneable handle for sending frames to the client.
///
/// Send failures (client gone, writer task exited) are logged and swallowed:
/// stage code must keep running so cleanup still happens, and the caller
/// distinguishes success via the returned bool when it cares.
#[derive(Clone)]
pub struct ClientSender {
    tx: mpsc::Sender<OutboundFrame>,
}

impl ClientSender {
    pub fn new(tx: mpsc::Sender<OutboundFrame>) -> Self {
        Self { tx }
    }

    pub async fn send(&self, message: ServerMessage) -> bool {
        if let Err(e) = self.tx.send(OutboundFrame::Control(message)).await {
            tracing::error!(error = %e, "Failed to queue control message");
            return false;
        }
        true
    }

    pub async fn send_audio(&self, header: &AudioHeader, audio: &[u8]) -> bool {
        let frame = match encode_audio_frame(header, audio) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!(error = %e, "Failed to encode audio frame");
                return false;
            }
        };
        if let Err(e) = self.tx.send(OutboundFrame::Audio(frame)).await {
            tracing::error!(error = %e, "Failed to queue audio frame");
            return false;
        }
        true
    }
}
