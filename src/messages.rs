/// Wire protocol between sync sessions and the hub
///
/// Messages are JSON objects tagged by `"type"` with camelCase fields:
///
/// ```json
/// {"type": "filter", "dataSource": "cells", "origin": "3f1c…", "generation": 4, "indices": [3, 4]}
/// {"type": "popout_fail", "chartId": "c7"}
/// ```
///
/// Every state-carrying message is self-identifying (data source, origin
/// session and a generation or sequence number) so a receiver can drop
/// anything older than what it has already applied.
use crate::error::TransportError;
use crate::event::{Generation, RowIndex};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncMessage {
    /// First message of a session, binding its id to the connection
    #[serde(rename_all = "camelCase")]
    Hello { session_id: String },

    /// The sender's local filter result for one data source
    #[serde(rename_all = "camelCase")]
    Filter {
        data_source: String,
        origin: String,
        generation: Generation,
        indices: Vec<RowIndex>,
    },

    /// Rows highlighted in the sender's session; empty clears
    #[serde(rename_all = "camelCase")]
    Highlight {
        data_source: String,
        origin: String,
        seq: u64,
        indices: Vec<RowIndex>,
    },

    /// Request that another session host a chart. `origin` is the
    /// requesting session.
    #[serde(rename_all = "camelCase")]
    Popout {
        chart_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        origin: Option<String>,
    },

    /// `host` now shows the chart
    #[serde(rename_all = "camelCase")]
    PopoutAck {
        chart_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        host: Option<String>,
    },

    /// No session could take the chart
    #[serde(rename_all = "camelCase")]
    PopoutFail { chart_id: String },

    /// Withdraw a pop-out: the requester takes the chart back, or another
    /// session already won it. A session hosting the chart stops doing so.
    #[serde(rename_all = "camelCase")]
    PopoutCancel { chart_id: String },

    /// A session disconnected from the hub
    #[serde(rename_all = "camelCase")]
    PeerLeft { session_id: String },

    /// Error occurred
    Error { message: String },
}

impl SyncMessage {
    /// Value of the `"type"` tag
    pub fn kind(&self) -> &'static str {
        match self {
            SyncMessage::Hello { .. } => "hello",
            SyncMessage::Filter { .. } => "filter",
            SyncMessage::Highlight { .. } => "highlight",
            SyncMessage::Popout { .. } => "popout",
            SyncMessage::PopoutAck { .. } => "popout_ack",
            SyncMessage::PopoutFail { .. } => "popout_fail",
            SyncMessage::PopoutCancel { .. } => "popout_cancel",
            SyncMessage::PeerLeft { .. } => "peer_left",
            SyncMessage::Error { .. } => "error",
        }
    }

    pub fn to_json(&self) -> Result<String, TransportError> {
        serde_json::to_string(self).map_err(|e| TransportError::Encode(e.to_string()))
    }

    pub fn from_json(text: &str) -> Result<Self, TransportError> {
        serde_json::from_str(text).map_err(|e| TransportError::Decode(e.to_string()))
    }
}
