//! Control-plane wire protocol between cluster nodes.
//!
//! Nodes exchange [`WireMessage`]s as newline-delimited JSON over
//! TCP. A worker node opens one connection to the master and sends
//! [`WireMessage::Join`] with the address it listens on; the master
//! answers every membership change with [`WireMessage::Membership`]
//! to all joined nodes. Requests and replies are matched by id, see
//! [`NodeLink::request`].
//!
//! Data tuples ride the same connections as [`WireMessage::Data`].
//! That is only a convenience for delivering batches to remote
//! workers; it makes no ordering promises across workers.

use std::sync::OnceLock;

use serde::Deserialize;
use serde::Serialize;

use crate::addresses::AddressInfo;
use crate::addresses::NodeAddress;
use crate::errors::EngineError;
use crate::errors::EngineResult;
use crate::errors::RpcFailure;
use crate::identity::ActorVirtualIdentity;
use crate::worker::ControlCommand;
use crate::worker::ControlReply;
use crate::worker::DataPayload;
use crate::worker::WorkerSpec;

mod link;

pub use link::connect;
pub use link::spawn_link;
pub use link::LinkEvent;
pub use link::NodeLink;

/// Requests one node can make of another.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Request {
    /// Start a worker on the receiving node.
    CreateWorker(WorkerSpec),
    /// Forward a control command to a worker on the receiving node.
    Control {
        worker: ActorVirtualIdentity,
        command: ControlCommand,
        timeout_ms: u64,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reply {
    Created,
    Control(Result<ControlReply, RpcFailure>),
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireMessage {
    Join {
        address: NodeAddress,
    },
    Membership {
        info: AddressInfo,
    },
    Request {
        id: u64,
        body: Request,
    },
    Reply {
        id: u64,
        body: Reply,
    },
    Data {
        worker: ActorVirtualIdentity,
        payload: DataPayload,
    },
}

/// Frames larger than this are refused on both ends.
const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Encoder and decoder for [`WireMessage`] frames.
#[derive(Debug)]
pub struct WireCodec {
    max_frame_len: usize,
}

impl WireCodec {
    pub fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }

    /// One frame, newline included.
    pub fn encode(&self, message: &WireMessage) -> EngineResult<Vec<u8>> {
        let mut frame = serde_json::to_vec(message)?;
        if frame.len() > self.max_frame_len {
            return Err(EngineError::Cluster(format!(
                "frame of {} bytes is over the {} byte limit",
                frame.len(),
                self.max_frame_len
            )));
        }
        frame.push(b'\n');
        Ok(frame)
    }

    pub fn decode(&self, line: &str) -> EngineResult<WireMessage> {
        if line.len() > self.max_frame_len {
            return Err(EngineError::Cluster(format!(
                "frame of {} bytes is over the {} byte limit",
                line.len(),
                self.max_frame_len
            )));
        }
        Ok(serde_json::from_str(line)?)
    }
}

static CODEC: OnceLock<WireCodec> = OnceLock::new();

/// The process-wide codec, created on first use.
pub fn codec() -> &'static WireCodec {
    CODEC.get_or_init(|| {
        tracing::trace!("Initializing wire codec");
        WireCodec {
            max_frame_len: MAX_FRAME_LEN,
        }
    })
}

#[test]
fn frames_are_single_lines() {
    let message = WireMessage::Request {
        id: 7,
        body: Request::Control {
            worker: ActorVirtualIdentity::new("Worker:a-0"),
            command: ControlCommand::QueryStatistics,
            timeout_ms: 100,
        },
    };
    let frame = codec().encode(&message).unwrap();
    assert_eq!(frame.last(), Some(&b'\n'));
    assert_eq!(frame.iter().filter(|b| **b == b'\n').count(), 1);

    let text = std::str::from_utf8(&frame).unwrap();
    assert_eq!(codec().decode(text.trim_end()).unwrap(), message);
}

#[test]
fn codec_is_a_singleton() {
    assert!(std::ptr::eq(codec(), codec()));
}

#[test]
fn join_frame_json_shape() {
    let frame = codec()
        .encode(&WireMessage::Join {
            address: NodeAddress::new("n1", 4000),
        })
        .unwrap();
    assert_eq!(
        std::str::from_utf8(&frame).unwrap(),
        "{\"type\":\"join\",\"address\":{\"host\":\"n1\",\"port\":4000}}\n"
    );
}

#[test]
fn garbage_frames_are_errors() {
    assert!(matches!(
        codec().decode("{\"type\":\"shout\"}"),
        Err(EngineError::Serde(_))
    ));
}
