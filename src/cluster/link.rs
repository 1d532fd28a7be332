//! One TCP connection to another node.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use tokio::io::AsyncBufRead;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;

use super::codec;
use super::Reply;
use super::Request;
use super::WireMessage;
use crate::addresses::NodeAddress;
use crate::errors::RpcFailure;

static NEXT_LINK_ID: AtomicU64 = AtomicU64::new(1);

/// Everything a link reports to its owner. Replies to our own
/// requests are consumed by the link and never show up here.
#[derive(Debug)]
pub enum LinkEvent {
    Frame { link: NodeLink, message: WireMessage },
    Closed { link: NodeLink },
}

struct LinkInner {
    id: u64,
    peer: SocketAddr,
    outbound: mpsc::UnboundedSender<WireMessage>,
    pending: Mutex<HashMap<u64, oneshot::Sender<Reply>>>,
    next_request: AtomicU64,
    closed: watch::Sender<bool>,
}

/// Cheap to clone handle on a connection.
#[derive(Clone)]
pub struct NodeLink {
    inner: Arc<LinkInner>,
}

impl fmt::Debug for NodeLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeLink")
            .field("id", &self.inner.id)
            .field("peer", &self.inner.peer)
            .finish()
    }
}

impl PartialEq for NodeLink {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for NodeLink {}

impl NodeLink {
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.inner.peer
    }

    pub fn is_closed(&self) -> bool {
        *self.inner.closed.borrow()
    }

    /// Queue a frame for the peer.
    pub fn send(&self, message: WireMessage) -> Result<(), RpcFailure> {
        if self.is_closed() {
            return Err(RpcFailure::Disconnected);
        }
        self.inner
            .outbound
            .send(message)
            .map_err(|_| RpcFailure::Disconnected)
    }

    /// Send a request and wait at most `timeout` for the matching
    /// reply. If the connection drops first this fails with
    /// [`RpcFailure::Disconnected`].
    pub async fn request(&self, body: Request, timeout: Duration) -> Result<Reply, RpcFailure> {
        let id = self.inner.next_request.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending().insert(id, tx);

        if let Err(failure) = self.send(WireMessage::Request { id, body }) {
            self.pending().remove(&id);
            return Err(failure);
        }
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(RpcFailure::Disconnected),
            Err(_) => {
                self.pending().remove(&id);
                Err(RpcFailure::Timeout(timeout))
            }
        }
    }

    /// Answer a request the peer made.
    pub fn reply(&self, id: u64, body: Reply) {
        if let Err(failure) = self.send(WireMessage::Reply { id, body }) {
            tracing::debug!("Can't reply to request {id} from {}: {failure}", self.peer());
        }
    }

    /// Stop both directions. Pending requests fail as disconnected.
    pub fn close(&self) {
        self.inner.closed.send_replace(true);
        self.fail_pending();
    }

    fn pending(&self) -> std::sync::MutexGuard<'_, HashMap<u64, oneshot::Sender<Reply>>> {
        // A poisoned map only means another task panicked mid-insert;
        // the map itself is still usable.
        self.inner
            .pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn complete(&self, id: u64, body: Reply) {
        match self.pending().remove(&id) {
            Some(tx) => {
                // The requester may have given up already.
                let _ = tx.send(body);
            }
            None => tracing::debug!("Late reply {id} from {}", self.peer()),
        }
    }

    fn fail_pending(&self) {
        // Dropping the senders wakes every waiter with an error.
        self.pending().clear();
    }
}

/// Start the reader and writer tasks for an established connection.
pub fn spawn_link(stream: TcpStream, events: mpsc::UnboundedSender<LinkEvent>) -> std::io::Result<NodeLink> {
    let peer = stream.peer_addr()?;
    stream.set_nodelay(true)?;
    let (read_half, mut write_half) = stream.into_split();
    let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<WireMessage>();
    let (closed, _) = watch::channel(false);

    let link = NodeLink {
        inner: Arc::new(LinkInner {
            id: NEXT_LINK_ID.fetch_add(1, Ordering::Relaxed),
            peer,
            outbound,
            pending: Mutex::new(HashMap::new()),
            next_request: AtomicU64::new(1),
            closed,
        }),
    };
    tracing::debug!("Opened link {} to {peer}", link.id());

    let mut closed_rx = link.inner.closed.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                message = outbound_rx.recv() => {
                    let Some(message) = message else { break };
                    let frame = match codec().encode(&message) {
                        Ok(frame) => frame,
                        Err(err) => {
                            tracing::error!("Dropping unencodable frame to {peer}: {err}");
                            continue;
                        }
                    };
                    if let Err(err) = write_half.write_all(&frame).await {
                        tracing::warn!("Write to {peer} failed: {err}");
                        break;
                    }
                }
                _ = closed_rx.changed() => break,
            }
        }
        let _ = write_half.shutdown().await;
    });

    let reader_link = link.clone();
    let mut closed_rx = link.inner.closed.subscribe();
    tokio::spawn(async move {
        let mut reader = BufReader::new(read_half);
        let max_len = codec().max_frame_len();
        loop {
            let line = tokio::select! {
                line = next_frame(&mut reader, max_len) => line,
                _ = closed_rx.changed() => break,
            };
            let line = match line {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(err) => {
                    tracing::warn!("Read from {peer} failed: {err}");
                    break;
                }
            };
            match codec().decode(&line) {
                Ok(WireMessage::Reply { id, body }) => reader_link.complete(id, body),
                Ok(message) => {
                    let event = LinkEvent::Frame {
                        link: reader_link.clone(),
                        message,
                    };
                    if events.send(event).is_err() {
                        break;
                    }
                }
                Err(err) => tracing::warn!("Ignoring bad frame from {peer}: {err}"),
            }
        }
        tracing::debug!("Link {} to {peer} closed", reader_link.id());
        reader_link.close();
        let _ = events.send(LinkEvent::Closed { link: reader_link });
    });

    Ok(link)
}

/// Read one frame of at most `max_len` bytes, line ending excluded.
/// Never buffers more than `max_len + 1` bytes. `None` at a clean end
/// of stream.
async fn next_frame<R>(reader: &mut R, max_len: usize) -> io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut frame = Vec::new();
    let read = (&mut *reader)
        .take(max_len as u64 + 1)
        .read_until(b'\n', &mut frame)
        .await?;
    if read == 0 {
        return Ok(None);
    }
    if frame.last() == Some(&b'\n') {
        frame.pop();
        if frame.last() == Some(&b'\r') {
            frame.pop();
        }
    } else if frame.len() > max_len {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame is over the {max_len} byte limit"),
        ));
    }
    String::from_utf8(frame)
        .map(Some)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
}

/// Dial `address`, trying up to `attempts` times with a growing
/// pause between tries.
pub async fn connect(
    address: &NodeAddress,
    attempts: u32,
    events: mpsc::UnboundedSender<LinkEvent>,
) -> std::io::Result<NodeLink> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match TcpStream::connect((address.host.as_str(), address.port)).await {
            Ok(stream) => return spawn_link(stream, events),
            Err(err) if attempt < attempts.max(1) => {
                let pause = Duration::from_millis(200 * u64::from(attempt)).min(Duration::from_secs(2));
                tracing::warn!("Can't reach {address} (attempt {attempt}/{attempts}): {err}; retrying in {pause:?}");
                tokio::time::sleep(pause).await;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
async fn link_pair() -> (
    NodeLink,
    mpsc::UnboundedReceiver<LinkEvent>,
    NodeLink,
    mpsc::UnboundedReceiver<LinkEvent>,
) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    let address = NodeAddress::new("127.0.0.1", port);
    let dial = connect(&address, 1, a_tx);
    let (dialed, accepted) = tokio::join!(dial, listener.accept());
    let a = dialed.unwrap();
    let b = spawn_link(accepted.unwrap().0, b_tx).unwrap();
    (a, a_rx, b, b_rx)
}

#[tokio::test]
async fn frames_are_read_up_to_the_limit() {
    let mut input: &[u8] = b"{\"a\":1}\nsecond\r\ntoo long for eight\n";
    assert_eq!(next_frame(&mut input, 8).await.unwrap().as_deref(), Some("{\"a\":1}"));
    assert_eq!(next_frame(&mut input, 8).await.unwrap().as_deref(), Some("second"));
    let err = next_frame(&mut input, 8).await.unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::InvalidData);
}

#[tokio::test]
async fn endless_frame_is_cut_off() {
    // A peer that never sends a newline.
    let mut reader = BufReader::new(tokio::io::repeat(b'x'));
    let read = tokio::time::timeout(Duration::from_secs(5), next_frame(&mut reader, 1024))
        .await
        .unwrap();
    assert_eq!(read.unwrap_err().kind(), io::ErrorKind::InvalidData);
}

#[tokio::test]
async fn oversized_frame_closes_the_link() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (tx, mut events) = mpsc::unbounded_channel();
    let (raw, accepted) = tokio::join!(
        TcpStream::connect(("127.0.0.1", port)),
        listener.accept()
    );
    let mut raw = raw.unwrap();
    let link = spawn_link(accepted.unwrap().0, tx).unwrap();

    let chunk = vec![b'x'; 1024 * 1024];
    let flood = tokio::spawn(async move {
        for _ in 0..=(codec().max_frame_len() / chunk.len()) {
            if raw.write_all(&chunk).await.is_err() {
                break;
            }
        }
    });

    let closed = tokio::time::timeout(Duration::from_secs(30), events.recv())
        .await
        .unwrap();
    assert!(matches!(closed, Some(LinkEvent::Closed { .. })));
    assert!(link.is_closed());
    flood.abort();
}

#[tokio::test]
async fn request_reply_round_trip() {
    let (a, _a_events, b, mut b_events) = link_pair().await;

    let responder = tokio::spawn(async move {
        match b_events.recv().await {
            Some(LinkEvent::Frame {
                link,
                message: WireMessage::Request { id, .. },
            }) => {
                assert_eq!(link, b);
                link.reply(id, Reply::Created);
            }
            other => panic!("unexpected event {other:?}"),
        }
    });

    let spec = crate::worker::WorkerSpec {
        worker_id: crate::identity::ActorVirtualIdentity::new("Worker:a-0"),
        operator_id: crate::identity::OperatorIdentity::new("a"),
        executor: crate::worker::executor::ExecutorSpec::native("pass-through"),
        fault_tolerance: None,
        state_restore: None,
    };
    let reply = a
        .request(Request::CreateWorker(spec), Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(reply, Reply::Created);
    responder.await.unwrap();
}

#[tokio::test]
async fn unanswered_request_times_out() {
    let (a, _a_events, _b, _b_events) = link_pair().await;
    let failure = a
        .request(
            Request::Control {
                worker: crate::identity::ActorVirtualIdentity::new("w"),
                command: crate::worker::ControlCommand::QueryStatistics,
                timeout_ms: 10,
            },
            Duration::from_millis(50),
        )
        .await
        .unwrap_err();
    assert_eq!(failure, RpcFailure::Timeout(Duration::from_millis(50)));
}

#[tokio::test]
async fn peer_close_fails_pending_requests() {
    let (a, _a_events, b, mut b_events) = link_pair().await;
    tokio::spawn(async move {
        // Hang up as soon as the request shows up.
        if let Some(LinkEvent::Frame { .. }) = b_events.recv().await {
            b.close();
        }
    });
    let failure = a
        .request(
            Request::Control {
                worker: crate::identity::ActorVirtualIdentity::new("w"),
                command: crate::worker::ControlCommand::QueryStatistics,
                timeout_ms: 10,
            },
            Duration::from_secs(5),
        )
        .await
        .unwrap_err();
    assert_eq!(failure, RpcFailure::Disconnected);
}
