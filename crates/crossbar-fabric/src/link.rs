//! Per-connection link adapters.
//!
//! Every established peer connection (node ↔ local switch, or local
//! switch ↔ central switch) gets one [`LinkHandle`] in the owning
//! switch's registry plus two tasks: a writer draining the handle's
//! outbound channel into the socket, and a reader decoding inbound
//! frames into the switch's dispatch queue.
//!
//! A handle is registered only once its stream is fully established, so
//! the dispatcher can never observe a half-open link and no frame can be
//! lost to a race between acceptance and first dispatch.

use std::hash::Hash;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Notify};

use crossbar_core::frame::{read_frame, AckCode, Addr, Frame, FrameError};

use crate::table::LearningTable;

/// Process-unique link identifier.
pub type LinkId = u32;

static LINK_COUNTER: AtomicU32 = AtomicU32::new(1);

/// Issue the next link ID. Collision-free for the process lifetime.
pub fn next_link_id() -> LinkId {
    LINK_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// All registered links of one switch core.
pub type LinkRegistry = Arc<DashMap<LinkId, LinkHandle>>;

pub fn new_registry() -> LinkRegistry {
    Arc::new(DashMap::new())
}

/// Registered handle for one established peer link.
#[derive(Clone)]
pub struct LinkHandle {
    id: LinkId,
    outbound: mpsc::UnboundedSender<Frame>,
    finished: Arc<AtomicBool>,
}

impl LinkHandle {
    pub fn new(id: LinkId, outbound: mpsc::UnboundedSender<Frame>) -> Self {
        Self {
            id,
            outbound,
            finished: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn id(&self) -> LinkId {
        self.id
    }

    /// Queue a frame for delivery to this peer. Order is preserved; a
    /// send on a link whose writer already exited is dropped.
    pub fn send(&self, frame: Frame) {
        if self.outbound.send(frame).is_err() {
            tracing::warn!(link = self.id, "outbound frame dropped, link writer gone");
        }
    }

    /// Begin the graceful teardown handshake: one shutdown control frame;
    /// the peer acknowledges and closes, which ends the reader task.
    pub fn terminate(&self) {
        self.send(Frame::control(Addr::CONTROL, Addr::CONTROL, 0, AckCode::Shutdown));
    }

    /// Peer has reported that its outbound work is drained.
    pub fn mark_finished(&self) {
        self.finished.store(true, Ordering::SeqCst);
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }
}

/// Drain the outbound channel into the socket. Exits when the channel
/// closes (normal teardown) or the peer resets the connection.
pub async fn writer_task<W>(link: LinkId, mut half: W, mut rx: mpsc::UnboundedReceiver<Frame>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = rx.recv().await {
        if let Err(e) = half.write_all(&frame.encode()).await {
            tracing::warn!(link, error = %e, "link write failed, remaining outbound dropped");
            break;
        }
    }
    // Channel closed or write failed either way the peer sees EOF next.
    let _ = half.shutdown().await;
}

/// Inbound read loop for one link.
///
/// The first frame from the peer inserts the learning-table entry — the
/// only insertion point in the fabric. A `Done` control frame addressed
/// to the control address marks the link finished and wakes the owning
/// core's completion check; shutdown-handshake acks are swallowed;
/// everything else lands in the dispatch queue. Torn frames are logged
/// and skipped; the loop ends when the peer closes the stream.
pub async fn reader_task<R, K>(
    link: LinkHandle,
    mut half: R,
    table: LearningTable<K>,
    key: fn(Addr) -> K,
    dispatch: mpsc::UnboundedSender<Frame>,
    completion: Arc<Notify>,
) where
    R: AsyncRead + Unpin,
    K: Eq + Hash + Copy,
{
    let mut identified = false;
    loop {
        match read_frame(&mut half).await {
            Ok(frame) => {
                if !identified {
                    table.learn(key(frame.src), link.id());
                    identified = true;
                    tracing::debug!(link = link.id(), src = %frame.src, "link identified");
                }
                if frame.dst == Addr::CONTROL {
                    match frame.ack_code() {
                        Some(AckCode::Done) => {
                            tracing::debug!(link = link.id(), src = %frame.src, "peer drained");
                            link.mark_finished();
                            completion.notify_one();
                        }
                        Some(AckCode::Ok) => {
                            // Reply to our shutdown frame; the close follows.
                        }
                        _ => {
                            tracing::warn!(link = link.id(), frame = %frame, "unexpected control frame ignored");
                        }
                    }
                    continue;
                }
                if dispatch.send(frame).is_err() {
                    // Dispatcher is gone; the core is shutting down.
                    break;
                }
            }
            Err(e) if e.is_lost() => {
                tracing::warn!(link = link.id(), error = %e, "frame lost on link");
            }
            Err(FrameError::Closed) => {
                tracing::debug!(link = link.id(), "link closed by peer");
                break;
            }
            Err(e) => {
                tracing::warn!(link = link.id(), error = %e, "link read failed");
                break;
            }
        }
    }
    // A link that dies without reporting Done still counts as drained,
    // otherwise completion would hang on it forever.
    if !link.is_finished() {
        link.mark_finished();
        completion.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::collections::HashSet;
    use tokio::io::AsyncReadExt;

    #[test]
    fn link_ids_are_unique() {
        let ids: HashSet<LinkId> = (0..100).map(|_| next_link_id()).collect();
        assert_eq!(ids.len(), 100);
    }

    #[tokio::test]
    async fn reader_learns_dispatches_and_reports_done() {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = LinkHandle::new(next_link_id(), tx);
        let table: LearningTable<u8> = LearningTable::new();
        let (dispatch_tx, mut dispatch_rx) = mpsc::unbounded_channel();
        let completion = Arc::new(Notify::new());
        drop(rx);

        let data = Frame::data(Addr::new(1, 2), Addr::new(1, 3), 0, Bytes::from_static(b"hi"));
        let done = Frame::control(Addr::new(1, 2), Addr::CONTROL, 1, AckCode::Done);
        let mut wire = data.encode().to_vec();
        wire.extend_from_slice(&done.encode());

        let id = handle.id();
        reader_task(
            handle.clone(),
            &wire[..],
            table.clone(),
            |addr| addr.node,
            dispatch_tx,
            completion,
        )
        .await;

        assert_eq!(table.lookup(2), Some(id));
        assert_eq!(dispatch_rx.recv().await.unwrap(), data);
        assert!(handle.is_finished());
    }

    #[tokio::test]
    async fn reader_marks_finished_on_abrupt_close() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let handle = LinkHandle::new(next_link_id(), tx);
        let table: LearningTable<u8> = LearningTable::new();
        let (dispatch_tx, _dispatch_rx) = mpsc::unbounded_channel();
        let completion = Arc::new(Notify::new());

        reader_task(
            handle.clone(),
            &[][..],
            table,
            |addr| addr.node,
            dispatch_tx,
            completion,
        )
        .await;

        assert!(handle.is_finished());
    }

    #[tokio::test]
    async fn writer_preserves_frame_order() {
        let (client, mut server) = tokio::io::duplex(4096);
        let (tx, rx) = mpsc::unbounded_channel();
        let a = Frame::data(Addr::new(1, 1), Addr::new(1, 2), 0, Bytes::from_static(b"a"));
        let b = Frame::control(Addr::new(1, 1), Addr::new(1, 2), 0, AckCode::Ok);
        tx.send(a.clone()).unwrap();
        tx.send(b.clone()).unwrap();
        drop(tx);

        writer_task(1, client, rx).await;

        let mut wire = Vec::new();
        server.read_to_end(&mut wire).await.unwrap();
        let mut reader = &wire[..];
        assert_eq!(read_frame(&mut reader).await.unwrap(), a);
        assert_eq!(read_frame(&mut reader).await.unwrap(), b);
    }
}
