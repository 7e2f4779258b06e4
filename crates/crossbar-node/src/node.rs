//! The node engine: attach handshake, stop-and-wait sender, and the
//! receive side with duplicate suppression.
//!
//! One item is in flight at a time. A positive ack releases the next
//! item; either negative ack abandons the item outright (a damaged
//! frame or a firewalled destination will not get better by resending);
//! silence retransmits until the retry budget runs out. Acks that do not
//! match the in-flight sequence number are stale echoes of earlier
//! retransmissions and are ignored.

use std::collections::{HashMap, VecDeque};
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use rand::Rng;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crossbar_core::config::{FaultConfig, TimingConfig};
use crossbar_core::frame::{read_frame, AckCode, Addr, Frame, FrameError};
use crossbar_core::net::connect_retry;
use crossbar_core::script::{output_line, WorkItem};

use crate::fault::FaultInjector;

pub struct Node {
    addr: Addr,
    switch_port: u16,
    work: Vec<WorkItem>,
    output_path: PathBuf,
    timing: TimingConfig,
    fault: FaultConfig,
}

/// The one item currently awaiting its ack. `frame` is the clean copy;
/// what went on the wire may have been damaged by fault injection.
struct Pending {
    frame: Frame,
    retries: u32,
    deadline: Instant,
}

impl Node {
    pub fn new(
        addr: Addr,
        switch_port: u16,
        work: Vec<WorkItem>,
        output_path: PathBuf,
        timing: TimingConfig,
        fault: FaultConfig,
    ) -> Self {
        Self {
            addr,
            switch_port,
            work,
            output_path,
            timing,
            fault,
        }
    }

    pub async fn run(self) -> Result<()> {
        let addr = self.addr;
        let stream = attach(addr, self.switch_port, self.timing.connect_retry_ms).await?;
        let (rd, mut wr) = stream.into_split();
        tracing::info!(node = %addr, "attached");

        let (in_tx, mut in_rx) = mpsc::unbounded_channel();
        tokio::spawn(inbound_reader(addr, rd, in_tx));

        let mut output = std::fs::File::create(&self.output_path)
            .with_context(|| format!("node {addr}: cannot create {}", self.output_path.display()))?;
        let mut inbox = Inbox::new(addr);
        let mut faults = FaultInjector::new(&self.fault);
        let mut queue: VecDeque<WorkItem> = self.work.into();
        let mut next_seq: u8 = 0;
        let mut pending: Option<Pending> = None;
        let mut drained = false;
        let ack_timeout = Duration::from_millis(self.timing.ack_timeout_ms);

        loop {
            if pending.is_none() && !drained {
                match queue.pop_front() {
                    Some(item) => {
                        if self.timing.send_jitter_ms > 0 {
                            let pause = rand::thread_rng().gen_range(0..=self.timing.send_jitter_ms);
                            tokio::time::sleep(Duration::from_millis(pause)).await;
                        }
                        let seq = next_seq;
                        next_seq = next_seq.wrapping_add(1);
                        let frame = Frame::data(addr, item.dest, seq, item.payload);
                        tracing::debug!(node = %addr, dst = %frame.dst, seq, "sending");
                        transmit(&mut wr, &frame, faults.corrupt_send()).await?;
                        pending = Some(Pending {
                            frame,
                            retries: 0,
                            deadline: Instant::now() + ack_timeout,
                        });
                    }
                    None => {
                        // Script drained: report it, then keep answering
                        // inbound traffic until the switch tears us down.
                        let done = Frame::control(addr, Addr::CONTROL, 0, AckCode::Done);
                        wr.write_all(&done.encode())
                            .await
                            .context("drained report failed")?;
                        tracing::info!(node = %addr, "script complete");
                        drained = true;
                    }
                }
                continue;
            }

            let deadline = pending.as_ref().map(|p| p.deadline);
            tokio::select! {
                inbound = in_rx.recv() => {
                    let Some(frame) = inbound else {
                        tracing::debug!(node = %addr, "link closed");
                        break;
                    };
                    if frame.ack_code() == Some(AckCode::Shutdown) {
                        let bye = Frame::control(addr, Addr::CONTROL, 0, AckCode::Ok);
                        let _ = wr.write_all(&bye.encode()).await;
                        let _ = wr.shutdown().await;
                        tracing::info!(node = %addr, "shutdown acknowledged");
                        break;
                    }
                    if frame.is_data() {
                        if frame.dst != addr {
                            // flooded past us for somebody else
                            tracing::debug!(node = %addr, frame = %frame, "not addressed here, dropped");
                            continue;
                        }
                        let withhold = faults.drop_ack();
                        match inbox.receive(&frame) {
                            Receipt::Deliver { line, ack } => {
                                writeln!(output, "{line}").context("output write failed")?;
                                tracing::debug!(node = %addr, from = %frame.src, "payload recorded");
                                if withhold {
                                    tracing::debug!(node = %addr, from = %frame.src, "ack withheld");
                                } else {
                                    wr.write_all(&ack.encode()).await.context("ack write failed")?;
                                }
                            }
                            Receipt::Duplicate { ack } => {
                                tracing::debug!(node = %addr, frame = %frame, "duplicate, re-acking");
                                if !withhold {
                                    wr.write_all(&ack.encode()).await.context("ack write failed")?;
                                }
                            }
                            Receipt::Damaged { nack } => {
                                tracing::warn!(node = %addr, frame = %frame, "checksum mismatch");
                                if !withhold {
                                    wr.write_all(&nack.encode()).await.context("nack write failed")?;
                                }
                            }
                        }
                        continue;
                    }
                    // Control frame: the ack for our in-flight item.
                    let Some(p) = pending.as_ref() else {
                        tracing::debug!(node = %addr, frame = %frame, "ack with nothing in flight");
                        continue;
                    };
                    if frame.seq != p.frame.seq {
                        tracing::debug!(node = %addr, frame = %frame, "stale ack ignored");
                        continue;
                    }
                    let (seq, dst) = (p.frame.seq, p.frame.dst);
                    match frame.ack_code() {
                        Some(AckCode::Ok) => {
                            tracing::debug!(node = %addr, %dst, seq, "delivered");
                            pending = None;
                        }
                        Some(AckCode::NackCrc) => {
                            tracing::warn!(node = %addr, %dst, seq, "arrived damaged, item abandoned");
                            pending = None;
                        }
                        Some(AckCode::NackFirewall) => {
                            tracing::warn!(node = %addr, %dst, seq, "destination firewalled, item abandoned");
                            pending = None;
                        }
                        _ => {
                            tracing::debug!(node = %addr, frame = %frame, "unexpected control frame ignored");
                        }
                    }
                }
                _ = sleep_until(deadline), if deadline.is_some() => {
                    if let Some(p) = pending.as_mut() {
                        if p.retries >= self.timing.retry_budget {
                            tracing::warn!(node = %addr, dst = %p.frame.dst, seq = p.frame.seq,
                                "retries exhausted, item abandoned");
                            pending = None;
                        } else {
                            p.retries += 1;
                            tracing::debug!(node = %addr, seq = p.frame.seq, retry = p.retries,
                                "ack timeout, retransmitting");
                            transmit(&mut wr, &p.frame, faults.corrupt_send()).await?;
                            p.deadline = Instant::now() + ack_timeout;
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Write the frame, optionally as a checksum-damaged copy. The clean
/// frame stays with the caller for retransmission.
async fn transmit<W>(wr: &mut W, frame: &Frame, damage: bool) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let wire = if damage {
        tracing::debug!(frame = %frame, "transmitting damaged copy");
        frame.corrupted()
    } else {
        frame.clone()
    };
    wr.write_all(&wire.encode()).await.context("frame write failed")?;
    Ok(())
}

/// Dial the switch's well-known port, learn the private data port
/// assigned to this node, ack it, and reconnect there.
async fn attach(addr: Addr, switch_port: u16, retry_ms: u64) -> Result<TcpStream> {
    let init = connect_retry(switch_port, retry_ms).await;
    let (mut rd, mut wr) = init.into_split();
    let port = loop {
        match read_frame(&mut rd).await {
            Ok(frame) => {
                if let Some(payload) = frame.payload() {
                    if payload.len() == 2 {
                        break u16::from_le_bytes([payload[0], payload[1]]);
                    }
                }
                tracing::debug!(node = %addr, frame = %frame, "unexpected frame during attach");
            }
            Err(e) if e.is_lost() => {
                tracing::warn!(node = %addr, error = %e, "frame lost during attach");
            }
            Err(e) => return Err(e).context("switch closed during attach"),
        }
    };
    let ack = Frame::control(addr, Addr::CONTROL, 0, AckCode::Ok);
    wr.write_all(&ack.encode()).await.context("attach ack failed")?;
    drop((rd, wr));
    tracing::debug!(node = %addr, port, "moving to data port");
    Ok(connect_retry(port, retry_ms).await)
}

/// Decode inbound frames off the data link into the engine's queue.
/// Channel closure in either direction ends the task.
async fn inbound_reader(addr: Addr, mut rd: OwnedReadHalf, tx: mpsc::UnboundedSender<Frame>) {
    loop {
        match read_frame(&mut rd).await {
            Ok(frame) => {
                if tx.send(frame).is_err() {
                    return;
                }
            }
            Err(e) if e.is_lost() => {
                tracing::warn!(node = %addr, error = %e, "frame lost");
            }
            Err(FrameError::Closed) => return,
            Err(e) => {
                tracing::warn!(node = %addr, error = %e, "link read failed");
                return;
            }
        }
    }
}

// ── Receive side ──────────────────────────────────────────────────────────────

/// What to do with one inbound data frame.
enum Receipt {
    /// New payload: record the line, send the ack.
    Deliver { line: String, ack: Frame },
    /// Retransmission of something already recorded: re-ack only.
    Duplicate { ack: Frame },
    /// Failed checksum: negative ack, nothing recorded.
    Damaged { nack: Frame },
}

/// Duplicate suppression and ack selection. Retransmissions carry the
/// sender's original sequence number, so remembering the last sequence
/// seen per source is enough with one item in flight per sender.
struct Inbox {
    addr: Addr,
    last_seen: HashMap<Addr, u8>,
}

impl Inbox {
    fn new(addr: Addr) -> Self {
        Self {
            addr,
            last_seen: HashMap::new(),
        }
    }

    fn receive(&mut self, frame: &Frame) -> Receipt {
        if !frame.checksum_ok() {
            return Receipt::Damaged {
                nack: Frame::control(self.addr, frame.src, frame.seq, AckCode::NackCrc),
            };
        }
        let ack = Frame::control(self.addr, frame.src, frame.seq, AckCode::Ok);
        if self.last_seen.get(&frame.src) == Some(&frame.seq) {
            return Receipt::Duplicate { ack };
        }
        self.last_seen.insert(frame.src, frame.seq);
        let payload = frame.payload().map(|p| p.to_vec()).unwrap_or_default();
        Receipt::Deliver {
            line: output_line(frame.src, &payload),
            ack,
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
