//! Frame-parallel decode front-end.
//!
//! A single task owns the decode session. Any number of workers submit
//! packets through cloneable [`DecodeWorker`] handles. Each call takes a
//! ticket when it is made; tickets order both the submissions the session
//! sees and the order in which calls return, so results are observed in
//! submission order no matter how the workers are scheduled.
//!
//! ```ignore
//! let decoder = ParallelDecoder::spawn(session, 8);
//! let worker = decoder.worker();
//! let output = worker.decode(Some(packet)).await?;
//! decoder.shutdown().await?;
//! ```

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use qsvbridge_codec::{DecodeOutput, Packet, VideoDecoder};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Lets ticket holders through one at a time, in ticket order.
///
/// A ticket that will never enter can be given up with
/// [`SequenceBarrier::release`]; the turn then skips over it.
#[derive(Debug, Clone)]
pub struct SequenceBarrier {
    sequence: Arc<watch::Sender<Sequence>>,
}

#[derive(Debug, Default)]
struct Sequence {
    turn: u64,
    /// Tickets released ahead of their turn.
    released: BTreeSet<u64>,
}

impl Default for SequenceBarrier {
    fn default() -> Self {
        let (sequence, _) = watch::channel(Sequence::default());
        Self {
            sequence: Arc::new(sequence),
        }
    }
}

impl SequenceBarrier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until it is `ticket`'s turn. The turn passes on when the returned
    /// guard is dropped.
    pub async fn enter(&self, ticket: u64) -> Turn<'_> {
        let mut rx = self.sequence.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|sequence| sequence.turn >= ticket).await;
        Turn { barrier: self, ticket }
    }

    /// Ticket whose turn it is.
    pub fn current(&self) -> u64 {
        self.sequence.borrow().turn
    }

    /// Give up `ticket`. Releasing a ticket whose turn has passed is a no-op.
    pub fn release(&self, ticket: u64) {
        self.sequence.send_if_modified(|sequence| {
            if ticket < sequence.turn {
                return false;
            }
            if ticket > sequence.turn {
                sequence.released.insert(ticket);
                return false;
            }
            sequence.turn += 1;
            while sequence.released.remove(&sequence.turn) {
                sequence.turn += 1;
            }
            true
        });
    }
}

/// Holding a turn of a [`SequenceBarrier`].
#[derive(Debug)]
pub struct Turn<'a> {
    barrier: &'a SequenceBarrier,
    ticket: u64,
}

impl Drop for Turn<'_> {
    fn drop(&mut self) {
        self.barrier.release(self.ticket);
    }
}

/// A call's place in both barriers. Dropping it gives up whatever turns the
/// call has not taken yet, so an abandoned call never blocks later ones.
struct Ticket {
    number: u64,
    entry: SequenceBarrier,
    exit: SequenceBarrier,
}

impl Drop for Ticket {
    fn drop(&mut self) {
        self.entry.release(self.number);
        self.exit.release(self.number);
    }
}

struct Request {
    packet: Option<Packet>,
    reply: oneshot::Sender<Result<DecodeOutput, qsvbridge_codec::CodecError>>,
}

/// Handle for submitting packets to a [`ParallelDecoder`].
#[derive(Clone)]
pub struct DecodeWorker {
    tickets: Arc<AtomicU64>,
    entry: SequenceBarrier,
    exit: SequenceBarrier,
    requests: mpsc::Sender<Request>,
}

impl DecodeWorker {
    /// Decode `packet`, or drain the session with `None`.
    ///
    /// The call's place in the sequence is fixed when this method is called,
    /// not when the returned future is first polled.
    ///
    /// Dropping the future early gives up its place. A packet that already
    /// reached the session is still decoded, but its output is discarded.
    pub fn decode(&self, packet: Option<Packet>) -> impl Future<Output = Result<DecodeOutput>> + Send + 'static {
        let ticket = Ticket {
            number: self.tickets.fetch_add(1, Ordering::SeqCst),
            entry: self.entry.clone(),
            exit: self.exit.clone(),
        };
        let requests = self.requests.clone();
        async move { submit(ticket, requests, packet).await }
    }
}

async fn submit(ticket: Ticket, requests: mpsc::Sender<Request>, packet: Option<Packet>) -> Result<DecodeOutput> {
    let number = ticket.number;
    let (reply, response) = oneshot::channel();
    let sent = {
        let _turn = ticket.entry.enter(number).await;
        requests.send(Request { packet, reply }).await
    };

    let result = match sent {
        Ok(()) => match response.await {
            Ok(result) => result.with_context(|| format!("decode call {number} failed")),
            Err(_) => Err(anyhow!("decode session stopped")),
        },
        Err(_) => Err(anyhow!("decode session stopped")),
    };

    let _turn = ticket.exit.enter(number).await;
    result
}

/// Owns one decode session on a background task.
pub struct ParallelDecoder {
    worker: DecodeWorker,
    cancel: CancellationToken,
    task: JoinHandle<Result<()>>,
}

impl ParallelDecoder {
    /// Move `decoder` onto a background task. At most `queue_depth` requests
    /// wait for the session at a time.
    pub fn spawn<D>(decoder: D, queue_depth: usize) -> Self
    where
        D: VideoDecoder + 'static,
    {
        let (tx, rx) = mpsc::channel(queue_depth.max(1));
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_session(decoder, rx, cancel.clone()));
        Self {
            worker: DecodeWorker {
                tickets: Arc::new(AtomicU64::new(0)),
                entry: SequenceBarrier::new(),
                exit: SequenceBarrier::new(),
                requests: tx,
            },
            cancel,
            task,
        }
    }

    pub fn worker(&self) -> DecodeWorker {
        self.worker.clone()
    }

    /// Stop the session task, flushing and closing the session.
    ///
    /// Requests still queued fail with "decode session stopped".
    pub async fn shutdown(self) -> Result<()> {
        self.cancel.cancel();
        self.task.await.context("decode session task panicked")?
    }
}

async fn run_session<D>(mut decoder: D, mut requests: mpsc::Receiver<Request>, cancel: CancellationToken) -> Result<()>
where
    D: VideoDecoder + 'static,
{
    tracing::info!(codec = ?decoder.codec(), "decode session started");
    let mut calls = 0u64;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            request = requests.recv() => {
                let Some(request) = request else {
                    break;
                };
                let (back, result) = tokio::task::spawn_blocking(move || {
                    let result = decoder.decode(request.packet.as_ref());
                    (decoder, result)
                })
                .await
                .context("decode call panicked")?;
                decoder = back;
                calls += 1;
                if let Err(err) = &result {
                    tracing::warn!(%err, "decode call failed");
                }
                let _ = request.reply.send(result);
            }
        }
    }

    tracing::info!(calls, "decode session stopping");
    tokio::task::spawn_blocking(move || {
        decoder.flush().context("flushing decode session")?;
        decoder.close().context("closing decode session")
    })
    .await
    .context("closing decode session panicked")?
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use qsvbridge_codec::mfx::QsvDecoder;
    use qsvbridge_codec::sim::{SequenceHeader, SimConfig, SimLoader, SimStream};
    use qsvbridge_codec::{Codec, CodecError, DecoderConfig, SystemAllocator};

    fn session(async_depth: u16) -> QsvDecoder<SimLoader> {
        let extradata = SimStream::header_unit(SequenceHeader::new(32, 32));
        QsvDecoder::open(
            SimLoader::new(SimConfig::default()),
            DecoderConfig::new(Codec::H264).async_depth(async_depth),
            &extradata,
            Arc::new(SystemAllocator),
        )
        .unwrap()
    }

    fn picture(ts: i64) -> Packet {
        Packet::new(SimStream::picture_unit(ts as u8), Some(ts), Some(ts))
    }

    #[tokio::test]
    async fn test_barrier_orders_tickets() {
        let barrier = SequenceBarrier::new();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for ticket in (0..4u64).rev() {
            let barrier = barrier.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                let _turn = barrier.enter(ticket).await;
                order.lock().unwrap().push(ticket);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
        assert_eq!(barrier.current(), 4);
    }

    #[tokio::test]
    async fn test_released_tickets_are_skipped() {
        let barrier = SequenceBarrier::new();
        barrier.release(1);
        barrier.release(2);
        assert_eq!(barrier.current(), 0);

        drop(barrier.enter(0).await);
        assert_eq!(barrier.current(), 3);

        // already passed
        barrier.release(0);
        let turn = tokio::time::timeout(Duration::from_secs(2), barrier.enter(3)).await;
        assert!(turn.is_ok());
    }

    #[tokio::test]
    async fn test_dropped_call_does_not_block_later_calls() {
        let decoder = ParallelDecoder::spawn(session(1), 4);
        let worker = decoder.worker();

        drop(worker.decode(Some(picture(0))));
        let output = tokio::time::timeout(Duration::from_secs(2), worker.decode(Some(picture(1))))
            .await
            .expect("later call blocked by a dropped one")
            .unwrap();
        let frame = output.frame.unwrap();
        assert_eq!((frame.pts, frame.dts), (Some(1), Some(1)));

        decoder.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_results_follow_submission_order() {
        let decoder = ParallelDecoder::spawn(session(1), 4);
        let worker = decoder.worker();

        let calls: Vec<_> = (0..6).map(|ts| worker.decode(Some(picture(ts)))).collect();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        // Scheduled in reverse; tickets still decide the order.
        for call in calls.into_iter().rev() {
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                let output = call.await.unwrap();
                let pts = output.frame.unwrap().pts.unwrap();
                order.lock().unwrap().push(pts);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4, 5]);
        decoder.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_errors_reach_the_caller() {
        let decoder = ParallelDecoder::spawn(session(1), 1);
        let worker = decoder.worker();

        worker.decode(Some(picture(0))).await.unwrap();
        // the device stamps this one with pts 1, which was never recorded
        let unstamped = Packet::new(SimStream::picture_unit(1), None, None);
        let err = worker.decode(Some(unstamped)).await.unwrap_err();
        assert!(err.downcast_ref::<CodecError>().map_or(false, CodecError::is_bug));

        decoder.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_stops_workers() {
        let decoder = ParallelDecoder::spawn(session(4), 2);
        let worker = decoder.worker();

        let output = worker.decode(Some(picture(0))).await.unwrap();
        assert!(!output.got_frame());

        decoder.shutdown().await.unwrap();
        assert!(worker.decode(Some(picture(1))).await.is_err());
    }
}
