//! Bounded worker pool dispatching decoded requests to a [`Connection`].
//!
//! Grounded on the teacher's `dispatch`, which spawns one unbounded
//! `tokio::spawn` per incoming message. That gives no backpressure and no
//! way to cancel a request once queued; `lib9p.h`'s fixed `L9P_NUMTHREADS`
//! pthread pool has both, so this module generalizes the teacher's
//! per-message-task idea into a fixed set of long-lived workers pulling
//! from a bounded intake channel.

use std::sync::Arc;

use log::error;
use tokio::sync::{Mutex, mpsc};

use crate::backend::{Backend, Outcome};
use crate::conn::Connection;
use crate::fcall::FCall;
use crate::request::RequestTable;
use crate::{DEFAULT_QUEUE_DEPTH, DEFAULT_WORKERS};

/// A decoded request queued for a worker, paired with its tag.
struct Job {
    tag: u16,
    body: FCall,
}

/// A response a worker produced, paired with the tag it answers. `None`
/// body means the request was cancelled by a `Tflush` and nothing should
/// be sent for this tag at all.
pub struct Reply {
    pub tag: u16,
    pub body: Option<FCall>,
}

/// Fixed-size pool of workers dispatching requests against one
/// [`Connection`]. Dropping the `Pool` stops accepting new work; workers
/// drain whatever is already queued before exiting.
pub struct Pool {
    intake: mpsc::Sender<Job>,
}

impl Pool {
    /// Spawn `workers` tasks pulling from a channel of depth `queue_depth`,
    /// each running requests against `conn` and forwarding results on the
    /// returned receiver.
    pub fn spawn<B: Backend + 'static>(
        conn: Arc<Connection<B>>,
        workers: usize,
        queue_depth: usize,
    ) -> (Pool, mpsc::Receiver<Reply>) {
        let (intake_tx, intake_rx) = mpsc::channel(queue_depth);
        let (reply_tx, reply_rx) = mpsc::channel(queue_depth);
        let intake_rx = Arc::new(Mutex::new(intake_rx));

        for _ in 0..workers {
            let conn = conn.clone();
            let intake_rx = intake_rx.clone();
            let reply_tx = reply_tx.clone();
            tokio::spawn(async move {
                loop {
                    let job = {
                        let mut rx = intake_rx.lock().await;
                        rx.recv().await
                    };
                    let Some(job) = job else { break };
                    conn.requests().mark_in_flight(job.tag).await;

                    let body = match conn.dispatch_once(job.tag, job.body).await {
                        Ok(Outcome::Done(fcall)) => Some(fcall),
                        Ok(Outcome::Cancelled) => None,
                        Ok(Outcome::Deferred) => {
                            // job.tag was a Tflush whose target was still
                            // outstanding. It's done as far as this table
                            // is concerned (it never runs, never occupies
                            // the queue again) but gets no reply yet — the
                            // target's own worker answers it once that
                            // target tag finishes, below.
                            conn.requests().remove(job.tag).await;
                            continue;
                        }
                        Err(e) => Some(error_response(&conn, e).await),
                    };

                    // Any Tflush naming job.tag recorded itself here, even
                    // if job.tag itself ends up Cancelled — the client
                    // still needs its Rflush, strictly after this reply.
                    let flush_tags = conn.requests().take_pending_flushes(job.tag).await;
                    conn.requests().remove(job.tag).await;

                    if !send_reply(&reply_tx, job.tag, body).await {
                        break;
                    }
                    let mut closed = false;
                    for flush_tag in flush_tags {
                        if !send_reply(&reply_tx, flush_tag, Some(FCall::RFlush)).await {
                            closed = true;
                            break;
                        }
                    }
                    if closed {
                        break;
                    }
                }
            });
        }

        (Pool { intake: intake_tx }, reply_rx)
    }

    pub fn with_defaults<B: Backend + 'static>(
        conn: Arc<Connection<B>>,
    ) -> (Pool, mpsc::Receiver<Reply>) {
        Self::spawn(conn, DEFAULT_WORKERS, DEFAULT_QUEUE_DEPTH)
    }

    /// Register `tag` as outstanding and enqueue it for a worker. Errors if
    /// the tag is already in flight (`TagInUse`) — the caller should not
    /// enqueue in that case, matching `l9p_dispatch_request`'s duplicate-tag
    /// rejection.
    pub async fn submit(&self, requests: &RequestTable, tag: u16, body: FCall) -> crate::Result<()> {
        requests.insert(tag).await?;
        self.intake
            .send(Job { tag, body })
            .await
            .map_err(|_| crate::Error::Proto(crate::error::ProtoError::NotNegotiated))
    }
}

/// Send one reply, logging and reporting whether the channel is still open.
async fn send_reply(reply_tx: &mpsc::Sender<Reply>, tag: u16, body: Option<FCall>) -> bool {
    if reply_tx.send(Reply { tag, body }).await.is_err() {
        error!("reply channel closed while finishing tag {}", tag);
        return false;
    }
    true
}

async fn error_response<B: Backend>(conn: &Connection<B>, e: crate::Error) -> FCall {
    use crate::conn::ConnState;
    match conn.state().await {
        ConnState::Negotiated(dialect) if dialect.numeric_errors() => FCall::RlError {
            ecode: e.errno() as u32,
        },
        _ => FCall::RError {
            ename: format!("{}", e),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Backend;
    use crate::fcall::*;
    use async_trait::async_trait;

    struct OkBackend;

    #[async_trait]
    impl Backend for OkBackend {
        type FId = ();

        async fn rattach(
            &self,
            _: &crate::fid::Fid<()>,
            _afid: Option<&crate::fid::Fid<()>>,
            _uname: &str,
            _aname: &str,
            _n_uname: u32,
        ) -> crate::Result<FCall> {
            Ok(FCall::RAttach {
                qid: QId::default(),
            })
        }
    }

    #[tokio::test]
    async fn submitted_request_produces_a_reply() {
        let conn = Arc::new(Connection::new(Arc::new(OkBackend)));
        let (pool, mut replies) = Pool::spawn(conn.clone(), 2, 8);

        pool.submit(
            conn.requests(),
            NOTAG,
            FCall::TVersion {
                msize: 4096,
                version: P92000L.to_owned(),
            },
        )
        .await
        .unwrap();

        let reply = replies.recv().await.unwrap();
        assert_eq!(reply.tag, NOTAG);
        assert!(matches!(reply.body, Some(FCall::RVersion { .. })));
    }

    #[tokio::test]
    async fn duplicate_tag_is_rejected_before_queueing() {
        let conn = Arc::new(Connection::new(Arc::new(OkBackend)));
        let (pool, mut replies) = Pool::spawn(conn.clone(), 1, 8);

        pool.submit(
            conn.requests(),
            NOTAG,
            FCall::TVersion {
                msize: 4096,
                version: P92000L.to_owned(),
            },
        )
        .await
        .unwrap();
        let _ = replies.recv().await.unwrap();

        conn.dispatch_once(
            NOTAG,
            FCall::TVersion {
                msize: 4096,
                version: P92000L.to_owned(),
            },
        )
        .await
        .unwrap();

        conn.requests().insert(7).await.unwrap();
        let err = pool.submit(conn.requests(), 7, FCall::TStatFs { fid: 0 }).await;
        assert!(err.is_err());
    }
}
