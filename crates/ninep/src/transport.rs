//! The wire-facing half of a connection: the callback contract a transport
//! must satisfy to hand a [`crate::conn::Connection`] response buffers, and
//! the loop that ties a decoded byte stream to a [`crate::pool::Pool`].
//!
//! Grounded on the teacher's `dispatch`: same `LengthDelimitedCodec` framing
//! (4-byte little-endian length prefix covering itself, matching 9P's
//! `size[4]` header). The acquire-a-buffer/hand-it-back shape of
//! [`Transport`] mirrors `l9p_backend::get_response_buffer`/`send_response`
//! from the FreeBSD core: a connection never writes to the wire directly,
//! it asks its transport for a buffer, fills it, and hands it back.

use std::sync::Arc;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use log::{error, info};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio_util::codec::{FramedWrite, LengthDelimitedCodec};

use crate::backend::Backend;
use crate::conn::Connection;
use crate::fcall::{Msg, MsgType};
use crate::iovec::{Cursor, Mode};
use crate::pool::Pool;
use crate::serialize;
use crate::utils::Result;

fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_offset(0)
        .length_field_length(4)
        .length_adjustment(-4)
        .little_endian()
        .new_codec()
}

/// The buffer-acquire/send callback pair a connection hands every response
/// through. An implementor owns the wire framing; the connection only ever
/// sees a [`Cursor`] to pack bytes into.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Acquire a writable scatter-gather buffer for one outgoing response,
    /// sized to accommodate up to `max_size` bytes (the connection's
    /// negotiated msize).
    async fn response_buffer(&self, max_size: usize) -> Result<Cursor>;

    /// Commit an encoded response to the wire, consuming the buffer handed
    /// out by [`Transport::response_buffer`]. Responsible for framing.
    async fn send(&self, buf: Cursor) -> Result<()>;
}

/// The reference [`Transport`]: length-delimited framing over any
/// `AsyncWrite`, the same framing the read side of [`serve_connection`]
/// expects on the wire.
pub struct FramedTransport<W> {
    sink: Mutex<FramedWrite<W, LengthDelimitedCodec>>,
}

impl<W: AsyncWrite + Unpin> FramedTransport<W> {
    pub fn new(writer: W) -> Self {
        FramedTransport {
            sink: Mutex::new(codec().new_write(writer)),
        }
    }
}

#[async_trait]
impl<W: AsyncWrite + Send + Unpin> Transport for FramedTransport<W> {
    async fn response_buffer(&self, max_size: usize) -> Result<Cursor> {
        Cursor::new(Mode::Pack, vec![Vec::with_capacity(max_size.min(4096))])
    }

    async fn send(&self, buf: Cursor) -> Result<()> {
        let frozen = bytes::Bytes::from(buf.into_flat());
        self.sink.lock().await.send(frozen).await?;
        Ok(())
    }
}

/// Drive one connection to completion: decode messages from `reader`,
/// submit them to a freshly spawned [`Pool`], and write back whatever
/// replies the pool produces, in the order they complete (not necessarily
/// the order requests arrived — 9P tags, not framing order, identify a
/// reply), through `conn`'s [`Transport`].
///
/// `conn` is constructed by the caller (rather than from a bare backend)
/// so [`crate::server::Server`] can register it in its connection list
/// before handing it off here.
pub async fn serve_connection<B, Reader, Writer>(
    conn: Arc<Connection<B>>,
    reader: Reader,
    writer: Writer,
) -> Result<()>
where
    B: Backend + 'static,
    Reader: 'static + AsyncRead + Send + Unpin,
    Writer: 'static + AsyncWrite + Send + Unpin,
{
    let transport: Arc<dyn Transport> = Arc::new(FramedTransport::new(writer));
    let (pool, mut replies) = Pool::with_defaults(conn.clone());

    let mut framed_read = codec().new_read(reader);

    let writer_task = {
        let conn = conn.clone();
        let transport = transport.clone();
        tokio::spawn(async move {
            while let Some(reply) = replies.recv().await {
                let Some(body) = reply.body else {
                    continue;
                };
                if !MsgType::from(&body).is_r() {
                    continue;
                }
                let response = Msg {
                    tag: reply.tag,
                    body,
                };
                let mut buf = match transport.response_buffer(conn.msize() as usize).await {
                    Ok(buf) => buf,
                    Err(e) => {
                        error!(
                            "failed to acquire response buffer for tag {}: {:?}",
                            reply.tag, e
                        );
                        continue;
                    }
                };
                if let Err(e) = serialize::write_msg(&mut buf, &response) {
                    error!("failed to encode response for tag {}: {:?}", reply.tag, e);
                    continue;
                }
                if let Err(e) = transport.send(buf).await {
                    error!("failed to send response for tag {}: {:?}", reply.tag, e);
                    return;
                }
                info!("\t-> {:?}", response);
            }
        })
    };

    while let Some(bytes) = framed_read.next().await {
        let bytes = bytes?;
        let mut cursor = Cursor::new(Mode::Unpack, vec![bytes.to_vec()])?;
        let msg = serialize::read_msg(&mut cursor)?;
        info!("\t<- {:?}", msg);
        if let Err(e) = pool.submit(conn.requests(), msg.tag, msg.body).await {
            error!("failed to submit tag {}: {:?}", msg.tag, e);
        }
    }

    conn.begin_closing().await;
    drop(pool);
    let _ = writer_task.await;
    conn.close().await;

    Ok(())
}
