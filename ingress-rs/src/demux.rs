//! Protocol demultiplexer.
//!
//! Each raw listener (plaintext and TLS-terminated) feeds a demux loop that
//! classifies every accepted connection and hands it to one of two virtual
//! listeners: the gRPC side or the any side.
//!
//! Classification reads from the head of the stream without losing bytes: a
//! connection that opens with the HTTP/2 client preface *and* whose first
//! HEADERS frame on stream 1 carries a `content-type` starting with
//! `application/grpc` goes to the gRPC server; everything else (HTTP/1
//! methods, browser HTTP/2, WebSocket upgrades) goes to the HTTP server.
//! Every consumed byte is replayed to the downstream server.
//!
//! When the preface is seen an empty SETTINGS frame is written so clients
//! that wait for the server preface before sending HEADERS make progress.
//! The client acknowledges that frame; the downstream HTTP/2 server never
//! sent it, so the first SETTINGS ACK on the wire is stripped from the
//! replayed stream.

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, warn};

use crate::proxy::Shutdown;

/// The HTTP/2 client connection preface.
pub(crate) const H2_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

const GRPC_CONTENT_TYPE: &[u8] = b"application/grpc";
const EMPTY_SETTINGS: [u8; 9] = [0, 0, 0, FRAME_SETTINGS, 0, 0, 0, 0, 0];
const MAX_CLASSIFY_BYTES: usize = 16 * 1024;
const FRAME_HEADER_LEN: usize = 9;

const FRAME_HEADERS: u8 = 0x1;
const FRAME_SETTINGS: u8 = 0x4;
const FRAME_CONTINUATION: u8 = 0x9;

const FLAG_ACK: u8 = 0x1;
const FLAG_END_HEADERS: u8 = 0x4;
const FLAG_PADDED: u8 = 0x8;
const FLAG_PRIORITY: u8 = 0x20;

/// How long a connection may take to present classifiable bytes
/// (and, on the TLS listener, to complete the handshake).
pub(crate) const CLASSIFY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

/// Classification verdict for an accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Http,
    Grpc,
}

/// Object-safe alias for the demuxed byte streams.
pub trait Io: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> Io for T {}

pub type BoxedIo = Box<dyn Io>;

/// One side of a demultiplexed raw listener.
pub(crate) struct VirtualListener {
    rx: mpsc::Receiver<BoxedIo>,
}

impl VirtualListener {
    pub(crate) async fn accept(&mut self) -> Option<BoxedIo> {
        self.rx.recv().await
    }
}

pub(crate) fn virtual_listener(capacity: usize) -> (mpsc::Sender<BoxedIo>, VirtualListener) {
    let (tx, rx) = mpsc::channel(capacity);
    (tx, VirtualListener { rx })
}

/// Strips the first zero-length SETTINGS ACK frame from a byte stream.
///
/// The ACK answers the SETTINGS frame the classifier wrote; the downstream
/// server never sent that frame and would treat the ACK as a protocol error.
enum AckFilter {
    Disabled,
    Searching {
        /// Bytes of the current frame (initially the preface) still to pass.
        passthrough: usize,
        header: [u8; FRAME_HEADER_LEN],
        header_len: usize,
    },
    Done,
}

fn feed_filter(filter: &mut AckFilter, mut input: &[u8], out: &mut Vec<u8>) {
    loop {
        match filter {
            AckFilter::Disabled | AckFilter::Done => {
                out.extend_from_slice(input);
                return;
            }
            AckFilter::Searching {
                passthrough,
                header,
                header_len,
            } => {
                if input.is_empty() {
                    return;
                }
                if *passthrough > 0 {
                    let n = (*passthrough).min(input.len());
                    out.extend_from_slice(&input[..n]);
                    *passthrough -= n;
                    input = &input[n..];
                    continue;
                }
                let need = FRAME_HEADER_LEN - *header_len;
                let n = need.min(input.len());
                header[*header_len..*header_len + n].copy_from_slice(&input[..n]);
                *header_len += n;
                input = &input[n..];
                if *header_len < FRAME_HEADER_LEN {
                    return;
                }
                let len = ((header[0] as usize) << 16)
                    | ((header[1] as usize) << 8)
                    | header[2] as usize;
                let typ = header[3];
                let flags = header[4];
                if typ == FRAME_SETTINGS && flags & FLAG_ACK != 0 && len == 0 {
                    // drop the ACK frame and stop filtering
                    *filter = AckFilter::Done;
                    continue;
                }
                out.extend_from_slice(&header[..]);
                *header_len = 0;
                *passthrough = len;
            }
        }
    }
}

/// A stream that first replays the bytes consumed during classification,
/// then reads from the underlying connection.
pub struct ReplayStream<S> {
    inner: S,
    out: Vec<u8>,
    out_pos: usize,
    filter: AckFilter,
}

impl<S> ReplayStream<S> {
    fn new(consumed: Vec<u8>, inner: S, h2: bool) -> Self {
        let mut filter = if h2 {
            AckFilter::Searching {
                passthrough: H2_PREFACE.len(),
                header: [0; FRAME_HEADER_LEN],
                header_len: 0,
            }
        } else {
            AckFilter::Disabled
        };
        let mut out = Vec::with_capacity(consumed.len());
        feed_filter(&mut filter, &consumed, &mut out);
        Self {
            inner,
            out,
            out_pos: 0,
            filter,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for ReplayStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if this.out_pos < this.out.len() {
                let n = buf.remaining().min(this.out.len() - this.out_pos);
                buf.put_slice(&this.out[this.out_pos..this.out_pos + n]);
                this.out_pos += n;
                if this.out_pos == this.out.len() {
                    this.out.clear();
                    this.out_pos = 0;
                }
                return Poll::Ready(Ok(()));
            }
            if matches!(this.filter, AckFilter::Disabled | AckFilter::Done) {
                return Pin::new(&mut this.inner).poll_read(cx, buf);
            }
            // still searching for the ACK: pull raw bytes and filter them
            let mut scratch = [0u8; 8192];
            let mut raw = ReadBuf::new(&mut scratch);
            ready!(Pin::new(&mut this.inner).poll_read(cx, &mut raw))?;
            if raw.filled().is_empty() {
                return Poll::Ready(Ok(()));
            }
            feed_filter(&mut this.filter, raw.filled(), &mut this.out);
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for ReplayStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// Classify a freshly accepted connection.
///
/// Returns the verdict together with a stream that replays every byte read
/// here, so the downstream server sees the unmodified head of the stream.
pub async fn classify<S>(mut stream: S) -> io::Result<(Protocol, ReplayStream<S>)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut consumed: Vec<u8> = Vec::with_capacity(1024);
    loop {
        let seen = consumed.len().min(H2_PREFACE.len());
        if consumed[..seen] != H2_PREFACE[..seen] {
            return Ok((Protocol::Http, ReplayStream::new(consumed, stream, false)));
        }
        if consumed.len() >= H2_PREFACE.len() {
            break;
        }
        let mut chunk = [0u8; 1024];
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            // EOF before a full preface; let the HTTP server report it
            return Ok((Protocol::Http, ReplayStream::new(consumed, stream, false)));
        }
        consumed.extend_from_slice(&chunk[..n]);
    }

    // Preface seen. Clients like grpc-java wait for the server SETTINGS
    // before sending HEADERS, so write an empty one now.
    stream.write_all(&EMPTY_SETTINGS).await?;
    stream.flush().await?;

    let mut cursor = H2_PREFACE.len();
    let mut fragment: Vec<u8> = Vec::new();
    let mut in_headers = false;
    let verdict = loop {
        if cursor + FRAME_HEADER_LEN > MAX_CLASSIFY_BYTES {
            break Protocol::Http;
        }
        if !fill_to(&mut stream, &mut consumed, cursor + FRAME_HEADER_LEN).await? {
            break Protocol::Http;
        }
        let header = &consumed[cursor..cursor + FRAME_HEADER_LEN];
        let len =
            ((header[0] as usize) << 16) | ((header[1] as usize) << 8) | header[2] as usize;
        let typ = header[3];
        let flags = header[4];
        let stream_id =
            u32::from_be_bytes([header[5] & 0x7f, header[6], header[7], header[8]]);
        let frame_end = cursor + FRAME_HEADER_LEN + len;
        if frame_end > MAX_CLASSIFY_BYTES {
            break Protocol::Http;
        }
        if !fill_to(&mut stream, &mut consumed, frame_end).await? {
            break Protocol::Http;
        }
        let payload = &consumed[cursor + FRAME_HEADER_LEN..frame_end];
        cursor = frame_end;
        if in_headers {
            // a header block must be contiguous CONTINUATION frames
            if typ != FRAME_CONTINUATION || stream_id != 1 {
                break Protocol::Http;
            }
            fragment.extend_from_slice(payload);
            if flags & FLAG_END_HEADERS != 0 {
                break classify_fragment(&fragment);
            }
        } else if typ == FRAME_HEADERS {
            if stream_id != 1 {
                break Protocol::Http;
            }
            match headers_fragment(payload, flags) {
                Some(frag) => {
                    fragment.extend_from_slice(frag);
                    if flags & FLAG_END_HEADERS != 0 {
                        break classify_fragment(&fragment);
                    }
                    in_headers = true;
                }
                None => break Protocol::Http,
            }
        }
        // SETTINGS, WINDOW_UPDATE, PRIORITY and friends are skipped
    };
    Ok((verdict, ReplayStream::new(consumed, stream, true)))
}

/// Read until `buf` holds at least `target` bytes. Returns false on EOF.
async fn fill_to<S: AsyncRead + Unpin>(
    stream: &mut S,
    buf: &mut Vec<u8>,
    target: usize,
) -> io::Result<bool> {
    while buf.len() < target {
        let mut chunk = [0u8; 4096];
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(false);
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    Ok(true)
}

/// Strip padding and priority fields from a HEADERS payload.
fn headers_fragment(payload: &[u8], flags: u8) -> Option<&[u8]> {
    let mut rest = payload;
    let mut padding = 0usize;
    if flags & FLAG_PADDED != 0 {
        padding = *rest.first()? as usize;
        rest = &rest[1..];
    }
    if flags & FLAG_PRIORITY != 0 {
        if rest.len() < 5 {
            return None;
        }
        rest = &rest[5..];
    }
    if padding > rest.len() {
        return None;
    }
    Some(&rest[..rest.len() - padding])
}

fn classify_fragment(fragment: &[u8]) -> Protocol {
    let mut decoder = hpack::Decoder::new();
    match decoder.decode(fragment) {
        Ok(fields) => {
            let grpc = fields.iter().any(|(name, value)| {
                name.as_slice() == b"content-type" && value.starts_with(GRPC_CONTENT_TYPE)
            });
            if grpc {
                Protocol::Grpc
            } else {
                Protocol::Http
            }
        }
        Err(_) => Protocol::Http,
    }
}

/// Accept loop for one raw listener.
pub(crate) async fn demux_loop(
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
    http_tx: mpsc::Sender<BoxedIo>,
    grpc_tx: mpsc::Sender<BoxedIo>,
    shutdown: Shutdown,
    label: &'static str,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let _ = stream.set_nodelay(true);
                    let tls = tls.clone();
                    let http_tx = http_tx.clone();
                    let grpc_tx = grpc_tx.clone();
                    tokio::spawn(async move {
                        dispatch(stream, peer, tls, http_tx, grpc_tx, label).await;
                    });
                }
                Err(e) => {
                    warn!(listener = label, error = %e, "Accept failed");
                }
            }
        }
    }
    debug!(listener = label, "Demux loop stopped");
}

async fn dispatch(
    stream: tokio::net::TcpStream,
    peer: std::net::SocketAddr,
    tls: Option<TlsAcceptor>,
    http_tx: mpsc::Sender<BoxedIo>,
    grpc_tx: mpsc::Sender<BoxedIo>,
    label: &'static str,
) {
    let classified = tokio::time::timeout(CLASSIFY_TIMEOUT, async {
        match tls {
            Some(acceptor) => {
                let tls_stream = acceptor.accept(stream).await?;
                let (protocol, replay) = classify(tls_stream).await?;
                Ok::<(Protocol, BoxedIo), io::Error>((protocol, Box::new(replay)))
            }
            None => {
                let (protocol, replay) = classify(stream).await?;
                Ok::<(Protocol, BoxedIo), io::Error>((protocol, Box::new(replay)))
            }
        }
    })
    .await;

    match classified {
        Ok(Ok((protocol, io))) => {
            debug!(listener = label, %peer, ?protocol, "Connection classified");
            let tx = match protocol {
                Protocol::Http => &http_tx,
                Protocol::Grpc => &grpc_tx,
            };
            if tx.send(io).await.is_err() {
                debug!(listener = label, %peer, "Server stopped, dropping connection");
            }
        }
        Ok(Err(e)) => {
            debug!(listener = label, %peer, error = %e, "Failed to classify connection");
        }
        Err(_) => {
            debug!(listener = label, %peer, "Classification timed out");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    fn frame(typ: u8, flags: u8, stream_id: u32, payload: &[u8]) -> Vec<u8> {
        let len = payload.len();
        let mut out = vec![
            (len >> 16) as u8,
            (len >> 8) as u8,
            len as u8,
            typ,
            flags,
            (stream_id >> 24) as u8,
            (stream_id >> 16) as u8,
            (stream_id >> 8) as u8,
            stream_id as u8,
        ];
        out.extend_from_slice(payload);
        out
    }

    fn grpc_headers_block() -> Vec<u8> {
        let mut encoder = hpack::Encoder::new();
        let headers: Vec<(&[u8], &[u8])> = vec![
            (b":method", b"POST"),
            (b":scheme", b"http"),
            (b":path", b"/pkg.Service/Method"),
            (b":authority", b"localhost"),
            (b"content-type", b"application/grpc"),
            (b"te", b"trailers"),
        ];
        encoder.encode(headers)
    }

    fn html_headers_block() -> Vec<u8> {
        let mut encoder = hpack::Encoder::new();
        let headers: Vec<(&[u8], &[u8])> = vec![
            (b":method", b"GET"),
            (b":scheme", b"http"),
            (b":path", b"/"),
            (b":authority", b"localhost"),
            (b"accept", b"text/html"),
        ];
        encoder.encode(headers)
    }

    async fn classify_bytes(bytes: &[u8]) -> (Protocol, Vec<u8>) {
        let (mut client, server) = tokio::io::duplex(256 * 1024);
        client.write_all(bytes).await.unwrap();
        client.shutdown().await.unwrap();
        let (protocol, mut replay) = classify(server).await.unwrap();
        let mut replayed = Vec::new();
        replay.read_to_end(&mut replayed).await.unwrap();
        (protocol, replayed)
    }

    #[tokio::test]
    async fn test_http1_is_classified_http() {
        let request = b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n";
        let (protocol, replayed) = classify_bytes(request).await;
        assert_eq!(protocol, Protocol::Http);
        assert_eq!(replayed, request);
    }

    #[tokio::test]
    async fn test_short_connection_is_classified_http() {
        let (protocol, replayed) = classify_bytes(b"PR").await;
        assert_eq!(protocol, Protocol::Http);
        assert_eq!(replayed, b"PR");
    }

    #[tokio::test]
    async fn test_grpc_preface_and_content_type() {
        let mut bytes = H2_PREFACE.to_vec();
        bytes.extend_from_slice(&frame(FRAME_SETTINGS, 0, 0, &[]));
        bytes.extend_from_slice(&frame(
            FRAME_HEADERS,
            FLAG_END_HEADERS,
            1,
            &grpc_headers_block(),
        ));
        let (protocol, replayed) = classify_bytes(&bytes).await;
        assert_eq!(protocol, Protocol::Grpc);
        assert_eq!(replayed, bytes);
    }

    #[tokio::test]
    async fn test_browser_h2_is_classified_http() {
        let mut bytes = H2_PREFACE.to_vec();
        bytes.extend_from_slice(&frame(FRAME_SETTINGS, 0, 0, &[]));
        bytes.extend_from_slice(&frame(
            FRAME_HEADERS,
            FLAG_END_HEADERS,
            1,
            &html_headers_block(),
        ));
        let (protocol, replayed) = classify_bytes(&bytes).await;
        assert_eq!(protocol, Protocol::Http);
        assert_eq!(replayed, bytes);
    }

    #[tokio::test]
    async fn test_continuation_frames_are_joined() {
        let block = grpc_headers_block();
        let (first, second) = block.split_at(block.len() / 2);
        let mut bytes = H2_PREFACE.to_vec();
        bytes.extend_from_slice(&frame(FRAME_HEADERS, 0, 1, first));
        bytes.extend_from_slice(&frame(FRAME_CONTINUATION, FLAG_END_HEADERS, 1, second));
        let (protocol, replayed) = classify_bytes(&bytes).await;
        assert_eq!(protocol, Protocol::Grpc);
        assert_eq!(replayed, bytes);
    }

    #[tokio::test]
    async fn test_settings_ack_is_stripped_from_replay() {
        let headers = frame(FRAME_HEADERS, FLAG_END_HEADERS, 1, &grpc_headers_block());
        let ack = frame(FRAME_SETTINGS, FLAG_ACK, 0, &[]);
        let window = frame(0x8, 0, 0, &[0, 1, 0, 0]);

        let mut bytes = H2_PREFACE.to_vec();
        bytes.extend_from_slice(&frame(FRAME_SETTINGS, 0, 0, &[]));
        bytes.extend_from_slice(&headers);
        bytes.extend_from_slice(&ack);
        bytes.extend_from_slice(&window);

        let mut expected = H2_PREFACE.to_vec();
        expected.extend_from_slice(&frame(FRAME_SETTINGS, 0, 0, &[]));
        expected.extend_from_slice(&headers);
        expected.extend_from_slice(&window);

        let (protocol, replayed) = classify_bytes(&bytes).await;
        assert_eq!(protocol, Protocol::Grpc);
        assert_eq!(replayed, expected);
    }

    #[test]
    fn test_feed_filter_across_chunk_boundaries() {
        let mut stream = H2_PREFACE.to_vec();
        stream.extend_from_slice(&frame(FRAME_SETTINGS, 0, 0, &[2, 0, 0, 0, 0, 128]));
        stream.extend_from_slice(&frame(FRAME_SETTINGS, FLAG_ACK, 0, &[]));
        stream.extend_from_slice(&frame(FRAME_HEADERS, FLAG_END_HEADERS, 1, &[0xaa; 7]));

        let mut expected = H2_PREFACE.to_vec();
        expected.extend_from_slice(&frame(FRAME_SETTINGS, 0, 0, &[2, 0, 0, 0, 0, 128]));
        expected.extend_from_slice(&frame(FRAME_HEADERS, FLAG_END_HEADERS, 1, &[0xaa; 7]));

        let mut filter = AckFilter::Searching {
            passthrough: H2_PREFACE.len(),
            header: [0; FRAME_HEADER_LEN],
            header_len: 0,
        };
        let mut out = Vec::new();
        for byte in &stream {
            feed_filter(&mut filter, std::slice::from_ref(byte), &mut out);
        }
        assert_eq!(out, expected);
    }

    #[test]
    fn test_headers_fragment_strips_padding_and_priority() {
        // padded (pad length 2) + priority (5 bytes) around a 3-byte block
        let payload = [2u8, 0, 0, 0, 1, 200, 0xa, 0xb, 0xc, 0, 0];
        let frag = headers_fragment(&payload, FLAG_PADDED | FLAG_PRIORITY).unwrap();
        assert_eq!(frag, &[0xa, 0xb, 0xc]);
    }

    #[test]
    fn test_headers_fragment_rejects_oversized_padding() {
        let payload = [200u8, 0xa];
        assert!(headers_fragment(&payload, FLAG_PADDED).is_none());
    }
}
