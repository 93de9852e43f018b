//! Connection Driver
//!
//! `serve_connection` is the task that moves bytes between one socket and its
//! session. It runs on a worker thread's `LocalSet`, next to every other
//! session of that worker, and shares the worker through `Rc<RefCell<_>>`.
//! The `RefCell` is only borrowed between awaits, never across one.
//!
//! ## Loop
//!
//! ```text
//!        ┌──────────────────────────────────────────────┐
//!        │ select!                                      │
//!        │   socket readable ──> worker.on_read         │
//!        │   idle timeout    ──> worker.on_event        │
//!        │   mailbox message ──> worker.deliver         │
//!        └───────────────┬──────────────────────────────┘
//!                        │
//!                        ▼
//!        write queued output, then worker.on_write_complete
//!                        │
//!          closed? ──yes──> shutdown socket, task ends
//!                        │
//!                        no ──> loop
//! ```

use crate::connection::{Outbound, SessionId, TransportEvent, Worker};
use bytes::BytesMut;
use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

/// Bytes requested from the socket per read.
const READ_CHUNK_SIZE: usize = 16 * 1024;

/// Transport-level failures. These never reach the client.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("file transfer ended after {sent} of {expected} bytes")]
    ShortTransfer { sent: u64, expected: u64 },
}

/// What woke the connection loop.
enum Wakeup {
    Data,
    Transport(TransportEvent),
    Message(bytes::Bytes),
}

/// Drives one connection until the session is closed.
///
/// `idle_timeout` bounds how long a read may wait; expiring only reports a
/// [`TransportEvent::Timeout`] and the wait starts again.
pub async fn serve_connection<S>(
    worker: Rc<RefCell<Worker>>,
    stream: S,
    peer: SocketAddr,
    idle_timeout: Option<Duration>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (id, mut mailbox) = worker.borrow_mut().accept(peer);
    let (mut reader, mut writer) = tokio::io::split(stream);
    let mut read_buf = BytesMut::with_capacity(READ_CHUNK_SIZE);

    loop {
        let wakeup = tokio::select! {
            wakeup = read_event(&mut reader, &mut read_buf, idle_timeout) => wakeup,
            Some(frame) = mailbox.recv() => Wakeup::Message(frame),
        };

        let alive = match wakeup {
            Wakeup::Data => {
                trace!(session = id, bytes = read_buf.len(), "Read from socket");
                worker.borrow_mut().on_read(id, &read_buf);
                true
            }
            Wakeup::Message(frame) => {
                worker.borrow_mut().deliver(id, frame);
                true
            }
            Wakeup::Transport(event) => worker.borrow_mut().on_event(id, event),
        };
        if !alive {
            break;
        }

        if !flush(&worker, id, &mut writer).await {
            break;
        }
        if !worker.borrow_mut().on_write_complete(id) {
            break;
        }
    }

    let _ = writer.shutdown().await;
}

/// Writes the session's queued output. Returns false if the write failed and
/// the session was torn down.
async fn flush<W>(worker: &Rc<RefCell<Worker>>, id: SessionId, writer: &mut W) -> bool
where
    W: AsyncWrite + Unpin,
{
    let outbound = worker.borrow_mut().take_outbound(id);
    if outbound.is_empty() {
        return true;
    }
    match write_outbound(writer, outbound).await {
        Ok(()) => true,
        Err(err) => worker
            .borrow_mut()
            .on_event(id, TransportEvent::Error(err)),
    }
}

async fn read_event<R>(
    reader: &mut R,
    buf: &mut BytesMut,
    idle_timeout: Option<Duration>,
) -> Wakeup
where
    R: AsyncRead + Unpin,
{
    buf.clear();
    buf.reserve(READ_CHUNK_SIZE);

    let result = match idle_timeout {
        Some(limit) => match tokio::time::timeout(limit, reader.read_buf(buf)).await {
            Ok(result) => result,
            Err(_) => return Wakeup::Transport(TransportEvent::Timeout),
        },
        None => reader.read_buf(buf).await,
    };

    match result {
        Ok(0) => Wakeup::Transport(TransportEvent::Eof),
        Ok(_) => Wakeup::Data,
        Err(err) => Wakeup::Transport(TransportEvent::Error(err.into())),
    }
}

/// Writes queued segments in order and flushes.
pub async fn write_outbound<W>(writer: &mut W, outbound: Vec<Outbound>) -> Result<(), ConnectionError>
where
    W: AsyncWrite + Unpin,
{
    for chunk in outbound {
        match chunk {
            Outbound::Buffer(buf) => writer.write_all(&buf).await?,
            Outbound::File { file, len } => {
                let mut limited = tokio::fs::File::from_std(file).take(len);
                let sent = tokio::io::copy(&mut limited, writer).await?;
                if sent != len {
                    return Err(ConnectionError::ShortTransfer {
                        sent,
                        expected: len,
                    });
                }
            }
        }
    }
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::server::ServerContext;
    use crate::storage::StorageEngine;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use tokio::net::{TcpListener, TcpStream};
    use tokio::task::LocalSet;

    fn create_worker(config: Config) -> Rc<RefCell<Worker>> {
        let ctx = Arc::new(ServerContext::new(config, Arc::new(StorageEngine::new())));
        Rc::new(RefCell::new(Worker::new(0, ctx)))
    }

    fn peer() -> SocketAddr {
        "127.0.0.1:9000".parse().unwrap()
    }

    #[tokio::test]
    async fn test_fragmented_command() {
        let worker = create_worker(Config::default());
        let mock = tokio_test::io::Builder::new()
            .read(b"*1\r\n$4\r\nPI")
            .read(b"NG\r\n")
            .write(b"+PONG\r\n")
            .build();

        serve_connection(Rc::clone(&worker), mock, peer(), None).await;
        assert!(worker.borrow().is_empty());
    }

    #[tokio::test]
    async fn test_pipelined_replies_in_one_write() {
        let worker = create_worker(Config::default());
        let mock = tokio_test::io::Builder::new()
            .read(b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\nv\r\n*2\r\n$3\r\nGET\r\n$1\r\nk\r\n")
            .write(b"+OK\r\n$1\r\nv\r\n")
            .build();

        serve_connection(Rc::clone(&worker), mock, peer(), None).await;
        let ctx = Arc::clone(worker.borrow().context());
        assert_eq!(ctx.stats.commands_processed.load(Ordering::Relaxed), 2);
        assert_eq!(ctx.stats.active_connections.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_quit_closes_after_reply() {
        let worker = create_worker(Config::default());
        // Nothing after QUIT is read or answered.
        let mock = tokio_test::io::Builder::new()
            .read(b"*1\r\n$4\r\nQUIT\r\n*1\r\n$4\r\nPING\r\n")
            .write(b"+OK\r\n")
            .build();

        serve_connection(Rc::clone(&worker), mock, peer(), None).await;
        assert!(worker.borrow().is_empty());
    }

    #[tokio::test]
    async fn test_protocol_error_reply() {
        let worker = create_worker(Config::default());
        let mock = tokio_test::io::Builder::new()
            .read(b"*1\r\n$x\r\n")
            .write(b"-ERR Protocol error: invalid bulk length\r\n")
            .build();

        serve_connection(Rc::clone(&worker), mock, peer(), None).await;
        assert!(worker.borrow().is_empty());
    }

    #[tokio::test]
    async fn test_read_error_tears_down() {
        let worker = create_worker(Config::default());
        let mock = tokio_test::io::Builder::new()
            .read_error(std::io::Error::from(std::io::ErrorKind::ConnectionReset))
            .build();

        serve_connection(Rc::clone(&worker), mock, peer(), None).await;
        assert!(worker.borrow().is_empty());
    }

    #[tokio::test]
    async fn test_write_outbound_streams_file() {
        let path = std::env::temp_dir().join(format!("sparkkv-write-{}", std::process::id()));
        std::fs::write(&path, b"0123456789").unwrap();
        let file = std::fs::File::open(&path).unwrap();

        let mut out = Vec::new();
        let outbound = vec![
            Outbound::Buffer(BytesMut::from(&b"$4\r\n"[..])),
            Outbound::File { file, len: 4 },
            Outbound::Buffer(BytesMut::from(&b"\r\n"[..])),
        ];
        write_outbound(&mut out, outbound).await.unwrap();
        assert_eq!(out, b"$4\r\n0123\r\n");

        let short = std::fs::File::open(&path).unwrap();
        let err = write_outbound(&mut Vec::new(), vec![Outbound::File { file: short, len: 20 }])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ConnectionError::ShortTransfer {
                sent: 10,
                expected: 20
            }
        ));

        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn test_tcp_pubsub_end_to_end() {
        let local = LocalSet::new();
        local
            .run_until(async {
                let worker = create_worker(Config::default());
                let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
                let addr = listener.local_addr().unwrap();

                let accept_worker = Rc::clone(&worker);
                tokio::task::spawn_local(async move {
                    loop {
                        let (stream, peer) = listener.accept().await.unwrap();
                        tokio::task::spawn_local(serve_connection(
                            Rc::clone(&accept_worker),
                            stream,
                            peer,
                            None,
                        ));
                    }
                });

                let mut subscriber = TcpStream::connect(addr).await.unwrap();
                subscriber
                    .write_all(b"*2\r\n$9\r\nSUBSCRIBE\r\n$4\r\nnews\r\n")
                    .await
                    .unwrap();
                let expected = b"*3\r\n$9\r\nsubscribe\r\n$4\r\nnews\r\n:1\r\n";
                let mut buf = vec![0u8; expected.len()];
                subscriber.read_exact(&mut buf).await.unwrap();
                assert_eq!(&buf[..], &expected[..]);

                let mut publisher = TcpStream::connect(addr).await.unwrap();
                publisher
                    .write_all(b"*3\r\n$7\r\nPUBLISH\r\n$4\r\nnews\r\n$5\r\nhello\r\n")
                    .await
                    .unwrap();
                let mut buf = [0u8; 4];
                publisher.read_exact(&mut buf).await.unwrap();
                assert_eq!(&buf, b":1\r\n");

                let expected = b"*3\r\n$7\r\nmessage\r\n$4\r\nnews\r\n$5\r\nhello\r\n";
                let mut buf = vec![0u8; expected.len()];
                subscriber.read_exact(&mut buf).await.unwrap();
                assert_eq!(&buf[..], &expected[..]);

                drop(subscriber);
                tokio::time::sleep(Duration::from_millis(50)).await;
                assert_eq!(worker.borrow().context().pubsub.channel_count(), 0);
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout_keeps_connection() {
        let worker = create_worker(Config::default());
        let mock = tokio_test::io::Builder::new()
            .wait(Duration::from_secs(5))
            .read(b"*1\r\n$4\r\nPING\r\n")
            .write(b"+PONG\r\n")
            .build();

        serve_connection(
            Rc::clone(&worker),
            mock,
            peer(),
            Some(Duration::from_secs(1)),
        )
        .await;
        assert!(worker.borrow().is_empty());
    }
}
