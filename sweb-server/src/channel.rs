//! Shared client-socket handle used across the selector, decode stage, and workers.

use std::io::{Read, Write};
use std::net::Shutdown;
use std::sync::Arc;
use std::time::Duration;

use mio::net::TcpStream;
use sweb_common::error::{SwebError, SwebResult};
use sweb_common::ids::ConnectionId;
use sweb_http::handler::{CancelToken, ResponseSink};

const WRITE_RETRY_PAUSE: Duration = Duration::from_micros(250);

/// One accepted client socket plus its stable identity.
///
/// Clones share the same underlying socket; the file descriptor is released once every owner
/// (selector, decode stage, worker task) has dropped its clone. `shutdown` makes the peer and
/// the readiness loop observe the close immediately, independent of clone lifetimes.
#[derive(Debug, Clone)]
pub struct ClientChannel {
    id: ConnectionId,
    socket: Arc<TcpStream>,
}

impl ClientChannel {
    pub(crate) fn new(id: ConnectionId, socket: TcpStream) -> Self {
        Self {
            id,
            socket: Arc::new(socket),
        }
    }

    /// Stable connection identifier.
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Non-blocking read of one chunk.
    pub(crate) fn read_chunk(&self, chunk: &mut [u8]) -> std::io::Result<usize> {
        (&*self.socket).read(chunk)
    }

    /// Closes both socket directions. Safe to call more than once.
    pub(crate) fn shutdown(&self) {
        let _ = self.socket.shutdown(Shutdown::Both);
    }
}

impl ResponseSink for ClientChannel {
    fn write_response(&self, bytes: &[u8], cancel: &CancelToken) -> SwebResult<()> {
        let mut remaining = bytes;
        while !remaining.is_empty() {
            if cancel.is_cancelled() {
                return Err(SwebError::InvalidState("response write cancelled"));
            }
            match (&*self.socket).write(remaining) {
                Ok(0) => {
                    return Err(SwebError::Io(format!(
                        "peer closed connection {} during response write",
                        self.id
                    )));
                }
                Ok(written) => remaining = &remaining[written..],
                Err(error) if error.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(WRITE_RETRY_PAUSE);
                }
                Err(error) if error.kind() == std::io::ErrorKind::Interrupted => {}
                Err(error) => {
                    return Err(SwebError::Io(format!(
                        "write to connection {} failed: {error}",
                        self.id
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Builds a connected channel plus the peer's blocking client socket.
#[cfg(test)]
pub(crate) fn connected_pair(id: ConnectionId) -> (ClientChannel, std::net::TcpStream) {
    let listener = std::net::TcpListener::bind(std::net::SocketAddr::from(([127, 0, 0, 1], 0)))
        .expect("listener bind should succeed");
    let listen_addr = listener
        .local_addr()
        .expect("listener must expose local addr");
    let client = std::net::TcpStream::connect(listen_addr).expect("connect should succeed");
    let (server_stream, _) = listener.accept().expect("accept should succeed");
    server_stream
        .set_nonblocking(true)
        .expect("accepted socket should be nonblocking");
    (
        ClientChannel::new(id, TcpStream::from_std(server_stream)),
        client,
    )
}

#[cfg(test)]
mod tests {
    use super::connected_pair;
    use googletest::prelude::*;
    use rstest::rstest;
    use std::io::Read;
    use sweb_http::handler::{CancelToken, ResponseSink};

    #[rstest]
    fn write_response_delivers_all_bytes_to_the_peer() {
        let (channel, mut client) = connected_pair(7);

        channel
            .write_response(b"HTTP/1.1 204 No Content\r\n\r\n", &CancelToken::new())
            .expect("write should succeed");
        channel.shutdown();

        let mut received = Vec::new();
        client
            .read_to_end(&mut received)
            .expect("client read should succeed");
        assert_that!(&received, eq(&b"HTTP/1.1 204 No Content\r\n\r\n".to_vec()));
    }

    #[rstest]
    fn write_response_aborts_when_already_cancelled() {
        let (channel, _client) = connected_pair(8);
        let cancel = CancelToken::new();
        cancel.cancel();

        let result = channel.write_response(b"late", &cancel);

        assert_that!(result.is_err(), eq(true));
    }

    #[rstest]
    fn shutdown_is_idempotent_and_visible_to_the_peer() {
        let (channel, mut client) = connected_pair(9);

        channel.shutdown();
        channel.shutdown();

        let mut chunk = [0_u8; 8];
        let read_len = client.read(&mut chunk).expect("peer read should succeed");
        assert_that!(read_len, eq(0_usize));
    }
}
