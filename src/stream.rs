use crate::connection::Connection;
use crate::error::UtpResult;
use std::fmt::{Display, Formatter};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::time::Instant;
use tracing::trace;

/// The application's handle to a uTP connection: a reliable, ordered byte stream.
///
/// Dropping a stream without closing it sends a FIN in the background.
pub struct UtpStream {
    conn: Arc<Connection>,
    closed: AtomicBool,
}

impl UtpStream {
    pub(crate) fn new(conn: Arc<Connection>) -> UtpStream {
        UtpStream {
            conn,
            closed: AtomicBool::new(false),
        }
    }

    /// Reads at least one byte. `Ok(0)` signals that the peer finished sending.
    pub async fn read(&self, buf: &mut [u8]) -> UtpResult<usize> {
        self.conn.read(buf).await
    }

    /// reads until the peer closes its side of the connection
    pub async fn read_to_end(&self, out: &mut Vec<u8>) -> UtpResult<usize> {
        let mut buf = vec![0u8; 16 * 1024];
        let mut total = 0;
        loop {
            let n = self.conn.read(&mut buf).await?;
            if n == 0 {
                return Ok(total);
            }
            out.extend_from_slice(&buf[..n]);
            total += n;
        }
    }

    pub async fn write(&self, data: &[u8]) -> UtpResult<usize> {
        self.conn.write(data).await
    }

    /// Sends a FIN and waits until the peer acknowledged everything, or the connection failed
    pub async fn close(&self) -> UtpResult<()> {
        self.closed.store(true, Ordering::Release);
        self.conn.close().await
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.conn.local_addr()
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.conn.remote_addr()
    }

    pub fn set_deadline(&self, deadline: Option<Instant>) {
        self.conn.set_read_deadline(deadline);
        self.conn.set_write_deadline(deadline);
    }

    pub fn set_read_deadline(&self, deadline: Option<Instant>) {
        self.conn.set_read_deadline(deadline);
    }

    pub fn set_write_deadline(&self, deadline: Option<Instant>) {
        self.conn.set_write_deadline(deadline);
    }
}

impl Display for UtpStream {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.conn, f)
    }
}

impl Drop for UtpStream {
    fn drop(&mut self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Ok(handle) = Handle::try_current() {
            trace!("{} dropped without closing - closing in the background", self.conn);
            let conn = self.conn.clone();
            handle.spawn(async move {
                let _ = conn.close().await;
            });
        }
    }
}
