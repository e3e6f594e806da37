use std::io;

use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error};

use crate::error::{Error, Result};

/// Wraps a bound `TcpListener`, retrying the transient accept errors a busy
/// proxy is expected to see under load instead of tearing down the whole
/// engine for them (module A). Modeled on the teacher's `Listener::accept`.
pub struct Listener {
    pub address: String,
    inner: TcpListener,
}

impl Listener {
    pub async fn bind(address: String) -> Result<Self> {
        let inner = TcpListener::bind(&address).await?;
        Ok(Listener { address, inner })
    }

    /// Accepts the next connection, looping past recoverable errno values
    /// (`ECONNABORTED`, `EMFILE`/`ENFILE`, `ENOBUFS`/`ENOMEM`, `EPROTO`,
    /// `EINTR`). Any other error is treated as fatal for this listener.
    pub async fn accept(&self) -> Result<TcpStream> {
        loop {
            match self.inner.accept().await {
                Ok((sock, remote_addr)) => {
                    debug!(%remote_addr, server = %self.address, "accept connection");
                    return Ok(sock);
                }
                Err(e) => {
                    if is_recoverable(&e) {
                        error!(%e, server = %self.address, "accept error, retrying");
                        continue;
                    }
                    return Err(Error::from(e));
                }
            }
        }
    }
}

#[cfg(unix)]
fn is_recoverable(e: &io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(
            libc::ECONNABORTED
                | libc::EMFILE
                | libc::ENFILE
                | libc::ENOBUFS
                | libc::ENOMEM
                | libc::EPROTO
                | libc::EINTR
        )
    )
}

#[cfg(not(unix))]
fn is_recoverable(_e: &io::Error) -> bool {
    false
}
