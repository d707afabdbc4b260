//! Pull-based work dispenser.
//!
//! Array tasks spawned by the batch scheduler connect, send `getjob`, and
//! receive the path of one waiting work item (or an empty body when none are
//! left). One request per connection; the server closes it after replying.
//!
//! This decouples how many tasks the scheduler runs from which file each
//! task processes. Claimed items stay `Dispatched` until their batch is
//! reconciled, even if the worker dies before using them.

pub mod server;

use std::ffi::OsString;
use std::net::SocketAddr;
use std::os::unix::ffi::OsStringExt;
use std::path::PathBuf;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

pub use server::{handle_connection, DispenserHandle, DispenserServer, Outcome, GETJOB};

/// Worker side of the protocol: claim one item from a dispenser.
///
/// Returns `None` when the dispenser has nothing waiting.
pub async fn request_job(addr: SocketAddr) -> std::io::Result<Option<PathBuf>> {
    let mut stream = TcpStream::connect(addr).await?;
    stream.write_all(GETJOB.as_bytes()).await?;

    let mut body = Vec::new();
    stream.read_to_end(&mut body).await?;
    if body.is_empty() {
        Ok(None)
    } else {
        Ok(Some(PathBuf::from(OsString::from_vec(body))))
    }
}
