//! Handshake channel: binds a leased slot to a Unix stream connection.
//!
//! Wire format: the client sends its slot index once, as a native-endian
//! `i32`, immediately after connecting. Nothing else is ever written. The
//! server keeps the connection open for the rest of the lease and treats its
//! closure as the client going away.

use std::io::Write;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::UnixStream;

use crate::allocator::{LeaseId, RevokeReason, SlotAllocator};
use crate::error::{HubError, Violation};

/// Size of the announcement message.
pub const ANNOUNCEMENT_LEN: usize = size_of::<i32>();

/// Connect to the handshake endpoint and announce `index` (client side).
///
/// The returned stream must stay open for as long as the slot is held.
pub fn announce(path: &Path, index: u32) -> Result<StdUnixStream, HubError> {
    let mut stream = StdUnixStream::connect(path).map_err(HubError::endpoint_io)?;
    let index = i32::try_from(index).map_err(|_| Violation::HandshakeOutOfRange)?;
    stream
        .write_all(&index.to_ne_bytes())
        .map_err(HubError::endpoint_io)?;
    tracing::debug!(slot = index, path = %path.display(), "announced slot");
    Ok(stream)
}

/// Read the announced slot index.
pub async fn read_announcement(stream: &mut UnixStream, timeout: Duration) -> Result<i32, Violation> {
    let mut buf = [0u8; ANNOUNCEMENT_LEN];
    match tokio::time::timeout(timeout, stream.read_exact(&mut buf)).await {
        Ok(Ok(_)) => Ok(i32::from_ne_bytes(buf)),
        Ok(Err(_)) | Err(_) => Err(Violation::HandshakeTruncated),
    }
}

/// Validate one handshake connection and hold it for the life of the lease.
///
/// Invalid announcements are logged and the connection is closed. A valid
/// one binds the lease; when the peer closes the connection the lease is
/// revoked so its slot worker reclaims the slot.
pub async fn serve_connection(mut stream: UnixStream, allocator: Arc<SlotAllocator>, timeout: Duration) {
    let peer_pid = stream
        .peer_cred()
        .ok()
        .and_then(|cred| cred.pid())
        .and_then(|pid| u32::try_from(pid).ok());

    let bound = match read_announcement(&mut stream, timeout).await {
        Ok(index) => allocator.bind(index, peer_pid).map(|lease| (index, lease)),
        Err(violation) => Err(violation),
    };
    let (index, lease) = match bound {
        Ok(bound) => bound,
        Err(violation) => {
            tracing::warn!(?peer_pid, %violation, "handshake rejected");
            return;
        }
    };
    let index = index as u32;
    tracing::info!(slot = index, ?peer_pid, %lease, "handshake bound");

    hold(&mut stream).await;
    release(&allocator, index, lease);
}

/// Wait until the peer closes the connection (or breaks it).
async fn hold(stream: &mut UnixStream) {
    let mut sink = [0u8; 64];
    loop {
        match stream.read(&mut sink).await {
            Ok(0) | Err(_) => return,
            // Peers have nothing more to say; ignore stray bytes.
            Ok(_) => continue,
        }
    }
}

fn release(allocator: &SlotAllocator, index: u32, lease: LeaseId) {
    if allocator.revoke(index, lease, RevokeReason::HandshakeClosed) {
        tracing::debug!(slot = index, %lease, "handshake closed before Finish");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::SharedRegion;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::io::AsyncWriteExt;

    fn allocator() -> Arc<SlotAllocator> {
        static COUNTER: AtomicU32 = AtomicU32::new(0);
        let name = format!(
            "/bufhub-hs-{}-{}",
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::Relaxed)
        );
        let region = Arc::new(SharedRegion::create(&name, 2).unwrap());
        Arc::new(SlotAllocator::new(region, Duration::from_secs(5)))
    }

    #[tokio::test]
    async fn announcement_is_native_endian_i32() {
        let (mut client, mut server) = UnixStream::pair().unwrap();
        client.write_all(&5i32.to_ne_bytes()).await.unwrap();
        assert_eq!(read_announcement(&mut server, Duration::from_secs(1)).await, Ok(5));
    }

    #[tokio::test]
    async fn short_announcement_is_truncated() {
        let (mut client, mut server) = UnixStream::pair().unwrap();
        client.write_all(&[1, 2]).await.unwrap();
        drop(client);
        assert_eq!(
            read_announcement(&mut server, Duration::from_secs(1)).await,
            Err(Violation::HandshakeTruncated)
        );
    }

    #[tokio::test]
    async fn silent_peer_times_out() {
        let (_client, mut server) = UnixStream::pair().unwrap();
        assert_eq!(
            read_announcement(&mut server, Duration::from_millis(20)).await,
            Err(Violation::HandshakeTruncated)
        );
    }

    #[tokio::test]
    async fn closing_the_connection_revokes_the_lease() {
        let allocator = allocator();
        let (index, lease) = allocator.allocate(std::process::id()).unwrap();

        let (mut client, server) = UnixStream::pair().unwrap();
        let task = tokio::spawn(serve_connection(server, allocator.clone(), Duration::from_secs(1)));

        client.write_all(&(index as i32).to_ne_bytes()).await.unwrap();
        // Wait for the bind to land.
        while !allocator.lease(index).is_some_and(|l| l.bound) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(allocator.lease(index).map(|l| l.id), Some(lease));

        drop(client);
        task.await.unwrap();
        assert_eq!(
            allocator.reclaim_reason(index, std::time::Instant::now()),
            Some(RevokeReason::HandshakeClosed)
        );
    }

    #[tokio::test]
    async fn peer_that_does_not_own_the_slot_is_closed() {
        let allocator = allocator();
        // Leased to some other process; the peer credentials will say us.
        let (index, _) = allocator.allocate(std::process::id() + 1).unwrap();

        let (mut client, server) = UnixStream::pair().unwrap();
        let task = tokio::spawn(serve_connection(server, allocator.clone(), Duration::from_secs(1)));

        client.write_all(&(index as i32).to_ne_bytes()).await.unwrap();
        task.await.unwrap();

        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);
        let lease = allocator.lease(index).unwrap();
        assert!(!lease.bound);
        assert_eq!(allocator.reclaim_reason(index, std::time::Instant::now()), None);
    }

    #[tokio::test]
    async fn inactive_slot_is_rejected_and_closed() {
        let allocator = allocator();
        let (mut client, server) = UnixStream::pair().unwrap();
        let task = tokio::spawn(serve_connection(server, allocator.clone(), Duration::from_secs(1)));

        client.write_all(&1i32.to_ne_bytes()).await.unwrap();
        task.await.unwrap();

        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);
        assert_eq!(allocator.lease(1), None);
    }
}
