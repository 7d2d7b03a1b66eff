//! Reliable-Send
//!
//! UDP gives no delivery guarantee, and some notifications (timeouts, kicks)
//! have no application-level acknowledgment. The [`Outbound`] handle lets
//! handlers and sweeps queue a message either fire-and-forget or repeated a
//! few times at a fixed interval, without ever blocking the dispatch loop.
//!
//! Messages flow through an mpsc channel to a pump task that owns the
//! socket writes; repeated sends get their own task so the pump stays free.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{error, warn};

/// Hard cap on repeats, whatever the caller asks for.
pub const MAX_REPEATS: u32 = 20;

/// Fixed delay between repeated sends.
pub const REPEAT_INTERVAL: Duration = Duration::from_millis(100);

/// One queued outbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outgoing {
    /// Destination address.
    pub addr: SocketAddr,
    /// Datagram text.
    pub text: String,
    /// Total number of sends; `<= 1` means exactly one.
    pub repeats: u32,
}

/// Cloneable handle for queueing outbound messages.
#[derive(Debug, Clone)]
pub struct Outbound {
    tx: mpsc::Sender<Outgoing>,
}

impl Outbound {
    /// Create a handle and the receiving end for the pump task.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Outgoing>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Queue a single fire-and-forget send.
    pub async fn send(&self, addr: SocketAddr, text: impl Into<String>) {
        self.enqueue(addr, text.into(), 1).await;
    }

    /// Queue a message to be sent `repeats` times, [`REPEAT_INTERVAL`]
    /// apart. Repeats are clamped to [`MAX_REPEATS`].
    pub async fn send_repeated(&self, addr: SocketAddr, text: impl Into<String>, repeats: u32) {
        self.enqueue(addr, text.into(), repeats).await;
    }

    async fn enqueue(&self, addr: SocketAddr, text: String, repeats: u32) {
        if self
            .tx
            .send(Outgoing {
                addr,
                text,
                repeats,
            })
            .await
            .is_err()
        {
            warn!(%addr, "outbound pump is gone, dropping message");
        }
    }
}

/// Drain the outbound queue onto the socket. Repeated messages are resent
/// from a spawned task so one slow notification never delays the rest.
pub async fn pump(socket: Arc<UdpSocket>, mut rx: mpsc::Receiver<Outgoing>) {
    while let Some(outgoing) = rx.recv().await {
        if outgoing.repeats <= 1 {
            write(&socket, &outgoing).await;
            continue;
        }

        let socket = socket.clone();
        tokio::spawn(async move {
            for _ in 0..outgoing.repeats.min(MAX_REPEATS) {
                write(&socket, &outgoing).await;
                tokio::time::sleep(REPEAT_INTERVAL).await;
            }
        });
    }
}

async fn write(socket: &UdpSocket, outgoing: &Outgoing) {
    if let Err(e) = socket.send_to(outgoing.text.as_bytes(), outgoing.addr).await {
        error!(addr = %outgoing.addr, error = %e, "failed to send datagram");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    #[tokio::test]
    async fn test_send_queues_single_message() {
        let (outbound, mut rx) = Outbound::channel(8);
        outbound.send(addr(4000), "i:ALICE").await;

        let outgoing = rx.recv().await.unwrap();
        assert_eq!(outgoing.addr, addr(4000));
        assert_eq!(outgoing.text, "i:ALICE");
        assert_eq!(outgoing.repeats, 1);
    }

    #[tokio::test]
    async fn test_send_repeated_carries_repeat_count() {
        let (outbound, mut rx) = Outbound::channel(8);
        outbound.send_repeated(addr(4000), "e:player-timeout", 3).await;

        let outgoing = rx.recv().await.unwrap();
        assert_eq!(outgoing.repeats, 3);
    }

    #[tokio::test]
    async fn test_pump_repeats_onto_socket() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = receiver.local_addr().unwrap();

        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let (outbound, rx) = Outbound::channel(8);
        let pump_task = tokio::spawn(pump(socket, rx));

        outbound.send_repeated(target, "e:kicked", 2).await;

        let mut buf = [0u8; 64];
        for _ in 0..2 {
            let (len, _) = receiver.recv_from(&mut buf).await.unwrap();
            assert_eq!(&buf[..len], b"e:kicked");
        }

        drop(outbound);
        pump_task.await.unwrap();
    }
}
