//! The network-layer collaborator of the TCP core.
//!
//! The stack needs exactly two capabilities from the layer below: emit a
//! datagram towards a peer and block for the next inbound datagram. The
//! [MemLink] implementation connects two stacks back to back in memory and
//! records everything it sends, which is what the end-to-end tests drive.

use std::net::Ipv6Addr;
use std::sync::mpsc;
use std::sync::Mutex;

/// One datagram handed up by the network layer.
#[derive(Debug, Clone)]
pub struct Datagram {
    /// Network-layer source address.
    pub src: Ipv6Addr,
    /// Network-layer destination address.
    pub dst: Ipv6Addr,
    /// Interface the datagram arrived on, zero if unspecified.
    pub netif: u16,
    /// The TCP segment carried by the datagram.
    pub bytes: Vec<u8>,
}

/// Datagram emission and reception, provided by the layer below TCP.
///
/// `send` is synchronous and best-effort; `recv` blocks and is only ever
/// called from the stack's ingress task.
pub trait NetLayer: Send + Sync {
    /// Emits `bytes` as one datagram towards `dst`.
    fn send(&self, dst: Ipv6Addr, netif: u16, bytes: &[u8]);

    /// Blocks until the next datagram arrives. `None` means the link is
    /// gone and no further datagrams will ever arrive.
    fn recv(&self) -> Option<Datagram>;

    /// The address the layer would use as the source of outgoing
    /// datagrams, if it has one.
    fn local_addr(&self, netif: u16) -> Option<Ipv6Addr>;
}

/// One endpoint of an in-memory datagram link.
#[derive(Debug)]
pub struct MemLink {
    addr: Ipv6Addr,
    tx: Mutex<mpsc::Sender<Datagram>>,
    rx: Mutex<mpsc::Receiver<Datagram>>,
    sent: Mutex<Vec<Vec<u8>>>,
}

impl MemLink {
    /// Creates two connected endpoints with the given addresses.
    pub fn pair(addr_a: Ipv6Addr, addr_b: Ipv6Addr) -> (MemLink, MemLink) {
        let (tx_ab, rx_ab) = mpsc::channel();
        let (tx_ba, rx_ba) = mpsc::channel();

        (
            MemLink {
                addr: addr_a,
                tx: Mutex::new(tx_ab),
                rx: Mutex::new(rx_ba),
                sent: Mutex::new(Vec::new()),
            },
            MemLink {
                addr: addr_b,
                tx: Mutex::new(tx_ba),
                rx: Mutex::new(rx_ab),
                sent: Mutex::new(Vec::new()),
            },
        )
    }

    /// Every TCP segment this endpoint has emitted, in order.
    pub fn sent_frames(&self) -> Vec<Vec<u8>> {
        self.sent.lock().unwrap().clone()
    }
}

impl NetLayer for MemLink {
    fn send(&self, dst: Ipv6Addr, netif: u16, bytes: &[u8]) {
        self.sent.lock().unwrap().push(bytes.to_vec());

        // A closed far end swallows the datagram; emission is best-effort.
        let _ = self.tx.lock().unwrap().send(Datagram {
            src: self.addr,
            dst,
            netif,
            bytes: bytes.to_vec(),
        });
    }

    fn recv(&self) -> Option<Datagram> {
        self.rx.lock().unwrap().recv().ok()
    }

    fn local_addr(&self, _netif: u16) -> Option<Ipv6Addr> {
        Some(self.addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memlink_delivers_and_records() {
        let (a, b) = MemLink::pair("fc00::1".parse().unwrap(), "fc00::2".parse().unwrap());

        a.send("fc00::2".parse().unwrap(), 0, &[1, 2, 3]);

        let dgram = b.recv().unwrap();
        assert_eq!(dgram.src, "fc00::1".parse::<Ipv6Addr>().unwrap());
        assert_eq!(dgram.dst, "fc00::2".parse::<Ipv6Addr>().unwrap());
        assert_eq!(dgram.bytes, vec![1, 2, 3]);

        assert_eq!(a.sent_frames(), vec![vec![1, 2, 3]]);
    }

    #[test]
    fn memlink_recv_none_after_peer_drop() {
        let (a, b) = MemLink::pair("fc00::1".parse().unwrap(), "fc00::2".parse().unwrap());

        drop(a);
        assert!(b.recv().is_none());
    }
}
