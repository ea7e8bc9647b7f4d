//! A ready-made UDP implementation of [`NonBlockingSocket`].

use std::{
    io::ErrorKind,
    net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket},
};

use tracing::warn;

use crate::network::messages::Message;
use crate::wire;
use crate::NonBlockingSocket;

const RECV_BUFFER_SIZE: usize = 4096;

/// A simple non-blocking UDP socket for sessions. Listens on 0.0.0.0 at a
/// given port. Malformed incoming datagrams are silently dropped, as the
/// internet sprays arbitrary bytes at any open UDP port.
#[derive(Debug)]
pub struct UdpNonBlockingSocket {
    socket: UdpSocket,
    recv_buffer: [u8; RECV_BUFFER_SIZE],
}

impl UdpNonBlockingSocket {
    /// Binds a UDP socket to 0.0.0.0:`port` and sets it to non-blocking
    /// mode.
    pub fn bind_to_port(port: u16) -> Result<Self, std::io::Error> {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
        let socket = UdpSocket::bind(addr)?;
        socket.set_nonblocking(true)?;
        Ok(Self {
            socket,
            recv_buffer: [0; RECV_BUFFER_SIZE],
        })
    }
}

impl NonBlockingSocket<SocketAddr> for UdpNonBlockingSocket {
    fn send_to(&mut self, msg: &Message, addr: &SocketAddr) {
        let buf = wire::encode(msg);
        if let Err(err) = self.socket.send_to(&buf, addr) {
            if err.kind() != ErrorKind::WouldBlock {
                warn!(%addr, %err, "failed to send message");
            }
        }
    }

    fn receive_all_messages(&mut self) -> Vec<(SocketAddr, Message)> {
        let mut received_messages = Vec::with_capacity(4);
        loop {
            match self.socket.recv_from(&mut self.recv_buffer) {
                Ok((number_of_bytes, src_addr)) => {
                    if let Ok(msg) = wire::decode::<Message>(&self.recv_buffer[..number_of_bytes]) {
                        received_messages.push((src_addr, msg));
                    }
                }
                // there are no more messages
                Err(ref err) if err.kind() == ErrorKind::WouldBlock => return received_messages,
                // datagram sockets sometimes report this as a result of an
                // earlier send_to towards a closed port
                Err(ref err) if err.kind() == ErrorKind::ConnectionReset => continue,
                Err(err) => {
                    warn!(kind = ?err.kind(), %err, "unexpected socket error");
                    return received_messages;
                }
            }
        }
    }
}
