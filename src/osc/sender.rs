//! Pooled OSC sender.
//!
//! Clients and plugins are addressed by their localhost port alone, so one
//! ephemeral UDP socket serves every outgoing message. Sends are best-effort:
//! failures are logged and never retried.

use rosc::{encoder, OscMessage, OscPacket, OscType};
use std::net::UdpSocket;

pub struct OscSender {
    socket: UdpSocket,
}

impl OscSender {
    pub fn new() -> std::io::Result<Self> {
        let socket = UdpSocket::bind("127.0.0.1:0")?;
        Ok(Self { socket })
    }

    /// Send one message to a localhost port.
    pub fn send(&self, port: u16, addr: &str, args: Vec<OscType>) {
        let packet = OscPacket::Message(OscMessage {
            addr: addr.to_string(),
            args,
        });
        let encoded = match encoder::encode(&packet) {
            Ok(encoded) => encoded,
            Err(err) => {
                tracing::warn!(addr, %err, "failed to encode OSC message");
                return;
            }
        };
        if let Err(err) = self.socket.send_to(&encoded, ("127.0.0.1", port)) {
            tracing::warn!(addr, port, %err, "failed to send OSC message");
        }
    }

    /// Forward an already-parsed message verbatim.
    pub fn forward(&self, port: u16, message: &OscMessage) {
        self.send(port, &message.addr, message.args.clone());
    }
}
