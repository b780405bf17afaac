//! Netlink transport for the IPVS generic netlink family.
//!
//! A single request/acknowledge channel to the kernel. The socket is not
//! concurrency-safe; the owning driver serializes all access.

use bytes::BytesMut;
use common::{Error, Result};
use netlink_packet_core::{
    NetlinkDeserializable, NetlinkMessage, NetlinkPayload, NetlinkSerializable, NLM_F_ACK,
    NLM_F_DUMP, NLM_F_REQUEST,
};
use netlink_packet_generic::{
    ctrl::{nlas::GenlCtrlAttrs, GenlCtrl, GenlCtrlCmd},
    GenlMessage,
};
use netlink_sys::{protocols::NETLINK_GENERIC, Socket, SocketAddr};
use std::fmt;
use std::time::Duration;
use tracing::{debug, trace};

use crate::messages::IpvsMessage;

/// IPVS generic netlink family name
const IPVS_GENL_NAME: &str = "IPVS";

/// Bounded wait for a kernel acknowledgment.
const ACK_TIMEOUT: Duration = Duration::from_secs(5);

/// Netlink socket bound to the IPVS family.
pub struct NetlinkSocket {
    socket: Socket,
    family_id: u16,
    sequence: u32,
    debug: bool,
}

impl NetlinkSocket {
    /// Open a generic netlink socket and resolve the IPVS family ID.
    pub fn new() -> Result<Self> {
        debug!("creating netlink socket for IPVS");

        let mut socket = Socket::new(NETLINK_GENERIC)
            .map_err(|e| Error::netlink(format!("failed to create netlink socket: {e}")))?;

        let addr = SocketAddr::new(0, 0);
        socket
            .bind(&addr)
            .map_err(|e| Error::netlink(format!("failed to bind netlink socket: {e}")))?;

        socket
            .connect(&SocketAddr::new(0, 0))
            .map_err(|e| Error::netlink(format!("failed to connect netlink socket: {e}")))?;

        set_recv_timeout(&socket, ACK_TIMEOUT)?;

        let mut nl_socket = Self {
            socket,
            family_id: 0,
            sequence: 0,
            debug: false,
        };

        nl_socket.family_id = nl_socket.resolve_family_id(IPVS_GENL_NAME)?;
        debug!("IPVS family ID: {}", nl_socket.family_id);

        Ok(nl_socket)
    }

    /// Get the IPVS family ID.
    pub fn family_id(&self) -> u16 {
        self.family_id
    }

    /// Enable or disable message tracing at debug level.
    pub fn set_debug(&mut self, on: bool) {
        self.debug = on;
    }

    pub fn debug(&self) -> bool {
        self.debug
    }

    fn next_sequence(&mut self) -> u32 {
        self.sequence = self.sequence.wrapping_add(1);
        self.sequence
    }

    /// Resolve a generic netlink family name to its ID.
    fn resolve_family_id(&mut self, family_name: &str) -> Result<u16> {
        debug!("resolving generic netlink family: {}", family_name);

        let mut genlmsg: GenlMessage<GenlCtrl> = GenlMessage::from_payload(GenlCtrl {
            cmd: GenlCtrlCmd::GetFamily,
            nlas: vec![GenlCtrlAttrs::FamilyName(family_name.to_string())],
        });

        genlmsg.set_resolved_family_id(libc::GENL_ID_CTRL as u16);

        let mut nlmsg = NetlinkMessage::from(genlmsg);
        nlmsg.header.flags = NLM_F_REQUEST;
        nlmsg.header.sequence_number = self.next_sequence();
        nlmsg.finalize();

        self.send_message(&nlmsg)?;

        let datagram = self.recv_datagram()?;
        let response: NetlinkMessage<GenlMessage<GenlCtrl>> = deserialize_at(&datagram, 0)?;

        match response.payload {
            NetlinkPayload::InnerMessage(genlmsg) => {
                for nla in &genlmsg.payload.nlas {
                    if let GenlCtrlAttrs::FamilyId(id) = nla {
                        trace!("found family ID {} for {}", id, family_name);
                        return Ok(*id);
                    }
                }
                Err(Error::netlink(format!(
                    "family ID not found in response for {family_name}"
                )))
            }
            NetlinkPayload::Error(err) => Err(Error::netlink(format!(
                "netlink error while resolving family: {:?}",
                err.code
            ))),
            _ => Err(Error::netlink("unexpected netlink response type")),
        }
    }

    /// Send an IPVS request and wait for the kernel acknowledgment.
    pub(crate) fn execute(&mut self, msg: IpvsMessage) -> Result<()> {
        self.send_ipvs(msg, NLM_F_REQUEST | NLM_F_ACK)?;

        let datagram = self.recv_datagram()?;
        let response: NetlinkMessage<GenlMessage<IpvsMessage>> = deserialize_at(&datagram, 0)?;

        match response.payload {
            NetlinkPayload::Error(err) => match err.code {
                None => Ok(()),
                Some(code) => Err(Error::KernelReject {
                    errno: code.get().abs(),
                }),
            },
            other => Err(Error::decode(format!(
                "expected acknowledgment, got {other:?}"
            ))),
        }
    }

    /// Send an IPVS request and return its single reply payload.
    pub(crate) fn query(&mut self, msg: IpvsMessage) -> Result<IpvsMessage> {
        self.send_ipvs(msg, NLM_F_REQUEST)?;

        let datagram = self.recv_datagram()?;
        let response: NetlinkMessage<GenlMessage<IpvsMessage>> = deserialize_at(&datagram, 0)?;

        match response.payload {
            NetlinkPayload::InnerMessage(genlmsg) => Ok(genlmsg.payload),
            NetlinkPayload::Error(err) => match err.code {
                Some(code) => Err(Error::KernelReject {
                    errno: code.get().abs(),
                }),
                None => Err(Error::decode("unexpected empty acknowledgment")),
            },
            other => Err(Error::decode(format!("unexpected reply: {other:?}"))),
        }
    }

    /// Send an IPVS dump request and collect every reply payload until the
    /// kernel signals completion.
    pub(crate) fn dump(&mut self, msg: IpvsMessage) -> Result<Vec<IpvsMessage>> {
        self.send_ipvs(msg, NLM_F_REQUEST | NLM_F_DUMP)?;

        let mut entries = Vec::new();
        loop {
            let datagram = self.recv_datagram()?;
            let mut offset = 0;

            // dumps pack several messages per datagram
            while offset < datagram.len() {
                let response: NetlinkMessage<GenlMessage<IpvsMessage>> =
                    deserialize_at(&datagram, offset)
                        .map_err(|e| Error::DumpInterrupted(e.to_string()))?;
                let length = response.header.length as usize;

                match response.payload {
                    NetlinkPayload::Done(_) => return Ok(entries),
                    NetlinkPayload::InnerMessage(genlmsg) => entries.push(genlmsg.payload),
                    NetlinkPayload::Error(err) => {
                        return Err(match err.code {
                            Some(code) => Error::KernelReject {
                                errno: code.get().abs(),
                            },
                            None => Error::DumpInterrupted("error frame without code".to_string()),
                        })
                    }
                    other => {
                        return Err(Error::DumpInterrupted(format!(
                            "unexpected frame: {other:?}"
                        )))
                    }
                }

                if length == 0 {
                    return Err(Error::DumpInterrupted("zero-length frame".to_string()));
                }
                // messages within a datagram are aligned to 4 bytes
                offset += (length + 3) & !3;
            }
        }
    }

    fn send_ipvs(&mut self, msg: IpvsMessage, flags: u16) -> Result<()> {
        let mut genlmsg: GenlMessage<IpvsMessage> = GenlMessage::from_payload(msg);
        genlmsg.set_resolved_family_id(self.family_id);

        let mut nlmsg = NetlinkMessage::from(genlmsg);
        nlmsg.header.flags = flags;
        nlmsg.header.sequence_number = self.next_sequence();
        nlmsg.finalize();

        self.send_message(&nlmsg)
    }

    fn send_message<T>(&mut self, message: &NetlinkMessage<T>) -> Result<()>
    where
        T: NetlinkSerializable + fmt::Debug,
    {
        let mut buf = BytesMut::with_capacity(message.buffer_len());
        buf.resize(message.buffer_len(), 0);
        message.serialize(&mut buf);

        if self.debug {
            debug!("sending netlink message: {:?}", message);
        } else {
            trace!("sending netlink message: {:?}", message);
        }

        self.socket
            .send(&buf[..], 0)
            .map_err(|e| Error::netlink(format!("failed to send netlink message: {e}")))?;

        Ok(())
    }

    fn recv_datagram(&mut self) -> Result<Vec<u8>> {
        match self.socket.recv_from_full() {
            Ok((datagram, _addr)) => {
                if self.debug {
                    debug!("received {} bytes", datagram.len());
                }
                Ok(datagram)
            }
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                Err(Error::timeout("kernel acknowledgment"))
            }
            Err(e) => Err(Error::netlink(format!(
                "failed to receive netlink message: {e}"
            ))),
        }
    }
}

fn deserialize_at<T>(datagram: &[u8], offset: usize) -> Result<NetlinkMessage<T>>
where
    T: NetlinkDeserializable + fmt::Debug,
{
    NetlinkMessage::<T>::deserialize(&datagram[offset..])
        .map_err(|e| Error::decode(format!("failed to parse netlink message: {e}")))
}

fn set_recv_timeout(socket: &Socket, timeout: Duration) -> Result<()> {
    socket2::SockRef::from(socket).set_read_timeout(Some(timeout))?;
    Ok(())
}

impl Drop for NetlinkSocket {
    fn drop(&mut self) {
        trace!("closing netlink socket");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_netlink_socket_creation() {
        // Requires root privileges and the ip_vs kernel module; skipped in
        // CI unless explicitly enabled.
        if std::env::var("IPVS_TEST_ENABLED").is_err() {
            eprintln!("skipping test_netlink_socket_creation (requires IPVS_TEST_ENABLED=1)");
            return;
        }

        let socket = NetlinkSocket::new().expect("failed to create netlink socket");
        assert!(socket.family_id() > 0);
    }
}
