use crate::packet::PacketHeader;
use crate::util::random::{Random, RngRandom};
use async_trait::async_trait;
use bytes::BytesMut;
#[cfg(test)] use mockall::automock;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::{error, trace};

/// This is an abstraction for a UDP socket, introduced to facilitate mocking the I/O part away
///  for testing
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PacketSocket: Send + Sync + 'static {
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;

    async fn send_to(&self, buf: &[u8], to: SocketAddr) -> io::Result<usize>;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

#[async_trait]
impl PacketSocket for UdpSocket {
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        UdpSocket::recv_from(self, buf).await
    }

    async fn send_to(&self, buf: &[u8], to: SocketAddr) -> io::Result<usize> {
        trace!("UDP socket: sending packet to {:?}", to);
        UdpSocket::send_to(self, buf, to).await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        UdpSocket::local_addr(self)
    }
}

/// The outgoing side of an endpoint's socket, shared by all its connections. Packets from
///  connections are marshalled here and are subject to artificial packet loss if configured.
#[derive(Clone)]
pub struct SendPipeline {
    socket: Arc<dyn PacketSocket>,
    drop_probability: f64,
}

impl SendPipeline {
    pub fn new(socket: Arc<dyn PacketSocket>, drop_probability: f64) -> SendPipeline {
        SendPipeline { socket, drop_probability }
    }

    pub fn socket(&self) -> &Arc<dyn PacketSocket> {
        &self.socket
    }

    fn should_drop<R: Random>(&self) -> bool {
        self.drop_probability > 0.0 && R::gen_f64_range(0.0..1.0) < self.drop_probability
    }

    /// Marshals and sends a packet. Send failures are logged and otherwise ignored: the packet
    ///  counts as lost and is recovered by the resend logic.
    pub async fn send_packet(&self, to: SocketAddr, header: &PacketHeader, payload: &[u8]) {
        if self.should_drop::<RngRandom>() {
            trace!("artificially dropping {:?} to {:?}", header, to);
            return;
        }

        let mut buf = BytesMut::with_capacity(header.serialized_len() + payload.len());
        header.ser(&mut buf);
        buf.extend_from_slice(payload);

        trace!("sending {:?} to {:?}", header, to);
        if let Err(e) = self.socket.send_to(&buf, to).await {
            error!("error sending UDP packet to {:?}: {}", to, e);
        }
    }

    /// sends a raw datagram, bypassing packet marshalling and artificial loss
    pub async fn do_send_packet(&self, to: SocketAddr, packet_buf: &[u8]) -> io::Result<usize> {
        self.socket.send_to(packet_buf, to).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{Extension, PacketType};
    use crate::seq_nr::SeqNr;
    use bytes::Bytes;
    use rstest::rstest;

    fn header() -> PacketHeader {
        PacketHeader {
            packet_type: PacketType::Data,
            connection_id: 17,
            timestamp: 1,
            timestamp_diff: 2,
            window: 3,
            seq_nr: SeqNr::from_raw(4),
            ack_nr: SeqNr::from_raw(5),
            extensions: vec![Extension::selective_ack(&[1])],
        }
    }

    #[rstest]
    #[case::empty(vec![])]
    #[case::payload(vec![9,8,7])]
    #[tokio::test]
    async fn test_send_packet(#[case] payload: Vec<u8>) {
        let to = SocketAddr::from(([1,2,3,4], 9));

        let expected_payload = payload.clone();
        let mut socket = MockPacketSocket::new();
        socket.expect_send_to()
            .withf(move |buf, addr| {
                let mut parse_buf = Bytes::copy_from_slice(buf);
                let parsed = PacketHeader::deser(&mut parse_buf).unwrap();
                parsed == header() && parse_buf.as_ref() == expected_payload.as_slice() && *addr == to
            })
            .times(1)
            .returning(|buf, _| Ok(buf.len()));

        let pipeline = SendPipeline::new(Arc::new(socket), 0.0);
        pipeline.send_packet(to, &header(), &payload).await;
    }

    #[tokio::test]
    async fn test_send_error_is_swallowed() {
        let mut socket = MockPacketSocket::new();
        socket.expect_send_to()
            .times(1)
            .returning(|_, _| Err(io::Error::new(io::ErrorKind::PermissionDenied, "nope")));

        let pipeline = SendPipeline::new(Arc::new(socket), 0.0);
        pipeline.send_packet(SocketAddr::from(([1,2,3,4], 9)), &header(), b"x").await;
    }

    #[tokio::test]
    async fn test_drop_everything() {
        let mut socket = MockPacketSocket::new();
        socket.expect_send_to()
            .never();

        let pipeline = SendPipeline::new(Arc::new(socket), 1.0);
        pipeline.send_packet(SocketAddr::from(([1,2,3,4], 9)), &header(), b"x").await;
    }

    #[tokio::test]
    async fn test_raw_send_bypasses_drop() {
        let to = SocketAddr::from(([1,2,3,4], 9));
        let mut socket = MockPacketSocket::new();
        socket.expect_send_to()
            .withf(move |buf, addr| buf == b"raw" && *addr == to)
            .times(1)
            .returning(|buf, _| Ok(buf.len()));

        let pipeline = SendPipeline::new(Arc::new(socket), 1.0);
        assert_eq!(pipeline.do_send_packet(to, b"raw").await.unwrap(), 3);
    }

    #[rstest]
    #[case::never(0.0, 0.5, false)]
    #[case::below(0.3, 0.2, true)]
    #[case::above(0.3, 0.4, false)]
    fn test_should_drop(#[case] probability: f64, #[case] random: f64, #[case] expected: bool) {
        let _lock = crate::util::random::MOCK_RANDOM_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        let ctx = crate::util::random::MockRandom::gen_f64_range_context();
        ctx.expect().return_const(random);

        let pipeline = SendPipeline::new(Arc::new(MockPacketSocket::new()), probability);
        assert_eq!(pipeline.should_drop::<crate::util::random::MockRandom>(), expected);
    }
}
