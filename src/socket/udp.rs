use std::io;
use std::net::{SocketAddr, IpAddr, Ipv4Addr};
use core::time::Duration;
use super::{EthercatSocket, ETHERCAT_ETHERTYPE};

/**
    UDP socket with fixed port, allowing ethercat com through a regular switch
*/
pub struct UdpSocket {
    socket: std::net::UdpSocket,
    address: SocketAddr,

    filter_address: bool,
}

impl UdpSocket {
    /// according to ETG.1000.4 only IPv4 is supported, and port is fixed, hence this function only requires the host address
    pub fn new(segment: Ipv4Addr) -> io::Result<Self> {
        let address = SocketAddr::new(IpAddr::V4(segment), ETHERCAT_ETHERTYPE);
        let socket = std::net::UdpSocket::bind(SocketAddr::new(
                IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                ETHERCAT_ETHERTYPE,
                ))?;
        Ok(Self {
            address,
            socket,
            filter_address: false,
        })
    }
    /// when enabled, datagrams coming from other hosts than the segment are ignored
    pub fn set_filter_address(&mut self, enable: bool) {
        self.filter_address = enable;
    }
}

impl EthercatSocket for UdpSocket {
    fn receive(&self, data: &mut [u8], timeout: Duration) -> io::Result<Option<usize>> {
        if timeout.is_zero() {
            self.socket.set_nonblocking(true)?;
        }
        else {
            self.socket.set_nonblocking(false)?;
            self.socket.set_read_timeout(Some(timeout))?;
        }
        loop {
            match self.socket.recv_from(data) {
                Ok((size, source)) => {
                    // ignore wrong hosts
                    if self.filter_address && source != self.address  {continue}
                    return Ok(Some(size))
                },
                Err(error) if matches!(error.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
                    => return Ok(None),
                Err(error) => return Err(error),
            }
        }
    }
    fn send(&self, data: &[u8]) -> io::Result<()> {
        self.socket.send_to(data, self.address)?;
        Ok(())
    }
    fn max_frame(&self) -> usize  {1472}
}
