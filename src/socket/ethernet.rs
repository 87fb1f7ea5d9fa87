use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use core::time::Duration;
use packed_struct::prelude::*;
use super::{EthercatSocket, ETHERCAT_ETHERTYPE};


/// source and destination address put in every ethernet frame, ethercat slaves do not care about it
const MAC_ADDRESS: [u8; 6] = [0x10, 0x10, 0x10, 0x10, 0x10, 0x10];
/// ethernet frames are padded to this minimum size (without checksum)
const MIN_ETHERNET_FRAME: usize = 60;
/// ethernet payload, ethercat frames must fit in
const MAX_ETHERNET_PAYLOAD: usize = 1500;
const ETHERNET_HEADER: usize = 14;

/**
    Raw socket allowing direct ethercat com, but only one segment on the ethernet network

    Raw sockets are not implemented in std::net, so here is an implementation found in `smoltcp` and `ethercrab`.
    This implementation is unix-specific
*/
#[derive(Debug)]
pub struct EthernetSocket {
    protocol: libc::c_ushort,
    lower: libc::c_int,
    ifreq: ifreq,
}

impl EthernetSocket {
    pub fn new(interface: &str) -> io::Result<Self> {
        let protocol = ETHERCAT_ETHERTYPE;

        // create
        let lower = unsafe {
            let lower = libc::socket(
                // Ethernet II frames
                libc::AF_PACKET,
                libc::SOCK_RAW,
                protocol.to_be() as i32,
            );
            if lower == -1 {
                return Err(io::Error::last_os_error());
            }
            lower
        };

        let mut new = EthernetSocket {
            protocol,
            lower,
            ifreq: ifreq_for(interface),
        };

        // bind
        let sockaddr = libc::sockaddr_ll {
            sll_family: libc::AF_PACKET as u16,
            sll_protocol: new.protocol.to_be(),
            sll_ifindex: ifreq_ioctl(new.lower, &mut new.ifreq, libc::SIOCGIFINDEX)?,
            sll_hatype: 1,
            sll_pkttype: 0,
            sll_halen: 6,
            sll_addr: [0; 8],
        };

        unsafe {
            let res = libc::bind(
                new.lower,
                &sockaddr as *const libc::sockaddr_ll as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            );
            if res == -1 {
                return Err(io::Error::last_os_error());
            }
        }

        Ok(new)
    }

    /// wait for the socket to be readable, return false if the timeout expired
    fn wait_readable(&self, timeout: Duration) -> io::Result<bool> {
        let mut poll = libc::pollfd {
            fd: self.lower,
            events: libc::POLLIN,
            revents: 0,
        };
        let timeout = libc::timespec {
            tv_sec: timeout.as_secs() as libc::time_t,
            tv_nsec: timeout.subsec_nanos() as libc::c_long,
        };
        let res = unsafe { libc::ppoll(&mut poll, 1, &timeout, std::ptr::null()) };
        if res < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(res > 0 && poll.revents & libc::POLLIN != 0)
    }
}

impl Drop for EthernetSocket {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.lower);
        }
    }
}

impl AsRawFd for EthernetSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.lower
    }
}

impl EthercatSocket for EthernetSocket {
    fn receive(&self, data: &mut [u8], timeout: Duration) -> io::Result<Option<usize>> {
        let mut packed = [0u8; ETHERNET_HEADER + MAX_ETHERNET_PAYLOAD];
        loop {
            if ! self.wait_readable(timeout)?
                {return Ok(None)}
            let len = unsafe {
                libc::read(
                    self.as_raw_fd(),
                    packed.as_mut_ptr() as *mut libc::c_void,
                    packed.len(),
                )
            };
            if len < 0 {
                return Err(io::Error::last_os_error());
            }
            let len = len as usize;
            if len < ETHERNET_HEADER  {continue}
            let header = EthernetHeader::unpack_from_slice(&packed[.. ETHERNET_HEADER])
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "malformed ethernet header"))?;
            // frames sent by this socket are also looped back on some interfaces
            if header.ty != ETHERCAT_ETHERTYPE  {continue}

            let content = &packed[ETHERNET_HEADER .. len];
            if content.len() > data.len() {
                return Err(io::Error::new(io::ErrorKind::InvalidData, "received frame exceeds buffer"));
            }
            data[.. content.len()].copy_from_slice(content);
            log::trace!("received {:02x?}", content);
            return Ok(Some(content.len()));
        }
    }
    fn send(&self, data: &[u8]) -> io::Result<()> {
        let mut packed = heapless::Vec::<u8, {ETHERNET_HEADER + MAX_ETHERNET_PAYLOAD}>::new();
        let header = EthernetHeader {
            dst: MAC_ADDRESS,
            src: MAC_ADDRESS,
            // vlan is said to be optional and this is not present in most ethercat frames, so will not be used here
            ty: ETHERCAT_ETHERTYPE,
            }.pack()
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "cannot pack ethernet header"))?;
        packed.extend_from_slice(&header)
            .and_then(|_| packed.extend_from_slice(data))
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "frame exceeds ethernet payload"))?;
        if packed.len() < MIN_ETHERNET_FRAME {
            packed.resize(MIN_ETHERNET_FRAME, 0)
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "cannot pad frame"))?;
        }
        let data = packed.as_slice();

        let len = unsafe {
            libc::write(
                self.as_raw_fd(),
                data.as_ptr() as *const libc::c_void,
                data.len(),
            )
        };
        if len < 0 || (len as usize) != data.len() {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }
    fn max_frame(&self) -> usize  {MAX_ETHERNET_PAYLOAD}
}


// intermediate C-like structures and functions

#[repr(C)]
#[derive(Debug)]
#[allow(non_camel_case_types)]
struct ifreq {
    ifr_name: [libc::c_char; libc::IF_NAMESIZE],
    ifr_data: libc::c_int, /* ifr_ifindex or ifr_mtu */
}

fn ifreq_ioctl(
    lower: libc::c_int,
    ifreq: &mut ifreq,
    cmd: libc::c_ulong,
) -> io::Result<libc::c_int> {
    unsafe {
        let res = libc::ioctl(lower, cmd as _, ifreq as *mut ifreq);

        if res == -1 {
            return Err(io::Error::last_os_error());
        }
    }

    Ok(ifreq.ifr_data)
}

fn ifreq_for(name: &str) -> ifreq {
    let mut ifreq = ifreq {
        ifr_name: [0; libc::IF_NAMESIZE],
        ifr_data: 0,
    };
    for (i, byte) in name.as_bytes().iter().take(libc::IF_NAMESIZE - 1).enumerate() {
        ifreq.ifr_name[i] = *byte as libc::c_char
    }
    ifreq
}



#[derive(PackedStruct, Clone, Debug)]
#[packed_struct(size_bytes="14", bit_numbering = "msb0", endian = "msb")]
struct EthernetHeader {
    #[packed_field(bytes="0:5")]  dst: [u8;6],
    #[packed_field(bytes="6:11")]  src: [u8;6],
    // vlan is said to be optional and this is not present in most ethercat frames, so will not be used here
    #[packed_field(bytes="12:13")]  ty: u16,
}
