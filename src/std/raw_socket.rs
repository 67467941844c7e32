//! An `AF_PACKET` socket bound to a named interface, restricted to the
//! EtherCAT EtherType.

use crate::{error::Error, link::Link, ETHERCAT_ETHERTYPE};
use core::time::Duration;
use std::io;
use std::os::unix::io::RawFd;

#[repr(C)]
struct ifreq {
    ifr_name: [libc::c_char; libc::IF_NAMESIZE],
    ifr_ifindex: libc::c_int,
}

fn ifreq_for(name: &str) -> ifreq {
    let mut req = ifreq {
        ifr_name: [0; libc::IF_NAMESIZE],
        ifr_ifindex: 0,
    };

    for (dst, src) in req.ifr_name.iter_mut().zip(name.as_bytes()) {
        *dst = *src as libc::c_char;
    }

    req
}

/// A raw layer 2 socket usable as the master's [`Link`].
///
/// The socket is non-blocking; receive timeouts are implemented with
/// `ppoll(2)` so sub-millisecond timeouts keep their resolution.
#[derive(Debug)]
pub struct RawSocketLink {
    fd: RawFd,
}

impl RawSocketLink {
    /// Open a raw socket on the named interface, e.g. `"eth0"`.
    ///
    /// Requires `CAP_NET_RAW` or root.
    pub fn open(interface: &str) -> Result<Self, Error> {
        let protocol = ETHERCAT_ETHERTYPE.to_be() as libc::c_int;

        let fd = unsafe {
            libc::socket(
                libc::AF_PACKET,
                libc::SOCK_RAW | libc::SOCK_NONBLOCK,
                protocol,
            )
        };

        if fd == -1 {
            log::error!("Raw socket open: {}", io::Error::last_os_error());

            return Err(Error::SendFrame);
        }

        let link = Self { fd };

        let mut req = ifreq_for(interface);

        let res = unsafe { libc::ioctl(fd, libc::SIOCGIFINDEX, &mut req) };

        if res == -1 {
            log::error!(
                "Interface {} lookup: {}",
                interface,
                io::Error::last_os_error()
            );

            return Err(Error::SendFrame);
        }

        let sockaddr = libc::sockaddr_ll {
            sll_family: libc::AF_PACKET as u16,
            sll_protocol: protocol as u16,
            sll_ifindex: req.ifr_ifindex,
            sll_hatype: 1,
            sll_pkttype: 0,
            sll_halen: 6,
            sll_addr: [0; 8],
        };

        let res = unsafe {
            libc::bind(
                fd,
                &sockaddr as *const libc::sockaddr_ll as *const libc::sockaddr,
                core::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        };

        if res == -1 {
            log::error!("Raw socket bind: {}", io::Error::last_os_error());

            return Err(Error::SendFrame);
        }

        Ok(link)
    }
}

impl Link for RawSocketLink {
    fn send(&self, frame: &[u8]) -> Result<(), Error> {
        let sent = unsafe {
            libc::send(
                self.fd,
                frame.as_ptr() as *const libc::c_void,
                frame.len(),
                0,
            )
        };

        if sent == -1 {
            return Err(Error::SendFrame);
        }

        let sent = sent as usize;

        if sent != frame.len() {
            return Err(Error::PartialSend {
                len: frame.len(),
                sent,
            });
        }

        Ok(())
    }

    fn receive(&self, buf: &mut [u8], timeout: Duration) -> Result<usize, Error> {
        let mut fds = libc::pollfd {
            fd: self.fd,
            events: libc::POLLIN,
            revents: 0,
        };

        let ts = libc::timespec {
            tv_sec: timeout.as_secs() as libc::time_t,
            tv_nsec: libc::c_long::from(timeout.subsec_nanos() as i32),
        };

        let ready = unsafe { libc::ppoll(&mut fds, 1, &ts, core::ptr::null()) };

        match ready {
            -1 => Err(Error::ReceiveFrame),
            0 => Err(Error::Timeout),
            _ => {
                let len = unsafe {
                    libc::recv(self.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0)
                };

                if len == -1 {
                    let errno = io::Error::last_os_error();

                    if errno.kind() == io::ErrorKind::WouldBlock {
                        return Err(Error::Timeout);
                    }

                    return Err(Error::ReceiveFrame);
                }

                Ok(len as usize)
            }
        }
    }
}

impl Drop for RawSocketLink {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}
