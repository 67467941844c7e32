//! The boundary to the raw Ethernet link.

use crate::error::Error;
use core::time::Duration;

/// A raw layer 2 link the master transmits EtherCAT frames through.
///
/// Implementations send and receive whole Ethernet frames on a single
/// interface. A ready made `AF_PACKET` implementation for Linux is provided by
/// [`RawSocketLink`](crate::std::RawSocketLink); tests drive the master
/// through an in-memory implementation.
///
/// The master calls [`receive`](Link::receive) from whichever thread is
/// currently waiting for a response, so implementations must be usable through
/// a shared reference.
pub trait Link: Send + Sync {
    /// Transmit one Ethernet frame.
    fn send(&self, frame: &[u8]) -> Result<(), Error>;

    /// Receive one Ethernet frame into `buf`, waiting at most `timeout`.
    ///
    /// Returns the frame length on success, [`Error::Timeout`] if nothing
    /// arrived in time, or [`Error::ReceiveFrame`] if the link is down.
    fn receive(&self, buf: &mut [u8], timeout: Duration) -> Result<usize, Error>;
}

impl<T: Link + ?Sized> Link for &T {
    fn send(&self, frame: &[u8]) -> Result<(), Error> {
        (**self).send(frame)
    }

    fn receive(&self, buf: &mut [u8], timeout: Duration) -> Result<usize, Error> {
        (**self).receive(buf, timeout)
    }
}

impl<T: Link + ?Sized> Link for Box<T> {
    fn send(&self, frame: &[u8]) -> Result<(), Error> {
        (**self).send(frame)
    }

    fn receive(&self, buf: &mut [u8], timeout: Duration) -> Result<usize, Error> {
        (**self).receive(buf, timeout)
    }
}

/// Cable redundancy over two NICs wired to either end of the segment.
///
/// Frames are transmitted on both links; the first response wins. The
/// datagram engine is oblivious: index and working counter semantics are
/// identical to a single link.
pub struct RedundantLink<P, S> {
    primary: P,
    secondary: S,
}

impl<P: Link, S: Link> RedundantLink<P, S> {
    /// Create a redundant link from a primary and a secondary NIC.
    pub fn new(primary: P, secondary: S) -> Self {
        Self { primary, secondary }
    }
}

impl<P: Link, S: Link> Link for RedundantLink<P, S> {
    fn send(&self, frame: &[u8]) -> Result<(), Error> {
        let first = self.primary.send(frame);
        let second = self.secondary.send(frame);

        // One working path is enough to keep the segment alive.
        first.or(second)
    }

    fn receive(&self, buf: &mut [u8], timeout: Duration) -> Result<usize, Error> {
        // Alternate short polls between the two links until the deadline.
        let slice = Duration::from_micros(200).min(timeout);
        let deadline = std::time::Instant::now() + timeout;

        loop {
            match self.primary.receive(buf, slice) {
                Err(Error::Timeout) => (),
                other => return other,
            }

            match self.secondary.receive(buf, slice) {
                Err(Error::Timeout) => (),
                other => return other,
            }

            if std::time::Instant::now() >= deadline {
                return Err(Error::Timeout);
            }
        }
    }
}
