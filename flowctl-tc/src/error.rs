use std::io;

use nix::libc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum KernelError {
    #[error("rtnetlink error: {0}")]
    Rtnetlink(#[from] rtnetlink::Error),
    #[error("IO error: {0:?}")]
    Io(#[from] io::Error),
}

/// How a failed kernel request should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The object to remove or change was not there. Safe to ignore.
    Absent,
    /// Retrying cannot succeed: missing privileges, or the device is gone.
    Fatal,
    /// Anything else. May succeed on the next attempt.
    Transient,
}

impl KernelError {
    /// Returns the errno the kernel answered with, if any.
    pub fn errno(&self) -> Option<i32> {
        match self {
            // Netlink carries errors as negative errno values.
            Self::Rtnetlink(rtnetlink::Error::NetlinkError(msg)) => msg.code.map(|c| -c.get()),
            Self::Io(e) => e.raw_os_error(),
            Self::Rtnetlink(_) => None,
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self.errno() {
            Some(libc::ENOENT | libc::ESRCH) => ErrorClass::Absent,
            Some(libc::EPERM | libc::EACCES | libc::ENODEV | libc::EOPNOTSUPP) => ErrorClass::Fatal,
            _ => ErrorClass::Transient,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroI32;

    use rtnetlink::packet_core::ErrorMessage;

    use super::*;

    fn netlink(errno: i32) -> KernelError {
        let mut msg = ErrorMessage::default();
        msg.code = NonZeroI32::new(-errno);
        KernelError::Rtnetlink(rtnetlink::Error::NetlinkError(msg))
    }

    #[test]
    fn classification() {
        assert_eq!(netlink(libc::ENOENT).class(), ErrorClass::Absent);
        assert_eq!(netlink(libc::EPERM).class(), ErrorClass::Fatal);
        assert_eq!(netlink(libc::EBUSY).class(), ErrorClass::Transient);

        let io = KernelError::Io(io::Error::from_raw_os_error(libc::ENODEV));
        assert_eq!(io.class(), ErrorClass::Fatal);

        let other = KernelError::Io(io::Error::new(io::ErrorKind::Other, "no errno"));
        assert_eq!(other.errno(), None);
        assert_eq!(other.class(), ErrorClass::Transient);
    }
}
