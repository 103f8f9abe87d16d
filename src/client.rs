//! Contract between the replay handler and the transport that intercepts
//! ioctls of the client process. The transport owns the mechanics (how the
//! call was trapped, how the client resumes); the handler only sees one
//! pending call at a time and never keeps a client across calls.

use libc::{c_long, c_ulong};

use crate::mem::MemView;
use crate::result::Result;

pub trait IoctlClient {
    /// Request number the client passed to ioctl(2).
    fn request(&self) -> c_ulong;

    /// Resolve client memory behind the ioctl argument. The argument is
    /// treated as a single pointer cell: `offset` must be 0 and `len` bytes
    /// of the pointee are mapped. A zero-length resolution still yields the
    /// raw argument value through [`MemView::client_addr`], which is how
    /// `USBDEVFS_DISCARDURB` identifies its URB.
    fn resolve_arg(
        &mut self,
        offset: usize,
        len: usize,
        readable: bool,
        writable: bool,
    ) -> Result<Box<dyn MemView>>;

    /// Finish the intercepted call with a return value and errno.
    fn complete(&mut self, ret: c_long, errno: i32);
}
