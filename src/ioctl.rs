//! Request numbers of the usbdevfs character-device interface.

use crate::usbfs::usbdevfs_urb;

/// Expression that calculates an ioctl number.
///
/// ```ignore
/// const USBDEVFS_IOC: c_uint = 0x55;
/// ioctl_expr!(_IOC_NONE, USBDEVFS_IOC, 0x0b, 0);
/// ```
macro_rules! ioctl_expr {
    ($dir:expr, $ty:expr, $nr:expr, $size:expr) => {
        (($dir << _IOC_DIRSHIFT)
            | ($ty << _IOC_TYPESHIFT)
            | ($nr << _IOC_NRSHIFT)
            | ($size << _IOC_SIZESHIFT)) as ::std::os::raw::c_ulong
    };
}

/// Declare a function that returns an ioctl number.
macro_rules! ioctl_ioc_nr {
    ($name:ident, $dir:expr, $ty:expr, $nr:expr, $size:expr) => {
        #[allow(non_snake_case)]
        #[allow(clippy::cast_lossless)]
        pub fn $name() -> ::std::os::raw::c_ulong {
            ioctl_expr!($dir, $ty, $nr, $size)
        }
    };
}

/// Declare an ioctl that transfers no data.
macro_rules! ioctl_io_nr {
    ($name:ident, $ty:expr, $nr:expr) => {
        ioctl_ioc_nr!($name, _IOC_NONE, $ty, $nr, 0);
    };
}

/// Declare an ioctl that writes data.
macro_rules! ioctl_iow_nr {
    ($name:ident, $ty:expr, $nr:expr, $size:ty) => {
        ioctl_ioc_nr!(
            $name,
            _IOC_WRITE,
            $ty,
            $nr,
            ::std::mem::size_of::<$size>() as u32
        );
    };
}

/// Declare an ioctl that reads data.
macro_rules! ioctl_ior_nr {
    ($name:ident, $ty:expr, $nr:expr, $size:ty) => {
        ioctl_ioc_nr!(
            $name,
            _IOC_READ,
            $ty,
            $nr,
            ::std::mem::size_of::<$size>() as u32
        );
    };
}

// IOC_* constants as defined by the kernel's ioctl encoding. Not much value
// in documenting these individually.
use std::os::raw::{c_uint, c_ulong};

const _IOC_NRBITS: c_uint = 8;
const _IOC_TYPEBITS: c_uint = 8;
const _IOC_SIZEBITS: c_uint = 14;
const _IOC_SIZEMASK: c_uint = (1 << _IOC_SIZEBITS) - 1;
const _IOC_NRSHIFT: c_uint = 0;
const _IOC_TYPESHIFT: c_uint = _IOC_NRSHIFT + _IOC_NRBITS;
const _IOC_SIZESHIFT: c_uint = _IOC_TYPESHIFT + _IOC_TYPEBITS;
const _IOC_DIRSHIFT: c_uint = _IOC_SIZESHIFT + _IOC_SIZEBITS;
const _IOC_NONE: c_uint = 0;
const _IOC_WRITE: c_uint = 1;
const _IOC_READ: c_uint = 2;

/// 'U', the ioctl type of /dev/bus/usb device nodes.
const USBDEVFS_IOC: c_uint = 0x55;

ioctl_ior_nr!(USBDEVFS_RESETEP, USBDEVFS_IOC, 3, c_uint);
ioctl_ior_nr!(USBDEVFS_SUBMITURB, USBDEVFS_IOC, 10, usbdevfs_urb);
ioctl_io_nr!(USBDEVFS_DISCARDURB, USBDEVFS_IOC, 11);
ioctl_iow_nr!(USBDEVFS_REAPURB, USBDEVFS_IOC, 12, *mut ::libc::c_void);
ioctl_iow_nr!(USBDEVFS_REAPURBNDELAY, USBDEVFS_IOC, 13, *mut ::libc::c_void);
ioctl_ior_nr!(USBDEVFS_CLAIMINTERFACE, USBDEVFS_IOC, 15, c_uint);
ioctl_ior_nr!(USBDEVFS_RELEASEINTERFACE, USBDEVFS_IOC, 16, c_uint);
ioctl_io_nr!(USBDEVFS_RESET, USBDEVFS_IOC, 20);
ioctl_ior_nr!(USBDEVFS_CLEAR_HALT, USBDEVFS_IOC, 21, c_uint);
ioctl_ior_nr!(USBDEVFS_GET_CAPABILITIES, USBDEVFS_IOC, 26, u32);

/// Size of the argument structure, as declared in the request encoding.
pub fn request_size(request: c_ulong) -> usize {
    ((request >> _IOC_SIZESHIFT) & _IOC_SIZEMASK as c_ulong) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_numbers() {
        // reference values from a linux/usbdevice_fs.h build on x86_64
        assert_eq!(USBDEVFS_SUBMITURB(), 0x8038_550a);
        assert_eq!(USBDEVFS_DISCARDURB(), 0x0000_550b);
        assert_eq!(USBDEVFS_REAPURB(), 0x4008_550c);
        assert_eq!(USBDEVFS_REAPURBNDELAY(), 0x4008_550d);
        assert_eq!(USBDEVFS_CLAIMINTERFACE(), 0x8004_550f);
        assert_eq!(USBDEVFS_RELEASEINTERFACE(), 0x8004_5510);
        assert_eq!(USBDEVFS_RESET(), 0x0000_5514);
        assert_eq!(USBDEVFS_CLEAR_HALT(), 0x8004_5515);
        assert_eq!(USBDEVFS_GET_CAPABILITIES(), 0x8004_551a);
    }

    #[test]
    fn size_decoding() {
        assert_eq!(request_size(USBDEVFS_SUBMITURB()), 56);
        assert_eq!(request_size(USBDEVFS_REAPURB()), 8);
        assert_eq!(request_size(USBDEVFS_GET_CAPABILITIES()), 4);
        assert_eq!(request_size(USBDEVFS_DISCARDURB()), 0);
    }
}
