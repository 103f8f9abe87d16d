//! Structure layouts and constants of the USB device filesystem, mirrored
//! from linux/usbdevice_fs.h. Only the fields the replay core touches are
//! ever read or written, but the full layouts are kept so that offsets and
//! sizes line up with what clients pass in.

use libc::{c_int, c_uint, c_void};

pub const USBFS_CAP_ZERO_PACKET: u32 = 0x01;
pub const USBFS_CAP_BULK_CONTINUATION: u32 = 0x02;
pub const USBFS_CAP_NO_PACKET_SIZE_LIM: u32 = 0x04;
pub const USBFS_CAP_BULK_SCATTER_GATHER: u32 = 0x08;
pub const USBFS_CAP_REAP_AFTER_DISCONNECT: u32 = 0x10;

/// The capabilities replay advertises. All of them are either no-ops for a
/// recorded trace or satisfied trivially because no real transfer happens.
pub const USBFS_REPLAY_CAPS: u32 = USBFS_CAP_ZERO_PACKET
    | USBFS_CAP_BULK_CONTINUATION
    | USBFS_CAP_NO_PACKET_SIZE_LIM
    | USBFS_CAP_BULK_SCATTER_GATHER
    | USBFS_CAP_REAP_AFTER_DISCONNECT;

pub const USBFS_URB_TYPE_ISO: u8 = 0;
pub const USBFS_URB_TYPE_INTERRUPT: u8 = 1;
pub const USBFS_URB_TYPE_CONTROL: u8 = 2;
pub const USBFS_URB_TYPE_BULK: u8 = 3;

/// Direction bit of an endpoint address. Set means device-to-host (IN).
pub const USB_DIR_IN: u8 = 0x80;

/// The URB structure a client hands to `USBDEVFS_SUBMITURB`. The kernel
/// calls the first field `type`; that is reserved in Rust.
#[repr(C)]
#[allow(non_camel_case_types)]
#[derive(Debug, Copy, Clone)]
pub struct usbdevfs_urb {
    pub typ: u8,
    pub endpoint: u8,
    pub status: c_int,
    pub flags: c_uint,
    pub buffer: *mut c_void,
    pub buffer_length: c_int,
    pub actual_length: c_int,
    pub start_frame: c_int,
    pub number_of_packets: c_int,
    pub error_count: c_int,
    pub signr: c_uint,
    pub usercontext: *mut c_void,
}

pub fn transfer_type_name(typ: u8) -> &'static str {
    match typ {
        USBFS_URB_TYPE_ISO => "isochronous",
        USBFS_URB_TYPE_INTERRUPT => "interrupt",
        USBFS_URB_TYPE_CONTROL => "control",
        USBFS_URB_TYPE_BULK => "bulk",
        _ => "unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::{offset_of, size_of};

    #[test]
    fn urb_layout_matches_kernel() {
        assert_eq!(size_of::<usbdevfs_urb>(), 56);
        assert_eq!(offset_of!(usbdevfs_urb, typ), 0);
        assert_eq!(offset_of!(usbdevfs_urb, endpoint), 1);
        assert_eq!(offset_of!(usbdevfs_urb, status), 4);
        assert_eq!(offset_of!(usbdevfs_urb, buffer), 16);
        assert_eq!(offset_of!(usbdevfs_urb, buffer_length), 24);
        assert_eq!(offset_of!(usbdevfs_urb, actual_length), 28);
        assert_eq!(offset_of!(usbdevfs_urb, start_frame), 32);
    }

    #[test]
    fn advertised_capabilities() {
        assert_eq!(USBFS_REPLAY_CAPS, 0x1f);
    }
}
