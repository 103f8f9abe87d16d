//! Offline reader for usbmon recordings.
//!
//! A recording is a legacy pcap file whose link type must be
//! `DLT_USB_LINUX_MMAPPED`: every packet starts with the 64-byte binary
//! `usbmon_packet` header, optionally followed by captured transfer bytes.
//! Records are handed out in capture order; the replay core keeps its own
//! one-record look-ahead on top of this reader.

use pcap_parser::traits::PcapReaderIterator;
use pcap_parser::{LegacyPcapReader, PcapBlockOwned, PcapError};
use simple_error::{bail, try_with};
use std::fs::File;
use std::path::Path;
use std::time::Duration;

use crate::result::Result;

/// Link type of usbmon captures taken from /sys/kernel/debug/usb/usbmon/*u
/// with a 64-byte binary header per packet.
pub const DLT_USB_LINUX_MMAPPED: i32 = 220;

/// Size of [`usbmon_packet`] on the wire.
pub const USBMON_HDR_LEN: usize = 64;

/// The binary header usbmon prepends to every captured URB event. Field
/// names follow the kernel; `type` is called `event_type` here. Values are
/// in the byte order of the recording host and are never swapped.
#[repr(C)]
#[allow(non_camel_case_types)]
#[derive(Debug, Default, Copy, Clone)]
pub struct usbmon_packet {
    pub id: u64,
    pub event_type: u8,
    pub xfer_type: u8,
    pub epnum: u8,
    pub devnum: u8,
    pub busnum: u16,
    pub flag_setup: i8,
    pub flag_data: i8,
    pub ts_sec: i64,
    pub ts_usec: i32,
    pub status: i32,
    /// Length of the URB (`urb_len`).
    pub length: u32,
    /// Captured payload bytes following the header (`data_len`).
    pub len_cap: u32,
    pub setup: [u8; 8],
    pub interval: i32,
    pub start_frame: i32,
    pub xfer_flags: u32,
    pub ndesc: u32,
}

pub const EVENT_SUBMIT: u8 = b'S';
pub const EVENT_COMPLETE: u8 = b'C';
pub const EVENT_ERROR: u8 = b'E';

impl usbmon_packet {
    pub fn is_in(&self) -> bool {
        self.epnum & crate::usbfs::USB_DIR_IN != 0
    }

    /// Endpoint number without the direction bit.
    pub fn ep(&self) -> u8 {
        self.epnum & !crate::usbfs::USB_DIR_IN
    }

    pub fn as_bytes(&self) -> [u8; USBMON_HDR_LEN] {
        // Safe because the struct is repr(C), Copy and exactly 64 bytes.
        unsafe { std::mem::transmute(*self) }
    }
}

/// One record of the recording: packet-header timestamp plus the captured
/// bytes (usbmon header and payload).
#[derive(Debug, Clone)]
pub struct Record {
    /// Capture timestamp from the pcap packet header.
    pub time: Duration,
    data: Vec<u8>,
}

impl Record {
    fn new(time: Duration, data: Vec<u8>) -> Result<Record> {
        if data.len() < USBMON_HDR_LEN {
            bail!(
                "malformed recording: captured record of {}b is shorter than the usbmon header",
                data.len()
            );
        }
        Ok(Record { time, data })
    }

    pub fn usb(&self) -> usbmon_packet {
        // Safe because Record::new checked that at least 64 bytes are there.
        unsafe { std::ptr::read_unaligned(self.data.as_ptr() as *const usbmon_packet) }
    }

    /// Captured transfer bytes. `len_cap` long, clamped to what the capture
    /// actually holds.
    pub fn payload(&self) -> &[u8] {
        let len = self.usb().len_cap as usize;
        let end = USBMON_HDR_LEN.saturating_add(len).min(self.data.len());
        &self.data[USBMON_HDR_LEN..end]
    }
}

/// Pull-based reader over a recording file.
pub struct Recording {
    reader: LegacyPcapReader<File>,
}

impl std::fmt::Debug for Recording {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Recording").finish_non_exhaustive()
    }
}

impl Recording {
    /// Open a recording and verify its link type. Anything that is not
    /// `DLT_USB_LINUX_MMAPPED` cannot be replayed and fails here.
    pub fn open(path: &Path) -> Result<Recording> {
        let file = try_with!(File::open(path), "cannot open {}", path.display());
        let reader = match LegacyPcapReader::new(65536, file) {
            Ok(reader) => reader,
            Err(e) => bail!("cannot read pcap header of {}: {:?}", path.display(), e),
        };
        let mut recording = Recording { reader };
        recording.check_linktype()?;
        Ok(recording)
    }

    fn check_linktype(&mut self) -> Result<()> {
        loop {
            match self.reader.next() {
                Ok((offset, PcapBlockOwned::LegacyHeader(hdr))) => {
                    let linktype = hdr.network.0;
                    self.reader.consume(offset);
                    if linktype != DLT_USB_LINUX_MMAPPED {
                        bail!(
                            "recording has link type {} but only DLT_USB_LINUX_MMAPPED ({}) can be replayed",
                            linktype,
                            DLT_USB_LINUX_MMAPPED
                        );
                    }
                    return Ok(());
                }
                Ok((_, _)) => bail!("recording does not start with a pcap file header"),
                Err(PcapError::Incomplete) => {
                    if let Err(e) = self.reader.refill() {
                        bail!("cannot refill pcap buffer: {:?}", e);
                    }
                }
                Err(e) => bail!("cannot read pcap header: {:?}", e),
            }
        }
    }

    /// Next record in capture order, or `None` at the end of the recording.
    pub fn next_record(&mut self) -> Result<Option<Record>> {
        loop {
            match self.reader.next() {
                Ok((offset, PcapBlockOwned::Legacy(block))) => {
                    let time =
                        Duration::new(u64::from(block.ts_sec), block.ts_usec.saturating_mul(1000));
                    let record = Record::new(time, block.data.to_vec());
                    self.reader.consume(offset);
                    return record.map(Some);
                }
                Ok((offset, _)) => {
                    // duplicate file header; nothing a legacy pcap should contain
                    self.reader.consume(offset);
                }
                Err(PcapError::Eof) => return Ok(None),
                Err(PcapError::Incomplete) => {
                    if let Err(e) = self.reader.refill() {
                        bail!("cannot refill pcap buffer: {:?}", e);
                    }
                }
                Err(e) => bail!("cannot read pcap record: {:?}", e),
            }
        }
    }
}
