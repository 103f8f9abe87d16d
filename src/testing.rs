//! In-process doubles for the consumed contracts, so the handler can be
//! driven without a traced client process: a fake client address space, a
//! fake intercepted ioctl, and a builder for synthetic recordings.

use libc::{c_long, c_ulong};
use simple_error::{bail, require_with};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::mem::{offset_of, size_of};
use std::rc::Rc;

use crate::client::IoctlClient;
use crate::mem::{read_u64, MemView};
use crate::recording::{usbmon_packet, DLT_USB_LINUX_MMAPPED, USBMON_HDR_LEN};
use crate::result::Result;
use crate::usbfs::usbdevfs_urb;

/// A fake client address space made of explicitly placed regions.
#[derive(Clone, Default)]
pub struct FakeClientMem {
    regions: Rc<RefCell<BTreeMap<u64, Vec<u8>>>>,
}

impl FakeClientMem {
    pub fn new() -> FakeClientMem {
        FakeClientMem::default()
    }

    pub fn add_region(&self, addr: u64, bytes: Vec<u8>) {
        self.regions.borrow_mut().insert(addr, bytes);
    }

    /// Bytes currently stored at `addr`. Panics on unmapped ranges, which
    /// in a test means the setup is wrong.
    pub fn read(&self, addr: u64, len: usize) -> Vec<u8> {
        match self.locate(addr, len) {
            Some((base, offset)) => self.regions.borrow()[&base][offset..offset + len].to_vec(),
            None => panic!("no fake region maps 0x{:x}+{}", addr, len),
        }
    }

    pub fn read_u32(&self, addr: u64) -> u32 {
        let mut b = [0u8; 4];
        b.copy_from_slice(&self.read(addr, 4));
        u32::from_ne_bytes(b)
    }

    pub fn read_i32(&self, addr: u64) -> i32 {
        self.read_u32(addr) as i32
    }

    pub fn read_u64(&self, addr: u64) -> u64 {
        let mut b = [0u8; 8];
        b.copy_from_slice(&self.read(addr, 8));
        u64::from_ne_bytes(b)
    }

    pub fn view(&self, addr: u64, len: usize, readable: bool, writable: bool) -> Result<FakeView> {
        let bytes = if len == 0 {
            Vec::new()
        } else {
            let (base, offset) = require_with!(
                self.locate(addr, len),
                "no fake region maps 0x{:x}+{}",
                addr,
                len
            );
            if readable {
                self.regions.borrow()[&base][offset..offset + len].to_vec()
            } else {
                vec![0u8; len]
            }
        };
        Ok(FakeView {
            space: self.clone(),
            addr,
            bytes,
            writable,
            dirty: false,
        })
    }

    fn locate(&self, addr: u64, len: usize) -> Option<(u64, usize)> {
        let regions = self.regions.borrow();
        let (base, bytes) = regions.range(..=addr).next_back()?;
        let offset = (addr - base) as usize;
        if offset + len > bytes.len() {
            return None;
        }
        Some((*base, offset))
    }

    fn write_back(&self, addr: u64, bytes: &[u8]) -> Result<()> {
        let (base, offset) = require_with!(
            self.locate(addr, bytes.len()),
            "no fake region maps 0x{:x}+{}",
            addr,
            bytes.len()
        );
        if let Some(region) = self.regions.borrow_mut().get_mut(&base) {
            region[offset..offset + bytes.len()].copy_from_slice(bytes);
        }
        Ok(())
    }
}

/// [`MemView`] over a [`FakeClientMem`] region, with the same
/// snapshot-and-flush behaviour as the process_vm backed views.
pub struct FakeView {
    space: FakeClientMem,
    addr: u64,
    bytes: Vec<u8>,
    writable: bool,
    dirty: bool,
}

impl MemView for FakeView {
    fn client_addr(&self) -> u64 {
        self.addr
    }

    fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    fn set_dirty(&mut self, _recursive: bool) {
        self.dirty = true;
    }

    fn resolve(
        &self,
        offset: usize,
        len: usize,
        readable: bool,
        writable: bool,
    ) -> Result<Box<dyn MemView>> {
        let ptr = read_u64(self, offset)?;
        Ok(Box::new(self.space.view(ptr, len, readable, writable)?))
    }
}

impl Drop for FakeView {
    fn drop(&mut self) {
        if self.dirty && self.writable {
            // a region removed mid-test is not worth failing a drop for
            let _ = self.space.write_back(self.addr, &self.bytes);
        }
    }
}

/// One fake intercepted ioctl. Records the completion for assertions.
pub struct FakeIoctl {
    mem: FakeClientMem,
    request: c_ulong,
    arg: u64,
    completion: Option<(c_long, i32)>,
}

impl FakeIoctl {
    pub fn new(mem: &FakeClientMem, request: c_ulong, arg: u64) -> FakeIoctl {
        FakeIoctl {
            mem: mem.clone(),
            request,
            arg,
            completion: None,
        }
    }

    /// The `(ret, errno)` the handler completed this call with. Panics if
    /// the call was never completed.
    pub fn result(&self) -> (c_long, i32) {
        match self.completion {
            Some(result) => result,
            None => panic!("ioctl 0x{:x} was never completed", self.request),
        }
    }
}

impl IoctlClient for FakeIoctl {
    fn request(&self) -> c_ulong {
        self.request
    }

    fn resolve_arg(
        &mut self,
        offset: usize,
        len: usize,
        readable: bool,
        writable: bool,
    ) -> Result<Box<dyn MemView>> {
        if offset != 0 {
            bail!("an ioctl argument holds a single pointer at offset 0");
        }
        Ok(Box::new(self.mem.view(self.arg, len, readable, writable)?))
    }

    fn complete(&mut self, ret: c_long, errno: i32) {
        self.completion = Some((ret, errno));
    }
}

/// Serialized `usbdevfs_urb` with the fields the replay core reads; all
/// others zero.
pub fn urb_bytes(typ: u8, endpoint: u8, buffer: u64, buffer_length: i32) -> Vec<u8> {
    let mut b = vec![0u8; size_of::<usbdevfs_urb>()];
    b[offset_of!(usbdevfs_urb, typ)] = typ;
    b[offset_of!(usbdevfs_urb, endpoint)] = endpoint;
    let off = offset_of!(usbdevfs_urb, buffer);
    b[off..off + 8].copy_from_slice(&buffer.to_ne_bytes());
    let off = offset_of!(usbdevfs_urb, buffer_length);
    b[off..off + 4].copy_from_slice(&buffer_length.to_ne_bytes());
    b
}

/// Builds legacy pcap bytes that [`crate::recording::Recording`] accepts.
pub struct RecordingBuilder {
    bytes: Vec<u8>,
}

impl Default for RecordingBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingBuilder {
    pub fn new() -> RecordingBuilder {
        Self::with_linktype(DLT_USB_LINUX_MMAPPED)
    }

    pub fn with_linktype(linktype: i32) -> RecordingBuilder {
        let mut bytes = Vec::with_capacity(24);
        bytes.extend_from_slice(&0xa1b2_c3d4u32.to_le_bytes()); // magic
        bytes.extend_from_slice(&2u16.to_le_bytes()); // version major
        bytes.extend_from_slice(&4u16.to_le_bytes()); // version minor
        bytes.extend_from_slice(&0i32.to_le_bytes()); // thiszone
        bytes.extend_from_slice(&0u32.to_le_bytes()); // sigfigs
        bytes.extend_from_slice(&262_144u32.to_le_bytes()); // snaplen
        bytes.extend_from_slice(&(linktype as u32).to_le_bytes());
        RecordingBuilder { bytes }
    }

    /// Append one record. The pcap packet header timestamp mirrors the
    /// usbmon header's, as usbmon captures do.
    pub fn push(&mut self, hdr: &usbmon_packet, payload: &[u8]) -> &mut Self {
        let caplen = (USBMON_HDR_LEN + payload.len()) as u32;
        self.bytes.extend_from_slice(&(hdr.ts_sec as u32).to_le_bytes());
        self.bytes.extend_from_slice(&(hdr.ts_usec as u32).to_le_bytes());
        self.bytes.extend_from_slice(&caplen.to_le_bytes());
        self.bytes.extend_from_slice(&caplen.to_le_bytes());
        self.bytes.extend_from_slice(&hdr.as_bytes());
        self.bytes.extend_from_slice(payload);
        self
    }

    pub fn finish(self) -> Vec<u8> {
        self.bytes
    }
}
