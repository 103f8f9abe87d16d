//! Views into client memory.
//!
//! The replay core never touches client address space directly. It works on
//! [`MemView`]s, handles that carry a local snapshot of a client-resident
//! byte range together with the client-side address it came from. Writes go
//! to the snapshot and mark it dirty; dirty views are written back to the
//! client when they are flushed or dropped.

use log::warn;
use nix::sys::uio::{process_vm_readv, process_vm_writev, RemoteIoVec};
use nix::unistd::Pid;
use simple_error::{bail, require_with, try_with};
use std::io::{IoSlice, IoSliceMut};

use crate::result::Result;

/// A bidirectional window into client memory.
///
/// `resolve` follows a pointer *stored inside* this view: the eight bytes at
/// `offset` are interpreted as a client address and a new view over the
/// pointee is produced. This is how the embedded `buffer` pointer of a
/// submitted URB is chased.
pub trait MemView {
    /// Client-side address this view maps.
    fn client_addr(&self) -> u64;

    fn bytes(&self) -> &[u8];

    fn bytes_mut(&mut self) -> &mut [u8];

    /// Mark the view for writeback. `recursive` asks for any dependent views
    /// to be marked as well; the views of this crate do not nest, so both
    /// flavors behave the same here.
    fn set_dirty(&mut self, recursive: bool);

    /// Follow the pointer stored at `offset` and map `len` bytes of the
    /// pointee.
    fn resolve(&self, offset: usize, len: usize, readable: bool, writable: bool)
        -> Result<Box<dyn MemView>>;

    fn len(&self) -> usize {
        self.bytes().len()
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Store the client address of `target` at `offset` in this view, the
    /// fix-up used to return a URB pointer from a reap call.
    fn set_ptr(&mut self, offset: usize, target: &dyn MemView) -> Result<()> {
        let addr = target.client_addr().to_ne_bytes();
        let len = self.len();
        let b = self.bytes_mut();
        let s = require_with!(
            offset.checked_add(addr.len()).and_then(|end| b.get_mut(offset..end)),
            "write of {}b at {} is out of view bounds ({}b)",
            addr.len(),
            offset,
            len
        );
        s.copy_from_slice(&addr);
        self.set_dirty(false);
        Ok(())
    }
}

pub fn read_u8(view: &dyn MemView, offset: usize) -> Result<u8> {
    let b = view.bytes();
    Ok(*require_with!(b.get(offset), "read of byte {} is out of view bounds ({}b)", offset, b.len()))
}

pub fn read_i32(view: &dyn MemView, offset: usize) -> Result<i32> {
    Ok(i32::from_ne_bytes(read_array(view, offset)?))
}

pub fn read_u32(view: &dyn MemView, offset: usize) -> Result<u32> {
    Ok(u32::from_ne_bytes(read_array(view, offset)?))
}

pub fn read_u64(view: &dyn MemView, offset: usize) -> Result<u64> {
    Ok(u64::from_ne_bytes(read_array(view, offset)?))
}

pub fn write_i32(view: &mut dyn MemView, offset: usize, val: i32) -> Result<()> {
    write_bytes(view, offset, &val.to_ne_bytes())
}

pub fn write_u32(view: &mut dyn MemView, offset: usize, val: u32) -> Result<()> {
    write_bytes(view, offset, &val.to_ne_bytes())
}

pub fn write_u64(view: &mut dyn MemView, offset: usize, val: u64) -> Result<()> {
    write_bytes(view, offset, &val.to_ne_bytes())
}

fn read_array<const N: usize>(view: &dyn MemView, offset: usize) -> Result<[u8; N]> {
    let b = view.bytes();
    let s = require_with!(
        offset.checked_add(N).and_then(|end| b.get(offset..end)),
        "read of {}b at {} is out of view bounds ({}b)",
        N,
        offset,
        b.len()
    );
    let mut out = [0u8; N];
    out.copy_from_slice(s);
    Ok(out)
}

fn write_bytes(view: &mut dyn MemView, offset: usize, val: &[u8]) -> Result<()> {
    let len = view.len();
    let b = view.bytes_mut();
    let s = require_with!(
        offset.checked_add(val.len()).and_then(|end| b.get_mut(offset..end)),
        "write of {}b at {} is out of view bounds ({}b)",
        val.len(),
        offset,
        len
    );
    s.copy_from_slice(val);
    view.set_dirty(false);
    Ok(())
}

/// Address space of a live client process, read and written with
/// `process_vm_readv(2)`/`process_vm_writev(2)`.
#[derive(Debug, Copy, Clone)]
pub struct RemoteMem {
    pub pid: Pid,
}

impl RemoteMem {
    pub fn new(pid: Pid) -> RemoteMem {
        RemoteMem { pid }
    }

    pub fn view(&self, addr: u64, len: usize, readable: bool, writable: bool) -> Result<RemoteView> {
        let mut bytes = vec![0u8; len];
        if readable && len > 0 {
            try_with!(
                process_read(self.pid, addr, &mut bytes),
                "cannot read {}b of client memory at 0x{:x}",
                len,
                addr
            );
        }
        Ok(RemoteView {
            pid: self.pid,
            addr,
            bytes,
            writable,
            dirty: false,
        })
    }
}

/// A [`MemView`] over the memory of a live process.
#[derive(Debug)]
pub struct RemoteView {
    pid: Pid,
    addr: u64,
    bytes: Vec<u8>,
    writable: bool,
    dirty: bool,
}

impl RemoteView {
    /// Write the snapshot back to the client if it was marked dirty.
    pub fn flush(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        if !self.writable {
            bail!("view of 0x{:x} is dirty but was not resolved writable", self.addr);
        }
        try_with!(
            process_write(self.pid, self.addr, &self.bytes),
            "cannot write {}b of client memory at 0x{:x}",
            self.bytes.len(),
            self.addr
        );
        self.dirty = false;
        Ok(())
    }
}

impl MemView for RemoteView {
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
        let view = RemoteMem::new(self.pid).view(ptr, len, readable, writable)?;
        Ok(Box::new(view))
    }
}

impl Drop for RemoteView {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            warn!("cannot write back client memory at 0x{:x}: {}", self.addr, e);
        }
    }
}

fn process_read(pid: Pid, addr: u64, buf: &mut [u8]) -> Result<()> {
    let len = buf.len();
    let mut local = [IoSliceMut::new(buf)];
    let remote = [RemoteIoVec {
        base: addr as usize,
        len,
    }];
    let read = try_with!(
        process_vm_readv(pid, &mut local, &remote),
        "process_vm_readv failed for process {}",
        pid
    );
    if read != len {
        bail!("short read from process {}: {} of {}b", pid, read, len);
    }
    Ok(())
}

fn process_write(pid: Pid, addr: u64, buf: &[u8]) -> Result<()> {
    let local = [IoSlice::new(buf)];
    let remote = [RemoteIoVec {
        base: addr as usize,
        len: buf.len(),
    }];
    let written = try_with!(
        process_vm_writev(pid, &local, &remote),
        "process_vm_writev failed for process {}",
        pid
    );
    if written != buf.len() {
        bail!("short write to process {}: {} of {}b", pid, written, buf.len());
    }
    Ok(())
}
