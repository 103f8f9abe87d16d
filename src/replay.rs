//! The usbdevfs replay handler.
//!
//! One handler impersonates one recorded `(bus, device)` pair. Clients
//! submit and reap URBs through the usual usbdevfs ioctls; instead of
//! talking to hardware, every reap is answered from the recording. Submits
//! are matched against the recording's 'S' records by structural
//! fingerprint (and payload bytes for outbound transfers), completions are
//! taken from the corresponding 'C' records and copied back into client
//! memory.

use log::{debug, info, trace, warn};
use simple_error::bail;
use std::collections::VecDeque;
use std::mem::offset_of;
use std::path::Path;
use std::time::Instant;

use crate::client::IoctlClient;
use crate::ioctl::{
    request_size, USBDEVFS_CLAIMINTERFACE, USBDEVFS_CLEAR_HALT, USBDEVFS_DISCARDURB,
    USBDEVFS_GET_CAPABILITIES, USBDEVFS_REAPURB, USBDEVFS_REAPURBNDELAY,
    USBDEVFS_RELEASEINTERFACE, USBDEVFS_RESET, USBDEVFS_RESETEP, USBDEVFS_SUBMITURB,
};
use crate::mem::{read_i32, read_u8, write_i32, write_u32, MemView};
use crate::recording::{usbmon_packet, Record, Recording, EVENT_COMPLETE, EVENT_SUBMIT};
use crate::result::Result;
use crate::stuck::{StuckDetector, STUCK_SLACK};
use crate::usbfs::{transfer_type_name, usbdevfs_urb, USBFS_REPLAY_CAPS, USBFS_URB_TYPE_CONTROL};

/// An URB the client has submitted and not yet reaped.
struct UrbEntry {
    /// View over the client-resident `usbdevfs_urb`.
    urb: Box<dyn MemView>,
    /// View over the URB's transfer buffer, `buffer_length` bytes.
    buf: Box<dyn MemView>,
    /// Pointer value the client passed on submit; the URB's identity.
    client_addr: u64,
    /// Id of the matched submit record, 0 while unmatched.
    pcap_id: u64,
}

impl UrbEntry {
    fn urb_type(&self) -> Result<u8> {
        read_u8(&*self.urb, offset_of!(usbdevfs_urb, typ))
    }

    fn endpoint(&self) -> Result<u8> {
        read_u8(&*self.urb, offset_of!(usbdevfs_urb, endpoint))
    }

    fn buffer_length(&self) -> Result<i32> {
        read_i32(&*self.urb, offset_of!(usbdevfs_urb, buffer_length))
    }
}

/// Replays a usbmon recording to a usbdevfs client.
pub struct UsbFsReplay {
    recording: Recording,
    busnum: u16,
    devnum: u8,
    /// In-flight URBs in submission order.
    urbs: Vec<UrbEntry>,
    /// Discarded URBs awaiting their `-ENOENT` reap, oldest first.
    discarded: VecDeque<UrbEntry>,
    /// Look-ahead: the current unconsumed record. Keeping an unmatched
    /// record here across reap calls is what lets a later submit bind it.
    cur: Option<Record>,
    stuck: StuckDetector,
}

impl UsbFsReplay {
    /// Open `path` and replay its traffic for the device at
    /// `(busnum, devnum)`. Fails if the file is not a usbmon recording.
    pub fn new(path: &Path, busnum: u16, devnum: u8) -> Result<UsbFsReplay> {
        let recording = Recording::open(path)?;
        Ok(UsbFsReplay {
            recording,
            busnum,
            devnum,
            urbs: Vec::new(),
            discarded: VecDeque::new(),
            cur: None,
            stuck: StuckDetector::new(STUCK_SLACK),
        })
    }

    /// Answer one intercepted ioctl. Returns false when the call is not for
    /// us after all (the argument could not be resolved); the framework may
    /// then fall through to other handlers.
    pub fn handle(&mut self, client: &mut dyn IoctlClient) -> bool {
        match self.try_handle(client) {
            Ok(handled) => handled,
            Err(e) => {
                warn!("cannot handle ioctl 0x{:x}: {}", client.request(), e);
                false
            }
        }
    }

    fn try_handle(&mut self, client: &mut dyn IoctlClient) -> Result<bool> {
        let request = client.request();
        let size = request_size(request);
        let mut arg = match client.resolve_arg(0, size, true, true) {
            Ok(arg) => arg,
            Err(e) => {
                warn!("cannot resolve argument of ioctl 0x{:x}: {}", request, e);
                return Ok(false);
            }
        };

        if request == USBDEVFS_GET_CAPABILITIES() {
            write_u32(&mut *arg, 0, USBFS_REPLAY_CAPS)?;
            client.complete(0, 0);
        } else if request == USBDEVFS_CLAIMINTERFACE()
            || request == USBDEVFS_RELEASEINTERFACE()
            || request == USBDEVFS_CLEAR_HALT()
            || request == USBDEVFS_RESET()
            || request == USBDEVFS_RESETEP()
        {
            // housekeeping a recorded device does not need
            trace!("ignoring usbfs ioctl 0x{:x}", request);
            client.complete(0, 0);
        } else if request == USBDEVFS_SUBMITURB() {
            self.submit(client, arg)?;
        } else if request == USBDEVFS_DISCARDURB() {
            self.discard(client, &*arg);
        } else if request == USBDEVFS_REAPURB() || request == USBDEVFS_REAPURBNDELAY() {
            // both poll; replay has no pacing that would make REAPURB block
            self.reap(client, arg)?;
        } else {
            debug!("unknown usbfs ioctl 0x{:x}", request);
            client.complete(-1, libc::ENOTTY);
        }
        Ok(true)
    }

    fn submit(&mut self, client: &mut dyn IoctlClient, urb: Box<dyn MemView>) -> Result<()> {
        let typ = read_u8(&*urb, offset_of!(usbdevfs_urb, typ))?;
        let endpoint = read_u8(&*urb, offset_of!(usbdevfs_urb, endpoint))?;
        let buffer_length = read_i32(&*urb, offset_of!(usbdevfs_urb, buffer_length))?;
        if buffer_length < 0 {
            bail!("submitted urb has negative buffer length {}", buffer_length);
        }
        let buf = urb.resolve(
            offset_of!(usbdevfs_urb, buffer),
            buffer_length as usize,
            true,
            true,
        )?;
        trace!(
            "submit urb 0x{:x}: {} endpoint 0x{:02x} {}b",
            urb.client_addr(),
            transfer_type_name(typ),
            endpoint,
            buffer_length
        );
        self.urbs.push(UrbEntry {
            client_addr: urb.client_addr(),
            urb,
            buf,
            pcap_id: 0,
        });
        client.complete(0, 0);
        Ok(())
    }

    fn discard(&mut self, client: &mut dyn IoctlClient, arg: &dyn MemView) {
        let addr = arg.client_addr();
        match self.urbs.iter().position(|u| u.client_addr == addr) {
            Some(idx) => {
                trace!("discard urb 0x{:x}", addr);
                let entry = self.urbs.remove(idx);
                self.discarded.push_back(entry);
                client.complete(0, 0);
            }
            None => {
                debug!("discard of unknown urb 0x{:x}", addr);
                client.complete(-1, libc::EINVAL);
            }
        }
    }

    fn reap(&mut self, client: &mut dyn IoctlClient, mut arg: Box<dyn MemView>) -> Result<()> {
        // discarded URBs go back first, in discard order
        if let Some(mut entry) = self.discarded.pop_front() {
            write_i32(
                &mut *entry.urb,
                offset_of!(usbdevfs_urb, status),
                -libc::ENOENT,
            )?;
            trace!("reaping discarded urb 0x{:x}", entry.client_addr);
            arg.set_ptr(0, &*entry.urb)?;
            client.complete(0, 0);
            return Ok(());
        }

        match self.next_completed()? {
            Some(entry) => {
                trace!("reaping urb 0x{:x}", entry.client_addr);
                arg.set_ptr(0, &*entry.urb)?;
                client.complete(0, 0);
            }
            None => client.complete(-1, libc::EAGAIN),
        }
        Ok(())
    }

    /// Advance through the recording until an URB completes or nothing more
    /// can be delivered right now.
    fn next_completed(&mut self) -> Result<Option<UrbEntry>> {
        loop {
            let rec = match self.cur.take() {
                Some(rec) => rec,
                None => match self.recording.next_record()? {
                    Some(rec) => {
                        self.stuck.new_head(Instant::now());
                        rec
                    }
                    None => return Ok(None),
                },
            };
            let hdr = rec.usb();

            // records of other devices on the bus are not ours to replay
            if hdr.busnum != self.busnum || hdr.devnum != self.devnum {
                trace!(
                    "skipping record 0x{:x} of device {}:{}",
                    hdr.id,
                    hdr.busnum,
                    hdr.devnum
                );
                continue;
            }

            self.report_if_stuck(Instant::now(), &rec, &hdr);

            match hdr.event_type {
                EVENT_SUBMIT => {
                    if self.bind_submit(&rec, &hdr)? {
                        self.stuck.matched(rec.time);
                        continue;
                    }
                    if hdr.xfer_type == USBFS_URB_TYPE_CONTROL {
                        // enumeration traffic the kernel generated on its
                        // own; the client will never submit it
                        debug!("skipping unsubmitted control transfer 0x{:x}", hdr.id);
                        continue;
                    }
                    // Nothing submitted yet that this record could belong
                    // to. Keep it pending; a later submit may bind it.
                    self.cur = Some(rec);
                    return Ok(None);
                }
                EVENT_COMPLETE => {
                    assert_eq!(
                        hdr.start_frame, 0,
                        "isochronous streams cannot be replayed"
                    );
                    let idx = self
                        .urbs
                        .iter()
                        .position(|u| u.pcap_id != 0 && u.pcap_id == hdr.id);
                    match idx {
                        Some(idx) => {
                            let mut entry = self.urbs.remove(idx);
                            Self::complete_urb(&mut entry, &rec, &hdr)?;
                            self.stuck.matched(rec.time);
                            return Ok(Some(entry));
                        }
                        None => {
                            // completion of a transfer the kernel submitted
                            // internally, typically enumeration
                            debug!("skipping unmatched completion 0x{:x}", hdr.id);
                            continue;
                        }
                    }
                }
                other => panic!(
                    "recording contains event type {:?}; only 'S' and 'C' can be replayed",
                    other as char
                ),
            }
        }
    }

    /// Try to bind a submit record to the oldest matching queued URB.
    fn bind_submit(&mut self, rec: &Record, hdr: &usbmon_packet) -> Result<bool> {
        for entry in self.urbs.iter_mut() {
            if entry.pcap_id != 0 {
                continue;
            }
            if entry.urb_type()? != hdr.xfer_type || entry.endpoint()? != hdr.epnum {
                continue;
            }
            let buffer_length = entry.buffer_length()?;
            if buffer_length as u32 != hdr.length {
                continue;
            }
            if hdr.len_cap > 0 {
                // a submit carrying data is an outbound transfer and only
                // binds when the client sends exactly the recorded bytes
                if hdr.is_in()
                    || hdr.len_cap != buffer_length as u32
                    || entry.buf.bytes() != rec.payload()
                {
                    continue;
                }
            }
            entry.pcap_id = hdr.id;
            trace!(
                "submit record 0x{:x} bound to urb 0x{:x}",
                hdr.id,
                entry.client_addr
            );
            return Ok(true);
        }
        Ok(false)
    }

    /// Copy payload and result fields of a completion record back into the
    /// client's URB.
    fn complete_urb(entry: &mut UrbEntry, rec: &Record, hdr: &usbmon_packet) -> Result<()> {
        if hdr.len_cap > 0 {
            let payload = rec.payload();
            let buf = entry.buf.bytes_mut();
            if buf.len() < payload.len() {
                bail!(
                    "recorded payload of {}b exceeds the client buffer of {}b",
                    payload.len(),
                    buf.len()
                );
            }
            buf[..payload.len()].copy_from_slice(payload);
            entry.buf.set_dirty(false);
        }
        write_i32(&mut *entry.urb, offset_of!(usbdevfs_urb, status), hdr.status)?;
        write_i32(
            &mut *entry.urb,
            offset_of!(usbdevfs_urb, actual_length),
            hdr.length as i32,
        )?;
        write_i32(
            &mut *entry.urb,
            offset_of!(usbdevfs_urb, start_frame),
            hdr.start_frame,
        )?;
        Ok(())
    }

    fn report_if_stuck(&mut self, now: Instant, rec: &Record, hdr: &usbmon_packet) {
        let report = match self.stuck.check(now, rec.time) {
            Some(report) => report,
            None => return,
        };
        info!(
            "waited {:?} for the next reap where the recording took {:?}; pending: '{}' {} endpoint 0x{:02x} {}b",
            report.waited,
            report.expected,
            hdr.event_type as char,
            transfer_type_name(hdr.xfer_type),
            hdr.epnum,
            hdr.length
        );
        for entry in &self.urbs {
            info!(
                "  queued urb 0x{:x}: {} endpoint 0x{:02x} {}b ({})",
                entry.client_addr,
                transfer_type_name(entry.urb_type().unwrap_or(0xff)),
                entry.endpoint().unwrap_or(0),
                entry.buffer_length().unwrap_or(0),
                if entry.pcap_id != 0 {
                    "submitted"
                } else {
                    "not submitted"
                }
            );
        }
    }
}
