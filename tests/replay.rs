//! Drives the replay handler through full submit/reap conversations against
//! synthetic recordings, with a fake client address space standing in for a
//! traced process.

use libc::c_long;
use std::io::Write;
use std::mem::offset_of;

use usbreplay::ioctl::{
    USBDEVFS_CLAIMINTERFACE, USBDEVFS_DISCARDURB, USBDEVFS_GET_CAPABILITIES, USBDEVFS_REAPURB,
    USBDEVFS_REAPURBNDELAY, USBDEVFS_SUBMITURB,
};
use usbreplay::recording::{usbmon_packet, EVENT_COMPLETE, EVENT_ERROR, EVENT_SUBMIT};
use usbreplay::replay::UsbFsReplay;
use usbreplay::testing::{urb_bytes, FakeClientMem, FakeIoctl, RecordingBuilder};
use usbreplay::usbfs::{
    usbdevfs_urb, USBFS_URB_TYPE_BULK, USBFS_URB_TYPE_CONTROL, USBFS_URB_TYPE_INTERRUPT,
};

const BUS: u16 = 1;
const DEV: u8 = 2;
const REAP_ARG: u64 = 0x600;

fn replay_for(recording: RecordingBuilder) -> (UsbFsReplay, tempfile::NamedTempFile) {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(&recording.finish()).unwrap();
    file.flush().unwrap();
    let handler = UsbFsReplay::new(file.path(), BUS, DEV).unwrap();
    (handler, file)
}

fn submit_hdr(id: u64, xfer: u8, epnum: u8, length: u32) -> usbmon_packet {
    usbmon_packet {
        id,
        event_type: EVENT_SUBMIT,
        xfer_type: xfer,
        epnum,
        devnum: DEV,
        busnum: BUS,
        length,
        ..Default::default()
    }
}

fn complete_hdr(id: u64, xfer: u8, epnum: u8, length: u32, len_cap: u32) -> usbmon_packet {
    usbmon_packet {
        id,
        event_type: EVENT_COMPLETE,
        xfer_type: xfer,
        epnum,
        devnum: DEV,
        busnum: BUS,
        length,
        len_cap,
        ..Default::default()
    }
}

fn do_ioctl(
    handler: &mut UsbFsReplay,
    mem: &FakeClientMem,
    request: libc::c_ulong,
    arg: u64,
) -> (c_long, i32) {
    let mut call = FakeIoctl::new(mem, request, arg);
    assert!(handler.handle(&mut call), "ioctl went unhandled");
    call.result()
}

fn reap(handler: &mut UsbFsReplay, mem: &FakeClientMem) -> (c_long, i32) {
    do_ioctl(handler, mem, USBDEVFS_REAPURB(), REAP_ARG)
}

/// A client-side URB plus its transfer buffer, placed in fake memory.
fn place_urb(mem: &FakeClientMem, urb_addr: u64, typ: u8, endpoint: u8, buf_addr: u64, buf: &[u8]) {
    mem.add_region(urb_addr, urb_bytes(typ, endpoint, buf_addr, buf.len() as i32));
    mem.add_region(buf_addr, buf.to_vec());
}

fn urb_field(mem: &FakeClientMem, urb_addr: u64, offset: usize) -> i32 {
    mem.read_i32(urb_addr + offset as u64)
}

#[test]
fn capability_query() {
    let (mut handler, _file) = replay_for(RecordingBuilder::new());
    let mem = FakeClientMem::new();
    mem.add_region(0x500, vec![0u8; 4]);

    let result = do_ioctl(&mut handler, &mem, USBDEVFS_GET_CAPABILITIES(), 0x500);
    assert_eq!(result, (0, 0));
    assert_eq!(mem.read_u32(0x500), 0x1f);
}

#[test]
fn interface_housekeeping_is_a_noop() {
    let (mut handler, _file) = replay_for(RecordingBuilder::new());
    let mem = FakeClientMem::new();
    mem.add_region(0x500, vec![0u8; 4]);

    let result = do_ioctl(&mut handler, &mem, USBDEVFS_CLAIMINTERFACE(), 0x500);
    assert_eq!(result, (0, 0));
}

#[test]
fn unknown_opcode() {
    let (mut handler, _file) = replay_for(RecordingBuilder::new());
    let mem = FakeClientMem::new();
    // 0xdeadbeef declares 0x1ead argument bytes in its size field
    mem.add_region(0x7000, vec![0u8; 0x2000]);
    mem.add_region(REAP_ARG, vec![0u8; 8]);

    let result = do_ioctl(&mut handler, &mem, 0xdead_beef, 0x7000);
    assert_eq!(result, (-1, libc::ENOTTY));

    // and no state was touched by the rejected call
    assert_eq!(reap(&mut handler, &mem), (-1, libc::EAGAIN));
}

#[test]
fn discard_path() {
    let (mut handler, _file) = replay_for(RecordingBuilder::new());
    let mem = FakeClientMem::new();
    let mut urb = urb_bytes(USBFS_URB_TYPE_BULK, 0x81, 0x4000, 64);
    // pre-existing field values must survive a discard untouched
    let actual_off = offset_of!(usbdevfs_urb, actual_length);
    urb[actual_off..actual_off + 4].copy_from_slice(&0x55i32.to_ne_bytes());
    mem.add_region(0x1000, urb);
    mem.add_region(0x4000, vec![0u8; 64]);
    mem.add_region(REAP_ARG, vec![0u8; 8]);

    assert_eq!(
        do_ioctl(&mut handler, &mem, USBDEVFS_SUBMITURB(), 0x1000),
        (0, 0)
    );
    assert_eq!(
        do_ioctl(&mut handler, &mem, USBDEVFS_DISCARDURB(), 0x1000),
        (0, 0)
    );
    // gone from the queue, a second discard cannot find it
    assert_eq!(
        do_ioctl(&mut handler, &mem, USBDEVFS_DISCARDURB(), 0x1000),
        (-1, libc::EINVAL)
    );

    assert_eq!(reap(&mut handler, &mem), (0, 0));
    assert_eq!(mem.read_u64(REAP_ARG), 0x1000);
    assert_eq!(
        urb_field(&mem, 0x1000, offset_of!(usbdevfs_urb, status)),
        -libc::ENOENT
    );
    assert_eq!(
        urb_field(&mem, 0x1000, offset_of!(usbdevfs_urb, actual_length)),
        0x55
    );
}

#[test]
fn discard_of_unknown_address() {
    let (mut handler, _file) = replay_for(RecordingBuilder::new());
    let mem = FakeClientMem::new();

    assert_eq!(
        do_ioctl(&mut handler, &mem, USBDEVFS_DISCARDURB(), 0x9999),
        (-1, libc::EINVAL)
    );
}

#[test]
fn in_transfer() {
    let mut recording = RecordingBuilder::new();
    recording.push(&submit_hdr(7, USBFS_URB_TYPE_INTERRUPT, 0x82, 8), &[]);
    recording.push(
        &complete_hdr(7, USBFS_URB_TYPE_INTERRUPT, 0x82, 8, 8),
        &[1, 2, 3, 4, 5, 6, 7, 8],
    );
    let (mut handler, _file) = replay_for(recording);

    let mem = FakeClientMem::new();
    place_urb(&mem, 0x2000, USBFS_URB_TYPE_INTERRUPT, 0x82, 0x4100, &[0u8; 8]);
    mem.add_region(REAP_ARG, vec![0u8; 8]);

    assert_eq!(
        do_ioctl(&mut handler, &mem, USBDEVFS_SUBMITURB(), 0x2000),
        (0, 0)
    );
    assert_eq!(reap(&mut handler, &mem), (0, 0));
    assert_eq!(mem.read_u64(REAP_ARG), 0x2000);
    assert_eq!(urb_field(&mem, 0x2000, offset_of!(usbdevfs_urb, status)), 0);
    assert_eq!(
        urb_field(&mem, 0x2000, offset_of!(usbdevfs_urb, actual_length)),
        8
    );
    assert_eq!(mem.read(0x4100, 8), vec![1, 2, 3, 4, 5, 6, 7, 8]);
}

#[test]
fn out_transfer_with_byte_match() {
    let mut recording = RecordingBuilder::new();
    recording.push(
        &usbmon_packet {
            len_cap: 4,
            ..submit_hdr(9, USBFS_URB_TYPE_BULK, 0x01, 4)
        },
        &[0xaa, 0xbb, 0xcc, 0xdd],
    );
    recording.push(&complete_hdr(9, USBFS_URB_TYPE_BULK, 0x01, 4, 0), &[]);
    let (mut handler, _file) = replay_for(recording);

    let mem = FakeClientMem::new();
    place_urb(
        &mem,
        0x3000,
        USBFS_URB_TYPE_BULK,
        0x01,
        0x4200,
        &[0xaa, 0xbb, 0xcc, 0xdd],
    );
    mem.add_region(REAP_ARG, vec![0u8; 8]);

    assert_eq!(
        do_ioctl(&mut handler, &mem, USBDEVFS_SUBMITURB(), 0x3000),
        (0, 0)
    );
    assert_eq!(reap(&mut handler, &mem), (0, 0));
    assert_eq!(mem.read_u64(REAP_ARG), 0x3000);
    assert_eq!(urb_field(&mem, 0x3000, offset_of!(usbdevfs_urb, status)), 0);
    assert_eq!(
        urb_field(&mem, 0x3000, offset_of!(usbdevfs_urb, actual_length)),
        4
    );
}

#[test]
fn out_mismatch_keeps_the_record_pending() {
    let mut recording = RecordingBuilder::new();
    recording.push(
        &usbmon_packet {
            len_cap: 4,
            ..submit_hdr(9, USBFS_URB_TYPE_BULK, 0x01, 4)
        },
        &[0xaa, 0xbb, 0xcc, 0xdd],
    );
    recording.push(&complete_hdr(9, USBFS_URB_TYPE_BULK, 0x01, 4, 0), &[]);
    let (mut handler, _file) = replay_for(recording);

    let mem = FakeClientMem::new();
    place_urb(
        &mem,
        0x3000,
        USBFS_URB_TYPE_BULK,
        0x01,
        0x4200,
        &[0x11, 0x22, 0x33, 0x44],
    );
    mem.add_region(REAP_ARG, vec![0u8; 8]);

    assert_eq!(
        do_ioctl(&mut handler, &mem, USBDEVFS_SUBMITURB(), 0x3000),
        (0, 0)
    );
    // wrong payload: the submit record must not bind, and must survive
    // being retried
    assert_eq!(reap(&mut handler, &mem), (-1, libc::EAGAIN));
    assert_eq!(reap(&mut handler, &mem), (-1, libc::EAGAIN));

    // a later submit with the recorded bytes picks the record up
    place_urb(
        &mem,
        0x3100,
        USBFS_URB_TYPE_BULK,
        0x01,
        0x4300,
        &[0xaa, 0xbb, 0xcc, 0xdd],
    );
    assert_eq!(
        do_ioctl(&mut handler, &mem, USBDEVFS_SUBMITURB(), 0x3100),
        (0, 0)
    );
    assert_eq!(reap(&mut handler, &mem), (0, 0));
    assert_eq!(mem.read_u64(REAP_ARG), 0x3100);
}

#[test]
fn reap_with_nothing_to_deliver() {
    let (mut handler, _file) = replay_for(RecordingBuilder::new());
    let mem = FakeClientMem::new();
    mem.add_region(REAP_ARG, vec![0u8; 8]);

    assert_eq!(reap(&mut handler, &mem), (-1, libc::EAGAIN));
    assert_eq!(
        do_ioctl(&mut handler, &mem, USBDEVFS_REAPURBNDELAY(), REAP_ARG),
        (-1, libc::EAGAIN)
    );
}

#[test]
fn unmatchable_head_record_is_preserved() {
    let mut recording = RecordingBuilder::new();
    recording.push(&submit_hdr(1, USBFS_URB_TYPE_BULK, 0x81, 64), &[]);
    recording.push(
        &complete_hdr(1, USBFS_URB_TYPE_BULK, 0x81, 64, 0),
        &[],
    );
    let (mut handler, _file) = replay_for(recording);

    let mem = FakeClientMem::new();
    // only an interrupt URB is queued; the bulk head record cannot bind
    place_urb(&mem, 0x2000, USBFS_URB_TYPE_INTERRUPT, 0x82, 0x4100, &[0u8; 8]);
    mem.add_region(REAP_ARG, vec![0u8; 8]);

    assert_eq!(
        do_ioctl(&mut handler, &mem, USBDEVFS_SUBMITURB(), 0x2000),
        (0, 0)
    );
    assert_eq!(reap(&mut handler, &mem), (-1, libc::EAGAIN));
    assert_eq!(reap(&mut handler, &mem), (-1, libc::EAGAIN));

    // the record is still there once a matching URB shows up
    place_urb(&mem, 0x2800, USBFS_URB_TYPE_BULK, 0x81, 0x4800, &[0u8; 64]);
    assert_eq!(
        do_ioctl(&mut handler, &mem, USBDEVFS_SUBMITURB(), 0x2800),
        (0, 0)
    );
    assert_eq!(reap(&mut handler, &mem), (0, 0));
    assert_eq!(mem.read_u64(REAP_ARG), 0x2800);
}

#[test]
fn kernel_control_transfers_are_skipped() {
    let mut recording = RecordingBuilder::new();
    // enumeration traffic the client never submits
    recording.push(&submit_hdr(1, USBFS_URB_TYPE_CONTROL, 0x80, 18), &[]);
    recording.push(&complete_hdr(1, USBFS_URB_TYPE_CONTROL, 0x80, 18, 0), &[]);
    recording.push(&submit_hdr(2, USBFS_URB_TYPE_INTERRUPT, 0x82, 8), &[]);
    recording.push(
        &complete_hdr(2, USBFS_URB_TYPE_INTERRUPT, 0x82, 8, 8),
        &[9, 9, 9, 9, 9, 9, 9, 9],
    );
    let (mut handler, _file) = replay_for(recording);

    let mem = FakeClientMem::new();
    place_urb(&mem, 0x2000, USBFS_URB_TYPE_INTERRUPT, 0x82, 0x4100, &[0u8; 8]);
    mem.add_region(REAP_ARG, vec![0u8; 8]);

    assert_eq!(
        do_ioctl(&mut handler, &mem, USBDEVFS_SUBMITURB(), 0x2000),
        (0, 0)
    );
    // one reap skips the enumeration pair and completes the interrupt URB
    assert_eq!(reap(&mut handler, &mem), (0, 0));
    assert_eq!(mem.read_u64(REAP_ARG), 0x2000);
    assert_eq!(mem.read(0x4100, 8), vec![9u8; 8]);
}

#[test]
fn identical_fingerprints_bind_oldest_first() {
    let mut recording = RecordingBuilder::new();
    recording.push(&submit_hdr(1, USBFS_URB_TYPE_INTERRUPT, 0x82, 4), &[]);
    recording.push(&submit_hdr(2, USBFS_URB_TYPE_INTERRUPT, 0x82, 4), &[]);
    recording.push(
        &complete_hdr(1, USBFS_URB_TYPE_INTERRUPT, 0x82, 4, 4),
        &[1, 1, 1, 1],
    );
    recording.push(
        &complete_hdr(2, USBFS_URB_TYPE_INTERRUPT, 0x82, 4, 4),
        &[2, 2, 2, 2],
    );
    let (mut handler, _file) = replay_for(recording);

    let mem = FakeClientMem::new();
    place_urb(&mem, 0x2000, USBFS_URB_TYPE_INTERRUPT, 0x82, 0x4100, &[0u8; 4]);
    place_urb(&mem, 0x2800, USBFS_URB_TYPE_INTERRUPT, 0x82, 0x4200, &[0u8; 4]);
    mem.add_region(REAP_ARG, vec![0u8; 8]);

    assert_eq!(
        do_ioctl(&mut handler, &mem, USBDEVFS_SUBMITURB(), 0x2000),
        (0, 0)
    );
    assert_eq!(
        do_ioctl(&mut handler, &mem, USBDEVFS_SUBMITURB(), 0x2800),
        (0, 0)
    );

    assert_eq!(reap(&mut handler, &mem), (0, 0));
    assert_eq!(mem.read_u64(REAP_ARG), 0x2000);
    assert_eq!(mem.read(0x4100, 4), vec![1u8; 4]);

    assert_eq!(reap(&mut handler, &mem), (0, 0));
    assert_eq!(mem.read_u64(REAP_ARG), 0x2800);
    assert_eq!(mem.read(0x4200, 4), vec![2u8; 4]);
}

#[test]
fn records_of_other_devices_are_ignored() {
    let mut recording = RecordingBuilder::new();
    recording.push(
        &usbmon_packet {
            busnum: 9,
            ..submit_hdr(50, USBFS_URB_TYPE_BULK, 0x81, 64)
        },
        &[],
    );
    recording.push(
        &usbmon_packet {
            devnum: 7,
            ..submit_hdr(51, USBFS_URB_TYPE_BULK, 0x81, 64)
        },
        &[],
    );
    recording.push(&submit_hdr(7, USBFS_URB_TYPE_INTERRUPT, 0x82, 8), &[]);
    recording.push(
        &complete_hdr(7, USBFS_URB_TYPE_INTERRUPT, 0x82, 8, 8),
        &[1, 2, 3, 4, 5, 6, 7, 8],
    );
    let (mut handler, _file) = replay_for(recording);

    let mem = FakeClientMem::new();
    place_urb(&mem, 0x2000, USBFS_URB_TYPE_INTERRUPT, 0x82, 0x4100, &[0u8; 8]);
    mem.add_region(REAP_ARG, vec![0u8; 8]);

    assert_eq!(
        do_ioctl(&mut handler, &mem, USBDEVFS_SUBMITURB(), 0x2000),
        (0, 0)
    );
    assert_eq!(reap(&mut handler, &mem), (0, 0));
    assert_eq!(mem.read_u64(REAP_ARG), 0x2000);
}

#[test]
fn reap_after_the_recording_ends() {
    let mut recording = RecordingBuilder::new();
    recording.push(&submit_hdr(7, USBFS_URB_TYPE_INTERRUPT, 0x82, 8), &[]);
    recording.push(
        &complete_hdr(7, USBFS_URB_TYPE_INTERRUPT, 0x82, 8, 8),
        &[0u8; 8],
    );
    let (mut handler, _file) = replay_for(recording);

    let mem = FakeClientMem::new();
    place_urb(&mem, 0x2000, USBFS_URB_TYPE_INTERRUPT, 0x82, 0x4100, &[0u8; 8]);
    mem.add_region(REAP_ARG, vec![0u8; 8]);

    assert_eq!(
        do_ioctl(&mut handler, &mem, USBDEVFS_SUBMITURB(), 0x2000),
        (0, 0)
    );
    assert_eq!(reap(&mut handler, &mem), (0, 0));
    assert_eq!(reap(&mut handler, &mem), (-1, libc::EAGAIN));
}

#[test]
#[should_panic(expected = "only 'S' and 'C'")]
fn error_events_fail_loudly() {
    let mut recording = RecordingBuilder::new();
    recording.push(
        &usbmon_packet {
            event_type: EVENT_ERROR,
            ..submit_hdr(1, USBFS_URB_TYPE_BULK, 0x81, 64)
        },
        &[],
    );
    let (mut handler, _file) = replay_for(recording);

    let mem = FakeClientMem::new();
    mem.add_region(REAP_ARG, vec![0u8; 8]);
    reap(&mut handler, &mem);
}
