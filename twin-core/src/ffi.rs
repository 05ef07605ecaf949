//! C ABI for linking twin-core as a static library into the controllers' C firmware.
//! Packet codec helpers plus a handle-based core whose channels are C callbacks.

use std::ffi::c_void;
use std::os::raw::{c_char, c_int};
use std::slice;

use bytes::Bytes;

use crate::arbiter::Policy;
use crate::integrity::crc16_modbus;
use crate::protocol::{PacketType, PROTOCOL_VERSION};
use crate::registry::{ChannelKind, ChannelSink};
use crate::wire::{decode_packet, Packet, WireError};
use crate::TwinCore;

/// Protocol version. Also keeps the staticlib exporting at least one symbol.
#[no_mangle]
pub extern "C" fn twin_core_version() -> u8 {
    PROTOCOL_VERSION
}

/// CRC-16/MODBUS of `len` bytes at `data`. Null data hashes as empty.
#[no_mangle]
pub extern "C" fn twin_crc16_modbus(data: *const u8, len: usize) -> u16 {
    if data.is_null() {
        return crc16_modbus(&[]);
    }
    let bytes = unsafe { slice::from_raw_parts(data, len) };
    crc16_modbus(bytes)
}

/// Encode one packet into out_buf. Returns bytes written, or -1 on bad type, oversized
/// payload, null pointers or a short buffer.
#[no_mangle]
pub extern "C" fn twin_packet_encode(
    packet_type: u8,
    sequence: u16,
    payload: *const u8,
    payload_len: usize,
    out_buf: *mut u8,
    out_buf_len: usize,
) -> c_int {
    if out_buf.is_null() || (payload.is_null() && payload_len != 0) {
        return -1;
    }
    let Ok(packet_type) = PacketType::try_from(packet_type) else {
        return -1;
    };
    let payload = if payload_len == 0 {
        Vec::new()
    } else {
        unsafe { slice::from_raw_parts(payload, payload_len) }.to_vec()
    };
    let frame = match Packet::new(packet_type, sequence, payload) {
        Ok(p) => p.encode(),
        Err(_) => return -1,
    };
    if frame.len() > out_buf_len {
        return -1;
    }
    unsafe {
        out_buf.copy_from_nonoverlapping(frame.as_ptr(), frame.len());
    }
    frame.len() as c_int
}

/// Decode one packet from the front of `bytes`. Fills type, sequence and payload (up to
/// out_payload_cap; *out_payload_len gets the full length). Returns bytes consumed, 0 if
/// more input is needed, -1 on a malformed or corrupted frame.
#[no_mangle]
pub extern "C" fn twin_packet_decode(
    bytes: *const u8,
    len: usize,
    out_type: *mut u8,
    out_sequence: *mut u16,
    out_payload: *mut u8,
    out_payload_cap: usize,
    out_payload_len: *mut usize,
) -> c_int {
    if bytes.is_null() || out_type.is_null() || out_sequence.is_null() || out_payload_len.is_null() {
        return -1;
    }
    let input = unsafe { slice::from_raw_parts(bytes, len) };
    let (packet, consumed) = match decode_packet(input) {
        Ok(x) => x,
        Err(WireError::NeedMore) => return 0,
        Err(_) => return -1,
    };
    let n = packet.payload.len().min(out_payload_cap);
    if n > 0 && out_payload.is_null() {
        return -1;
    }
    unsafe {
        *out_type = packet.packet_type() as u8;
        *out_sequence = packet.sequence();
        *out_payload_len = packet.payload.len();
        if n > 0 {
            out_payload.copy_from_nonoverlapping(packet.payload.as_ptr(), n);
        }
    }
    consumed as c_int
}

// ── Core handle ──────────────────────────────────────────────────────────────

/// Channel send callback: `(ctx, data, len) -> success`.
pub type TwinSendFn = extern "C" fn(ctx: *mut c_void, data: *const u8, len: usize) -> bool;

struct CallbackSink {
    send: TwinSendFn,
    ctx: *mut c_void,
}

// The firmware owns ctx and drives the core from a single context.
unsafe impl Send for CallbackSink {}

impl ChannelSink for CallbackSink {
    fn send(&mut self, data: &[u8]) -> bool {
        (self.send)(self.ctx, data.as_ptr(), data.len())
    }
}

fn kind_of(channel: u16) -> Option<ChannelKind> {
    ChannelKind::from_id(channel)
}

fn policy_of(policy: u8) -> Option<Policy> {
    match policy {
        0 => Some(Policy::Speed),
        1 => Some(Policy::Stealth),
        2 => Some(Policy::Reliability),
        _ => None,
    }
}

/// Create a core with default configuration. Destroy with twin_core_destroy.
#[no_mangle]
pub extern "C" fn twin_core_create() -> *mut c_void {
    Box::into_raw(Box::new(TwinCore::with_defaults())) as *mut c_void
}

/// Destroy a core. No-op if h is null.
#[no_mangle]
pub extern "C" fn twin_core_destroy(h: *mut c_void) {
    if h.is_null() {
        return;
    }
    let _ = unsafe { Box::from_raw(h as *mut TwinCore) };
}

/// Attach a send callback to `channel` (0-6). Returns 0 on success, -1 on error.
#[no_mangle]
pub extern "C" fn twin_core_attach(h: *mut c_void, channel: u16, send: TwinSendFn, ctx: *mut c_void) -> c_int {
    if h.is_null() {
        return -1;
    }
    let Some(kind) = kind_of(channel) else {
        return -1;
    };
    let core = unsafe { &mut *(h as *mut TwinCore) };
    core.attach(kind, Box::new(CallbackSink { send, ctx }));
    0
}

/// Bring `channel` to CONNECTED. Returns 1 if connected, 0 if not, -1 on error.
#[no_mangle]
pub extern "C" fn twin_core_establish(h: *mut c_void, channel: u16, timeout_ms: u32) -> c_int {
    if h.is_null() {
        return -1;
    }
    let Some(kind) = kind_of(channel) else {
        return -1;
    };
    let core = unsafe { &mut *(h as *mut TwinCore) };
    core.establish(kind, timeout_ms) as c_int
}

/// Queue `len` bytes under the NUL-terminated `name`. The bytes are copied.
/// policy: 0 speed, 1 stealth, 2 reliability. Returns 0 on success, -1 on error or full queue.
#[no_mangle]
pub extern "C" fn twin_core_queue(
    h: *mut c_void,
    name: *const c_char,
    data: *const u8,
    len: usize,
    policy: u8,
    chunked: bool,
) -> c_int {
    if h.is_null() || name.is_null() || (data.is_null() && len != 0) {
        return -1;
    }
    let Some(policy) = policy_of(policy) else {
        return -1;
    };
    let name = match unsafe { std::ffi::CStr::from_ptr(name) }.to_str() {
        Ok(s) => s.to_owned(),
        Err(_) => return -1,
    };
    let bytes = if len == 0 {
        Bytes::new()
    } else {
        Bytes::copy_from_slice(unsafe { slice::from_raw_parts(data, len) })
    };
    let core = unsafe { &mut *(h as *mut TwinCore) };
    match core.queue_data(name, bytes, policy, chunked) {
        Ok(()) => 0,
        Err(_) => -1,
    }
}

/// Run one scheduler tick. Returns the number of jobs completed by it, or -1 if h is null.
#[no_mangle]
pub extern "C" fn twin_core_tick(h: *mut c_void) -> c_int {
    if h.is_null() {
        return -1;
    }
    let core = unsafe { &mut *(h as *mut TwinCore) };
    core.tick().completed.len() as c_int
}

/// 1 if the named job completed, 0 if not, -1 on error.
#[no_mangle]
pub extern "C" fn twin_core_is_complete(h: *mut c_void, name: *const c_char) -> c_int {
    if h.is_null() || name.is_null() {
        return -1;
    }
    let Ok(name) = unsafe { std::ffi::CStr::from_ptr(name) }.to_str() else {
        return -1;
    };
    let core = unsafe { &*(h as *const TwinCore) };
    core.is_complete(name) as c_int
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::HEADER_SIZE;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn version_exported() {
        assert_eq!(twin_core_version(), PROTOCOL_VERSION);
    }

    #[test]
    fn crc_matches_check_value() {
        let s = b"123456789";
        assert_eq!(twin_crc16_modbus(s.as_ptr(), s.len()), 0x4B37);
        assert_eq!(twin_crc16_modbus(std::ptr::null(), 5), 0xFFFF);
    }

    #[test]
    fn encode_then_decode() {
        let payload = [1u8, 2, 3];
        let mut frame = [0u8; 64];
        let n = twin_packet_encode(0x03, 77, payload.as_ptr(), payload.len(), frame.as_mut_ptr(), frame.len());
        assert_eq!(n as usize, HEADER_SIZE + 3);

        let (mut t, mut seq, mut plen) = (0u8, 0u16, 0usize);
        let mut out = [0u8; 2];
        let consumed = twin_packet_decode(
            frame.as_ptr(),
            n as usize,
            &mut t,
            &mut seq,
            out.as_mut_ptr(),
            out.len(),
            &mut plen,
        );
        assert_eq!(consumed, n);
        assert_eq!((t, seq, plen), (0x03, 77, 3));
        assert_eq!(out, [1, 2]);

        // Truncated input asks for more.
        let partial = twin_packet_decode(frame.as_ptr(), 5, &mut t, &mut seq, out.as_mut_ptr(), out.len(), &mut plen);
        assert_eq!(partial, 0);
    }

    #[test]
    fn encode_rejects_bad_input() {
        let mut frame = [0u8; 8];
        assert_eq!(twin_packet_encode(0x09, 0, std::ptr::null(), 0, frame.as_mut_ptr(), 64), -1);
        // Buffer too small for a header.
        assert_eq!(twin_packet_encode(0x01, 0, std::ptr::null(), 0, frame.as_mut_ptr(), frame.len()), -1);
    }

    static SENT: AtomicUsize = AtomicUsize::new(0);

    extern "C" fn count_bytes(_ctx: *mut c_void, _data: *const u8, len: usize) -> bool {
        SENT.fetch_add(len, Ordering::Relaxed);
        true
    }

    #[test]
    fn core_handle_runs_a_transfer() {
        let h = twin_core_create();
        assert!(!h.is_null());
        assert_eq!(twin_core_attach(h, ChannelKind::Nic.id(), count_bytes, std::ptr::null_mut()), 0);
        assert_eq!(twin_core_attach(h, 42, count_bytes, std::ptr::null_mut()), -1);
        assert_eq!(twin_core_establish(h, ChannelKind::Nic.id(), 10), 1);

        let name = std::ffi::CString::new("blob").unwrap();
        let data = vec![5u8; 1500];
        assert_eq!(twin_core_queue(h, name.as_ptr(), data.as_ptr(), data.len(), 0, true), 0);
        assert_eq!(twin_core_queue(h, name.as_ptr(), data.as_ptr(), data.len(), 9, true), -1);
        assert_eq!(twin_core_tick(h), 0);
        assert_eq!(twin_core_is_complete(h, name.as_ptr()), 0);
        assert_eq!(twin_core_tick(h), 1);
        assert_eq!(twin_core_is_complete(h, name.as_ptr()), 1);
        // 16-byte header + 4-byte name + body.
        assert_eq!(SENT.load(Ordering::Relaxed), 16 + 4 + 1500);
        twin_core_destroy(h);
        twin_core_destroy(std::ptr::null_mut());
    }
}
