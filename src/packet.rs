//! Fixed-size kernel packet buffers and a bounded freelist pool (C5).
//!
//! The kernel writes one `autofs_packet` per request into the pipe the
//! dispatcher reads. Each packet is handed to a worker pool and must be
//! freed back to this pool (or dropped, past the high-water cap) once the
//! handler has acknowledged it. `allocate`/`free` share one mutex; the
//! pool only ever holds a handful of entries at once, so there is no
//! separate batch path to avoid contending it.

use parking_lot::Mutex;

/// Only the autofs v4 packet types this daemon answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    Missing,
    ExpireMulti,
    Unknown(u32),
}

/// One kernel protocol request, already parsed out of the raw pipe bytes.
#[derive(Debug, Clone)]
pub struct Packet {
    pub kind: PacketKind,
    pub proto_version: u32,
    pub token: u32,
    pub len: usize,
    pub name: Vec<u8>,
}

/// `sizeof(struct autofs_packet_missing)` == `sizeof(struct
/// autofs_packet_expire_multi)` for protocol v4: a two-int header
/// (`proto_version`, `type`), a `wait_queue_token` (u32), a `len` (i32),
/// and a `name[NAME_MAX+1]` buffer.
pub const WIRE_SIZE: usize = 4 + 4 + 4 + 4 + (crate::proto::NAME_MAX + 1);

impl Packet {
    pub fn empty() -> Self {
        Self {
            kind: PacketKind::Unknown(0),
            proto_version: 0,
            token: 0,
            len: 0,
            name: Vec::new(),
        }
    }

    /// Parse one wire-format record, as read verbatim off the kernel pipe.
    pub fn parse(buf: &[u8; WIRE_SIZE]) -> Self {
        let proto_version = u32::from_ne_bytes(buf[0..4].try_into().unwrap());
        let ty = u32::from_ne_bytes(buf[4..8].try_into().unwrap());
        let token = u32::from_ne_bytes(buf[8..12].try_into().unwrap());
        let len = i32::from_ne_bytes(buf[12..16].try_into().unwrap()).max(0) as usize;
        let name = buf[16..16 + crate::proto::NAME_MAX + 1].to_vec();

        let kind = match ty {
            crate::proto::AUTOFS_TYPE_MISSING => PacketKind::Missing,
            crate::proto::AUTOFS_TYPE_EXPIRE_MULTI => PacketKind::ExpireMulti,
            other => PacketKind::Unknown(other),
        };

        Self {
            kind,
            proto_version,
            token,
            len,
            name,
        }
    }

    /// Like [`Self::parse`], but fills an existing (pool-allocated) packet
    /// in place, reusing its `name` buffer's allocation instead of
    /// allocating a fresh `Vec`.
    pub fn fill_from_wire(&mut self, buf: &[u8; WIRE_SIZE]) {
        self.proto_version = u32::from_ne_bytes(buf[0..4].try_into().unwrap());
        let ty = u32::from_ne_bytes(buf[4..8].try_into().unwrap());
        self.token = u32::from_ne_bytes(buf[8..12].try_into().unwrap());
        self.len = i32::from_ne_bytes(buf[12..16].try_into().unwrap()).max(0) as usize;
        self.kind = match ty {
            crate::proto::AUTOFS_TYPE_MISSING => PacketKind::Missing,
            crate::proto::AUTOFS_TYPE_EXPIRE_MULTI => PacketKind::ExpireMulti,
            other => PacketKind::Unknown(other),
        };
        self.name.clear();
        self.name
            .extend_from_slice(&buf[16..16 + crate::proto::NAME_MAX + 1]);
    }
}

const PACKET_CACHE_MAX: usize = 64;

/// Bounded freelist of reusable [`Packet`] buffers.
pub struct PacketPool {
    free: Mutex<Vec<Packet>>,
}

impl Default for PacketPool {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketPool {
    pub fn new() -> Self {
        Self {
            free: Mutex::new(Vec::new()),
        }
    }

    /// Take one packet buffer from the pool, allocating a fresh one if
    /// the freelist is empty.
    pub fn allocate(&self) -> Packet {
        let mut free = self.free.lock();
        free.pop().unwrap_or_else(Packet::empty)
    }

    /// Return a packet to the pool; dropped on the floor once the pool is
    /// at its cap.
    pub fn free(&self, mut packet: Packet) {
        let mut free = self.free.lock();
        if free.len() < PACKET_CACHE_MAX {
            packet.name.clear();
            free.push(packet);
        }
    }

    /// Drain and drop the entire freelist, used on shutdown.
    pub fn drain(&self) {
        self.free.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn freed_packet_is_reused() {
        let pool = PacketPool::new();
        let p = pool.allocate();
        pool.free(p);
        assert_eq!(pool.free.lock().len(), 1);
        let _p2 = pool.allocate();
        assert_eq!(pool.free.lock().len(), 0);
    }

    #[test]
    fn pool_caps_at_high_water_mark() {
        let pool = PacketPool::new();
        for _ in 0..(PACKET_CACHE_MAX + 10) {
            pool.free(Packet::empty());
        }
        assert_eq!(pool.free.lock().len(), PACKET_CACHE_MAX);
    }

    #[test]
    fn parse_missing_packet() {
        let mut buf = [0u8; WIRE_SIZE];
        buf[0..4].copy_from_slice(&4u32.to_ne_bytes());
        buf[4..8].copy_from_slice(&crate::proto::AUTOFS_TYPE_MISSING.to_ne_bytes());
        buf[8..12].copy_from_slice(&7u32.to_ne_bytes());
        buf[12..16].copy_from_slice(&1i32.to_ne_bytes());
        buf[16] = b'a';

        let packet = Packet::parse(&buf);
        assert_eq!(packet.kind, PacketKind::Missing);
        assert_eq!(packet.proto_version, 4);
        assert_eq!(packet.token, 7);
        assert_eq!(packet.len, 1);
        assert_eq!(&packet.name[..1], b"a");
    }

    #[test]
    fn parse_unknown_type() {
        let mut buf = [0u8; WIRE_SIZE];
        buf[4..8].copy_from_slice(&0xFFu32.to_ne_bytes());
        let packet = Packet::parse(&buf);
        assert_eq!(packet.kind, PacketKind::Unknown(0xFF));
    }
}
