//! # On-Disk Formats
//!
//! Every persistent structure in the engine: backend object headers
//! (super / data / checkpoint), the cache-device supers, and the journal
//! record headers, plus the fixed-size entry records embedded in them.
//!
//! ## Conventions
//!
//! - All integers are little-endian, via `zerocopy::little_endian` types.
//! - One magic constant identifies every record; a `type` field
//!   distinguishes them.
//! - Variable-length sections are located by `(offset, len)` byte pairs
//!   relative to the start of the enclosing buffer, decoded with
//!   [`decode_entries`].
//! - `{lba, len}` pairs are bit-packed into a single u64 the way the wire
//!   format has always stored them: object map entries use a 36/28 split,
//!   journal extents a 40/24 split.
//!
//! ## Layout
//!
//! ```text
//! backend object:            cache device (4 KiB pages):
//! +----------------+         +-------------------------+
//! | ObjHeader      |         | page 0: CacheSuper      |
//! | Data/Ckpt/Super|         | page 1: WriteSuper      |
//! |   header       |         | page 2: ReadSuper       |
//! | entry sections |         | metadata region         |
//! +----------------+         | journal ring            |
//! | payload sectors|         | read-cache map + bitmap |
//! +----------------+         | read-cache slots        |
//!                            +-------------------------+
//! ```
//!
//! All header structs are `#[repr(C)]` + `Unaligned` so they can be read in
//! place from unaligned I/O buffers; sizes are pinned by compile-time
//! assertions.

use crc::{Crc, CRC_32_ISCSI};
use eyre::{ensure, Result};
use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::error::EngineError;

/// Identifies every engine structure, on objects and on the cache device.
pub const MAGIC: u32 = 0x4B44_424F; // "OBDK"

/// Format version for all structures.
pub const FORMAT_VERSION: u32 = 1;

// Object types.
pub const OBJ_SUPER: u32 = 1;
pub const OBJ_DATA: u32 = 2;
pub const OBJ_CKPT: u32 = 3;

// Journal / cache-device record types.
pub const J_DATA: u32 = 10;
pub const J_CKPT: u32 = 11;
pub const J_PAD: u32 = 12;
pub const J_SUPER: u32 = 13;
pub const J_W_SUPER: u32 = 14;
pub const J_R_SUPER: u32 = 15;

pub const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

// ---------------------------------------------------------------------------
// Backend object headers
// ---------------------------------------------------------------------------

/// Leading header of every backend object.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct ObjHeader {
    pub magic: U32,
    pub version: U32,
    pub vol_uuid: [u8; 16],
    pub obj_type: U32,
    pub seq: U32,
    pub hdr_sectors: U32,
    pub data_sectors: U32,
}

pub const OBJ_HEADER_SIZE: usize = 40;
const _: () = assert!(std::mem::size_of::<ObjHeader>() == OBJ_HEADER_SIZE);

impl ObjHeader {
    pub fn new(vol_uuid: [u8; 16], obj_type: u32, seq: u32, hdr_sectors: u32, data_sectors: u32) -> Self {
        Self {
            magic: U32::new(MAGIC),
            version: U32::new(FORMAT_VERSION),
            vol_uuid,
            obj_type: U32::new(obj_type),
            seq: U32::new(seq),
            hdr_sectors: U32::new(hdr_sectors),
            data_sectors: U32::new(data_sectors),
        }
    }

    /// Parse and validate magic/version. Object type is the caller's check.
    pub fn parse(bytes: &[u8]) -> Result<&Self> {
        let hdr = parse_struct::<Self>(bytes, "ObjHeader")?;
        ensure!(
            hdr.magic.get() == MAGIC,
            EngineError::Format(format!("bad object magic {:#x}", hdr.magic.get()))
        );
        ensure!(
            hdr.version.get() == FORMAT_VERSION,
            EngineError::Format(format!("unsupported object version {}", hdr.version.get()))
        );
        Ok(hdr)
    }
}

/// Super-object body: volume identity plus checkpoint/clone/snapshot lists.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct SuperHeader {
    /// Volume size in sectors.
    pub vol_size: U64,
    pub total_sectors: U64,
    pub live_sectors: U64,
    /// Next allocatable object sequence number.
    pub next_obj: U32,
    pub ckpts_offset: U32,
    pub ckpts_len: U32,
    pub clones_offset: U32,
    pub clones_len: U32,
    pub snaps_offset: U32,
    pub snaps_len: U32,
    _reserved: [u8; 4],
}

pub const SUPER_HEADER_SIZE: usize = 56;
const _: () = assert!(std::mem::size_of::<SuperHeader>() == SUPER_HEADER_SIZE);

impl SuperHeader {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        vol_size: u64,
        next_obj: u32,
        ckpts_offset: u32,
        ckpts_len: u32,
        clones_offset: u32,
        clones_len: u32,
        snaps_offset: u32,
        snaps_len: u32,
    ) -> Self {
        Self {
            vol_size: U64::new(vol_size),
            total_sectors: U64::new(0),
            live_sectors: U64::new(0),
            next_obj: U32::new(next_obj),
            ckpts_offset: U32::new(ckpts_offset),
            ckpts_len: U32::new(ckpts_len),
            clones_offset: U32::new(clones_offset),
            clones_len: U32::new(clones_len),
            snaps_offset: U32::new(snaps_offset),
            snaps_len: U32::new(snaps_len),
            _reserved: [0; 4],
        }
    }

    pub fn parse(bytes: &[u8]) -> Result<&Self> {
        parse_struct::<Self>(bytes, "SuperHeader")
    }
}

/// DATA-object body: links to the previous data object, the checkpoint
/// list in force when it was written, cleaned objects, and the extent map.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct DataHeader {
    pub last_data_obj: U32,
    pub ckpts_offset: U32,
    pub ckpts_len: U32,
    pub objs_cleaned_offset: U32,
    pub objs_cleaned_len: U32,
    pub map_offset: U32,
    pub map_len: U32,
}

pub const DATA_HEADER_SIZE: usize = 28;
const _: () = assert!(std::mem::size_of::<DataHeader>() == DATA_HEADER_SIZE);

impl DataHeader {
    pub fn parse(bytes: &[u8]) -> Result<&Self> {
        parse_struct::<Self>(bytes, "DataHeader")
    }
}

/// CKPT-object body: checkpoint list, object table, deferred deletes, and
/// the full object map.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct CkptHeader {
    pub ckpts_offset: U32,
    pub ckpts_len: U32,
    pub objs_offset: U32,
    pub objs_len: U32,
    pub deletes_offset: U32,
    pub deletes_len: U32,
    pub map_offset: U32,
    pub map_len: U32,
}

pub const CKPT_HEADER_SIZE: usize = 32;
const _: () = assert!(std::mem::size_of::<CkptHeader>() == CKPT_HEADER_SIZE);

impl CkptHeader {
    pub fn parse(bytes: &[u8]) -> Result<&Self> {
        parse_struct::<Self>(bytes, "CkptHeader")
    }
}

// ---------------------------------------------------------------------------
// Entry records embedded in object headers
// ---------------------------------------------------------------------------

/// DATA-object map entry: `{lba:36, len:28}` packed into one u64.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct DataMapEntry(U64);

const DATA_MAP_LEN_SHIFT: u32 = 36;
const DATA_MAP_LBA_MASK: u64 = (1 << DATA_MAP_LEN_SHIFT) - 1;

impl DataMapEntry {
    pub fn new(lba: u64, sectors: u64) -> Self {
        debug_assert!(lba <= DATA_MAP_LBA_MASK);
        debug_assert!(sectors < (1 << 28));
        Self(U64::new(lba | (sectors << DATA_MAP_LEN_SHIFT)))
    }

    pub fn lba(&self) -> u64 {
        self.0.get() & DATA_MAP_LBA_MASK
    }

    pub fn sectors(&self) -> u64 {
        self.0.get() >> DATA_MAP_LEN_SHIFT
    }
}

/// Checkpoint object-table entry.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct CkptObjEntry {
    pub seq: U32,
    pub hdr_sectors: U32,
    pub data_sectors: U32,
    pub live_sectors: U32,
}

const _: () = assert!(std::mem::size_of::<CkptObjEntry>() == 16);

/// Checkpoint map entry: `{lba:36, len:28}` packed, plus object and offset.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct CkptMapEntry {
    packed: U64,
    pub obj: U32,
    pub offset: U32,
}

const _: () = assert!(std::mem::size_of::<CkptMapEntry>() == 16);

impl CkptMapEntry {
    pub fn new(lba: u64, sectors: u64, obj: u32, offset: u32) -> Self {
        debug_assert!(lba <= DATA_MAP_LBA_MASK);
        debug_assert!(sectors < (1 << 28));
        Self {
            packed: U64::new(lba | (sectors << DATA_MAP_LEN_SHIFT)),
            obj: U32::new(obj),
            offset: U32::new(offset),
        }
    }

    pub fn lba(&self) -> u64 {
        self.packed.get() & DATA_MAP_LBA_MASK
    }

    pub fn sectors(&self) -> u64 {
        self.packed.get() >> DATA_MAP_LEN_SHIFT
    }
}

/// Cleaned-object record in a DATA header.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct CleanedEntry {
    pub seq: U32,
    pub was_deleted: U32,
}

/// Deferred object deletion, declared by the format; no code path drives it.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct DeferredDelete {
    pub seq: U32,
    pub time: U32,
}

/// Snapshot record. Parsed and carried; snapshot semantics live elsewhere.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct SnapInfo {
    pub snap_uuid: [u8; 16],
    pub seq: U32,
}

/// Clone record. Parsed and carried; clone semantics live elsewhere.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct CloneInfo {
    pub vol_uuid: [u8; 16],
    pub last_seq: U32,
    /// NUL-padded source volume name.
    pub name: [u8; 28],
}

const _: () = assert!(std::mem::size_of::<CloneInfo>() == 48);

// ---------------------------------------------------------------------------
// Cache-device structures
// ---------------------------------------------------------------------------

/// Journal record header: one page in front of a DATA payload, a PAD filling
/// the ring tail, or an on-SSD CKPT.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct JournalHeader {
    pub magic: U32,
    pub rec_type: U32,
    pub version: U32,
    pub vol_uuid: [u8; 16],
    /// Monotonic record sequence number.
    pub seq: U64,
    /// Total record length in pages, header included.
    pub len_pages: U32,
    /// CRC-32 of the header page with this field zeroed.
    pub crc32: U32,
    pub extent_offset: U32,
    pub extent_len: U32,
    _reserved: [u8; 12],
}

pub const JOURNAL_HEADER_SIZE: usize = 64;
const _: () = assert!(std::mem::size_of::<JournalHeader>() == JOURNAL_HEADER_SIZE);

impl JournalHeader {
    pub fn new(vol_uuid: [u8; 16], rec_type: u32, seq: u64, len_pages: u32) -> Self {
        Self {
            magic: U32::new(MAGIC),
            rec_type: U32::new(rec_type),
            version: U32::new(FORMAT_VERSION),
            vol_uuid,
            seq: U64::new(seq),
            len_pages: U32::new(len_pages),
            crc32: U32::new(0),
            extent_offset: U32::new(0),
            extent_len: U32::new(0),
            _reserved: [0; 12],
        }
    }

    /// Parse without semantic validation; replay checks magic/type/seq/crc
    /// itself because an invalid header is the normal end-of-log signal.
    pub fn parse(bytes: &[u8]) -> Result<&Self> {
        parse_struct::<Self>(bytes, "JournalHeader")
    }

    pub fn is_valid_magic(&self) -> bool {
        self.magic.get() == MAGIC && self.version.get() == FORMAT_VERSION
    }
}

/// CRC-32 of a journal header page with the crc field zeroed.
pub fn journal_page_crc(page: &[u8]) -> u32 {
    const CRC_OFFSET: usize = std::mem::offset_of!(JournalHeader, crc32);
    let mut digest = CRC32.digest();
    digest.update(&page[..CRC_OFFSET]);
    digest.update(&[0u8; 4]);
    digest.update(&page[CRC_OFFSET + 4..]);
    digest.finalize()
}

/// Journal extent: `{lba:40, len:24}` packed into one u64.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct JournalExtent(U64);

const J_EXTENT_LEN_SHIFT: u32 = 40;
const J_EXTENT_LBA_MASK: u64 = (1 << J_EXTENT_LEN_SHIFT) - 1;

impl JournalExtent {
    pub fn new(lba: u64, sectors: u64) -> Self {
        debug_assert!(lba <= J_EXTENT_LBA_MASK);
        debug_assert!(sectors < (1 << 24));
        Self(U64::new(lba | (sectors << J_EXTENT_LEN_SHIFT)))
    }

    pub fn lba(&self) -> u64 {
        self.0.get() & J_EXTENT_LBA_MASK
    }

    pub fn sectors(&self) -> u64 {
        self.0.get() >> J_EXTENT_LEN_SHIFT
    }
}

/// Persisted forward-map entry: journal extent plus its SSD sector.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct MapEntry {
    ext: JournalExtent,
    pub plba: U64,
}

const _: () = assert!(std::mem::size_of::<MapEntry>() == 16);

impl MapEntry {
    pub fn new(lba: u64, sectors: u64, plba: u64) -> Self {
        Self {
            ext: JournalExtent::new(lba, sectors),
            plba: U64::new(plba),
        }
    }

    pub fn lba(&self) -> u64 {
        self.ext.lba()
    }

    pub fn sectors(&self) -> u64 {
        self.ext.sectors()
    }
}

/// Persisted journal record boundary: first page and length in pages.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct LengthEntry {
    pub page: U32,
    pub len: U32,
}

/// Cache-device page 0: points at the write and read supers.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct CacheSuper {
    pub magic: U32,
    pub rec_type: U32,
    pub version: U32,
    pub vol_uuid: [u8; 16],
    pub write_super: U32,
    pub read_super: U32,
    pub backend_kind: U32,
}

const _: () = assert!(std::mem::size_of::<CacheSuper>() == 40);

impl CacheSuper {
    pub fn new(vol_uuid: [u8; 16], write_super: u32, read_super: u32, backend_kind: u32) -> Self {
        Self {
            magic: U32::new(MAGIC),
            rec_type: U32::new(J_SUPER),
            version: U32::new(FORMAT_VERSION),
            vol_uuid,
            write_super: U32::new(write_super),
            read_super: U32::new(read_super),
            backend_kind: U32::new(backend_kind),
        }
    }

    pub fn parse(bytes: &[u8]) -> Result<&Self> {
        let s = parse_struct::<Self>(bytes, "CacheSuper")?;
        ensure!(
            s.magic.get() == MAGIC && s.rec_type.get() == J_SUPER,
            EngineError::Format("cache device is not formatted".into())
        );
        ensure!(
            s.version.get() == FORMAT_VERSION,
            EngineError::Format(format!("unsupported cache version {}", s.version.get()))
        );
        Ok(s)
    }
}

/// Write-cache superblock: ring bounds, cursor state, and the location of
/// the last checkpoint's map and record-length lists.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct WriteSuper {
    pub magic: U32,
    pub rec_type: U32,
    pub version: U32,
    pub vol_uuid: [u8; 16],
    /// Sequence number the next journal record will carry.
    pub seq: U64,
    /// Checkpoint metadata region, in pages.
    pub meta_base: U32,
    pub meta_limit: U32,
    /// Journal ring, in pages.
    pub base: U32,
    pub limit: U32,
    /// Next page to allocate.
    pub next: U32,
    /// Oldest live record.
    pub oldest: U32,
    pub map_start: U32,
    pub map_blocks: U32,
    pub map_entries: U32,
    pub len_start: U32,
    pub len_blocks: U32,
    pub len_entries: U32,
    _reserved: [u8; 4],
}

const _: () = assert!(std::mem::size_of::<WriteSuper>() == 88);

impl WriteSuper {
    pub fn new(vol_uuid: [u8; 16], meta_base: u32, meta_limit: u32, base: u32, limit: u32) -> Self {
        Self {
            magic: U32::new(MAGIC),
            rec_type: U32::new(J_W_SUPER),
            version: U32::new(FORMAT_VERSION),
            vol_uuid,
            seq: U64::new(1),
            meta_base: U32::new(meta_base),
            meta_limit: U32::new(meta_limit),
            base: U32::new(base),
            limit: U32::new(limit),
            next: U32::new(base),
            oldest: U32::new(base),
            map_start: U32::new(0),
            map_blocks: U32::new(0),
            map_entries: U32::new(0),
            len_start: U32::new(0),
            len_blocks: U32::new(0),
            len_entries: U32::new(0),
            _reserved: [0; 4],
        }
    }

    pub fn parse(bytes: &[u8]) -> Result<&Self> {
        let s = parse_struct::<Self>(bytes, "WriteSuper")?;
        ensure!(
            s.magic.get() == MAGIC && s.rec_type.get() == J_W_SUPER,
            EngineError::Format("bad write-cache superblock".into())
        );
        Ok(s)
    }
}

/// Read-cache superblock: chunk geometry and metadata locations.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct ReadSuper {
    pub magic: U32,
    pub rec_type: U32,
    pub version: U32,
    pub vol_uuid: [u8; 16],
    /// Chunk size in sectors.
    pub unit_sectors: U32,
    /// First page of slot data.
    pub base: U32,
    /// Number of slots.
    pub units: U32,
    pub map_start: U32,
    pub map_blocks: U32,
    pub bitmap_start: U32,
    pub bitmap_blocks: U32,
}

const _: () = assert!(std::mem::size_of::<ReadSuper>() == 56);

impl ReadSuper {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        vol_uuid: [u8; 16],
        unit_sectors: u32,
        base: u32,
        units: u32,
        map_start: u32,
        map_blocks: u32,
        bitmap_start: u32,
        bitmap_blocks: u32,
    ) -> Self {
        Self {
            magic: U32::new(MAGIC),
            rec_type: U32::new(J_R_SUPER),
            version: U32::new(FORMAT_VERSION),
            vol_uuid,
            unit_sectors: U32::new(unit_sectors),
            base: U32::new(base),
            units: U32::new(units),
            map_start: U32::new(map_start),
            map_blocks: U32::new(map_blocks),
            bitmap_start: U32::new(bitmap_start),
            bitmap_blocks: U32::new(bitmap_blocks),
        }
    }

    pub fn parse(bytes: &[u8]) -> Result<&Self> {
        let s = parse_struct::<Self>(bytes, "ReadSuper")?;
        ensure!(
            s.magic.get() == MAGIC && s.rec_type.get() == J_R_SUPER,
            EngineError::Format("bad read-cache superblock".into())
        );
        Ok(s)
    }
}

/// Read-cache flat-map slot entry on SSD: `(0, 0)` means empty.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct FlatMapEntry {
    pub obj: U32,
    pub chunk: U32,
}

impl FlatMapEntry {
    pub fn empty() -> Self {
        Self {
            obj: U32::new(0),
            chunk: U32::new(0),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.obj.get() == 0 && self.chunk.get() == 0
    }
}

// ---------------------------------------------------------------------------
// Codec helpers
// ---------------------------------------------------------------------------

fn parse_struct<'a, T: FromBytes + KnownLayout + Immutable + Unaligned>(
    bytes: &'a [u8],
    type_name: &str,
) -> Result<&'a T> {
    let size = std::mem::size_of::<T>();
    ensure!(
        bytes.len() >= size,
        EngineError::Format(format!(
            "buffer too small for {type_name}: {} < {size}",
            bytes.len()
        ))
    );
    T::ref_from_bytes(&bytes[..size])
        .map_err(|e| EngineError::Format(format!("failed to parse {type_name}: {e:?}")).into())
}

/// Decode a `(offset, len)`-addressed array of fixed-size records.
pub fn decode_entries<T>(buf: &[u8], offset: u32, len: u32) -> Result<Vec<T>>
where
    T: FromBytes + KnownLayout + Immutable + Unaligned + Copy,
{
    let (offset, len) = (offset as usize, len as usize);
    let size = std::mem::size_of::<T>();
    if len == 0 {
        return Ok(Vec::new());
    }
    ensure!(
        offset.checked_add(len).is_some_and(|end| end <= buf.len()),
        EngineError::Format(format!(
            "entry section [{offset}, +{len}) outside buffer of {}",
            buf.len()
        ))
    );
    ensure!(
        len % size == 0,
        EngineError::Format(format!(
            "entry section length {len} not a multiple of record size {size}"
        ))
    );
    let mut out = Vec::with_capacity(len / size);
    for chunk in buf[offset..offset + len].chunks_exact(size) {
        let rec = T::read_from_bytes(chunk)
            .map_err(|e| EngineError::Format(format!("bad entry record: {e:?}")))?;
        out.push(rec);
    }
    Ok(out)
}

/// Encode a slice of fixed-size records to bytes.
pub fn encode_entries<T: IntoBytes + Immutable>(items: &[T]) -> Vec<u8> {
    items.as_bytes().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_sizes_pinned() {
        assert_eq!(std::mem::size_of::<ObjHeader>(), 40);
        assert_eq!(std::mem::size_of::<SuperHeader>(), 56);
        assert_eq!(std::mem::size_of::<DataHeader>(), 28);
        assert_eq!(std::mem::size_of::<CkptHeader>(), 32);
        assert_eq!(std::mem::size_of::<JournalHeader>(), 64);
        assert_eq!(std::mem::size_of::<WriteSuper>(), 88);
        assert_eq!(std::mem::size_of::<ReadSuper>(), 56);
        assert_eq!(std::mem::size_of::<CacheSuper>(), 40);
        assert_eq!(std::mem::size_of::<MapEntry>(), 16);
        assert_eq!(std::mem::size_of::<LengthEntry>(), 8);
        assert_eq!(std::mem::size_of::<FlatMapEntry>(), 8);
    }

    #[test]
    fn test_obj_header_round_trip() {
        let uuid = [7u8; 16];
        let hdr = ObjHeader::new(uuid, OBJ_DATA, 42, 8, 1024);
        let bytes = hdr.as_bytes().to_vec();
        let parsed = ObjHeader::parse(&bytes).unwrap();
        assert_eq!(parsed.obj_type.get(), OBJ_DATA);
        assert_eq!(parsed.seq.get(), 42);
        assert_eq!(parsed.hdr_sectors.get(), 8);
        assert_eq!(parsed.data_sectors.get(), 1024);
        assert_eq!(parsed.vol_uuid, uuid);
    }

    #[test]
    fn test_obj_header_rejects_bad_magic() {
        let hdr = ObjHeader::new([0; 16], OBJ_DATA, 1, 8, 0);
        let mut bytes = hdr.as_bytes().to_vec();
        bytes[0] ^= 0xff;
        assert!(ObjHeader::parse(&bytes).is_err());
    }

    #[test]
    fn test_packed_entries() {
        let e = DataMapEntry::new(0x8_1234_5678, 1000);
        assert_eq!(e.lba(), 0x8_1234_5678);
        assert_eq!(e.sectors(), 1000);

        let j = JournalExtent::new(0xAB_CDEF_0123, 255);
        assert_eq!(j.lba(), 0xAB_CDEF_0123);
        assert_eq!(j.sectors(), 255);

        let m = CkptMapEntry::new(12345, 64, 9, 800);
        assert_eq!(m.lba(), 12345);
        assert_eq!(m.sectors(), 64);
        assert_eq!(m.obj.get(), 9);
        assert_eq!(m.offset.get(), 800);
    }

    #[test]
    fn test_decode_entries_bounds() {
        let entries = vec![LengthEntry {
            page: U32::new(3),
            len: U32::new(5),
        }];
        let bytes = encode_entries(&entries);

        let ok: Vec<LengthEntry> = decode_entries(&bytes, 0, bytes.len() as u32).unwrap();
        assert_eq!(ok, entries);

        // Section past the end of the buffer.
        let err = decode_entries::<LengthEntry>(&bytes, 4, bytes.len() as u32);
        assert!(err.is_err());

        // Length not a record multiple.
        let err = decode_entries::<LengthEntry>(&bytes, 0, 6);
        assert!(err.is_err());

        // Empty section decodes empty regardless of offset.
        let ok: Vec<LengthEntry> = decode_entries(&bytes, 9999, 0).unwrap();
        assert!(ok.is_empty());
    }

    #[test]
    fn test_journal_crc_detects_flips() {
        let mut page = vec![0u8; 4096];
        let hdr = JournalHeader::new([1; 16], J_DATA, 77, 9);
        page[..JOURNAL_HEADER_SIZE].copy_from_slice(hdr.as_bytes());

        let crc = journal_page_crc(&page);
        let crc_off = std::mem::offset_of!(JournalHeader, crc32);
        page[crc_off..crc_off + 4].copy_from_slice(&crc.to_le_bytes());

        // Valid: recomputing with the field zeroed matches the stored value.
        assert_eq!(journal_page_crc(&page), crc);

        page[100] ^= 1;
        assert_ne!(journal_page_crc(&page), crc);
    }

    #[test]
    fn test_write_super_round_trip() {
        let mut s = WriteSuper::new([3; 16], 3, 11, 11, 100);
        s.next = U32::new(17);
        let bytes = s.as_bytes().to_vec();
        let parsed = WriteSuper::parse(&bytes).unwrap();
        assert_eq!(parsed.next.get(), 17);
        assert_eq!(parsed.base.get(), 11);
        assert_eq!(parsed.oldest.get(), 11);
        assert_eq!(parsed.seq.get(), 1);
    }
}
