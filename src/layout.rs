//! On-disk control structures: the file header, the lock block, and the
//! per-revision trailer.
//!
//! The byte layout here is the compatibility surface of the format.  All
//! multi-byte integers are little-endian, offsets are fixed, and every
//! structure is written through the explicit `encode`/`decode` pairs below.
//!
//! # Warning
//!
//! - Do not add fields to these structures.
//! - Do not remove fields from these structures.
//! - Do not change the type, order, or offset of fields in these structures.
//!
//! Doing so changes the serialized representation, and existing store files
//! will stop validating.

use uuid::Uuid;

use crate::address::{Address, TypedAddress};

/// Identifies a store file.  The trailing byte is the format generation and
/// moves in lockstep with `FORMAT_VERSION`.
pub const MAGIC: [u8; 8] = *b"strataf1";

pub const FORMAT_VERSION: u16 = 1;

/// Size of the header at file offset 0.
pub const HEADER_SIZE: u64 = 64;

/// Size of the lock block that immediately follows the header.
pub const LOCK_BLOCK_SIZE: u64 = 16;

/// Bytes occupied by header plus lock block.  The generation-0 trailer of a
/// fresh store starts exactly here.
pub const LEADER_SIZE: u64 = HEADER_SIZE + LOCK_BLOCK_SIZE;

/// Size of a revision trailer.
pub const TRAILER_SIZE: u64 = 64;

/// Number of index-root slots carried by every trailer.
pub const INDEX_SLOT_COUNT: usize = 4;

/// Offset of the `footer_pos` slot within the header.  This is the single
/// mutable word of the format: it is updated with a release-ordered atomic
/// store at commit and read with an acquire-ordered load everywhere else, so
/// it must stay 8-byte aligned.
pub const FOOTER_POS_OFFSET: u64 = 32;

/// Absolute file offset of the vacuum-lock bytes inside the lock block.
/// These bytes are never interpreted; they exist solely as the target range
/// for OS byte-range locks coordinating readers, the writer, and the
/// collector.
pub const VACUUM_LOCK_OFFSET: u64 = HEADER_SIZE;

/// Length of the vacuum-lock byte range.
pub const VACUUM_LOCK_LEN: u64 = 4;

/// Number of leading characters of the base-32 store UUID used as the sync
/// name.
pub const SYNC_NAME_LENGTH: usize = 20;

const HEADER_MAGIC_OFFSET: usize = 0;
const HEADER_VERSION_OFFSET: usize = 8;
const HEADER_FLAGS_OFFSET: usize = 10;
const HEADER_UUID_OFFSET: usize = 16;

const TRAILER_GENERATION_OFFSET: usize = 0;
const TRAILER_TIME_OFFSET: usize = 8;
const TRAILER_PREV_OFFSET: usize = 16;
const TRAILER_INDEX_ROOTS_OFFSET: usize = 24;
const TRAILER_CRC_OFFSET: usize = 56;

/// CRC-32 over `bytes` in the store convention: the 0xEDB88320 reflected
/// table with the register seeded to zero and the final value XORed with
/// all-ones.  `Hasher::new_with_initial` takes a finalized CRC value and
/// un-XORs it internally, so seeding it with `u32::MAX` starts the register
/// at zero.
pub fn store_checksum(bytes: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new_with_initial(u32::MAX);
    hasher.update(bytes);
    hasher.finalize()
}

/// The store header at file offset 0.
///
/// Written once during new-store construction.  The only field ever modified
/// afterwards is `footer_pos`, and that is done through an atomic store into
/// the mapped header bytes, never through `encode`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Header {
    pub version: u16,
    pub flags: u16,
    pub uuid: Uuid,
    pub footer_pos: TypedAddress<Trailer>,
}

impl Header {
    pub fn new(footer_pos: TypedAddress<Trailer>) -> Self {
        Header {
            version: FORMAT_VERSION,
            flags: 0,
            uuid: Uuid::new_v4(),
            footer_pos,
        }
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE as usize] {
        let mut buf = [0u8; HEADER_SIZE as usize];
        buf[HEADER_MAGIC_OFFSET..HEADER_MAGIC_OFFSET + 8].copy_from_slice(&MAGIC);
        buf[HEADER_VERSION_OFFSET..HEADER_VERSION_OFFSET + 2]
            .copy_from_slice(&self.version.to_le_bytes());
        buf[HEADER_FLAGS_OFFSET..HEADER_FLAGS_OFFSET + 2]
            .copy_from_slice(&self.flags.to_le_bytes());
        buf[HEADER_UUID_OFFSET..HEADER_UUID_OFFSET + 16]
            .copy_from_slice(&self.uuid.as_u128().to_le_bytes());
        buf[FOOTER_POS_OFFSET as usize..FOOTER_POS_OFFSET as usize + 8]
            .copy_from_slice(&self.footer_pos.absolute().to_le_bytes());
        buf
    }

    /// Decodes a header, returning `None` when the magic bytes or format
    /// version do not match.
    pub fn decode(buf: &[u8; HEADER_SIZE as usize]) -> Option<Header> {
        if buf[HEADER_MAGIC_OFFSET..HEADER_MAGIC_OFFSET + 8] != MAGIC {
            return None;
        }
        let version = read_u16(buf, HEADER_VERSION_OFFSET);
        if version != FORMAT_VERSION {
            return None;
        }
        Some(Header {
            version,
            flags: read_u16(buf, HEADER_FLAGS_OFFSET),
            uuid: Uuid::from_u128(u128::from_le_bytes(
                buf[HEADER_UUID_OFFSET..HEADER_UUID_OFFSET + 16]
                    .try_into()
                    .expect("slice length is 16"),
            )),
            footer_pos: TypedAddress::make(read_u64(buf, FOOTER_POS_OFFSET as usize)),
        })
    }
}

/// The lock block sitting between the header and the first trailer.
///
/// Its bytes are never logically interpreted; the structure exists so that
/// the vacuum-lock range has a stable, documented home on disk.
#[derive(Clone, Copy, Debug, Default)]
pub struct LockBlock;

impl LockBlock {
    pub fn encode(&self) -> [u8; LOCK_BLOCK_SIZE as usize] {
        [0u8; LOCK_BLOCK_SIZE as usize]
    }
}

/// The fixed-size record terminating every revision.
///
/// Trailers are write-once: after the revision that owns one commits, its
/// bytes never change.  They form a singly-linked list through
/// `prev_generation`, newest first, terminating at generation zero.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Trailer {
    /// Revision number.  Zero for the empty revision written at store
    /// creation, strictly increasing along the chain.
    pub generation: u32,
    /// Commit time, milliseconds since the Unix epoch.  Non-decreasing along
    /// the chain.
    pub time: u64,
    /// Address of the previous revision's trailer; null for generation zero.
    /// Always strictly less than this trailer's own address.
    pub prev_generation: TypedAddress<Trailer>,
    /// Root addresses of the externally-owned indexes, null when a slot has
    /// never been written.
    pub index_roots: [Address; INDEX_SLOT_COUNT],
    /// CRC over every preceding field, computed last at commit.
    pub crc: u32,
}

impl Trailer {
    /// A generation-zero trailer stamped with the given time.
    pub fn initial(time: u64) -> Self {
        let mut trailer = Trailer {
            generation: 0,
            time,
            prev_generation: TypedAddress::NULL,
            index_roots: [Address::NULL; INDEX_SLOT_COUNT],
            crc: 0,
        };
        trailer.crc = trailer.calculate_crc();
        trailer
    }

    /// CRC over the encoded fields preceding the `crc` slot.
    pub fn calculate_crc(&self) -> u32 {
        let encoded = self.encode_fields();
        store_checksum(&encoded[..TRAILER_CRC_OFFSET])
    }

    pub fn crc_matches(&self) -> bool {
        self.crc == self.calculate_crc()
    }

    fn encode_fields(&self) -> [u8; TRAILER_SIZE as usize] {
        let mut buf = [0u8; TRAILER_SIZE as usize];
        buf[TRAILER_GENERATION_OFFSET..TRAILER_GENERATION_OFFSET + 4]
            .copy_from_slice(&self.generation.to_le_bytes());
        buf[TRAILER_TIME_OFFSET..TRAILER_TIME_OFFSET + 8].copy_from_slice(&self.time.to_le_bytes());
        buf[TRAILER_PREV_OFFSET..TRAILER_PREV_OFFSET + 8]
            .copy_from_slice(&self.prev_generation.absolute().to_le_bytes());
        for (slot, root) in self.index_roots.iter().enumerate() {
            let offset = TRAILER_INDEX_ROOTS_OFFSET + slot * 8;
            buf[offset..offset + 8].copy_from_slice(&root.absolute().to_le_bytes());
        }
        buf
    }

    pub fn encode(&self) -> [u8; TRAILER_SIZE as usize] {
        let mut buf = self.encode_fields();
        buf[TRAILER_CRC_OFFSET..TRAILER_CRC_OFFSET + 4].copy_from_slice(&self.crc.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8; TRAILER_SIZE as usize]) -> Trailer {
        let mut index_roots = [Address::NULL; INDEX_SLOT_COUNT];
        for (slot, root) in index_roots.iter_mut().enumerate() {
            *root = Address::new(read_u64(buf, TRAILER_INDEX_ROOTS_OFFSET + slot * 8));
        }
        Trailer {
            generation: read_u32(buf, TRAILER_GENERATION_OFFSET),
            time: read_u64(buf, TRAILER_TIME_OFFSET),
            prev_generation: TypedAddress::make(read_u64(buf, TRAILER_PREV_OFFSET)),
            index_roots,
            crc: read_u32(buf, TRAILER_CRC_OFFSET),
        }
    }
}

/// Derives the short textual sync name from the store UUID: the first
/// [`SYNC_NAME_LENGTH`] digits of the UUID value rendered in base 32,
/// least-significant digit first.  External coordination uses this name to
/// identify the database without carrying the full path around.
pub fn sync_name(uuid: &Uuid) -> String {
    const ALPHABET: &[u8; 32] = b"abcdefghijklmnopqrstuvwxyz234567";

    let mut value = uuid.as_u128();
    let mut name = String::new();
    loop {
        name.push(char::from(ALPHABET[(value % 32) as usize]));
        value /= 32;
        if value == 0 {
            break;
        }
    }
    name.truncate(SYNC_NAME_LENGTH);
    name
}

fn read_u16(buf: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes(buf[offset..offset + 2].try_into().expect("slice length is 2"))
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(buf[offset..offset + 4].try_into().expect("slice length is 4"))
}

fn read_u64(buf: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(buf[offset..offset + 8].try_into().expect("slice length is 8"))
}
