pub const SMSG_HDR_LEN: usize = 104;
pub const SMSG_PL_HDR_LEN: usize = 1 + 20 + 65 + 4;
pub const SMSG_PL_HDR_LEN_ANON: usize = 9;

/// Width of a bucket time slot in seconds.
pub const SMSG_BUCKET_LEN: i64 = 60 * 60;
/// Messages older than this are discarded everywhere.
pub const SMSG_RETENTION: i64 = 48 * 60 * 60;
/// Minimum seconds between outbound inventory rounds to one peer.
pub const SMSG_SEND_DELAY: i64 = 2;
/// Seconds between sweeper iterations.
pub const SMSG_THREAD_DELAY: u64 = 30;
/// Sweeper heartbeat log once every this many iterations.
pub const SMSG_THREAD_LOG_GAP: u32 = 45;
/// Allowed clock skew for timestamps and bucket slots.
pub const SMSG_TIME_LEEWAY: i64 = 60;
/// How long a lazy peer is ignored after a lock timeout.
pub const SMSG_TIME_IGNORE: i64 = 900;

pub const SMSG_MAX_MSG_BYTES: usize = 4096;
pub const SMSG_MAX_AMSG_BYTES: usize = 24000;

/// LZ4 worst-case expansion for `n` input bytes.
pub const fn lz4_compress_bound(n: usize) -> usize {
    n + n / 255 + 16
}

/// Worst-case ciphertext length of the anonymous form, padding included.
pub const SMSG_MAX_MSG_WORST: usize =
    lz4_compress_bound(SMSG_MAX_AMSG_BYTES + SMSG_PL_HDR_LEN) + 16;

/// Per-response caps when answering a want request.
pub const SMSG_BUNCH_MAX_MESSAGES: u32 = 500;
pub const SMSG_BUNCH_MAX_BYTES: usize = 96000;

pub const SMSG_VERSION: [u8; 2] = [2, 1];

/// First payload byte marking the anonymous plaintext form.
pub const SMSG_ANON_TAG: u8 = 250;
/// Plaintext above this length is LZ4-compressed.
pub const SMSG_COMPRESS_THRESHOLD: usize = 128;

/// Sweeper ticks a pull lock survives before the peer is reported lazy.
pub const SMSG_BUCKET_LOCK_TICKS: u32 = 3;

pub const SMSG_MASK_UNREAD: u8 = 0x01;

/// Default base58check version byte for rendered addresses.
pub const SMSG_ADDRESS_VERSION: u8 = 0x38;
