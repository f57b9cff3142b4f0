use std::time::Duration;

/// Largest avatar payload this client will publish (16 KiB).
pub const AVATAR_MAX_BYTES: usize = 16 * 1024;

/// Edge length an oversized local avatar is rescaled to before publishing.
pub const AVATAR_RESCALE_SIZE: u32 = 64;

/// Length of a [`ContentHash`](crate::ContentHash) digest in bytes.
pub const HASH_LEN: usize = 32;

/// Length of an encoded [`ControlFrame`](crate::ControlFrame).
pub const CONTROL_FRAME_LEN: usize = 2;

/// Time a cancelled worker gets to wind down before it is aborted.
pub const DEFAULT_CANCEL_GRACE: Duration = Duration::from_secs(2);

/// Fallback retry interval when a transport refuses a chunk without a hint.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// File name used for the local avatar inside the data directory.
pub const SELF_AVATAR_FILE: &str = "avatar.png";

/// Directory (inside the data directory) holding one file per peer avatar.
pub const PEER_AVATAR_DIR: &str = "avatars";
