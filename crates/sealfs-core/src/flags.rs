//! Per-mount behavior flags.

use bitflags::bitflags;

bitflags! {
    /// Flags word carried by the filesystem context and the file table.
    ///
    /// `READ_ONLY` is a mount-time choice; the other three are format
    /// properties recorded in the vault keyfile at creation time.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MountFlags: u32 {
        /// Every mutation fails with `ReadOnlyFilesystem`.
        const READ_ONLY = 1 << 0;
        /// Objects are sealed with AES-CTR instead of AES-GCM; tampering
        /// is not detected.
        const NO_AUTHENTICATION = 1 << 1;
        /// atime/mtime/ctime are persisted in the metadata record instead
        /// of being derived from the backing file.
        const STORE_TIME = 1 << 2;
        /// Path components are case-folded before lookup.
        const CASE_FOLD = 1 << 3;
    }
}
