use thiserror::Error;

pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors raised while opening or probing a backing store.
///
/// Once a store is open, data-path operations ([`read_vectored_at`],
/// [`write_vectored_at`], `flush`, `discard`) speak [`std::io::Result`]
/// directly: they sit on the syscall boundary and their callers need the raw
/// [`std::io::ErrorKind`] (notably `Interrupted` and `Unsupported`) to make
/// scheduling decisions.
///
/// [`read_vectored_at`]: crate::BackingStore::read_vectored_at
/// [`write_vectored_at`]: crate::BackingStore::write_vectored_at
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid sector size {0} (must be a power of two, at least 512)")]
    InvalidSectorSize(u32),

    #[error("logical sector size {logical} exceeds physical sector size {physical}")]
    SectorSizeMismatch { logical: u32, physical: u32 },

    #[error("sector size {requested} is not a multiple of the device sector size {device}")]
    SectorSizeNotDeviceMultiple { requested: u32, device: u32 },

    #[error("unsupported file type for backing store: {0}")]
    UnsupportedType(&'static str),

    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    #[error("failed to open backing store: {0}")]
    Open(#[source] std::io::Error),

    #[error("failed to probe backing store geometry: {0}")]
    Probe(#[source] std::io::Error),
}
