#![forbid(unsafe_code)]

use gm_core::{IdentityError, MappingError, StoreError};

// Caller mistakes: bad mapping declarations, merging an instance that is
// already tracked, malformed input graphs. These are bugs at the call site,
// not runtime conditions.
#[derive(Debug)]
pub enum UsageError {
    Mapping(MappingError),
    Identity(IdentityError),
    NoMappingRegistered {
        type_name: String,
        scheme: String,
    },
    AlreadyTracked {
        type_name: String,
        identity: String,
    },
    DuplicateIdentity {
        type_name: String,
        identity: String,
    },
    AssociatedWithoutIdentity {
        type_name: String,
    },
    MixedBatch {
        expected: String,
        actual: String,
    },
    WrongRootType {
        expected: String,
        actual: String,
    },
}

impl std::fmt::Display for UsageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Mapping(err) => write!(f, "{err}"),
            Self::Identity(err) => write!(f, "{err}"),
            Self::NoMappingRegistered { type_name, scheme } => write!(
                f,
                "no mapping registered for root type {type_name} under scheme {scheme}"
            ),
            Self::AlreadyTracked { type_name, identity } => write!(
                f,
                "{type_name}{identity} is already tracked by the current unit of work"
            ),
            Self::DuplicateIdentity { type_name, identity } => {
                write!(f, "duplicate identity {type_name}{identity} in the input")
            }
            Self::AssociatedWithoutIdentity { type_name } => write!(
                f,
                "associated {type_name} instance must carry an assigned key"
            ),
            Self::MixedBatch { expected, actual } => write!(
                f,
                "batch roots must share one type; expected {expected}, found {actual}"
            ),
            Self::WrongRootType { expected, actual } => write!(
                f,
                "mapping tree is rooted at {expected}, cannot merge a {actual}"
            ),
        }
    }
}

impl std::error::Error for UsageError {}

#[derive(Debug)]
pub enum MergeError {
    Usage(UsageError),
    // Mapping shapes the engine refuses to process, e.g. owned cycles.
    UnsupportedMapping(MappingError),
    Conflict {
        type_name: String,
        identity: String,
    },
    Store(StoreError),
}

impl std::fmt::Display for MergeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Usage(err) => write!(f, "usage: {err}"),
            Self::UnsupportedMapping(err) => write!(f, "unsupported mapping: {err}"),
            Self::Conflict { type_name, identity } => write!(
                f,
                "concurrency conflict on {type_name}{identity}: the stored token has changed"
            ),
            Self::Store(err) => write!(f, "store: {err}"),
        }
    }
}

impl std::error::Error for MergeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Usage(err) => Some(err),
            Self::UnsupportedMapping(err) => Some(err),
            Self::Store(err) => Some(err),
            Self::Conflict { .. } => None,
        }
    }
}

impl From<UsageError> for MergeError {
    fn from(value: UsageError) -> Self {
        Self::Usage(value)
    }
}

impl From<MappingError> for MergeError {
    fn from(value: MappingError) -> Self {
        match value {
            MappingError::OwnedCycle { .. } => Self::UnsupportedMapping(value),
            other => Self::Usage(UsageError::Mapping(other)),
        }
    }
}

impl From<IdentityError> for MergeError {
    fn from(value: IdentityError) -> Self {
        Self::Usage(UsageError::Identity(value))
    }
}

// A stale concurrency token surfaces from the store as `StaleToken`; the
// engine reports it as a conflict rather than a storage failure.
impl From<StoreError> for MergeError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::StaleToken { type_name, identity } => {
                Self::Conflict { type_name, identity }
            }
            other => Self::Store(other),
        }
    }
}
