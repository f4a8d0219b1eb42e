use thiserror::Error;

#[derive(Debug, Error)]
pub enum SmsgError {
    #[error("malformed message: {0}")]
    Malformed(&'static str),
    #[error("proof of work does not meet target")]
    PowFailed,
    #[error("checksum mismatch")]
    ChecksumMismatch,
    #[error("already have message")]
    Duplicate,
    #[error("message timestamp has expired")]
    Expired,
    #[error("message timestamp is in the future")]
    InFuture,
    #[error("bucket is locked to peer {0}")]
    Locked(u64),
    #[error("wallet is locked")]
    WalletLocked,
    #[error("could not get public key for recipient")]
    RecipientKeyUnavailable,
    #[error("could not get private key for sender")]
    SenderKeyUnavailable,
    #[error("recipient key is not in the wallet")]
    UnknownRecipient,
    #[error("sender signature is invalid")]
    SignatureInvalid,
    #[error("message is not addressed to this key")]
    NotForUs,
    #[error("message too long: {0} bytes")]
    TooLong(usize),
    #[error("invalid address: {0}")]
    InvalidAddress(&'static str),
    #[error("unknown message")]
    UnknownMessage,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("database error: {0}")]
    Db(String),
    #[error("shutdown requested")]
    Cancelled,
}
