use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("shared cache path does not exist")]
    PathDoesNotExist,
    #[error("unable to find main cache file")]
    NoMainCache,
    #[error("cache file is too small")]
    FileTooSmall,
    #[error("magic does not start with dyld")]
    BadMagic,
    #[error("Unsupported Architecture type.")]
    UnsupportedArchitecture,
    #[error("Unrecognized dyld shared cache magic.")]
    UnrecognizedMagic,
    #[error("Host system endianness incompatible")]
    IncompatibleEndianness,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum MachoError {
    #[error("Host system endianness incompatible")]
    IncompatibleEndianness,
    #[error("not a Mach-O header")]
    BadHeader,
    #[error("address {0:#x} is not mapped by any cache file")]
    UnmappedAddress(u64),
    #[error("address {0:#x} is not within the image")]
    AddressOutsideImage(u64),
    #[error("image has no {0} load command")]
    MissingCommand(&'static str),
    #[error("image has no {0},{1} section")]
    MissingSection(&'static str, &'static str),
    #[error("load command at offset {0:#x} is truncated")]
    TruncatedCommand(usize),
    #[error(transparent)]
    Read(#[from] scroll::Error),
}

/// Programmer-contract violations inside the linkedit and pointer trackers.
/// These indicate pipeline logic bugs and are never silently ignored.
#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("linkedit data cannot be zero sized")]
    ZeroSizedData,
    #[error("data size is not pointer aligned")]
    UnalignedData,
    #[error("data is outside the linkedit region")]
    DataOutsideLinkedit,
    #[error("data does not make up a continuous range")]
    DiscontinuousData,
    #[error("offset field is outside the load command region")]
    FieldOutsideCommands,
    #[error("not enough space in the linkedit region")]
    LinkeditFull,
    #[error("not enough space in the load command region")]
    CommandsFull,
    #[error("load command is outside the load command region")]
    CommandOutsideRegion,
    #[error("a tracked offset field points into the load command being removed")]
    CommandStillReferenced,
    #[error("a pointer is already tracked at {0:#x}")]
    DuplicatePointer(u64),
}

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("binding address {0:#x} is outside the range of any segment")]
    AddressOutsideSegments(u64),
    #[error("indirect symbol entry {0} overruns the symbol table")]
    IndirectOutOfRange(u32),
    #[error("unknown or unsupported architecture for chained fixups")]
    UnsupportedChainedArch,
    #[error(transparent)]
    Tracker(#[from] TrackerError),
}

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Macho(#[from] MachoError),
    #[error(transparent)]
    Tracker(#[from] TrackerError),
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error("segment has too big of a fileoff or filesize, likely a malformed segment command")]
    MalformedSegment,
    #[error("unable to find image matching '{0}'")]
    ImageNotFound(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
