use std::error;
use std::fmt;
use std::io;

/// Result type used throughout this crate.
pub type Result<T> = ::std::result::Result<T, IecError>;

/// Errors that can be raised by any layer of the IEC stack: the bus
/// engine, the byte channel, the transport, the drive and host
/// emulations, and the disk image code.  Every error has a signed 16-bit
/// wire code in the range -0x200..-0x221 so that the engine can post it
/// in-band on the byte/sentinel stream and the receiving side can
/// reconstruct the error from the stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IecError {
    /// Device number outside the range this identity accepts
    IllegalDeviceNumber,
    /// A load or save was attempted without a file name
    MissingFilename,
    /// File not found
    FileNotFound,
    /// The remote listener did not accept a byte in time
    WriteTimeout,
    /// The remote talker did not clock a byte in time
    ReadTimeout,
    /// No device answered the ready-to-send probe
    DeviceNotPresent,
    /// The state machine or a channel reached an impossible state
    IllegalState,
    /// Unclassified error
    GeneralError,
    /// A bit-level error was observed in the previous byte
    PrevByteHasError,
    /// A file with this name already exists
    FileExists,
    /// The bus driver (GPIO lines) could not be opened
    DriverNotPresent,
    /// Allocation failure
    OutOfMemory,
    /// Unrecognized operating mode
    UnknownMode,
    /// A signal interrupted a blocking bus operation
    Signal,
    /// The bus lines were not all released when they should be
    BusNotIdle,
    /// A save operation failed on the remote device
    SaveError,
    /// The file is not a recognized disk image
    UnknownDiskImage,
    /// Track or sector outside the image geometry
    IllegalTrackSector,
    /// The disk image is internally inconsistent
    DiskImageError,
    /// Not enough free blocks or directory slots
    NoSpaceLeftOnDevice,
    /// Local file read failure
    FileReadError,
    /// Local file write failure
    FileWriteError,
    /// A bus command word arrived where data was expected; the word is
    /// carried so the receiver can re-inject it into command folding
    UnexpectedCommand(i16),
}

impl IecError {
    /// The signed wire code for this error, as posted on the byte stream.
    pub fn code(&self) -> i16 {
        use self::IecError::*;
        match *self {
            IllegalDeviceNumber => -0x200,
            MissingFilename => -0x201,
            FileNotFound => -0x202,
            WriteTimeout => -0x203,
            ReadTimeout => -0x204,
            DeviceNotPresent => -0x205,
            IllegalState => -0x206,
            GeneralError => -0x207,
            PrevByteHasError => -0x208,
            FileExists => -0x209,
            DriverNotPresent => -0x210,
            OutOfMemory => -0x211,
            UnknownMode => -0x212,
            Signal => -0x213,
            BusNotIdle => -0x214,
            SaveError => -0x215,
            UnknownDiskImage => -0x216,
            IllegalTrackSector => -0x217,
            DiskImageError => -0x218,
            NoSpaceLeftOnDevice => -0x219,
            FileReadError => -0x220,
            FileWriteError => -0x221,
            UnexpectedCommand(word) => word,
        }
    }

    /// Reconstruct an error from its wire code.  Codes outside the error
    /// range come back as `GeneralError`.
    pub fn from_code(code: i16) -> IecError {
        use self::IecError::*;
        match code {
            -0x200 => IllegalDeviceNumber,
            -0x201 => MissingFilename,
            -0x202 => FileNotFound,
            -0x203 => WriteTimeout,
            -0x204 => ReadTimeout,
            -0x205 => DeviceNotPresent,
            -0x206 => IllegalState,
            -0x207 => GeneralError,
            -0x208 => PrevByteHasError,
            -0x209 => FileExists,
            -0x210 => DriverNotPresent,
            -0x211 => OutOfMemory,
            -0x212 => UnknownMode,
            -0x213 => Signal,
            -0x214 => BusNotIdle,
            -0x215 => SaveError,
            -0x216 => UnknownDiskImage,
            -0x217 => IllegalTrackSector,
            -0x218 => DiskImageError,
            -0x219 => NoSpaceLeftOnDevice,
            -0x220 => FileReadError,
            -0x221 => FileWriteError,
            word if word <= -0x100 && word >= -0x1FF => UnexpectedCommand(word),
            _ => GeneralError,
        }
    }

    /// True if `code` lies in the error range of the wire protocol.
    pub fn is_error_code(code: i16) -> bool {
        code <= -0x200 && code >= -0x2FF
    }

    /// Provide terse descriptions of the errors.
    fn message(&self) -> &str {
        use self::IecError::*;
        match *self {
            IllegalDeviceNumber => "illegal device number",
            MissingFilename => "missing filename",
            FileNotFound => "file not found",
            WriteTimeout => "write timeout",
            ReadTimeout => "read timeout",
            DeviceNotPresent => "device not present",
            IllegalState => "illegal state",
            GeneralError => "general error",
            PrevByteHasError => "previous byte has error",
            FileExists => "file exists",
            DriverNotPresent => "driver not present",
            OutOfMemory => "out of memory",
            UnknownMode => "unknown mode",
            Signal => "caught a signal",
            BusNotIdle => "IEC bus is not in idle state",
            SaveError => "save error",
            UnknownDiskImage => "unknown disk image",
            IllegalTrackSector => "illegal track or sector",
            DiskImageError => "disk image error",
            NoSpaceLeftOnDevice => "no space left on device",
            FileReadError => "file read error",
            FileWriteError => "file write error",
            UnexpectedCommand(_) => "unexpected bus command",
        }
    }

    /// If the provided `io::Error` wraps an `IecError`, return it.
    pub fn from_io_error(error: &io::Error) -> Option<IecError> {
        error
            .get_ref()
            .and_then(|e| e.downcast_ref::<IecError>())
            .cloned()
    }
}

impl fmt::Display for IecError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.message())
    }
}

impl error::Error for IecError {}

impl From<io::Error> for IecError {
    fn from(error: io::Error) -> IecError {
        match IecError::from_io_error(&error) {
            Some(e) => e,
            None => match error.kind() {
                io::ErrorKind::NotFound => IecError::FileNotFound,
                io::ErrorKind::AlreadyExists => IecError::FileExists,
                io::ErrorKind::Interrupted => IecError::Signal,
                io::ErrorKind::TimedOut => IecError::ReadTimeout,
                _ => IecError::GeneralError,
            },
        }
    }
}

impl From<IecError> for io::Error {
    fn from(error: IecError) -> io::Error {
        use self::IecError::*;
        use std::io::ErrorKind::*;
        let kind = match error {
            FileNotFound => NotFound,
            FileExists => AlreadyExists,
            Signal => Interrupted,
            ReadTimeout | WriteTimeout => TimedOut,
            IllegalDeviceNumber | MissingFilename | IllegalTrackSector => InvalidInput,
            UnknownDiskImage | DiskImageError => InvalidData,
            _ => Other,
        };
        io::Error::new(kind, error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_round_trip() {
        let errors = [
            IecError::IllegalDeviceNumber,
            IecError::ReadTimeout,
            IecError::Signal,
            IecError::NoSpaceLeftOnDevice,
            IecError::FileWriteError,
        ];
        for e in errors.iter() {
            assert!(IecError::is_error_code(e.code()));
            assert_eq!(IecError::from_code(e.code()), *e);
        }
    }

    #[test]
    fn test_unknown_code_is_general() {
        assert_eq!(IecError::from_code(-0x2FE), IecError::GeneralError);
    }

    #[test]
    fn test_io_error_round_trip() {
        let io_error: io::Error = IecError::ReadTimeout.into();
        assert_eq!(IecError::from_io_error(&io_error), Some(IecError::ReadTimeout));
        assert_eq!(IecError::from(io_error), IecError::ReadTimeout);
    }
}
