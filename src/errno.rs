//! POSIX-style error codes returned across the hypercall surface.
//!
//! Configuration and domain errors surface as these codes; I/O errors are
//! delivered through completion callbacks only.

/// Error code with POSIX-style meaning and numbering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Errno {
    /// No such file or directory (unknown parameter name)
    NoEnt = 2,
    /// I/O error (driver-reported transfer failure)
    Io = 5,
    /// No such device or address (bad device name, non-bio open)
    Nxio = 6,
    /// Argument list too long (parameter buffer too small)
    TooBig = 7,
    /// Bad file descriptor
    BadF = 9,
    /// Out of memory
    NoMem = 12,
    /// Invalid argument (version mismatch, unsupported alignment)
    Inval = 22,
    /// Read-only file system (write access to read-only media)
    RoFs = 30,
}

impl Errno {
    /// Numeric code as handed to the guest kernel.
    pub const fn code(self) -> i32 {
        self as i32
    }

    /// Short symbolic name.
    pub const fn name(self) -> &'static str {
        match self {
            Errno::NoEnt => "ENOENT",
            Errno::Io => "EIO",
            Errno::Nxio => "ENXIO",
            Errno::TooBig => "E2BIG",
            Errno::BadF => "EBADF",
            Errno::NoMem => "ENOMEM",
            Errno::Inval => "EINVAL",
            Errno::RoFs => "EROFS",
        }
    }
}

impl core::fmt::Display for Errno {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{} ({})", self.name(), self.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes() {
        assert_eq!(Errno::NoEnt.code(), 2);
        assert_eq!(Errno::Io.code(), 5);
        assert_eq!(Errno::Nxio.code(), 6);
        assert_eq!(Errno::TooBig.code(), 7);
        assert_eq!(Errno::BadF.code(), 9);
        assert_eq!(Errno::NoMem.code(), 12);
        assert_eq!(Errno::RoFs.code(), 30);
    }

    #[test]
    fn test_names() {
        assert_eq!(Errno::RoFs.name(), "EROFS");
        assert_eq!(Errno::TooBig.name(), "E2BIG");
    }
}
