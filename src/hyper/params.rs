//! Guest kernel tuning parameters.
//!
//! A fixed name/value table; the guest reads it during bring-up.

use crate::errno::Errno;

/// Number of virtual CPUs offered to the guest.
pub const PARAM_NCPU: &str = "_RUMPUSER_NCPU";
/// Guest hostname.
pub const PARAM_HOSTNAME: &str = "_RUMPUSER_HOSTNAME";
/// Verbose bring-up.
pub const PARAM_VERBOSE: &str = "RUMP_VERBOSE";
/// Guest memory limit.
pub const PARAM_MEMLIMIT: &str = "RUMP_MEMLIMIT";

static ENVTAB: &[(&str, &str)] = &[
    (PARAM_NCPU, "1"),
    (PARAM_HOSTNAME, "rump4xen"),
    (PARAM_VERBOSE, "1"),
    (PARAM_MEMLIMIT, "8m"),
];

/// Look up `name` and copy its value, NUL-terminated, into `buf`.
/// Returns the number of bytes written.
pub fn getparam(name: &str, buf: &mut [u8]) -> Result<usize, Errno> {
    for (key, value) in ENVTAB {
        if *key == name {
            let need = value.len() + 1;
            if buf.len() < need {
                return Err(Errno::TooBig);
            }
            buf[..value.len()].copy_from_slice(value.as_bytes());
            buf[value.len()] = 0;
            return Ok(need);
        }
    }
    Err(Errno::NoEnt)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_parameters() {
        let mut buf = [0u8; 32];
        assert_eq!(getparam(PARAM_NCPU, &mut buf), Ok(2));
        assert_eq!(&buf[..2], b"1\0");
        assert_eq!(getparam(PARAM_HOSTNAME, &mut buf), Ok(9));
        assert_eq!(&buf[..9], b"rump4xen\0");
        assert_eq!(getparam(PARAM_MEMLIMIT, &mut buf), Ok(3));
        assert_eq!(&buf[..3], b"8m\0");
    }

    #[test]
    fn test_unknown_parameter() {
        let mut buf = [0u8; 32];
        assert_eq!(getparam("NOT_A_PARAM", &mut buf), Err(Errno::NoEnt));
    }

    #[test]
    fn test_short_buffer() {
        // Room for the value but not the terminator.
        let mut buf = [0u8; 8];
        assert_eq!(getparam(PARAM_HOSTNAME, &mut buf), Err(Errno::TooBig));
        let mut exact = [0u8; 9];
        assert_eq!(getparam(PARAM_HOSTNAME, &mut exact), Ok(9));
    }
}
