//! Artifact naming and the reentrancy marker.
//!
//! Both are used on the crash path, so paths are assembled in fixed size
//! buffers and the time is computed from `clock_gettime` plus a UTC offset
//! that was looked up when the handler was created, since `localtime_r` may
//! take locks.

use {
    super::errors::HandlerError,
    std::{
        ffi::{CStr, OsStr},
        os::unix::ffi::OsStrExt,
        path::Path,
    },
};

/// Capacity of an artifact path, including the nul terminator
pub const PATH_CAPACITY: usize = 512;
/// Name of the reentrancy marker inside the artifact directory
pub const MARKER_NAME: &str = "flagfile";
/// Number of characters in a `YYYYMMDDHHMMSS` timestamp
pub const TIMESTAMP_LEN: usize = 14;
/// Highest `-N` suffix tried when an artifact with the same second exists
pub const MAX_COLLISION_SUFFIX: u32 = 99;

/// The longest directory an artifact path can be built in: room for the
/// separator, timestamp, collision suffix and nul terminator.
pub const MAX_DIR_LEN: usize = PATH_CAPACITY - 1 - TIMESTAMP_LEN - 3 - 1;

/// A nul terminated path in a fixed size buffer
#[derive(Clone, Copy)]
pub struct ArtifactPath {
    buf: [u8; PATH_CAPACITY],
    len: usize,
}

impl ArtifactPath {
    pub const fn empty() -> Self {
        Self {
            buf: [0; PATH_CAPACITY],
            len: 0,
        }
    }

    fn push(&mut self, bytes: &[u8]) -> bool {
        // Always keep room for the terminator
        if self.len + bytes.len() >= PATH_CAPACITY {
            return false;
        }

        self.buf[self.len..self.len + bytes.len()].copy_from_slice(bytes);
        self.len += bytes.len();
        self.buf[self.len] = 0;
        true
    }

    fn push_decimal(&mut self, mut value: u32) -> bool {
        let mut digits = [0u8; 10];
        let mut i = digits.len();
        loop {
            i -= 1;
            digits[i] = b'0' + (value % 10) as u8;
            value /= 10;
            if value == 0 {
                break;
            }
        }
        self.push(&digits[i..])
    }

    /// Builds `{dir}/{name}`, returning `None` if it doesn't fit.
    pub fn join(dir: &[u8], name: &[u8]) -> Option<Self> {
        let mut path = Self::empty();
        let ok = path.push(dir) && (dir.ends_with(b"/") || path.push(b"/")) && path.push(name);
        ok.then_some(path)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    #[inline]
    pub fn as_path(&self) -> &Path {
        Path::new(OsStr::from_bytes(self.as_bytes()))
    }

    #[inline]
    pub fn as_c_str(&self) -> &CStr {
        // The buffer is always terminated right after `len`, and the
        // directory was checked for interior nuls when the handler was built
        CStr::from_bytes_until_nul(&self.buf[..=self.len]).unwrap_or_default()
    }

    #[inline]
    pub fn exists(&self) -> bool {
        // SAFETY: syscall on a nul terminated string
        unsafe { libc::access(self.as_c_str().as_ptr(), libc::F_OK) == 0 }
    }
}

impl std::fmt::Debug for ArtifactPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.as_path().fmt(f)
    }
}

/// Wall clock that reports local time without touching the timezone
/// machinery of libc.
#[derive(Copy, Clone, Debug)]
pub struct LocalClock {
    utc_offset: i64,
}

impl LocalClock {
    /// Captures the current UTC offset of the local timezone.
    pub fn new() -> Result<Self, HandlerError> {
        // SAFETY: syscalls, tm is POD
        unsafe {
            let now = libc::time(std::ptr::null_mut());
            let mut tm: libc::tm = std::mem::zeroed();
            if libc::localtime_r(&now, &mut tm).is_null() {
                return Err(HandlerError::LocalTime(std::io::Error::last_os_error()));
            }
            Ok(Self {
                utc_offset: tm.tm_gmtoff as i64,
            })
        }
    }

    pub const fn with_offset(utc_offset: i64) -> Self {
        Self { utc_offset }
    }

    /// Seconds since the epoch, shifted into local time
    pub fn now(&self) -> i64 {
        // SAFETY: timespec is POD, syscall
        let mut ts: libc::timespec = unsafe { std::mem::zeroed() };
        unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut ts) };
        ts.tv_sec as i64 + self.utc_offset
    }
}

/// Converts days since 1970-01-01 into a (year, month, day) triple
fn civil_from_days(days: i64) -> (i64, u32, u32) {
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let month = (if mp < 10 { mp + 3 } else { mp - 9 }) as u32;
    let year = yoe + era * 400 + i64::from(month <= 2);
    (year, month, day)
}

/// Formats seconds since the epoch as `YYYYMMDDHHMMSS`.
pub fn format_timestamp(secs: i64) -> [u8; TIMESTAMP_LEN] {
    let (year, month, day) = civil_from_days(secs.div_euclid(86_400));
    let sod = secs.rem_euclid(86_400);
    let fields = [
        (year.clamp(0, 9999) as u32, 4),
        (month, 2),
        (day, 2),
        ((sod / 3600) as u32, 2),
        ((sod / 60 % 60) as u32, 2),
        ((sod % 60) as u32, 2),
    ];

    let mut out = [b'0'; TIMESTAMP_LEN];
    let mut end = 0;
    for (mut value, width) in fields {
        end += width;
        for slot in out[end - width..end].iter_mut().rev() {
            *slot = b'0' + (value % 10) as u8;
            value /= 10;
        }
    }
    out
}

/// Picks the artifact path for a crash happening now.
///
/// If an artifact from the same second already exists a `-N` suffix is added.
/// When every suffix is taken the plain path is returned and the tombstone
/// writer will refuse to overwrite it.
pub fn artifact_path(dir: &[u8], clock: &LocalClock) -> Option<ArtifactPath> {
    let stamp = format_timestamp(clock.now());
    let base = ArtifactPath::join(dir, &stamp)?;
    if !base.exists() {
        return Some(base);
    }

    for n in 1..=MAX_COLLISION_SUFFIX {
        let mut candidate = base;
        if !(candidate.push(b"-") && candidate.push_decimal(n)) {
            break;
        }
        if !candidate.exists() {
            return Some(candidate);
        }
    }

    Some(base)
}

/// Marker file whose presence means a dump is already in progress, or that
/// a previous attempt died before finishing.
#[derive(Debug)]
pub struct ReentrancyMarker {
    path: ArtifactPath,
}

impl ReentrancyMarker {
    pub fn new(dir: &[u8]) -> Option<Self> {
        ArtifactPath::join(dir, MARKER_NAME.as_bytes()).map(|path| Self { path })
    }

    #[inline]
    pub fn path(&self) -> &Path {
        self.path.as_path()
    }

    /// Atomically creates the marker. Any failure, including the marker
    /// already existing, means we must not dump.
    pub fn acquire(&self) -> Option<MarkerGuard<'_>> {
        // SAFETY: syscalls on a nul terminated path
        unsafe {
            let fd = libc::open(
                self.path.as_c_str().as_ptr(),
                libc::O_CREAT | libc::O_EXCL | libc::O_WRONLY | libc::O_CLOEXEC,
                0o600 as libc::c_uint,
            );
            if fd == -1 {
                return None;
            }
            libc::close(fd);
        }

        Some(MarkerGuard { marker: self })
    }
}

/// Removes the marker when dropped
#[must_use]
pub struct MarkerGuard<'m> {
    marker: &'m ReentrancyMarker,
}

impl Drop for MarkerGuard<'_> {
    fn drop(&mut self) {
        // SAFETY: syscall on a nul terminated path
        unsafe { libc::unlink(self.marker.path.as_c_str().as_ptr()) };
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn timestamps() {
        assert_eq!(&format_timestamp(0), b"19700101000000");
        assert_eq!(&format_timestamp(1_700_000_000), b"20231114221320");
        // Leap day
        assert_eq!(&format_timestamp(951_782_400), b"20000229000000");
        assert_eq!(&format_timestamp(-1), b"19691231235959");
    }

    #[test]
    fn join_respects_capacity() {
        let path = ArtifactPath::join(b"/tmp/dumps", b"x").unwrap();
        assert_eq!(path.as_bytes(), b"/tmp/dumps/x");
        assert_eq!(path.as_c_str().to_bytes(), b"/tmp/dumps/x");

        let path = ArtifactPath::join(b"/tmp/dumps/", b"x").unwrap();
        assert_eq!(path.as_bytes(), b"/tmp/dumps/x");

        let long = vec![b'a'; PATH_CAPACITY - 2];
        assert!(ArtifactPath::join(&long, b"x").is_none());

        let max = vec![b'a'; MAX_DIR_LEN];
        let clock = LocalClock::with_offset(0);
        assert!(artifact_path(&max, &clock).is_some());
    }

    #[test]
    fn collisions_get_a_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let dir_bytes = dir.path().as_os_str().as_bytes();

        let clock = LocalClock::with_offset(0);
        let first = artifact_path(dir_bytes, &clock).unwrap();
        let stamp = first.as_path().file_name().unwrap().to_owned();

        std::fs::write(dir.path().join(&stamp), b"").unwrap();
        let second = artifact_path(dir_bytes, &clock).unwrap();

        let second_name = second.as_path().file_name().unwrap().to_str().unwrap();
        // Either the second rolled over, or the suffix kicked in
        if second_name.starts_with(stamp.to_str().unwrap()) {
            assert_eq!(second_name, format!("{}-1", stamp.to_str().unwrap()));
        } else {
            assert_eq!(second_name.len(), TIMESTAMP_LEN);
        }
    }

    #[test]
    fn marker_is_exclusive_and_removed() {
        let dir = tempfile::tempdir().unwrap();
        let marker = ReentrancyMarker::new(dir.path().as_os_str().as_bytes()).unwrap();

        let guard = marker.acquire().expect("first acquire");
        assert!(marker.path().exists());
        assert!(marker.acquire().is_none());

        drop(guard);
        assert!(!marker.path().exists());
        assert!(marker.acquire().is_some());
    }

    #[test]
    fn marker_left_behind_blocks_dumps() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(MARKER_NAME), b"").unwrap();

        let marker = ReentrancyMarker::new(dir.path().as_os_str().as_bytes()).unwrap();
        assert!(marker.acquire().is_none());
        // Only the creator removes it
        assert!(marker.path().exists());
    }
}
