//! Per-connection negotiated state and fid allocation.

use crate::error::SessionError;
use crate::fcall::{IOHDRSZ, MAX_MESSAGE_SIZE, VERSION_UNKNOWN};

/// Upper bound on simultaneously bound fids per connection
pub const FID_CAPACITY: usize = 1024;

/// Protocol parameters settled by the version exchange.
///
/// Both ends of a connection keep an independent copy.
#[derive(Clone, Debug)]
pub struct ProtoState {
    /// Negotiated protocol version string, empty before the exchange
    pub version: String,
    /// Negotiated frame size ceiling
    pub msize: u32,
}

impl ProtoState {
    pub fn new() -> ProtoState {
        ProtoState {
            version: String::new(),
            msize: MAX_MESSAGE_SIZE,
        }
    }
}

impl Default for ProtoState {
    fn default() -> Self {
        Self::new()
    }
}

/// Pick the version a server answers with: the longest prefix of the
/// proposed version it recognizes, or the `unknown` sentinel when the two
/// share no usable prefix.
pub fn negotiate_version<'a>(ours: &'a str, theirs: &'a str) -> &'a str {
    if theirs.starts_with(ours) {
        ours
    } else if ours.starts_with(theirs) {
        theirs
    } else {
        VERSION_UNKNOWN
    }
}

/// Largest read/write payload that fits a frame of the given size together
/// with its header.
pub fn io_unit(msize: u32) -> u32 {
    msize.saturating_sub(IOHDRSZ)
}

/// Bounded allocator handing out the lowest free fid.
///
/// `NOFID` is never produced; a full pool reports exhaustion instead of
/// growing.
#[derive(Clone, Debug)]
pub struct FidPool {
    slots: Vec<bool>,
    capacity: usize,
}

impl FidPool {
    pub fn new() -> FidPool {
        Self::with_capacity(FID_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> FidPool {
        FidPool {
            slots: Vec::new(),
            capacity,
        }
    }

    /// Claim the lowest free fid
    pub fn allocate(&mut self) -> Result<u32, SessionError> {
        if let Some(i) = self.slots.iter().position(|used| !used) {
            self.slots[i] = true;
            return Ok(i as u32);
        }

        if self.slots.len() < self.capacity {
            self.slots.push(true);
            Ok((self.slots.len() - 1) as u32)
        } else {
            Err(SessionError::FidsExhausted)
        }
    }

    /// Return a fid to the pool. Releasing an unallocated fid is a no-op.
    pub fn release(&mut self, fid: u32) {
        if let Some(slot) = self.slots.get_mut(fid as usize) {
            *slot = false;
        }
    }

    /// Number of fids currently handed out
    pub fn in_use(&self) -> usize {
        self.slots.iter().filter(|used| **used).count()
    }
}

impl Default for FidPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fcall::P92000X;

    #[test]
    fn version_exact_match() {
        assert_eq!(negotiate_version(P92000X, "9P2000.x"), P92000X);
    }

    #[test]
    fn version_client_proposes_extension() {
        // A proposed sub-version falls back to the version we serve.
        assert_eq!(negotiate_version(P92000X, "9P2000.x.next"), P92000X);
    }

    #[test]
    fn version_client_proposes_prefix() {
        assert_eq!(negotiate_version(P92000X, "9P2000"), "9P2000");
    }

    #[test]
    fn version_no_common_subversion() {
        assert_eq!(negotiate_version(P92000X, "7P"), VERSION_UNKNOWN);
        assert_eq!(negotiate_version(P92000X, ""), "");
    }

    #[test]
    fn fids_allocate_lowest_first() {
        let mut pool = FidPool::with_capacity(8);
        assert_eq!(pool.allocate().unwrap(), 0);
        assert_eq!(pool.allocate().unwrap(), 1);
        assert_eq!(pool.allocate().unwrap(), 2);

        pool.release(1);
        assert_eq!(pool.allocate().unwrap(), 1);
        assert_eq!(pool.allocate().unwrap(), 3);
    }

    #[test]
    fn fid_pool_is_bounded() {
        let mut pool = FidPool::with_capacity(2);
        pool.allocate().unwrap();
        pool.allocate().unwrap();
        assert_eq!(pool.allocate(), Err(SessionError::FidsExhausted));

        pool.release(0);
        assert_eq!(pool.allocate().unwrap(), 0);
    }

    #[test]
    fn fid_hygiene_across_a_sequence() {
        let mut pool = FidPool::new();
        assert_eq!(pool.in_use(), 0);

        let root = pool.allocate().unwrap();
        let walked = pool.allocate().unwrap();
        pool.release(walked);
        pool.release(root);

        assert_eq!(pool.in_use(), 0);
        assert_eq!(pool.allocate().unwrap(), 0);
    }

    #[test]
    fn io_unit_leaves_room_for_the_header() {
        assert_eq!(io_unit(4096), 4096 - IOHDRSZ);
        assert_eq!(io_unit(0), 0);
    }
}
