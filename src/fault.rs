//! Named failpoints for the crash-recovery tests. A failpoint armed by
//! a test makes the named call site return a storage error, simulating
//! a crash at that exact boundary. Compiled out without the
//! `fault_injection` feature.

#[cfg(feature = "fault_injection")]
mod imp {
    use std::{
        collections::HashSet,
        sync::Mutex,
    };

    use once_cell::sync::Lazy;

    use crate::{error::GraniteError, types::GraniteResult};

    static ARMED: Lazy<Mutex<HashSet<String>>> = Lazy::new(|| Mutex::new(HashSet::new()));

    pub fn arm(name: &str) {
        ARMED.lock().unwrap().insert(name.to_string());
    }

    pub fn disarm(name: &str) {
        ARMED.lock().unwrap().remove(name);
    }

    pub fn clear() {
        ARMED.lock().unwrap().clear();
    }

    /// Consult the failpoint. Call sites thread the returned error
    /// upward like a real I/O failure.
    pub fn check(name: &str) -> GraniteResult {
        if ARMED.lock().unwrap().contains(name) {
            return Err(GraniteError::storage(&format!(
                "fault injected at {}",
                name
            )));
        }
        Ok(())
    }
}

#[cfg(not(feature = "fault_injection"))]
mod imp {
    use crate::types::GraniteResult;

    pub fn arm(_name: &str) {}
    pub fn disarm(_name: &str) {}
    pub fn clear() {}

    #[inline(always)]
    pub fn check(_name: &str) -> GraniteResult {
        Ok(())
    }
}

pub use imp::{arm, check, clear, disarm};

/// WAL fsync boundary.
pub const WAL_FLUSH: &str = "wal_flush";
/// Data page write-back boundary.
pub const PAGE_WRITE: &str = "page_write";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arm_disarm() {
        arm("x");
        assert!(check("x").is_err());
        assert!(check("y").is_ok());
        disarm("x");
        assert!(check("x").is_ok());
        clear();
    }
}
