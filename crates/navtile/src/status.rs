//! Status codes for navigation mesh operations
//!
//! Every operation reports a bitmask made of one high level state
//! (success, failure or in progress) plus any number of detail bits.
//! Detail bits such as [`Status::OUT_OF_NODES`] or [`Status::PARTIAL_RESULT`]
//! may accompany a success: the call still produced usable data.

use std::fmt;

use bitflags::bitflags;

/// Result type for navigation operations. The error side always has
/// [`Status::FAILURE`] set.
pub type Result<T> = std::result::Result<T, Status>;

bitflags! {
    /// Bitmask status returned by navigation mesh and query operations
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    #[cfg_attr(
        feature = "serialization",
        derive(serde::Serialize, serde::Deserialize)
    )]
    pub struct Status: u32 {
        /// Operation failed
        const FAILURE = 1 << 31;
        /// Operation succeeded
        const SUCCESS = 1 << 30;
        /// Operation still in progress
        const IN_PROGRESS = 1 << 29;

        /// Input data is not recognized
        const WRONG_MAGIC = 1 << 0;
        /// Input data is in wrong version
        const WRONG_VERSION = 1 << 1;
        /// Operation ran out of memory
        const OUT_OF_MEMORY = 1 << 2;
        /// An input parameter was invalid
        const INVALID_PARAM = 1 << 3;
        /// Result buffer for the query was too small to store all results
        const BUFFER_TOO_SMALL = 1 << 4;
        /// Query ran out of nodes during search
        const OUT_OF_NODES = 1 << 5;
        /// Query did not reach the end location, returning best guess
        const PARTIAL_RESULT = 1 << 6;
        /// A tile has already been assigned to the given x,y,layer coordinate
        const ALREADY_OCCUPIED = 1 << 7;
    }
}

impl Status {
    /// Mask covering all detail bits
    pub const DETAIL_MASK: u32 = 0x0ff_ffff;

    /// Failure carrying the given detail bits
    pub fn failure_with(detail: Status) -> Self {
        Status::FAILURE | detail.details()
    }

    /// Success carrying the given detail bits
    pub fn success_with(detail: Status) -> Self {
        Status::SUCCESS | detail.details()
    }

    /// Returns true if status is success
    pub fn is_success(self) -> bool {
        self.contains(Status::SUCCESS)
    }

    /// Returns true if status is failure
    pub fn is_failure(self) -> bool {
        self.contains(Status::FAILURE)
    }

    /// Returns true if status is in progress
    pub fn is_in_progress(self) -> bool {
        self.contains(Status::IN_PROGRESS)
    }

    /// Returns true if the given detail bit is set
    pub fn has_detail(self, detail: Status) -> bool {
        self.intersects(detail.details())
    }

    /// Only the detail bits of this status
    pub fn details(self) -> Status {
        Status::from_bits_truncate(self.bits() & Self::DETAIL_MASK)
    }
}

impl Default for Status {
    fn default() -> Self {
        Status::SUCCESS
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_success() {
            write!(f, "Success")?;
        } else if self.is_failure() {
            write!(f, "Failure")?;
        } else if self.is_in_progress() {
            write!(f, "In Progress")?;
        } else {
            write!(f, "Unknown")?;
        }

        let names = [
            (Status::WRONG_MAGIC, "Wrong Magic"),
            (Status::WRONG_VERSION, "Wrong Version"),
            (Status::OUT_OF_MEMORY, "Out of Memory"),
            (Status::INVALID_PARAM, "Invalid Param"),
            (Status::BUFFER_TOO_SMALL, "Buffer Too Small"),
            (Status::OUT_OF_NODES, "Out of Nodes"),
            (Status::PARTIAL_RESULT, "Partial Result"),
            (Status::ALREADY_OCCUPIED, "Already Occupied"),
        ];
        let details: Vec<&str> = names
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();

        if !details.is_empty() {
            write!(f, " ({})", details.join(", "))?;
        }

        Ok(())
    }
}

impl std::error::Error for Status {}

/// Return early with `FAILURE | INVALID_PARAM` if the condition is false
macro_rules! ensure_param {
    ($cond:expr) => {
        if !$cond {
            return Err($crate::status::Status::FAILURE | $crate::status::Status::INVALID_PARAM);
        }
    };
}

pub(crate) use ensure_param;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_flags() {
        let success = Status::SUCCESS;
        assert!(success.is_success());
        assert!(!success.is_failure());

        let failure = Status::FAILURE;
        assert!(!failure.is_success());
        assert!(failure.is_failure());

        let in_progress = Status::IN_PROGRESS;
        assert!(in_progress.is_in_progress());
        assert!(!in_progress.is_success());
        assert!(!in_progress.is_failure());
    }

    #[test]
    fn test_status_with_detail() {
        let failure_oom = Status::failure_with(Status::OUT_OF_MEMORY);
        assert!(failure_oom.is_failure());
        assert!(failure_oom.has_detail(Status::OUT_OF_MEMORY));
        assert!(!failure_oom.has_detail(Status::INVALID_PARAM));

        let success_partial = Status::success_with(Status::PARTIAL_RESULT);
        assert!(success_partial.is_success());
        assert!(success_partial.has_detail(Status::PARTIAL_RESULT));
    }

    #[test]
    fn test_details_strip_high_level_state() {
        let status = Status::FAILURE | Status::INVALID_PARAM | Status::BUFFER_TOO_SMALL;
        assert_eq!(
            status.details(),
            Status::INVALID_PARAM | Status::BUFFER_TOO_SMALL
        );
        // Carrying details over to a new state must not keep the old state bit
        let moved = Status::success_with(status);
        assert!(moved.is_success());
        assert!(!moved.is_failure());
    }

    #[test]
    fn test_display() {
        let status = Status::SUCCESS | Status::OUT_OF_NODES | Status::PARTIAL_RESULT;
        assert_eq!(status.to_string(), "Success (Out of Nodes, Partial Result)");
        assert_eq!(Status::FAILURE.to_string(), "Failure");
    }
}
