use std::fmt;

/// Machine-readable error codes for the notification tick and its operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    ConfigInvalid,
    UpstreamFetch,
    SnapshotUnavailable,
    Delivery,
    StorageWrite,
    LeaseContention,
}

impl ErrorCode {
    /// Stable code identifier (`E####`) for machine parsing.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::ConfigInvalid => "E1001",
            Self::UpstreamFetch => "E2001",
            Self::SnapshotUnavailable => "E3001",
            Self::Delivery => "E4001",
            Self::StorageWrite => "E5001",
            Self::LeaseContention => "E5002",
        }
    }

    /// Optional remediation hint that can be surfaced to operators.
    #[must_use]
    pub const fn hint(self) -> Option<&'static str> {
        match self {
            Self::ConfigInvalid => Some("Fix the YAML file named on the command line and restart."),
            Self::UpstreamFetch => {
                Some("Check the workspace token and database id; the next tick retries.")
            }
            Self::SnapshotUnavailable => {
                Some("Check the newest file under the prefix; ticks resume once it reads.")
            }
            Self::Delivery => Some("The ticket is retried on a later tick."),
            Self::StorageWrite => Some("Check bucket permissions and free space."),
            Self::LeaseContention => Some("Lengthen the interval or check for a stuck process."),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

#[cfg(test)]
mod tests {
    use super::ErrorCode;
    use std::collections::HashSet;

    #[test]
    fn all_codes_are_unique() {
        let all = [
            ErrorCode::ConfigInvalid,
            ErrorCode::UpstreamFetch,
            ErrorCode::SnapshotUnavailable,
            ErrorCode::Delivery,
            ErrorCode::StorageWrite,
            ErrorCode::LeaseContention,
        ];

        let mut seen = HashSet::new();
        for code in all {
            assert!(seen.insert(code.code()), "duplicate code {}", code.code());
        }
    }

    #[test]
    fn code_format_is_machine_friendly() {
        let code = ErrorCode::StorageWrite.code();
        assert_eq!(code.len(), 5);
        assert!(code.starts_with('E'));
        assert!(code.chars().skip(1).all(|c| c.is_ascii_digit()));
    }
}
