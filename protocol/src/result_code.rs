/// Task result codes surfaced to the client (spec.md §7).
///
/// The integer values match the wire encoding used in the `result` line
/// (spec.md §4.1) so a status can round-trip through `as i32` without a
/// lookup table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ResultStatus {
    Success = 0,
    InputMissing = 1,
    OutputMissing = 2,
    StdoutMissing = 3,
    Signal = 4,
    ResourceExhaustion = 5,
    TaskTimeout = 6,
    Forsaken = 7,
    MaxRetries = 8,
    TaskMaxRunTime = 9,
    DiskAllocFull = 10,
    RMonitorError = 11,
    OutputTransferError = 12,
    Unknown = 13,
}

impl ResultStatus {
    /// Decode a wire status integer, defaulting to `Unknown` rather than
    /// failing the whole message — an out-of-range status should not by
    /// itself be treated as a worker failure.
    pub fn from_wire(value: i32) -> Self {
        match value {
            0 => ResultStatus::Success,
            1 => ResultStatus::InputMissing,
            2 => ResultStatus::OutputMissing,
            3 => ResultStatus::StdoutMissing,
            4 => ResultStatus::Signal,
            5 => ResultStatus::ResourceExhaustion,
            6 => ResultStatus::TaskTimeout,
            7 => ResultStatus::Forsaken,
            8 => ResultStatus::MaxRetries,
            9 => ResultStatus::TaskMaxRunTime,
            10 => ResultStatus::DiskAllocFull,
            11 => ResultStatus::RMonitorError,
            12 => ResultStatus::OutputTransferError,
            _ => ResultStatus::Unknown,
        }
    }

    pub fn as_wire(self) -> i32 {
        self as i32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_known_codes() {
        for status in [
            ResultStatus::Success,
            ResultStatus::ResourceExhaustion,
            ResultStatus::Forsaken,
            ResultStatus::TaskTimeout,
        ] {
            assert_eq!(ResultStatus::from_wire(status.as_wire()), status);
        }
    }

    #[test]
    fn unrecognized_code_is_unknown_not_an_error() {
        assert_eq!(ResultStatus::from_wire(999), ResultStatus::Unknown);
    }
}
