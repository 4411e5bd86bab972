//! Maps `Box<dyn Error>` from collaborator boundaries onto fault classes.
//!
//! The traits in `mmu_traits` box their errors so any backend can plug in;
//! this module recovers a `FaultKind`, downcasting `mmu_hardware::HwError`
//! when the `hardware-errors` feature is on.

use crate::error::{FaultKind, Stage, TransportFault};

/// Classify a collaborator error.
///
/// Known hardware errors are downcast first, then string heuristics apply.
pub fn classify_hw_error(e: &(dyn std::error::Error + 'static)) -> FaultKind {
    #[cfg(feature = "hardware-errors")]
    {
        use mmu_hardware::error::HwError;
        if let Some(hw) = e.downcast_ref::<HwError>() {
            return match hw {
                HwError::CommTimeout | HwError::Stopped => FaultKind::Transient,
                HwError::UnknownEndstop(_) => FaultKind::Config,
                HwError::Actuator(_) | HwError::Io(_) => FaultKind::Motion,
            };
        }
    }

    let s = e.to_string().to_lowercase();
    if s.contains("timeout") || s.contains("stopped") {
        FaultKind::Transient
    } else if s.contains("unknown endstop") {
        FaultKind::Config
    } else {
        FaultKind::Motion
    }
}

/// Wrap a collaborator error as a `TransportFault` raised in `stage`.
pub fn fault_from_hw(
    e: &(dyn std::error::Error + 'static),
    stage: Stage,
    what: &str,
) -> TransportFault {
    TransportFault::new(classify_hw_error(e), stage, format!("{what}: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Plain(&'static str);

    impl std::fmt::Display for Plain {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str(self.0)
        }
    }

    impl std::error::Error for Plain {}

    #[test]
    fn heuristics_cover_untyped_errors() {
        assert_eq!(classify_hw_error(&Plain("MCU timeout")), FaultKind::Transient);
        assert_eq!(classify_hw_error(&Plain("unknown endstop 'x'")), FaultKind::Config);
        assert_eq!(classify_hw_error(&Plain("driver overheated")), FaultKind::Motion);
    }

    #[cfg(feature = "hardware-errors")]
    #[test]
    fn typed_hardware_errors_downcast() {
        use mmu_hardware::error::HwError;
        assert_eq!(classify_hw_error(&HwError::Stopped), FaultKind::Transient);
        assert_eq!(
            classify_hw_error(&HwError::UnknownEndstop("foo".into())),
            FaultKind::Config
        );
        assert_eq!(
            classify_hw_error(&HwError::Actuator("servo".into())),
            FaultKind::Motion
        );
    }
}
