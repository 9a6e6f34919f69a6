//! Pairing code lifecycle
//!
//! One 6-digit code per device at a time. The code stays valid until a
//! successful pairing consumes it; a mismatched request leaves it intact so
//! the user does not have to regenerate after a typo on the other device.

use parking_lot::Mutex;
use tracing::info;

use syncdev_proto::generate_pairing_code;

/// Outcome of validating an incoming pairing request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingValidation {
    Accepted,
    NoCodeActive,
    Mismatch,
}

#[derive(Default)]
pub struct PairingController {
    code: Mutex<Option<String>>,
}

impl PairingController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Generate and cache a fresh code, replacing any previous one.
    pub fn generate_code(&self) -> String {
        let code = generate_pairing_code();
        *self.code.lock() = Some(code.clone());
        info!("pairing code generated");
        code
    }

    pub fn current_code(&self) -> Option<String> {
        self.code.lock().clone()
    }

    pub fn clear_code(&self) {
        *self.code.lock() = None;
    }

    /// Check a presented code against the cached one. Does not consume the
    /// code; call [`consume`](Self::consume) once the pairing succeeded.
    pub fn validate(&self, presented: &str) -> PairingValidation {
        match self.code.lock().as_deref() {
            None => PairingValidation::NoCodeActive,
            Some(code) if code == presented => PairingValidation::Accepted,
            Some(_) => PairingValidation::Mismatch,
        }
    }

    /// Invalidate the code after a successful pairing.
    pub fn consume(&self) {
        self.clear_code();
        info!("pairing code consumed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_code_active() {
        let controller = PairingController::new();
        assert_eq!(controller.validate("123456"), PairingValidation::NoCodeActive);
    }

    #[test]
    fn test_exact_match_accepted() {
        let controller = PairingController::new();
        let code = controller.generate_code();
        assert_eq!(controller.validate(&code), PairingValidation::Accepted);
    }

    #[test]
    fn test_mismatch_keeps_code() {
        let controller = PairingController::new();
        let code = controller.generate_code();

        assert_eq!(controller.validate("000000x"), PairingValidation::Mismatch);
        // Code survives the failed attempt
        assert_eq!(controller.validate(&code), PairingValidation::Accepted);
    }

    #[test]
    fn test_consume_is_single_use() {
        let controller = PairingController::new();
        let code = controller.generate_code();

        assert_eq!(controller.validate(&code), PairingValidation::Accepted);
        controller.consume();
        assert_eq!(controller.validate(&code), PairingValidation::NoCodeActive);
    }

    #[test]
    fn test_regenerate_replaces_code() {
        let controller = PairingController::new();
        let first = controller.generate_code();
        let second = controller.generate_code();

        if first != second {
            assert_eq!(controller.validate(&first), PairingValidation::Mismatch);
        }
        assert_eq!(controller.validate(&second), PairingValidation::Accepted);
    }
}
