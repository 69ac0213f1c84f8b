//! EMM Common Procedures
//!
//! The attach procedure drives identification, authentication and security
//! mode control as EMM common procedures. Initiating the UE-facing exchange
//! is delegated to the [`EmmCommonProcedures`] peer; what happens when the
//! exchange completes is recorded per UE as a continuation variant in the
//! [`CommonProcRegistry`], together with the attach retransmission buffer
//! while one exists.

use std::collections::HashMap;

use thiserror::Error;

use crate::attach::AttachData;

/// Next attach step to run when a pending operation completes successfully.
/// Failure and release always fall back to releasing the context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachContinuation {
    /// Re-enter UE identification
    Identify,
    /// Set up NAS security
    Security,
    /// Proceed with the attach (ESM round-trip and ATTACH ACCEPT)
    Attach,
}

/// How a common procedure ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommonProcOutcome {
    Success,
    Failure,
    Release,
}

/// Identity requested from the UE by the identification procedure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityRequestType {
    Imsi,
    Imei,
    Tmsi,
}

/// UE capabilities replayed to the security mode control procedure
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SecurityCapabilities {
    pub eea: u8,
    pub eia: u8,
    pub ucs2: bool,
    pub uea: u8,
    pub uia: u8,
    pub gea: u8,
    pub umts_present: bool,
    pub gprs_present: bool,
}

/// Common procedure initiation errors
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommonProcError {
    #[error("failed to initiate the common procedure")]
    InitiationFailed,
}

/// Peer running the UE-facing common procedure exchanges. Completion
/// re-enters the attach procedure through `common_procedure_complete`.
pub trait EmmCommonProcedures {
    fn initiate_identification(
        &mut self,
        ue_id: u32,
        ident_type: IdentityRequestType,
    ) -> Result<(), CommonProcError>;

    fn initiate_authentication(
        &mut self,
        ue_id: u32,
        ksi: u8,
        rand: &[u8; 16],
        autn: &[u8; 16],
    ) -> Result<(), CommonProcError>;

    fn initiate_security_mode_control(
        &mut self,
        ue_id: u32,
        ksi: u8,
        capabilities: &SecurityCapabilities,
    ) -> Result<(), CommonProcError>;
}

// ============================================================================
// Registry
// ============================================================================

#[derive(Debug, Default)]
struct CommonProcSlot {
    continuation: Option<AttachContinuation>,
    args: Option<AttachData>,
}

/// Per-UE bookkeeping for the ongoing EMM procedure.
#[derive(Debug, Default)]
pub struct CommonProcRegistry {
    slots: HashMap<u32, CommonProcSlot>,
}

impl CommonProcRegistry {
    pub fn new() -> Self {
        CommonProcRegistry {
            slots: HashMap::new(),
        }
    }

    /// Record the continuation to run on the next successful completion.
    pub fn set_continuation(&mut self, ue_id: u32, continuation: AttachContinuation) {
        self.slots.entry(ue_id).or_default().continuation = Some(continuation);
    }

    /// Take the pending continuation, leaving none registered.
    pub fn take_continuation(&mut self, ue_id: u32) -> Option<AttachContinuation> {
        self.slots
            .get_mut(&ue_id)
            .and_then(|slot| slot.continuation.take())
    }

    /// Bind the attach retransmission buffer to the UE's procedure.
    pub fn set_args(&mut self, ue_id: u32, args: AttachData) {
        self.slots.entry(ue_id).or_default().args = Some(args);
    }

    /// Mutate the retransmission buffer in place.
    pub fn with_args_mut<R>(
        &mut self,
        ue_id: u32,
        f: impl FnOnce(&mut AttachData) -> R,
    ) -> Option<R> {
        self.slots
            .get_mut(&ue_id)
            .and_then(|slot| slot.args.as_mut())
            .map(f)
    }

    /// Clone-out view of the retransmission buffer.
    pub fn args(&self, ue_id: u32) -> Option<AttachData> {
        self.slots.get(&ue_id).and_then(|slot| slot.args.clone())
    }

    /// Detach and return the retransmission buffer.
    pub fn take_args(&mut self, ue_id: u32) -> Option<AttachData> {
        self.slots
            .get_mut(&ue_id)
            .and_then(|slot| slot.args.take())
    }

    /// Drop every record for the UE (procedure aborted or finished).
    pub fn remove(&mut self, ue_id: u32) {
        self.slots.remove(&ue_id);
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_continuation_taken_once() {
        let mut registry = CommonProcRegistry::new();
        registry.set_continuation(7, AttachContinuation::Security);
        assert_eq!(
            registry.take_continuation(7),
            Some(AttachContinuation::Security)
        );
        assert_eq!(registry.take_continuation(7), None);
    }

    #[test]
    fn test_args_lifecycle() {
        let mut registry = CommonProcRegistry::new();
        registry.set_args(
            7,
            AttachData {
                ue_id: 7,
                retransmission_count: 0,
                esm_msg: vec![1, 2, 3],
            },
        );

        let count = registry.with_args_mut(7, |d| {
            d.retransmission_count += 1;
            d.retransmission_count
        });
        assert_eq!(count, Some(1));

        let data = registry.take_args(7).unwrap();
        assert_eq!(data.esm_msg, vec![1, 2, 3]);
        assert!(registry.take_args(7).is_none());
    }

    #[test]
    fn test_remove_clears_everything() {
        let mut registry = CommonProcRegistry::new();
        registry.set_continuation(7, AttachContinuation::Identify);
        registry.set_args(
            7,
            AttachData {
                ue_id: 7,
                retransmission_count: 2,
                esm_msg: Vec::new(),
            },
        );
        registry.remove(7);
        assert_eq!(registry.take_continuation(7), None);
        assert!(registry.args(7).is_none());
        assert!(registry.is_empty());
    }
}
