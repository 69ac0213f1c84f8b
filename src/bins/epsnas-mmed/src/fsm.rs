//! EMM State Machine Status
//!
//! Per-UE EMM state and the transitions driven by the EMM-REG primitives the
//! attach procedure emits.

use std::fmt;

use crate::sap::EmmSapPrimitive;

/// EMM state of a UE context.
///
/// The declaration order matters: everything after `Deregistered` denotes a
/// UE with mobility signalling in progress or completed, which is what the
/// `> Deregistered` comparisons in the attach procedure rely on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EmmFsmStatus {
    /// Context not yet initialized
    Invalid,
    /// No EMM context or registration rejected
    Deregistered,
    /// ATTACH ACCEPT sent, waiting for ATTACH COMPLETE
    RegisteredInitiated,
    /// Successfully registered
    Registered,
    /// Detach in progress
    DeregisteredInitiated,
    /// An EMM common procedure is running
    CommonProcedureInitiated,
}

impl fmt::Display for EmmFsmStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EmmFsmStatus::Invalid => write!(f, "INVALID"),
            EmmFsmStatus::Deregistered => write!(f, "DEREGISTERED"),
            EmmFsmStatus::RegisteredInitiated => write!(f, "REGISTERED_INITIATED"),
            EmmFsmStatus::Registered => write!(f, "REGISTERED"),
            EmmFsmStatus::DeregisteredInitiated => write!(f, "DEREGISTERED_INITIATED"),
            EmmFsmStatus::CommonProcedureInitiated => write!(f, "COMMON_PROCEDURE_INITIATED"),
        }
    }
}

/// NAS timer kinds owned by the EMM sublayer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmmTimerKind {
    /// ATTACH ACCEPT retransmission
    T3450,
    /// Authentication request retransmission
    T3460,
    /// Identity request retransmission
    T3470,
}

impl fmt::Display for EmmTimerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EmmTimerKind::T3450 => write!(f, "T3450"),
            EmmTimerKind::T3460 => write!(f, "T3460"),
            EmmTimerKind::T3470 => write!(f, "T3470"),
        }
    }
}

/// Payload carried by an armed EMM timer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmmTimerEvent {
    pub timer: EmmTimerKind,
    pub ue_id: u32,
}

/// Log a state change the way the EMM FSM reports transitions.
pub fn log_transition(ue_id: u32, from: EmmFsmStatus, to: EmmFsmStatus) {
    log::debug!("EMM FSM [{}]: {} -> {}", ue_id, from, to);
}

/// The state an EMM-REG primitive moves its UE context to, when it moves it
/// at all.
pub fn emm_reg_target(primitive: &EmmSapPrimitive) -> Option<(u32, EmmFsmStatus)> {
    match primitive {
        EmmSapPrimitive::CommonProcReq { ue_id } => {
            Some((*ue_id, EmmFsmStatus::CommonProcedureInitiated))
        }
        EmmSapPrimitive::AttachCnf { ue_id } => Some((*ue_id, EmmFsmStatus::Registered)),
        EmmSapPrimitive::AttachRej { ue_id } => Some((*ue_id, EmmFsmStatus::Deregistered)),
        EmmSapPrimitive::ProcAbort { ue_id } => Some((*ue_id, EmmFsmStatus::Deregistered)),
        EmmSapPrimitive::EstablishCnf(_) | EmmSapPrimitive::EstablishRej(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_ordering() {
        assert!(EmmFsmStatus::Invalid < EmmFsmStatus::Deregistered);
        assert!(EmmFsmStatus::RegisteredInitiated > EmmFsmStatus::Deregistered);
        assert!(EmmFsmStatus::Registered > EmmFsmStatus::Deregistered);
        assert!(EmmFsmStatus::CommonProcedureInitiated > EmmFsmStatus::Deregistered);
    }

    #[test]
    fn test_reg_targets() {
        assert_eq!(
            emm_reg_target(&EmmSapPrimitive::AttachCnf { ue_id: 3 }),
            Some((3, EmmFsmStatus::Registered))
        );
        assert_eq!(
            emm_reg_target(&EmmSapPrimitive::ProcAbort { ue_id: 3 }),
            Some((3, EmmFsmStatus::Deregistered))
        );
        assert_eq!(
            emm_reg_target(&EmmSapPrimitive::CommonProcReq { ue_id: 3 }),
            Some((3, EmmFsmStatus::CommonProcedureInitiated))
        );
    }
}
