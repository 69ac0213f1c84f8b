//! EMM Service Access Point
//!
//! Typed primitives the attach procedure hands to its peers: the EMM-AS
//! primitives carried down to the access stratum (ATTACH ACCEPT / ATTACH
//! REJECT transport) and the EMM-REG notifications consumed by the mobility
//! management registry.

use thiserror::Error;

use crate::context::{EpsGuti, SecurityContext, NAS_KEY_LEN};

// ============================================================================
// EMM Cause
// ============================================================================

/// EMM cause values surfaced to the UE (TS 24.301 annex A).
///
/// `Success` is an internal sentinel and never put on the wire; a reject
/// carrying it is sent as `IllegalUe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum EmmCause {
    #[default]
    Success = 0,
    /// Illegal UE
    IllegalUe = 3,
    /// IMEI not accepted
    ImeiNotAccepted = 5,
    /// ESM failure
    EsmFailure = 19,
    /// Protocol error, unspecified
    ProtocolError = 111,
}

// ============================================================================
// Primitives
// ============================================================================

/// NAS message class carried by an establish primitive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NasInfo {
    Attach,
    Detach,
    TrackingAreaUpdate,
}

/// EPS NAS security data handed to the access stratum together with an
/// establish primitive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NasSecurityData {
    /// Key set identifier
    pub ksi: u8,
    /// NAS encryption key
    pub k_nas_enc: [u8; NAS_KEY_LEN],
    /// NAS integrity key
    pub k_nas_int: [u8; NAS_KEY_LEN],
}

/// Extract the security data of a context, when one exists.
pub fn security_data(security: Option<&SecurityContext>) -> Option<NasSecurityData> {
    security.map(|s| NasSecurityData {
        ksi: s.eksi,
        k_nas_enc: s.knas_enc,
        k_nas_int: s.knas_int,
    })
}

/// ATTACH ACCEPT transport: NAS signalling connection establish confirm
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EstablishCnf {
    pub ue_id: u32,
    /// GUTI identifying the UE in the message
    pub guti: Option<EpsGuti>,
    /// Newly assigned GUTI for implicit reallocation
    pub new_guti: Option<EpsGuti>,
    /// Number of consecutive tracking areas assigned to the UE
    pub n_tacs: u16,
    /// Tracking area code
    pub tac: u16,
    pub nas_info: NasInfo,
    pub security: Option<NasSecurityData>,
    /// Selected encryption algorithm identifier
    pub encryption: u8,
    /// Selected integrity algorithm identifier
    pub integrity: u8,
    /// ESM container carried as NAS payload
    pub nas_msg: Vec<u8>,
}

/// ATTACH REJECT transport: NAS signalling connection establish reject
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EstablishRej {
    pub ue_id: u32,
    pub emm_cause: EmmCause,
    pub security: Option<NasSecurityData>,
    /// ESM reject PDU, present only for an ESM failure
    pub nas_msg: Vec<u8>,
}

/// Primitives sent through the EMM SAP
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EmmSapPrimitive {
    /// EMM-AS: send ATTACH ACCEPT to the UE
    EstablishCnf(EstablishCnf),
    /// EMM-AS: send ATTACH REJECT to the UE
    EstablishRej(EstablishRej),
    /// EMM-REG: attach procedure completed successfully
    AttachCnf { ue_id: u32 },
    /// EMM-REG: attach procedure failed
    AttachRej { ue_id: u32 },
    /// EMM-REG: procedure aborted
    ProcAbort { ue_id: u32 },
    /// EMM-REG: an EMM common procedure has been initiated
    CommonProcReq { ue_id: u32 },
}

impl EmmSapPrimitive {
    pub fn ue_id(&self) -> u32 {
        match self {
            EmmSapPrimitive::EstablishCnf(p) => p.ue_id,
            EmmSapPrimitive::EstablishRej(p) => p.ue_id,
            EmmSapPrimitive::AttachCnf { ue_id }
            | EmmSapPrimitive::AttachRej { ue_id }
            | EmmSapPrimitive::ProcAbort { ue_id }
            | EmmSapPrimitive::CommonProcReq { ue_id } => *ue_id,
        }
    }
}

/// SAP delivery errors
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SapError {
    #[error("failed to deliver primitive to the peer sublayer")]
    TransmissionFailed,
}

/// Peer consuming the EMM primitives.
pub trait EmmSap {
    fn send(&mut self, primitive: EmmSapPrimitive) -> Result<(), SapError>;
}
