//! ESM Service Access Point
//!
//! Request/confirm boundary to the EPS Session Management sublayer. The
//! attach procedure issues a typed primitive and gets back a synchronous
//! status plus, when the ESM peer produced one, an outbound PDU.

// ============================================================================
// Primitives
// ============================================================================

/// Primitives sent through the ESM SAP
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EsmSapPrimitive {
    /// PDN connectivity requested by the UE within an attach request
    PdnConnectivityReq,
    /// The network locally refused PDN connectivity
    PdnConnectivityRej,
    /// Activate default EPS bearer context accept received from the UE
    DefaultEpsBearerContextActivateCnf,
}

/// A request to the ESM sublayer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EsmSapRequest {
    pub primitive: EsmSapPrimitive,
    pub ue_id: u32,
    /// Whether the ESM message arrived outside an EMM procedure
    pub is_standalone: bool,
    /// Received ESM PDU, when the primitive carries one
    pub recv: Option<Vec<u8>>,
}

/// Status reported by the ESM sublayer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EsmSapStatus {
    /// The ESM procedure succeeded
    Success,
    /// The message was discarded or answered with an ESM status message
    Discarded,
    /// The ESM procedure failed
    Failure,
}

/// Response from the ESM sublayer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EsmSapResponse {
    pub err: EsmSapStatus,
    /// Outbound ESM PDU produced by the peer (activate default bearer
    /// request on success, PDN connectivity reject on failure)
    pub send: Vec<u8>,
}

/// The ESM sublayer peer.
pub trait EsmSap {
    fn send(&mut self, request: EsmSapRequest) -> EsmSapResponse;
}
