//! MME API
//!
//! Contract of the subscriber-identity provider: identity validation,
//! authentication vector retrieval, GUTI assignment and the identity
//! notifications the MME pushes back.

use thiserror::Error;

use crate::context::{AuthVector, EpsGuti, Imei, Imsi, PlmnId};

/// Identity provider errors
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MmeApiError {
    #[error("the provided identity is not known to the network")]
    IdentificationFailed,
    #[error("no GUTI could be assigned")]
    GutiAllocationFailed,
    #[error("authentication information request could not be issued")]
    AuthInfoUnavailable,
}

/// Result of a GUTI assignment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GutiAllocation {
    pub guti: EpsGuti,
    /// Tracking area code assigned together with the GUTI
    pub tac: u16,
    /// Number of consecutive tracking areas assigned to the UE
    pub n_tacs: u16,
}

/// Subscriber-identity provider the attach procedure talks to.
pub trait MmeApi {
    /// Validate an IMSI and return an authentication vector for it.
    fn identify_imsi(&mut self, imsi: &Imsi) -> Result<AuthVector, MmeApiError>;

    /// Resolve a GUTI to a known subscriber.
    fn identify_guti(&mut self, guti: &EpsGuti) -> Result<AuthVector, MmeApiError>;

    /// Validate an IMEI (emergency attach).
    fn identify_imei(&mut self, imei: &Imei) -> Result<AuthVector, MmeApiError>;

    /// Assign a fresh GUTI to the subscriber.
    fn new_guti(&mut self, imsi: &Imsi) -> Result<GutiAllocation, MmeApiError>;

    /// Ask the subscriber database for authentication vectors. The answer
    /// arrives asynchronously through the attach procedure's
    /// `auth_info_answer` entry point.
    fn auth_info_req(
        &mut self,
        ue_id: u32,
        imsi: &Imsi,
        num_vectors: usize,
        last_visited_plmn: Option<&PlmnId>,
    ) -> Result<(), MmeApiError>;

    /// The lower-layer UE identifier of a subscriber has changed.
    fn notify_ue_id_changed(&mut self, old_ue_id: u32, new_ue_id: u32);

    /// The UE is now known under this GUTI.
    fn notify_new_guti(&mut self, ue_id: u32, guti: &EpsGuti);

    /// MNC length for the PLMN identified by the six leading IMSI digits.
    /// Only `Some(2)` and `Some(3)` denote a known PLMN.
    fn find_mnc_length(&self, plmn_digits: [u8; 6]) -> Option<u8>;
}
