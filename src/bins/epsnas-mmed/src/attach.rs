//! EPS Attach Procedure
//!
//! The UE requested attach procedure executed by the MME (TS 24.301 5.5.1).
//! Admits a UE onto the network: resolves or creates its EMM context,
//! identifies and authenticates the subscriber, installs NAS security,
//! coordinates default-bearer setup with the ESM sublayer, delivers the
//! ATTACH ACCEPT (retransmitted under T3450) and completes the registration
//! on ATTACH COMPLETE.

use std::fmt;
use std::time::Duration;

use epsnas_core::{NasTimerMgr, NAS_TIMER_INACTIVE_ID};

use crate::common::{
    AttachContinuation, CommonProcOutcome, CommonProcRegistry, EmmCommonProcedures,
    IdentityRequestType, SecurityCapabilities,
};
use crate::config::MmeConfig;
use crate::context::{
    EmmContext, EmmData, EpsGuti, EpsTai, Imei, Imsi, MTmsiAllocator, PlmnId, SecurityContext,
    AuthVector, INVALID_UE_ID,
};
use crate::esm_sap::{EsmSap, EsmSapPrimitive, EsmSapRequest, EsmSapStatus};
use crate::fsm::{self, EmmFsmStatus, EmmTimerEvent, EmmTimerKind};
use crate::mme_api::{MmeApi, MmeApiError};
use crate::sap::{self, EmmCause, EmmSap, EmmSapPrimitive, EstablishCnf, EstablishRej, NasInfo, SapError};

/// The attach procedure is aborted on the fifth T3450 expiry.
pub const ATTACH_COUNTER_MAX: u32 = 5;

// ============================================================================
// Request Types
// ============================================================================

/// Type of the requested attach
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmmAttachType {
    /// EPS attach
    Eps,
    /// Combined EPS/IMSI attach
    CombinedEpsImsi,
    /// EPS emergency attach
    Emergency,
    /// Reserved value
    Reserved,
}

impl fmt::Display for EmmAttachType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EmmAttachType::Eps => write!(f, "EPS"),
            EmmAttachType::CombinedEpsImsi => write!(f, "IMSI"),
            EmmAttachType::Emergency => write!(f, "EMERGENCY"),
            EmmAttachType::Reserved => write!(f, "RESERVED"),
        }
    }
}

/// Decoded ATTACH REQUEST content handed in by the lower layers
#[derive(Debug, Clone)]
pub struct AttachRequest {
    /// UE lower layer identifier
    pub ue_id: u32,
    pub attach_type: EmmAttachType,
    /// The security context referenced by `ksi` is of native type
    pub is_native_ksi: bool,
    /// NAS key set identifier
    pub ksi: u8,
    /// The provided GUTI is a native GUTI
    pub is_native_guti: bool,
    pub guti: Option<EpsGuti>,
    pub imsi: Option<Imsi>,
    pub imei: Option<Imei>,
    /// Last visited registered TAI
    pub tai: Option<EpsTai>,
    /// Supported EPS encryption algorithms
    pub eea: u8,
    /// Supported EPS integrity algorithms
    pub eia: u8,
    pub ucs2: bool,
    /// Supported UMTS encryption algorithms
    pub uea: u8,
    /// Supported UMTS integrity algorithms
    pub uia: u8,
    /// Supported GPRS encryption algorithms
    pub gea: u8,
    pub umts_present: bool,
    pub gprs_present: bool,
    /// PDN connectivity request ESM message
    pub esm_msg: Vec<u8>,
}

/// Retransmission state bound to a running T3450: which UE, how many
/// retransmissions so far, and the exact ESM container to resend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachData {
    pub ue_id: u32,
    pub retransmission_count: u32,
    /// ESM message sent within the ATTACH ACCEPT
    pub esm_msg: Vec<u8>,
}

/// Attach procedure errors
#[derive(thiserror::Error, Debug)]
pub enum EmmProcError {
    #[error("no EMM context exists (ueid={0})")]
    NoContext(u32),
    #[error("failed to update the EMM context (ueid={0})")]
    UpdateFailed(u32),
    #[error("ESM message is missing (ueid={0})")]
    MissingEsmPdu(u32),
    #[error(transparent)]
    Sap(#[from] SapError),
    #[error(transparent)]
    Api(#[from] MmeApiError),
}

// ============================================================================
// Attach Procedure
// ============================================================================

/// The MME-side attach state machine.
///
/// Single-threaded actor: every entry point runs to completion. Pending
/// operations (vector fetch, common procedures) re-enter through
/// `auth_info_answer` / `common_procedure_complete`, and timer expiry through
/// `handle_timeout`.
pub struct AttachProcedure<AS, ESM, API, CP> {
    config: MmeConfig,
    data: EmmData,
    timers: NasTimerMgr<EmmTimerEvent>,
    registry: CommonProcRegistry,
    mtmsi: MTmsiAllocator,
    emm_sap: AS,
    esm_sap: ESM,
    api: API,
    common: CP,
}

impl<AS, ESM, API, CP> AttachProcedure<AS, ESM, API, CP>
where
    AS: EmmSap,
    ESM: EsmSap,
    API: MmeApi,
    CP: EmmCommonProcedures,
{
    pub fn new(config: MmeConfig, emm_sap: AS, esm_sap: ESM, api: API, common: CP) -> Self {
        AttachProcedure {
            config,
            data: EmmData::new(),
            timers: NasTimerMgr::new(),
            registry: CommonProcRegistry::new(),
            mtmsi: MTmsiAllocator::new(),
            emm_sap,
            esm_sap,
            api,
            common,
        }
    }

    /// The context store, for registering observers and external lookups.
    pub fn data(&self) -> &EmmData {
        &self.data
    }

    /// Clone-out view of a UE context.
    pub fn context(&self, ue_id: u32) -> Option<EmmContext> {
        self.data.find_by_ue_id(ue_id)
    }

    /// Time until the earliest EMM timer expires.
    pub fn next_timeout(&self) -> Duration {
        self.timers.next()
    }

    /// Run the handlers of every expired EMM timer.
    pub fn process_expired_timers(&mut self) {
        for (_, event) in self.timers.expire() {
            if let Err(e) = self.handle_timeout(event) {
                log::error!("EMM-PROC - {} handling failed: {}", event.timer, e);
            }
        }
    }

    // ========================================================================
    // Entry points
    // ========================================================================

    /// Performs the UE requested attach procedure (TS 24.301 5.5.1.2.3).
    ///
    /// The network may initiate the identification, authentication and
    /// security mode control common procedures depending on the identities
    /// received in the ATTACH REQUEST (IMSI, GUTI, KSI).
    pub fn attach_request(&mut self, req: AttachRequest) -> Result<(), EmmProcError> {
        log::info!(
            "EMM-PROC - EPS attach type = {} requested (ueid={})",
            req.attach_type,
            req.ue_id
        );
        log::debug!(
            "EMM-PROC - eea=0x{:x} eia=0x{:x} umts_present={} gprs_present={}",
            req.eea,
            req.eia,
            req.umts_present,
            req.gprs_present
        );

        // Do not accept a UE with an invalid identifier
        if req.ue_id == INVALID_UE_ID {
            let mut ue_ctx = EmmContext::temporary(req.ue_id);
            ue_ctx.emm_cause = EmmCause::IllegalUe;
            return self.send_attach_reject(&ue_ctx);
        }

        // An MME not configured to support attach for emergency bearer
        // services shall reject an emergency attach.
        if req.attach_type == EmmAttachType::Emergency && !self.config.features.emergency_attach {
            let mut ue_ctx = EmmContext::temporary(req.ue_id);
            ue_ctx.emm_cause = EmmCause::ImeiNotAccepted;
            return self.send_attach_reject(&ue_ctx);
        }

        let existing = self.data.find_by_ue_id(req.ue_id);
        if let Some(ctx) = existing
            .as_ref()
            .filter(|c| c.fsm_status > EmmFsmStatus::Deregistered)
        {
            // An EMM context already exists for the UE in the network
            if Self::attach_have_changed(ctx, &req) {
                // TS 24.301 5.5.1.2.7 case e: the attach parameters have
                // changed; abort the previous procedure and run a new one.
                log::warn!(
                    "EMM-PROC - Attach parameters have changed (ueid={})",
                    req.ue_id
                );
                self.emm_reg_send(EmmSapPrimitive::ProcAbort { ue_id: req.ue_id })?;
                log::warn!(
                    "EMM-PROC - Initiate new attach procedure (ueid={})",
                    req.ue_id
                );
                return self.attach_request(req);
            }
            log::warn!(
                "EMM-PROC - Received duplicated Attach Request (ueid={})",
                req.ue_id
            );
            return Ok(());
        }

        if existing.is_none() {
            let mut rebound = false;
            if let Some(guti) = &req.guti {
                if let Some(old_ue_id) = self.data.find_ue_id_by_guti(guti) {
                    // The UE re-attaches on a new lower-layer identifier:
                    // move its context to the new key.
                    log::info!(
                        "EMM-PROC - GUTI {} known under ueid={}, rebinding to ueid={}",
                        guti,
                        old_ue_id,
                        req.ue_id
                    );
                    self.api.notify_ue_id_changed(old_ue_id, req.ue_id);
                    rebound = self.data.rebind_ue_id(old_ue_id, req.ue_id);
                }
            }

            if !rebound {
                // Create the UE's EMM context
                let mut ctx = EmmContext {
                    ue_id: req.ue_id,
                    is_dynamic: true,
                    ..Default::default()
                };
                fsm::log_transition(req.ue_id, ctx.fsm_status, EmmFsmStatus::Deregistered);
                ctx.fsm_status = EmmFsmStatus::Deregistered;
                self.data.add(ctx);
            }
        }

        if let Some(tai) = &req.tai {
            log::debug!(
                "EMM-PROC - Set tac {} in context (ueid={})",
                tai.tac,
                req.ue_id
            );
            self.data.with_context_mut(req.ue_id, |c| c.tac = tai.tac);
        }

        // Update the EMM context with the current attach parameters
        if self.attach_update(&req).is_err() {
            log::warn!(
                "EMM-PROC - Failed to update EMM context (ueid={})",
                req.ue_id
            );
            self.data
                .with_context_mut(req.ue_id, |c| c.emm_cause = EmmCause::IllegalUe);
            return self.attach_reject(req.ue_id);
        }

        self.attach_identify(req.ue_id)
    }

    /// Rejects an attach request received with a protocol error
    /// (TS 24.301 5.5.1.2.7 case b). No regular context is involved.
    pub fn attach_reject_request(
        &mut self,
        ue_id: u32,
        emm_cause: EmmCause,
    ) -> Result<(), EmmProcError> {
        let mut ue_ctx = EmmContext::temporary(ue_id);
        ue_ctx.emm_cause = if ue_id == INVALID_UE_ID {
            EmmCause::IllegalUe
        } else {
            emm_cause
        };
        self.send_attach_reject(&ue_ctx)
    }

    /// Terminates the attach procedure upon ATTACH COMPLETE
    /// (TS 24.301 5.5.1.2.4): stop T3450, consider the GUTI sent in the
    /// ATTACH ACCEPT valid, confirm the default bearer to ESM and enter
    /// EMM-REGISTERED.
    pub fn attach_complete(&mut self, ue_id: u32, esm_msg: &[u8]) -> Result<(), EmmProcError> {
        log::info!("EMM-PROC - EPS attach complete (ueid={})", ue_id);

        // Release the retransmission buffer
        let _ = self.registry.take_args(ue_id);

        let Some(ctx) = self.data.find_by_ue_id(ue_id) else {
            log::error!("EMM-PROC - No EMM context exists (ueid={})", ue_id);
            return Ok(());
        };

        if ctx.t3450 != NAS_TIMER_INACTIVE_ID {
            log::info!("EMM-PROC - Stop timer T3450 ({})", ctx.t3450);
            let id = self.timers.stop(ctx.t3450);
            self.data.with_context_mut(ue_id, |c| c.t3450 = id);
        }

        // The GUTI sent in the ATTACH ACCEPT is now the valid one
        self.data.with_context_mut(ue_id, |c| {
            c.guti_is_new = false;
            c.old_guti = None;
        });

        // Forward the activate default EPS bearer context accept to the
        // session management sublayer
        let response = self.esm_sap.send(EsmSapRequest {
            primitive: EsmSapPrimitive::DefaultEpsBearerContextActivateCnf,
            ue_id,
            is_standalone: false,
            recv: Some(esm_msg.to_vec()),
        });

        match response.err {
            EsmSapStatus::Success => {
                self.data.with_context_mut(ue_id, |c| {
                    c.is_attached = true;
                    c.esm_msg.clear();
                });
                self.emm_reg_send(EmmSapPrimitive::AttachCnf { ue_id })
            }
            EsmSapStatus::Failure => self.emm_reg_send(EmmSapPrimitive::AttachRej { ue_id }),
            // Discarded or answered with a status message: ignore
            EsmSapStatus::Discarded => Ok(()),
        }
    }

    /// Authentication vectors requested through `auth_info_req` have
    /// arrived; resume the pending attach step.
    pub fn auth_info_answer(&mut self, ue_id: u32, vector: AuthVector) -> Result<(), EmmProcError> {
        log::info!("EMM-PROC - Authentication vectors received (ueid={})", ue_id);
        self.data
            .with_context_mut(ue_id, |c| c.vector = Some(vector))
            .ok_or(EmmProcError::NoContext(ue_id))?;
        match self.registry.take_continuation(ue_id) {
            Some(continuation) => self.run_continuation(ue_id, continuation),
            None => {
                log::error!("EMM-PROC - No pending attach continuation (ueid={})", ue_id);
                Ok(())
            }
        }
    }

    /// A subordinate common procedure (identification, authentication,
    /// security mode control) has completed.
    pub fn common_procedure_complete(
        &mut self,
        ue_id: u32,
        outcome: CommonProcOutcome,
    ) -> Result<(), EmmProcError> {
        log::debug!(
            "EMM-PROC - Common procedure completed with {:?} (ueid={})",
            outcome,
            ue_id
        );
        match outcome {
            CommonProcOutcome::Success => match self.registry.take_continuation(ue_id) {
                Some(continuation) => self.run_continuation(ue_id, continuation),
                None => {
                    log::error!("EMM-PROC - No pending attach continuation (ueid={})", ue_id);
                    Ok(())
                }
            },
            CommonProcOutcome::Failure | CommonProcOutcome::Release => {
                self.registry.take_continuation(ue_id);
                self.attach_release(ue_id)
            }
        }
    }

    /// EMM timer expiry dispatch.
    pub fn handle_timeout(&mut self, event: EmmTimerEvent) -> Result<(), EmmProcError> {
        match event.timer {
            EmmTimerKind::T3450 => self.attach_t3450_exp(event.ue_id),
            EmmTimerKind::T3460 | EmmTimerKind::T3470 => {
                log::error!(
                    "EMM-PROC - Unexpected {} expiry (ueid={})",
                    event.timer,
                    event.ue_id
                );
                Ok(())
            }
        }
    }

    // ========================================================================
    // Timer handlers
    // ========================================================================

    /// T3450 expired (TS 24.301 5.5.1.2.7 case c): retransmit the ATTACH
    /// ACCEPT and restart T3450; on the fifth expiry abort the procedure.
    fn attach_t3450_exp(&mut self, ue_id: u32) -> Result<(), EmmProcError> {
        let Some(count) = self.registry.with_args_mut(ue_id, |d| {
            d.retransmission_count += 1;
            d.retransmission_count
        }) else {
            log::error!("EMM-PROC - T3450 expired with no attach data (ueid={})", ue_id);
            return Ok(());
        };

        log::warn!(
            "EMM-PROC - T3450 timer expired, retransmission counter = {} (ueid={})",
            count,
            ue_id
        );

        if count < ATTACH_COUNTER_MAX {
            self.attach_accept(ue_id)
        } else {
            match self.registry.take_args(ue_id) {
                Some(data) => self.attach_abort(data),
                None => Ok(()),
            }
        }
    }

    // ========================================================================
    // Abnormal cases
    // ========================================================================

    /// Aborts the attach procedure: the UE never confirmed the ATTACH
    /// ACCEPT. PDN connectivity is locally refused and the context released.
    fn attach_abort(&mut self, data: AttachData) -> Result<(), EmmProcError> {
        let ue_id = data.ue_id;
        log::warn!("EMM-PROC - Abort the attach procedure (ueid={})", ue_id);

        if let Some(ctx) = self.data.find_by_ue_id(ue_id) {
            if ctx.t3450 != NAS_TIMER_INACTIVE_ID {
                log::info!("EMM-PROC - Stop timer T3450 ({})", ctx.t3450);
                let id = self.timers.stop(ctx.t3450);
                self.data.with_context_mut(ue_id, |c| c.t3450 = id);
            }
        }
        drop(data);

        // The network locally refuses PDN connectivity to the UE
        self.esm_sap.send(EsmSapRequest {
            primitive: EsmSapPrimitive::PdnConnectivityRej,
            ue_id,
            is_standalone: false,
            recv: None,
        });

        self.emm_reg_send(EmmSapPrimitive::AttachRej { ue_id })?;
        self.attach_release(ue_id)
    }

    /// Releases the UE context data: timers, identities, keys, the ESM
    /// buffer and both index entries.
    fn attach_release(&mut self, ue_id: u32) -> Result<(), EmmProcError> {
        if let Some(ctx) = self.data.find_by_ue_id(ue_id) {
            log::warn!("EMM-PROC - Release UE context data (ueid={})", ue_id);
            self.stop_context_timers(&ctx);
            // Identities, keys and the ESM buffer are owned by the context
            // and go with it; remove drops both index entries.
            self.data.remove(ue_id);
            self.emm_reg_send(EmmSapPrimitive::ProcAbort { ue_id })?;
        }
        Ok(())
    }

    /// The attach procedure is not accepted by the network
    /// (TS 24.301 5.5.1.2.5): send ATTACH REJECT with the recorded cause and
    /// release the context when the procedure owns it.
    fn attach_reject(&mut self, ue_id: u32) -> Result<(), EmmProcError> {
        let Some(ctx) = self.data.find_by_ue_id(ue_id) else {
            return Err(EmmProcError::NoContext(ue_id));
        };
        let result = self.send_attach_reject(&ctx);
        // Release the UE context even if the reject transmission failed
        if ctx.is_dynamic {
            self.attach_release(ue_id)?;
        }
        result
    }

    fn send_attach_reject(&mut self, ctx: &EmmContext) -> Result<(), EmmProcError> {
        let emm_cause = if ctx.emm_cause == EmmCause::Success {
            EmmCause::IllegalUe
        } else {
            ctx.emm_cause
        };
        log::warn!(
            "EMM-PROC - EMM attach procedure not accepted by the network (ueid={}, cause={:?})",
            ctx.ue_id,
            emm_cause
        );

        // The ESM reject PDU rides along only for an ESM failure, and an
        // ESM failure without a PDU is an internal inconsistency.
        let nas_msg = if emm_cause != EmmCause::EsmFailure {
            Vec::new()
        } else if !ctx.esm_msg.is_empty() {
            ctx.esm_msg.clone()
        } else {
            log::error!("EMM-PROC - ESM message is missing (ueid={})", ctx.ue_id);
            return Err(EmmProcError::MissingEsmPdu(ctx.ue_id));
        };

        self.emm_sap
            .send(EmmSapPrimitive::EstablishRej(EstablishRej {
                ue_id: ctx.ue_id,
                emm_cause,
                security: sap::security_data(ctx.security.as_ref()),
                nas_msg,
            }))?;
        Ok(())
    }

    // ========================================================================
    // Identification, authentication and security
    // ========================================================================

    /// Performs the UE's identification; may initiate the identification,
    /// authentication and security mode control common procedures.
    fn attach_identify(&mut self, ue_id: u32) -> Result<(), EmmProcError> {
        let ctx = self
            .data
            .find_by_ue_id(ue_id)
            .ok_or(EmmProcError::NoContext(ue_id))?;
        log::info!(
            "EMM-PROC - Identify incoming UE (ueid={}) using {}",
            ue_id,
            if ctx.imsi.is_some() {
                "IMSI"
            } else if ctx.guti.is_some() {
                "GUTI"
            } else if ctx.imei.is_some() {
                "IMEI"
            } else {
                "none"
            }
        );

        let mut guti_reallocation = false;
        let mut failed = false;

        if let Some(imsi) = ctx.imsi {
            if ctx.security.is_none() {
                if ctx.vector.is_none() {
                    // No security context: ask the subscriber database for a
                    // fresh vector; the procedure resumes in
                    // auth_info_answer().
                    self.registry
                        .set_continuation(ue_id, AttachContinuation::Identify);
                    if self.api.auth_info_req(ue_id, &imsi, 1, None).is_err() {
                        log::warn!(
                            "EMM-PROC - Failed to request authentication vectors (ueid={})",
                            ue_id
                        );
                        self.data
                            .with_context_mut(ue_id, |c| c.emm_cause = EmmCause::IllegalUe);
                        return self.attach_reject(ue_id);
                    }
                    return Ok(());
                }
                // A vector is already available: proceed to authentication.
            } else {
                match self.api.identify_imsi(&imsi) {
                    Ok(vector) => {
                        self.data.with_context_mut(ue_id, |c| c.vector = Some(vector));
                    }
                    Err(_) => {
                        log::warn!(
                            "EMM-PROC - Failed to identify the UE using provided IMSI (ueid={})",
                            ue_id
                        );
                        self.data
                            .with_context_mut(ue_id, |c| c.emm_cause = EmmCause::IllegalUe);
                        failed = true;
                    }
                }
                guti_reallocation = true;
            }
        } else if let Some(guti) = ctx.guti {
            let lookup = if self.config.force_guti_identification {
                Err(MmeApiError::IdentificationFailed)
            } else {
                self.api.identify_guti(&guti)
            };
            match lookup {
                Ok(vector) => {
                    self.data.with_context_mut(ue_id, |c| c.vector = Some(vector));
                }
                Err(_) => {
                    // The GUTI is not known by the network: initiate an
                    // identification procedure to retrieve the IMSI from the
                    // UE (TS 23.401 figure 5.3.2.1-1, point 4).
                    log::warn!(
                        "EMM-PROC - Failed to identify the UE using provided GUTI (tmsi={})",
                        guti.m_tmsi
                    );
                    self.registry
                        .set_continuation(ue_id, AttachContinuation::Identify);
                    return match self
                        .common
                        .initiate_identification(ue_id, IdentityRequestType::Imsi)
                    {
                        Ok(()) => {
                            self.emm_reg_send(EmmSapPrimitive::CommonProcReq { ue_id })?;
                            Ok(())
                        }
                        Err(_) => {
                            log::warn!(
                                "EMM-PROC - Failed to initiate identification procedure (ueid={})",
                                ue_id
                            );
                            self.data
                                .with_context_mut(ue_id, |c| c.emm_cause = EmmCause::IllegalUe);
                            self.attach_reject(ue_id)
                        }
                    };
                }
            }
        } else if let (Some(imei), true) = (ctx.imei, ctx.is_emergency) {
            // Emergency attach using an IMEI
            match self.api.identify_imei(&imei) {
                Ok(vector) => {
                    self.data.with_context_mut(ue_id, |c| c.vector = Some(vector));
                }
                Err(_) => {
                    log::warn!(
                        "EMM-PROC - Failed to identify the UE using provided IMEI (ueid={})",
                        ue_id
                    );
                    self.data
                        .with_context_mut(ue_id, |c| c.emm_cause = EmmCause::ImeiNotAccepted);
                    failed = true;
                }
            }
        } else {
            log::warn!("EMM-PROC - UE's identity is not available (ueid={})", ue_id);
            self.data
                .with_context_mut(ue_id, |c| c.emm_cause = EmmCause::IllegalUe);
            failed = true;
        }

        if !failed && guti_reallocation {
            failed = self.reallocate_guti(ue_id).is_err();
        }

        if !failed {
            let ctx = self
                .data
                .find_by_ue_id(ue_id)
                .ok_or(EmmProcError::NoContext(ue_id))?;
            if ctx.security.is_some() {
                // A security context exists for the UE in the network;
                // proceed with the attach procedure.
                return self.attach(ue_id);
            }
            if ctx.is_emergency && self.config.features.unauthenticated_imsi {
                // Emergency attach for unauthenticated IMSIs may skip
                // authentication and go straight to security mode control
                // (TS 24.301 5.5.1.2.3).
                return self.attach_security(ue_id);
            }
            match ctx.vector {
                Some(vector) => {
                    self.registry
                        .set_continuation(ue_id, AttachContinuation::Security);
                    match self
                        .common
                        .initiate_authentication(ue_id, ctx.ksi, &vector.rand, &vector.autn)
                    {
                        Ok(()) => {
                            self.emm_reg_send(EmmSapPrimitive::CommonProcReq { ue_id })?;
                            return Ok(());
                        }
                        Err(_) => {
                            log::warn!(
                                "EMM-PROC - Failed to initiate authentication procedure (ueid={})",
                                ue_id
                            );
                            self.data
                                .with_context_mut(ue_id, |c| c.emm_cause = EmmCause::IllegalUe);
                            failed = true;
                        }
                    }
                }
                None => {
                    log::warn!(
                        "EMM-PROC - No authentication vector available (ueid={})",
                        ue_id
                    );
                    self.data
                        .with_context_mut(ue_id, |c| c.emm_cause = EmmCause::IllegalUe);
                    failed = true;
                }
            }
        }

        if failed {
            return self.attach_reject(ue_id);
        }
        Ok(())
    }

    /// Assign a new GUTI, keeping the one the UE identified itself with for
    /// the implicit reallocation in the ATTACH ACCEPT.
    fn reallocate_guti(&mut self, ue_id: u32) -> Result<(), EmmProcError> {
        let ctx = self
            .data
            .find_by_ue_id(ue_id)
            .ok_or(EmmProcError::NoContext(ue_id))?;
        let Some(imsi) = ctx.imsi else {
            return Err(EmmProcError::UpdateFailed(ue_id));
        };

        match self.api.new_guti(&imsi) {
            Ok(alloc) => {
                log::info!(
                    "EMM-PROC - New GUTI assigned to the UE (tmsi={})",
                    alloc.guti.m_tmsi
                );
                let old = self
                    .data
                    .with_context_mut(ue_id, |c| {
                        let old = c.guti;
                        c.old_guti = c.guti;
                        c.guti = Some(alloc.guti);
                        c.guti_is_new = true;
                        c.tac = alloc.tac;
                        c.n_tacs = alloc.n_tacs;
                        old
                    })
                    .ok_or(EmmProcError::NoContext(ue_id))?;
                self.data.reindex_guti(ue_id, old.as_ref(), &alloc.guti);
                Ok(())
            }
            Err(e) => {
                log::warn!("EMM-PROC - Failed to assign new GUTI (ueid={})", ue_id);
                self.data
                    .with_context_mut(ue_id, |c| c.emm_cause = EmmCause::IllegalUe);
                Err(e.into())
            }
        }
    }

    /// Initiates the security mode control common procedure, creating a
    /// fresh NAS security context when none exists.
    fn attach_security(&mut self, ue_id: u32) -> Result<(), EmmProcError> {
        log::info!("EMM-PROC - Setup NAS security (ueid={})", ue_id);

        let ctx = self
            .data
            .with_context_mut(ue_id, |c| {
                if c.security.is_none() {
                    // No key set yet, null algorithms
                    c.security = Some(SecurityContext::default());
                }
                c.clone()
            })
            .ok_or(EmmProcError::NoContext(ue_id))?;

        let capabilities = SecurityCapabilities {
            eea: ctx.eea,
            eia: ctx.eia,
            ucs2: ctx.ucs2,
            uea: ctx.uea,
            uia: ctx.uia,
            gea: ctx.gea,
            umts_present: ctx.umts_present,
            gprs_present: ctx.gprs_present,
        };
        self.registry
            .set_continuation(ue_id, AttachContinuation::Attach);
        match self
            .common
            .initiate_security_mode_control(ue_id, ctx.ksi, &capabilities)
        {
            Ok(()) => {
                self.emm_reg_send(EmmSapPrimitive::CommonProcReq { ue_id })?;
                Ok(())
            }
            Err(_) => {
                log::warn!(
                    "EMM-PROC - Failed to initiate security mode control procedure (ueid={})",
                    ue_id
                );
                self.data
                    .with_context_mut(ue_id, |c| c.emm_cause = EmmCause::IllegalUe);
                self.attach_reject(ue_id)
            }
        }
    }

    // ========================================================================
    // Attach acceptance
    // ========================================================================

    /// Runs the attach signalling once identification, authentication and
    /// security have succeeded: PDN connectivity round-trip with ESM, then
    /// ATTACH ACCEPT under T3450.
    fn attach(&mut self, ue_id: u32) -> Result<(), EmmProcError> {
        log::info!("EMM-PROC - Attach UE (ueid={})", ue_id);
        let ctx = self
            .data
            .find_by_ue_id(ue_id)
            .ok_or(EmmProcError::NoContext(ue_id))?;

        // Notify ESM that PDN connectivity is requested
        let response = self.esm_sap.send(EsmSapRequest {
            primitive: EsmSapPrimitive::PdnConnectivityReq,
            ue_id,
            is_standalone: false,
            recv: Some(ctx.esm_msg.clone()),
        });

        match response.err {
            EsmSapStatus::Success => {
                // Cache the ESM container for the T3450 retransmissions and
                // bind the buffer to the ongoing procedure so an abort can
                // find it.
                self.registry.set_args(
                    ue_id,
                    AttachData {
                        ue_id,
                        retransmission_count: 0,
                        esm_msg: response.send,
                    },
                );

                if self.attach_accept(ue_id).is_err() {
                    log::warn!(
                        "EMM-PROC - Failed to respond to Attach Request (ueid={})",
                        ue_id
                    );
                    self.data
                        .with_context_mut(ue_id, |c| c.emm_cause = EmmCause::ProtocolError);
                    return self.attach_reject(ue_id);
                }

                let ctx = self
                    .data
                    .find_by_ue_id(ue_id)
                    .ok_or(EmmProcError::NoContext(ue_id))?;
                if ctx.guti_is_new && ctx.old_guti.is_some() {
                    // Implicit GUTI reallocation counts as an initiated
                    // common procedure
                    self.emm_reg_send(EmmSapPrimitive::CommonProcReq { ue_id })?;
                }
                Ok(())
            }
            EsmSapStatus::Failure => {
                // Include the PDN connectivity reject PDU within the attach
                // reject message
                self.data.with_context_mut(ue_id, |c| {
                    c.emm_cause = EmmCause::EsmFailure;
                    c.esm_msg = response.send.clone();
                });
                self.attach_reject(ue_id)
            }
            // The received message has been discarded or a status message
            // has been returned; ignore the ESM failure
            EsmSapStatus::Discarded => Ok(()),
        }
    }

    /// Sends the ATTACH ACCEPT message and starts (or restarts) T3450.
    fn attach_accept(&mut self, ue_id: u32) -> Result<(), EmmProcError> {
        // A late expiry may race a context that is already gone
        let Some(ctx) = self.data.find_by_ue_id(ue_id) else {
            log::warn!("EMM-PROC - No EMM context to accept (ueid={})", ue_id);
            return Ok(());
        };
        let Some(data) = self.registry.args(ue_id) else {
            log::warn!("EMM-PROC - No attach data bound (ueid={})", ue_id);
            return Ok(());
        };

        let (guti, new_guti) = if ctx.guti_is_new && ctx.old_guti.is_some() {
            // Implicit GUTI reallocation: identify the UE by the old GUTI
            // and carry the newly assigned one
            log::info!(
                "EMM-PROC - Implicit GUTI reallocation, include the new assigned GUTI (ueid={})",
                ue_id
            );
            (ctx.old_guti, ctx.guti)
        } else if ctx.guti_is_new {
            log::info!(
                "EMM-PROC - Include the new assigned GUTI in the Attach Accept message (ueid={})",
                ue_id
            );
            (ctx.guti, ctx.guti)
        } else {
            (ctx.guti, None)
        };

        if let Some(current) = ctx.guti.as_ref() {
            self.api.notify_new_guti(ue_id, current);
        }

        let selected = ctx
            .security
            .as_ref()
            .map(|s| s.selected_algorithms)
            .unwrap_or_default();

        self.emm_sap
            .send(EmmSapPrimitive::EstablishCnf(EstablishCnf {
                ue_id,
                guti,
                new_guti,
                n_tacs: ctx.n_tacs,
                tac: ctx.tac,
                nas_info: NasInfo::Attach,
                security: sap::security_data(ctx.security.as_ref()),
                encryption: selected.encryption,
                integrity: selected.integrity,
                nas_msg: data.esm_msg.clone(),
            }))?;

        self.set_fsm_status(ue_id, EmmFsmStatus::RegisteredInitiated);

        if ctx.t3450 != NAS_TIMER_INACTIVE_ID {
            let id = self.timers.restart(ctx.t3450);
            self.data.with_context_mut(ue_id, |c| c.t3450 = id);
            log::info!("EMM-PROC - Timer T3450 ({}) restarted (ueid={})", id, ue_id);
        } else {
            let id = self.timers.start(
                self.config.t3450(),
                EmmTimerEvent {
                    timer: EmmTimerKind::T3450,
                    ue_id,
                },
            );
            self.data.with_context_mut(ue_id, |c| c.t3450 = id);
            log::info!(
                "EMM-PROC - Timer T3450 ({}) expires in {} seconds (ueid={})",
                id,
                self.config.timers.t3450,
                ue_id
            );
        }
        Ok(())
    }

    // ========================================================================
    // Context update and change detection
    // ========================================================================

    /// Checks whether the attach parameters differ from the ones stored when
    /// the previous attach procedure was initiated (TS 24.301 5.5.1.2.7
    /// case e): any difference invalidates the in-progress attach.
    fn attach_have_changed(ctx: &EmmContext, req: &AttachRequest) -> bool {
        // Emergency bearer services indicator
        if (req.attach_type == EmmAttachType::Emergency) != ctx.is_emergency {
            log::debug!("EMM-PROC - attach_have_changed: emergency");
            return true;
        }

        // Security key set identifier
        if req.ksi != ctx.ksi {
            log::debug!(
                "EMM-PROC - attach_have_changed: ksi {}/{} (ctxt)",
                req.ksi,
                ctx.ksi
            );
            return true;
        }

        // Supported EPS encryption and integrity algorithms
        if req.eea != ctx.eea {
            log::debug!(
                "EMM-PROC - attach_have_changed: eea 0x{:x}/0x{:x} (ctxt)",
                req.eea,
                ctx.eea
            );
            return true;
        }
        if req.eia != ctx.eia {
            log::debug!(
                "EMM-PROC - attach_have_changed: eia 0x{:x}/0x{:x} (ctxt)",
                req.eia,
                ctx.eia
            );
            return true;
        }

        if req.umts_present != ctx.umts_present {
            log::debug!("EMM-PROC - attach_have_changed: umts_present");
            return true;
        }
        if req.umts_present && ctx.umts_present {
            if req.ucs2 != ctx.ucs2 {
                log::debug!("EMM-PROC - attach_have_changed: ucs2");
                return true;
            }
            if req.uea != ctx.uea {
                log::debug!(
                    "EMM-PROC - attach_have_changed: uea 0x{:x}/0x{:x} (ctxt)",
                    req.uea,
                    ctx.uea
                );
                return true;
            }
            if req.uia != ctx.uia {
                log::debug!(
                    "EMM-PROC - attach_have_changed: uia 0x{:x}/0x{:x} (ctxt)",
                    req.uia,
                    ctx.uia
                );
                return true;
            }
        }

        if req.gprs_present != ctx.gprs_present {
            log::debug!("EMM-PROC - attach_have_changed: gprs_present");
            return true;
        }
        if req.gprs_present && ctx.gprs_present && req.gea != ctx.gea {
            log::debug!(
                "EMM-PROC - attach_have_changed: gea 0x{:x}/0x{:x} (ctxt)",
                req.gea,
                ctx.gea
            );
            return true;
        }

        // The GUTI if provided by the UE. A GUTI the network assigned
        // itself is not part of the request parameters: compare against the
        // one the UE last supplied.
        let stored_guti = if ctx.guti_is_new {
            ctx.old_guti.as_ref()
        } else {
            ctx.guti.as_ref()
        };
        match (req.guti.as_ref(), stored_guti) {
            (Some(_), None) | (None, Some(_)) => {
                log::debug!("EMM-PROC - attach_have_changed: guti presence");
                return true;
            }
            (Some(guti), Some(stored)) => {
                if guti.m_tmsi != stored.m_tmsi {
                    log::debug!(
                        "EMM-PROC - attach_have_changed: guti/m_tmsi {}/{} (ctxt)",
                        guti,
                        stored
                    );
                    return true;
                }
                if guti.mme_code != stored.mme_code
                    || guti.mme_gid != stored.mme_gid
                    || guti.plmn_id.mcc1 != stored.plmn_id.mcc1
                    || guti.plmn_id.mcc2 != stored.plmn_id.mcc2
                    || guti.plmn_id.mcc3 != stored.plmn_id.mcc3
                    || guti.plmn_id.mnc1 != stored.plmn_id.mnc1
                    || guti.plmn_id.mnc2 != stored.plmn_id.mnc2
                    || guti.plmn_id.mnc3 != stored.plmn_id.mnc3
                {
                    log::debug!(
                        "EMM-PROC - attach_have_changed: guti/gummei {}/{} (ctxt)",
                        guti,
                        stored
                    );
                    return true;
                }
            }
            (None, None) => {}
        }

        // The IMSI if provided by the UE
        match (req.imsi.as_ref(), ctx.imsi.as_ref()) {
            (Some(_), None) | (None, Some(_)) => {
                log::debug!("EMM-PROC - attach_have_changed: imsi presence");
                return true;
            }
            (Some(imsi), Some(stored)) if imsi != stored => {
                log::debug!(
                    "EMM-PROC - attach_have_changed: imsi {}/{} (ctxt)",
                    imsi,
                    stored
                );
                return true;
            }
            _ => {}
        }

        // The IMEI if provided by the UE
        match (req.imei.as_ref(), ctx.imei.as_ref()) {
            (Some(_), None) | (None, Some(_)) => {
                log::debug!("EMM-PROC - attach_have_changed: imei presence");
                return true;
            }
            (Some(imei), Some(stored)) if imei != stored => {
                log::debug!(
                    "EMM-PROC - attach_have_changed: imei {}/{} (ctxt)",
                    imei,
                    stored
                );
                return true;
            }
            _ => {}
        }

        false
    }

    /// Updates the EMM context with the current attach parameters; when the
    /// UE supplied no GUTI and an IMSI is available, synthesizes one from
    /// the configured GUMMEI and the IMSI's PLMN.
    fn attach_update(&mut self, req: &AttachRequest) -> Result<(), EmmProcError> {
        let ue_id = req.ue_id;

        // Pre-compute the network-assigned GUTI so the context mutation
        // below stays a pure field update.
        let synthesized: Option<(EpsGuti, u16)> = match (&req.guti, &req.imsi) {
            (Some(_), _) => None,
            (None, Some(imsi)) => {
                let digits = imsi
                    .plmn_digits()
                    .ok_or(EmmProcError::UpdateFailed(ue_id))?;
                let plmn_id = match self.api.find_mnc_length(digits) {
                    Some(2) => PlmnId {
                        mcc1: digits[0],
                        mcc2: digits[1],
                        mcc3: digits[2],
                        mnc1: digits[3],
                        mnc2: digits[4],
                        mnc3: 0xf,
                    },
                    Some(3) => PlmnId {
                        mcc1: digits[0],
                        mcc2: digits[1],
                        mcc3: digits[2],
                        mnc1: digits[4],
                        mnc2: digits[5],
                        mnc3: digits[3],
                    },
                    _ => return Err(EmmProcError::UpdateFailed(ue_id)),
                };
                let guti = EpsGuti {
                    plmn_id,
                    mme_gid: self.config.gummei.mme_gid,
                    mme_code: self.config.gummei.mme_code,
                    m_tmsi: self.mtmsi.allocate(),
                };
                log::info!(
                    "EMM-PROC - Assign GUTI {} from IMSI {} (ueid={})",
                    guti,
                    imsi,
                    ue_id
                );
                Some((guti, self.config.gummei.tac))
            }
            // No GUTI and no IMSI (emergency attach using an IMEI): the
            // identities on record are left alone.
            (None, None) => None,
        };

        let old_guti = self
            .data
            .with_context_mut(ue_id, |ctx| {
                ctx.ue_id = ue_id;
                ctx.is_emergency = req.attach_type == EmmAttachType::Emergency;
                ctx.ksi = req.ksi;
                ctx.eea = req.eea;
                ctx.eia = req.eia;
                ctx.ucs2 = req.ucs2;
                ctx.uea = req.uea;
                ctx.uia = req.uia;
                ctx.gea = req.gea;
                ctx.umts_present = req.umts_present;
                ctx.gprs_present = req.gprs_present;

                let old_guti = ctx.guti;
                if let Some(guti) = req.guti {
                    ctx.guti = Some(guti);
                } else if let Some((guti, tac)) = synthesized {
                    ctx.guti = Some(guti);
                    ctx.guti_is_new = true;
                    ctx.tac = tac;
                }

                if let Some(imsi) = req.imsi {
                    ctx.imsi = Some(imsi);
                }
                if let Some(imei) = req.imei {
                    ctx.imei = Some(imei);
                }

                // The ESM message contained within the attach request
                if req.esm_msg.is_empty() {
                    ctx.esm_msg.clear();
                } else {
                    ctx.esm_msg = req.esm_msg.clone();
                }

                ctx.is_attached = false;
                old_guti
            })
            .ok_or(EmmProcError::NoContext(ue_id))?;

        // Keep the GUTI index in step with the mutation
        let current = self
            .data
            .find_by_ue_id(ue_id)
            .ok_or(EmmProcError::NoContext(ue_id))?
            .guti;
        if let Some(current) = current {
            if old_guti != Some(current) {
                self.data.reindex_guti(ue_id, old_guti.as_ref(), &current);
            }
        }

        Ok(())
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn run_continuation(
        &mut self,
        ue_id: u32,
        continuation: AttachContinuation,
    ) -> Result<(), EmmProcError> {
        match continuation {
            AttachContinuation::Identify => self.attach_identify(ue_id),
            AttachContinuation::Security => self.attach_security(ue_id),
            AttachContinuation::Attach => self.attach(ue_id),
        }
    }

    /// Applies the state transition an EMM-REG primitive implies, runs the
    /// cancellation an abort implies, then forwards the primitive.
    fn emm_reg_send(&mut self, primitive: EmmSapPrimitive) -> Result<(), EmmProcError> {
        if let Some((ue_id, status)) = fsm::emm_reg_target(&primitive) {
            self.set_fsm_status(ue_id, status);
        }
        if let EmmSapPrimitive::ProcAbort { ue_id } = primitive {
            // Abort cancels the subordinate procedures, drops the pending
            // retransmission buffer and stops any running timers.
            self.registry.remove(ue_id);
            if let Some(ctx) = self.data.find_by_ue_id(ue_id) {
                self.stop_context_timers(&ctx);
            }
        }
        self.emm_sap.send(primitive)?;
        Ok(())
    }

    fn set_fsm_status(&mut self, ue_id: u32, status: EmmFsmStatus) {
        self.data.with_context_mut(ue_id, |c| {
            if c.fsm_status != status {
                fsm::log_transition(ue_id, c.fsm_status, status);
                c.fsm_status = status;
            }
        });
    }

    fn stop_context_timers(&mut self, ctx: &EmmContext) {
        let ue_id = ctx.ue_id;
        for (kind, id) in [
            (EmmTimerKind::T3450, ctx.t3450),
            (EmmTimerKind::T3460, ctx.t3460),
            (EmmTimerKind::T3470, ctx.t3470),
        ] {
            if id != NAS_TIMER_INACTIVE_ID {
                log::info!("EMM-PROC - Stop timer {} ({})", kind, id);
                let id = self.timers.stop(id);
                self.data.with_context_mut(ue_id, |c| match kind {
                    EmmTimerKind::T3450 => c.t3450 = id,
                    EmmTimerKind::T3460 => c.t3460 = id,
                    EmmTimerKind::T3470 => c.t3470 = id,
                });
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
