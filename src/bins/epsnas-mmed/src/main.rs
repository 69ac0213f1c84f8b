//! EPSNAS MME (Mobility Management Entity)
//!
//! NAS EPS Mobility Management daemon: runs the UE attach procedure on top
//! of pluggable access-stratum, session-management and subscriber-database
//! peers.

use anyhow::Result;
use clap::Parser;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub mod attach;
pub mod common;
pub mod config;
pub mod context;
pub mod esm_sap;
pub mod fsm;
pub mod mme_api;
pub mod sap;

#[cfg(test)]
mod property_tests;

use attach::AttachProcedure;
use common::{CommonProcError, EmmCommonProcedures, IdentityRequestType, SecurityCapabilities};
use config::MmeConfig;
use context::{AuthVector, EpsGuti, Imei, Imsi, PlmnId};
use esm_sap::{EsmSap, EsmSapRequest, EsmSapResponse, EsmSapStatus};
use mme_api::{GutiAllocation, MmeApi, MmeApiError};
use sap::{EmmSap, EmmSapPrimitive, SapError};

/// EPSNAS MME - EPS Mobility Management daemon
#[derive(Parser, Debug)]
#[command(name = "epsnas-mmed")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "EPC Mobility Management Entity (NAS EMM)")]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/epsnas/mme.yaml")]
    config: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Disable color output
    #[arg(long)]
    no_color: bool,

    /// Run in daemon mode
    #[arg(short, long)]
    daemon: bool,
}

// ============================================================================
// Standalone peer links
// ============================================================================
//
// In a full deployment these are backed by the S1AP stack, the ESM sublayer
// and the HSS front-end. The standalone daemon runs against logging stubs.

/// Access-stratum link consuming the EMM primitives
struct AsLink;

impl EmmSap for AsLink {
    fn send(&mut self, primitive: EmmSapPrimitive) -> Result<(), SapError> {
        log::debug!(
            "EMM-AS - delivering primitive (ueid={}): {:?}",
            primitive.ue_id(),
            primitive
        );
        Ok(())
    }
}

/// ESM sublayer link
struct EsmLink;

impl EsmSap for EsmLink {
    fn send(&mut self, request: EsmSapRequest) -> EsmSapResponse {
        log::debug!(
            "ESM-SAP - {:?} (ueid={}, pdu={} bytes)",
            request.primitive,
            request.ue_id,
            request.recv.as_ref().map(|p| p.len()).unwrap_or(0)
        );
        EsmSapResponse {
            err: EsmSapStatus::Success,
            send: Vec::new(),
        }
    }
}

/// Subscriber database (HSS) link
struct HssLink {
    config: MmeConfig,
    next_m_tmsi: u32,
}

impl MmeApi for HssLink {
    fn identify_imsi(&mut self, imsi: &Imsi) -> Result<AuthVector, MmeApiError> {
        log::debug!("MME-API - identify IMSI {}", imsi);
        Ok(AuthVector::default())
    }

    fn identify_guti(&mut self, guti: &EpsGuti) -> Result<AuthVector, MmeApiError> {
        log::debug!("MME-API - identify GUTI {}", guti);
        Err(MmeApiError::IdentificationFailed)
    }

    fn identify_imei(&mut self, imei: &Imei) -> Result<AuthVector, MmeApiError> {
        log::debug!("MME-API - identify IMEI {}", imei);
        Ok(AuthVector::default())
    }

    fn new_guti(&mut self, imsi: &Imsi) -> Result<GutiAllocation, MmeApiError> {
        let digits = imsi.plmn_digits().ok_or(MmeApiError::GutiAllocationFailed)?;
        self.next_m_tmsi = self.next_m_tmsi.wrapping_add(1).max(1);
        Ok(GutiAllocation {
            guti: EpsGuti {
                plmn_id: PlmnId {
                    mcc1: digits[0],
                    mcc2: digits[1],
                    mcc3: digits[2],
                    mnc1: digits[3],
                    mnc2: digits[4],
                    mnc3: 0xf,
                },
                mme_gid: self.config.gummei.mme_gid,
                mme_code: self.config.gummei.mme_code,
                m_tmsi: self.next_m_tmsi,
            },
            tac: self.config.gummei.tac,
            n_tacs: 1,
        })
    }

    fn auth_info_req(
        &mut self,
        ue_id: u32,
        imsi: &Imsi,
        num_vectors: usize,
        _last_visited_plmn: Option<&PlmnId>,
    ) -> Result<(), MmeApiError> {
        log::debug!(
            "MME-API - authentication info request (ueid={}, imsi={}, vectors={})",
            ue_id,
            imsi,
            num_vectors
        );
        Ok(())
    }

    fn notify_ue_id_changed(&mut self, old_ue_id: u32, new_ue_id: u32) {
        log::debug!("MME-API - ueid changed {} -> {}", old_ue_id, new_ue_id);
    }

    fn notify_new_guti(&mut self, ue_id: u32, guti: &EpsGuti) {
        log::debug!("MME-API - new GUTI {} (ueid={})", guti, ue_id);
    }

    fn find_mnc_length(&self, _plmn_digits: [u8; 6]) -> Option<u8> {
        Some(2)
    }
}

/// EMM common procedure driver
struct CommonProcLink;

impl EmmCommonProcedures for CommonProcLink {
    fn initiate_identification(
        &mut self,
        ue_id: u32,
        ident_type: IdentityRequestType,
    ) -> Result<(), CommonProcError> {
        log::debug!(
            "EMM-PROC - identification requested (ueid={}, type={:?})",
            ue_id,
            ident_type
        );
        Ok(())
    }

    fn initiate_authentication(
        &mut self,
        ue_id: u32,
        ksi: u8,
        _rand: &[u8; 16],
        _autn: &[u8; 16],
    ) -> Result<(), CommonProcError> {
        log::debug!(
            "EMM-PROC - authentication requested (ueid={}, ksi={})",
            ue_id,
            ksi
        );
        Ok(())
    }

    fn initiate_security_mode_control(
        &mut self,
        ue_id: u32,
        ksi: u8,
        _capabilities: &SecurityCapabilities,
    ) -> Result<(), CommonProcError> {
        log::debug!(
            "EMM-PROC - security mode control requested (ueid={}, ksi={})",
            ue_id,
            ksi
        );
        Ok(())
    }
}

// ============================================================================
// Application
// ============================================================================

/// MME application state
pub struct MmeApp {
    running: Arc<AtomicBool>,
    attach: AttachProcedure<AsLink, EsmLink, HssLink, CommonProcLink>,
}

impl MmeApp {
    pub fn new(config: MmeConfig) -> Self {
        let hss = HssLink {
            config: config.clone(),
            next_m_tmsi: 0,
        };
        MmeApp {
            running: Arc::new(AtomicBool::new(true)),
            attach: AttachProcedure::new(config, AsLink, EsmLink, hss, CommonProcLink),
        }
    }

    /// Initialize the MME application
    pub fn init(&mut self) -> Result<()> {
        log::info!("Initializing MME...");

        self.attach
            .data()
            .set_ue_id_change_observer(Box::new(|old_ue_id, new_ue_id| {
                log::debug!("AS correlation - ueid {} -> {}", old_ue_id, new_ue_id);
            }));

        log::info!("MME initialized successfully");
        Ok(())
    }

    /// Run the MME main loop: sleep until the next EMM timer is due, then
    /// run the expired handlers.
    pub fn run(&mut self) -> Result<()> {
        log::info!("MME running...");

        while self.running.load(Ordering::SeqCst) {
            let wait = self.attach.next_timeout().min(Duration::from_millis(100));
            std::thread::sleep(wait);
            self.attach.process_expired_timers();
        }

        log::info!("MME main loop exited");
        Ok(())
    }

    /// Shutdown the MME application
    pub fn shutdown(&mut self) {
        log::info!("Shutting down MME...");
        log::debug!("{} UE context(s) at shutdown", self.attach.data().len());
        log::info!("MME shutdown complete");
    }

    /// Signal the application to stop
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Get the running flag for signal handlers
    pub fn running_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = match args.log_level.to_lowercase().as_str() {
        "trace" => log::LevelFilter::Trace,
        "debug" => log::LevelFilter::Debug,
        "info" => log::LevelFilter::Info,
        "warn" => log::LevelFilter::Warn,
        "error" => log::LevelFilter::Error,
        _ => log::LevelFilter::Info,
    };

    env_logger::Builder::new()
        .filter_level(log_level)
        .format_timestamp_millis()
        .init();

    log::info!("EPSNAS MME v{}", env!("CARGO_PKG_VERSION"));
    log::info!("Configuration: {}", args.config);

    let config = if Path::new(&args.config).exists() {
        MmeConfig::load(&args.config)?
    } else {
        log::warn!("Configuration file not found, using defaults");
        MmeConfig::default()
    };

    let mut app = MmeApp::new(config);

    let running = app.running_flag();
    ctrlc::set_handler(move || {
        log::info!("Received shutdown signal");
        running.store(false, Ordering::SeqCst);
    })?;

    app.init()?;
    app.run()?;
    app.shutdown();

    log::info!("EPSNAS MME terminated");
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================
