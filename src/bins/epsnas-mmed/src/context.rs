//! EMM Context Management
//!
//! Per-UE EMM context with identity, capability and security state, plus the
//! context store indexed by lower-layer UE id and by GUTI.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::RwLock;

use epsnas_core::{NasTimerId, NAS_TIMER_INACTIVE_ID};

use crate::fsm::EmmFsmStatus;
use crate::sap::EmmCause;

// ============================================================================
// Constants
// ============================================================================

/// Maximum number of IMSI digits
pub const MAX_IMSI_DIGITS: usize = 15;
/// Maximum number of IMEI digits
pub const MAX_IMEI_DIGITS: usize = 15;

/// RAND length
pub const AUTH_RAND_LEN: usize = 16;
/// AUTN length
pub const AUTH_AUTN_LEN: usize = 16;
/// Maximum XRES length
pub const AUTH_XRES_MAX_LEN: usize = 16;
/// KASME length
pub const AUTH_KASME_LEN: usize = 32;
/// NAS key length (K_NASenc, K_NASint)
pub const NAS_KEY_LEN: usize = 16;

/// NAS KSI value meaning no key is available
pub const NAS_KSI_NO_KEY_AVAILABLE: u8 = 7;

/// EPS encryption algorithm EEA0 (null ciphering)
pub const NAS_SECURITY_ALGORITHMS_EEA0: u8 = 0;
/// EPS integrity algorithm EIA0 (null integrity)
pub const NAS_SECURITY_ALGORITHMS_EIA0: u8 = 0;

/// Lower-layer UE identifier value that is never valid
pub const INVALID_UE_ID: u32 = 0;

// ============================================================================
// Basic Types
// ============================================================================

/// PLMN ID as six BCD digits (MNC digit 3 is 0xf for a 2-digit MNC)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct PlmnId {
    pub mcc1: u8,
    pub mcc2: u8,
    pub mcc3: u8,
    pub mnc1: u8,
    pub mnc2: u8,
    pub mnc3: u8,
}

impl fmt::Display for PlmnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.mnc3 == 0xf {
            write!(
                f,
                "{}{}{}.{}{}",
                self.mcc1, self.mcc2, self.mcc3, self.mnc1, self.mnc2
            )
        } else {
            write!(
                f,
                "{}{}{}.{}{}{}",
                self.mcc1, self.mcc2, self.mcc3, self.mnc1, self.mnc2, self.mnc3
            )
        }
    }
}

/// EPS Tracking Area Identity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct EpsTai {
    pub plmn_id: PlmnId,
    /// TAC (16 bits for EPS)
    pub tac: u16,
}

/// EPS GUTI
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct EpsGuti {
    pub plmn_id: PlmnId,
    /// MME Group ID
    pub mme_gid: u16,
    /// MME Code
    pub mme_code: u8,
    /// M-TMSI
    pub m_tmsi: u32,
}

impl fmt::Display for EpsGuti {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{:04x}.{:02x}.{:08x}",
            self.plmn_id, self.mme_gid, self.mme_code, self.m_tmsi
        )
    }
}

/// IMSI as BCD digits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Imsi {
    digits: [u8; MAX_IMSI_DIGITS],
    length: usize,
}

impl Imsi {
    /// Build from decimal digits. Returns `None` when empty, too long, or a
    /// digit is out of range.
    pub fn from_digits(digits: &[u8]) -> Option<Self> {
        if digits.is_empty() || digits.len() > MAX_IMSI_DIGITS {
            return None;
        }
        if digits.iter().any(|&d| d > 9) {
            return None;
        }
        let mut imsi = Imsi {
            digits: [0; MAX_IMSI_DIGITS],
            length: digits.len(),
        };
        imsi.digits[..digits.len()].copy_from_slice(digits);
        Some(imsi)
    }

    /// Build from a decimal string, ignoring separator characters.
    pub fn from_bcd(s: &str) -> Option<Self> {
        let digits: Vec<u8> = s
            .chars()
            .filter(|c| *c != '-')
            .map(|c| c.to_digit(10).map(|d| d as u8))
            .collect::<Option<Vec<u8>>>()?;
        Imsi::from_digits(&digits)
    }

    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Digit at 0-based position `i`.
    pub fn digit(&self, i: usize) -> u8 {
        self.digits[i]
    }

    /// The six leading digits identifying the home PLMN, when present.
    pub fn plmn_digits(&self) -> Option<[u8; 6]> {
        if self.length < 6 {
            return None;
        }
        let mut d = [0u8; 6];
        d.copy_from_slice(&self.digits[..6]);
        Some(d)
    }
}

impl fmt::Display for Imsi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for d in &self.digits[..self.length] {
            write!(f, "{}", d)?;
        }
        Ok(())
    }
}

/// IMEI as BCD digits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Imei {
    digits: [u8; MAX_IMEI_DIGITS],
    length: usize,
}

impl Imei {
    pub fn from_digits(digits: &[u8]) -> Option<Self> {
        if digits.is_empty() || digits.len() > MAX_IMEI_DIGITS {
            return None;
        }
        if digits.iter().any(|&d| d > 9) {
            return None;
        }
        let mut imei = Imei {
            digits: [0; MAX_IMEI_DIGITS],
            length: digits.len(),
        };
        imei.digits[..digits.len()].copy_from_slice(digits);
        Some(imei)
    }
}

impl fmt::Display for Imei {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for d in &self.digits[..self.length] {
            write!(f, "{}", d)?;
        }
        Ok(())
    }
}

// ============================================================================
// Security Types
// ============================================================================

/// Authentication vector obtained from the subscriber database
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthVector {
    /// RAND (random challenge)
    pub rand: [u8; AUTH_RAND_LEN],
    /// AUTN (authentication token)
    pub autn: [u8; AUTH_AUTN_LEN],
    /// Expected response
    pub xres: [u8; AUTH_XRES_MAX_LEN],
    /// XRES length
    pub xres_len: u8,
    /// KASME (derived key)
    pub kasme: [u8; AUTH_KASME_LEN],
}

/// Type of the NAS security context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SecurityContextType {
    /// No key is available
    #[default]
    NotAvailable,
    /// Native EPS security context
    Native,
    /// Mapped security context
    Mapped,
}

/// Algorithms selected by the security mode control procedure
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SelectedAlgorithms {
    /// Selected encryption algorithm (EEA identifier)
    pub encryption: u8,
    /// Selected integrity algorithm (EIA identifier)
    pub integrity: u8,
}

/// NAS security context
///
/// The default value is the zero-initialized context the security mode
/// control procedure starts from: no key set, EEA0/EIA0.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SecurityContext {
    pub context_type: SecurityContextType,
    /// Key set identifier
    pub eksi: u8,
    /// KASME
    pub kasme: [u8; AUTH_KASME_LEN],
    /// NAS encryption key
    pub knas_enc: [u8; NAS_KEY_LEN],
    /// NAS integrity key
    pub knas_int: [u8; NAS_KEY_LEN],
    /// Downlink NAS count
    pub dl_count: u32,
    /// Uplink NAS count
    pub ul_count: u32,
    pub selected_algorithms: SelectedAlgorithms,
}

// ============================================================================
// EMM Context
// ============================================================================

/// Per-UE EMM context
#[derive(Debug, Clone)]
pub struct EmmContext {
    /// Lower-layer UE identifier
    pub ue_id: u32,
    /// Whether the context was allocated by the attach procedure and must be
    /// released on failure
    pub is_dynamic: bool,

    /// Current GUTI
    pub guti: Option<EpsGuti>,
    /// GUTI previously used by the UE (kept during an implicit reallocation)
    pub old_guti: Option<EpsGuti>,
    /// The current GUTI was just assigned and must be advertised to the UE
    pub guti_is_new: bool,

    /// IMSI, when known
    pub imsi: Option<Imsi>,
    /// IMEI, when known
    pub imei: Option<Imei>,

    /// NAS security context
    pub security: Option<SecurityContext>,
    /// Authentication vector
    pub vector: Option<AuthVector>,

    /// Emergency bearer services indicator
    pub is_emergency: bool,
    /// NAS key set identifier from the last attach request
    pub ksi: u8,
    /// Supported EPS encryption algorithms (bitmap)
    pub eea: u8,
    /// Supported EPS integrity algorithms (bitmap)
    pub eia: u8,
    /// UCS2 support
    pub ucs2: bool,
    /// Supported UMTS encryption algorithms (bitmap)
    pub uea: u8,
    /// Supported UMTS integrity algorithms (bitmap)
    pub uia: u8,
    /// Supported GPRS encryption algorithms (bitmap)
    pub gea: u8,
    /// UMTS capabilities present
    pub umts_present: bool,
    /// GPRS capabilities present
    pub gprs_present: bool,

    /// Tracking area code assigned to the UE
    pub tac: u16,
    /// Number of consecutive tracking areas assigned to the UE
    pub n_tacs: u16,

    /// Set only after a successful ATTACH COMPLETE
    pub is_attached: bool,
    /// Last EMM cause
    pub emm_cause: EmmCause,
    /// ESM PDU last received or produced
    pub esm_msg: Vec<u8>,

    /// EMM state machine status
    pub fsm_status: EmmFsmStatus,

    /// T3450 handle (ATTACH ACCEPT retransmission)
    pub t3450: NasTimerId,
    /// T3460 handle (authentication request retransmission)
    pub t3460: NasTimerId,
    /// T3470 handle (identity request retransmission)
    pub t3470: NasTimerId,
}

impl Default for EmmContext {
    fn default() -> Self {
        EmmContext {
            ue_id: INVALID_UE_ID,
            is_dynamic: false,
            guti: None,
            old_guti: None,
            guti_is_new: false,
            imsi: None,
            imei: None,
            security: None,
            vector: None,
            is_emergency: false,
            ksi: 0,
            eea: 0,
            eia: 0,
            ucs2: false,
            uea: 0,
            uia: 0,
            gea: 0,
            umts_present: false,
            gprs_present: false,
            tac: 0,
            n_tacs: 0,
            is_attached: false,
            emm_cause: EmmCause::Success,
            esm_msg: Vec::new(),
            fsm_status: EmmFsmStatus::Invalid,
            t3450: NAS_TIMER_INACTIVE_ID,
            t3460: NAS_TIMER_INACTIVE_ID,
            t3470: NAS_TIMER_INACTIVE_ID,
        }
    }
}

impl EmmContext {
    /// A temporary, non-stored context used to reject a UE that has no
    /// regular context (sanity failures, protocol errors).
    pub fn temporary(ue_id: u32) -> Self {
        EmmContext {
            ue_id,
            is_dynamic: false,
            ..Default::default()
        }
    }
}

// ============================================================================
// M-TMSI Allocator
// ============================================================================

/// Process-unique non-zero M-TMSI values: a random 32-bit seed advanced by
/// one per allocation, skipping zero.
pub struct MTmsiAllocator {
    next: AtomicU32,
}

impl MTmsiAllocator {
    pub fn new() -> Self {
        MTmsiAllocator {
            next: AtomicU32::new(rand::random()),
        }
    }

    /// Seeded constructor for reproducible tests.
    pub fn with_seed(seed: u32) -> Self {
        MTmsiAllocator {
            next: AtomicU32::new(seed),
        }
    }

    pub fn allocate(&self) -> u32 {
        loop {
            let v = self.next.fetch_add(1, Ordering::SeqCst);
            if v != 0 {
                return v;
            }
        }
    }
}

impl Default for MTmsiAllocator {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Context Store
// ============================================================================

/// Observer invoked before a context is moved to a new lower-layer UE id, so
/// external correlation tables can follow.
pub type UeIdChangeObserver = Box<dyn Fn(u32, u32) + Send + Sync>;

/// Store owning every EMM context, indexed by UE id and by GUTI.
///
/// Lock order is always contexts before guti index.
pub struct EmmData {
    contexts: RwLock<HashMap<u32, EmmContext>>,
    guti_index: RwLock<HashMap<EpsGuti, u32>>,
    ue_id_observer: RwLock<Option<UeIdChangeObserver>>,
}

impl EmmData {
    pub fn new() -> Self {
        EmmData {
            contexts: RwLock::new(HashMap::new()),
            guti_index: RwLock::new(HashMap::new()),
            ue_id_observer: RwLock::new(None),
        }
    }

    /// Register the UE-id change observer.
    pub fn set_ue_id_change_observer(&self, observer: UeIdChangeObserver) {
        *self.ue_id_observer.write().unwrap() = Some(observer);
    }

    /// Insert a context. A context with the same UE id must not exist; the
    /// duplicate insert is dropped.
    pub fn add(&self, ctx: EmmContext) {
        let mut contexts = self.contexts.write().unwrap();
        if contexts.contains_key(&ctx.ue_id) {
            log::error!(
                "EMM-CTX - context already exists (ueid={}), insert dropped",
                ctx.ue_id
            );
            return;
        }
        if let Some(guti) = ctx.guti {
            self.guti_index.write().unwrap().insert(guti, ctx.ue_id);
        }
        contexts.insert(ctx.ue_id, ctx);
    }

    /// Remove a context and both of its index entries.
    pub fn remove(&self, ue_id: u32) -> bool {
        let mut contexts = self.contexts.write().unwrap();
        let mut guti_index = self.guti_index.write().unwrap();
        match contexts.remove(&ue_id) {
            Some(ctx) => {
                if let Some(guti) = ctx.guti {
                    guti_index.remove(&guti);
                }
                true
            }
            None => false,
        }
    }

    /// Clone-out lookup by UE id.
    pub fn find_by_ue_id(&self, ue_id: u32) -> Option<EmmContext> {
        self.contexts.read().unwrap().get(&ue_id).cloned()
    }

    /// UE id owning the given GUTI.
    pub fn find_ue_id_by_guti(&self, guti: &EpsGuti) -> Option<u32> {
        self.guti_index.read().unwrap().get(guti).copied()
    }

    /// Mutate a context in place. Returns `None` when no context exists.
    pub fn with_context_mut<R>(
        &self,
        ue_id: u32,
        f: impl FnOnce(&mut EmmContext) -> R,
    ) -> Option<R> {
        self.contexts.write().unwrap().get_mut(&ue_id).map(f)
    }

    /// Move a context to a new lower-layer UE id, keeping every other field.
    /// The registered observer runs before the remove/insert pair.
    pub fn rebind_ue_id(&self, old_ue_id: u32, new_ue_id: u32) -> bool {
        if let Some(observer) = self.ue_id_observer.read().unwrap().as_ref() {
            observer(old_ue_id, new_ue_id);
        }

        let mut contexts = self.contexts.write().unwrap();
        let mut guti_index = self.guti_index.write().unwrap();
        match contexts.remove(&old_ue_id) {
            Some(mut ctx) => {
                ctx.ue_id = new_ue_id;
                if let Some(guti) = ctx.guti {
                    guti_index.insert(guti, new_ue_id);
                }
                contexts.insert(new_ue_id, ctx);
                true
            }
            None => false,
        }
    }

    /// Replace a context's GUTI index entry: remove-then-insert under the
    /// index lock. `old` is the entry to drop, `new` the one to add.
    pub fn reindex_guti(&self, ue_id: u32, old: Option<&EpsGuti>, new: &EpsGuti) {
        let mut guti_index = self.guti_index.write().unwrap();
        if let Some(old) = old {
            guti_index.remove(old);
        }
        guti_index.insert(*new, ue_id);
    }

    pub fn contains(&self, ue_id: u32) -> bool {
        self.contexts.read().unwrap().contains_key(&ue_id)
    }

    pub fn len(&self) -> usize {
        self.contexts.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.read().unwrap().is_empty()
    }

    /// Number of GUTI index entries (should equal the number of contexts
    /// carrying a GUTI).
    pub fn guti_index_len(&self) -> usize {
        self.guti_index.read().unwrap().len()
    }
}

impl Default for EmmData {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Tests
// ============================================================================
