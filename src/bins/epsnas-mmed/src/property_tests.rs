//! Property-Based Tests for the Attach Procedure
//!
//! Laws checked over randomized inputs: duplicate requests are idempotent,
//! any changed parameter restarts the procedure exactly once, T3450 retries
//! are bounded, and the context store keeps its GUTI index consistent under
//! arbitrary operation sequences.

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    use crate::attach::{
        AttachData, AttachProcedure, AttachRequest, EmmAttachType, ATTACH_COUNTER_MAX,
    };
    use crate::common::{
        CommonProcError, CommonProcOutcome, EmmCommonProcedures, IdentityRequestType,
        SecurityCapabilities,
    };
    use crate::config::MmeConfig;
    use crate::context::{
        AuthVector, EmmContext, EmmData, EpsGuti, Imei, Imsi, MTmsiAllocator, PlmnId,
    };
    use crate::esm_sap::{EsmSap, EsmSapRequest, EsmSapResponse, EsmSapStatus};
    use crate::fsm::{EmmTimerEvent, EmmTimerKind};
    use crate::mme_api::{GutiAllocation, MmeApi, MmeApiError};
    use crate::sap::{EmmSap, EmmSapPrimitive, SapError};

    // ========================================================================
    // Always-successful peers
    // ========================================================================

    struct PropEmmSap {
        sent: Rc<RefCell<Vec<EmmSapPrimitive>>>,
    }

    impl EmmSap for PropEmmSap {
        fn send(&mut self, primitive: EmmSapPrimitive) -> Result<(), SapError> {
            self.sent.borrow_mut().push(primitive);
            Ok(())
        }
    }

    struct PropEsmSap;

    impl EsmSap for PropEsmSap {
        fn send(&mut self, _request: EsmSapRequest) -> EsmSapResponse {
            EsmSapResponse {
                err: EsmSapStatus::Success,
                send: vec![0xaa, 0xbb],
            }
        }
    }

    struct PropMmeApi {
        allocated: u32,
    }

    impl MmeApi for PropMmeApi {
        fn identify_imsi(&mut self, _imsi: &Imsi) -> Result<AuthVector, MmeApiError> {
            Ok(AuthVector::default())
        }

        fn identify_guti(&mut self, _guti: &EpsGuti) -> Result<AuthVector, MmeApiError> {
            Ok(AuthVector::default())
        }

        fn identify_imei(&mut self, _imei: &Imei) -> Result<AuthVector, MmeApiError> {
            Ok(AuthVector::default())
        }

        fn new_guti(&mut self, _imsi: &Imsi) -> Result<GutiAllocation, MmeApiError> {
            self.allocated += 1;
            Ok(GutiAllocation {
                guti: EpsGuti {
                    plmn_id: PlmnId::default(),
                    mme_gid: 1,
                    mme_code: 1,
                    m_tmsi: 0xb000_0000 + self.allocated,
                },
                tac: 7,
                n_tacs: 1,
            })
        }

        fn auth_info_req(
            &mut self,
            _ue_id: u32,
            _imsi: &Imsi,
            _num_vectors: usize,
            _last_visited_plmn: Option<&PlmnId>,
        ) -> Result<(), MmeApiError> {
            Ok(())
        }

        fn notify_ue_id_changed(&mut self, _old_ue_id: u32, _new_ue_id: u32) {}

        fn notify_new_guti(&mut self, _ue_id: u32, _guti: &EpsGuti) {}

        fn find_mnc_length(&self, _plmn_digits: [u8; 6]) -> Option<u8> {
            Some(2)
        }
    }

    struct PropCommonProcs;

    impl EmmCommonProcedures for PropCommonProcs {
        fn initiate_identification(
            &mut self,
            _ue_id: u32,
            _ident_type: IdentityRequestType,
        ) -> Result<(), CommonProcError> {
            Ok(())
        }

        fn initiate_authentication(
            &mut self,
            _ue_id: u32,
            _ksi: u8,
            _rand: &[u8; 16],
            _autn: &[u8; 16],
        ) -> Result<(), CommonProcError> {
            Ok(())
        }

        fn initiate_security_mode_control(
            &mut self,
            _ue_id: u32,
            _ksi: u8,
            _capabilities: &SecurityCapabilities,
        ) -> Result<(), CommonProcError> {
            Ok(())
        }
    }

    type PropProc = AttachProcedure<PropEmmSap, PropEsmSap, PropMmeApi, PropCommonProcs>;

    fn prop_proc() -> (PropProc, Rc<RefCell<Vec<EmmSapPrimitive>>>) {
        let sent = Rc::new(RefCell::new(Vec::new()));
        let proc = AttachProcedure::new(
            MmeConfig::default(),
            PropEmmSap {
                sent: Rc::clone(&sent),
            },
            PropEsmSap,
            PropMmeApi { allocated: 0 },
            PropCommonProcs,
        );
        (proc, sent)
    }

    // ========================================================================
    // Strategies
    // ========================================================================

    /// Capability and key-set fields of an attach request
    #[derive(Debug, Clone, Copy)]
    struct ReqParams {
        ksi: u8,
        eea: u8,
        eia: u8,
        ucs2: bool,
        uea: u8,
        uia: u8,
        gea: u8,
        umts_present: bool,
        gprs_present: bool,
    }

    fn arb_req_params() -> impl Strategy<Value = ReqParams> {
        (
            0..7u8,
            any::<u8>(),
            any::<u8>(),
            any::<bool>(),
            any::<u8>(),
            any::<u8>(),
            any::<u8>(),
            any::<bool>(),
            any::<bool>(),
        )
            .prop_map(
                |(ksi, eea, eia, ucs2, uea, uia, gea, umts_present, gprs_present)| ReqParams {
                    ksi,
                    eea,
                    eia,
                    ucs2,
                    uea,
                    uia,
                    gea,
                    umts_present,
                    gprs_present,
                },
            )
    }

    fn request_from(ue_id: u32, p: ReqParams) -> AttachRequest {
        AttachRequest {
            ue_id,
            attach_type: EmmAttachType::Eps,
            is_native_ksi: true,
            ksi: p.ksi,
            is_native_guti: true,
            guti: None,
            imsi: Imsi::from_bcd("001010000000001"),
            imei: None,
            tai: None,
            eea: p.eea,
            eia: p.eia,
            ucs2: p.ucs2,
            uea: p.uea,
            uia: p.uia,
            gea: p.gea,
            umts_present: p.umts_present,
            gprs_present: p.gprs_present,
            esm_msg: vec![0x52],
        }
    }

    fn drive_to_accept(proc: &mut PropProc, ue_id: u32, p: ReqParams) {
        proc.attach_request(request_from(ue_id, p)).unwrap();
        proc.auth_info_answer(ue_id, AuthVector::default()).unwrap();
        proc.common_procedure_complete(ue_id, CommonProcOutcome::Success)
            .unwrap();
        proc.common_procedure_complete(ue_id, CommonProcOutcome::Success)
            .unwrap();
    }

    fn count_cnf(sent: &Rc<RefCell<Vec<EmmSapPrimitive>>>) -> usize {
        sent.borrow()
            .iter()
            .filter(|p| matches!(p, EmmSapPrimitive::EstablishCnf(_)))
            .count()
    }

    fn count_abort(sent: &Rc<RefCell<Vec<EmmSapPrimitive>>>) -> usize {
        sent.borrow()
            .iter()
            .filter(|p| matches!(p, EmmSapPrimitive::ProcAbort { .. }))
            .count()
    }

    // ========================================================================
    // Properties
    // ========================================================================

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(40))]

        /// An identical re-sent ATTACH REQUEST never produces a second
        /// ATTACH ACCEPT or an abort.
        #[test]
        fn prop_duplicate_request_idempotent(p in arb_req_params()) {
            let (mut proc, sent) = prop_proc();
            drive_to_accept(&mut proc, 7, p);
            prop_assert_eq!(count_cnf(&sent), 1);
            let t3450 = proc.context(7).unwrap().t3450;

            proc.attach_request(request_from(7, p)).unwrap();

            prop_assert_eq!(count_cnf(&sent), 1);
            prop_assert_eq!(count_abort(&sent), 0);
            prop_assert_eq!(proc.context(7).unwrap().t3450, t3450);
        }

        /// Changing any detector field restarts the attach with exactly one
        /// abort and a fresh ATTACH ACCEPT.
        #[test]
        fn prop_changed_parameter_restarts(p in arb_req_params(), field in 0..5usize) {
            let (mut proc, sent) = prop_proc();
            drive_to_accept(&mut proc, 7, p);

            let mut changed = p;
            match field {
                0 => changed.eea = p.eea.wrapping_add(1),
                1 => changed.eia = p.eia.wrapping_add(1),
                2 => changed.ksi = (p.ksi + 1) % 7,
                3 => changed.umts_present = !p.umts_present,
                _ => changed.gprs_present = !p.gprs_present,
            }
            proc.attach_request(request_from(7, changed)).unwrap();

            prop_assert_eq!(count_abort(&sent), 1);
            prop_assert_eq!(count_cnf(&sent), 2);
        }

        /// A UE that never answers the ATTACH ACCEPT gets exactly
        /// ATTACH_COUNTER_MAX - 1 retransmissions, then a silent abort.
        #[test]
        fn prop_t3450_retry_bound(p in arb_req_params(), expiries in 1..12u32) {
            let (mut proc, sent) = prop_proc();
            drive_to_accept(&mut proc, 7, p);

            let event = EmmTimerEvent { timer: EmmTimerKind::T3450, ue_id: 7 };
            for _ in 0..expiries {
                proc.handle_timeout(event).unwrap();
            }

            let retransmissions = expiries.min(ATTACH_COUNTER_MAX - 1) as usize;
            prop_assert_eq!(count_cnf(&sent), 1 + retransmissions);
            prop_assert_eq!(
                proc.context(7).is_some(),
                expiries < ATTACH_COUNTER_MAX,
                "context released exactly on the fifth expiry"
            );
        }

        /// M-TMSI allocation yields distinct non-zero values from any seed.
        #[test]
        fn prop_mtmsi_unique_nonzero(seed in any::<u32>(), count in 1..64u32) {
            let alloc = MTmsiAllocator::with_seed(seed);
            let mut seen = std::collections::HashSet::new();
            for _ in 0..count {
                let v = alloc.allocate();
                prop_assert_ne!(v, 0);
                prop_assert!(seen.insert(v), "m_tmsi reused");
            }
        }
    }

    // ========================================================================
    // Context store consistency
    // ========================================================================

    /// Store operation for the index-consistency property
    #[derive(Debug, Clone, Copy)]
    enum StoreOp {
        Add { ue_id: u32, with_guti: bool },
        Remove { ue_id: u32 },
        Rebind { old_ue_id: u32, new_ue_id: u32 },
    }

    fn arb_store_op() -> impl Strategy<Value = StoreOp> {
        prop_oneof![
            (1..16u32, any::<bool>())
                .prop_map(|(ue_id, with_guti)| StoreOp::Add { ue_id, with_guti }),
            (1..16u32).prop_map(|ue_id| StoreOp::Remove { ue_id }),
            (1..16u32, 1..16u32)
                .prop_map(|(old_ue_id, new_ue_id)| StoreOp::Rebind { old_ue_id, new_ue_id }),
        ]
    }

    fn guti_for(ue_id: u32) -> EpsGuti {
        EpsGuti {
            plmn_id: PlmnId::default(),
            mme_gid: 1,
            mme_code: 1,
            m_tmsi: 0x1000 + ue_id,
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(60))]

        /// After any operation sequence, every stored context with a GUTI is
        /// found through the GUTI index and the index holds nothing else.
        #[test]
        fn prop_store_guti_index_consistent(ops in prop::collection::vec(arb_store_op(), 1..40)) {
            let data = EmmData::new();
            let mut live: Vec<u32> = Vec::new();

            for op in ops {
                match op {
                    StoreOp::Add { ue_id, with_guti } => {
                        let guti = guti_for(ue_id);
                        if data.contains(ue_id)
                            || (with_guti && data.find_ue_id_by_guti(&guti).is_some())
                        {
                            continue;
                        }
                        let mut ctx = EmmContext::default();
                        ctx.ue_id = ue_id;
                        if with_guti {
                            ctx.guti = Some(guti);
                        }
                        data.add(ctx);
                        live.push(ue_id);
                    }
                    StoreOp::Remove { ue_id } => {
                        data.remove(ue_id);
                        live.retain(|&u| u != ue_id);
                    }
                    StoreOp::Rebind { old_ue_id, new_ue_id } => {
                        if old_ue_id == new_ue_id
                            || !data.contains(old_ue_id)
                            || data.contains(new_ue_id)
                        {
                            continue;
                        }
                        data.rebind_ue_id(old_ue_id, new_ue_id);
                        live.retain(|&u| u != old_ue_id);
                        live.push(new_ue_id);
                    }
                }

                // Invariant: GUTI index entries and GUTI-carrying contexts
                // match one-to-one
                let mut indexed = 0;
                for &ue_id in &live {
                    let ctx = data.find_by_ue_id(ue_id);
                    prop_assert!(ctx.is_some());
                    if let Some(guti) = ctx.unwrap().guti {
                        prop_assert_eq!(data.find_ue_id_by_guti(&guti), Some(ue_id));
                        indexed += 1;
                    }
                }
                prop_assert_eq!(data.guti_index_len(), indexed);
                prop_assert_eq!(data.len(), live.len());
            }
        }
    }

    // ========================================================================
    // Registry sanity
    // ========================================================================

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(40))]

        /// The retransmission counter observed through the registry matches
        /// the number of increments.
        #[test]
        fn prop_registry_counts_retransmissions(increments in 0..10u32) {
            let mut registry = crate::common::CommonProcRegistry::new();
            registry.set_args(3, AttachData {
                ue_id: 3,
                retransmission_count: 0,
                esm_msg: vec![1],
            });
            for _ in 0..increments {
                registry.with_args_mut(3, |d| d.retransmission_count += 1);
            }
            prop_assert_eq!(
                registry.args(3).unwrap().retransmission_count,
                increments
            );
        }
    }
}
