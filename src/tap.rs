//! The IEEE 1149.1 JTAG TAP state machine (C2).
//!
//! Pure state transition function driven by TMS; no I/O, no mutable
//! context. `next_state` is the single source of truth the scan
//! orchestrator (C6) and the reference simulator used in tests both
//! call.

/// One of the 16 states of the JTAG TAP controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TapState {
    TestLogicReset,
    RunTestIdle,
    SelectDrScan,
    CaptureDr,
    ShiftDr,
    Exit1Dr,
    PauseDr,
    Exit2Dr,
    UpdateDr,
    SelectIrScan,
    CaptureIr,
    ShiftIr,
    Exit1Ir,
    PauseIr,
    Exit2Ir,
    UpdateIr,
}

impl TapState {
    /// `true` iff this state is Shift-DR or Shift-IR — the predicate
    /// that gates whether bits are clocked with a TDO readback.
    pub fn is_shifting(self) -> bool {
        matches!(self, TapState::ShiftDr | TapState::ShiftIr)
    }
}

impl Default for TapState {
    fn default() -> Self {
        TapState::TestLogicReset
    }
}

/// Advance the TAP one clock given the current state and the TMS value
/// sampled on that clock.
pub fn next_state(state: TapState, tms: bool) -> TapState {
    use TapState::*;
    match (state, tms) {
        (TestLogicReset, false) => RunTestIdle,
        (TestLogicReset, true) => TestLogicReset,

        (RunTestIdle, false) => RunTestIdle,
        (RunTestIdle, true) => SelectDrScan,

        (SelectDrScan, false) => CaptureDr,
        (SelectDrScan, true) => SelectIrScan,

        (CaptureDr, false) => ShiftDr,
        (CaptureDr, true) => Exit1Dr,

        (ShiftDr, false) => ShiftDr,
        (ShiftDr, true) => Exit1Dr,

        (Exit1Dr, false) => PauseDr,
        (Exit1Dr, true) => UpdateDr,

        (PauseDr, false) => PauseDr,
        (PauseDr, true) => Exit2Dr,

        (Exit2Dr, false) => ShiftDr,
        (Exit2Dr, true) => UpdateDr,

        (UpdateDr, false) => RunTestIdle,
        (UpdateDr, true) => SelectDrScan,

        (SelectIrScan, false) => CaptureIr,
        (SelectIrScan, true) => TestLogicReset,

        (CaptureIr, false) => ShiftIr,
        (CaptureIr, true) => Exit1Ir,

        (ShiftIr, false) => ShiftIr,
        (ShiftIr, true) => Exit1Ir,

        (Exit1Ir, false) => PauseIr,
        (Exit1Ir, true) => UpdateIr,

        (PauseIr, false) => PauseIr,
        (PauseIr, true) => Exit2Ir,

        (Exit2Ir, false) => ShiftIr,
        (Exit2Ir, true) => UpdateIr,

        (UpdateIr, false) => RunTestIdle,
        (UpdateIr, true) => SelectDrScan,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use TapState::*;

    #[test]
    fn tlr_is_self_loop_on_tms_high() {
        assert_eq!(next_state(TestLogicReset, true), TestLogicReset);
    }

    #[test]
    fn five_tms_high_from_anywhere_reaches_tlr() {
        let mut s = ShiftDr;
        for _ in 0..5 {
            s = next_state(s, true);
        }
        assert_eq!(s, TestLogicReset);
    }

    #[test]
    fn update_dr_and_ir_return_to_rti_on_tms_low() {
        assert_eq!(next_state(UpdateDr, false), RunTestIdle);
        assert_eq!(next_state(UpdateIr, false), RunTestIdle);
    }

    #[test]
    fn shifting_predicate() {
        assert!(ShiftDr.is_shifting());
        assert!(ShiftIr.is_shifting());
        assert!(!CaptureDr.is_shifting());
        assert!(!RunTestIdle.is_shifting());
    }

    #[test]
    fn full_dr_path() {
        let path = [
            (RunTestIdle, true, SelectDrScan),
            (SelectDrScan, false, CaptureDr),
            (CaptureDr, false, ShiftDr),
            (ShiftDr, false, ShiftDr),
            (ShiftDr, true, Exit1Dr),
            (Exit1Dr, true, UpdateDr),
            (UpdateDr, false, RunTestIdle),
        ];
        for (from, tms, to) in path {
            assert_eq!(next_state(from, tms), to);
        }
    }
}
