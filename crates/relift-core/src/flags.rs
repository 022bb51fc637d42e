//! Processor condition flags.

use bitflags::bitflags;

bitflags! {
    /// Condition-flag bit vector. Instructions carry one mask for the flags
    /// they read and one for the flags they write; the condition-code
    /// eliminator matches a flag use against the nearest definition whose
    /// written mask covers it.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ConditionFlags: u8 {
        /// Carry.
        const CF = 0x01;
        /// Parity.
        const PF = 0x02;
        /// Auxiliary carry.
        const AF = 0x04;
        /// Zero.
        const ZF = 0x08;
        /// Sign.
        const SF = 0x10;
        /// Overflow.
        const OF = 0x20;
        /// Direction.
        const DF = 0x40;
    }
}
